use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use tracing::{info, warn};

use crate::domain::bar::MinuteBar;

/// Outcome of inspecting an incoming bar timestamp against the last tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GapAssessment {
    /// Progression is within tolerance of the 60 s cadence.
    None,
    /// A gap small enough to back-fill.
    Replayable {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
    /// Too large to back-fill; continue live from the incoming bar.
    TooLarge,
}

/// What the coordinator should do with a batch it just received.
#[derive(Debug, Clone, PartialEq)]
pub enum GateAction {
    /// Batches to process in order, oldest first.
    Process(Vec<Vec<MinuteBar>>),
    /// A gap was detected: the batch is queued, back-fill `(start, end]`.
    RequestBackfill {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
    /// Replay is in progress; the live batch was queued behind it.
    Queued,
}

/// Step 1 of the tick algorithm: gap detection and replay sequencing.
///
/// While a back-fill is outstanding, live batches queue here so that every
/// mutation of bar T is observable before any mutation of bar T+1, even
/// across a replay window.
#[derive(Debug)]
pub struct ReplayGate {
    last_tick: Option<DateTime<Utc>>,
    tolerance_secs: i64,
    max_gap_secs: i64,
    replaying: bool,
    queued: VecDeque<Vec<MinuteBar>>,
}

impl ReplayGate {
    pub fn new(tolerance_secs: i64, max_gap_secs: i64) -> Self {
        Self {
            last_tick: None,
            tolerance_secs,
            max_gap_secs,
            replaying: false,
            queued: VecDeque::new(),
        }
    }

    pub fn last_tick(&self) -> Option<DateTime<Utc>> {
        self.last_tick
    }

    pub fn is_replaying(&self) -> bool {
        self.replaying
    }

    /// Pure gap check against the expected one-minute cadence.
    pub fn assess(&self, incoming: DateTime<Utc>) -> GapAssessment {
        let Some(last) = self.last_tick else {
            return GapAssessment::None;
        };
        let delta_secs = (incoming - last).num_seconds();
        if (delta_secs - 60).abs() <= self.tolerance_secs {
            return GapAssessment::None;
        }
        if delta_secs > self.max_gap_secs {
            return GapAssessment::TooLarge;
        }
        GapAssessment::Replayable {
            start: last,
            end: incoming,
        }
    }

    /// Routes one live batch through the gate.
    pub fn on_batch(&mut self, batch: Vec<MinuteBar>) -> GateAction {
        let Some(batch_ts) = batch_timestamp(&batch) else {
            return GateAction::Process(Vec::new());
        };
        if self.replaying {
            self.queued.push_back(batch);
            return GateAction::Queued;
        }

        match self.assess(batch_ts) {
            GapAssessment::None => {
                self.last_tick = Some(batch_ts);
                GateAction::Process(vec![batch])
            }
            GapAssessment::TooLarge => {
                warn!(incoming = %batch_ts, "gap exceeds replay window, skipping to live data");
                self.last_tick = Some(batch_ts);
                GateAction::Process(vec![batch])
            }
            GapAssessment::Replayable { start, end } => {
                info!(%start, %end, "market data gap detected, entering replay");
                self.replaying = true;
                self.queued.push_back(batch);
                GateAction::RequestBackfill { start, end }
            }
        }
    }

    /// Completes a replay: back-filled bars first, then the queued live
    /// batches, all in timestamp order.
    pub fn finish_replay(&mut self, backfill: Vec<MinuteBar>) -> Vec<Vec<MinuteBar>> {
        let mut batches: Vec<Vec<MinuteBar>> = group_by_minute(backfill);
        batches.extend(self.queued.drain(..));
        self.replaying = false;

        if let Some(ts) = batches.iter().filter_map(|b| batch_timestamp(b)).max() {
            self.last_tick = Some(ts);
        }
        batches
    }

    /// Abandons an unanswered back-fill and drains the queue live.
    pub fn abort_replay(&mut self) -> Vec<Vec<MinuteBar>> {
        warn!("replay aborted, draining queued batches live");
        self.finish_replay(Vec::new())
    }
}

fn batch_timestamp(batch: &[MinuteBar]) -> Option<DateTime<Utc>> {
    batch.iter().map(|b| b.timestamp_utc).max()
}

/// Groups a flat bar list into per-minute batches, oldest first.
fn group_by_minute(mut bars: Vec<MinuteBar>) -> Vec<Vec<MinuteBar>> {
    bars.sort_by_key(|b| b.timestamp_utc);
    let mut batches: Vec<Vec<MinuteBar>> = Vec::new();
    for bar in bars {
        match batches.last_mut() {
            Some(last) if last[0].timestamp_utc == bar.timestamp_utc => last.push(bar),
            _ => batches.push(vec![bar]),
        }
    }
    batches
}

#[cfg(test)]
mod test {
    use chrono::{Duration, TimeZone};

    use super::*;
    use crate::domain::{Price, Quantity, Symbol};

    fn bar(ts: DateTime<Utc>) -> MinuteBar {
        MinuteBar {
            symbol: Symbol::from("AAPL"),
            timestamp_utc: ts,
            open: Price(100.0),
            high: Price(100.0),
            low: Price(100.0),
            close: Price(100.0),
            volume: Quantity(1_000.0),
            vwap: Price(100.0),
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 14, 30, 0).unwrap()
    }

    fn gate() -> ReplayGate {
        let mut gate = ReplayGate::new(30, 7_200);
        assert!(matches!(
            gate.on_batch(vec![bar(t0())]),
            GateAction::Process(_)
        ));
        gate
    }

    #[test]
    fn sixty_second_cadence_is_no_gap() {
        let gate = gate();
        assert_eq!(gate.assess(t0() + Duration::seconds(60)), GapAssessment::None);
        // 60 ± 30 s tolerance boundary.
        assert_eq!(gate.assess(t0() + Duration::seconds(90)), GapAssessment::None);
        assert_eq!(gate.assess(t0() + Duration::seconds(30)), GapAssessment::None);
    }

    #[test]
    fn ninety_one_seconds_is_a_replayable_gap() {
        let gate = gate();
        let incoming = t0() + Duration::seconds(91);
        assert_eq!(
            gate.assess(incoming),
            GapAssessment::Replayable {
                start: t0(),
                end: incoming
            }
        );
    }

    #[test]
    fn beyond_two_hours_is_skipped() {
        let gate = gate();
        assert_eq!(
            gate.assess(t0() + Duration::seconds(7_201)),
            GapAssessment::TooLarge
        );
    }

    #[test]
    fn first_batch_never_gaps() {
        let gate = ReplayGate::new(30, 7_200);
        assert_eq!(gate.assess(t0()), GapAssessment::None);
    }

    #[test]
    fn replay_queues_live_batches_and_drains_in_order() {
        let mut gate = gate();

        // Gap of 3 minutes triggers back-fill.
        let gapped = t0() + Duration::minutes(3);
        let action = gate.on_batch(vec![bar(gapped)]);
        assert!(matches!(action, GateAction::RequestBackfill { .. }));
        assert!(gate.is_replaying());

        // Live data arriving during replay is queued.
        let live = t0() + Duration::minutes(4);
        assert_eq!(gate.on_batch(vec![bar(live)]), GateAction::Queued);

        // Back-fill covers the missing minutes; replay drains oldest-first.
        let backfill = vec![
            bar(t0() + Duration::minutes(2)),
            bar(t0() + Duration::minutes(1)),
        ];
        let batches = gate.finish_replay(backfill);
        let timestamps: Vec<_> = batches
            .iter()
            .map(|b| b[0].timestamp_utc)
            .collect();
        assert_eq!(
            timestamps,
            vec![
                t0() + Duration::minutes(1),
                t0() + Duration::minutes(2),
                gapped,
                live,
            ]
        );
        assert!(!gate.is_replaying());
        assert_eq!(gate.last_tick(), Some(live));

        // Cadence resumes from the drained head.
        assert_eq!(
            gate.assess(live + Duration::seconds(60)),
            GapAssessment::None
        );
    }

    #[test]
    fn oversized_gap_continues_live() {
        let mut gate = gate();
        let far = t0() + Duration::hours(3);
        let action = gate.on_batch(vec![bar(far)]);
        assert!(matches!(action, GateAction::Process(_)));
        assert!(!gate.is_replaying());
        assert_eq!(gate.last_tick(), Some(far));
    }
}
