use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{Price, Quantity, Symbol, Volume},
    generated::simdesk::v1 as pb,
};

/// One OHLCV candle aligned to a wall-clock minute, UTC.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MinuteBar {
    pub symbol: Symbol,
    pub timestamp_utc: DateTime<Utc>,
    pub open: Price,
    pub high: Price,
    pub low: Price,
    pub close: Price,
    pub volume: Volume,
    pub vwap: Price,
}

impl MinuteBar {
    /// Bars are only valid on the `:00` second boundary.
    pub fn is_minute_aligned(&self) -> bool {
        self.timestamp_utc.second() == 0 && self.timestamp_utc.nanosecond() == 0
    }

    pub fn last_price(&self) -> Price {
        self.close
    }
}

impl From<&MinuteBar> for pb::MarketDataBar {
    fn from(bar: &MinuteBar) -> Self {
        pb::MarketDataBar {
            symbol: bar.symbol.to_string(),
            timestamp_utc_ms: bar.timestamp_utc.timestamp_millis(),
            open: bar.open.0,
            high: bar.high.0,
            low: bar.low.0,
            close: bar.close.0,
            volume: bar.volume.0,
            vwap: bar.vwap.0,
        }
    }
}

impl TryFrom<pb::MarketDataBar> for MinuteBar {
    type Error = crate::error::SimdeskError;

    fn try_from(raw: pb::MarketDataBar) -> Result<Self, Self::Error> {
        let timestamp_utc = DateTime::<Utc>::from_timestamp_millis(raw.timestamp_utc_ms)
            .ok_or_else(|| {
                crate::error::EngineError::Execution(format!(
                    "bar timestamp out of range: {}",
                    raw.timestamp_utc_ms
                ))
            })?;
        Ok(Self {
            symbol: Symbol(raw.symbol),
            timestamp_utc,
            open: Price(raw.open),
            high: Price(raw.high),
            low: Price(raw.low),
            close: Price(raw.close),
            volume: Quantity(raw.volume),
            vwap: Price(raw.vwap),
        })
    }
}

#[cfg(test)]
mod test {
    use chrono::TimeZone;

    use super::*;

    fn bar_at(ts: DateTime<Utc>) -> MinuteBar {
        MinuteBar {
            symbol: Symbol::from("AAPL"),
            timestamp_utc: ts,
            open: Price(99.5),
            high: Price(101.0),
            low: Price(99.0),
            close: Price(100.0),
            volume: Quantity(5_000.0),
            vwap: Price(99.9),
        }
    }

    #[test]
    fn alignment_check() {
        let aligned = Utc.with_ymd_and_hms(2026, 3, 2, 14, 30, 0).unwrap();
        assert!(bar_at(aligned).is_minute_aligned());

        let skewed = Utc.with_ymd_and_hms(2026, 3, 2, 14, 30, 17).unwrap();
        assert!(!bar_at(skewed).is_minute_aligned());
    }

    #[test]
    fn proto_roundtrip() {
        let ts = Utc.with_ymd_and_hms(2026, 3, 2, 14, 30, 0).unwrap();
        let bar = bar_at(ts);
        let raw = pb::MarketDataBar::from(&bar);
        let back = MinuteBar::try_from(raw).unwrap();
        assert_eq!(bar, back);
    }
}
