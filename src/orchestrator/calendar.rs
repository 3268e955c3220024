use chrono::{DateTime, Utc};
use chrono_tz::Tz;

use crate::{
    error::{OrchestratorError, SimdeskResult},
    storage::ExchangeRecord,
};

/// Whether the exchange's simulators should be up at `now`.
///
/// The window is `[pre_open, post_close]` in the exchange's own timezone.
/// Windows that wrap midnight (post_close before pre_open) are supported for
/// overnight venues.
pub fn should_be_running(record: &ExchangeRecord, now: DateTime<Utc>) -> SimdeskResult<bool> {
    let tz: Tz = record.timezone.parse().map_err(|_| {
        OrchestratorError::InvalidSchedule(format!(
            "unknown timezone '{}' for exchange {}",
            record.timezone, record.exch_id
        ))
    })?;
    let local_time = now.with_timezone(&tz).time();

    Ok(if record.pre_open <= record.post_close {
        record.pre_open <= local_time && local_time <= record.post_close
    } else {
        local_time >= record.pre_open || local_time <= record.post_close
    })
}

#[cfg(test)]
mod test {
    use chrono::{NaiveTime, TimeZone};

    use super::*;

    fn nyse() -> ExchangeRecord {
        ExchangeRecord {
            exch_id: "us_equity".to_string(),
            timezone: "America/New_York".to_string(),
            pre_open: NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
            open: NaiveTime::from_hms_opt(9, 30, 0).unwrap(),
            close: NaiveTime::from_hms_opt(16, 0, 0).unwrap(),
            post_close: NaiveTime::from_hms_opt(16, 30, 0).unwrap(),
        }
    }

    fn utc_for_ny(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        // 2026-03-02 is EST (UTC-5).
        Utc.with_ymd_and_hms(2026, 3, 2, h + 5, m, s).unwrap()
    }

    #[test]
    fn window_boundaries_in_exchange_tz() {
        let record = nyse();
        assert!(!should_be_running(&record, utc_for_ny(8, 59, 50)).unwrap());
        assert!(should_be_running(&record, utc_for_ny(9, 0, 0)).unwrap());
        assert!(should_be_running(&record, utc_for_ny(12, 0, 0)).unwrap());
        assert!(should_be_running(&record, utc_for_ny(16, 30, 0)).unwrap());
        assert!(!should_be_running(&record, utc_for_ny(16, 30, 5)).unwrap());
    }

    #[test]
    fn overnight_window_wraps() {
        let mut record = nyse();
        record.pre_open = NaiveTime::from_hms_opt(22, 0, 0).unwrap();
        record.post_close = NaiveTime::from_hms_opt(2, 0, 0).unwrap();
        // 23:00 EST == 04:00 UTC the next day.
        let late_evening = Utc.with_ymd_and_hms(2026, 3, 3, 4, 0, 0).unwrap();
        assert!(should_be_running(&record, late_evening).unwrap());
        assert!(should_be_running(&record, utc_for_ny(1, 0, 0)).unwrap());
        assert!(!should_be_running(&record, utc_for_ny(12, 0, 0)).unwrap());
    }

    #[test]
    fn unknown_timezone_is_an_error() {
        let mut record = nyse();
        record.timezone = "Mars/Olympus".to_string();
        assert!(should_be_running(&record, Utc::now()).is_err());
    }
}
