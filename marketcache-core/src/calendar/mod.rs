//! Trading calendar: which sessions an exchange holds, and the bar slots
//! those sessions produce for each interval.

pub mod exchange;
pub mod slots;

pub use exchange::{ExchangeCalendar, ExchangeSpec};
pub use slots::{slot_index, slots_between, Slot};

use crate::error::{CacheError, Result};
use chrono::{DateTime, Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;

/// One regular trading session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Session {
    /// Local trading date.
    pub date: NaiveDate,
    pub open: DateTime<Utc>,
    pub close: DateTime<Utc>,
}

/// Source of session schedules.
pub trait TradingCalendar: Send + Sync {
    /// Sessions with local date in `[start, end)`, in order.
    fn schedule(&self, exchange: &str, start: NaiveDate, end: NaiveDate) -> Result<Vec<Session>>;

    fn timezone(&self, exchange: &str) -> Result<Tz>;

    /// Delay after a session ends before the provider's numbers for it are
    /// final.
    fn provider_lag(&self, _exchange: &str) -> Result<Duration> {
        Ok(Duration::zero())
    }
}

/// Local wall-clock time on `date` as UTC. Inside a DST gap the first valid
/// instant after the gap is used.
pub(crate) fn local_to_utc(tz: Tz, date: NaiveDate, time: NaiveTime) -> Result<DateTime<Utc>> {
    let local = date.and_time(time);
    tz.from_local_datetime(&local)
        .earliest()
        .or_else(|| tz.from_local_datetime(&(local + Duration::hours(1))).earliest())
        .map(|t| t.with_timezone(&Utc))
        .ok_or_else(|| {
            CacheError::InvalidArgument(format!("{local} does not exist in time zone {}", tz.name()))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_time_converts_with_dst() {
        let tz: Tz = "America/New_York".parse().unwrap();
        let open = NaiveTime::from_hms_opt(9, 30, 0).unwrap();
        let winter = local_to_utc(tz, NaiveDate::from_ymd_opt(2024, 1, 2).unwrap(), open).unwrap();
        let summer = local_to_utc(tz, NaiveDate::from_ymd_opt(2024, 7, 2).unwrap(), open).unwrap();
        assert_eq!(winter, Utc.with_ymd_and_hms(2024, 1, 2, 14, 30, 0).unwrap());
        assert_eq!(summer, Utc.with_ymd_and_hms(2024, 7, 2, 13, 30, 0).unwrap());
    }

    #[test]
    fn dst_gap_moves_forward() {
        let tz: Tz = "America/New_York".parse().unwrap();
        let gap = NaiveTime::from_hms_opt(2, 30, 0).unwrap();
        let t = local_to_utc(tz, NaiveDate::from_ymd_opt(2024, 3, 10).unwrap(), gap).unwrap();
        assert_eq!(t, Utc.with_ymd_and_hms(2024, 3, 10, 7, 30, 0).unwrap());
    }
}
