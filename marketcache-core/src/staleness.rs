//! Staleness policy: when a cached value must be refreshed.
//!
//! All functions take `now` explicitly; nothing here reads a clock.

use crate::calendar::{Session, Slot, TradingCalendar};
use crate::domain::Interval;
use crate::error::Result;
use chrono::{DateTime, Duration, Utc};

/// Older than `max_age`.
pub fn is_stale(last_fetch: DateTime<Utc>, max_age: Duration, now: DateTime<Utc>) -> bool {
    now - last_fetch > max_age
}

/// Max-age for a series request: the caller's value or the interval default,
/// capped by how long ago the requested range started.
pub fn effective_max_age(
    requested: Option<Duration>,
    interval: Interval,
    range_start: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Duration {
    let base = requested.unwrap_or_else(|| interval.default_max_age());
    match range_start {
        Some(start) if start < now => base.min(now - start),
        Some(_) => Duration::zero(),
        None => base,
    }
}

/// Stale if older than `max_age`, or if a session opened or closed between
/// `last_fetch` and `now`.
pub fn is_stale_in_session(
    last_fetch: DateTime<Utc>,
    max_age: Duration,
    now: DateTime<Utc>,
    sessions: &[Session],
) -> bool {
    if is_stale(last_fetch, max_age, now) {
        return true;
    }
    let crossed = |t: DateTime<Utc>| t > last_fetch && t <= now;
    sessions.iter().any(|s| crossed(s.open) || crossed(s.close))
}

/// [`is_stale`] with optional session-boundary awareness.
pub fn is_stale_with_calendar(
    last_fetch: DateTime<Utc>,
    max_age: Duration,
    now: DateTime<Utc>,
    calendar: Option<(&dyn TradingCalendar, &str)>,
) -> Result<bool> {
    let Some((calendar, exchange)) = calendar else {
        return Ok(is_stale(last_fetch, max_age, now));
    };
    if last_fetch >= now {
        return Ok(false);
    }
    let tz = calendar.timezone(exchange)?;
    let first = last_fetch.with_timezone(&tz).date_naive();
    let last = now.with_timezone(&tz).date_naive() + Duration::days(1);
    let sessions = calendar.schedule(exchange, first, last)?;
    Ok(is_stale_in_session(last_fetch, max_age, now, &sessions))
}

/// True when the first session of the range opens after `now`.
pub fn range_in_future(sessions: &[Session], now: DateTime<Utc>) -> bool {
    sessions.first().is_some_and(|s| s.open > now)
}

/// Freshness rules for rows of one series.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowFreshness {
    pub max_age: Duration,
    pub provider_lag: Duration,
    /// Treat a row as stale as soon as its slot has closed, regardless of age.
    pub trigger_at_market_close: bool,
}

impl RowFreshness {
    /// Fetched after the slot closed and the provider caught up.
    pub fn is_final(&self, slot: &Slot, fetched_at: DateTime<Utc>) -> bool {
        fetched_at >= slot.end + self.provider_lag
    }

    pub fn is_stale(&self, slot: &Slot, fetched_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        if self.is_final(slot, fetched_at) {
            return false;
        }
        if self.trigger_at_market_close && now >= slot.end + self.provider_lag {
            return true;
        }
        is_stale(fetched_at, self.max_age, now)
    }
}
