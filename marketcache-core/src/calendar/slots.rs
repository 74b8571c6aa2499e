//! Expected bar slots per interval.
//!
//! Intraday slots tile each session from the open. Daily and coarser slots
//! start at local midnight of the period's first day, open at its first
//! session and end at the close of its last session.

use super::{local_to_utc, Session, TradingCalendar};
use crate::domain::Interval;
use crate::error::Result;
use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, Utc};
use chrono_tz::Tz;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    pub start: DateTime<Utc>,
    pub open: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// Slots overlapping `[start, end)`.
///
/// The schedule is padded by one period on each side so that a period cut
/// by the request bounds still gets its true first session and last close.
pub fn slots_between(
    calendar: &dyn TradingCalendar,
    exchange: &str,
    interval: Interval,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<Vec<Slot>> {
    if end <= start {
        return Ok(Vec::new());
    }
    let tz = calendar.timezone(exchange)?;
    let pad = Duration::days(interval.nominal_length().num_days().max(1) + 1);
    let first_day = start.with_timezone(&tz).date_naive() - pad;
    let last_day = end.with_timezone(&tz).date_naive() + pad;
    let sessions = calendar.schedule(exchange, first_day, last_day)?;

    Ok(build_slots(interval, &sessions, tz)?
        .into_iter()
        .filter(|s| s.end > start && s.start < end)
        .collect())
}

pub(crate) fn build_slots(interval: Interval, sessions: &[Session], tz: Tz) -> Result<Vec<Slot>> {
    if let Some(length) = interval.intraday_length() {
        let mut slots = Vec::new();
        for session in sessions {
            let mut t = session.open;
            while t < session.close {
                slots.push(Slot {
                    start: t,
                    open: t,
                    end: (t + length).min(session.close),
                });
                t += length;
            }
        }
        return Ok(slots);
    }

    let mut slots: Vec<Slot> = Vec::new();
    let mut current_period: Option<NaiveDate> = None;
    for session in sessions {
        let period = period_start(interval, session.date);
        if current_period == Some(period) {
            if let Some(last) = slots.last_mut() {
                last.end = session.close;
            }
            continue;
        }
        current_period = Some(period);
        slots.push(Slot {
            start: local_to_utc(tz, period, NaiveTime::MIN)?,
            open: session.open,
            end: session.close,
        });
    }
    Ok(slots)
}

/// First local date of the period containing `date`.
fn period_start(interval: Interval, date: NaiveDate) -> NaiveDate {
    match interval {
        Interval::Week1 => date - Duration::days(i64::from(date.weekday().num_days_from_monday())),
        Interval::Month1 => date.with_day(1).unwrap_or(date),
        Interval::Month3 => {
            let first_month = (date.month0() / 3) * 3 + 1;
            NaiveDate::from_ymd_opt(date.year(), first_month, 1).unwrap_or(date)
        }
        _ => date,
    }
}

/// Index of the slot a provider timestamp belongs to.
///
/// A timestamp belongs to the last slot starting at or before it, as long as
/// it falls before the next slot starts (or, for the final slot, before the
/// later of its end and one nominal bar length).
pub fn slot_index(slots: &[Slot], ts: DateTime<Utc>, interval: Interval) -> Option<usize> {
    let i = slots.partition_point(|s| s.start <= ts).checked_sub(1)?;
    let slot = &slots[i];
    let bound = match slots.get(i + 1) {
        Some(next) => next.start,
        None => slot.end.max(slot.start + interval.nominal_length()),
    };
    (ts < bound).then_some(i)
}
