//! Bar intervals supported by the series cache.

use crate::error::CacheError;
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Interval {
    #[serde(rename = "1m")]
    Minute1,
    #[serde(rename = "2m")]
    Minute2,
    #[serde(rename = "5m")]
    Minute5,
    #[serde(rename = "15m")]
    Minute15,
    #[serde(rename = "30m")]
    Minute30,
    #[serde(rename = "60m")]
    Minute60,
    #[serde(rename = "90m")]
    Minute90,
    #[serde(rename = "1h")]
    Hour1,
    #[serde(rename = "1d")]
    Day1,
    #[serde(rename = "1wk")]
    Week1,
    #[serde(rename = "1mo")]
    Month1,
    #[serde(rename = "3mo")]
    Month3,
}

impl Interval {
    pub const ALL: [Interval; 12] = [
        Interval::Minute1,
        Interval::Minute2,
        Interval::Minute5,
        Interval::Minute15,
        Interval::Minute30,
        Interval::Minute60,
        Interval::Minute90,
        Interval::Hour1,
        Interval::Day1,
        Interval::Week1,
        Interval::Month1,
        Interval::Month3,
    ];

    /// Daily first, then everything else in `ALL` order. Daily data carries
    /// the split and dividend events that every other interval depends on.
    pub fn verification_order() -> impl Iterator<Item = Interval> {
        std::iter::once(Interval::Day1)
            .chain(Self::ALL.into_iter().filter(|i| *i != Interval::Day1))
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Interval::Minute1 => "1m",
            Interval::Minute2 => "2m",
            Interval::Minute5 => "5m",
            Interval::Minute15 => "15m",
            Interval::Minute30 => "30m",
            Interval::Minute60 => "60m",
            Interval::Minute90 => "90m",
            Interval::Hour1 => "1h",
            Interval::Day1 => "1d",
            Interval::Week1 => "1wk",
            Interval::Month1 => "1mo",
            Interval::Month3 => "3mo",
        }
    }

    /// Record name for this interval's price table, e.g. `history-1d`.
    pub fn cache_name(self) -> String {
        format!("history-{}", self.as_str())
    }

    pub fn from_cache_name(name: &str) -> Option<Interval> {
        name.strip_prefix("history-")
            .and_then(|suffix| suffix.parse().ok())
    }

    pub fn is_intraday(self) -> bool {
        self.intraday_length().is_some()
    }

    /// Bar length for intraday intervals; `None` for daily and coarser.
    pub fn intraday_length(self) -> Option<Duration> {
        let minutes = match self {
            Interval::Minute1 => 1,
            Interval::Minute2 => 2,
            Interval::Minute5 => 5,
            Interval::Minute15 => 15,
            Interval::Minute30 => 30,
            Interval::Minute60 | Interval::Hour1 => 60,
            Interval::Minute90 => 90,
            _ => return None,
        };
        Some(Duration::minutes(minutes))
    }

    /// Approximate calendar length of one bar.
    pub fn nominal_length(self) -> Duration {
        match self {
            Interval::Day1 => Duration::days(1),
            Interval::Week1 => Duration::days(7),
            Interval::Month1 => Duration::days(31),
            Interval::Month3 => Duration::days(92),
            intraday => intraday.intraday_length().unwrap_or_else(|| Duration::days(1)),
        }
    }

    /// Max-age applied when the caller does not request one: half a bar for
    /// intraday, then 4h / 60h / 15d / 45d for the coarser intervals.
    pub fn default_max_age(self) -> Duration {
        match self {
            Interval::Day1 => Duration::hours(4),
            Interval::Week1 => Duration::hours(60),
            Interval::Month1 => Duration::days(15),
            Interval::Month3 => Duration::days(45),
            intraday => intraday.nominal_length() / 2,
        }
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Interval {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Interval::ALL
            .into_iter()
            .find(|i| i.as_str() == s)
            .ok_or_else(|| {
                CacheError::InvalidArgument(format!(
                    "unknown interval '{s}'; expected one of {}",
                    Interval::ALL.map(|i| i.as_str()).join(", ")
                ))
            })
    }
}
