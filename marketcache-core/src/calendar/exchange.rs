//! Exchange calendars built from configured trading hours.
//!
//! Each exchange is a time zone, a regular open/close, a holiday list and a
//! provider lag. Weekends are always closed.

use super::{local_to_utc, Session, TradingCalendar};
use crate::error::{CacheError, Result};
use chrono::{Datelike, Duration, NaiveDate, NaiveTime, Weekday};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangeSpec {
    #[serde(with = "tz_serde")]
    pub timezone: Tz,
    pub open: NaiveTime,
    pub close: NaiveTime,
    #[serde(default)]
    pub holidays: BTreeSet<NaiveDate>,
    /// Minutes after the close before provider data is final.
    #[serde(default)]
    pub provider_lag_minutes: i64,
}

mod tz_serde {
    use chrono_tz::Tz;
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::str::FromStr;

    pub fn serialize<S>(tz: &Tz, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(tz.name())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Tz, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Tz::from_str(&s).map_err(serde::de::Error::custom)
    }
}

impl ExchangeSpec {
    pub fn new(timezone: Tz, open: (u32, u32), close: (u32, u32), provider_lag_minutes: i64) -> Self {
        let time = |(h, m): (u32, u32)| NaiveTime::from_hms_opt(h, m, 0).unwrap_or(NaiveTime::MIN);
        Self {
            timezone,
            open: time(open),
            close: time(close),
            holidays: BTreeSet::new(),
            provider_lag_minutes,
        }
    }

    pub fn is_trading_day(&self, date: NaiveDate) -> bool {
        !matches!(date.weekday(), Weekday::Sat | Weekday::Sun) && !self.holidays.contains(&date)
    }
}

/// Built-in hours for the exchange codes Yahoo reports most often.
///
/// These carry no holidays: every weekday is a session, so an exchange
/// holiday is cached as a "known no trade" row. Supply holidays through
/// `[exchanges.<CODE>] holidays` in config to drop those slots.
pub fn builtin_exchanges() -> BTreeMap<String, ExchangeSpec> {
    use chrono_tz::{America, Asia, Australia, Europe};

    let us = ExchangeSpec::new(America::New_York, (9, 30), (16, 0), 0);
    let mut map = BTreeMap::new();
    for code in ["NMS", "NYQ", "NGM", "NCM", "ASE", "PCX", "BTS"] {
        map.insert(code.to_string(), us.clone());
    }
    let others = [
        ("LSE", ExchangeSpec::new(Europe::London, (8, 0), (16, 30), 20)),
        ("GER", ExchangeSpec::new(Europe::Berlin, (9, 0), (17, 30), 15)),
        ("PAR", ExchangeSpec::new(Europe::Paris, (9, 0), (17, 30), 15)),
        ("TOR", ExchangeSpec::new(America::Toronto, (9, 30), (16, 0), 15)),
        ("TYO", ExchangeSpec::new(Asia::Tokyo, (9, 0), (15, 0), 20)),
        ("HKG", ExchangeSpec::new(Asia::Hong_Kong, (9, 30), (16, 0), 15)),
        ("ASX", ExchangeSpec::new(Australia::Sydney, (10, 0), (16, 0), 20)),
    ];
    for (code, spec) in others {
        map.insert(code.to_string(), spec);
    }
    map
}

/// Calendar over a fixed set of configured exchanges.
#[derive(Debug, Clone)]
pub struct ExchangeCalendar {
    exchanges: BTreeMap<String, ExchangeSpec>,
}

impl ExchangeCalendar {
    pub fn new(exchanges: BTreeMap<String, ExchangeSpec>) -> Self {
        Self { exchanges }
    }

    /// Weekday sessions for the built-in codes, without holidays. See
    /// [`builtin_exchanges`].
    pub fn builtin() -> Self {
        Self::new(builtin_exchanges())
    }

    pub fn spec(&self, exchange: &str) -> Result<&ExchangeSpec> {
        self.exchanges
            .get(exchange)
            .ok_or_else(|| CacheError::UnknownExchange(exchange.to_string()))
    }

    pub fn codes(&self) -> impl Iterator<Item = &str> {
        self.exchanges.keys().map(String::as_str)
    }
}

impl TradingCalendar for ExchangeCalendar {
    fn schedule(&self, exchange: &str, start: NaiveDate, end: NaiveDate) -> Result<Vec<Session>> {
        let spec = self.spec(exchange)?;
        let mut sessions = Vec::new();
        let mut date = start;
        while date < end {
            if spec.is_trading_day(date) {
                sessions.push(Session {
                    date,
                    open: local_to_utc(spec.timezone, date, spec.open)?,
                    close: local_to_utc(spec.timezone, date, spec.close)?,
                });
            }
            date += Duration::days(1);
        }
        Ok(sessions)
    }

    fn timezone(&self, exchange: &str) -> Result<Tz> {
        Ok(self.spec(exchange)?.timezone)
    }

    fn provider_lag(&self, exchange: &str) -> Result<Duration> {
        Ok(Duration::minutes(self.spec(exchange)?.provider_lag_minutes))
    }
}
