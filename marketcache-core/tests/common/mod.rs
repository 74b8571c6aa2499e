//! Shared setup for integration tests: a temp cache root, a manual clock and
//! an in-memory provider serving weekday daily bars.

#![allow(dead_code)]

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Utc, Weekday};
use marketcache_core::calendar::ExchangeCalendar;
use marketcache_core::clock::ManualClock;
use marketcache_core::domain::{CacheKey, Interval, MetaValue};
use marketcache_core::provider::{FixtureProvider, RawRow};
use marketcache_core::{CacheConfig, MarketCache};
use std::sync::Arc;
use tempfile::TempDir;

pub struct Fixture {
    pub dir: TempDir,
    pub clock: Arc<ManualClock>,
    pub provider: Arc<FixtureProvider>,
    pub cache: MarketCache,
}

impl Fixture {
    pub fn history_key(&self, symbol: &str, interval: Interval) -> CacheKey {
        CacheKey::history(symbol, interval).unwrap()
    }
}

pub fn utc(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
}

pub fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

/// One row per weekday in `[from, to)`, stamped 12:00 UTC, close rising by 1.
pub fn weekday_rows(from: NaiveDate, to: NaiveDate, base: f64) -> Vec<RawRow> {
    from.iter_days()
        .take_while(|d| *d < to)
        .filter(|d| !matches!(d.weekday(), Weekday::Sat | Weekday::Sun))
        .enumerate()
        .map(|(i, d)| {
            let close = base + i as f64;
            RawRow {
                timestamp: d.and_hms_opt(12, 0, 0).unwrap().and_utc(),
                open: Some(close - 0.5),
                high: Some(close + 1.0),
                low: Some(close - 1.0),
                close: Some(close),
                volume: Some(1_000_000 + i as u64),
                dividends: 0.0,
                stock_splits: 0.0,
            }
        })
        .collect()
}

/// Cache at a fresh temp root, clock at 2024-03-01 00:00 UTC, and `AAPL`
/// listed on NMS with daily bars for January 2024.
pub fn fixture() -> Fixture {
    fixture_at(utc(2024, 3, 1, 0, 0))
}

pub fn fixture_at(now: DateTime<Utc>) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(ManualClock::new(now));
    let provider = Arc::new(FixtureProvider::new());
    provider.set_scalar("AAPL", "exchangeName", MetaValue::from("NMS"));
    provider.set_series(
        "AAPL",
        Interval::Day1,
        weekday_rows(date(2024, 1, 1), date(2024, 2, 1), 180.0),
    );

    let config = CacheConfig {
        cache_dir: dir.path().to_path_buf(),
        ..CacheConfig::default()
    };
    let cache = MarketCache::new(
        &config,
        provider.clone(),
        Arc::new(ExchangeCalendar::builtin()),
        clock.clone(),
    );
    Fixture {
        dir,
        clock,
        provider,
        cache,
    }
}

pub fn advance(fx: &Fixture, by: Duration) {
    fx.clock.advance(by);
}
