//! Verification and correction of cached series.

mod common;

use common::{date, fixture, utc, weekday_rows};
use marketcache_core::domain::{CacheKey, Interval, Payload, PriceTable};
use marketcache_core::provider::RawRow;
use marketcache_core::reconcile::{verify_interval, DivergenceKind, META_LAST_VERIFIED};
use marketcache_core::series::{SeriesSynchronizer, SyncState};
use marketcache_core::{CacheError, HistoryRequest, VerifyOptions};

fn cached_table(fx: &common::Fixture, key: &CacheKey) -> PriceTable {
    match fx.cache.store().get(key).unwrap().map(|r| r.payload) {
        Some(Payload::Table(table)) => table,
        other => panic!("expected a cached table, got {other:?}"),
    }
}

fn cache_january(fx: &common::Fixture) {
    fx.cache
        .history_between_dates("AAPL", Interval::Day1, date(2024, 1, 1), date(2024, 1, 11))
        .unwrap();
}

/// Provider now reports a different close for Jan 8.
fn revise_jan8(fx: &common::Fixture) {
    let mut rows = weekday_rows(date(2024, 1, 1), date(2024, 2, 1), 180.0);
    let jan8 = rows
        .iter_mut()
        .find(|r| r.timestamp.date_naive() == date(2024, 1, 8))
        .unwrap();
    jan8.close = Some(jan8.close.unwrap() * 1.05);
    fx.provider.set_series("AAPL", Interval::Day1, rows);
}

#[test]
fn consistent_cache_verifies_and_is_stamped() {
    let fx = fixture();
    cache_january(&fx);
    assert!(fx.cache.verify("AAPL", &VerifyOptions::default()).unwrap());

    let key = fx.history_key("AAPL", Interval::Day1);
    let stamp = fx
        .cache
        .store()
        .get_metadata_field(&key, META_LAST_VERIFIED)
        .unwrap();
    assert_eq!(stamp.and_then(|v| v.as_timestamp()), Some(utc(2024, 3, 1, 0, 0)));
}

#[test]
fn divergence_without_correct_reports_and_keeps_rows() {
    let fx = fixture();
    cache_january(&fx);
    revise_jan8(&fx);

    let key = fx.history_key("AAPL", Interval::Day1);
    let before = cached_table(&fx, &key);

    let result = fx
        .cache
        .verify_symbol("AAPL", &VerifyOptions::default())
        .unwrap();
    assert!(!result.is_consistent());
    assert!(!result.corrected);
    assert_eq!(result.reports.len(), 1);
    let (interval, report) = &result.reports[0];
    assert_eq!(*interval, Interval::Day1);
    assert_eq!(report.earliest_divergence(), Some(utc(2024, 1, 8, 5, 0)));
    assert!(report
        .divergences
        .iter()
        .any(|d| matches!(d.kind, DivergenceKind::Value { field: "close", .. })));

    // Cached rows are untouched; the refresh only appended later sessions.
    let after = cached_table(&fx, &key);
    assert_eq!(&after.rows()[..before.len()], before.rows());
    assert!(after.len() > before.len());
    assert!(fx
        .cache
        .store()
        .get_metadata_field(&key, "LastCorrection")
        .unwrap()
        .is_none());
}

#[test]
fn correction_returns_false_then_true() {
    let fx = fixture();
    cache_january(&fx);
    revise_jan8(&fx);

    let opts = VerifyOptions {
        correct: true,
        ..VerifyOptions::default()
    };
    assert!(!fx.cache.verify("AAPL", &opts).unwrap());
    assert!(fx.cache.verify("AAPL", &opts).unwrap());

    // The corrected range was re-fetched, not left empty.
    let bars = fx
        .cache
        .history_between_dates("AAPL", Interval::Day1, date(2024, 1, 8), date(2024, 1, 9))
        .unwrap();
    assert!((bars[0].close.unwrap() - 185.0 * 1.05).abs() < 1e-9);

    let record = fx
        .cache
        .store()
        .get(&fx.history_key("AAPL", Interval::Day1))
        .unwrap()
        .unwrap();
    assert!(record.meta_timestamp("LastCorrection").is_some());
    let Payload::Table(table) = record.payload else {
        panic!("expected a table payload");
    };
    // Verification first brought the daily series up to date.
    assert_eq!(table.get(utc(2024, 1, 31, 5, 0)).and_then(|r| r.close), Some(202.0));
}

#[test]
fn cached_no_trade_against_absent_row_is_not_a_divergence() {
    let fx = fixture();
    let mut rows = weekday_rows(date(2024, 1, 1), date(2024, 2, 1), 180.0);
    rows.retain(|r| r.timestamp.date_naive() != date(2024, 1, 3));
    fx.provider.set_series("AAPL", Interval::Day1, rows);
    cache_january(&fx);

    assert!(fx.cache.verify("AAPL", &VerifyOptions::default()).unwrap());
}

#[test]
fn row_appearing_upstream_is_missing_from_cache() {
    let fx = fixture();
    let full = weekday_rows(date(2024, 1, 1), date(2024, 2, 1), 180.0);
    let mut gappy = full.clone();
    gappy.retain(|r| r.timestamp.date_naive() != date(2024, 1, 3));
    fx.provider.set_series("AAPL", Interval::Day1, gappy);
    cache_january(&fx);
    fx.provider.set_series("AAPL", Interval::Day1, full);

    let mut sync =
        SeriesSynchronizer::new(fx.cache.context().clone(), "AAPL", Interval::Day1, "NMS").unwrap();
    let report = verify_interval(&mut sync, &VerifyOptions::default()).unwrap();
    assert_eq!(report.compared, 8);
    assert_eq!(report.divergences.len(), 1);
    assert_eq!(report.divergences[0].kind, DivergenceKind::MissingFromCache);
    assert_eq!(report.divergences[0].timestamp, utc(2024, 1, 3, 5, 0));
}

#[test]
fn provider_failure_during_verify_is_surfaced() {
    let fx = fixture();
    cache_january(&fx);
    fx.provider.set_offline(true);
    let err = fx
        .cache
        .verify("AAPL", &VerifyOptions::default())
        .unwrap_err();
    assert!(matches!(err, CacheError::Provider { .. }));
}

#[test]
fn verify_all_runs_every_symbol() {
    let fx = fixture();
    fx.provider.set_scalar("MSFT", "exchangeName", "NMS".into());
    fx.provider.set_series(
        "MSFT",
        Interval::Day1,
        weekday_rows(date(2024, 1, 1), date(2024, 2, 1), 370.0),
    );
    cache_january(&fx);
    fx.cache
        .history_between_dates("MSFT", Interval::Day1, date(2024, 1, 1), date(2024, 1, 11))
        .unwrap();
    revise_jan8(&fx);

    let summary = fx
        .cache
        .verify_all(&VerifyOptions::default(), None, false)
        .unwrap();
    assert_eq!(summary.diverged, vec!["AAPL".to_string()]);
    assert_eq!(summary.consistent, vec!["MSFT".to_string()]);
    assert!(!summary.all_consistent());

    let resumed = fx
        .cache
        .verify_all(&VerifyOptions::default(), Some("b"), true)
        .unwrap();
    assert_eq!(resumed.consistent, vec!["MSFT".to_string()]);
    assert!(resumed.all_consistent());

    let halted = fx
        .cache
        .verify_all(&VerifyOptions::default(), None, true)
        .unwrap();
    assert_eq!(halted.halted_at.as_deref(), Some("AAPL"));
    assert!(halted.consistent.is_empty());

    let corrected = fx
        .cache
        .verify_all(
            &VerifyOptions {
                correct: true,
                ..VerifyOptions::default()
            },
            None,
            false,
        )
        .unwrap();
    assert_eq!(corrected.corrected, vec!["AAPL".to_string()]);
    assert!(corrected.all_consistent());
}

#[test]
fn divergence_at_first_row_deletes_the_table() {
    let fx = fixture();
    cache_january(&fx);
    let mut rows = weekday_rows(date(2024, 1, 1), date(2024, 2, 1), 180.0);
    rows[0].close = Some(rows[0].close.unwrap() * 1.05);
    fx.provider.set_series("AAPL", Interval::Day1, rows);

    let mut sync =
        SeriesSynchronizer::new(fx.cache.context().clone(), "AAPL", Interval::Day1, "NMS").unwrap();
    let opts = VerifyOptions {
        correct: true,
        ..VerifyOptions::default()
    };
    let report = verify_interval(&mut sync, &opts).unwrap();
    assert_eq!(report.corrected_from, Some(utc(2024, 1, 1, 5, 0)));

    assert!(sync.table().unwrap().is_empty());
    assert_eq!(*sync.state(), SyncState::Empty);
    let key = fx.history_key("AAPL", Interval::Day1);
    assert!(fx.cache.store().get(&key).unwrap().is_none());
    assert!(!fx.dir.path().join("AAPL/history-1d.parquet").exists());
    assert!(fx.cache.cached_intervals("AAPL").unwrap().is_empty());
}

/// Hourly bars for Jan 2-5 on NMS, each close offset by the bar's hour.
fn hourly_rows() -> Vec<RawRow> {
    (2..=5)
        .flat_map(|day| (0..7).map(move |h| (day, h)))
        .map(|(day, h)| {
            let close = 180.0 + day as f64 + h as f64 * 0.1;
            RawRow {
                timestamp: utc(2024, 1, day, 14, 30) + chrono::Duration::hours(h),
                open: Some(close - 0.05),
                high: Some(close + 0.2),
                low: Some(close - 0.2),
                close: Some(close),
                volume: Some(10_000 + h as u64),
                dividends: 0.0,
                stock_splits: 0.0,
            }
        })
        .collect()
}

fn cache_daily_and_hourly_then_revise_both(fx: &common::Fixture) {
    fx.provider.set_series("AAPL", Interval::Hour1, hourly_rows());
    cache_january(fx);
    fx.cache
        .history(
            "AAPL",
            &HistoryRequest::new(Interval::Hour1, utc(2024, 1, 2, 14, 30), utc(2024, 1, 5, 21, 0)),
        )
        .unwrap();

    revise_jan8(fx);
    let mut hourly = hourly_rows();
    hourly[8].close = Some(hourly[8].close.unwrap() * 1.05);
    fx.provider.set_series("AAPL", Interval::Hour1, hourly);
}

#[test]
fn daily_divergence_stops_before_other_intervals() {
    let fx = fixture();
    cache_daily_and_hourly_then_revise_both(&fx);

    let result = fx
        .cache
        .verify_symbol("AAPL", &VerifyOptions::default())
        .unwrap();
    let intervals: Vec<_> = result.reports.iter().map(|(i, _)| *i).collect();
    assert_eq!(intervals, vec![Interval::Day1]);
    assert!(!result.is_consistent());
}

#[test]
fn one_correction_per_call() {
    let fx = fixture();
    cache_daily_and_hourly_then_revise_both(&fx);
    let hourly_key = fx.history_key("AAPL", Interval::Hour1);
    let hourly_before = cached_table(&fx, &hourly_key);
    let opts = VerifyOptions {
        correct: true,
        ..VerifyOptions::default()
    };

    // First call corrects the daily series only.
    let first = fx.cache.verify_symbol("AAPL", &opts).unwrap();
    assert!(first.corrected);
    let intervals: Vec<_> = first.reports.iter().map(|(i, _)| *i).collect();
    assert_eq!(intervals, vec![Interval::Day1]);
    assert_eq!(cached_table(&fx, &hourly_key), hourly_before);

    // Second call finds the daily series clean and corrects the hourly one.
    let second = fx.cache.verify_symbol("AAPL", &opts).unwrap();
    assert!(second.corrected);
    assert!(second.reports[0].1.is_consistent());
    let (interval, report) = second.reports.last().unwrap();
    assert_eq!(*interval, Interval::Hour1);
    assert_eq!(report.corrected_from, Some(utc(2024, 1, 3, 15, 30)));

    assert!(fx.cache.verify("AAPL", &opts).unwrap());
}
