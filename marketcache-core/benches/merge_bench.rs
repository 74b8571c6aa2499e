//! Criterion benchmarks for series hot paths.
//!
//! Benchmarks:
//! 1. Merge of a fetched run into a cached table
//! 2. Factor recomputation over a whole table
//! 3. Read-time adjustment

use chrono::{Duration, TimeZone, Utc};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use marketcache_core::domain::{PriceRow, PriceTable};
use marketcache_core::series::{adjust, merge, recompute_factors, AdjustOptions};

// ── Helpers ──────────────────────────────────────────────────────────

fn make_rows(n: usize, offset: usize) -> Vec<PriceRow> {
    let base = Utc.with_ymd_and_hms(2000, 1, 3, 5, 0, 0).unwrap();
    (offset..offset + n)
        .map(|i| {
            let ts = base + Duration::days(i as i64);
            let close = 100.0 + (i as f64 * 0.1).sin() * 10.0;
            PriceRow {
                open: Some(close - 0.3),
                high: Some(close + 1.5),
                low: Some(close - 1.5),
                close: Some(close),
                volume: Some(1_000_000 + (i as u64 % 500_000)),
                dividends: if i % 63 == 0 { 0.25 } else { 0.0 },
                stock_splits: if i % 1000 == 999 { 2.0 } else { 0.0 },
                ..PriceRow::no_trade(ts, ts + Duration::days(1))
            }
        })
        .collect()
}

fn make_table(n: usize) -> PriceTable {
    let mut rows = make_rows(n, 0);
    recompute_factors(&mut rows);
    PriceTable::from_sorted(rows).unwrap()
}

// ── 1. Merge ─────────────────────────────────────────────────────────

fn bench_merge(c: &mut Criterion) {
    let mut group = c.benchmark_group("merge");

    for &cached in &[252, 2520, 6300] {
        let table = make_table(cached);
        // Overlap the last five rows and append a week.
        let incoming = make_rows(10, cached - 5);
        group.bench_with_input(BenchmarkId::new("append_run", cached), &cached, |b, _| {
            b.iter(|| merge(black_box(&table), black_box(incoming.clone())).unwrap())
        });
    }

    group.finish();
}

// ── 2. Factors ───────────────────────────────────────────────────────

fn bench_factors(c: &mut Criterion) {
    let mut group = c.benchmark_group("recompute_factors");

    for &n in &[252, 2520, 6300] {
        let rows = make_rows(n, 0);
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, _| {
            b.iter(|| {
                let mut rows = rows.clone();
                recompute_factors(black_box(&mut rows));
                rows
            })
        });
    }

    group.finish();
}

// ── 3. Adjust ────────────────────────────────────────────────────────

fn bench_adjust(c: &mut Criterion) {
    let mut group = c.benchmark_group("adjust");
    let table = make_table(6300);

    let rounded = AdjustOptions {
        rounding: true,
        ..AdjustOptions::default()
    };
    group.bench_function("default", |b| {
        b.iter(|| adjust(black_box(table.rows()), AdjustOptions::default()))
    });
    group.bench_function("rounded", |b| {
        b.iter(|| adjust(black_box(table.rows()), rounded))
    });

    group.finish();
}

criterion_group!(benches, bench_merge, bench_factors, bench_adjust);
criterion_main!(benches);
