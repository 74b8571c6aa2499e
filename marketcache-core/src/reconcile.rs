//! Verification of cached series against a fresh canonical fetch.
//!
//! Only rows the cache holds as final are compared; a row fetched while its
//! slot was still open is expected to differ and is left to the synchronizer.

use crate::domain::{MetaValue, PriceRow};
use crate::error::{CacheError, Result};
use crate::provider::RawRow;
use crate::series::SeriesSynchronizer;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

pub const META_LAST_VERIFIED: &str = "LastVerified";

/// Absolute floor added to every relative comparison.
const ATOL: f64 = 1e-8;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VerifyOptions {
    /// Relative tolerance for prices, dividends and split ratios.
    pub rtol: f64,
    /// Relative tolerance for volume.
    pub vol_rtol: f64,
    /// Discard cached rows from the earliest divergence onward.
    pub correct: bool,
}

impl Default for VerifyOptions {
    fn default() -> Self {
        Self {
            rtol: 1e-4,
            vol_rtol: 5e-3,
            correct: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DivergenceKind {
    /// Canonical data exists where the cache recorded no trade.
    MissingFromCache,
    /// The cache holds data the provider no longer reports.
    MissingFromCanonical,
    Value {
        field: &'static str,
        cached: Option<f64>,
        canonical: Option<f64>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Divergence {
    pub timestamp: DateTime<Utc>,
    pub kind: DivergenceKind,
}

impl fmt::Display for Divergence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            DivergenceKind::MissingFromCache => write!(f, "{}: missing from cache", self.timestamp),
            DivergenceKind::MissingFromCanonical => {
                write!(f, "{}: missing from provider", self.timestamp)
            }
            DivergenceKind::Value {
                field,
                cached,
                canonical,
            } => write!(
                f,
                "{}: {field} cached={cached:?} provider={canonical:?}",
                self.timestamp
            ),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct VerifyReport {
    /// Rows compared (final on both sides).
    pub compared: usize,
    pub divergences: Vec<Divergence>,
    /// Set when cached rows were discarded from this timestamp onward.
    pub corrected_from: Option<DateTime<Utc>>,
}

impl VerifyReport {
    pub fn is_consistent(&self) -> bool {
        self.divergences.is_empty()
    }

    pub fn earliest_divergence(&self) -> Option<DateTime<Utc>> {
        self.divergences.iter().map(|d| d.timestamp).min()
    }
}

fn close(a: f64, b: f64, rtol: f64) -> bool {
    (a - b).abs() <= rtol * a.abs().max(b.abs()) + ATOL
}

fn compare_field(
    field: &'static str,
    cached: Option<f64>,
    canonical: Option<f64>,
    rtol: f64,
) -> Option<DivergenceKind> {
    let same = match (cached, canonical) {
        (None, None) => true,
        (Some(a), Some(b)) => close(a, b, rtol),
        _ => false,
    };
    (!same).then_some(DivergenceKind::Value {
        field,
        cached,
        canonical,
    })
}

/// A missing split ratio and a ratio of 1 both mean "no split".
fn split_ratio(ratio: f64) -> f64 {
    if ratio == 0.0 {
        1.0
    } else {
        ratio
    }
}

fn compare_rows(cached: &PriceRow, canonical: &RawRow, opts: &VerifyOptions) -> Vec<DivergenceKind> {
    let prices = [
        ("open", cached.open, canonical.open),
        ("high", cached.high, canonical.high),
        ("low", cached.low, canonical.low),
        ("close", cached.close, canonical.close),
        ("dividends", Some(cached.dividends), Some(canonical.dividends)),
        (
            "stock_splits",
            Some(split_ratio(cached.stock_splits)),
            Some(split_ratio(canonical.stock_splits)),
        ),
    ];
    let mut out: Vec<_> = prices
        .into_iter()
        .filter_map(|(field, a, b)| compare_field(field, a, b, opts.rtol))
        .collect();
    out.extend(compare_field(
        "volume",
        cached.volume.map(|v| v as f64),
        canonical.volume.map(|v| v as f64),
        opts.vol_rtol,
    ));
    out
}

fn has_data(row: &RawRow) -> bool {
    row.close.is_some() || row.open.is_some() || row.volume.is_some()
}

/// Compare one cached series with the provider's current view of it.
///
/// With `opts.correct` the cache is truncated at the earliest divergence;
/// re-fetching the discarded range is left to the caller.
pub fn verify_interval(sync: &mut SeriesSynchronizer, opts: &VerifyOptions) -> Result<VerifyReport> {
    if opts.rtol < 0.0 || opts.vol_rtol < 0.0 {
        return Err(CacheError::InvalidArgument(format!(
            "tolerances must be non-negative (rtol {}, vol_rtol {})",
            opts.rtol, opts.vol_rtol
        )));
    }
    let table = sync.table()?.clone();
    let (Some(first), Some(last)) = (table.first_timestamp(), table.last_timestamp()) else {
        return Ok(VerifyReport::default());
    };

    let now = sync.context().clock.now();
    let slots = sync.slots(first, last + Duration::seconds(1))?;
    let (Some(window_start), Some(window_end)) = (slots.first().map(|s| s.start), slots.last().map(|s| s.end))
    else {
        return Ok(VerifyReport::default());
    };
    tracing::debug!(
        symbol = sync.symbol(),
        interval = %sync.interval(),
        start = %window_start,
        end = %window_end,
        "fetching canonical window"
    );
    let canonical = sync
        .context()
        .provider
        .fetch_series(sync.symbol(), sync.interval(), window_start, window_end)
        .map_err(CacheError::provider(sync.symbol(), "verify"))?;
    let canonical = sync.assign_slots(&slots, canonical)?;

    let freshness = sync.freshness(Duration::zero(), false)?;
    let mut report = VerifyReport::default();
    for (slot, canonical) in slots.iter().zip(canonical) {
        let Some(cached) = table.get(slot.start) else {
            continue;
        };
        if !freshness.is_final(slot, cached.fetched_at) || !freshness.is_final(slot, now) {
            continue;
        }
        report.compared += 1;
        let kinds = match (cached.is_no_trade(), canonical.filter(has_data)) {
            (true, None) => Vec::new(),
            (true, Some(_)) => vec![DivergenceKind::MissingFromCache],
            (false, None) => vec![DivergenceKind::MissingFromCanonical],
            (false, Some(row)) => compare_rows(cached, &row, opts),
        };
        report.divergences.extend(kinds.into_iter().map(|kind| Divergence {
            timestamp: slot.start,
            kind,
        }));
    }

    match report.earliest_divergence() {
        None => {
            sync.stamp(META_LAST_VERIFIED, MetaValue::Timestamp(now))?;
            tracing::debug!(
                symbol = sync.symbol(),
                interval = %sync.interval(),
                compared = report.compared,
                "series verified"
            );
        }
        Some(from) => {
            tracing::warn!(
                symbol = sync.symbol(),
                interval = %sync.interval(),
                divergences = report.divergences.len(),
                %from,
                "cached series diverges from provider"
            );
            if opts.correct {
                sync.discard_from(from)?;
                report.corrected_from = Some(from);
            }
        }
    }
    Ok(report)
}
