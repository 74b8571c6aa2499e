//! Corporate-action factors and read-time adjustment.
//!
//! Cached prices stay raw. Each row carries a cumulative split factor (CSF)
//! and a cumulative dividend factor (CDF) relative to the newest row; both are
//! recomputed over the whole table after every merge and applied on read.

use crate::domain::{Bar, PriceRow};

const SIGNIFICANT_FIGURES: i32 = 4;

/// Read-time adjustment switches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdjustOptions {
    /// Multiply OHLC and dividends by CSF, divide volume by CSF.
    pub adjust_splits: bool,
    /// Multiply OHLC by CDF. When off, `adj_close` carries `close * CDF`.
    pub adjust_divs: bool,
    /// Round OHLC to four significant figures of the last close.
    pub rounding: bool,
    /// Keep "known no trade" rows.
    pub keep_na: bool,
}

impl Default for AdjustOptions {
    fn default() -> Self {
        Self {
            adjust_splits: true,
            adjust_divs: true,
            rounding: false,
            keep_na: false,
        }
    }
}

/// Recompute CSF and CDF for every row, walking back from the newest row.
///
/// A split on row `i` applies to rows before `i`. A dividend on row `i`
/// multiplies the CDF of earlier rows by `1 - d/c`, with the dividend and the
/// previous close both expressed in the newest split basis.
pub fn recompute_factors(rows: &mut [PriceRow]) {
    let mut csf = 1.0;
    for row in rows.iter_mut().rev() {
        row.csf = csf;
        if row.has_split() {
            csf /= row.stock_splits;
        }
    }

    let mut multipliers = vec![1.0; rows.len()];
    let mut prev_close: Option<(f64, f64)> = None;
    for (i, row) in rows.iter().enumerate() {
        if row.has_dividend() {
            match prev_close {
                Some((close, close_csf)) => {
                    let m = 1.0 - (row.dividends * row.csf) / (close * close_csf);
                    if m > 0.0 && m <= 1.0 {
                        multipliers[i] = m;
                    } else {
                        tracing::warn!(
                            timestamp = %row.timestamp,
                            dividend = row.dividends,
                            close,
                            "ignoring dividend that exceeds the previous close"
                        );
                    }
                }
                None => {
                    tracing::debug!(timestamp = %row.timestamp, "dividend with no earlier close");
                }
            }
        }
        if let Some(close) = row.close.filter(|c| *c > 0.0) {
            prev_close = Some((close, row.csf));
        }
    }

    let mut cdf = 1.0;
    for (row, m) in rows.iter_mut().zip(multipliers).rev() {
        row.cdf = cdf;
        cdf *= m;
    }
}

/// Decimal places giving four significant figures for `price`.
pub fn rounding_decimals(price: f64) -> u32 {
    let n = price.abs();
    if n >= 1.0 {
        let integer_digits = n.log10().floor() as i32 + 1;
        (SIGNIFICANT_FIGURES - integer_digits).max(0) as u32
    } else if n > 0.0 {
        let leading_zeros = (-n.log10()).ceil() as i32 - 1;
        (SIGNIFICANT_FIGURES + leading_zeros.max(0)) as u32
    } else {
        SIGNIFICANT_FIGURES as u32
    }
}

fn round_to(value: f64, decimals: Option<u32>) -> f64 {
    match decimals {
        Some(d) => {
            let scale = 10f64.powi(d as i32);
            (value * scale).round() / scale
        }
        None => value,
    }
}

/// Apply factors to cached rows.
pub fn adjust(rows: &[PriceRow], opts: AdjustOptions) -> Vec<Bar> {
    let split_factor = |r: &PriceRow| if opts.adjust_splits { r.csf } else { 1.0 };
    let price_factor = |r: &PriceRow| split_factor(r) * if opts.adjust_divs { r.cdf } else { 1.0 };

    // No close anywhere means nothing to anchor the precision on: skip.
    let decimals = if opts.rounding {
        rows.iter()
            .rev()
            .find_map(|r| r.close.map(|c| c * price_factor(r)))
            .map(rounding_decimals)
    } else {
        None
    };

    rows.iter()
        .filter(|r| opts.keep_na || !r.is_no_trade())
        .map(|r| {
            let pf = price_factor(r);
            let sf = split_factor(r);
            let price = |v: Option<f64>| v.map(|x| round_to(x * pf, decimals));
            Bar {
                timestamp: r.timestamp,
                open: price(r.open),
                high: price(r.high),
                low: price(r.low),
                close: price(r.close),
                adj_close: if opts.adjust_divs {
                    None
                } else {
                    r.close.map(|c| c * sf * r.cdf)
                },
                volume: r.volume.map(|v| {
                    if sf == 1.0 {
                        v
                    } else {
                        (v as f64 / sf).round() as u64
                    }
                }),
                dividends: r.dividends * sf,
                stock_splits: r.stock_splits,
            }
        })
        .collect()
}
