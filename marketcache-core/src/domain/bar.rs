//! Price rows: the stored form and the adjusted form handed to callers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One cached slot of a price series.
///
/// Prices are stored raw, exactly as the provider reported them. Split and
/// dividend adjustment happens at read time through `csf` and `cdf`.
/// `stock_splits` follows the provider convention: `0.0` means no split,
/// otherwise the new-shares-per-old-share ratio.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceRow {
    pub timestamp: DateTime<Utc>,
    pub open: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub close: Option<f64>,
    pub volume: Option<u64>,
    pub dividends: f64,
    pub stock_splits: f64,
    /// Cumulative split factor.
    pub csf: f64,
    /// Cumulative dividend factor.
    pub cdf: f64,
    pub fetched_at: DateTime<Utc>,
}

impl PriceRow {
    /// A "known no trade" row: the provider was asked about this slot and
    /// returned nothing.
    pub fn no_trade(timestamp: DateTime<Utc>, fetched_at: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            open: None,
            high: None,
            low: None,
            close: None,
            volume: None,
            dividends: 0.0,
            stock_splits: 0.0,
            csf: 1.0,
            cdf: 1.0,
            fetched_at,
        }
    }

    /// True when every price field and volume is null or zero.
    pub fn is_no_trade(&self) -> bool {
        let price_empty = |v: Option<f64>| v.map_or(true, |x| x == 0.0 || x.is_nan());
        price_empty(self.open)
            && price_empty(self.high)
            && price_empty(self.low)
            && price_empty(self.close)
            && self.volume.map_or(true, |v| v == 0)
    }

    pub fn has_split(&self) -> bool {
        self.stock_splits != 0.0 && self.stock_splits != 1.0
    }

    pub fn has_dividend(&self) -> bool {
        self.dividends > 0.0
    }
}

/// A price row after read-time adjustment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub timestamp: DateTime<Utc>,
    pub open: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub close: Option<f64>,
    /// Dividend-adjusted close. Only present when dividend adjustment was not
    /// applied to the OHLC columns themselves.
    pub adj_close: Option<f64>,
    pub volume: Option<u64>,
    pub dividends: f64,
    pub stock_splits: f64,
}

impl Bar {
    /// Basic OHLC sanity check: high >= low, high >= open, high >= close, etc.
    pub fn is_sane(&self) -> bool {
        match (self.open, self.high, self.low, self.close) {
            (Some(o), Some(h), Some(l), Some(c)) => {
                h >= l && h >= o && h >= c && l <= o && l <= c && o > 0.0 && c > 0.0
            }
            _ => false,
        }
    }
}
