//! Upstream data provider contract and structured error types.
//!
//! The [`MarketDataProvider`] trait abstracts over data sources (Yahoo
//! Finance, CSV fixtures) so the cache can swap implementations and tests can
//! replay known data. Providers know nothing about the cache.

pub mod circuit_breaker;
pub mod fixture;
pub mod yahoo;

pub use circuit_breaker::CircuitBreaker;
pub use fixture::{FetchCall, FixtureProvider};
pub use yahoo::YahooProvider;

use crate::domain::{Interval, MetaValue, PriceRow, SharesPoint};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One price row as the provider reports it, before slotting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRow {
    pub timestamp: DateTime<Utc>,
    pub open: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub close: Option<f64>,
    pub volume: Option<u64>,
    #[serde(default)]
    pub dividends: f64,
    #[serde(default)]
    pub stock_splits: f64,
}

impl RawRow {
    /// A cache row stamped at the slot start. Factors start neutral and are
    /// recomputed after the merge.
    pub fn into_price_row(self, slot_start: DateTime<Utc>, fetched_at: DateTime<Utc>) -> PriceRow {
        PriceRow {
            timestamp: slot_start,
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            volume: self.volume,
            dividends: self.dividends,
            stock_splits: self.stock_splits,
            csf: 1.0,
            cdf: 1.0,
            fetched_at,
        }
    }
}

/// Structured error types for provider operations.
///
/// These are designed to be displayable in CLI output as-is.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("network unreachable: {0}")]
    NetworkUnreachable(String),

    #[error("rate limited by provider (retry after {retry_after_secs}s)")]
    RateLimited { retry_after_secs: u64 },

    #[error("response format changed: {0}")]
    ResponseFormatChanged(String),

    #[error("authentication required: {0}")]
    AuthenticationRequired(String),

    #[error("symbol not found: {symbol}")]
    SymbolNotFound { symbol: String },

    #[error("field '{field}' not reported for {symbol}")]
    FieldNotFound { symbol: String, field: String },

    #[error("hard stop: data provider has blocked requests (circuit breaker tripped)")]
    CircuitBreakerTripped,

    #[error("provider error: {0}")]
    Other(String),
}

/// Source of market data for the cache.
///
/// Non-success is always a typed [`ProviderError`]; a range that genuinely
/// has no data returns an empty vector.
pub trait MarketDataProvider: Send + Sync {
    /// Human-readable name of this provider.
    fn name(&self) -> &str;

    /// Price rows with `start <= timestamp < end`, ascending, with split and
    /// dividend events attached to their rows. Prices and volumes are as
    /// traded, not adjusted for later splits.
    fn fetch_series(
        &self,
        symbol: &str,
        interval: Interval,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<RawRow>, ProviderError>;

    /// A single quote-level field, e.g. `exchangeName`.
    fn fetch_scalar(&self, symbol: &str, field: &str) -> Result<MetaValue, ProviderError>;

    /// Shares-outstanding reports with `start <= date < end`.
    fn fetch_shares_outstanding(
        &self,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<SharesPoint>, ProviderError>;

    /// A semi-structured document such as `info` or `quarterly_cashflow`.
    fn fetch_document(&self, symbol: &str, name: &str) -> Result<serde_json::Value, ProviderError>;

    /// Check if the provider is currently available (not rate-limited, not blocked).
    fn is_available(&self) -> bool {
        true
    }
}
