//! marketcache core: a persistent, self-healing cache in front of a market
//! data provider.
//!
//! This crate contains:
//! - Domain types (price rows, intervals, cache keys, records)
//! - The record store (JSON envelopes, Parquet tables, packed units)
//! - Exchange calendars and bar slots
//! - Staleness policy
//! - Incremental series synchronization with corporate-action factors
//! - Reconciliation of cached series against the provider
//! - The [`MarketCache`] façade and its TOML configuration

pub mod calendar;
pub mod clock;
pub mod config;
pub mod context;
pub mod domain;
pub mod error;
pub mod provider;
pub mod reconcile;
pub mod series;
pub mod service;
pub mod staleness;
pub mod store;

pub use config::{CacheConfig, ConfigError};
pub use error::{CacheError, Result};
pub use reconcile::{VerifyOptions, VerifyReport};
pub use series::{AdjustOptions, HistoryRequest};
pub use service::{MarketCache, SymbolVerification, VerifySummary};
