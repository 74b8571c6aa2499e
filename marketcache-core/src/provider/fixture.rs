//! In-memory provider for offline use and tests.
//!
//! Serves whatever series, scalars, documents and shares it was loaded with,
//! records every call, and can be switched offline to simulate an outage.
//! Series can be loaded from CSV (`symbol,interval,timestamp,open,high,low,
//! close,volume,dividends,stock_splits`); a date-only timestamp is read as
//! 12:00 UTC so it lands on the same local trading date for any exchange
//! between UTC-11 and UTC+11.

use super::{MarketDataProvider, ProviderError, RawRow};
use crate::domain::{Interval, MetaValue, SharesPoint};
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// One recorded provider call.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchCall {
    Series {
        symbol: String,
        interval: Interval,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
    Scalar {
        symbol: String,
        field: String,
    },
    Shares {
        symbol: String,
        start: NaiveDate,
        end: NaiveDate,
    },
    Document {
        symbol: String,
        name: String,
    },
}

#[derive(Debug, Deserialize)]
struct CsvRow {
    symbol: String,
    interval: String,
    timestamp: String,
    open: Option<f64>,
    high: Option<f64>,
    low: Option<f64>,
    close: Option<f64>,
    volume: Option<u64>,
    #[serde(default)]
    dividends: Option<f64>,
    #[serde(default)]
    stock_splits: Option<f64>,
}

#[derive(Debug, Default)]
pub struct FixtureProvider {
    series: Mutex<HashMap<(String, Interval), Vec<RawRow>>>,
    scalars: Mutex<HashMap<(String, String), MetaValue>>,
    documents: Mutex<HashMap<(String, String), Value>>,
    shares: Mutex<HashMap<String, Vec<SharesPoint>>>,
    calls: Mutex<Vec<FetchCall>>,
    offline: AtomicBool,
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl FixtureProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load series rows from a CSV file.
    pub fn from_csv(path: &Path) -> Result<Self, ProviderError> {
        let mut reader = csv::Reader::from_path(path)
            .map_err(|e| ProviderError::Other(format!("open {}: {e}", path.display())))?;
        let provider = Self::new();
        let mut grouped: HashMap<(String, Interval), Vec<RawRow>> = HashMap::new();
        for (line, record) in reader.deserialize::<CsvRow>().enumerate() {
            let row = record.map_err(|e| {
                ProviderError::ResponseFormatChanged(format!("{} row {}: {e}", path.display(), line + 1))
            })?;
            let interval: Interval = row
                .interval
                .parse()
                .map_err(|e| ProviderError::ResponseFormatChanged(format!("row {}: {e}", line + 1)))?;
            let timestamp = parse_timestamp(&row.timestamp).ok_or_else(|| {
                ProviderError::ResponseFormatChanged(format!(
                    "row {}: bad timestamp '{}'",
                    line + 1,
                    row.timestamp
                ))
            })?;
            grouped
                .entry((row.symbol.to_uppercase(), interval))
                .or_default()
                .push(RawRow {
                    timestamp,
                    open: row.open,
                    high: row.high,
                    low: row.low,
                    close: row.close,
                    volume: row.volume,
                    dividends: row.dividends.unwrap_or(0.0),
                    stock_splits: row.stock_splits.unwrap_or(0.0),
                });
        }
        for ((symbol, interval), rows) in grouped {
            provider.set_series(&symbol, interval, rows);
        }
        Ok(provider)
    }

    /// Replace the series for `(symbol, interval)`.
    pub fn set_series(&self, symbol: &str, interval: Interval, mut rows: Vec<RawRow>) {
        rows.sort_by_key(|r| r.timestamp);
        lock(&self.series).insert((symbol.to_uppercase(), interval), rows);
    }

    pub fn set_scalar(&self, symbol: &str, field: &str, value: MetaValue) {
        lock(&self.scalars).insert((symbol.to_uppercase(), field.to_string()), value);
    }

    pub fn set_document(&self, symbol: &str, name: &str, value: Value) {
        lock(&self.documents).insert((symbol.to_uppercase(), name.to_string()), value);
    }

    pub fn set_shares(&self, symbol: &str, mut points: Vec<SharesPoint>) {
        points.sort_by_key(|p| p.date);
        lock(&self.shares).insert(symbol.to_uppercase(), points);
    }

    /// While offline every fetch fails with `NetworkUnreachable`.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Symbols with at least one loaded series, sorted.
    pub fn series_symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = lock(&self.series).keys().map(|(s, _)| s.clone()).collect();
        symbols.sort();
        symbols.dedup();
        symbols
    }

    pub fn calls(&self) -> Vec<FetchCall> {
        lock(&self.calls).clone()
    }

    pub fn series_calls(&self) -> Vec<FetchCall> {
        self.calls()
            .into_iter()
            .filter(|c| matches!(c, FetchCall::Series { .. }))
            .collect()
    }

    pub fn clear_calls(&self) {
        lock(&self.calls).clear();
    }

    fn record(&self, call: FetchCall) -> Result<(), ProviderError> {
        lock(&self.calls).push(call);
        if self.offline.load(Ordering::SeqCst) {
            return Err(ProviderError::NetworkUnreachable("fixture provider is offline".into()));
        }
        Ok(())
    }
}

fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_time(NaiveTime::from_hms_opt(12, 0, 0)?).and_utc().into())
        })
}

impl MarketDataProvider for FixtureProvider {
    fn name(&self) -> &str {
        "fixture"
    }

    fn fetch_series(
        &self,
        symbol: &str,
        interval: Interval,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<RawRow>, ProviderError> {
        let symbol = symbol.to_uppercase();
        self.record(FetchCall::Series {
            symbol: symbol.clone(),
            interval,
            start,
            end,
        })?;
        let series = lock(&self.series);
        let rows = series.get(&(symbol.clone(), interval)).ok_or(ProviderError::SymbolNotFound {
            symbol,
        })?;
        Ok(rows
            .iter()
            .filter(|r| r.timestamp >= start && r.timestamp < end)
            .cloned()
            .collect())
    }

    fn fetch_scalar(&self, symbol: &str, field: &str) -> Result<MetaValue, ProviderError> {
        let symbol = symbol.to_uppercase();
        self.record(FetchCall::Scalar {
            symbol: symbol.clone(),
            field: field.to_string(),
        })?;
        lock(&self.scalars)
            .get(&(symbol.clone(), field.to_string()))
            .cloned()
            .ok_or_else(|| ProviderError::FieldNotFound {
                symbol,
                field: field.to_string(),
            })
    }

    fn fetch_shares_outstanding(
        &self,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<SharesPoint>, ProviderError> {
        let symbol = symbol.to_uppercase();
        self.record(FetchCall::Shares {
            symbol: symbol.clone(),
            start,
            end,
        })?;
        Ok(lock(&self.shares)
            .get(&symbol)
            .map(|points| {
                points
                    .iter()
                    .filter(|p| p.date >= start && p.date < end)
                    .copied()
                    .collect()
            })
            .unwrap_or_default())
    }

    fn fetch_document(&self, symbol: &str, name: &str) -> Result<Value, ProviderError> {
        let symbol = symbol.to_uppercase();
        self.record(FetchCall::Document {
            symbol: symbol.clone(),
            name: name.to_string(),
        })?;
        lock(&self.documents)
            .get(&(symbol.clone(), name.to_string()))
            .cloned()
            .ok_or_else(|| ProviderError::FieldNotFound {
                symbol,
                field: name.to_string(),
            })
    }

    fn is_available(&self) -> bool {
        !self.offline.load(Ordering::SeqCst)
    }
}
