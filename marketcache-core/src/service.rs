//! The cache façade: price history, verification, and the non-series
//! records (scalars, documents, shares) that share the same store.

use crate::calendar::{local_to_utc, ExchangeCalendar, TradingCalendar};
use crate::clock::{Clock, SystemClock};
use crate::config::{CacheConfig, MaxAgeConfig};
use crate::context::CacheContext;
use crate::domain::{
    Bar, CacheKey, Interval, MetaValue, Metadata, Payload, Record, SharesPoint, SharesTable,
};
use crate::error::{CacheError, Result};
use crate::provider::MarketDataProvider;
use crate::reconcile::{verify_interval, VerifyOptions, VerifyReport};
use crate::series::{HistoryRequest, SeriesSynchronizer};
use crate::staleness::{is_stale, is_stale_with_calendar};
use crate::store::RecordStore;
use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};
use rayon::prelude::*;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

pub const META_LAST_CHECK: &str = "LastCheck";
pub const META_FETCH_DATE: &str = "FetchDate";

const EXCHANGE_RECORD: &str = "exchange";
const EXCHANGE_FIELD: &str = "exchangeName";
const INFO_RECORD: &str = "info";
const SHARES_RECORD: &str = "shares";

/// Default look-back for shares outstanding (about 18 months).
const SHARES_DEFAULT_DAYS: i64 = 548;

/// A refreshed document losing more than this many keys, and more than
/// this share of them, is treated as a bad fetch.
const INFO_LOSS_KEYS: i64 = 10;
const INFO_LOSS_FRACTION: f64 = 0.1;

type SyncHandle = Arc<Mutex<SeriesSynchronizer>>;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Verification result for one symbol across its cached intervals.
#[derive(Debug, Clone, Default)]
pub struct SymbolVerification {
    pub symbol: String,
    pub reports: Vec<(Interval, VerifyReport)>,
    /// At least one interval was corrected and re-fetched.
    pub corrected: bool,
}

impl SymbolVerification {
    /// Consistent and untouched. A corrected symbol reports `false` so the
    /// caller gets a chance to review before trusting it.
    pub fn is_consistent(&self) -> bool {
        !self.corrected && self.reports.iter().all(|(_, r)| r.is_consistent())
    }
}

#[derive(Debug, Clone, Default)]
pub struct VerifySummary {
    pub consistent: Vec<String>,
    pub corrected: Vec<String>,
    pub diverged: Vec<String>,
    pub failed: Vec<(String, String)>,
    /// Set when `halt_on_fail` stopped the run at this symbol.
    pub halted_at: Option<String>,
}

impl VerifySummary {
    pub fn all_consistent(&self) -> bool {
        self.diverged.is_empty() && self.failed.is_empty() && self.halted_at.is_none()
    }

    fn record(&mut self, symbol: String, outcome: SymbolOutcome) {
        match outcome {
            SymbolOutcome::Consistent => self.consistent.push(symbol),
            SymbolOutcome::Corrected => self.corrected.push(symbol),
            SymbolOutcome::Diverged => self.diverged.push(symbol),
            SymbolOutcome::Failed(e) => self.failed.push((symbol, e)),
        }
    }
}

enum SymbolOutcome {
    Consistent,
    Corrected,
    Diverged,
    Failed(String),
}

impl SymbolOutcome {
    fn is_failure(&self) -> bool {
        matches!(self, SymbolOutcome::Diverged | SymbolOutcome::Failed(_))
    }
}

pub struct MarketCache {
    ctx: CacheContext,
    max_age: MaxAgeConfig,
    series: Mutex<HashMap<(String, Interval), SyncHandle>>,
}

impl MarketCache {
    pub fn new(
        config: &CacheConfig,
        provider: Arc<dyn MarketDataProvider>,
        calendar: Arc<dyn TradingCalendar>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let store = Arc::new(RecordStore::new(config.store_config(), clock.clone()));
        Self {
            ctx: CacheContext {
                store,
                provider,
                calendar,
                clock,
            },
            max_age: config.max_age,
            series: Mutex::new(HashMap::new()),
        }
    }

    /// Wall clock and the configured exchange calendar.
    pub fn open(config: &CacheConfig, provider: Arc<dyn MarketDataProvider>) -> Self {
        let calendar: Arc<ExchangeCalendar> = Arc::new(config.calendar());
        Self::new(config, provider, calendar, Arc::new(SystemClock))
    }

    pub fn store(&self) -> &RecordStore {
        &self.ctx.store
    }

    pub fn context(&self) -> &CacheContext {
        &self.ctx
    }

    fn synchronizer(&self, symbol: &str, interval: Interval, exchange: &str) -> Result<SyncHandle> {
        let mut series = lock(&self.series);
        let key = (symbol.to_uppercase(), interval);
        if let Some(handle) = series.get(&key) {
            return Ok(handle.clone());
        }
        let sync = SeriesSynchronizer::new(self.ctx.clone(), symbol, interval, exchange)?;
        let handle = Arc::new(Mutex::new(sync));
        series.insert(key, handle.clone());
        Ok(handle)
    }

    // ── Exchange ────────────────────────────────────────────────────

    /// Exchange code for `symbol`, cached without expiry.
    pub fn exchange(&self, symbol: &str) -> Result<String> {
        let key = CacheKey::new(symbol, EXCHANGE_RECORD)?;
        if let Some(Record {
            payload: Payload::Scalar(value),
            ..
        }) = self.ctx.store.get(&key)?
        {
            if let Some(code) = value.as_str() {
                return Ok(code.to_string());
            }
        }
        let value = self
            .ctx
            .provider
            .fetch_scalar(key.symbol(), EXCHANGE_FIELD)
            .map_err(CacheError::provider(key.symbol(), "exchange"))?;
        let code = value
            .as_str()
            .ok_or_else(|| {
                CacheError::InvalidArgument(format!("{symbol}: exchange reported as non-text {value}"))
            })?
            .to_string();
        let metadata = Metadata::from([(
            META_FETCH_DATE.to_string(),
            MetaValue::Timestamp(self.ctx.clock.now()),
        )]);
        self.ctx
            .store
            .put(&key, Some(Payload::Scalar(value)), None, Some(metadata))?;
        tracing::debug!(symbol = key.symbol(), exchange = %code, "cached exchange");
        Ok(code)
    }

    /// UTC instant of local midnight on `date` at the symbol's exchange.
    pub fn local_midnight(&self, symbol: &str, date: NaiveDate) -> Result<DateTime<Utc>> {
        let exchange = self.exchange(symbol)?;
        let tz = self.ctx.calendar.timezone(&exchange)?;
        local_to_utc(tz, date, NaiveTime::MIN)
    }

    // ── Price history ───────────────────────────────────────────────

    pub fn history(&self, symbol: &str, req: &HistoryRequest) -> Result<Vec<Bar>> {
        let exchange = self.exchange(symbol)?;
        let handle = self.synchronizer(symbol, req.interval, &exchange)?;
        let mut sync = lock(&handle);
        sync.history(req)
    }

    /// [`history`](Self::history) over local trading dates, `end` exclusive.
    pub fn history_between_dates(
        &self,
        symbol: &str,
        interval: Interval,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<Bar>> {
        let req = HistoryRequest::new(
            interval,
            self.local_midnight(symbol, start)?,
            self.local_midnight(symbol, end)?,
        );
        self.history(symbol, &req)
    }

    /// Intervals with a cached series for `symbol`.
    pub fn cached_intervals(&self, symbol: &str) -> Result<Vec<Interval>> {
        let names: Vec<String> = self
            .ctx
            .store
            .entries(symbol)?
            .into_iter()
            .map(|e| e.name)
            .collect();
        Ok(Interval::ALL
            .into_iter()
            .filter(|i| names.iter().any(|n| *n == i.cache_name()))
            .collect())
    }

    // ── Verification ────────────────────────────────────────────────

    pub fn verify(&self, symbol: &str, opts: &VerifyOptions) -> Result<bool> {
        Ok(self.verify_symbol(symbol, opts)?.is_consistent())
    }

    /// Verify every cached interval, daily first.
    ///
    /// The daily series is first brought up to date from its first cached
    /// row so recent dividends and final rows take part. A corrected interval
    /// is re-fetched at once and must then verify clean; verification stops
    /// there, and also after a daily divergence when not correcting, so each
    /// problem is seen before the next one is touched.
    pub fn verify_symbol(&self, symbol: &str, opts: &VerifyOptions) -> Result<SymbolVerification> {
        let exchange = self.exchange(symbol)?;
        let cached = self.cached_intervals(symbol)?;
        let mut result = SymbolVerification {
            symbol: symbol.to_uppercase(),
            ..SymbolVerification::default()
        };
        if cached.contains(&Interval::Day1) {
            self.refresh_daily(symbol, &exchange)?;
        }

        for interval in Interval::verification_order().filter(|i| cached.contains(i)) {
            let handle = self.synchronizer(symbol, interval, &exchange)?;
            let mut sync = lock(&handle);
            let cached_end = cached_slot_end(&mut sync)?;
            let report = verify_interval(&mut sync, opts)?;

            if let Some(from) = report.corrected_from {
                if let Some(end) = cached_end.filter(|end| from < *end) {
                    sync.sync(from, end, None, false)?;
                }
                let recheck = verify_interval(
                    &mut sync,
                    &VerifyOptions {
                        correct: false,
                        ..*opts
                    },
                )?;
                if let Some(first) = recheck.divergences.first() {
                    return Err(sync.consistency(format!(
                        "re-fetched rows from {from} still diverge ({first}); \
                         a backporting bug in the synchronizer"
                    )));
                }
                tracing::info!(symbol, %interval, %from, "corrected and re-verified");
                result.corrected = true;
                result.reports.push((interval, report));
                break;
            }

            let daily_diverged = interval == Interval::Day1 && !report.is_consistent();
            result.reports.push((interval, report));
            if daily_diverged {
                break;
            }
        }
        Ok(result)
    }

    /// Sync the daily series from its first cached row up to now, refetching
    /// rows whose session has closed since they were fetched.
    fn refresh_daily(&self, symbol: &str, exchange: &str) -> Result<()> {
        let handle = self.synchronizer(symbol, Interval::Day1, exchange)?;
        let mut sync = lock(&handle);
        let now = self.ctx.clock.now();
        if let Some(first) = sync.table()?.first_timestamp().filter(|first| *first < now) {
            sync.sync(first, now, None, true)?;
        }
        Ok(())
    }

    /// Verify every cached symbol in sorted order, optionally starting at
    /// `resume_from`. With `halt_on_fail` symbols run one at a time and the
    /// run stops at the first divergence or error; otherwise they run in
    /// parallel.
    pub fn verify_all(
        &self,
        opts: &VerifyOptions,
        resume_from: Option<&str>,
        halt_on_fail: bool,
    ) -> Result<VerifySummary> {
        let resume = resume_from.map(str::to_uppercase);
        let symbols: Vec<String> = self
            .ctx
            .store
            .symbols()?
            .into_iter()
            .filter(|s| resume.as_deref().map_or(true, |r| s.as_str() >= r))
            .collect();
        tracing::info!(symbols = symbols.len(), halt_on_fail, "verifying cache");

        let mut summary = VerifySummary::default();
        if halt_on_fail {
            for symbol in symbols {
                let outcome = self.verify_one(&symbol, opts);
                let halt = outcome.is_failure();
                summary.record(symbol.clone(), outcome);
                if halt {
                    summary.halted_at = Some(symbol);
                    break;
                }
            }
        } else {
            let outcomes: Vec<(String, SymbolOutcome)> = symbols
                .into_par_iter()
                .map(|symbol| {
                    let outcome = self.verify_one(&symbol, opts);
                    (symbol, outcome)
                })
                .collect();
            for (symbol, outcome) in outcomes {
                summary.record(symbol, outcome);
            }
        }
        Ok(summary)
    }

    fn verify_one(&self, symbol: &str, opts: &VerifyOptions) -> SymbolOutcome {
        let first = match self.verify(symbol, opts) {
            Ok(ok) => ok,
            Err(e) => {
                tracing::warn!(symbol, error = %e, "verification failed");
                return SymbolOutcome::Failed(e.to_string());
            }
        };
        match (first, opts.correct) {
            (true, _) => SymbolOutcome::Consistent,
            (false, false) => SymbolOutcome::Diverged,
            (false, true) => match self.verify(symbol, opts) {
                Ok(true) => SymbolOutcome::Corrected,
                Ok(false) => SymbolOutcome::Diverged,
                Err(e) => SymbolOutcome::Failed(e.to_string()),
            },
        }
    }

    // ── Scalars and documents ───────────────────────────────────────

    /// A quote-level scalar, refreshed when older than `max_age` or when a
    /// session has opened or closed since it was fetched.
    pub fn scalar(&self, symbol: &str, field: &str, max_age: Option<Duration>) -> Result<MetaValue> {
        if is_managed_record(field) || crate::store::packing::unit_for(field).is_some() {
            return Err(CacheError::InvalidArgument(format!(
                "'{field}' is kept by the cache itself and cannot be fetched as a scalar"
            )));
        }
        let key = CacheKey::new(symbol, field)?;
        let max_age = max_age.unwrap_or_else(|| self.max_age.scalar());
        let now = self.ctx.clock.now();

        if let Some(record) = self.ctx.store.get(&key)? {
            if let (Payload::Scalar(value), Some(fetched)) = (&record.payload, record.meta_timestamp(META_FETCH_DATE)) {
                if !self.is_stale_for_symbol(key.symbol(), fetched, max_age, now)? {
                    return Ok(value.clone());
                }
            }
        }

        let value = self
            .ctx
            .provider
            .fetch_scalar(key.symbol(), field)
            .map_err(CacheError::provider(key.symbol(), "fetch_scalar"))?;
        let metadata = Metadata::from([(META_FETCH_DATE.to_string(), MetaValue::Timestamp(now))]);
        self.ctx
            .store
            .put(&key, Some(Payload::Scalar(value.clone())), None, Some(metadata))?;
        Ok(value)
    }

    fn is_stale_for_symbol(
        &self,
        symbol: &str,
        last_fetch: DateTime<Utc>,
        max_age: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let exchange = self.exchange(symbol)?;
        match is_stale_with_calendar(last_fetch, max_age, now, Some((self.ctx.calendar.as_ref(), &exchange))) {
            Err(CacheError::UnknownExchange(code)) => {
                tracing::warn!(symbol, exchange = %code, "no calendar for exchange, using plain max-age");
                Ok(is_stale(last_fetch, max_age, now))
            }
            other => other,
        }
    }

    /// The `info` document. A refresh that loses a large part of the
    /// previous document is discarded and only `LastCheck` moves.
    pub fn info(&self, symbol: &str, max_age: Option<Duration>) -> Result<Value> {
        let key = CacheKey::new(symbol, INFO_RECORD)?;
        let max_age = max_age.unwrap_or_else(|| self.max_age.info());
        if max_age < Duration::zero() {
            return Err(CacheError::InvalidArgument(format!("negative max_age {max_age}")));
        }
        let now = self.ctx.clock.now();

        let cached = match self.ctx.store.get(&key)? {
            Some(Record {
                payload: Payload::Document(doc),
                metadata,
                ..
            }) => Some((doc, metadata)),
            Some(other) => {
                return Err(CacheError::corruption(
                    self.ctx.store.root().join(key.symbol()).join(key.name()),
                    "document",
                    other.payload.kind(),
                ))
            }
            None => None,
        };

        if let Some((doc, metadata)) = &cached {
            let checked = [META_FETCH_DATE, META_LAST_CHECK]
                .iter()
                .filter_map(|f| metadata.get(*f).and_then(MetaValue::as_timestamp))
                .max();
            if checked.is_some_and(|t| !is_stale(t, max_age, now)) {
                return Ok(doc.clone());
            }
        }

        let fresh = self
            .ctx
            .provider
            .fetch_document(key.symbol(), INFO_RECORD)
            .map_err(CacheError::provider(key.symbol(), "info"))?;

        if let Some((doc, _)) = cached {
            if lost_too_much(&doc, &fresh) {
                tracing::warn!(
                    symbol = key.symbol(),
                    cached_keys = key_count(&doc),
                    fetched_keys = key_count(&fresh),
                    "refreshed info lost most of its fields, keeping cached copy"
                );
                self.ctx
                    .store
                    .set_metadata_field(&key, META_LAST_CHECK, MetaValue::Timestamp(now))?;
                return Ok(doc);
            }
        }

        let metadata = Metadata::from([
            (META_FETCH_DATE.to_string(), MetaValue::Timestamp(now)),
            (META_LAST_CHECK.to_string(), MetaValue::Timestamp(now)),
        ]);
        self.ctx
            .store
            .put(&key, Some(Payload::Document(fresh.clone())), None, Some(metadata))?;
        Ok(fresh)
    }

    /// Any other document. `max_age: None` caches it indefinitely.
    pub fn document(&self, symbol: &str, name: &str, max_age: Option<Duration>) -> Result<Value> {
        if name == INFO_RECORD {
            return self.info(symbol, max_age);
        }
        if is_managed_record(name) {
            return Err(CacheError::InvalidArgument(format!(
                "'{name}' is kept by the cache itself and cannot be fetched as a document"
            )));
        }
        let key = CacheKey::new(symbol, name)?;
        let now = self.ctx.clock.now();
        if let Some(record) = self.ctx.store.get(&key)? {
            let fresh = match (max_age, record.meta_timestamp(META_FETCH_DATE)) {
                (None, _) => true,
                (Some(age), Some(fetched)) => !is_stale(fetched, age, now),
                (Some(_), None) => false,
            };
            if let (true, Payload::Document(doc)) = (fresh, &record.payload) {
                return Ok(doc.clone());
            }
        }

        let doc = self
            .ctx
            .provider
            .fetch_document(key.symbol(), name)
            .map_err(CacheError::provider(key.symbol(), "fetch_document"))?;
        let metadata = Metadata::from([(META_FETCH_DATE.to_string(), MetaValue::Timestamp(now))]);
        self.ctx
            .store
            .put(&key, Some(Payload::Document(doc.clone())), None, Some(metadata))?;
        Ok(doc)
    }

    // ── Shares outstanding ──────────────────────────────────────────

    /// Shares outstanding with `start <= date < end`. Defaults to the last
    /// 18 months up to today at the exchange.
    pub fn shares(
        &self,
        symbol: &str,
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
        max_age: Option<Duration>,
    ) -> Result<Vec<SharesPoint>> {
        let key = CacheKey::new(symbol, SHARES_RECORD)?;
        let max_age = max_age.unwrap_or_else(|| self.max_age.shares());
        let now = self.ctx.clock.now();
        let tz = self.ctx.calendar.timezone(&self.exchange(symbol)?)?;
        let today = now.with_timezone(&tz).date_naive();

        let end = end.unwrap_or(today);
        let start = start.unwrap_or(end - Duration::days(SHARES_DEFAULT_DAYS));
        if start >= end {
            return Err(CacheError::InvalidArgument(format!(
                "shares range start {start} is not before end {end}"
            )));
        }
        // Reports for dates after today cannot exist yet.
        let fetch_limit = today + Duration::days(1);

        let cached = match self.ctx.store.get(&key)? {
            Some(Record {
                payload: Payload::Shares(table),
                ..
            }) => Some(table),
            Some(other) => {
                return Err(CacheError::corruption(
                    self.ctx.store.root().join(key.symbol()).join(key.name()),
                    "shares table",
                    other.payload.kind(),
                ))
            }
            None => None,
        };

        let fetch = |from: NaiveDate, to: NaiveDate| -> Result<Vec<SharesPoint>> {
            tracing::debug!(symbol = key.symbol(), %from, %to, "fetching shares outstanding");
            self.ctx
                .provider
                .fetch_shares_outstanding(key.symbol(), from, to)
                .map_err(CacheError::provider(key.symbol(), "fetch_shares_outstanding"))
        };

        let (table, changed) = match cached {
            None => {
                let to = end.min(fetch_limit);
                let points = fetch(start, to)?;
                (
                    SharesTable {
                        points,
                        covered_start: start,
                        covered_end: to,
                    },
                    true,
                )
            }
            Some(mut table) => {
                let mut changed = false;
                let mut points: BTreeMap<NaiveDate, u64> =
                    table.points.iter().map(|p| (p.date, p.shares)).collect();
                if start < table.covered_start {
                    for p in fetch(start, table.covered_start)? {
                        points.entry(p.date).or_insert(p.shares);
                    }
                    table.covered_start = start;
                    changed = true;
                }
                let to = end.min(fetch_limit);
                if to > table.covered_end && (end - table.covered_end) > max_age {
                    for p in fetch(table.covered_end, to)? {
                        points.insert(p.date, p.shares);
                    }
                    table.covered_end = to;
                    changed = true;
                }
                table.points = points
                    .into_iter()
                    .map(|(date, shares)| SharesPoint { date, shares })
                    .collect();
                (table, changed)
            }
        };

        if changed {
            let metadata = Metadata::from([(META_FETCH_DATE.to_string(), MetaValue::Timestamp(now))]);
            self.ctx
                .store
                .put(&key, Some(Payload::Shares(table.clone())), None, Some(metadata))?;
        }
        Ok(table.between(start, end))
    }
}

/// End of the slot holding the newest cached row.
fn cached_slot_end(sync: &mut SeriesSynchronizer) -> Result<Option<DateTime<Utc>>> {
    let Some(last) = sync.table()?.last_timestamp() else {
        return Ok(None);
    };
    let slots = sync.slots(last, last + Duration::seconds(1))?;
    Ok(slots
        .iter()
        .find(|s| s.start == last)
        .or(slots.last())
        .map(|s| s.end.max(last + Duration::seconds(1))))
}

/// Record names the façade manages with their own payload shapes.
fn is_managed_record(name: &str) -> bool {
    matches!(name, EXCHANGE_RECORD | INFO_RECORD | SHARES_RECORD)
        || Interval::from_cache_name(name).is_some()
        || crate::store::packing::is_unit(name)
}

fn key_count(doc: &Value) -> i64 {
    doc.as_object().map_or(0, |m| m.len() as i64)
}

fn lost_too_much(old: &Value, new: &Value) -> bool {
    let (old_n, new_n) = (key_count(old), key_count(new));
    if old_n == 0 {
        return false;
    }
    let diff = new_n - old_n;
    diff < -INFO_LOSS_KEYS && (diff as f64 / old_n as f64) < -INFO_LOSS_FRACTION
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(n: usize) -> Value {
        Value::Object((0..n).map(|i| (format!("k{i}"), json!(i))).collect())
    }

    #[test]
    fn info_loss_needs_both_thresholds() {
        // 20 of 100 keys gone: over both limits.
        assert!(lost_too_much(&doc(100), &doc(80)));
        // 10 keys is not more than 10.
        assert!(!lost_too_much(&doc(100), &doc(90)));
        // 11 of 200 keys is under 10%.
        assert!(!lost_too_much(&doc(200), &doc(189)));
        // Growth is always fine.
        assert!(!lost_too_much(&doc(10), &doc(50)));
        assert!(!lost_too_much(&json!(null), &doc(1)));
    }

    #[test]
    fn corrected_symbol_is_not_consistent() {
        let v = SymbolVerification {
            symbol: "AAPL".into(),
            reports: vec![(Interval::Day1, VerifyReport::default())],
            corrected: true,
        };
        assert!(!v.is_consistent());
        let v = SymbolVerification {
            corrected: false,
            ..v
        };
        assert!(v.is_consistent());
    }
}
