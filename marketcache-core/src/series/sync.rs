//! Incremental synchronization of one (symbol, interval) price table.
//!
//! On each request the synchronizer lays the trading calendar over the
//! requested range, finds slots that are missing or stale, fetches only the
//! contiguous runs of those slots, and merges them in. All runs are staged
//! before anything is merged, so a provider failure leaves the cached table
//! exactly as it was.

use super::adjust::{self, AdjustOptions};
use super::merge;
use crate::calendar::{slot_index, slots_between, Slot};
use crate::context::CacheContext;
use crate::domain::{Bar, CacheKey, Interval, MetaValue, Metadata, Payload, PriceRow, PriceTable, Record};
use crate::error::{CacheError, Result};
use crate::provider::RawRow;
use crate::staleness::{effective_max_age, range_in_future, RowFreshness};
use chrono::{DateTime, Duration, Utc};
use std::ops::Range;

pub const META_LAST_FETCH: &str = "LastFetch";
pub const META_LAST_CORRECTION: &str = "LastCorrection";
pub const META_EXCHANGE: &str = "Exchange";

/// How far past the range start to look for a first session when deciding
/// whether the whole range is still in the future.
const FUTURE_LOOKAHEAD_DAYS: i64 = 14;

/// A price-history request. `end` is exclusive.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryRequest {
    pub interval: Interval,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub max_age: Option<Duration>,
    pub trigger_at_market_close: bool,
    pub adjust: AdjustOptions,
}

impl HistoryRequest {
    pub fn new(interval: Interval, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            interval,
            start,
            end,
            max_age: None,
            trigger_at_market_close: false,
            adjust: AdjustOptions::default(),
        }
    }

    pub fn max_age(mut self, max_age: Duration) -> Self {
        self.max_age = Some(max_age);
        self
    }

    pub fn trigger_at_market_close(mut self, on: bool) -> Self {
        self.trigger_at_market_close = on;
        self
    }

    pub fn adjust(mut self, adjust: AdjustOptions) -> Self {
        self.adjust = adjust;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncState {
    Empty,
    Cached {
        first: DateTime<Utc>,
        last: DateTime<Utc>,
    },
    Syncing,
    /// The last fetch failed with nothing cached.
    Error(String),
}

impl SyncState {
    fn of(table: &PriceTable) -> Self {
        match (table.first_timestamp(), table.last_timestamp()) {
            (Some(first), Some(last)) => SyncState::Cached { first, last },
            _ => SyncState::Empty,
        }
    }
}

/// What a sync pass did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// The range has not started trading yet; nothing was fetched.
    Future,
    /// Every slot was present and fresh.
    Fresh { first_slot: Option<DateTime<Utc>> },
    Fetched {
        first_slot: Option<DateTime<Utc>>,
        runs: usize,
        rows: usize,
    },
}

pub struct SeriesSynchronizer {
    ctx: CacheContext,
    key: CacheKey,
    interval: Interval,
    exchange: String,
    loaded: Option<(PriceTable, Metadata)>,
    state: SyncState,
}

impl SeriesSynchronizer {
    pub fn new(ctx: CacheContext, symbol: &str, interval: Interval, exchange: &str) -> Result<Self> {
        Ok(Self {
            ctx,
            key: CacheKey::history(symbol, interval)?,
            interval,
            exchange: exchange.to_string(),
            loaded: None,
            state: SyncState::Empty,
        })
    }

    pub fn symbol(&self) -> &str {
        self.key.symbol()
    }

    pub fn interval(&self) -> Interval {
        self.interval
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn state(&self) -> &SyncState {
        &self.state
    }

    pub(crate) fn context(&self) -> &CacheContext {
        &self.ctx
    }

    /// The cached table, loaded from the store on first use.
    pub fn table(&mut self) -> Result<&PriceTable> {
        self.load()?;
        Ok(self.loaded.as_ref().map(|(t, _)| t).unwrap_or_else(|| empty_table()))
    }

    fn load(&mut self) -> Result<()> {
        if self.loaded.is_some() {
            return Ok(());
        }
        let (table, metadata) = match self.ctx.store.get(&self.key)? {
            Some(Record {
                payload: Payload::Table(table),
                metadata,
                ..
            }) => (table, metadata),
            Some(other) => {
                return Err(CacheError::corruption(
                    self.ctx.store.root().join(self.key.symbol()).join(self.key.name()),
                    "price table",
                    other.payload.kind(),
                ))
            }
            None => (PriceTable::new(), Metadata::new()),
        };
        tracing::debug!(key = %self.key, rows = table.len(), "loaded cached series");
        self.state = SyncState::of(&table);
        self.loaded = Some((table, metadata));
        Ok(())
    }

    pub(crate) fn consistency(&self, detail: String) -> CacheError {
        CacheError::Consistency {
            symbol: self.key.symbol().to_string(),
            interval: self.interval.to_string(),
            detail,
        }
    }

    /// Calendar slots overlapping `[start, end)`.
    pub fn slots(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Vec<Slot>> {
        slots_between(self.ctx.calendar.as_ref(), &self.exchange, self.interval, start, end)
    }

    pub fn freshness(&self, max_age: Duration, trigger_at_market_close: bool) -> Result<RowFreshness> {
        Ok(RowFreshness {
            max_age,
            provider_lag: self.ctx.calendar.provider_lag(&self.exchange)?,
            trigger_at_market_close,
        })
    }

    /// Serve a request: sync the range, then slice and adjust.
    pub fn history(&mut self, req: &HistoryRequest) -> Result<Vec<Bar>> {
        if req.interval != self.interval {
            return Err(CacheError::InvalidArgument(format!(
                "request for {} sent to the {} synchronizer",
                req.interval, self.interval
            )));
        }
        let first_slot = match self.sync(req.start, req.end, req.max_age, req.trigger_at_market_close)? {
            SyncOutcome::Future => return Ok(Vec::new()),
            SyncOutcome::Fresh { first_slot } | SyncOutcome::Fetched { first_slot, .. } => first_slot,
        };
        let from = first_slot.map_or(req.start, |s| s.min(req.start));
        let table = self.table()?;
        Ok(adjust::adjust(table.range(from, req.end), req.adjust))
    }

    /// Bring `[start, end)` up to date with the provider.
    pub fn sync(
        &mut self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        max_age: Option<Duration>,
        trigger_at_market_close: bool,
    ) -> Result<SyncOutcome> {
        if end <= start {
            return Err(CacheError::InvalidArgument(format!(
                "empty range: start {start} is not before end {end}"
            )));
        }
        let now = self.ctx.clock.now();
        if start > now || self.range_in_future(start, now)? {
            tracing::debug!(key = %self.key, %start, "range is in the future, nothing to fetch");
            return Ok(SyncOutcome::Future);
        }

        self.load()?;
        let table = self.table()?.clone();

        // Keep the cached range contiguous: a request beyond either end also
        // covers the gap back to the cached rows.
        let (mut sync_start, mut sync_end) = (start, end);
        if let (Some(first), Some(last)) = (table.first_timestamp(), table.last_timestamp()) {
            if sync_start > last {
                sync_start = last;
            }
            if sync_end <= first {
                sync_end = first;
            }
        }

        let slots: Vec<Slot> = self
            .slots(sync_start, sync_end)?
            .into_iter()
            .filter(|s| s.open <= now)
            .collect();
        let first_slot = self.slots(start, end)?.first().map(|s| s.start);

        let freshness = self.freshness(
            effective_max_age(max_age, self.interval, Some(start), now),
            trigger_at_market_close,
        )?;
        let needed: Vec<bool> = slots
            .iter()
            .map(|slot| match table.get(slot.start) {
                None => true,
                Some(row) => freshness.is_stale(slot, row.fetched_at, now),
            })
            .collect();
        let runs = contiguous_runs(&needed);
        if runs.is_empty() {
            return Ok(SyncOutcome::Fresh { first_slot });
        }

        let previous = std::mem::replace(&mut self.state, SyncState::Syncing);
        match self.fetch_and_merge(&table, &slots, &runs, now) {
            Ok(rows) => Ok(SyncOutcome::Fetched {
                first_slot,
                runs: runs.len(),
                rows,
            }),
            Err(e) => {
                self.state = match previous {
                    SyncState::Cached { .. } => previous,
                    _ => SyncState::Error(e.to_string()),
                };
                Err(e)
            }
        }
    }

    fn range_in_future(&self, start: DateTime<Utc>, now: DateTime<Utc>) -> Result<bool> {
        let tz = self.ctx.calendar.timezone(&self.exchange)?;
        let first_day = start.with_timezone(&tz).date_naive();
        let sessions = self.ctx.calendar.schedule(
            &self.exchange,
            first_day,
            first_day + Duration::days(FUTURE_LOOKAHEAD_DAYS),
        )?;
        // Sessions starting before `start` belong to earlier slots.
        let upcoming: Vec<_> = sessions.into_iter().filter(|s| s.close > start).collect();
        Ok(range_in_future(&upcoming, now))
    }

    fn fetch_and_merge(
        &mut self,
        table: &PriceTable,
        slots: &[Slot],
        runs: &[Range<usize>],
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let mut staged = Vec::new();
        for run in runs {
            let run_slots = &slots[run.clone()];
            let (Some(first), Some(last)) = (run_slots.first(), run_slots.last()) else {
                continue;
            };
            tracing::info!(
                key = %self.key,
                start = %first.start,
                end = %last.end,
                slots = run_slots.len(),
                "fetching missing or stale slots"
            );
            let fetched = self
                .ctx
                .provider
                .fetch_series(self.key.symbol(), self.interval, first.start, last.end)
                .map_err(CacheError::provider(self.key.symbol(), "fetch_series"))?;
            staged.extend(self.snap_to_slots(run_slots, fetched, now)?);
        }

        let fetched_rows = staged.len();
        let mut merged = merge::merge(table, staged).map_err(|dups| {
            self.consistency(format!("duplicate timestamps after merge: {:?}", dups.0))
        })?;
        adjust::recompute_factors(merged.rows_mut());

        let mut metadata = self.loaded.as_ref().map(|(_, m)| m.clone()).unwrap_or_default();
        metadata.insert(META_LAST_FETCH.to_string(), MetaValue::Timestamp(now));
        metadata.insert(META_EXCHANGE.to_string(), MetaValue::Text(self.exchange.clone()));
        self.persist(merged, metadata)?;
        tracing::debug!(key = %self.key, rows = fetched_rows, "merged fetched rows");
        Ok(fetched_rows)
    }

    /// Put each provider row on the slot containing it and fill the rest of
    /// the run with "known no trade" rows.
    pub(crate) fn snap_to_slots(
        &self,
        run_slots: &[Slot],
        rows: Vec<RawRow>,
        fetched_at: DateTime<Utc>,
    ) -> Result<Vec<PriceRow>> {
        let snapped = self.assign_slots(run_slots, rows)?;
        Ok(run_slots
            .iter()
            .zip(snapped)
            .map(|(slot, row)| match row {
                Some(row) => row.into_price_row(slot.start, fetched_at),
                None => PriceRow::no_trade(slot.start, fetched_at),
            })
            .collect())
    }

    /// Slot assignment without filling; two rows on one slot is an error.
    pub(crate) fn assign_slots(&self, slots: &[Slot], rows: Vec<RawRow>) -> Result<Vec<Option<RawRow>>> {
        let mut by_slot: Vec<Option<RawRow>> = vec![None; slots.len()];
        let mut collisions = Vec::new();
        for row in rows {
            match slot_index(slots, row.timestamp, self.interval) {
                Some(i) if by_slot[i].is_some() => collisions.push(slots[i].start),
                Some(i) => by_slot[i] = Some(row),
                None => {
                    tracing::debug!(key = %self.key, timestamp = %row.timestamp, "discarding row outside fetched slots");
                }
            }
        }
        if !collisions.is_empty() {
            return Err(self.consistency(format!(
                "provider returned more than one row for slot(s) {collisions:?}"
            )));
        }
        Ok(by_slot)
    }

    /// Drop cached rows at or after `from`, recompute factors, persist and
    /// stamp `LastCorrection`. A table left with no rows is deleted.
    /// Returns how many rows were dropped.
    pub fn discard_from(&mut self, from: DateTime<Utc>) -> Result<usize> {
        self.load()?;
        let now = self.ctx.clock.now();
        let Some((table, metadata)) = self.loaded.as_ref() else {
            return Ok(0);
        };
        let mut table = table.clone();
        let mut metadata = metadata.clone();
        let removed = table.truncate_from(from);
        if table.is_empty() {
            tracing::warn!(key = %self.key, %from, removed, "discarded every cached row");
            self.ctx.store.delete(&self.key)?;
            self.state = SyncState::Empty;
            self.loaded = Some((table, Metadata::new()));
            return Ok(removed);
        }
        adjust::recompute_factors(table.rows_mut());
        metadata.insert(META_LAST_CORRECTION.to_string(), MetaValue::Timestamp(now));
        tracing::warn!(key = %self.key, %from, removed, "discarded diverging rows");
        self.persist(table, metadata)?;
        Ok(removed)
    }

    /// Set one metadata field on the cached series without touching rows.
    pub fn stamp(&mut self, field: &str, value: MetaValue) -> Result<()> {
        self.load()?;
        let Some((table, metadata)) = self.loaded.as_mut() else {
            return Ok(());
        };
        if table.is_empty() {
            return Ok(());
        }
        self.ctx.store.set_metadata_field(&self.key, field, value.clone())?;
        metadata.insert(field.to_string(), value);
        Ok(())
    }

    fn persist(&mut self, table: PriceTable, metadata: Metadata) -> Result<()> {
        self.ctx.store.put(
            &self.key,
            Some(Payload::Table(table.clone())),
            None,
            Some(metadata.clone()),
        )?;
        self.state = SyncState::of(&table);
        self.loaded = Some((table, metadata));
        Ok(())
    }
}

fn empty_table() -> &'static PriceTable {
    static EMPTY: std::sync::OnceLock<PriceTable> = std::sync::OnceLock::new();
    EMPTY.get_or_init(PriceTable::new)
}

/// Maximal runs of consecutive `true` entries.
fn contiguous_runs(flags: &[bool]) -> Vec<Range<usize>> {
    let mut runs = Vec::new();
    let mut start = None;
    for (i, &flag) in flags.iter().enumerate() {
        match (flag, start) {
            (true, None) => start = Some(i),
            (false, Some(s)) => {
                runs.push(s..i);
                start = None;
            }
            _ => {}
        }
    }
    if let Some(s) = start {
        runs.push(s..flags.len());
    }
    runs
}
