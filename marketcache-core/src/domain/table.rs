//! Ordered tables: the price series and the shares-outstanding series.

use super::bar::PriceRow;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Rows whose timestamps are not strictly increasing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnorderedRows {
    pub offending: Vec<DateTime<Utc>>,
}

/// A price series with strictly increasing, unique timestamps.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PriceTable {
    rows: Vec<PriceRow>,
}

impl PriceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a table from rows that are already sorted. Returns the offending
    /// timestamps when any row does not come strictly after its predecessor.
    pub fn from_sorted(rows: Vec<PriceRow>) -> Result<Self, UnorderedRows> {
        let offending: Vec<_> = rows
            .windows(2)
            .filter(|w| w[1].timestamp <= w[0].timestamp)
            .map(|w| w[1].timestamp)
            .collect();
        if offending.is_empty() {
            Ok(Self { rows })
        } else {
            Err(UnorderedRows { offending })
        }
    }

    pub fn rows(&self) -> &[PriceRow] {
        &self.rows
    }

    pub(crate) fn rows_mut(&mut self) -> &mut [PriceRow] {
        &mut self.rows
    }

    pub fn into_rows(self) -> Vec<PriceRow> {
        self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn first_timestamp(&self) -> Option<DateTime<Utc>> {
        self.rows.first().map(|r| r.timestamp)
    }

    pub fn last_timestamp(&self) -> Option<DateTime<Utc>> {
        self.rows.last().map(|r| r.timestamp)
    }

    pub fn get(&self, timestamp: DateTime<Utc>) -> Option<&PriceRow> {
        self.rows
            .binary_search_by_key(&timestamp, |r| r.timestamp)
            .ok()
            .map(|i| &self.rows[i])
    }

    /// Rows with `start <= timestamp < end`.
    pub fn range(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> &[PriceRow] {
        let lo = self.rows.partition_point(|r| r.timestamp < start);
        let hi = self.rows.partition_point(|r| r.timestamp < end);
        &self.rows[lo..hi.max(lo)]
    }

    /// Drop every row at or after `from`. Returns how many rows were removed.
    pub fn truncate_from(&mut self, from: DateTime<Utc>) -> usize {
        let keep = self.rows.partition_point(|r| r.timestamp < from);
        let removed = self.rows.len() - keep;
        self.rows.truncate(keep);
        removed
    }

    /// Last non-null close in the table.
    pub fn last_close(&self) -> Option<f64> {
        self.rows.iter().rev().find_map(|r| r.close)
    }
}

/// One shares-outstanding observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharesPoint {
    pub date: NaiveDate,
    pub shares: u64,
}

/// Cached shares-outstanding series plus the date span the provider has
/// already been asked about. The span can be wider than the points: a
/// fetched range with no reports is still covered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SharesTable {
    pub points: Vec<SharesPoint>,
    pub covered_start: NaiveDate,
    pub covered_end: NaiveDate,
}

impl SharesTable {
    /// Points with `start <= date < end`.
    pub fn between(&self, start: NaiveDate, end: NaiveDate) -> Vec<SharesPoint> {
        self.points
            .iter()
            .filter(|p| p.date >= start && p.date < end)
            .copied()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn row(day: u32, close: Option<f64>) -> PriceRow {
        let ts = Utc.with_ymd_and_hms(2024, 1, day, 14, 30, 0).unwrap();
        PriceRow {
            close,
            ..PriceRow::no_trade(ts, ts + Duration::days(30))
        }
    }

    #[test]
    fn rejects_unordered_rows() {
        let err = PriceTable::from_sorted(vec![row(3, None), row(2, None), row(2, None)])
            .unwrap_err();
        assert_eq!(err.offending.len(), 2);
    }

    #[test]
    fn range_is_half_open() {
        let table =
            PriceTable::from_sorted(vec![row(2, None), row(3, None), row(4, None)]).unwrap();
        let start = Utc.with_ymd_and_hms(2024, 1, 3, 14, 30, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2024, 1, 4, 14, 30, 0).unwrap();
        let slice = table.range(start, end);
        assert_eq!(slice.len(), 1);
        assert_eq!(slice[0].timestamp, start);
        assert!(table.range(end, start).is_empty());
    }

    #[test]
    fn truncate_from_drops_tail() {
        let mut table =
            PriceTable::from_sorted(vec![row(2, None), row(3, None), row(4, None)]).unwrap();
        let from = Utc.with_ymd_and_hms(2024, 1, 3, 0, 0, 0).unwrap();
        assert_eq!(table.truncate_from(from), 2);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn last_close_skips_nulls() {
        let table =
            PriceTable::from_sorted(vec![row(2, Some(10.0)), row(3, Some(11.0)), row(4, None)])
                .unwrap();
        assert_eq!(table.last_close(), Some(11.0));
        assert_eq!(PriceTable::new().last_close(), None);
    }
}
