//! Timestamp-union merge of staged rows into a cached table.

use crate::domain::{PriceRow, PriceTable};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

/// Timestamps that appeared more than once where uniqueness is required.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuplicateTimestamps(pub Vec<DateTime<Utc>>);

/// Union by timestamp. Incoming rows replace cached rows at the same
/// timestamp; incoming rows must be unique among themselves.
pub fn merge(existing: &PriceTable, incoming: Vec<PriceRow>) -> Result<PriceTable, DuplicateTimestamps> {
    let mut staged: BTreeMap<DateTime<Utc>, PriceRow> = BTreeMap::new();
    let mut duplicates = Vec::new();
    for row in incoming {
        let ts = row.timestamp;
        if staged.insert(ts, row).is_some() {
            duplicates.push(ts);
        }
    }
    if !duplicates.is_empty() {
        duplicates.dedup();
        return Err(DuplicateTimestamps(duplicates));
    }

    let mut merged: BTreeMap<DateTime<Utc>, PriceRow> = existing
        .rows()
        .iter()
        .map(|r| (r.timestamp, r.clone()))
        .collect();
    merged.extend(staged);

    PriceTable::from_sorted(merged.into_values().collect()).map_err(|e| DuplicateTimestamps(e.offending))
}
