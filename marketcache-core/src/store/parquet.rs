//! Parquet encoding of price tables.
//!
//! Timestamps are stored as epoch milliseconds (UTC) so the file carries no
//! time-zone ambiguity.

use crate::domain::{PriceRow, PriceTable};
use chrono::{DateTime, Utc};
use polars::prelude::*;
use std::io::Cursor;

const COLUMNS: [&str; 11] = [
    "timestamp",
    "open",
    "high",
    "low",
    "close",
    "volume",
    "dividends",
    "stock_splits",
    "csf",
    "cdf",
    "fetched_at",
];

/// Encode a table into an in-memory Parquet file.
pub(crate) fn encode(table: &PriceTable) -> Result<Vec<u8>, String> {
    let mut df = table_to_dataframe(table.rows()).map_err(|e| format!("dataframe creation: {e}"))?;
    let mut buf = Vec::new();
    ParquetWriter::new(&mut buf)
        .finish(&mut df)
        .map_err(|e| format!("write parquet: {e}"))?;
    Ok(buf)
}

/// Decode Parquet bytes written by [`encode`].
pub(crate) fn decode(bytes: &[u8]) -> Result<PriceTable, String> {
    let df = ParquetReader::new(Cursor::new(bytes))
        .finish()
        .map_err(|e| format!("read parquet: {e}"))?;

    for name in COLUMNS {
        if df.column(name).is_err() {
            return Err(format!("missing column '{name}'"));
        }
    }

    let rows = dataframe_to_rows(&df)?;
    PriceTable::from_sorted(rows).map_err(|e| {
        format!(
            "timestamps not strictly increasing at {} row(s)",
            e.offending.len()
        )
    })
}

fn table_to_dataframe(rows: &[PriceRow]) -> PolarsResult<DataFrame> {
    let timestamps: Vec<i64> = rows.iter().map(|r| r.timestamp.timestamp_millis()).collect();
    let opens: Vec<Option<f64>> = rows.iter().map(|r| r.open).collect();
    let highs: Vec<Option<f64>> = rows.iter().map(|r| r.high).collect();
    let lows: Vec<Option<f64>> = rows.iter().map(|r| r.low).collect();
    let closes: Vec<Option<f64>> = rows.iter().map(|r| r.close).collect();
    let volumes: Vec<Option<u64>> = rows.iter().map(|r| r.volume).collect();
    let dividends: Vec<f64> = rows.iter().map(|r| r.dividends).collect();
    let splits: Vec<f64> = rows.iter().map(|r| r.stock_splits).collect();
    let csf: Vec<f64> = rows.iter().map(|r| r.csf).collect();
    let cdf: Vec<f64> = rows.iter().map(|r| r.cdf).collect();
    let fetched: Vec<i64> = rows.iter().map(|r| r.fetched_at.timestamp_millis()).collect();

    DataFrame::new(vec![
        Column::new("timestamp".into(), timestamps),
        Column::new("open".into(), opens),
        Column::new("high".into(), highs),
        Column::new("low".into(), lows),
        Column::new("close".into(), closes),
        Column::new("volume".into(), volumes),
        Column::new("dividends".into(), dividends),
        Column::new("stock_splits".into(), splits),
        Column::new("csf".into(), csf),
        Column::new("cdf".into(), cdf),
        Column::new("fetched_at".into(), fetched),
    ])
}

fn dataframe_to_rows(df: &DataFrame) -> Result<Vec<PriceRow>, String> {
    let col = |name: &str| df.column(name).map_err(|e| format!("column read: {e}"));
    let type_err = |name: &'static str| move |e: PolarsError| format!("{name} column type: {e}");

    let ts_ca = col("timestamp")?.i64().map_err(type_err("timestamp"))?;
    let open_ca = col("open")?.f64().map_err(type_err("open"))?;
    let high_ca = col("high")?.f64().map_err(type_err("high"))?;
    let low_ca = col("low")?.f64().map_err(type_err("low"))?;
    let close_ca = col("close")?.f64().map_err(type_err("close"))?;
    let vol_ca = col("volume")?.u64().map_err(type_err("volume"))?;
    let div_ca = col("dividends")?.f64().map_err(type_err("dividends"))?;
    let split_ca = col("stock_splits")?.f64().map_err(type_err("stock_splits"))?;
    let csf_ca = col("csf")?.f64().map_err(type_err("csf"))?;
    let cdf_ca = col("cdf")?.f64().map_err(type_err("cdf"))?;
    let fetched_ca = col("fetched_at")?.i64().map_err(type_err("fetched_at"))?;

    let millis = |v: Option<i64>, what: &str, i: usize| -> Result<DateTime<Utc>, String> {
        v.and_then(DateTime::from_timestamp_millis)
            .ok_or_else(|| format!("null or out-of-range {what} at row {i}"))
    };

    (0..df.height())
        .map(|i| {
            Ok(PriceRow {
                timestamp: millis(ts_ca.get(i), "timestamp", i)?,
                open: open_ca.get(i),
                high: high_ca.get(i),
                low: low_ca.get(i),
                close: close_ca.get(i),
                volume: vol_ca.get(i),
                dividends: div_ca.get(i).unwrap_or(0.0),
                stock_splits: split_ca.get(i).unwrap_or(0.0),
                csf: csf_ca.get(i).unwrap_or(1.0),
                cdf: cdf_ca.get(i).unwrap_or(1.0),
                fetched_at: millis(fetched_ca.get(i), "fetched_at", i)?,
            })
        })
        .collect()
}
