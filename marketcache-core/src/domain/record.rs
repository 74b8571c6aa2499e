//! Records: what the store persists under a `(symbol, name)` key.

use super::interval::Interval;
use super::table::{PriceTable, SharesTable};
use crate::error::{CacheError, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Address of a record. Symbols are upper-cased; both parts must be usable
/// as a single path component.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    symbol: String,
    name: String,
}

impl CacheKey {
    pub fn new(symbol: &str, name: &str) -> Result<Self> {
        let symbol = symbol.trim().to_uppercase();
        validate_component("symbol", &symbol)?;
        validate_component("name", name)?;
        Ok(Self {
            symbol,
            name: name.to_string(),
        })
    }

    pub fn history(symbol: &str, interval: Interval) -> Result<Self> {
        Self::new(symbol, &interval.cache_name())
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.symbol, self.name)
    }
}

fn validate_component(what: &str, value: &str) -> Result<()> {
    let bad = value.is_empty()
        || value.starts_with('.')
        || value.ends_with(".tmp")
        || value.chars().any(|c| matches!(c, '/' | '\\' | '\0'));
    if bad {
        return Err(CacheError::InvalidArgument(format!(
            "{what} '{value}' cannot be used as a cache path component"
        )));
    }
    Ok(())
}

/// A single metadata value.
///
/// Stored tagged (`{"type": "timestamp", "value": ...}`) so a text value that
/// happens to look like a timestamp reads back as text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum MetaValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Timestamp(DateTime<Utc>),
    Text(String),
}

impl MetaValue {
    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            MetaValue::Timestamp(t) => Some(*t),
            _ => None,
        }
    }

    /// False for NaN and infinite floats, which JSON cannot hold.
    pub fn is_finite(&self) -> bool {
        match self {
            MetaValue::Float(x) => x.is_finite(),
            _ => true,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            MetaValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Convert a JSON scalar. Arrays, objects and null have no scalar form.
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Bool(b) => Some(MetaValue::Bool(*b)),
            serde_json::Value::Number(n) => n
                .as_i64()
                .map(MetaValue::Int)
                .or_else(|| n.as_f64().map(MetaValue::Float)),
            serde_json::Value::String(s) => Some(
                DateTime::parse_from_rfc3339(s)
                    .map(|t| MetaValue::Timestamp(t.with_timezone(&Utc)))
                    .unwrap_or_else(|_| MetaValue::Text(s.clone())),
            ),
            _ => None,
        }
    }
}

impl fmt::Display for MetaValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetaValue::Bool(b) => write!(f, "{b}"),
            MetaValue::Int(i) => write!(f, "{i}"),
            MetaValue::Float(x) => write!(f, "{x}"),
            MetaValue::Timestamp(t) => write!(f, "{}", t.to_rfc3339()),
            MetaValue::Text(s) => f.write_str(s),
        }
    }
}

impl From<DateTime<Utc>> for MetaValue {
    fn from(t: DateTime<Utc>) -> Self {
        MetaValue::Timestamp(t)
    }
}

impl From<&str> for MetaValue {
    fn from(s: &str) -> Self {
        MetaValue::Text(s.to_string())
    }
}

/// Flat map of metadata fields attached to a record.
pub type Metadata = BTreeMap<String, MetaValue>;

/// Build metadata from a JSON object of scalars.
pub fn metadata_from_json(value: &serde_json::Value) -> Result<Metadata> {
    let object = value.as_object().ok_or_else(|| {
        CacheError::InvalidArgument("metadata must be a JSON object".to_string())
    })?;
    object
        .iter()
        .map(|(k, v)| {
            MetaValue::from_json(v).map(|mv| (k.clone(), mv)).ok_or_else(|| {
                CacheError::InvalidArgument(format!(
                    "metadata field '{k}' is not a scalar: {v}"
                ))
            })
        })
        .collect()
}

/// Record payload. The variant decides the on-disk representation: tables
/// go to Parquet, everything else to JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Payload {
    Scalar(MetaValue),
    Document(serde_json::Value),
    Table(PriceTable),
    Shares(SharesTable),
}

impl Payload {
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::Scalar(_) => "scalar",
            Payload::Document(_) => "document",
            Payload::Table(_) => "table",
            Payload::Shares(_) => "shares",
        }
    }
}

/// When a record stops being served.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Expiry {
    At(DateTime<Utc>),
    /// Relative to the moment of the write.
    After(Duration),
    /// One bar of the given interval after the write.
    AfterInterval(Interval),
}

impl Expiry {
    pub fn resolve(self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Expiry::At(t) => t,
            Expiry::After(d) => now + d,
            Expiry::AfterInterval(i) => now + i.nominal_length(),
        }
    }
}

/// A record as returned by the store.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub key: CacheKey,
    pub payload: Payload,
    pub metadata: Metadata,
    pub expiry: Option<DateTime<Utc>>,
}

impl Record {
    pub fn meta_timestamp(&self, field: &str) -> Option<DateTime<Utc>> {
        self.metadata.get(field).and_then(MetaValue::as_timestamp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn key_uppercases_symbol() {
        let key = CacheKey::new("aapl", "info").unwrap();
        assert_eq!(key.symbol(), "AAPL");
        assert_eq!(key.to_string(), "AAPL/info");
    }

    #[test]
    fn key_rejects_path_components() {
        assert!(CacheKey::new("../etc", "info").is_err());
        assert!(CacheKey::new("AAPL", "a/b").is_err());
        assert!(CacheKey::new("AAPL", "").is_err());
        assert!(CacheKey::new("AAPL", "x.tmp").is_err());
    }

    #[test]
    fn metadata_from_flat_object() {
        let md = metadata_from_json(&json!({
            "LastFetch": "2024-01-02T15:00:00Z",
            "rows": 12,
            "ratio": 0.5,
            "ok": true,
            "source": "yahoo",
        }))
        .unwrap();
        assert_eq!(
            md["LastFetch"],
            MetaValue::Timestamp(Utc.with_ymd_and_hms(2024, 1, 2, 15, 0, 0).unwrap())
        );
        assert_eq!(md["rows"], MetaValue::Int(12));
        assert_eq!(md["ratio"], MetaValue::Float(0.5));
        assert_eq!(md["ok"], MetaValue::Bool(true));
        assert_eq!(md["source"], MetaValue::Text("yahoo".into()));
    }

    #[test]
    fn metadata_rejects_nested_values() {
        assert!(matches!(
            metadata_from_json(&json!({"a": [1, 2]})),
            Err(CacheError::InvalidArgument(_))
        ));
        assert!(matches!(
            metadata_from_json(&json!([1])),
            Err(CacheError::InvalidArgument(_))
        ));
    }

    #[test]
    fn meta_value_serde_keeps_timestamps() {
        let t = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        let encoded = serde_json::to_string(&MetaValue::Timestamp(t)).unwrap();
        let decoded: MetaValue = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, MetaValue::Timestamp(t));

        let text: MetaValue = serde_json::from_str(r#"{"type": "text", "value": "NMS"}"#).unwrap();
        assert_eq!(text.as_str(), Some("NMS"));
    }

    #[test]
    fn timestamp_shaped_text_stays_text() {
        let text = MetaValue::Text("2024-01-01T00:00:00Z".into());
        let encoded = serde_json::to_string(&text).unwrap();
        assert_eq!(serde_json::from_str::<MetaValue>(&encoded).unwrap(), text);

        let ratio = MetaValue::Float(2.0);
        let encoded = serde_json::to_string(&ratio).unwrap();
        assert_eq!(serde_json::from_str::<MetaValue>(&encoded).unwrap(), ratio);
    }

    #[test]
    fn non_finite_floats_are_flagged() {
        assert!(!MetaValue::Float(f64::NAN).is_finite());
        assert!(!MetaValue::Float(f64::INFINITY).is_finite());
        assert!(MetaValue::Float(0.5).is_finite());
        assert!(MetaValue::Text("x".into()).is_finite());
    }

    #[test]
    fn expiry_resolves_against_write_time() {
        let now = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();
        assert_eq!(Expiry::After(Duration::hours(1)).resolve(now), now + Duration::hours(1));
        assert_eq!(
            Expiry::AfterInterval(Interval::Week1).resolve(now),
            now + Duration::days(7)
        );
        assert_eq!(Expiry::At(now).resolve(now + Duration::days(1)), now);
    }
}
