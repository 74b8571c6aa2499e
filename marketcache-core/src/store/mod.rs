//! Record store: keyed, expiring, metadata-carrying persistence.
//!
//! Every record lives under `{root}/{SYMBOL}/`. Tables are written as Parquet
//! with a JSON envelope next to them; everything else is a JSON envelope.
//! Financial statements are packed into shared units (see [`packing`]).
//!
//! Representation is resolved once per symbol directory by a scan and then
//! tracked in memory. Read-modify-write cycles are serialized per file.

pub mod layout;
mod locks;
pub mod packing;
mod parquet;

use crate::clock::Clock;
use crate::domain::{CacheKey, Expiry, MetaValue, Metadata, Payload, Record};
use crate::error::{CacheError, Result};
use chrono::{DateTime, Utc};
use layout::{Representation, SymbolIndex};
use locks::LockTable;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Where the store keeps its files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    pub root: PathBuf,
}

impl StoreConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

/// JSON envelope for scalars, documents and packed-unit members.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredRecord {
    payload: Payload,
    #[serde(default)]
    metadata: Metadata,
    #[serde(default)]
    expiry: Option<DateTime<Utc>>,
}

impl StoredRecord {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        is_expired(self.expiry, now)
    }

    fn into_record(self, key: &CacheKey) -> Record {
        Record {
            key: key.clone(),
            payload: self.payload,
            metadata: self.metadata,
            expiry: self.expiry,
        }
    }
}

/// Sidecar for a Parquet table: `{name}.parquet.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct TableEnvelope {
    #[serde(default)]
    metadata: Metadata,
    #[serde(default)]
    expiry: Option<DateTime<Utc>>,
    data_hash: String,
    row_count: usize,
    written_at: DateTime<Utc>,
}

type PackedUnit = BTreeMap<String, StoredRecord>;

fn is_expired(expiry: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    expiry.is_some_and(|t| t <= now)
}

/// Physical files and representation of one cached name, for status output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryInfo {
    pub name: String,
    pub representation: Representation,
    pub packed_in: Option<&'static str>,
}

pub struct RecordStore {
    root: PathBuf,
    clock: Arc<dyn Clock>,
    locks: LockTable,
    index: Mutex<HashMap<String, SymbolIndex>>,
}

impl RecordStore {
    pub fn new(config: StoreConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            root: config.root,
            clock,
            locks: LockTable::default(),
            index: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn symbol_dir(&self, symbol: &str) -> PathBuf {
        self.root.join(symbol)
    }

    // ── Public API ──────────────────────────────────────────────────

    /// Fetch a record. An expired record is deleted and reported absent.
    pub fn get(&self, key: &CacheKey) -> Result<Option<Record>> {
        let now = self.clock.now();
        match packing::unit_for(key.name()) {
            Some(unit) => self.get_packed(key, unit, now),
            None => self.get_single(key, now),
        }
    }

    /// Write or delete a record.
    ///
    /// `payload: None` deletes. Omitted `metadata` keeps what is already
    /// stored; an omitted `expiry` keeps the stored one if it has not passed.
    pub fn put(
        &self,
        key: &CacheKey,
        payload: Option<Payload>,
        expiry: Option<Expiry>,
        metadata: Option<Metadata>,
    ) -> Result<()> {
        if packing::is_unit(key.name()) {
            return Err(CacheError::InvalidArgument(format!(
                "'{}' is reserved for packed records",
                key.name()
            )));
        }
        if let Some(Payload::Scalar(value)) = &payload {
            check_value(key, "payload", value)?;
        }
        if let Some(metadata) = &metadata {
            for (field, value) in metadata {
                check_value(key, field, value)?;
            }
        }
        let now = self.clock.now();
        let expiry = expiry.map(|e| e.resolve(now));
        match packing::unit_for(key.name()) {
            Some(unit) => self.put_packed(key, unit, payload, expiry, metadata, now),
            None => self.put_single(key, payload, expiry, metadata, now),
        }
    }

    pub fn delete(&self, key: &CacheKey) -> Result<()> {
        self.put(key, None, None, None)
    }

    pub fn contains(&self, key: &CacheKey) -> Result<bool> {
        match self.metadata(key) {
            Ok(_) => Ok(true),
            Err(CacheError::NotFound { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Metadata of a live record. Reads only the envelope for tables.
    pub fn metadata(&self, key: &CacheKey) -> Result<Metadata> {
        let now = self.clock.now();
        if packing::unit_for(key.name()).is_none()
            && self.representation(key.symbol(), key.name())? == Some(Representation::Parquet)
        {
            let lock = self.locks.handle(key.symbol(), key.name());
            let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());
            let dir = self.symbol_dir(key.symbol());
            let envelope = self
                .read_table_envelope(&dir, key.name())?
                .ok_or_else(|| not_found(key))?;
            if is_expired(envelope.expiry, now) {
                self.remove_single(key)?;
                tracing::debug!(key = %key, "expired table removed");
                return Err(not_found(key));
            }
            return Ok(envelope.metadata);
        }
        self.get(key)?
            .map(|r| r.metadata)
            .ok_or_else(|| not_found(key))
    }

    pub fn get_metadata_field(&self, key: &CacheKey, field: &str) -> Result<Option<MetaValue>> {
        Ok(self.metadata(key)?.remove(field))
    }

    /// Set one metadata field without touching the payload file.
    pub fn set_metadata_field(&self, key: &CacheKey, field: &str, value: MetaValue) -> Result<()> {
        check_value(key, field, &value)?;
        let now = self.clock.now();
        if let Some(unit) = packing::unit_for(key.name()) {
            let lock = self.locks.handle(key.symbol(), unit);
            let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());
            let mut entries = self.read_unit(key.symbol(), unit)?;
            let entry = entries.get_mut(key.name()).ok_or_else(|| not_found(key))?;
            if entry.is_expired(now) {
                entries.remove(key.name());
                self.write_unit(key.symbol(), unit, &entries)?;
                return Err(not_found(key));
            }
            entry.metadata.insert(field.to_string(), value);
            return self.write_unit(key.symbol(), unit, &entries);
        }

        let lock = self.locks.handle(key.symbol(), key.name());
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());
        let dir = self.symbol_dir(key.symbol());
        match self.representation(key.symbol(), key.name())? {
            None => Err(not_found(key)),
            Some(Representation::Json) => {
                let mut stored = self.read_json(key)?.ok_or_else(|| not_found(key))?;
                if stored.is_expired(now) {
                    self.remove_single(key)?;
                    return Err(not_found(key));
                }
                stored.metadata.insert(field.to_string(), value);
                let path = Representation::Json.data_path(&dir, key.name());
                layout::write_atomic(&path, &to_json(&stored, &path)?)
            }
            Some(Representation::Parquet) => {
                let mut envelope = self
                    .read_table_envelope(&dir, key.name())?
                    .ok_or_else(|| not_found(key))?;
                if is_expired(envelope.expiry, now) {
                    self.remove_single(key)?;
                    return Err(not_found(key));
                }
                envelope.metadata.insert(field.to_string(), value);
                let path = layout::envelope_path(&dir, key.name());
                layout::write_atomic(&path, &to_json(&envelope, &path)?)
            }
        }
    }

    /// Cached symbol directories, sorted.
    pub fn symbols(&self) -> Result<Vec<String>> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(CacheError::io(&self.root, e)),
        };
        let mut symbols = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| CacheError::io(&self.root, e))?;
            let is_dir = entry
                .file_type()
                .map_err(|e| CacheError::io(entry.path(), e))?
                .is_dir();
            if let (true, Some(name)) = (is_dir, entry.file_name().to_str()) {
                symbols.push(name.to_string());
            }
        }
        symbols.sort();
        Ok(symbols)
    }

    /// Logical record names cached for a symbol, with packed members
    /// expanded. Expiry is not checked.
    pub fn entries(&self, symbol: &str) -> Result<Vec<EntryInfo>> {
        let physical: Vec<(String, Representation)> = {
            self.ensure_indexed(symbol)?;
            let index = self.index.lock().unwrap_or_else(|e| e.into_inner());
            index
                .get(symbol)
                .map(|names| names.iter().map(|(n, r)| (n.clone(), *r)).collect())
                .unwrap_or_default()
        };

        let mut out = Vec::new();
        for (name, representation) in physical {
            if let Some(unit) = packing::unit_named(&name) {
                let lock = self.locks.handle(symbol, unit);
                let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());
                for member in self.read_unit(symbol, &name)?.into_keys() {
                    out.push(EntryInfo {
                        name: member,
                        representation,
                        packed_in: Some(unit),
                    });
                }
            } else {
                out.push(EntryInfo {
                    name,
                    representation,
                    packed_in: None,
                });
            }
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    /// Move a record's files aside as `{file}.quarantined` so the next access
    /// starts from empty.
    pub fn quarantine(&self, key: &CacheKey) -> Result<()> {
        let physical = packing::unit_for(key.name()).unwrap_or(key.name());
        let lock = self.locks.handle(key.symbol(), physical);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());
        let dir = self.symbol_dir(key.symbol());
        if let Some(repr) = self.representation(key.symbol(), physical)? {
            for path in repr.files(&dir, physical) {
                if !path.exists() {
                    continue;
                }
                let mut target = path.clone().into_os_string();
                target.push(".quarantined");
                tracing::warn!(file = %path.display(), "quarantining corrupt cache file");
                fs::rename(&path, &target).map_err(|e| CacheError::io(&path, e))?;
            }
        }
        self.track(key.symbol(), physical, None);
        Ok(())
    }

    // ── Representation index ────────────────────────────────────────

    fn ensure_indexed(&self, symbol: &str) -> Result<()> {
        let mut index = self.index.lock().unwrap_or_else(|e| e.into_inner());
        if !index.contains_key(symbol) {
            let scanned = layout::scan_symbol_dir(&self.symbol_dir(symbol))?;
            tracing::debug!(symbol, records = scanned.len(), "indexed symbol directory");
            index.insert(symbol.to_string(), scanned);
        }
        Ok(())
    }

    fn representation(&self, symbol: &str, physical: &str) -> Result<Option<Representation>> {
        self.ensure_indexed(symbol)?;
        let index = self.index.lock().unwrap_or_else(|e| e.into_inner());
        Ok(index.get(symbol).and_then(|names| names.get(physical).copied()))
    }

    fn track(&self, symbol: &str, physical: &str, repr: Option<Representation>) {
        let mut index = self.index.lock().unwrap_or_else(|e| e.into_inner());
        let names = index.entry(symbol.to_string()).or_default();
        match repr {
            Some(r) => {
                names.insert(physical.to_string(), r);
            }
            None => {
                names.remove(physical);
            }
        }
    }

    // ── Standalone records ──────────────────────────────────────────

    fn get_single(&self, key: &CacheKey, now: DateTime<Utc>) -> Result<Option<Record>> {
        let lock = self.locks.handle(key.symbol(), key.name());
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());

        let stored = match self.representation(key.symbol(), key.name())? {
            None => return Ok(None),
            Some(Representation::Json) => self.read_json(key)?,
            Some(Representation::Parquet) => self.read_table(key)?,
        };
        let Some(stored) = stored else {
            return Ok(None);
        };
        if stored.is_expired(now) {
            self.remove_single(key)?;
            tracing::debug!(key = %key, "expired record removed");
            return Ok(None);
        }
        Ok(Some(stored.into_record(key)))
    }

    fn put_single(
        &self,
        key: &CacheKey,
        payload: Option<Payload>,
        expiry: Option<DateTime<Utc>>,
        metadata: Option<Metadata>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let lock = self.locks.handle(key.symbol(), key.name());
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());

        let Some(payload) = payload else {
            return self.remove_single(key);
        };

        let current = self.representation(key.symbol(), key.name())?;
        let previous = self.read_envelope_fields(key, current)?;
        let (prev_metadata, prev_expiry) = previous.unzip();
        let metadata = metadata.or(prev_metadata).unwrap_or_default();
        let expiry = expiry.or(prev_expiry.flatten().filter(|t| *t > now));

        let dir = self.symbol_dir(key.symbol());
        let target = match payload {
            Payload::Table(_) => Representation::Parquet,
            _ => Representation::Json,
        };
        if let Some(old) = current.filter(|old| *old != target) {
            tracing::debug!(key = %key, ?old, new = ?target, "representation changed");
            for path in old.files(&dir, key.name()) {
                layout::remove_if_exists(&path)?;
            }
        }

        match payload {
            Payload::Table(table) => {
                let path = Representation::Parquet.data_path(&dir, key.name());
                let bytes = parquet::encode(&table)
                    .map_err(|e| CacheError::io(&path, std::io::Error::other(e)))?;
                let envelope = TableEnvelope {
                    metadata,
                    expiry,
                    data_hash: blake3::hash(&bytes).to_hex().to_string(),
                    row_count: table.len(),
                    written_at: now,
                };
                layout::write_atomic(&path, &bytes)?;
                let envelope_path = layout::envelope_path(&dir, key.name());
                layout::write_atomic(&envelope_path, &to_json(&envelope, &envelope_path)?)?;
            }
            payload => {
                let stored = StoredRecord {
                    payload,
                    metadata,
                    expiry,
                };
                let path = Representation::Json.data_path(&dir, key.name());
                layout::write_atomic(&path, &to_json(&stored, &path)?)?;
            }
        }
        self.track(key.symbol(), key.name(), Some(target));
        Ok(())
    }

    /// Metadata and expiry of whatever is stored now. A corrupt previous
    /// record fails the write; only `quarantine` clears it.
    fn read_envelope_fields(
        &self,
        key: &CacheKey,
        current: Option<Representation>,
    ) -> Result<Option<(Metadata, Option<DateTime<Utc>>)>> {
        let dir = self.symbol_dir(key.symbol());
        match current {
            None => Ok(None),
            Some(Representation::Json) => Ok(self
                .read_json(key)?
                .map(|s| (s.metadata, s.expiry))),
            Some(Representation::Parquet) => Ok(self
                .read_table_envelope(&dir, key.name())?
                .map(|e| (e.metadata, e.expiry))),
        }
    }

    fn remove_single(&self, key: &CacheKey) -> Result<()> {
        let dir = self.symbol_dir(key.symbol());
        if let Some(repr) = self.representation(key.symbol(), key.name())? {
            for path in repr.files(&dir, key.name()) {
                layout::remove_if_exists(&path)?;
            }
        }
        self.track(key.symbol(), key.name(), None);
        Ok(())
    }

    fn read_json(&self, key: &CacheKey) -> Result<Option<StoredRecord>> {
        let path = Representation::Json.data_path(&self.symbol_dir(key.symbol()), key.name());
        let Some(bytes) = layout::read_optional(&path)? else {
            self.track(key.symbol(), key.name(), None);
            return Ok(None);
        };
        serde_json::from_slice(&bytes).map(Some).map_err(|e| {
            CacheError::corruption(&path, "record envelope {payload, metadata, expiry}", e.to_string())
        })
    }

    fn read_table_envelope(&self, dir: &Path, name: &str) -> Result<Option<TableEnvelope>> {
        let path = layout::envelope_path(dir, name);
        let Some(bytes) = layout::read_optional(&path)? else {
            return Ok(None);
        };
        serde_json::from_slice(&bytes).map(Some).map_err(|e| {
            CacheError::corruption(&path, "table envelope {metadata, expiry, data_hash}", e.to_string())
        })
    }

    fn read_table(&self, key: &CacheKey) -> Result<Option<StoredRecord>> {
        let dir = self.symbol_dir(key.symbol());
        let path = Representation::Parquet.data_path(&dir, key.name());
        let Some(bytes) = layout::read_optional(&path)? else {
            self.track(key.symbol(), key.name(), None);
            return Ok(None);
        };
        let envelope = self.read_table_envelope(&dir, key.name())?.ok_or_else(|| {
            CacheError::corruption(
                layout::envelope_path(&dir, key.name()),
                "envelope next to parquet table",
                "missing file",
            )
        })?;

        let actual = blake3::hash(&bytes).to_hex().to_string();
        if actual != envelope.data_hash {
            return Err(CacheError::corruption(
                &path,
                format!("blake3 {}", envelope.data_hash),
                format!("blake3 {actual}"),
            ));
        }
        let table = parquet::decode(&bytes)
            .map_err(|e| CacheError::corruption(&path, "price table parquet", e))?;
        if table.len() != envelope.row_count {
            return Err(CacheError::corruption(
                &path,
                format!("{} rows", envelope.row_count),
                format!("{} rows", table.len()),
            ));
        }

        Ok(Some(StoredRecord {
            payload: Payload::Table(table),
            metadata: envelope.metadata,
            expiry: envelope.expiry,
        }))
    }

    // ── Packed units ────────────────────────────────────────────────

    fn get_packed(&self, key: &CacheKey, unit: &str, now: DateTime<Utc>) -> Result<Option<Record>> {
        let lock = self.locks.handle(key.symbol(), unit);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());

        let mut entries = self.read_unit(key.symbol(), unit)?;
        let Some(stored) = entries.remove(key.name()) else {
            return Ok(None);
        };
        if stored.is_expired(now) {
            self.write_unit(key.symbol(), unit, &entries)?;
            tracing::debug!(key = %key, unit, "expired packed record removed");
            return Ok(None);
        }
        Ok(Some(stored.into_record(key)))
    }

    fn put_packed(
        &self,
        key: &CacheKey,
        unit: &str,
        payload: Option<Payload>,
        expiry: Option<DateTime<Utc>>,
        metadata: Option<Metadata>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let lock = self.locks.handle(key.symbol(), unit);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());

        let mut entries = self.read_unit(key.symbol(), unit)?;
        let Some(payload) = payload else {
            if entries.remove(key.name()).is_some() {
                self.write_unit(key.symbol(), unit, &entries)?;
            }
            return Ok(());
        };

        let previous = entries.remove(key.name());
        let metadata = metadata
            .or_else(|| previous.as_ref().map(|p| p.metadata.clone()))
            .unwrap_or_default();
        let expiry =
            expiry.or_else(|| previous.and_then(|p| p.expiry).filter(|t| *t > now));
        entries.insert(
            key.name().to_string(),
            StoredRecord {
                payload,
                metadata,
                expiry,
            },
        );
        self.write_unit(key.symbol(), unit, &entries)
    }

    fn read_unit(&self, symbol: &str, unit: &str) -> Result<PackedUnit> {
        let path = Representation::Json.data_path(&self.symbol_dir(symbol), unit);
        match self.representation(symbol, unit)? {
            None => Ok(PackedUnit::new()),
            Some(Representation::Parquet) => Err(CacheError::corruption(
                &path,
                "packed unit as JSON",
                "parquet file",
            )),
            Some(Representation::Json) => {
                let Some(bytes) = layout::read_optional(&path)? else {
                    self.track(symbol, unit, None);
                    return Ok(PackedUnit::new());
                };
                serde_json::from_slice(&bytes).map_err(|e| {
                    CacheError::corruption(&path, "packed unit {name: envelope}", e.to_string())
                })
            }
        }
    }

    /// Rewrite a unit whole; an empty unit removes the file.
    fn write_unit(&self, symbol: &str, unit: &str, entries: &PackedUnit) -> Result<()> {
        let path = Representation::Json.data_path(&self.symbol_dir(symbol), unit);
        if entries.is_empty() {
            layout::remove_if_exists(&path)?;
            self.track(symbol, unit, None);
            return Ok(());
        }
        layout::write_atomic(&path, &to_json(entries, &path)?)?;
        self.track(symbol, unit, Some(Representation::Json));
        Ok(())
    }
}

fn not_found(key: &CacheKey) -> CacheError {
    CacheError::NotFound {
        key: key.to_string(),
    }
}

fn check_value(key: &CacheKey, field: &str, value: &MetaValue) -> Result<()> {
    if value.is_finite() {
        return Ok(());
    }
    Err(CacheError::InvalidArgument(format!(
        "{key}: '{field}' must be a finite number, got {value}"
    )))
}

fn to_json<T: Serialize>(value: &T, path: &Path) -> Result<Vec<u8>> {
    serde_json::to_vec_pretty(value).map_err(|e| CacheError::io(path, e.into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::domain::{PriceRow, PriceTable};
    use chrono::{Duration, TimeZone};
    use serde_json::json;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 2, 1, 12, 0, 0).unwrap()
    }

    fn store() -> (tempfile::TempDir, Arc<ManualClock>, RecordStore) {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(t0()));
        let store = RecordStore::new(StoreConfig::new(dir.path()), clock.clone());
        (dir, clock, store)
    }

    fn key(name: &str) -> CacheKey {
        CacheKey::new("AAPL", name).unwrap()
    }

    fn doc(v: serde_json::Value) -> Option<Payload> {
        Some(Payload::Document(v))
    }

    fn table() -> PriceTable {
        let ts = Utc.with_ymd_and_hms(2024, 1, 2, 14, 30, 0).unwrap();
        PriceTable::from_sorted(vec![PriceRow {
            close: Some(185.64),
            volume: Some(82_488_700),
            ..PriceRow::no_trade(ts, t0())
        }])
        .unwrap()
    }

    #[test]
    fn put_then_get_document() {
        let (_dir, _clock, store) = store();
        store.put(&key("info"), doc(json!({"sector": "Tech"})), None, None).unwrap();
        let record = store.get(&key("info")).unwrap().unwrap();
        assert_eq!(record.payload, Payload::Document(json!({"sector": "Tech"})));
        assert!(record.metadata.is_empty());
        assert!(record.expiry.is_none());
    }

    #[test]
    fn missing_key_is_absent() {
        let (_dir, _clock, store) = store();
        assert!(store.get(&key("info")).unwrap().is_none());
        assert!(!store.contains(&key("info")).unwrap());
    }

    #[test]
    fn expired_record_is_deleted_on_read() {
        let (dir, clock, store) = store();
        store
            .put(
                &key("calendar"),
                doc(json!({})),
                Some(Expiry::After(Duration::hours(1))),
                None,
            )
            .unwrap();
        assert!(store.get(&key("calendar")).unwrap().is_some());

        clock.advance(Duration::hours(1));
        assert!(store.get(&key("calendar")).unwrap().is_none());
        assert!(!dir.path().join("AAPL").join("calendar.json").exists());
    }

    #[test]
    fn omitted_metadata_and_expiry_are_preserved() {
        let (_dir, _clock, store) = store();
        let mut md = Metadata::new();
        md.insert("LastFetch".into(), MetaValue::Timestamp(t0()));
        let exp = t0() + Duration::days(2);
        store
            .put(&key("info"), doc(json!({"a": 1})), Some(Expiry::At(exp)), Some(md.clone()))
            .unwrap();
        store.put(&key("info"), doc(json!({"a": 2})), None, None).unwrap();

        let record = store.get(&key("info")).unwrap().unwrap();
        assert_eq!(record.payload, Payload::Document(json!({"a": 2})));
        assert_eq!(record.metadata, md);
        assert_eq!(record.expiry, Some(exp));
    }

    #[test]
    fn table_round_trips_through_parquet() {
        let (dir, _clock, store) = store();
        let k = key("history-1d");
        store.put(&k, Some(Payload::Table(table())), None, None).unwrap();
        assert!(dir.path().join("AAPL/history-1d.parquet").exists());
        assert!(dir.path().join("AAPL/history-1d.parquet.json").exists());

        let record = store.get(&k).unwrap().unwrap();
        assert_eq!(record.payload, Payload::Table(table()));
    }

    #[test]
    fn tampered_parquet_is_corruption() {
        let (dir, clock, store) = store();
        let k = key("history-1d");
        store.put(&k, Some(Payload::Table(table())), None, None).unwrap();
        let path = dir.path().join("AAPL/history-1d.parquet");
        let mut bytes = fs::read(&path).unwrap();
        bytes.push(0);
        fs::write(&path, bytes).unwrap();

        let fresh = RecordStore::new(StoreConfig::new(dir.path()), clock);
        let err = fresh.get(&k).unwrap_err();
        assert!(matches!(err, CacheError::StoreCorruption { .. }));
    }

    #[test]
    fn garbage_json_is_corruption() {
        let (dir, clock, _store) = store();
        fs::create_dir_all(dir.path().join("AAPL")).unwrap();
        fs::write(dir.path().join("AAPL/info.json"), "{\"payload\": 3").unwrap();
        let fresh = RecordStore::new(StoreConfig::new(dir.path()), clock);
        assert!(matches!(
            fresh.get(&key("info")),
            Err(CacheError::StoreCorruption { .. })
        ));
    }

    #[test]
    fn put_over_corrupt_record_fails_until_quarantined() {
        let (dir, clock, _store) = store();
        let path = dir.path().join("AAPL/info.json");
        fs::create_dir_all(dir.path().join("AAPL")).unwrap();
        fs::write(&path, "{\"payload\": 3").unwrap();
        let fresh = RecordStore::new(StoreConfig::new(dir.path()), clock);

        assert!(matches!(
            fresh.put(&key("info"), doc(json!({"a": 1})), None, None),
            Err(CacheError::StoreCorruption { .. })
        ));
        assert_eq!(fs::read_to_string(&path).unwrap(), "{\"payload\": 3");
        assert!(fresh.get(&key("info")).is_err());

        fresh.quarantine(&key("info")).unwrap();
        fresh.put(&key("info"), doc(json!({"a": 1})), None, None).unwrap();
        assert_eq!(
            fresh.get(&key("info")).unwrap().unwrap().payload,
            Payload::Document(json!({"a": 1}))
        );
        assert!(dir.path().join("AAPL/info.json.quarantined").exists());
    }

    #[test]
    fn non_finite_metadata_is_rejected() {
        let (_dir, _clock, store) = store();
        let md: Metadata = [("Ratio".to_string(), MetaValue::Float(f64::NAN))].into();
        assert!(matches!(
            store.put(&key("info"), doc(json!({})), None, Some(md)),
            Err(CacheError::InvalidArgument(_))
        ));
        assert!(matches!(
            store.put(&key("beta"), Some(Payload::Scalar(MetaValue::Float(f64::INFINITY))), None, None),
            Err(CacheError::InvalidArgument(_))
        ));

        store.put(&key("info"), doc(json!({})), None, None).unwrap();
        assert!(matches!(
            store.set_metadata_field(&key("info"), "Ratio", MetaValue::Float(f64::NEG_INFINITY)),
            Err(CacheError::InvalidArgument(_))
        ));
        assert!(store.get(&key("info")).unwrap().unwrap().metadata.is_empty());
    }

    #[test]
    fn set_metadata_field_leaves_parquet_untouched() {
        let (dir, _clock, store) = store();
        let k = key("history-1d");
        store.put(&k, Some(Payload::Table(table())), None, None).unwrap();
        let parquet_path = dir.path().join("AAPL/history-1d.parquet");
        let before = fs::read(&parquet_path).unwrap();

        store
            .set_metadata_field(&k, "LastCorrection", MetaValue::Timestamp(t0()))
            .unwrap();
        assert_eq!(fs::read(&parquet_path).unwrap(), before);
        assert_eq!(
            store.get_metadata_field(&k, "LastCorrection").unwrap(),
            Some(MetaValue::Timestamp(t0()))
        );
    }

    #[test]
    fn metadata_ops_on_missing_key_are_not_found() {
        let (_dir, _clock, store) = store();
        assert!(matches!(
            store.set_metadata_field(&key("info"), "x", MetaValue::Int(1)),
            Err(CacheError::NotFound { .. })
        ));
        assert!(matches!(
            store.get_metadata_field(&key("annuals_x"), "x"),
            Err(CacheError::NotFound { .. })
        ));
    }

    #[test]
    fn changing_representation_removes_old_file() {
        let (dir, _clock, store) = store();
        let k = key("history-1d");
        store.put(&k, doc(json!([])), None, None).unwrap();
        store.put(&k, Some(Payload::Table(table())), None, None).unwrap();
        assert!(!dir.path().join("AAPL/history-1d.json").exists());
        assert!(dir.path().join("AAPL/history-1d.parquet").exists());
    }

    #[test]
    fn packed_members_share_one_file() {
        let (dir, _clock, store) = store();
        store.put(&key("balance_sheet"), doc(json!({"assets": 1})), None, None).unwrap();
        store.put(&key("cashflow"), doc(json!({"fcf": 2})), None, None).unwrap();
        assert!(dir.path().join("AAPL/annuals.json").exists());
        assert!(!dir.path().join("AAPL/cashflow.json").exists());

        store.delete(&key("balance_sheet")).unwrap();
        let cashflow = store.get(&key("cashflow")).unwrap().unwrap();
        assert_eq!(cashflow.payload, Payload::Document(json!({"fcf": 2})));

        store.delete(&key("cashflow")).unwrap();
        assert!(!dir.path().join("AAPL/annuals.json").exists());
    }

    #[test]
    fn unit_names_are_reserved() {
        let (_dir, _clock, store) = store();
        assert!(matches!(
            store.put(&key("annuals"), doc(json!({})), None, None),
            Err(CacheError::InvalidArgument(_))
        ));
    }

    #[test]
    fn symbols_and_entries_list_the_cache() {
        let (_dir, _clock, store) = store();
        store.put(&key("info"), doc(json!({})), None, None).unwrap();
        store.put(&key("financials"), doc(json!({})), None, None).unwrap();
        store
            .put(&CacheKey::new("msft", "info").unwrap(), doc(json!({})), None, None)
            .unwrap();

        assert_eq!(store.symbols().unwrap(), vec!["AAPL", "MSFT"]);
        let entries = store.entries("AAPL").unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["financials", "info"]);
        assert_eq!(entries[0].packed_in, Some("annuals"));
    }

    #[test]
    fn quarantine_moves_files_aside() {
        let (dir, _clock, store) = store();
        let k = key("history-1d");
        store.put(&k, Some(Payload::Table(table())), None, None).unwrap();
        store.quarantine(&k).unwrap();
        assert!(store.get(&k).unwrap().is_none());
        assert!(dir.path().join("AAPL/history-1d.parquet.quarantined").exists());
    }
}
