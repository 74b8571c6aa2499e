//! On-disk layout of a symbol directory.
//!
//! Layout:
//! - `{root}/{SYMBOL}/{name}.json`: scalars, documents, packed units
//! - `{root}/{SYMBOL}/{name}.parquet`: price tables
//! - `{root}/{SYMBOL}/{name}.parquet.json`: envelope for the table next to it
//!
//! Writes go to `{file}.tmp` first and are renamed into place.

use crate::error::{CacheError, Result};
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

pub(crate) const ENVELOPE_SUFFIX: &str = ".parquet.json";
const PARQUET_SUFFIX: &str = ".parquet";
const JSON_SUFFIX: &str = ".json";
const TMP_SUFFIX: &str = ".tmp";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Representation {
    Json,
    Parquet,
}

impl Representation {
    pub fn data_path(self, dir: &Path, name: &str) -> PathBuf {
        match self {
            Representation::Json => dir.join(format!("{name}{JSON_SUFFIX}")),
            Representation::Parquet => dir.join(format!("{name}{PARQUET_SUFFIX}")),
        }
    }

    /// Every file that belongs to a record in this representation.
    pub fn files(self, dir: &Path, name: &str) -> Vec<PathBuf> {
        match self {
            Representation::Json => vec![self.data_path(dir, name)],
            Representation::Parquet => vec![
                self.data_path(dir, name),
                envelope_path(dir, name),
            ],
        }
    }
}

pub(crate) fn envelope_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{name}{ENVELOPE_SUFFIX}"))
}

/// Physical names in one symbol directory and how each is stored.
pub(crate) type SymbolIndex = HashMap<String, Representation>;

/// Scan a symbol directory once and classify every record file.
///
/// A name stored both as JSON and as Parquet is corruption: the store never
/// leaves both behind.
pub(crate) fn scan_symbol_dir(dir: &Path) -> Result<SymbolIndex> {
    let mut index = SymbolIndex::new();
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(index),
        Err(e) => return Err(CacheError::io(dir, e)),
    };

    for entry in entries {
        let entry = entry.map_err(|e| CacheError::io(dir, e))?;
        let file_name = entry.file_name();
        let Some(file_name) = file_name.to_str() else {
            continue;
        };

        let (name, repr) = if file_name.ends_with(TMP_SUFFIX) {
            tracing::debug!(file = %entry.path().display(), "ignoring leftover temp file");
            continue;
        } else if file_name.ends_with(ENVELOPE_SUFFIX) {
            continue;
        } else if let Some(stem) = file_name.strip_suffix(PARQUET_SUFFIX) {
            (stem, Representation::Parquet)
        } else if let Some(stem) = file_name.strip_suffix(JSON_SUFFIX) {
            (stem, Representation::Json)
        } else {
            continue;
        };

        if let Some(previous) = index.insert(name.to_string(), repr) {
            if previous != repr {
                return Err(CacheError::corruption(
                    dir.join(name),
                    "a single representation per record",
                    "both .json and .parquet files",
                ));
            }
        }
    }

    Ok(index)
}

/// Write `bytes` to `path` via a temp file and rename.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| CacheError::io(parent, e))?;
    }
    let tmp_path = tmp_path(path);

    let write = || -> std::io::Result<()> {
        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(bytes)?;
        file.sync_all()
    };
    if let Err(e) = write() {
        let _ = fs::remove_file(&tmp_path);
        return Err(CacheError::io(&tmp_path, e));
    }

    fs::rename(&tmp_path, path).map_err(|e| {
        // Clean up temp file on rename failure
        let _ = fs::remove_file(&tmp_path);
        CacheError::io(path, e)
    })
}

/// Read a file, mapping "not found" to `None`.
pub(crate) fn read_optional(path: &Path) -> Result<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(CacheError::io(path, e)),
    }
}

pub(crate) fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(CacheError::io(path, e)),
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(TMP_SUFFIX);
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_classifies_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("info.json"), "{}").unwrap();
        fs::write(dir.path().join("history-1d.parquet"), b"x").unwrap();
        fs::write(dir.path().join("history-1d.parquet.json"), "{}").unwrap();
        fs::write(dir.path().join("annuals.json.tmp"), "{}").unwrap();
        fs::write(dir.path().join("notes.txt"), "").unwrap();

        let index = scan_symbol_dir(dir.path()).unwrap();
        assert_eq!(index.len(), 2);
        assert_eq!(index["info"], Representation::Json);
        assert_eq!(index["history-1d"], Representation::Parquet);
    }

    #[test]
    fn scan_rejects_double_representation() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("history-1d.json"), "{}").unwrap();
        fs::write(dir.path().join("history-1d.parquet"), b"x").unwrap();

        let err = scan_symbol_dir(dir.path()).unwrap_err();
        assert!(matches!(err, CacheError::StoreCorruption { .. }));
    }

    #[test]
    fn scan_of_missing_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let index = scan_symbol_dir(&dir.path().join("NOPE")).unwrap();
        assert!(index.is_empty());
    }

    #[test]
    fn atomic_write_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("AAPL").join("info.json");
        write_atomic(&path, b"{\"a\":1}").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"{\"a\":1}");
        assert!(!tmp_path(&path).exists());
    }
}
