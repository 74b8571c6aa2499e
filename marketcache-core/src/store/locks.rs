//! Per-file lock table.
//!
//! One mutex per `(symbol, physical name)`. Packed members share their
//! unit's lock, so every read-modify-write of a unit is serialized.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

#[derive(Debug, Default)]
pub(crate) struct LockTable {
    locks: Mutex<HashMap<(String, String), Arc<Mutex<()>>>>,
}

impl LockTable {
    pub fn handle(&self, symbol: &str, physical: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .entry((symbol.to_string(), physical.to_string()))
            .or_default()
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_file_shares_a_lock() {
        let table = LockTable::default();
        let a = table.handle("AAPL", "annuals");
        let b = table.handle("AAPL", "annuals");
        let c = table.handle("MSFT", "annuals");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
    }
}
