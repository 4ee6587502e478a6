//! The resolved-value store: a single table of `(key, value, proposal)`
//! rows. A row only ever moves forward, since an update lands iff its
//! proposal number is strictly greater than the committed one, and the
//! greatest committed proposal number across keys is recoverable after a
//! restart.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::errors::StoreError;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
struct Row<T> {
    value: T,
    proposal: u64,
}

/// Key/value rows with per-row proposal numbers, optionally persisted as a
/// JSON file.
pub struct KvStore<T> {
    rows: HashMap<String, Row<T>>,
    path: Option<PathBuf>,
}

impl<T> KvStore<T>
where
    T: Serialize + DeserializeOwned + Clone,
{
    /// A store that lives and dies with the process.
    pub fn in_memory() -> Self {
        KvStore {
            rows: HashMap::new(),
            path: None,
        }
    }

    /// Opens a file-backed store, creating it on first use.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let rows = if path.exists() {
            serde_json::from_str(&fs::read_to_string(&path)?)?
        } else {
            HashMap::new()
        };
        Ok(KvStore {
            rows,
            path: Some(path),
        })
    }

    pub fn get_value(&self, key: &str) -> Option<&T> {
        self.rows.get(key).map(|row| &row.value)
    }

    pub fn get_proposal(&self, key: &str) -> Option<u64> {
        self.rows.get(key).map(|row| row.proposal)
    }

    /// Writes the row iff `proposal` is strictly greater than the committed
    /// one, or the key is absent. Returns whether the row changed.
    pub fn commit(&mut self, key: &str, value: T, proposal: u64) -> Result<bool, StoreError> {
        let stale = self
            .rows
            .get(key)
            .map_or(false, |row| row.proposal >= proposal);
        if stale {
            return Ok(false);
        }

        self.rows.insert(key.to_string(), Row { value, proposal });
        self.persist()?;
        Ok(true)
    }

    /// The greatest proposal number committed across all keys, for crash
    /// recovery.
    pub fn get_last_proposal(&self) -> Option<u64> {
        self.rows.values().map(|row| row.proposal).max()
    }

    fn persist(&self) -> Result<(), StoreError> {
        if let Some(path) = &self.path {
            fs::write(path, serde_json::to_string_pretty(&self.rows)?)?;
        }
        Ok(())
    }
}
