//! Keyed lookup collaborator.
//!
//! The `lookup` operation only sees the narrow [`KeyedLookup`] interface;
//! where the mapping lives (memory, a database, a service) is up to the
//! implementation. Implementations must tolerate concurrent readers.

use crate::error::{PipelineError, Result, ResultExt as _};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use tracing::info;

/// Read-only key → value mapping.
pub trait KeyedLookup: Send + Sync + fmt::Debug {
    /// Mapped value for `key`; `None` is a normal outcome.
    fn get(&self, key: &str) -> Option<String>;

    /// Batched form of [`KeyedLookup::get`], one result per key, in order.
    fn get_many(&self, keys: &[&str]) -> Vec<Option<String>> {
        keys.iter().map(|key| self.get(key)).collect()
    }
}

/// In-memory mapping table.
#[derive(Debug, Clone, Default)]
pub struct MemoryLookup {
    map: HashMap<String, String>,
}

impl MemoryLookup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from pairs; later pairs replace earlier ones with the same key.
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut lookup = Self::new();
        for (key, value) in pairs {
            lookup.insert(key, value);
        }
        lookup
    }

    /// Load `key_column → value_column` from a CSV mapping file. Keys and
    /// values are trimmed, pairs with a blank side are ignored, and later rows
    /// win.
    pub fn from_csv(path: &Path, key_column: &str, value_column: &str) -> Result<Self> {
        let mut reader = csv::Reader::from_path(path).for_source(path)?;
        let headers = reader.headers().for_source(path)?.clone();
        let position = |name: &str| {
            headers
                .iter()
                .position(|h| h == name)
                .ok_or_else(|| PipelineError::MissingColumn {
                    path: path.to_path_buf(),
                    column: name.to_owned(),
                })
        };
        let key_idx = position(key_column)?;
        let value_idx = position(value_column)?;

        let mut lookup = Self::new();
        let mut pairs = 0_usize;
        for record in reader.records() {
            let record = record.for_source(path)?;
            let key = record.get(key_idx).unwrap_or_default().trim();
            let value = record.get(value_idx).unwrap_or_default().trim();
            if key.is_empty() || value.is_empty() {
                continue;
            }
            lookup.insert(key, value);
            pairs += 1;
        }
        info!(
            path = %path.display(),
            pairs,
            unique = lookup.len(),
            "Loaded lookup mapping"
        );
        Ok(lookup)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.map.insert(key.into(), value.into());
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl KeyedLookup for MemoryLookup {
    fn get(&self, key: &str) -> Option<String> {
        self.map.get(key).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_csv_ignores_blank_pairs_and_later_rows_win() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("mapping.csv");
        std::fs::write(&path, "hash,phone\n h1 ,+111\nh2,\n,+333\nh1,+999\n")?;

        let lookup = MemoryLookup::from_csv(&path, "hash", "phone")?;
        assert_eq!(lookup.len(), 1);
        assert_eq!(lookup.get("h1").as_deref(), Some("+999"));
        assert_eq!(lookup.get("h2"), None);
        Ok(())
    }

    #[test]
    fn test_missing_mapping_column() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("mapping.csv");
        std::fs::write(&path, "hash\nh1\n")?;
        let err = MemoryLookup::from_csv(&path, "hash", "phone").expect_err("no value column");
        assert!(matches!(err, PipelineError::MissingColumn { column, .. } if column == "phone"));
        Ok(())
    }

    #[test]
    fn test_get_many_preserves_order() {
        let lookup = MemoryLookup::from_pairs([("a", "1"), ("b", "2")]);
        assert_eq!(
            lookup.get_many(&["b", "x", "a"]),
            vec![Some("2".to_owned()), None, Some("1".to_owned())]
        );
    }
}
