use crate::layout::StoreLayout;
use crate::StoreError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use stockpile_schema::ItemId;
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};

/// What is known about one locally installed package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstalledRecord {
    pub version_code: u64,
    pub version_name: String,
    pub last_updated: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct InstalledFile {
    #[serde(default)]
    items: BTreeMap<ItemId, InstalledRecord>,
}

/// Persisted map of installed package id to [`InstalledRecord`].
///
/// Every mutation rewrites `installed.json` atomically. The in-process
/// mutex serializes read-modify-write cycles; cross-process exclusion is
/// the caller's `InventoryLock`.
#[derive(Debug)]
pub struct InstalledStore {
    path: PathBuf,
    dir: PathBuf,
    guard: Mutex<()>,
}

impl InstalledStore {
    pub fn new(layout: &StoreLayout) -> Self {
        Self {
            path: layout.installed_file(),
            dir: layout.state_dir(),
            guard: Mutex::new(()),
        }
    }

    pub fn load(&self) -> Result<BTreeMap<ItemId, InstalledRecord>, StoreError> {
        let _g = self.guard.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(self.read()?.items)
    }

    pub fn get(&self, id: &ItemId) -> Result<Option<InstalledRecord>, StoreError> {
        Ok(self.load()?.remove(id))
    }

    /// Record `id` as installed. Returns the record it replaced, if any.
    pub fn put(
        &self,
        id: &ItemId,
        record: InstalledRecord,
    ) -> Result<Option<InstalledRecord>, StoreError> {
        let _g = self.guard.lock().unwrap_or_else(PoisonError::into_inner);
        let mut file = self.read()?;
        let previous = file.items.insert(id.clone(), record);
        self.write(&file)?;
        Ok(previous)
    }

    /// Forget `id`. Returns the removed record, or `None` if it was not installed.
    pub fn remove(&self, id: &ItemId) -> Result<Option<InstalledRecord>, StoreError> {
        let _g = self.guard.lock().unwrap_or_else(PoisonError::into_inner);
        let mut file = self.read()?;
        let previous = file.items.remove(id);
        if previous.is_some() {
            self.write(&file)?;
        }
        Ok(previous)
    }

    fn read(&self) -> Result<InstalledFile, StoreError> {
        if !self.path.exists() {
            return Ok(InstalledFile::default());
        }
        let content = fs::read_to_string(&self.path)?;
        Ok(serde_json::from_str(&content)?)
    }

    fn write(&self, file: &InstalledFile) -> Result<(), StoreError> {
        fs::create_dir_all(&self.dir)?;
        let content = serde_json::to_string_pretty(file)?;
        crate::write_atomic(&self.dir, &self.path, content.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_store() -> (tempfile::TempDir, InstalledStore) {
        let dir = tempfile::tempdir().unwrap();
        let layout = StoreLayout::new(dir.path());
        layout.initialize().unwrap();
        let store = InstalledStore::new(&layout);
        (dir, store)
    }

    fn record(version_code: u64) -> InstalledRecord {
        InstalledRecord {
            version_code,
            version_name: format!("{version_code}.0"),
            last_updated: DateTime::<Utc>::UNIX_EPOCH,
        }
    }

    #[test]
    fn empty_store_loads_empty_map() {
        let (_dir, store) = test_store();
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn put_get_roundtrip() {
        let (_dir, store) = test_store();
        let id = ItemId::new("org.example.editor");
        assert_eq!(store.put(&id, record(3)).unwrap(), None);
        assert_eq!(store.get(&id).unwrap(), Some(record(3)));
    }

    #[test]
    fn put_returns_previous_record() {
        let (_dir, store) = test_store();
        let id = ItemId::new("a");
        store.put(&id, record(1)).unwrap();
        assert_eq!(store.put(&id, record(2)).unwrap(), Some(record(1)));
        assert_eq!(store.load().unwrap().len(), 1);
    }

    #[test]
    fn remove_missing_is_none() {
        let (_dir, store) = test_store();
        assert_eq!(store.remove(&ItemId::new("ghost")).unwrap(), None);
    }

    #[test]
    fn state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StoreLayout::new(dir.path());
        layout.initialize().unwrap();
        InstalledStore::new(&layout)
            .put(&ItemId::new("a"), record(5))
            .unwrap();
        let reopened = InstalledStore::new(&layout);
        assert_eq!(reopened.get(&ItemId::new("a")).unwrap(), Some(record(5)));
    }

    #[test]
    fn corrupt_file_is_an_error() {
        let (dir, store) = test_store();
        fs::write(StoreLayout::new(dir.path()).installed_file(), "NOT JSON").unwrap();
        assert!(matches!(store.load(), Err(StoreError::Serialization(_))));
    }
}
