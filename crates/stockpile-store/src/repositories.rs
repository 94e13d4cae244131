use crate::layout::StoreLayout;
use crate::StoreError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use stockpile_schema::Repository;
use std::fs;
use std::path::PathBuf;
use uuid::Uuid;

/// A configured repository and the last snapshot fetched from it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RepositoryRecord {
    pub id: Uuid,
    /// URI of the repository manifest.
    pub address: String,
    pub title: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Bearer token sent with every request to this repository.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<Repository>,
}

fn default_enabled() -> bool {
    true
}

impl RepositoryRecord {
    pub fn new(address: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            address: address.into(),
            title: title.into(),
            enabled: true,
            token: None,
            last_updated: None,
            snapshot: None,
        }
    }
}

/// One JSON file per repository under `state/repositories/`.
pub struct RepositoryStore {
    layout: StoreLayout,
}

impl RepositoryStore {
    pub fn new(layout: StoreLayout) -> Self {
        Self { layout }
    }

    fn path(&self, id: &Uuid) -> PathBuf {
        self.layout.repositories_dir().join(format!("{id}.json"))
    }

    pub fn put(&self, record: &RepositoryRecord) -> Result<(), StoreError> {
        let dir = self.layout.repositories_dir();
        fs::create_dir_all(&dir)?;
        let content = serde_json::to_string_pretty(record)?;
        crate::write_atomic(&dir, &self.path(&record.id), content.as_bytes())
    }

    pub fn get(&self, id: &Uuid) -> Result<RepositoryRecord, StoreError> {
        let path = self.path(id);
        if !path.exists() {
            return Err(StoreError::RepositoryNotFound(id.to_string()));
        }
        let content = fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn exists(&self, id: &Uuid) -> bool {
        self.path(id).exists()
    }

    pub fn remove(&self, id: &Uuid) -> Result<(), StoreError> {
        let path = self.path(id);
        if !path.exists() {
            return Err(StoreError::RepositoryNotFound(id.to_string()));
        }
        fs::remove_file(path)?;
        Ok(())
    }

    /// All readable records, sorted by title. Corrupt files are skipped
    /// with a warning.
    pub fn list(&self) -> Result<Vec<RepositoryRecord>, StoreError> {
        let mut results = Vec::new();
        for entry in self.list_with_errors()? {
            match entry {
                Ok(record) => results.push(record),
                Err((name, e)) => {
                    tracing::warn!("skipping corrupted repository entry '{name}': {e}");
                }
            }
        }
        results.sort_by(|a, b| a.title.cmp(&b.title).then(a.id.cmp(&b.id)));
        Ok(results)
    }

    /// Like `list()`, but returns per-entry `Result`s so callers can report
    /// individual corruption errors.
    #[allow(clippy::type_complexity)]
    pub fn list_with_errors(
        &self,
    ) -> Result<Vec<Result<RepositoryRecord, (String, StoreError)>>, StoreError> {
        let dir = self.layout.repositories_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut results = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(stem) = name.strip_suffix(".json") else {
                continue;
            };
            let Ok(id) = Uuid::parse_str(stem) else {
                continue;
            };
            match self.get(&id) {
                Ok(record) => results.push(Ok(record)),
                Err(e) => results.push(Err((name, e))),
            }
        }
        Ok(results)
    }

    /// Find a repository by UUID, UUID prefix, title or address.
    pub fn resolve(&self, key: &str) -> Result<RepositoryRecord, StoreError> {
        let all = self.list()?;
        if let Ok(id) = Uuid::parse_str(key) {
            if let Some(r) = all.iter().find(|r| r.id == id) {
                return Ok(r.clone());
            }
        }
        let mut matches = all.into_iter().filter(|r| {
            r.title == key || r.address == key || r.id.to_string().starts_with(key)
        });
        match (matches.next(), matches.next()) {
            (Some(r), None) => Ok(r),
            (Some(_), Some(_)) => Err(StoreError::AmbiguousRepository(key.to_owned())),
            (None, _) => Err(StoreError::RepositoryNotFound(key.to_owned())),
        }
    }
}
