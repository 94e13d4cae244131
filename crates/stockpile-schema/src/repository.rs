use crate::hash::ContentHash;
use crate::types::{ItemId, SourceUri};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// One installable package version published by a repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RepositoryItem {
    pub id: ItemId,
    /// Monotonic ordering key between versions of the same item.
    pub version_code: u64,
    pub version_name: String,
    pub name: String,
    pub source: SourceUri,
    pub hash: ContentHash,
}

impl RepositoryItem {
    /// Resolve `source` against the manifest location.
    ///
    /// Absolute URIs (anything with a scheme) are returned unchanged;
    /// relative ones replace the last path segment of `base`. A bare
    /// `scheme://host` base is treated as the repository root.
    pub fn resolve_source(&self, base: &str) -> String {
        if self.source.contains("://") {
            return self.source.to_string();
        }
        let relative = self.source.trim_start_matches('/');
        match base.rfind('/') {
            Some(idx) if !base[..idx].ends_with('/') && !base[..idx].ends_with(':') => {
                format!("{}{relative}", &base[..=idx])
            }
            _ => format!("{}/{relative}", base.trim_end_matches('/')),
        }
    }
}

/// An immutable snapshot of the packages a repository publishes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repository {
    pub id: Uuid,
    pub title: String,
    pub updated: DateTime<Utc>,
    pub self_uri: SourceUri,
    pub items: Vec<RepositoryItem>,
}

impl Repository {
    /// Newest version of each item id.
    ///
    /// Items are visited in list order; a later entry replaces an earlier
    /// one only when its `version_code` is strictly greater, so on a tie
    /// the first occurrence wins.
    pub fn items_newest(&self) -> BTreeMap<ItemId, RepositoryItem> {
        let mut newest: BTreeMap<ItemId, RepositoryItem> = BTreeMap::new();
        for item in &self.items {
            match newest.get(&item.id) {
                Some(current) if current.version_code >= item.version_code => {}
                _ => {
                    newest.insert(item.id.clone(), item.clone());
                }
            }
        }
        newest
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(id: &str, version_code: u64, name: &str) -> RepositoryItem {
        RepositoryItem {
            id: ItemId::new(id),
            version_code,
            version_name: format!("{version_code}.0"),
            name: name.to_owned(),
            source: SourceUri::new(format!("packages/{id}-{version_code}.pkg")),
            hash: ContentHash::of_bytes(format!("{id}{version_code}{name}").as_bytes()),
        }
    }

    fn repo(items: Vec<RepositoryItem>) -> Repository {
        Repository {
            id: Uuid::nil(),
            title: "test".to_owned(),
            updated: DateTime::<Utc>::UNIX_EPOCH,
            self_uri: SourceUri::new("https://repo.example.com/repository.json"),
            items,
        }
    }

    #[test]
    fn items_newest_picks_highest_version() {
        let r = repo(vec![item("a", 1, "x"), item("a", 3, "y"), item("a", 2, "z")]);
        let newest = r.items_newest();
        assert_eq!(newest.len(), 1);
        assert_eq!(newest[&ItemId::new("a")].version_code, 3);
    }

    #[test]
    fn items_newest_tie_keeps_first() {
        let r = repo(vec![item("a", 2, "first"), item("a", 2, "second")]);
        let newest = r.items_newest();
        assert_eq!(newest[&ItemId::new("a")].name, "first");
    }

    #[test]
    fn items_newest_keeps_distinct_ids() {
        let r = repo(vec![item("b", 1, "b"), item("a", 1, "a")]);
        let keys: Vec<_> = r.items_newest().into_keys().collect();
        assert_eq!(keys, vec!["a", "b"]);
    }

    #[test]
    fn resolve_relative_source() {
        let i = item("a", 1, "x");
        assert_eq!(
            i.resolve_source("https://repo.example.com/stable/repository.json"),
            "https://repo.example.com/stable/packages/a-1.pkg"
        );
    }

    #[test]
    fn resolve_absolute_source_unchanged() {
        let mut i = item("a", 1, "x");
        i.source = SourceUri::new("https://cdn.example.com/a.pkg");
        assert_eq!(
            i.resolve_source("https://repo.example.com/repository.json"),
            "https://cdn.example.com/a.pkg"
        );
    }

    #[test]
    fn resolve_against_bare_host() {
        let i = item("a", 1, "x");
        assert_eq!(
            i.resolve_source("http://127.0.0.1:8080"),
            "http://127.0.0.1:8080/packages/a-1.pkg"
        );
    }
}
