use crate::repository::{Repository, RepositoryItem};
use crate::types::SourceUri;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;
use uuid::Uuid;

/// Repository manifest format understood by this version.
pub const MANIFEST_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("failed to read manifest file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse manifest: {0}")]
    ParseJson(#[from] serde_json::Error),
    #[error("unsupported format_version: {0}, expected 1")]
    UnsupportedVersion(u32),
    #[error("repository title must not be empty")]
    EmptyTitle,
    #[error("item #{index} has an empty {field}")]
    EmptyField { index: usize, field: &'static str },
}

/// On-the-wire shape of a repository manifest (`repository.json`).
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct RepositoryManifest {
    pub format_version: u32,
    pub id: Uuid,
    pub title: String,
    pub updated: DateTime<Utc>,
    pub self_uri: SourceUri,
    #[serde(default)]
    pub items: Vec<RepositoryItem>,
}

impl RepositoryManifest {
    pub fn from_repository(repo: &Repository) -> Self {
        Self {
            format_version: MANIFEST_FORMAT_VERSION,
            id: repo.id,
            title: repo.title.clone(),
            updated: repo.updated,
            self_uri: repo.self_uri.clone(),
            items: repo.items.clone(),
        }
    }

    pub fn into_repository(self) -> Result<Repository, ManifestError> {
        if self.format_version != MANIFEST_FORMAT_VERSION {
            return Err(ManifestError::UnsupportedVersion(self.format_version));
        }
        if self.title.trim().is_empty() {
            return Err(ManifestError::EmptyTitle);
        }
        for (index, item) in self.items.iter().enumerate() {
            if item.id.is_empty() {
                return Err(ManifestError::EmptyField { index, field: "id" });
            }
            if item.source.is_empty() {
                return Err(ManifestError::EmptyField {
                    index,
                    field: "source",
                });
            }
        }
        Ok(Repository {
            id: self.id,
            title: self.title,
            updated: self.updated,
            self_uri: self.self_uri,
            items: self.items,
        })
    }
}

pub fn parse_repository_slice(input: &[u8]) -> Result<Repository, ManifestError> {
    let manifest: RepositoryManifest = serde_json::from_slice(input)?;
    manifest.into_repository()
}

pub fn parse_repository_str(input: &str) -> Result<Repository, ManifestError> {
    parse_repository_slice(input.as_bytes())
}

pub fn parse_repository_file(path: impl AsRef<Path>) -> Result<Repository, ManifestError> {
    let content = fs::read(path)?;
    parse_repository_slice(&content)
}

/// Serialize a repository as a pretty-printed manifest.
pub fn repository_to_json(repo: &Repository) -> Result<String, ManifestError> {
    Ok(serde_json::to_string_pretty(
        &RepositoryManifest::from_repository(repo),
    )?)
}
