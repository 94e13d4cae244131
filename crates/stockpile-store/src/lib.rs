//! Package cache, verification, and persisted inventory state for Stockpile.
//!
//! This crate provides the storage layer: a hash-indexed `ContentStore` that
//! hands out at most one `Reservation` per content hash and verifies files by
//! streaming them through SHA-256, `InstalledStore` for locally installed
//! packages, `RepositoryStore` for configured repositories and their last
//! snapshot, and `StoreLayout` for directory structure management.

pub mod content;
pub mod installed;
pub mod integrity;
pub mod layout;
pub mod repositories;

pub use content::{
    verify_file, ClearedFile, ContentStore, Reservation, VerifyOutcome, PACKAGE_EXTENSION,
};
pub use installed::{InstalledRecord, InstalledStore};
pub use integrity::{verify_cache_integrity, IntegrityFailure, IntegrityReport};
pub use layout::{StoreLayout, STORE_FORMAT_VERSION};
pub use repositories::{RepositoryRecord, RepositoryStore};

use std::io::Write;
use std::path::Path;
use stockpile_schema::ContentHash;
use tempfile::NamedTempFile;
use thiserror::Error;

/// Fsync a directory to ensure that a preceding `rename()` is durable.
///
/// POSIX does not guarantee a rename survives a crash until the parent
/// directory itself has been synced.
pub(crate) fn fsync_dir(dir: &Path) -> Result<(), std::io::Error> {
    let f = std::fs::File::open(dir)?;
    f.sync_all()
}

/// Write `data` to `dest` through a temporary file in `dir` and an atomic rename.
pub(crate) fn write_atomic(dir: &Path, dest: &Path, data: &[u8]) -> Result<(), StoreError> {
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(data)?;
    tmp.as_file().sync_all()?;
    tmp.persist(dest).map_err(|e| StoreError::Io(e.error))?;
    fsync_dir(dir)?;
    Ok(())
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("package {0} is reserved by another operation")]
    ReservationUnavailable(ContentHash),
    #[error("hash mismatch: expected {expected}, got {actual}")]
    HashMismatch {
        expected: ContentHash,
        actual: ContentHash,
    },
    #[error("repository not found: {0}")]
    RepositoryNotFound(String),
    #[error("'{0}' matches more than one repository")]
    AmbiguousRepository(String),
    #[error("lock acquisition failed: {0}")]
    LockFailed(String),
    #[error("store format version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
