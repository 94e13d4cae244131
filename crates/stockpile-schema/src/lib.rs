//! Repository snapshots, content hashes, progress values and the manifest codec for Stockpile.
//!
//! This crate defines the value layer shared by every other crate: validated
//! SHA-256 content hashes (`ContentHash`), repository snapshots with their
//! newest-version view (`Repository::items_newest`), nested progress
//! reporting (`Progress`), an injectable clock with a byte-rate estimator,
//! and the JSON repository manifest (`parse_repository_str`).

pub mod clock;
pub mod hash;
pub mod manifest;
pub mod progress;
pub mod repository;
pub mod types;

pub use clock::{Clock, ManualClock, RateCounter, SystemClock};
pub use hash::{ContentHash, HashError, HASH_HEX_LEN};
pub use manifest::{
    parse_repository_file, parse_repository_slice, parse_repository_str, repository_to_json,
    ManifestError, RepositoryManifest, MANIFEST_FORMAT_VERSION,
};
pub use progress::{Progress, ProgressValue};
pub use repository::{Repository, RepositoryItem};
pub use types::{ItemId, SourceUri};
