//! Core engine for Stockpile.
//!
//! Ties the schema, store, remote and installer crates together into the
//! [`Inventory`]: the live view of every configured repository's items and
//! the update, install and uninstall pipelines that change it. Pipelines are
//! built from step-logging [`Task`]s, so every run reports a full audit trail
//! in its [`Outcome`].

pub mod concurrency;
pub mod config;
pub mod inventory;
pub mod lifecycle;
pub mod merge;
pub mod messages;
pub mod pipeline;
pub mod retry;
pub mod task;
pub mod throttle;

pub use concurrency::{install_signal_handler, shutdown_requested, InventoryLock};
pub use config::Settings;
pub use inventory::{
    Inventory, InventoryBuilder, InventoryEvent, OperationCompletion, RepositoryInfo,
    UpdateCompletion,
};
pub use lifecycle::{finish, validate_start, ItemState, Operation, RepositoryState};
pub use merge::{merge_repository, InventoryItem, ItemView, MergeEvent};
pub use messages::{EnglishMessages, Messages};
pub use pipeline::{install_task, uninstall_task, InstallJob, PipelineOptions};
pub use retry::{pause, retrying, AttemptInfo};
pub use task::{Execution, Outcome, OutcomeStatus, Services, Step, StepError, StepResult, Task};
pub use throttle::{CountThrottle, TimeThrottle};

use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("manifest error: {0}")]
    Manifest(#[from] stockpile_schema::ManifestError),
    #[error("store error: {0}")]
    Store(#[from] stockpile_store::StoreError),
    #[error("remote error: {0}")]
    Remote(#[from] stockpile_remote::RemoteError),
    #[error("installer error: {0}")]
    Installer(#[from] stockpile_installer::InstallerError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("invalid settings: {0}")]
    Settings(#[from] toml::de::Error),
    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },
    #[error("item not found: {0}")]
    ItemNotFound(String),
    #[error("repository id changed: expected {expected}, found {found}")]
    IdMismatch { expected: Uuid, found: Uuid },
    #[error("installation failed: {0}")]
    InstallFailed(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("{0} has an operation in progress")]
    Busy(String),
}

impl CoreError {
    /// Short machine-readable tag, used as the error code of failed steps.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Manifest(_) => "manifest",
            Self::Store(stockpile_store::StoreError::ReservationUnavailable(_)) => {
                "reservation-unavailable"
            }
            Self::Store(stockpile_store::StoreError::HashMismatch { .. }) => "hash-mismatch",
            Self::Store(_) | Self::Io(_) | Self::Serialization(_) => "storage",
            Self::Remote(e) => e.code(),
            Self::Installer(e) => e.code(),
            Self::Settings(_) | Self::Configuration(_) => "configuration",
            Self::InvalidTransition { .. } => "invalid-transition",
            Self::ItemNotFound(_) => "not-found",
            Self::IdMismatch { .. } => "id-mismatch",
            Self::InstallFailed(_) => "install-failed",
            Self::Busy(_) => "busy",
        }
    }
}
