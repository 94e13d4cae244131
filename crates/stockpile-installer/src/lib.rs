//! Installer backends for Stockpile.
//!
//! An [`Installer`] applies a verified package file to the host and reports
//! the outcome through a [`Completion`]. [`InstalledItems`] is the host's
//! view of what is installed, with change notifications. Two backends are
//! provided: [`DirectoryInstaller`], which unpacks into the store's
//! `installed/` directory, and [`MockInstaller`] for tests.

pub mod backend;
pub mod completion;
pub mod directory;
pub mod mock;

pub use backend::{
    select_installer, InstallStatus, InstalledEvent, InstalledItems, InstalledListener,
    Installer, InstallerHandle, Listeners,
};
pub use completion::Completion;
pub use directory::DirectoryInstaller;
pub use mock::{MockBehavior, MockCall, MockInstaller};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum InstallerError {
    #[error("installer I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("installer '{0}' is not available")]
    Unavailable(String),
    #[error("store error: {0}")]
    Store(#[from] stockpile_store::StoreError),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl InstallerError {
    /// Short failure code reported through [`InstallStatus::Failed`].
    pub fn code(&self) -> &'static str {
        match self {
            InstallerError::Io(_) | InstallerError::Store(_) | InstallerError::Serialization(_) => {
                "storage"
            }
            InstallerError::Unavailable(_) => "unavailable",
        }
    }
}
