use crate::completion::Completion;
use crate::InstallerError;
use serde::{Deserialize, Serialize};
use stockpile_schema::ItemId;
use stockpile_store::{InstalledRecord, StoreLayout};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

/// Final state of an install or uninstall request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "code", rename_all = "snake_case")]
pub enum InstallStatus {
    Succeeded,
    Cancelled,
    /// The installer refused or failed; the code is installer-specific
    /// (`conflict`, `storage`, `invalid`, `not-installed`, ...).
    Failed(String),
}

impl fmt::Display for InstallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstallStatus::Succeeded => write!(f, "succeeded"),
            InstallStatus::Cancelled => write!(f, "cancelled"),
            InstallStatus::Failed(code) => write!(f, "failed ({code})"),
        }
    }
}

/// Applies verified package files to the host.
///
/// Both operations return immediately with a [`Completion`] that resolves
/// when the host reports the outcome.
pub trait Installer: Send + Sync {
    fn name(&self) -> &str;

    fn install(
        &self,
        id: &ItemId,
        version_code: u64,
        version_name: &str,
        file: &Path,
    ) -> Completion<InstallStatus>;

    fn uninstall(&self, id: &ItemId) -> Completion<InstallStatus>;

    /// Ask a running operation on `id` to stop. No-op if none is running.
    fn cancel(&self, id: &ItemId);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstalledEvent {
    Added(ItemId, InstalledRecord),
    Updated(ItemId, InstalledRecord),
    Removed(ItemId),
}

impl InstalledEvent {
    pub fn id(&self) -> &ItemId {
        match self {
            Self::Added(id, _) | Self::Updated(id, _) | Self::Removed(id) => id,
        }
    }
}

pub type InstalledListener = Box<dyn Fn(&InstalledEvent) + Send + Sync>;

/// The host's view of which packages are installed.
pub trait InstalledItems: Send + Sync {
    fn items(&self) -> BTreeMap<ItemId, InstalledRecord>;

    fn get(&self, id: &ItemId) -> Option<InstalledRecord> {
        self.items().remove(id)
    }

    /// Register a callback for every later change.
    fn subscribe(&self, listener: InstalledListener);
}

/// Listener registry shared by installer implementations.
#[derive(Default)]
pub struct Listeners {
    list: Mutex<Vec<InstalledListener>>,
}

impl Listeners {
    pub fn add(&self, listener: InstalledListener) {
        self.list
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    pub fn emit(&self, event: &InstalledEvent) {
        tracing::debug!("installed items changed: {event:?}");
        for listener in self
            .list
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
        {
            listener(event);
        }
    }
}

/// Apply `record` for `id` to `items` and return the event describing it.
pub(crate) fn record_installed(
    items: &mut BTreeMap<ItemId, InstalledRecord>,
    id: &ItemId,
    record: InstalledRecord,
) -> InstalledEvent {
    match items.insert(id.clone(), record.clone()) {
        Some(_) => InstalledEvent::Updated(id.clone(), record),
        None => InstalledEvent::Added(id.clone(), record),
    }
}

/// An installer together with the installed-items view it maintains.
#[derive(Clone)]
pub struct InstallerHandle {
    pub installer: Arc<dyn Installer>,
    pub installed: Arc<dyn InstalledItems>,
}

impl fmt::Debug for InstallerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstallerHandle")
            .field("installer", &self.installer.name())
            .finish_non_exhaustive()
    }
}

pub fn select_installer(
    name: &str,
    layout: &StoreLayout,
) -> Result<InstallerHandle, InstallerError> {
    match name {
        "directory" => {
            let backend = Arc::new(crate::directory::DirectoryInstaller::open(layout)?);
            Ok(InstallerHandle {
                installer: backend.clone(),
                installed: backend,
            })
        }
        "mock" => {
            let backend = Arc::new(crate::mock::MockInstaller::new());
            Ok(InstallerHandle {
                installer: backend.clone(),
                installed: backend,
            })
        }
        other => Err(InstallerError::Unavailable(other.to_owned())),
    }
}
