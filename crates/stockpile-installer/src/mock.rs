use crate::backend::{
    record_installed, InstallStatus, InstalledEvent, InstalledItems, InstalledListener, Installer,
    Listeners,
};
use crate::completion::Completion;
use chrono::{DateTime, Utc};
use stockpile_schema::ItemId;
use stockpile_store::InstalledRecord;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

/// How [`MockInstaller`] answers new requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockBehavior {
    /// Apply the change and resolve `Succeeded` immediately.
    Succeed,
    Fail(String),
    Cancel,
    /// Leave the request pending until a `report_*` call resolves it.
    Manual,
    /// Like `Manual`, but a cancel arrives too late: the pending request
    /// completes successfully instead.
    FinishOnCancel,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    Install {
        id: ItemId,
        version_code: u64,
        file: PathBuf,
        /// Contents of `file` at the time of the call, if readable.
        content: Option<Vec<u8>>,
    },
    Uninstall(ItemId),
    Cancel(ItemId),
}

#[derive(Debug, Clone)]
enum Pending {
    Install { version_code: u64, version_name: String },
    Uninstall,
}

/// Scriptable in-memory installer.
pub struct MockInstaller {
    behavior: Mutex<MockBehavior>,
    items: Mutex<BTreeMap<ItemId, InstalledRecord>>,
    pending: Mutex<HashMap<ItemId, (Pending, Completion<InstallStatus>)>>,
    calls: Mutex<Vec<MockCall>>,
    listeners: Listeners,
}

impl Default for MockInstaller {
    fn default() -> Self {
        Self {
            behavior: Mutex::new(MockBehavior::Succeed),
            items: Mutex::new(BTreeMap::new()),
            pending: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            listeners: Listeners::default(),
        }
    }
}

impl MockInstaller {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_behavior(&self, behavior: MockBehavior) {
        *self.behavior.lock().unwrap_or_else(PoisonError::into_inner) = behavior;
    }

    /// Seed an installed item without emitting an event.
    #[must_use]
    pub fn with_installed(self, id: &str, version_code: u64) -> Self {
        self.items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(ItemId::new(id), mock_record(version_code, &version_code.to_string()));
        self
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_pending(&self, id: &ItemId) -> bool {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(id)
    }

    /// The host finished installing `id`. Resolves a pending install.
    pub fn report_installed(&self, id: &ItemId, version_code: u64, version_name: &str) {
        let event = {
            let mut items = self.items.lock().unwrap_or_else(PoisonError::into_inner);
            record_installed(&mut items, id, mock_record(version_code, version_name))
        };
        self.listeners.emit(&event);
        self.resolve(id, InstallStatus::Succeeded);
    }

    /// The host removed `id`. Resolves a pending uninstall.
    pub fn report_removed(&self, id: &ItemId) {
        let removed = self
            .items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
            .is_some();
        if removed {
            self.listeners.emit(&InstalledEvent::Removed(id.clone()));
        }
        self.resolve(id, InstallStatus::Succeeded);
    }

    pub fn report_failed(&self, id: &ItemId, code: &str) {
        self.resolve(id, InstallStatus::Failed(code.to_owned()));
    }

    fn resolve(&self, id: &ItemId, status: InstallStatus) {
        let entry = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
        if let Some((_, completion)) = entry {
            completion.complete(status);
        }
    }

    fn record(&self, call: MockCall) {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(call);
    }

    fn submit(&self, id: &ItemId, op: Pending) -> Completion<InstallStatus> {
        let behavior = self
            .behavior
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match behavior {
            MockBehavior::Succeed => {
                match op {
                    Pending::Install {
                        version_code,
                        version_name,
                    } => self.report_installed(id, version_code, &version_name),
                    Pending::Uninstall => {
                        let known = self
                            .items
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .contains_key(id);
                        if !known {
                            return Completion::resolved(InstallStatus::Failed(
                                "not-installed".to_owned(),
                            ));
                        }
                        self.report_removed(id);
                    }
                }
                Completion::resolved(InstallStatus::Succeeded)
            }
            MockBehavior::Fail(code) => Completion::resolved(InstallStatus::Failed(code)),
            MockBehavior::Cancel => Completion::resolved(InstallStatus::Cancelled),
            MockBehavior::Manual | MockBehavior::FinishOnCancel => {
                let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
                if pending.contains_key(id) {
                    return Completion::resolved(InstallStatus::Failed("conflict".to_owned()));
                }
                let completion = Completion::new();
                pending.insert(id.clone(), (op, completion.clone()));
                completion
            }
        }
    }
}

fn mock_record(version_code: u64, version_name: &str) -> InstalledRecord {
    InstalledRecord {
        version_code,
        version_name: version_name.to_owned(),
        last_updated: DateTime::<Utc>::UNIX_EPOCH,
    }
}

impl Installer for MockInstaller {
    fn name(&self) -> &str {
        "mock"
    }

    fn install(
        &self,
        id: &ItemId,
        version_code: u64,
        version_name: &str,
        file: &Path,
    ) -> Completion<InstallStatus> {
        self.record(MockCall::Install {
            id: id.clone(),
            version_code,
            file: file.to_path_buf(),
            content: std::fs::read(file).ok(),
        });
        self.submit(
            id,
            Pending::Install {
                version_code,
                version_name: version_name.to_owned(),
            },
        )
    }

    fn uninstall(&self, id: &ItemId) -> Completion<InstallStatus> {
        self.record(MockCall::Uninstall(id.clone()));
        self.submit(id, Pending::Uninstall)
    }

    fn cancel(&self, id: &ItemId) {
        self.record(MockCall::Cancel(id.clone()));
        let behavior = self
            .behavior
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if behavior != MockBehavior::FinishOnCancel {
            self.resolve(id, InstallStatus::Cancelled);
            return;
        }
        let op = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .map(|(op, _)| op.clone());
        match op {
            Some(Pending::Install {
                version_code,
                version_name,
            }) => self.report_installed(id, version_code, &version_name),
            Some(Pending::Uninstall) => self.report_removed(id),
            None => {}
        }
    }
}

impl InstalledItems for MockInstaller {
    fn items(&self) -> BTreeMap<ItemId, InstalledRecord> {
        self.items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn subscribe(&self, listener: InstalledListener) {
        self.listeners.add(listener);
    }
}
