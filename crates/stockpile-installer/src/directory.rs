use crate::backend::{
    record_installed, InstallStatus, InstalledEvent, InstalledItems, InstalledListener, Installer,
    Listeners,
};
use crate::completion::Completion;
use crate::InstallerError;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use stockpile_schema::ItemId;
use stockpile_store::{InstalledRecord, InstalledStore, StoreLayout};
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use tracing::{debug, info, warn};

const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// Name of the package file inside an installed item's directory.
pub const INSTALLED_PACKAGE_FILE: &str = "package.pkg";
/// Name of the metadata file inside an installed item's directory.
pub const INSTALLED_META_FILE: &str = "item.json";

#[derive(Debug, Serialize, Deserialize)]
struct InstalledMeta {
    id: ItemId,
    version_code: u64,
    version_name: String,
}

struct Inner {
    root: PathBuf,
    store: InstalledStore,
    items: Mutex<BTreeMap<ItemId, InstalledRecord>>,
    listeners: Listeners,
    running: Mutex<HashMap<ItemId, Arc<AtomicBool>>>,
}

/// Installs packages by unpacking them into `installed/<id>/`.
///
/// Each operation runs on its own thread and resolves its [`Completion`]
/// when done. Installed facts are persisted through [`InstalledStore`] and
/// mirrored in memory so [`InstalledItems::items`] never touches disk.
/// At most one operation per item id runs at a time.
pub struct DirectoryInstaller {
    inner: Arc<Inner>,
}

impl DirectoryInstaller {
    pub fn open(layout: &StoreLayout) -> Result<Self, InstallerError> {
        let root = layout.install_dir();
        fs::create_dir_all(&root)?;
        let store = InstalledStore::new(layout);
        let items = store.load()?;
        debug!(
            "directory installer at {} with {} installed items",
            root.display(),
            items.len()
        );
        Ok(Self {
            inner: Arc::new(Inner {
                root,
                store,
                items: Mutex::new(items),
                listeners: Listeners::default(),
                running: Mutex::new(HashMap::new()),
            }),
        })
    }

    pub fn item_dir(&self, id: &ItemId) -> PathBuf {
        self.inner.root.join(id.as_str())
    }

    fn start(
        &self,
        id: &ItemId,
        job: impl FnOnce(&Inner, &AtomicBool) -> Result<InstallStatus, InstallerError>
            + Send
            + 'static,
    ) -> Completion<InstallStatus> {
        if !is_safe_id(id) {
            warn!("refusing unsafe item id {id:?}");
            return Completion::resolved(InstallStatus::Failed("invalid".to_owned()));
        }
        let flag = Arc::new(AtomicBool::new(false));
        {
            let mut running = self
                .inner
                .running
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if running.contains_key(id) {
                return Completion::resolved(InstallStatus::Failed("conflict".to_owned()));
            }
            running.insert(id.clone(), Arc::clone(&flag));
        }

        let completion = Completion::new();
        let done = completion.clone();
        let inner = Arc::clone(&self.inner);
        let id = id.clone();
        thread::spawn(move || {
            let status = match job(&inner, &flag) {
                Ok(status) => status,
                Err(e) => {
                    warn!("installer operation on {id} failed: {e}");
                    InstallStatus::Failed(e.code().to_owned())
                }
            };
            inner
                .running
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&id);
            done.complete(status);
        });
        completion
    }
}

impl Inner {
    fn install(
        &self,
        id: &ItemId,
        version_code: u64,
        version_name: &str,
        file: &Path,
        cancelled: &AtomicBool,
    ) -> Result<InstallStatus, InstallerError> {
        if !file.is_file() {
            return Ok(InstallStatus::Failed("invalid".to_owned()));
        }
        let staging = tempfile::Builder::new()
            .prefix(".staging-")
            .tempdir_in(&self.root)?;

        let mut src = File::open(file)?;
        let mut dst = File::create(staging.path().join(INSTALLED_PACKAGE_FILE))?;
        let mut buffer = vec![0u8; COPY_BUFFER_SIZE];
        loop {
            if cancelled.load(Ordering::SeqCst) {
                debug!("install of {id} cancelled");
                return Ok(InstallStatus::Cancelled);
            }
            let n = src.read(&mut buffer)?;
            if n == 0 {
                break;
            }
            dst.write_all(&buffer[..n])?;
        }
        dst.sync_all()?;
        let meta = InstalledMeta {
            id: id.clone(),
            version_code,
            version_name: version_name.to_owned(),
        };
        fs::write(
            staging.path().join(INSTALLED_META_FILE),
            serde_json::to_vec_pretty(&meta)?,
        )?;

        if cancelled.load(Ordering::SeqCst) {
            return Ok(InstallStatus::Cancelled);
        }
        let target = self.root.join(id.as_str());
        if target.exists() {
            fs::remove_dir_all(&target)?;
        }
        fs::rename(staging.path(), &target)?;

        let record = InstalledRecord {
            version_code,
            version_name: version_name.to_owned(),
            last_updated: Utc::now(),
        };
        self.store.put(id, record.clone())?;
        let event = {
            let mut items = self.items.lock().unwrap_or_else(PoisonError::into_inner);
            record_installed(&mut items, id, record)
        };
        info!("installed {id} {version_name} ({version_code})");
        self.listeners.emit(&event);
        Ok(InstallStatus::Succeeded)
    }

    fn uninstall(
        &self,
        id: &ItemId,
        cancelled: &AtomicBool,
    ) -> Result<InstallStatus, InstallerError> {
        if cancelled.load(Ordering::SeqCst) {
            return Ok(InstallStatus::Cancelled);
        }
        let known = self
            .items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(id);
        if !known {
            return Ok(InstallStatus::Failed("not-installed".to_owned()));
        }
        let target = self.root.join(id.as_str());
        if target.exists() {
            fs::remove_dir_all(&target)?;
        }
        self.store.remove(id)?;
        self.items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
        info!("uninstalled {id}");
        self.listeners.emit(&InstalledEvent::Removed(id.clone()));
        Ok(InstallStatus::Succeeded)
    }
}

/// Item ids become directory names; reject anything that could escape.
fn is_safe_id(id: &ItemId) -> bool {
    !id.is_empty()
        && !id.starts_with('.')
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
}

impl Installer for DirectoryInstaller {
    fn name(&self) -> &str {
        "directory"
    }

    fn install(
        &self,
        id: &ItemId,
        version_code: u64,
        version_name: &str,
        file: &Path,
    ) -> Completion<InstallStatus> {
        let version_name = version_name.to_owned();
        let file = file.to_path_buf();
        let item = id.clone();
        self.start(id, move |inner, cancelled| {
            inner.install(&item, version_code, &version_name, &file, cancelled)
        })
    }

    fn uninstall(&self, id: &ItemId) -> Completion<InstallStatus> {
        let item = id.clone();
        self.start(id, move |inner, cancelled| inner.uninstall(&item, cancelled))
    }

    fn cancel(&self, id: &ItemId) {
        if let Some(flag) = self
            .inner
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
        {
            flag.store(true, Ordering::SeqCst);
        }
    }
}

impl InstalledItems for DirectoryInstaller {
    fn items(&self) -> BTreeMap<ItemId, InstalledRecord> {
        self.inner
            .items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn subscribe(&self, listener: InstalledListener) {
        self.inner.listeners.add(listener);
    }
}
