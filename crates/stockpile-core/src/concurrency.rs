use crate::CoreError;
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info};

/// Exclusive advisory lock on `state/.lock`, held by processes that
/// mutate the inventory. The holder's pid is written into the file.
pub struct InventoryLock {
    file: File,
    path: PathBuf,
}

impl InventoryLock {
    /// Take the lock, waiting for another holder to release it.
    pub fn acquire(path: &Path) -> Result<Self, CoreError> {
        let file = open_lock_file(path)?;
        if file.try_lock_exclusive().is_err() {
            info!(
                "waiting for {} (held by pid {})",
                path.display(),
                read_holder(path).unwrap_or_else(|| "?".to_owned())
            );
            file.lock_exclusive()?;
        }
        Self::held(file, path)
    }

    /// Take the lock only if nobody holds it.
    pub fn try_acquire(path: &Path) -> Result<Option<Self>, CoreError> {
        let file = open_lock_file(path)?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(Self::held(file, path)?)),
            Err(_) => Ok(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn held(mut file: File, path: &Path) -> Result<Self, CoreError> {
        file.set_len(0)?;
        writeln!(file, "{}", std::process::id())?;
        debug!("acquired {}", path.display());
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }
}

fn open_lock_file(path: &Path) -> Result<File, CoreError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(path)?)
}

fn read_holder(path: &Path) -> Option<String> {
    let pid = fs::read_to_string(path).ok()?;
    let pid = pid.trim();
    (!pid.is_empty()).then(|| pid.to_owned())
}

impl Drop for InventoryLock {
    fn drop(&mut self) {
        let _ = self.file.set_len(0);
        let _ = FileExt::unlock(&self.file);
    }
}

static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

/// First Ctrl-C asks running operations to cancel; the second exits.
pub fn install_signal_handler() {
    let _ = ctrlc::set_handler(move || {
        if SHUTDOWN_REQUESTED.load(Ordering::SeqCst) {
            std::process::exit(4);
        }
        SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
        eprintln!("\ncancelling, press Ctrl-C again to exit immediately...");
    });
}

pub fn shutdown_requested() -> bool {
    SHUTDOWN_REQUESTED.load(Ordering::SeqCst)
}
