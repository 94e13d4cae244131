use crate::layout::StoreLayout;
use crate::StoreError;
use stockpile_schema::{Clock, ContentHash, ProgressValue, RateCounter};
use std::collections::HashSet;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;

/// File extension of cached package files.
pub const PACKAGE_EXTENSION: &str = "pkg";
const CHUNK_SIZE: usize = 4096;

/// Result of streaming a file through SHA-256.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyOutcome {
    Verified(PathBuf),
    Mismatch { actual: ContentHash },
    Cancelled,
}

/// A cached package file removed by [`ContentStore::clear`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClearedFile {
    pub file: PathBuf,
    pub hash: ContentHash,
    pub size: u64,
}

#[derive(Debug)]
struct Slots {
    dir: PathBuf,
    reserved: Mutex<HashSet<ContentHash>>,
}

impl Slots {
    fn release(&self, hash: &ContentHash) {
        self.reserved
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(hash);
    }
}

/// Hash-indexed package cache with per-hash exclusive reservations.
///
/// At most one [`Reservation`] exists per content hash at any time. The
/// reservation map is only locked for the insert/remove itself, never
/// across file I/O. Clones share the same reservation map.
#[derive(Debug, Clone)]
pub struct ContentStore {
    slots: Arc<Slots>,
}

/// Exclusive claim on the file slot of one content hash.
///
/// The slot is released when the reservation is dropped, on every exit
/// path including panics and early returns.
#[derive(Debug)]
pub struct Reservation {
    slots: Arc<Slots>,
    hash: ContentHash,
    file: PathBuf,
}

impl Reservation {
    pub fn hash(&self) -> &ContentHash {
        &self.hash
    }

    /// Where the package for this hash lives (it may not exist yet).
    pub fn file(&self) -> &Path {
        &self.file
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.slots.release(&self.hash);
        debug!("released reservation {}", self.hash.short());
    }
}

impl ContentStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            slots: Arc::new(Slots {
                dir: dir.into(),
                reserved: Mutex::new(HashSet::new()),
            }),
        }
    }

    pub fn open(layout: &StoreLayout) -> Self {
        Self::new(layout.packages_dir())
    }

    pub fn dir(&self) -> &Path {
        &self.slots.dir
    }

    pub fn file_for(&self, hash: &ContentHash) -> PathBuf {
        self.slots.dir.join(format!("{hash}.{PACKAGE_EXTENSION}"))
    }

    pub fn is_reserved(&self, hash: &ContentHash) -> bool {
        self.slots
            .reserved
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(hash)
    }

    /// Claim the slot for `hash`, failing if another holder has it.
    pub fn reserve(&self, hash: &ContentHash) -> Result<Reservation, StoreError> {
        let inserted = self
            .slots
            .reserved
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(hash.clone());
        if !inserted {
            return Err(StoreError::ReservationUnavailable(hash.clone()));
        }
        debug!("reserved {}", hash.short());
        Ok(Reservation {
            slots: Arc::clone(&self.slots),
            hash: hash.clone(),
            file: self.file_for(hash),
        })
    }

    /// Run `body` while holding the reservation for `hash`.
    pub fn with_key<T>(
        &self,
        hash: &ContentHash,
        body: impl FnOnce(&Reservation) -> T,
    ) -> Result<T, StoreError> {
        let reservation = self.reserve(hash)?;
        Ok(body(&reservation))
    }

    /// Verify the reserved file against the reservation's hash.
    pub fn verify(
        &self,
        reservation: &Reservation,
        major: Option<ProgressValue>,
        clock: &dyn Clock,
        should_cancel: &dyn Fn() -> bool,
        on_progress: &mut dyn FnMut(Option<ProgressValue>, ProgressValue),
    ) -> Result<VerifyOutcome, StoreError> {
        verify_file(
            reservation.file(),
            reservation.hash(),
            major,
            clock,
            should_cancel,
            on_progress,
        )
    }

    /// Cached package files, sorted by hash. Names that are not
    /// `<hash>.pkg` (temporary downloads, stray files) are ignored.
    pub fn list(&self) -> Result<Vec<(ContentHash, PathBuf)>, StoreError> {
        let dir = self.dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut entries = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name();
            if let Some(hash) = name.to_str().and_then(hash_of_file_name) {
                entries.push((hash, entry.path()));
            }
        }
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(entries)
    }

    /// Delete every cached package that nobody currently holds.
    pub fn clear(&self) -> Result<Vec<ClearedFile>, StoreError> {
        let mut cleared = Vec::new();
        for (hash, file) in self.list()? {
            let Ok(_reservation) = self.reserve(&hash) else {
                debug!("skipping reserved package {}", hash.short());
                continue;
            };
            let size = fs::metadata(&file)?.len();
            fs::remove_file(&file)?;
            cleared.push(ClearedFile { file, hash, size });
        }
        Ok(cleared)
    }
}

fn hash_of_file_name(name: &str) -> Option<ContentHash> {
    let stem = name.strip_suffix(PACKAGE_EXTENSION)?.strip_suffix('.')?;
    ContentHash::parse(stem).ok()
}

/// Stream `path` through SHA-256 in 4 KiB chunks and compare against
/// `expected`.
///
/// `should_cancel` is polled before every chunk. `on_progress` receives a
/// definite byte count after every chunk; the rate is resampled at most
/// once per second from `clock`.
pub fn verify_file(
    path: &Path,
    expected: &ContentHash,
    major: Option<ProgressValue>,
    clock: &dyn Clock,
    should_cancel: &dyn Fn() -> bool,
    on_progress: &mut dyn FnMut(Option<ProgressValue>, ProgressValue),
) -> Result<VerifyOutcome, StoreError> {
    use sha2::{Digest, Sha256};

    let mut file = fs::File::open(path)?;
    let total = file.metadata()?.len();
    let mut hasher = Sha256::new();
    let mut rate = RateCounter::new(clock.now_millis());
    let mut buf = [0u8; CHUNK_SIZE];
    let mut current: u64 = 0;

    loop {
        if should_cancel() {
            debug!("verification of {} cancelled", path.display());
            return Ok(VerifyOutcome::Cancelled);
        }
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        current += n as u64;
        let per_second = rate.update(clock.now_millis(), current);
        on_progress(major, ProgressValue::definite(current, per_second, total));
    }
    if current == 0 {
        on_progress(major, ProgressValue::definite(0, 0, total));
    }

    let actual = ContentHash::from_digest(&hasher.finalize());
    if actual == *expected {
        Ok(VerifyOutcome::Verified(path.to_path_buf()))
    } else {
        Ok(VerifyOutcome::Mismatch { actual })
    }
}
