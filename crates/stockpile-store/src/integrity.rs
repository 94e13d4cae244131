use crate::content::{ContentStore, VerifyOutcome};
use crate::StoreError;
use stockpile_schema::{Clock, ContentHash};

#[derive(Debug, Default)]
pub struct IntegrityReport {
    pub checked: usize,
    pub passed: usize,
    pub failed: Vec<IntegrityFailure>,
    /// Packages held by another reservation and therefore not checked.
    pub skipped: Vec<ContentHash>,
}

#[derive(Debug)]
pub struct IntegrityFailure {
    pub hash: ContentHash,
    pub reason: String,
}

/// Re-hash every cached package and compare it against its file name.
pub fn verify_cache_integrity(
    store: &ContentStore,
    clock: &dyn Clock,
) -> Result<IntegrityReport, StoreError> {
    let mut report = IntegrityReport::default();

    for (hash, _) in store.list()? {
        let reservation = match store.reserve(&hash) {
            Ok(r) => r,
            Err(StoreError::ReservationUnavailable(_)) => {
                report.skipped.push(hash);
                continue;
            }
            Err(e) => return Err(e),
        };
        report.checked += 1;
        match store.verify(&reservation, None, clock, &|| false, &mut |_, _| {}) {
            Ok(VerifyOutcome::Verified(_)) => report.passed += 1,
            Ok(VerifyOutcome::Mismatch { actual }) => {
                report.failed.push(IntegrityFailure {
                    hash,
                    reason: format!("package hash mismatch: got {actual}"),
                });
            }
            Ok(VerifyOutcome::Cancelled) => {}
            Err(e) => {
                report.failed.push(IntegrityFailure {
                    hash,
                    reason: format!("package read error: {e}"),
                });
            }
        }
    }

    Ok(report)
}
