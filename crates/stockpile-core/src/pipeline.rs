//! Download, verify, install and clean up one package.
//!
//! The install chain is
//! `reserve -> download (retried) -> verify -> install -> delete`, where the
//! delete step runs whatever happened before it unless downloads are kept.
//! The content-store reservation for the package hash is held for the
//! whole chain and released when the chain returns.

use crate::messages::Messages;
use crate::retry::{pause, retrying, AttemptInfo};
use crate::task::{Execution, Step, StepError, StepResult, Task};
use crate::throttle::{CountThrottle, TimeThrottle};
use stockpile_installer::{Completion, InstallStatus};
use stockpile_remote::{fetch_to_file, FetchOutcome, HttpRequest};
use stockpile_schema::{ItemId, Progress, ProgressValue, RateCounter, RepositoryItem};
use stockpile_store::{verify_file, ContentStore, Reservation, StoreError, VerifyOutcome};
use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// How often a waiting step checks for cancellation.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How long a cancelled step waits for the installer's own verdict.
const CANCEL_GRACE: Duration = Duration::from_secs(30);

const STAGE_DOWNLOAD: u64 = 0;
const STAGE_VERIFY: u64 = 1;
const STAGE_INSTALL: u64 = 2;
const STAGES: u64 = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineOptions {
    /// Download attempts after the first.
    pub retries: u32,
    pub retry_pause: Duration,
    /// Skip the final delete step.
    pub keep_downloads: bool,
    /// Approximate number of progress events per download or verification.
    pub progress_updates: u64,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            retries: 3,
            retry_pause: Duration::from_secs(2),
            keep_downloads: false,
            progress_updates: 100,
        }
    }
}

/// A package to fetch and the request that fetches it.
#[derive(Debug, Clone)]
pub struct InstallJob {
    pub item: RepositoryItem,
    pub request: HttpRequest,
}

fn stage(index: u64) -> ProgressValue {
    ProgressValue::definite(index, 0, STAGES)
}

fn store_error(e: &StoreError) -> StepError {
    match e {
        StoreError::ReservationUnavailable(_) => {
            StepError::new("reservation-unavailable", e.to_string())
        }
        _ => StepError::new("storage", e.to_string()),
    }
}

fn install_result(status: InstallStatus, messages: &dyn Messages) -> StepResult<()> {
    match status {
        InstallStatus::Succeeded => StepResult::done((), messages.done()),
        InstallStatus::Cancelled => StepResult::Cancelled,
        InstallStatus::Failed(code) => {
            let message = messages.install_failure(&code);
            StepResult::Failed(StepError::new(code, message))
        }
    }
}

/// Build the full install chain for `job`.
pub fn install_task(store: ContentStore, job: InstallJob, options: PipelineOptions) -> Task<()> {
    Task::new(move |exec| {
        let m = exec.messages();
        let item = &job.item;
        let reservation = match store.reserve(&item.hash) {
            Ok(r) => Arc::new(r),
            Err(e) => {
                warn!("cannot reserve {}: {e}", item.hash.short());
                return StepResult::<()>::Failed(store_error(&e))
                    .into_outcome(m.reserve(&item.name), m);
            }
        };
        let reserved = Step::new(m.reserve(&item.name)).resolved(item.hash.short().to_owned());
        let file = reservation.file().to_path_buf();

        let verify_store = store.clone();
        let verify_slot = Arc::clone(&reservation);
        let verify_name = item.name.clone();
        let budget = options.progress_updates;
        let installed_item = item.clone();
        let chain = fetch_task(&job, Arc::clone(&reservation), &options)
            .and_then(move |()| {
                verify_task(
                    verify_store.clone(),
                    Arc::clone(&verify_slot),
                    verify_name.clone(),
                    budget,
                )
            })
            .and_then(move |path| install_step(installed_item.clone(), path));
        let chain = if options.keep_downloads {
            chain
        } else {
            chain.finally(cleanup_task(file, item.name.clone()))
        };

        let outcome = chain.evaluate(exec).after(vec![reserved]);
        info!("install pipeline for {} {}", item.id, outcome.status());
        outcome
    })
}

/// Use the cached file if it already matches the hash, otherwise download
/// it with retries.
fn fetch_task(
    job: &InstallJob,
    reservation: Arc<Reservation>,
    options: &PipelineOptions,
) -> Task<()> {
    let request = job.request.clone();
    let name = job.item.name.clone();
    let dest = reservation.file().to_path_buf();
    let budget = options.progress_updates;
    let download = retrying(options.retries, pause(options.retry_pause), move |attempt| {
        download_task(request.clone(), dest.clone(), name.clone(), attempt, budget)
    })
    .map(|_| ());

    let name = job.item.name.clone();
    Task::new(move |exec| {
        let file = reservation.file();
        if file.is_file() {
            let cached = verify_file(
                file,
                reservation.hash(),
                None,
                exec.services.clock.as_ref(),
                exec.should_cancel(),
                &mut |_, _| {},
            );
            let m = exec.messages();
            match cached {
                Ok(VerifyOutcome::Verified(_)) => {
                    debug!("using cached {}", file.display());
                    return StepResult::done((), "cached").into_outcome(m.download(&name, 0), m);
                }
                Ok(VerifyOutcome::Cancelled) => {
                    return StepResult::<()>::Cancelled.into_outcome(m.download(&name, 0), m);
                }
                Ok(VerifyOutcome::Mismatch { .. }) => {
                    if let Err(e) = fs::remove_file(file) {
                        warn!("failed to remove stale {}: {e}", file.display());
                    }
                }
                // the download replaces the file atomically
                Err(e) => warn!("cannot check cached {}: {e}", file.display()),
            }
        }
        download.evaluate(exec)
    })
}

/// One download attempt into `dest`.
pub fn download_task(
    request: HttpRequest,
    dest: PathBuf,
    name: String,
    attempt: AttemptInfo,
    budget: u64,
) -> Task<u64> {
    Task::new(move |exec| {
        let m = exec.messages();
        let status = m.status_downloading();
        let clock = exec.services.clock.as_ref();
        let mut rate = RateCounter::new(clock.now_millis());
        let mut by_count: Option<CountThrottle> = None;
        let mut by_time = TimeThrottle::new(clock);

        let mut report = |current: u64, total: Option<u64>| {
            let minor = match total {
                Some(total) => {
                    let throttle =
                        by_count.get_or_insert_with(|| CountThrottle::new(total, budget));
                    let per_second = rate.update(clock.now_millis(), current);
                    if !throttle.admit(current) {
                        return;
                    }
                    ProgressValue::definite(current, per_second, total)
                }
                None => {
                    let Some(per_second) = by_time.admit(clock, current) else {
                        return;
                    };
                    ProgressValue::indefinite(current, per_second)
                }
            };
            exec.progress(&Progress::new(Some(stage(STAGE_DOWNLOAD)), minor, status.clone()));
        };

        let result = match fetch_to_file(
            exec.services.http.as_ref(),
            &request,
            &dest,
            exec.should_cancel(),
            &mut report,
        ) {
            Ok(FetchOutcome::Completed { bytes }) => {
                StepResult::done(bytes, format!("{bytes} bytes"))
            }
            Ok(FetchOutcome::Cancelled) => StepResult::Cancelled,
            Err(e) => {
                warn!("download of {} failed: {e}", request.uri);
                StepResult::Failed(StepError::from(&e))
            }
        };
        result.into_outcome(m.download(&name, attempt.attempt), m)
    })
}

/// Stream the reserved file through SHA-256. A mismatching file is deleted.
fn verify_task(
    store: ContentStore,
    reservation: Arc<Reservation>,
    name: String,
    budget: u64,
) -> Task<PathBuf> {
    Task::new(move |exec| {
        let m = exec.messages();
        let status = m.status_verifying();
        let mut throttle: Option<CountThrottle> = None;
        let mut report = |major: Option<ProgressValue>, minor: ProgressValue| {
            let total = minor.maximum().unwrap_or(0);
            let throttle = throttle.get_or_insert_with(|| CountThrottle::new(total, budget));
            if throttle.admit(minor.current()) {
                exec.progress(&Progress::new(major, minor, status.clone()));
            }
        };
        let result = match store.verify(
            &reservation,
            Some(stage(STAGE_VERIFY)),
            exec.services.clock.as_ref(),
            exec.should_cancel(),
            &mut report,
        ) {
            Ok(VerifyOutcome::Verified(path)) => StepResult::done(path, m.done()),
            Ok(VerifyOutcome::Mismatch { actual }) => {
                warn!(
                    "hash mismatch for {}: expected {}, got {actual}",
                    name,
                    reservation.hash()
                );
                if let Err(e) = fs::remove_file(reservation.file()) {
                    warn!("failed to remove {}: {e}", reservation.file().display());
                }
                StepResult::Failed(StepError::new(
                    "hash-mismatch",
                    m.hash_mismatch(reservation.hash().as_str(), actual.as_str()),
                ))
            }
            Ok(VerifyOutcome::Cancelled) => StepResult::Cancelled,
            Err(e) => StepResult::Failed(store_error(&e)),
        };
        result.into_outcome(m.verify(&name), m)
    })
}

/// Wait for an installer request, forwarding cancellation to the installer.
///
/// A cancelled request still reports what the installer actually did: an
/// operation that finished before the cancel landed is `Succeeded`. Only an
/// installer that stays silent past [`CANCEL_GRACE`] is taken as cancelled.
fn await_installer(
    exec: &Execution<'_>,
    id: &ItemId,
    pending: &Completion<InstallStatus>,
) -> InstallStatus {
    if let Some(status) = pending.wait_while(exec.should_cancel(), POLL_INTERVAL) {
        return status;
    }
    debug!("cancelling installer request for {id}");
    let installer = &exec.services.installer;
    installer.cancel(id);
    pending.wait_timeout(CANCEL_GRACE).unwrap_or_else(|| {
        warn!("installer did not answer the cancellation of {id}");
        InstallStatus::Cancelled
    })
}

/// Hand the verified file to the installer and wait for its verdict.
fn install_step(item: RepositoryItem, file: PathBuf) -> Task<()> {
    Task::new(move |exec| {
        let m = exec.messages();
        exec.progress(&Progress::new(
            Some(stage(STAGE_INSTALL)),
            ProgressValue::indefinite(0, 0),
            m.status_installing(),
        ));
        let installer = &exec.services.installer;
        let pending = installer.install(&item.id, item.version_code, &item.version_name, &file);
        let status = await_installer(exec, &item.id, &pending);
        install_result(status, m).into_outcome(m.install(&item.name), m)
    })
}

fn cleanup_task(file: PathBuf, name: String) -> Task<()> {
    Task::new(move |exec| {
        let m = exec.messages();
        let result = match fs::remove_file(&file) {
            Ok(()) => StepResult::done((), m.done()),
            Err(e) if e.kind() == ErrorKind::NotFound => StepResult::done((), "nothing to delete"),
            Err(e) => StepResult::Failed(StepError::new("storage", e.to_string())),
        };
        result.into_outcome(m.cleanup(&name), m)
    })
}

/// Ask the installer to remove `id` and wait for its verdict.
pub fn uninstall_task(id: ItemId, name: String) -> Task<()> {
    Task::new(move |exec| {
        let m = exec.messages();
        exec.progress(&Progress::new(
            None,
            ProgressValue::indefinite(0, 0),
            m.status_uninstalling(),
        ));
        let pending = exec.services.installer.uninstall(&id);
        let status = await_installer(exec, &id, &pending);
        install_result(status, m).into_outcome(m.uninstall(&name), m)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{Execution, Outcome, Services};
    use stockpile_installer::{InstalledItems, MockBehavior, MockCall, MockInstaller};
    use stockpile_remote::{HttpClient, MockFailure, MockHttpClient};
    use stockpile_schema::{ContentHash, SourceUri};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    const URI: &str = "http://repo.test/editor.pkg";

    struct Fixture {
        _dir: tempfile::TempDir,
        store: ContentStore,
        http: Arc<MockHttpClient>,
        installer: Arc<MockInstaller>,
        services: Services,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = ContentStore::new(dir.path().join("packages"));
        let http = Arc::new(MockHttpClient::new());
        let installer = Arc::new(MockInstaller::new());
        let client: Arc<dyn HttpClient> = http.clone();
        let services = Services::new(client, installer.clone());
        Fixture {
            _dir: dir,
            store,
            http,
            installer,
            services,
        }
    }

    fn job(content: &[u8]) -> InstallJob {
        InstallJob {
            item: RepositoryItem {
                id: ItemId::new("org.example.editor"),
                version_code: 7,
                version_name: "1.7".to_owned(),
                name: "Editor".to_owned(),
                source: SourceUri::new(URI),
                hash: ContentHash::of_bytes(content),
            },
            request: HttpRequest::get(URI),
        }
    }

    fn quick() -> PipelineOptions {
        PipelineOptions {
            retry_pause: Duration::ZERO,
            ..PipelineOptions::default()
        }
    }

    fn run(f: &Fixture, task: &Task<()>) -> (Outcome<()>, Vec<Progress>) {
        let never = || false;
        let seen = Mutex::new(Vec::new());
        let sink = |p: &Progress| seen.lock().unwrap().push(p.clone());
        let outcome = task.evaluate(&Execution::new(&never, &sink, &f.services));
        (outcome, seen.into_inner().unwrap())
    }

    fn descriptions(outcome: &Outcome<()>) -> Vec<String> {
        outcome
            .steps()
            .iter()
            .map(|s| s.description.clone())
            .collect()
    }

    #[test]
    fn installs_verified_package_and_cleans_up() {
        let f = fixture();
        let payload = vec![9u8; 50_000];
        f.http.serve(URI, payload.clone());
        let job = job(&payload);
        let file = f.store.file_for(&job.item.hash);

        let (outcome, progress) = run(&f, &install_task(f.store.clone(), job.clone(), quick()));
        assert!(outcome.is_succeeded(), "{outcome:?}");
        assert_eq!(
            descriptions(&outcome),
            vec![
                "Reserve download slot for Editor",
                "Download Editor",
                "Verify Editor",
                "Install Editor",
                "Delete downloaded file of Editor",
            ]
        );
        assert!(matches!(
            &f.installer.calls()[0],
            MockCall::Install { version_code: 7, content: Some(c), .. } if *c == payload
        ));
        assert!(!file.exists());
        assert!(!f.store.is_reserved(&job.item.hash));

        let verified_to_end = progress.iter().any(|p| {
            p.major == Some(stage(STAGE_VERIFY)) && p.minor.percent() == Some(100.0)
        });
        assert!(verified_to_end);
    }

    #[test]
    fn hash_mismatch_fails_before_install() {
        let f = fixture();
        f.http.serve(URI, b"Hello ex.".to_vec());
        let job = job(b"Hello.");

        let (outcome, _) = run(&f, &install_task(f.store.clone(), job.clone(), quick()));
        assert!(outcome.is_failed());
        let failure = outcome.last_failure().unwrap();
        assert_eq!(failure.error.as_ref().unwrap().code, "hash-mismatch");
        assert!(failure
            .resolution
            .contains("35514dabff674e92dcb50380047b415d5a0bcaa037a9f436ea510eba1a61aba5"));
        assert!(f.installer.calls().is_empty());
        assert!(!f.store.file_for(&job.item.hash).exists());
    }

    #[test]
    fn transient_failures_are_retried() {
        let f = fixture();
        f.http.serve(URI, b"payload".to_vec());
        f.http.fail_next(URI, 1, MockFailure::Connection);
        f.http.fail_next(URI, 1, MockFailure::Server(503));

        let (outcome, _) = run(&f, &install_task(f.store.clone(), job(b"payload"), quick()));
        assert!(outcome.is_succeeded());
        assert_eq!(f.http.request_count(URI), 3);
        let failed: Vec<_> = outcome
            .steps()
            .iter()
            .filter(|s| s.failed)
            .map(|s| s.error.as_ref().unwrap().code.clone())
            .collect();
        assert_eq!(failed, vec!["connection-failure", "server-error"]);
    }

    #[test]
    fn exhausted_retries_fail() {
        let f = fixture();
        f.http.serve(URI, b"payload".to_vec());
        f.http.fail_next(URI, 10, MockFailure::Truncate(2));
        let options = PipelineOptions {
            retries: 1,
            ..quick()
        };
        let (outcome, _) = run(&f, &install_task(f.store.clone(), job(b"payload"), options));
        assert!(outcome.is_failed());
        assert_eq!(f.http.request_count(URI), 2);
        assert_eq!(outcome.last_failure().unwrap().error.as_ref().unwrap().code, "truncated");
    }

    #[test]
    fn keep_downloads_leaves_file_and_reuses_it() {
        let f = fixture();
        f.http.serve(URI, b"payload".to_vec());
        let job = job(b"payload");
        let options = PipelineOptions {
            keep_downloads: true,
            ..quick()
        };

        let (first, _) = run(&f, &install_task(f.store.clone(), job.clone(), options.clone()));
        assert!(first.is_succeeded());
        assert!(f.store.file_for(&job.item.hash).exists());
        assert_eq!(first.steps().len(), 4);

        let (second, _) = run(&f, &install_task(f.store.clone(), job, options));
        assert!(second.is_succeeded());
        assert_eq!(f.http.request_count(URI), 1);
        assert_eq!(second.steps()[1].resolution, "cached");
    }

    #[test]
    fn cancelled_run_keeps_valid_cached_package() {
        let f = fixture();
        f.http.serve(URI, b"payload".to_vec());
        let job = job(b"payload");
        let options = PipelineOptions {
            keep_downloads: true,
            ..quick()
        };
        let (first, _) = run(&f, &install_task(f.store.clone(), job.clone(), options.clone()));
        assert!(first.is_succeeded());
        let cached = f.store.file_for(&job.item.hash);
        assert!(cached.exists());

        let cancelled = || true;
        let sink = |_: &Progress| {};
        let second = install_task(f.store.clone(), job, options)
            .evaluate(&Execution::new(&cancelled, &sink, &f.services));
        assert!(second.is_cancelled());
        assert!(cached.exists());
        assert_eq!(std::fs::read(&cached).unwrap(), b"payload");
        assert_eq!(f.http.request_count(URI), 1);
    }

    #[test]
    fn corrupt_cached_package_is_downloaded_again() {
        let f = fixture();
        f.http.serve(URI, b"payload".to_vec());
        let job = job(b"payload");
        let cached = f.store.file_for(&job.item.hash);
        std::fs::create_dir_all(cached.parent().unwrap()).unwrap();
        std::fs::write(&cached, b"garbage").unwrap();

        let (outcome, _) = run(&f, &install_task(f.store.clone(), job, quick()));
        assert!(outcome.is_succeeded(), "{outcome:?}");
        assert_eq!(f.http.request_count(URI), 1);
    }

    #[test]
    fn verify_progress_follows_update_budget() {
        let f = fixture();
        let payload = vec![1u8; 64 * 1024];
        f.http.serve(URI, payload.clone());
        let options = PipelineOptions {
            progress_updates: 4,
            ..quick()
        };
        let (outcome, progress) = run(&f, &install_task(f.store.clone(), job(&payload), options));
        assert!(outcome.is_succeeded());
        let verify_events = progress
            .iter()
            .filter(|p| p.major == Some(stage(STAGE_VERIFY)))
            .count();
        // 16 chunks of 4 KiB, thinned to about four events
        assert!((1..=5).contains(&verify_events), "{verify_events}");
    }

    #[test]
    fn held_reservation_fails_fast() {
        let f = fixture();
        let job = job(b"payload");
        let _held = f.store.reserve(&job.item.hash).unwrap();
        let (outcome, _) = run(&f, &install_task(f.store.clone(), job, quick()));
        assert!(outcome.is_failed());
        assert_eq!(outcome.steps().len(), 1);
        assert_eq!(
            outcome.steps()[0].error.as_ref().unwrap().code,
            "reservation-unavailable"
        );
        assert!(f.http.requests().is_empty());
    }

    #[test]
    fn installer_failure_is_translated() {
        let f = fixture();
        f.http.serve(URI, b"payload".to_vec());
        f.installer.set_behavior(MockBehavior::Fail("storage".to_owned()));
        let (outcome, _) = run(&f, &install_task(f.store.clone(), job(b"payload"), quick()));
        assert!(outcome.is_failed());
        let failure = outcome.last_failure().unwrap();
        assert_eq!(failure.description, "Install Editor");
        assert_eq!(failure.resolution, "The installer could not write the package");
        // cleanup still ran after the failed install
        assert_eq!(
            outcome.steps().last().unwrap().description,
            "Delete downloaded file of Editor"
        );
    }

    #[test]
    fn cancellation_before_start_makes_no_request() {
        let f = fixture();
        f.http.serve(URI, b"payload".to_vec());
        let cancelled = || true;
        let sink = |_: &Progress| {};
        let outcome = install_task(f.store.clone(), job(b"payload"), quick())
            .evaluate(&Execution::new(&cancelled, &sink, &f.services));
        assert!(outcome.is_cancelled());
        assert!(f.http.requests().is_empty());
        assert!(f.installer.calls().is_empty());
    }

    #[test]
    fn cancellation_while_installing_cancels_installer() {
        let f = fixture();
        f.http.serve(URI, b"payload".to_vec());
        f.installer.set_behavior(MockBehavior::Manual);
        let flag = AtomicBool::new(false);
        let should_cancel = || flag.load(Ordering::SeqCst);
        let sink = |p: &Progress| {
            if p.major == Some(stage(STAGE_INSTALL)) {
                flag.store(true, Ordering::SeqCst);
            }
        };
        let outcome = install_task(f.store.clone(), job(b"payload"), quick())
            .evaluate(&Execution::new(&should_cancel, &sink, &f.services));
        assert!(outcome.is_cancelled());
        assert!(f
            .installer
            .calls()
            .iter()
            .any(|c| matches!(c, MockCall::Cancel(_))));
    }

    #[test]
    fn late_cancellation_reports_installer_verdict() {
        let f = fixture();
        f.http.serve(URI, b"payload".to_vec());
        f.installer.set_behavior(MockBehavior::FinishOnCancel);
        let flag = AtomicBool::new(false);
        let should_cancel = || flag.load(Ordering::SeqCst);
        let sink = |p: &Progress| {
            if p.major == Some(stage(STAGE_INSTALL)) {
                flag.store(true, Ordering::SeqCst);
            }
        };
        let job = job(b"payload");
        let outcome = install_task(f.store.clone(), job.clone(), quick())
            .evaluate(&Execution::new(&should_cancel, &sink, &f.services));
        assert!(outcome.is_succeeded(), "{outcome:?}");
        assert!(f.installer.items().contains_key(&job.item.id));
        assert!(!f.installer.is_pending(&job.item.id));
    }

    #[test]
    fn uninstall_translates_status() {
        let f = fixture();
        let id = ItemId::new("org.example.editor");
        let (missing, _) = run(&f, &uninstall_task(id.clone(), "Editor".to_owned()));
        assert!(missing.is_failed());

        f.installer.report_installed(&id, 1, "1.0");
        let (removed, _) = run(&f, &uninstall_task(id, "Editor".to_owned()));
        assert!(removed.is_succeeded());
        assert_eq!(removed.steps()[0].description, "Uninstall Editor");
    }
}
