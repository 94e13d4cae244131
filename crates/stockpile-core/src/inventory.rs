//! The live inventory: configured repositories, their merged item views,
//! and the update, install and uninstall operations running against them.
//!
//! Every operation is a [`Task`] chain evaluated on the worker pool. The
//! caller gets a [`Completion`] that resolves with the chain's
//! [`Outcome`]. Repository and item state changes are broadcast to
//! [`Inventory::subscribe`] receivers.
//!
//! Lock order is `operations -> slots -> slot -> subscribers`. No lock is
//! held across network or disk I/O.

use crate::config::Settings;
use crate::lifecycle::{finish, validate_start, ItemState, Operation, RepositoryState};
use crate::merge::{merge_repository, InventoryItem, ItemView, MergeEvent};
use crate::messages::Messages;
use crate::pipeline::{install_task, uninstall_task, InstallJob};
use crate::retry::{pause, retrying};
use crate::task::{Execution, Outcome, StepError, StepResult, Services, Task};
use crate::CoreError;
use chrono::{DateTime, Utc};
use rayon::{ThreadPool, ThreadPoolBuilder};
use serde::Serialize;
use stockpile_installer::{
    select_installer, Completion, InstalledEvent, InstalledItems, InstallerHandle,
};
use stockpile_remote::{fetch_bytes, HttpClient, RemoteConfig, UreqClient, MAX_MANIFEST_BYTES};
use stockpile_schema::{parse_repository_slice, Clock, ItemId, Progress, Repository, SystemClock};
use stockpile_store::{
    verify_cache_integrity, ClearedFile, ContentStore, IntegrityReport, RepositoryRecord,
    RepositoryStore, StoreError, StoreLayout,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Notification delivered to [`Inventory::subscribe`] receivers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InventoryEvent {
    RepositoryAdded {
        repository: Uuid,
    },
    RepositoryRemoved {
        repository: Uuid,
    },
    RepositoryStateChanged {
        repository: Uuid,
        state: RepositoryState,
    },
    Merged {
        repository: Uuid,
        event: MergeEvent,
    },
    ItemStateChanged {
        id: ItemId,
        state: ItemState,
    },
}

/// A configured repository as seen by front ends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RepositoryInfo {
    pub id: Uuid,
    pub title: String,
    pub address: String,
    pub enabled: bool,
    pub last_updated: Option<DateTime<Utc>>,
    pub state: RepositoryState,
    pub items: usize,
}

pub type UpdateCompletion = Completion<Outcome<Vec<MergeEvent>>>;
pub type OperationCompletion = Completion<Outcome<()>>;

struct Running<A> {
    completion: Completion<Outcome<A>>,
    cancel: Arc<AtomicBool>,
}

impl<A: Clone> Running<A> {
    fn new() -> Self {
        Self {
            completion: Completion::new(),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl<A> Clone for Running<A> {
    fn clone(&self) -> Self {
        Self {
            completion: self.completion.clone(),
            cancel: Arc::clone(&self.cancel),
        }
    }
}

/// State and live view of one repository.
struct Slot {
    record: RepositoryRecord,
    state: RepositoryState,
    view: ItemView,
    update: Option<Running<Vec<MergeEvent>>>,
}

impl Slot {
    fn info(&self) -> RepositoryInfo {
        RepositoryInfo {
            id: self.record.id,
            title: self.record.title.clone(),
            address: self.record.address.clone(),
            enabled: self.record.enabled,
            last_updated: self.record.last_updated,
            state: self.state.clone(),
            items: self.view.len(),
        }
    }
}

struct ItemOperation {
    operation: Operation,
    running: Running<()>,
}

/// Where an item's package is fetched from.
struct Origin {
    config: RemoteConfig,
    base: String,
}

struct Shared {
    settings: Settings,
    services: Services,
    installed: Arc<dyn InstalledItems>,
    content: ContentStore,
    repositories: RepositoryStore,
    pool: ThreadPool,
    slots: Mutex<BTreeMap<Uuid, Arc<Mutex<Slot>>>>,
    operations: Mutex<HashMap<ItemId, ItemOperation>>,
    subscribers: Mutex<Vec<Sender<InventoryEvent>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct InventoryBuilder {
    layout: StoreLayout,
    settings: Option<Settings>,
    http: Option<Arc<dyn HttpClient>>,
    installer: Option<InstallerHandle>,
    clock: Option<Arc<dyn Clock>>,
    messages: Option<Arc<dyn Messages>>,
}

impl InventoryBuilder {
    /// Use `settings` instead of reading `config.toml`.
    #[must_use]
    pub fn settings(mut self, settings: Settings) -> Self {
        self.settings = Some(settings);
        self
    }

    #[must_use]
    pub fn http(mut self, http: Arc<dyn HttpClient>) -> Self {
        self.http = Some(http);
        self
    }

    #[must_use]
    pub fn installer(mut self, handle: InstallerHandle) -> Self {
        self.installer = Some(handle);
        self
    }

    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    #[must_use]
    pub fn messages(mut self, messages: Arc<dyn Messages>) -> Self {
        self.messages = Some(messages);
        self
    }

    /// Initialize the store, seed every repository view from its cached
    /// snapshot and start the worker pool.
    pub fn build(self) -> Result<Inventory, CoreError> {
        let Some(handle) = self.installer else {
            return Err(CoreError::Configuration(
                "no installer configured".to_owned(),
            ));
        };
        self.layout.initialize()?;
        let settings = match self.settings {
            Some(settings) => {
                settings.validate()?;
                settings
            }
            None => Settings::load(&self.layout.config_file())?,
        };

        let http: Arc<dyn HttpClient> = match self.http {
            Some(http) => http,
            None => Arc::new(UreqClient::new()),
        };
        let clock: Arc<dyn Clock> = match self.clock {
            Some(clock) => clock,
            None => Arc::new(SystemClock::new()),
        };
        let messages: Arc<dyn Messages> = match self.messages {
            Some(messages) => messages,
            None => Arc::new(crate::messages::EnglishMessages),
        };
        let services = Services::new(http, handle.installer)
            .with_clock(clock)
            .with_messages(messages);

        let pool = ThreadPoolBuilder::new()
            .num_threads(settings.workers)
            .thread_name(|i| format!("stockpile-worker-{i}"))
            .build()
            .map_err(|e| CoreError::Configuration(format!("cannot start worker pool: {e}")))?;

        let repositories = RepositoryStore::new(self.layout.clone());
        let installed = handle.installed.items();
        let mut slots = BTreeMap::new();
        for record in repositories.list()? {
            let view = match &record.snapshot {
                Some(snapshot) => {
                    merge_repository(&ItemView::new(), record.id, snapshot, &installed).0
                }
                None => ItemView::new(),
            };
            debug!("loaded repository {} with {} items", record.title, view.len());
            slots.insert(
                record.id,
                Arc::new(Mutex::new(Slot {
                    record,
                    state: RepositoryState::Idle,
                    view,
                    update: None,
                })),
            );
        }

        let shared = Arc::new(Shared {
            settings,
            services,
            installed: handle.installed,
            content: ContentStore::open(&self.layout),
            repositories,
            pool,
            slots: Mutex::new(slots),
            operations: Mutex::new(HashMap::new()),
            subscribers: Mutex::new(Vec::new()),
        });

        let weak = Arc::downgrade(&shared);
        shared.installed.subscribe(Box::new(move |event: &InstalledEvent| {
            if let Some(shared) = weak.upgrade() {
                shared.on_installed(event);
            }
        }));

        Ok(Inventory { shared })
    }
}

/// Handle to a running inventory. Clones share the same state.
#[derive(Clone)]
pub struct Inventory {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Inventory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Inventory")
            .field("services", &self.shared.services)
            .finish_non_exhaustive()
    }
}

impl Inventory {
    pub fn builder(layout: StoreLayout) -> InventoryBuilder {
        InventoryBuilder {
            layout,
            settings: None,
            http: None,
            installer: None,
            clock: None,
            messages: None,
        }
    }

    /// Open the store at `layout` with the installer named in its
    /// settings and the default HTTP client.
    pub fn open(layout: StoreLayout) -> Result<Self, CoreError> {
        let settings = Settings::load(&layout.config_file())?;
        let handle = select_installer(&settings.installer, &layout)?;
        Self::builder(layout)
            .settings(settings)
            .installer(handle)
            .build()
    }

    pub fn settings(&self) -> &Settings {
        &self.shared.settings
    }

    /// A receiver for every event from now on. Dropped receivers are
    /// pruned on the next send.
    pub fn subscribe(&self) -> Receiver<InventoryEvent> {
        let (tx, rx) = mpsc::channel();
        lock(&self.shared.subscribers).push(tx);
        rx
    }

    pub fn add_repository(
        &self,
        address: &str,
        title: Option<&str>,
        token: Option<&str>,
    ) -> Result<RepositoryInfo, CoreError> {
        RemoteConfig::new(address)?;
        let duplicate = self
            .shared
            .slot_list()
            .iter()
            .any(|slot| lock(slot).record.address == address);
        if duplicate {
            return Err(CoreError::Configuration(format!(
                "repository {address} is already configured"
            )));
        }

        let mut record = RepositoryRecord::new(address, title.unwrap_or(address));
        record.token = token.map(str::to_owned);
        self.shared.repositories.put(&record)?;

        let id = record.id;
        let slot = Slot {
            record,
            state: RepositoryState::Idle,
            view: ItemView::new(),
            update: None,
        };
        let info = slot.info();
        lock(&self.shared.slots).insert(id, Arc::new(Mutex::new(slot)));
        info!("added repository {address} as {id}");
        self.shared
            .emit(InventoryEvent::RepositoryAdded { repository: id });
        Ok(info)
    }

    /// Forget a repository and its items. Fails while it is updating.
    pub fn remove_repository(&self, id: Uuid) -> Result<(), CoreError> {
        let slot = self.shared.slot(id)?;
        let gone: Vec<ItemId> = {
            let guard = lock(&slot);
            if guard.update.is_some() {
                return Err(CoreError::Busy(id.to_string()));
            }
            guard.view.keys().cloned().collect()
        };
        self.shared.repositories.remove(&id)?;
        lock(&self.shared.slots).remove(&id);
        info!("removed repository {id}");
        for item in gone {
            self.shared.emit(InventoryEvent::Merged {
                repository: id,
                event: MergeEvent::ItemBecameInvisible(item),
            });
        }
        self.shared
            .emit(InventoryEvent::RepositoryRemoved { repository: id });
        Ok(())
    }

    /// Include or exclude a repository from [`update_all`](Self::update_all).
    /// Its items stay visible either way.
    pub fn set_repository_enabled(
        &self,
        id: Uuid,
        enabled: bool,
    ) -> Result<RepositoryInfo, CoreError> {
        let slot = self.shared.slot(id)?;
        let (record, info) = {
            let mut guard = lock(&slot);
            guard.record.enabled = enabled;
            (guard.record.clone(), guard.info())
        };
        self.shared.repositories.put(&record)?;
        info!(
            "{} repository {}",
            if enabled { "enabled" } else { "disabled" },
            record.title
        );
        Ok(info)
    }

    /// Find a repository by UUID, UUID prefix, title or address.
    pub fn resolve_repository(&self, key: &str) -> Result<Uuid, CoreError> {
        Ok(self.shared.repositories.resolve(key)?.id)
    }

    /// All repositories, sorted by title.
    pub fn repositories(&self) -> Vec<RepositoryInfo> {
        let mut infos: Vec<RepositoryInfo> = self
            .shared
            .slot_list()
            .iter()
            .map(|slot| lock(slot).info())
            .collect();
        infos.sort_by(|a, b| a.title.cmp(&b.title).then(a.id.cmp(&b.id)));
        infos
    }

    pub fn repository(&self, id: Uuid) -> Result<RepositoryInfo, CoreError> {
        let slot = self.shared.slot(id)?;
        let info = lock(&slot).info();
        Ok(info)
    }

    /// Fetch, parse and merge the repository's manifest.
    ///
    /// While an update of the same repository is running, the running
    /// update's completion is returned instead of starting another.
    pub fn update(&self, id: Uuid) -> Result<UpdateCompletion, CoreError> {
        let slot = self.shared.slot(id)?;
        let (running, record) = {
            let mut guard = lock(&slot);
            if let Some(running) = &guard.update {
                debug!("repository {id} is already updating");
                return Ok(running.completion.clone());
            }
            let running = Running::new();
            guard.update = Some(running.clone());
            guard.state = RepositoryState::Updating;
            (running, guard.record.clone())
        };
        self.shared.emit(InventoryEvent::RepositoryStateChanged {
            repository: id,
            state: RepositoryState::Updating,
        });

        let completion = running.completion.clone();
        let shared = Arc::clone(&self.shared);
        self.shared
            .pool
            .spawn(move || shared.run_update(&slot, &record, &running));
        Ok(completion)
    }

    /// Start updates of every enabled repository in parallel.
    pub fn update_all(&self) -> Vec<(Uuid, UpdateCompletion)> {
        let enabled: Vec<Uuid> = self
            .shared
            .slot_list()
            .iter()
            .filter_map(|slot| {
                let guard = lock(slot);
                guard.record.enabled.then_some(guard.record.id)
            })
            .collect();
        enabled
            .into_iter()
            .filter_map(|id| match self.update(id) {
                Ok(completion) => Some((id, completion)),
                Err(e) => {
                    warn!("cannot update {id}: {e}");
                    None
                }
            })
            .collect()
    }

    /// Ask a running update to stop. Returns `false` if none is running.
    pub fn cancel_update(&self, id: Uuid) -> bool {
        let Ok(slot) = self.shared.slot(id) else {
            return false;
        };
        let guard = lock(&slot);
        match &guard.update {
            Some(running) => {
                running.cancel.store(true, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }

    /// Download, verify and install `id`.
    ///
    /// With several repositories offering the item, `repository` picks one;
    /// otherwise the highest version wins. A second call while the install
    /// is running returns the running install's completion.
    pub fn install(
        &self,
        id: &ItemId,
        repository: Option<Uuid>,
    ) -> Result<OperationCompletion, CoreError> {
        let shared = &self.shared;
        let mut operations = lock(&shared.operations);
        if let Some(completion) = in_flight(&operations, id, Operation::Installing)? {
            return Ok(completion);
        }
        let (item, origin) = shared.locate(id, repository)?;
        let installed = shared.installed.get(id);
        validate_start(&item.state, Operation::Installing, installed.as_ref())?;

        let job = InstallJob {
            request: origin.config.get(&item.item.resolve_source(&origin.base)),
            item: item.item,
        };
        debug!("installing {id} from {}", job.request.uri);
        let task = install_task(shared.content.clone(), job, shared.settings.pipeline());
        Ok(shared.start(&mut operations, id, Operation::Installing, task))
    }

    /// Remove `id` from the host.
    pub fn uninstall(&self, id: &ItemId) -> Result<OperationCompletion, CoreError> {
        let shared = &self.shared;
        let mut operations = lock(&shared.operations);
        if let Some(completion) = in_flight(&operations, id, Operation::Uninstalling)? {
            return Ok(completion);
        }
        let installed = shared.installed.get(id);
        let (name, state) = match shared.locate(id, None) {
            Ok((item, _)) => (item.item.name, item.state),
            Err(CoreError::ItemNotFound(_)) if installed.is_some() => {
                (id.to_string(), ItemState::seed(installed.as_ref()))
            }
            Err(e) => return Err(e),
        };
        validate_start(&state, Operation::Uninstalling, installed.as_ref())?;
        let task = uninstall_task(id.clone(), name);
        Ok(shared.start(&mut operations, id, Operation::Uninstalling, task))
    }

    /// Ask the running operation on `id` to stop. A no-op returning
    /// `false` when nothing is running.
    pub fn cancel(&self, id: &ItemId) -> bool {
        match lock(&self.shared.operations).get(id) {
            Some(op) => {
                debug!("cancelling {} of {id}", op.operation);
                op.running.cancel.store(true, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }

    /// Cancel every running item operation and repository update.
    pub fn cancel_all(&self) {
        for op in lock(&self.shared.operations).values() {
            op.running.cancel.store(true, Ordering::SeqCst);
        }
        for slot in self.shared.slot_list() {
            if let Some(running) = &lock(&slot).update {
                running.cancel.store(true, Ordering::SeqCst);
            }
        }
    }

    /// Every visible item of every repository, sorted by id.
    pub fn items(&self) -> Vec<InventoryItem> {
        let mut items: Vec<InventoryItem> = self
            .shared
            .slot_list()
            .iter()
            .flat_map(|slot| lock(slot).view.values().cloned().collect::<Vec<_>>())
            .collect();
        items.sort_by(|a, b| a.id().cmp(b.id()).then(a.repository.cmp(&b.repository)));
        items
    }

    /// The highest visible version of `id` across repositories.
    pub fn item(&self, id: &ItemId) -> Option<InventoryItem> {
        self.shared.locate(id, None).ok().map(|(item, _)| item)
    }

    pub fn clear_cache(&self) -> Result<Vec<ClearedFile>, CoreError> {
        Ok(self.shared.content.clear()?)
    }

    pub fn verify_cache(&self) -> Result<IntegrityReport, CoreError> {
        Ok(verify_cache_integrity(
            &self.shared.content,
            self.shared.services.clock.as_ref(),
        )?)
    }
}

/// The running operation on `id`, if it is an `operation`.
fn in_flight(
    operations: &HashMap<ItemId, ItemOperation>,
    id: &ItemId,
    operation: Operation,
) -> Result<Option<OperationCompletion>, CoreError> {
    match operations.get(id) {
        Some(op) if op.operation == operation => {
            debug!("{id} is already {operation}");
            Ok(Some(op.running.completion.clone()))
        }
        Some(_) => Err(CoreError::Busy(id.to_string())),
        None => Ok(None),
    }
}

impl Shared {
    fn slot(&self, id: Uuid) -> Result<Arc<Mutex<Slot>>, CoreError> {
        lock(&self.slots)
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::RepositoryNotFound(id.to_string()).into())
    }

    fn slot_list(&self) -> Vec<Arc<Mutex<Slot>>> {
        lock(&self.slots).values().cloned().collect()
    }

    fn emit(&self, event: InventoryEvent) {
        lock(&self.subscribers).retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn locate(
        &self,
        id: &ItemId,
        repository: Option<Uuid>,
    ) -> Result<(InventoryItem, Origin), CoreError> {
        let candidates = match repository {
            Some(repository) => vec![self.slot(repository)?],
            None => self.slot_list(),
        };
        let mut best: Option<(InventoryItem, &Arc<Mutex<Slot>>)> = None;
        for slot in &candidates {
            let guard = lock(slot);
            if let Some(item) = guard.view.get(id) {
                let newer = best
                    .as_ref()
                    .is_none_or(|(b, _)| item.item.version_code > b.item.version_code);
                if newer {
                    best = Some((item.clone(), slot));
                }
            }
        }
        let (item, slot) = best.ok_or_else(|| CoreError::ItemNotFound(id.to_string()))?;
        let guard = lock(slot);
        let record = &guard.record;
        let config = RemoteConfig::new(&record.address)?.with_token(record.token.as_deref());
        let base = record
            .snapshot
            .as_ref()
            .map_or_else(|| record.address.clone(), |s| s.self_uri.as_str().to_owned());
        Ok((item, Origin { config, base }))
    }

    /// Set the state of `id` in every repository view that shows it.
    fn set_item_state(&self, id: &ItemId, state: &ItemState) {
        let mut seen = false;
        for slot in self.slot_list() {
            if let Some(item) = lock(&slot).view.get_mut(id) {
                item.state = state.clone();
                seen = true;
            }
        }
        if seen {
            self.emit(InventoryEvent::ItemStateChanged {
                id: id.clone(),
                state: state.clone(),
            });
        }
    }

    /// Reseed items from the host's installed facts unless an operation
    /// owns them.
    fn on_installed(&self, event: &InstalledEvent) {
        let id = event.id();
        let record = match event {
            InstalledEvent::Added(_, record) | InstalledEvent::Updated(_, record) => Some(record),
            InstalledEvent::Removed(_) => None,
        };
        let state = ItemState::seed(record);
        let mut changed = false;
        for slot in self.slot_list() {
            let mut guard = lock(&slot);
            if let Some(item) = guard.view.get_mut(id) {
                if !item.state.is_operating() && item.state != state {
                    item.state = state.clone();
                    changed = true;
                }
            }
        }
        if changed {
            debug!("{id} is now {state}");
            self.emit(InventoryEvent::ItemStateChanged {
                id: id.clone(),
                state,
            });
        }
    }

    fn start(
        self: &Arc<Self>,
        operations: &mut HashMap<ItemId, ItemOperation>,
        id: &ItemId,
        operation: Operation,
        task: Task<()>,
    ) -> OperationCompletion {
        let running = Running::new();
        operations.insert(
            id.clone(),
            ItemOperation {
                operation,
                running: running.clone(),
            },
        );
        self.set_item_state(
            id,
            &ItemState::Operating {
                operation,
                progress: Progress::status(self.services.messages.status_queued()),
            },
        );
        let completion = running.completion.clone();
        let shared = Arc::clone(self);
        let id = id.clone();
        self.pool
            .spawn(move || shared.run_operation(&id, operation, &task, &running));
        completion
    }

    fn run_operation(
        &self,
        id: &ItemId,
        operation: Operation,
        task: &Task<()>,
        running: &Running<()>,
    ) {
        let cancel = Arc::clone(&running.cancel);
        let should_cancel = move || cancel.load(Ordering::SeqCst);
        let on_progress = |progress: &Progress| {
            self.set_item_state(
                id,
                &ItemState::Operating {
                    operation,
                    progress: progress.clone(),
                },
            );
        };
        let outcome = task.evaluate(&Execution::new(&should_cancel, &on_progress, &self.services));

        let installed = self.installed.get(id);
        let state = finish(operation, &outcome, installed.as_ref());
        {
            let mut operations = lock(&self.operations);
            operations.remove(id);
            self.set_item_state(id, &state);
        }
        match outcome.last_failure() {
            Some(step) if outcome.is_failed() => {
                warn!("{operation} {id} failed: {}", step.resolution);
            }
            _ => info!("{operation} {id} {}", outcome.status()),
        }
        running.completion.complete(outcome);
    }

    fn run_update(
        self: &Arc<Self>,
        slot: &Arc<Mutex<Slot>>,
        record: &RepositoryRecord,
        running: &Running<Vec<MergeEvent>>,
    ) {
        let task = self.update_task(slot, record);
        let cancel = Arc::clone(&running.cancel);
        let should_cancel = move || cancel.load(Ordering::SeqCst);
        let on_progress = |_: &Progress| {};
        let outcome = task.evaluate(&Execution::new(&should_cancel, &on_progress, &self.services));

        let state = RepositoryState::after_update(&outcome);
        {
            let mut guard = lock(slot);
            guard.state = state.clone();
            guard.update = None;
        }
        info!("update of {} {}", record.title, outcome.status());
        self.emit(InventoryEvent::RepositoryStateChanged {
            repository: record.id,
            state,
        });
        running.completion.complete(outcome);
    }

    /// `fetch (retried) -> parse -> merge and persist`.
    fn update_task(
        self: &Arc<Self>,
        slot: &Arc<Mutex<Slot>>,
        record: &RepositoryRecord,
    ) -> Task<Vec<MergeEvent>> {
        let messages = Arc::clone(&self.services.messages);
        let request = match RemoteConfig::new(&record.address) {
            Ok(config) => config.with_token(record.token.as_deref()).get(&record.address),
            Err(e) => {
                return Task::fail(messages.fetch_manifest(0), e.to_string(), e.code());
            }
        };

        let fetch_messages = Arc::clone(&messages);
        let delay = Duration::from_secs(self.settings.retry_pause_secs);
        let fetch = retrying(self.settings.retries, pause(delay), move |attempt| {
            let request = request.clone();
            Task::step(fetch_messages.fetch_manifest(attempt.attempt), move |exec| {
                if exec.is_cancelled() {
                    return StepResult::Cancelled;
                }
                match fetch_bytes(exec.services.http.as_ref(), &request, MAX_MANIFEST_BYTES) {
                    Ok(body) => {
                        let len = body.len();
                        StepResult::done(body, format!("{len} bytes"))
                    }
                    Err(e) => StepResult::Failed(StepError::from(&e)),
                }
            })
        });

        let parse_description = messages.parse_manifest();
        let merge_description = messages.merge_repository();
        let shared = Arc::clone(self);
        let slot = Arc::clone(slot);
        let id = record.id;
        fetch
            .and_then(move |body| {
                Task::step(parse_description.clone(), move |_| {
                    match parse_repository_slice(&body) {
                        Ok(repository) => {
                            let count = repository.items.len();
                            StepResult::done(repository, format!("{count} items"))
                        }
                        Err(e) => StepResult::Failed(StepError::from(&CoreError::Manifest(e))),
                    }
                })
            })
            .and_then(move |repository| {
                let shared = Arc::clone(&shared);
                let slot = Arc::clone(&slot);
                Task::step(merge_description.clone(), move |_| {
                    match shared.merge_snapshot(id, &slot, &repository) {
                        Ok(events) => {
                            let count = events.len();
                            StepResult::done(events, format!("{count} changes"))
                        }
                        Err(e) => StepResult::Failed(StepError::from(&e)),
                    }
                })
            })
    }

    /// Fold `repository` into the slot's view and persist it as the new
    /// snapshot. The first snapshot fixes the repository's id.
    fn merge_snapshot(
        &self,
        id: Uuid,
        slot: &Mutex<Slot>,
        repository: &Repository,
    ) -> Result<Vec<MergeEvent>, CoreError> {
        let installed = self.installed.items();
        let (record, events) = {
            let mut guard = lock(slot);
            if let Some(previous) = &guard.record.snapshot {
                if previous.id != repository.id {
                    return Err(CoreError::IdMismatch {
                        expected: previous.id,
                        found: repository.id,
                    });
                }
            }
            let (view, events) = merge_repository(&guard.view, id, repository, &installed);
            guard.view = view;
            let record = &mut guard.record;
            if record.title == record.address {
                record.title.clone_from(&repository.title);
            }
            record.snapshot = Some(repository.clone());
            record.last_updated = Some(Utc::now());
            (record.clone(), events)
        };
        self.repositories.put(&record)?;
        for event in &events {
            self.emit(InventoryEvent::Merged {
                repository: id,
                event: event.clone(),
            });
        }
        Ok(events)
    }
}
