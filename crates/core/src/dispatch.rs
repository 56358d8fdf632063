//! Job queue serializing every scan against one vector clock
//!
//! A single worker task pops jobs in FIFO order, so at most one scan runs at
//! any time. Each job stamps its upserts, writes them through the source's
//! [`TreeAdapter`] in bounded commits, and advances the clock by exactly one
//! tick when it ends, whatever the outcome.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{Notify, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::clock::{self, VectorClock, VectorStamp};
use crate::config::VsyncConfig;
use crate::control::ScanControl;
use crate::entry::Entry;
use crate::error::{Error, Result};
use crate::filter::{AcceptAll, GlobPredicate, Predicate};
use crate::fs::{Filesystem, LocalFs};
use crate::limiter::{DEFAULT_CONCURRENCY, Limiter};
use crate::scan::{
    Change, ChangeSink, DeltaScanner, DiffHandler, DiffOptions, DifferenceEngine, IntegralScanner,
    PathStack, ScanOptions, ScanReport,
};
use crate::store::{Partition, Store};
use crate::tree::TreeAdapter;

/// Partition holding the dispatcher's clock and device id.
pub const META_PARTITION: &str = "meta";

/// Minimum spacing between two progress events of one job.
pub const PROGRESS_INTERVAL: Duration = Duration::from_millis(100);

/// Partition holding a source's tree.
#[must_use]
pub fn tree_namespace(source: &str) -> String {
    format!("tree/{source}")
}

/// Everything needed to scan one source root.
#[derive(Clone)]
pub struct SourceSpec {
    pub name: String,
    pub root: PathBuf,
    pub fs: Arc<dyn Filesystem>,
    pub predicate: Arc<dyn Predicate>,
    pub scan: ScanOptions,
    pub diff: DiffOptions,
    pub concurrency: usize,
}

impl std::fmt::Debug for SourceSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceSpec")
            .field("name", &self.name)
            .field("root", &self.root)
            .field("scan", &self.scan)
            .field("diff", &self.diff)
            .field("concurrency", &self.concurrency)
            .finish_non_exhaustive()
    }
}

impl SourceSpec {
    /// Local source with no exclusions and default options.
    #[must_use]
    pub fn new(name: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            root: root.into(),
            fs: Arc::new(LocalFs),
            predicate: Arc::new(AcceptAll),
            scan: ScanOptions::default(),
            diff: DiffOptions::default(),
            concurrency: DEFAULT_CONCURRENCY,
        }
    }

    /// Local source configured from its `.vsync.toml`.
    ///
    /// # Errors
    /// Returns `Config` if an exclude pattern is malformed.
    pub fn from_config(name: impl Into<String>, root: &Path, config: &VsyncConfig) -> Result<Self> {
        let predicate = GlobPredicate::new(root, &config.exclude)?
            .state_dir(config.state_dir.clone())
            .max_file_size(config.max_file_size);
        Ok(Self {
            predicate: Arc::new(predicate),
            scan: config.scan_options(),
            diff: config.diff_options(),
            concurrency: config.scan.concurrency,
            ..Self::new(name, root)
        })
    }
}

/// One replayed watcher observation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum WatchAction {
    Upsert(PathBuf),
    Remove(PathBuf),
    /// The watcher lost track; rescan the whole source.
    Scan,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum JobKind {
    Scan,
    Change(Vec<WatchAction>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub id: u64,
    pub source: String,
    pub kind: JobKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum DispatcherState {
    Idle,
    Scanning { job: u64, source: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeAction {
    Upsert,
    Remove,
}

/// One row change inside a commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChangeRecord {
    pub action: ChangeAction,
    pub path: PathBuf,
    pub entry: Option<Entry>,
}

/// A batch of changes durably written to a source's tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommitEvent {
    pub source: String,
    pub stamp: VectorStamp,
    pub changes: Vec<ChangeRecord>,
}

/// How a job ended.
#[derive(Debug, Clone, Serialize)]
pub struct JobOutcome {
    pub job: u64,
    pub source: String,
    /// The clock after the job's tick.
    pub clock: VectorStamp,
    pub report: Option<ScanReport>,
    pub error: Option<String>,
    pub cancelled: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DispatchEvent {
    Commit(CommitEvent),
    Progress {
        job: u64,
        source: String,
        report: ScanReport,
    },
    Finished(JobOutcome),
}

/// Dispatcher-wide settings.
#[derive(Debug, Clone, Default)]
pub struct DispatcherOptions {
    /// Overrides the persisted device id.
    pub device_id: Option<String>,
}

struct Source {
    spec: SourceSpec,
    tree: TreeAdapter,
    limiter: Limiter,
}

struct Active {
    source: String,
    control: ScanControl,
}

struct Shared {
    store: Store,
    meta: Partition,
    queue: Mutex<VecDeque<Job>>,
    wake: Notify,
    state: watch::Sender<DispatcherState>,
    sources: RwLock<HashMap<String, Arc<Source>>>,
    clock: Mutex<VectorClock>,
    control: ScanControl,
    active: Mutex<Option<Active>>,
    events: mpsc::UnboundedSender<DispatchEvent>,
    next_id: AtomicU64,
    shutdown: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to the job queue and its worker.
#[derive(Clone)]
pub struct Dispatcher {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    /// Load the clock and start the worker. Must be called inside a tokio
    /// runtime.
    ///
    /// # Errors
    /// Returns a storage or codec error if the meta partition is unusable.
    pub fn open(
        store: Store,
        options: DispatcherOptions,
    ) -> Result<(Self, mpsc::UnboundedReceiver<DispatchEvent>)> {
        let meta = store.partition(META_PARTITION);
        meta.prepare()?;
        let device = clock::device_id(&meta, options.device_id.as_deref())?;
        let clock = VectorClock::load(&meta, device)?;
        info!(device = clock.local(), counter = clock.local_counter(), "dispatcher starting");

        let (events, receiver) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(DispatcherState::Idle);
        let shared = Arc::new(Shared {
            store,
            meta,
            queue: Mutex::new(VecDeque::new()),
            wake: Notify::new(),
            state,
            sources: RwLock::new(HashMap::new()),
            clock: Mutex::new(clock),
            control: ScanControl::new(),
            active: Mutex::new(None),
            events,
            next_id: AtomicU64::new(1),
            shutdown: AtomicBool::new(false),
            worker: Mutex::new(None),
        });

        let worker = tokio::spawn(run(Arc::clone(&shared)));
        *lock(&shared.worker) = Some(worker);
        Ok((Self { shared }, receiver))
    }

    /// Register a source; its tree lives in partition `tree/<name>`.
    ///
    /// # Errors
    /// Returns `DoesNotExist`, `AccessDenied` or `NotADirectory` for a bad
    /// root, or a storage error.
    pub async fn add_source(&self, spec: SourceSpec) -> Result<()> {
        let stat = spec
            .fs
            .stat(&spec.root)
            .await
            .map_err(|e| Error::from_source_io(&spec.root, e))?;
        if !stat.is_dir() {
            return Err(Error::NotADirectory(spec.root.clone()));
        }

        let tree = TreeAdapter::open(self.shared.store.partition(&tree_namespace(&spec.name)))?;
        let limiter = Limiter::new(spec.concurrency);
        info!(source = %spec.name, root = %spec.root.display(), "source added");
        let name = spec.name.clone();
        self.shared
            .sources
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name, Arc::new(Source { spec, tree, limiter }));
        Ok(())
    }

    /// Forget a source, drop its queued jobs and cancel its active job.
    ///
    /// The stored tree is kept.
    pub fn remove_source(&self, name: &str) -> bool {
        let removed = self
            .shared
            .sources
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
            .is_some();

        let pruned = {
            let mut queue = lock(&self.shared.queue);
            let before = queue.len();
            queue.retain(|job| job.source != name);
            before - queue.len()
        };
        if let Some(active) = lock(&self.shared.active).as_ref() {
            if active.source == name {
                active.control.cancel();
            }
        }
        if removed {
            info!(source = name, pruned, "source removed");
        }
        removed
    }

    #[must_use]
    pub fn sources(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .shared
            .sources
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// The stored tree of a source.
    ///
    /// # Errors
    /// Returns `UnknownSource` if no such source is registered.
    pub fn tree(&self, source: &str) -> Result<TreeAdapter> {
        self.source(source).map(|s| s.tree.clone())
    }

    /// Queue a job and return its id.
    ///
    /// Change jobs merge into a change job for the same source still waiting
    /// at the back of the queue.
    ///
    /// # Errors
    /// Returns `Shutdown` or `UnknownSource`.
    pub fn enqueue(&self, source: &str, kind: JobKind) -> Result<u64> {
        if self.shared.shutdown.load(Ordering::SeqCst) {
            return Err(Error::Shutdown);
        }
        self.source(source)?;

        let id = {
            let mut queue = lock(&self.shared.queue);
            match coalesce(&mut queue, source, &kind) {
                Some(id) => id,
                None => {
                    let id = self.shared.next_id.fetch_add(1, Ordering::SeqCst);
                    debug!(job = id, source, ?kind, "job queued");
                    queue.push_back(Job {
                        id,
                        source: source.to_string(),
                        kind,
                    });
                    id
                }
            }
        };
        self.shared.wake.notify_one();
        Ok(id)
    }

    /// # Errors
    /// Returns `Shutdown` or `UnknownSource`.
    pub fn scan(&self, source: &str) -> Result<u64> {
        self.enqueue(source, JobKind::Scan)
    }

    /// # Errors
    /// Returns `Shutdown` or `UnknownSource`.
    pub fn notify(&self, source: &str, actions: Vec<WatchAction>) -> Result<u64> {
        self.enqueue(source, JobKind::Change(actions))
    }

    /// Stop dispatching new filesystem work; running operations finish.
    pub fn pause(&self) {
        self.shared.control.pause();
    }

    pub fn resume(&self) {
        self.shared.control.resume();
    }

    /// Cancel the running job, if any. Its completed commits stay.
    pub fn cancel_active(&self) -> bool {
        match lock(&self.shared.active).as_ref() {
            Some(active) => {
                active.control.cancel();
                true
            }
            None => false,
        }
    }

    #[must_use]
    pub fn state(&self) -> DispatcherState {
        self.shared.state.borrow().clone()
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<DispatcherState> {
        self.shared.state.subscribe()
    }

    #[must_use]
    pub fn clock(&self) -> VectorStamp {
        lock(&self.shared.clock).snapshot()
    }

    /// Resolve once the queue is empty and no job is running.
    pub async fn wait_idle(&self) {
        let mut state = self.shared.state.subscribe();
        loop {
            {
                let queue = lock(&self.shared.queue);
                if queue.is_empty() && *state.borrow_and_update() == DispatcherState::Idle {
                    return;
                }
            }
            if state.changed().await.is_err() {
                return;
            }
        }
    }

    /// Refuse new jobs, cancel the active one and wait for the worker.
    pub async fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        lock(&self.shared.queue).clear();
        self.cancel_active();
        self.shared.control.resume();
        self.shared.wake.notify_one();

        let worker = lock(&self.shared.worker).take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                error!(error = %e, "dispatcher worker failed");
            }
        }
        info!("dispatcher stopped");
    }

    fn source(&self, name: &str) -> Result<Arc<Source>> {
        self.shared
            .sources
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownSource(name.to_string()))
    }
}

/// Fold change actions into a change job still waiting at the back.
fn coalesce(queue: &mut VecDeque<Job>, source: &str, kind: &JobKind) -> Option<u64> {
    let JobKind::Change(actions) = kind else {
        return None;
    };
    let last = queue.back_mut().filter(|job| job.source == source)?;
    let JobKind::Change(pending) = &mut last.kind else {
        return None;
    };
    pending.extend(actions.iter().cloned());
    Some(last.id)
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn run(shared: Arc<Shared>) {
    loop {
        if shared.shutdown.load(Ordering::SeqCst) {
            shared.state.send_replace(DispatcherState::Idle);
            return;
        }

        let job = {
            let mut queue = lock(&shared.queue);
            let job = queue.pop_front();
            match &job {
                Some(job) => {
                    shared.state.send_replace(DispatcherState::Scanning {
                        job: job.id,
                        source: job.source.clone(),
                    });
                }
                None => {
                    shared.state.send_if_modified(|state| {
                        let changed = *state != DispatcherState::Idle;
                        *state = DispatcherState::Idle;
                        changed
                    });
                }
            }
            job
        };

        match job {
            Some(job) => run_job(&shared, job).await,
            None => shared.wake.notified().await,
        }
    }
}

async fn run_job(shared: &Shared, job: Job) {
    let source = shared
        .sources
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .get(&job.source)
        .cloned();

    let control = shared.control.fresh();
    *lock(&shared.active) = Some(Active {
        source: job.source.clone(),
        control: control.clone(),
    });

    // Upserts carry the tick this job commits.
    let stamp = {
        let mut next = lock(&shared.clock).clone();
        next.tick()
    };
    info!(job = job.id, source = %job.source, kind = ?job.kind, "job started");

    let result = match &source {
        Some(source) => {
            let mut buffer = CommitBuffer {
                tree: source.tree.clone(),
                source: job.source.clone(),
                job: job.id,
                stamp,
                pending: Vec::new(),
                events: shared.events.clone(),
                last_progress: None,
            };
            let result = execute(source, &job.kind, control, &mut buffer).await;
            match result {
                Err(Error::Cancelled) => match buffer.flush() {
                    Ok(()) => Err(Error::Cancelled),
                    Err(e) => Err(e),
                },
                other => other,
            }
        }
        None => Err(Error::UnknownSource(job.source.clone())),
    };

    *lock(&shared.active) = None;

    let (clock, unpersisted) = advance_clock(&shared.clock, &shared.meta);

    let mut outcome = match result {
        Ok(report) => {
            info!(
                job = job.id,
                source = %job.source,
                upserted = report.upserted,
                removed = report.removed,
                errors = report.errors,
                clock = %clock,
                "job finished"
            );
            JobOutcome {
                job: job.id,
                source: job.source,
                clock,
                report: Some(report),
                error: None,
                cancelled: false,
            }
        }
        Err(Error::Cancelled) => {
            warn!(job = job.id, source = %job.source, "job cancelled");
            JobOutcome {
                job: job.id,
                source: job.source,
                clock,
                report: None,
                error: None,
                cancelled: true,
            }
        }
        Err(e) => {
            error!(job = job.id, source = %job.source, error = %e, "job failed");
            JobOutcome {
                job: job.id,
                source: job.source,
                clock,
                report: None,
                error: Some(e.to_string()),
                cancelled: false,
            }
        }
    };
    if let Some(e) = unpersisted {
        outcome.error.get_or_insert_with(|| format!("clock not persisted: {e}"));
    }
    if shared.events.send(DispatchEvent::Finished(outcome)).is_err() {
        debug!(job = job.id, "event receiver dropped");
    }
}

/// Tick the clock and persist it. The tick stands even if persisting fails;
/// the error is returned for the job outcome.
fn advance_clock(clock: &Mutex<VectorClock>, meta: &Partition) -> (VectorStamp, Option<Error>) {
    let mut clock = lock(clock);
    let stamp = clock.tick();
    match clock.persist(meta) {
        Ok(()) => (stamp, None),
        Err(e) => {
            error!(error = %e, clock = %stamp, "failed to persist clock");
            (stamp, Some(e))
        }
    }
}

async fn execute(
    source: &Source,
    kind: &JobKind,
    control: ScanControl,
    buffer: &mut CommitBuffer,
) -> Result<ScanReport> {
    let spec = &source.spec;
    let integral = IntegralScanner::new(Arc::clone(&spec.fs), spec.root.clone())
        .predicate(Arc::clone(&spec.predicate))
        .limiter(source.limiter.clone())
        .options(spec.scan.clone())
        .control(control);

    let rescan = match kind {
        JobKind::Scan => true,
        JobKind::Change(actions) => actions.contains(&WatchAction::Scan),
    };
    if rescan {
        if source.tree.is_empty()? {
            return integral
                .scan(Path::new(""), &mut PathStack::new(), buffer)
                .await;
        }
        return DeltaScanner::new(integral).scan(&source.tree, buffer).await;
    }

    let JobKind::Change(actions) = kind else {
        return Ok(ScanReport::default());
    };
    let paths: BTreeSet<&Path> = actions
        .iter()
        .filter_map(|action| match action {
            WatchAction::Upsert(path) | WatchAction::Remove(path) => Some(path.as_path()),
            WatchAction::Scan => None,
        })
        .collect();

    let engine = DifferenceEngine::new(integral, spec.diff);
    let mut report = ScanReport::default();
    for path in paths {
        let sub = engine.difference(&source.tree, path, buffer).await?;
        report.absorb(&sub);
    }
    report.finished = true;
    Ok(report)
}

/// Stamps, buffers and writes one job's changes.
struct CommitBuffer {
    tree: TreeAdapter,
    source: String,
    job: u64,
    stamp: VectorStamp,
    pending: Vec<Change>,
    events: mpsc::UnboundedSender<DispatchEvent>,
    last_progress: Option<Instant>,
}

impl CommitBuffer {
    fn stage(&mut self, change: Change) {
        let change = match change {
            Change::Upsert { path, mut entry } => {
                entry.modification = self.stamp.clone();
                Change::Upsert { path, entry }
            }
            remove @ Change::Remove { .. } => remove,
        };
        self.pending.push(change);
    }

    fn emit(&self, event: DispatchEvent) {
        if self.events.send(event).is_err() {
            debug!(source = %self.source, job = self.job, "event receiver dropped");
        }
    }

    fn flush(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let changes = std::mem::take(&mut self.pending);
        self.tree.apply(&changes)?;
        debug!(source = %self.source, count = changes.len(), "committed");

        let changes = changes
            .into_iter()
            .map(|change| match change {
                Change::Upsert { path, entry } => ChangeRecord {
                    action: ChangeAction::Upsert,
                    path,
                    entry: Some(entry),
                },
                Change::Remove { path } => ChangeRecord {
                    action: ChangeAction::Remove,
                    path,
                    entry: None,
                },
            })
            .collect();
        self.emit(DispatchEvent::Commit(CommitEvent {
            source: self.source.clone(),
            stamp: self.stamp.clone(),
            changes,
        }));
        Ok(())
    }
}

impl ChangeSink for CommitBuffer {
    fn push(&mut self, change: Change) -> Result<()> {
        self.stage(change);
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        self.flush()
    }

    /// Progress is coalesced to one event per [`PROGRESS_INTERVAL`]; the
    /// final report always goes out.
    fn progress(&mut self, report: &ScanReport) {
        let now = Instant::now();
        let due = self
            .last_progress
            .is_none_or(|last| now.duration_since(last) >= PROGRESS_INTERVAL);
        if !due && !report.finished {
            return;
        }
        self.last_progress = Some(now);
        self.emit(DispatchEvent::Progress {
            job: self.job,
            source: self.source.clone(),
            report: report.clone(),
        });
    }
}

impl DiffHandler for CommitBuffer {
    fn add(&mut self, path: &Path, entry: Entry) -> Result<()> {
        self.stage(Change::Upsert {
            path: path.to_path_buf(),
            entry,
        });
        Ok(())
    }

    fn update(&mut self, path: &Path, entry: Entry) -> Result<()> {
        self.add(path, entry)
    }

    fn remove(&mut self, path: &Path) -> Result<()> {
        self.stage(Change::Remove {
            path: path.to_path_buf(),
        });
        Ok(())
    }

    fn error(&mut self, path: &Path, error: &Error) {
        warn!(source = %self.source, path = %path.display(), %error, "diff failed");
    }

    fn ignore(&mut self, path: &Path) {
        debug!(source = %self.source, path = %path.display(), "ignored");
    }

    fn commit(&mut self) -> Result<()> {
        self.flush()
    }
}
