//! Write-behind engine: intercepted writes are queued, coalesced and sent
//! to the durable store in single-flight batches.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use futures_util::stream::{self, StreamExt};
use projsync_core::ProjectMetadata;
use thiserror::Error;
use time::OffsetDateTime;
use tokio::runtime::Handle;
use tokio::sync::{Notify, watch};
use tracing::{debug, error, info, warn};

use super::paths::normalize_path;
use super::queue::{PendingWrite, SyncQueue};
use super::scheduler::{DEFAULT_TICK_INTERVAL, PeriodicTick, Trigger, should_start};
use super::status::{StatusCell, SyncStatus};
use super::store::{DurableStore, StoreError};
use super::transmitter::{BatchTransmitter, Delivery, triage_failure};
use super::vfs::{ObservedFs, SyncObserver, VfsError, VirtualFs};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("no project is bound")]
    Unbound,
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("virtual filesystem error: {0}")]
    Vfs(#[from] VfsError),
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub tick_interval: Duration,
    /// Permanent failures a value may see before it is dead-lettered.
    /// Zero keeps retrying forever.
    pub max_permanent_failures: u32,
    pub load_concurrency: usize,
    /// Send still-pending writes for the old project when rebinding.
    pub flush_on_unbind: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_interval: DEFAULT_TICK_INTERVAL,
            max_permanent_failures: 5,
            load_concurrency: 4,
            flush_on_unbind: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub loaded: usize,
    pub failed: Vec<String>,
}

struct ActiveBinding {
    project: ProjectMetadata,
    generation: u64,
    tick: PeriodicTick,
}

#[derive(Default)]
struct EngineState {
    binding: Option<ActiveBinding>,
    queue: SyncQueue,
    /// Remote deletes not yet sent. Never shares a path with `queue`.
    deletes: BTreeSet<String>,
    in_flight: bool,
    dead_letters: Vec<PendingWrite>,
    next_generation: u64,
}

impl EngineState {
    fn pending_work(&self) -> usize {
        self.queue.len() + self.deletes.len()
    }

    fn is_current(&self, generation: u64) -> bool {
        self.binding
            .as_ref()
            .is_some_and(|binding| binding.generation == generation)
    }

    /// Puts back remote deletes that failed transiently, unless the path
    /// has been written again since.
    fn restore_deletes(&mut self, paths: Vec<String>) {
        for path in paths {
            if !self.queue.contains(&path) {
                self.deletes.insert(path);
            }
        }
    }
}

/// One drained unit of work: the writes and deletes of a single attempt.
struct Attempt {
    project_id: String,
    generation: u64,
    writes: Vec<PendingWrite>,
    deletes: Vec<String>,
}

struct EngineInner<S, F> {
    transmitter: BatchTransmitter<S>,
    fs: Arc<F>,
    config: EngineConfig,
    state: Mutex<EngineState>,
    status: StatusCell,
    flight_done: Notify,
    runtime: Handle,
}

pub struct SyncEngine<S, F> {
    inner: Arc<EngineInner<S, F>>,
}

impl<S, F> Clone for SyncEngine<S, F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: DurableStore, F: VirtualFs> SyncEngine<S, F> {
    /// Creates an unbound engine. Background work is spawned on the Tokio
    /// runtime this is called from.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    pub fn new(store: Arc<S>, fs: Arc<F>, config: EngineConfig) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                transmitter: BatchTransmitter::new(store),
                fs,
                config,
                state: Mutex::new(EngineState::default()),
                status: StatusCell::new(),
                flight_done: Notify::new(),
                runtime: Handle::current(),
            }),
        }
    }

    /// The filesystem callers should edit through; every change is
    /// reported back to this engine.
    pub fn observed_fs(&self) -> ObservedFs<F, Self> {
        ObservedFs::new(Arc::clone(&self.inner.fs), self.clone())
    }

    pub fn store(&self) -> &Arc<S> {
        self.inner.transmitter.store()
    }

    pub fn status(&self) -> watch::Receiver<SyncStatus> {
        self.inner.status.subscribe()
    }

    pub fn current_status(&self) -> SyncStatus {
        self.inner.status.current()
    }

    pub fn project_id(&self) -> Option<String> {
        let state = self.inner.lock();
        state
            .binding
            .as_ref()
            .map(|binding| binding.project.id.clone())
    }

    pub fn pending_paths(&self) -> Vec<String> {
        self.inner.lock().queue.paths()
    }

    pub fn pending_len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    pub fn pending_deletes(&self) -> Vec<String> {
        self.inner.lock().deletes.iter().cloned().collect()
    }

    pub fn dead_letters(&self) -> Vec<PendingWrite> {
        self.inner.lock().dead_letters.clone()
    }

    /// Switches to `project` (or to no project). Stops the old periodic
    /// tick, waits for an in-flight batch, optionally sends what is still
    /// pending for the old project, then starts over with an empty queue.
    /// Nothing is sent for the old project once this returns.
    pub async fn bind(&self, project: Option<ProjectMetadata>) {
        {
            let mut state = self.inner.lock();
            if let Some(binding) = state.binding.as_mut() {
                binding.tick.stop();
            }
        }

        self.inner.acquire_flight().await;

        let (previous, leftover, deletes) = {
            let mut guard = self.inner.lock();
            let state = &mut *guard;
            let previous = state
                .binding
                .as_ref()
                .map(|binding| binding.project.id.clone());
            let deletes: Vec<String> = std::mem::take(&mut state.deletes).into_iter().collect();
            (previous, state.queue.drain(), deletes)
        };

        if let Some(previous) = previous.as_deref() {
            if !leftover.is_empty() || !deletes.is_empty() {
                self.final_flush(previous, &leftover, deletes).await;
            }
        }

        let mut guard = self.inner.lock();
        let state = &mut *guard;
        let late = state.queue.clear() + state.deletes.len();
        state.deletes.clear();
        if late > 0 {
            warn!(
                dropped = late,
                "changes arriving during rebind were discarded"
            );
        }
        state.dead_letters.clear();
        state.next_generation += 1;
        let generation = state.next_generation;
        state.binding = project.clone().map(|project| {
            let mut tick = PeriodicTick::stopped();
            let weak = Arc::downgrade(&self.inner);
            tick.start(
                &self.inner.runtime,
                self.inner.config.tick_interval,
                move || on_tick(&weak, generation),
            );
            ActiveBinding {
                project,
                generation,
                tick,
            }
        });
        self.inner.status.reset(project.clone());
        self.inner.release_flight(state);
        match &project {
            Some(project) => info!(project = %project.id, name = %project.name, "project bound"),
            None => info!("project unbound"),
        }
    }

    pub async fn dispose(&self) {
        self.bind(None).await;
    }

    async fn final_flush(&self, project_id: &str, leftover: &[PendingWrite], deletes: Vec<String>) {
        if !self.inner.config.flush_on_unbind {
            warn!(
                project = project_id,
                dropped = leftover.len(),
                deletes = deletes.len(),
                "discarding pending changes on rebind"
            );
            return;
        }
        self.inner.status.set_syncing(true);
        match self.inner.transmitter.transmit(project_id, leftover).await {
            Ok(sent) => info!(project = project_id, files = sent, "final flush before rebind"),
            Err(err) => warn!(
                project = project_id,
                dropped = leftover.len(),
                error = %err,
                "final flush failed, discarding pending writes"
            ),
        }
        let failed = self.inner.send_deletes(project_id, deletes).await;
        if !failed.is_empty() {
            warn!(project = project_id, dropped = failed.len(), "discarding remote deletes on rebind");
        }
        self.inner.status.set_syncing(false);
    }

    /// Fetches every remote file of `project_id` into the virtual
    /// filesystem without queueing them for upload. Files that fail to
    /// load are logged and skipped.
    pub async fn load_initial(&self, project_id: &str) -> Result<LoadReport, EngineError> {
        let store = self.inner.transmitter.store();
        let paths = store.list_paths(project_id).await?;
        let total = paths.len();
        let fetched: Vec<(String, Result<Vec<u8>, StoreError>)> = stream::iter(paths)
            .map(|path| async move {
                let result = store.read_file(project_id, &path).await;
                (path, result)
            })
            .buffered(self.inner.config.load_concurrency.max(1))
            .collect()
            .await;

        let mut report = LoadReport::default();
        for (path, result) in fetched {
            let written = result.map_err(EngineError::from).and_then(|content| {
                self.inner
                    .fs
                    .write(&path, content)
                    .map_err(EngineError::from)
            });
            match written {
                Ok(()) => report.loaded += 1,
                Err(err) => {
                    warn!(project = project_id, path = %path, error = %err, "skipping file that failed to load");
                    report.failed.push(path);
                }
            }
        }
        info!(
            project = project_id,
            total,
            loaded = report.loaded,
            failed = report.failed.len(),
            "initial load finished"
        );
        Ok(report)
    }

    /// Explicit save: sends every file in the virtual filesystem, plus any
    /// queued write the filesystem does not hold, as one batch and reports
    /// the outcome to the caller. Pending remote deletes go out with it.
    pub async fn flush_now(&self) -> Result<usize, EngineError> {
        if self.project_id().is_none() {
            return Err(EngineError::Unbound);
        }
        self.inner.acquire_flight().await;

        let attempt = {
            let mut guard = self.inner.lock();
            self.inner.take_attempt(&mut guard)
        };
        let Some(attempt) = attempt else {
            return Err(EngineError::Unbound);
        };
        let Attempt {
            project_id,
            generation,
            writes: drained,
            deletes,
        } = attempt;

        let mut batch: Vec<PendingWrite> = self
            .inner
            .fs
            .list_with_contents()
            .into_iter()
            .map(PendingWrite::from)
            .collect();
        let in_snapshot: BTreeSet<String> = batch.iter().map(|write| write.path.clone()).collect();
        batch.extend(
            drained
                .iter()
                .filter(|write| !in_snapshot.contains(&write.path))
                .cloned(),
        );

        self.inner.status.set_syncing(true);
        let result = self.inner.transmitter.transmit(&project_id, &batch).await;
        let failed_deletes = self.inner.send_deletes(&project_id, deletes).await;

        let chain = {
            let mut guard = self.inner.lock();
            let state = &mut *guard;
            let current = state.is_current(generation);
            let arrived = state.pending_work();
            let deletes_sent = failed_deletes.is_empty();
            if current {
                state.restore_deletes(failed_deletes);
            }
            match &result {
                Ok(sent) => {
                    if current && deletes_sent {
                        self.inner.status.mark_synced(OffsetDateTime::now_utc());
                    } else {
                        self.inner.status.set_syncing(false);
                    }
                    info!(project = %project_id, files = sent, "explicit flush finished");
                }
                Err(err) => {
                    if current {
                        let survivors: Vec<PendingWrite> = drained
                            .into_iter()
                            .filter(|write| !state.deletes.contains(&write.path))
                            .collect();
                        state.queue.requeue(survivors);
                    }
                    self.inner.status.set_syncing(false);
                    warn!(project = %project_id, error = %err, "explicit flush failed");
                }
            }
            let chain = current && should_start(Trigger::Chain, arrived, true);
            if !chain {
                self.inner.release_flight(state);
            }
            chain
        };
        if chain {
            self.inner.spawn_flight();
        }

        Ok(result?)
    }

    /// Queues a write for the bound project and kicks the scheduler.
    pub fn enqueue_write(&self, path: &str, content: Vec<u8>) {
        let path = match normalize_path(path) {
            Ok(path) => path,
            Err(err) => {
                warn!(path, error = %err, "ignoring write with invalid path");
                return;
            }
        };
        let start = {
            let mut guard = self.inner.lock();
            let state = &mut *guard;
            if state.binding.is_none() {
                debug!(path = %path, "no project bound, write not queued");
                return;
            }
            state.deletes.remove(&path);
            state.queue.enqueue(PendingWrite::new(path, content));
            self.inner.claim_flight(state, Trigger::Write)
        };
        if start {
            self.inner.spawn_flight();
        }
    }

    /// Drops any pending write for `path` and schedules its remote delete.
    /// The delete is sent by the flight, after any batch already carrying
    /// the path has settled.
    pub fn remove_file(&self, path: &str) {
        let Ok(path) = normalize_path(path) else {
            return;
        };
        let start = {
            let mut guard = self.inner.lock();
            let state = &mut *guard;
            if state.binding.is_none() {
                debug!(path = %path, "no project bound, delete not queued");
                return;
            }
            state.queue.remove(&path);
            state.deletes.insert(path);
            self.inner.claim_flight(state, Trigger::Write)
        };
        if start {
            self.inner.spawn_flight();
        }
    }

    /// Resolves once no batch is outstanding.
    pub async fn wait_idle(&self) {
        loop {
            let notified = {
                let state = self.inner.lock();
                if !state.in_flight {
                    return;
                }
                self.inner.flight_done.notified()
            };
            notified.await;
        }
    }
}

impl<S: DurableStore, F: VirtualFs> SyncObserver for SyncEngine<S, F> {
    fn on_write(&self, path: &str, content: Vec<u8>) {
        self.enqueue_write(path, content);
    }

    fn on_remove(&self, path: &str) {
        self.remove_file(path);
    }
}

fn on_tick<S: DurableStore, F: VirtualFs>(weak: &Weak<EngineInner<S, F>>, generation: u64) -> bool {
    let Some(inner) = weak.upgrade() else {
        return false;
    };
    let start = {
        let mut guard = inner.lock();
        let state = &mut *guard;
        if !state.is_current(generation) {
            return false;
        }
        let start = inner.claim_flight(state, Trigger::Tick);
        if start {
            debug!(pending = state.pending_work(), "periodic tick draining queue");
        }
        start
    };
    if start {
        inner.spawn_flight();
    }
    true
}

impl<S: DurableStore, F: VirtualFs> EngineInner<S, F> {
    fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Takes the flight when `trigger` allows a new attempt.
    fn claim_flight(&self, state: &mut EngineState, trigger: Trigger) -> bool {
        let start = should_start(trigger, state.pending_work(), state.in_flight);
        if start {
            state.in_flight = true;
        }
        start
    }

    /// Caller must already own the flight.
    fn spawn_flight(self: &Arc<Self>) {
        let inner = Arc::clone(self);
        self.runtime.spawn(inner.run_flight());
    }

    async fn acquire_flight(&self) {
        loop {
            let notified = {
                let mut state = self.lock();
                if !state.in_flight {
                    state.in_flight = true;
                    return;
                }
                self.flight_done.notified()
            };
            notified.await;
        }
    }

    fn release_flight(&self, state: &mut EngineState) {
        state.in_flight = false;
        self.flight_done.notify_waiters();
    }

    /// Drains writes and deletes for the bound project, or releases the
    /// flight and returns `None` when nothing is bound.
    fn take_attempt(&self, state: &mut EngineState) -> Option<Attempt> {
        let Some(binding) = state.binding.as_ref() else {
            self.release_flight(state);
            return None;
        };
        Some(Attempt {
            project_id: binding.project.id.clone(),
            generation: binding.generation,
            writes: state.queue.drain(),
            deletes: std::mem::take(&mut state.deletes).into_iter().collect(),
        })
    }

    /// Sends each delete once. Returns the paths whose delete failed
    /// transiently; a missing remote file counts as deleted.
    async fn send_deletes(&self, project_id: &str, paths: Vec<String>) -> Vec<String> {
        let store = self.transmitter.store();
        let mut failed = Vec::new();
        for path in paths {
            match store.delete_file(project_id, &path).await {
                Ok(()) => debug!(project = project_id, path = %path, "deleted remote file"),
                Err(StoreError::FileNotFound(_)) => {
                    debug!(project = project_id, path = %path, "remote file already gone")
                }
                Err(err) if err.is_permanent() => {
                    warn!(project = project_id, path = %path, error = %err, "remote delete rejected")
                }
                Err(err) => {
                    warn!(project = project_id, path = %path, error = %err, "remote delete failed, will retry");
                    failed.push(path);
                }
            }
        }
        failed
    }

    /// Drains and sends until nothing new arrives. Runs as one task so
    /// chained attempts never grow the stack.
    async fn run_flight(self: Arc<Self>) {
        loop {
            let attempt = {
                let mut guard = self.lock();
                let state = &mut *guard;
                if state.pending_work() == 0 {
                    self.release_flight(state);
                    None
                } else {
                    self.take_attempt(state)
                }
            };
            let Some(attempt) = attempt else {
                return;
            };

            self.status.set_syncing(true);
            let delivery = self
                .transmitter
                .deliver(&attempt.project_id, attempt.writes)
                .await;
            let failed_deletes = self.send_deletes(&attempt.project_id, attempt.deletes).await;
            if !self.settle(
                &attempt.project_id,
                attempt.generation,
                delivery,
                failed_deletes,
            ) {
                return;
            }
            tokio::task::yield_now().await;
        }
    }

    /// Applies the outcome of a background attempt. Returns whether the
    /// flight continues with another attempt.
    fn settle(
        &self,
        project_id: &str,
        generation: u64,
        delivery: Delivery,
        failed_deletes: Vec<String>,
    ) -> bool {
        let mut guard = self.lock();
        let state = &mut *guard;
        if !state.is_current(generation) {
            if let Some(err) = &delivery.error {
                warn!(project = project_id, files = delivery.failed.len(), error = %err, "batch for a previous binding failed");
            }
            self.release_flight(state);
            return false;
        }

        let arrived = state.pending_work();
        let complete = delivery.is_complete() && failed_deletes.is_empty();
        state.restore_deletes(failed_deletes);
        if delivery.is_complete() {
            debug!(project = project_id, files = delivery.sent, "batch persisted");
        } else {
            let Delivery {
                sent,
                failed,
                error: err,
            } = delivery;
            // Paths deleted while the attempt was out stay deleted.
            let failed: Vec<(PendingWrite, bool)> = failed
                .into_iter()
                .filter(|(write, _)| !state.deletes.contains(&write.path))
                .collect();
            let triage = triage_failure(failed, self.config.max_permanent_failures);
            let restored = state.queue.requeue(triage.retry);
            let reason = err.as_ref().map(ToString::to_string).unwrap_or_default();
            for dead in triage.dead {
                if state.queue.contains(&dead.path) {
                    continue;
                }
                error!(
                    project = project_id,
                    path = %dead.path,
                    failures = dead.failures,
                    error = %reason,
                    "giving up on write after repeated permanent failures"
                );
                state.dead_letters.push(dead);
            }
            warn!(
                project = project_id,
                sent,
                restored,
                error = %reason,
                "batch failed, writes requeued"
            );
        }
        if complete {
            self.status.mark_synced(OffsetDateTime::now_utc());
        } else {
            self.status.set_syncing(false);
        }

        if should_start(Trigger::Chain, arrived, true) {
            true
        } else {
            self.release_flight(state);
            false
        }
    }
}

#[cfg(test)]
#[path = "engine_tests.rs"]
mod tests;
