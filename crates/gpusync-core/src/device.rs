//! Device: the engines, the token allocator, the handle arena and the completion poller shared
//! by every queue created on it.
//!
//! Lock order is queue state, then engines in ascending id order, then the arena, then the token
//! pool. Code holding the arena never takes a queue lock; deferred work discovered under the
//! arena is returned as [`Work`] items and driven by [`DeviceInner::propagate`] after every lock
//! has been released. Callbacks likewise run with no lock held.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use gpusync_cmd::encoder_for;

use crate::arena::{FiredCallback, HandleArena, HandleOrigin, HandleRecord, PendingCallback};
use crate::backend::{EngineBackend, HangDetector, NeverHangs};
use crate::config::SyncConfig;
use crate::engine::Engine;
use crate::error::{ConfigError, Result, SyncError};
use crate::handle::{Callback, CompletionHandle, UserHandle};
use crate::memory::{lock, SyncMemory};
use crate::poller::Poller;
use crate::queue::{QueueProperties, QueueShared, SubmissionQueue};
use crate::stats::{DeviceStats, DeviceStatsSnapshot};
use crate::token::{CompletionToken, TokenAllocator, TokenContainer, TokenPool};
use crate::types::{CommandKind, EngineId, EngineKind, ExecutionStatus, HandleId, QueueId, TaskCount, TaskLevel};
use crate::wait::{BackoffStrategy, WaitOutcome, WaitPolicy};

pub(crate) const COMPUTE: EngineId = EngineId(0);

/// Deferred work discovered while resolving a handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Work {
    /// Every parent resolved: replay the deferred command.
    Ready(HandleId),
    /// A parent was aborted: fail the deferred command.
    Abort(HandleId),
}

impl Work {
    fn id(self) -> HandleId {
        match self {
            Work::Ready(id) | Work::Abort(id) => id,
        }
    }
}

/// Follow-up produced by a replay or abort, run once the producer has dropped its locks.
#[derive(Default)]
pub(crate) struct Outcome {
    pub(crate) work: Vec<Work>,
    pub(crate) fired: Vec<FiredCallback>,
}

impl Outcome {
    pub(crate) fn merge(&mut self, other: Outcome) {
        self.work.extend(other.work);
        self.fired.extend(other.fired);
    }
}

/// Wait-list state captured under the arena lock at enqueue or replay time.
#[derive(Debug, Default)]
pub(crate) struct DependencySnapshot {
    /// Highest task level in the wait list, `None` for an empty wait list.
    pub(crate) level: Option<TaskLevel>,
    pub(crate) tokens: TokenContainer,
    pub(crate) task_count: TaskCount,
    pub(crate) copy_task_counts: Vec<(EngineId, TaskCount)>,
    /// Handles still waiting on a user status change or a deferred replay.
    pub(crate) blocking: Vec<HandleId>,
    pub(crate) aborted: bool,
}

/// Keep the highest task count per engine.
pub(crate) fn merge_task_counts(into: &mut Vec<(EngineId, TaskCount)>, engine: EngineId, task_count: TaskCount) {
    if !task_count.is_ready() {
        return;
    }
    match into.iter_mut().find(|(e, _)| *e == engine) {
        Some((_, tc)) => *tc = (*tc).max(task_count),
        None => into.push((engine, task_count)),
    }
}

pub(crate) struct DeviceInner {
    pub(crate) config: SyncConfig,
    engines: Vec<Engine>,
    pub(crate) tokens: Arc<dyn TokenAllocator>,
    memory: Arc<SyncMemory>,
    hang: Arc<dyn HangDetector>,
    pub(crate) wait_policy: WaitPolicy,
    arena: Mutex<HandleArena>,
    queues: Mutex<HashMap<QueueId, Weak<QueueShared>>>,
    next_queue_id: AtomicU32,
    pub(crate) stats: DeviceStats,
    poller: Arc<Poller>,
    self_ref: Weak<DeviceInner>,
}

impl DeviceInner {
    pub(crate) fn engine(&self, id: EngineId) -> &Engine {
        &self.engines[id.0 as usize]
    }

    pub(crate) fn hang_detector(&self) -> &dyn HangDetector {
        self.hang.as_ref()
    }

    pub(crate) fn arena(&self) -> MutexGuard<'_, HandleArena> {
        lock(&self.arena)
    }

    pub(crate) fn acquire_token(&self, producer: EngineId) -> Result<CompletionToken> {
        self.tokens.acquire(producer)
    }

    fn queue(&self, id: QueueId) -> Option<Arc<QueueShared>> {
        lock(&self.queues).get(&id).and_then(Weak::upgrade)
    }

    pub(crate) fn unregister_queue(&self, id: QueueId) {
        lock(&self.queues).remove(&id);
    }

    /// Free every unreachable record. Their tokens go back to the pool here, after the arena
    /// lock is released.
    pub(crate) fn collect_garbage(&self) {
        let freed = self.arena().collect();
        drop(freed);
    }

    pub(crate) fn fire(&self, fired: Vec<FiredCallback>) {
        if fired.is_empty() {
            return;
        }
        self.stats.add_callbacks_fired(fired.len() as u64);
        for (callback, status) in fired {
            callback(status);
        }
    }

    /// Fire callbacks, drive deferred work and collect garbage.
    pub(crate) fn finish_outcome(&self, outcome: Outcome) {
        self.fire(outcome.fired);
        self.propagate(outcome.work);
        self.collect_garbage();
    }

    /// Snapshot the wait-list state. Stale ids are reported as invalid operations.
    pub(crate) fn snapshot_dependencies(&self, ids: &[HandleId]) -> Result<DependencySnapshot> {
        let arena = self.arena();
        Self::snapshot_locked(&arena, ids)
    }

    pub(crate) fn snapshot_locked(arena: &HandleArena, ids: &[HandleId]) -> Result<DependencySnapshot> {
        let mut snapshot = DependencySnapshot::default();
        for &id in ids {
            let record = arena
                .get(id)
                .ok_or_else(|| SyncError::InvalidOperation(format!("{id:?} is not a live handle")))?;
            if record.status == ExecutionStatus::Aborted {
                snapshot.aborted = true;
            }
            if record.is_unresolved() {
                snapshot.blocking.push(id);
            }
            snapshot.level = Some(match snapshot.level {
                Some(level) => level.max(record.task_level),
                None => record.task_level,
            });
            snapshot.tokens.assign_and_increment(&record.tokens);
            if record.task_count.is_ready() {
                snapshot.task_count = snapshot.task_count.max(record.task_count);
            }
            for &(engine, tc) in &record.copy_task_counts {
                merge_task_counts(&mut snapshot.copy_task_counts, engine, tc);
            }
        }
        Ok(snapshot)
    }

    pub(crate) fn fences_complete(&self, fences: &[(EngineId, TaskCount)]) -> bool {
        fences
            .iter()
            .all(|&(engine, tc)| self.engine(engine).is_complete(tc))
    }

    /// Refresh a backend handle's status from the engine completion tags.
    ///
    /// User and placeholder handles, terminal handles and handles still waiting for a replay are
    /// returned unchanged. `None` means the id is stale.
    pub(crate) fn update_status(&self, id: HandleId) -> Option<ExecutionStatus> {
        let (status, fired) = {
            let mut arena = self.arena();
            let record = arena.get(id)?;
            if !record.origin.is_polled() || record.status.is_terminal() || !record.task_level.is_ready() {
                return Some(record.status);
            }
            let fences = record.fences();
            let done = fences
                .iter()
                .filter(|&&(engine, tc)| self.engine(engine).is_complete(tc))
                .count();
            let observed = if done == fences.len() {
                ExecutionStatus::Complete
            } else if done > 0 {
                ExecutionStatus::Running
            } else {
                ExecutionStatus::Submitted
            };
            let fired = arena.transition(id, observed);
            (arena.get(id).map(|r| r.status), fired)
        };
        self.fire(fired);
        status
    }

    pub(crate) fn set_user_status(&self, id: HandleId, status: ExecutionStatus) -> Result<()> {
        if !matches!(status, ExecutionStatus::Complete | ExecutionStatus::Aborted) {
            return Err(SyncError::InvalidStatus(format!(
                "user handles can only become complete or aborted, not {status}"
            )));
        }

        let mut outcome = Outcome::default();
        {
            let mut arena = self.arena();
            let record = arena
                .get_mut(id)
                .ok_or_else(|| SyncError::InvalidOperation(format!("{id:?} is not a live handle")))?;
            if record.origin != HandleOrigin::User {
                return Err(SyncError::InvalidOperation(
                    "set_status is only valid on user handles".to_string(),
                ));
            }
            if record.status != ExecutionStatus::Queued {
                return Err(SyncError::InvalidStatus(format!(
                    "user handle already {}",
                    record.status
                )));
            }

            if status == ExecutionStatus::Complete {
                record.task_level = TaskLevel::ZERO;
                record.task_count = TaskCount::ZERO;
                outcome.fired = arena.transition(id, status);
                for (child, last_parent) in arena.take_children(id) {
                    if last_parent {
                        outcome.work.push(Work::Ready(child));
                    }
                }
            } else {
                let (fired, children) = arena.abort(id);
                outcome.fired = fired;
                outcome.work.extend(children.into_iter().map(Work::Abort));
            }
        }
        tracing::debug!(?id, %status, unblocked = outcome.work.len(), "user handle set");

        self.finish_outcome(outcome);
        self.poller.interrupt();
        Ok(())
    }

    /// Run replays and aborts until no deferred work is left.
    pub(crate) fn propagate(&self, work: impl IntoIterator<Item = Work>) {
        let mut pending: VecDeque<Work> = work.into_iter().collect();
        while let Some(item) = pending.pop_front() {
            let owner = self
                .arena()
                .get(item.id())
                .and_then(|r| r.deferred.as_ref().map(|d| d.queue));
            // Already replayed or aborted.
            let Some(owner) = owner else {
                continue;
            };

            let outcome = match (self.queue(owner), item) {
                (Some(queue), Work::Ready(id)) => queue.replay(id),
                (Some(queue), Work::Abort(id)) => queue.abort(id),
                (None, _) => {
                    tracing::warn!(id = ?item.id(), queue = owner.0, "deferred command outlived its queue");
                    self.stats.inc_deferred_aborts();
                    let (fired, children) = self.arena().abort(item.id());
                    Outcome {
                        work: children.into_iter().map(Work::Abort).collect(),
                        fired,
                    }
                }
            };
            self.fire(outcome.fired);
            pending.extend(outcome.work);
        }
    }

    /// Abort every non-terminal handle in `ids`, along with everything waiting on them.
    pub(crate) fn abort_handles(&self, ids: &[HandleId]) {
        for &id in ids {
            self.update_status(id);
        }

        let mut outcome = Outcome::default();
        {
            let mut arena = self.arena();
            for &id in ids {
                let Some(record) = arena.get(id) else {
                    continue;
                };
                if record.status.is_terminal() {
                    continue;
                }
                if record.deferred.is_some() {
                    // Goes through its queue so the queue unblocks.
                    outcome.work.push(Work::Abort(id));
                    continue;
                }
                let (fired, children) = arena.abort(id);
                outcome.fired.extend(fired);
                outcome.work.extend(children.into_iter().map(Work::Abort));
            }
        }
        self.finish_outcome(outcome);
    }

    fn on_hang(&self, ids: &[HandleId]) -> SyncError {
        self.stats.inc_hangs_detected();
        tracing::warn!(handles = ids.len(), "device hang detected while waiting");
        self.abort_handles(ids);
        SyncError::DeviceHang
    }

    /// Block until every handle in `ids` is complete.
    pub(crate) fn wait(&self, ids: &[HandleId]) -> Result<()> {
        self.stats.inc_waits();

        // Deferred handles first have to be replayed by someone else.
        let resolved = self.wait_policy.wait_until(self.hang_detector(), || {
            let arena = self.arena();
            ids.iter()
                .all(|&id| arena.get(id).map_or(true, |r| !r.is_unresolved()))
        });
        if resolved != WaitOutcome::Ready {
            return Err(self.on_hang(ids));
        }

        let fences: Vec<(EngineId, TaskCount)> = {
            let arena = self.arena();
            ids.iter()
                .filter_map(|&id| arena.get(id))
                .filter(|r| r.status != ExecutionStatus::Aborted && r.origin.is_polled())
                .flat_map(HandleRecord::fences)
                .collect()
        };
        let retired = self
            .wait_policy
            .wait_until(self.hang_detector(), || self.fences_complete(&fences));
        if retired != WaitOutcome::Ready {
            return Err(self.on_hang(ids));
        }

        let mut aborted = false;
        for &id in ids {
            aborted |= self.update_status(id) == Some(ExecutionStatus::Aborted);
        }
        if aborted {
            return Err(SyncError::WaitListAborted);
        }
        Ok(())
    }

    /// Wait on a single backend handle for at most `timeout`.
    ///
    /// A hang leaves the handle as it is; only [`DeviceInner::wait`] aborts on hang.
    pub(crate) fn wait_bounded(&self, id: HandleId, timeout: Duration) -> WaitOutcome {
        let fences = match self.arena().get(id) {
            Some(record) if !record.is_unresolved() && !record.status.is_terminal() => record.fences(),
            _ => return WaitOutcome::Ready,
        };
        let outcome = self
            .wait_policy
            .with_timeout(timeout)
            .wait_until(self.hang_detector(), || self.fences_complete(&fences));
        match outcome {
            WaitOutcome::Hang => tracing::debug!(?id, "poller saw a device hang"),
            WaitOutcome::Ready => {
                self.update_status(id);
            }
            WaitOutcome::TimedOut => {}
        }
        outcome
    }

    pub(crate) fn add_callback(&self, id: HandleId, threshold: ExecutionStatus, callback: Callback) -> Result<()> {
        if !matches!(
            threshold,
            ExecutionStatus::Submitted | ExecutionStatus::Running | ExecutionStatus::Complete
        ) {
            return Err(SyncError::InvalidOperation(format!(
                "callbacks cannot wait for {threshold}"
            )));
        }

        self.update_status(id);
        let mut register = false;
        let immediate = {
            let mut arena = self.arena();
            let record = arena
                .get_mut(id)
                .ok_or_else(|| SyncError::InvalidOperation(format!("{id:?} is not a live handle")))?;
            if record.status.has_reached(threshold) {
                Some((callback, record.status))
            } else {
                record.callbacks.push(PendingCallback { threshold, callback });
                let take_callback_ref = !record.callback_ref;
                record.callback_ref = true;
                if self.config.poller.enabled && !record.poller_registered {
                    record.poller_registered = true;
                    register = true;
                }
                if take_callback_ref {
                    arena.retain_internal(id);
                }
                if register {
                    arena.retain_internal(id);
                }
                None
            }
        };

        if let Some(due) = immediate {
            self.fire(vec![due]);
        }
        if register {
            self.poller.register(&self.self_ref, id);
        }
        Ok(())
    }

    /// One poller pass: refresh every listed handle and drop the ones with no callbacks left.
    ///
    /// Returns the backend handle with the lowest compute task count, if any.
    pub(crate) fn process_poll_list(&self, list: &mut Vec<HandleId>) -> Option<HandleId> {
        for &id in list.iter() {
            self.update_status(id);
        }

        let mut candidate: Option<(TaskCount, HandleId)> = None;
        {
            let mut arena = self.arena();
            let mut done = Vec::new();
            list.retain(|&id| {
                let Some(record) = arena.get_mut(id) else {
                    return false;
                };
                if record.callbacks.is_empty() {
                    record.poller_registered = false;
                    done.push(id);
                    return false;
                }
                let dispatched = record.origin.is_polled()
                    && !record.status.is_terminal()
                    && record.task_level.is_ready()
                    && record.task_count.is_ready();
                if dispatched && candidate.map_or(true, |(best, _)| record.task_count < best) {
                    candidate = Some((record.task_count, id));
                }
                true
            });
            for id in done {
                arena.release_internal(id);
            }
        }
        self.collect_garbage();
        candidate.map(|(_, id)| id)
    }
}

impl Drop for DeviceInner {
    fn drop(&mut self) {
        self.poller.shutdown();
    }
}

/// Entry point: a compute engine, zero or more copy engines, and the state they share.
#[derive(Clone)]
pub struct Device {
    inner: Arc<DeviceInner>,
}

impl Device {
    pub fn builder(config: SyncConfig) -> DeviceBuilder {
        DeviceBuilder::new(config)
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    pub fn engine(&self, id: EngineId) -> Option<&Engine> {
        self.inner.engines.get(id.0 as usize)
    }

    pub fn engines(&self) -> &[Engine] {
        &self.inner.engines
    }

    pub fn compute_engine(&self) -> &Engine {
        self.inner.engine(COMPUTE)
    }

    pub fn copy_engine_count(&self) -> usize {
        self.inner.engines.len() - 1
    }

    pub fn memory(&self) -> &Arc<SyncMemory> {
        &self.inner.memory
    }

    pub fn create_queue(&self, properties: QueueProperties) -> Result<SubmissionQueue> {
        let copy_engine = match properties.copy_engine {
            _ if self.copy_engine_count() == 0 => None,
            None => None,
            Some(index) if index < self.copy_engine_count() => Some(EngineId(index as u32 + 1)),
            Some(index) => {
                return Err(SyncError::InvalidOperation(format!(
                    "copy engine {index} requested, device has {}",
                    self.copy_engine_count()
                )))
            }
        };

        let id = QueueId(self.inner.next_queue_id.fetch_add(1, Ordering::Relaxed));
        let shared = Arc::new(QueueShared::new(id, self.inner.clone(), properties.flags, copy_engine));
        lock(&self.inner.queues).insert(id, Arc::downgrade(&shared));
        tracing::debug!(queue = id.0, flags = ?properties.flags, ?copy_engine, "queue created");
        Ok(SubmissionQueue::new(shared))
    }

    /// Create a handle whose status is set by the caller.
    pub fn create_user_handle(&self) -> UserHandle {
        let record = HandleRecord::new(CommandKind::User, HandleOrigin::User, None);
        let id = self.inner.arena().insert(record, 1, 0);
        UserHandle::new(CompletionHandle::adopt(self.inner.clone(), id))
    }

    /// Block until every handle is complete.
    ///
    /// Fails with [`SyncError::DeviceHang`] if a hang is observed (every handle not yet complete
    /// becomes `Aborted`), or [`SyncError::WaitListAborted`] if one of them was aborted.
    pub fn wait(&self, handles: &[&CompletionHandle]) -> Result<()> {
        let mut ids = Vec::with_capacity(handles.len());
        for handle in handles {
            if !Arc::ptr_eq(&handle.device, &self.inner) {
                return Err(SyncError::InvalidOperation(
                    "handle belongs to another device".to_string(),
                ));
            }
            ids.push(handle.id);
        }
        self.inner.wait(&ids)
    }

    pub fn stats(&self) -> DeviceStatsSnapshot {
        self.inner.stats.snapshot()
    }

    pub fn stats_json(&self) -> String {
        self.inner.stats.to_json()
    }

    /// Tokens the allocator can still hand out.
    pub fn available_tokens(&self) -> usize {
        self.inner.tokens.available()
    }

    /// Handle records currently alive in the arena.
    pub fn live_handles(&self) -> usize {
        self.inner.arena().live_count()
    }

    pub fn poller_started(&self) -> bool {
        self.inner.poller.is_started()
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("engines", &self.inner.engines)
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

pub struct DeviceBuilder {
    config: SyncConfig,
    memory: Option<Arc<SyncMemory>>,
    backends: Vec<Box<dyn EngineBackend>>,
    hang: Option<Arc<dyn HangDetector>>,
    backoff: Option<Arc<dyn BackoffStrategy>>,
    tokens: Option<Arc<dyn TokenAllocator>>,
}

impl DeviceBuilder {
    pub fn new(config: SyncConfig) -> Self {
        Self {
            config,
            memory: None,
            backends: Vec::new(),
            hang: None,
            backoff: None,
            tokens: None,
        }
    }

    /// Memory holding the engines' completion tags; tokens are carved from it as well.
    pub fn memory(mut self, memory: Arc<SyncMemory>) -> Self {
        self.memory = Some(memory);
        self
    }

    /// Add an engine. The first one must be the compute engine, every later one a copy engine.
    pub fn engine(mut self, backend: Box<dyn EngineBackend>) -> Self {
        self.backends.push(backend);
        self
    }

    pub fn hang_detector(mut self, hang: Arc<dyn HangDetector>) -> Self {
        self.hang = Some(hang);
        self
    }

    /// Override the backoff chosen from `config.wait`.
    pub fn backoff(mut self, backoff: Arc<dyn BackoffStrategy>) -> Self {
        self.backoff = Some(backoff);
        self
    }

    /// Override the token pool carved from the device memory.
    pub fn token_allocator(mut self, tokens: Arc<dyn TokenAllocator>) -> Self {
        self.tokens = Some(tokens);
        self
    }

    pub fn build(self) -> Result<Device> {
        let config = self.config;
        config.validate()?;
        let memory = self.memory.ok_or_else(|| {
            ConfigError::Invalid("device needs the sync memory its engines write to".to_string())
        })?;

        let mut kinds = self.backends.iter().map(|b| b.kind());
        if kinds.next() != Some(EngineKind::Compute) {
            return Err(ConfigError::Invalid("engine 0 must be the compute engine".to_string()).into());
        }
        if kinds.any(|kind| kind != EngineKind::Copy) {
            return Err(ConfigError::Invalid("only engine 0 may be a compute engine".to_string()).into());
        }

        let tokens: Arc<dyn TokenAllocator> = match self.tokens {
            Some(tokens) => tokens,
            None => Arc::new(TokenPool::new(memory.clone(), config.token_pool_capacity)?),
        };
        let encoder = encoder_for(config.encoder);
        let engines = self
            .backends
            .into_iter()
            .enumerate()
            .map(|(index, backend)| {
                Engine::new(
                    EngineId(index as u32),
                    backend,
                    encoder.clone(),
                    memory.clone(),
                    config.command_buffer_bytes,
                )
            })
            .collect::<Vec<_>>();

        let wait_policy = match self.backoff {
            Some(backoff) => WaitPolicy::new(backoff, config.wait.hang_check_period()),
            None => WaitPolicy::from_config(&config.wait),
        };
        let hang = self.hang.unwrap_or_else(|| Arc::new(NeverHangs));
        let poller = Poller::new(config.poller.max_sleep());

        tracing::info!(
            engines = engines.len(),
            encoder = %config.encoder,
            tokens = tokens.available(),
            "device created"
        );
        let inner = Arc::new_cyclic(|self_ref| DeviceInner {
            config,
            engines,
            tokens,
            memory,
            hang,
            wait_policy,
            arena: Mutex::new(HandleArena::new()),
            queues: Mutex::new(HashMap::new()),
            next_queue_id: AtomicU32::new(0),
            stats: DeviceStats::new(),
            poller,
            self_ref: self_ref.clone(),
        });
        Ok(Device { inner })
    }
}
