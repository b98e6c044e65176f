//! Submission queues: task-level bookkeeping, blocked (deferred) submission, and routing of
//! each operation to the compute or copy engine.

use bitflags::bitflags;
use gpusync_cmd::{BufferId, CommandStream, CopyDirection, KernelId};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::arena::{DeferredCommand, HandleOrigin, HandleRecord};
use crate::device::{merge_task_counts, DependencySnapshot, DeviceInner, Outcome, Work, COMPUTE};
use crate::error::{Result, SyncError};
use crate::handle::CompletionHandle;
use crate::memory::lock;
use crate::policy::{self, AuxPlan, AuxRoute, CopyPlan, CopyRoute, LatestSent};
use crate::token::{DependencyMode, TokenContainer};
use crate::types::{CommandKind, EngineId, ExecutionStatus, HandleId, QueueId, TaskCount, TaskLevel};
use crate::wait::WaitOutcome;

bitflags! {
    #[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash)]
    pub struct QueueFlags: u32 {
        /// Commands are only ordered by wait lists and barriers.
        const OUT_OF_ORDER = 1 << 0;
        /// Handles record queued/submitted/complete timestamps.
        const PROFILING = 1 << 1;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueueProperties {
    pub flags: QueueFlags,
    /// Index of the copy engine this queue uses, counted from the first copy engine. Ignored
    /// on devices without copy engines.
    pub copy_engine: Option<usize>,
}

impl Default for QueueProperties {
    fn default() -> Self {
        Self {
            flags: QueueFlags::empty(),
            copy_engine: Some(0),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferArg {
    pub buffer: BufferId,
    pub size: u64,
    /// Stored in the compressed layout and must be translated around the dispatch.
    pub compressed: bool,
}

impl BufferArg {
    pub fn plain(buffer: BufferId, size: u64) -> Self {
        Self {
            buffer,
            size,
            compressed: false,
        }
    }

    pub fn compressed(buffer: BufferId, size: u64) -> Self {
        Self {
            buffer,
            size,
            compressed: true,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ComputeOp {
    pub kernel: KernelId,
    pub work_items: u64,
    pub buffers: Vec<BufferArg>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CopyOp {
    pub buffer: BufferId,
    pub size: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Operation {
    Compute(ComputeOp),
    Copy(CopyOp),
    Marker,
    Barrier,
}

impl Operation {
    pub fn kind(&self) -> CommandKind {
        match self {
            Operation::Compute(_) => CommandKind::Compute,
            Operation::Copy(_) => CommandKind::Copy,
            Operation::Marker => CommandKind::Marker,
            Operation::Barrier => CommandKind::Barrier,
        }
    }
}

/// Tokens a submission waited on, kept alive until the submission retires.
struct DeferredBatch {
    fences: Vec<(EngineId, TaskCount)>,
    tokens: TokenContainer,
}

pub(crate) struct QueueState {
    /// Concrete task level, also while blocked; [`SubmissionQueue::task_level`] reports
    /// `NOT_READY` as long as a virtual node exists.
    level: TaskLevel,
    task_count: TaskCount,
    copy_task_count: TaskCount,
    /// Tokens of the latest dispatch.
    tokens: TokenContainer,
    /// Out-of-order queues: every token produced since the last barrier.
    since_barrier: TokenContainer,
    /// Out-of-order queues: tokens of the last stalling barrier.
    barrier_tokens: TokenContainer,
    latest_sent: LatestSent,
    virtual_node: Option<HandleId>,
    /// Deferred commands of this queue that have been neither replayed nor aborted.
    deferred_nodes: Vec<HandleId>,
    deferred_tokens: Vec<DeferredBatch>,
}

impl QueueState {
    fn new() -> Self {
        Self {
            level: TaskLevel::ZERO,
            task_count: TaskCount::ZERO,
            copy_task_count: TaskCount::ZERO,
            tokens: TokenContainer::new(),
            since_barrier: TokenContainer::new(),
            barrier_tokens: TokenContainer::new(),
            latest_sent: LatestSent::Nothing,
            virtual_node: None,
            deferred_nodes: Vec::new(),
            deferred_tokens: Vec::new(),
        }
    }
}

/// Result of a physical dispatch, copied into the handle record.
struct Dispatched {
    level: TaskLevel,
    task_count: TaskCount,
    copy_task_counts: Vec<(EngineId, TaskCount)>,
    tokens: TokenContainer,
}

impl Dispatched {
    fn fill(self, record: &mut HandleRecord) {
        record.task_level = self.level;
        record.task_count = self.task_count;
        record.copy_task_counts = self.copy_task_counts;
        record.tokens = self.tokens;
    }
}

/// Tokens obtained for a submission that has not been flushed yet.
///
/// The queue keeps its own tokens until [`QueueShared::retire`] installs `fresh`, so a failed
/// flush leaves it as it was.
struct Obtained {
    fresh: TokenContainer,
    superseded: TokenContainer,
}

pub(crate) struct QueueShared {
    id: QueueId,
    device: Arc<DeviceInner>,
    flags: QueueFlags,
    copy_engine: Option<EngineId>,
    state: Mutex<QueueState>,
}

impl QueueShared {
    pub(crate) fn new(
        id: QueueId,
        device: Arc<DeviceInner>,
        flags: QueueFlags,
        copy_engine: Option<EngineId>,
    ) -> Self {
        Self {
            id,
            device,
            flags,
            copy_engine,
            state: Mutex::new(QueueState::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        lock(&self.state)
    }

    fn out_of_order(&self) -> bool {
        self.flags.contains(QueueFlags::OUT_OF_ORDER)
    }

    fn profiling(&self) -> bool {
        self.flags.contains(QueueFlags::PROFILING)
    }

    fn dependency_mode(&self) -> DependencyMode {
        if self.out_of_order() {
            DependencyMode::Clear
        } else {
            DependencyMode::CarryForward
        }
    }

    fn enqueue(
        &self,
        operation: Operation,
        dependencies: Vec<HandleId>,
        produces_handle: bool,
    ) -> Result<Option<HandleId>> {
        let device = &self.device;
        let mut state = self.lock();
        let snapshot = device.snapshot_dependencies(&dependencies)?;
        if snapshot.aborted {
            return Err(SyncError::WaitListAborted);
        }
        device.stats.inc_enqueues();

        if !snapshot.blocking.is_empty() || state.virtual_node.is_some() {
            let (id, outcome) = self.enqueue_blocked(
                &mut state,
                operation,
                dependencies,
                &snapshot.blocking,
                produces_handle,
            );
            drop(state);
            device.finish_outcome(outcome);
            return Ok(id);
        }

        let kind = operation.kind();
        let dispatched = self.submit(&mut state, &operation, &snapshot, false)?;
        drop(state);
        if !produces_handle {
            return Ok(None);
        }

        let mut record =
            HandleRecord::new(kind, HandleOrigin::Backend, Some(self.id)).with_profiling(self.profiling());
        dispatched.fill(&mut record);
        let mut arena = device.arena();
        let id = arena.insert(record, 1, 0);
        // No callbacks can be registered yet, so nothing fires here.
        let _ = arena.transition(id, ExecutionStatus::Submitted);
        Ok(Some(id))
    }

    /// Store `operation` as a deferred command behind its unresolved dependencies and the
    /// queue's current virtual node. Replays it right away if every parent resolved meanwhile.
    fn enqueue_blocked(
        &self,
        state: &mut QueueState,
        operation: Operation,
        dependencies: Vec<HandleId>,
        blocking: &[HandleId],
        produces_handle: bool,
    ) -> (Option<HandleId>, Outcome) {
        let device = &self.device;
        let kind = operation.kind();
        let (id, ready) = {
            let mut arena = device.arena();
            let origin = if produces_handle {
                HandleOrigin::Backend
            } else {
                HandleOrigin::Placeholder
            };
            let mut record = HandleRecord::new(kind, origin, Some(self.id)).with_profiling(self.profiling());
            for &dep in &dependencies {
                arena.retain_internal(dep);
            }
            record.deferred = Some(DeferredCommand {
                queue: self.id,
                operation,
                dependencies,
            });

            // One internal reference for the pending command, one for the virtual node slot.
            let id = arena.insert(record, u32::from(produces_handle), 2);
            let parents = blocking.iter().copied().chain(state.virtual_node);
            for parent in parents {
                if arena.get(parent).is_some_and(HandleRecord::is_unresolved) {
                    arena.link(parent, id);
                }
            }
            if let Some(previous) = state.virtual_node.replace(id) {
                arena.release_internal(previous);
            }
            let ready = arena.get(id).is_some_and(|r| r.parent_count == 0);
            (id, ready)
        };
        state.deferred_nodes.push(id);
        device.stats.inc_blocked_enqueues();
        tracing::debug!(queue = self.id.0, ?id, ?kind, ready, "enqueue deferred");

        let outcome = if ready {
            self.replay_locked(state, id)
        } else {
            Outcome::default()
        };
        (produces_handle.then_some(id), outcome)
    }

    pub(crate) fn replay(&self, id: HandleId) -> Outcome {
        let mut state = self.lock();
        self.replay_locked(&mut state, id)
    }

    fn replay_locked(&self, state: &mut QueueState, id: HandleId) -> Outcome {
        let device = &self.device;
        let (command, snapshot) = {
            let mut arena = device.arena();
            let Some(record) = arena.get(id) else {
                return Outcome::default();
            };
            if record.status.is_terminal() || record.parent_count > 0 {
                return Outcome::default();
            }
            let Some(dependencies) = record.deferred.as_ref().map(|d| d.dependencies.clone()) else {
                return Outcome::default();
            };
            match DeviceInner::snapshot_locked(&arena, &dependencies) {
                Ok(snapshot) if !snapshot.aborted => {
                    let command = arena.get_mut(id).and_then(|r| r.deferred.take());
                    (command, snapshot)
                }
                _ => {
                    drop(arena);
                    return self.abort_locked(state, id);
                }
            }
        };
        let Some(command) = command else {
            return Outcome::default();
        };
        debug_assert!(snapshot.blocking.is_empty(), "replay with unresolved dependencies");

        match self.submit(state, &command.operation, &snapshot, true) {
            Ok(dispatched) => {
                let mut arena = device.arena();
                for dep in &command.dependencies {
                    arena.release_internal(*dep);
                }
                let level = dispatched.level;
                if let Some(record) = arena.get_mut(id) {
                    dispatched.fill(record);
                }
                let fired = arena.transition(id, ExecutionStatus::Submitted);
                let work = arena
                    .take_children(id)
                    .into_iter()
                    .filter(|&(_, last_parent)| last_parent)
                    .map(|(child, _)| Work::Ready(child))
                    .collect();
                // Reference held on behalf of the pending command.
                arena.release_internal(id);
                self.retire_deferred_node(state, &mut arena, id);
                drop(arena);

                device.stats.inc_deferred_replays();
                tracing::debug!(queue = self.id.0, ?id, ?level, "deferred command replayed");
                Outcome { work, fired }
            }
            Err(err) => {
                tracing::warn!(queue = self.id.0, ?id, %err, "deferred command failed on replay");
                if let Some(record) = device.arena().get_mut(id) {
                    record.deferred = Some(command);
                }
                self.abort_locked(state, id)
            }
        }
    }

    pub(crate) fn abort(&self, id: HandleId) -> Outcome {
        let mut state = self.lock();
        self.abort_locked(&mut state, id)
    }

    fn abort_locked(&self, state: &mut QueueState, id: HandleId) -> Outcome {
        let device = &self.device;
        let mut arena = device.arena();
        let pending = arena.get(id).is_some_and(|r| r.deferred.is_some());
        let (fired, children) = arena.abort(id);
        self.retire_deferred_node(state, &mut arena, id);
        drop(arena);

        if pending {
            device.stats.inc_deferred_aborts();
            tracing::warn!(queue = self.id.0, ?id, "deferred command aborted");
        }
        Outcome {
            work: children.into_iter().map(Work::Abort).collect(),
            fired,
        }
    }

    /// Forget a replayed or aborted deferred command; unblocks the queue if it was the last one.
    fn retire_deferred_node(
        &self,
        state: &mut QueueState,
        arena: &mut crate::arena::HandleArena,
        id: HandleId,
    ) {
        state.deferred_nodes.retain(|node| *node != id);
        if state.virtual_node == Some(id) {
            state.virtual_node = None;
            arena.release_internal(id);
        }
    }

    /// Task level of the next command given its wait list.
    fn next_level(&self, state: &QueueState, deps: &DependencySnapshot, kind: CommandKind) -> TaskLevel {
        let candidate = match deps.level {
            Some(level) => state.level.max(level),
            None => state.level,
        };
        assert!(candidate.is_ready(), "dispatch from a blocked queue");

        let update = match kind {
            CommandKind::Marker => false,
            CommandKind::Barrier => true,
            _ if self.out_of_order() => deps.level.is_some_and(|level| level.next() > state.level),
            _ => true,
        };
        if update {
            candidate.next()
        } else {
            candidate
        }
    }

    fn submit(
        &self,
        state: &mut QueueState,
        operation: &Operation,
        deps: &DependencySnapshot,
        replay: bool,
    ) -> Result<Dispatched> {
        let level = self.next_level(state, deps, operation.kind());
        let dispatched = match operation {
            Operation::Compute(op) => self.submit_compute(state, op, deps, level)?,
            Operation::Copy(op) => self.submit_copy(state, op, deps, level, replay)?,
            Operation::Marker => self.submit_marker(state, deps, level)?,
            Operation::Barrier => self.submit_barrier(state, deps, level)?,
        };

        if level < state.level {
            tracing::error!(queue = self.id.0, ?level, current = ?state.level, "task level went backward");
            panic!("task level went backward on queue {}", self.id.0);
        }
        state.level = level;
        self.prune_deferred_tokens(state);
        Ok(dispatched)
    }

    /// Tokens a new command has to wait for: its wait list plus the queue's implicit ordering.
    fn wait_set(&self, state: &QueueState, deps: &DependencySnapshot) -> TokenContainer {
        let mut waits = TokenContainer::new();
        waits.assign_and_increment(&deps.tokens);
        if self.out_of_order() {
            waits.assign_and_increment(&state.barrier_tokens);
        } else {
            waits.assign_and_increment(&state.tokens);
        }
        waits
    }

    /// `count` fresh tokens produced by `producer`, obtained against a copy of the queue's
    /// current tokens.
    fn obtain(
        &self,
        state: &QueueState,
        producer: EngineId,
        count: usize,
        mode: DependencyMode,
    ) -> Result<Obtained> {
        let mut fresh = state.tokens.clone();
        let superseded = fresh.obtain(self.device.tokens.as_ref(), producer, count, mode)?;
        Ok(Obtained { fresh, superseded })
    }

    /// Install `fresh` as the queue's latest tokens and park everything the submission waited on
    /// until `fences` retire.
    fn retire(
        &self,
        state: &mut QueueState,
        mut held: TokenContainer,
        fresh: &TokenContainer,
        mut superseded: TokenContainer,
        fences: Vec<(EngineId, TaskCount)>,
    ) {
        state.tokens = fresh.clone();
        if self.out_of_order() {
            state.since_barrier.assign_and_increment(fresh);
        }
        superseded.move_nodes_to(&mut held);
        if !held.is_empty() {
            state.deferred_tokens.push(DeferredBatch {
                fences,
                tokens: held,
            });
        }
    }

    fn prune_deferred_tokens(&self, state: &mut QueueState) {
        let device = &self.device;
        state
            .deferred_tokens
            .retain(|batch| !device.fences_complete(&batch.fences));
    }

    fn submit_compute(
        &self,
        state: &mut QueueState,
        op: &ComputeOp,
        deps: &DependencySnapshot,
        level: TaskLevel,
    ) -> Result<Dispatched> {
        let device = &self.device;
        let config = &device.config;
        let partitions = policy::partition_count(op.work_items, config.max_work_items_per_dispatch);
        let compressed: Vec<&BufferArg> = op.buffers.iter().filter(|b| b.compressed).collect();

        let route = policy::route_aux(config, self.copy_engine, compressed.len());
        if let AuxRoute::CopyEngine(copy) = route {
            return self.submit_aux(state, op, &compressed, partitions, deps, level, copy);
        }
        let builtin = route == AuxRoute::Builtin;

        let Obtained {
            fresh: kernel,
            superseded,
        } = self.obtain(state, COMPUTE, partitions as usize, self.dependency_mode())?;
        let waits = self.wait_set(state, deps);
        let mut stream = CommandStream::new();
        policy::emit_waits(&mut stream, waits.pending_from_other_engines(COMPUTE));
        if builtin {
            policy::emit_translation(&mut stream, &compressed, CopyDirection::AuxToNonAux);
        }
        policy::emit_dispatch(&mut stream, op.kernel, &kernel);
        if builtin {
            policy::emit_translation(&mut stream, &compressed, CopyDirection::NonAuxToAux);
        }

        let task_count = {
            let mut engine = device.engine(COMPUTE).lock();
            let prepared = engine.prepare(stream)?;
            engine.commit(prepared, Some(level))?
        };
        device.stats.inc_compute_flushes();
        if builtin {
            device.stats.inc_aux_translations();
        }

        self.retire(state, waits, &kernel, superseded, vec![(COMPUTE, task_count)]);
        state.task_count = task_count;
        state.latest_sent = LatestSent::Compute;
        tracing::debug!(
            queue = self.id.0,
            ?level,
            task_count = task_count.0,
            partitions,
            translated = compressed.len(),
            builtin,
            "compute dispatch"
        );
        Ok(Dispatched {
            level,
            task_count,
            copy_task_counts: Vec::new(),
            tokens: kernel,
        })
    }

    /// Dispatch with its compressed buffers translated on `copy`.
    #[allow(clippy::too_many_arguments)]
    fn submit_aux(
        &self,
        state: &mut QueueState,
        op: &ComputeOp,
        compressed: &[&BufferArg],
        partitions: u32,
        deps: &DependencySnapshot,
        level: TaskLevel,
        copy: EngineId,
    ) -> Result<Dispatched> {
        let device = &self.device;
        let pool = device.tokens.as_ref();
        let phase1 = TokenContainer::acquire(pool, copy, compressed.len())?;
        let Obtained {
            fresh: kernel,
            superseded,
        } = self.obtain(state, COMPUTE, partitions as usize, self.dependency_mode())?;
        let flush = if device.config.force_cache_flush_for_copy {
            Some(device.acquire_token(COMPUTE)?)
        } else {
            None
        };
        let phase3 = TokenContainer::acquire(pool, copy, compressed.len())?;
        let waits = self.wait_set(state, deps);

        let compute_engine = device.engine(COMPUTE);
        let mut compute = compute_engine.lock();
        let mut blit = device.engine(copy).lock();
        let plan = AuxPlan {
            copy_engine: copy,
            waits: &waits,
            buffers: compressed,
            kernel: op.kernel,
            phase1: &phase1,
            kernel_tokens: &kernel,
            flush: flush.as_ref(),
            phase3: &phase3,
            compute_barrier: (compute_engine.completion_tag_address(), compute.latest_flushed()),
        };
        let compute_prepared = compute.prepare(plan.compute_stream())?;
        let copy_prepared = blit.prepare(plan.copy_stream())?;
        let task_count = compute.commit(compute_prepared, Some(level))?;
        let copy_task_count = blit.commit(copy_prepared, Some(level))?;
        drop(blit);
        drop(compute);
        device.stats.inc_compute_flushes();
        device.stats.inc_copy_flushes();
        device.stats.inc_aux_translations();

        let mut tokens = TokenContainer::new();
        tokens.assign_and_increment(&kernel);
        tokens.assign_and_increment(&phase3);

        let mut held = waits;
        held.assign_and_increment(&phase1);
        held.assign_and_increment(&kernel);
        if let Some(flush) = flush {
            held.add(flush);
        }
        self.retire(
            state,
            held,
            &tokens,
            superseded,
            vec![(COMPUTE, task_count), (copy, copy_task_count)],
        );
        state.task_count = task_count;
        state.copy_task_count = copy_task_count;
        state.latest_sent = LatestSent::Compute;
        tracing::debug!(
            queue = self.id.0,
            ?level,
            task_count = task_count.0,
            copy_task_count = copy_task_count.0,
            translated = compressed.len(),
            partitions,
            "compute dispatch with copy-engine translation"
        );
        Ok(Dispatched {
            level,
            task_count,
            copy_task_counts: vec![(copy, copy_task_count)],
            tokens,
        })
    }

    fn submit_copy(
        &self,
        state: &mut QueueState,
        op: &CopyOp,
        deps: &DependencySnapshot,
        level: TaskLevel,
        replay: bool,
    ) -> Result<Dispatched> {
        let device = &self.device;
        let route = policy::route_copy(&device.config, self.copy_engine, state.latest_sent, replay);
        let (engine, compute_submission) = match route {
            CopyRoute::Compute => return self.submit_copy_on_compute(state, op, deps, level),
            CopyRoute::CopyEngine {
                engine,
                compute_submission,
            } => (engine, compute_submission),
        };

        let Obtained { fresh: tokens, superseded } = self.obtain(state, engine, 1, self.dependency_mode())?;
        let flush = if compute_submission && device.config.force_cache_flush_for_copy {
            Some(device.acquire_token(COMPUTE)?)
        } else {
            None
        };
        let waits = self.wait_set(state, deps);
        let plan = CopyPlan {
            copy_engine: engine,
            waits: &waits,
            op,
            tokens: &tokens,
            flush: flush.as_ref(),
        };

        let compute_engine = device.engine(COMPUTE);
        let mut compute = compute_submission.then(|| compute_engine.lock());
        let mut blit = device.engine(engine).lock();
        let compute_prepared = match compute.as_ref() {
            Some(compute) => Some(compute.prepare(plan.compute_stream())?),
            None => None,
        };
        let barrier = compute_prepared
            .as_ref()
            .map(|prepared| (compute_engine.completion_tag_address(), prepared.task_count()));
        let copy_prepared = blit.prepare(plan.copy_stream(barrier))?;
        let task_count = match (compute.as_mut(), compute_prepared) {
            (Some(compute), Some(prepared)) => {
                let task_count = compute.commit(prepared, Some(level))?;
                device.stats.inc_compute_flushes();
                task_count
            }
            _ => state.task_count,
        };
        let copy_task_count = blit.commit(copy_prepared, Some(level))?;
        drop(blit);
        drop(compute);
        device.stats.inc_copy_flushes();

        let mut held = waits;
        if let Some(flush) = flush {
            held.add(flush);
        }
        self.retire(
            state,
            held,
            &tokens,
            superseded,
            vec![(COMPUTE, task_count), (engine, copy_task_count)],
        );
        state.task_count = task_count;
        state.copy_task_count = copy_task_count;
        state.latest_sent = LatestSent::Copy;
        tracing::debug!(
            queue = self.id.0,
            ?level,
            compute_submission,
            copy_task_count = copy_task_count.0,
            "copy on copy engine"
        );
        Ok(Dispatched {
            level,
            task_count,
            copy_task_counts: vec![(engine, copy_task_count)],
            tokens,
        })
    }

    fn submit_copy_on_compute(
        &self,
        state: &mut QueueState,
        op: &CopyOp,
        deps: &DependencySnapshot,
        level: TaskLevel,
    ) -> Result<Dispatched> {
        let device = &self.device;
        let Obtained { fresh: tokens, superseded } = self.obtain(state, COMPUTE, 1, self.dependency_mode())?;
        let waits = self.wait_set(state, deps);
        let mut stream = CommandStream::new();
        policy::emit_waits(&mut stream, waits.pending_from_other_engines(COMPUTE));
        stream.copy(op.buffer, CopyDirection::Plain, op.size);
        for token in tokens.peek_nodes() {
            policy::emit_signal(&mut stream, token);
        }

        let task_count = {
            let mut engine = device.engine(COMPUTE).lock();
            let prepared = engine.prepare(stream)?;
            engine.commit(prepared, Some(level))?
        };
        device.stats.inc_compute_flushes();

        self.retire(state, waits, &tokens, superseded, vec![(COMPUTE, task_count)]);
        state.task_count = task_count;
        state.latest_sent = LatestSent::Compute;
        tracing::debug!(queue = self.id.0, ?level, task_count = task_count.0, "copy on compute engine");
        Ok(Dispatched {
            level,
            task_count,
            copy_task_counts: Vec::new(),
            tokens,
        })
    }

    /// Tokens and task counts covering everything the queue has sent so far, plus `deps`.
    fn queue_completion(
        &self,
        state: &QueueState,
        deps: &DependencySnapshot,
    ) -> (TokenContainer, TaskCount, Vec<(EngineId, TaskCount)>) {
        let mut tokens = TokenContainer::new();
        tokens.assign_and_increment(&deps.tokens);
        if self.out_of_order() {
            tokens.assign_and_increment(&state.since_barrier);
            tokens.assign_and_increment(&state.barrier_tokens);
        } else {
            tokens.assign_and_increment(&state.tokens);
        }

        let task_count = state.task_count.max(deps.task_count);
        let mut copy_task_counts = deps.copy_task_counts.clone();
        if let Some(copy) = self.copy_engine {
            if state.copy_task_count > TaskCount::ZERO {
                merge_task_counts(&mut copy_task_counts, copy, state.copy_task_count);
            }
        }
        (tokens, task_count, copy_task_counts)
    }

    fn submit_marker(
        &self,
        state: &mut QueueState,
        deps: &DependencySnapshot,
        level: TaskLevel,
    ) -> Result<Dispatched> {
        let device = &self.device;
        let (tokens, mut task_count, copy_task_counts) = self.queue_completion(state, deps);

        if deps.level.is_none() {
            let mut compute = device.engine(COMPUTE).lock();
            // Level equal to the engine's: nothing later on the engine can stand in for this
            // marker's completion, so write a fresh task count for it.
            if state.level >= compute.task_level() {
                let prepared = compute.prepare(CommandStream::new())?;
                let observed = compute.commit(prepared, None)?;
                drop(compute);
                device.stats.inc_compute_flushes();
                device.stats.inc_marker_observations();
                state.task_count = observed;
                task_count = observed;
            }
        }

        tracing::debug!(queue = self.id.0, ?level, task_count = task_count.0, "marker");
        Ok(Dispatched {
            level,
            task_count,
            copy_task_counts,
            tokens,
        })
    }

    fn submit_barrier(
        &self,
        state: &mut QueueState,
        deps: &DependencySnapshot,
        level: TaskLevel,
    ) -> Result<Dispatched> {
        let device = &self.device;
        let (mut outstanding, mut task_count, copy_task_counts) = self.queue_completion(state, deps);
        outstanding.resolve_dependencies(false);

        let stalling = !outstanding.is_empty();
        let (tokens, superseded) = if stalling {
            let Obtained { fresh, superseded } = self.obtain(state, COMPUTE, 1, DependencyMode::CarryForward)?;
            let mut stream = CommandStream::new();
            policy::emit_waits(&mut stream, outstanding.pending_from_other_engines(COMPUTE));
            for token in fresh.peek_nodes() {
                policy::emit_signal(&mut stream, token);
            }
            task_count = {
                let mut engine = device.engine(COMPUTE).lock();
                let prepared = engine.prepare(stream)?;
                engine.commit(prepared, Some(level))?
            };
            device.stats.inc_compute_flushes();
            device.stats.inc_stalling_barriers();

            state.deferred_tokens.push(DeferredBatch {
                fences: vec![(COMPUTE, task_count)],
                tokens: outstanding,
            });
            state.task_count = task_count;
            state.latest_sent = LatestSent::Compute;
            (fresh, superseded)
        } else {
            (TokenContainer::new(), TokenContainer::new())
        };

        if self.out_of_order() {
            state.barrier_tokens = tokens.clone();
            state.since_barrier = TokenContainer::new();
        } else if stalling {
            state.tokens = tokens.clone();
            if !superseded.is_empty() {
                state.deferred_tokens.push(DeferredBatch {
                    fences: vec![(COMPUTE, task_count)],
                    tokens: superseded,
                });
            }
        }

        tracing::debug!(queue = self.id.0, ?level, stalling, "barrier");
        Ok(Dispatched {
            level,
            task_count,
            copy_task_counts,
            tokens,
        })
    }

    fn finish(&self) -> Result<()> {
        let device = &self.device;
        device.stats.inc_waits();

        let unblocked = device
            .wait_policy
            .wait_until(device.hang_detector(), || self.lock().virtual_node.is_none());
        if unblocked != WaitOutcome::Ready {
            device.stats.inc_hangs_detected();
            tracing::warn!(queue = self.id.0, "device hang while the queue was blocked");
            let mut outcome = Outcome::default();
            {
                let mut state = self.lock();
                for id in state.deferred_nodes.clone() {
                    outcome.merge(self.abort_locked(&mut state, id));
                }
            }
            device.finish_outcome(outcome);
            return Err(SyncError::DeviceHang);
        }

        let fences = {
            let state = self.lock();
            let mut fences = vec![(COMPUTE, state.task_count)];
            if let Some(copy) = self.copy_engine {
                fences.push((copy, state.copy_task_count));
            }
            fences
        };
        let retired = device
            .wait_policy
            .wait_until(device.hang_detector(), || device.fences_complete(&fences));
        if retired != WaitOutcome::Ready {
            device.stats.inc_hangs_detected();
            let outstanding = device.arena().outstanding(self.id);
            tracing::warn!(queue = self.id.0, handles = outstanding.len(), "device hang during finish");
            device.abort_handles(&outstanding);
            return Err(SyncError::DeviceHang);
        }

        let released = std::mem::take(&mut self.lock().deferred_tokens);
        drop(released);
        Ok(())
    }
}

impl Drop for QueueShared {
    fn drop(&mut self) {
        self.device.unregister_queue(self.id);
        let mut outcome = Outcome::default();
        {
            let mut state = self.lock();
            if state.deferred_nodes.is_empty() {
                return;
            }
            tracing::warn!(
                queue = self.id.0,
                pending = state.deferred_nodes.len(),
                "queue dropped with deferred commands"
            );
            for id in state.deferred_nodes.clone() {
                outcome.merge(self.abort_locked(&mut state, id));
            }
        }
        self.device.finish_outcome(outcome);
    }
}

/// Front end for enqueueing work on one compute engine and, optionally, one copy engine.
///
/// A queue is driven by one caller thread at a time. Deferred commands may be replayed from
/// whichever thread resolves their last dependency; that path synchronizes on the queue's state
/// lock.
pub struct SubmissionQueue {
    shared: Arc<QueueShared>,
}

impl SubmissionQueue {
    pub(crate) fn new(shared: Arc<QueueShared>) -> Self {
        Self { shared }
    }

    pub fn id(&self) -> QueueId {
        self.shared.id
    }

    pub fn flags(&self) -> QueueFlags {
        self.shared.flags
    }

    pub fn copy_engine(&self) -> Option<EngineId> {
        self.shared.copy_engine
    }

    /// Enqueue `operation` behind `wait_list`.
    ///
    /// Returns the new handle if `produces_handle` is set. If a wait-list entry (or earlier
    /// deferred work on this queue) is unresolved the command is deferred instead of dispatched;
    /// it is replayed as soon as its last dependency resolves.
    pub fn enqueue(
        &self,
        operation: Operation,
        wait_list: &[&CompletionHandle],
        produces_handle: bool,
    ) -> Result<Option<CompletionHandle>> {
        let mut dependencies = Vec::with_capacity(wait_list.len());
        for handle in wait_list {
            if !Arc::ptr_eq(&handle.device, &self.shared.device) {
                return Err(SyncError::InvalidOperation(
                    "wait list handle belongs to another device".to_string(),
                ));
            }
            dependencies.push(handle.id);
        }

        let id = self.shared.enqueue(operation, dependencies, produces_handle)?;
        Ok(id.map(|id| CompletionHandle::adopt(self.shared.device.clone(), id)))
    }

    /// [`SubmissionQueue::enqueue`] that always produces a handle.
    pub fn submit(&self, operation: Operation, wait_list: &[&CompletionHandle]) -> Result<CompletionHandle> {
        self.enqueue(operation, wait_list, true)?.ok_or_else(|| {
            SyncError::InvalidOperation("enqueue did not produce a handle".to_string())
        })
    }

    /// Wait until the queue is unblocked and every engine it used reached its task count.
    pub fn finish(&self) -> Result<()> {
        self.shared.finish()
    }

    /// Every dispatch is flushed as it is enqueued, so there is never anything left to flush.
    pub fn flush(&self) -> Result<()> {
        Ok(())
    }

    pub fn is_blocked(&self) -> bool {
        self.shared.lock().virtual_node.is_some()
    }

    /// `NOT_READY` while the queue is blocked.
    pub fn task_level(&self) -> TaskLevel {
        let state = self.shared.lock();
        if state.virtual_node.is_some() {
            TaskLevel::NOT_READY
        } else {
            state.level
        }
    }

    pub fn task_count(&self) -> TaskCount {
        self.shared.lock().task_count
    }

    pub fn copy_task_count(&self) -> TaskCount {
        self.shared.lock().copy_task_count
    }

    pub fn latest_sent(&self) -> LatestSent {
        self.shared.lock().latest_sent
    }

    /// Deferred commands not yet replayed or aborted.
    pub fn pending_deferred(&self) -> usize {
        self.shared.lock().deferred_nodes.len()
    }

    /// Token batches kept alive for in-flight submissions.
    pub fn deferred_token_batches(&self) -> usize {
        self.shared.lock().deferred_tokens.len()
    }
}

impl fmt::Debug for SubmissionQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.lock();
        f.debug_struct("SubmissionQueue")
            .field("id", &self.shared.id)
            .field("flags", &self.shared.flags)
            .field("copy_engine", &self.shared.copy_engine)
            .field("level", &state.level)
            .field("task_count", &state.task_count)
            .field("blocked", &state.virtual_node.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use crate::device::Device;
    use crate::sim::{SimConfig, SimGpu};

    fn device() -> (Device, SimGpu) {
        SimGpu::device(SyncConfig::default(), SimConfig::default()).unwrap()
    }

    fn kernel() -> Operation {
        Operation::Compute(ComputeOp {
            kernel: KernelId(1),
            work_items: 64,
            buffers: vec![],
        })
    }

    #[test]
    fn in_order_levels_advance_per_dispatch() {
        let (device, _gpu) = device();
        let queue = device.create_queue(QueueProperties::default()).unwrap();
        let a = queue.submit(kernel(), &[]).unwrap();
        let b = queue.submit(kernel(), &[]).unwrap();
        assert_eq!(a.task_level(), TaskLevel(1));
        assert_eq!(b.task_level(), TaskLevel(2));
        let marker = queue.submit(Operation::Marker, &[]).unwrap();
        assert_eq!(marker.task_level(), TaskLevel(2));
        assert_eq!(queue.task_level(), TaskLevel(2));
    }

    #[test]
    fn out_of_order_levels_only_move_for_barriers_and_newer_wait_lists() {
        let (device, _gpu) = device();
        let queue = device
            .create_queue(QueueProperties {
                flags: QueueFlags::OUT_OF_ORDER,
                ..QueueProperties::default()
            })
            .unwrap();
        let a = queue.submit(kernel(), &[]).unwrap();
        assert_eq!(a.task_level(), TaskLevel(0));

        let barrier = queue.submit(Operation::Barrier, &[]).unwrap();
        assert_eq!(barrier.task_level(), TaskLevel(1));

        // Wait list behind the queue: no increment.
        let b = queue.submit(kernel(), &[&a]).unwrap();
        assert_eq!(b.task_level(), TaskLevel(1));

        // Wait list at the queue's level: increments past it.
        let c = queue.submit(kernel(), &[&barrier]).unwrap();
        assert_eq!(c.task_level(), TaskLevel(2));
    }

    #[test]
    fn barrier_without_outstanding_work_does_not_stall() {
        let (device, _gpu) = device();
        let queue = device.create_queue(QueueProperties::default()).unwrap();
        let barrier = queue.submit(Operation::Barrier, &[]).unwrap();
        assert_eq!(barrier.task_level(), TaskLevel(1));
        assert_eq!(barrier.token_count(), 0);
        assert_eq!(device.stats().stalling_barriers, 0);
    }

    #[test]
    fn barrier_with_outstanding_work_stalls() {
        let (device, _gpu) = SimGpu::device(
            SyncConfig::default(),
            SimConfig {
                completion: crate::sim::CompletionMode::Deferred,
                ..SimConfig::default()
            },
        )
        .unwrap();
        let queue = device.create_queue(QueueProperties::default()).unwrap();
        queue.submit(kernel(), &[]).unwrap();
        let barrier = queue.submit(Operation::Barrier, &[]).unwrap();
        assert_eq!(barrier.token_count(), 1);
        assert_eq!(barrier.task_count(), TaskCount(2));
        assert_eq!(device.stats().stalling_barriers, 1);
    }

    #[test]
    fn flush_is_a_no_op() {
        let (device, _gpu) = device();
        let queue = device.create_queue(QueueProperties::default()).unwrap();
        queue.flush().unwrap();
        assert_eq!(queue.task_count(), TaskCount::ZERO);
    }

    #[test]
    fn operation_kinds() {
        assert_eq!(Operation::Marker.kind(), CommandKind::Marker);
        assert_eq!(
            Operation::Copy(CopyOp {
                buffer: BufferId(0),
                size: 1
            })
            .kind(),
            CommandKind::Copy
        );
    }
}
