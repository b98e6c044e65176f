//! Storage for every completion handle of a device.
//!
//! Handles live in a generation-checked slot arena. Parent/child edges are id lists, and
//! teardown is two-phase: dropping the last internal or external reference only marks a record
//! unreachable, and [`HandleArena::collect`] frees marked records afterwards.

use std::time::Instant;

use crate::handle::Callback;
use crate::queue::Operation;
use crate::token::TokenContainer;
use crate::types::{CommandKind, EngineId, ExecutionStatus, HandleId, QueueId, TaskCount, TaskLevel};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum HandleOrigin {
    /// Dispatched work whose progress is read from engine completion tags.
    Backend,
    /// Driven only by `set_status`.
    User,
    /// Stands in for a deferred command that was enqueued without an output handle.
    Placeholder,
}

impl HandleOrigin {
    pub(crate) fn is_polled(self) -> bool {
        self == HandleOrigin::Backend
    }
}

pub(crate) struct PendingCallback {
    pub(crate) threshold: ExecutionStatus,
    pub(crate) callback: Callback,
}

/// A callback that became due, together with the status it reports.
pub(crate) type FiredCallback = (Callback, ExecutionStatus);

#[derive(Clone, Copy, Debug)]
pub(crate) struct ProfilingTimes {
    pub(crate) queued: Instant,
    pub(crate) submitted: Option<Instant>,
    pub(crate) complete: Option<Instant>,
}

impl ProfilingTimes {
    fn new() -> Self {
        Self {
            queued: Instant::now(),
            submitted: None,
            complete: None,
        }
    }
}

/// Operation captured while its queue is blocked, replayed once every parent is resolved.
#[derive(Debug)]
pub(crate) struct DeferredCommand {
    pub(crate) queue: QueueId,
    pub(crate) operation: Operation,
    pub(crate) dependencies: Vec<HandleId>,
}

pub(crate) struct HandleRecord {
    pub(crate) kind: CommandKind,
    pub(crate) origin: HandleOrigin,
    pub(crate) queue: Option<QueueId>,
    pub(crate) task_level: TaskLevel,
    /// Compute engine task count that marks this handle complete.
    pub(crate) task_count: TaskCount,
    /// One entry per copy engine the handle's work ran on.
    pub(crate) copy_task_counts: Vec<(EngineId, TaskCount)>,
    pub(crate) tokens: TokenContainer,
    pub(crate) status: ExecutionStatus,
    pub(crate) children: Vec<HandleId>,
    pub(crate) parent_count: usize,
    pub(crate) callbacks: Vec<PendingCallback>,
    pub(crate) callback_ref: bool,
    pub(crate) poller_registered: bool,
    pub(crate) deferred: Option<DeferredCommand>,
    pub(crate) profiling: Option<ProfilingTimes>,
    external: u32,
    internal: u32,
}

impl HandleRecord {
    pub(crate) fn new(kind: CommandKind, origin: HandleOrigin, queue: Option<QueueId>) -> Self {
        Self {
            kind,
            origin,
            queue,
            task_level: TaskLevel::NOT_READY,
            task_count: TaskCount::NOT_READY,
            copy_task_counts: Vec::new(),
            tokens: TokenContainer::new(),
            status: ExecutionStatus::Queued,
            children: Vec::new(),
            parent_count: 0,
            callbacks: Vec::new(),
            callback_ref: false,
            poller_registered: false,
            deferred: None,
            profiling: None,
            external: 0,
            internal: 0,
        }
    }

    pub(crate) fn with_profiling(mut self, enabled: bool) -> Self {
        self.profiling = enabled.then(ProfilingTimes::new);
        self
    }

    /// Whether the handle still waits for an event outside of any engine: a user status change,
    /// or the replay of a deferred command.
    pub(crate) fn is_unresolved(&self) -> bool {
        !self.status.is_terminal() && !self.task_level.is_ready()
    }

    /// Every (engine, task count) pair that must retire for the handle to be complete.
    pub(crate) fn fences(&self) -> Vec<(EngineId, TaskCount)> {
        let mut fences = Vec::with_capacity(1 + self.copy_task_counts.len());
        if self.task_count.is_ready() {
            fences.push((EngineId(0), self.task_count));
        }
        fences.extend(
            self.copy_task_counts
                .iter()
                .copied()
                .filter(|(_, tc)| tc.is_ready()),
        );
        fences
    }

    fn is_unreachable(&self) -> bool {
        self.external == 0 && self.internal == 0
    }
}

struct Slot {
    generation: u32,
    record: Option<HandleRecord>,
}

#[derive(Default)]
pub(crate) struct HandleArena {
    slots: Vec<Slot>,
    free: Vec<u32>,
    unreachable: Vec<HandleId>,
}

impl HandleArena {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Store `record` with the given initial reference counts.
    pub(crate) fn insert(&mut self, mut record: HandleRecord, external: u32, internal: u32) -> HandleId {
        record.external = external;
        record.internal = internal;
        let id = match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.record = Some(record);
                HandleId {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Slot {
                    generation: 0,
                    record: Some(record),
                });
                HandleId {
                    index,
                    generation: 0,
                }
            }
        };
        if external == 0 && internal == 0 {
            self.unreachable.push(id);
        }
        id
    }

    pub(crate) fn get(&self, id: HandleId) -> Option<&HandleRecord> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.record.as_ref())
    }

    pub(crate) fn get_mut(&mut self, id: HandleId) -> Option<&mut HandleRecord> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.record.as_mut())
    }

    pub(crate) fn contains(&self, id: HandleId) -> bool {
        self.get(id).is_some()
    }

    pub(crate) fn live_count(&self) -> usize {
        self.slots.iter().filter(|s| s.record.is_some()).count()
    }

    /// Dispatched backend handles of `queue` that have not reached a terminal status.
    pub(crate) fn outstanding(&self, queue: QueueId) -> Vec<HandleId> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| {
                let record = slot.record.as_ref()?;
                let owned = record.queue == Some(queue) && record.origin.is_polled();
                (owned && !record.status.is_terminal() && record.task_level.is_ready()).then_some(HandleId {
                    index: index as u32,
                    generation: slot.generation,
                })
            })
            .collect()
    }

    pub(crate) fn retain_external(&mut self, id: HandleId) {
        if let Some(record) = self.get_mut(id) {
            record.external += 1;
        }
    }

    pub(crate) fn release_external(&mut self, id: HandleId) {
        let Some(record) = self.get_mut(id) else {
            return;
        };
        assert!(record.external > 0, "external reference count underflow");
        record.external -= 1;
        if record.is_unreachable() {
            self.unreachable.push(id);
        }
    }

    pub(crate) fn retain_internal(&mut self, id: HandleId) {
        if let Some(record) = self.get_mut(id) {
            record.internal += 1;
        }
    }

    pub(crate) fn release_internal(&mut self, id: HandleId) {
        let Some(record) = self.get_mut(id) else {
            return;
        };
        assert!(record.internal > 0, "internal reference count underflow");
        record.internal -= 1;
        if record.is_unreachable() {
            self.unreachable.push(id);
        }
    }

    pub(crate) fn ref_counts(&self, id: HandleId) -> Option<(u32, u32)> {
        self.get(id).map(|r| (r.external, r.internal))
    }

    /// Make `child` wait for `parent`. The edge holds one internal reference on the child.
    pub(crate) fn link(&mut self, parent: HandleId, child: HandleId) {
        if parent == child {
            tracing::error!(?parent, "handle linked to itself");
            panic!("dependency cycle: handle {parent:?} depends on itself");
        }
        let Some(parent_record) = self.get_mut(parent) else {
            return;
        };
        parent_record.children.push(child);
        if let Some(child_record) = self.get_mut(child) {
            child_record.parent_count += 1;
            child_record.internal += 1;
        }
    }

    /// Resolve every outgoing edge of `parent`. Each child is returned with a flag telling
    /// whether `parent` was the last parent it waited for.
    pub(crate) fn take_children(&mut self, parent: HandleId) -> Vec<(HandleId, bool)> {
        let children = match self.get_mut(parent) {
            Some(record) => std::mem::take(&mut record.children),
            None => return Vec::new(),
        };

        let mut resolved = Vec::with_capacity(children.len());
        for child in children {
            let Some(record) = self.get_mut(child) else {
                continue;
            };
            assert!(record.parent_count > 0, "parent count underflow");
            record.parent_count -= 1;
            resolved.push((child, record.parent_count == 0));
            self.release_internal(child);
        }
        resolved
    }

    /// Move `id` to `Aborted`, dropping its deferred command if it still has one.
    ///
    /// Returns the callbacks now due and every child of `id`; the caller must abort those too.
    pub(crate) fn abort(&mut self, id: HandleId) -> (Vec<FiredCallback>, Vec<HandleId>) {
        let deferred = match self.get_mut(id) {
            Some(record) => record.deferred.take(),
            None => return (Vec::new(), Vec::new()),
        };
        if let Some(command) = &deferred {
            for dep in &command.dependencies {
                self.release_internal(*dep);
            }
        }

        let fired = self.transition(id, ExecutionStatus::Aborted);
        let children = self
            .take_children(id)
            .into_iter()
            .map(|(child, _)| child)
            .collect();
        if deferred.is_some() {
            // Reference held on behalf of the pending command.
            self.release_internal(id);
        }
        (fired, children)
    }

    /// Move `id` to `status` if that is a forward transition, returning the callbacks now due.
    pub(crate) fn transition(&mut self, id: HandleId, status: ExecutionStatus) -> Vec<FiredCallback> {
        let Some(record) = self.get_mut(id) else {
            return Vec::new();
        };
        if !record.status.can_advance_to(status) {
            return Vec::new();
        }
        record.status = status;
        if let Some(times) = record.profiling.as_mut() {
            let now = Instant::now();
            if status != ExecutionStatus::Queued && times.submitted.is_none() {
                times.submitted = Some(now);
            }
            if status == ExecutionStatus::Complete {
                times.complete = Some(now);
            }
        }

        let (due, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut record.callbacks)
            .into_iter()
            .partition(|cb| status.has_reached(cb.threshold));
        record.callbacks = pending;
        let drop_callback_ref = record.callbacks.is_empty() && record.callback_ref;
        if drop_callback_ref {
            record.callback_ref = false;
        }

        let fired = due.into_iter().map(|cb| (cb.callback, status)).collect();
        if drop_callback_ref {
            self.release_internal(id);
        }
        fired
    }

    /// Free every record marked unreachable. Freed records are returned so their tokens are
    /// dropped once the caller has released the arena lock.
    pub(crate) fn collect(&mut self) -> Vec<HandleRecord> {
        let mut freed = Vec::new();
        while let Some(id) = self.unreachable.pop() {
            let still_unreachable = self.get(id).is_some_and(HandleRecord::is_unreachable);
            if !still_unreachable {
                continue;
            }
            let slot = &mut self.slots[id.index as usize];
            let Some(mut record) = slot.record.take() else {
                continue;
            };
            slot.generation = slot.generation.wrapping_add(1);
            self.free.push(id.index);

            for child in std::mem::take(&mut record.children) {
                if let Some(child_record) = self.get_mut(child) {
                    child_record.parent_count = child_record.parent_count.saturating_sub(1);
                }
                self.release_internal(child);
            }
            if let Some(deferred) = record.deferred.take() {
                for dep in &deferred.dependencies {
                    self.release_internal(*dep);
                }
            }
            freed.push(record);
        }
        freed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user() -> HandleRecord {
        HandleRecord::new(CommandKind::User, HandleOrigin::User, None)
    }

    #[test]
    fn stale_ids_do_not_resolve() {
        let mut arena = HandleArena::new();
        let a = arena.insert(user(), 1, 0);
        arena.release_external(a);
        assert!(arena.contains(a));
        assert_eq!(arena.collect().len(), 1);
        assert!(!arena.contains(a));

        let b = arena.insert(user(), 1, 0);
        assert_eq!(b.index, a.index);
        assert_ne!(b.generation, a.generation);
        assert!(arena.get(a).is_none());
        assert!(arena.get(b).is_some());
    }

    #[test]
    fn record_survives_while_internally_referenced() {
        let mut arena = HandleArena::new();
        let a = arena.insert(user(), 1, 1);
        arena.release_external(a);
        assert!(arena.collect().is_empty());
        arena.release_internal(a);
        assert_eq!(arena.collect().len(), 1);
        assert_eq!(arena.live_count(), 0);
    }

    #[test]
    fn edges_hold_a_reference_on_the_child() {
        let mut arena = HandleArena::new();
        let parent = arena.insert(user(), 1, 0);
        let child = arena.insert(user(), 0, 1);
        arena.link(parent, child);
        assert_eq!(arena.ref_counts(child), Some((0, 2)));
        assert_eq!(arena.get(child).map(|r| r.parent_count), Some(1));

        let resolved = arena.take_children(parent);
        assert_eq!(resolved, vec![(child, true)]);
        assert_eq!(arena.ref_counts(child), Some((0, 1)));
        assert!(arena.get(parent).unwrap().children.is_empty());
    }

    #[test]
    fn freeing_a_parent_drops_its_edges() {
        let mut arena = HandleArena::new();
        let parent = arena.insert(user(), 1, 0);
        let child = arena.insert(user(), 0, 0);
        arena.link(parent, child);
        // The unreachable mark from insertion is stale now that the edge holds a reference.
        assert!(arena.collect().is_empty());

        arena.release_external(parent);
        let freed = arena.collect();
        assert_eq!(freed.len(), 2);
        assert_eq!(arena.live_count(), 0);
    }

    #[test]
    fn abort_drops_the_deferred_command_and_reports_every_child() {
        let mut arena = HandleArena::new();
        let dep = arena.insert(user(), 1, 1);
        let node = arena.insert(
            HandleRecord::new(CommandKind::Marker, HandleOrigin::Placeholder, Some(QueueId(0))),
            0,
            1,
        );
        arena.get_mut(node).unwrap().deferred = Some(DeferredCommand {
            queue: QueueId(0),
            operation: Operation::Marker,
            dependencies: vec![dep],
        });
        let child = arena.insert(user(), 1, 0);
        let other_parent = arena.insert(user(), 1, 0);
        arena.link(node, child);
        arena.link(other_parent, child);

        let (fired, children) = arena.abort(node);
        assert!(fired.is_empty());
        assert_eq!(children, vec![child]);
        assert_eq!(arena.ref_counts(dep), Some((1, 0)));
        assert_eq!(arena.get(node).unwrap().status, ExecutionStatus::Aborted);
        // The child still waits for its other parent.
        assert_eq!(arena.get(child).unwrap().parent_count, 1);

        arena.collect();
        assert!(!arena.contains(node));
    }

    #[test]
    fn outstanding_lists_dispatched_work_of_one_queue() {
        let mut arena = HandleArena::new();
        let dispatched = |queue: u32, status: ExecutionStatus| {
            let mut record = HandleRecord::new(CommandKind::Compute, HandleOrigin::Backend, Some(QueueId(queue)));
            record.task_level = TaskLevel(1);
            record.task_count = TaskCount(1);
            record.status = status;
            record
        };
        let running = arena.insert(dispatched(0, ExecutionStatus::Running), 1, 0);
        let submitted = arena.insert(dispatched(0, ExecutionStatus::Submitted), 0, 1);
        arena.insert(dispatched(0, ExecutionStatus::Complete), 1, 0);
        arena.insert(dispatched(1, ExecutionStatus::Submitted), 1, 0);
        // Still waiting for a replay.
        arena.insert(
            HandleRecord::new(CommandKind::Compute, HandleOrigin::Backend, Some(QueueId(0))),
            1,
            2,
        );
        arena.insert(
            HandleRecord::new(CommandKind::Marker, HandleOrigin::Placeholder, Some(QueueId(0))),
            0,
            2,
        );
        arena.insert(user(), 1, 0);

        assert_eq!(arena.outstanding(QueueId(0)), vec![running, submitted]);
        assert!(arena.outstanding(QueueId(2)).is_empty());
    }

    #[test]
    #[should_panic(expected = "dependency cycle")]
    fn self_edge_is_fatal() {
        let mut arena = HandleArena::new();
        let a = arena.insert(user(), 1, 0);
        arena.link(a, a);
    }

    #[test]
    fn transition_fires_due_callbacks_and_drops_the_callback_reference() {
        use std::sync::atomic::{AtomicU32, Ordering};
        use std::sync::Arc;

        let mut arena = HandleArena::new();
        let id = arena.insert(
            HandleRecord::new(CommandKind::Compute, HandleOrigin::Backend, None),
            1,
            1,
        );
        let hits = Arc::new(AtomicU32::new(0));
        {
            let record = arena.get_mut(id).unwrap();
            for threshold in [ExecutionStatus::Submitted, ExecutionStatus::Complete] {
                let hits = hits.clone();
                record.callbacks.push(PendingCallback {
                    threshold,
                    callback: Box::new(move |_| {
                        hits.fetch_add(1, Ordering::Relaxed);
                    }),
                });
            }
            record.callback_ref = true;
        }

        let fired = arena.transition(id, ExecutionStatus::Submitted);
        assert_eq!(fired.len(), 1);
        assert_eq!(arena.ref_counts(id), Some((1, 1)));

        // Backward transitions are ignored.
        assert!(arena.transition(id, ExecutionStatus::Queued).is_empty());

        let fired = arena.transition(id, ExecutionStatus::Complete);
        assert_eq!(fired.len(), 1);
        for (cb, status) in fired {
            assert_eq!(status, ExecutionStatus::Complete);
            cb(status);
        }
        assert_eq!(hits.load(Ordering::Relaxed), 1);
        assert_eq!(arena.ref_counts(id), Some((1, 0)));
    }
}
