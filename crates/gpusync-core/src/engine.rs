//! Per-engine task level / task count bookkeeping and the flush path.

use gpusync_cmd::{CommandEncoder, CommandStream};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::backend::{EngineBackend, EngineSubmission};
use crate::error::{BackendError, Result, SyncError};
use crate::memory::{lock, SyncMemory};
use crate::types::{EngineId, EngineKind, TaskCount, TaskLevel};

/// Encoded stream that passed capacity checks but has not been handed to the backend yet.
///
/// Preparing every stream of a multi-engine operation before committing any of them keeps a
/// failed enqueue from leaving partial work on one engine.
#[derive(Debug)]
pub(crate) struct PreparedFlush {
    engine: EngineId,
    bytes: Vec<u8>,
    task_count: TaskCount,
}

impl PreparedFlush {
    pub(crate) fn task_count(&self) -> TaskCount {
        self.task_count
    }
}

pub(crate) struct EngineState {
    id: EngineId,
    backend: Box<dyn EngineBackend>,
    encoder: Arc<dyn CommandEncoder>,
    tag_address: u64,
    capacity: usize,
    task_level: TaskLevel,
    latest_flushed: TaskCount,
}

impl EngineState {
    pub(crate) fn task_level(&self) -> TaskLevel {
        self.task_level
    }

    /// Task count written by the most recent flush (completed or not).
    pub(crate) fn latest_flushed(&self) -> TaskCount {
        self.latest_flushed
    }

    /// Append the task-count completion write, encode, and check ring capacity.
    pub(crate) fn prepare(&self, mut stream: CommandStream) -> Result<PreparedFlush> {
        let task_count = TaskCount(self.backend.peek_task_count().0 + 1);
        stream.completion_write(self.tag_address, task_count.0);

        let encoded = self.encoder.encode(stream.cmds())?;
        let available = self.capacity.min(self.backend.available_bytes());
        if encoded.bytes.len() > available {
            return Err(SyncError::ResourceExhausted(format!(
                "command buffer for engine {}: {} bytes needed, {} available",
                self.id.0,
                encoded.bytes.len(),
                available
            )));
        }

        Ok(PreparedFlush {
            engine: self.id,
            bytes: encoded.bytes,
            task_count,
        })
    }

    /// Submit a prepared stream. `level` is the task level of the work it carries, if any.
    pub(crate) fn commit(
        &mut self,
        prepared: PreparedFlush,
        level: Option<TaskLevel>,
    ) -> Result<TaskCount> {
        assert_eq!(prepared.engine, self.id, "flush prepared for another engine");

        let expected = prepared.task_count;
        self.backend
            .flush(EngineSubmission {
                task_count: expected,
                bytes: prepared.bytes,
            })
            .map_err(|source| match source {
                BackendError::RingFull { needed, available } => SyncError::ResourceExhausted(
                    format!("engine {} ring: {needed} bytes needed, {available} available", self.id.0),
                ),
                source => SyncError::Backend {
                    engine: self.id,
                    source,
                },
            })?;

        let task_count = self.backend.advance_task_count();
        assert_eq!(task_count, expected, "engine task count skipped a value");
        self.latest_flushed = task_count;

        if let Some(level) = level {
            assert!(level.is_ready(), "dispatch without a task level");
            self.task_level = self.task_level.max(level);
        }

        tracing::debug!(
            engine = self.id.0,
            task_count = task_count.0,
            task_level = self.task_level.0,
            "flushed"
        );
        Ok(task_count)
    }
}

/// An engine as seen by queues and waiters.
///
/// The mutable flush state sits behind a mutex; completion is observed lock-free through the
/// completion tag in shared memory.
pub struct Engine {
    id: EngineId,
    kind: EngineKind,
    tag_address: u64,
    memory: Arc<SyncMemory>,
    state: Mutex<EngineState>,
}

impl Engine {
    pub(crate) fn new(
        id: EngineId,
        backend: Box<dyn EngineBackend>,
        encoder: Arc<dyn CommandEncoder>,
        memory: Arc<SyncMemory>,
        capacity: usize,
    ) -> Self {
        let kind = backend.kind();
        let tag_address = backend.completion_tag_address();
        let latest_flushed = backend.peek_task_count();
        Self {
            id,
            kind,
            tag_address,
            memory,
            state: Mutex::new(EngineState {
                id,
                backend,
                encoder,
                tag_address,
                capacity,
                task_level: TaskLevel::ZERO,
                latest_flushed,
            }),
        }
    }

    pub fn id(&self) -> EngineId {
        self.id
    }

    pub fn kind(&self) -> EngineKind {
        self.kind
    }

    pub fn completion_tag_address(&self) -> u64 {
        self.tag_address
    }

    /// Highest task count the engine has reported complete.
    pub fn completed_task_count(&self) -> TaskCount {
        TaskCount(self.memory.read(self.tag_address))
    }

    pub fn is_complete(&self, task_count: TaskCount) -> bool {
        task_count.is_ready() && self.completed_task_count() >= task_count
    }

    pub fn task_level(&self) -> TaskLevel {
        self.lock().task_level()
    }

    pub fn latest_flushed(&self) -> TaskCount {
        self.lock().latest_flushed()
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, EngineState> {
        lock(&self.state)
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("tag_address", &format_args!("{:#x}", self.tag_address))
            .field("completed", &self.completed_task_count())
            .finish()
    }
}
