use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::device::DeviceInner;
use crate::error::{Result, SyncError};
use crate::types::{CommandKind, EngineId, ExecutionStatus, HandleId, QueueId, TaskCount, TaskLevel};

/// Completion callback. Runs exactly once, outside every internal lock, with the status that
/// made it due (`Aborted` if the handle was aborted before reaching the threshold).
pub type Callback = Box<dyn FnOnce(ExecutionStatus) + Send + 'static>;

/// Something whose progress can be observed.
pub trait ObservableCompletion {
    fn execution_status(&self) -> ExecutionStatus;

    /// Register `callback` for `threshold` (`Submitted`, `Running` or `Complete`).
    fn add_callback(&self, threshold: ExecutionStatus, callback: Callback) -> Result<()>;
}

/// Something a thread can block on.
pub trait Waitable {
    fn wait(&self) -> Result<()>;
}

/// Something whose status is driven by the caller instead of an engine.
pub trait Settable {
    fn set_status(&self, status: ExecutionStatus) -> Result<()>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProfilingInfo {
    pub queued: Instant,
    pub submitted: Instant,
    pub complete: Instant,
}

impl ProfilingInfo {
    pub fn execution_time(&self) -> Duration {
        self.complete.saturating_duration_since(self.submitted)
    }
}

/// Reference to one completion handle. Clones share the handle; the last drop releases it.
pub struct CompletionHandle {
    pub(crate) device: Arc<DeviceInner>,
    pub(crate) id: HandleId,
}

impl CompletionHandle {
    /// Wrap `id`, which already carries the external reference this value owns.
    pub(crate) fn adopt(device: Arc<DeviceInner>, id: HandleId) -> Self {
        Self { device, id }
    }

    pub fn id(&self) -> HandleId {
        self.id
    }

    pub fn kind(&self) -> CommandKind {
        self.read(|r| r.kind)
    }

    /// Queue the handle was enqueued on, `None` for user handles.
    pub fn queue(&self) -> Option<QueueId> {
        self.read(|r| r.queue)
    }

    pub fn task_level(&self) -> TaskLevel {
        self.read(|r| r.task_level)
    }

    pub fn task_count(&self) -> TaskCount {
        self.read(|r| r.task_count)
    }

    pub fn copy_task_counts(&self) -> Vec<(EngineId, TaskCount)> {
        self.read(|r| r.copy_task_counts.clone())
    }

    /// Number of completion tokens the handle currently references.
    pub fn token_count(&self) -> usize {
        self.read(|r| r.tokens.len())
    }

    /// Whether the handle is still waiting on a user status change or a deferred replay.
    pub fn is_blocked(&self) -> bool {
        self.read(|r| r.is_unresolved())
    }

    pub fn profiling(&self) -> Result<ProfilingInfo> {
        self.device.update_status(self.id);
        let times = self
            .device
            .arena()
            .get(self.id)
            .and_then(|r| r.profiling)
            .ok_or(SyncError::ProfilingUnavailable)?;
        match (times.submitted, times.complete) {
            (Some(submitted), Some(complete)) => Ok(ProfilingInfo {
                queued: times.queued,
                submitted,
                complete,
            }),
            _ => Err(SyncError::ProfilingUnavailable),
        }
    }

    pub fn set_callback<F>(&self, threshold: ExecutionStatus, callback: F) -> Result<()>
    where
        F: FnOnce(ExecutionStatus) + Send + 'static,
    {
        self.add_callback(threshold, Box::new(callback))
    }

    fn read<T>(&self, f: impl FnOnce(&crate::arena::HandleRecord) -> T) -> T {
        let arena = self.device.arena();
        let record = arena
            .get(self.id)
            .unwrap_or_else(|| panic!("{:?} outlived its record", self.id));
        f(record)
    }
}

impl ObservableCompletion for CompletionHandle {
    fn execution_status(&self) -> ExecutionStatus {
        self.device
            .update_status(self.id)
            .unwrap_or(ExecutionStatus::Aborted)
    }

    fn add_callback(&self, threshold: ExecutionStatus, callback: Callback) -> Result<()> {
        self.device.add_callback(self.id, threshold, callback)
    }
}

impl Waitable for CompletionHandle {
    fn wait(&self) -> Result<()> {
        self.device.wait(&[self.id])
    }
}

impl Clone for CompletionHandle {
    fn clone(&self) -> Self {
        self.device.arena().retain_external(self.id);
        Self {
            device: self.device.clone(),
            id: self.id,
        }
    }
}

impl Drop for CompletionHandle {
    fn drop(&mut self) {
        self.device.arena().release_external(self.id);
        self.device.collect_garbage();
    }
}

impl PartialEq for CompletionHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && Arc::ptr_eq(&self.device, &other.device)
    }
}

impl Eq for CompletionHandle {}

impl fmt::Debug for CompletionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let arena = self.device.arena();
        let mut s = f.debug_struct("CompletionHandle");
        s.field("id", &self.id);
        if let Some(record) = arena.get(self.id) {
            s.field("kind", &record.kind)
                .field("status", &record.status)
                .field("task_level", &record.task_level)
                .field("task_count", &record.task_count);
        }
        s.finish()
    }
}

/// Handle whose completion is signaled by the caller.
///
/// Completing it synchronously replays every deferred command that was waiting only on it
/// before `set_status` returns.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UserHandle(CompletionHandle);

impl UserHandle {
    pub(crate) fn new(handle: CompletionHandle) -> Self {
        Self(handle)
    }

    /// The handle to put into wait lists.
    pub fn handle(&self) -> &CompletionHandle {
        &self.0
    }

    pub fn complete(&self) -> Result<()> {
        self.set_status(ExecutionStatus::Complete)
    }

    pub fn abort(&self) -> Result<()> {
        self.set_status(ExecutionStatus::Aborted)
    }
}

impl AsRef<CompletionHandle> for UserHandle {
    fn as_ref(&self) -> &CompletionHandle {
        &self.0
    }
}

impl Settable for UserHandle {
    fn set_status(&self, status: ExecutionStatus) -> Result<()> {
        self.0.device.set_user_status(self.0.id, status)
    }
}

impl ObservableCompletion for UserHandle {
    fn execution_status(&self) -> ExecutionStatus {
        self.0.execution_status()
    }

    fn add_callback(&self, threshold: ExecutionStatus, callback: Callback) -> Result<()> {
        self.0.add_callback(threshold, callback)
    }
}

impl Waitable for UserHandle {
    fn wait(&self) -> Result<()> {
        self.0.wait()
    }
}
