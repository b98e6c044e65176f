use crate::error::BackendError;
use crate::types::{EngineKind, TaskCount};

/// One flush worth of encoded commands for a single engine.
#[derive(Debug, Clone)]
pub struct EngineSubmission {
    /// Task count the stream writes to the engine's completion tag as its last command.
    pub task_count: TaskCount,
    pub bytes: Vec<u8>,
}

/// Boundary between the synchronization core and a hardware engine.
///
/// One instance exists per engine (the compute engine plus zero or more copy engines). The core
/// never reads the engine's progress through this trait; progress is observed by reading the
/// completion tag at [`EngineBackend::completion_tag_address`] in shared sync memory.
pub trait EngineBackend: Send {
    fn kind(&self) -> EngineKind;

    fn completion_tag_address(&self) -> u64;

    /// Task count of the most recent successful flush.
    fn peek_task_count(&self) -> TaskCount;

    /// Bump the task count after a successful flush and return the new value.
    fn advance_task_count(&mut self) -> TaskCount;

    /// Ring space currently available for a flush.
    fn available_bytes(&self) -> usize;

    /// Hand an encoded stream to the engine. Must not partially accept a stream.
    fn flush(&mut self, submission: EngineSubmission) -> Result<(), BackendError>;
}

/// Out-of-band device-hang signal, consulted only from wait loops.
pub trait HangDetector: Send + Sync {
    fn is_hung(&self) -> bool;
}

/// Detector for backends that cannot hang.
#[derive(Debug, Default, Clone, Copy)]
pub struct NeverHangs;

impl HangDetector for NeverHangs {
    fn is_hung(&self) -> bool {
        false
    }
}
