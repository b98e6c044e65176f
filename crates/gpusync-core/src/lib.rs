//! Command-submission synchronization for a GPU with one compute engine and any number of copy
//! engines.
//!
//! Work is enqueued on [`SubmissionQueue`]s created from a [`Device`]. Every enqueue may produce
//! a [`CompletionHandle`] that later enqueues can wait on, on any queue of the same device.
//! Cross-engine ordering is expressed with completion tokens: small memory slots one engine
//! writes and another engine waits on. Work whose wait list contains an unresolved handle (for
//! example a [`UserHandle`] the caller has not completed yet) is deferred and replayed once its
//! last dependency resolves.
//!
//! [`sim::SimGpu`] executes the generated command streams against shared memory and is what the
//! tests and benches run on.

mod arena;
pub mod backend;
pub mod config;
mod device;
pub mod engine;
pub mod error;
mod handle;
pub mod memory;
mod policy;
mod poller;
mod queue;
pub mod sim;
pub mod stats;
pub mod token;
pub mod types;
pub mod wait;

pub use gpusync_cmd::{BufferId, CompareOp, CopyDirection, EncoderKind, KernelId, SyncCmd};

pub use crate::config::{CopyEnginePolicy, PollerConfig, SyncConfig, WaitConfig};
pub use crate::device::{Device, DeviceBuilder};
pub use crate::error::{Result, SyncError};
pub use crate::handle::{
    Callback, CompletionHandle, ObservableCompletion, ProfilingInfo, Settable, UserHandle, Waitable,
};
pub use crate::policy::LatestSent;
pub use crate::queue::{
    BufferArg, ComputeOp, CopyOp, Operation, QueueFlags, QueueProperties, SubmissionQueue,
};
pub use crate::stats::DeviceStatsSnapshot;
pub use crate::types::{
    CommandKind, EngineId, EngineKind, ExecutionStatus, HandleId, QueueId, TaskCount, TaskLevel,
};
