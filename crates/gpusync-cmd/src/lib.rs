//! Backend-agnostic synchronization command stream plus the encoding and decoding layers used to
//! hand it to an engine.
//!
//! The core never interprets encoded bytes. It only appends [`SyncCmd`] primitives to a
//! [`CommandStream`] and hands the stream to whichever [`CommandEncoder`] the device selected at
//! startup.

mod decode;
mod encode;

pub use decode::{decode_stream, DecodeError};
pub use encode::{
    encoder_for, CommandEncoder, CompactEncoder, EncodeError, EncodeMetrics, EncodeResult,
    EncoderKind, WideEncoder,
};

/// Lightweight handle to a buffer owned by the (external) memory manager.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(pub u32);

/// Lightweight handle to a kernel owned by the (external) program manager.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KernelId(pub u32);

/// Comparison performed by a [`SyncCmd::SemaphoreWait`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CompareOp {
    /// Wait until the slot holds exactly `value`.
    Equal,
    /// Wait until the slot holds a value `>= value` (used for monotonic completion tags).
    GreaterOrEqual,
}

impl CompareOp {
    pub fn is_satisfied(self, current: u64, value: u64) -> bool {
        match self {
            CompareOp::Equal => current == value,
            CompareOp::GreaterOrEqual => current >= value,
        }
    }
}

/// Direction of a copy relative to a buffer's compressed (aux) representation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CopyDirection {
    /// Plain memory copy, no layout change.
    Plain,
    /// Resolve the compressed layout into a directly addressable one.
    AuxToNonAux,
    /// Re-compress after the primary work is done.
    NonAuxToAux,
}

/// Optional memory write performed once a command retires.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PostSync {
    pub address: u64,
    pub value: u64,
}

/// One synchronization-relevant primitive in an engine command stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SyncCmd {
    /// Stall the engine until the slot at `address` satisfies `op` against `value`.
    SemaphoreWait {
        address: u64,
        value: u64,
        op: CompareOp,
    },
    /// Write `value` to `address` after every earlier command in the stream retired.
    CompletionWrite { address: u64, value: u64 },
    /// Copy a buffer, optionally translating between compressed and uncompressed layouts.
    Copy {
        buffer: BufferId,
        direction: CopyDirection,
        size: u64,
    },
    /// One sub-dispatch of a (possibly split) kernel launch.
    Dispatch {
        kernel: KernelId,
        partition: u32,
        partitions: u32,
    },
    /// Flush engine caches so another engine observes the written data.
    CacheFlush { post_sync: Option<PostSync> },
}

impl SyncCmd {
    pub fn wait_equal(address: u64, value: u64) -> Self {
        Self::SemaphoreWait {
            address,
            value,
            op: CompareOp::Equal,
        }
    }

    pub fn wait_at_least(address: u64, value: u64) -> Self {
        Self::SemaphoreWait {
            address,
            value,
            op: CompareOp::GreaterOrEqual,
        }
    }

    pub fn is_wait(&self) -> bool {
        matches!(self, SyncCmd::SemaphoreWait { .. })
    }

    pub fn is_copy(&self) -> bool {
        matches!(self, SyncCmd::Copy { .. })
    }

    pub fn is_dispatch(&self) -> bool {
        matches!(self, SyncCmd::Dispatch { .. })
    }
}

/// Ordered list of [`SyncCmd`] primitives destined for a single engine flush.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommandStream {
    cmds: Vec<SyncCmd>,
}

impl CommandStream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, cmd: SyncCmd) {
        tracing::trace!(?cmd, "append");
        self.cmds.push(cmd);
    }

    pub fn wait_equal(&mut self, address: u64, value: u64) {
        self.push(SyncCmd::wait_equal(address, value));
    }

    pub fn wait_at_least(&mut self, address: u64, value: u64) {
        self.push(SyncCmd::wait_at_least(address, value));
    }

    pub fn completion_write(&mut self, address: u64, value: u64) {
        self.push(SyncCmd::CompletionWrite { address, value });
    }

    pub fn copy(&mut self, buffer: BufferId, direction: CopyDirection, size: u64) {
        self.push(SyncCmd::Copy {
            buffer,
            direction,
            size,
        });
    }

    pub fn dispatch(&mut self, kernel: KernelId, partition: u32, partitions: u32) {
        self.push(SyncCmd::Dispatch {
            kernel,
            partition,
            partitions,
        });
    }

    pub fn cache_flush(&mut self, post_sync: Option<PostSync>) {
        self.push(SyncCmd::CacheFlush { post_sync });
    }

    pub fn cmds(&self) -> &[SyncCmd] {
        &self.cmds
    }

    pub fn len(&self) -> usize {
        self.cmds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cmds.is_empty()
    }

    pub fn into_cmds(self) -> Vec<SyncCmd> {
        self.cmds
    }
}

impl From<Vec<SyncCmd>> for CommandStream {
    fn from(cmds: Vec<SyncCmd>) -> Self {
        Self { cmds }
    }
}

impl Extend<SyncCmd> for CommandStream {
    fn extend<T: IntoIterator<Item = SyncCmd>>(&mut self, iter: T) {
        self.cmds.extend(iter);
    }
}
