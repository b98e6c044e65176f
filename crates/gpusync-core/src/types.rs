//! Small identifier and counter types shared by every module.

use std::fmt;

/// Index of an engine within its device (engine 0 is always the compute engine).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EngineId(pub u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EngineKind {
    Compute,
    Copy,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueueId(pub u32);

/// Logical ordering counter.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskLevel(pub u32);

impl TaskLevel {
    /// Not yet assigned: the owner is blocked behind work that has not been dispatched.
    pub const NOT_READY: Self = Self(u32::MAX);
    pub const ZERO: Self = Self(0);

    pub fn is_ready(self) -> bool {
        self != Self::NOT_READY
    }

    pub fn next(self) -> Self {
        debug_assert!(self.is_ready());
        Self(self.0 + 1)
    }
}

impl fmt::Debug for TaskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_ready() {
            write!(f, "TaskLevel({})", self.0)
        } else {
            f.write_str("TaskLevel(NotReady)")
        }
    }
}

/// Per-engine submission counter, observed through the engine's completion tag.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskCount(pub u64);

impl TaskCount {
    pub const NOT_READY: Self = Self(u64::MAX);
    pub const ZERO: Self = Self(0);

    pub fn is_ready(self) -> bool {
        self != Self::NOT_READY
    }
}

impl fmt::Debug for TaskCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_ready() {
            write!(f, "TaskCount({})", self.0)
        } else {
            f.write_str("TaskCount(NotReady)")
        }
    }
}

/// Generation-checked index into the handle arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Compute,
    Copy,
    Marker,
    Barrier,
    /// Created by the caller, driven by `set_status`.
    User,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ExecutionStatus {
    Queued,
    Submitted,
    Running,
    Complete,
    Aborted,
}

impl ExecutionStatus {
    fn rank(self) -> u8 {
        match self {
            ExecutionStatus::Queued => 0,
            ExecutionStatus::Submitted => 1,
            ExecutionStatus::Running => 2,
            ExecutionStatus::Complete => 3,
            ExecutionStatus::Aborted => 4,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ExecutionStatus::Complete | ExecutionStatus::Aborted)
    }

    /// Whether moving from `self` to `to` is a forward transition.
    pub fn can_advance_to(self, to: ExecutionStatus) -> bool {
        !self.is_terminal() && to.rank() > self.rank()
    }

    /// Whether a callback registered for `threshold` should fire once `self` is observed.
    pub fn has_reached(self, threshold: ExecutionStatus) -> bool {
        match self {
            ExecutionStatus::Aborted => true,
            _ => self.rank() >= threshold.rank(),
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExecutionStatus::Queued => "queued",
            ExecutionStatus::Submitted => "submitted",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Complete => "complete",
            ExecutionStatus::Aborted => "aborted",
        };
        f.write_str(s)
    }
}
