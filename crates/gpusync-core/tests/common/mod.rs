//! Shared helpers for `gpusync-core` integration tests.

#![allow(dead_code)]

use gpusync_core::sim::{CompletionMode, SimConfig, SimGpu};
use gpusync_core::{BufferArg, BufferId, ComputeOp, CopyOp, Device, KernelId, Operation, SyncCmd, SyncConfig};

pub const COMPUTE: gpusync_core::EngineId = gpusync_core::EngineId(0);
pub const COPY: gpusync_core::EngineId = gpusync_core::EngineId(1);

/// Install a `fmt` subscriber once per test binary when `GPUSYNC_TEST_LOG` is set.
pub fn init_tracing() {
    if std::env::var_os("GPUSYNC_TEST_LOG").is_none() {
        return;
    }
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

pub fn device(config: SyncConfig) -> (Device, SimGpu) {
    init_tracing();
    SimGpu::device(config, SimConfig::default()).expect("simulated device")
}

/// Device whose engines only make progress when the test pumps them.
pub fn deferred_device(config: SyncConfig) -> (Device, SimGpu) {
    init_tracing();
    SimGpu::device(
        config,
        SimConfig {
            completion: CompletionMode::Deferred,
            ..SimConfig::default()
        },
    )
    .expect("simulated device")
}

/// Defaults with hang checks on every poll, so hang tests do not sit out the check period.
pub fn eager_hang_config() -> SyncConfig {
    let mut config = SyncConfig::default();
    config.wait.hang_check_period_us = 0;
    config
}

pub fn kernel(id: u32, work_items: u64) -> Operation {
    Operation::Compute(ComputeOp {
        kernel: KernelId(id),
        work_items,
        buffers: Vec::new(),
    })
}

pub fn kernel_with(id: u32, work_items: u64, buffers: Vec<BufferArg>) -> Operation {
    Operation::Compute(ComputeOp {
        kernel: KernelId(id),
        work_items,
        buffers,
    })
}

pub fn copy(buffer: u32, size: u64) -> Operation {
    Operation::Copy(CopyOp {
        buffer: BufferId(buffer),
        size,
    })
}

/// Commands of a stream, minus the trailing task-count write every flush ends with.
pub fn body(stream: &[SyncCmd]) -> &[SyncCmd] {
    match stream.split_last() {
        Some((SyncCmd::CompletionWrite { .. }, rest)) => rest,
        _ => stream,
    }
}

pub fn count(stream: &[SyncCmd], pred: impl Fn(&SyncCmd) -> bool) -> usize {
    stream.iter().filter(|c| pred(*c)).count()
}
