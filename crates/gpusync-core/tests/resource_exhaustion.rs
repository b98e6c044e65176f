mod common;

use common::{kernel, kernel_with, COMPUTE};
use gpusync_core::sim::{CompletionMode, SimConfig, SimGpu};
use gpusync_core::{
    BufferArg, BufferId, QueueProperties, SyncConfig, SyncError, TaskCount, TaskLevel, Waitable,
};
use pretty_assertions::assert_eq;

#[test]
fn exhausted_token_pool_leaves_the_queue_untouched() {
    let config = SyncConfig {
        token_pool_capacity: 4,
        max_work_items_per_dispatch: 1,
        ..SyncConfig::default()
    };
    let (device, gpu) = common::device(config);
    let queue = device.create_queue(QueueProperties::default()).unwrap();
    let first = queue.submit(kernel(1, 2), &[]).unwrap();
    first.wait().unwrap();
    let level = queue.task_level();
    let task_count = queue.task_count();
    let flushed = gpu.submissions(COMPUTE).len();

    // Needs five sub-dispatch tokens; two are still held by `first`.
    let err = queue.submit(kernel(2, 5), &[]).unwrap_err();
    assert!(err.is_resource_exhausted());
    assert_eq!(queue.task_level(), level);
    assert_eq!(queue.task_count(), task_count);
    assert_eq!(gpu.submissions(COMPUTE).len(), flushed);
    assert_eq!(device.available_tokens(), 2);

    drop(first);
    queue.submit(kernel(3, 2), &[]).unwrap().wait().unwrap();
    assert_eq!(queue.task_level(), TaskLevel(2));
}

#[test]
fn aux_translation_is_all_or_nothing() {
    let config = SyncConfig {
        token_pool_capacity: 3,
        ..SyncConfig::default()
    };
    let (device, gpu) = common::device(config);
    let queue = device.create_queue(QueueProperties::default()).unwrap();
    let buffers = vec![
        BufferArg::compressed(BufferId(1), 64),
        BufferArg::compressed(BufferId(2), 64),
    ];
    // Two resolve tokens, one kernel token, two re-compression tokens.
    let err = queue.submit(kernel_with(1, 1, buffers), &[]).unwrap_err();
    assert!(err.is_resource_exhausted());
    assert!(gpu.submissions(COMPUTE).is_empty());
    assert!(gpu.submissions(common::COPY).is_empty());
    assert_eq!(queue.task_count(), TaskCount::ZERO);
    assert_eq!(queue.copy_task_count(), TaskCount::ZERO);
    assert_eq!(device.available_tokens(), 3);
}

#[test]
fn full_ring_reports_resource_exhaustion() {
    let (device, gpu) = SimGpu::device(
        SyncConfig::default(),
        SimConfig {
            completion: CompletionMode::Deferred,
            ring_bytes: 512,
            ..SimConfig::default()
        },
    )
    .unwrap();
    let queue = device.create_queue(QueueProperties::default()).unwrap();

    let mut handles = Vec::new();
    let mut available = device.available_tokens();
    let err = loop {
        match queue.submit(kernel(1, 1), &[]) {
            Ok(handle) => handles.push(handle),
            Err(err) => break err,
        }
        available = device.available_tokens();
        assert!(handles.len() < 64, "ring never filled up");
    };
    assert!(matches!(err, SyncError::ResourceExhausted(_)));
    assert_eq!(queue.task_count(), TaskCount(handles.len() as u64));
    // The rejected dispatch's token went back; the queue still holds the previous one.
    assert_eq!(device.available_tokens(), available);

    gpu.pump();
    let last = queue.submit(kernel(2, 1), &[]).unwrap();
    gpu.pump();
    last.wait().unwrap();
    assert_eq!(last.task_count(), TaskCount(handles.len() as u64 + 1));
}

#[test]
fn stream_larger_than_the_command_buffer_is_rejected() {
    let config = SyncConfig {
        command_buffer_bytes: 64,
        max_work_items_per_dispatch: 1,
        ..SyncConfig::default()
    };
    let (device, gpu) = common::device(config);
    let queue = device.create_queue(QueueProperties::default()).unwrap();
    let available = device.available_tokens();

    let err = queue.submit(kernel(1, 16), &[]).unwrap_err();
    assert!(err.is_resource_exhausted());
    assert!(gpu.submissions(COMPUTE).is_empty());
    assert_eq!(queue.task_count(), TaskCount::ZERO);
    assert_eq!(device.available_tokens(), available);
}
