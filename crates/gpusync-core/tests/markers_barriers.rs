mod common;

use common::{body, deferred_device, device, kernel, COMPUTE};
use gpusync_core::{
    ExecutionStatus, ObservableCompletion, Operation, QueueFlags, QueueProperties, SyncConfig,
    TaskCount, TaskLevel, Waitable,
};
use pretty_assertions::assert_eq;

#[test]
fn marker_level_with_engine_inserts_an_observation() {
    let (device, gpu) = device(SyncConfig::default());
    let queue = device.create_queue(QueueProperties::default()).unwrap();
    queue.submit(kernel(1, 1), &[]).unwrap();
    assert_eq!(queue.task_level(), device.compute_engine().task_level());

    let marker = queue.submit(Operation::Marker, &[]).unwrap();
    let compute = gpu.submissions(COMPUTE);
    assert_eq!(compute.len(), 2);
    assert!(body(&compute[1]).is_empty());
    assert_eq!(marker.task_level(), TaskLevel(1));
    assert_eq!(marker.task_count(), TaskCount(2));
    assert_eq!(device.stats().marker_observations, 1);
    marker.wait().unwrap();
}

#[test]
fn marker_behind_engine_reuses_earlier_completion() {
    let (device, gpu) = device(SyncConfig::default());
    let behind = device.create_queue(QueueProperties::default()).unwrap();
    let ahead = device.create_queue(QueueProperties::default()).unwrap();
    behind.submit(kernel(1, 1), &[]).unwrap();
    ahead.submit(kernel(2, 1), &[]).unwrap();
    ahead.submit(kernel(3, 1), &[]).unwrap();
    assert!(behind.task_level() < device.compute_engine().task_level());

    let flushed = gpu.submissions(COMPUTE).len();
    let marker = behind.submit(Operation::Marker, &[]).unwrap();
    assert_eq!(gpu.submissions(COMPUTE).len(), flushed);
    assert_eq!(marker.task_level(), TaskLevel(1));
    assert_eq!(marker.task_count(), TaskCount(1));
    assert_eq!(device.stats().marker_observations, 0);
}

#[test]
fn marker_with_wait_list_tracks_its_dependencies() {
    let (device, gpu) = deferred_device(SyncConfig::default());
    let a = device.create_queue(QueueProperties::default()).unwrap();
    let b = device.create_queue(QueueProperties::default()).unwrap();
    let first = a.submit(kernel(1, 1), &[]).unwrap();
    let second = a.submit(kernel(2, 1), &[]).unwrap();

    let flushed = gpu.submissions(COMPUTE).len();
    let marker = b.submit(Operation::Marker, &[&first, &second]).unwrap();
    assert_eq!(gpu.submissions(COMPUTE).len(), flushed);
    assert_eq!(marker.task_level(), TaskLevel(2));
    assert_eq!(marker.task_count(), TaskCount(2));
    assert_eq!(marker.execution_status(), ExecutionStatus::Submitted);

    gpu.pump();
    marker.wait().unwrap();
    assert_eq!(marker.execution_status(), ExecutionStatus::Complete);
}

#[test]
fn barrier_blocked_on_user_handle() {
    let (device, gpu) = device(SyncConfig::default());
    let queue = device.create_queue(QueueProperties::default()).unwrap();
    let user = device.create_user_handle();

    let barrier = queue.submit(Operation::Barrier, &[user.handle()]).unwrap();
    assert!(queue.is_blocked());
    assert_eq!(queue.task_level(), TaskLevel::NOT_READY);
    assert_eq!(barrier.task_level(), TaskLevel::NOT_READY);
    assert_eq!(barrier.execution_status(), ExecutionStatus::Queued);
    assert!(gpu.submissions(COMPUTE).is_empty());

    user.complete().unwrap();
    assert!(!queue.is_blocked());
    assert_eq!(queue.task_level(), TaskLevel(1));
    assert_eq!(barrier.task_level(), TaskLevel(1));
    barrier.wait().unwrap();
    assert_eq!(device.stats().deferred_replays, 1);
}

#[test]
fn blocked_queue_dispatches_nothing_until_release() {
    let (device, gpu) = deferred_device(SyncConfig::default());
    let queue = device.create_queue(QueueProperties::default()).unwrap();
    let user = device.create_user_handle();

    let first = queue.submit(kernel(1, 1), &[user.handle()]).unwrap();
    // Nothing in this wait list, but the queue is blocked behind `first`.
    let second = queue.submit(kernel(2, 1), &[]).unwrap();
    assert!(gpu.submissions(COMPUTE).is_empty());
    assert_eq!(queue.pending_deferred(), 2);
    assert_eq!(device.stats().blocked_enqueues, 2);

    user.complete().unwrap();
    assert_eq!(gpu.submissions(COMPUTE).len(), 2);
    assert_eq!(first.task_level(), TaskLevel(1));
    assert_eq!(second.task_level(), TaskLevel(2));
    assert_eq!(queue.pending_deferred(), 0);

    gpu.pump();
    device.wait(&[&first, &second]).unwrap();
}

#[test]
fn stalling_barrier_orders_out_of_order_work() {
    let (device, gpu) = deferred_device(SyncConfig::default());
    let queue = device
        .create_queue(QueueProperties {
            flags: QueueFlags::OUT_OF_ORDER,
            ..QueueProperties::default()
        })
        .unwrap();
    queue.submit(common::copy(1, 64), &[]).unwrap();
    queue.submit(kernel(1, 1), &[]).unwrap();
    let barrier = queue.submit(Operation::Barrier, &[]).unwrap();
    assert_eq!(barrier.token_count(), 1);
    assert_eq!(device.stats().stalling_barriers, 1);

    // The barrier stream waits on the copy; the kernel is ordered by the compute ring.
    let compute = gpu.submissions(COMPUTE);
    let barrier_stream = body(compute.last().unwrap());
    assert_eq!(barrier_stream.iter().filter(|c| c.is_wait()).count(), 1);

    // Work after the barrier waits on it only through the ring.
    let after = queue.submit(kernel(2, 1), &[]).unwrap();
    assert_eq!(after.task_level(), TaskLevel(1));
    gpu.pump();
    after.wait().unwrap();
}
