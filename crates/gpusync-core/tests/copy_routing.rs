mod common;

use common::{body, copy, count, device, kernel, COMPUTE, COPY};
use gpusync_core::{
    BufferId, CopyDirection, LatestSent, QueueProperties, SyncCmd, SyncConfig, TaskCount, Waitable,
};
use pretty_assertions::assert_eq;

#[test]
fn first_copy_goes_straight_to_the_copy_engine() {
    let (device, gpu) = device(SyncConfig::default());
    let queue = device.create_queue(QueueProperties::default()).unwrap();
    let handle = queue.submit(copy(4, 256), &[]).unwrap();
    handle.wait().unwrap();

    assert!(gpu.submissions(COMPUTE).is_empty());
    let blit = gpu.submissions(COPY);
    assert_eq!(blit.len(), 1);
    let blit = body(&blit[0]);
    assert_eq!(
        blit[0],
        SyncCmd::Copy {
            buffer: BufferId(4),
            direction: CopyDirection::Plain,
            size: 256
        }
    );
    assert!(matches!(blit[1], SyncCmd::CompletionWrite { value: 0, .. }));
    assert_eq!(blit.len(), 2);
    assert_eq!(queue.latest_sent(), LatestSent::Copy);
    assert_eq!(handle.copy_task_counts(), vec![(COPY, TaskCount(1))]);
}

#[test]
fn copy_after_compute_work_submits_to_compute_first() {
    let (device, gpu) = device(SyncConfig::default());
    let queue = device.create_queue(QueueProperties::default()).unwrap();
    queue.submit(kernel(1, 1), &[]).unwrap();
    assert_eq!(queue.latest_sent(), LatestSent::Compute);
    let handle = queue.submit(copy(1, 64), &[]).unwrap();
    handle.wait().unwrap();

    let compute = gpu.submissions(COMPUTE);
    assert_eq!(compute.len(), 2);
    assert!(body(&compute[1]).is_empty());
    assert_eq!(handle.task_count(), TaskCount(2));

    let tag = device.compute_engine().completion_tag_address();
    let blit = gpu.submissions(COPY);
    assert_eq!(blit[0][0], SyncCmd::wait_at_least(tag, 2));
    // The compute-produced dependency is covered by the barrier.
    assert_eq!(count(&blit[0], SyncCmd::is_wait), 1);
}

#[test]
fn back_to_back_copies_skip_the_compute_engine() {
    let (device, gpu) = device(SyncConfig::default());
    let queue = device.create_queue(QueueProperties::default()).unwrap();
    queue.submit(kernel(1, 1), &[]).unwrap();
    queue.submit(copy(1, 64), &[]).unwrap();
    queue.submit(copy(2, 64), &[]).unwrap().wait().unwrap();

    assert_eq!(gpu.submissions(COMPUTE).len(), 2);
    let blit = gpu.submissions(COPY);
    assert_eq!(blit.len(), 2);
    assert!(!blit[1][0].is_wait());
}

#[test]
fn forced_compute_submission_with_cache_flush() {
    let config = SyncConfig {
        force_compute_submission_for_copy: true,
        force_cache_flush_for_copy: true,
        ..SyncConfig::default()
    };
    let (device, gpu) = device(config);
    let queue = device.create_queue(QueueProperties::default()).unwrap();
    queue.submit(copy(1, 64), &[]).unwrap();
    queue.submit(copy(2, 64), &[]).unwrap().wait().unwrap();

    let compute = gpu.submissions(COMPUTE);
    assert_eq!(compute.len(), 2);
    for stream in &compute {
        assert!(matches!(body(stream), [SyncCmd::CacheFlush { post_sync: Some(_) }]));
    }
    let blit = gpu.submissions(COPY);
    for stream in &blit {
        assert!(matches!(stream[0], SyncCmd::SemaphoreWait { .. }));
        assert!(matches!(stream[1], SyncCmd::SemaphoreWait { .. }));
        assert!(stream[2].is_copy());
    }
}

#[test]
fn copies_fall_back_to_compute_when_disabled() {
    let mut config = SyncConfig::default();
    config.copy_engine.copies = false;
    let (device, gpu) = device(config);
    let queue = device.create_queue(QueueProperties::default()).unwrap();
    let handle = queue.submit(copy(9, 8), &[]).unwrap();
    handle.wait().unwrap();

    assert!(gpu.submissions(COPY).is_empty());
    let compute = gpu.submissions(COMPUTE);
    assert_eq!(count(body(&compute[0]), SyncCmd::is_copy), 1);
    assert!(handle.copy_task_counts().is_empty());
    assert_eq!(queue.latest_sent(), LatestSent::Compute);
}

#[test]
fn queue_without_copy_engine_copies_on_compute() {
    let (device, gpu) = device(SyncConfig::default());
    let queue = device
        .create_queue(QueueProperties {
            copy_engine: None,
            ..QueueProperties::default()
        })
        .unwrap();
    queue.submit(copy(1, 8), &[]).unwrap().wait().unwrap();
    assert!(gpu.submissions(COPY).is_empty());
    assert_eq!(gpu.submissions(COMPUTE).len(), 1);
}

#[test]
fn compute_after_copy_waits_on_the_copy_token() {
    let (device, gpu) = common::deferred_device(SyncConfig::default());
    let queue = device.create_queue(QueueProperties::default()).unwrap();
    queue.submit(copy(1, 64), &[]).unwrap();
    let handle = queue.submit(kernel(1, 1), &[]).unwrap();

    let compute = gpu.submissions(COMPUTE);
    assert_eq!(count(body(&compute[0]), SyncCmd::is_wait), 1);

    gpu.pump();
    handle.wait().unwrap();
    queue.finish().unwrap();
    assert_eq!(queue.deferred_token_batches(), 0);
}
