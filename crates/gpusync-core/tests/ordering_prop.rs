mod common;

use common::{copy, kernel, COMPUTE, COPY};
use gpusync_core::sim::{CompletionMode, SimConfig, SimGpu};
use gpusync_core::{
    CompletionHandle, Operation, QueueProperties, SubmissionQueue, SyncConfig, TaskCount, TaskLevel,
};
use proptest::prelude::*;

#[derive(Clone, Debug)]
enum Step {
    Enqueue {
        queue: usize,
        op: u8,
        wait_on: Vec<usize>,
    },
    Pump,
}

fn step() -> impl Strategy<Value = Step> {
    prop_oneof![
        4 => (0usize..2, 0u8..4, prop::collection::vec(any::<usize>(), 0..3))
            .prop_map(|(queue, op, wait_on)| Step::Enqueue { queue, op, wait_on }),
        1 => Just(Step::Pump),
    ]
}

fn operation(op: u8) -> Operation {
    match op {
        0 => kernel(1, 1),
        1 => copy(1, 64),
        2 => Operation::Marker,
        _ => Operation::Barrier,
    }
}

fn observed(device: &gpusync_core::Device) -> [TaskCount; 2] {
    [
        device.engine(COMPUTE).map_or(TaskCount::ZERO, |e| e.completed_task_count()),
        device.engine(COPY).map_or(TaskCount::ZERO, |e| e.completed_task_count()),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn task_counts_never_decrease_and_levels_follow_wait_lists(steps in prop::collection::vec(step(), 1..40)) {
        let (device, gpu) = SimGpu::device(
            SyncConfig::default(),
            SimConfig {
                completion: CompletionMode::Deferred,
                ..SimConfig::default()
            },
        )
        .unwrap();
        let queues: Vec<SubmissionQueue> = (0..2)
            .map(|_| device.create_queue(QueueProperties::default()).unwrap())
            .collect();
        let mut handles: Vec<CompletionHandle> = Vec::new();
        let mut last = observed(&device);

        for step in steps {
            match step {
                Step::Pump => {
                    gpu.pump();
                }
                Step::Enqueue { queue, op, wait_on } => {
                    let queue = &queues[queue];
                    let wait_list: Vec<&CompletionHandle> = if handles.is_empty() {
                        Vec::new()
                    } else {
                        wait_on.iter().map(|i| &handles[i % handles.len()]).collect()
                    };
                    let before = queue.task_level();
                    let deps = wait_list.iter().map(|h| h.task_level()).max();
                    let candidate = deps.map_or(before, |d| d.max(before));

                    let operation = operation(op);
                    let advances = !matches!(operation, Operation::Marker);
                    let handle = queue.submit(operation, &wait_list).unwrap();
                    let expected = if advances { TaskLevel(candidate.0 + 1) } else { candidate };
                    prop_assert_eq!(handle.task_level(), expected);
                    prop_assert_eq!(queue.task_level(), expected);
                    handles.push(handle);
                }
            }

            let now = observed(&device);
            prop_assert!(now[0] >= last[0] && now[1] >= last[1]);
            last = now;
        }

        gpu.pump();
        device.wait(&handles.iter().collect::<Vec<_>>()).unwrap();
        for queue in &queues {
            queue.finish().unwrap();
            prop_assert_eq!(queue.deferred_token_batches(), 0);
        }
    }
}
