//! Simulated GPU: one compute ring plus N copy rings executing decoded command streams against a
//! shared [`SyncMemory`].
//!
//! Engines are independent executors. A ring stalls on an unsatisfied `SemaphoreWait` until some
//! other ring writes the awaited value, so cross-engine ordering bugs show up as stalls or as
//! tokens signaled in the wrong order.

use gpusync_cmd::{decode_stream, SyncCmd};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::backend::{EngineBackend, EngineSubmission, HangDetector};
use crate::config::SyncConfig;
use crate::device::{Device, DeviceBuilder};
use crate::error::{BackendError, Result};
use crate::memory::{lock, SyncMemory};
use crate::types::{EngineId, EngineKind, TaskCount};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompletionMode {
    /// Every flush runs all rings until none can make progress.
    Immediate,
    /// Submissions stay in flight until [`SimGpu::pump`] or [`SimGpu::pump_engine`] is called.
    Deferred,
}

#[derive(Clone, Debug)]
pub struct SimConfig {
    pub copy_engines: usize,
    pub completion: CompletionMode,
    /// Ring size per engine; a flush that does not fit fails with `RingFull`.
    pub ring_bytes: usize,
    /// Submitted streams and retired commands remembered per engine for inspection.
    pub keep_last_submissions: usize,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            copy_engines: 1,
            completion: CompletionMode::Immediate,
            ring_bytes: 1 << 20,
            keep_last_submissions: 256,
        }
    }
}

struct InFlight {
    cmds: Vec<SyncCmd>,
    bytes: usize,
    next: usize,
}

struct Ring {
    kind: EngineKind,
    pending: VecDeque<InFlight>,
    bytes_in_flight: usize,
    submitted: VecDeque<Vec<SyncCmd>>,
    executed: VecDeque<SyncCmd>,
}

struct SimShared {
    memory: Arc<SyncMemory>,
    rings: Mutex<Vec<Ring>>,
    hung: AtomicBool,
    cfg: SimConfig,
}

impl SimShared {
    /// Execute one ring until it stalls. Returns the number of commands retired.
    fn run_ring(&self, ring: &mut Ring) -> usize {
        let mut retired = 0;
        while let Some(head) = ring.pending.front_mut() {
            while head.next < head.cmds.len() {
                let cmd = &head.cmds[head.next];
                match *cmd {
                    SyncCmd::SemaphoreWait { address, value, op } => {
                        let current = self.memory.try_read(address).unwrap_or(0);
                        if !op.is_satisfied(current, value) {
                            return retired;
                        }
                    }
                    SyncCmd::CompletionWrite { address, value } => {
                        if self.memory.try_write(address, value).is_none() {
                            tracing::warn!(address, "simulated write to unmapped address");
                        }
                    }
                    SyncCmd::CacheFlush { post_sync } => {
                        if let Some(ps) = post_sync {
                            if self.memory.try_write(ps.address, ps.value).is_none() {
                                tracing::warn!(address = ps.address, "simulated write to unmapped address");
                            }
                        }
                    }
                    SyncCmd::Copy { .. } | SyncCmd::Dispatch { .. } => {}
                }
                ring.executed.push_back(cmd.clone());
                if ring.executed.len() > self.cfg.keep_last_submissions {
                    ring.executed.pop_front();
                }
                head.next += 1;
                retired += 1;
            }
            ring.bytes_in_flight -= head.bytes;
            ring.pending.pop_front();
        }
        retired
    }

    fn pump(&self, only: Option<usize>) -> usize {
        if self.hung.load(Ordering::Acquire) {
            return 0;
        }
        let mut rings = lock(&self.rings);
        let mut total = 0;
        loop {
            let mut progressed = 0;
            for (index, ring) in rings.iter_mut().enumerate() {
                if only.is_some_and(|o| o != index) {
                    continue;
                }
                progressed += self.run_ring(ring);
            }
            total += progressed;
            if progressed == 0 {
                return total;
            }
        }
    }
}

/// Handle to the simulated GPU. Cheap to clone.
#[derive(Clone)]
pub struct SimGpu {
    shared: Arc<SimShared>,
    tags: Vec<u64>,
}

impl SimGpu {
    /// Create a GPU whose completion tags live in `memory`.
    pub fn new(memory: Arc<SyncMemory>, cfg: SimConfig) -> Result<Self> {
        let engines = 1 + cfg.copy_engines;
        let first = memory.allocate(engines)?;
        let tags = (0..engines as u64).map(|i| first + i * 8).collect();

        let rings = (0..engines)
            .map(|i| Ring {
                kind: if i == 0 {
                    EngineKind::Compute
                } else {
                    EngineKind::Copy
                },
                pending: VecDeque::new(),
                bytes_in_flight: 0,
                submitted: VecDeque::new(),
                executed: VecDeque::new(),
            })
            .collect();

        Ok(Self {
            shared: Arc::new(SimShared {
                memory,
                rings: Mutex::new(rings),
                hung: AtomicBool::new(false),
                cfg,
            }),
            tags,
        })
    }

    /// Build a device with a fresh sync memory sized for `config`, backed by a new simulated GPU.
    pub fn device(config: SyncConfig, cfg: SimConfig) -> Result<(Device, SimGpu)> {
        let slots = config.token_pool_capacity + cfg.copy_engines + 1;
        let memory = Arc::new(SyncMemory::new(slots));
        let gpu = SimGpu::new(memory.clone(), cfg)?;

        let mut builder = DeviceBuilder::new(config)
            .memory(memory)
            .hang_detector(Arc::new(gpu.clone()));
        for backend in gpu.backends() {
            builder = builder.engine(backend);
        }
        Ok((builder.build()?, gpu))
    }

    /// One backend per ring, compute first.
    pub fn backends(&self) -> Vec<Box<dyn EngineBackend>> {
        self.tags
            .iter()
            .enumerate()
            .map(|(index, &tag_address)| {
                Box::new(SimEngine {
                    shared: self.shared.clone(),
                    index,
                    kind: if index == 0 {
                        EngineKind::Compute
                    } else {
                        EngineKind::Copy
                    },
                    tag_address,
                    task_count: TaskCount::ZERO,
                }) as Box<dyn EngineBackend>
            })
            .collect()
    }

    pub fn memory(&self) -> &Arc<SyncMemory> {
        &self.shared.memory
    }

    /// Run every ring until no ring can make progress. Returns the number of retired commands.
    pub fn pump(&self) -> usize {
        self.shared.pump(None)
    }

    /// Run a single ring until it stalls.
    pub fn pump_engine(&self, engine: EngineId) -> usize {
        self.shared.pump(Some(engine.0 as usize))
    }

    /// Stop executing anything and report a hang to waiters.
    pub fn inject_hang(&self) {
        tracing::warn!("simulated device hang injected");
        self.shared.hung.store(true, Ordering::Release);
    }

    /// Streams flushed to `engine`, oldest first (bounded by `keep_last_submissions`).
    pub fn submissions(&self, engine: EngineId) -> Vec<Vec<SyncCmd>> {
        let rings = lock(&self.shared.rings);
        rings
            .get(engine.0 as usize)
            .map(|r| r.submitted.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Most recently retired commands of `engine`, oldest first (bounded by `keep_last_submissions`).
    pub fn executed(&self, engine: EngineId) -> Vec<SyncCmd> {
        let rings = lock(&self.shared.rings);
        rings
            .get(engine.0 as usize)
            .map(|r| r.executed.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn pending_submissions(&self, engine: EngineId) -> usize {
        let rings = lock(&self.shared.rings);
        rings.get(engine.0 as usize).map_or(0, |r| r.pending.len())
    }

    pub fn engine_kind(&self, engine: EngineId) -> Option<EngineKind> {
        lock(&self.shared.rings)
            .get(engine.0 as usize)
            .map(|r| r.kind)
    }

    pub fn clear_history(&self) {
        for ring in lock(&self.shared.rings).iter_mut() {
            ring.submitted.clear();
            ring.executed.clear();
        }
    }
}

impl HangDetector for SimGpu {
    fn is_hung(&self) -> bool {
        self.shared.hung.load(Ordering::Acquire)
    }
}

struct SimEngine {
    shared: Arc<SimShared>,
    index: usize,
    kind: EngineKind,
    tag_address: u64,
    task_count: TaskCount,
}

impl EngineBackend for SimEngine {
    fn kind(&self) -> EngineKind {
        self.kind
    }

    fn completion_tag_address(&self) -> u64 {
        self.tag_address
    }

    fn peek_task_count(&self) -> TaskCount {
        self.task_count
    }

    fn advance_task_count(&mut self) -> TaskCount {
        self.task_count = TaskCount(self.task_count.0 + 1);
        self.task_count
    }

    fn available_bytes(&self) -> usize {
        let rings = lock(&self.shared.rings);
        self.shared
            .cfg
            .ring_bytes
            .saturating_sub(rings[self.index].bytes_in_flight)
    }

    fn flush(&mut self, submission: EngineSubmission) -> std::result::Result<(), BackendError> {
        let cmds = decode_stream(&submission.bytes)?;
        {
            let mut rings = lock(&self.shared.rings);
            let ring = &mut rings[self.index];
            let available = self.shared.cfg.ring_bytes.saturating_sub(ring.bytes_in_flight);
            if submission.bytes.len() > available {
                return Err(BackendError::RingFull {
                    needed: submission.bytes.len(),
                    available,
                });
            }

            ring.bytes_in_flight += submission.bytes.len();
            ring.submitted.push_back(cmds.clone());
            while ring.submitted.len() > self.shared.cfg.keep_last_submissions {
                ring.submitted.pop_front();
            }
            ring.pending.push_back(InFlight {
                cmds,
                bytes: submission.bytes.len(),
                next: 0,
            });
        }

        if self.shared.cfg.completion == CompletionMode::Immediate {
            self.shared.pump(None);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpusync_cmd::{encoder_for, CommandStream, EncoderKind};

    fn submit(engine: &mut dyn EngineBackend, stream: CommandStream) {
        let task_count = TaskCount(engine.peek_task_count().0 + 1);
        let mut stream = stream;
        stream.completion_write(engine.completion_tag_address(), task_count.0);
        let bytes = encoder_for(EncoderKind::Wide)
            .encode(stream.cmds())
            .unwrap()
            .bytes;
        engine
            .flush(EngineSubmission { task_count, bytes })
            .unwrap();
        engine.advance_task_count();
    }

    fn gpu(mode: CompletionMode) -> (Arc<SyncMemory>, SimGpu) {
        let memory = Arc::new(SyncMemory::new(16));
        let gpu = SimGpu::new(
            memory.clone(),
            SimConfig {
                completion: mode,
                ..SimConfig::default()
            },
        )
        .unwrap();
        (memory, gpu)
    }

    #[test]
    fn immediate_mode_retires_on_flush() {
        let (memory, gpu) = gpu(CompletionMode::Immediate);
        let mut engines = gpu.backends();
        let tag = engines[0].completion_tag_address();

        submit(engines[0].as_mut(), CommandStream::new());
        assert_eq!(memory.read(tag), 1);
        assert_eq!(gpu.pending_submissions(EngineId(0)), 0);
    }

    #[test]
    fn cross_engine_wait_stalls_until_producer_runs() {
        let (memory, gpu) = gpu(CompletionMode::Deferred);
        let mut engines = gpu.backends();
        let slot = memory.allocate(1).unwrap();
        memory.write(slot, 1);

        let mut consumer = CommandStream::new();
        consumer.wait_equal(slot, 0);
        submit(engines[1].as_mut(), consumer);

        let mut producer = CommandStream::new();
        producer.completion_write(slot, 0);
        submit(engines[0].as_mut(), producer);

        // The copy ring cannot get past its wait on its own.
        gpu.pump_engine(EngineId(1));
        assert_eq!(memory.read(engines[1].completion_tag_address()), 0);

        gpu.pump();
        assert_eq!(memory.read(engines[0].completion_tag_address()), 1);
        assert_eq!(memory.read(engines[1].completion_tag_address()), 1);
    }

    #[test]
    fn hang_stops_execution() {
        let (memory, gpu) = gpu(CompletionMode::Deferred);
        let mut engines = gpu.backends();
        submit(engines[0].as_mut(), CommandStream::new());

        gpu.inject_hang();
        assert!(gpu.is_hung());
        assert_eq!(gpu.pump(), 0);
        assert_eq!(memory.read(engines[0].completion_tag_address()), 0);
    }

    #[test]
    fn ring_full_is_reported() {
        let memory = Arc::new(SyncMemory::new(16));
        let gpu = SimGpu::new(
            memory,
            SimConfig {
                completion: CompletionMode::Deferred,
                ring_bytes: 64,
                ..SimConfig::default()
            },
        )
        .unwrap();
        let mut engines = gpu.backends();
        submit(engines[0].as_mut(), CommandStream::new());
        assert!(engines[0].available_bytes() < 64);

        let mut big = CommandStream::new();
        for _ in 0..4 {
            big.completion_write(0x1_0000, 0);
        }
        let bytes = encoder_for(EncoderKind::Wide).encode(big.cmds()).unwrap().bytes;
        let err = engines[0]
            .flush(EngineSubmission {
                task_count: TaskCount(2),
                bytes,
            })
            .unwrap_err();
        assert!(matches!(err, BackendError::RingFull { .. }));
    }
}
