//! Cross-engine synchronization policy.
//!
//! Decides which engine an operation runs on and builds the command streams that carry its
//! waits, barriers, translations and flushes. Nothing here touches engine or queue state; the
//! queue locks the engines, prepares the streams built here and commits them.

use gpusync_cmd::{CommandStream, CopyDirection, KernelId, PostSync};

use crate::config::SyncConfig;
use crate::device::COMPUTE;
use crate::queue::{BufferArg, CopyOp};
use crate::token::{CompletionToken, TokenContainer, TOKEN_SIGNALED};
use crate::types::{EngineId, TaskCount};

/// Engine class of the most recent work a queue sent.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LatestSent {
    #[default]
    Nothing,
    Compute,
    Copy,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum AuxRoute {
    /// No buffer needs translation.
    None,
    /// Translation copies run on the compute engine around the dispatch.
    Builtin,
    /// Translation copies run on the given copy engine.
    CopyEngine(EngineId),
}

pub(crate) fn route_aux(config: &SyncConfig, copy_engine: Option<EngineId>, compressed: usize) -> AuxRoute {
    if compressed == 0 {
        return AuxRoute::None;
    }
    match copy_engine {
        Some(engine) if config.copy_engine.aux_translation => AuxRoute::CopyEngine(engine),
        _ => AuxRoute::Builtin,
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum CopyRoute {
    Compute,
    CopyEngine {
        engine: EngineId,
        /// Flush the compute engine first and have the copy wait for that flush.
        compute_submission: bool,
    },
}

/// Pick the engine for a plain copy.
///
/// A copy-engine copy is preceded by a compute submission when it replays a deferred command,
/// when the queue's previous work went to the compute engine, or when the config forces it.
pub(crate) fn route_copy(
    config: &SyncConfig,
    copy_engine: Option<EngineId>,
    latest: LatestSent,
    replay: bool,
) -> CopyRoute {
    match copy_engine {
        Some(engine) if config.copy_engine.copies => CopyRoute::CopyEngine {
            engine,
            compute_submission: replay
                || latest == LatestSent::Compute
                || config.force_compute_submission_for_copy,
        },
        _ => CopyRoute::Compute,
    }
}

/// Number of sub-dispatches needed for `work_items`.
pub(crate) fn partition_count(work_items: u64, max_per_dispatch: u64) -> u32 {
    let max = max_per_dispatch.max(1);
    let partitions = work_items.div_ceil(max).max(1);
    u32::try_from(partitions).unwrap_or(u32::MAX)
}

/// Emit one wait per token. Returns the number of waits emitted.
pub(crate) fn emit_waits<'a>(
    stream: &mut CommandStream,
    tokens: impl IntoIterator<Item = &'a CompletionToken>,
) -> usize {
    let mut emitted = 0;
    for token in tokens {
        stream.wait_equal(token.address(), TOKEN_SIGNALED);
        emitted += 1;
    }
    emitted
}

pub(crate) fn emit_signal(stream: &mut CommandStream, token: &CompletionToken) {
    stream.completion_write(token.address(), TOKEN_SIGNALED);
}

/// One sub-dispatch per token, each followed by the write that signals it.
pub(crate) fn emit_dispatch(stream: &mut CommandStream, kernel: KernelId, tokens: &TokenContainer) {
    let partitions = tokens.len() as u32;
    for (partition, token) in tokens.peek_nodes().iter().enumerate() {
        stream.dispatch(kernel, partition as u32, partitions);
        emit_signal(stream, token);
    }
}

pub(crate) fn emit_translation(stream: &mut CommandStream, buffers: &[&BufferArg], direction: CopyDirection) {
    for buffer in buffers {
        stream.copy(buffer.buffer, direction, buffer.size);
    }
}

/// Streams for a dispatch whose compressed buffers are translated on a copy engine.
pub(crate) struct AuxPlan<'a> {
    pub(crate) copy_engine: EngineId,
    pub(crate) waits: &'a TokenContainer,
    pub(crate) buffers: &'a [&'a BufferArg],
    pub(crate) kernel: KernelId,
    pub(crate) phase1: &'a TokenContainer,
    pub(crate) kernel_tokens: &'a TokenContainer,
    pub(crate) flush: Option<&'a CompletionToken>,
    pub(crate) phase3: &'a TokenContainer,
    /// Completion tag of the compute engine and the task count the copy engine must wait for.
    pub(crate) compute_barrier: (u64, TaskCount),
}

impl AuxPlan<'_> {
    /// Wait-list waits, one wait per resolved buffer, the dispatch, and the optional flush write.
    pub(crate) fn compute_stream(&self) -> CommandStream {
        let mut stream = CommandStream::new();
        emit_waits(&mut stream, self.waits.pending_from_other_engines(COMPUTE));
        emit_waits(&mut stream, self.phase1.peek_nodes());
        emit_dispatch(&mut stream, self.kernel, self.kernel_tokens);
        if let Some(flush) = self.flush {
            stream.cache_flush(Some(PostSync {
                address: flush.address(),
                value: TOKEN_SIGNALED,
            }));
        }
        stream
    }

    /// Leading barrier on the compute engine, both translation phases, and the wait on the
    /// dispatch (or its flush) in front of every re-compression.
    pub(crate) fn copy_stream(&self) -> CommandStream {
        let mut stream = CommandStream::new();
        let (tag, barrier) = self.compute_barrier;
        stream.wait_at_least(tag, barrier.0);
        // Compute-produced dependencies are covered by the barrier.
        emit_waits(
            &mut stream,
            self.waits
                .pending_from_other_engines(self.copy_engine)
                .filter(|t| t.producer() != COMPUTE),
        );

        for (buffer, token) in self.buffers.iter().zip(self.phase1.peek_nodes()) {
            stream.copy(buffer.buffer, CopyDirection::AuxToNonAux, buffer.size);
            emit_signal(&mut stream, token);
        }

        let dependency = self.flush.or_else(|| self.kernel_tokens.peek_nodes().last());
        for (buffer, token) in self.buffers.iter().zip(self.phase3.peek_nodes()) {
            if let Some(dependency) = dependency {
                stream.wait_equal(dependency.address(), TOKEN_SIGNALED);
            }
            stream.copy(buffer.buffer, CopyDirection::NonAuxToAux, buffer.size);
            emit_signal(&mut stream, token);
        }
        stream
    }
}

/// Streams for a plain copy on a copy engine.
pub(crate) struct CopyPlan<'a> {
    pub(crate) copy_engine: EngineId,
    pub(crate) waits: &'a TokenContainer,
    pub(crate) op: &'a CopyOp,
    /// Signaled once the copy lands.
    pub(crate) tokens: &'a TokenContainer,
    pub(crate) flush: Option<&'a CompletionToken>,
}

impl CopyPlan<'_> {
    /// Compute-side submission: the copy's compute dependencies plus the optional flush write.
    pub(crate) fn compute_stream(&self) -> CommandStream {
        let mut stream = CommandStream::new();
        emit_waits(&mut stream, self.waits.pending_from_other_engines(COMPUTE));
        if let Some(flush) = self.flush {
            stream.cache_flush(Some(PostSync {
                address: flush.address(),
                value: TOKEN_SIGNALED,
            }));
        }
        stream
    }

    /// `compute_barrier` is set when a compute submission precedes the copy.
    pub(crate) fn copy_stream(&self, compute_barrier: Option<(u64, TaskCount)>) -> CommandStream {
        let mut stream = CommandStream::new();
        if let Some((tag, task_count)) = compute_barrier {
            stream.wait_at_least(tag, task_count.0);
        }
        if let Some(flush) = self.flush {
            stream.wait_equal(flush.address(), TOKEN_SIGNALED);
        }
        let covered = compute_barrier.is_some();
        emit_waits(
            &mut stream,
            self.waits
                .pending_from_other_engines(self.copy_engine)
                .filter(|t| !covered || t.producer() != COMPUTE),
        );
        stream.copy(self.op.buffer, CopyDirection::Plain, self.op.size);
        for token in self.tokens.peek_nodes() {
            emit_signal(&mut stream, token);
        }
        stream
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::SyncMemory;
    use crate::token::{TokenAllocator, TokenPool};
    use gpusync_cmd::{BufferId, CompareOp, SyncCmd};
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    const COPY: EngineId = EngineId(1);
    const TAG: u64 = 0xdead_0000;

    fn pool() -> TokenPool {
        TokenPool::new(Arc::new(SyncMemory::new(64)), 64).unwrap()
    }

    fn buffers() -> Vec<BufferArg> {
        vec![
            BufferArg {
                buffer: BufferId(1),
                size: 256,
                compressed: true,
            },
            BufferArg {
                buffer: BufferId(2),
                size: 512,
                compressed: true,
            },
        ]
    }

    #[test]
    fn partitions_round_up() {
        assert_eq!(partition_count(0, 64), 1);
        assert_eq!(partition_count(64, 64), 1);
        assert_eq!(partition_count(65, 64), 2);
        assert_eq!(partition_count(10, 0), 10);
    }

    #[test]
    fn routing_follows_config() {
        let mut config = SyncConfig::default();
        assert_eq!(route_aux(&config, Some(COPY), 0), AuxRoute::None);
        assert_eq!(route_aux(&config, Some(COPY), 2), AuxRoute::CopyEngine(COPY));
        assert_eq!(route_aux(&config, None, 2), AuxRoute::Builtin);
        config.copy_engine.aux_translation = false;
        assert_eq!(route_aux(&config, Some(COPY), 2), AuxRoute::Builtin);

        let config = SyncConfig::default();
        assert_eq!(
            route_copy(&config, Some(COPY), LatestSent::Nothing, false),
            CopyRoute::CopyEngine {
                engine: COPY,
                compute_submission: false
            }
        );
        assert_eq!(
            route_copy(&config, Some(COPY), LatestSent::Compute, false),
            CopyRoute::CopyEngine {
                engine: COPY,
                compute_submission: true
            }
        );
        assert_eq!(
            route_copy(&config, Some(COPY), LatestSent::Copy, true),
            CopyRoute::CopyEngine {
                engine: COPY,
                compute_submission: true
            }
        );
        assert_eq!(route_copy(&config, None, LatestSent::Copy, false), CopyRoute::Compute);

        let mut forced = SyncConfig::default();
        forced.force_compute_submission_for_copy = true;
        assert_eq!(
            route_copy(&forced, Some(COPY), LatestSent::Copy, false),
            CopyRoute::CopyEngine {
                engine: COPY,
                compute_submission: true
            }
        );
    }

    #[test]
    fn aux_streams_bracket_the_dispatch() {
        let pool = pool();
        let args = buffers();
        let compressed: Vec<&BufferArg> = args.iter().collect();
        let phase1 = TokenContainer::acquire(&pool, COPY, 2).unwrap();
        let kernel = TokenContainer::acquire(&pool, COMPUTE, 1).unwrap();
        let phase3 = TokenContainer::acquire(&pool, COPY, 2).unwrap();
        let waits = TokenContainer::new();
        let plan = AuxPlan {
            copy_engine: COPY,
            waits: &waits,
            buffers: &compressed,
            kernel: KernelId(9),
            phase1: &phase1,
            kernel_tokens: &kernel,
            flush: None,
            phase3: &phase3,
            compute_barrier: (TAG, TaskCount(4)),
        };

        let compute = plan.compute_stream().into_cmds();
        let p1: Vec<u64> = phase1.peek_nodes().iter().map(|t| t.address()).collect();
        let k = kernel.peek_nodes()[0].address();
        assert_eq!(
            compute,
            vec![
                SyncCmd::wait_equal(p1[0], TOKEN_SIGNALED),
                SyncCmd::wait_equal(p1[1], TOKEN_SIGNALED),
                SyncCmd::Dispatch {
                    kernel: KernelId(9),
                    partition: 0,
                    partitions: 1
                },
                SyncCmd::CompletionWrite {
                    address: k,
                    value: TOKEN_SIGNALED
                },
            ]
        );

        let copy = plan.copy_stream().into_cmds();
        assert_eq!(copy[0], SyncCmd::wait_at_least(TAG, 4));
        assert_eq!(copy.iter().filter(|c| c.is_copy()).count(), 4);
        let waits_on_kernel = copy
            .iter()
            .filter(|c| {
                matches!(c, SyncCmd::SemaphoreWait { address, op: CompareOp::Equal, .. } if *address == k)
            })
            .count();
        assert_eq!(waits_on_kernel, 2);
    }

    #[test]
    fn forced_flush_moves_the_recompression_wait() {
        let pool = pool();
        let args = buffers();
        let compressed: Vec<&BufferArg> = args[..1].iter().collect();
        let phase1 = TokenContainer::acquire(&pool, COPY, 1).unwrap();
        let kernel = TokenContainer::acquire(&pool, COMPUTE, 2).unwrap();
        let flush = pool.acquire(COMPUTE).unwrap();
        let phase3 = TokenContainer::acquire(&pool, COPY, 1).unwrap();
        let waits = TokenContainer::new();
        let plan = AuxPlan {
            copy_engine: COPY,
            waits: &waits,
            buffers: &compressed,
            kernel: KernelId(1),
            phase1: &phase1,
            kernel_tokens: &kernel,
            flush: Some(&flush),
            phase3: &phase3,
            compute_barrier: (TAG, TaskCount(0)),
        };

        let compute = plan.compute_stream().into_cmds();
        assert_eq!(compute.iter().filter(|c| c.is_dispatch()).count(), 2);
        assert_eq!(
            compute.last(),
            Some(&SyncCmd::CacheFlush {
                post_sync: Some(PostSync {
                    address: flush.address(),
                    value: TOKEN_SIGNALED
                })
            })
        );

        let copy = plan.copy_stream().into_cmds();
        let recompress = copy
            .iter()
            .position(|c| matches!(c, SyncCmd::Copy { direction: CopyDirection::NonAuxToAux, .. }))
            .unwrap();
        assert_eq!(copy[recompress - 1], SyncCmd::wait_equal(flush.address(), TOKEN_SIGNALED));
    }

    #[test]
    fn copy_barrier_covers_compute_dependencies() {
        let pool = pool();
        let compute_dep = pool.acquire(COMPUTE).unwrap();
        let copy_dep = pool.acquire(EngineId(2)).unwrap();
        let waits: TokenContainer = [compute_dep.clone(), copy_dep.clone()].into_iter().collect();
        let token = pool.acquire(COPY).unwrap();
        let tokens: TokenContainer = std::iter::once(token.clone()).collect();
        let op = CopyOp {
            buffer: BufferId(3),
            size: 64,
        };
        let plan = CopyPlan {
            copy_engine: COPY,
            waits: &waits,
            op: &op,
            tokens: &tokens,
            flush: None,
        };

        let without = plan.copy_stream(None).into_cmds();
        assert_eq!(without.iter().filter(|c| c.is_wait()).count(), 2);

        let with = plan.copy_stream(Some((TAG, TaskCount(3)))).into_cmds();
        assert_eq!(
            with,
            vec![
                SyncCmd::wait_at_least(TAG, 3),
                SyncCmd::wait_equal(copy_dep.address(), TOKEN_SIGNALED),
                SyncCmd::Copy {
                    buffer: BufferId(3),
                    direction: CopyDirection::Plain,
                    size: 64
                },
                SyncCmd::CompletionWrite {
                    address: token.address(),
                    value: TOKEN_SIGNALED
                },
            ]
        );

        let compute = plan.compute_stream().into_cmds();
        assert_eq!(compute, vec![SyncCmd::wait_equal(copy_dep.address(), TOKEN_SIGNALED)]);
    }
}
