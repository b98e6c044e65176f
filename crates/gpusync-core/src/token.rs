//! Completion tokens, the pool they are recycled through, and ordered token containers.
//!
//! A token is one hardware-writable slot. A consumer waits for it with a
//! `SemaphoreWait { address, TOKEN_SIGNALED, Equal }`; its producer signals it with a
//! `CompletionWrite { address, TOKEN_SIGNALED }` once the tracked work retires.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::{Result, SyncError};
use crate::memory::{lock, SyncMemory};
use crate::types::EngineId;

/// Value a slot holds between acquisition and the producer's write.
pub const TOKEN_PENDING: u64 = 1;
/// Value the producer writes on completion.
pub const TOKEN_SIGNALED: u64 = 0;

struct PoolShared {
    memory: Arc<SyncMemory>,
    base: u64,
    free: Mutex<Vec<u32>>,
    in_use: AtomicUsize,
    capacity: usize,
}

struct TokenSlot {
    pool: Arc<PoolShared>,
    index: u32,
    address: u64,
    producer: EngineId,
}

impl Drop for TokenSlot {
    fn drop(&mut self) {
        lock(&self.pool.free).push(self.index);
        self.pool.in_use.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Reference-counted handle to one token slot. The slot returns to its pool when the last clone
/// is dropped.
#[derive(Clone)]
pub struct CompletionToken(Arc<TokenSlot>);

impl CompletionToken {
    pub fn address(&self) -> u64 {
        self.0.address
    }

    /// Engine whose work signals this token.
    pub fn producer(&self) -> EngineId {
        self.0.producer
    }

    pub fn is_signaled(&self) -> bool {
        self.0.pool.memory.read(self.0.address) == TOKEN_SIGNALED
    }

    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }

    pub fn same_slot(&self, other: &CompletionToken) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for CompletionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionToken")
            .field("address", &format_args!("{:#x}", self.0.address))
            .field("producer", &self.0.producer)
            .field("signaled", &self.is_signaled())
            .finish()
    }
}

/// Source of fresh tokens.
pub trait TokenAllocator: Send + Sync {
    fn acquire(&self, producer: EngineId) -> Result<CompletionToken>;

    fn available(&self) -> usize;
}

/// Fixed-capacity token pool backed by a contiguous region of [`SyncMemory`].
#[derive(Clone)]
pub struct TokenPool {
    shared: Arc<PoolShared>,
}

impl TokenPool {
    pub fn new(memory: Arc<SyncMemory>, capacity: usize) -> Result<Self> {
        let base = memory.allocate(capacity)?;
        let capacity_u32 = u32::try_from(capacity)
            .map_err(|_| SyncError::InvalidOperation("token pool too large".to_string()))?;
        // Hand out low indices first.
        let free = (0..capacity_u32).rev().collect();
        Ok(Self {
            shared: Arc::new(PoolShared {
                memory,
                base,
                free: Mutex::new(free),
                in_use: AtomicUsize::new(0),
                capacity,
            }),
        })
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    pub fn in_use(&self) -> usize {
        self.shared.in_use.load(Ordering::Acquire)
    }
}

impl TokenAllocator for TokenPool {
    fn acquire(&self, producer: EngineId) -> Result<CompletionToken> {
        let index = lock(&self.shared.free).pop().ok_or_else(|| {
            SyncError::ResourceExhausted(format!(
                "token pool exhausted ({} tokens in use)",
                self.shared.capacity
            ))
        })?;
        self.shared.in_use.fetch_add(1, Ordering::AcqRel);

        let address = self.shared.base + u64::from(index) * 8;
        self.shared.memory.write(address, TOKEN_PENDING);
        Ok(CompletionToken(Arc::new(TokenSlot {
            pool: self.shared.clone(),
            index,
            address,
            producer,
        })))
    }

    fn available(&self) -> usize {
        lock(&self.shared.free).len()
    }
}

impl fmt::Debug for TokenPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenPool")
            .field("capacity", &self.shared.capacity)
            .field("in_use", &self.in_use())
            .finish()
    }
}

/// What happens to the superseded contents when a container gets a new dependency set.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DependencyMode {
    /// Drop every previous token; later work carries no waits on them.
    Clear,
    /// Keep every previous token that has not signaled yet.
    CarryForward,
}

/// Ordered set of token references. Order is the order consumers emit their waits in.
#[derive(Clone, Default)]
pub struct TokenContainer {
    nodes: Vec<CompletionToken>,
}

impl TokenContainer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire `count` tokens produced by `producer`. Either all are acquired or none are.
    pub fn acquire(
        allocator: &dyn TokenAllocator,
        producer: EngineId,
        count: usize,
    ) -> Result<Self> {
        let mut nodes = Vec::with_capacity(count);
        for _ in 0..count {
            nodes.push(allocator.acquire(producer)?);
        }
        Ok(Self { nodes })
    }

    pub fn add(&mut self, token: CompletionToken) {
        self.nodes.push(token);
    }

    pub fn peek_nodes(&self) -> &[CompletionToken] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Append a new reference to every token of `other`.
    pub fn assign_and_increment(&mut self, other: &TokenContainer) {
        self.nodes.extend(other.nodes.iter().cloned());
    }

    /// Move every token into `target`, leaving `self` empty.
    pub fn move_nodes_to(&mut self, target: &mut TokenContainer) {
        target.nodes.append(&mut self.nodes);
    }

    pub fn swap_nodes(&mut self, other: &mut TokenContainer) {
        std::mem::swap(&mut self.nodes, &mut other.nodes);
    }

    /// Drop signaled tokens, or every token when `clear_all` is set.
    pub fn resolve_dependencies(&mut self, clear_all: bool) {
        if clear_all {
            self.nodes.clear();
        } else {
            self.nodes.retain(|t| !t.is_signaled());
        }
    }

    /// Install `fresh` as the current dependency set and return the superseded one, filtered
    /// according to `mode`.
    pub fn replace(&mut self, mut fresh: TokenContainer, mode: DependencyMode) -> TokenContainer {
        self.swap_nodes(&mut fresh);
        fresh.resolve_dependencies(mode == DependencyMode::Clear);
        fresh
    }

    /// Acquire `count` fresh tokens and install them, returning the superseded set.
    ///
    /// On allocation failure `self` is left untouched.
    pub fn obtain(
        &mut self,
        allocator: &dyn TokenAllocator,
        producer: EngineId,
        count: usize,
        mode: DependencyMode,
    ) -> Result<TokenContainer> {
        let fresh = Self::acquire(allocator, producer, count)?;
        Ok(self.replace(fresh, mode))
    }

    /// Tokens that a consumer running on `consumer` must wait on explicitly: unsignaled tokens
    /// produced by a different engine. Work produced on the same engine is ordered by the ring.
    pub fn pending_from_other_engines(
        &self,
        consumer: EngineId,
    ) -> impl Iterator<Item = &CompletionToken> + '_ {
        self.nodes
            .iter()
            .filter(move |t| t.producer() != consumer && !t.is_signaled())
    }
}

impl fmt::Debug for TokenContainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.nodes.iter()).finish()
    }
}

impl FromIterator<CompletionToken> for TokenContainer {
    fn from_iter<I: IntoIterator<Item = CompletionToken>>(iter: I) -> Self {
        Self {
            nodes: iter.into_iter().collect(),
        }
    }
}
