//! Shared memory observed by both the CPU and the engines.
//!
//! Completion tags and token slots are 64-bit words carved out of one [`SyncMemory`]. The CPU
//! only ever reads or resets them; engines write them as commands retire.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use crate::error::{Result, SyncError};

/// Base GPU address of slot 0. Non-zero so a zero address is never valid.
pub const SYNC_MEMORY_BASE: u64 = 0x1_0000;

const SLOT_SIZE: u64 = 8;

/// Lock a mutex, recovering the guard if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[derive(Debug)]
pub struct SyncMemory {
    slots: Box<[AtomicU64]>,
    next_free: AtomicUsize,
}

impl SyncMemory {
    pub fn new(slot_count: usize) -> Self {
        Self {
            slots: (0..slot_count).map(|_| AtomicU64::new(0)).collect(),
            next_free: AtomicUsize::new(0),
        }
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Reserve `count` contiguous slots and return the address of the first one.
    pub fn allocate(&self, count: usize) -> Result<u64> {
        let mut current = self.next_free.load(Ordering::Relaxed);
        loop {
            let end = current
                .checked_add(count)
                .filter(|end| *end <= self.slots.len())
                .ok_or_else(|| {
                    SyncError::ResourceExhausted(format!(
                        "sync memory: {count} slots requested, {} free",
                        self.slots.len() - current
                    ))
                })?;
            match self.next_free.compare_exchange_weak(
                current,
                end,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Ok(Self::address_of(current)),
                Err(actual) => current = actual,
            }
        }
    }

    pub fn address_of(index: usize) -> u64 {
        SYNC_MEMORY_BASE + index as u64 * SLOT_SIZE
    }

    fn index_of(&self, address: u64) -> Option<usize> {
        let offset = address.checked_sub(SYNC_MEMORY_BASE)?;
        if offset % SLOT_SIZE != 0 {
            return None;
        }
        let index = usize::try_from(offset / SLOT_SIZE).ok()?;
        (index < self.slots.len()).then_some(index)
    }

    pub fn try_read(&self, address: u64) -> Option<u64> {
        self.index_of(address)
            .map(|i| self.slots[i].load(Ordering::Acquire))
    }

    pub fn try_write(&self, address: u64, value: u64) -> Option<()> {
        self.index_of(address)
            .map(|i| self.slots[i].store(value, Ordering::Release))
    }

    /// Read a slot the caller obtained from [`SyncMemory::allocate`].
    ///
    /// # Panics
    ///
    /// Panics if `address` does not name a slot of this memory.
    pub fn read(&self, address: u64) -> u64 {
        match self.try_read(address) {
            Some(v) => v,
            None => panic!("read of unmapped sync address {address:#x}"),
        }
    }

    /// # Panics
    ///
    /// Panics if `address` does not name a slot of this memory.
    pub fn write(&self, address: u64, value: u64) {
        if self.try_write(address, value).is_none() {
            panic!("write to unmapped sync address {address:#x}");
        }
    }
}
