//! Buffer allocation.
//!
//! Capture needs word blocks for OSR buffers. They come from a
//! [`MemoryAllocator`] first; when that fails, a capture may borrow the
//! process-wide [`GlobalOsrBuffer`] under its lock instead.
//!
//! ```text
//!   allocate(words) ──ok──▶ BufferStorage::Owned
//!        │
//!        └─fail──▶ GlobalOsrBuffer lock ──▶ BufferStorage::Shared
//! ```

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::{ArcMutexGuard, Mutex, RawMutex};
use revert_core::Word;

// =============================================================================
// Allocators
// =============================================================================

/// Source of zeroed word blocks.
pub trait MemoryAllocator: Send + Sync + fmt::Debug {
    /// Allocate `words` zeroed words.
    fn allocate(&self, words: usize) -> Option<Box<[Word]>>;

    /// Release a block.
    fn free(&self, block: Box<[Word]>) {
        drop(block);
    }

    /// Replace `block` with a zeroed block of `words` words.
    ///
    /// On failure the original block is handed back untouched.
    fn reallocate(&self, block: Box<[Word]>, words: usize) -> Result<Box<[Word]>, Box<[Word]>> {
        match self.allocate(words) {
            Some(new) => {
                self.free(block);
                Ok(new)
            }
            None => Err(block),
        }
    }
}

/// Allocator backed by the global heap that reports failure instead of aborting.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemAllocator;

impl MemoryAllocator for SystemAllocator {
    fn allocate(&self, words: usize) -> Option<Box<[Word]>> {
        let mut block = Vec::new();
        block.try_reserve_exact(words).ok()?;
        block.resize(words, 0);
        Some(block.into_boxed_slice())
    }
}

/// Allocator that succeeds a fixed number of times, then fails.
#[derive(Debug)]
pub struct LimitedAllocator {
    remaining: AtomicUsize,
}

impl LimitedAllocator {
    /// Allow `allocations` successful allocations.
    pub fn new(allocations: usize) -> Self {
        Self {
            remaining: AtomicUsize::new(allocations),
        }
    }

    /// Reset the number of allowed allocations.
    pub fn set_remaining(&self, allocations: usize) {
        self.remaining.store(allocations, Ordering::Relaxed);
    }

    /// Allocations left before failure.
    pub fn remaining(&self) -> usize {
        self.remaining.load(Ordering::Relaxed)
    }
}

impl MemoryAllocator for LimitedAllocator {
    fn allocate(&self, words: usize) -> Option<Box<[Word]>> {
        self.remaining
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
            .ok()?;
        SystemAllocator.allocate(words)
    }
}

// =============================================================================
// Global OSR Buffer
// =============================================================================

/// A locked view of the global buffer.
pub type SharedBlock = ArcMutexGuard<RawMutex, Box<[Word]>>;

/// Process-wide fallback buffer for captures whose own allocation failed.
///
/// Only one capture can use it at a time; the lock is held until the record
/// that borrowed it is freed.
#[derive(Debug)]
pub struct GlobalOsrBuffer {
    block: Arc<Mutex<Box<[Word]>>>,
    words: AtomicUsize,
}

impl GlobalOsrBuffer {
    /// Create the buffer with an initial size. A failed allocation leaves it empty.
    pub fn new(allocator: &dyn MemoryAllocator, words: usize) -> Self {
        let block = allocator.allocate(words).unwrap_or_default();
        let words = block.len();
        Self {
            block: Arc::new(Mutex::new(block)),
            words: AtomicUsize::new(words),
        }
    }

    /// Current size in words.
    #[inline]
    pub fn words(&self) -> usize {
        self.words.load(Ordering::Acquire)
    }

    /// Grow the buffer so it can hold a capture needing `required` words.
    ///
    /// Returns false if growing failed; the old buffer is kept in that case.
    pub fn ensure_size(&self, allocator: &dyn MemoryAllocator, required: usize) -> bool {
        if self.words() >= required {
            return true;
        }
        let mut block = self.block.lock();
        if block.len() >= required {
            return true;
        }
        let old = std::mem::take(&mut *block);
        match allocator.reallocate(old, required) {
            Ok(new) => {
                log::debug!("global OSR buffer grown to {required} words");
                *block = new;
                self.words.store(required, Ordering::Release);
                true
            }
            Err(old) => {
                *block = old;
                false
            }
        }
    }

    /// Lock the buffer, blocking until it is free.
    pub fn lock(&self) -> SharedBlock {
        self.block.lock_arc()
    }

    /// Lock the buffer if nobody holds it.
    pub fn try_lock(&self) -> Option<SharedBlock> {
        self.block.try_lock_arc()
    }
}

// =============================================================================
// Buffer Storage
// =============================================================================

/// Backing memory of an OSR buffer.
pub enum BufferStorage {
    /// A block owned by the record.
    Owned(Box<[Word]>),
    /// The global buffer, locked for the record's lifetime.
    Shared(SharedBlock),
}

impl BufferStorage {
    /// All words of the backing block.
    #[inline]
    pub fn words(&self) -> &[Word] {
        match self {
            Self::Owned(block) => &block[..],
            Self::Shared(guard) => &guard[..],
        }
    }

    /// All words of the backing block, mutably.
    #[inline]
    pub fn words_mut(&mut self) -> &mut [Word] {
        match self {
            Self::Owned(block) => &mut block[..],
            Self::Shared(guard) => &mut guard[..],
        }
    }

    /// Whether this storage borrows the global buffer.
    #[inline]
    pub fn is_shared(&self) -> bool {
        matches!(self, Self::Shared(_))
    }
}

impl fmt::Debug for BufferStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.is_shared() { "Shared" } else { "Owned" };
        f.debug_struct("BufferStorage")
            .field("kind", &kind)
            .field("words", &self.words().len())
            .finish()
    }
}
