//! Process-wide engine state and the thread registry.
//!
//! ```text
//!   Vm
//!   ├── shared: Arc<VmShared>      config, classes, code, OSR fallback, stats
//!   ├── threads: [Arc<Mutex<VmThread>>]
//!   └── exclusive                  held by a WorldStop
//! ```
//!
//! Operations that touch one thread take `&VmShared` plus `&mut VmThread`.
//! Operations that sweep every stack run through a [`WorldStop`], which owns
//! the lock of every registered thread for its lifetime.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::{ArcMutexGuard, Mutex, MutexGuard, RawMutex, RwLock};

use revert_core::DecompConfig;

use crate::alloc::{GlobalOsrBuffer, MemoryAllocator, SystemAllocator};
use crate::class::ClassTable;
use crate::code_cache::CodeCache;
use crate::decomp::breakpoint::BreakpointRegistry;
use crate::decomp::stats::DecompStats;
use crate::thread::{ThreadId, VmThread};

// =============================================================================
// Shared State
// =============================================================================

/// State shared by every thread.
///
/// Lock order: `breakpoints` before `classes`.
pub struct VmShared {
    /// Engine configuration.
    pub config: DecompConfig,
    /// Loaded classes and method run state.
    pub classes: RwLock<ClassTable>,
    /// Compiled bodies.
    pub code_cache: CodeCache,
    /// Allocator for OSR buffers.
    pub allocator: Arc<dyn MemoryAllocator>,
    /// Fallback OSR buffer.
    pub global_osr: GlobalOsrBuffer,
    /// Debugger breakpoint state.
    pub breakpoints: Mutex<BreakpointRegistry>,
    /// Counters.
    pub stats: DecompStats,
}

impl VmShared {
    /// Shared state backed by the system allocator.
    pub fn new(config: DecompConfig) -> Self {
        Self::with_allocator(config, Arc::new(SystemAllocator))
    }

    /// Shared state backed by `allocator`.
    pub fn with_allocator(config: DecompConfig, allocator: Arc<dyn MemoryAllocator>) -> Self {
        let global_osr = GlobalOsrBuffer::new(&*allocator, config.initial_global_osr_buffer_words);
        if global_osr.words() < config.initial_global_osr_buffer_words {
            log::warn!(
                "global OSR buffer unavailable, wanted {} words",
                config.initial_global_osr_buffer_words
            );
        }
        Self {
            config,
            classes: RwLock::new(ClassTable::new()),
            code_cache: CodeCache::new(),
            allocator,
            global_osr,
            breakpoints: Mutex::new(BreakpointRegistry::new()),
            stats: DecompStats::new(),
        }
    }
}

impl fmt::Debug for VmShared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VmShared")
            .field("config", &self.config)
            .field("code_cache", &self.code_cache.len())
            .field("global_osr_words", &self.global_osr.words())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Vm
// =============================================================================

/// The engine with its registered threads.
#[derive(Debug)]
pub struct Vm {
    shared: Arc<VmShared>,
    threads: RwLock<Vec<Arc<Mutex<VmThread>>>>,
    exclusive: Mutex<()>,
    next_thread: AtomicU32,
}

impl Vm {
    /// Engine with no threads.
    pub fn new(config: DecompConfig) -> Self {
        Self::from_shared(Arc::new(VmShared::new(config)))
    }

    /// Engine around existing shared state.
    pub fn from_shared(shared: Arc<VmShared>) -> Self {
        Self {
            shared,
            threads: RwLock::new(Vec::new()),
            exclusive: Mutex::new(()),
            next_thread: AtomicU32::new(1),
        }
    }

    /// Shared state.
    #[inline]
    pub fn shared(&self) -> &Arc<VmShared> {
        &self.shared
    }

    /// Register a new thread with an empty stack.
    pub fn spawn_thread(&self) -> Arc<Mutex<VmThread>> {
        let id = ThreadId(self.next_thread.fetch_add(1, Ordering::Relaxed));
        let thread = Arc::new(Mutex::new(VmThread::new(id, &self.shared.config)));
        self.threads.write().push(Arc::clone(&thread));
        log::trace!("{id} registered");
        thread
    }

    /// Registered threads.
    pub fn threads(&self) -> Vec<Arc<Mutex<VmThread>>> {
        self.threads.read().clone()
    }

    /// Stop every registered thread.
    ///
    /// Blocks until every thread lock is free. Callers must not hold a
    /// thread lock themselves.
    pub fn stop_the_world(&self) -> WorldStop<'_> {
        let exclusive = self.exclusive.lock();
        let threads = self
            .threads
            .read()
            .iter()
            .map(|thread| thread.lock_arc())
            .collect::<Vec<_>>();
        log::trace!("world stopped, {} thread(s)", threads.len());
        WorldStop {
            shared: &self.shared,
            _exclusive: exclusive,
            threads,
        }
    }
}

// =============================================================================
// World Stop
// =============================================================================

/// Exclusive access to every registered thread.
pub struct WorldStop<'a> {
    shared: &'a VmShared,
    _exclusive: MutexGuard<'a, ()>,
    threads: Vec<ArcMutexGuard<RawMutex, VmThread>>,
}

impl<'a> WorldStop<'a> {
    /// Shared state.
    #[inline]
    pub fn shared(&self) -> &'a VmShared {
        self.shared
    }

    /// Every stopped thread.
    pub fn threads_mut(&mut self) -> impl Iterator<Item = &mut VmThread> {
        self.threads.iter_mut().map(|guard| &mut **guard)
    }

    /// A stopped thread by id.
    pub fn thread_mut(&mut self, id: ThreadId) -> Option<&mut VmThread> {
        self.threads_mut().find(|thread| thread.id == id)
    }
}

impl fmt::Debug for WorldStop<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorldStop")
            .field("threads", &self.threads.len())
            .finish_non_exhaustive()
    }
}
