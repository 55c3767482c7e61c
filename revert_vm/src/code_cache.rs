//! Compiled code bodies.
//!
//! A [`CompiledMethod`] carries the frame-shape constants of one compiled
//! body, its metadata, and the OSR trampoline that knows where each live
//! value sits in a compiled frame.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use revert_core::{CodeId, DecompError, DecompResult, Method, Word};

use crate::decomp::osr::OsrFramesMut;
use crate::metadata::FrameMetadataOracle;

// =============================================================================
// OSR Trampoline
// =============================================================================

/// Result of a successful trampoline fill.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OsrOutcome {
    /// The compiled frame may still be resumed.
    Resumable,
    /// The fill invalidated the compiled frame; it must be decompiled.
    Destructive,
}

/// Inputs and output of one trampoline call.
pub struct OsrFill<'a> {
    /// Compiled PC being captured.
    pub jit_pc: Word,
    /// Copy of the compiled frame, from its unwind sp through argument 0.
    pub frame_copy: &'a [Word],
    /// Scratch space sized by [`FrameMetadataOracle::osr_scratch_words`].
    pub scratch: &'a mut [Word],
    /// Frames to fill, with headers already initialized.
    pub frames: OsrFramesMut<'a>,
}

/// JIT-provided routine that moves live values from a compiled frame into
/// an OSR buffer.
pub trait OsrTrampoline: Send + Sync + fmt::Debug {
    /// Fill locals and operands of every frame in `fill.frames`.
    fn fill(&self, fill: &mut OsrFill<'_>) -> DecompResult<OsrOutcome>;
}

/// Where a transferred value lands in an OSR frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OsrSlot {
    /// Local variable number.
    Local(usize),
    /// Operand-stack slot, counting from the bottom.
    Operand(usize),
}

/// Move one word from the frame copy into an OSR frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotTransfer {
    /// Target frame; 0 is the outermost method.
    pub inline_depth: usize,
    /// Offset into the frame copy.
    pub source: usize,
    /// Target slot.
    pub target: OsrSlot,
}

#[derive(Debug, Clone, Default)]
struct TransferTable {
    transfers: Vec<SlotTransfer>,
    destructive: bool,
}

/// Trampoline driven by per-PC transfer tables.
#[derive(Debug, Clone, Default)]
pub struct TableTrampoline {
    sites: FxHashMap<Word, TransferTable>,
}

impl TableTrampoline {
    /// Empty trampoline.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the transfers for `jit_pc`.
    pub fn with_site(mut self, jit_pc: Word, transfers: Vec<SlotTransfer>) -> Self {
        self.sites.insert(
            jit_pc,
            TransferTable {
                transfers,
                destructive: false,
            },
        );
        self
    }

    /// Record transfers for `jit_pc` whose fill invalidates the compiled frame.
    pub fn with_destructive_site(mut self, jit_pc: Word, transfers: Vec<SlotTransfer>) -> Self {
        self.sites.insert(
            jit_pc,
            TransferTable {
                transfers,
                destructive: true,
            },
        );
        self
    }
}

impl OsrTrampoline for TableTrampoline {
    fn fill(&self, fill: &mut OsrFill<'_>) -> DecompResult<OsrOutcome> {
        let table = self
            .sites
            .get(&fill.jit_pc)
            .ok_or(DecompError::MissingMaps { pc: fill.jit_pc })?;

        for transfer in &table.transfers {
            let value = fill.frame_copy[transfer.source];
            let mut frame = fill.frames.frame_at_inline_depth_mut(transfer.inline_depth);
            match transfer.target {
                OsrSlot::Local(slot) => frame.set_local(slot, value),
                OsrSlot::Operand(index) => frame.set_operand(index, value),
            }
        }

        Ok(if table.destructive {
            OsrOutcome::Destructive
        } else {
            OsrOutcome::Resumable
        })
    }
}

// =============================================================================
// Compiled Method
// =============================================================================

/// One compiled body.
///
/// ```text
///   a0 ─────▶ ┌──────────────────┐
///             │ args             │
///   bp ─────▶ ├──────────────────┤
///             │ return address   │
///             ├──────────────────┤ ◀── bp + local_base_offset + temp_offset
///             │ temps, pending   │      (temp base, grows upward)
///             │ ...              │
///             └──────────────────┘ ◀── bp - total_frame_size (unwind sp)
/// ```
pub struct CompiledMethod {
    /// Code cache identity.
    pub id: CodeId,
    /// Outermost method.
    pub method: Arc<Method>,
    /// Slots between the return address and the unwind sp.
    pub total_frame_size: usize,
    /// Offset from bp to the local area.
    pub local_base_offset: isize,
    /// Offset from the local area to the first temp.
    pub temp_offset: isize,
    /// Whether this body was compiled with OSR support.
    pub uses_osr: bool,
    /// Per-PC maps.
    pub metadata: Arc<dyn FrameMetadataOracle>,
    /// OSR fill routine, present when `uses_osr` is set.
    pub trampoline: Option<Arc<dyn OsrTrampoline>>,
    invalidated: AtomicBool,
    entry_patched: AtomicBool,
}

impl CompiledMethod {
    /// A legacy body: temps packed directly below the return address.
    pub fn new(
        id: CodeId,
        method: Arc<Method>,
        total_frame_size: usize,
        metadata: Arc<dyn FrameMetadataOracle>,
    ) -> Self {
        let temps = method.frame_locals() - method.arg_count as usize;
        Self {
            id,
            method,
            total_frame_size,
            local_base_offset: -(temps as isize),
            temp_offset: 0,
            uses_osr: false,
            metadata,
            trampoline: None,
            invalidated: AtomicBool::new(false),
            entry_patched: AtomicBool::new(false),
        }
    }

    /// Mark the body OSR-capable with the given trampoline.
    pub fn with_osr(mut self, trampoline: Arc<dyn OsrTrampoline>) -> Self {
        self.uses_osr = true;
        self.trampoline = Some(trampoline);
        self
    }

    /// Override where temps live relative to bp.
    pub fn with_local_layout(mut self, local_base_offset: isize, temp_offset: isize) -> Self {
        self.local_base_offset = local_base_offset;
        self.temp_offset = temp_offset;
        self
    }

    /// Offset from bp of temp slot 0, which holds the highest-numbered local.
    #[inline]
    pub fn temp_base_offset(&self) -> isize {
        self.local_base_offset + self.temp_offset
    }

    /// Mark the body unusable for new invocations.
    pub fn invalidate(&self) {
        self.invalidated.store(true, Ordering::Release);
    }

    /// Whether the body was invalidated.
    #[inline]
    pub fn is_invalidated(&self) -> bool {
        self.invalidated.load(Ordering::Acquire)
    }

    /// Redirect the entry point to the interpreter.
    pub fn patch_entry_to_interpreter(&self) {
        self.entry_patched.store(true, Ordering::Release);
    }

    /// Undo [`CompiledMethod::patch_entry_to_interpreter`].
    pub fn restore_entry(&self) {
        self.entry_patched.store(false, Ordering::Release);
    }

    /// Whether the entry point currently leads to the interpreter.
    #[inline]
    pub fn is_entry_patched(&self) -> bool {
        self.entry_patched.load(Ordering::Acquire)
    }
}

impl fmt::Debug for CompiledMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledMethod")
            .field("id", &self.id)
            .field("method", &self.method.id)
            .field("total_frame_size", &self.total_frame_size)
            .field("uses_osr", &self.uses_osr)
            .field("invalidated", &self.is_invalidated())
            .finish()
    }
}

// =============================================================================
// Code Cache
// =============================================================================

/// Registry of compiled bodies.
#[derive(Debug, Default)]
pub struct CodeCache {
    bodies: RwLock<FxHashMap<CodeId, Arc<CompiledMethod>>>,
}

impl CodeCache {
    /// Empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a body, returning the shared handle.
    pub fn insert(&self, code: CompiledMethod) -> Arc<CompiledMethod> {
        let code = Arc::new(code);
        self.bodies.write().insert(code.id, Arc::clone(&code));
        code
    }

    /// Look up a body.
    pub fn get(&self, id: CodeId) -> DecompResult<Arc<CompiledMethod>> {
        self.bodies
            .read()
            .get(&id)
            .cloned()
            .ok_or(DecompError::UnknownCode(id))
    }

    /// Number of registered bodies.
    pub fn len(&self) -> usize {
        self.bodies.read().len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.bodies.read().is_empty()
    }
}
