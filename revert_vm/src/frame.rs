//! Frame descriptors.
//!
//! The arena holds raw words; [`StackFrame`] records where each frame lives
//! and what kind it is, bottom of the stack first. The walker reads this list
//! together with the arena to produce walked-frame views.

use std::fmt;
use std::sync::Arc;

use revert_core::{MethodId, SlotIndex, Word};

use crate::code_cache::CompiledMethod;
use crate::stack::{BytecodeFrameHeader, I2jState, J2iFrameLayout, RegisterMap};

// =============================================================================
// Resolve Context
// =============================================================================

/// Why compiled code called into the runtime through a resolve frame.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResolveContext {
    /// Stack overflow check in the method prologue.
    StackOverflow = 1,
    /// Entering the method's own monitor.
    MethodMonitorEnter = 2,
    /// Entering the method's own monitor failed and an exception is pending.
    FailedMethodMonitorEnter = 3,
    /// A `monitorenter` instruction.
    MonitorEnter = 4,
    /// An allocation helper.
    Allocation = 5,
    /// Reporting that an exception is about to be caught here.
    ExceptionCatch = 6,
    /// Any other runtime helper.
    Generic = 7,
}

impl ResolveContext {
    /// Convert from a raw discriminant.
    #[inline]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::StackOverflow),
            2 => Some(Self::MethodMonitorEnter),
            3 => Some(Self::FailedMethodMonitorEnter),
            4 => Some(Self::MonitorEnter),
            5 => Some(Self::Allocation),
            6 => Some(Self::ExceptionCatch),
            7 => Some(Self::Generic),
            _ => None,
        }
    }

    /// Encode an optional context into the resolve frame's flags word.
    #[inline]
    pub fn to_word(context: Option<Self>) -> Word {
        context.map_or(0, |c| c as Word)
    }

    /// Decode a resolve frame's flags word.
    #[inline]
    pub fn from_word(word: Word) -> Option<Self> {
        Self::from_u8(word as u8)
    }
}

impl fmt::Display for ResolveContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::StackOverflow => "stack overflow",
            Self::MethodMonitorEnter => "method monitor enter",
            Self::FailedMethodMonitorEnter => "failed method monitor enter",
            Self::MonitorEnter => "monitor enter",
            Self::Allocation => "allocation",
            Self::ExceptionCatch => "exception catch",
            Self::Generic => "generic",
        };
        f.write_str(name)
    }
}

// =============================================================================
// Frame Descriptors
// =============================================================================

/// An interpreter frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BytecodeFrame {
    /// Executing method.
    pub method: MethodId,
    /// Slot of local 0.
    pub a0: SlotIndex,
    /// Number of locals, including any hidden slot.
    pub locals: usize,
}

impl BytecodeFrame {
    /// Slot of local `index`.
    #[inline]
    pub const fn local_slot(&self, index: usize) -> SlotIndex {
        self.a0 - index
    }

    /// The frame's three-word header.
    #[inline]
    pub const fn header(&self) -> BytecodeFrameHeader {
        BytecodeFrameHeader::for_frame(self.a0, self.locals)
    }

    /// Slot of operand `index`, counting from the bottom of the operand stack.
    #[inline]
    pub const fn operand_slot(&self, index: usize) -> SlotIndex {
        self.header().operand_base() - index
    }
}

/// A compiled-code frame.
#[derive(Debug, Clone)]
pub struct CompiledFrame {
    /// Code executing in this frame.
    pub code: Arc<CompiledMethod>,
    /// Slot holding the return address into the caller.
    pub bp: SlotIndex,
    /// Lowest slot in use, including outgoing arguments.
    pub sp: SlotIndex,
    /// Outgoing arguments pushed for a call in progress.
    pub outgoing_args: usize,
    /// Interpreter state from the nearest interpreter-to-compiled call.
    pub i2j: I2jState,
    /// Callee-preserved registers at the current call site.
    pub registers: RegisterMap,
}

impl CompiledFrame {
    /// Slot of argument 0.
    #[inline]
    pub fn a0(&self) -> SlotIndex {
        self.bp + self.code.method.arg_count as usize
    }

    /// Lowest slot of the fixed frame body.
    #[inline]
    pub fn unwind_sp(&self) -> SlotIndex {
        self.bp - self.code.total_frame_size
    }
}

/// A resolve frame built by a runtime helper called from compiled code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolveFrame {
    /// Why the helper was called.
    pub context: Option<ResolveContext>,
    /// Lowest slot (the flags word).
    pub base: SlotIndex,
}

impl ResolveFrame {
    /// Slot holding the compiled return address.
    #[inline]
    pub const fn return_address_slot(&self) -> SlotIndex {
        self.base + 1
    }
}

/// One frame on a thread's stack.
#[derive(Debug, Clone)]
pub enum StackFrame {
    /// Interpreter frame.
    Bytecode(BytecodeFrame),
    /// Compiled frame.
    Compiled(CompiledFrame),
    /// JIT-to-interpreter transition frame.
    J2i(J2iFrameLayout),
    /// Runtime helper frame.
    Resolve(ResolveFrame),
}

impl StackFrame {
    /// Lowest slot occupied by this frame.
    pub fn lowest_slot(&self) -> SlotIndex {
        match self {
            Self::Bytecode(frame) => frame.header().base(),
            Self::Compiled(frame) => frame.sp,
            Self::J2i(layout) => layout.base(),
            Self::Resolve(frame) => frame.base,
        }
    }

    /// Slot this frame stores its caller's resume address in, if any.
    ///
    /// Only frames called from compiled code have one.
    pub fn caller_resume_slot(&self) -> Option<SlotIndex> {
        match self {
            Self::Compiled(frame) => Some(frame.bp),
            Self::J2i(layout) => Some(layout.return_address()),
            Self::Resolve(frame) => Some(frame.return_address_slot()),
            Self::Bytecode(_) => None,
        }
    }

    /// Whether stack inspection reports this frame.
    #[inline]
    pub fn is_visible(&self) -> bool {
        matches!(self, Self::Bytecode(_) | Self::Compiled(_))
    }
}
