//! Thread stack arena and fixed frame layouts.
//!
//! Each thread owns a word arena that grows toward lower indices. The
//! interpreter and compiled code share it, so decompilation can replace a
//! compiled frame in place by writing interpreter frames over the same slots.
//!
//! # Layouts
//!
//! ```text
//!   higher indices
//!   ┌──────────────────────┐
//!   │ local 0 / arg 0      │ ◀── a0
//!   │ ...                  │
//!   │ local L-1            │
//!   ├──────────────────────┤
//!   │ saved a0 (tagged)    │ ◀── frame tags live here
//!   │ saved literals       │
//!   │ saved pc             │
//!   ├──────────────────────┤
//!   │ operand 0            │
//!   │ ...                  │ ◀── sp
//!   └──────────────────────┘
//!   lower indices
//! ```
//!
//! A J2I frame replaces the three-word bytecode header when the caller of a
//! rebuilt frame is compiled code; see [`J2iFrameLayout`].

use std::ops::Range;

use revert_core::{FrameTag, SlotIndex, SlotRef, Word};

// =============================================================================
// Stack Arena
// =============================================================================

/// A thread's stack of words.
#[derive(Clone)]
pub struct StackArena {
    slots: Box<[Word]>,
}

impl StackArena {
    /// Create a zeroed arena of `slots` words.
    pub fn new(slots: usize) -> Self {
        Self {
            slots: vec![0; slots].into_boxed_slice(),
        }
    }

    /// Number of slots. An empty stack has `sp == len()`.
    #[inline]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the arena has no slots at all.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Read one slot.
    #[inline]
    pub fn read(&self, index: SlotIndex) -> Word {
        self.check(index..index + 1);
        self.slots[index]
    }

    /// Write one slot.
    #[inline]
    pub fn write(&mut self, index: SlotIndex, value: Word) {
        self.check(index..index + 1);
        self.slots[index] = value;
    }

    /// Borrow a range of slots.
    #[inline]
    pub fn slice(&self, range: Range<SlotIndex>) -> &[Word] {
        self.check(range.clone());
        &self.slots[range]
    }

    /// Copy `values` into the slots starting at `start`.
    #[inline]
    pub fn write_slice(&mut self, start: SlotIndex, values: &[Word]) {
        let range = start..start + values.len();
        self.check(range.clone());
        self.slots[range].copy_from_slice(values);
    }

    /// Overlapping-safe move of `src` to `dest`.
    #[inline]
    pub fn copy_within(&mut self, src: Range<SlotIndex>, dest: SlotIndex) {
        self.check(src.clone());
        self.check(dest..dest + src.len());
        self.slots.copy_within(src, dest);
    }

    /// Fill a range with `value`.
    #[inline]
    pub fn fill(&mut self, range: Range<SlotIndex>, value: Word) {
        self.check(range.clone());
        self.slots[range].fill(value);
    }

    /// OR frame tags into the low bits of a slot.
    #[inline]
    pub fn tag(&mut self, index: SlotIndex, tags: FrameTag) {
        let word = self.read(index);
        self.write(index, word | tags.bits());
    }

    /// Decode a slot holding a [`SlotRef`].
    #[inline]
    pub fn read_ref(&self, index: SlotIndex) -> Option<SlotRef> {
        SlotRef::decode(self.read(index))
    }

    #[inline]
    fn check(&self, range: Range<SlotIndex>) {
        assert!(
            range.start <= range.end && range.end <= self.slots.len(),
            "stack access {range:?} outside arena of {} slots",
            self.slots.len()
        );
    }
}

impl std::fmt::Debug for StackArena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StackArena")
            .field("slots", &self.slots.len())
            .finish()
    }
}

// =============================================================================
// Bytecode Frame Header
// =============================================================================

/// Words in an interpreter frame header.
pub const BYTECODE_FRAME_SLOTS: usize = 3;

/// The three-word header between an interpreter frame's locals and its
/// operand stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BytecodeFrameHeader {
    base: SlotIndex,
}

impl BytecodeFrameHeader {
    /// Header whose lowest word is at `base`.
    #[inline]
    pub const fn from_base(base: SlotIndex) -> Self {
        Self { base }
    }

    /// Header of the frame with argument pointer `a0` and `locals` locals.
    #[inline]
    pub const fn for_frame(a0: SlotIndex, locals: usize) -> Self {
        Self {
            base: a0 + 1 - locals - BYTECODE_FRAME_SLOTS,
        }
    }

    /// Lowest header word.
    #[inline]
    pub const fn base(self) -> SlotIndex {
        self.base
    }

    /// Caller's bytecode PC.
    #[inline]
    pub const fn saved_pc(self) -> SlotIndex {
        self.base
    }

    /// Caller's literals (method id).
    #[inline]
    pub const fn saved_literals(self) -> SlotIndex {
        self.base + 1
    }

    /// Caller's `a0`, tagged with [`FrameTag`]s for this frame.
    #[inline]
    pub const fn saved_a0(self) -> SlotIndex {
        self.base + 2
    }

    /// Slot of operand 0.
    #[inline]
    pub const fn operand_base(self) -> SlotIndex {
        self.base - 1
    }

    /// Write all three words.
    pub fn write(self, stack: &mut StackArena, pc: Word, literals: Word, a0: Word) {
        stack.write(self.saved_pc(), pc);
        stack.write(self.saved_literals(), literals);
        stack.write(self.saved_a0(), a0);
    }
}

// =============================================================================
// J2I Frame
// =============================================================================

/// Callee-preserved registers saved in a J2I frame.
pub const CALLEE_PRESERVED_COUNT: usize = 4;

/// Register values preserved across a compiled call.
pub type RegisterMap = [Word; CALLEE_PRESERVED_COUNT];

/// Special-frame flags identifying a J2I transition frame.
pub const J2I_SPECIAL_FLAGS: Word = 0x0003_0000;

/// Layout of a JIT-to-interpreter transition frame.
///
/// ```text
///   frame pointer ──▶ ┌──────────────────────┐  highest
///                     │ tagged return sp     │
///                     │ return address       │
///                     │ previous J2I frame   │
///                     │ i2j pc               │
///                     │ i2j literals         │
///                     │ i2j a0               │
///                     │ i2j return sp        │
///                     │ special flags        │
///                     │ exit point           │
///                     │ preserved[N-1..0]    │
///   base ───────────▶ └──────────────────────┘  lowest
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct J2iFrameLayout {
    base: SlotIndex,
}

impl J2iFrameLayout {
    /// Words in a J2I frame.
    pub const SLOTS: usize = CALLEE_PRESERVED_COUNT + 9;

    /// Frame whose lowest word is at `base`.
    #[inline]
    pub const fn from_base(base: SlotIndex) -> Self {
        Self { base }
    }

    /// Frame whose tagged-return-sp word is at `frame_pointer`.
    #[inline]
    pub const fn from_frame_pointer(frame_pointer: SlotIndex) -> Self {
        Self {
            base: frame_pointer + 1 - Self::SLOTS,
        }
    }

    /// Lowest word.
    #[inline]
    pub const fn base(self) -> SlotIndex {
        self.base
    }

    /// The slot the thread's J2I register points at.
    #[inline]
    pub const fn frame_pointer(self) -> SlotIndex {
        self.base + Self::SLOTS - 1
    }

    /// Preserved register `index`.
    #[inline]
    pub const fn preserved(self, index: usize) -> SlotIndex {
        self.base + index
    }

    #[inline]
    const fn field(self, offset: usize) -> SlotIndex {
        self.base + CALLEE_PRESERVED_COUNT + offset
    }

    /// Exit-point address used when the interpreter returns.
    #[inline]
    pub const fn exit_point(self) -> SlotIndex {
        self.field(0)
    }

    /// Special-frame flags.
    #[inline]
    pub const fn special_flags(self) -> SlotIndex {
        self.field(1)
    }

    /// Saved I2J return sp.
    #[inline]
    pub const fn i2j_return_sp(self) -> SlotIndex {
        self.field(2)
    }

    /// Saved I2J `a0`.
    #[inline]
    pub const fn i2j_a0(self) -> SlotIndex {
        self.field(3)
    }

    /// Saved I2J literals.
    #[inline]
    pub const fn i2j_literals(self) -> SlotIndex {
        self.field(4)
    }

    /// Saved I2J pc.
    #[inline]
    pub const fn i2j_pc(self) -> SlotIndex {
        self.field(5)
    }

    /// Link to the next older J2I frame.
    #[inline]
    pub const fn previous_j2i(self) -> SlotIndex {
        self.field(6)
    }

    /// Compiled return address.
    #[inline]
    pub const fn return_address(self) -> SlotIndex {
        self.field(7)
    }

    /// Tagged return sp, encoding the top of the interpreter frame's temps.
    #[inline]
    pub const fn tagged_return_sp(self) -> SlotIndex {
        self.field(8)
    }
}

// =============================================================================
// I2J State
// =============================================================================

/// Interpreter state saved when the interpreter called into compiled code.
///
/// All four words are raw: the return sp and `a0` are [`SlotRef`] words, the
/// pc is a [`revert_core::BytecodePc`] word and literals is a method word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct I2jState {
    /// Interpreter sp at the moment of the call, after pushing arguments.
    pub return_sp: Word,
    /// Caller's `a0`.
    pub a0: Word,
    /// Caller's literals.
    pub literals: Word,
    /// Caller's pc.
    pub pc: Word,
}

impl I2jState {
    /// Copy the four words into a J2I frame.
    pub fn write_to(&self, stack: &mut StackArena, layout: J2iFrameLayout) {
        stack.write(layout.i2j_return_sp(), self.return_sp);
        stack.write(layout.i2j_a0(), self.a0);
        stack.write(layout.i2j_literals(), self.literals);
        stack.write(layout.i2j_pc(), self.pc);
    }

    /// Read the four words back out of a J2I frame.
    pub fn read_from(stack: &StackArena, layout: J2iFrameLayout) -> Self {
        Self {
            return_sp: stack.read(layout.i2j_return_sp()),
            a0: stack.read(layout.i2j_a0()),
            literals: stack.read(layout.i2j_literals()),
            pc: stack.read(layout.i2j_pc()),
        }
    }
}

// =============================================================================
// Resolve Frame
// =============================================================================

/// Words in a resolve frame.
pub const RESOLVE_FRAME_SLOTS: usize = 2;
