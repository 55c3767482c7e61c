//! Machine-word values and tagged stack references.
//!
//! Every slot of a thread stack is one [`Word`]. Frame pointers that are
//! themselves stored on the stack (saved `a0`, J2I chain links, tagged return
//! SPs) are encoded as [`SlotRef`] words so that the low bits can carry
//! interpreter-visible frame tags.
//!
//! ```text
//!  63                                 2   1   0
//! ┌─────────────────────────────────────┬───┬───┐
//! │           slot index + 1            │ I │ P │   P = REPORT_FRAME_POP
//! └─────────────────────────────────────┴───┴───┘   I = INVISIBLE
//! ```
//!
//! A word whose index part is zero is the null reference.

use std::fmt;
use std::num::NonZeroU64;

use crate::method::MethodId;

/// One machine word (one stack slot).
pub type Word = u64;

/// Size of a [`Word`] in bytes.
pub const WORD_BYTES: usize = std::mem::size_of::<Word>();

/// Index of a slot inside a thread's stack arena.
pub type SlotIndex = usize;

/// Number of low bits reserved for [`FrameTag`]s in an encoded [`SlotRef`].
pub const TAG_BITS: u32 = 2;

/// Round a byte count up to whole words.
#[inline]
pub const fn words_for_bytes(bytes: usize) -> usize {
    bytes.div_ceil(WORD_BYTES)
}

// =============================================================================
// Object References
// =============================================================================

/// A non-null reference to a heap object.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectRef(NonZeroU64);

impl ObjectRef {
    /// Wrap a raw word, returning `None` for null.
    #[inline]
    pub const fn from_word(word: Word) -> Option<Self> {
        match NonZeroU64::new(word) {
            Some(raw) => Some(Self(raw)),
            None => None,
        }
    }

    /// Raw word value as stored in a stack slot.
    #[inline]
    pub const fn to_word(self) -> Word {
        self.0.get()
    }
}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectRef({:#x})", self.0.get())
    }
}

// =============================================================================
// Compiled Code Identity
// =============================================================================

/// Identifier of a compiled-code body in the code cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CodeId(pub u32);

impl fmt::Display for CodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "code#{}", self.0)
    }
}

// =============================================================================
// Frame Tags
// =============================================================================

bitflags::bitflags! {
    /// Tags carried in the low bits of a frame's saved `a0` word.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct FrameTag: Word {
        /// Raise a frame-pop event when the interpreter returns from this frame.
        const REPORT_FRAME_POP = 0b01;
        /// Hide the frame from exception unwinding and stack inspection.
        const INVISIBLE = 0b10;
    }
}

// =============================================================================
// Slot References
// =============================================================================

/// A stack slot reference with optional frame tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotRef {
    index: SlotIndex,
    tags: FrameTag,
}

impl SlotRef {
    /// Encoded null reference.
    pub const NULL: Word = 0;

    /// Untagged reference to `index`.
    #[inline]
    pub const fn new(index: SlotIndex) -> Self {
        Self {
            index,
            tags: FrameTag::empty(),
        }
    }

    /// Add tags to this reference.
    #[inline]
    pub fn with_tags(mut self, tags: FrameTag) -> Self {
        self.tags |= tags;
        self
    }

    /// The referenced slot.
    #[inline]
    pub const fn index(self) -> SlotIndex {
        self.index
    }

    /// Tags carried by this reference.
    #[inline]
    pub const fn tags(self) -> FrameTag {
        self.tags
    }

    /// Encode into a stack word.
    #[inline]
    pub fn encode(self) -> Word {
        ((self.index as Word + 1) << TAG_BITS) | self.tags.bits()
    }

    /// Decode a stack word, returning `None` for null.
    #[inline]
    pub fn decode(word: Word) -> Option<Self> {
        let biased = word >> TAG_BITS;
        if biased == 0 {
            return None;
        }
        Some(Self {
            index: (biased - 1) as SlotIndex,
            tags: FrameTag::from_bits_truncate(word),
        })
    }

    /// Encode an optional slot, using [`SlotRef::NULL`] for `None`.
    #[inline]
    pub fn encode_opt(index: Option<SlotIndex>) -> Word {
        index.map_or(Self::NULL, |i| Self::new(i).encode())
    }
}

// =============================================================================
// Bytecode PCs
// =============================================================================

/// A resume point inside a method's bytecode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BytecodePc {
    /// Method whose bytecode is executing.
    pub method: MethodId,
    /// Offset from the start of the bytecode.
    pub offset: u32,
}

impl BytecodePc {
    /// Create a bytecode PC.
    #[inline]
    pub const fn new(method: MethodId, offset: u32) -> Self {
        Self { method, offset }
    }

    /// Move the PC forward by `length` bytes.
    #[inline]
    pub fn advance(&mut self, length: u32) {
        self.offset += length;
    }

    /// Encode as a saved-PC stack word.
    #[inline]
    pub const fn encode(self) -> Word {
        ((self.method.0 as Word) << 32) | self.offset as Word
    }

    /// Decode a saved-PC stack word.
    #[inline]
    pub const fn decode(word: Word) -> Self {
        Self {
            method: MethodId((word >> 32) as u32),
            offset: word as u32,
        }
    }
}

impl fmt::Display for BytecodePc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.method, self.offset)
    }
}

// =============================================================================
// Return Values
// =============================================================================

/// Raw result of a compiled call, as left in the thread's return registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReturnValue(pub [Word; 2]);

impl ReturnValue {
    /// Single-slot return value.
    #[inline]
    pub const fn single(value: Word) -> Self {
        Self([value, 0])
    }

    /// Two-slot return value.
    #[inline]
    pub const fn wide(low: Word, high: Word) -> Self {
        Self([low, high])
    }

    /// The first `count` slots.
    #[inline]
    pub fn slots(&self, count: usize) -> &[Word] {
        &self.0[..count]
    }
}
