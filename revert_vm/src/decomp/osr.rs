//! OSR buffer layout.
//!
//! An OSR buffer describes every interpreter frame a compiled frame expands
//! into, innermost frame first.
//!
//! ```text
//! ┌─────────┬─────────────┬──────────────────────────┬──────────────────┐
//! │ jit pc  │ frame count │ frame 0 (innermost)      │ frame 1 ...      │
//! └─────────┴─────────────┴──────────────────────────┴──────────────────┘
//!
//! frame:
//! ┌────────┬────────┬────────┬───────────┬─────────┬───────┬──────────┐
//! │ method │ offset │ locals │ max stack │ pending │ flags │ monitors │
//! ├────────┴────────┴────────┴───────────┴─────────┴───────┴──────────┤
//! │ operand stack (max stack words, operand 0 highest)                 │
//! ├────────────────────────────────────────────────────────────────────┤
//! │ locals (local L-1 lowest, local 0 highest)                         │
//! └────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The slot region mirrors the interpreter frame's memory order, so a rebuild
//! copies locals and the pending part of the operand stack with plain slice
//! copies.

use std::fmt;

use revert_core::{Bytecode, Method, MethodId, WORD_BYTES, Word};

use crate::alloc::BufferStorage;
use crate::frame::ResolveContext;
use crate::monitor::MonitorRecordId;

/// Words before the first frame.
pub const OSR_BUFFER_HEADER_WORDS: usize = 2;

/// Words before a frame's slot region.
pub const OSR_FRAME_HEADER_WORDS: usize = 7;

mod field {
    pub const METHOD: usize = 0;
    pub const BYTECODE_OFFSET: usize = 1;
    pub const LOCALS: usize = 2;
    pub const MAX_STACK: usize = 3;
    pub const PENDING: usize = 4;
    pub const FLAGS: usize = 5;
    pub const MONITORS: usize = 6;
}

bitflags::bitflags! {
    /// Per-frame flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct OsrFrameFlags: Word {
        /// Report a frame-pop event when the rebuilt frame returns.
        const NOTIFY_FRAME_POP = 1 << 0;
    }
}

// =============================================================================
// Sizing
// =============================================================================

/// Words needed for one frame of `method`.
#[inline]
pub fn osr_frame_words(method: &Method) -> usize {
    OSR_FRAME_HEADER_WORDS + method.max_stack as usize + method.frame_locals()
}

/// Words needed for the header plus every frame in `methods`.
pub fn osr_frames_words<'a>(methods: impl IntoIterator<Item = &'a Method>) -> usize {
    OSR_BUFFER_HEADER_WORDS + methods.into_iter().map(osr_frame_words).sum::<usize>()
}

/// Operand-stack depth the interpreter must see when resuming at `offset`.
///
/// The stack mapper reports the depth before the instruction executes; an
/// in-progress call has already consumed its arguments and receiver, and a
/// helper that is being resumed after has consumed its own inputs.
pub fn pending_stack_height(
    method: &Method,
    offset: u32,
    resolve: Option<ResolveContext>,
) -> usize {
    if matches!(
        resolve,
        Some(ResolveContext::StackOverflow | ResolveContext::ExceptionCatch)
    ) {
        return 0;
    }

    let info = method
        .bytecode_at(offset)
        .unwrap_or_else(|| panic!("no stack map for {method} at offset {offset}"));
    let mut height = info.stack_depth as isize;

    if let Bytecode::Invoke {
        kind, arg_slots, ..
    } = info.op
    {
        if kind.has_receiver() {
            height -= 1;
        }
        height -= arg_slots as isize;
    }

    match resolve {
        Some(ResolveContext::MonitorEnter) => height -= 1,
        Some(ResolveContext::Allocation) => match info.op {
            Bytecode::NewArray | Bytecode::ANewArray => height -= 1,
            Bytecode::MultiANewArray { dimensions } => height -= dimensions as isize,
            _ => {}
        },
        _ => {}
    }

    assert!(
        height >= 0,
        "negative pending stack height {height} for {method} at offset {offset}"
    );
    height as usize
}

// =============================================================================
// Frame Views
// =============================================================================

#[inline]
fn frame_words(words: &[Word]) -> usize {
    OSR_FRAME_HEADER_WORDS + words[field::MAX_STACK] as usize + words[field::LOCALS] as usize
}

fn frame_range(words: &[Word], index: usize) -> std::ops::Range<usize> {
    let count = words[1] as usize;
    assert!(index < count, "OSR frame {index} out of {count}");
    let mut start = OSR_BUFFER_HEADER_WORDS;
    for _ in 0..index {
        start += frame_words(&words[start..]);
    }
    start..start + frame_words(&words[start..])
}

/// Read-only view of one OSR frame.
#[derive(Clone, Copy)]
pub struct OsrFrame<'a> {
    words: &'a [Word],
}

impl<'a> OsrFrame<'a> {
    /// Method executing in the frame.
    #[inline]
    pub fn method(&self) -> MethodId {
        MethodId::from_word(self.words[field::METHOD])
    }

    /// Resume offset.
    #[inline]
    pub fn bytecode_offset(&self) -> u32 {
        self.words[field::BYTECODE_OFFSET] as u32
    }

    /// Locals including any hidden slot.
    #[inline]
    pub fn locals(&self) -> usize {
        self.words[field::LOCALS] as usize
    }

    /// Operand-stack capacity.
    #[inline]
    pub fn max_stack(&self) -> usize {
        self.words[field::MAX_STACK] as usize
    }

    /// Pending operand-stack depth.
    #[inline]
    pub fn pending(&self) -> usize {
        self.words[field::PENDING] as usize
    }

    /// Frame flags.
    #[inline]
    pub fn flags(&self) -> OsrFrameFlags {
        OsrFrameFlags::from_bits_truncate(self.words[field::FLAGS])
    }

    /// Head of the frame's monitor record chain.
    #[inline]
    pub fn monitor_records(&self) -> Option<MonitorRecordId> {
        MonitorRecordId::from_word(self.words[field::MONITORS])
    }

    /// Local `slot`.
    #[inline]
    pub fn local(&self, slot: usize) -> Word {
        self.words[self.local_word(slot)]
    }

    /// Operand `index`, counting from the bottom of the stack.
    #[inline]
    pub fn operand(&self, index: usize) -> Word {
        self.words[OSR_FRAME_HEADER_WORDS + self.max_stack() - 1 - index]
    }

    /// Locals in memory order: local L-1 first, local 0 last.
    #[inline]
    pub fn locals_region(&self) -> &'a [Word] {
        &self.words[OSR_FRAME_HEADER_WORDS + self.max_stack()..]
    }

    /// Pending operands in memory order: topmost first.
    #[inline]
    pub fn pending_region(&self) -> &'a [Word] {
        let end = OSR_FRAME_HEADER_WORDS + self.max_stack();
        &self.words[end - self.pending()..end]
    }

    #[inline]
    fn local_word(&self, slot: usize) -> usize {
        let locals = self.locals();
        assert!(slot < locals, "local {slot} out of {locals}");
        OSR_FRAME_HEADER_WORDS + self.max_stack() + locals - 1 - slot
    }
}

impl fmt::Debug for OsrFrame<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OsrFrame")
            .field("method", &self.method())
            .field("bytecode_offset", &self.bytecode_offset())
            .field("locals", &self.locals())
            .field("max_stack", &self.max_stack())
            .field("pending", &self.pending())
            .field("flags", &self.flags())
            .finish()
    }
}

/// Mutable view of one OSR frame.
pub struct OsrFrameMut<'a> {
    words: &'a mut [Word],
}

impl<'a> OsrFrameMut<'a> {
    /// Read-only view.
    #[inline]
    pub fn view(&self) -> OsrFrame<'_> {
        OsrFrame { words: &self.words[..] }
    }

    /// Initialize the header of a fresh frame.
    pub fn init(&mut self, method: &Method, bytecode_offset: u32, pending: usize) {
        assert!(
            pending <= method.max_stack as usize,
            "pending {pending} exceeds max stack of {method}"
        );
        self.words[field::METHOD] = method.id.to_word();
        self.words[field::BYTECODE_OFFSET] = Word::from(bytecode_offset);
        self.words[field::LOCALS] = method.frame_locals() as Word;
        self.words[field::MAX_STACK] = Word::from(method.max_stack);
        self.words[field::PENDING] = pending as Word;
        self.words[field::FLAGS] = 0;
        self.words[field::MONITORS] = 0;
    }

    /// Set the resume offset.
    #[inline]
    pub fn set_bytecode_offset(&mut self, offset: u32) {
        self.words[field::BYTECODE_OFFSET] = Word::from(offset);
    }

    /// Set the pending operand-stack depth.
    #[inline]
    pub fn set_pending(&mut self, pending: usize) {
        assert!(pending <= self.view().max_stack());
        self.words[field::PENDING] = pending as Word;
    }

    /// Add frame flags.
    #[inline]
    pub fn insert_flags(&mut self, flags: OsrFrameFlags) {
        self.words[field::FLAGS] |= flags.bits();
    }

    /// Replace the monitor record chain head.
    #[inline]
    pub fn set_monitor_records(&mut self, head: Option<MonitorRecordId>) {
        self.words[field::MONITORS] = MonitorRecordId::to_word(head);
    }

    /// Write local `slot`.
    #[inline]
    pub fn set_local(&mut self, slot: usize, value: Word) {
        let word = self.view().local_word(slot);
        self.words[word] = value;
    }

    /// Write operand `index`, counting from the bottom of the stack.
    #[inline]
    pub fn set_operand(&mut self, index: usize, value: Word) {
        let max_stack = self.view().max_stack();
        assert!(index < max_stack, "operand {index} out of {max_stack}");
        self.words[OSR_FRAME_HEADER_WORDS + max_stack - 1 - index] = value;
    }

    /// Pending operands followed by the first `temps` words of the locals region.
    ///
    /// This is the span the legacy path copies straight out of a compiled frame.
    pub fn pending_and_temps_mut(&mut self, temps: usize) -> &mut [Word] {
        let frame = self.view();
        let boundary = OSR_FRAME_HEADER_WORDS + frame.max_stack();
        let start = boundary - frame.pending();
        &mut self.words[start..boundary + temps]
    }
}

// =============================================================================
// Buffer Views
// =============================================================================

/// Mutable view of every frame in a buffer.
pub struct OsrFramesMut<'a> {
    words: &'a mut [Word],
}

impl<'a> OsrFramesMut<'a> {
    /// Wrap a buffer's words.
    #[inline]
    pub(crate) fn new(words: &'a mut [Word]) -> Self {
        Self { words }
    }

    /// Compiled PC the buffer was captured at.
    #[inline]
    pub fn jit_pc(&self) -> Word {
        self.words[0]
    }

    /// Number of frames.
    #[inline]
    pub fn frame_count(&self) -> usize {
        self.words[1] as usize
    }

    /// Frame `index`, innermost first.
    pub fn frame_mut(&mut self, index: usize) -> OsrFrameMut<'_> {
        let range = frame_range(self.words, index);
        OsrFrameMut {
            words: &mut self.words[range],
        }
    }

    /// Frame at `depth`, where depth 0 is the outermost method.
    pub fn frame_at_inline_depth_mut(&mut self, depth: usize) -> OsrFrameMut<'_> {
        let count = self.frame_count();
        assert!(depth < count, "inline depth {depth} out of {count} frames");
        self.frame_mut(count - 1 - depth)
    }
}

// =============================================================================
// OSR Buffer
// =============================================================================

/// A captured set of interpreter frames, backed by owned or shared storage.
///
/// Storage backing induced OSR or the global buffer may be longer than the
/// buffer; the tail holds the trampoline's scratch space and the frame copy.
pub struct OsrBuffer {
    storage: BufferStorage,
    words: usize,
}

impl OsrBuffer {
    /// Wrap storage whose first `words` words form the buffer.
    pub(crate) fn new(mut storage: BufferStorage, words: usize) -> Self {
        let block = storage.words_mut();
        assert!(
            block.len() >= words && words >= OSR_BUFFER_HEADER_WORDS,
            "storage of {} words cannot hold a {words}-word buffer",
            block.len()
        );
        block.fill(0);
        Self { storage, words }
    }

    /// Buffer length in words, excluding any tail.
    #[inline]
    pub fn word_len(&self) -> usize {
        self.words
    }

    /// Length of the backing storage in words, including any tail.
    #[inline]
    pub fn storage_words(&self) -> usize {
        self.storage.words().len()
    }

    /// Buffer length in bytes.
    #[inline]
    pub fn byte_len(&self) -> usize {
        self.words * WORD_BYTES
    }

    /// Whether the buffer borrows the global OSR buffer.
    #[inline]
    pub fn is_shared(&self) -> bool {
        self.storage.is_shared()
    }

    #[inline]
    fn buffer_words(&self) -> &[Word] {
        &self.storage.words()[..self.words]
    }

    /// Compiled PC the buffer was captured at.
    #[inline]
    pub fn jit_pc(&self) -> Word {
        self.buffer_words()[0]
    }

    /// Number of frames.
    #[inline]
    pub fn frame_count(&self) -> usize {
        self.buffer_words()[1] as usize
    }

    /// Frame `index`, innermost first.
    pub fn frame(&self, index: usize) -> OsrFrame<'_> {
        let words = self.buffer_words();
        OsrFrame {
            words: &words[frame_range(words, index)],
        }
    }

    /// Frame at `depth`, where depth 0 is the outermost method.
    pub fn frame_at_inline_depth(&self, depth: usize) -> OsrFrame<'_> {
        let count = self.frame_count();
        assert!(depth < count, "inline depth {depth} out of {count} frames");
        self.frame(count - 1 - depth)
    }

    /// Frames innermost first.
    pub fn frames(&self) -> impl Iterator<Item = OsrFrame<'_>> {
        (0..self.frame_count()).map(move |index| self.frame(index))
    }

    /// Mutable view of all frames.
    pub fn frames_mut(&mut self) -> OsrFramesMut<'_> {
        OsrFramesMut::new(&mut self.storage.words_mut()[..self.words])
    }

    /// Frame `index` mutably.
    pub fn frame_mut(&mut self, index: usize) -> OsrFrameMut<'_> {
        let words = &mut self.storage.words_mut()[..self.words];
        let range = frame_range(words, index);
        OsrFrameMut {
            words: &mut words[range],
        }
    }

    /// Word offset of local `slot` in frame `index`.
    pub fn local_word_offset(&self, index: usize, slot: usize) -> usize {
        let words = self.buffer_words();
        let range = frame_range(words, index);
        range.start + OsrFrame { words: &words[range] }.local_word(slot)
    }

    /// Read the word at `offset`.
    #[inline]
    pub fn word(&self, offset: usize) -> Word {
        self.buffer_words()[offset]
    }

    /// Write the word at `offset`.
    #[inline]
    pub fn set_word(&mut self, offset: usize, value: Word) {
        self.storage.words_mut()[..self.words][offset] = value;
    }

    /// Frames view plus the storage past the buffer.
    pub(crate) fn split_tail(&mut self) -> (OsrFramesMut<'_>, &mut [Word]) {
        let (buffer, tail) = self.storage.words_mut().split_at_mut(self.words);
        (OsrFramesMut::new(buffer), tail)
    }

    /// Write the buffer header.
    pub(crate) fn write_header(&mut self, jit_pc: Word, frame_count: usize) {
        let words = self.storage.words_mut();
        words[0] = jit_pc;
        words[1] = frame_count as Word;
    }

    /// Release the backing storage.
    pub(crate) fn into_storage(self) -> BufferStorage {
        self.storage
    }
}

impl fmt::Debug for OsrBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OsrBuffer")
            .field("jit_pc", &self.jit_pc())
            .field("words", &self.words)
            .field("shared", &self.is_shared())
            .field("frames", &self.frames().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use revert_core::{ClassId, InvokeKind, MethodFlags, ReturnKind};

    fn method(id: u32, flags: MethodFlags) -> Method {
        Method::builder(MethodId(id), ClassId(1), "m")
            .args(2)
            .temps(1)
            .max_stack(4)
            .flags(flags)
            .bytecode(
                0,
                Bytecode::Invoke {
                    kind: InvokeKind::Virtual,
                    arg_slots: 2,
                    returns: ReturnKind::Int,
                },
                4,
            )
            .bytecode(3, Bytecode::MonitorEnter, 2)
            .bytecode(4, Bytecode::MultiANewArray { dimensions: 2 }, 3)
            .bytecode(8, Bytecode::NewArray, 1)
            .bytecode(10, Bytecode::New, 0)
            .build()
    }

    fn buffer(methods: &[&Method]) -> OsrBuffer {
        let words = osr_frames_words(methods.iter().copied());
        let mut buffer = OsrBuffer::new(BufferStorage::Owned(vec![0; words].into()), words);
        buffer.write_header(0x40, methods.len());
        for (index, m) in methods.iter().enumerate() {
            buffer.frame_mut(index).init(m, 0, 1);
        }
        buffer
    }

    #[test]
    fn test_frame_words() {
        let plain = method(1, MethodFlags::empty());
        let sync = method(2, MethodFlags::SYNCHRONIZED);
        assert_eq!(osr_frame_words(&plain), OSR_FRAME_HEADER_WORDS + 4 + 3);
        assert_eq!(osr_frame_words(&sync), OSR_FRAME_HEADER_WORDS + 4 + 4);
        assert_eq!(
            osr_frames_words([&plain, &sync]),
            OSR_BUFFER_HEADER_WORDS + osr_frame_words(&plain) + osr_frame_words(&sync)
        );
    }

    #[test]
    fn test_pending_height_invoke() {
        let m = method(1, MethodFlags::empty());
        assert_eq!(pending_stack_height(&m, 0, None), 1);
        assert_eq!(pending_stack_height(&m, 0, Some(ResolveContext::Generic)), 1);
    }

    #[test]
    fn test_pending_height_contexts() {
        let m = method(1, MethodFlags::empty());
        assert_eq!(pending_stack_height(&m, 0, Some(ResolveContext::StackOverflow)), 0);
        assert_eq!(pending_stack_height(&m, 3, Some(ResolveContext::ExceptionCatch)), 0);
        assert_eq!(pending_stack_height(&m, 3, Some(ResolveContext::MonitorEnter)), 1);
        assert_eq!(pending_stack_height(&m, 4, Some(ResolveContext::Allocation)), 1);
        assert_eq!(pending_stack_height(&m, 8, Some(ResolveContext::Allocation)), 0);
        assert_eq!(pending_stack_height(&m, 10, Some(ResolveContext::Allocation)), 0);
    }

    #[test]
    #[should_panic(expected = "negative pending stack height")]
    fn test_pending_height_negative_is_fatal() {
        let m = Method::builder(MethodId(1), ClassId(1), "m")
            .bytecode(0, Bytecode::MonitorEnter, 0)
            .build();
        pending_stack_height(&m, 0, Some(ResolveContext::MonitorEnter));
    }

    #[test]
    fn test_slot_order() {
        let inner = method(1, MethodFlags::empty());
        let outer = method(2, MethodFlags::empty());
        let mut buffer = buffer(&[&inner, &outer]);
        {
            let mut frame = buffer.frame_mut(1);
            frame.set_local(0, 10);
            frame.set_local(2, 12);
            frame.set_operand(0, 20);
        }
        let frame = buffer.frame(1);
        assert_eq!(frame.method(), MethodId(2));
        assert_eq!(frame.local(0), 10);
        assert_eq!(frame.locals_region(), &[12, 0, 10]);
        assert_eq!(frame.pending_region(), &[20]);
        assert_eq!(buffer.frame_at_inline_depth(0).method(), MethodId(2));
        assert_eq!(buffer.frame(0).local(0), 0);
    }

    #[test]
    fn test_local_word_offset() {
        let inner = method(1, MethodFlags::empty());
        let outer = method(2, MethodFlags::empty());
        let mut buffer = buffer(&[&inner, &outer]);
        let offset = buffer.local_word_offset(1, 1);
        buffer.set_word(offset, 77);
        assert_eq!(buffer.frame(1).local(1), 77);
    }

    #[test]
    fn test_pending_and_temps_span() {
        let m = method(1, MethodFlags::empty());
        let mut buffer = buffer(&[&m]);
        buffer.frame_mut(0).pending_and_temps_mut(1).copy_from_slice(&[5, 6]);
        let frame = buffer.frame(0);
        assert_eq!(frame.operand(0), 5);
        assert_eq!(frame.local(2), 6);
    }
}
