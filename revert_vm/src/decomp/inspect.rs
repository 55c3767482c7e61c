//! Debugger access to compiled frames.
//!
//! These operations back frame inspection: reading and writing locals,
//! frame-pop notifications, and exception delivery into frames that have a
//! pending decompilation.

use revert_core::{DecompError, DecompResult, SlotIndex, Word};

use super::capture::{add_decompilation, free_record, uses_osr};
use super::dispatch::ContinuationLabel;
use super::osr::OsrFrameFlags;
use super::reason::DecompReason;
use super::record::{AddOutcome, FrameIdentity};
use crate::frame::StackFrame;
use crate::thread::VmThread;
use crate::vm::VmShared;
use crate::walk::{CompiledFrameInfo, WalkedFrame};

/// Where a local of a compiled frame can be read and written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalSlotAddress {
    /// A slot of the thread's stack.
    Stack(SlotIndex),
    /// A word in the OSR buffer of the frame's decompilation record.
    Osr {
        /// Identity of the compiled frame owning the record.
        frame: FrameIdentity,
        /// Word offset in the buffer.
        word: usize,
    },
}

impl LocalSlotAddress {
    /// Read the local.
    pub fn read(self, thread: &VmThread) -> Option<Word> {
        match self {
            Self::Stack(slot) => Some(thread.stack.read(slot)),
            Self::Osr { frame, word } => thread
                .decompilations
                .find(frame)
                .map(|record| record.buffer().word(word)),
        }
    }

    /// Write the local. Returns false if the record has gone away.
    pub fn write(self, thread: &mut VmThread, value: Word) -> bool {
        match self {
            Self::Stack(slot) => {
                thread.stack.write(slot, value);
                true
            }
            Self::Osr { frame, word } => match thread.decompilations.find_mut(frame) {
                Some(record) => {
                    record.buffer_mut().set_word(word, value);
                    true
                }
                None => false,
            },
        }
    }
}

/// Locate local `slot` of the method at `inline_depth` in the compiled frame `info`.
///
/// On the OSR path the frame is scheduled for decompilation first, since
/// locals only have a stable home in its OSR buffer. Arguments of the
/// outermost method stay in place across a rebuild and are addressed on the
/// stack. Without OSR only the outermost method can be inspected, through
/// the compiled frame's fixed temp layout.
pub fn local_slot_address(
    shared: &VmShared,
    thread: &mut VmThread,
    info: &CompiledFrameInfo,
    slot: usize,
    inline_depth: usize,
) -> DecompResult<LocalSlotAddress> {
    let method = &info.code.method;
    let argc = method.arg_count as usize;

    if uses_osr(&shared.config, &info.code, info.resolve) {
        add_decompilation(shared, thread, info, DecompReason::empty())?;
        if inline_depth == 0 && slot < argc {
            return Ok(LocalSlotAddress::Stack(info.a0 - slot));
        }
        let record = thread
            .decompilations
            .find(info.bp)
            .ok_or(DecompError::NoPendingDecompilation)?;
        let buffer = record.buffer();
        let index = buffer.frame_count() - 1 - inline_depth;
        return Ok(LocalSlotAddress::Osr {
            frame: info.bp,
            word: buffer.local_word_offset(index, slot),
        });
    }

    assert_eq!(inline_depth, 0, "inlined locals of {method} need OSR");
    if slot < argc {
        return Ok(LocalSlotAddress::Stack(info.a0 - slot));
    }
    let temps = method.temp_count as usize;
    assert!(slot < argc + temps, "local {slot} out of range for {method}");
    let hidden = usize::from(method.has_hidden_slot());
    Ok(LocalSlotAddress::Stack(
        info.temp_base() + hidden + (temps - 1 - (slot - argc)),
    ))
}

/// A frame-pop notification was requested for the method at `inline_depth`
/// in the compiled frame `info`.
pub fn frame_pop_notification_added(
    shared: &VmShared,
    thread: &mut VmThread,
    info: &CompiledFrameInfo,
    inline_depth: usize,
) -> DecompResult<()> {
    add_decompilation(shared, thread, info, DecompReason::FRAME_POP_NOTIFICATION)?;
    let record = thread
        .decompilations
        .find_mut(info.bp)
        .ok_or(DecompError::NoPendingDecompilation)?;
    record
        .buffer_mut()
        .frames_mut()
        .frame_at_inline_depth_mut(inline_depth)
        .insert_flags(OsrFrameFlags::NOTIFY_FRAME_POP);
    Ok(())
}

/// The debugger is about to pop frames down to the compiled frame `info`.
pub fn add_decompilation_for_frame_pop(
    shared: &VmShared,
    thread: &mut VmThread,
    info: &CompiledFrameInfo,
) -> DecompResult<AddOutcome> {
    add_decompilation(shared, thread, info, DecompReason::POP_FRAMES)
}

/// The debugger wrote locals of `frame`. Compiled frames are scheduled for
/// decompilation so the writes are seen; interpreter frames need nothing.
pub fn stack_locals_modified(
    shared: &VmShared,
    thread: &mut VmThread,
    frame: &WalkedFrame,
) -> DecompResult<Option<AddOutcome>> {
    match frame.compiled() {
        Some(info) => {
            add_decompilation(shared, thread, info, DecompReason::STACK_LOCALS_MODIFIED).map(Some)
        }
        None => Ok(None),
    }
}

// =============================================================================
// Exceptions
// =============================================================================

/// An exception will be caught by the frame at `catch_index`, whose handler
/// starts at `handler_pc`.
///
/// Records of the frames being unwound are discarded and the frames are
/// dropped. Returns the address to continue at: the handler itself, or the
/// catch label if the catching compiled frame has a pending decompilation.
pub fn jit_exception_caught(
    shared: &VmShared,
    thread: &mut VmThread,
    catch_index: usize,
    handler_pc: Word,
) -> DecompResult<Word> {
    let target = match thread.frames().get(catch_index) {
        Some(StackFrame::Compiled(frame)) => Some(frame.bp),
        Some(StackFrame::Bytecode(frame)) => {
            jit_clean_up_decompilation_stack(shared, thread, frame.a0, true);
            None
        }
        _ => return Err(DecompError::NotCompiled),
    };
    thread.unwind_to(catch_index);

    let Some(bp) = target else {
        return Ok(handler_pc);
    };
    if !jit_clean_up_decompilation_stack(shared, thread, bp, false) {
        return Ok(handler_pc);
    }
    match thread.decompilations.head_mut() {
        Some(record) => {
            record.pc = handler_pc;
            log::debug!("{} exception caught in frame {bp} with pending decompilation", thread.id);
            Ok(ContinuationLabel::AtExceptionCatch.address())
        }
        None => Ok(handler_pc),
    }
}

/// Discard records of frames above `boundary`, and the one for `boundary`
/// itself if `drop_current`, after those frames were unwound.
///
/// Returns whether a record for `boundary` remains at the head.
pub fn jit_clean_up_decompilation_stack(
    shared: &VmShared,
    thread: &mut VmThread,
    boundary: FrameIdentity,
    drop_current: bool,
) -> bool {
    let limit = if drop_current { boundary + 1 } else { boundary };
    let stale = thread.decompilations.drain_above(limit);
    if !stale.is_empty() {
        log::debug!("{} discarding {} unwound decompilation(s)", thread.id, stale.len());
    }
    for record in stale {
        free_record(shared, thread, record, false);
    }
    thread
        .decompilations
        .head()
        .is_some_and(|record| record.frame() == boundary)
}
