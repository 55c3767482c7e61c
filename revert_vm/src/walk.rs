//! Stack walking.
//!
//! A walk visits frames from the top of the stack down and hands each one to
//! a callback as a [`WalkedFrame`]. Compiled frames come with everything a
//! capture needs: the resume PC (the original one if a continuation label was
//! already installed), the slot holding it, and any resolve context.
//!
//! Walks never mutate. Callers collect the frames they care about first and
//! act on them afterwards.

use std::sync::Arc;

use revert_core::{SlotIndex, SlotRef, Word};

use crate::code_cache::CompiledMethod;
use crate::frame::{BytecodeFrame, ResolveContext, StackFrame};
use crate::stack::{I2jState, J2iFrameLayout, RegisterMap};
use crate::thread::VmThread;

/// Whether a walk continues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkAction {
    /// Visit the next frame.
    KeepIterating,
    /// End the walk.
    Stop,
}

/// A compiled frame as seen by the walker.
#[derive(Debug, Clone)]
pub struct CompiledFrameInfo {
    /// Index in the thread's frame list.
    pub index: usize,
    /// Executing code.
    pub code: Arc<CompiledMethod>,
    /// Frame identity.
    pub bp: SlotIndex,
    /// Argument 0.
    pub a0: SlotIndex,
    /// Lowest slot in use.
    pub sp: SlotIndex,
    /// Lowest slot of the fixed frame body.
    pub unwind_sp: SlotIndex,
    /// Outgoing arguments below the body.
    pub outgoing_args: usize,
    /// Compiled resume PC, or 0 for the topmost frame.
    pub pc: Word,
    /// Slot holding the resume PC.
    pub pc_slot: Option<SlotIndex>,
    /// Context of the resolve frame directly above, if any.
    pub resolve: Option<ResolveContext>,
    /// Interpreter state from the nearest I2J transition.
    pub i2j: I2jState,
    /// Newest J2I frame at or below this frame.
    pub j2i_frame: Option<SlotIndex>,
    /// Callee-preserved registers.
    pub registers: RegisterMap,
}

impl CompiledFrameInfo {
    /// Slot where the temp area starts.
    #[inline]
    pub fn temp_base(&self) -> SlotIndex {
        offset_slot(self.bp, self.code.temp_base_offset())
    }

    /// Base slot for numbering argument monitor slots.
    #[inline]
    pub fn object_arg_scan_cursor(&self) -> SlotIndex {
        self.bp + 1
    }

    /// Base slot for numbering temp monitor slots.
    #[inline]
    pub fn object_temp_scan_cursor(&self) -> SlotIndex {
        offset_slot(self.bp, self.code.local_base_offset)
    }

    /// Words from the unwind sp through argument 0.
    #[inline]
    pub fn frame_words(&self) -> usize {
        self.a0 + 1 - self.unwind_sp
    }
}

#[inline]
fn offset_slot(base: SlotIndex, offset: isize) -> SlotIndex {
    base.checked_add_signed(offset)
        .unwrap_or_else(|| panic!("slot offset {offset} from {base} leaves the stack"))
}

/// What kind of frame was visited.
#[derive(Debug, Clone)]
pub enum WalkedFrameKind {
    /// Interpreter frame.
    Bytecode(BytecodeFrame),
    /// Compiled frame.
    Compiled(CompiledFrameInfo),
    /// JIT-to-interpreter transition.
    J2i(J2iFrameLayout),
    /// Runtime helper.
    Resolve(Option<ResolveContext>),
}

/// One visited frame.
#[derive(Debug, Clone)]
pub struct WalkedFrame {
    /// Index in the thread's frame list.
    pub index: usize,
    /// Frame contents.
    pub kind: WalkedFrameKind,
}

impl WalkedFrame {
    /// Whether stack inspection reports this frame.
    #[inline]
    pub fn is_visible(&self) -> bool {
        matches!(
            self.kind,
            WalkedFrameKind::Bytecode(_) | WalkedFrameKind::Compiled(_)
        )
    }

    /// The compiled frame, if this is one.
    #[inline]
    pub fn compiled(&self) -> Option<&CompiledFrameInfo> {
        match &self.kind {
            WalkedFrameKind::Compiled(info) => Some(info),
            _ => None,
        }
    }
}

/// Something that can walk a thread's frames.
pub trait StackWalker {
    /// Visit frames from the top of the stack down until `visit` stops.
    fn walk(&self, thread: &VmThread, visit: &mut dyn FnMut(&WalkedFrame) -> WalkAction);

    /// Collect every compiled frame accepted by `filter`.
    fn compiled_frames(
        &self,
        thread: &VmThread,
        filter: &dyn Fn(&CompiledFrameInfo) -> bool,
    ) -> Vec<CompiledFrameInfo> {
        let mut frames = Vec::new();
        self.walk(thread, &mut |frame| {
            if let Some(info) = frame.compiled().filter(|info| filter(info)) {
                frames.push(info.clone());
            }
            WalkAction::KeepIterating
        });
        frames
    }

    /// The `skip`-th visible frame from the top.
    fn visible_frame(&self, thread: &VmThread, skip: usize) -> Option<WalkedFrame> {
        let mut seen = 0;
        let mut found = None;
        self.walk(thread, &mut |frame| {
            if !frame.is_visible() {
                return WalkAction::KeepIterating;
            }
            if seen == skip {
                found = Some(frame.clone());
                return WalkAction::Stop;
            }
            seen += 1;
            WalkAction::KeepIterating
        });
        found
    }
}

/// Walker over a thread's frame list.
#[derive(Debug, Default, Clone, Copy)]
pub struct ShadowStackWalker;

impl StackWalker for ShadowStackWalker {
    fn walk(&self, thread: &VmThread, visit: &mut dyn FnMut(&WalkedFrame) -> WalkAction) {
        let frames = thread.frames();
        let mut j2i = thread.regs.j2i_frame;
        let mut resolve_above = None;

        for (index, frame) in frames.iter().enumerate().rev() {
            let kind = match frame {
                StackFrame::Bytecode(frame) => WalkedFrameKind::Bytecode(*frame),
                StackFrame::J2i(layout) => WalkedFrameKind::J2i(*layout),
                StackFrame::Resolve(frame) => WalkedFrameKind::Resolve(frame.context),
                StackFrame::Compiled(frame) => {
                    let pc_slot = thread.resume_slot_of(index);
                    let pc = match thread.decompilations.find(frame.bp) {
                        Some(record) => record.pc(),
                        None => pc_slot.map_or(0, |slot| thread.stack.read(slot)),
                    };
                    WalkedFrameKind::Compiled(CompiledFrameInfo {
                        index,
                        code: Arc::clone(&frame.code),
                        bp: frame.bp,
                        a0: frame.a0(),
                        sp: frame.sp,
                        unwind_sp: frame.unwind_sp(),
                        outgoing_args: frame.outgoing_args,
                        pc,
                        pc_slot,
                        resolve: resolve_above,
                        i2j: frame.i2j,
                        j2i_frame: j2i,
                        registers: frame.registers,
                    })
                }
            };

            let walked = WalkedFrame { index, kind };
            if visit(&walked) == WalkAction::Stop {
                return;
            }

            resolve_above = match frame {
                StackFrame::Resolve(frame) => frame.context,
                _ => None,
            };
            if let StackFrame::J2i(layout) = frame {
                j2i = thread.stack.read_ref(layout.previous_j2i()).map(SlotRef::index);
            }
        }
    }
}
