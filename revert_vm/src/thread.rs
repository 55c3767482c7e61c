//! Mutator thread state.
//!
//! A [`VmThread`] owns its stack arena, its frame list, its pending
//! decompilations and its monitor records. The push/pop helpers here are the
//! calling conventions that interpreter and compiled code follow; the engine
//! relies on the exact slot positions they produce.

use std::fmt;
use std::sync::Arc;

use revert_core::{
    BytecodePc, DecompConfig, Method, MethodId, ObjectRef, ReturnValue, SlotIndex, SlotRef, Word,
};

use crate::code_cache::CompiledMethod;
use crate::decomp::dispatch::I2J_RETURN_ADDRESS;
use crate::decomp::record::DecompilationStore;
use crate::frame::{BytecodeFrame, CompiledFrame, ResolveContext, ResolveFrame, StackFrame};
use crate::monitor::{MonitorPool, MonitorRecordId};
use crate::stack::{
    BytecodeFrameHeader, I2jState, J2iFrameLayout, RESOLVE_FRAME_SLOTS, RegisterMap, StackArena,
};

/// Identifier of a mutator thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadId(pub u32);

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "thread#{}", self.0)
    }
}

/// Interpreter registers.
///
/// They describe the topmost interpreter frame and are meaningless until one
/// has been pushed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadRegisters {
    /// Lowest slot in use.
    pub sp: SlotIndex,
    /// Local 0 of the current interpreter frame.
    pub a0: SlotIndex,
    /// Bytecode PC of the current interpreter frame.
    pub pc: BytecodePc,
    /// Method whose literals are current.
    pub literals: MethodId,
    /// Newest J2I frame, by frame pointer.
    pub j2i_frame: Option<SlotIndex>,
}

/// A mutator thread.
pub struct VmThread {
    /// Thread identity.
    pub id: ThreadId,
    /// Stack words.
    pub stack: StackArena,
    /// Interpreter registers.
    pub regs: ThreadRegisters,
    /// Pending decompilations.
    pub decompilations: DecompilationStore,
    /// Monitor enter records.
    pub monitor_pool: MonitorPool,
    /// Head of the thread's monitor enter record chain.
    pub monitor_records: Option<MonitorRecordId>,
    /// Exception being delivered to a compiled catch block.
    pub jit_exception: Option<ObjectRef>,
    /// Object produced by the allocation helper that was interrupted.
    pub allocated_object: Option<ObjectRef>,
    /// Last compiled return value.
    pub return_value: ReturnValue,
    pub(crate) retained: Option<Box<[Word]>>,
    frames: Vec<StackFrame>,
}

impl VmThread {
    /// A thread with an empty stack.
    pub fn new(id: ThreadId, config: &DecompConfig) -> Self {
        let stack = StackArena::new(config.stack_slots);
        let top = stack.len();
        Self {
            id,
            stack,
            regs: ThreadRegisters {
                sp: top,
                a0: top,
                pc: BytecodePc::new(MethodId(0), 0),
                literals: MethodId(0),
                j2i_frame: None,
            },
            decompilations: DecompilationStore::new(),
            monitor_pool: MonitorPool::new(config.monitor_pool_capacity),
            monitor_records: None,
            jit_exception: None,
            allocated_object: None,
            return_value: ReturnValue::default(),
            retained: None,
            frames: Vec::new(),
        }
    }

    // =========================================================================
    // Frame Access
    // =========================================================================

    /// Frames, bottom of the stack first.
    #[inline]
    pub fn frames(&self) -> &[StackFrame] {
        &self.frames
    }

    /// Topmost frame.
    #[inline]
    pub fn top_frame(&self) -> Option<&StackFrame> {
        self.frames.last()
    }

    /// Compiled frame at `index`.
    pub fn compiled_frame(&self, index: usize) -> Option<&CompiledFrame> {
        match self.frames.get(index) {
            Some(StackFrame::Compiled(frame)) => Some(frame),
            _ => None,
        }
    }

    /// Compiled frame at `index`, mutably.
    pub fn compiled_frame_mut(&mut self, index: usize) -> Option<&mut CompiledFrame> {
        match self.frames.get_mut(index) {
            Some(StackFrame::Compiled(frame)) => Some(frame),
            _ => None,
        }
    }

    /// Interpreter frame at `index`.
    pub fn bytecode_frame(&self, index: usize) -> Option<&BytecodeFrame> {
        match self.frames.get(index) {
            Some(StackFrame::Bytecode(frame)) => Some(frame),
            _ => None,
        }
    }

    /// Slot that holds the resume address of the frame at `index`.
    ///
    /// It belongs to the frame directly above, so the topmost frame has none.
    pub fn resume_slot_of(&self, index: usize) -> Option<SlotIndex> {
        self.frames.get(index + 1)?.caller_resume_slot()
    }

    pub(crate) fn truncate_frames(&mut self, len: usize) {
        self.frames.truncate(len);
    }

    pub(crate) fn push_frame(&mut self, frame: StackFrame) {
        self.frames.push(frame);
    }

    // =========================================================================
    // Calling Conventions
    // =========================================================================

    /// Push an interpreter frame called from the current interpreter state.
    ///
    /// `locals` lists local 0 first and must cover every frame local;
    /// `operands` lists the operand stack bottom first.
    pub fn push_interpreter_frame(
        &mut self,
        method: &Method,
        locals: &[Word],
        operands: &[Word],
        offset: u32,
    ) -> usize {
        let count = method.frame_locals();
        assert_eq!(locals.len(), count, "local count mismatch for {method}");
        assert!(operands.len() <= method.max_stack as usize);

        let a0 = self.regs.sp - 1;
        for (i, &value) in locals.iter().enumerate() {
            self.stack.write(a0 - i, value);
        }
        let header = BytecodeFrameHeader::for_frame(a0, count);
        header.write(
            &mut self.stack,
            self.regs.pc.encode(),
            self.regs.literals.to_word(),
            SlotRef::new(self.regs.a0).encode(),
        );
        for (i, &value) in operands.iter().enumerate() {
            self.stack.write(header.operand_base() - i, value);
        }

        self.regs = ThreadRegisters {
            sp: header.base() - operands.len(),
            a0,
            pc: BytecodePc::new(method.id, offset),
            literals: method.id,
            j2i_frame: self.regs.j2i_frame,
        };
        self.frames.push(StackFrame::Bytecode(BytecodeFrame {
            method: method.id,
            a0,
            locals: count,
        }));
        self.frames.len() - 1
    }

    /// Call compiled code from the topmost interpreter frame.
    ///
    /// `args` lists argument 0 first.
    pub fn call_compiled_from_interpreter(
        &mut self,
        code: Arc<CompiledMethod>,
        args: &[Word],
    ) -> usize {
        assert!(
            matches!(self.top_frame(), None | Some(StackFrame::Bytecode(_))),
            "interpreter call from a non-interpreter frame"
        );
        let argc = code.method.arg_count as usize;
        assert_eq!(args.len(), argc, "argument count mismatch for {}", code.method);

        let return_sp = self.regs.sp;
        let a0 = return_sp - 1;
        for (i, &value) in args.iter().enumerate() {
            self.stack.write(a0 - i, value);
        }
        let i2j = I2jState {
            return_sp: SlotRef::new(return_sp).encode(),
            a0: SlotRef::new(self.regs.a0).encode(),
            literals: self.regs.literals.to_word(),
            pc: self.regs.pc.encode(),
        };
        let bp = a0 - argc;
        self.stack.write(bp, I2J_RETURN_ADDRESS);
        self.push_compiled_body(code, bp, i2j)
    }

    /// Call compiled code from the topmost compiled frame, which is at
    /// `caller_pc`.
    pub fn call_compiled_from_compiled(
        &mut self,
        code: Arc<CompiledMethod>,
        args: &[Word],
        caller_pc: Word,
    ) -> usize {
        let argc = code.method.arg_count as usize;
        assert_eq!(args.len(), argc, "argument count mismatch for {}", code.method);
        let i2j = match self.frames.last() {
            Some(StackFrame::Compiled(caller)) => caller.i2j,
            _ => panic!("compiled call from a non-compiled frame"),
        };
        self.push_outgoing_args(args);
        let a0 = self.regs.sp + argc - 1;
        let bp = a0 - argc;
        self.stack.write(bp, caller_pc);
        self.push_compiled_body(code, bp, i2j)
    }

    fn push_compiled_body(&mut self, code: Arc<CompiledMethod>, bp: SlotIndex, i2j: I2jState) -> usize {
        let unwind_sp = bp - code.total_frame_size;
        self.regs.sp = unwind_sp;
        self.frames.push(StackFrame::Compiled(CompiledFrame {
            code,
            bp,
            sp: unwind_sp,
            outgoing_args: 0,
            i2j,
            registers: RegisterMap::default(),
        }));
        self.frames.len() - 1
    }

    /// Push arguments for a call out of the topmost compiled frame.
    ///
    /// `args` lists argument 0 first; it ends up at the highest slot.
    pub fn push_outgoing_args(&mut self, args: &[Word]) {
        let Some(StackFrame::Compiled(frame)) = self.frames.last_mut() else {
            panic!("outgoing arguments need a compiled frame on top");
        };
        let unwind_sp = frame.unwind_sp();
        frame.sp = unwind_sp - args.len();
        frame.outgoing_args = args.len();
        let sp = frame.sp;
        for (i, &value) in args.iter().enumerate() {
            self.stack.write(unwind_sp - 1 - i, value);
        }
        self.regs.sp = sp;
    }

    /// Enter a runtime helper from the topmost compiled frame.
    pub fn push_resolve_frame(&mut self, context: Option<ResolveContext>, return_pc: Word) -> usize {
        let sp = match self.frames.last() {
            Some(StackFrame::Compiled(frame)) => frame.sp,
            _ => panic!("resolve frame needs a compiled frame on top"),
        };
        let base = sp - RESOLVE_FRAME_SLOTS;
        let frame = ResolveFrame { context, base };
        self.stack.write(base, ResolveContext::to_word(context));
        self.stack.write(frame.return_address_slot(), return_pc);
        self.regs.sp = base;
        self.frames.push(StackFrame::Resolve(frame));
        self.frames.len() - 1
    }

    /// Leave the topmost resolve frame.
    pub fn pop_resolve_frame(&mut self) -> Option<ResolveFrame> {
        let Some(StackFrame::Resolve(frame)) = self.frames.last().cloned() else {
            return None;
        };
        self.frames.pop();
        self.regs.sp = frame.base + RESOLVE_FRAME_SLOTS;
        Some(frame)
    }

    /// Return from the topmost compiled frame, yielding its return address.
    pub fn pop_compiled_frame(&mut self) -> Option<(CompiledFrame, Word)> {
        let Some(StackFrame::Compiled(_)) = self.frames.last() else {
            return None;
        };
        let Some(StackFrame::Compiled(frame)) = self.frames.pop() else {
            return None;
        };
        let return_address = self.stack.read(frame.bp);
        let a0 = frame.a0();
        match self.frames.last_mut() {
            Some(StackFrame::Compiled(caller)) => {
                caller.sp = caller.unwind_sp();
                caller.outgoing_args = 0;
                self.regs.sp = caller.sp;
            }
            _ => self.regs.sp = a0 + 1,
        }
        Some((frame, return_address))
    }

    /// Return from an interpreter frame into a compiled caller through the
    /// J2I frame beneath it, yielding the compiled return address.
    pub fn pop_interpreter_frame_to_compiled(&mut self) -> Option<Word> {
        let len = self.frames.len();
        if len < 3 {
            return None;
        }
        let (StackFrame::Bytecode(_), StackFrame::J2i(layout)) =
            (&self.frames[len - 1], &self.frames[len - 2])
        else {
            return None;
        };
        let layout = *layout;
        let return_address = self.stack.read(layout.return_address());
        let i2j = I2jState::read_from(&self.stack, layout);
        self.regs.j2i_frame = self.stack.read_ref(layout.previous_j2i()).map(SlotRef::index);
        self.regs.a0 = i2j_index(i2j.a0);
        self.regs.pc = BytecodePc::decode(i2j.pc);
        self.regs.literals = MethodId::from_word(i2j.literals);
        self.frames.truncate(len - 2);
        match self.frames.last_mut() {
            Some(StackFrame::Compiled(caller)) => {
                caller.sp = caller.unwind_sp();
                caller.outgoing_args = 0;
                self.regs.sp = caller.sp;
            }
            _ => return None,
        }
        Some(return_address)
    }

    /// Drop every frame above `index`, as exception unwinding does.
    pub fn unwind_to(&mut self, index: usize) {
        self.frames.truncate(index + 1);
        match self.frames.last_mut() {
            Some(StackFrame::Compiled(frame)) => {
                frame.sp = frame.unwind_sp();
                frame.outgoing_args = 0;
                self.regs.sp = frame.sp;
            }
            Some(other) => self.regs.sp = other.lowest_slot(),
            None => self.regs.sp = self.stack.len(),
        }
    }

    /// J2I frame pointed to by the thread's J2I register.
    pub fn current_j2i(&self) -> Option<J2iFrameLayout> {
        self.regs.j2i_frame.map(J2iFrameLayout::from_frame_pointer)
    }

    // =========================================================================
    // Diagnostics
    // =========================================================================

    /// Log every frame at `trace` level.
    pub fn dump_stack(&self, message: &str) {
        if !log::log_enabled!(log::Level::Trace) {
            return;
        }
        log::trace!("{} stack dump: {message}", self.id);
        for (index, frame) in self.frames.iter().enumerate().rev() {
            match frame {
                StackFrame::Bytecode(frame) => {
                    log::trace!("  [{index}] bytecode {} a0={} locals={}", frame.method, frame.a0, frame.locals)
                }
                StackFrame::Compiled(frame) => log::trace!(
                    "  [{index}] compiled {} bp={} sp={} pc={:#x}",
                    frame.code.id,
                    frame.bp,
                    frame.sp,
                    self.resume_slot_of(index).map_or(0, |slot| self.stack.read(slot))
                ),
                StackFrame::J2i(layout) => {
                    log::trace!("  [{index}] j2i fp={}", layout.frame_pointer())
                }
                StackFrame::Resolve(frame) => {
                    log::trace!("  [{index}] resolve base={} context={:?}", frame.base, frame.context)
                }
            }
        }
        log::trace!(
            "  regs sp={} a0={} pc={} literals={} j2i={:?} pending={}",
            self.regs.sp,
            self.regs.a0,
            self.regs.pc,
            self.regs.literals,
            self.regs.j2i_frame,
            self.decompilations.len()
        );
    }
}

fn i2j_index(word: Word) -> SlotIndex {
    SlotRef::decode(word).map_or(0, SlotRef::index)
}

impl fmt::Debug for VmThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VmThread")
            .field("id", &self.id)
            .field("regs", &self.regs)
            .field("frames", &self.frames.len())
            .field("pending", &self.decompilations.len())
            .finish()
    }
}
