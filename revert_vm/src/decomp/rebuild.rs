//! Frame reconstruction.
//!
//! A rebuild replaces one compiled frame with the interpreter frames recorded
//! in its decompilation record. The outermost frame reuses the compiled
//! frame's argument slots in place; every inlined frame is pushed below it.
//!
//! ```text
//!   before                         after (compiled caller)
//!   ┌──────────────────┐           ┌──────────────────┐
//!   │ caller (jit)     │           │ caller (jit)     │
//!   ├──────────────────┤           ├──────────────────┤
//!   │ args             │           │ args             │ outer frame locals
//!   │ return address   │           │ temps            │
//!   │ compiled body    │  ──────▶  ├──────────────────┤
//!   │ outgoing args    │           │ J2I frame        │
//!   └──────────────────┘           │ pending operands │
//!                                  ├──────────────────┤
//!                                  │ inlined frames   │
//!                                  ├──────────────────┤
//!                                  │ outgoing args    │
//!                                  └──────────────────┘
//! ```
//!
//! With an interpreter caller a three-word bytecode frame header takes the
//! place of the J2I frame.

use std::sync::Arc;

use smallvec::SmallVec;

use revert_core::{
    BytecodePc, DecompError, DecompResult, FrameTag, Method, ObjectRef, SlotIndex, SlotRef, Word,
};

use super::capture::free_record;
use super::dispatch::ExitPoint;
use super::osr::{OsrBuffer, OsrFrameFlags};
use super::record::DecompilationRecord;
use crate::frame::{BytecodeFrame, ResolveContext, StackFrame};
use crate::monitor::{MonitorRecordId, MonitorRecordPool};
use crate::stack::{
    BYTECODE_FRAME_SLOTS, BytecodeFrameHeader, J2I_SPECIAL_FLAGS, J2iFrameLayout, RegisterMap,
};
use crate::thread::{ThreadRegisters, VmThread};
use crate::vm::VmShared;
use crate::walk::{CompiledFrameInfo, ShadowStackWalker, StackWalker};

// =============================================================================
// Decompile State
// =============================================================================

/// Everything a rebuild needs to know about the frame being replaced and its caller.
#[derive(Debug, Clone)]
pub struct DecompileState {
    /// The compiled frame.
    pub frame: CompiledFrameInfo,
    /// Whether the caller runs in the interpreter.
    pub caller_is_bytecode: bool,
    /// Callee-preserved register values the compiled caller expects back.
    pub caller_registers: RegisterMap,
}

/// Describe the `skip`-th visible frame, which must be compiled.
pub fn capture_decompile_state(thread: &VmThread, skip: usize) -> DecompResult<DecompileState> {
    let frame = ShadowStackWalker
        .visible_frame(thread, skip)
        .and_then(|frame| frame.compiled().cloned())
        .ok_or(DecompError::NotCompiled)?;

    let caller = frame
        .index
        .checked_sub(1)
        .and_then(|index| thread.compiled_frame(index));
    Ok(DecompileState {
        caller_is_bytecode: caller.is_none(),
        caller_registers: caller.map(|c| c.registers).unwrap_or_default(),
        frame,
    })
}

// =============================================================================
// Record Consumption
// =============================================================================

/// Remove the head record so it can be consumed.
pub fn fetch_and_unstack(thread: &mut VmThread) -> DecompResult<DecompilationRecord> {
    thread
        .decompilations
        .pop_next()
        .ok_or(DecompError::NoPendingDecompilation)
}

/// Put the original resume address back where the label was installed.
#[inline]
pub fn fix_saved_pc(thread: &mut VmThread, record: &DecompilationRecord) {
    thread.stack.write(record.pc_slot, record.pc);
}

/// Rebuild the topmost visible frame from `record` and free the record.
pub fn jit_decompile_method(
    shared: &VmShared,
    thread: &mut VmThread,
    mut record: DecompilationRecord,
) -> DecompResult<()> {
    let state = match capture_decompile_state(thread, 0) {
        Ok(state) => state,
        Err(err) => {
            free_record(shared, thread, record, false);
            return Err(err);
        }
    };
    let result = perform_decompile(shared, thread, &state, &mut record, 0);
    free_record(shared, thread, record, true);
    result
}

/// Rebuild the `skip`-th visible frame so a pending frame pop can run in
/// the interpreter.
///
/// The head record must belong to that frame.
pub fn decompile_method_for_frame_pop(
    shared: &VmShared,
    thread: &mut VmThread,
    skip: usize,
) -> DecompResult<()> {
    let mut record = fetch_and_unstack(thread)?;
    fix_saved_pc(thread, &record);
    let state = match capture_decompile_state(thread, skip) {
        Ok(state) => state,
        Err(err) => {
            free_record(shared, thread, record, false);
            return Err(err);
        }
    };
    assert_eq!(
        state.frame.bp, record.frame,
        "frame-pop decompilation of a frame without the head record"
    );
    let result = perform_decompile(shared, thread, &state, &mut record, 0);
    free_record(shared, thread, record, true);
    result
}

// =============================================================================
// Perform
// =============================================================================

/// Replace the compiled frame described by `state` with the interpreter
/// frames `first..` of `record`.
///
/// Frames are written outermost first. The compiled frame's outgoing
/// arguments are carried over to the top of the rebuilt stack.
pub fn perform_decompile(
    shared: &VmShared,
    thread: &mut VmThread,
    state: &DecompileState,
    record: &mut DecompilationRecord,
    first: usize,
) -> DecompResult<()> {
    let count = record.frame_count();
    assert!(first < count, "no frames left to rebuild");
    let code = &state.frame.code;

    // Resolve everything that can fail before the stack is touched.
    let (methods, class_object) = {
        let classes = shared.classes.read();
        let mut methods: SmallVec<[Arc<Method>; 4]> = SmallVec::with_capacity(count);
        for index in 0..count - 1 {
            let id = record.buffer.frame(index).method();
            methods.push(Arc::clone(classes.method(id)?));
        }
        methods.push(Arc::clone(&code.method));
        let outer = &code.method;
        let class_object = match state.frame.resolve {
            Some(ResolveContext::StackOverflow) if outer.is_synchronized() && outer.is_static() => {
                let class = classes
                    .class(outer.class)
                    .ok_or(DecompError::UnknownMethod(outer.id))?;
                Some(class.class_object)
            }
            _ => None,
        };
        (methods, class_object)
    };

    if shared.config.verbose_stack_dump {
        thread.dump_stack("before decompilation");
    }

    if !record.uses_osr && state.frame.resolve != Some(ResolveContext::StackOverflow) {
        assert!(
            shared.config.full_speed_debug,
            "legacy decompilation of {} without full-speed debug",
            code.method
        );
        assert_eq!(count, 1, "legacy decompilation of inlined frames in {}", code.method);
        let mut frame = record.buffer.frame_mut(0);
        let temps = frame.view().locals() - code.method.arg_count as usize;
        let pending = frame.view().pending();
        let temp_base = state.frame.temp_base();
        frame
            .pending_and_temps_mut(temps)
            .copy_from_slice(thread.stack.slice(temp_base - pending..temp_base + temps));
    }

    let outgoing: SmallVec<[Word; 8]> = thread
        .stack
        .slice(state.frame.sp..state.frame.sp + state.frame.outgoing_args)
        .into();

    for index in (first..count).rev() {
        if index == count - 1 {
            build_outer_frame(thread, state, &record.buffer, class_object);
        } else {
            build_bytecode_frame(thread, &record.buffer, index);
        }
        relink_monitors(thread, &mut record.buffer, index, &methods[index]);
        let frame = record.buffer.frame(index);
        if frame.flags().contains(OsrFrameFlags::NOTIFY_FRAME_POP) {
            let tag_slot = thread.regs.a0 - frame.locals();
            thread.stack.tag(tag_slot, FrameTag::REPORT_FRAME_POP);
        }
    }

    thread.regs.sp -= outgoing.len();
    thread.stack.write_slice(thread.regs.sp, &outgoing);

    shared.stats.frames_rebuilt(count - first);
    log::debug!(
        "{} rebuilt {} interpreter frame(s) for {} at {}",
        thread.id,
        count - first,
        code.method,
        thread.regs.pc
    );
    if shared.config.verbose_stack_dump {
        thread.dump_stack("after decompilation");
    }
    Ok(())
}

/// Replace the compiled frame itself with the outermost interpreter frame.
fn build_outer_frame(
    thread: &mut VmThread,
    state: &DecompileState,
    buffer: &OsrBuffer,
    class_object: Option<ObjectRef>,
) {
    let info = &state.frame;
    let method = &info.code.method;
    let frame = buffer.frame(buffer.frame_count() - 1);
    let argc = method.arg_count as usize;
    let locals = frame.locals();
    let temps = locals - argc;
    let pending = frame.pending();

    let return_address = thread.stack.read(info.bp);
    let mut a0 = info.a0;
    let mut temp_base = a0 + 1 - locals;

    if state.caller_is_bytecode {
        // Compiled code may have been entered with the arguments shifted.
        let correct = SlotRef::decode(info.i2j.return_sp).map_or(temp_base, |sp| sp.index() - locals);
        if correct != temp_base {
            thread
                .stack
                .copy_within(temp_base + temps..temp_base + temps + argc, correct + temps);
            temp_base = correct;
            a0 = correct + locals - 1;
        }
    }

    if info.resolve == Some(ResolveContext::StackOverflow) {
        // The prologue never ran, so no temp holds a value yet.
        thread.stack.fill(temp_base..temp_base + temps, 0);
        if method.is_synchronized() {
            let sync = match class_object {
                Some(object) if method.is_static() => object.to_word(),
                _ => thread.stack.read(a0),
            };
            thread.stack.write(temp_base, sync);
        } else if method.has_hidden_slot() {
            let receiver = thread.stack.read(a0);
            thread.stack.write(temp_base, receiver);
        }
    } else {
        thread.stack.write_slice(temp_base, &frame.locals_region()[..temps]);
    }

    let header_base = if state.caller_is_bytecode {
        temp_base - BYTECODE_FRAME_SLOTS
    } else {
        temp_base - J2iFrameLayout::SLOTS
    };
    let pending_base = header_base - pending;
    thread.stack.write_slice(pending_base, frame.pending_region());

    let mut j2i_frame = info.j2i_frame;
    let j2i = if state.caller_is_bytecode {
        let i2j = info.i2j;
        BytecodeFrameHeader::from_base(header_base).write(&mut thread.stack, i2j.pc, i2j.literals, i2j.a0);
        None
    } else {
        let layout = J2iFrameLayout::from_base(header_base);
        write_j2i_frame(thread, state, layout, return_address, temp_base + temps);
        j2i_frame = Some(layout.frame_pointer());

        // A label installed for the caller now lives in the J2I frame.
        if let Some(head) = thread.decompilations.head_mut() {
            if head.pc_slot == info.bp {
                head.pc_slot = layout.return_address();
            }
        }
        Some(layout)
    };

    thread.regs = ThreadRegisters {
        sp: pending_base,
        a0,
        pc: BytecodePc::new(frame.method(), frame.bytecode_offset()),
        literals: method.id,
        j2i_frame,
    };

    if info.resolve == Some(ResolveContext::FailedMethodMonitorEnter) {
        thread.stack.tag(temp_base - 1, FrameTag::INVISIBLE);
    }

    thread.truncate_frames(info.index);
    if let Some(layout) = j2i {
        thread.push_frame(StackFrame::J2i(layout));
    }
    thread.push_frame(StackFrame::Bytecode(BytecodeFrame {
        method: frame.method(),
        a0,
        locals,
    }));
}

fn write_j2i_frame(
    thread: &mut VmThread,
    state: &DecompileState,
    layout: J2iFrameLayout,
    return_address: Word,
    return_sp: SlotIndex,
) {
    let info = &state.frame;
    let stack = &mut thread.stack;
    for (i, &value) in state.caller_registers.iter().enumerate() {
        stack.write(layout.preserved(i), value);
    }
    stack.write(
        layout.exit_point(),
        ExitPoint::for_return(info.code.method.return_kind).address(),
    );
    stack.write(layout.special_flags(), J2I_SPECIAL_FLAGS);
    info.i2j.write_to(stack, layout);
    stack.write(layout.previous_j2i(), SlotRef::encode_opt(info.j2i_frame));
    stack.write(layout.return_address(), return_address);
    stack.write(layout.tagged_return_sp(), SlotRef::new(return_sp).encode());
}

/// Push an inlined frame below the current interpreter state.
fn build_bytecode_frame(thread: &mut VmThread, buffer: &OsrBuffer, index: usize) {
    let frame = buffer.frame(index);
    let locals = frame.locals();
    let a0 = thread.regs.sp - 1;
    let temp_base = thread.regs.sp - locals;
    thread.stack.write_slice(temp_base, frame.locals_region());

    let header = BytecodeFrameHeader::from_base(temp_base - BYTECODE_FRAME_SLOTS);
    header.write(
        &mut thread.stack,
        thread.regs.pc.encode(),
        thread.regs.literals.to_word(),
        SlotRef::new(thread.regs.a0).encode(),
    );
    let sp = header.base() - frame.pending();
    thread.stack.write_slice(sp, frame.pending_region());

    thread.regs = ThreadRegisters {
        sp,
        a0,
        pc: BytecodePc::new(frame.method(), frame.bytecode_offset()),
        literals: frame.method(),
        j2i_frame: thread.regs.j2i_frame,
    };
    thread.push_frame(StackFrame::Bytecode(BytecodeFrame {
        method: frame.method(),
        a0,
        locals,
    }));
}

/// Hand the frame's monitor records over to the thread.
///
/// A synchronized method's own monitor is tracked by its hidden slot, so its
/// record is dropped; only the first match is, as the same object may also be
/// locked explicitly.
fn relink_monitors(thread: &mut VmThread, buffer: &mut OsrBuffer, index: usize, method: &Method) {
    let frame = buffer.frame(index);
    let Some(head) = frame.monitor_records() else {
        return;
    };
    let a0 = thread.regs.a0;
    let mut sync = if method.is_synchronized() {
        ObjectRef::from_word(thread.stack.read(a0 + 1 - frame.locals()))
    } else {
        None
    };

    let pool = &mut thread.monitor_pool;
    let mut kept: SmallVec<[MonitorRecordId; 4]> = SmallVec::new();
    for id in pool.chain(Some(head)) {
        let object = pool.get(id).map(|record| record.object);
        if sync.is_some() && object == sync {
            sync = None;
            pool.release(id);
            continue;
        }
        if let Some(record) = pool.get_mut(id) {
            record.frame_base = Some(a0);
        }
        kept.push(id);
    }

    for pair in kept.windows(2) {
        if let Some(record) = pool.get_mut(pair[0]) {
            record.next = Some(pair[1]);
        }
    }
    if let Some(&last) = kept.last() {
        if let Some(record) = pool.get_mut(last) {
            record.next = thread.monitor_records;
        }
        thread.monitor_records = Some(kept[0]);
    }
    buffer.frame_mut(index).set_monitor_records(None);
}
