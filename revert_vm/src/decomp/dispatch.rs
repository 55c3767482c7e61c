//! Continuation labels and resume dispatch.
//!
//! Installing a decompilation overwrites the frame's resume address with a
//! label. When control reaches the label, the owning thread rebuilds the
//! frame as interpreter frames and continues according to the label kind.
//!
//! ```text
//!   resolve context          label                      after rebuild
//!   ───────────────────────  ─────────────────────────  ──────────────────────────
//!   none (at an invoke)      DecompileOnReturn(kind)    push result, pc += 3
//!   stack overflow + sync    BeforeMethodMonitorEnter   enter the method monitor
//!   stack overflow           BeforeReportMethodEnter    report method enter
//!   method monitor enter     BeforeReportMethodEnter    report method enter
//!   monitor enter            AfterMonitorEnter          step over monitorenter
//!   allocation               AfterAllocation            push object, step over
//!   exception catch          AtExceptionCatch           push exception
//!   anything else            AtCurrentPc                run the current bytecode
//! ```

use std::fmt;
use std::sync::Arc;

use revert_core::{
    Bytecode, DecompError, DecompResult, Method, MethodId, ReturnKind, ReturnValue, Word,
};

use super::capture::free_record;
use super::rebuild::{
    capture_decompile_state, fetch_and_unstack, fix_saved_pc, jit_decompile_method,
    perform_decompile,
};
use crate::frame::{ResolveContext, StackFrame};
use crate::monitor::MonitorRecordPool;
use crate::thread::VmThread;
use crate::vm::VmShared;

// =============================================================================
// Addresses
// =============================================================================

const LABEL_BASE: Word = 0xFFFF_FF00_0000_0000;
const EXIT_POINT_BASE: Word = 0xFFFF_FE00_0000_0000;

/// Return address stored by an interpreter-to-compiled call.
pub const I2J_RETURN_ADDRESS: Word = 0xFFFF_FD00_0000_0000;

/// Where control goes once a frame with a pending decompilation is resumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContinuationLabel {
    /// A callee returned a value of the given kind.
    DecompileOnReturn(ReturnKind),
    /// Re-execute the bytecode at the current pc.
    AtCurrentPc,
    /// Enter the monitor of a synchronized method, then report method enter.
    BeforeMethodMonitorEnter,
    /// Report method enter.
    BeforeReportMethodEnter,
    /// A `monitorenter` completed.
    AfterMonitorEnter,
    /// An allocation helper completed.
    AfterAllocation,
    /// An exception is about to be caught in the frame.
    AtExceptionCatch,
}

impl ContinuationLabel {
    /// Address written into the frame's resume slot.
    pub const fn address(self) -> Word {
        match self {
            Self::DecompileOnReturn(kind) => LABEL_BASE + kind as Word,
            Self::AtCurrentPc => LABEL_BASE + 0x10,
            Self::BeforeMethodMonitorEnter => LABEL_BASE + 0x11,
            Self::BeforeReportMethodEnter => LABEL_BASE + 0x12,
            Self::AfterMonitorEnter => LABEL_BASE + 0x13,
            Self::AfterAllocation => LABEL_BASE + 0x14,
            Self::AtExceptionCatch => LABEL_BASE + 0x15,
        }
    }

    /// Label whose address is `address`.
    pub fn from_address(address: Word) -> Option<Self> {
        let offset = address.checked_sub(LABEL_BASE)?;
        match offset {
            0..=5 => ReturnKind::from_u8(offset as u8).map(Self::DecompileOnReturn),
            0x10 => Some(Self::AtCurrentPc),
            0x11 => Some(Self::BeforeMethodMonitorEnter),
            0x12 => Some(Self::BeforeReportMethodEnter),
            0x13 => Some(Self::AfterMonitorEnter),
            0x14 => Some(Self::AfterAllocation),
            0x15 => Some(Self::AtExceptionCatch),
            _ => None,
        }
    }
}

impl fmt::Display for ContinuationLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DecompileOnReturn(kind) => write!(f, "decompile-on-return({kind})"),
            Self::AtCurrentPc => f.write_str("at-current-pc"),
            Self::BeforeMethodMonitorEnter => f.write_str("before-method-monitor-enter"),
            Self::BeforeReportMethodEnter => f.write_str("before-report-method-enter"),
            Self::AfterMonitorEnter => f.write_str("after-monitor-enter"),
            Self::AfterAllocation => f.write_str("after-allocation"),
            Self::AtExceptionCatch => f.write_str("at-exception-catch"),
        }
    }
}

/// Interpreter entry a J2I frame returns through, by return kind.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExitPoint {
    /// No value.
    Exit0 = 0,
    /// One-slot integral or reference value.
    Exit1 = 1,
    /// Double.
    ExitD = 2,
    /// Float.
    ExitF = 3,
    /// Two-slot integral value, or a reference on 64-bit targets.
    ExitJ = 4,
}

impl ExitPoint {
    /// Exit point for a method returning `kind`.
    pub const fn for_return(kind: ReturnKind) -> Self {
        match kind {
            ReturnKind::Void => Self::Exit0,
            ReturnKind::Double => Self::ExitD,
            ReturnKind::Float => Self::ExitF,
            ReturnKind::Long | ReturnKind::Reference => Self::ExitJ,
            ReturnKind::Int => Self::Exit1,
        }
    }

    /// Address stored in the J2I frame.
    #[inline]
    pub const fn address(self) -> Word {
        EXIT_POINT_BASE + self as Word
    }

    /// Exit point whose address is `address`.
    pub fn from_address(address: Word) -> Option<Self> {
        match address.checked_sub(EXIT_POINT_BASE)? {
            0 => Some(Self::Exit0),
            1 => Some(Self::Exit1),
            2 => Some(Self::ExitD),
            3 => Some(Self::ExitF),
            4 => Some(Self::ExitJ),
            _ => None,
        }
    }
}

// =============================================================================
// Label Selection
// =============================================================================

/// Pick the label for a frame about to get a decompilation record.
///
/// `outer` is the frame's outermost method; `invoke_returns` is the return
/// kind of the invoke the innermost frame is stopped at, if any. A frame with
/// no resolve context must be stopped at an invoke.
pub fn select_continuation(
    resolve: Option<ResolveContext>,
    outer: &Method,
    invoke_returns: Option<ReturnKind>,
) -> ContinuationLabel {
    match resolve {
        Some(ResolveContext::StackOverflow) if outer.is_synchronized() => {
            ContinuationLabel::BeforeMethodMonitorEnter
        }
        Some(ResolveContext::StackOverflow | ResolveContext::MethodMonitorEnter) => {
            ContinuationLabel::BeforeReportMethodEnter
        }
        Some(ResolveContext::MonitorEnter) => ContinuationLabel::AfterMonitorEnter,
        Some(ResolveContext::Allocation) => ContinuationLabel::AfterAllocation,
        Some(ResolveContext::ExceptionCatch) => ContinuationLabel::AtExceptionCatch,
        Some(ResolveContext::FailedMethodMonitorEnter | ResolveContext::Generic) => {
            ContinuationLabel::AtCurrentPc
        }
        None => match invoke_returns {
            Some(kind) => ContinuationLabel::DecompileOnReturn(kind),
            None => panic!("{outer} decompiled outside a call with no resolve context"),
        },
    }
}

/// Return kind of the invoke at `offset` in `method`.
pub fn invoke_return_kind(method: &Method, offset: u32) -> Option<ReturnKind> {
    match method.bytecode_at(offset)?.op {
        Bytecode::Invoke { returns, .. } => Some(returns),
        _ => None,
    }
}

// =============================================================================
// Handlers
// =============================================================================

/// What the interpreter does once a handler has rebuilt the frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeAction {
    /// Run the bytecode at the thread's pc.
    ExecuteBytecode,
    /// Enter the monitor of the given synchronized method, then report method enter.
    EnterMethodMonitor(MethodId),
    /// Report method enter for the given method.
    ReportMethodEnter(MethodId),
    /// No decompilation was due; continue compiled code at this address.
    Jump(Word),
}

/// Return from the topmost compiled frame with `value`.
///
/// If the caller has a pending decompilation the return lands on its label
/// and the caller is rebuilt with the value on its operand stack.
pub fn on_compiled_return(
    shared: &VmShared,
    thread: &mut VmThread,
    value: ReturnValue,
) -> DecompResult<ResumeAction> {
    let (_, return_address) = thread.pop_compiled_frame().ok_or(DecompError::NotCompiled)?;
    thread.return_value = value;
    resume_after_return(shared, thread, return_address)
}

/// Return from an interpreter frame into its compiled caller with `value`.
pub fn on_interpreter_return_to_compiled(
    shared: &VmShared,
    thread: &mut VmThread,
    value: ReturnValue,
) -> DecompResult<ResumeAction> {
    let return_address = thread
        .pop_interpreter_frame_to_compiled()
        .ok_or(DecompError::NotCompiled)?;
    thread.return_value = value;
    resume_after_return(shared, thread, return_address)
}

fn resume_after_return(
    shared: &VmShared,
    thread: &mut VmThread,
    return_address: Word,
) -> DecompResult<ResumeAction> {
    match ContinuationLabel::from_address(return_address) {
        Some(ContinuationLabel::DecompileOnReturn(kind)) => decompile_on_return(shared, thread, kind),
        _ => Ok(ResumeAction::Jump(return_address)),
    }
}

fn decompile_on_return(
    shared: &VmShared,
    thread: &mut VmThread,
    kind: ReturnKind,
) -> DecompResult<ResumeAction> {
    let record = fetch_and_unstack(thread)?;
    thread.push_resolve_frame(None, record.pc());
    jit_decompile_method(shared, thread, record)?;

    let slots = kind.slot_count();
    let value = thread.return_value;
    thread.regs.sp -= slots;
    thread.stack.write_slice(thread.regs.sp, value.slots(slots));
    thread.regs.pc.advance(3);
    Ok(ResumeAction::ExecuteBytecode)
}

/// Return from the runtime helper whose resolve frame is on top.
///
/// If the frame below has a pending decompilation the helper's return
/// address is a label; the frame is rebuilt and the label's continuation
/// runs in the interpreter.
pub fn on_resolve_return(shared: &VmShared, thread: &mut VmThread) -> DecompResult<ResumeAction> {
    let Some(StackFrame::Resolve(frame)) = thread.top_frame().cloned() else {
        return Err(DecompError::NotCompiled);
    };
    let return_address = thread.stack.read(frame.return_address_slot());
    let Some(label) = ContinuationLabel::from_address(return_address) else {
        thread.pop_resolve_frame();
        return Ok(ResumeAction::Jump(return_address));
    };
    log::debug!("{} resuming through {label}", thread.id);

    match label {
        ContinuationLabel::AtCurrentPc => {
            decompile_resolved(shared, thread)?;
            Ok(ResumeAction::ExecuteBytecode)
        }
        ContinuationLabel::BeforeMethodMonitorEnter => {
            let method = decompile_resolved(shared, thread)?;
            Ok(ResumeAction::EnterMethodMonitor(method))
        }
        ContinuationLabel::BeforeReportMethodEnter => {
            let method = decompile_resolved(shared, thread)?;
            Ok(ResumeAction::ReportMethodEnter(method))
        }
        ContinuationLabel::AfterMonitorEnter => {
            decompile_resolved(shared, thread)?;
            let pc = thread.regs.pc;
            let at_monitor_enter = shared
                .classes
                .read()
                .method(pc.method)?
                .bytecode_at(pc.offset)
                .is_some_and(|info| info.op == Bytecode::MonitorEnter);
            if at_monitor_enter {
                thread.regs.pc.advance(Bytecode::MonitorEnter.length());
                Ok(ResumeAction::ExecuteBytecode)
            } else {
                // The monitor was the method's own; it was entered in the prologue.
                Ok(ResumeAction::ReportMethodEnter(thread.regs.literals))
            }
        }
        ContinuationLabel::AfterAllocation => {
            let Some(object) = thread.allocated_object.take() else {
                panic!("{} reached the allocation continuation with no allocated object", thread.id);
            };
            decompile_resolved(shared, thread)?;
            let pc = thread.regs.pc;
            let length = shared
                .classes
                .read()
                .method(pc.method)?
                .bytecode_at(pc.offset)
                .map_or(0, |info| info.op.length());
            thread.regs.sp -= 1;
            thread.stack.write(thread.regs.sp, object.to_word());
            thread.regs.pc.advance(length);
            Ok(ResumeAction::ExecuteBytecode)
        }
        ContinuationLabel::AtExceptionCatch => {
            thread.pop_resolve_frame();
            on_exception_handler_entry(shared, thread)
        }
        ContinuationLabel::DecompileOnReturn(_) => {
            thread.pop_resolve_frame();
            Ok(ResumeAction::Jump(return_address))
        }
    }
}

/// Rebuild the frame below the resolve frame on top, returning the record's method.
fn decompile_resolved(shared: &VmShared, thread: &mut VmThread) -> DecompResult<MethodId> {
    let record = fetch_and_unstack(thread)?;
    fix_saved_pc(thread, &record);
    let method = record.method();
    jit_decompile_method(shared, thread, record)?;
    Ok(method)
}

/// Enter the catch block of the topmost compiled frame in the interpreter.
///
/// Control arrives here when [`crate::decomp::jit_exception_caught`] handed
/// out the catch label. The record's pc is the handler's compiled address;
/// inlined frames the exception already left are discarded, and the
/// remaining innermost frame resumes at the handler with only the exception
/// on its operand stack.
pub fn on_exception_handler_entry(
    shared: &VmShared,
    thread: &mut VmThread,
) -> DecompResult<ResumeAction> {
    let frame_index = thread.frames().len().checked_sub(1).ok_or(DecompError::NotCompiled)?;
    let code = thread
        .compiled_frame(frame_index)
        .map(|frame| Arc::clone(&frame.code))
        .ok_or(DecompError::NotCompiled)?;
    let handler_pc = thread
        .decompilations
        .head()
        .ok_or(DecompError::NoPendingDecompilation)?
        .pc();
    let maps = code
        .metadata
        .maps_from_pc(handler_pc)
        .ok_or(DecompError::MissingMaps { pc: handler_pc })?;
    let live_frames = maps.frame_count();
    let offset = maps.innermost_bytecode_offset();

    let mut record = fetch_and_unstack(thread)?;
    thread.push_resolve_frame(Some(ResolveContext::ExceptionCatch), handler_pc);
    let state = match capture_decompile_state(thread, 0) {
        Ok(state) => state,
        Err(err) => {
            free_record(shared, thread, record, false);
            return Err(err);
        }
    };

    let captured = record.frame_count();
    assert!(
        live_frames <= captured,
        "catch block at {handler_pc:#x} is deeper than the captured frames"
    );
    let first = captured - live_frames;
    for index in 0..first {
        let head = record.buffer().frame(index).monitor_records();
        thread.monitor_pool.release_chain(head);
        record.buffer_mut().frame_mut(index).set_monitor_records(None);
    }
    {
        let mut innermost = record.buffer_mut().frame_mut(first);
        innermost.set_bytecode_offset(offset);
        innermost.set_pending(0);
    }

    let result = perform_decompile(shared, thread, &state, &mut record, first);
    free_record(shared, thread, record, true);
    result?;

    let exception = thread.jit_exception.take();
    thread.regs.sp -= 1;
    thread.stack.write(thread.regs.sp, exception.map_or(0, |o| o.to_word()));
    Ok(ResumeAction::ExecuteBytecode)
}
