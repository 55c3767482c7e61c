//! Decompilation Engine.
//!
//! Turns compiled frames back into interpreter frames. A frame is first
//! *scheduled*: its live state is captured into an OSR buffer and its saved
//! return address is replaced with a continuation label. When control next
//! reaches the frame, the label's handler rebuilds one interpreter frame per
//! inlined method and resumes in the interpreter.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                            Scheduling                                   │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  breakpoint / hotswap / inspect ──▶ add_decompilation                   │
//! │                                       │                                 │
//! │                                       ├─ merge into existing record     │
//! │                                       └─ capture:                       │
//! │                                            OSR buffer  (per-frame)      │
//! │                                            monitor enter records        │
//! │                                            saved PC ──▶ label           │
//! │                                                                         │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                            Consumption                                  │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  callee returns / helper returns ──▶ label handler                      │
//! │                                       │                                 │
//! │                                       ├─ fetch_and_unstack              │
//! │                                       ├─ perform_decompile              │
//! │                                       │    outer frame (bytecode / J2I) │
//! │                                       │    inlined frames, outermost 1st│
//! │                                       │    monitor records relinked     │
//! │                                       └─ free_record (maybe retained)   │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Records are kept per thread, sorted by frame address so the innermost
//! scheduled frame is always at the head.

pub mod breakpoint;
pub mod capture;
pub mod dispatch;
pub mod inspect;
pub mod osr;
pub mod reason;
pub mod rebuild;
pub mod record;
pub mod stats;

pub use breakpoint::{BreakpointRegistry, BreakpointedMethod};
pub use capture::{
    MIN_OSR_SCRATCH_WORDS, add_decompilation, cancel_record, ensure_osr_buffer_size, free_record,
    induce_osr_on_current_thread, rounded_scratch_words, uses_osr,
};
pub use dispatch::{
    ContinuationLabel, ExitPoint, I2J_RETURN_ADDRESS, ResumeAction, invoke_return_kind,
    on_compiled_return, on_exception_handler_entry, on_interpreter_return_to_compiled,
    on_resolve_return, select_continuation,
};
pub use inspect::{
    LocalSlotAddress, add_decompilation_for_frame_pop, frame_pop_notification_added,
    jit_clean_up_decompilation_stack, jit_exception_caught, local_slot_address,
    stack_locals_modified,
};
pub use osr::{
    OSR_BUFFER_HEADER_WORDS, OSR_FRAME_HEADER_WORDS, OsrBuffer, OsrFrame, OsrFrameFlags,
    OsrFrameMut, OsrFramesMut, osr_frame_words, osr_frames_words, pending_stack_height,
};
pub use reason::DecompReason;
pub use rebuild::{
    DecompileState, capture_decompile_state, decompile_method_for_frame_pop, fetch_and_unstack,
    fix_saved_pc, jit_decompile_method, perform_decompile,
};
pub use record::{AddOutcome, DecompilationRecord, DecompilationStore, FrameIdentity};
pub use stats::{DecompStats, DecompStatsSnapshot};
