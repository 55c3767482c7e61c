//! Revert VM
//!
//! Deoptimization and on-stack replacement for a stack-based bytecode VM
//! with an optimizing JIT. Compiled frames, including frames with inlined
//! callees, are scheduled for decompilation when a debugger or the runtime
//! invalidates them, and are rebuilt as interpreter frames the next time
//! control reaches them.
//!
//! The crate models the pieces the engine needs from its host: a word stack
//! with interpreter, compiled, J2I and resolve frames ([`stack`], [`frame`],
//! [`thread`]), compiled bodies and their metadata ([`code_cache`],
//! [`metadata`]), classes and run addresses ([`class`]), monitor enter
//! records ([`monitor`]), and buffer allocation ([`alloc`]). The engine
//! itself lives in [`decomp`].

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod alloc;
pub mod class;
pub mod code_cache;
pub mod decomp;
pub mod frame;
pub mod metadata;
pub mod monitor;
pub mod stack;
pub mod thread;
pub mod vm;
pub mod walk;

pub use alloc::{BufferStorage, GlobalOsrBuffer, LimitedAllocator, MemoryAllocator, SystemAllocator};
pub use class::{Class, ClassTable, JitVTableSlot, MethodEntry, RunAddress};
pub use code_cache::{
    CodeCache, CompiledMethod, OsrFill, OsrOutcome, OsrSlot, OsrTrampoline, SlotTransfer,
    TableTrampoline,
};
pub use decomp::{DecompReason, DecompilationRecord, DecompilationStore, ResumeAction};
pub use frame::{BytecodeFrame, CompiledFrame, ResolveContext, ResolveFrame, StackFrame};
pub use metadata::{FrameMetadataOracle, InlinedCallSite, MetadataTable, MonitorBitmap, PcMaps};
pub use monitor::{MonitorEnterRecord, MonitorPool, MonitorRecordId, MonitorRecordPool};
pub use stack::{J2iFrameLayout, RegisterMap, StackArena};
pub use thread::{ThreadId, ThreadRegisters, VmThread};
pub use vm::{Vm, VmShared, WorldStop};
pub use walk::{CompiledFrameInfo, ShadowStackWalker, StackWalker, WalkedFrame};
