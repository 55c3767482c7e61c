//! Revert Core
//!
//! Shared vocabulary for the revert deoptimization engine: stack words and
//! tagged slot references, the method and bytecode model the engine consults
//! when sizing and resuming interpreter frames, the error type, and the
//! engine configuration.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod method;
pub mod value;

pub use config::DecompConfig;
pub use error::{DecompError, DecompResult};
pub use method::{
    Bytecode, BytecodeInfo, ClassId, InvokeKind, Method, MethodBuilder, MethodFlags, MethodId,
    ReturnKind,
};
pub use value::{
    BytecodePc, CodeId, FrameTag, ObjectRef, ReturnValue, SlotIndex, SlotRef, WORD_BYTES, Word,
};
