//! Error types for the deoptimization engine.
//!
//! Only recoverable conditions are represented here. Broken contracts between
//! the JIT and the interpreter (a copied frame of the wrong size, a monitor
//! slot holding null, records out of order) are assertion failures instead.

use thiserror::Error;

use crate::method::MethodId;
use crate::value::{CodeId, Word};

/// Result type used throughout the engine.
pub type DecompResult<T> = Result<T, DecompError>;

/// Recoverable failures of capture, rebuild and registry operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecompError {
    /// The allocator could not provide a buffer.
    #[error("OutOfMemoryError: could not allocate {words} words")]
    OutOfMemory {
        /// Requested size in words.
        words: usize,
    },

    /// The thread's monitor-record pool has no free records.
    #[error("OutOfMemoryError: monitor enter record pool exhausted")]
    MonitorPoolExhausted,

    /// The shared fallback buffer is held by another capture or is too small.
    #[error("OutOfMemoryError: global OSR buffer unavailable for {words} words")]
    GlobalBufferUnavailable {
        /// Requested size in words.
        words: usize,
    },

    /// The frame has no saved resume address, so no continuation can be installed.
    #[error("frame is not walkable: no resume address slot")]
    FrameNotWalkable,

    /// The thread has no pending decompilation to consume.
    #[error("no pending decompilation on this thread")]
    NoPendingDecompilation,

    /// A method id is not registered.
    #[error("unknown method {0}")]
    UnknownMethod(MethodId),

    /// A code id is not in the code cache.
    #[error("unknown compiled code {0}")]
    UnknownCode(CodeId),

    /// The metadata has no maps for a compiled PC.
    #[error("no stack or inline maps for compiled pc {pc:#x}")]
    MissingMaps {
        /// The compiled PC that was looked up.
        pc: Word,
    },

    /// The operation needs a compiled frame.
    #[error("frame is not a compiled frame")]
    NotCompiled,
}

impl DecompError {
    /// Whether the guest should observe this failure as an out-of-memory condition.
    #[inline]
    pub fn is_out_of_memory(&self) -> bool {
        matches!(
            self,
            Self::OutOfMemory { .. }
                | Self::MonitorPoolExhausted
                | Self::GlobalBufferUnavailable { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_out_of_memory_classification() {
        assert!(DecompError::OutOfMemory { words: 8 }.is_out_of_memory());
        assert!(DecompError::MonitorPoolExhausted.is_out_of_memory());
        assert!(DecompError::GlobalBufferUnavailable { words: 8 }.is_out_of_memory());
        assert!(!DecompError::FrameNotWalkable.is_out_of_memory());
    }

    #[test]
    fn test_display() {
        let err = DecompError::MissingMaps { pc: 0x1040 };
        assert_eq!(err.to_string(), "no stack or inline maps for compiled pc 0x1040");
        assert_eq!(
            DecompError::UnknownMethod(MethodId(3)).to_string(),
            "unknown method method#3"
        );
    }
}
