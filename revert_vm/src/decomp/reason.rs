//! Why a frame is being decompiled.

use std::fmt;

bitflags::bitflags! {
    /// Reasons accumulated on a decompilation record.
    ///
    /// A record can be requested several times for different reasons before
    /// it is consumed; the reasons are merged.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct DecompReason: u32 {
        /// A breakpoint was set in the frame's method.
        const CODE_BREAKPOINT = 1 << 0;
        /// A field watch was added.
        const DATA_BREAKPOINT = 1 << 1;
        /// Classes were redefined.
        const HOTSWAP = 1 << 2;
        /// The debugger is popping frames.
        const POP_FRAMES = 1 << 3;
        /// Single stepping was enabled.
        const SINGLE_STEP = 1 << 4;
        /// The debugger wrote to the frame's locals.
        const STACK_LOCALS_MODIFIED = 1 << 5;
        /// A frame-pop notification was requested for the frame.
        const FRAME_POP_NOTIFICATION = 1 << 6;
        /// The OSR fill invalidated the compiled frame.
        const ON_STACK_REPLACEMENT = 1 << 7;
    }
}

impl DecompReason {
    /// Reasons that a debugger can later withdraw.
    pub const CANCELLABLE: Self = Self::CODE_BREAKPOINT
        .union(Self::DATA_BREAKPOINT)
        .union(Self::SINGLE_STEP);
}

impl fmt::Display for DecompReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("none");
        }
        for (i, (name, _)) in self.iter_names().enumerate() {
            if i > 0 {
                f.write_str("|")?;
            }
            f.write_str(name)?;
        }
        Ok(())
    }
}
