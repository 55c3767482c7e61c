//! Engine configuration.
//!
//! All switches that change which path a decompilation takes live here, so
//! that the legacy single-frame mode is an explicit choice rather than
//! something inferred from how a method happened to be compiled.

/// Configuration for the decompilation engine.
///
/// # Example
///
/// ```ignore
/// use revert_core::DecompConfig;
///
/// let config = DecompConfig {
///     verbose_stack_dump: true,
///     ..Default::default()
/// };
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecompConfig {
    // =========================================================================
    // Capture Paths
    // =========================================================================
    /// Take the OSR path for code compiled with OSR support.
    ///
    /// When disabled every frame goes down the legacy single-frame path,
    /// which then requires `full_speed_debug`.
    ///
    /// Default: true
    pub osr_enabled: bool,

    /// Permit the legacy single-frame rebuild for code compiled without OSR.
    ///
    /// The legacy path copies temps and pending slots straight out of the
    /// compiled frame and only supports frames without inlining.
    ///
    /// Default: true
    pub full_speed_debug: bool,

    // =========================================================================
    // Buffers
    // =========================================================================
    /// Keep the most recently consumed buffer for reuse by the next capture.
    ///
    /// Default: true
    pub retain_last_record: bool,

    /// Initial size of the process-wide fallback OSR buffer, in words.
    ///
    /// Default: 1024
    pub initial_global_osr_buffer_words: usize,

    /// Per-thread limit on live monitor enter records.
    ///
    /// Default: None (unbounded)
    pub monitor_pool_capacity: Option<usize>,

    /// Size of each thread's stack arena, in words.
    ///
    /// Default: 64Ki words
    pub stack_slots: usize,

    // =========================================================================
    // Debugger Support
    // =========================================================================
    /// The JIT can compile field-watch triggers inline.
    ///
    /// Only the first data breakpoint then discards compiled code; later
    /// compilations emit the watch code themselves.
    ///
    /// Default: false
    pub inline_field_watches: bool,

    // =========================================================================
    // Diagnostics
    // =========================================================================
    /// Dump the thread's frames at `trace` level around every rebuild.
    ///
    /// Default: false
    pub verbose_stack_dump: bool,
}

impl Default for DecompConfig {
    fn default() -> Self {
        Self {
            // Capture paths
            osr_enabled: true,
            full_speed_debug: true,

            // Buffers
            retain_last_record: true,
            initial_global_osr_buffer_words: 1024,
            monitor_pool_capacity: None,
            stack_slots: 64 * 1024,

            // Debugger support
            inline_field_watches: false,

            // Diagnostics
            verbose_stack_dump: false,
        }
    }
}

impl DecompConfig {
    /// Small stacks and buffers for unit and integration tests.
    pub fn for_testing() -> Self {
        Self {
            initial_global_osr_buffer_words: 256,
            stack_slots: 4096,
            ..Default::default()
        }
    }

    /// Every frame goes down the legacy single-frame path.
    pub fn legacy_only() -> Self {
        Self {
            osr_enabled: false,
            ..Self::for_testing()
        }
    }
}
