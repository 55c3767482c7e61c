//! Debugger-driven invalidation of compiled code.
//!
//! Breakpoints, field watches, single stepping and class redefinition all
//! need some compiled frames to finish in the interpreter. Each operation
//! runs with the world stopped: it updates method run state, then sweeps
//! every thread's stack and schedules the affected frames.
//!
//! ```text
//!   code breakpoint     frames running M (also inlined)   CODE_BREAKPOINT
//!   field watch         every compiled frame              DATA_BREAKPOINT
//!   class redefinition  every compiled frame              HOTSWAP
//!   single step         every compiled frame              SINGLE_STEP
//! ```

use rustc_hash::FxHashMap;

use revert_core::{CodeId, DecompResult, MethodId};

use super::capture::{add_decompilation, cancel_record};
use super::reason::DecompReason;
use crate::class::{JitVTableSlot, RunAddress};
use crate::vm::{VmShared, WorldStop};
use crate::walk::{CompiledFrameInfo, ShadowStackWalker, StackWalker};

// =============================================================================
// Registry
// =============================================================================

/// Breakpoint bookkeeping for one method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BreakpointedMethod {
    /// Breakpoints set in the method.
    pub count: usize,
    /// The method had compiled code whose entry was patched.
    pub has_been_translated: bool,
}

/// Debugger state that decides which compiled code may run.
#[derive(Debug, Default)]
pub struct BreakpointRegistry {
    methods: FxHashMap<MethodId, BreakpointedMethod>,
    data_breakpoints: usize,
    single_steps: usize,
    inline_field_watches: bool,
}

impl BreakpointRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bookkeeping for `method`, if it has breakpoints.
    pub fn method(&self, method: MethodId) -> Option<&BreakpointedMethod> {
        self.methods.get(&method)
    }

    /// Methods with breakpoints.
    pub fn len(&self) -> usize {
        self.methods.len()
    }

    /// Whether no method has breakpoints.
    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    /// Active field watches.
    pub fn data_breakpoints(&self) -> usize {
        self.data_breakpoints
    }

    /// Active single-step requests.
    pub fn single_steps(&self) -> usize {
        self.single_steps
    }

    /// Whether compiled code is emitting field-watch checks itself.
    pub fn inline_field_watches(&self) -> bool {
        self.inline_field_watches
    }
}

// =============================================================================
// Method Run State
// =============================================================================

/// Route calls of `method` to the interpreter.
fn mark_method_breakpointed(
    shared: &VmShared,
    method: MethodId,
    entry: &mut BreakpointedMethod,
) -> DecompResult<()> {
    let mut classes = shared.classes.write();
    let run = classes.entry_mut(method)?;
    if let RunAddress::Compiled(code) = run.run_address {
        entry.has_been_translated = true;
        shared.code_cache.get(code)?.patch_entry_to_interpreter();
    }
    run.breakpointed = true;
    Ok(())
}

/// Let calls of `method` reach its compiled code again.
fn mark_method_unbreakpointed(
    shared: &VmShared,
    method: MethodId,
    entry: &BreakpointedMethod,
) -> DecompResult<()> {
    let mut classes = shared.classes.write();
    let run = classes.entry_mut(method)?;
    run.breakpointed = false;
    if entry.has_been_translated {
        if let RunAddress::Compiled(code) = run.run_address {
            shared.code_cache.get(code)?.restore_entry();
        }
    }
    Ok(())
}

/// Discard all compiled code and rebuild jit vtables from scratch.
fn reset_all_methods(shared: &VmShared) {
    let mut classes = shared.classes.write();
    for entry in classes.entries_mut() {
        if entry.method.is_native() {
            continue;
        }
        if let RunAddress::Compiled(code) = entry.run_address {
            if let Ok(code) = shared.code_cache.get(code) {
                code.invalidate();
            }
            entry.run_address = RunAddress::NotTranslated;
        }
    }

    let ids: Vec<_> = classes
        .classes()
        .iter()
        .filter(|class| !class.is_interface)
        .map(|class| (class.id, class.obsolete))
        .collect();
    for (id, obsolete) in ids {
        if obsolete {
            if let Some(class) = classes.class_mut(id) {
                class.jit_vtable = vec![JitVTableSlot::Invalid; class.vtable.len()];
            }
        } else {
            classes.fill_jit_vtable(id);
        }
    }
}

/// Allow methods the JIT gave up on to be compiled again.
fn reset_untranslateable_methods(shared: &VmShared) {
    let mut classes = shared.classes.write();
    for entry in classes.entries_mut() {
        if entry.untranslateable {
            entry.untranslateable = false;
            entry.run_address = RunAddress::NotTranslated;
        }
    }
}

fn frame_runs(info: &CompiledFrameInfo, method: MethodId) -> bool {
    info.code.method.id == method
        || info
            .code
            .metadata
            .maps_from_pc(info.pc)
            .is_some_and(|maps| maps.call_sites.iter().any(|site| site.method == method))
}

impl VmShared {
    /// A method with breakpoints was compiled; keep calls in the interpreter.
    pub fn breakpointed_method_compiled(&self, method: MethodId, code: CodeId) -> DecompResult<bool> {
        let mut registry = self.breakpoints.lock();
        let Some(entry) = registry.methods.get_mut(&method) else {
            return Ok(false);
        };
        entry.has_been_translated = true;
        self.code_cache.get(code)?.patch_entry_to_interpreter();
        Ok(true)
    }

    /// Whether calls of `method` are routed to the interpreter for breakpoints.
    pub fn is_method_breakpointed(&self, method: MethodId) -> bool {
        self.classes
            .read()
            .entry(method)
            .is_ok_and(|entry| entry.breakpointed)
    }
}

// =============================================================================
// Stop-the-World Operations
// =============================================================================

impl WorldStop<'_> {
    /// Schedule every compiled frame accepted by `filter` on every thread.
    ///
    /// A frame that cannot be captured is logged and skipped; it keeps
    /// running compiled code.
    fn decompile_frames(&mut self, reason: DecompReason, filter: &dyn Fn(&CompiledFrameInfo) -> bool) {
        let shared = self.shared();
        for thread in self.threads_mut() {
            let frames = ShadowStackWalker.compiled_frames(thread, filter);
            for info in &frames {
                if let Err(err) = add_decompilation(shared, thread, info, reason) {
                    log::warn!(
                        "{}: could not decompile {} for {reason}: {err}",
                        thread.id,
                        info.code.method
                    );
                }
            }
        }
    }

    /// Schedule every compiled frame on every thread.
    pub fn decompile_all_methods_in_all_stacks(&mut self, reason: DecompReason) {
        self.decompile_frames(reason, &|_| true);
    }

    /// Withdraw `reason` from every record, optionally only records running
    /// `method`. Records left with no reason are cancelled.
    pub fn delete_all_decompilations(&mut self, reason: DecompReason, method: Option<MethodId>) {
        let shared = self.shared();
        for thread in self.threads_mut() {
            let cancelled = thread.decompilations.remove_where(reason, method);
            for record in cancelled {
                cancel_record(shared, thread, record);
            }
        }
    }

    /// A breakpoint was set in `method`.
    pub fn code_breakpoint_added(&mut self, method: MethodId) -> DecompResult<()> {
        let shared = self.shared();
        {
            let mut registry = shared.breakpoints.lock();
            if let Some(entry) = registry.methods.get_mut(&method) {
                entry.count += 1;
                return Ok(());
            }
            let mut entry = BreakpointedMethod {
                count: 1,
                has_been_translated: false,
            };
            mark_method_breakpointed(shared, method, &mut entry)?;
            registry.methods.insert(method, entry);
        }
        log::debug!("breakpoints enabled in {method}");
        self.decompile_frames(DecompReason::CODE_BREAKPOINT, &|info| frame_runs(info, method));
        Ok(())
    }

    /// A breakpoint in `method` was cleared.
    pub fn code_breakpoint_removed(&mut self, method: MethodId) -> DecompResult<()> {
        let shared = self.shared();
        {
            let mut registry = shared.breakpoints.lock();
            let Some(entry) = registry.methods.get_mut(&method) else {
                log::warn!("breakpoint removed from {method}, which has none");
                return Ok(());
            };
            entry.count -= 1;
            if entry.count > 0 {
                return Ok(());
            }
            let entry = *entry;
            registry.methods.remove(&method);
            mark_method_unbreakpointed(shared, method, &entry)?;
        }
        log::debug!("breakpoints disabled in {method}");
        self.delete_all_decompilations(DecompReason::CODE_BREAKPOINT, Some(method));
        Ok(())
    }

    /// Unpatch every breakpointed method, keeping the registry.
    pub fn remove_all_breakpoints(&mut self) -> DecompResult<()> {
        let shared = self.shared();
        let registry = shared.breakpoints.lock();
        for (&method, entry) in &registry.methods {
            mark_method_unbreakpointed(shared, method, entry)?;
        }
        Ok(())
    }

    /// Patch every method in the registry again.
    pub fn reinstall_all_breakpoints(&mut self) -> DecompResult<()> {
        let shared = self.shared();
        let mut registry = shared.breakpoints.lock();
        for (&method, entry) in registry.methods.iter_mut() {
            entry.has_been_translated = false;
            mark_method_breakpointed(shared, method, entry)?;
        }
        Ok(())
    }

    /// Classes were redefined: discard all compiled code and send every
    /// compiled frame back to the interpreter.
    pub fn hotswap_occurred(&mut self) -> DecompResult<()> {
        let shared = self.shared();
        self.remove_all_breakpoints()?;
        reset_all_methods(shared);
        self.reinstall_all_breakpoints()?;
        log::debug!("classes redefined, decompiling all compiled frames");
        self.decompile_all_methods_in_all_stacks(DecompReason::HOTSWAP);
        Ok(())
    }

    /// A field watch was added.
    ///
    /// Compiled code does not check watches unless the JIT emits them
    /// inline, so all of it is discarded. With inline watches that happens
    /// only for the first watch; code compiled afterwards checks itself.
    pub fn data_breakpoint_added(&mut self) -> DecompResult<()> {
        let shared = self.shared();
        let discard = {
            let mut registry = shared.breakpoints.lock();
            registry.data_breakpoints += 1;
            let discard = !shared.config.inline_field_watches || !registry.inline_field_watches;
            if shared.config.inline_field_watches {
                registry.inline_field_watches = true;
            }
            discard
        };
        if discard {
            self.remove_all_breakpoints()?;
            reset_all_methods(shared);
            self.reinstall_all_breakpoints()?;
            self.decompile_all_methods_in_all_stacks(DecompReason::DATA_BREAKPOINT);
        }
        Ok(())
    }

    /// A field watch was removed. Methods that could not be compiled while
    /// watches were active may be compiled again.
    pub fn data_breakpoint_removed(&mut self) -> DecompResult<()> {
        let shared = self.shared();
        {
            let mut registry = shared.breakpoints.lock();
            registry.data_breakpoints = registry.data_breakpoints.saturating_sub(1);
        }
        if !shared.config.inline_field_watches {
            self.remove_all_breakpoints()?;
            reset_untranslateable_methods(shared);
            self.reinstall_all_breakpoints()?;
        }
        Ok(())
    }

    /// Single stepping was requested on some thread.
    pub fn single_step_added(&mut self) {
        let first = {
            let mut registry = self.shared().breakpoints.lock();
            registry.single_steps += 1;
            registry.single_steps == 1
        };
        if first {
            self.decompile_all_methods_in_all_stacks(DecompReason::SINGLE_STEP);
        }
    }

    /// A single-step request ended.
    pub fn single_step_removed(&mut self) {
        let last = {
            let mut registry = self.shared().breakpoints.lock();
            registry.single_steps = registry.single_steps.saturating_sub(1);
            registry.single_steps == 0
        };
        if last {
            self.delete_all_decompilations(DecompReason::SINGLE_STEP, None);
        }
    }
}
