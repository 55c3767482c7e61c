//! Stop-the-world sweeps driven by debugger events.

mod common;

use std::sync::Arc;

use common::*;
use parking_lot::Mutex;
use revert_core::{
    ClassId, DecompConfig, Method, MethodId, ReturnKind, ReturnValue, SlotIndex, Word,
};
use revert_vm::decomp::on_compiled_return;
use revert_vm::{
    Class, CompiledMethod, DecompReason, JitVTableSlot, MetadataTable, PcMaps, ResumeAction,
    RunAddress, TableTrampoline, ThreadId, Vm, VmThread,
};

const OTHER: MethodId = MethodId(9);
const OTHER_PC: Word = 0x9000;
const HOST: MethodId = MethodId(10);
const INLINED: MethodId = MethodId(11);
const HOST_PC: Word = 0xA000;

/// Three threads, each stopped in a leaf called from compiled code.
///
/// ```text
///   thread#1   OUTER (OSR)                      resume slot 4083
///   thread#2   OTHER (legacy)                   resume slot 4088
///   thread#3   HOST with INLINED inlined (OSR)  resume slot 4089
/// ```
struct World {
    vm: Vm,
    scenario: OuterScenario,
    other: Arc<CompiledMethod>,
    host: Arc<CompiledMethod>,
    threads: Vec<Arc<Mutex<VmThread>>>,
}

const RESUME_SLOTS: [(SlotIndex, Word); 3] = [(4083, OUTER_PC), (4088, OTHER_PC), (4089, HOST_PC)];

impl World {
    fn new(config: DecompConfig) -> Self {
        let shared = shared(config);
        let scenario = install_outer(&shared);

        let other = define(
            &shared,
            Method::builder(OTHER, CLASS, "other")
                .args(1)
                .max_stack(1)
                .bytecode(2, invoke(0, ReturnKind::Void), 0)
                .build(),
        );
        let other = legacy_code(
            &shared,
            9,
            &other,
            2,
            MetadataTable::new(0).with_pc(OTHER_PC, PcMaps::outer(2)),
        );

        let host = define(
            &shared,
            Method::builder(HOST, CLASS, "host")
                .max_stack(1)
                .bytecode(2, invoke(0, ReturnKind::Void), 0)
                .build(),
        );
        define(
            &shared,
            Method::builder(INLINED, CLASS, "inlined")
                .max_stack(1)
                .bytecode(1, invoke(0, ReturnKind::Void), 0)
                .build(),
        );
        let host = osr_code(
            &shared,
            10,
            &host,
            2,
            MetadataTable::new(0).with_pc(HOST_PC, PcMaps::outer(2).inlined(INLINED, 1)),
            TableTrampoline::new().with_site(HOST_PC, Vec::new()),
        );
        let void_leaf = leaf_code(&shared, 51, ReturnKind::Void);

        {
            let mut classes = shared.classes.write();
            classes.define_class(Class::new(ClassId(2), object(0xC2)).with_vtable(vec![OUTER, OTHER]));
            let mut obsolete = Class::new(ClassId(3), object(0xC3)).with_vtable(vec![OUTER]);
            obsolete.obsolete = true;
            classes.define_class(obsolete);
            classes.fill_jit_vtable(ClassId(2));
        }

        let vm = Vm::from_shared(shared);
        let threads: Vec<_> = (0..3).map(|_| vm.spawn_thread()).collect();
        for thread in &threads {
            push_base(vm.shared(), &mut thread.lock());
        }
        enter_outer(&mut threads[0].lock(), &scenario);
        {
            let mut thread = threads[1].lock();
            thread.call_compiled_from_interpreter(Arc::clone(&other), &[5]);
            thread.call_compiled_from_compiled(Arc::clone(&void_leaf), &[], OTHER_PC);
        }
        {
            let mut thread = threads[2].lock();
            thread.call_compiled_from_interpreter(Arc::clone(&host), &[]);
            thread.call_compiled_from_compiled(void_leaf, &[], HOST_PC);
        }

        Self {
            vm,
            scenario,
            other,
            host,
            threads,
        }
    }

    /// Reason of the single record on thread `index`, if any.
    fn reason(&self, index: usize) -> Option<DecompReason> {
        let thread = self.threads[index].lock();
        assert!(thread.decompilations.len() <= 1);
        thread.decompilations.head().map(|record| record.reason())
    }

    /// Every resume slot holds its original compiled address.
    fn assert_resume_slots_restored(&self) {
        for (thread, (slot, pc)) in self.threads.iter().zip(RESUME_SLOTS) {
            assert_eq!(thread.lock().stack.read(slot), pc);
        }
    }
}

#[test]
fn test_code_breakpoint_schedules_frames_running_method() {
    let world = World::new(DecompConfig::for_testing());
    let shared = Arc::clone(world.vm.shared());

    world.vm.stop_the_world().code_breakpoint_added(OUTER).unwrap();
    assert_eq!(world.reason(0), Some(DecompReason::CODE_BREAKPOINT));
    assert_eq!(world.reason(1), None);
    assert_eq!(world.reason(2), None);

    let registry = shared.breakpoints.lock();
    let entry = registry.method(OUTER).unwrap();
    assert_eq!(entry.count, 1);
    assert!(entry.has_been_translated);
    drop(registry);
    assert!(world.scenario.outer.is_entry_patched());
    assert!(shared.is_method_breakpointed(OUTER));

    // A second breakpoint only counts.
    world.vm.stop_the_world().code_breakpoint_added(OUTER).unwrap();
    assert_eq!(shared.breakpoints.lock().method(OUTER).unwrap().count, 2);
    assert_eq!(shared.stats.snapshot().records_created, 1);

    world.vm.stop_the_world().code_breakpoint_removed(OUTER).unwrap();
    assert_eq!(world.reason(0), Some(DecompReason::CODE_BREAKPOINT));

    world.vm.stop_the_world().code_breakpoint_removed(OUTER).unwrap();
    assert_eq!(world.reason(0), None);
    assert!(shared.breakpoints.lock().is_empty());
    assert!(!world.scenario.outer.is_entry_patched());
    assert!(!shared.is_method_breakpointed(OUTER));
    assert_eq!(shared.stats.snapshot().records_cancelled, 1);
    world.assert_resume_slots_restored();
}

#[test]
fn test_code_breakpoint_in_inlined_method() {
    let world = World::new(DecompConfig::for_testing());
    let shared = Arc::clone(world.vm.shared());

    world.vm.stop_the_world().code_breakpoint_added(INLINED).unwrap();
    assert_eq!(world.reason(0), None);
    assert_eq!(world.reason(1), None);
    assert_eq!(world.reason(2), Some(DecompReason::CODE_BREAKPOINT));
    {
        let thread = world.threads[2].lock();
        let record = thread.decompilations.head().unwrap();
        assert_eq!(record.method(), HOST);
        assert!(record.runs(INLINED));
        assert_eq!(record.frame_count(), 2);
    }
    assert!(!shared.breakpoints.lock().method(INLINED).unwrap().has_been_translated);
    assert!(!world.host.is_entry_patched());
}

#[test]
fn test_breakpoint_reasons_survive_other_removals() {
    let world = World::new(DecompConfig::for_testing());

    world.vm.stop_the_world().single_step_added();
    for index in 0..3 {
        assert_eq!(world.reason(index), Some(DecompReason::SINGLE_STEP));
    }
    world.vm.stop_the_world().code_breakpoint_added(OUTER).unwrap();
    assert_eq!(
        world.reason(0),
        Some(DecompReason::SINGLE_STEP | DecompReason::CODE_BREAKPOINT)
    );

    world.vm.stop_the_world().code_breakpoint_removed(OUTER).unwrap();
    assert_eq!(world.reason(0), Some(DecompReason::SINGLE_STEP));

    // Only the last single-step request withdraws the records.
    world.vm.stop_the_world().single_step_added();
    world.vm.stop_the_world().single_step_removed();
    assert_eq!(world.reason(1), Some(DecompReason::SINGLE_STEP));
    world.vm.stop_the_world().single_step_removed();
    for index in 0..3 {
        assert_eq!(world.reason(index), None);
    }
    world.assert_resume_slots_restored();
}

#[test]
fn test_hotswap_discards_code_and_keeps_breakpoints() {
    let world = World::new(DecompConfig::for_testing());
    let shared = Arc::clone(world.vm.shared());

    world.vm.stop_the_world().code_breakpoint_added(OUTER).unwrap();
    world.vm.stop_the_world().hotswap_occurred().unwrap();

    assert_eq!(
        world.reason(0),
        Some(DecompReason::CODE_BREAKPOINT | DecompReason::HOTSWAP)
    );
    assert_eq!(world.reason(1), Some(DecompReason::HOTSWAP));
    assert_eq!(world.reason(2), Some(DecompReason::HOTSWAP));
    assert_eq!(shared.stats.created_with(DecompReason::HOTSWAP), 2);

    for code in [&world.scenario.outer, &world.other, &world.host] {
        assert!(code.is_invalidated());
    }
    {
        let classes = shared.classes.read();
        for id in [OUTER, OTHER, HOST] {
            assert_eq!(classes.entry(id).unwrap().run_address, RunAddress::NotTranslated);
        }
        assert!(classes.entry(OUTER).unwrap().breakpointed);
        assert_eq!(
            classes.class(ClassId(2)).unwrap().jit_vtable,
            vec![JitVTableSlot::NotTranslated; 2]
        );
        assert_eq!(
            classes.class(ClassId(3)).unwrap().jit_vtable,
            vec![JitVTableSlot::Invalid]
        );
    }
    assert!(!shared.breakpoints.lock().method(OUTER).unwrap().has_been_translated);

    // Frames already on the stack finish in the interpreter.
    let thread = &world.threads[0];
    let action = on_compiled_return(&shared, &mut thread.lock(), ReturnValue::single(8));
    assert_eq!(action, Ok(ResumeAction::ExecuteBytecode));
    assert!(thread.lock().decompilations.is_empty());
}

#[test]
fn test_remove_and_reinstall_all_breakpoints() {
    let world = World::new(DecompConfig::for_testing());
    let shared = Arc::clone(world.vm.shared());
    world.vm.stop_the_world().code_breakpoint_added(OUTER).unwrap();

    let mut stop = world.vm.stop_the_world();
    stop.remove_all_breakpoints().unwrap();
    assert!(!world.scenario.outer.is_entry_patched());
    assert!(!shared.is_method_breakpointed(OUTER));
    assert_eq!(shared.breakpoints.lock().len(), 1);

    stop.reinstall_all_breakpoints().unwrap();
    assert!(world.scenario.outer.is_entry_patched());
    assert!(shared.is_method_breakpointed(OUTER));
}

#[test]
fn test_breakpointed_method_compiled_later() {
    let world = World::new(DecompConfig::for_testing());
    let shared = Arc::clone(world.vm.shared());
    world.vm.stop_the_world().code_breakpoint_added(INLINED).unwrap();

    let inlined = Arc::clone(shared.classes.read().method(INLINED).unwrap());
    let code = legacy_code(&shared, 11, &inlined, 2, MetadataTable::new(0));
    assert_eq!(shared.breakpointed_method_compiled(INLINED, code.id), Ok(true));
    assert!(code.is_entry_patched());
    assert!(shared.breakpoints.lock().method(INLINED).unwrap().has_been_translated);

    assert_eq!(shared.breakpointed_method_compiled(OTHER, world.other.id), Ok(false));
    assert!(!world.other.is_entry_patched());

    world.vm.stop_the_world().code_breakpoint_removed(INLINED).unwrap();
    assert!(!code.is_entry_patched());
}

// =============================================================================
// Field Watches
// =============================================================================

#[test]
fn test_every_field_watch_discards_compiled_code() {
    let world = World::new(DecompConfig::for_testing());
    let shared = Arc::clone(world.vm.shared());
    shared
        .classes
        .write()
        .entry_mut(OTHER)
        .unwrap()
        .untranslateable = true;

    world.vm.stop_the_world().data_breakpoint_added().unwrap();
    for index in 0..3 {
        assert_eq!(world.reason(index), Some(DecompReason::DATA_BREAKPOINT));
    }
    assert!(world.scenario.outer.is_invalidated());
    assert_eq!(shared.breakpoints.lock().data_breakpoints(), 1);

    world.vm.stop_the_world().data_breakpoint_added().unwrap();
    assert_eq!(shared.stats.snapshot().records_merged, 3);

    world.vm.stop_the_world().data_breakpoint_removed().unwrap();
    assert!(!shared.classes.read().entry(OTHER).unwrap().untranslateable);
    assert_eq!(shared.breakpoints.lock().data_breakpoints(), 1);
}

#[test]
fn test_inline_field_watches_discard_once() {
    let config = DecompConfig {
        inline_field_watches: true,
        ..DecompConfig::for_testing()
    };
    let world = World::new(config);
    let shared = Arc::clone(world.vm.shared());
    shared
        .classes
        .write()
        .entry_mut(OTHER)
        .unwrap()
        .untranslateable = true;

    world.vm.stop_the_world().data_breakpoint_added().unwrap();
    assert!(shared.breakpoints.lock().inline_field_watches());
    assert_eq!(shared.stats.created_with(DecompReason::DATA_BREAKPOINT), 3);

    world.vm.stop_the_world().data_breakpoint_added().unwrap();
    assert_eq!(shared.stats.snapshot().records_merged, 0);

    world.vm.stop_the_world().data_breakpoint_removed().unwrap();
    assert!(shared.classes.read().entry(OTHER).unwrap().untranslateable);
}

#[test]
fn test_world_stop_reaches_threads_by_id() {
    let world = World::new(DecompConfig::for_testing());
    let mut stop = world.vm.stop_the_world();
    let thread = stop.thread_mut(ThreadId(2)).unwrap();
    assert_eq!(thread.frames().len(), 3);
}
