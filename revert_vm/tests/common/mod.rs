//! Shared fixtures for the integration tests.
//!
//! Stacks are built with the thread's own calling-convention helpers, so the
//! slot positions match what the engine expects. Every thread starts with a
//! base interpreter frame for [`BASE_METHOD`].

#![allow(dead_code)]

use std::sync::Arc;

use revert_core::{
    Bytecode, ClassId, CodeId, DecompConfig, InvokeKind, Method, MethodId, ObjectRef, ReturnKind,
    SlotIndex, Word,
};
use revert_vm::{
    Class, CompiledFrameInfo, CompiledMethod, FrameMetadataOracle, MemoryAllocator, MetadataTable,
    OsrSlot, OsrTrampoline, PcMaps, ShadowStackWalker, SlotTransfer, StackWalker, TableTrampoline,
    ThreadId, VmShared, VmThread,
};

/// Class every fixture method is declared in.
pub const CLASS: ClassId = ClassId(1);

/// Class object of [`CLASS`].
pub const CLASS_OBJECT: Word = 0xC1A5_5000;

/// Method of the bottom interpreter frame.
pub const BASE_METHOD: MethodId = MethodId(100);

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn object(raw: Word) -> ObjectRef {
    ObjectRef::from_word(raw).expect("fixture objects are non-null")
}

pub fn invoke(arg_slots: u16, returns: ReturnKind) -> Bytecode {
    Bytecode::Invoke {
        kind: InvokeKind::Static,
        arg_slots,
        returns,
    }
}

fn register_base(shared: &VmShared) {
    let mut classes = shared.classes.write();
    classes.define_class(Class::new(CLASS, object(CLASS_OBJECT)));
    classes.define_method(Method::builder(BASE_METHOD, CLASS, "base").max_stack(4).build());
}

pub fn shared(config: DecompConfig) -> Arc<VmShared> {
    init_logging();
    let shared = VmShared::new(config);
    register_base(&shared);
    Arc::new(shared)
}

pub fn shared_with_allocator(config: DecompConfig, allocator: Arc<dyn MemoryAllocator>) -> Arc<VmShared> {
    init_logging();
    let shared = VmShared::with_allocator(config, allocator);
    register_base(&shared);
    Arc::new(shared)
}

pub fn define(shared: &VmShared, method: Method) -> Arc<Method> {
    shared.classes.write().define_method(method)
}

/// Install a compiled body and point its method at it.
pub fn install(shared: &VmShared, code: CompiledMethod) -> Arc<CompiledMethod> {
    let code = shared.code_cache.insert(code);
    shared
        .classes
        .write()
        .set_compiled(code.method.id, code.id)
        .expect("method is defined");
    code
}

/// A legacy body with `frame_size` words below the return address.
pub fn legacy_code(
    shared: &VmShared,
    id: u32,
    method: &Arc<Method>,
    frame_size: usize,
    metadata: impl FrameMetadataOracle + 'static,
) -> Arc<CompiledMethod> {
    install(
        shared,
        CompiledMethod::new(CodeId(id), Arc::clone(method), frame_size, Arc::new(metadata)),
    )
}

/// An OSR-capable body.
pub fn osr_code(
    shared: &VmShared,
    id: u32,
    method: &Arc<Method>,
    frame_size: usize,
    metadata: impl FrameMetadataOracle + 'static,
    trampoline: impl OsrTrampoline + 'static,
) -> Arc<CompiledMethod> {
    install(
        shared,
        CompiledMethod::new(CodeId(id), Arc::clone(method), frame_size, Arc::new(metadata))
            .with_osr(Arc::new(trampoline)),
    )
}

/// A leaf body with no maps, used as the callee a frame is stopped in.
pub fn leaf_code(shared: &VmShared, id: u32, returns: ReturnKind) -> Arc<CompiledMethod> {
    let method = define(
        shared,
        Method::builder(MethodId(id), CLASS, "leaf").returns(returns).build(),
    );
    legacy_code(shared, id, &method, 2, MetadataTable::new(0))
}

/// Thread with the base interpreter frame pushed.
pub fn thread(shared: &VmShared, id: u32) -> VmThread {
    let mut thread = VmThread::new(ThreadId(id), &shared.config);
    push_base(shared, &mut thread);
    thread
}

/// Push the bottom interpreter frame on an empty thread.
pub fn push_base(shared: &VmShared, thread: &mut VmThread) {
    let base = Arc::clone(
        shared
            .classes
            .read()
            .method(BASE_METHOD)
            .expect("base method is defined"),
    );
    thread.push_interpreter_frame(&base, &[], &[], 0);
}

/// Transfer from frame-copy slot `slot` of a frame whose unwind sp is `unwind_sp`.
pub fn transfer(inline_depth: usize, unwind_sp: SlotIndex, slot: SlotIndex, target: OsrSlot) -> SlotTransfer {
    SlotTransfer {
        inline_depth,
        source: slot - unwind_sp,
        target,
    }
}

/// Walker view of the compiled frame at `index`.
pub fn compiled_info(thread: &VmThread, index: usize) -> CompiledFrameInfo {
    ShadowStackWalker
        .compiled_frames(thread, &|info| info.index == index)
        .pop()
        .expect("compiled frame at index")
}

// =============================================================================
// Standard Scenario
// =============================================================================

/// Outermost method of the standard scenario.
pub const OUTER: MethodId = MethodId(1);

/// Resume address of [`OUTER`] at its invoke.
pub const OUTER_PC: Word = 0x1100;

/// Compiled address of the catch block of [`OUTER`], at offset 12.
pub const OUTER_HANDLER_PC: Word = 0x1200;

/// Compiled `OUTER(a, b)` and the leaf it calls.
#[derive(Debug, Clone)]
pub struct OuterScenario {
    pub outer: Arc<CompiledMethod>,
    pub leaf: Arc<CompiledMethod>,
}

/// Define `OUTER(a, b)` with two temps, stopped at an `int` invoke at offset
/// 7, compiled for OSR with a six-word frame.
pub fn install_outer(shared: &VmShared) -> OuterScenario {
    let method = define(
        shared,
        Method::builder(OUTER, CLASS, "outer")
            .args(2)
            .temps(2)
            .max_stack(3)
            .returns(ReturnKind::Int)
            .bytecode(7, invoke(1, ReturnKind::Int), 2)
            .build(),
    );
    // Frame-copy offsets relative to the unwind sp.
    let trampoline = TableTrampoline::new().with_site(
        OUTER_PC,
        vec![
            SlotTransfer {
                inline_depth: 0,
                source: 5,
                target: OsrSlot::Local(2),
            },
            SlotTransfer {
                inline_depth: 0,
                source: 4,
                target: OsrSlot::Local(3),
            },
            SlotTransfer {
                inline_depth: 0,
                source: 1,
                target: OsrSlot::Operand(0),
            },
        ],
    );
    let metadata = MetadataTable::new(0)
        .with_pc(OUTER_PC, PcMaps::outer(7))
        .with_pc(OUTER_HANDLER_PC, PcMaps::outer(12));
    OuterScenario {
        outer: osr_code(shared, 1, &method, 6, metadata, trampoline),
        leaf: leaf_code(shared, 50, ReturnKind::Int),
    }
}

/// Call `OUTER(11, 22)` from the topmost interpreter frame, fill its temps
/// with 33 and 44 and its operand with 55, then call the leaf.
///
/// On a fresh thread:
///
/// ```text
///   4092  11           local 0
///   4091  22           local 1
///   4090  return address (I2J)
///   4089  33           local 2
///   4088  44           local 3
///   4085  55           operand 0
///   4084  unwind sp
///   4083  leaf return address
/// ```
pub fn enter_outer(thread: &mut VmThread, scenario: &OuterScenario) -> usize {
    let index = thread.call_compiled_from_interpreter(Arc::clone(&scenario.outer), &[11, 22]);
    let unwind_sp = thread.regs.sp;
    thread.stack.write(unwind_sp + 5, 33);
    thread.stack.write(unwind_sp + 4, 44);
    thread.stack.write(unwind_sp + 1, 55);
    thread.call_compiled_from_compiled(Arc::clone(&scenario.leaf), &[], OUTER_PC);
    index
}
