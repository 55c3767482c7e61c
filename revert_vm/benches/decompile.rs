//! Decompilation Benchmarks
//!
//! Measures the two halves of a decompilation: capturing a compiled frame
//! into a record, and rebuilding interpreter frames when control returns to
//! it.
//!
//! # Benchmark Categories
//!
//! 1. **Capture**: `add_decompilation` on an OSR body and on a legacy body
//! 2. **Round Trip**: capture followed by the return that consumes the record

use std::sync::Arc;

use criterion::{BatchSize, Criterion, black_box, criterion_group, criterion_main};
use revert_core::{
    Bytecode, ClassId, CodeId, DecompConfig, InvokeKind, Method, MethodId, ObjectRef, ReturnKind,
    ReturnValue, Word,
};
use revert_vm::decomp::{add_decompilation, on_compiled_return};
use revert_vm::{
    Class, CompiledFrameInfo, CompiledMethod, DecompReason, MetadataTable, OsrSlot, PcMaps,
    ShadowStackWalker, SlotTransfer, StackWalker, TableTrampoline, ThreadId, VmShared, VmThread,
};

// =============================================================================
// Benchmark Helpers
// =============================================================================

const CLASS: ClassId = ClassId(1);
const BASE: MethodId = MethodId(100);
const OUTER: MethodId = MethodId(1);
const LEAF: MethodId = MethodId(50);
const OUTER_PC: Word = 0x1100;

struct Setup {
    shared: Arc<VmShared>,
    outer: Arc<CompiledMethod>,
    leaf: Arc<CompiledMethod>,
}

fn int_invoke() -> Bytecode {
    Bytecode::Invoke {
        kind: InvokeKind::Static,
        arg_slots: 1,
        returns: ReturnKind::Int,
    }
}

/// `OUTER(a, b)` with two temps stopped at an invoke, compiled with or
/// without an OSR trampoline.
fn setup(osr: bool) -> Setup {
    let shared = VmShared::new(DecompConfig::for_testing());
    let (outer_method, leaf_method) = {
        let mut classes = shared.classes.write();
        let class_object = ObjectRef::from_word(0xC1A5_5000).expect("non-null");
        classes.define_class(Class::new(CLASS, class_object));
        classes.define_method(Method::builder(BASE, CLASS, "base").max_stack(4).build());
        let outer = classes.define_method(
            Method::builder(OUTER, CLASS, "outer")
                .args(2)
                .temps(2)
                .max_stack(3)
                .returns(ReturnKind::Int)
                .bytecode(7, int_invoke(), 2)
                .build(),
        );
        let leaf = classes.define_method(
            Method::builder(LEAF, CLASS, "leaf")
                .returns(ReturnKind::Int)
                .build(),
        );
        (outer, leaf)
    };

    let metadata = Arc::new(MetadataTable::new(0).with_pc(OUTER_PC, PcMaps::outer(7)));
    let mut outer = CompiledMethod::new(CodeId(1), outer_method, 6, metadata);
    if osr {
        let transfers = [(5, OsrSlot::Local(2)), (4, OsrSlot::Local(3)), (1, OsrSlot::Operand(0))]
            .into_iter()
            .map(|(source, target)| SlotTransfer {
                inline_depth: 0,
                source,
                target,
            })
            .collect();
        outer = outer.with_osr(Arc::new(TableTrampoline::new().with_site(OUTER_PC, transfers)));
    }
    let outer = shared.code_cache.insert(outer);
    let leaf = shared.code_cache.insert(CompiledMethod::new(
        CodeId(50),
        leaf_method,
        2,
        Arc::new(MetadataTable::new(0)),
    ));
    {
        let mut classes = shared.classes.write();
        classes.set_compiled(OUTER, outer.id).expect("defined");
        classes.set_compiled(LEAF, leaf.id).expect("defined");
    }
    Setup {
        shared: Arc::new(shared),
        outer,
        leaf,
    }
}

/// Fresh thread stopped in the leaf called from `OUTER`.
fn stopped_thread(setup: &Setup) -> (VmThread, CompiledFrameInfo) {
    let mut thread = VmThread::new(ThreadId(1), &setup.shared.config);
    let base = Arc::clone(
        setup
            .shared
            .classes
            .read()
            .method(BASE)
            .expect("base method"),
    );
    thread.push_interpreter_frame(&base, &[], &[], 0);
    thread.call_compiled_from_interpreter(Arc::clone(&setup.outer), &[11, 22]);
    let unwind_sp = thread.regs.sp;
    thread.stack.write(unwind_sp + 5, 33);
    thread.stack.write(unwind_sp + 4, 44);
    thread.stack.write(unwind_sp + 1, 55);
    thread.call_compiled_from_compiled(Arc::clone(&setup.leaf), &[], OUTER_PC);
    let info = ShadowStackWalker
        .compiled_frames(&thread, &|info| info.index == 1)
        .pop()
        .expect("outer frame");
    (thread, info)
}

// =============================================================================
// Capture Benchmarks
// =============================================================================

fn bench_capture(c: &mut Criterion) {
    let mut group = c.benchmark_group("capture");

    for (name, osr) in [("osr", true), ("legacy", false)] {
        let setup = setup(osr);
        group.bench_function(name, |b| {
            b.iter_batched(
                || stopped_thread(&setup),
                |(mut thread, info)| {
                    let outcome =
                        add_decompilation(&setup.shared, &mut thread, &info, DecompReason::HOTSWAP);
                    black_box((outcome, thread))
                },
                BatchSize::SmallInput,
            )
        });
    }

    group.finish();
}

// =============================================================================
// Round Trip Benchmarks
// =============================================================================

fn bench_round_trip(c: &mut Criterion) {
    let mut group = c.benchmark_group("round_trip");

    for (name, osr) in [("osr", true), ("legacy", false)] {
        let setup = setup(osr);
        group.bench_function(name, |b| {
            b.iter_batched(
                || stopped_thread(&setup),
                |(mut thread, info)| {
                    let _ =
                        add_decompilation(&setup.shared, &mut thread, &info, DecompReason::HOTSWAP);
                    let action = on_compiled_return(&setup.shared, &mut thread, ReturnValue::single(1));
                    black_box((action, thread))
                },
                BatchSize::SmallInput,
            )
        });
    }

    group.finish();
}

criterion_group!(benches, bench_capture, bench_round_trip);
criterion_main!(benches);
