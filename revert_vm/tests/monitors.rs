//! Monitor enter records across capture and rebuild.

mod common;

use std::sync::Arc;

use common::*;
use revert_core::{
    DecompConfig, DecompError, Method, MethodFlags, MethodId, ReturnKind, ReturnValue, Word,
};
use revert_vm::decomp::{add_decompilation, on_compiled_return};
use revert_vm::{
    DecompReason, MetadataTable, MonitorBitmap, MonitorRecordPool, OsrSlot, PcMaps, ResumeAction,
    TableTrampoline, VmShared, VmThread,
};

const SYNC: MethodId = MethodId(6);
const SYNC_PC: Word = 0x6000;
const RECEIVER: Word = 0xAB00;
const LOCK: Word = 0xCD00;

/// Synchronized `SYNC(this)` holding its own monitor and an explicit lock on
/// local 1.
///
/// Monitor bit 0 is the receiver argument, bit 1 the hidden slot (also the
/// receiver) and bit 2 local 1.
///
/// ```text
///   4092  receiver       local 0
///   4091  return address
///   4090  lock           local 1
///   4089  receiver       hidden slot
///   4086  unwind sp
/// ```
fn sync_frame(config: DecompConfig) -> (Arc<VmShared>, VmThread) {
    let shared = shared(config);
    let method = define(
        &shared,
        Method::builder(SYNC, CLASS, "sync")
            .args(1)
            .temps(1)
            .max_stack(1)
            .flags(MethodFlags::SYNCHRONIZED)
            .bytecode(6, invoke(0, ReturnKind::Void), 0)
            .build(),
    );
    let mut maps = PcMaps::outer(6);
    maps.monitor_mask = Some(MonitorBitmap::from_bits(&[0, 1, 2]));
    maps.live_monitors = Some(MonitorBitmap::from_bits(&[0, 1, 2]));
    let unwind_sp = 4086;
    let trampoline = TableTrampoline::new().with_site(
        SYNC_PC,
        vec![
            transfer(0, unwind_sp, 4090, OsrSlot::Local(1)),
            transfer(0, unwind_sp, 4089, OsrSlot::Local(2)),
        ],
    );
    let code = osr_code(
        &shared,
        6,
        &method,
        5,
        MetadataTable::new(3).with_pc(SYNC_PC, maps),
        trampoline,
    );
    let leaf = leaf_code(&shared, 50, ReturnKind::Void);

    let mut thread = thread(&shared, 1);
    thread.call_compiled_from_interpreter(code, &[RECEIVER]);
    thread.stack.write(4090, LOCK);
    thread.stack.write(4089, RECEIVER);
    thread.call_compiled_from_compiled(leaf, &[], SYNC_PC);
    (shared, thread)
}

fn chain_objects(thread: &VmThread) -> Vec<Word> {
    thread
        .monitor_pool
        .chain(thread.monitor_records)
        .into_iter()
        .map(|id| thread.monitor_pool.get(id).unwrap().object.to_word())
        .collect()
}

#[test]
fn test_method_monitor_record_dropped_once() {
    let (shared, mut thread) = sync_frame(DecompConfig::for_testing());
    let info = compiled_info(&thread, 1);
    add_decompilation(&shared, &mut thread, &info, DecompReason::CODE_BREAKPOINT).unwrap();

    let head = thread.decompilations.head().unwrap().buffer().frame(0).monitor_records();
    assert_eq!(thread.monitor_pool.chain(head).len(), 3);
    assert_eq!(thread.monitor_pool.live(), 3);
    assert_eq!(thread.monitor_records, None);

    let action = on_compiled_return(&shared, &mut thread, ReturnValue::default());
    assert_eq!(action, Ok(ResumeAction::ExecuteBytecode));

    // The receiver is locked twice; only the method's own entry goes away.
    assert_eq!(chain_objects(&thread), [RECEIVER, LOCK]);
    assert_eq!(thread.monitor_pool.live(), 2);
    let frame = *thread.bytecode_frame(1).unwrap();
    for id in thread.monitor_pool.chain(thread.monitor_records) {
        assert_eq!(thread.monitor_pool.get(id).unwrap().frame_base, Some(frame.a0));
    }
    assert_eq!(thread.stack.read(frame.local_slot(2)), RECEIVER);
    assert_eq!(thread.stack.read(frame.local_slot(1)), LOCK);
}

#[test]
fn test_exhausted_pool_fails_capture() {
    let config = DecompConfig {
        monitor_pool_capacity: Some(2),
        ..DecompConfig::for_testing()
    };
    let (shared, mut thread) = sync_frame(config);
    let info = compiled_info(&thread, 1);

    let err = add_decompilation(&shared, &mut thread, &info, DecompReason::CODE_BREAKPOINT);
    assert_eq!(err, Err(DecompError::MonitorPoolExhausted));
    assert_eq!(thread.monitor_pool.live(), 0);
    assert!(thread.decompilations.is_empty());
    assert_eq!(thread.stack.read(info.pc_slot.unwrap()), SYNC_PC);
}
