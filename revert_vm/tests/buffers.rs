//! OSR buffer allocation: the global fallback, retained blocks and induced OSR.

mod common;

use std::sync::Arc;

use common::*;
use revert_core::{DecompConfig, DecompError, ReturnValue};
use revert_vm::decomp::{
    AddOutcome, ContinuationLabel, add_decompilation, ensure_osr_buffer_size,
    induce_osr_on_current_thread, on_compiled_return, on_resolve_return, osr_frames_words,
    rounded_scratch_words,
};
use revert_vm::{DecompReason, LimitedAllocator, ResolveContext, ResumeAction};

#[test]
fn test_global_buffer_serves_one_capture_at_a_time() {
    let allocator = Arc::new(LimitedAllocator::new(1));
    let shared = shared_with_allocator(DecompConfig::for_testing(), allocator.clone());
    assert_eq!(shared.global_osr.words(), 256);
    assert_eq!(allocator.remaining(), 0);

    let scenario = install_outer(&shared);
    let mut first = thread(&shared, 1);
    let mut second = thread(&shared, 2);
    enter_outer(&mut first, &scenario);
    enter_outer(&mut second, &scenario);

    let info = compiled_info(&first, 1);
    assert_eq!(
        add_decompilation(&shared, &mut first, &info, DecompReason::HOTSWAP),
        Ok(AddOutcome::Inserted)
    );
    assert!(first.decompilations.head().unwrap().uses_global_buffer());

    let other = compiled_info(&second, 1);
    let err = add_decompilation(&shared, &mut second, &other, DecompReason::HOTSWAP);
    assert!(matches!(err, Err(DecompError::GlobalBufferUnavailable { .. })));
    assert!(second.decompilations.is_empty());
    assert_eq!(second.stack.read(other.pc_slot.unwrap()), OUTER_PC);

    // Consuming the first record hands the buffer back.
    let action = on_compiled_return(&shared, &mut first, ReturnValue::single(1));
    assert_eq!(action, Ok(ResumeAction::ExecuteBytecode));
    assert!(shared.global_osr.try_lock().is_some());

    assert_eq!(
        add_decompilation(&shared, &mut second, &other, DecompReason::HOTSWAP),
        Ok(AddOutcome::Inserted)
    );
    let stats = shared.stats.snapshot();
    assert_eq!(stats.global_buffer_uses, 2);
    assert_eq!(stats.capture_failures, 1);
}

#[test]
fn test_swept_record_keeps_only_its_frames() {
    let shared = shared(DecompConfig::for_testing());
    let scenario = install_outer(&shared);
    let mut thread = thread(&shared, 1);
    enter_outer(&mut thread, &scenario);
    let info = compiled_info(&thread, 1);
    add_decompilation(&shared, &mut thread, &info, DecompReason::HOTSWAP).unwrap();

    let buffer = thread.decompilations.head().unwrap().buffer();
    let frames = osr_frames_words([&*scenario.outer.method]);
    assert_eq!(buffer.word_len(), frames);
    assert_eq!(buffer.storage_words(), frames);
    assert!(!buffer.is_shared());
}

#[test]
fn test_working_block_falls_back_to_global_buffer_briefly() {
    // One allocation for the global buffer, one for the record.
    let allocator = Arc::new(LimitedAllocator::new(2));
    let shared = shared_with_allocator(DecompConfig::for_testing(), allocator.clone());
    let scenario = install_outer(&shared);
    let mut thread = thread(&shared, 1);
    enter_outer(&mut thread, &scenario);
    let info = compiled_info(&thread, 1);
    add_decompilation(&shared, &mut thread, &info, DecompReason::HOTSWAP).unwrap();

    let record = thread.decompilations.head().unwrap();
    assert!(!record.uses_global_buffer());
    assert_eq!(record.buffer().storage_words(), record.buffer().word_len());
    assert!(shared.global_osr.try_lock().is_some());
    assert_eq!(shared.stats.snapshot().global_buffer_uses, 1);

    let action = on_compiled_return(&shared, &mut thread, ReturnValue::single(1));
    assert_eq!(action, Ok(ResumeAction::ExecuteBytecode));
    let frame = *thread.bytecode_frame(1).unwrap();
    assert_eq!(thread.stack.read(frame.local_slot(3)), 44);
}

#[test]
fn test_working_block_failure_fails_capture() {
    let allocator = Arc::new(LimitedAllocator::new(2));
    let config = DecompConfig {
        initial_global_osr_buffer_words: 4,
        ..DecompConfig::for_testing()
    };
    let shared = shared_with_allocator(config, allocator.clone());
    let scenario = install_outer(&shared);
    let mut thread = thread(&shared, 1);
    enter_outer(&mut thread, &scenario);
    let info = compiled_info(&thread, 1);

    let err = add_decompilation(&shared, &mut thread, &info, DecompReason::HOTSWAP);
    assert!(matches!(err, Err(DecompError::OutOfMemory { .. })));
    assert!(thread.decompilations.is_empty());
    assert_eq!(thread.stack.read(info.pc_slot.unwrap()), OUTER_PC);
}

#[test]
fn test_consumed_block_is_reused_for_same_size() {
    let allocator = Arc::new(LimitedAllocator::new(3));
    let shared = shared_with_allocator(DecompConfig::for_testing(), allocator.clone());
    let scenario = install_outer(&shared);
    let mut thread = thread(&shared, 1);

    enter_outer(&mut thread, &scenario);
    let info = compiled_info(&thread, 1);
    add_decompilation(&shared, &mut thread, &info, DecompReason::HOTSWAP).unwrap();
    assert_eq!(allocator.remaining(), 0);
    assert!(!thread.decompilations.head().unwrap().uses_global_buffer());
    on_compiled_return(&shared, &mut thread, ReturnValue::single(1)).unwrap();

    // Same method again, now called from the rebuilt frame. Only the working
    // block is allocated.
    allocator.set_remaining(1);
    enter_outer(&mut thread, &scenario);
    let info = compiled_info(&thread, 2);
    add_decompilation(&shared, &mut thread, &info, DecompReason::HOTSWAP).unwrap();
    assert_eq!(allocator.remaining(), 0);
    assert!(!thread.decompilations.head().unwrap().uses_global_buffer());
    assert_eq!(shared.stats.snapshot().global_buffer_uses, 0);
}

#[test]
fn test_nothing_retained_when_disabled() {
    let allocator = Arc::new(LimitedAllocator::new(2));
    let config = DecompConfig {
        retain_last_record: false,
        ..DecompConfig::for_testing()
    };
    let shared = shared_with_allocator(config, allocator);
    let scenario = install_outer(&shared);
    let mut thread = thread(&shared, 1);

    enter_outer(&mut thread, &scenario);
    let info = compiled_info(&thread, 1);
    add_decompilation(&shared, &mut thread, &info, DecompReason::HOTSWAP).unwrap();
    on_compiled_return(&shared, &mut thread, ReturnValue::single(1)).unwrap();

    enter_outer(&mut thread, &scenario);
    let info = compiled_info(&thread, 2);
    add_decompilation(&shared, &mut thread, &info, DecompReason::HOTSWAP).unwrap();
    assert!(thread.decompilations.head().unwrap().uses_global_buffer());
}

#[test]
fn test_induced_osr_uses_presized_global_buffer() {
    let allocator = Arc::new(LimitedAllocator::new(2));
    let config = DecompConfig {
        initial_global_osr_buffer_words: 8,
        ..DecompConfig::for_testing()
    };
    let shared = shared_with_allocator(config, allocator.clone());
    let scenario = install_outer(&shared);

    let code = &scenario.outer;
    let frames = osr_frames_words([&*code.method]);
    let scratch = rounded_scratch_words(code, OUTER_PC);
    let copy = code.method.arg_count as usize + 1 + code.total_frame_size;
    assert!(ensure_osr_buffer_size(&shared, frames, scratch, copy));
    assert_eq!(shared.global_osr.words(), frames + scratch + copy);
    assert_eq!(allocator.remaining(), 0);

    let mut thread = thread(&shared, 1);
    thread.call_compiled_from_interpreter(Arc::clone(code), &[11, 22]);
    let unwind_sp = thread.regs.sp;
    thread.stack.write(unwind_sp + 5, 33);
    thread.stack.write(unwind_sp + 4, 44);
    thread.stack.write(unwind_sp + 1, 55);
    thread.push_resolve_frame(Some(ResolveContext::Generic), OUTER_PC);

    induce_osr_on_current_thread(&shared, &mut thread).unwrap();
    let record = thread.decompilations.head().unwrap();
    assert!(record.uses_global_buffer());
    assert_eq!(record.buffer().storage_words(), frames + scratch + copy);
    assert!(record.reason().contains(DecompReason::ON_STACK_REPLACEMENT));
    assert_eq!(
        thread.stack.read(unwind_sp - 1),
        ContinuationLabel::AtCurrentPc.address()
    );

    assert_eq!(on_resolve_return(&shared, &mut thread), Ok(ResumeAction::ExecuteBytecode));
    let frame = *thread.bytecode_frame(1).unwrap();
    let locals: Vec<_> = (0..4).map(|i| thread.stack.read(frame.local_slot(i))).collect();
    assert_eq!(locals, [11, 22, 33, 44]);
    assert_eq!(thread.stack.read(frame.operand_slot(0)), 55);
    assert_eq!(thread.regs.sp, frame.operand_slot(0));
    assert_eq!(thread.regs.pc.offset, 7);
    assert!(shared.global_osr.try_lock().is_some());
}
