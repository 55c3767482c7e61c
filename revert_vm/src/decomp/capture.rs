//! Capturing compiled frames into decompilation records.
//!
//! Capture runs either on the frame's own thread or on a stopped thread
//! during a stop-the-world sweep. It sizes and obtains a buffer, describes
//! every interpreter frame the compiled frame expands into, recreates the
//! frame's monitor records, and on the OSR path asks the trampoline to move
//! live values into the buffer. Only after all of that succeeds is the
//! continuation label written over the frame's resume address.
//!
//! A swept record keeps only its OSR frames. The trampoline's scratch space
//! and the frame copy come from a separate working block that is released
//! as soon as the trampoline returns. Induced OSR, and a sweep that had to
//! borrow the global buffer, keep all three in one block:
//!
//! ```text
//!   buffer storage
//!   ┌───────────────────────┬──────────────────┬────────────────────────┐
//!   │ OSR frames            │ scratch          │ frame copy             │
//!   │ (kept with record)    │ (trampoline)     │ (unwind sp ..= a0)     │
//!   └───────────────────────┴──────────────────┴────────────────────────┘
//! ```

use std::sync::Arc;

use smallvec::SmallVec;

use revert_core::{DecompConfig, DecompError, DecompResult, Method, ObjectRef, SlotIndex, Word};

use super::dispatch::{ContinuationLabel, invoke_return_kind, select_continuation};
use super::osr::{OsrBuffer, OsrFramesMut, osr_frames_words, pending_stack_height};
use super::reason::DecompReason;
use super::record::{AddOutcome, DecompilationRecord};
use crate::alloc::BufferStorage;
use crate::code_cache::{CompiledMethod, OsrFill, OsrOutcome};
use crate::frame::ResolveContext;
use crate::metadata::PcMaps;
use crate::monitor::{MonitorEnterRecord, MonitorPool, MonitorRecordId, MonitorRecordPool};
use crate::stack::StackArena;
use crate::thread::VmThread;
use crate::vm::VmShared;
use crate::walk::{CompiledFrameInfo, ShadowStackWalker, StackWalker};

/// Smallest scratch area handed to a trampoline, in words.
pub const MIN_OSR_SCRATCH_WORDS: usize = 8;

/// Whether a capture of `code` stopped in `resolve` takes the OSR path.
///
/// A frame stopped in its stack overflow check has not run its prologue,
/// so there are no live values for a trampoline to move.
#[inline]
pub fn uses_osr(config: &DecompConfig, code: &CompiledMethod, resolve: Option<ResolveContext>) -> bool {
    resolve != Some(ResolveContext::StackOverflow) && config.osr_enabled && code.uses_osr
}

/// Scratch words the trampoline needs at `jit_pc`.
#[inline]
pub fn rounded_scratch_words(code: &CompiledMethod, jit_pc: Word) -> usize {
    code.metadata.osr_scratch_words(jit_pc).max(MIN_OSR_SCRATCH_WORDS)
}

/// Grow the global OSR buffer to fit one capture of the given sizes.
///
/// Called when a method that may later be OSR-induced is compiled. Returns
/// false if the buffer could not be grown.
pub fn ensure_osr_buffer_size(
    shared: &VmShared,
    frames_words: usize,
    scratch_words: usize,
    copy_words: usize,
) -> bool {
    let required = frames_words + scratch_words + copy_words;
    shared.global_osr.ensure_size(&*shared.allocator, required)
}

// =============================================================================
// Entry Points
// =============================================================================

/// Where a capture may fall back to when allocation fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StorageMode {
    /// Borrow the global buffer only if it is big enough and free right now.
    Sweep,
    /// Wait for the global buffer, which is sized to always fit.
    Induce,
}

/// Schedule the compiled frame `info` for decompilation.
///
/// If the frame already has a record `reason` is merged into it and nothing
/// else happens. Otherwise a record is captured and the frame's resume
/// address is replaced by a continuation label. On failure the thread is
/// left exactly as it was.
pub fn add_decompilation(
    shared: &VmShared,
    thread: &mut VmThread,
    info: &CompiledFrameInfo,
    reason: DecompReason,
) -> DecompResult<AddOutcome> {
    add_with_storage(shared, thread, info, reason, StorageMode::Sweep)
}

/// Force the topmost compiled frame of the calling thread through OSR.
///
/// The frame's code must have been compiled for OSR and the global buffer
/// sized for it with [`ensure_osr_buffer_size`], so this only fails if the
/// monitor pool or the trampoline does.
pub fn induce_osr_on_current_thread(shared: &VmShared, thread: &mut VmThread) -> DecompResult<()> {
    let info = ShadowStackWalker
        .visible_frame(thread, 0)
        .and_then(|frame| frame.compiled().cloned())
        .ok_or(DecompError::NotCompiled)?;
    assert!(
        uses_osr(&shared.config, &info.code, info.resolve),
        "OSR induced in {}, which cannot take the OSR path",
        info.code.method
    );
    add_with_storage(
        shared,
        thread,
        &info,
        DecompReason::ON_STACK_REPLACEMENT,
        StorageMode::Induce,
    )?;
    Ok(())
}

fn add_with_storage(
    shared: &VmShared,
    thread: &mut VmThread,
    info: &CompiledFrameInfo,
    reason: DecompReason,
    mode: StorageMode,
) -> DecompResult<AddOutcome> {
    let pc_slot = info.pc_slot.ok_or(DecompError::FrameNotWalkable)?;
    let mut label = None;

    let VmThread {
        stack,
        decompilations,
        monitor_pool,
        retained,
        ..
    } = thread;
    let result = decompilations.add_or_merge(info.bp, reason, || {
        let mut ctx = CaptureContext {
            shared,
            stack,
            pool: monitor_pool,
            retained,
        };
        let (record, selected) = ctx.capture(info, pc_slot, reason, mode)?;
        label = Some(selected);
        Ok(record)
    });

    match result {
        Ok(AddOutcome::Merged) => {
            shared.stats.record_merged();
            log::trace!("{} merged {reason} into record for frame {}", thread.id, info.bp);
            Ok(AddOutcome::Merged)
        }
        Ok(AddOutcome::Inserted) => {
            if let Some(label) = label {
                thread.stack.write(pc_slot, label.address());
            }
            let record_reason = thread
                .decompilations
                .find(info.bp)
                .map_or(reason, |record| record.reason());
            shared.stats.record_created(record_reason);
            log::debug!(
                "{} decompilation of {} at {:#x} scheduled for {record_reason}, label {}",
                thread.id,
                info.code.method,
                info.pc,
                label.map_or_else(|| "none".to_string(), |l| l.to_string())
            );
            if shared.config.verbose_stack_dump {
                thread.dump_stack("after adding decompilation");
            }
            Ok(AddOutcome::Inserted)
        }
        Err(err) => {
            shared.stats.capture_failed();
            log::debug!(
                "{} could not capture {} at {:#x}: {err}",
                thread.id,
                info.code.method,
                info.pc
            );
            Err(err)
        }
    }
}

// =============================================================================
// Capture
// =============================================================================

/// The parts of a thread a capture touches.
struct CaptureContext<'a> {
    shared: &'a VmShared,
    stack: &'a StackArena,
    pool: &'a mut MonitorPool,
    retained: &'a mut Option<Box<[Word]>>,
}

impl CaptureContext<'_> {
    fn capture(
        &mut self,
        info: &CompiledFrameInfo,
        pc_slot: SlotIndex,
        reason: DecompReason,
        mode: StorageMode,
    ) -> DecompResult<(DecompilationRecord, ContinuationLabel)> {
        let code = &info.code;
        let maps = code
            .metadata
            .maps_from_pc(info.pc)
            .ok_or(DecompError::MissingMaps { pc: info.pc })?;
        let methods = self.frame_methods(code, maps)?;

        let uses_osr = uses_osr(&self.shared.config, code, info.resolve);
        let frames_words = osr_frames_words(methods.iter().map(|m| &**m));
        let (scratch_words, copy_words) = if uses_osr {
            (rounded_scratch_words(code, info.pc), info.frame_words())
        } else {
            (0, 0)
        };
        let bundled_words = frames_words + scratch_words + copy_words;
        let record_words = match mode {
            StorageMode::Sweep => frames_words,
            StorageMode::Induce => bundled_words,
        };
        let storage = self.obtain_storage(record_words, bundled_words, mode)?;

        let mut buffer = OsrBuffer::new(storage, frames_words);
        buffer.write_header(info.pc, methods.len());
        for (index, method) in methods.iter().enumerate() {
            let offset = maps
                .call_sites
                .get(index)
                .map_or(maps.bytecode_offset, |site| site.bytecode_offset);
            let resolve = if index == 0 { info.resolve } else { None };
            let pending = pending_stack_height(method, offset, resolve);
            buffer.frame_mut(index).init(method, offset, pending);
        }

        let innermost = buffer.frame(0);
        let label = select_continuation(
            info.resolve,
            &code.method,
            invoke_return_kind(&methods[0], innermost.bytecode_offset()),
        );

        if let Err(err) = self.create_monitor_records(info, maps, &mut buffer) {
            self.discard(buffer);
            return Err(err);
        }

        let mut reason = reason;
        if uses_osr {
            let outcome = if mode == StorageMode::Induce || buffer.is_shared() {
                let (frames, tail) = buffer.split_tail();
                let (scratch, rest) = tail.split_at_mut(scratch_words);
                self.perform_osr(info, frames, scratch, &mut rest[..copy_words])
            } else {
                self.obtain_working(scratch_words + copy_words).and_then(|mut working| {
                    let (scratch, rest) = working.words_mut().split_at_mut(scratch_words);
                    let outcome =
                        self.perform_osr(info, buffer.frames_mut(), scratch, &mut rest[..copy_words]);
                    release_storage(self.shared, working);
                    outcome
                })
            };
            match outcome {
                Ok(OsrOutcome::Resumable) => {}
                Ok(OsrOutcome::Destructive) => {
                    reason |= DecompReason::ON_STACK_REPLACEMENT;
                    self.shared.stats.forced_decompile();
                }
                Err(err) => {
                    self.discard(buffer);
                    return Err(err);
                }
            }
            self.shared.stats.osr_captured();
        }

        let record = DecompilationRecord {
            frame: info.bp,
            reason,
            pc_slot,
            pc: info.pc,
            method: code.method.id,
            uses_osr,
            buffer,
        };
        Ok((record, label))
    }

    /// Methods of every interpreter frame, innermost first.
    fn frame_methods(
        &self,
        code: &CompiledMethod,
        maps: &PcMaps,
    ) -> DecompResult<SmallVec<[Arc<Method>; 4]>> {
        let classes = self.shared.classes.read();
        let mut methods = SmallVec::with_capacity(maps.frame_count());
        for site in &maps.call_sites {
            methods.push(Arc::clone(classes.method(site.method)?));
        }
        methods.push(Arc::clone(&code.method));
        Ok(methods)
    }

    /// Storage for a record of `words` words.
    ///
    /// The global buffer is only taken if it can hold `bundled_words`, since a
    /// record on it also keeps its scratch space and frame copy there.
    fn obtain_storage(
        &mut self,
        words: usize,
        bundled_words: usize,
        mode: StorageMode,
    ) -> DecompResult<BufferStorage> {
        if let Some(block) = self.retained.take_if(|block| block.len() == words) {
            return Ok(BufferStorage::Owned(block));
        }
        if let Some(block) = self.shared.allocator.allocate(words) {
            return Ok(BufferStorage::Owned(block));
        }

        let global = &self.shared.global_osr;
        let guard = match mode {
            StorageMode::Sweep => {
                if global.words() < bundled_words {
                    return Err(DecompError::GlobalBufferUnavailable { words: bundled_words });
                }
                global
                    .try_lock()
                    .ok_or(DecompError::GlobalBufferUnavailable { words: bundled_words })?
            }
            StorageMode::Induce => {
                assert!(
                    bundled_words <= global.words(),
                    "global OSR buffer of {} words cannot hold {bundled_words}",
                    global.words()
                );
                global.lock()
            }
        };
        if guard.len() < bundled_words {
            return Err(DecompError::GlobalBufferUnavailable { words: bundled_words });
        }
        self.shared.stats.global_buffer_used();
        log::debug!("allocation of {words} words failed, using the global OSR buffer");
        Ok(BufferStorage::Shared(guard))
    }

    /// Scratch space and frame copy for one trampoline call.
    fn obtain_working(&self, words: usize) -> DecompResult<BufferStorage> {
        if let Some(block) = self.shared.allocator.allocate(words) {
            return Ok(BufferStorage::Owned(block));
        }
        let mut guard = self
            .shared
            .global_osr
            .try_lock()
            .filter(|guard| guard.len() >= words)
            .ok_or(DecompError::OutOfMemory { words })?;
        guard[..words].fill(0);
        self.shared.stats.global_buffer_used();
        log::debug!("allocation of {words} OSR working words failed, using the global OSR buffer");
        Ok(BufferStorage::Shared(guard))
    }

    /// Recreate the monitor records of every frame from the live-monitor map.
    fn create_monitor_records(
        &mut self,
        info: &CompiledFrameInfo,
        maps: &PcMaps,
        buffer: &mut OsrBuffer,
    ) -> DecompResult<()> {
        let Some(live) = maps.live_monitors.as_ref() else {
            return Ok(());
        };
        let bits = info.code.metadata.monitor_map_bits();
        let argc = info.code.method.arg_count as usize;

        for index in 0..buffer.frame_count() {
            let Some(mask) = maps.monitor_mask(index) else {
                continue;
            };
            let mut ids: SmallVec<[MonitorRecordId; 4]> = SmallVec::new();
            for bit in live.iter_set(bits).filter(|&bit| mask.get(bit)) {
                let slot = if bit < argc {
                    info.object_arg_scan_cursor() + bit
                } else {
                    info.object_temp_scan_cursor() + (bit - argc)
                };
                let Some(object) = ObjectRef::from_word(self.stack.read(slot)) else {
                    panic!("live monitor slot {bit} of {} holds null", info.code.method);
                };
                match self.pool.acquire(MonitorEnterRecord::new(object)) {
                    Some(id) => ids.push(id),
                    None => {
                        for id in ids {
                            self.pool.release(id);
                        }
                        return Err(DecompError::MonitorPoolExhausted);
                    }
                }
            }
            for pair in ids.windows(2) {
                if let Some(record) = self.pool.get_mut(pair[0]) {
                    record.next = Some(pair[1]);
                }
            }
            buffer.frame_mut(index).set_monitor_records(ids.first().copied());
        }
        Ok(())
    }

    fn perform_osr(
        &self,
        info: &CompiledFrameInfo,
        frames: OsrFramesMut<'_>,
        scratch: &mut [Word],
        frame_copy: &mut [Word],
    ) -> DecompResult<OsrOutcome> {
        let code = &info.code;
        assert_eq!(
            frame_copy.len(),
            code.method.arg_count as usize + 1 + code.total_frame_size,
            "compiled frame of {} has an unexpected size",
            code.method
        );
        let trampoline = code
            .trampoline
            .as_ref()
            .ok_or(DecompError::MissingMaps { pc: info.pc })?;

        frame_copy.copy_from_slice(self.stack.slice(info.unwind_sp..info.a0 + 1));

        let mut fill = OsrFill {
            jit_pc: info.pc,
            frame_copy: &*frame_copy,
            scratch,
            frames,
        };
        trampoline.fill(&mut fill)
    }

    /// Undo a capture that failed after its storage was obtained.
    fn discard(&mut self, buffer: OsrBuffer) {
        for frame in buffer.frames() {
            self.pool.release_chain(frame.monitor_records());
        }
        release_storage(self.shared, buffer.into_storage());
    }
}

fn release_storage(shared: &VmShared, storage: BufferStorage) {
    match storage {
        BufferStorage::Owned(block) => shared.allocator.free(block),
        BufferStorage::Shared(guard) => drop(guard),
    }
}

// =============================================================================
// Release
// =============================================================================

/// Release everything a record holds.
///
/// Monitor records still attached to its frames go back to the pool. With
/// `retain`, an owned buffer is kept on the thread for the next capture of
/// the same size, replacing any block kept before.
pub fn free_record(shared: &VmShared, thread: &mut VmThread, record: DecompilationRecord, retain: bool) {
    for frame in record.buffer.frames() {
        thread.monitor_pool.release_chain(frame.monitor_records());
    }
    if retain {
        shared.stats.record_consumed();
    }
    if let Some(old) = thread.retained.take() {
        shared.allocator.free(old);
    }
    match record.buffer.into_storage() {
        BufferStorage::Owned(block) if retain && shared.config.retain_last_record => {
            thread.retained = Some(block);
        }
        storage => release_storage(shared, storage),
    }
}

/// Withdraw a record whose frame will keep running compiled code.
pub fn cancel_record(shared: &VmShared, thread: &mut VmThread, record: DecompilationRecord) {
    thread.stack.write(record.pc_slot, record.pc);
    log::debug!(
        "{} cancelled decompilation of {} for frame {}",
        thread.id,
        record.method,
        record.frame
    );
    shared.stats.record_cancelled();
    free_record(shared, thread, record, false);
}
