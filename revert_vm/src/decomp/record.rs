//! Pending decompilation records.
//!
//! A thread keeps at most one record per compiled frame, ordered from the
//! top of the stack down. Because the stack grows toward lower indices, that
//! is ascending order of the frame's bp slot, and the next record to consume
//! is always the head.

use std::collections::VecDeque;

use revert_core::{DecompResult, MethodId, SlotIndex, Word};

use super::osr::OsrBuffer;
use super::reason::DecompReason;

/// Identity of a compiled frame: its bp slot.
pub type FrameIdentity = SlotIndex;

/// A compiled frame scheduled to be rebuilt as interpreter frames.
#[derive(Debug)]
pub struct DecompilationRecord {
    pub(crate) frame: FrameIdentity,
    pub(crate) reason: DecompReason,
    pub(crate) pc_slot: SlotIndex,
    pub(crate) pc: Word,
    pub(crate) method: MethodId,
    pub(crate) uses_osr: bool,
    pub(crate) buffer: OsrBuffer,
}

impl DecompilationRecord {
    /// bp of the compiled frame.
    #[inline]
    pub fn frame(&self) -> FrameIdentity {
        self.frame
    }

    /// Accumulated reasons.
    #[inline]
    pub fn reason(&self) -> DecompReason {
        self.reason
    }

    /// Slot holding the continuation label in place of the resume address.
    #[inline]
    pub fn pc_slot(&self) -> SlotIndex {
        self.pc_slot
    }

    /// Original compiled resume address.
    #[inline]
    pub fn pc(&self) -> Word {
        self.pc
    }

    /// Outermost method of the compiled frame.
    #[inline]
    pub fn method(&self) -> MethodId {
        self.method
    }

    /// Whether the buffer was filled by the OSR trampoline.
    #[inline]
    pub fn uses_osr(&self) -> bool {
        self.uses_osr
    }

    /// Whether the buffer borrows the global OSR buffer.
    #[inline]
    pub fn uses_global_buffer(&self) -> bool {
        self.buffer.is_shared()
    }

    /// Captured frames.
    #[inline]
    pub fn buffer(&self) -> &OsrBuffer {
        &self.buffer
    }

    /// Captured frames, mutably.
    #[inline]
    pub fn buffer_mut(&mut self) -> &mut OsrBuffer {
        &mut self.buffer
    }

    /// Whether `method` runs in any of the captured frames.
    pub fn runs(&self, method: MethodId) -> bool {
        self.method == method || self.buffer.frames().any(|frame| frame.method() == method)
    }

    /// Interpreter frames this record expands into.
    #[inline]
    pub fn frame_count(&self) -> usize {
        self.buffer.frame_count()
    }
}

/// What [`DecompilationStore::add_or_merge`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    /// A new record was built and inserted.
    Inserted,
    /// The reason was merged into an existing record.
    Merged,
}

/// A thread's pending decompilations, head first.
#[derive(Debug, Default)]
pub struct DecompilationStore {
    records: VecDeque<DecompilationRecord>,
}

impl DecompilationStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of pending records.
    #[inline]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether nothing is pending.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Records head first.
    pub fn iter(&self) -> impl Iterator<Item = &DecompilationRecord> {
        self.records.iter()
    }

    /// Next record to consume.
    #[inline]
    pub fn head(&self) -> Option<&DecompilationRecord> {
        self.records.front()
    }

    #[inline]
    pub(crate) fn head_mut(&mut self) -> Option<&mut DecompilationRecord> {
        self.records.front_mut()
    }

    fn position(&self, frame: FrameIdentity) -> Result<usize, usize> {
        self.records.binary_search_by_key(&frame, |record| record.frame)
    }

    /// Record for `frame`.
    pub fn find(&self, frame: FrameIdentity) -> Option<&DecompilationRecord> {
        self.position(frame).ok().map(|i| &self.records[i])
    }

    /// Record for `frame`, mutably.
    pub fn find_mut(&mut self, frame: FrameIdentity) -> Option<&mut DecompilationRecord> {
        self.position(frame).ok().map(|i| &mut self.records[i])
    }

    /// Merge `reason` into the record for `frame`, or build and insert one.
    ///
    /// `build` runs only when no record exists; its failure leaves the store
    /// unchanged.
    pub fn add_or_merge<F>(
        &mut self,
        frame: FrameIdentity,
        reason: DecompReason,
        build: F,
    ) -> DecompResult<AddOutcome>
    where
        F: FnOnce() -> DecompResult<DecompilationRecord>,
    {
        match self.position(frame) {
            Ok(index) => {
                self.records[index].reason |= reason;
                Ok(AddOutcome::Merged)
            }
            Err(index) => {
                let record = build()?;
                assert_eq!(record.frame, frame, "record built for the wrong frame");
                self.records.insert(index, record);
                Ok(AddOutcome::Inserted)
            }
        }
    }

    /// Insert a record that is known to be absent.
    #[cfg(test)]
    pub(crate) fn insert(&mut self, record: DecompilationRecord) {
        match self.position(record.frame) {
            Err(index) => self.records.insert(index, record),
            Ok(_) => panic!("duplicate decompilation record for frame {}", record.frame),
        }
    }

    /// Remove and return the head.
    #[inline]
    pub fn pop_next(&mut self) -> Option<DecompilationRecord> {
        self.records.pop_front()
    }

    /// Remove the record for `frame`.
    pub fn remove(&mut self, frame: FrameIdentity) -> Option<DecompilationRecord> {
        let index = self.position(frame).ok()?;
        self.records.remove(index)
    }

    /// Clear `reasons` from records running `method` (or every record),
    /// returning the records left with no reason at all.
    pub fn remove_where(
        &mut self,
        reasons: DecompReason,
        method: Option<MethodId>,
    ) -> Vec<DecompilationRecord> {
        let mut cancelled = Vec::new();
        let mut index = 0;
        while index < self.records.len() {
            let record = &mut self.records[index];
            let matches = method.is_none_or(|m| record.runs(m));
            if matches && record.reason.intersects(reasons) {
                record.reason.remove(reasons);
                if record.reason.is_empty() {
                    if let Some(record) = self.records.remove(index) {
                        cancelled.push(record);
                    }
                    continue;
                }
            }
            index += 1;
        }
        cancelled
    }

    /// Remove records for frames strictly above `boundary`.
    pub fn drain_above(&mut self, boundary: FrameIdentity) -> Vec<DecompilationRecord> {
        let split = self.records.partition_point(|record| record.frame < boundary);
        self.records.drain(..split).collect()
    }

    /// Whether records are strictly ascending by frame.
    pub fn is_sorted(&self) -> bool {
        self.records
            .iter()
            .zip(self.records.iter().skip(1))
            .all(|(a, b)| a.frame < b.frame)
    }
}
