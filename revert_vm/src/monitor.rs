//! Monitor enter records.
//!
//! The interpreter tracks every monitor a frame entered with a record
//! chained off the thread. Compiled code does not, so capture creates the
//! records from the live-monitor maps and rebuild links them onto the thread.

use revert_core::{ObjectRef, SlotIndex, Word};

/// Handle to a record in a [`MonitorRecordPool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MonitorRecordId(u32);

impl MonitorRecordId {
    /// Encode an optional chain head as a buffer word (0 for none).
    #[inline]
    pub fn to_word(id: Option<Self>) -> Word {
        id.map_or(0, |id| Word::from(id.0) + 1)
    }

    /// Decode a word written by [`MonitorRecordId::to_word`].
    #[inline]
    pub fn from_word(word: Word) -> Option<Self> {
        word.checked_sub(1).map(|raw| Self(raw as u32))
    }
}

/// One entered monitor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorEnterRecord {
    /// The locked object.
    pub object: ObjectRef,
    /// `a0` of the interpreter frame that owns the record, once rebuilt.
    pub frame_base: Option<SlotIndex>,
    /// Recursive entries folded into this record.
    pub drop_count: u32,
    /// Next record in the chain.
    pub next: Option<MonitorRecordId>,
}

impl MonitorEnterRecord {
    /// An unlinked record for `object`.
    pub fn new(object: ObjectRef) -> Self {
        Self {
            object,
            frame_base: None,
            drop_count: 1,
            next: None,
        }
    }
}

/// Source of monitor enter records.
pub trait MonitorRecordPool {
    /// Store a record, returning `None` when the pool is exhausted.
    fn acquire(&mut self, record: MonitorEnterRecord) -> Option<MonitorRecordId>;

    /// Return a record to the pool.
    fn release(&mut self, id: MonitorRecordId) -> Option<MonitorEnterRecord>;

    /// Look up a live record.
    fn get(&self, id: MonitorRecordId) -> Option<&MonitorEnterRecord>;

    /// Look up a live record mutably.
    fn get_mut(&mut self, id: MonitorRecordId) -> Option<&mut MonitorEnterRecord>;

    /// Release every record reachable from `head`. Returns how many were released.
    fn release_chain(&mut self, mut head: Option<MonitorRecordId>) -> usize {
        let mut released = 0;
        while let Some(id) = head {
            head = self.release(id).and_then(|record| record.next);
            released += 1;
        }
        released
    }
}

/// Slab-backed per-thread pool.
#[derive(Debug, Default)]
pub struct MonitorPool {
    slots: Vec<Option<MonitorEnterRecord>>,
    free: Vec<u32>,
    live: usize,
    capacity: Option<usize>,
}

impl MonitorPool {
    /// Create a pool holding at most `capacity` live records.
    pub fn new(capacity: Option<usize>) -> Self {
        Self {
            capacity,
            ..Default::default()
        }
    }

    /// Number of live records.
    #[inline]
    pub fn live(&self) -> usize {
        self.live
    }

    /// Ids reachable from `head`, in chain order.
    pub fn chain(&self, mut head: Option<MonitorRecordId>) -> Vec<MonitorRecordId> {
        let mut ids = Vec::new();
        while let Some(id) = head {
            ids.push(id);
            head = self.get(id).and_then(|record| record.next);
        }
        ids
    }
}

impl MonitorRecordPool for MonitorPool {
    fn acquire(&mut self, record: MonitorEnterRecord) -> Option<MonitorRecordId> {
        if self.capacity.is_some_and(|cap| self.live >= cap) {
            return None;
        }
        self.live += 1;
        if let Some(raw) = self.free.pop() {
            self.slots[raw as usize] = Some(record);
            return Some(MonitorRecordId(raw));
        }
        self.slots.push(Some(record));
        Some(MonitorRecordId((self.slots.len() - 1) as u32))
    }

    fn release(&mut self, id: MonitorRecordId) -> Option<MonitorEnterRecord> {
        let record = self.slots.get_mut(id.0 as usize)?.take()?;
        self.free.push(id.0);
        self.live -= 1;
        Some(record)
    }

    #[inline]
    fn get(&self, id: MonitorRecordId) -> Option<&MonitorEnterRecord> {
        self.slots.get(id.0 as usize)?.as_ref()
    }

    #[inline]
    fn get_mut(&mut self, id: MonitorRecordId) -> Option<&mut MonitorEnterRecord> {
        self.slots.get_mut(id.0 as usize)?.as_mut()
    }
}
