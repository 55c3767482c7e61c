//! Compiled-frame metadata.
//!
//! For every resumable compiled PC the JIT records which bytecode position
//! each (possibly inlined) frame was at and which monitors were held. The
//! engine only consumes this through [`FrameMetadataOracle`].

use std::fmt;

use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use revert_core::{MethodId, Word, value::words_for_bytes};

// =============================================================================
// Monitor Bitmaps
// =============================================================================

/// One bit per monitor slot of a compiled frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MonitorBitmap(SmallVec<[u8; 4]>);

impl MonitorBitmap {
    /// Bitmap with the given bits set.
    pub fn from_bits(bits: &[usize]) -> Self {
        let mut map = Self::default();
        for &bit in bits {
            map.set(bit);
        }
        map
    }

    /// Set bit `index`.
    pub fn set(&mut self, index: usize) {
        let byte = index / 8;
        if self.0.len() <= byte {
            self.0.resize(byte + 1, 0);
        }
        self.0[byte] |= 1 << (index % 8);
    }

    /// Whether bit `index` is set.
    #[inline]
    pub fn get(&self, index: usize) -> bool {
        self.0
            .get(index / 8)
            .is_some_and(|byte| byte & (1 << (index % 8)) != 0)
    }

    /// Indices of set bits below `limit`, in increasing order.
    pub fn iter_set(&self, limit: usize) -> impl Iterator<Item = usize> + '_ {
        (0..limit).filter(move |&bit| self.get(bit))
    }
}

// =============================================================================
// PC Maps
// =============================================================================

/// One inlined frame at a compiled PC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InlinedCallSite {
    /// Inlined method.
    pub method: MethodId,
    /// Resume offset inside the inlined method.
    pub bytecode_offset: u32,
    /// Monitor slots owned by this frame.
    pub monitor_mask: Option<MonitorBitmap>,
}

/// Everything the JIT knows about one compiled PC.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PcMaps {
    /// Inlined frames, innermost first. Empty when nothing is inlined.
    pub call_sites: SmallVec<[InlinedCallSite; 4]>,
    /// Resume offset of the outermost method.
    pub bytecode_offset: u32,
    /// Monitor slots owned by the outermost method.
    pub monitor_mask: Option<MonitorBitmap>,
    /// Monitor slots holding an entered object at this PC.
    pub live_monitors: Option<MonitorBitmap>,
}

impl PcMaps {
    /// Maps for a PC with no inlining.
    pub fn outer(bytecode_offset: u32) -> Self {
        Self {
            bytecode_offset,
            ..Default::default()
        }
    }

    /// Push an inlined frame outside the ones already present.
    pub fn inlined(mut self, method: MethodId, bytecode_offset: u32) -> Self {
        self.call_sites.push(InlinedCallSite {
            method,
            bytecode_offset,
            monitor_mask: None,
        });
        self
    }

    /// Number of inlined frames.
    #[inline]
    pub fn inline_depth(&self) -> usize {
        self.call_sites.len()
    }

    /// Number of interpreter frames a decompilation at this PC produces.
    #[inline]
    pub fn frame_count(&self) -> usize {
        self.call_sites.len() + 1
    }

    /// Resume offset of the innermost frame.
    pub fn innermost_bytecode_offset(&self) -> u32 {
        self.call_sites
            .first()
            .map_or(self.bytecode_offset, |site| site.bytecode_offset)
    }

    /// Monitor mask of frame `index` counted innermost first.
    pub fn monitor_mask(&self, index: usize) -> Option<&MonitorBitmap> {
        match self.call_sites.get(index) {
            Some(site) => site.monitor_mask.as_ref(),
            None => self.monitor_mask.as_ref(),
        }
    }
}

// =============================================================================
// Oracle
// =============================================================================

/// Read-only access to a compiled body's metadata.
pub trait FrameMetadataOracle: Send + Sync + fmt::Debug {
    /// Maps for `jit_pc`, if the PC is a recorded resume point.
    fn maps_from_pc(&self, jit_pc: Word) -> Option<&PcMaps>;

    /// Number of monitor slots described by the bitmaps.
    fn monitor_map_bits(&self) -> usize;

    /// Scratch bytes the OSR trampoline needs at `jit_pc`.
    fn osr_scratch_bytes(&self, jit_pc: Word) -> usize;

    /// Scratch words the OSR trampoline needs at `jit_pc`.
    #[inline]
    fn osr_scratch_words(&self, jit_pc: Word) -> usize {
        words_for_bytes(self.osr_scratch_bytes(jit_pc))
    }
}

/// Table-backed metadata.
#[derive(Debug, Clone, Default)]
pub struct MetadataTable {
    maps: FxHashMap<Word, PcMaps>,
    monitor_map_bits: usize,
    scratch_bytes: usize,
}

impl MetadataTable {
    /// Empty table describing `monitor_map_bits` monitor slots.
    pub fn new(monitor_map_bits: usize) -> Self {
        Self {
            monitor_map_bits,
            ..Default::default()
        }
    }

    /// Record the maps for `jit_pc`.
    pub fn with_pc(mut self, jit_pc: Word, maps: PcMaps) -> Self {
        self.maps.insert(jit_pc, maps);
        self
    }

    /// Scratch bytes needed at every PC.
    pub fn with_scratch_bytes(mut self, bytes: usize) -> Self {
        self.scratch_bytes = bytes;
        self
    }
}

impl FrameMetadataOracle for MetadataTable {
    #[inline]
    fn maps_from_pc(&self, jit_pc: Word) -> Option<&PcMaps> {
        self.maps.get(&jit_pc)
    }

    #[inline]
    fn monitor_map_bits(&self) -> usize {
        self.monitor_map_bits
    }

    #[inline]
    fn osr_scratch_bytes(&self, _jit_pc: Word) -> usize {
        self.scratch_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bitmap() {
        let map = MonitorBitmap::from_bits(&[0, 9]);
        assert!(map.get(0));
        assert!(!map.get(1));
        assert!(map.get(9));
        assert!(!map.get(64));
        assert_eq!(map.iter_set(16).collect::<Vec<_>>(), vec![0, 9]);
    }

    #[test]
    fn test_innermost_offset() {
        let maps = PcMaps::outer(12);
        assert_eq!(maps.innermost_bytecode_offset(), 12);
        assert_eq!(maps.frame_count(), 1);

        let maps = PcMaps::outer(12).inlined(MethodId(4), 3).inlined(MethodId(5), 7);
        assert_eq!(maps.innermost_bytecode_offset(), 3);
        assert_eq!(maps.inline_depth(), 2);
    }

    #[test]
    fn test_monitor_mask_falls_back_to_outer() {
        let mut maps = PcMaps::outer(0).inlined(MethodId(2), 1);
        maps.monitor_mask = Some(MonitorBitmap::from_bits(&[1]));
        maps.call_sites[0].monitor_mask = Some(MonitorBitmap::from_bits(&[0]));
        assert!(maps.monitor_mask(0).unwrap().get(0));
        assert!(maps.monitor_mask(1).unwrap().get(1));
    }

    #[test]
    fn test_scratch_words_round_up() {
        let table = MetadataTable::new(0).with_scratch_bytes(9);
        assert_eq!(table.osr_scratch_words(0), 2);
    }
}
