//! Per-chunk queue of (x, z) columns awaiting light recalculation.

use parking_lot::Mutex;
use rustc_hash::FxHashSet;
use thiserror::Error;
use tessera_voxel::CHUNK_MASK;

/// Errors from [`LightQueue::enqueue`].
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum LightError {
    /// Neither sky nor block light was requested.
    #[error("light update requested for neither sky nor block light")]
    NoLightKind,
}

/// Which light kinds a column needs recalculated.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LightKinds {
    /// Recalculate sky light.
    pub sky: bool,
    /// Recalculate block light.
    pub block: bool,
}

impl LightKinds {
    /// Sky light only.
    pub const SKY: LightKinds = LightKinds {
        sky: true,
        block: false,
    };
    /// Block light only.
    pub const BLOCK: LightKinds = LightKinds {
        sky: false,
        block: true,
    };
    /// Both kinds.
    pub const BOTH: LightKinds = LightKinds {
        sky: true,
        block: true,
    };

    /// Kinds affected by replacing one material with another: sky light when
    /// opacity differs, block light when emission differs.
    pub fn from_change(old_opacity: u8, new_opacity: u8, old_emission: u8, new_emission: u8) -> Self {
        Self {
            sky: old_opacity != new_opacity,
            block: old_emission != new_emission,
        }
    }

    /// Returns `true` if no kind is selected.
    pub fn is_empty(self) -> bool {
        !self.sky && !self.block
    }
}

/// Packs a masked local column into one byte: `x` in the high nibble, `z` in
/// the low nibble.
#[inline]
pub fn pack_column(x: i32, z: i32) -> u8 {
    (((x & CHUNK_MASK) << 4) | (z & CHUNK_MASK)) as u8
}

/// Inverse of [`pack_column`].
#[inline]
pub fn unpack_column(packed: u8) -> (i32, i32) {
    (i32::from(packed >> 4), i32::from(packed & 0x0F))
}

/// Two sets of packed columns, one per light kind.
///
/// The locks cover set bookkeeping only; recalculation runs on the drained
/// columns with no lock held.
#[derive(Debug, Default)]
pub struct LightQueue {
    sky: Mutex<FxHashSet<u8>>,
    block: Mutex<FxHashSet<u8>>,
}

impl LightQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues the masked column `(x, z)` for the requested kinds.
    ///
    /// # Errors
    ///
    /// [`LightError::NoLightKind`] if `kinds` is empty; nothing is queued.
    pub fn enqueue(&self, x: i32, z: i32, kinds: LightKinds) -> Result<(), LightError> {
        if kinds.is_empty() {
            return Err(LightError::NoLightKind);
        }
        let column = pack_column(x, z);
        if kinds.sky {
            self.sky.lock().insert(column);
        }
        if kinds.block {
            self.block.lock().insert(column);
        }
        Ok(())
    }

    /// Total queued columns across both kinds.
    pub fn pending(&self) -> usize {
        self.sky.lock().len() + self.block.lock().len()
    }

    /// Returns `true` if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.pending() == 0
    }

    /// Takes every queued sky column, in ascending packed order.
    pub fn drain_sky(&self) -> Vec<(i32, i32)> {
        Self::drain(&self.sky)
    }

    /// Takes every queued block column, in ascending packed order.
    pub fn drain_block(&self) -> Vec<(i32, i32)> {
        Self::drain(&self.block)
    }

    fn drain(set: &Mutex<FxHashSet<u8>>) -> Vec<(i32, i32)> {
        let taken = std::mem::take(&mut *set.lock());
        let mut columns: Vec<u8> = taken.into_iter().collect();
        columns.sort_unstable();
        columns.into_iter().map(unpack_column).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enqueue_without_kind_is_rejected() {
        let queue = LightQueue::new();
        assert_eq!(
            queue.enqueue(1, 1, LightKinds::default()),
            Err(LightError::NoLightKind)
        );
        assert!(queue.is_empty());
    }

    #[test]
    fn test_duplicate_columns_collapse() {
        let queue = LightQueue::new();
        queue.enqueue(3, 4, LightKinds::BOTH).unwrap();
        queue.enqueue(19, 20, LightKinds::SKY).unwrap();
        assert_eq!(queue.pending(), 2);
        assert_eq!(queue.drain_sky(), vec![(3, 4)]);
        assert_eq!(queue.drain_block(), vec![(3, 4)]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_drain_orders_columns() {
        let queue = LightQueue::new();
        queue.enqueue(2, 0, LightKinds::BLOCK).unwrap();
        queue.enqueue(0, 5, LightKinds::BLOCK).unwrap();
        queue.enqueue(1, 15, LightKinds::BLOCK).unwrap();
        assert_eq!(queue.drain_block(), vec![(0, 5), (1, 15), (2, 0)]);
        assert!(queue.drain_sky().is_empty());
    }

    #[test]
    fn test_kinds_from_change() {
        assert_eq!(LightKinds::from_change(0, 15, 0, 0), LightKinds::SKY);
        assert_eq!(LightKinds::from_change(0, 0, 0, 14), LightKinds::BLOCK);
        assert!(LightKinds::from_change(3, 3, 1, 1).is_empty());
    }

    #[test]
    fn test_pack_column_roundtrip() {
        assert_eq!(pack_column(15, 1), 0xF1);
        assert_eq!(unpack_column(pack_column(-1, 16)), (15, 0));
    }
}
