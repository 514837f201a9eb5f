//! Vertical stacks of chunks sharing an (x, z) chunk coordinate.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};

use tessera_voxel::{CHUNK_MASK, CHUNK_SIZE, ChunkAddress};
use tracing::debug;

/// Lookup key of a column: the chunk-grid x and z it spans.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ColumnKey {
    /// Chunk-grid X.
    pub x: i32,
    /// Chunk-grid Z.
    pub z: i32,
}

impl ColumnKey {
    /// Column containing `chunk`.
    pub fn of(chunk: ChunkAddress) -> Self {
        Self {
            x: chunk.x,
            z: chunk.z,
        }
    }
}

/// No non-air block known in this (x, z).
pub const NO_HEIGHT: i32 = i32::MIN;

/// Column-level data aggregated across the column's chunks.
#[derive(Debug)]
pub struct Column {
    key: ColumnKey,
    chunks: AtomicUsize,
    /// Highest known non-air world y per local (x, z), `x`-fastest.
    heights: Box<[AtomicI32]>,
    /// Set when the recorded height may be too high.
    stale: Box<[AtomicBool]>,
    save_pending: AtomicBool,
}

#[inline]
fn column_index(x: i32, z: i32) -> usize {
    (((z & CHUNK_MASK) as usize) * CHUNK_SIZE) + (x & CHUNK_MASK) as usize
}

impl Column {
    /// An empty column with no registered chunks.
    pub fn new(key: ColumnKey) -> Self {
        let area = CHUNK_SIZE * CHUNK_SIZE;
        Self {
            key,
            chunks: AtomicUsize::new(0),
            heights: (0..area).map(|_| AtomicI32::new(NO_HEIGHT)).collect(),
            stale: (0..area).map(|_| AtomicBool::new(false)).collect(),
            save_pending: AtomicBool::new(false),
        }
    }

    /// Lookup key.
    pub fn key(&self) -> ColumnKey {
        self.key
    }

    /// Adds a chunk to the registration count.
    pub fn register_chunk(&self) -> usize {
        self.chunks.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Removes a chunk from the registration count and returns how many
    /// remain. When the last chunk leaves with `save` set, the column's
    /// heightmap is flagged for persistence.
    pub fn deregister_chunk(&self, save: bool) -> usize {
        let remaining = self
            .chunks
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| Some(n.saturating_sub(1)))
            .map_or(0, |n| n.saturating_sub(1));
        if remaining == 0 && save {
            self.save_pending.store(true, Ordering::Release);
        }
        debug!(column = ?self.key, remaining, save, "chunk deregistered from column");
        remaining
    }

    /// Registered chunk count.
    pub fn chunk_count(&self) -> usize {
        self.chunks.load(Ordering::Acquire)
    }

    /// Takes the pending-save flag.
    pub fn take_save_pending(&self) -> bool {
        self.save_pending.swap(false, Ordering::AcqRel)
    }

    /// A block at world height `world_y` changed. A non-air block raises the
    /// recorded height; air at the recorded height marks it stale.
    pub fn notify_block_change(&self, x: i32, world_y: i32, z: i32, is_air: bool) {
        let i = column_index(x, z);
        if is_air {
            if self.heights[i].load(Ordering::Acquire) == world_y {
                self.stale[i].store(true, Ordering::Release);
            }
        } else if self.heights[i].fetch_max(world_y, Ordering::AcqRel) <= world_y {
            self.stale[i].store(false, Ordering::Release);
        }
    }

    /// A chunk whose highest non-air block in local `(x, z)` sits at
    /// `top` (world y) joined the column.
    pub fn notify_chunk_added(&self, x: i32, z: i32, top: Option<i32>) {
        if let Some(top) = top {
            self.heights[column_index(x, z)].fetch_max(top, Ordering::AcqRel);
        }
    }

    /// Highest known non-air world y at local `(x, z)`.
    pub fn height(&self, x: i32, z: i32) -> Option<i32> {
        let h = self.heights[column_index(x, z)].load(Ordering::Acquire);
        (h != NO_HEIGHT).then_some(h)
    }

    /// Whether the height at local `(x, z)` may be too high.
    pub fn is_stale(&self, x: i32, z: i32) -> bool {
        self.stale[column_index(x, z)].load(Ordering::Acquire)
    }

    /// Local `(x, z)` of every height that may be too high.
    pub fn stale_cells(&self) -> Vec<(i32, i32)> {
        let size = CHUNK_SIZE as i32;
        (0..size)
            .flat_map(|z| (0..size).map(move |x| (x, z)))
            .filter(|&(x, z)| self.is_stale(x, z))
            .collect()
    }

    /// Replaces the height at local `(x, z)` after a rescan.
    pub fn set_height(&self, x: i32, z: i32, height: Option<i32>) {
        let i = column_index(x, z);
        self.heights[i].store(height.unwrap_or(NO_HEIGHT), Ordering::Release);
        self.stale[i].store(false, Ordering::Release);
    }

    /// Copy of the heightmap, `x`-fastest.
    pub fn heightmap(&self) -> Vec<i32> {
        self.heights.iter().map(|h| h.load(Ordering::Acquire)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heights_only_rise_on_solid_changes() {
        let column = Column::new(ColumnKey { x: 0, z: 0 });
        assert_eq!(column.height(3, 4), None);
        column.notify_block_change(3, 10, 4, false);
        column.notify_block_change(3, 5, 4, false);
        assert_eq!(column.height(3, 4), Some(10));
        assert_eq!(column.height(19, 4), Some(10));
    }

    #[test]
    fn test_clearing_top_block_marks_stale() {
        let column = Column::new(ColumnKey { x: 0, z: 0 });
        column.notify_chunk_added(1, 1, Some(40));
        column.notify_block_change(1, 39, 1, true);
        assert!(!column.is_stale(1, 1));
        column.notify_block_change(1, 40, 1, true);
        assert!(column.is_stale(1, 1));
        assert_eq!(column.stale_cells(), vec![(1, 1)]);
        column.set_height(1, 1, Some(12));
        assert!(!column.is_stale(1, 1));
        assert!(column.stale_cells().is_empty());
        assert_eq!(column.height(1, 1), Some(12));
    }

    #[test]
    fn test_last_deregistration_with_save_flags_heightmap() {
        let column = Column::new(ColumnKey { x: 0, z: 0 });
        column.register_chunk();
        column.register_chunk();
        assert_eq!(column.deregister_chunk(true), 1);
        assert!(!column.take_save_pending());
        assert_eq!(column.deregister_chunk(true), 0);
        assert!(column.take_save_pending());
        assert!(!column.take_save_pending());
    }
}
