//! Chunk-grid addressing and chunk-local coordinate masking.
//!
//! Every accessor in the workspace masks its inputs into `[0, CHUNK_SIZE)`
//! before indexing, so callers may pass world block coordinates directly.

use serde::{Deserialize, Serialize};

/// Log2 of the chunk edge length.
pub const CHUNK_SIZE_BITS: u32 = 4;

/// Side length of a chunk in blocks.
pub const CHUNK_SIZE: usize = 1 << CHUNK_SIZE_BITS;

/// Mask applied to every coordinate before it reaches a chunk array.
pub const CHUNK_MASK: i32 = CHUNK_SIZE as i32 - 1;

/// Total number of cells in a chunk (16³).
pub const CHUNK_VOLUME: usize = CHUNK_SIZE * CHUNK_SIZE * CHUNK_SIZE;

/// Identifies a chunk's position in the chunk grid of one world.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkAddress {
    /// Chunk-grid X coordinate.
    pub x: i32,
    /// Chunk-grid Y coordinate.
    pub y: i32,
    /// Chunk-grid Z coordinate.
    pub z: i32,
}

impl ChunkAddress {
    /// Creates a new chunk address.
    pub fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }

    /// Returns the address of the chunk containing the given world block.
    pub fn containing_block(bx: i32, by: i32, bz: i32) -> Self {
        let shift = CHUNK_SIZE_BITS;
        Self::new(bx >> shift, by >> shift, bz >> shift)
    }

    /// Returns the address of the neighboring chunk offset by `(dx, dy, dz)`.
    /// Wraps at the edge of the `i32` grid.
    pub fn offset(self, dx: i32, dy: i32, dz: i32) -> Self {
        Self::new(
            self.x.wrapping_add(dx),
            self.y.wrapping_add(dy),
            self.z.wrapping_add(dz),
        )
    }

    /// World block coordinates of this chunk's minimum corner.
    pub fn base_block(self) -> (i32, i32, i32) {
        let shift = CHUNK_SIZE_BITS;
        (self.x << shift, self.y << shift, self.z << shift)
    }

    /// Euclidean distance to another chunk, in chunk-grid units, truncated.
    pub fn distance(self, other: ChunkAddress) -> i32 {
        let dx = f64::from(self.x - other.x);
        let dy = f64::from(self.y - other.y);
        let dz = f64::from(self.z - other.z);
        (dx * dx + dy * dy + dz * dz).sqrt() as i32
    }
}

/// Converts any `(x, y, z)` into the linear cell index of its masked
/// chunk-local position.
///
/// Layout: `y << 8 | z << 4 | x`, so `x` varies fastest. Light arrays and the
/// persisted block arrays share this ordering.
#[inline]
pub fn local_index(x: i32, y: i32, z: i32) -> usize {
    let bits = CHUNK_SIZE_BITS;
    (((y & CHUNK_MASK) << (2 * bits)) | ((z & CHUNK_MASK) << bits) | (x & CHUNK_MASK)) as usize
}

/// Inverse of [`local_index`].
#[inline]
pub fn local_coords(index: usize) -> (i32, i32, i32) {
    let bits = CHUNK_SIZE_BITS;
    let i = index as i32;
    (i & CHUNK_MASK, (i >> (2 * bits)) & CHUNK_MASK, (i >> bits) & CHUNK_MASK)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_index_masks_out_of_range() {
        assert_eq!(local_index(16, 0, 0), local_index(0, 0, 0));
        assert_eq!(local_index(-1, -1, -1), local_index(15, 15, 15));
        assert_eq!(local_index(15, 15, 15), CHUNK_VOLUME - 1);
    }

    #[test]
    fn test_local_index_layout_x_fastest() {
        assert_eq!(local_index(1, 0, 0), 1);
        assert_eq!(local_index(0, 0, 1), 16);
        assert_eq!(local_index(0, 1, 0), 256);
    }

    #[test]
    fn test_local_coords_inverts_index() {
        for i in [0, 1, 17, 255, 256, 1234, CHUNK_VOLUME - 1] {
            let (x, y, z) = local_coords(i);
            assert_eq!(local_index(x, y, z), i);
        }
    }

    #[test]
    fn test_containing_block_handles_negative() {
        assert_eq!(ChunkAddress::containing_block(-1, 0, 17), ChunkAddress::new(-1, 0, 1));
        assert_eq!(ChunkAddress::new(2, -1, 0).base_block(), (32, -16, 0));
    }

    #[test]
    fn test_offset_wraps_at_grid_edge() {
        let edge = ChunkAddress::new(i32::MAX, 0, i32::MIN);
        assert_eq!(edge.offset(1, -1, -1), ChunkAddress::new(i32::MIN, -1, i32::MAX));
        assert_eq!(ChunkAddress::new(3, 4, 5).offset(-1, 0, 2), ChunkAddress::new(2, 4, 7));
    }

    #[test]
    fn test_distance_truncates() {
        let a = ChunkAddress::new(0, 0, 0);
        assert_eq!(a.distance(ChunkAddress::new(3, 0, 0)), 3);
        assert_eq!(a.distance(ChunkAddress::new(1, 1, 0)), 1);
        assert_eq!(a.distance(ChunkAddress::new(0, -8, 0)), 8);
    }
}
