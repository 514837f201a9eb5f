//! Two 4-bit light levels per byte.
//!
//! Bit layout: cell `i` lives in byte `i / 2`; an even `i` occupies the high
//! nibble and an odd `i` the low nibble. Cell indexes follow the chunk's
//! `y << 8 | z << 4 | x` ordering, so the exported bytes are exactly the
//! persisted light arrays.

use std::sync::atomic::{AtomicU8, Ordering};

use tessera_voxel::{CHUNK_VOLUME, MAX_LIGHT_LEVEL, local_index};

/// Bytes needed to hold one light level for every cell of a chunk.
pub const LIGHT_ARRAY_LEN: usize = CHUNK_VOLUME / 2;

/// Chunk-sized packed light array with atomic nibble updates.
pub struct NibbleArray {
    bytes: Box<[AtomicU8]>,
}

impl NibbleArray {
    /// All-zero array.
    pub fn new() -> Self {
        Self::filled(0)
    }

    /// Array with every cell at `level` (clamped to 15).
    pub fn filled(level: u8) -> Self {
        let level = level.min(MAX_LIGHT_LEVEL);
        let byte = (level << 4) | level;
        Self {
            bytes: (0..LIGHT_ARRAY_LEN).map(|_| AtomicU8::new(byte)).collect(),
        }
    }

    /// Restores from persisted bytes; missing bytes read as zero.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            bytes: (0..LIGHT_ARRAY_LEN)
                .map(|i| AtomicU8::new(bytes.get(i).copied().unwrap_or(0)))
                .collect(),
        }
    }

    /// Light level at the masked position.
    #[inline]
    pub fn get(&self, x: i32, y: i32, z: i32) -> u8 {
        self.get_index(local_index(x, y, z))
    }

    /// Light level of cell `index`.
    #[inline]
    pub fn get_index(&self, index: usize) -> u8 {
        let byte = self.bytes[index / 2].load(Ordering::Acquire);
        if index & 1 == 0 { byte >> 4 } else { byte & 0x0F }
    }

    /// Sets the level at the masked position, leaving the paired nibble
    /// untouched. Returns the previous level.
    #[inline]
    pub fn set(&self, x: i32, y: i32, z: i32, level: u8) -> u8 {
        self.set_index(local_index(x, y, z), level)
    }

    /// Sets the level of cell `index` (clamped to 15). Returns the previous level.
    pub fn set_index(&self, index: usize, level: u8) -> u8 {
        let level = level.min(MAX_LIGHT_LEVEL);
        let high = index & 1 == 0;
        let previous = self.bytes[index / 2]
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |byte| {
                Some(if high {
                    (byte & 0x0F) | (level << 4)
                } else {
                    (byte & 0xF0) | level
                })
            })
            .unwrap_or_else(|byte| byte);
        if high { previous >> 4 } else { previous & 0x0F }
    }

    /// Sets every cell to `level`.
    pub fn fill(&self, level: u8) {
        let level = level.min(MAX_LIGHT_LEVEL);
        let byte = (level << 4) | level;
        for b in self.bytes.iter() {
            b.store(byte, Ordering::Release);
        }
    }

    /// Copy of the packed bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.bytes.iter().map(|b| b.load(Ordering::Acquire)).collect()
    }
}

impl Default for NibbleArray {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for NibbleArray {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NibbleArray")
            .field("len", &self.bytes.len())
            .finish()
    }
}
