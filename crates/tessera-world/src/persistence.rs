//! Persistence collaborator: receives a chunk's raw runtime arrays.
//!
//! No framing is defined at this layer. Backends get the id and data arrays
//! (one `u16` per cell, `y << 8 | z << 4 | x` order) and the packed light
//! bytes exactly as the chunk holds them.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tessera_voxel::ChunkAddress;

use crate::column::ColumnKey;
use crate::error::PersistenceError;

/// Where a save lands, obtained from the owning region.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChunkOutput {
    /// Chunk being written.
    pub address: ChunkAddress,
    /// Whether the chunk finished population.
    pub populated: bool,
}

/// Borrowed runtime arrays of one chunk.
#[derive(Clone, Copy, Debug)]
pub struct ChunkArrays<'a> {
    /// Material id per cell.
    pub block_ids: &'a [u16],
    /// Data value per cell.
    pub block_data: &'a [u16],
    /// Packed sky light.
    pub sky_light: &'a [u8],
    /// Packed block light.
    pub block_light: &'a [u8],
}

/// Owned copy of a persisted chunk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChunkRecord {
    /// Whether the chunk finished population.
    pub populated: bool,
    /// Material id per cell.
    pub block_ids: Vec<u16>,
    /// Data value per cell.
    pub block_data: Vec<u16>,
    /// Packed sky light.
    pub sky_light: Vec<u8>,
    /// Packed block light.
    pub block_light: Vec<u8>,
}

impl ChunkRecord {
    fn from_arrays(populated: bool, arrays: ChunkArrays<'_>) -> Self {
        Self {
            populated,
            block_ids: arrays.block_ids.to_vec(),
            block_data: arrays.block_data.to_vec(),
            sky_light: arrays.sky_light.to_vec(),
            block_light: arrays.block_light.to_vec(),
        }
    }
}

/// A chunk persistence backend.
pub trait ChunkPersistence: Send + Sync {
    /// Writes one chunk.
    fn save_chunk(&self, output: ChunkOutput, arrays: ChunkArrays<'_>) -> Result<(), PersistenceError>;

    /// Reads one chunk, `None` if it was never saved.
    fn load_chunk(&self, address: ChunkAddress) -> Result<Option<ChunkRecord>, PersistenceError>;

    /// Writes a column heightmap after its last chunk unloaded.
    fn save_heightmap(&self, _column: ColumnKey, _heights: &[i32]) -> Result<(), PersistenceError> {
        Ok(())
    }
}

/// Keeps saved chunks in memory.
#[derive(Debug, Default)]
pub struct MemoryPersistence {
    chunks: Mutex<FxHashMap<ChunkAddress, ChunkRecord>>,
    heightmaps: Mutex<FxHashMap<ColumnKey, Vec<i32>>>,
    saves: AtomicU64,
}

impl MemoryPersistence {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Saved copy of `address`.
    pub fn record(&self, address: ChunkAddress) -> Option<ChunkRecord> {
        self.chunks.lock().get(&address).cloned()
    }

    /// Saved heightmap of `column`.
    pub fn heightmap(&self, column: ColumnKey) -> Option<Vec<i32>> {
        self.heightmaps.lock().get(&column).cloned()
    }

    /// Distinct chunks saved.
    pub fn len(&self) -> usize {
        self.chunks.lock().len()
    }

    /// Returns `true` if nothing was saved.
    pub fn is_empty(&self) -> bool {
        self.chunks.lock().is_empty()
    }

    /// Total `save_chunk` calls.
    pub fn save_count(&self) -> u64 {
        self.saves.load(Ordering::Acquire)
    }
}

impl ChunkPersistence for MemoryPersistence {
    fn save_chunk(&self, output: ChunkOutput, arrays: ChunkArrays<'_>) -> Result<(), PersistenceError> {
        let record = ChunkRecord::from_arrays(output.populated, arrays);
        self.chunks.lock().insert(output.address, record);
        self.saves.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn load_chunk(&self, address: ChunkAddress) -> Result<Option<ChunkRecord>, PersistenceError> {
        Ok(self.record(address))
    }

    fn save_heightmap(&self, column: ColumnKey, heights: &[i32]) -> Result<(), PersistenceError> {
        self.heightmaps.lock().insert(column, heights.to_vec());
        Ok(())
    }
}
