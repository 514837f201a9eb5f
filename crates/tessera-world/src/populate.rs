//! World-generation populators and per-chunk seed derivation.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::panic::{AssertUnwindSafe, catch_unwind};

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tessera_voxel::{CHUNK_SIZE, ChunkAddress, MaterialId};
use tracing::error;

use crate::chunk::{Chunk, Source};
use crate::error::{ChunkError, PopulateError};

// ---------------------------------------------------------------------------
// Seed derivation
// ---------------------------------------------------------------------------

/// Derive a u64 seed for a chunk from the world seed, chunk address and salt.
///
/// Uses SipHash (via std's `DefaultHasher`) so the same inputs give the same
/// seed on every thread and platform.
pub fn derive_chunk_seed(world_seed: u64, address: ChunkAddress, salt: u64) -> u64 {
    let mut hasher = DefaultHasher::new();
    world_seed.hash(&mut hasher);
    address.x.hash(&mut hasher);
    address.y.hash(&mut hasher);
    address.z.hash(&mut hasher);
    salt.hash(&mut hasher);
    hasher.finish()
}

/// Deterministic RNG for populating one chunk.
pub fn chunk_rng(world_seed: u64, address: ChunkAddress, salt: u64) -> ChaCha8Rng {
    ChaCha8Rng::seed_from_u64(derive_chunk_seed(world_seed, address, salt))
}

// ---------------------------------------------------------------------------
// Populator
// ---------------------------------------------------------------------------

/// A world-generation step run once per chunk.
pub trait Populator: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Writes into `chunk`. Every populator of a chunk shares one `rng`.
    fn populate(&self, chunk: &Chunk, rng: &mut ChaCha8Rng) -> Result<(), PopulateError>;
}

/// Runs every populator, isolating failures and panics. Returns how many
/// failed.
pub(crate) fn run_populators(chunk: &Chunk, populators: &[Box<dyn Populator>], rng: &mut ChaCha8Rng) -> usize {
    let mut failures = 0;
    for populator in populators {
        let outcome = catch_unwind(AssertUnwindSafe(|| populator.populate(chunk, rng)))
            .unwrap_or_else(|panic| Err(PopulateError::Panicked(panic_message(panic.as_ref()))));
        if let Err(err) = outcome {
            failures += 1;
            error!(
                populator = populator.name(),
                chunk = ?chunk.address(),
                %err,
                "could not populate chunk"
            );
        }
    }
    failures
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

fn to_populate_error(err: ChunkError) -> PopulateError {
    PopulateError::Failed(err.to_string())
}

// ---------------------------------------------------------------------------
// Stock populators
// ---------------------------------------------------------------------------

/// Fills every cell below a world height with one material.
#[derive(Debug, Clone)]
pub struct LayerPopulator {
    /// Material to place.
    pub material: MaterialId,
    /// Cells with world y strictly below this are filled.
    pub below_world_y: i32,
}

impl Populator for LayerPopulator {
    fn name(&self) -> &str {
        "layer"
    }

    fn populate(&self, chunk: &Chunk, _rng: &mut ChaCha8Rng) -> Result<(), PopulateError> {
        let (_, base_y, _) = chunk.address().base_block();
        let size = CHUNK_SIZE as i32;
        let top = (self.below_world_y - base_y).clamp(0, size);
        for y in 0..top {
            for z in 0..size {
                for x in 0..size {
                    chunk
                        .set_block_material(x, y, z, self.material, 0, Some(Source::Populator))
                        .map_err(to_populate_error)?;
                }
            }
        }
        Ok(())
    }
}

/// Places a material at random cells.
#[derive(Debug, Clone)]
pub struct ScatterPopulator {
    /// Material to place.
    pub material: MaterialId,
    /// Cells to place per chunk.
    pub count: u32,
}

impl Populator for ScatterPopulator {
    fn name(&self) -> &str {
        "scatter"
    }

    fn populate(&self, chunk: &Chunk, rng: &mut ChaCha8Rng) -> Result<(), PopulateError> {
        let size = CHUNK_SIZE as i32;
        for _ in 0..self.count {
            let x = rng.random_range(0..size);
            let y = rng.random_range(0..size);
            let z = rng.random_range(0..size);
            chunk
                .set_block_material(x, y, z, self.material, 0, Some(Source::Populator))
                .map_err(to_populate_error)?;
        }
        Ok(())
    }
}
