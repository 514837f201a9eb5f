//! Regions: groups of chunks ticked, persisted and unloaded together.
//!
//! A region owns its chunks. Chunks talk back to it only through the queue
//! methods below, which the world drains at the matching tick stage.

use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender, unbounded};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use rustc_hash::{FxBuildHasher, FxHashSet};
use tessera_voxel::ChunkAddress;
use tracing::trace;

use crate::chunk::Chunk;
use crate::persistence::ChunkOutput;

/// Lookup key of a region: chunk coordinates divided by the region size.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegionKey {
    /// Region-grid X.
    pub x: i32,
    /// Region-grid Y.
    pub y: i32,
    /// Region-grid Z.
    pub z: i32,
}

impl RegionKey {
    /// Region holding `chunk` for a region edge of `size` chunks.
    pub fn of(chunk: ChunkAddress, size: u32) -> Self {
        let size = size.max(1) as i32;
        Self {
            x: chunk.x.div_euclid(size),
            y: chunk.y.div_euclid(size),
            z: chunk.z.div_euclid(size),
        }
    }
}

/// Chunks plus the upward queues chunks feed.
pub struct Region {
    key: RegionKey,
    chunks: DashMap<ChunkAddress, Arc<Chunk>, FxBuildHasher>,
    lighting: Mutex<FxHashSet<ChunkAddress>>,
    physics_tx: Sender<(i32, i32, i32)>,
    physics_rx: Receiver<(i32, i32, i32)>,
    population: Mutex<FxHashSet<ChunkAddress>>,
    save_unload_marks: Mutex<FxHashSet<ChunkAddress>>,
    unload_candidates: Mutex<FxHashSet<ChunkAddress>>,
    populated: Mutex<Vec<ChunkAddress>>,
}

fn take_sorted(set: &Mutex<FxHashSet<ChunkAddress>>) -> Vec<ChunkAddress> {
    let mut out: Vec<ChunkAddress> = std::mem::take(&mut *set.lock()).into_iter().collect();
    out.sort_unstable();
    out
}

impl Region {
    /// An empty region.
    pub fn new(key: RegionKey) -> Self {
        let (physics_tx, physics_rx) = unbounded();
        Self {
            key,
            chunks: DashMap::default(),
            lighting: Mutex::new(FxHashSet::default()),
            physics_tx,
            physics_rx,
            population: Mutex::new(FxHashSet::default()),
            save_unload_marks: Mutex::new(FxHashSet::default()),
            unload_candidates: Mutex::new(FxHashSet::default()),
            populated: Mutex::new(Vec::new()),
        }
    }

    /// Lookup key.
    pub fn key(&self) -> RegionKey {
        self.key
    }

    /// Loaded chunk at `address`.
    pub fn chunk(&self, address: ChunkAddress) -> Option<Arc<Chunk>> {
        self.chunks.get(&address).map(|c| Arc::clone(c.value()))
    }

    /// Every loaded chunk, in address order.
    pub fn chunks(&self) -> Vec<Arc<Chunk>> {
        let mut chunks: Vec<Arc<Chunk>> = self.chunks.iter().map(|c| Arc::clone(c.value())).collect();
        chunks.sort_unstable_by_key(|c| c.address());
        chunks
    }

    /// Number of loaded chunks.
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    /// Returns `true` if no chunk is loaded.
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Returns the chunk at `address`, creating it with `make` if absent.
    pub(crate) fn get_or_insert_with<E>(
        &self,
        address: ChunkAddress,
        make: impl FnOnce() -> Result<Arc<Chunk>, E>,
    ) -> Result<(Arc<Chunk>, bool), E> {
        match self.chunks.entry(address) {
            Entry::Occupied(entry) => Ok((Arc::clone(entry.get()), false)),
            Entry::Vacant(entry) => {
                let chunk = make()?;
                entry.insert(Arc::clone(&chunk));
                Ok((chunk, true))
            }
        }
    }

    pub(crate) fn remove_chunk(&self, address: ChunkAddress) -> Option<Arc<Chunk>> {
        self.unload_candidates.lock().remove(&address);
        self.chunks.remove(&address).map(|(_, c)| c)
    }

    /// Queues `chunk` for the next lighting stage.
    pub fn queue_lighting(&self, chunk: ChunkAddress) {
        self.lighting.lock().insert(chunk);
    }

    /// Queues a physics update at a world block coordinate.
    pub fn queue_physics_update(&self, x: i32, y: i32, z: i32) {
        // The receiver lives in `self`, so the channel cannot be disconnected.
        let _ = self.physics_tx.send((x, y, z));
    }

    /// Queues `chunk` for population.
    pub fn queue_chunk_for_population(&self, chunk: ChunkAddress) {
        self.population.lock().insert(chunk);
    }

    /// Records that `chunk` finished population.
    pub fn on_chunk_populated(&self, chunk: ChunkAddress) {
        trace!(?chunk, "chunk populated");
        self.populated.lock().push(chunk);
    }

    /// Marks `chunk` for save/unload processing after the next snapshot.
    pub fn mark_for_save_unload(&self, chunk: ChunkAddress) {
        self.save_unload_marks.lock().insert(chunk);
    }

    /// Adds `chunk` to the unload-candidate queue.
    pub fn add_unload_candidate(&self, chunk: ChunkAddress) {
        self.unload_candidates.lock().insert(chunk);
    }

    /// Removes `chunk` from the unload-candidate queue.
    pub fn remove_unload_candidate(&self, chunk: ChunkAddress) {
        self.unload_candidates.lock().remove(&chunk);
    }

    /// Whether `chunk` is an unload candidate.
    pub fn is_unload_candidate(&self, chunk: ChunkAddress) -> bool {
        self.unload_candidates.lock().contains(&chunk)
    }

    /// Persistence destination for `chunk`.
    pub fn chunk_output_stream(&self, chunk: &Chunk) -> ChunkOutput {
        ChunkOutput {
            address: chunk.address(),
            populated: chunk.is_populated(),
        }
    }

    pub(crate) fn take_lighting(&self) -> Vec<ChunkAddress> {
        take_sorted(&self.lighting)
    }

    pub(crate) fn take_physics(&self) -> Vec<(i32, i32, i32)> {
        self.physics_rx.try_iter().collect()
    }

    pub(crate) fn take_population(&self) -> Vec<ChunkAddress> {
        take_sorted(&self.population)
    }

    pub(crate) fn take_save_unload_marks(&self) -> Vec<ChunkAddress> {
        take_sorted(&self.save_unload_marks)
    }

    pub(crate) fn unload_candidates(&self) -> Vec<ChunkAddress> {
        let mut out: Vec<ChunkAddress> = self.unload_candidates.lock().iter().copied().collect();
        out.sort_unstable();
        out
    }

    /// Chunks reported populated since the last call.
    pub fn take_populated(&self) -> Vec<ChunkAddress> {
        std::mem::take(&mut *self.populated.lock())
    }
}

impl std::fmt::Debug for Region {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Region")
            .field("key", &self.key)
            .field("chunks", &self.chunks.len())
            .finish()
    }
}
