//! The world: arenas of regions, columns and entities, and the tick driver.
//!
//! Everything is addressed by key. Chunks hold a `Weak<World>` and look up
//! their region, column and neighbors here on demand.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use parking_lot::Mutex;
use rustc_hash::{FxBuildHasher, FxHashMap, FxHashSet};
use tessera_lighting::{LightKinds, NibbleArray};
use tessera_voxel::{BlockStore, CHUNK_SIZE, ChunkAddress, MaterialRegistry};
use tracing::{debug, error, info, trace, warn};

use crate::chunk::{Chunk, ChunkInit};
use crate::column::{Column, ColumnKey};
use crate::entity::{Entity, EntityId};
use crate::error::ChunkError;
use crate::persistence::ChunkPersistence;
use crate::populate::Populator;
use crate::region::{Region, RegionKey};
use crate::stage::{StageClock, TickStage};
use crate::visibility::{EntityView, VisibilityLookup};

/// World-wide tunables.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WorldSettings {
    /// World generation seed.
    pub seed: u64,
    /// Salt mixed into every chunk seed.
    pub populate_salt: u64,
    /// Chunks per region edge.
    pub region_size: u32,
    /// Dirty-list capacity of each block store.
    pub dirty_capacity: usize,
    /// Distinct states at or below which a store uses the narrow palette.
    pub palette_threshold: usize,
    /// Ticks between unload checks of one chunk.
    pub unload_period_ticks: u64,
}

impl Default for WorldSettings {
    fn default() -> Self {
        Self {
            seed: 0,
            populate_salt: 42,
            region_size: 16,
            dirty_capacity: 10,
            palette_threshold: 256,
            unload_period_ticks: 600,
        }
    }
}

/// Caller-supplied work for the stages the world does not own.
pub trait TickHooks {
    /// Handles the physics updates queued since the last tick.
    fn physics(&mut self, _world: &World, _updates: &[(i32, i32, i32)]) {}

    /// Entity and observer bookkeeping.
    fn finalize(&mut self, _world: &World) {}
}

impl TickHooks for () {}

/// What one tick did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TickReport {
    /// World age after the tick.
    pub age: u64,
    /// Chunks populated.
    pub populated: usize,
    /// Light columns recalculated.
    pub lit_columns: usize,
    /// Physics updates delivered.
    pub physics_updates: usize,
    /// Visibility events dispatched.
    pub visibility_events: usize,
    /// Chunks persisted.
    pub saved: usize,
    /// Chunks released.
    pub unloaded: usize,
    /// Block stores compressed.
    pub compressed: usize,
    /// Idle chunks asked to unload.
    pub reaped: usize,
    /// Stale column heights recomputed.
    pub heights_rescanned: usize,
}

/// A voxel world.
pub struct World {
    me: Weak<World>,
    settings: WorldSettings,
    registry: Arc<MaterialRegistry>,
    populators: Vec<Box<dyn Populator>>,
    persistence: Arc<dyn ChunkPersistence>,
    regions: DashMap<RegionKey, Arc<Region>, FxBuildHasher>,
    columns: DashMap<ColumnKey, Arc<Column>, FxBuildHasher>,
    entities: DashMap<EntityId, Arc<Entity>, FxBuildHasher>,
    /// Columns whose last chunk left, awaiting their heightmap save.
    released_columns: Mutex<Vec<Arc<Column>>>,
    despawned: Mutex<Vec<EntityId>>,
    age: AtomicU64,
    stage: StageClock,
}

impl World {
    /// Creates an empty world. The stage clock starts at
    /// [`TickStage::Finalize`] so entities can be placed before the first
    /// tick.
    pub fn new(
        settings: WorldSettings,
        registry: Arc<MaterialRegistry>,
        populators: Vec<Box<dyn Populator>>,
        persistence: Arc<dyn ChunkPersistence>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            settings,
            registry,
            populators,
            persistence,
            regions: DashMap::default(),
            columns: DashMap::default(),
            entities: DashMap::default(),
            released_columns: Mutex::new(Vec::new()),
            despawned: Mutex::new(Vec::new()),
            age: AtomicU64::new(0),
            stage: StageClock::new(TickStage::Finalize),
        })
    }

    /// Tunables.
    pub fn settings(&self) -> &WorldSettings {
        &self.settings
    }

    /// Material registry shared by every chunk.
    pub fn registry(&self) -> &Arc<MaterialRegistry> {
        &self.registry
    }

    /// Registered populators, in run order.
    pub fn populators(&self) -> &[Box<dyn Populator>] {
        &self.populators
    }

    /// Ticks completed.
    pub fn age(&self) -> u64 {
        self.age.load(Ordering::Acquire)
    }

    /// Current tick stage.
    pub fn stage(&self) -> TickStage {
        self.stage.get()
    }

    /// Moves the stage clock. [`World::tick`] does this itself; drivers that
    /// run stages by hand use it instead.
    pub fn set_stage(&self, stage: TickStage) {
        self.stage.set(stage);
    }

    /// Fails unless the clock is at `expected`.
    pub fn check_stage(&self, expected: TickStage) -> Result<(), ChunkError> {
        self.stage.check(expected)
    }

    // -- arenas --------------------------------------------------------------

    fn region_key(&self, chunk: ChunkAddress) -> RegionKey {
        RegionKey::of(chunk, self.settings.region_size)
    }

    /// Region by key.
    pub fn region(&self, key: RegionKey) -> Option<Arc<Region>> {
        self.regions.get(&key).map(|r| Arc::clone(r.value()))
    }

    /// Region holding `chunk`, created if absent.
    pub fn region_containing(&self, chunk: ChunkAddress) -> Arc<Region> {
        let key = self.region_key(chunk);
        Arc::clone(
            self.regions
                .entry(key)
                .or_insert_with(|| Arc::new(Region::new(key)))
                .value(),
        )
    }

    /// Every region, in key order.
    pub fn regions(&self) -> Vec<Arc<Region>> {
        let mut regions: Vec<Arc<Region>> = self.regions.iter().map(|r| Arc::clone(r.value())).collect();
        regions.sort_unstable_by_key(|r| r.key());
        regions
    }

    /// Loaded chunk at `address`.
    pub fn chunk(&self, address: ChunkAddress) -> Option<Arc<Chunk>> {
        self.region(self.region_key(address))?.chunk(address)
    }

    /// Every loaded chunk, in address order.
    pub fn chunks(&self) -> Vec<Arc<Chunk>> {
        let mut chunks: Vec<Arc<Chunk>> = self.regions().iter().flat_map(|r| r.chunks()).collect();
        chunks.sort_unstable_by_key(|c| c.address());
        chunks
    }

    /// Column by key.
    pub fn column(&self, key: ColumnKey) -> Option<Arc<Column>> {
        self.columns.get(&key).map(|c| Arc::clone(c.value()))
    }

    /// Drops a column with no registered chunks.
    pub(crate) fn release_column(&self, key: ColumnKey) {
        if let Some((_, column)) = self.columns.remove_if(&key, |_, c| c.chunk_count() == 0) {
            debug!(column = ?key, "column released");
            self.released_columns.lock().push(column);
        }
    }

    /// Entity by id.
    pub fn entity(&self, id: EntityId) -> Option<Arc<Entity>> {
        self.entities.get(&id).map(|e| Arc::clone(e.value()))
    }

    /// Returns the loaded chunk at `address`, restoring it from persistence
    /// or creating it empty if needed.
    pub fn load_chunk(&self, address: ChunkAddress) -> Result<Arc<Chunk>, ChunkError> {
        let region = self.region_containing(address);
        let (chunk, created) = region.get_or_insert_with(address, || {
            let init = self.chunk_init(address, region.key())?;
            let column_key = ColumnKey::of(address);
            self.columns
                .entry(column_key)
                .or_insert_with(|| Arc::new(Column::new(column_key)))
                .register_chunk();
            Ok::<_, ChunkError>(Chunk::new(self.me.clone(), Arc::clone(&self.registry), init))
        })?;
        if created {
            chunk.notify_column()?;
            if !chunk.is_populated() {
                let size = CHUNK_SIZE as i32;
                for z in 0..size {
                    for x in 0..size {
                        chunk.queue_light_update(x, z, LightKinds::SKY)?;
                    }
                }
            }
            region.add_unload_candidate(address);
            debug!(chunk = ?address, populated = chunk.is_populated(), "chunk loaded");
        }
        Ok(chunk)
    }

    fn chunk_init(&self, address: ChunkAddress, region: RegionKey) -> Result<ChunkInit, ChunkError> {
        let s = &self.settings;
        let loaded_at = self.age();
        let init = match self.persistence.load_chunk(address)? {
            Some(record) => ChunkInit {
                address,
                region,
                store: BlockStore::from_arrays(
                    &record.block_ids,
                    Some(&record.block_data),
                    s.dirty_capacity,
                    s.palette_threshold,
                ),
                sky_light: NibbleArray::from_bytes(&record.sky_light),
                block_light: NibbleArray::from_bytes(&record.block_light),
                populated: record.populated,
                loaded_at,
            },
            None => ChunkInit {
                address,
                region,
                store: BlockStore::new(s.dirty_capacity, s.palette_threshold),
                sky_light: NibbleArray::new(),
                block_light: NibbleArray::new(),
                populated: false,
                loaded_at,
            },
        };
        Ok(init)
    }

    // -- entities --------------------------------------------------------------

    /// Adds an entity to the world and to the chunk it stands in, loading
    /// that chunk if needed. Finalize stage only.
    pub fn spawn_entity(&self, entity: Entity) -> Result<Arc<Entity>, ChunkError> {
        self.check_stage(TickStage::Finalize)?;
        let entity = Arc::new(entity);
        if let Some(chunk) = entity.live().chunk {
            self.load_chunk(chunk)?.add_entity(entity.id())?;
        }
        self.entities.insert(entity.id(), Arc::clone(&entity));
        debug!(entity = %entity.id(), "entity spawned");
        Ok(entity)
    }

    /// Moves an entity between chunks. Finalize stage only.
    pub fn move_entity(&self, id: EntityId, to: ChunkAddress) -> Result<(), ChunkError> {
        self.check_stage(TickStage::Finalize)?;
        let Some(entity) = self.entity(id) else {
            warn!(entity = %id, "move of unknown entity ignored");
            return Ok(());
        };
        let from = entity.live().chunk;
        if from == Some(to) {
            return Ok(());
        }
        if let Some(old) = from.and_then(|c| self.chunk(c)) {
            old.remove_entity(id)?;
        }
        self.load_chunk(to)?.add_entity(id)?;
        entity.set_chunk(Some(to));
        Ok(())
    }

    /// Takes an entity out of its chunk. It stays resolvable until the end
    /// of the tick so observers receive a hide. Finalize stage only.
    pub fn despawn_entity(&self, id: EntityId) -> Result<(), ChunkError> {
        self.check_stage(TickStage::Finalize)?;
        let Some(entity) = self.entity(id) else {
            return Ok(());
        };
        if let Some(chunk) = entity.live().chunk.and_then(|c| self.chunk(c)) {
            chunk.remove_entity(id)?;
        }
        for address in entity.observed() {
            if let Some(chunk) = self.chunk(address) {
                chunk.remove_observer(&entity)?;
            }
        }
        entity.set_observed(FxHashSet::default());
        entity.set_chunk(None);
        self.despawned.lock().push(id);
        debug!(entity = %id, "entity despawned");
        Ok(())
    }

    /// Registers an observer with every chunk within `radius` of its live
    /// chunk, loading them as needed, and leaves chunks now out of range.
    /// Finalize stage only.
    pub fn update_observer(&self, id: EntityId, radius: i32) -> Result<(), ChunkError> {
        self.check_stage(TickStage::Finalize)?;
        let Some(entity) = self.entity(id) else {
            return Ok(());
        };
        if !entity.is_observer() {
            return Err(ChunkError::NotObserver(id));
        }
        let mut wanted = FxHashSet::default();
        if let Some(center) = entity.live().chunk {
            for dy in -radius..=radius {
                for dz in -radius..=radius {
                    for dx in -radius..=radius {
                        let address = center.offset(dx, dy, dz);
                        if center.distance(address) <= radius {
                            wanted.insert(address);
                        }
                    }
                }
            }
        }

        for address in entity.observed().difference(&wanted) {
            if let Some(chunk) = self.chunk(*address) {
                chunk.remove_observer(&entity)?;
            }
        }
        let mut targets: Vec<ChunkAddress> = wanted.iter().copied().collect();
        targets.sort_unstable();
        for address in targets {
            self.load_chunk(address)?.refresh_observer(&entity)?;
        }
        entity.set_observed(wanted);
        Ok(())
    }

    // -- tick ----------------------------------------------------------------

    /// Runs one full tick through every stage.
    pub fn tick(&self, hooks: &mut impl TickHooks) -> Result<TickReport, ChunkError> {
        let mut report = TickReport::default();

        self.stage.set(TickStage::Lighting);
        for region in self.regions() {
            for address in region.take_population() {
                if let Some(chunk) = region.chunk(address) {
                    if chunk.populate(false)? {
                        report.populated += 1;
                    }
                }
            }
        }
        for region in self.regions() {
            for address in region.take_lighting() {
                if let Some(chunk) = region.chunk(address) {
                    report.lit_columns += chunk.process_queued_lighting()?;
                }
            }
        }

        self.stage.set(TickStage::Physics);
        let updates: Vec<(i32, i32, i32)> = self.regions().iter().flat_map(|r| r.take_physics()).collect();
        report.physics_updates = updates.len();
        hooks.physics(self, &updates);

        self.stage.set(TickStage::Finalize);
        hooks.finalize(self);

        self.stage.set(TickStage::PreSnapshot);
        let chunks = self.chunks();
        for chunk in &chunks {
            report.visibility_events += chunk.pre_snapshot()?.len();
        }

        self.stage.set(TickStage::Snapshot);
        for chunk in &chunks {
            chunk.copy_snapshot()?;
        }
        self.process_save_unload(&mut report)?;
        for entry in self.entities.iter() {
            entry.value().finalize_tick();
        }
        for id in std::mem::take(&mut *self.despawned.lock()) {
            self.entities.remove(&id);
        }

        self.stage.set(TickStage::Maintenance);
        self.maintain(&mut report)?;

        report.age = self.age.fetch_add(1, Ordering::AcqRel) + 1;
        Ok(report)
    }

    /// Recomputes every stale column height from the loaded chunks, highest
    /// chunk first. Returns how many heights were rescanned.
    fn rescan_stale_heights(&self) -> Result<usize, ChunkError> {
        let mut by_column: FxHashMap<ColumnKey, Vec<Arc<Chunk>>> = FxHashMap::default();
        for chunk in self.chunks() {
            by_column.entry(chunk.column_key()).or_default().push(chunk);
        }
        let mut rescanned = 0;
        for (key, mut chunks) in by_column {
            let Some(column) = self.column(key) else {
                continue;
            };
            let stale = column.stale_cells();
            if stale.is_empty() {
                continue;
            }
            chunks.sort_unstable_by_key(|c| std::cmp::Reverse(c.address().y));
            for (x, z) in stale {
                let mut top = None;
                for chunk in &chunks {
                    top = chunk.highest_block(x, z)?;
                    if top.is_some() {
                        break;
                    }
                }
                column.set_height(x, z, top);
                rescanned += 1;
            }
            trace!(column = ?key, rescanned, "column heights rescanned");
        }
        Ok(rescanned)
    }

    /// Consumes the lifecycle state of every marked chunk, saving and
    /// unloading as it asks. A failed save re-arms the request.
    fn process_save_unload(&self, report: &mut TickReport) -> Result<(), ChunkError> {
        for region in self.regions() {
            for address in region.take_save_unload_marks() {
                let Some(chunk) = region.chunk(address) else {
                    continue;
                };
                let state = chunk.consume_save_state();
                if state.is_save() {
                    if let Err(err) = chunk.sync_save(self.persistence.as_ref()) {
                        error!(chunk = ?address, %err, "chunk save failed, will retry");
                        if state.is_unload() {
                            chunk.request_unload(true);
                        } else {
                            chunk.request_save();
                        }
                        continue;
                    }
                    report.saved += 1;
                }
                if state.is_unload() {
                    chunk.finalize_unload(state.is_save())?;
                    region.remove_chunk(address);
                    report.unloaded += 1;
                }
            }
        }
        Ok(())
    }

    fn maintain(&self, report: &mut TickReport) -> Result<(), ChunkError> {
        let age = self.age();
        for region in self.regions() {
            for address in region.unload_candidates() {
                let Some(chunk) = region.chunk(address) else {
                    continue;
                };
                if chunk.is_reapable(age)? {
                    debug!(chunk = ?address, age, "reaping idle chunk");
                    chunk.request_unload(true);
                    report.reaped += 1;
                }
            }
        }
        for chunk in self.chunks() {
            if chunk.compress_if_required()? {
                report.compressed += 1;
            }
            chunk.reset_dirty_arrays()?;
        }
        report.heights_rescanned += self.rescan_stale_heights()?;
        for column in std::mem::take(&mut *self.released_columns.lock()) {
            if column.take_save_pending() {
                self.persistence.save_heightmap(column.key(), &column.heightmap())?;
            }
        }
        Ok(())
    }

    /// Requests save and unload of every chunk and ticks until none remain.
    pub fn shutdown(&self) -> Result<usize, ChunkError> {
        let chunks = self.chunks();
        for chunk in &chunks {
            chunk.request_unload(true);
        }
        self.tick(&mut ())?;
        info!(chunks = chunks.len(), "world shut down");
        Ok(chunks.len())
    }
}

impl std::fmt::Debug for World {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("World")
            .field("settings", &self.settings)
            .field("regions", &self.regions.len())
            .field("entities", &self.entities.len())
            .field("age", &self.age())
            .finish()
    }
}

/// Resolves visibility lookups against the world arenas.
pub(crate) struct WorldLookup<'a> {
    world: &'a World,
}

impl<'a> WorldLookup<'a> {
    pub(crate) fn new(world: &'a World) -> Self {
        Self { world }
    }
}

impl VisibilityLookup for WorldLookup<'_> {
    fn entity(&self, id: EntityId) -> Option<EntityView> {
        self.world.entity(id).map(|e| e.view())
    }

    fn can_sync(&self, observer: EntityId) -> bool {
        self.world.entity(observer).is_some_and(|e| e.network().is_some())
    }

    fn live_observer_distance(&self, chunk: ChunkAddress, observer: EntityId) -> Option<i32> {
        self.world.chunk(chunk)?.observer_distance_live(observer)
    }
}

#[cfg(test)]
#[path = "world_tests.rs"]
mod tests;
