//! The per-chunk state container.
//!
//! A [`Chunk`] owns its block store, two packed light arrays, a lifecycle
//! cell, and snapshotable populated/observer/entity state. It reaches its
//! column, region and neighbors only through lookup keys into the owning
//! [`World`], never through owning references.
//!
//! The block store sits behind a `RwLock<Option<BlockStore>>`. Every cell
//! access takes the shared guard and is a lock-free atomic underneath; the
//! exclusive guard is taken only to switch representation (widen or
//! compress) and to release the store on unload.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use rustc_hash::{FxHashMap, FxHashSet};
use tessera_lighting::{
    LightKinds, LightNeighborhood, LightQueue, NibbleArray, recalculate_block_light,
    recalculate_sky_column,
};
use tessera_snapshot::{MapSnapshot, SetSnapshot, SnapshotManager, SnapshotableBool, SnapshotableMap, SnapshotableSet};
use tessera_voxel::{
    BlockFullState, BlockStore, BlockStoreError, CHUNK_MASK, CHUNK_SIZE, CHUNK_SIZE_BITS,
    ChunkAddress, MAX_LIGHT_LEVEL, MaterialId, MaterialRegistry,
};
use tracing::{debug, error, trace};

use crate::column::ColumnKey;
use crate::entity::{Entity, EntityId};
use crate::error::ChunkError;
use crate::lifecycle::{SaveState, SaveStateCell};
use crate::network;
use crate::persistence::{ChunkArrays, ChunkOutput, ChunkPersistence};
use crate::populate::{chunk_rng, run_populators};
use crate::region::{Region, RegionKey};
use crate::stage::TickStage;
use crate::visibility::{ChunkVisibility, VisibilityPlan, compute_visibility};
use crate::world::{World, WorldLookup};

/// More queued light columns than this marks the chunk light-dirty: one
/// quarter of a horizontal cross-section.
const LIGHT_DIRTY_COLUMNS: usize = CHUNK_SIZE * CHUNK_SIZE / 4;

/// Who issued a mutation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Source {
    /// World bookkeeping and tooling.
    World,
    /// The light engine.
    Lighting,
    /// A physics update.
    Physics,
    /// A world-generation populator.
    Populator,
    /// An entity.
    Entity(EntityId),
}

/// Copy of a chunk's runtime arrays.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChunkSnapshot {
    /// Chunk the arrays came from.
    pub address: ChunkAddress,
    /// Material id per cell.
    pub block_ids: Vec<u16>,
    /// Data value per cell.
    pub block_data: Vec<u16>,
    /// Packed sky light.
    pub sky_light: Vec<u8>,
    /// Packed block light.
    pub block_light: Vec<u8>,
    /// Stable entity set, sorted, when requested.
    pub entities: Option<Vec<EntityId>>,
}

impl ChunkSnapshot {
    /// Borrows the arrays in the shape persistence expects.
    pub fn arrays(&self) -> ChunkArrays<'_> {
        ChunkArrays {
            block_ids: &self.block_ids,
            block_data: &self.block_data,
            sky_light: &self.sky_light,
            block_light: &self.block_light,
        }
    }
}

/// Local y of the highest non-air block in `(x, z)`.
fn top_in(store: &BlockStore, x: i32, z: i32) -> Option<i32> {
    (0..CHUNK_SIZE as i32)
        .rev()
        .find(|&y| store.get_material_id(x, y, z) != MaterialId::AIR)
}

/// Initial contents of a chunk, fresh or restored.
pub(crate) struct ChunkInit {
    pub(crate) address: ChunkAddress,
    pub(crate) region: RegionKey,
    pub(crate) store: BlockStore,
    pub(crate) sky_light: NibbleArray,
    pub(crate) block_light: NibbleArray,
    pub(crate) populated: bool,
    /// World age at load; the first reap check is one period later.
    pub(crate) loaded_at: u64,
}

/// A 16³ section of the world.
pub struct Chunk {
    world: Weak<World>,
    address: ChunkAddress,
    region: RegionKey,
    column: ColumnKey,
    registry: Arc<MaterialRegistry>,
    store: RwLock<Option<BlockStore>>,
    sky_light: NibbleArray,
    block_light: NibbleArray,
    save_state: SaveStateCell,
    snapshots: SnapshotManager,
    populated: Arc<SnapshotableBool>,
    observers: Arc<SnapshotableMap<EntityId, i32>>,
    entities: Arc<SnapshotableSet<EntityId>>,
    light_queue: LightQueue,
    column_registered: AtomicBool,
    last_unload_check: AtomicU64,
    light_dirty: AtomicBool,
}

impl Chunk {
    /// Builds a chunk already counted by its column.
    pub(crate) fn new(world: Weak<World>, registry: Arc<MaterialRegistry>, init: ChunkInit) -> Arc<Self> {
        let snapshots = SnapshotManager::new();
        let populated = SnapshotableBool::new(&snapshots, init.populated);
        let observers = SnapshotableMap::new(&snapshots);
        let entities = SnapshotableSet::new(&snapshots);
        Arc::new(Self {
            world,
            address: init.address,
            region: init.region,
            column: ColumnKey::of(init.address),
            registry,
            store: RwLock::new(Some(init.store)),
            sky_light: init.sky_light,
            block_light: init.block_light,
            save_state: SaveStateCell::new(),
            snapshots,
            populated,
            observers,
            entities,
            light_queue: LightQueue::new(),
            column_registered: AtomicBool::new(true),
            last_unload_check: AtomicU64::new(init.loaded_at),
            light_dirty: AtomicBool::new(false),
        })
    }

    /// Chunk-grid position.
    pub fn address(&self) -> ChunkAddress {
        self.address
    }

    /// Key of the owning region.
    pub fn region_key(&self) -> RegionKey {
        self.region
    }

    /// Key of the column this chunk belongs to.
    pub fn column_key(&self) -> ColumnKey {
        self.column
    }

    // -- internal helpers --------------------------------------------------

    fn world(&self) -> Result<Arc<World>, ChunkError> {
        self.world.upgrade().ok_or(ChunkError::Unloaded(self.address))
    }

    fn region(&self) -> Option<Arc<Region>> {
        self.world.upgrade().and_then(|w| w.region(self.region))
    }

    fn check_stage(&self, expected: TickStage) -> Result<(), ChunkError> {
        self.world()?.check_stage(expected)
    }

    fn check_loaded(&self) -> Result<(), ChunkError> {
        if self.save_state.is_unloaded() {
            Err(ChunkError::Unloaded(self.address))
        } else {
            Ok(())
        }
    }

    fn loaded<'a>(&self, slot: &'a Option<BlockStore>) -> Result<&'a BlockStore, ChunkError> {
        match slot {
            Some(store) if !self.save_state.is_unloaded() => Ok(store),
            _ => Err(ChunkError::Unloaded(self.address)),
        }
    }

    fn read_store<R>(&self, f: impl FnOnce(&BlockStore) -> R) -> Result<R, ChunkError> {
        let guard = self.store.read();
        Ok(f(self.loaded(&guard)?))
    }

    /// Runs a store write, widening the store and retrying once if the
    /// narrow palette is full.
    fn write_cell<T>(&self, op: impl Fn(&BlockStore) -> Result<T, BlockStoreError>) -> Result<T, ChunkError> {
        {
            let guard = self.store.read();
            match op(self.loaded(&guard)?) {
                Err(BlockStoreError::PaletteFull) => {}
                other => return other.map_err(ChunkError::from),
            }
        }
        let mut guard = self.store.write();
        if self.save_state.is_unloaded() {
            return Err(ChunkError::Unloaded(self.address));
        }
        let store = guard.as_mut().ok_or(ChunkError::Unloaded(self.address))?;
        store.widen();
        Ok(op(&*store)?)
    }

    fn world_y(&self, y: i32) -> i32 {
        (self.address.y << CHUNK_SIZE_BITS) + (y & CHUNK_MASK)
    }

    /// Column and light follow-up for a cell that went from `old` to `new`.
    fn on_block_changed(&self, x: i32, y: i32, z: i32, old: BlockFullState, new: BlockFullState) -> Result<(), ChunkError> {
        if old.id == new.id {
            return Ok(());
        }
        if self.column_registered.load(Ordering::Acquire) {
            if let Some(column) = self.world.upgrade().and_then(|w| w.column(self.column)) {
                column.notify_block_change(x, self.world_y(y), z, new.id == MaterialId::AIR);
            }
        }
        let kinds = LightKinds::from_change(
            self.registry.opacity(old.id),
            self.registry.opacity(new.id),
            self.registry.light_emission(old.id),
            self.registry.light_emission(new.id),
        );
        if !kinds.is_empty() {
            self.queue_light_update(x, z, kinds)?;
        }
        Ok(())
    }

    // -- blocks ------------------------------------------------------------

    /// Sets material and data of a cell. Returns the replaced state.
    ///
    /// # Errors
    ///
    /// [`ChunkError::MissingSource`] without a source, [`ChunkError::Unloaded`]
    /// after unload.
    pub fn set_block_material(
        &self,
        x: i32,
        y: i32,
        z: i32,
        material: MaterialId,
        data: u16,
        source: Option<Source>,
    ) -> Result<BlockFullState, ChunkError> {
        source.ok_or(ChunkError::MissingSource)?;
        let new = BlockFullState::new(material, data);
        let old = self.write_cell(|store| store.set_block(x, y, z, new))?;
        self.on_block_changed(x, y, z, old, new)?;
        Ok(old)
    }

    /// Replaces a cell's data, keeping its material. Returns the old data.
    pub fn set_block_data(&self, x: i32, y: i32, z: i32, data: u16, source: Option<Source>) -> Result<u16, ChunkError> {
        source.ok_or(ChunkError::MissingSource)?;
        loop {
            let current = self.block_full_state(x, y, z)?;
            let new = BlockFullState::new(current.id, data);
            if self.write_cell(|store| store.compare_and_set_block(x, y, z, current, new))? {
                return Ok(current.data);
            }
        }
    }

    /// Atomically replaces `expect` with `new` in one cell.
    pub fn compare_and_set_block(
        &self,
        x: i32,
        y: i32,
        z: i32,
        expect: BlockFullState,
        new: BlockFullState,
        source: Option<Source>,
    ) -> Result<bool, ChunkError> {
        source.ok_or(ChunkError::MissingSource)?;
        let swapped = self.write_cell(|store| store.compare_and_set_block(x, y, z, expect, new))?;
        if swapped {
            self.on_block_changed(x, y, z, expect, new)?;
        }
        Ok(swapped)
    }

    /// Replaces the data of a cell holding exactly `expect`.
    pub fn compare_and_set_data(
        &self,
        x: i32,
        y: i32,
        z: i32,
        expect: BlockFullState,
        data: u16,
        source: Option<Source>,
    ) -> Result<bool, ChunkError> {
        self.compare_and_set_block(x, y, z, expect, BlockFullState::new(expect.id, data), source)
    }

    /// Material at a cell.
    pub fn block_material(&self, x: i32, y: i32, z: i32) -> Result<MaterialId, ChunkError> {
        self.read_store(|s| s.get_material_id(x, y, z))
    }

    /// Data at a cell.
    pub fn block_data(&self, x: i32, y: i32, z: i32) -> Result<u16, ChunkError> {
        self.read_store(|s| s.get_data(x, y, z))
    }

    /// Material and data at a cell.
    pub fn block_full_state(&self, x: i32, y: i32, z: i32) -> Result<BlockFullState, ChunkError> {
        self.read_store(|s| s.get_full_data(x, y, z))
    }

    /// Attaches an extended payload to a cell.
    pub fn set_block_aux(&self, x: i32, y: i32, z: i32, payload: Arc<[u8]>, source: Option<Source>) -> Result<(), ChunkError> {
        source.ok_or(ChunkError::MissingSource)?;
        self.read_store(|s| s.set_aux(x, y, z, payload))
    }

    /// Extended payload of a cell.
    pub fn block_aux(&self, x: i32, y: i32, z: i32) -> Result<Option<Arc<[u8]>>, ChunkError> {
        self.read_store(|s| s.aux(x, y, z))
    }

    /// Queues a physics update at a world block coordinate on the region
    /// that holds it.
    pub fn update_block_physics(&self, x: i32, y: i32, z: i32) -> Result<(), ChunkError> {
        self.check_loaded()?;
        let world = self.world()?;
        world
            .region_containing(ChunkAddress::containing_block(x, y, z))
            .queue_physics_update(x, y, z);
        Ok(())
    }

    // -- light -------------------------------------------------------------

    /// Sets block light, returning the previous level.
    pub fn set_block_light(&self, x: i32, y: i32, z: i32, level: u8, source: Option<Source>) -> Result<u8, ChunkError> {
        source.ok_or(ChunkError::MissingSource)?;
        self.check_loaded()?;
        Ok(self.block_light.set(x, y, z, level))
    }

    /// Sets sky light, returning the previous level.
    pub fn set_block_sky_light(&self, x: i32, y: i32, z: i32, level: u8, source: Option<Source>) -> Result<u8, ChunkError> {
        source.ok_or(ChunkError::MissingSource)?;
        self.check_loaded()?;
        Ok(self.sky_light.set(x, y, z, level))
    }

    /// Block light level.
    pub fn block_light(&self, x: i32, y: i32, z: i32) -> Result<u8, ChunkError> {
        self.check_loaded()?;
        Ok(self.block_light.get(x, y, z))
    }

    /// Sky light level.
    pub fn block_sky_light(&self, x: i32, y: i32, z: i32) -> Result<u8, ChunkError> {
        self.check_loaded()?;
        Ok(self.sky_light.get(x, y, z))
    }

    /// Queues column `(x, z)` for relighting and tells the region.
    ///
    /// # Errors
    ///
    /// [`ChunkError::NoLightKind`] when `kinds` is empty; nothing is queued.
    pub fn queue_light_update(&self, x: i32, z: i32, kinds: LightKinds) -> Result<(), ChunkError> {
        self.check_loaded()?;
        self.light_queue.enqueue(x, z, kinds)?;
        if let Some(region) = self.region() {
            region.queue_lighting(self.address);
        }
        Ok(())
    }

    /// Drains the light queues and recalculates. Returns how many columns
    /// were processed.
    ///
    /// A sky column whose bottom value no longer matches the top row of the
    /// chunk below queues that column there, for the next lighting pass.
    pub fn process_queued_lighting(&self) -> Result<usize, ChunkError> {
        if self.light_queue.pending() > LIGHT_DIRTY_COLUMNS {
            trace!(chunk = ?self.address, pending = self.light_queue.pending(), "chunk marked light dirty");
            self.light_dirty.store(true, Ordering::Release);
        }
        let sky_columns = self.light_queue.drain_sky();
        let block_columns = self.light_queue.drain_block();
        if sky_columns.is_empty() && block_columns.is_empty() {
            return Ok(0);
        }

        let world = self.world.upgrade();
        let neighbor = |dy: i32| world.as_ref().and_then(|w| w.chunk(self.address.offset(0, dy, 0)));
        let above = neighbor(1);
        let below = neighbor(-1);

        let guard = self.store.read();
        let store = self.loaded(&guard)?;
        let view = ChunkLightView {
            chunk: self,
            store,
            world: world.as_deref(),
        };

        let top = CHUNK_SIZE as i32 - 1;
        for &(x, z) in &sky_columns {
            let entering = above
                .as_ref()
                .and_then(|c| c.block_sky_light(x, 0, z).ok())
                .unwrap_or(MAX_LIGHT_LEVEL);
            let bottom = recalculate_sky_column(&self.sky_light, x, z, entering, &view);
            if let Some(below) = &below {
                if below.block_sky_light(x, top, z).is_ok_and(|v| v != bottom) {
                    below.queue_light_update(x, z, LightKinds::SKY)?;
                }
            }
        }
        if !block_columns.is_empty() {
            recalculate_block_light(&self.block_light, &view);
        }
        Ok(sky_columns.len() + block_columns.len())
    }

    /// Whether consumers should retransmit all light.
    pub fn is_light_dirty(&self) -> bool {
        self.light_dirty.load(Ordering::Acquire)
    }

    /// Sets the light-dirty flag.
    pub fn set_light_dirty(&self, dirty: bool) {
        self.light_dirty.store(dirty, Ordering::Release);
    }

    // -- dirty tracking and maintenance --------------------------------------

    /// Whether any cell changed since the last reset.
    pub fn is_dirty(&self) -> Result<bool, ChunkError> {
        self.read_store(BlockStore::is_dirty)
    }

    /// Whether more cells changed than the dirty list holds.
    pub fn is_dirty_overflow(&self) -> Result<bool, ChunkError> {
        self.read_store(BlockStore::is_dirty_overflow)
    }

    /// World block coordinates of the `i`-th changed cell.
    pub fn dirty_block(&self, i: usize) -> Result<Option<(i32, i32, i32)>, ChunkError> {
        let (bx, by, bz) = self.address.base_block();
        self.read_store(|s| s.dirty_block(i).map(|(x, y, z)| (bx + x, by + y, bz + z)))
    }

    /// Clears the dirty list and the light-dirty flag.
    pub fn reset_dirty_arrays(&self) -> Result<(), ChunkError> {
        self.read_store(BlockStore::reset_dirty_arrays)?;
        self.light_dirty.store(false, Ordering::Release);
        Ok(())
    }

    /// Compresses the block store if it would shrink. Returns whether it did.
    pub fn compress_if_required(&self) -> Result<bool, ChunkError> {
        if !self.read_store(BlockStore::needs_compression)? {
            return Ok(false);
        }
        let mut guard = self.store.write();
        match guard.as_mut() {
            Some(store) if !self.save_state.is_unloaded() => Ok(store.compress()),
            _ => Err(ChunkError::Unloaded(self.address)),
        }
    }

    /// Bits per cell of the current block representation.
    pub fn bits_per_cell(&self) -> Result<u8, ChunkError> {
        self.read_store(BlockStore::bits_per_cell)
    }

    /// Copies the runtime arrays, plus the stable entity set if asked.
    pub fn snapshot(&self, include_entities: bool) -> Result<ChunkSnapshot, ChunkError> {
        let (block_ids, block_data) = self.read_store(BlockStore::get_block_arrays)?;
        let entities = include_entities.then(|| {
            let mut ids: Vec<EntityId> = self.entities.stable().items.iter().copied().collect();
            ids.sort_unstable();
            ids
        });
        Ok(ChunkSnapshot {
            address: self.address,
            block_ids,
            block_data,
            sky_light: self.sky_light.to_bytes(),
            block_light: self.block_light.to_bytes(),
            entities,
        })
    }

    // -- lifecycle -----------------------------------------------------------

    /// Whether the chunk still holds its data.
    pub fn is_loaded(&self) -> bool {
        !self.save_state.is_unloaded()
    }

    /// Current lifecycle state.
    pub fn save_state(&self) -> SaveState {
        self.save_state.get()
    }

    /// Requests persistence at the next snapshot pass.
    pub fn request_save(&self) -> SaveState {
        let state = self.save_state.request_save();
        if let Some(region) = self.region() {
            region.mark_for_save_unload(self.address);
        }
        state
    }

    /// Requests release at the next snapshot pass.
    pub fn request_unload(&self, save: bool) -> SaveState {
        let state = self.save_state.request_unload(save);
        if let Some(region) = self.region() {
            region.mark_for_save_unload(self.address);
        }
        state
    }

    /// Takes the pending lifecycle state.
    pub fn consume_save_state(&self) -> SaveState {
        self.save_state.consume_and_reset()
    }

    /// Publishes the live populated/observer/entity state as stable.
    pub fn copy_snapshot(&self) -> Result<u64, ChunkError> {
        Ok(self.snapshots.copy_all_snapshots()?)
    }

    /// Hands the runtime arrays to `persistence` through the region's sink.
    pub fn sync_save(&self, persistence: &dyn ChunkPersistence) -> Result<(), ChunkError> {
        let snapshot = self.snapshot(false)?;
        let output = match self.region() {
            Some(region) => region.chunk_output_stream(self),
            None => ChunkOutput {
                address: self.address,
                populated: self.is_populated(),
            },
        };
        persistence.save_chunk(output, snapshot.arrays())?;
        debug!(chunk = ?self.address, populated = output.populated, "chunk saved");
        Ok(())
    }

    /// Releases the block store and leaves the column. Only legal in the
    /// snapshot stage, after this tick's copy.
    pub fn finalize_unload(&self, save: bool) -> Result<(), ChunkError> {
        self.check_stage(TickStage::Snapshot)?;
        if self.save_state.mark_unloaded() == SaveState::Unloaded {
            return Err(ChunkError::Unloaded(self.address));
        }
        *self.store.write() = None;
        debug!(chunk = ?self.address, save, "chunk unloaded");
        self.deregister_from_column(save)
    }

    /// Leaves the column. A second call is a contract violation.
    pub fn deregister_from_column(&self, save: bool) -> Result<(), ChunkError> {
        if self
            .column_registered
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            error!(chunk = ?self.address, "chunk deregistered from its column twice");
            return Err(ChunkError::AlreadyDeregistered(self.address));
        }
        if let Some(world) = self.world.upgrade() {
            if let Some(column) = world.column(self.column) {
                if column.deregister_chunk(save) == 0 {
                    world.release_column(self.column);
                }
            }
        }
        Ok(())
    }

    /// World y of the highest non-air block in local `(x, z)`, if any.
    pub fn highest_block(&self, x: i32, z: i32) -> Result<Option<i32>, ChunkError> {
        self.read_store(|store| top_in(store, x, z).map(|y| self.world_y(y)))
    }

    /// Announces every non-empty (x, z) of this chunk to its column.
    pub fn notify_column(&self) -> Result<(), ChunkError> {
        if !self.column_registered.load(Ordering::Acquire) {
            return Ok(());
        }
        let Some(column) = self.world()?.column(self.column) else {
            return Ok(());
        };
        let size = CHUNK_SIZE as i32;
        self.read_store(|store| {
            for z in 0..size {
                for x in 0..size {
                    column.notify_chunk_added(x, z, top_in(store, x, z).map(|y| self.world_y(y)));
                }
            }
        })
    }

    /// True at most once per unload period, when no observer is left in
    /// either the live or the stable view.
    pub fn is_reapable(&self, world_age: u64) -> Result<bool, ChunkError> {
        let period = self.world()?.settings().unload_period_ticks;
        let last = self.last_unload_check.load(Ordering::Acquire);
        if world_age.saturating_sub(last) < period {
            return Ok(false);
        }
        if self
            .last_unload_check
            .compare_exchange(last, world_age, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(false);
        }
        Ok(self.observers.is_empty_live() && self.observers.stable().values.is_empty())
    }

    // -- population ----------------------------------------------------------

    /// Whether population has completed.
    pub fn is_populated(&self) -> bool {
        self.populated.get_live()
    }

    /// Runs every world populator, unless already populated and not forced.
    /// Returns whether population ran.
    ///
    /// A failing populator is logged and skipped. The chunk ends populated
    /// and fully queued for relighting either way.
    pub fn populate(&self, force: bool) -> Result<bool, ChunkError> {
        self.check_loaded()?;
        if !force && self.is_populated() {
            return Ok(false);
        }
        let world = self.world()?;
        let settings = world.settings();
        let mut rng = chunk_rng(settings.seed, self.address, settings.populate_salt);
        let failures = run_populators(self, world.populators(), &mut rng);

        let size = CHUNK_SIZE as i32;
        for z in 0..size {
            for x in 0..size {
                self.queue_light_update(x, z, LightKinds::BOTH)?;
            }
        }
        self.populated.set(true);
        if let Some(region) = self.region() {
            region.on_chunk_populated(self.address);
        }
        debug!(chunk = ?self.address, failures, "chunk populated");
        Ok(true)
    }

    // -- observers and entities ------------------------------------------------

    /// Records `entity` as an observer at its current distance. Returns
    /// whether it was newly added.
    pub fn refresh_observer(&self, entity: &Entity) -> Result<bool, ChunkError> {
        if !entity.is_observer() {
            return Err(ChunkError::NotObserver(entity.id()));
        }
        self.check_stage(TickStage::Finalize)?;
        self.check_loaded()?;
        let distance = entity
            .live()
            .chunk
            .map_or(i32::MAX, |c| self.address.distance(c));
        let added = self.observers.insert(entity.id(), distance).is_none();
        if added {
            if let Some(region) = self.region() {
                region.remove_unload_candidate(self.address);
            }
        }
        Ok(added)
    }

    /// Drops `entity` from the observers. Returns whether it was present.
    pub fn remove_observer(&self, entity: &Entity) -> Result<bool, ChunkError> {
        self.check_stage(TickStage::Finalize)?;
        self.check_loaded()?;
        let removed = self.observers.remove(&entity.id()).is_some();
        if removed && self.observers.is_empty_live() {
            if let Some(region) = self.region() {
                region.add_unload_candidate(self.address);
            }
        }
        Ok(removed)
    }

    /// Observer distances as of the last snapshot.
    pub fn observers(&self) -> Arc<MapSnapshot<EntityId, i32>> {
        self.observers.stable()
    }

    /// Observer distances now.
    pub fn observers_live(&self) -> FxHashMap<EntityId, i32> {
        self.observers.live()
    }

    /// Live distance of one observer.
    pub fn observer_distance_live(&self, observer: EntityId) -> Option<i32> {
        self.observers.get_live(&observer)
    }

    /// Adds an entity to this chunk. Returns whether it was new.
    pub fn add_entity(&self, entity: EntityId) -> Result<bool, ChunkError> {
        self.check_stage(TickStage::Finalize)?;
        self.check_loaded()?;
        Ok(self.entities.add(entity))
    }

    /// Removes an entity from this chunk. Returns whether it was present.
    pub fn remove_entity(&self, entity: EntityId) -> Result<bool, ChunkError> {
        self.check_stage(TickStage::Finalize)?;
        self.check_loaded()?;
        Ok(self.entities.remove(&entity))
    }

    /// Entities as of the last snapshot.
    pub fn entities(&self) -> Arc<SetSnapshot<EntityId>> {
        self.entities.stable()
    }

    /// Entities now.
    pub fn live_entities(&self) -> FxHashSet<EntityId> {
        self.entities.live()
    }

    /// Runs before the snapshot copy: requests population if observed and
    /// not yet populated, then computes and dispatches visibility.
    pub fn pre_snapshot(&self) -> Result<VisibilityPlan, ChunkError> {
        self.check_loaded()?;
        let world = self.world()?;
        if !self.observers.is_empty_live() && !self.is_populated() {
            if let Some(region) = world.region(self.region) {
                region.queue_chunk_for_population(self.address);
            }
        }

        let observers_stable = self.observers.stable();
        let observers_live = self.observers.live();
        let changed_observers = self.observers.dirty_keys();
        let entities_stable = self.entities.stable();
        let changed_entities = self.entities.dirty_list();
        let input = ChunkVisibility {
            chunk: self.address,
            observers_stable: &observers_stable.values,
            observers_live: &observers_live,
            changed_observers: &changed_observers,
            entities_stable: &entities_stable.items,
            changed_entities: &changed_entities,
        };
        let plan = compute_visibility(&input, &WorldLookup::new(&world));

        for (observer, events) in plan.iter() {
            let Some(sync) = world.entity(observer).and_then(|e| e.network().cloned()) else {
                continue;
            };
            for &event in events {
                network::dispatch(sync.as_ref(), event);
            }
        }
        Ok(plan)
    }
}

impl std::fmt::Debug for Chunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chunk")
            .field("address", &self.address)
            .field("save_state", &self.save_state.get())
            .field("populated", &self.is_populated())
            .finish()
    }
}

/// The chunk and its loaded neighbors, as the light passes see them.
struct ChunkLightView<'a> {
    chunk: &'a Chunk,
    store: &'a BlockStore,
    world: Option<&'a World>,
}

impl LightNeighborhood for ChunkLightView<'_> {
    fn opacity(&self, x: i32, y: i32, z: i32) -> u8 {
        self.chunk.registry.opacity(self.store.get_material_id(x, y, z))
    }

    fn emission(&self, x: i32, y: i32, z: i32) -> u8 {
        self.chunk.registry.light_emission(self.store.get_material_id(x, y, z))
    }

    fn outside_sky_light(&self, x: i32, y: i32, z: i32) -> Option<u8> {
        let shift = CHUNK_SIZE_BITS;
        let address = self.chunk.address.offset(x >> shift, y >> shift, z >> shift);
        self.world?.chunk(address)?.block_sky_light(x, y, z).ok()
    }
}

#[cfg(test)]
#[path = "chunk_tests.rs"]
mod tests;
