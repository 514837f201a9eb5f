//! Drives a small world: one observer wandering along +x, random edits in
//! its chunk, and a pool of reader threads copying chunk snapshots while the
//! next tick runs.

use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tessera_config::Config;
use tessera_voxel::{CHUNK_SIZE, ChunkAddress, MaterialDef, MaterialId, MaterialRegistry, RegistryError};
use tessera_world::{
    Chunk, ChunkError, Entity, EntityId, EntityState, LayerPopulator, MemoryPersistence, Populator,
    RecordingSync, ScatterPopulator, Source, TickHooks, TickReport, World, WorldSettings,
};
use tracing::{debug, info, trace, warn};

/// Observer moves one chunk along +x this often.
const MOVE_EVERY_TICKS: u64 = 25;

const OBSERVER: EntityId = EntityId(1);
const WANDERER: EntityId = EntityId(2);

/// Errors that stop a simulation run.
#[derive(Debug, thiserror::Error)]
pub enum SimError {
    /// Material setup failed.
    #[error(transparent)]
    Registry(#[from] RegistryError),
    /// A world operation failed.
    #[error(transparent)]
    Chunk(#[from] ChunkError),
    /// A reader thread could not be started.
    #[error("failed to spawn reader thread: {0}")]
    Spawn(#[source] std::io::Error),
}

/// Materials the simulator places.
#[derive(Clone, Copy, Debug)]
pub struct Materials {
    pub stone: MaterialId,
    pub dirt: MaterialId,
    pub torch: MaterialId,
}

/// Totals over a whole run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SimSummary {
    pub ticks: u64,
    pub peak_chunks: usize,
    pub populated: usize,
    pub lit_columns: usize,
    pub physics_updates: usize,
    pub visibility_events: usize,
    pub saved: usize,
    pub unloaded: usize,
    pub reaped: usize,
    pub edits: usize,
    pub snapshots_read: usize,
    pub snapshots_missed: usize,
    pub solid_cells_read: usize,
}

impl SimSummary {
    fn absorb(&mut self, report: &TickReport) {
        self.ticks = report.age;
        self.populated += report.populated;
        self.lit_columns += report.lit_columns;
        self.physics_updates += report.physics_updates;
        self.visibility_events += report.visibility_events;
        self.saved += report.saved;
        self.unloaded += report.unloaded;
        self.reaped += report.reaped;
    }
}

/// A world wired up for simulation.
pub struct Simulation {
    pub world: Arc<World>,
    pub persistence: Arc<MemoryPersistence>,
    pub materials: Materials,
    /// Receives the observer's visibility events.
    pub sync: Arc<RecordingSync>,
}

/// World tunables from the loaded config.
pub fn world_settings(config: &Config) -> WorldSettings {
    WorldSettings {
        seed: config.world.seed,
        populate_salt: config.world.populate_salt,
        region_size: config.world.region_size.max(1),
        dirty_capacity: config.chunk.dirty_capacity,
        palette_threshold: config.chunk.palette_threshold,
        unload_period_ticks: config.chunk.unload_period_ticks,
    }
}

/// Reader threads to start; 0 means one per CPU.
pub fn reader_count(configured: usize) -> usize {
    if configured == 0 { num_cpus::get().max(1) } else { configured }
}

impl Simulation {
    /// Builds the world and places the observer and one wandering entity at
    /// the origin.
    pub fn new(config: &Config) -> Result<Self, SimError> {
        let mut registry = MaterialRegistry::new();
        let materials = Materials {
            stone: registry.register(MaterialDef::opaque("stone"))?,
            dirt: registry.register(MaterialDef::opaque("dirt"))?,
            torch: registry.register(MaterialDef {
                light_emission: 14,
                ..MaterialDef::clear("torch")
            })?,
        };
        let populators: Vec<Box<dyn Populator>> = vec![
            Box::new(LayerPopulator {
                material: materials.stone,
                below_world_y: 0,
            }),
            Box::new(ScatterPopulator {
                material: materials.torch,
                count: 2,
            }),
        ];
        let persistence = Arc::new(MemoryPersistence::new());
        let world = World::new(
            world_settings(config),
            Arc::new(registry),
            populators,
            persistence.clone(),
        );

        let origin = ChunkAddress::new(0, 0, 0);
        let sync = Arc::new(RecordingSync::new());
        world.spawn_entity(
            Entity::new(OBSERVER, EntityState::at(origin, 4))
                .with_observer()
                .with_network(sync.clone()),
        )?;
        world.spawn_entity(Entity::new(WANDERER, EntityState::at(origin.offset(1, 0, 0), 3)))?;
        world.update_observer(OBSERVER, config.sim.chunks_radius)?;

        Ok(Self {
            world,
            persistence,
            materials,
            sync,
        })
    }

    /// Runs `config.sim.ticks` ticks with snapshot readers, then shuts the
    /// world down.
    pub fn run(&self, config: &Config) -> Result<SimSummary, SimError> {
        let readers = reader_count(config.sim.reader_threads);
        let (job_tx, job_rx) = crossbeam_channel::unbounded::<Arc<Chunk>>();
        let (read_tx, read_rx) = crossbeam_channel::unbounded::<Option<usize>>();
        info!(ticks = config.sim.ticks, readers, "simulation starting");

        std::thread::scope(|scope| -> Result<SimSummary, SimError> {
            let spawned = (0..readers).try_for_each(|i| {
                let jobs = job_rx.clone();
                let reads = read_tx.clone();
                std::thread::Builder::new()
                    .name(format!("snapshot-reader-{i}"))
                    .spawn_scoped(scope, move || read_snapshots(&jobs, &reads))
                    .map(drop)
                    .map_err(SimError::Spawn)
            });
            drop(read_tx);

            // Readers exit once the job channel closes, so it must be dropped
            // before the scope joins on every path.
            let driven = spawned.and_then(|()| self.drive(config, &job_tx));
            drop(job_tx);

            let mut summary = driven?;
            for read in read_rx.iter() {
                match read {
                    Some(solid) => {
                        summary.snapshots_read += 1;
                        summary.solid_cells_read += solid;
                    }
                    None => summary.snapshots_missed += 1,
                }
            }
            Ok(summary)
        })
    }

    fn drive(&self, config: &Config, jobs: &Sender<Arc<Chunk>>) -> Result<SimSummary, SimError> {
        let mut summary = SimSummary::default();
        let mut hooks = SimHooks {
            rng: ChaCha8Rng::seed_from_u64(config.world.seed),
            materials: self.materials,
            radius: config.sim.chunks_radius,
            edits: 0,
        };
        for _ in 0..config.sim.ticks {
            let report = self.world.tick(&mut hooks)?;
            summary.absorb(&report);
            let chunks = self.world.chunks();
            summary.peak_chunks = summary.peak_chunks.max(chunks.len());
            for chunk in chunks {
                let _ = jobs.send(chunk);
            }
            debug!(age = report.age, events = report.visibility_events, "tick complete");
        }
        summary.edits = hooks.edits;

        let saved_before = self.persistence.save_count();
        let unloaded = self.world.shutdown()?;
        summary.unloaded += unloaded;
        summary.saved += (self.persistence.save_count() - saved_before) as usize;
        info!(
            ticks = summary.ticks,
            peak_chunks = summary.peak_chunks,
            saved = summary.saved,
            "simulation finished"
        );
        Ok(summary)
    }
}

/// Snapshots every chunk it is handed. Sends the solid cell count, or
/// `None` when the chunk unloaded before the copy.
fn read_snapshots(jobs: &Receiver<Arc<Chunk>>, reads: &Sender<Option<usize>>) {
    for chunk in jobs.iter() {
        let read = match chunk.snapshot(true) {
            Ok(snapshot) => Some(snapshot.block_ids.iter().filter(|&&id| id != 0).count()),
            Err(err) => {
                trace!(chunk = ?chunk.address(), %err, "snapshot skipped");
                None
            }
        };
        let _ = reads.send(read);
    }
}

struct SimHooks {
    rng: ChaCha8Rng,
    materials: Materials,
    radius: i32,
    edits: usize,
}

impl SimHooks {
    fn edit(&mut self, world: &World) -> Result<(), ChunkError> {
        let Some(center) = world.entity(OBSERVER).and_then(|e| e.live().chunk) else {
            return Ok(());
        };
        let Some(chunk) = world.chunk(center) else {
            return Ok(());
        };
        let size = CHUNK_SIZE as i32;
        let (x, y, z) = (
            self.rng.random_range(0..size),
            self.rng.random_range(0..size),
            self.rng.random_range(0..size),
        );
        let material = match self.rng.random_range(0..4) {
            0 => MaterialId::AIR,
            1 => self.materials.torch,
            2 => self.materials.dirt,
            _ => self.materials.stone,
        };
        chunk.set_block_material(x, y, z, material, 0, Some(Source::World))?;
        chunk.update_block_physics(x, y, z)?;
        self.edits += 1;
        Ok(())
    }

    fn wander(&mut self, world: &World) -> Result<(), ChunkError> {
        if world.age() == 0 || world.age() % MOVE_EVERY_TICKS != 0 {
            return Ok(());
        }
        let Some(center) = world.entity(OBSERVER).and_then(|e| e.live().chunk) else {
            return Ok(());
        };
        let next = center.offset(1, 0, 0);
        world.move_entity(OBSERVER, next)?;
        world.update_observer(OBSERVER, self.radius)?;
        debug!(chunk = ?next, "observer moved");
        Ok(())
    }
}

impl TickHooks for SimHooks {
    fn physics(&mut self, _world: &World, updates: &[(i32, i32, i32)]) {
        if !updates.is_empty() {
            trace!(updates = updates.len(), "physics updates");
        }
    }

    fn finalize(&mut self, world: &World) {
        if let Err(err) = self.wander(world).and_then(|()| self.edit(world)) {
            warn!(%err, "simulation step failed");
        }
    }
}
