//! Unit tests for the chunk container.

use std::sync::Barrier;
use std::sync::atomic::AtomicUsize;

use tessera_voxel::{CHUNK_VOLUME, MaterialDef, local_coords};

use super::*;
use crate::entity::EntityState;
use crate::error::PopulateError;
use crate::persistence::MemoryPersistence;
use crate::populate::{LayerPopulator, Populator};
use crate::world::WorldSettings;

const ORIGIN: ChunkAddress = ChunkAddress { x: 0, y: 0, z: 0 };
const WORLD: Option<Source> = Some(Source::World);

struct Fixture {
    world: Arc<World>,
    persistence: Arc<MemoryPersistence>,
    stone: MaterialId,
    torch: MaterialId,
}

fn fixture_with(
    settings: WorldSettings,
    populators: impl FnOnce(MaterialId) -> Vec<Box<dyn Populator>>,
) -> Fixture {
    let mut registry = MaterialRegistry::new();
    let stone = registry.register(MaterialDef::opaque("stone")).unwrap();
    let torch = registry
        .register(MaterialDef {
            light_emission: 14,
            ..MaterialDef::clear("torch")
        })
        .unwrap();
    let persistence = Arc::new(MemoryPersistence::new());
    let world = World::new(settings, Arc::new(registry), populators(stone), persistence.clone());
    Fixture {
        world,
        persistence,
        stone,
        torch,
    }
}

fn fixture() -> Fixture {
    fixture_with(WorldSettings::default(), |_| Vec::new())
}

fn observer_at(id: u64, chunk: ChunkAddress) -> Entity {
    Entity::new(EntityId(id), EntityState::at(chunk, 4)).with_observer()
}

#[test]
fn test_block_roundtrip_masks_coordinates() {
    let f = fixture();
    let chunk = f.world.load_chunk(ORIGIN).unwrap();
    let old = chunk.set_block_material(17, 3, -1, f.stone, 9, WORLD).unwrap();
    assert_eq!(old, BlockFullState::AIR);
    assert_eq!(chunk.block_full_state(1, 3, 15).unwrap(), BlockFullState::new(f.stone, 9));
    assert_eq!(chunk.block_material(1, 3, 15).unwrap(), f.stone);
    assert_eq!(chunk.block_data(1, 3, 15).unwrap(), 9);
}

#[test]
fn test_mutation_without_source_changes_nothing() {
    let f = fixture();
    let chunk = f.world.load_chunk(ORIGIN).unwrap();
    assert!(matches!(
        chunk.set_block_material(0, 0, 0, f.stone, 0, None),
        Err(ChunkError::MissingSource)
    ));
    assert!(matches!(chunk.set_block_light(0, 0, 0, 7, None), Err(ChunkError::MissingSource)));
    assert_eq!(chunk.block_material(0, 0, 0).unwrap(), MaterialId::AIR);
    assert_eq!(chunk.block_light(0, 0, 0).unwrap(), 0);
    assert!(!chunk.is_dirty().unwrap());
}

#[test]
fn test_set_block_data_keeps_material() {
    let f = fixture();
    let chunk = f.world.load_chunk(ORIGIN).unwrap();
    chunk.set_block_material(2, 2, 2, f.stone, 1, WORLD).unwrap();
    assert_eq!(chunk.set_block_data(2, 2, 2, 5, WORLD).unwrap(), 1);
    assert_eq!(chunk.block_full_state(2, 2, 2).unwrap(), BlockFullState::new(f.stone, 5));

    let stale = BlockFullState::new(f.stone, 1);
    assert!(!chunk.compare_and_set_data(2, 2, 2, stale, 8, WORLD).unwrap());
    let current = BlockFullState::new(f.stone, 5);
    assert!(chunk.compare_and_set_data(2, 2, 2, current, 8, WORLD).unwrap());
    assert_eq!(chunk.block_data(2, 2, 2).unwrap(), 8);
}

#[test]
fn test_compare_and_set_has_exactly_one_winner() {
    let f = fixture();
    let chunk = f.world.load_chunk(ORIGIN).unwrap();
    let threads = 8;
    let barrier = Barrier::new(threads);
    let wins = AtomicUsize::new(0);
    std::thread::scope(|s| {
        for i in 0..threads {
            let chunk = &chunk;
            let barrier = &barrier;
            let wins = &wins;
            let stone = f.stone;
            s.spawn(move || {
                barrier.wait();
                let new = BlockFullState::new(stone, i as u16);
                if chunk
                    .compare_and_set_block(5, 5, 5, BlockFullState::AIR, new, Some(Source::Physics))
                    .unwrap()
                {
                    wins.fetch_add(1, Ordering::Relaxed);
                }
            });
        }
    });
    assert_eq!(wins.load(Ordering::Relaxed), 1);
    assert_eq!(chunk.block_material(5, 5, 5).unwrap(), f.stone);
}

#[test]
fn test_palette_overflow_widens_then_compresses_back() {
    let f = fixture();
    let chunk = f.world.load_chunk(ORIGIN).unwrap();
    assert_eq!(chunk.bits_per_cell().unwrap(), 8);

    for i in 0..300 {
        let (x, y, z) = local_coords(i);
        chunk.set_block_material(x, y, z, f.stone, i as u16, WORLD).unwrap();
    }
    assert_eq!(chunk.bits_per_cell().unwrap(), 32);
    for i in 0..300 {
        let (x, y, z) = local_coords(i);
        assert_eq!(chunk.block_data(x, y, z).unwrap(), i as u16);
    }
    assert!(!chunk.compress_if_required().unwrap());

    for i in 0..300 {
        let (x, y, z) = local_coords(i);
        chunk.set_block_material(x, y, z, MaterialId::AIR, 0, WORLD).unwrap();
    }
    assert!(chunk.compress_if_required().unwrap());
    assert_eq!(chunk.bits_per_cell().unwrap(), 8);
    assert_eq!(chunk.block_full_state(3, 0, 0).unwrap(), BlockFullState::AIR);
}

#[test]
fn test_open_sky_lights_every_cell() {
    let f = fixture();
    let chunk = f.world.load_chunk(ORIGIN).unwrap();
    assert_eq!(chunk.process_queued_lighting().unwrap(), 256);
    for i in 0..CHUNK_VOLUME {
        let (x, y, z) = local_coords(i);
        assert_eq!(chunk.block_sky_light(x, y, z).unwrap(), 15);
    }
}

#[test]
fn test_opaque_layer_darkens_everything_below() {
    let f = fixture();
    let chunk = f.world.load_chunk(ORIGIN).unwrap();
    for z in 0..16 {
        for x in 0..16 {
            chunk.set_block_material(x, 10, z, f.stone, 0, WORLD).unwrap();
        }
    }
    chunk.process_queued_lighting().unwrap();
    for z in 0..16 {
        for x in 0..16 {
            for y in 11..16 {
                assert_eq!(chunk.block_sky_light(x, y, z).unwrap(), 15);
            }
            for y in 0..=10 {
                assert_eq!(chunk.block_sky_light(x, y, z).unwrap(), 0, "({x}, {y}, {z})");
            }
        }
    }
}

#[test]
fn test_single_opaque_block_shades_its_column() {
    let f = fixture();
    let chunk = f.world.load_chunk(ORIGIN).unwrap();
    chunk.process_queued_lighting().unwrap();
    chunk.set_block_material(4, 10, 4, f.stone, 0, WORLD).unwrap();
    chunk.process_queued_lighting().unwrap();
    assert_eq!(chunk.block_sky_light(4, 11, 4).unwrap(), 15);
    assert_eq!(chunk.block_sky_light(4, 10, 4).unwrap(), 0);
    for y in 0..10 {
        assert!(chunk.block_sky_light(4, y, 4).unwrap() < 15);
    }
}

#[test]
fn test_torch_floods_block_light() {
    let f = fixture();
    let chunk = f.world.load_chunk(ORIGIN).unwrap();
    chunk.set_block_material(8, 8, 8, f.torch, 0, WORLD).unwrap();
    chunk.process_queued_lighting().unwrap();
    assert_eq!(chunk.block_light(8, 8, 8).unwrap(), 14);
    assert_eq!(chunk.block_light(9, 8, 8).unwrap(), 13);
    assert_eq!(chunk.block_light(8, 8, 12).unwrap(), 10);

    chunk.set_block_material(8, 8, 8, MaterialId::AIR, 0, WORLD).unwrap();
    chunk.process_queued_lighting().unwrap();
    assert_eq!(chunk.block_light(8, 8, 8).unwrap(), 0);
}

#[test]
fn test_many_queued_columns_mark_light_dirty() {
    let f = fixture();
    let chunk = f.world.load_chunk(ORIGIN).unwrap();
    assert!(!chunk.is_light_dirty());
    chunk.process_queued_lighting().unwrap();
    assert!(chunk.is_light_dirty());
    chunk.reset_dirty_arrays().unwrap();
    assert!(!chunk.is_light_dirty());

    chunk.set_block_material(0, 0, 0, f.stone, 0, WORLD).unwrap();
    chunk.process_queued_lighting().unwrap();
    assert!(!chunk.is_light_dirty());
}

#[test]
fn test_empty_light_request_is_rejected() {
    let f = fixture();
    let chunk = f.world.load_chunk(ORIGIN).unwrap();
    chunk.process_queued_lighting().unwrap();
    assert!(matches!(
        chunk.queue_light_update(1, 1, LightKinds::default()),
        Err(ChunkError::NoLightKind)
    ));
    assert_eq!(chunk.process_queued_lighting().unwrap(), 0);
}

#[test]
fn test_dirty_blocks_report_world_coordinates() {
    let f = fixture();
    let chunk = f.world.load_chunk(ChunkAddress::new(1, 0, -1)).unwrap();
    chunk.set_block_material(2, 3, 4, f.stone, 0, WORLD).unwrap();
    assert!(chunk.is_dirty().unwrap());
    assert_eq!(chunk.dirty_block(0).unwrap(), Some((18, 3, -12)));
    assert_eq!(chunk.dirty_block(1).unwrap(), None);
    chunk.reset_dirty_arrays().unwrap();
    assert!(!chunk.is_dirty().unwrap());
}

#[test]
fn test_dirty_overflow_past_capacity() {
    let f = fixture();
    let chunk = f.world.load_chunk(ORIGIN).unwrap();
    for x in 0..11 {
        chunk.set_block_material(x, 0, 0, f.stone, 0, WORLD).unwrap();
    }
    assert!(chunk.is_dirty_overflow().unwrap());
}

#[test]
fn test_column_tracks_highest_block() {
    let f = fixture();
    let chunk = f.world.load_chunk(ChunkAddress::new(0, 2, 0)).unwrap();
    chunk.set_block_material(2, 9, 3, f.stone, 0, WORLD).unwrap();
    let column = f.world.column(ColumnKey { x: 0, z: 0 }).unwrap();
    assert_eq!(column.height(2, 3), Some(41));
    assert_eq!(column.chunk_count(), 1);
}

#[test]
fn test_physics_update_goes_to_region_of_block() {
    let settings = WorldSettings {
        region_size: 2,
        ..WorldSettings::default()
    };
    let f = fixture_with(settings, |_| Vec::new());
    let chunk = f.world.load_chunk(ORIGIN).unwrap();
    chunk.update_block_physics(40, 1, 2).unwrap();
    let region = f.world.region(RegionKey { x: 1, y: 0, z: 0 }).unwrap();
    assert_eq!(region.take_physics(), vec![(40, 1, 2)]);
}

#[test]
fn test_unloaded_chunk_rejects_access() {
    let f = fixture();
    let chunk = f.world.load_chunk(ORIGIN).unwrap();
    f.world.set_stage(TickStage::Snapshot);
    chunk.finalize_unload(false).unwrap();

    assert!(!chunk.is_loaded());
    assert!(matches!(chunk.block_material(0, 0, 0), Err(ChunkError::Unloaded(_))));
    assert!(matches!(chunk.block_sky_light(0, 0, 0), Err(ChunkError::Unloaded(_))));
    assert!(matches!(
        chunk.set_block_material(0, 0, 0, f.stone, 0, WORLD),
        Err(ChunkError::Unloaded(_))
    ));
    assert!(matches!(chunk.snapshot(false), Err(ChunkError::Unloaded(_))));
    assert_eq!(chunk.request_save(), SaveState::Unloaded);
    assert!(matches!(chunk.finalize_unload(false), Err(ChunkError::Unloaded(_))));
    assert!(f.world.column(ColumnKey { x: 0, z: 0 }).is_none());
}

#[test]
fn test_second_deregistration_is_an_error() {
    let f = fixture();
    let chunk = f.world.load_chunk(ORIGIN).unwrap();
    chunk.deregister_from_column(false).unwrap();
    assert!(matches!(
        chunk.deregister_from_column(false),
        Err(ChunkError::AlreadyDeregistered(a)) if a == ORIGIN
    ));
}

#[test]
fn test_finalize_unload_requires_snapshot_stage() {
    let f = fixture();
    let chunk = f.world.load_chunk(ORIGIN).unwrap();
    assert!(matches!(
        chunk.finalize_unload(true),
        Err(ChunkError::WrongStage {
            expected: TickStage::Snapshot,
            ..
        })
    ));
    assert!(chunk.is_loaded());
}

#[test]
fn test_lifecycle_requests_merge_and_mark_region() {
    let f = fixture();
    let chunk = f.world.load_chunk(ORIGIN).unwrap();
    assert_eq!(chunk.request_unload(false), SaveState::Unload);
    assert_eq!(chunk.request_save(), SaveState::UnloadSave);
    let region = f.world.region(chunk.region_key()).unwrap();
    assert_eq!(region.take_save_unload_marks(), vec![ORIGIN]);
    assert_eq!(chunk.consume_save_state(), SaveState::UnloadSave);
    assert_eq!(chunk.save_state(), SaveState::None);
}

#[test]
fn test_refresh_observer_needs_capability_and_stage() {
    let f = fixture();
    let chunk = f.world.load_chunk(ORIGIN).unwrap();
    let plain = Entity::new(EntityId(1), EntityState::at(ORIGIN, 4));
    assert!(matches!(chunk.refresh_observer(&plain), Err(ChunkError::NotObserver(EntityId(1)))));

    let observer = observer_at(2, ChunkAddress::new(3, 0, 4));
    assert!(chunk.refresh_observer(&observer).unwrap());
    assert!(!chunk.refresh_observer(&observer).unwrap());
    assert_eq!(chunk.observers_live().get(&EntityId(2)), Some(&5));
    assert!(chunk.observers().values.is_empty());

    f.world.set_stage(TickStage::Physics);
    assert!(matches!(chunk.refresh_observer(&observer), Err(ChunkError::WrongStage { .. })));
}

#[test]
fn test_observer_membership_drives_unload_candidacy() {
    let f = fixture();
    let chunk = f.world.load_chunk(ORIGIN).unwrap();
    let region = f.world.region(chunk.region_key()).unwrap();
    assert!(region.is_unload_candidate(ORIGIN));

    let observer = observer_at(2, ORIGIN);
    chunk.refresh_observer(&observer).unwrap();
    assert!(!region.is_unload_candidate(ORIGIN));

    assert!(chunk.remove_observer(&observer).unwrap());
    assert!(region.is_unload_candidate(ORIGIN));
}

#[test]
fn test_removing_absent_observer_keeps_candidacy() {
    let f = fixture();
    let chunk = f.world.load_chunk(ORIGIN).unwrap();
    let region = f.world.region(chunk.region_key()).unwrap();
    region.remove_unload_candidate(ORIGIN);

    assert!(!chunk.remove_observer(&observer_at(2, ORIGIN)).unwrap());
    assert!(!region.is_unload_candidate(ORIGIN));
}

#[test]
fn test_membership_removal_rejects_unloaded_chunk() {
    let f = fixture();
    let chunk = f.world.load_chunk(ORIGIN).unwrap();
    let observer = observer_at(2, ORIGIN);
    chunk.refresh_observer(&observer).unwrap();
    chunk.add_entity(EntityId(7)).unwrap();

    f.world.set_stage(TickStage::Snapshot);
    chunk.finalize_unload(false).unwrap();
    f.world.set_stage(TickStage::Finalize);

    assert!(matches!(chunk.remove_observer(&observer), Err(ChunkError::Unloaded(_))));
    assert!(matches!(chunk.remove_entity(EntityId(7)), Err(ChunkError::Unloaded(_))));
}

#[test]
fn test_snapshot_never_tears_a_cell() {
    let f = fixture();
    let chunk = f.world.load_chunk(ORIGIN).unwrap();
    chunk.set_block_material(0, 0, 0, f.stone, 1, WORLD).unwrap();
    let done = AtomicBool::new(false);

    std::thread::scope(|s| {
        s.spawn(|| {
            let mut flip = false;
            while !done.load(Ordering::Acquire) {
                let (material, data) = if flip { (f.stone, 1) } else { (f.torch, 2) };
                chunk.set_block_material(0, 0, 0, material, data, WORLD).unwrap();
                flip = !flip;
            }
        });
        let torn = (0..5000)
            .filter(|_| {
                let snapshot = chunk.snapshot(false).unwrap();
                let pair = (snapshot.block_ids[0], snapshot.block_data[0]);
                pair != (f.stone.0, 1) && pair != (f.torch.0, 2)
            })
            .count();
        done.store(true, Ordering::Release);
        assert_eq!(torn, 0);
    });
}

#[test]
fn test_reap_check_runs_once_per_period() {
    let settings = WorldSettings {
        unload_period_ticks: 5,
        ..WorldSettings::default()
    };
    let f = fixture_with(settings, |_| Vec::new());
    let chunk = f.world.load_chunk(ORIGIN).unwrap();
    assert!(!chunk.is_reapable(3).unwrap());
    assert!(chunk.is_reapable(5).unwrap());
    assert!(!chunk.is_reapable(6).unwrap());
    assert!(chunk.is_reapable(10).unwrap());

    chunk.refresh_observer(&observer_at(2, ORIGIN)).unwrap();
    assert!(!chunk.is_reapable(20).unwrap());
}

#[test]
fn test_snapshot_entities_follow_stable_view() {
    let f = fixture();
    let chunk = f.world.load_chunk(ORIGIN).unwrap();
    chunk.add_entity(EntityId(7)).unwrap();
    assert_eq!(chunk.snapshot(true).unwrap().entities, Some(vec![]));
    assert!(chunk.live_entities().contains(&EntityId(7)));

    chunk.copy_snapshot().unwrap();
    let snapshot = chunk.snapshot(true).unwrap();
    assert_eq!(snapshot.entities, Some(vec![EntityId(7)]));
    assert_eq!(snapshot.block_ids.len(), CHUNK_VOLUME);
    assert_eq!(snapshot.sky_light.len(), CHUNK_VOLUME / 2);
    assert_eq!(chunk.snapshot(false).unwrap().entities, None);
    assert_eq!(chunk.entities().changed, vec![EntityId(7)]);
}

#[test]
fn test_sync_save_writes_runtime_arrays() {
    let f = fixture();
    let chunk = f.world.load_chunk(ORIGIN).unwrap();
    chunk.set_block_material(1, 2, 3, f.stone, 4, WORLD).unwrap();
    chunk.set_block_light(1, 2, 4, 9, WORLD).unwrap();
    chunk.sync_save(f.persistence.as_ref()).unwrap();

    let record = f.persistence.record(ORIGIN).unwrap();
    let index = tessera_voxel::local_index(1, 2, 3);
    assert_eq!(record.block_ids[index], f.stone.0);
    assert_eq!(record.block_data[index], 4);
    assert_eq!(record.block_light, chunk.snapshot(false).unwrap().block_light);
    assert!(!record.populated);
}

#[test]
fn test_aux_payload_cleared_by_overwrite() {
    let f = fixture();
    let chunk = f.world.load_chunk(ORIGIN).unwrap();
    let payload: Arc<[u8]> = Arc::from(&b"sign"[..]);
    chunk.set_block_aux(1, 1, 1, payload.clone(), WORLD).unwrap();
    assert_eq!(chunk.block_aux(1, 1, 1).unwrap(), Some(payload));
    chunk.set_block_material(1, 1, 1, f.stone, 0, WORLD).unwrap();
    assert_eq!(chunk.block_aux(1, 1, 1).unwrap(), None);
}

struct Failing;

impl Populator for Failing {
    fn name(&self) -> &str {
        "failing"
    }

    fn populate(&self, _chunk: &Chunk, _rng: &mut rand_chacha::ChaCha8Rng) -> Result<(), PopulateError> {
        Err(PopulateError::Failed("no ore table".into()))
    }
}

struct Panicking;

impl Populator for Panicking {
    fn name(&self) -> &str {
        "panicking"
    }

    fn populate(&self, _chunk: &Chunk, _rng: &mut rand_chacha::ChaCha8Rng) -> Result<(), PopulateError> {
        panic!("populator bug");
    }
}

#[test]
fn test_populate_isolates_failures_and_runs_once() {
    let f = fixture_with(WorldSettings::default(), |stone| {
        vec![
            Box::new(Failing) as Box<dyn Populator>,
            Box::new(Panicking),
            Box::new(LayerPopulator {
                material: stone,
                below_world_y: 4,
            }),
        ]
    });
    let stone = f.stone;
    let chunk = f.world.load_chunk(ORIGIN).unwrap();
    assert!(!chunk.is_populated());
    assert!(chunk.populate(false).unwrap());
    assert!(chunk.is_populated());
    assert_eq!(chunk.block_material(7, 3, 7).unwrap(), stone);
    assert_eq!(chunk.block_material(7, 4, 7).unwrap(), MaterialId::AIR);

    let region = f.world.region(chunk.region_key()).unwrap();
    assert_eq!(region.take_populated(), vec![ORIGIN]);
    assert!(!chunk.populate(false).unwrap());
    assert!(chunk.populate(true).unwrap());
}
