//! Entities as seen by chunks: identity, observer capability, and the
//! live/previous-tick state the visibility engine compares.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashSet;
use tessera_voxel::ChunkAddress;

use crate::network::NetworkSync;
use crate::visibility::EntityView;

/// Unique entity identifier within a world.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityId(pub u64);

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Identifies which controller drives an entity. A change forces clients to
/// rebuild the entity.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct ControllerKind(pub u32);

/// Per-tick entity state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EntityState {
    /// Chunk the entity is in, if any.
    pub chunk: Option<ChunkAddress>,
    /// Chunk distance within which observers should see this entity.
    pub view_distance: i32,
    /// Current controller.
    pub controller: ControllerKind,
}

impl EntityState {
    /// State for an entity at `chunk`.
    pub fn at(chunk: ChunkAddress, view_distance: i32) -> Self {
        Self {
            chunk: Some(chunk),
            view_distance,
            controller: ControllerKind::default(),
        }
    }
}

/// A world entity.
pub struct Entity {
    id: EntityId,
    observer: bool,
    network: Option<Arc<dyn NetworkSync>>,
    live: RwLock<EntityState>,
    previous: RwLock<EntityState>,
    just_spawned: AtomicBool,
    /// Chunks this observer is currently registered with.
    observed: Mutex<FxHashSet<ChunkAddress>>,
}

impl Entity {
    /// A freshly spawned non-observer entity.
    pub fn new(id: EntityId, state: EntityState) -> Self {
        Self {
            id,
            observer: false,
            network: None,
            live: RwLock::new(state),
            previous: RwLock::new(EntityState {
                chunk: None,
                ..state
            }),
            just_spawned: AtomicBool::new(true),
            observed: Mutex::new(FxHashSet::default()),
        }
    }

    /// Marks the entity as an observer.
    pub fn with_observer(mut self) -> Self {
        self.observer = true;
        self
    }

    /// Attaches a network-sync capability.
    pub fn with_network(mut self, network: Arc<dyn NetworkSync>) -> Self {
        self.network = Some(network);
        self
    }

    /// Identifier.
    pub fn id(&self) -> EntityId {
        self.id
    }

    /// Whether the entity may observe chunks.
    pub fn is_observer(&self) -> bool {
        self.observer
    }

    /// The network-sync capability, if the entity has one.
    pub fn network(&self) -> Option<&Arc<dyn NetworkSync>> {
        self.network.as_ref()
    }

    /// Current-tick state.
    pub fn live(&self) -> EntityState {
        *self.live.read()
    }

    /// State as of the end of the previous tick.
    pub fn previous(&self) -> EntityState {
        *self.previous.read()
    }

    /// Whether the entity was spawned during the current tick.
    pub fn just_spawned(&self) -> bool {
        self.just_spawned.load(Ordering::Acquire)
    }

    /// Moves the entity's live chunk.
    pub fn set_chunk(&self, chunk: Option<ChunkAddress>) {
        self.live.write().chunk = chunk;
    }

    /// Changes the live view distance.
    pub fn set_view_distance(&self, view_distance: i32) {
        self.live.write().view_distance = view_distance;
    }

    /// Changes the live controller.
    pub fn set_controller(&self, controller: ControllerKind) {
        self.live.write().controller = controller;
    }

    /// Rolls live state into previous state at the end of a tick.
    pub fn finalize_tick(&self) {
        let live = *self.live.read();
        *self.previous.write() = live;
        self.just_spawned.store(false, Ordering::Release);
    }

    /// Previous and live state side by side, as the visibility engine reads it.
    pub fn view(&self) -> EntityView {
        let previous = self.previous();
        let live = self.live();
        EntityView {
            prev_chunk: previous.chunk,
            live_chunk: live.chunk,
            prev_view_distance: previous.view_distance,
            view_distance: live.view_distance,
            prev_controller: previous.controller,
            controller: live.controller,
            just_spawned: self.just_spawned(),
        }
    }

    pub(crate) fn observed(&self) -> FxHashSet<ChunkAddress> {
        self.observed.lock().clone()
    }

    pub(crate) fn set_observed(&self, chunks: FxHashSet<ChunkAddress>) {
        *self.observed.lock() = chunks;
    }
}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entity")
            .field("id", &self.id)
            .field("observer", &self.observer)
            .field("network", &self.network.is_some())
            .field("live", &self.live())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_entity_has_no_previous_chunk() {
        let e = Entity::new(EntityId(1), EntityState::at(ChunkAddress::new(0, 0, 0), 4));
        assert!(e.just_spawned());
        assert_eq!(e.previous().chunk, None);
        assert_eq!(e.previous().view_distance, 4);
    }

    #[test]
    fn test_finalize_tick_rolls_state() {
        let e = Entity::new(EntityId(1), EntityState::at(ChunkAddress::new(0, 0, 0), 4));
        e.set_chunk(Some(ChunkAddress::new(1, 0, 0)));
        e.set_controller(ControllerKind(7));
        e.finalize_tick();
        assert!(!e.just_spawned());
        assert_eq!(e.previous(), e.live());
        assert_eq!(e.previous().controller, ControllerKind(7));
    }
}
