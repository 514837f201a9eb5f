//! Per-chunk visibility diff: which entities each observer must be shown,
//! hidden, or kept in sync with this tick.
//!
//! The engine is a pure function of the chunk's stable and live
//! observer/entity state plus a [`VisibilityLookup`] for data owned elsewhere.
//! It returns intents; the chunk hands them to each observer's
//! [`NetworkSync`](crate::network::NetworkSync).
//!
//! A missing observer distance counts as infinitely far, so an observer that
//! just arrived or just left compares against `i32::MAX`. Entities no longer
//! in the world are skipped.

use std::collections::BTreeMap;

use rustc_hash::{FxHashMap, FxHashSet};
use tessera_voxel::ChunkAddress;

use crate::entity::{ControllerKind, EntityId};

/// One visibility decision for one observer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum VisibilityEvent {
    /// Start showing the entity.
    Show(EntityId),
    /// Stop showing the entity.
    Hide(EntityId),
    /// Send the entity's current state.
    Sync(EntityId),
}

/// The entity data the engine compares across ticks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EntityView {
    /// Chunk at the end of the previous tick.
    pub prev_chunk: Option<ChunkAddress>,
    /// Chunk now.
    pub live_chunk: Option<ChunkAddress>,
    /// View distance at the end of the previous tick.
    pub prev_view_distance: i32,
    /// View distance now.
    pub view_distance: i32,
    /// Controller at the end of the previous tick.
    pub prev_controller: ControllerKind,
    /// Controller now.
    pub controller: ControllerKind,
    /// Spawned during this tick.
    pub just_spawned: bool,
}

/// Data the engine reads from outside the chunk.
pub trait VisibilityLookup {
    /// Entity state, or `None` for an entity no longer in the world.
    fn entity(&self, id: EntityId) -> Option<EntityView>;

    /// Whether `observer` exposes a network-sync capability.
    fn can_sync(&self, observer: EntityId) -> bool;

    /// Live distance recorded by `chunk` for `observer`.
    fn live_observer_distance(&self, chunk: ChunkAddress, observer: EntityId) -> Option<i32>;
}

/// A chunk's observer and entity state at the pre-snapshot point.
#[derive(Debug)]
pub struct ChunkVisibility<'a> {
    /// The chunk being processed.
    pub chunk: ChunkAddress,
    /// Observer distances as of the last snapshot.
    pub observers_stable: &'a FxHashMap<EntityId, i32>,
    /// Observer distances now.
    pub observers_live: &'a FxHashMap<EntityId, i32>,
    /// Observers whose distance changed since the last snapshot.
    pub changed_observers: &'a [EntityId],
    /// Entities in the chunk as of the last snapshot.
    pub entities_stable: &'a FxHashSet<EntityId>,
    /// Entities that entered or left the chunk since the last snapshot.
    pub changed_entities: &'a [EntityId],
}

/// Per-observer ordered events.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct VisibilityPlan {
    events: BTreeMap<EntityId, Vec<VisibilityEvent>>,
}

impl VisibilityPlan {
    fn push(&mut self, observer: EntityId, event: VisibilityEvent) {
        self.events.entry(observer).or_default().push(event);
    }

    /// Events for `observer`, in emission order.
    pub fn events_for(&self, observer: EntityId) -> &[VisibilityEvent] {
        self.events.get(&observer).map_or(&[], Vec::as_slice)
    }

    /// Observers with at least one event, in id order.
    pub fn iter(&self) -> impl Iterator<Item = (EntityId, &[VisibilityEvent])> {
        self.events.iter().map(|(id, events)| (*id, events.as_slice()))
    }

    /// Total number of events.
    pub fn len(&self) -> usize {
        self.events.values().map(Vec::len).sum()
    }

    /// Returns `true` if no event was emitted.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// Show/hide decision for `entity` as its distance and view distance move
/// from the old pair to the new pair.
fn crossing(
    entity: EntityId,
    (old_distance, new_distance): (i32, i32),
    view: &EntityView,
) -> Option<VisibilityEvent> {
    let was_visible = old_distance <= view.prev_view_distance;
    let is_visible = new_distance <= view.view_distance;
    match (was_visible, is_visible) {
        (true, false) => Some(VisibilityEvent::Hide(entity)),
        (false, true) => Some(VisibilityEvent::Show(entity)),
        _ => None,
    }
}

fn sorted<'a>(ids: impl Iterator<Item = &'a EntityId>) -> Vec<EntityId> {
    let mut ids: Vec<EntityId> = ids.copied().collect();
    ids.sort_unstable();
    ids
}

/// Emits sync for a visible entity, preceded by hide+show on a controller change.
fn push_sync(plan: &mut VisibilityPlan, observer: EntityId, entity: EntityId, view: &EntityView) {
    if view.prev_controller != view.controller {
        plan.push(observer, VisibilityEvent::Hide(entity));
        plan.push(observer, VisibilityEvent::Show(entity));
    }
    plan.push(observer, VisibilityEvent::Sync(entity));
}

/// Computes this tick's visibility events for one chunk.
pub fn compute_visibility(input: &ChunkVisibility<'_>, lookup: &impl VisibilityLookup) -> VisibilityPlan {
    let mut plan = VisibilityPlan::default();
    let snapshot_entities = sorted(input.entities_stable.iter());
    let mut live_observers: Vec<(EntityId, i32)> =
        input.observers_live.iter().map(|(id, d)| (*id, *d)).collect();
    live_observers.sort_unstable();

    // Observers that moved relative to this chunk, against the entities it held.
    if !snapshot_entities.is_empty() {
        for &observer in input.changed_observers {
            if !lookup.can_sync(observer) {
                continue;
            }
            let old = input.observers_stable.get(&observer).copied().unwrap_or(i32::MAX);
            let new = input.observers_live.get(&observer).copied().unwrap_or(i32::MAX);
            for &entity in &snapshot_entities {
                if entity == observer {
                    continue;
                }
                let Some(view) = lookup.entity(entity) else {
                    continue;
                };
                if let Some(event) = crossing(entity, (old, new), &view) {
                    plan.push(observer, event);
                }
            }
        }
    }

    // Entities that left this chunk or just spawned, against this chunk's observers.
    for &entity in input.changed_entities {
        let Some(view) = lookup.entity(entity) else {
            continue;
        };
        let old_chunk = if view.just_spawned { None } else { view.prev_chunk };
        if old_chunk != Some(input.chunk) && !view.just_spawned {
            continue;
        }
        for &(observer, _) in &live_observers {
            if observer == entity || !lookup.can_sync(observer) {
                continue;
            }
            let old = old_chunk
                .and_then(|c| lookup.live_observer_distance(c, observer))
                .unwrap_or(i32::MAX);
            let new = view
                .live_chunk
                .and_then(|c| lookup.live_observer_distance(c, observer))
                .unwrap_or(i32::MAX);
            if let Some(event) = crossing(entity, (old, new), &view) {
                plan.push(observer, event);
            }
        }
    }

    // Keep everything still in range in sync. Despawned entities have no
    // live chunk and only get the hide above.
    for &(observer, distance) in &live_observers {
        if !lookup.can_sync(observer) {
            continue;
        }
        for &entity in &snapshot_entities {
            if entity == observer {
                continue;
            }
            if let Some(view) = lookup.entity(entity) {
                if view.live_chunk.is_some() && distance <= view.view_distance {
                    push_sync(&mut plan, observer, entity, &view);
                }
            }
        }
        for &entity in input.changed_entities {
            if entity == observer || input.entities_stable.contains(&entity) {
                continue;
            }
            if let Some(view) = lookup.entity(entity) {
                if view.just_spawned && distance <= view.view_distance {
                    push_sync(&mut plan, observer, entity, &view);
                }
            }
        }
    }

    plan
}

#[cfg(test)]
#[path = "visibility_tests.rs"]
mod tests;
