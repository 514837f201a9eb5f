//! The network-sync capability observers expose.

use parking_lot::Mutex;

use crate::entity::EntityId;
use crate::visibility::VisibilityEvent;

/// Receives visibility decisions for one observer. Implementations own the
/// wire encoding; chunks only say what should happen.
pub trait NetworkSync: Send + Sync {
    /// Start showing `entity`.
    fn spawn_entity(&self, entity: EntityId);
    /// Stop showing `entity`.
    fn destroy_entity(&self, entity: EntityId);
    /// Send `entity`'s current state.
    fn sync_entity(&self, entity: EntityId);
}

/// Delivers one visibility event through the capability.
pub fn dispatch(sync: &dyn NetworkSync, event: VisibilityEvent) {
    match event {
        VisibilityEvent::Show(e) => sync.spawn_entity(e),
        VisibilityEvent::Hide(e) => sync.destroy_entity(e),
        VisibilityEvent::Sync(e) => sync.sync_entity(e),
    }
}

/// A [`NetworkSync`] that records every call in order.
#[derive(Debug, Default)]
pub struct RecordingSync {
    events: Mutex<Vec<VisibilityEvent>>,
}

impl RecordingSync {
    /// Creates an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes the recorded events.
    pub fn take(&self) -> Vec<VisibilityEvent> {
        std::mem::take(&mut *self.events.lock())
    }

    /// Number of recorded events.
    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    /// Returns `true` if nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}

impl NetworkSync for RecordingSync {
    fn spawn_entity(&self, entity: EntityId) {
        self.events.lock().push(VisibilityEvent::Show(entity));
    }

    fn destroy_entity(&self, entity: EntityId) {
        self.events.lock().push(VisibilityEvent::Hide(entity));
    }

    fn sync_entity(&self, entity: EntityId) {
        self.events.lock().push(VisibilityEvent::Sync(entity));
    }
}
