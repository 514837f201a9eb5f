//! Save/unload lifecycle lattice.
//!
//! Requests merge into one of five states through the pure [`transition`]
//! table; [`SaveStateCell`] applies it with a compare-and-swap retry loop so
//! concurrent requests never overwrite each other.

use std::sync::atomic::{AtomicU8, Ordering};

/// Pending persistence intent of a chunk.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SaveState {
    /// Nothing pending.
    None = 0,
    /// Save requested.
    Save = 1,
    /// Unload requested without saving.
    Unload = 2,
    /// Unload and save requested.
    UnloadSave = 3,
    /// Terminal: the chunk has been released.
    Unloaded = 4,
}

impl SaveState {
    /// Whether the state asks for persistence.
    pub fn is_save(self) -> bool {
        matches!(self, SaveState::Save | SaveState::UnloadSave)
    }

    /// Whether the state asks for the chunk to be freed.
    pub fn is_unload(self) -> bool {
        matches!(self, SaveState::Unload | SaveState::UnloadSave)
    }

    fn from_u8(raw: u8) -> SaveState {
        match raw {
            0 => SaveState::None,
            1 => SaveState::Save,
            2 => SaveState::Unload,
            3 => SaveState::UnloadSave,
            _ => SaveState::Unloaded,
        }
    }
}

/// Inputs to the lattice.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SaveEvent {
    /// Persist at the next maintenance pass.
    Save,
    /// Free at the next maintenance pass, optionally persisting first.
    Unload {
        /// Also persist.
        save: bool,
    },
    /// The owner consumed the pending intent.
    Consume,
    /// The chunk was released.
    Release,
}

/// The lattice merge: `(state, event) -> state`.
pub fn transition(state: SaveState, event: SaveEvent) -> SaveState {
    use SaveState::*;
    match (state, event) {
        (Unloaded, _) => Unloaded,
        (_, SaveEvent::Release) => Unloaded,
        (_, SaveEvent::Consume) => None,
        (None, SaveEvent::Save) => Save,
        (Save, SaveEvent::Save) => Save,
        (Unload | UnloadSave, SaveEvent::Save) => UnloadSave,
        (None | Unload, SaveEvent::Unload { save: false }) => Unload,
        (None | Unload, SaveEvent::Unload { save: true }) => UnloadSave,
        (Save | UnloadSave, SaveEvent::Unload { .. }) => UnloadSave,
    }
}

/// Atomic [`SaveState`] driven by [`transition`].
#[derive(Debug)]
pub struct SaveStateCell(AtomicU8);

impl SaveStateCell {
    /// Starts in [`SaveState::None`].
    pub fn new() -> Self {
        Self(AtomicU8::new(SaveState::None as u8))
    }

    /// Current state.
    pub fn get(&self) -> SaveState {
        SaveState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Applies `event`, retrying until the swap lands. Returns `(old, new)`.
    pub fn apply(&self, event: SaveEvent) -> (SaveState, SaveState) {
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            let old = SaveState::from_u8(current);
            let new = transition(old, event);
            match self.0.compare_exchange_weak(
                current,
                new as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return (old, new),
                Err(actual) => current = actual,
            }
        }
    }

    /// Merges a save request; returns the resulting state.
    pub fn request_save(&self) -> SaveState {
        self.apply(SaveEvent::Save).1
    }

    /// Merges an unload request; returns the resulting state.
    pub fn request_unload(&self, save: bool) -> SaveState {
        self.apply(SaveEvent::Unload { save }).1
    }

    /// Returns the pending state and resets it to [`SaveState::None`]
    /// (or leaves [`SaveState::Unloaded`] in place).
    pub fn consume_and_reset(&self) -> SaveState {
        self.apply(SaveEvent::Consume).0
    }

    /// Moves to the terminal state; returns the state it replaced.
    pub fn mark_unloaded(&self) -> SaveState {
        self.apply(SaveEvent::Release).0
    }

    /// Whether the terminal state has been reached.
    pub fn is_unloaded(&self) -> bool {
        self.get() == SaveState::Unloaded
    }
}

impl Default for SaveStateCell {
    fn default() -> Self {
        Self::new()
    }
}
