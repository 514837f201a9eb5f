//! Chunks, regions, columns and the world that ties them together.
//!
//! The [`Chunk`] is the per-chunk concurrent state container. The rest of
//! the crate is the bookkeeping it reports to ([`Region`], [`Column`],
//! [`World`]) and the collaborators it calls out to ([`Populator`],
//! [`ChunkPersistence`], [`NetworkSync`]).

pub mod chunk;
pub mod column;
pub mod entity;
pub mod error;
pub mod lifecycle;
pub mod network;
pub mod persistence;
pub mod populate;
pub mod region;
pub mod stage;
pub mod visibility;
pub mod world;

pub use chunk::{Chunk, ChunkSnapshot, Source};
pub use column::{Column, ColumnKey, NO_HEIGHT};
pub use entity::{ControllerKind, Entity, EntityId, EntityState};
pub use error::{ChunkError, PersistenceError, PopulateError};
pub use lifecycle::{SaveEvent, SaveState, SaveStateCell, transition};
pub use network::{NetworkSync, RecordingSync, dispatch};
pub use persistence::{ChunkArrays, ChunkOutput, ChunkPersistence, ChunkRecord, MemoryPersistence};
pub use populate::{LayerPopulator, Populator, ScatterPopulator, chunk_rng, derive_chunk_seed};
pub use region::{Region, RegionKey};
pub use stage::{StageClock, TickStage};
pub use visibility::{
    ChunkVisibility, EntityView, VisibilityEvent, VisibilityLookup, VisibilityPlan,
    compute_visibility,
};
pub use world::{TickHooks, TickReport, World, WorldSettings};
