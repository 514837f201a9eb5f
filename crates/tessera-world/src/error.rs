//! Error types for chunk, population and persistence operations.

use tessera_lighting::LightError;
use tessera_snapshot::SnapshotError;
use tessera_voxel::{BlockStoreError, ChunkAddress};
use thiserror::Error;

use crate::entity::EntityId;
use crate::stage::TickStage;

/// Errors returned by chunk operations.
#[derive(Debug, Error)]
pub enum ChunkError {
    /// The chunk reached its terminal unloaded state.
    #[error("chunk {0:?} has been unloaded")]
    Unloaded(ChunkAddress),
    /// A mutation was issued without an attribution source.
    #[error("mutation requires a source")]
    MissingSource,
    /// A light update requested neither sky nor block light.
    #[error("light update requested for neither sky nor block light")]
    NoLightKind,
    /// The entity does not carry the observer capability.
    #[error("entity {0} is not an observer")]
    NotObserver(EntityId),
    /// The operation is only legal in another tick stage.
    #[error("operation requires tick stage {expected:?}, current stage is {actual:?}")]
    WrongStage {
        /// Stage the operation requires.
        expected: TickStage,
        /// Stage the world is in.
        actual: TickStage,
    },
    /// The chunk was deregistered from its column twice.
    #[error("chunk {0:?} deregistered from its column more than once")]
    AlreadyDeregistered(ChunkAddress),
    /// Snapshot copy failed.
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
    /// Block store rejected a write after widening.
    #[error(transparent)]
    Store(#[from] BlockStoreError),
    /// Persistence backend failed.
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

impl From<LightError> for ChunkError {
    fn from(err: LightError) -> Self {
        match err {
            LightError::NoLightKind => ChunkError::NoLightKind,
        }
    }
}

/// Errors reported by a populator.
#[derive(Debug, Error)]
pub enum PopulateError {
    /// The populator returned an error.
    #[error("populator failed: {0}")]
    Failed(String),
    /// The populator panicked.
    #[error("populator panicked: {0}")]
    Panicked(String),
}

/// Errors reported by a persistence backend.
#[derive(Debug, Error)]
pub enum PersistenceError {
    /// Underlying I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// The backend refused the data.
    #[error("persistence rejected chunk {address:?}: {reason}")]
    Rejected {
        /// Chunk being written.
        address: ChunkAddress,
        /// Backend's explanation.
        reason: String,
    },
}
