//! Chunk-local voxel storage: addressing, the material registry, and the
//! lock-free block store.

pub mod address;
pub mod block_store;
pub mod registry;

pub use address::{
    CHUNK_MASK, CHUNK_SIZE, CHUNK_SIZE_BITS, CHUNK_VOLUME, ChunkAddress, local_coords,
    local_index,
};
pub use block_store::{BlockFullState, BlockStore, BlockStoreError, PALETTE_CAPACITY};
pub use registry::{MAX_LIGHT_LEVEL, MaterialDef, MaterialId, MaterialRegistry, RegistryError};
