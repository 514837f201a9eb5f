//! Packed chunk light storage, the per-column light queue, and the sky and
//! block light recalculation passes.

pub mod nibble;
pub mod propagate;
pub mod queue;

pub use nibble::{LIGHT_ARRAY_LEN, NibbleArray};
pub use propagate::{LightNeighborhood, recalculate_block_light, recalculate_sky_column};
pub use queue::{LightError, LightKinds, LightQueue, pack_column, unpack_column};
