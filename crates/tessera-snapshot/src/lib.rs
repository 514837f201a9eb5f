//! Tick-consistent live/stable containers.
//!
//! Gameplay code mutates the *live* side of a container at any time. Once per
//! tick a single coordinator calls [`SnapshotManager::copy_all_snapshots`],
//! which publishes each registered container's live value as its new *stable*
//! value. Readers that need a view consistent across chunks read only the
//! stable side.

pub mod cell;
pub mod containers;
pub mod manager;

pub use cell::StableCell;
pub use containers::{MapSnapshot, SetSnapshot, SnapshotableBool, SnapshotableMap, SnapshotableSet};
pub use manager::{SnapshotError, SnapshotManager, Snapshotable};
