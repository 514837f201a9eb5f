//! Versioned immutable snapshot handle.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

/// Holds the current stable value behind an `Arc` and an epoch counter.
///
/// Readers clone the `Arc` and keep a consistent value for as long as they
/// hold it. [`StableCell::publish`] swaps in a new value; the write lock plus
/// the release store on the epoch give readers a happens-before edge with
/// everything the publisher wrote before the swap.
#[derive(Debug)]
pub struct StableCell<T> {
    current: RwLock<Arc<T>>,
    epoch: AtomicU64,
}

impl<T> StableCell<T> {
    /// Creates a cell holding `value` at epoch 0.
    pub fn new(value: T) -> Self {
        Self {
            current: RwLock::new(Arc::new(value)),
            epoch: AtomicU64::new(0),
        }
    }

    /// Returns a handle to the current stable value.
    pub fn load(&self) -> Arc<T> {
        Arc::clone(&self.current.read())
    }

    /// Number of values published since creation.
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    /// Replaces the stable value and returns the new epoch.
    pub fn publish(&self, value: T) -> u64 {
        let next = Arc::new(value);
        *self.current.write() = next;
        self.epoch.fetch_add(1, Ordering::AcqRel) + 1
    }
}

impl<T: Default> Default for StableCell<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_old_handle_survives_publish() {
        let cell = StableCell::new(vec![1, 2, 3]);
        let before = cell.load();
        assert_eq!(cell.publish(vec![4]), 1);
        assert_eq!(*before, vec![1, 2, 3]);
        assert_eq!(*cell.load(), vec![4]);
        assert_eq!(cell.epoch(), 1);
    }
}
