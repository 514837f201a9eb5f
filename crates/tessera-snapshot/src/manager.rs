//! The per-tick snapshot coordinator.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use thiserror::Error;
use tracing::error;

/// A container with a live side and a stable side.
pub trait Snapshotable: Send + Sync {
    /// Publishes the live value as the stable value and resets the live
    /// dirty list. Only [`SnapshotManager::copy_all_snapshots`] calls this.
    fn copy_snapshot(&self);
}

/// Errors from the snapshot coordinator.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotError {
    /// A copy was requested while another copy on the same manager was running.
    #[error("snapshot copy is already in progress")]
    Reentrant,
}

/// Registry of snapshotable containers, copied together once per tick.
///
/// Members are held weakly; a dropped container simply stops being copied.
#[derive(Default)]
pub struct SnapshotManager {
    members: Mutex<Vec<Weak<dyn Snapshotable>>>,
    copying: AtomicBool,
    epoch: AtomicU64,
}

/// Clears the in-progress flag even if a member panics mid-copy.
struct CopyGuard<'a>(&'a AtomicBool);

impl Drop for CopyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl SnapshotManager {
    /// Creates an empty manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a container. Each container registers itself exactly once,
    /// from its constructor.
    pub fn register<S: Snapshotable + 'static>(&self, member: &Arc<S>) {
        let weak = Arc::downgrade(member);
        let weak: Weak<dyn Snapshotable> = weak;
        self.members.lock().push(weak);
    }

    /// Number of live registered containers.
    pub fn len(&self) -> usize {
        self.members
            .lock()
            .iter()
            .filter(|m| m.strong_count() > 0)
            .count()
    }

    /// Returns `true` if no live container is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of completed copies.
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    /// Copies every registered container's live value into its stable value.
    ///
    /// Returns the new epoch.
    ///
    /// # Errors
    ///
    /// [`SnapshotError::Reentrant`] if a copy on this manager is already in
    /// progress, either from another thread or from inside a member's
    /// `copy_snapshot`. Nothing is copied in that case.
    pub fn copy_all_snapshots(&self) -> Result<u64, SnapshotError> {
        if self
            .copying
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            error!("snapshot copy re-entered while a copy was in progress");
            return Err(SnapshotError::Reentrant);
        }
        let _guard = CopyGuard(&self.copying);

        // Members may register new containers while being copied; copy from
        // a detached list so the registry lock is not held.
        let members: Vec<Arc<dyn Snapshotable>> = {
            let mut members = self.members.lock();
            members.retain(|m| m.strong_count() > 0);
            members.iter().filter_map(Weak::upgrade).collect()
        };
        for member in &members {
            member.copy_snapshot();
        }
        Ok(self.epoch.fetch_add(1, Ordering::AcqRel) + 1)
    }
}

impl std::fmt::Debug for SnapshotManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotManager")
            .field("members", &self.len())
            .field("epoch", &self.epoch())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Barrier;
    use std::sync::atomic::AtomicUsize;

    use super::*;

    #[derive(Default)]
    struct Counter(AtomicUsize);

    impl Snapshotable for Counter {
        fn copy_snapshot(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Reenter {
        manager: Arc<SnapshotManager>,
        result: Mutex<Option<Result<u64, SnapshotError>>>,
    }

    impl Snapshotable for Reenter {
        fn copy_snapshot(&self) {
            *self.result.lock() = Some(self.manager.copy_all_snapshots());
        }
    }

    #[test]
    fn test_copy_reaches_every_member_once() {
        let manager = SnapshotManager::new();
        let a = Arc::new(Counter::default());
        let b = Arc::new(Counter::default());
        manager.register(&a);
        manager.register(&b);
        assert_eq!(manager.copy_all_snapshots(), Ok(1));
        assert_eq!(a.0.load(Ordering::SeqCst), 1);
        assert_eq!(b.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_dropped_member_is_pruned() {
        let manager = SnapshotManager::new();
        let a = Arc::new(Counter::default());
        manager.register(&a);
        {
            let b = Arc::new(Counter::default());
            manager.register(&b);
        }
        assert_eq!(manager.len(), 1);
        manager.copy_all_snapshots().unwrap();
        assert_eq!(a.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_reentrant_copy_is_rejected() {
        let manager = Arc::new(SnapshotManager::new());
        let member = Arc::new(Reenter {
            manager: Arc::clone(&manager),
            result: Mutex::new(None),
        });
        manager.register(&member);

        assert_eq!(manager.copy_all_snapshots(), Ok(1));
        assert_eq!(*member.result.lock(), Some(Err(SnapshotError::Reentrant)));
        // The guard was released; the next copy proceeds normally.
        assert_eq!(manager.copy_all_snapshots(), Ok(2));
    }

    #[test]
    fn test_concurrent_copy_is_rejected() {
        struct Gate {
            entered: &'static Barrier,
            release: &'static Barrier,
        }
        impl Snapshotable for Gate {
            fn copy_snapshot(&self) {
                self.entered.wait();
                self.release.wait();
            }
        }

        static ENTERED: Barrier = Barrier::new(2);
        static RELEASE: Barrier = Barrier::new(2);
        let manager = SnapshotManager::new();
        let gate = Arc::new(Gate {
            entered: &ENTERED,
            release: &RELEASE,
        });
        manager.register(&gate);

        std::thread::scope(|scope| {
            let first = scope.spawn(|| manager.copy_all_snapshots());
            ENTERED.wait();
            assert_eq!(manager.copy_all_snapshots(), Err(SnapshotError::Reentrant));
            RELEASE.wait();
            assert_eq!(first.join().unwrap(), Ok(1));
        });
    }
}
