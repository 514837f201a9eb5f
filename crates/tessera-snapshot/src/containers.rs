//! Snapshotable bool, map and set.
//!
//! Each container keeps its live value under a short `parking_lot::Mutex`
//! together with the keys changed since the last copy. Copying clones the
//! live value into a [`StableCell`] and starts a fresh dirty list.

use std::hash::Hash;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::cell::StableCell;
use crate::manager::{SnapshotManager, Snapshotable};

/// Records `key` once per tick, in first-change order.
fn mark<K: Eq + Hash + Clone>(dirty: &mut Vec<K>, seen: &mut FxHashSet<K>, key: &K) {
    if seen.insert(key.clone()) {
        dirty.push(key.clone());
    }
}

// ---------------------------------------------------------------------------
// SnapshotableBool
// ---------------------------------------------------------------------------

/// A boolean with a live value and a stable value.
#[derive(Debug)]
pub struct SnapshotableBool {
    live: AtomicBool,
    stable: AtomicBool,
}

impl SnapshotableBool {
    /// Creates a registered boolean whose live and stable values are `initial`.
    pub fn new(manager: &SnapshotManager, initial: bool) -> Arc<Self> {
        let this = Arc::new(Self {
            live: AtomicBool::new(initial),
            stable: AtomicBool::new(initial),
        });
        manager.register(&this);
        this
    }

    /// Stable value as of the last copy.
    pub fn get(&self) -> bool {
        self.stable.load(Ordering::Acquire)
    }

    /// Current live value.
    pub fn get_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    /// Sets the live value and returns the previous live value.
    pub fn set(&self, value: bool) -> bool {
        self.live.swap(value, Ordering::AcqRel)
    }
}

impl Snapshotable for SnapshotableBool {
    fn copy_snapshot(&self) {
        self.stable.store(self.live.load(Ordering::Acquire), Ordering::Release);
    }
}

// ---------------------------------------------------------------------------
// SnapshotableMap
// ---------------------------------------------------------------------------

/// Stable view of a [`SnapshotableMap`].
#[derive(Debug, Clone)]
pub struct MapSnapshot<K, V> {
    /// Map contents at the copy.
    pub values: FxHashMap<K, V>,
    /// Keys inserted, updated or removed between the previous copy and this one.
    pub changed: Vec<K>,
}

impl<K, V> Default for MapSnapshot<K, V> {
    fn default() -> Self {
        Self {
            values: FxHashMap::default(),
            changed: Vec::new(),
        }
    }
}

#[derive(Debug)]
struct LiveMap<K, V> {
    values: FxHashMap<K, V>,
    dirty: Vec<K>,
    seen: FxHashSet<K>,
}

/// A hash map with a live side and a stable side.
#[derive(Debug)]
pub struct SnapshotableMap<K, V> {
    live: Mutex<LiveMap<K, V>>,
    stable: StableCell<MapSnapshot<K, V>>,
}

impl<K, V> SnapshotableMap<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + PartialEq + Send + Sync + 'static,
{
    /// Creates an empty registered map.
    pub fn new(manager: &SnapshotManager) -> Arc<Self> {
        let this = Arc::new(Self {
            live: Mutex::new(LiveMap {
                values: FxHashMap::default(),
                dirty: Vec::new(),
                seen: FxHashSet::default(),
            }),
            stable: StableCell::default(),
        });
        manager.register(&this);
        this
    }

    /// Inserts into the live map, returning the previous live value. The key
    /// is marked dirty only when the stored value actually changes.
    pub fn insert(&self, key: K, value: V) -> Option<V> {
        let mut live = self.live.lock();
        let live = &mut *live;
        let old = live.values.insert(key.clone(), value.clone());
        if old.as_ref() != Some(&value) {
            mark(&mut live.dirty, &mut live.seen, &key);
        }
        old
    }

    /// Removes from the live map, returning the removed live value.
    pub fn remove(&self, key: &K) -> Option<V> {
        let mut live = self.live.lock();
        let live = &mut *live;
        let old = live.values.remove(key);
        if old.is_some() {
            mark(&mut live.dirty, &mut live.seen, key);
        }
        old
    }

    /// Live value for `key`.
    pub fn get_live(&self, key: &K) -> Option<V> {
        self.live.lock().values.get(key).cloned()
    }

    /// Clone of the whole live map.
    pub fn live(&self) -> FxHashMap<K, V> {
        self.live.lock().values.clone()
    }

    /// Number of live entries.
    pub fn len_live(&self) -> usize {
        self.live.lock().values.len()
    }

    /// Returns `true` if the live map is empty.
    pub fn is_empty_live(&self) -> bool {
        self.live.lock().values.is_empty()
    }

    /// Keys changed since the last copy, in first-change order.
    pub fn dirty_keys(&self) -> Vec<K> {
        self.live.lock().dirty.clone()
    }

    /// Stable view as of the last copy.
    pub fn stable(&self) -> Arc<MapSnapshot<K, V>> {
        self.stable.load()
    }

    /// Stable value for `key`.
    pub fn get(&self, key: &K) -> Option<V> {
        self.stable.load().values.get(key).cloned()
    }
}

impl<K, V> Snapshotable for SnapshotableMap<K, V>
where
    K: Eq + Hash + Clone + Send + Sync,
    V: Clone + Send + Sync,
{
    fn copy_snapshot(&self) {
        let mut live = self.live.lock();
        let snapshot = MapSnapshot {
            values: live.values.clone(),
            changed: std::mem::take(&mut live.dirty),
        };
        live.seen.clear();
        self.stable.publish(snapshot);
    }
}

// ---------------------------------------------------------------------------
// SnapshotableSet
// ---------------------------------------------------------------------------

/// Stable view of a [`SnapshotableSet`].
#[derive(Debug, Clone)]
pub struct SetSnapshot<T> {
    /// Set contents at the copy.
    pub items: FxHashSet<T>,
    /// Items added or removed between the previous copy and this one.
    pub changed: Vec<T>,
}

impl<T> Default for SetSnapshot<T> {
    fn default() -> Self {
        Self {
            items: FxHashSet::default(),
            changed: Vec::new(),
        }
    }
}

#[derive(Debug)]
struct LiveSet<T> {
    items: FxHashSet<T>,
    dirty: Vec<T>,
    seen: FxHashSet<T>,
}

/// A hash set with a live side and a stable side.
#[derive(Debug)]
pub struct SnapshotableSet<T> {
    live: Mutex<LiveSet<T>>,
    stable: StableCell<SetSnapshot<T>>,
}

impl<T> SnapshotableSet<T>
where
    T: Eq + Hash + Clone + Send + Sync + 'static,
{
    /// Creates an empty registered set.
    pub fn new(manager: &SnapshotManager) -> Arc<Self> {
        let this = Arc::new(Self {
            live: Mutex::new(LiveSet {
                items: FxHashSet::default(),
                dirty: Vec::new(),
                seen: FxHashSet::default(),
            }),
            stable: StableCell::default(),
        });
        manager.register(&this);
        this
    }

    /// Adds to the live set. Returns `true` if the item was not present.
    pub fn add(&self, item: T) -> bool {
        let mut live = self.live.lock();
        let live = &mut *live;
        let added = live.items.insert(item.clone());
        if added {
            mark(&mut live.dirty, &mut live.seen, &item);
        }
        added
    }

    /// Removes from the live set. Returns `true` if the item was present.
    pub fn remove(&self, item: &T) -> bool {
        let mut live = self.live.lock();
        let live = &mut *live;
        let removed = live.items.remove(item);
        if removed {
            mark(&mut live.dirty, &mut live.seen, item);
        }
        removed
    }

    /// Returns `true` if the live set holds `item`.
    pub fn contains_live(&self, item: &T) -> bool {
        self.live.lock().items.contains(item)
    }

    /// Clone of the live set.
    pub fn live(&self) -> FxHashSet<T> {
        self.live.lock().items.clone()
    }

    /// Items added or removed since the last copy, in first-change order.
    pub fn dirty_list(&self) -> Vec<T> {
        self.live.lock().dirty.clone()
    }

    /// Stable view as of the last copy.
    pub fn stable(&self) -> Arc<SetSnapshot<T>> {
        self.stable.load()
    }
}

impl<T> Snapshotable for SnapshotableSet<T>
where
    T: Eq + Hash + Clone + Send + Sync,
{
    fn copy_snapshot(&self) {
        let mut live = self.live.lock();
        let snapshot = SetSnapshot {
            items: live.items.clone(),
            changed: std::mem::take(&mut live.dirty),
        };
        live.seen.clear();
        self.stable.publish(snapshot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bool_stable_lags_live_until_copy() {
        let manager = SnapshotManager::new();
        let flag = SnapshotableBool::new(&manager, false);
        flag.set(true);
        assert!(flag.get_live());
        assert!(!flag.get());
        manager.copy_all_snapshots().unwrap();
        assert!(flag.get());
    }

    #[test]
    fn test_map_stable_equals_live_after_copy() {
        let manager = SnapshotManager::new();
        let map = SnapshotableMap::new(&manager);
        map.insert(1u32, 10i32);
        map.insert(2, 20);
        manager.copy_all_snapshots().unwrap();

        let stable = map.stable();
        assert_eq!(stable.values, map.live());

        // Later live mutation leaves the published view untouched.
        map.insert(1, 99);
        map.remove(&2);
        assert_eq!(stable.values.get(&1), Some(&10));
        assert_eq!(map.get(&2), Some(20));
        assert_eq!(map.get_live(&2), None);
    }

    #[test]
    fn test_map_dirty_keys_track_changes_once() {
        let manager = SnapshotManager::new();
        let map = SnapshotableMap::new(&manager);
        map.insert("a", 1);
        map.insert("b", 2);
        map.insert("a", 3);
        assert_eq!(map.dirty_keys(), vec!["a", "b"]);

        manager.copy_all_snapshots().unwrap();
        assert!(map.dirty_keys().is_empty());
        assert_eq!(map.stable().changed, vec!["a", "b"]);

        // Re-inserting an identical value is not a change.
        map.insert("b", 2);
        assert!(map.dirty_keys().is_empty());
        map.remove(&"a");
        assert_eq!(map.dirty_keys(), vec!["a"]);
    }

    #[test]
    fn test_set_dirty_list_records_adds_and_removes() {
        let manager = SnapshotManager::new();
        let set = SnapshotableSet::new(&manager);
        assert!(set.add(5u64));
        assert!(!set.add(5));
        manager.copy_all_snapshots().unwrap();

        assert!(set.add(6));
        assert!(set.remove(&5));
        assert!(!set.remove(&7));
        assert_eq!(set.dirty_list(), vec![6, 5]);
        assert!(set.stable().items.contains(&5));
        assert!(!set.contains_live(&5));

        manager.copy_all_snapshots().unwrap();
        let stable = set.stable();
        assert_eq!(stable.items, set.live());
        assert_eq!(stable.changed, vec![6, 5]);
    }
}
