//! Lock-free block storage for a 16×16×16 chunk.
//!
//! Every cell holds a [`BlockFullState`] (16-bit material id, 16-bit data).
//! The store uses one of two representations:
//!
//! - **Narrow**: one `AtomicU8` palette index per cell plus an append-only
//!   palette of up to [`PALETTE_CAPACITY`] full states. Palette slots are
//!   published before any cell points at them and are never rewritten, so a
//!   cell index always resolves to the state it was written with.
//! - **Wide**: one `AtomicU32` packed full state per cell.
//!
//! Reads, writes and single-cell compare-and-set are atomics on `&self` in
//! both representations. Switching representation ([`BlockStore::widen`],
//! [`BlockStore::compress`]) needs `&mut self`; the owner serializes those
//! with its own guard.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU16, AtomicU32, AtomicU64, AtomicUsize, Ordering};

use dashmap::DashMap;
use rustc_hash::{FxBuildHasher, FxHashMap};
use thiserror::Error;

use crate::address::{CHUNK_VOLUME, local_coords, local_index};
use crate::registry::MaterialId;

/// Maximum number of palette entries in the narrow representation.
pub const PALETTE_CAPACITY: usize = 256;

/// Set on a palette slot once its state has been published.
const SLOT_PUBLISHED: u64 = 1 << 32;

/// A material id plus its 16-bit auxiliary data.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct BlockFullState {
    /// Material stored in the cell.
    pub id: MaterialId,
    /// Per-cell data value.
    pub data: u16,
}

impl BlockFullState {
    /// Air with zero data.
    pub const AIR: BlockFullState = BlockFullState {
        id: MaterialId::AIR,
        data: 0,
    };

    /// Creates a full state.
    pub fn new(id: MaterialId, data: u16) -> Self {
        Self { id, data }
    }

    /// Packs into `id << 16 | data`.
    #[inline]
    pub fn pack(self) -> u32 {
        (u32::from(self.id.0) << 16) | u32::from(self.data)
    }

    /// Inverse of [`BlockFullState::pack`].
    #[inline]
    pub fn unpack(packed: u32) -> Self {
        Self {
            id: MaterialId((packed >> 16) as u16),
            data: packed as u16,
        }
    }
}

/// Errors raised by cell writes.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum BlockStoreError {
    /// The narrow palette has no room for another state.
    #[error("narrow palette is full ({PALETTE_CAPACITY} entries); widen the store and retry")]
    PaletteFull,
}

/// Append-only palette of published full states.
struct Palette {
    slots: Box<[AtomicU64]>,
    len: AtomicUsize,
}

impl Palette {
    fn with_states(states: &[BlockFullState]) -> Self {
        debug_assert!(states.len() <= PALETTE_CAPACITY);
        let slots: Box<[AtomicU64]> = (0..PALETTE_CAPACITY)
            .map(|i| {
                AtomicU64::new(
                    states
                        .get(i)
                        .map_or(0, |s| SLOT_PUBLISHED | u64::from(s.pack())),
                )
            })
            .collect();
        Self {
            slots,
            len: AtomicUsize::new(states.len()),
        }
    }

    #[inline]
    fn state(&self, index: u8) -> BlockFullState {
        BlockFullState::unpack(self.slots[index as usize].load(Ordering::Acquire) as u32)
    }

    fn len(&self) -> usize {
        self.len.load(Ordering::Acquire).min(PALETTE_CAPACITY)
    }

    /// Returns the index of `state`, publishing a new slot if needed.
    ///
    /// Two racing writers may both publish the same state; duplicates are
    /// harmless and removed by compression.
    fn index_of_or_insert(&self, state: BlockFullState) -> Result<u8, BlockStoreError> {
        let wanted = SLOT_PUBLISHED | u64::from(state.pack());
        let known = self.len();
        if let Some(i) = (0..known).find(|&i| self.slots[i].load(Ordering::Acquire) == wanted) {
            return Ok(i as u8);
        }
        let slot = self
            .len
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |len| {
                (len < PALETTE_CAPACITY).then_some(len + 1)
            })
            .map_err(|_| BlockStoreError::PaletteFull)?;
        self.slots[slot].store(wanted, Ordering::Release);
        Ok(slot as u8)
    }
}

enum Cells {
    Narrow {
        palette: Palette,
        indices: Box<[AtomicU8]>,
    },
    Wide(Box<[AtomicU32]>),
}

/// Bounded list of cells changed since the last reset.
struct DirtyList {
    cells: Box<[AtomicU16]>,
    len: AtomicUsize,
    overflow: AtomicBool,
}

impl DirtyList {
    fn new(capacity: usize) -> Self {
        Self {
            cells: (0..capacity).map(|_| AtomicU16::new(0)).collect(),
            len: AtomicUsize::new(0),
            overflow: AtomicBool::new(false),
        }
    }

    fn mark(&self, index: usize) {
        let slot = self.len.fetch_add(1, Ordering::AcqRel);
        match self.cells.get(slot) {
            Some(cell) => cell.store(index as u16, Ordering::Release),
            None => self.overflow.store(true, Ordering::Release),
        }
    }
}

/// Atomic per-cell block storage with dirty tracking and an auxiliary
/// overflow map for cells carrying extended data.
pub struct BlockStore {
    cells: Cells,
    /// Extended per-cell payloads, keyed by linear cell index.
    aux: DashMap<u16, Arc<[u8]>, FxBuildHasher>,
    dirty: DirtyList,
    /// Distinct-state count at or below which compression picks the narrow form.
    palette_threshold: usize,
}

impl BlockStore {
    /// Creates an all-air store.
    pub fn new(dirty_capacity: usize, palette_threshold: usize) -> Self {
        Self {
            cells: Cells::Narrow {
                palette: Palette::with_states(&[BlockFullState::AIR]),
                indices: (0..CHUNK_VOLUME).map(|_| AtomicU8::new(0)).collect(),
            },
            aux: DashMap::default(),
            dirty: DirtyList::new(dirty_capacity),
            palette_threshold: palette_threshold.clamp(1, PALETTE_CAPACITY),
        }
    }

    /// Restores a store from persisted id/data arrays in linear-index order.
    ///
    /// Missing or short arrays are padded with zero (air / no data).
    pub fn from_arrays(
        ids: &[u16],
        data: Option<&[u16]>,
        dirty_capacity: usize,
        palette_threshold: usize,
    ) -> Self {
        let states: Vec<BlockFullState> = (0..CHUNK_VOLUME)
            .map(|i| {
                let id = ids.get(i).copied().unwrap_or(0);
                let d = data.and_then(|d| d.get(i).copied()).unwrap_or(0);
                BlockFullState::new(MaterialId(id), d)
            })
            .collect();
        let mut store = Self::new(dirty_capacity, palette_threshold);
        store.cells = Self::build_cells(&states, store.palette_threshold);
        store
    }

    /// Returns the full state at the masked position.
    #[inline]
    pub fn get_full_data(&self, x: i32, y: i32, z: i32) -> BlockFullState {
        self.state_at(local_index(x, y, z))
    }

    /// Returns the material id at the masked position.
    #[inline]
    pub fn get_material_id(&self, x: i32, y: i32, z: i32) -> MaterialId {
        self.get_full_data(x, y, z).id
    }

    /// Returns the data value at the masked position.
    #[inline]
    pub fn get_data(&self, x: i32, y: i32, z: i32) -> u16 {
        self.get_full_data(x, y, z).data
    }

    /// Unconditionally overwrites a cell and returns the previous state.
    ///
    /// Any auxiliary payload on the cell is dropped.
    ///
    /// # Errors
    ///
    /// [`BlockStoreError::PaletteFull`] when the narrow palette cannot take a
    /// new state; nothing is written in that case.
    pub fn set_block(
        &self,
        x: i32,
        y: i32,
        z: i32,
        state: BlockFullState,
    ) -> Result<BlockFullState, BlockStoreError> {
        let index = local_index(x, y, z);
        let old = match &self.cells {
            Cells::Narrow { palette, indices } => {
                let slot = palette.index_of_or_insert(state)?;
                palette.state(indices[index].swap(slot, Ordering::AcqRel))
            }
            Cells::Wide(cells) => {
                BlockFullState::unpack(cells[index].swap(state.pack(), Ordering::AcqRel))
            }
        };
        self.aux.remove(&(index as u16));
        self.dirty.mark(index);
        Ok(old)
    }

    /// Atomically replaces `expect` with `new` in one cell.
    ///
    /// Returns `Ok(false)` without writing when the cell does not hold `expect`.
    ///
    /// # Errors
    ///
    /// [`BlockStoreError::PaletteFull`] as for [`BlockStore::set_block`].
    pub fn compare_and_set_block(
        &self,
        x: i32,
        y: i32,
        z: i32,
        expect: BlockFullState,
        new: BlockFullState,
    ) -> Result<bool, BlockStoreError> {
        let index = local_index(x, y, z);
        let swapped = match &self.cells {
            Cells::Wide(cells) => cells[index]
                .compare_exchange(expect.pack(), new.pack(), Ordering::AcqRel, Ordering::Acquire)
                .is_ok(),
            Cells::Narrow { palette, indices } => loop {
                let current = indices[index].load(Ordering::Acquire);
                if palette.state(current) != expect {
                    break false;
                }
                let slot = palette.index_of_or_insert(new)?;
                // A lost race may leave the cell at a duplicate slot with the
                // same state, so re-check the state rather than giving up.
                if indices[index]
                    .compare_exchange(current, slot, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    break true;
                }
            },
        };
        if swapped {
            self.dirty.mark(index);
        }
        Ok(swapped)
    }

    /// Attaches an extended payload to a cell.
    pub fn set_aux(&self, x: i32, y: i32, z: i32, payload: Arc<[u8]>) {
        self.aux.insert(local_index(x, y, z) as u16, payload);
    }

    /// Returns the extended payload of a cell, if any.
    pub fn aux(&self, x: i32, y: i32, z: i32) -> Option<Arc<[u8]>> {
        self.aux
            .get(&(local_index(x, y, z) as u16))
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Number of cells carrying an extended payload.
    pub fn aux_len(&self) -> usize {
        self.aux.len()
    }

    /// Returns `true` while the narrow palette representation is in use.
    pub fn is_narrow(&self) -> bool {
        matches!(self.cells, Cells::Narrow { .. })
    }

    /// Bits stored per cell by the current representation.
    pub fn bits_per_cell(&self) -> u8 {
        match self.cells {
            Cells::Narrow { .. } => 8,
            Cells::Wide(_) => 32,
        }
    }

    /// Switches to the wide representation. No-op if already wide.
    pub fn widen(&mut self) {
        if self.is_narrow() {
            let states = self.states();
            self.cells = Cells::Wide(states.iter().map(|s| AtomicU32::new(s.pack())).collect());
            tracing::trace!("block store widened to 32 bits per cell");
        }
    }

    /// Returns `true` when [`BlockStore::compress`] would reclaim memory:
    /// a wide store whose distinct states fit the palette threshold, or a
    /// narrow store whose palette holds stale or duplicate entries.
    pub fn needs_compression(&self) -> bool {
        let distinct = self.distinct_states();
        match &self.cells {
            Cells::Wide(_) => distinct <= self.palette_threshold,
            Cells::Narrow { palette, .. } => palette.len() > distinct,
        }
    }

    /// Rebuilds the store in its smallest representation.
    ///
    /// Returns whether compression happened. Never changes any value
    /// observable through [`BlockStore::get_full_data`].
    pub fn compress(&mut self) -> bool {
        if !self.needs_compression() {
            return false;
        }
        let states = self.states();
        let before = self.bits_per_cell();
        self.cells = Self::build_cells(&states, self.palette_threshold);
        self.aux.shrink_to_fit();
        tracing::debug!(
            from_bits = before,
            to_bits = self.bits_per_cell(),
            "block store compressed"
        );
        true
    }

    /// Returns `true` if any cell changed since the last reset.
    pub fn is_dirty(&self) -> bool {
        self.dirty.len.load(Ordering::Acquire) > 0
    }

    /// Returns `true` if more cells changed than the dirty list can hold.
    pub fn is_dirty_overflow(&self) -> bool {
        self.dirty.overflow.load(Ordering::Acquire)
    }

    /// Number of entries readable through [`BlockStore::dirty_block`].
    pub fn dirty_len(&self) -> usize {
        self.dirty.len.load(Ordering::Acquire).min(self.dirty.cells.len())
    }

    /// Local coordinates of the `i`-th dirty cell.
    pub fn dirty_block(&self, i: usize) -> Option<(i32, i32, i32)> {
        if i >= self.dirty_len() {
            return None;
        }
        let index = self.dirty.cells[i].load(Ordering::Acquire);
        Some(local_coords(index as usize))
    }

    /// Clears the dirty list and overflow flag for the next tick.
    pub fn reset_dirty_arrays(&self) {
        self.dirty.len.store(0, Ordering::Release);
        self.dirty.overflow.store(false, Ordering::Release);
    }

    /// Material ids of every cell in linear-index order.
    pub fn get_block_id_array(&self) -> Vec<u16> {
        self.states().iter().map(|s| s.id.0).collect()
    }

    /// Data values of every cell in linear-index order.
    pub fn get_data_array(&self) -> Vec<u16> {
        self.states().iter().map(|s| s.data).collect()
    }

    /// Material ids and data values from a single pass, so each cell's pair
    /// comes from one committed write.
    pub fn get_block_arrays(&self) -> (Vec<u16>, Vec<u16>) {
        self.states().iter().map(|s| (s.id.0, s.data)).unzip()
    }

    #[inline]
    fn state_at(&self, index: usize) -> BlockFullState {
        match &self.cells {
            Cells::Narrow { palette, indices } => {
                palette.state(indices[index].load(Ordering::Acquire))
            }
            Cells::Wide(cells) => BlockFullState::unpack(cells[index].load(Ordering::Acquire)),
        }
    }

    fn states(&self) -> Vec<BlockFullState> {
        (0..CHUNK_VOLUME).map(|i| self.state_at(i)).collect()
    }

    fn distinct_states(&self) -> usize {
        let mut seen = FxHashMap::default();
        for state in self.states() {
            seen.insert(state.pack(), ());
        }
        seen.len()
    }

    fn build_cells(states: &[BlockFullState], threshold: usize) -> Cells {
        let mut order: Vec<BlockFullState> = Vec::new();
        let mut slot_of: FxHashMap<u32, u8> = FxHashMap::default();
        for state in states {
            if slot_of.contains_key(&state.pack()) {
                continue;
            }
            if order.len() >= threshold {
                return Cells::Wide(states.iter().map(|s| AtomicU32::new(s.pack())).collect());
            }
            slot_of.insert(state.pack(), order.len() as u8);
            order.push(*state);
        }
        Cells::Narrow {
            palette: Palette::with_states(&order),
            indices: states
                .iter()
                .map(|s| AtomicU8::new(slot_of[&s.pack()]))
                .collect(),
        }
    }
}
