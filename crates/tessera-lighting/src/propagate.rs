//! Sky light column recalculation and block light flood fill.
//!
//! Sky light is recomputed one (x, z) column at a time, top to bottom.
//! Block light is recomputed for the whole chunk by a breadth-first flood
//! fill from every emissive cell, losing `1 + opacity` levels per step.

use std::collections::VecDeque;

use tessera_voxel::{CHUNK_SIZE, CHUNK_VOLUME, MAX_LIGHT_LEVEL, local_coords};

use crate::nibble::NibbleArray;

/// What the light passes need to know about the chunk and its surroundings.
///
/// In-chunk coordinates are local (`0..16`). Coordinates handed to
/// [`LightNeighborhood::outside_sky_light`] are relative to the same origin
/// and lie outside the chunk on at least one axis.
pub trait LightNeighborhood {
    /// Opacity of the material at a local cell.
    fn opacity(&self, x: i32, y: i32, z: i32) -> u8;

    /// Light emission of the material at a local cell.
    fn emission(&self, x: i32, y: i32, z: i32) -> u8;

    /// Sky light of a cell in a neighboring chunk, or `None` if that chunk is
    /// not loaded.
    fn outside_sky_light(&self, x: i32, y: i32, z: i32) -> Option<u8>;
}

const HORIZONTAL_4: [(i32, i32); 4] = [(1, 0), (-1, 0), (0, 1), (0, -1)];

const NEIGHBORS_6: [(i32, i32, i32); 6] = [
    (1, 0, 0),
    (-1, 0, 0),
    (0, 1, 0),
    (0, -1, 0),
    (0, 0, 1),
    (0, 0, -1),
];

fn in_bounds(x: i32, y: i32, z: i32) -> bool {
    let s = CHUNK_SIZE as i32;
    (0..s).contains(&x) && (0..s).contains(&y) && (0..s).contains(&z)
}

fn sky_brightness(sky: &NibbleArray, around: &impl LightNeighborhood, x: i32, y: i32, z: i32) -> u8 {
    if in_bounds(x, y, z) {
        sky.get(x, y, z)
    } else {
        around.outside_sky_light(x, y, z).unwrap_or(0)
    }
}

/// Recomputes sky light for the local column `(x, z)` and returns the value
/// written to its bottom cell.
///
/// `entering` is the sky light arriving through the top face: the bottom-row
/// reading of the chunk above, or full brightness when there is none. Going
/// down, a value below full brightness is first raised to one less than the
/// brightest horizontal neighbor, then reduced by the cell's opacity.
pub fn recalculate_sky_column(
    sky: &NibbleArray,
    x: i32,
    z: i32,
    entering: u8,
    around: &impl LightNeighborhood,
) -> u8 {
    let mut value = entering.min(MAX_LIGHT_LEVEL);
    for y in (0..CHUNK_SIZE as i32).rev() {
        if value < MAX_LIGHT_LEVEL {
            for (dx, dz) in HORIZONTAL_4 {
                let neighbor = sky_brightness(sky, around, x + dx, y, z + dz);
                value = value.max(neighbor.saturating_sub(1));
            }
        }
        if value > 0 {
            value = value.saturating_sub(around.opacity(x, y, z));
        }
        sky.set(x, y, z, value);
    }
    value
}

/// Clears and recomputes all block light in the chunk. Returns the number of
/// lit cells.
///
/// Every emissive cell starts at its emission level. Light then spreads to
/// the six face neighbors, losing one level plus the neighbor's opacity per
/// step; fully opaque cells receive no light.
pub fn recalculate_block_light(block: &NibbleArray, around: &impl LightNeighborhood) -> usize {
    block.fill(0);
    let mut queue = VecDeque::new();

    for index in 0..CHUNK_VOLUME {
        let (x, y, z) = local_coords(index);
        let emission = around.emission(x, y, z).min(MAX_LIGHT_LEVEL);
        if emission > 0 {
            block.set_index(index, emission);
            queue.push_back((x, y, z));
        }
    }

    while let Some((x, y, z)) = queue.pop_front() {
        let current = block.get(x, y, z);
        if current <= 1 {
            continue;
        }
        for (dx, dy, dz) in NEIGHBORS_6 {
            let (nx, ny, nz) = (x + dx, y + dy, z + dz);
            if !in_bounds(nx, ny, nz) {
                continue;
            }
            let opacity = around.opacity(nx, ny, nz);
            if opacity >= MAX_LIGHT_LEVEL {
                continue;
            }
            let decay = 1 + opacity;
            if current <= decay {
                continue;
            }
            let level = current - decay;
            if block.get(nx, ny, nz) >= level {
                continue;
            }
            block.set(nx, ny, nz, level);
            queue.push_back((nx, ny, nz));
        }
    }

    (0..CHUNK_VOLUME).filter(|&i| block.get_index(i) > 0).count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_voxel::local_index;

    /// Opacity and emission per cell, with a fixed sky value outside.
    struct TestChunk {
        opacity: Vec<u8>,
        emission: Vec<u8>,
        outside: Option<u8>,
    }

    impl TestChunk {
        fn open() -> Self {
            Self {
                opacity: vec![0; CHUNK_VOLUME],
                emission: vec![0; CHUNK_VOLUME],
                outside: None,
            }
        }

        fn with_opaque(mut self, x: i32, y: i32, z: i32) -> Self {
            self.opacity[local_index(x, y, z)] = MAX_LIGHT_LEVEL;
            self
        }

        fn with_emitter(mut self, x: i32, y: i32, z: i32, level: u8) -> Self {
            self.emission[local_index(x, y, z)] = level;
            self
        }
    }

    impl LightNeighborhood for TestChunk {
        fn opacity(&self, x: i32, y: i32, z: i32) -> u8 {
            self.opacity[local_index(x, y, z)]
        }

        fn emission(&self, x: i32, y: i32, z: i32) -> u8 {
            self.emission[local_index(x, y, z)]
        }

        fn outside_sky_light(&self, _x: i32, _y: i32, _z: i32) -> Option<u8> {
            self.outside
        }
    }

    fn relight_all(sky: &NibbleArray, chunk: &TestChunk) {
        for x in 0..CHUNK_SIZE as i32 {
            for z in 0..CHUNK_SIZE as i32 {
                recalculate_sky_column(sky, x, z, MAX_LIGHT_LEVEL, chunk);
            }
        }
    }

    #[test]
    fn test_open_sky_lights_every_cell() {
        let chunk = TestChunk::open();
        let sky = NibbleArray::new();
        relight_all(&sky, &chunk);
        assert!((0..CHUNK_VOLUME).all(|i| sky.get_index(i) == MAX_LIGHT_LEVEL));
    }

    #[test]
    fn test_opaque_block_darkens_column_below() {
        let chunk = TestChunk::open().with_opaque(4, 9, 6);
        let sky = NibbleArray::new();
        let bottom = recalculate_sky_column(&sky, 4, 6, MAX_LIGHT_LEVEL, &chunk);
        assert_eq!(bottom, 0);
        for y in 10..16 {
            assert_eq!(sky.get(4, y, 6), MAX_LIGHT_LEVEL, "y={y}");
        }
        for y in 0..=9 {
            assert_eq!(sky.get(4, y, 6), 0, "y={y}");
        }
    }

    #[test]
    fn test_shadow_is_filled_from_lit_neighbors() {
        let chunk = TestChunk::open().with_opaque(4, 9, 6);
        let sky = NibbleArray::new();
        relight_all(&sky, &chunk);
        // Recalculate the shaded column now that its neighbors are lit.
        recalculate_sky_column(&sky, 4, 6, MAX_LIGHT_LEVEL, &chunk);
        assert_eq!(sky.get(4, 9, 6), 0);
        assert_eq!(sky.get(4, 8, 6), MAX_LIGHT_LEVEL - 1);
    }

    #[test]
    fn test_entering_light_seeds_column() {
        let chunk = TestChunk::open();
        let sky = NibbleArray::new();
        let bottom = recalculate_sky_column(&sky, 0, 0, 6, &chunk);
        assert_eq!(bottom, 6);
        assert_eq!(sky.get(0, 15, 0), 6);
    }

    #[test]
    fn test_outside_neighbor_spreads_into_edge_column() {
        let mut chunk = TestChunk::open();
        chunk.outside = Some(12);
        let sky = NibbleArray::new();
        let bottom = recalculate_sky_column(&sky, 0, 0, 0, &chunk);
        assert_eq!(bottom, 11);
    }

    #[test]
    fn test_block_light_decays_with_distance() {
        let chunk = TestChunk::open().with_emitter(8, 8, 8, 14);
        let block = NibbleArray::new();
        let lit = recalculate_block_light(&block, &chunk);
        assert!(lit > 0);
        assert_eq!(block.get(8, 8, 8), 14);
        assert_eq!(block.get(9, 8, 8), 13);
        assert_eq!(block.get(12, 8, 8), 10);
        assert_eq!(block.get(8, 8, 0), 6);
    }

    #[test]
    fn test_opaque_block_stops_block_light() {
        let mut chunk = TestChunk::open().with_emitter(0, 0, 0, 15);
        for (x, y, z) in [(1, 0, 0), (0, 1, 0), (0, 0, 1)] {
            chunk = chunk.with_opaque(x, y, z);
        }
        let block = NibbleArray::new();
        assert_eq!(recalculate_block_light(&block, &chunk), 1);
        assert_eq!(block.get(1, 0, 0), 0);
        assert_eq!(block.get(1, 1, 0), 0);
    }

    #[test]
    fn test_removed_emitter_goes_dark_on_recalculation() {
        let block = NibbleArray::new();
        recalculate_block_light(&block, &TestChunk::open().with_emitter(3, 3, 3, 15));
        assert_eq!(block.get(4, 3, 3), 14);
        assert_eq!(recalculate_block_light(&block, &TestChunk::open()), 0);
        assert_eq!(block.get(4, 3, 3), 0);
    }
}
