//! A hierarchical bitset grid [`SpatialIndex`], adapted from the teacher's
//! `physics::collision::hgrid::HGrid`.
//!
//! Shapes are bucketed into one of a handful of power-of-two-spaced grid
//! levels by their AABB's largest dimension, then marked present in that
//! level's column and row bitsets; a query is the bitset intersection of
//! the columns and rows it overlaps, unioned across levels. This scales
//! much better than brute force once object counts reach the thousands, at
//! the cost of being an approximate (AABB-only) prune just like brute force
//! is -- the narrowphase `Collide` step still does exact rejection.
//!
//! Differences from the teacher version: shapes are identified by the slot
//! half of their [`crate::handle::ShapeKey`] rather than a contiguous index
//! handed out by an ECS container (this crate has no such container), and
//! the grid supports true removal (clearing exactly the bits a shape's
//! last-known AABB set) rather than only full-grid rebuilds, since the
//! static index in this crate is maintained incrementally.

use crate::collision::{Aabb, SpatialIndex};
use crate::handle::ShapeKey;

#[derive(Clone, Debug)]
struct GridLevel {
    spacing: f64,
    has_objects: bool,
    column_count: usize,
    row_count: usize,
    column_bits: Vec<u64>,
    row_bits: Vec<u64>,
}

/// Parameters for constructing an [`HGrid`], mirroring the teacher's
/// `HGridParams`.
pub struct HGridParams {
    pub approx_bounds: Aabb,
    pub smallest_obj_radius: f64,
    pub largest_obj_radius: f64,
    pub expected_obj_count: usize,
}

impl HGridParams {
    /// A reasonable default for `Space::use_spatial_hash(cell_size, count)`:
    /// one grid level below `cell_size` and three above it, bounding boxes
    /// guessed generously since the grid tolerates objects larger than its
    /// bounds via toroidal wrapping.
    pub fn from_cell_size(cell_size: f64, expected_obj_count: usize) -> Self {
        HGridParams {
            approx_bounds: Aabb::new(
                ultraviolet::DVec2::new(-cell_size * 32.0, -cell_size * 32.0),
                ultraviolet::DVec2::new(cell_size * 32.0, cell_size * 32.0),
            ),
            smallest_obj_radius: (cell_size * 0.5).max(1e-6),
            largest_obj_radius: cell_size * 8.0,
            expected_obj_count,
        }
    }
}

#[derive(Clone, Debug)]
pub struct HGrid {
    bitset_size: usize,
    grids: Vec<GridLevel>,
    aabbs: Vec<Option<Aabb>>,
    levels: Vec<Option<usize>>,
    /// The live `ShapeKey` for each occupied slot id, so query results can
    /// hand back a real, generation-checked key instead of a bare slot
    /// number (see module docs).
    keys: Vec<Option<ShapeKey>>,
    live_count: usize,
}

impl HGrid {
    pub fn new(params: HGridParams) -> Self {
        let mut spacings = Vec::new();
        let mut spacing = params.smallest_obj_radius;
        while spacing < params.largest_obj_radius {
            spacings.push(spacing);
            spacing *= 2.0;
        }
        spacings.push(spacing);
        let largest_spacing = spacing;

        let bounds_w = (params.approx_bounds.max.x - params.approx_bounds.min.x)
            .max(largest_spacing);
        let bounds_h = (params.approx_bounds.max.y - params.approx_bounds.min.y)
            .max(largest_spacing);

        let bitset_size = params.expected_obj_count / 64 + 1;

        HGrid {
            bitset_size,
            grids: spacings
                .iter()
                .map(|&spacing| {
                    let column_count = ((bounds_w / spacing).round() as usize).max(1);
                    let row_count = ((bounds_h / spacing).round() as usize).max(1);
                    GridLevel {
                        spacing,
                        has_objects: false,
                        column_count,
                        row_count,
                        column_bits: vec![0; column_count * bitset_size],
                        row_bits: vec![0; row_count * bitset_size],
                    }
                })
                .collect(),
            aabbs: vec![None; params.expected_obj_count],
            levels: vec![None; params.expected_obj_count],
            keys: vec![None; params.expected_obj_count],
            live_count: 0,
        }
    }

    #[inline]
    fn id_of(shape: ShapeKey) -> usize {
        shape.index().slot() as usize
    }

    fn ensure_capacity(&mut self, id: usize) {
        if id >= self.aabbs.len() {
            self.aabbs.resize(id + 1, None);
            self.levels.resize(id + 1, None);
            self.keys.resize(id + 1, None);
        }
        let required_bitset_size = (id + 1) / 64 + 1;
        if required_bitset_size > self.bitset_size {
            self.bitset_size = required_bitset_size;
            for grid in &mut self.grids {
                grid.column_bits
                    .resize(required_bitset_size * grid.column_count, 0);
                grid.row_bits
                    .resize(required_bitset_size * grid.row_count, 0);
            }
        }
    }

    fn level_for_aabb(&self, aabb: &Aabb) -> usize {
        let size = (aabb.max.x - aabb.min.x).max(aabb.max.y - aabb.min.y);
        self.grids
            .iter()
            .position(|g| g.spacing > size)
            .unwrap_or(self.grids.len() - 1)
    }

    fn set_bits(&mut self, level: usize, aabb: &Aabb, id: usize, value: bool) {
        let bitset_size = self.bitset_size;
        let grid = &mut self.grids[level];
        if value {
            grid.has_objects = true;
        }

        let first_column = (aabb.min.x / grid.spacing).floor() as i64;
        let last_column = (aabb.max.x / grid.spacing).floor() as i64;
        for col in first_column..=last_column {
            let col = col.rem_euclid(grid.column_count as i64) as usize;
            let start = col * bitset_size;
            set_or_clear(&mut grid.column_bits[start..start + bitset_size], id, value);
        }

        let first_row = (aabb.min.y / grid.spacing).floor() as i64;
        let last_row = (aabb.max.y / grid.spacing).floor() as i64;
        for row in first_row..=last_row {
            let row = row.rem_euclid(grid.row_count as i64) as usize;
            let start = row * bitset_size;
            set_or_clear(&mut grid.row_bits[start..start + bitset_size], id, value);
        }
    }

    fn clear_id(&mut self, id: usize) {
        if let (Some(aabb), Some(level)) = (self.aabbs[id], self.levels[id]) {
            self.set_bits(level, &aabb, id, false);
        }
        self.aabbs[id] = None;
        self.levels[id] = None;
    }

    fn insert_at(&mut self, id: usize, aabb: Aabb) {
        self.ensure_capacity(id);
        let level = self.level_for_aabb(&aabb);
        self.aabbs[id] = Some(aabb);
        self.levels[id] = Some(level);
        self.set_bits(level, &aabb, id, true);
    }

    fn ids_overlapping<'a>(&'a self, aabb: &Aabb) -> impl Iterator<Item = usize> + 'a {
        let bitset_size = self.bitset_size;
        self.grids
            .iter()
            .filter(|g| g.has_objects)
            .flat_map(move |grid| {
                let col_range = ((aabb.min.x / grid.spacing).floor() as i64)
                    ..=((aabb.max.x / grid.spacing).floor() as i64);
                let row_range = ((aabb.min.y / grid.spacing).floor() as i64)
                    ..=((aabb.max.y / grid.spacing).floor() as i64);
                let column_count = grid.column_count as i64;
                let row_count = grid.row_count as i64;
                col_range.flat_map(move |col| {
                    let col = col.rem_euclid(column_count) as usize;
                    row_range.clone().flat_map(move |row| {
                        let row = row.rem_euclid(row_count) as usize;
                        let col_b = col * bitset_size;
                        let row_b = row * bitset_size;
                        BitsetIntersection(
                            &grid.column_bits[col_b..col_b + bitset_size],
                            &grid.row_bits[row_b..row_b + bitset_size],
                        )
                        .iter()
                    })
                })
            })
    }
}

impl SpatialIndex for HGrid {
    fn insert(&mut self, shape: ShapeKey, aabb: Aabb) {
        let id = Self::id_of(shape);
        self.ensure_capacity(id);
        if self.aabbs[id].is_none() {
            self.live_count += 1;
        }
        self.keys[id] = Some(shape);
        self.insert_at(id, aabb);
    }

    fn remove(&mut self, shape: ShapeKey) {
        let id = Self::id_of(shape);
        if id < self.aabbs.len() && self.aabbs[id].is_some() {
            self.clear_id(id);
            self.keys[id] = None;
            self.live_count -= 1;
        }
    }

    fn update(&mut self, shape: ShapeKey, aabb: Aabb) {
        let id = Self::id_of(shape);
        self.ensure_capacity(id);
        self.clear_id(id);
        self.keys[id] = Some(shape);
        self.live_count += 1;
        self.insert_at(id, aabb);
    }

    fn rebuild(&mut self, shapes: &[(ShapeKey, Aabb)]) {
        for grid in &mut self.grids {
            for b in &mut grid.column_bits {
                *b = 0;
            }
            for b in &mut grid.row_bits {
                *b = 0;
            }
            grid.has_objects = false;
        }
        for a in &mut self.aabbs {
            *a = None;
        }
        for l in &mut self.levels {
            *l = None;
        }
        for k in &mut self.keys {
            *k = None;
        }
        self.live_count = 0;
        for &(shape, aabb) in shapes {
            self.insert(shape, aabb);
        }
    }

    fn each(&self, f: &mut dyn FnMut(ShapeKey)) {
        for key in self.keys.iter().flatten() {
            f(*key);
        }
    }

    fn query(&self, bb: Aabb, out: &mut Vec<ShapeKey>) {
        let mut seen = std::collections::HashSet::new();
        for id in self.ids_overlapping(&bb) {
            if let Some(key) = self.keys.get(id).copied().flatten() {
                if seen.insert(id) {
                    out.push(key);
                }
            }
        }
    }

    fn potential_pairs(&self, shape: ShapeKey, aabb: Aabb, out: &mut Vec<ShapeKey>) {
        let self_id = Self::id_of(shape);
        let mut seen = std::collections::HashSet::new();
        for id in self.ids_overlapping(&aabb) {
            if id != self_id {
                if let Some(key) = self.keys.get(id).copied().flatten() {
                    if seen.insert(id) {
                        out.push(key);
                    }
                }
            }
        }
    }

    fn len(&self) -> usize {
        self.live_count
    }
}

trait IterableBitset {
    fn len(&self) -> usize;
    fn get_word(&self, idx: usize) -> u64;
}

#[derive(Clone, Copy)]
struct BitsetIntersection<'a>(&'a [u64], &'a [u64]);

impl<'a> BitsetIntersection<'a> {
    fn iter(&self) -> BitsetIter<Self> {
        BitsetIter {
            m: *self,
            word_idx: 0,
            seen_bits: 0,
        }
    }
}

impl<'a> IterableBitset for BitsetIntersection<'a> {
    fn len(&self) -> usize {
        self.0.len().min(self.1.len())
    }

    fn get_word(&self, idx: usize) -> u64 {
        self.0[idx] & self.1[idx]
    }
}

#[derive(Clone, Copy)]
struct BitsetIter<Mask: IterableBitset> {
    m: Mask,
    word_idx: usize,
    seen_bits: u64,
}

impl<Mask: IterableBitset> Iterator for BitsetIter<Mask> {
    type Item = usize;

    fn next(&mut self) -> Option<Self::Item> {
        while self.word_idx < self.m.len() {
            let unseen_bits = self.m.get_word(self.word_idx) & !self.seen_bits;
            if unseen_bits > 0 {
                let first_bit_idx = unseen_bits.trailing_zeros();
                self.seen_bits |= 1 << first_bit_idx;
                return Some(self.word_idx * 64 + first_bit_idx as usize);
            }
            self.word_idx += 1;
            self.seen_bits = 0;
        }
        None
    }
}

fn set_or_clear(words: &mut [u64], idx: usize, value: bool) {
    let word_idx = idx / 64;
    let bit_idx = idx % 64;
    if value {
        words[word_idx] |= 1_u64 << bit_idx;
    } else {
        words[word_idx] &= !(1_u64 << bit_idx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ultraviolet::DVec2;

    fn key(arena: &mut thunderdome::Arena<()>) -> ShapeKey {
        ShapeKey(arena.insert(()))
    }

    fn small_grid() -> HGrid {
        HGrid::new(HGridParams {
            approx_bounds: Aabb::new(DVec2::new(-100.0, -100.0), DVec2::new(100.0, 100.0)),
            smallest_obj_radius: 1.0,
            largest_obj_radius: 8.0,
            expected_obj_count: 16,
        })
    }

    #[test]
    fn overlapping_shapes_are_found() {
        let mut arena = thunderdome::Arena::new();
        let a = key(&mut arena);
        let b = key(&mut arena);
        let mut grid = small_grid();
        let aabb_a = Aabb::new(DVec2::new(0.0, 0.0), DVec2::new(1.0, 1.0));
        let aabb_b = Aabb::new(DVec2::new(0.5, 0.5), DVec2::new(1.5, 1.5));
        grid.insert(a, aabb_a);
        grid.insert(b, aabb_b);

        let mut out = Vec::new();
        grid.potential_pairs(a, aabb_a, &mut out);
        assert_eq!(out, vec![b]);
    }

    #[test]
    fn distant_shapes_are_not_found() {
        let mut arena = thunderdome::Arena::new();
        let a = key(&mut arena);
        let b = key(&mut arena);
        let mut grid = small_grid();
        let aabb_a = Aabb::new(DVec2::new(0.0, 0.0), DVec2::new(1.0, 1.0));
        let aabb_b = Aabb::new(DVec2::new(50.0, 50.0), DVec2::new(51.0, 51.0));
        grid.insert(a, aabb_a);
        grid.insert(b, aabb_b);

        let mut out = Vec::new();
        grid.potential_pairs(a, aabb_a, &mut out);
        assert!(out.is_empty());
    }

    #[test]
    fn remove_clears_bits_so_shape_is_no_longer_found() {
        let mut arena = thunderdome::Arena::new();
        let a = key(&mut arena);
        let b = key(&mut arena);
        let mut grid = small_grid();
        let aabb = Aabb::new(DVec2::new(0.0, 0.0), DVec2::new(1.0, 1.0));
        grid.insert(a, aabb);
        grid.insert(b, aabb);
        grid.remove(b);

        let mut out = Vec::new();
        grid.potential_pairs(a, aabb, &mut out);
        assert!(out.is_empty());
        assert_eq!(grid.len(), 1);
    }

    #[test]
    fn bitset_intersection_finds_common_bits() {
        let mut m1 = vec![0u64; 3];
        let mut m2 = vec![0u64; 3];
        set_or_clear(&mut m1, 5, true);
        set_or_clear(&mut m1, 130, true);
        set_or_clear(&mut m2, 5, true);
        set_or_clear(&mut m2, 7, true);
        let got: Vec<_> = BitsetIntersection(&m1, &m2).iter().collect();
        assert_eq!(got, vec![5]);
    }
}
