//! The simplest possible [`SpatialIndex`]: every shape paired with every
//! other shape. Correct by construction, so it doubles as the oracle the
//! hierarchical grid is tested against, and is adequate on its own for the
//! small worlds this crate's tests use.
//!
//! Grounded on the teacher's `collision::broadphase::BruteForce`, generalized
//! from index-pairing over a flat item list to AABB-filtered pairing over
//! shape keys.

use crate::collision::{Aabb, SpatialIndex};
use crate::handle::ShapeKey;

#[derive(Default, Clone, Debug)]
pub struct BruteForce {
    shapes: Vec<(ShapeKey, Aabb)>,
}

impl SpatialIndex for BruteForce {
    fn insert(&mut self, shape: ShapeKey, aabb: Aabb) {
        self.shapes.push((shape, aabb));
    }

    fn remove(&mut self, shape: ShapeKey) {
        self.shapes.retain(|&(s, _)| s != shape);
    }

    fn rebuild(&mut self, shapes: &[(ShapeKey, Aabb)]) {
        self.shapes.clear();
        self.shapes.extend_from_slice(shapes);
    }

    fn each(&self, f: &mut dyn FnMut(ShapeKey)) {
        for &(s, _) in &self.shapes {
            f(s);
        }
    }

    fn query(&self, bb: Aabb, out: &mut Vec<ShapeKey>) {
        out.extend(
            self.shapes
                .iter()
                .filter(|(_, a)| a.intersects(&bb))
                .map(|(s, _)| *s),
        );
    }

    fn potential_pairs(&self, shape: ShapeKey, aabb: Aabb, out: &mut Vec<ShapeKey>) {
        out.extend(self.shapes.iter().filter_map(|&(s, a)| {
            if s != shape && a.intersects(&aabb) {
                Some(s)
            } else {
                None
            }
        }));
    }

    fn len(&self) -> usize {
        self.shapes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ultraviolet::DVec2;

    fn key(arena: &mut thunderdome::Arena<()>) -> ShapeKey {
        ShapeKey(arena.insert(()))
    }

    #[test]
    fn pairs_only_intersecting_shapes() {
        let mut arena = thunderdome::Arena::new();
        let a = key(&mut arena);
        let b = key(&mut arena);
        let c = key(&mut arena);

        let mut idx = BruteForce::default();
        let aabb_a = Aabb::new(DVec2::new(0.0, 0.0), DVec2::new(1.0, 1.0));
        let aabb_b = Aabb::new(DVec2::new(0.5, 0.5), DVec2::new(1.5, 1.5));
        let aabb_c = Aabb::new(DVec2::new(10.0, 10.0), DVec2::new(11.0, 11.0));
        idx.insert(a, aabb_a);
        idx.insert(b, aabb_b);
        idx.insert(c, aabb_c);

        let mut out = Vec::new();
        idx.potential_pairs(a, aabb_a, &mut out);
        assert_eq!(out, vec![b]);
    }

    #[test]
    fn remove_drops_shape_from_future_queries() {
        let mut arena = thunderdome::Arena::new();
        let a = key(&mut arena);
        let mut idx = BruteForce::default();
        let aabb = Aabb::new(DVec2::new(0.0, 0.0), DVec2::new(1.0, 1.0));
        idx.insert(a, aabb);
        idx.remove(a);
        assert_eq!(idx.len(), 0);
    }
}
