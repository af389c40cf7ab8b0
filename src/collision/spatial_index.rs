//! The generic broadphase collaborator interface (§4.4).
//!
//! The core only ever talks to a spatial index through this trait: two
//! implementations ship with the crate ([`super::BruteForce`] and
//! [`super::HGrid`]), and either can stand in for both the dynamic and the
//! static index, swapped together atomically by
//! [`crate::Space::use_spatial_hash`].

use crate::collision::Aabb;
use crate::handle::ShapeKey;

/// A spatial index over shapes identified by their cached AABB.
///
/// The dynamic index is rebuilt once per step from the current AABBs of
/// every dynamic shape (§4.7.4.c); the static index is maintained
/// incrementally as static shapes are added and removed, since static
/// geometry doesn't move.
pub trait SpatialIndex {
    /// Add a shape at the given AABB.
    fn insert(&mut self, shape: ShapeKey, aabb: Aabb);

    /// Remove a previously inserted shape.
    fn remove(&mut self, shape: ShapeKey);

    /// Update a shape already in the index to a new AABB. The default
    /// implementation is a plain remove-then-insert; implementations that
    /// can do better (in-place bit clearing, say) should override it.
    fn update(&mut self, shape: ShapeKey, aabb: Aabb) {
        self.remove(shape);
        self.insert(shape, aabb);
    }

    /// Discard everything and re-populate from scratch. Used once per step
    /// to refresh the dynamic index cheaply instead of issuing N
    /// remove/insert pairs.
    fn rebuild(&mut self, shapes: &[(ShapeKey, Aabb)]);

    /// Visit every shape currently indexed.
    fn each(&self, f: &mut dyn FnMut(ShapeKey));

    /// Region query: every shape whose AABB intersects `bb`.
    fn query(&self, bb: Aabb, out: &mut Vec<ShapeKey>);

    /// Broadphase query for one shape: every *other* shape in this index
    /// whose AABB intersects `aabb`. Used by `Space::reindex_query` against
    /// both the dynamic index (self-pairs) and the static companion index
    /// (dynamic-vs-static pairs); static-vs-static pairs are never produced
    /// because this is never called with the static index as `self` and
    /// another static shape as the query subject.
    fn potential_pairs(&self, shape: ShapeKey, aabb: Aabb, out: &mut Vec<ShapeKey>);

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
