//! Key types used to address objects stored in a [`crate::Space`]'s arenas.
//!
//! The original implementation this design is based on hashes shape pointer
//! bit-patterns for arbiter identity. We never have a stable pointer to hash
//! in safe Rust, and shouldn't want one anyway -- instead every object gets a
//! [`thunderdome::Index`] (a generation-checked slot) when it's inserted, and
//! that index *is* the identity. See `ArbiterCache` in `arbiter.rs` for how
//! pairs of these are hashed symmetrically.

use thunderdome as td;

/// Key to look up a [`crate::body::Body`] stored in a [`crate::Space`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BodyKey(pub(crate) td::Index);

impl BodyKey {
    /// The underlying arena index, useful for building your own side tables
    /// keyed by body identity.
    #[inline]
    pub fn index(&self) -> td::Index {
        self.0
    }
}

/// Key to look up a [`crate::shape::Shape`] stored in a [`crate::Space`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ShapeKey(pub(crate) td::Index);

impl ShapeKey {
    #[inline]
    pub fn index(&self) -> td::Index {
        self.0
    }
}

/// Key to look up a [`crate::constraint::Constraint`] stored in a [`crate::Space`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ConstraintKey(pub(crate) td::Index);

impl ConstraintKey {
    #[inline]
    pub fn index(&self) -> td::Index {
        self.0
    }
}

/// Key to look up an [`crate::arbiter::Arbiter`] stored in a [`crate::Space`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ArbiterKey(pub(crate) td::Index);

impl ArbiterKey {
    #[inline]
    pub fn index(&self) -> td::Index {
        self.0
    }
}

/// An unordered pair of shape keys, used as the logical identity of an
/// arbiter. Equality and hashing treat `(a, b)` and `(b, a)` as the same
/// pair, matching the spec's "keyed by the unordered pair" requirement.
#[derive(Clone, Copy, Debug)]
pub struct ShapePair(pub ShapeKey, pub ShapeKey);

impl ShapePair {
    pub(crate) fn new(a: ShapeKey, b: ShapeKey) -> Self {
        Self(a, b)
    }

    /// Symmetric hash combinator over the pair's arena slots: order doesn't
    /// affect the result, so `(a, b)` and `(b, a)` hash identically.
    pub(crate) fn hash_pair(&self) -> u64 {
        let sa = self.0 .0.slot() as u64;
        let sb = self.1 .0.slot() as u64;
        let (lo, hi) = if sa < sb { (sa, sb) } else { (sb, sa) };
        lo ^ hi.rotate_left(32)
    }
}

impl PartialEq for ShapePair {
    fn eq(&self, other: &Self) -> bool {
        (self.0 == other.0 && self.1 == other.1) || (self.0 == other.1 && self.1 == other.0)
    }
}
impl Eq for ShapePair {}

impl std::hash::Hash for ShapePair {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.hash_pair().hash(state);
    }
}
