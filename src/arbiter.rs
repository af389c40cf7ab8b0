//! Persistent contact arbiters: identity, warm-starting, and the
//! hashed cache that keeps at most one arbiter alive per colliding shape
//! pair (§3, §4.2).

use std::collections::HashMap;

use thunderdome as td;
use ultraviolet::DVec2;

use crate::body::Body;
use crate::contact_buffer::{Contact, MAX_CONTACTS_PER_ARBITER};
use crate::handle::{ArbiterKey, BodyKey, ShapeKey, ShapePair};
use crate::handler::CollisionType;
use crate::shape::Material;

/// Bounded capacity for [`ArbiterPool`]; beyond this, retired arbiters are
/// simply dropped rather than recycled (§5: "overflow discards excess
/// arbiters to the allocator").
pub const POOLED_BUFFER_SIZE: usize = 128;

/// Lifecycle state of an [`Arbiter`] (§3).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArbiterState {
    /// Just created this step; `begin` has not yet been evaluated.
    FirstCollision,
    /// Actively colliding, accepted by all callbacks.
    Normal,
    /// Rejected by a `begin` or `pre_solve` callback; kept around (not
    /// active) so `separate` fires exactly once when it finally goes stale.
    Ignore,
    /// Not touched this step yet; still in the cache from a previous frame.
    Cached,
    /// Marked for removal by `ArbiterCache::filter`.
    Invalidated,
}

/// A persistent record of a colliding shape pair, surviving across frames so
/// the solver can warm-start from last step's impulses.
#[derive(Debug)]
pub struct Arbiter {
    pub(crate) shape_a: ShapeKey,
    pub(crate) shape_b: ShapeKey,
    pub(crate) body_a: BodyKey,
    pub(crate) body_b: BodyKey,
    pub(crate) types: (CollisionType, CollisionType),

    contacts: [Contact; MAX_CONTACTS_PER_ARBITER],
    contact_count: usize,
    normal_mass: [f64; MAX_CONTACTS_PER_ARBITER],
    tangent_mass: [f64; MAX_CONTACTS_PER_ARBITER],
    friction: f64,
    restitution: f64,

    pub(crate) state: ArbiterState,
    pub(crate) stamp: u64,
}

impl Arbiter {
    pub(crate) fn new(
        shape_a: ShapeKey,
        shape_b: ShapeKey,
        body_a: BodyKey,
        body_b: BodyKey,
        types: (CollisionType, CollisionType),
    ) -> Self {
        Arbiter {
            shape_a,
            shape_b,
            body_a,
            body_b,
            types,
            contacts: [Contact::default(); MAX_CONTACTS_PER_ARBITER],
            contact_count: 0,
            normal_mass: [0.0; MAX_CONTACTS_PER_ARBITER],
            tangent_mass: [0.0; MAX_CONTACTS_PER_ARBITER],
            friction: 0.0,
            restitution: 0.0,
            state: ArbiterState::FirstCollision,
            stamp: 0,
        }
    }

    /// Re-purposes an already-allocated (pooled) arbiter for a new pair.
    pub(crate) fn reset(
        &mut self,
        shape_a: ShapeKey,
        shape_b: ShapeKey,
        body_a: BodyKey,
        body_b: BodyKey,
        types: (CollisionType, CollisionType),
    ) {
        self.shape_a = shape_a;
        self.shape_b = shape_b;
        self.body_a = body_a;
        self.body_b = body_b;
        self.types = types;
        self.contact_count = 0;
        self.state = ArbiterState::FirstCollision;
    }

    #[inline]
    pub fn body_a(&self) -> BodyKey {
        self.body_a
    }

    #[inline]
    pub fn body_b(&self) -> BodyKey {
        self.body_b
    }

    #[inline]
    pub fn shapes(&self) -> (ShapeKey, ShapeKey) {
        (self.shape_a, self.shape_b)
    }

    #[inline]
    pub fn state(&self) -> ArbiterState {
        self.state
    }

    #[inline]
    pub fn contacts(&self) -> &[Contact] {
        &self.contacts[..self.contact_count]
    }

    pub(crate) fn clear_contacts(&mut self) {
        self.contact_count = 0;
    }

    /// Transfers freshly generated contacts into this arbiter, warm-starting
    /// each by carrying over the cached impulse of the nearest surviving
    /// contact from last frame (matched by proximity, since contacts have no
    /// persistent per-point id in this design).
    pub(crate) fn update_contacts(&mut self, fresh: &[Contact]) {
        let old = self.contacts;
        let old_count = self.contact_count;

        let n = fresh.len().min(MAX_CONTACTS_PER_ARBITER);
        for i in 0..n {
            let mut matched = fresh[i];
            if let Some(closest) = (0..old_count)
                .map(|j| (j, (old[j].point - matched.point).mag_sq()))
                .filter(|&(_, d2)| d2 < 1e-6)
                .min_by(|a, b| a.1.total_cmp(&b.1))
            {
                matched.normal_impulse = old[closest.0].normal_impulse;
                matched.tangent_impulse = old[closest.0].tangent_impulse;
            }
            self.contacts[i] = matched;
        }
        self.contact_count = n;
    }

    /// Rebinds this arbiter's handler type pair (shapes' collision types may
    /// have changed since this arbiter was cached).
    pub(crate) fn rebind_types(&mut self, types: (CollisionType, CollisionType)) {
        self.types = types;
    }

    /// §4.7.7.b: precompute per-contact effective masses and bias velocity.
    pub(crate) fn pre_step(
        &mut self,
        dt: f64,
        slop: f64,
        bias_coef: f64,
        body_a: &Body,
        body_b: &Body,
        material_a: &Material,
        material_b: &Material,
    ) {
        self.friction = material_a.dynamic_friction_with(material_b);
        self.restitution = material_a.restitution_with(material_b);

        for i in 0..self.contact_count {
            let c = &mut self.contacts[i];
            let ra = c.point - body_a.pose.translation;
            let rb = c.point - body_b.pose.translation;
            let ra_cross_n = cross(ra, c.normal);
            let rb_cross_n = cross(rb, c.normal);
            let k_normal = body_a.mass.inv()
                + body_b.mass.inv()
                + body_a.moment_of_inertia.inv() * ra_cross_n * ra_cross_n
                + body_b.moment_of_inertia.inv() * rb_cross_n * rb_cross_n;
            self.normal_mass[i] = if k_normal > 0.0 { 1.0 / k_normal } else { 0.0 };

            let tangent = DVec2::new(-c.normal.y, c.normal.x);
            let ra_cross_t = cross(ra, tangent);
            let rb_cross_t = cross(rb, tangent);
            let k_tangent = body_a.mass.inv()
                + body_b.mass.inv()
                + body_a.moment_of_inertia.inv() * ra_cross_t * ra_cross_t
                + body_b.moment_of_inertia.inv() * rb_cross_t * rb_cross_t;
            self.tangent_mass[i] = if k_tangent > 0.0 { 1.0 / k_tangent } else { 0.0 };

            let penetration = (-c.depth + slop).min(0.0);
            c.bias = -bias_coef * penetration / dt.max(1e-12);
        }
    }

    pub(crate) fn apply_cached_impulse(&mut self, dt_coef: f64, body_a: &mut Body, body_b: &mut Body) {
        for i in 0..self.contact_count {
            let c = &mut self.contacts[i];
            c.normal_impulse *= dt_coef;
            c.tangent_impulse *= dt_coef;
            let ra = c.point - body_a.pose.translation;
            let rb = c.point - body_b.pose.translation;
            let tangent = DVec2::new(-c.normal.y, c.normal.x);
            let impulse = c.normal * c.normal_impulse + tangent * c.tangent_impulse;
            apply_pair_impulse(body_a, body_b, ra, rb, impulse);
        }
    }

    /// §4.7.7.f: one sequential-impulse iteration, normal then friction.
    pub(crate) fn apply_impulse(&mut self, body_a: &mut Body, body_b: &mut Body) {
        for i in 0..self.contact_count {
            let (ra, rb, normal) = {
                let c = &self.contacts[i];
                (
                    c.point - body_a.pose.translation,
                    c.point - body_b.pose.translation,
                    c.normal,
                )
            };

            // normal impulse, clamped to stay non-negative (contacts only push)
            let rel_vel =
                body_b.velocity.point_velocity(rb) - body_a.velocity.point_velocity(ra);
            let vn = rel_vel.dot(normal);
            let c = &mut self.contacts[i];
            let restitution_term = if vn < -1.0 { self.restitution * vn } else { 0.0 };
            let mut lambda = -c.normal_mass * (vn + c.bias + restitution_term);
            let new_impulse = (c.normal_impulse + lambda).max(0.0);
            lambda = new_impulse - c.normal_impulse;
            c.normal_impulse = new_impulse;
            let normal_impulse_vec = normal * lambda;
            apply_pair_impulse(body_a, body_b, ra, rb, normal_impulse_vec);

            // friction impulse, clamped to the Coulomb cone using this
            // step's normal impulse magnitude
            let tangent = DVec2::new(-normal.y, normal.x);
            let rel_vel =
                body_b.velocity.point_velocity(rb) - body_a.velocity.point_velocity(ra);
            let vt = rel_vel.dot(tangent);
            let c = &mut self.contacts[i];
            let mut lambda_t = -c.tangent_mass * vt;
            let max_friction = self.friction * c.normal_impulse;
            let new_tangent_impulse = (c.tangent_impulse + lambda_t).clamp(-max_friction, max_friction);
            lambda_t = new_tangent_impulse - c.tangent_impulse;
            c.tangent_impulse = new_tangent_impulse;
            let tangent_impulse_vec = tangent * lambda_t;
            apply_pair_impulse(body_a, body_b, ra, rb, tangent_impulse_vec);
        }
    }
}

#[inline]
fn cross(r: DVec2, n: DVec2) -> f64 {
    r.x * n.y - r.y * n.x
}

fn apply_pair_impulse(body_a: &mut Body, body_b: &mut Body, ra: DVec2, rb: DVec2, impulse: DVec2) {
    body_a.velocity.linear -= impulse * body_a.mass.inv();
    body_a.velocity.angular -= cross(ra, impulse) * body_a.moment_of_inertia.inv();
    body_b.velocity.linear += impulse * body_b.mass.inv();
    body_b.velocity.angular += cross(rb, impulse) * body_b.moment_of_inertia.inv();
}

/// Recycles retired [`Arbiter`] records to bound allocation churn (§5).
#[derive(Default)]
pub struct ArbiterPool {
    free: Vec<Arbiter>,
}

impl ArbiterPool {
    /// Takes a pooled arbiter, if any, ready to be re-initialized via
    /// [`Arbiter::reset`]. Returns `None` when the pool is empty, in which
    /// case the caller should construct a fresh [`Arbiter::new`] instead.
    pub(crate) fn take(&mut self) -> Option<Arbiter> {
        self.free.pop()
    }

    pub(crate) fn give_back(&mut self, arbiter: Arbiter) {
        if self.free.len() < POOLED_BUFFER_SIZE {
            self.free.push(arbiter);
        }
        // else: drop it, falling back to the allocator next time.
    }
}

/// How a stale arbiter was classified by [`ArbiterCache::filter`].
#[derive(Clone, Copy, Debug)]
pub(crate) enum StaleVerdict {
    /// Still relevant; left in the cache untouched.
    Keep,
    /// Evicted: caller should run the `separate` callback, then return the
    /// arbiter to the pool.
    Evict { arbiter_key: ArbiterKey },
}

#[inline]
fn truly_sleeping(body: &Body) -> bool {
    body.body_type().is_dynamic() && body.is_sleeping
}

/// Hashed set of live arbiters keyed by the unordered shape pair (§4.2).
#[derive(Default)]
pub struct ArbiterCache {
    by_pair: HashMap<ShapePair, ArbiterKey>,
}

impl ArbiterCache {
    pub(crate) fn get(&self, pair: &ShapePair) -> Option<ArbiterKey> {
        self.by_pair.get(pair).copied()
    }

    pub(crate) fn insert(&mut self, pair: ShapePair, key: ArbiterKey) {
        self.by_pair.insert(pair, key);
    }

    pub(crate) fn remove(&mut self, pair: &ShapePair) -> Option<ArbiterKey> {
        self.by_pair.remove(pair)
    }

    pub fn len(&self) -> usize {
        self.by_pair.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_pair.is_empty()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (&ShapePair, &ArbiterKey)> {
        self.by_pair.iter()
    }

    /// §4.2 `Filter`: classifies every cached arbiter by how stale it is.
    ///
    /// An arbiter not touched this step is given one grace step (transitioned
    /// to `Cached` rather than evicted immediately), matching a pair that
    /// skips a single frame of contact without actually separating for good;
    /// only an arbiter still untouched on the *next* filter pass is evicted.
    pub(crate) fn filter(
        &self,
        stamp: u64,
        bodies: &td::Arena<Body>,
        arbiters: &mut td::Arena<Arbiter>,
    ) -> Vec<(ShapePair, StaleVerdict)> {
        let mut out = Vec::with_capacity(self.by_pair.len());
        for (&pair, &key) in self.by_pair.iter() {
            let (body_a, body_b) = {
                let arb = &arbiters[key.index()];
                (arb.body_a, arb.body_b)
            };
            let either_sleeping = bodies.get(body_a.index()).map(truly_sleeping).unwrap_or(false)
                || bodies.get(body_b.index()).map(truly_sleeping).unwrap_or(false);
            if either_sleeping {
                out.push((pair, StaleVerdict::Keep));
                continue;
            }

            let arbiter = &mut arbiters[key.index()];
            if arbiter.stamp == stamp {
                out.push((pair, StaleVerdict::Keep));
                continue;
            }
            if matches!(arbiter.state, ArbiterState::Cached | ArbiterState::Invalidated) {
                out.push((pair, StaleVerdict::Evict { arbiter_key: key }));
            } else {
                arbiter.state = ArbiterState::Cached;
                out.push((pair, StaleVerdict::Keep));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contact_buffer::Contact;

    fn dummy_key(slot_source: &mut thunderdome::Arena<()>) -> ShapeKey {
        ShapeKey(slot_source.insert(()))
    }

    fn dummy_arbiter() -> Arbiter {
        let mut shapes: thunderdome::Arena<()> = thunderdome::Arena::new();
        let mut bodies: thunderdome::Arena<()> = thunderdome::Arena::new();
        let a = ShapeKey(shapes.insert(()));
        let b = ShapeKey(shapes.insert(()));
        let ba = BodyKey(bodies.insert(()));
        let bb = BodyKey(bodies.insert(()));
        Arbiter::new(a, b, ba, bb, (0, 0))
    }

    #[test]
    fn update_contacts_preserves_impulse_for_matching_point() {
        let mut arbiter = dummy_arbiter();
        let mut fresh = Contact::default();
        fresh.point = DVec2::new(1.0, 2.0);
        arbiter.update_contacts(&[fresh]);
        arbiter.contacts[0].normal_impulse = 5.0;
        arbiter.contact_count = 1;

        let mut next = Contact::default();
        next.point = DVec2::new(1.0, 2.0);
        arbiter.update_contacts(&[next]);

        assert_eq!(arbiter.contacts()[0].normal_impulse, 5.0);
    }

    #[test]
    fn update_contacts_resets_impulse_for_new_point() {
        let mut arbiter = dummy_arbiter();
        let mut fresh = Contact::default();
        fresh.point = DVec2::new(1.0, 2.0);
        arbiter.contacts[0] = fresh;
        arbiter.contacts[0].normal_impulse = 5.0;
        arbiter.contact_count = 1;

        let mut far = Contact::default();
        far.point = DVec2::new(100.0, 100.0);
        arbiter.update_contacts(&[far]);

        assert_eq!(arbiter.contacts()[0].normal_impulse, 0.0);
    }

    #[test]
    fn cache_symmetric_pair_lookup() {
        let mut arena: thunderdome::Arena<()> = thunderdome::Arena::new();
        let a = dummy_key(&mut arena);
        let b = dummy_key(&mut arena);
        let mut arbiters: thunderdome::Arena<Arbiter> = thunderdome::Arena::new();
        let key = ArbiterKey(arbiters.insert(dummy_arbiter()));

        let mut cache = ArbiterCache::default();
        cache.insert(ShapePair::new(a, b), key);

        assert_eq!(cache.get(&ShapePair::new(b, a)), Some(key));
    }

    #[test]
    fn pool_recycles_up_to_capacity() {
        let mut pool = ArbiterPool::default();
        for _ in 0..POOLED_BUFFER_SIZE + 5 {
            pool.give_back(dummy_arbiter());
        }
        assert_eq!(pool.free.len(), POOLED_BUFFER_SIZE);
    }

    #[test]
    fn filter_gives_one_grace_step_before_eviction() {
        let mut bodies: td::Arena<Body> = td::Arena::new();
        let ba = BodyKey(bodies.insert(Body::new_dynamic(1.0, 1.0)));
        let bb = BodyKey(bodies.insert(Body::new_dynamic(1.0, 1.0)));

        let mut shapes: thunderdome::Arena<()> = thunderdome::Arena::new();
        let shape_a = dummy_key(&mut shapes);
        let shape_b = dummy_key(&mut shapes);

        let mut arbiters: td::Arena<Arbiter> = td::Arena::new();
        let mut arb = Arbiter::new(shape_a, shape_b, ba, bb, (0, 0));
        arb.stamp = 1;
        let key = ArbiterKey(arbiters.insert(arb));

        let mut cache = ArbiterCache::default();
        cache.insert(ShapePair::new(shape_a, shape_b), key);

        // stamp 2: wasn't touched this step, not yet Cached -> grace.
        let verdicts = cache.filter(2, &bodies, &mut arbiters);
        assert!(matches!(verdicts[0].1, StaleVerdict::Keep));
        assert_eq!(arbiters[key.index()].state, ArbiterState::Cached);

        // stamp 3: still untouched, already Cached -> evict.
        let verdicts = cache.filter(3, &bodies, &mut arbiters);
        assert!(matches!(verdicts[0].1, StaleVerdict::Evict { .. }));
    }

    #[test]
    fn filter_keeps_arbiter_touching_sleeping_body() {
        let mut bodies: td::Arena<Body> = td::Arena::new();
        let mut sleeper = Body::new_dynamic(1.0, 1.0);
        sleeper.is_sleeping = true;
        let ba = BodyKey(bodies.insert(sleeper));
        let bb = BodyKey(bodies.insert(Body::new_dynamic(1.0, 1.0)));

        let mut shapes: td::Arena<()> = td::Arena::new();
        let shape_a = ShapeKey(shapes.insert(()));
        let shape_b = ShapeKey(shapes.insert(()));

        let mut arbiters: td::Arena<Arbiter> = td::Arena::new();
        let mut arb = Arbiter::new(shape_a, shape_b, ba, bb, (0, 0));
        arb.stamp = 1;
        let key = ArbiterKey(arbiters.insert(arb));

        let mut cache = ArbiterCache::default();
        cache.insert(ShapePair::new(shape_a, shape_b), key);

        let verdicts = cache.filter(5, &bodies, &mut arbiters);
        assert!(matches!(verdicts[0].1, StaleVerdict::Keep));
        assert_eq!(arbiters[key.index()].state, ArbiterState::FirstCollision);
    }
}
