//! Per-pair narrowphase orchestration (§4.8): reject, collide, arbiter
//! lookup/update, begin/preSolve dispatch, accept/reject bookkeeping.
//!
//! This is kept separate from `Space::step` (which only drives the
//! broadphase loop and passes each candidate pair in) so the accept/reject
//! state machine can be tested in isolation from the spatial index.

use std::collections::HashSet;

use thunderdome as td;

use crate::arbiter::{Arbiter, ArbiterCache, ArbiterPool, ArbiterState};
use crate::body::{Body, BodyType};
use crate::collision::Collide;
use crate::contact_buffer::ContactBufferRing;
use crate::handle::{ArbiterKey, BodyKey, ShapeKey, ShapePair};
use crate::handler::{CollisionContext, CollisionHandlerRegistry};
use crate::shape::Shape;

/// Everything a single narrowphase pair evaluation needs, borrowed from
/// `Space` for the duration of one `evaluate_pair` call.
pub(crate) struct NarrowphaseCtx<'a> {
    pub bodies: &'a mut td::Arena<Body>,
    pub shapes: &'a td::Arena<Shape>,
    pub arbiters: &'a mut td::Arena<Arbiter>,
    pub cache: &'a mut ArbiterCache,
    pub pool: &'a mut ArbiterPool,
    pub contacts: &'a mut ContactBufferRing,
    pub handlers: &'a mut CollisionHandlerRegistry,
    pub collider: &'a dyn Collide,
    pub stamp: u64,
    pub no_collide_pairs: &'a HashSet<(BodyKey, BodyKey)>,
}

pub(crate) fn unordered(a: BodyKey, b: BodyKey) -> (BodyKey, BodyKey) {
    if a.index().slot() <= b.index().slot() {
        (a, b)
    } else {
        (b, a)
    }
}

/// §4.8 step 1: reject before ever calling into `Collide`.
fn query_reject(ctx: &NarrowphaseCtx, shape_a: &Shape, shape_b: &Shape) -> bool {
    if shape_a.body() == shape_b.body() {
        return true;
    }
    if !shape_a.filter.allows(&shape_b.filter) {
        return true;
    }
    if !shape_a.aabb().intersects(&shape_b.aabb()) {
        return true;
    }
    let pair = unordered(shape_a.body(), shape_b.body());
    ctx.no_collide_pairs.contains(&pair)
}

/// Runs §4.8 for one candidate pair. Returns the `collision_id` hint to
/// thread back for this pair on the next frame (unused by the built-in
/// circle-circle `Collide`, which has no incremental state, but kept for
/// interface fidelity with collaborators that do).
pub(crate) fn evaluate_pair(
    ctx: &mut NarrowphaseCtx,
    shape_a_key: ShapeKey,
    shape_b_key: ShapeKey,
    collision_id: u32,
    active_arbiters: &mut Vec<ArbiterKey>,
) -> u32 {
    let (body_a, body_b) = {
        let shape_a = &ctx.shapes[shape_a_key.index()];
        let shape_b = &ctx.shapes[shape_b_key.index()];
        if query_reject(ctx, shape_a, shape_b) {
            return collision_id;
        }
        (shape_a.body(), shape_b.body())
    };

    let pose_a = ctx.bodies[body_a.index()].pose;
    let pose_b = ctx.bodies[body_b.index()].pose;
    let info = {
        let shape_a = &ctx.shapes[shape_a_key.index()];
        let shape_b = &ctx.shapes[shape_b_key.index()];
        ctx.collider.collide(shape_a, pose_a, shape_b, pose_b)
    };
    if info.count == 0 {
        return collision_id;
    }

    // the collaborator's returned order is authoritative (§4.8 step 2): if it
    // swapped the pair, follow suit so the arbiter's shape_a/body_a line up
    // with info's contact normals, which point from a to b.
    let (shape_a_key, shape_b_key, body_a, body_b) = if info.swapped {
        (shape_b_key, shape_a_key, body_b, body_a)
    } else {
        (shape_a_key, shape_b_key, body_a, body_b)
    };

    let fresh_contacts: Vec<_> = info.contacts[..info.count].to_vec();
    {
        let arr = ctx.contacts.get_array(ctx.stamp);
        arr[..info.count].copy_from_slice(&fresh_contacts);
    }
    if ctx.contacts.push_contacts(info.count).is_err() {
        return collision_id;
    }

    let collision_types = {
        let shape_a = &ctx.shapes[shape_a_key.index()];
        let shape_b = &ctx.shapes[shape_b_key.index()];
        (shape_a.collision_type, shape_b.collision_type)
    };

    let pair = ShapePair::new(shape_a_key, shape_b_key);
    let arbiter_key = match ctx.cache.get(&pair) {
        Some(key) => key,
        None => {
            let arbiter = match ctx.pool.take() {
                Some(mut a) => {
                    a.reset(shape_a_key, shape_b_key, body_a, body_b, collision_types);
                    a
                }
                None => Arbiter::new(shape_a_key, shape_b_key, body_a, body_b, collision_types),
            };
            let key = ArbiterKey(ctx.arbiters.insert(arbiter));
            ctx.cache.insert(pair, key);
            key
        }
    };

    let prev_state = ctx.arbiters[arbiter_key.index()].state();
    {
        let arbiter = &mut ctx.arbiters[arbiter_key.index()];
        arbiter.update_contacts(&fresh_contacts);
        // shapes' collision types may have changed since this arbiter was
        // last cached; re-bind so handler dispatch uses the current pair.
        arbiter.rebind_types(collision_types);
        if prev_state == ArbiterState::Cached {
            arbiter.state = ArbiterState::FirstCollision;
        }
    }

    assert_ne!(
        ctx.arbiters[arbiter_key.index()].body_a(),
        ctx.arbiters[arbiter_key.index()].body_b(),
        "bug: arbiter endpoints collapsed to the same body"
    );

    let collision_types = ctx.arbiters[arbiter_key.index()].types;

    if ctx.arbiters[arbiter_key.index()].state() == ArbiterState::FirstCollision {
        let cctx = CollisionContext {
            arbiter: &ctx.arbiters[arbiter_key.index()],
            body_a: &ctx.bodies[body_a.index()],
            body_b: &ctx.bodies[body_b.index()],
        };
        let begin_ok = ctx.handlers.dispatch_begin(collision_types.0, collision_types.1, &cctx);
        if !begin_ok {
            ctx.arbiters[arbiter_key.index()].state = ArbiterState::Ignore;
        }
    }

    let mut accepted = ctx.arbiters[arbiter_key.index()].state() != ArbiterState::Ignore;

    if accepted {
        let cctx = CollisionContext {
            arbiter: &ctx.arbiters[arbiter_key.index()],
            body_a: &ctx.bodies[body_a.index()],
            body_b: &ctx.bodies[body_b.index()],
        };
        let pre_solve_ok = ctx.handlers.dispatch_pre_solve(collision_types.0, collision_types.1, &cctx);
        if !pre_solve_ok {
            accepted = false;
        }
    }

    let is_sensor = {
        let shape_a = &ctx.shapes[shape_a_key.index()];
        let shape_b = &ctx.shapes[shape_b_key.index()];
        shape_a.is_sensor() || shape_b.is_sensor()
    };
    let both_infinite_mass = {
        let ty_a = ctx.bodies[body_a.index()].body_type();
        let ty_b = ctx.bodies[body_b.index()].body_type();
        !matches!(ty_a, BodyType::Dynamic) && !matches!(ty_b, BodyType::Dynamic)
    };

    accepted = accepted
        && ctx.arbiters[arbiter_key.index()].state() != ArbiterState::Ignore
        && !is_sensor
        && !both_infinite_mass;

    if accepted {
        active_arbiters.push(arbiter_key);
    } else {
        let n = ctx.arbiters[arbiter_key.index()].contacts().len();
        ctx.contacts.pop_contacts(n);
        ctx.arbiters[arbiter_key.index()].clear_contacts();
        if ctx.arbiters[arbiter_key.index()].state() != ArbiterState::Ignore {
            ctx.arbiters[arbiter_key.index()].state = ArbiterState::Normal;
        }
    }

    ctx.arbiters[arbiter_key.index()].stamp = ctx.stamp;

    collision_id
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arbiter::{ArbiterCache, ArbiterPool};
    use crate::collision::CircleCollider;
    use crate::contact_buffer::ContactBufferRing;
    use crate::handler::CollisionHandlerRegistry;

    fn setup() -> (
        td::Arena<Body>,
        td::Arena<Shape>,
        td::Arena<Arbiter>,
        ArbiterCache,
        ArbiterPool,
        ContactBufferRing,
        CollisionHandlerRegistry,
        HashSet<(BodyKey, BodyKey)>,
        BodyKey,
        BodyKey,
        ShapeKey,
        ShapeKey,
    ) {
        let mut bodies: td::Arena<Body> = td::Arena::new();
        let body_a = BodyKey(bodies.insert(Body::new_dynamic(1.0, 1.0)));
        let body_b = BodyKey(bodies.insert(Body::new_dynamic(1.0, 1.0)));
        bodies[body_b.index()].pose.translation = ultraviolet::DVec2::new(1.5, 0.0);

        let mut shapes: td::Arena<Shape> = td::Arena::new();
        let shape_a = ShapeKey(shapes.insert(Shape::new_circle(body_a, 1.0)));
        let shape_b = ShapeKey(shapes.insert(Shape::new_circle(body_b, 1.0)));
        shapes[shape_a.index()].aabb = crate::collision::Aabb::new(
            ultraviolet::DVec2::new(-1.0, -1.0),
            ultraviolet::DVec2::new(1.0, 1.0),
        );
        shapes[shape_b.index()].aabb = crate::collision::Aabb::new(
            ultraviolet::DVec2::new(0.5, -1.0),
            ultraviolet::DVec2::new(2.5, 1.0),
        );

        (
            bodies,
            shapes,
            td::Arena::new(),
            ArbiterCache::default(),
            ArbiterPool::default(),
            ContactBufferRing::new(4),
            CollisionHandlerRegistry::new(),
            HashSet::new(),
            body_a,
            body_b,
            shape_a,
            shape_b,
        )
    }

    #[test]
    fn overlapping_pair_creates_active_arbiter() {
        let (mut bodies, shapes, mut arbiters, mut cache, mut pool, mut contacts, mut handlers, blockers, _a, _b, shape_a, shape_b) =
            setup();
        let collider = CircleCollider;
        let mut active = Vec::new();
        {
            let mut ctx = NarrowphaseCtx {
                bodies: &mut bodies,
                shapes: &shapes,
                arbiters: &mut arbiters,
                cache: &mut cache,
                pool: &mut pool,
                contacts: &mut contacts,
                handlers: &mut handlers,
                collider: &collider,
                stamp: 1,
                no_collide_pairs: &blockers,
            };
            evaluate_pair(&mut ctx, shape_a, shape_b, 0, &mut active);
        }
        assert_eq!(active.len(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn no_collide_pair_is_rejected() {
        let (mut bodies, shapes, mut arbiters, mut cache, mut pool, mut contacts, mut handlers, _blockers, a, b, shape_a, shape_b) =
            setup();
        let mut blockers = HashSet::new();
        blockers.insert(unordered(a, b));
        let collider = CircleCollider;
        let mut active = Vec::new();
        {
            let mut ctx = NarrowphaseCtx {
                bodies: &mut bodies,
                shapes: &shapes,
                arbiters: &mut arbiters,
                cache: &mut cache,
                pool: &mut pool,
                contacts: &mut contacts,
                handlers: &mut handlers,
                collider: &collider,
                stamp: 1,
                no_collide_pairs: &blockers,
            };
            evaluate_pair(&mut ctx, shape_a, shape_b, 0, &mut active);
        }
        assert!(active.is_empty());
        assert!(cache.is_empty());
    }
}
