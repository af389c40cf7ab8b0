//! `Space`: the aggregate that owns every body, shape, constraint and
//! arbiter, and drives the per-step pipeline (§3, §4.7, §6).
//!
//! Every other module in this crate is a collaborator `Space` composes:
//! broadphase ([`crate::collision::SpatialIndex`]), narrowphase
//! ([`crate::collision::narrowphase`]), persistent contacts
//! ([`crate::arbiter`]), sleeping ([`crate::sleep`]) and re-entrancy
//! ([`crate::lock`]). None of those modules know about each other; `Space`
//! is where the wiring lives.

use std::collections::{HashMap, HashSet};

use thunderdome as td;
use ultraviolet::DVec2;

use crate::arbiter::{Arbiter, ArbiterCache, ArbiterPool, StaleVerdict};
use crate::body::{Body, BodyType, Pose};
use crate::collision::narrowphase::{self, NarrowphaseCtx};
use crate::collision::{Aabb, BruteForce, CircleCollider, Collide, HGrid, HGridParams, SpatialIndex};
use crate::constraint::Constraint;
use crate::contact_buffer::ContactBufferRing;
use crate::error::{expect_ok, Result, SpaceError};
use crate::handle::{ArbiterKey, BodyKey, ConstraintKey, ShapeKey, ShapePair};
use crate::handler::{CollisionContext, CollisionHandler, CollisionHandlerRegistry};
use crate::lock::Lock;
use crate::shape::{ColliderType, CollisionFilter, Geometry, Material, Shape, ShapeHome};
use crate::sleep::{ArbiterEdge, ConstraintEdge, SleepGraph, SleepPassParams};

/// Margin added to every shape's tight AABB before it's handed to a
/// [`SpatialIndex`], so a slowly-moving shape doesn't need reindexing every
/// single step.
const AABB_MARGIN: f64 = 0.1;

/// Result of [`Space::point_query_nearest`]: the closest shape to the query
/// point within the search radius, if any.
#[derive(Clone, Copy, Debug)]
pub struct PointQueryInfo {
    pub shape: Option<ShapeKey>,
    pub point: DVec2,
    pub distance: f64,
}

/// Result of [`Space::segment_query_first`]: the first shape hit by the ray,
/// in order along the segment.
#[derive(Clone, Copy, Debug)]
pub struct SegmentQueryInfo {
    pub shape: ShapeKey,
    pub point: DVec2,
    pub normal: DVec2,
    /// Fraction of the segment's length at which the hit occurred, in `[0, 1]`.
    pub t: f64,
}

/// The simulation world: every body, shape, constraint and arbiter, plus the
/// collaborators that drive one [`Space::step`] (§3, §6).
pub struct Space {
    bodies: td::Arena<Body>,
    shapes: td::Arena<Shape>,
    constraints: td::Arena<Constraint>,
    arbiters: td::Arena<Arbiter>,

    /// Awake `Dynamic` bodies. Excludes kinematic and static bodies (which
    /// never sleep) and sleeping dynamic bodies (tracked in
    /// `sleeping_islands` instead).
    dynamic_bodies: Vec<BodyKey>,
    kinematic_bodies: Vec<BodyKey>,
    static_bodies: Vec<BodyKey>,
    /// Dynamic bodies currently asleep, grouped by the island they fell
    /// asleep as (§4.5).
    sleeping_islands: Vec<Vec<BodyKey>>,
    /// The body every newly added static shape attaches to by default.
    static_body: BodyKey,

    body_shapes: HashMap<BodyKey, Vec<ShapeKey>>,
    constraint_list: Vec<ConstraintKey>,
    /// Unordered body pairs excluded from contact generation by a
    /// [`Constraint::collide_bodies`] set to `false`.
    no_collide_pairs: HashSet<(BodyKey, BodyKey)>,

    dynamic_index: Box<dyn SpatialIndex>,
    static_index: Box<dyn SpatialIndex>,

    arbiter_cache: ArbiterCache,
    arbiter_pool: ArbiterPool,
    /// Arbiters accepted as active for the step currently (or most recently)
    /// run.
    active_arbiters: Vec<ArbiterKey>,
    contacts: ContactBufferRing,
    handlers: CollisionHandlerRegistry,
    collider: Box<dyn Collide>,
    sleep_graph: SleepGraph,
    lock: Lock,

    stamp: u64,
    prev_dt: f64,

    /// Sequential-impulse solver iterations per step (§4.7.7.f). Must be at
    /// least 1.
    pub iterations: u32,
    gravity: DVec2,
    /// Multiplied into every dynamic body's velocity once per step, after
    /// forces are integrated; `1.0` means no damping.
    pub damping: f64,
    pub idle_speed_threshold: f64,
    /// How many seconds a body (and the rest of its island) must stay below
    /// the idle-speed threshold before it's put to sleep. Defaults to
    /// infinity, i.e. sleeping is disabled until a caller opts in.
    pub sleep_time_threshold: f64,
    pub collision_slop: f64,
    pub collision_bias: f64,
    collision_persistence: u64,
}

impl Default for Space {
    fn default() -> Self {
        Self::new()
    }
}

impl Space {
    pub fn new() -> Self {
        Self::with_indices(Box::new(BruteForce::default()), Box::new(BruteForce::default()))
    }

    fn with_indices(dynamic_index: Box<dyn SpatialIndex>, static_index: Box<dyn SpatialIndex>) -> Self {
        let mut bodies: td::Arena<Body> = td::Arena::new();
        let static_body = BodyKey(bodies.insert(Body::new_static()));

        Space {
            bodies,
            shapes: td::Arena::new(),
            constraints: td::Arena::new(),
            arbiters: td::Arena::new(),
            dynamic_bodies: Vec::new(),
            kinematic_bodies: Vec::new(),
            static_bodies: vec![static_body],
            sleeping_islands: Vec::new(),
            static_body,
            body_shapes: HashMap::new(),
            constraint_list: Vec::new(),
            no_collide_pairs: HashSet::new(),
            dynamic_index,
            static_index,
            arbiter_cache: ArbiterCache::default(),
            arbiter_pool: ArbiterPool::default(),
            active_arbiters: Vec::new(),
            contacts: ContactBufferRing::new(3),
            handlers: CollisionHandlerRegistry::new(),
            collider: Box::new(CircleCollider),
            sleep_graph: SleepGraph::default(),
            lock: Lock::default(),
            stamp: 0,
            prev_dt: 0.0,
            iterations: 10,
            gravity: DVec2::new(0.0, -9.81),
            damping: 1.0,
            idle_speed_threshold: 0.0,
            sleep_time_threshold: f64::INFINITY,
            collision_slop: 0.1,
            collision_bias: 0.9,
            collision_persistence: 3,
        }
    }

    //
    // configuration
    //

    pub fn gravity(&self) -> DVec2 {
        self.gravity
    }

    /// Sets gravity and wakes every sleeping island, since a gravity change
    /// can make a resting stack unstable again.
    pub fn set_gravity(&mut self, gravity: DVec2) {
        self.gravity = gravity;
        self.wake_all();
    }

    pub fn collision_persistence(&self) -> u64 {
        self.collision_persistence
    }

    pub fn set_collision_persistence(&mut self, persistence: u64) {
        self.collision_persistence = persistence;
        self.contacts.set_persistence(persistence);
    }

    pub fn static_body(&self) -> BodyKey {
        self.static_body
    }

    /// Reassigns the space's designated static body. Fails with
    /// [`SpaceError::StaticBodyBusy`] if the current one still owns shapes
    /// (§6).
    pub fn try_set_static_body(&mut self, body: BodyKey) -> Result<()> {
        let ty = self.bodies.get(body.index()).map(|b| b.body_type()).ok_or(SpaceError::NotOwned)?;
        if !ty.is_static() {
            return Err(SpaceError::NotOwned);
        }
        let busy = self.body_shapes.get(&self.static_body).map(|s| !s.is_empty()).unwrap_or(false);
        if busy {
            return Err(SpaceError::StaticBodyBusy);
        }
        self.static_body = body;
        Ok(())
    }

    pub fn set_static_body(&mut self, body: BodyKey) {
        expect_ok(self.try_set_static_body(body))
    }

    /// Swaps both the dynamic and static spatial indices for a fresh
    /// [`HGrid`] pair, carrying over every currently indexed shape (§6).
    pub fn try_use_spatial_hash(&mut self, cell_size: f64, expected_obj_count: usize) -> Result<()> {
        self.lock.check_unlocked()?;

        let mut new_dynamic = HGrid::new(HGridParams::from_cell_size(cell_size, expected_obj_count));
        let mut dynamic_shapes = Vec::new();
        self.dynamic_index.each(&mut |k| dynamic_shapes.push(k));
        for key in dynamic_shapes {
            new_dynamic.insert(key, self.shapes[key.index()].aabb());
        }

        let mut new_static = HGrid::new(HGridParams::from_cell_size(cell_size, expected_obj_count));
        let mut static_shapes = Vec::new();
        self.static_index.each(&mut |k| static_shapes.push(k));
        for key in static_shapes {
            new_static.insert(key, self.shapes[key.index()].aabb());
        }

        self.dynamic_index = Box::new(new_dynamic);
        self.static_index = Box::new(new_static);
        Ok(())
    }

    pub fn use_spatial_hash(&mut self, cell_size: f64, expected_obj_count: usize) {
        expect_ok(self.try_use_spatial_hash(cell_size, expected_obj_count))
    }

    /// Registers a collision handler, returning any previously registered
    /// handler for the same unordered type pair.
    pub fn add_collision_handler(&mut self, handler: CollisionHandler) -> Option<CollisionHandler> {
        self.handlers.add(handler)
    }

    //
    // membership
    //

    pub fn try_add_body(&mut self, body: Body) -> Result<BodyKey> {
        self.lock.check_unlocked()?;
        let ty = body.body_type();
        let key = BodyKey(self.bodies.insert(body));
        match ty {
            BodyType::Static => self.static_bodies.push(key),
            BodyType::Kinematic => self.kinematic_bodies.push(key),
            BodyType::Dynamic => self.dynamic_bodies.push(key),
        }
        log::trace!("add_body: {:?} ({:?})", key, ty);
        Ok(key)
    }

    pub fn add_body(&mut self, body: Body) -> BodyKey {
        expect_ok(self.try_add_body(body))
    }

    pub fn try_remove_body(&mut self, key: BodyKey) -> Result<()> {
        self.lock.check_unlocked()?;
        if self.bodies.get(key.index()).is_none() {
            return Err(SpaceError::NotOwned);
        }
        if key == self.static_body {
            return Err(SpaceError::StaticBodyBusy);
        }

        if let Some(shapes) = self.body_shapes.remove(&key) {
            for shape in shapes {
                self.remove_shape_internal(shape);
            }
        }
        let owned_constraints: Vec<ConstraintKey> = self
            .constraint_list
            .iter()
            .copied()
            .filter(|&ck| {
                let c = &self.constraints[ck.index()];
                c.body_a() == key || c.body_b() == key
            })
            .collect();
        for ck in owned_constraints {
            self.remove_constraint_internal(ck);
        }
        let dangling_arbiters: Vec<ArbiterKey> = self
            .arbiters
            .iter()
            .filter_map(|(idx, a)| (a.body_a() == key || a.body_b() == key).then_some(ArbiterKey(idx)))
            .collect();
        for ak in dangling_arbiters {
            self.discard_arbiter(ak);
        }

        self.dynamic_bodies.retain(|&k| k != key);
        self.kinematic_bodies.retain(|&k| k != key);
        self.static_bodies.retain(|&k| k != key);
        self.sleeping_islands.retain_mut(|island| {
            island.retain(|&k| k != key);
            !island.is_empty()
        });
        self.no_collide_pairs.retain(|&(a, b)| a != key && b != key);

        self.bodies.remove(key.index());
        log::trace!("remove_body: {:?}", key);
        Ok(())
    }

    pub fn remove_body(&mut self, key: BodyKey) {
        expect_ok(self.try_remove_body(key))
    }

    pub fn contains_body(&self, key: BodyKey) -> bool {
        self.bodies.get(key.index()).is_some()
    }

    pub fn body(&self, key: BodyKey) -> Option<&Body> {
        self.bodies.get(key.index())
    }

    pub fn body_mut(&mut self, key: BodyKey) -> Option<&mut Body> {
        self.bodies.get_mut(key.index())
    }

    pub fn try_add_shape(&mut self, mut shape: Shape) -> Result<ShapeKey> {
        self.lock.check_unlocked()?;
        let body_key = shape.body();
        let body_ty = self.bodies.get(body_key.index()).map(|b| b.body_type()).ok_or(SpaceError::DanglingBody)?;

        shape.home = if body_ty.is_static() { ShapeHome::Static } else { ShapeHome::Dynamic };
        let aabb = shape_world_aabb(&shape, &self.bodies[body_key.index()]);
        shape.aabb = aabb;
        let key = ShapeKey(self.shapes.insert(shape));
        self.body_shapes.entry(body_key).or_default().push(key);

        let sleeping = self.bodies[body_key.index()].is_sleeping;
        match body_ty {
            BodyType::Static => self.static_index.insert(key, aabb),
            BodyType::Kinematic => self.dynamic_index.insert(key, aabb),
            BodyType::Dynamic if sleeping => self.static_index.insert(key, aabb),
            BodyType::Dynamic => self.dynamic_index.insert(key, aabb),
        }

        if body_ty.is_dynamic() {
            self.migrate_to_awake(body_key);
        }

        log::trace!("add_shape: {:?} on {:?}", key, body_key);
        Ok(key)
    }

    pub fn add_shape(&mut self, shape: Shape) -> ShapeKey {
        expect_ok(self.try_add_shape(shape))
    }

    pub fn try_remove_shape(&mut self, key: ShapeKey) -> Result<()> {
        self.lock.check_unlocked()?;
        if self.shapes.get(key.index()).is_none() {
            return Err(SpaceError::UnknownShape(key));
        }
        self.remove_shape_internal(key);
        log::trace!("remove_shape: {:?}", key);
        Ok(())
    }

    pub fn remove_shape(&mut self, key: ShapeKey) {
        expect_ok(self.try_remove_shape(key))
    }

    fn remove_shape_internal(&mut self, key: ShapeKey) {
        let Some(shape) = self.shapes.remove(key.index()) else {
            return;
        };
        self.dynamic_index.remove(key);
        self.static_index.remove(key);
        if let Some(list) = self.body_shapes.get_mut(&shape.body()) {
            list.retain(|&s| s != key);
        }
        let dangling: Vec<ArbiterKey> = self
            .arbiters
            .iter()
            .filter_map(|(idx, a)| {
                let (sa, sb) = a.shapes();
                (sa == key || sb == key).then_some(ArbiterKey(idx))
            })
            .collect();
        for ak in dangling {
            self.discard_arbiter(ak);
        }
    }

    pub fn contains_shape(&self, key: ShapeKey) -> bool {
        self.shapes.get(key.index()).is_some()
    }

    pub fn shape(&self, key: ShapeKey) -> Option<&Shape> {
        self.shapes.get(key.index())
    }

    pub fn try_add_constraint(&mut self, constraint: Constraint) -> Result<ConstraintKey> {
        self.lock.check_unlocked()?;
        if self.bodies.get(constraint.body_a().index()).is_none()
            || self.bodies.get(constraint.body_b().index()).is_none()
        {
            return Err(SpaceError::DanglingBody);
        }
        if !constraint.collide_bodies {
            self.no_collide_pairs
                .insert(narrowphase::unordered(constraint.body_a(), constraint.body_b()));
        }
        let key = ConstraintKey(self.constraints.insert(constraint));
        self.constraint_list.push(key);
        log::trace!("add_constraint: {:?}", key);
        Ok(key)
    }

    pub fn add_constraint(&mut self, constraint: Constraint) -> ConstraintKey {
        expect_ok(self.try_add_constraint(constraint))
    }

    pub fn try_remove_constraint(&mut self, key: ConstraintKey) -> Result<()> {
        self.lock.check_unlocked()?;
        if self.constraints.get(key.index()).is_none() {
            return Err(SpaceError::UnknownConstraint(key));
        }
        self.remove_constraint_internal(key);
        log::trace!("remove_constraint: {:?}", key);
        Ok(())
    }

    pub fn remove_constraint(&mut self, key: ConstraintKey) {
        expect_ok(self.try_remove_constraint(key))
    }

    fn remove_constraint_internal(&mut self, key: ConstraintKey) {
        if let Some(pos) = self.constraint_list.iter().position(|&k| k == key) {
            self.constraint_list.remove(pos);
        }
        if let Some(c) = self.constraints.remove(key.index()) {
            if !c.collide_bodies {
                self.no_collide_pairs.remove(&narrowphase::unordered(c.body_a(), c.body_b()));
            }
        }
    }

    pub fn contains_constraint(&self, key: ConstraintKey) -> bool {
        self.constraints.get(key.index()).is_some()
    }

    pub fn constraint(&self, key: ConstraintKey) -> Option<&Constraint> {
        self.constraints.get(key.index())
    }

    pub fn constraint_mut(&mut self, key: ConstraintKey) -> Option<&mut Constraint> {
        self.constraints.get_mut(key.index())
    }

    //
    // activation
    //

    /// Wakes `body` (and the rest of its sleeping island, if any). If the
    /// space is currently locked (called from inside a step callback), the
    /// activation is deferred until the lock fully releases (§4.6) rather
    /// than failing.
    pub fn try_activate(&mut self, body: BodyKey) -> Result<()> {
        let ty = self.bodies.get(body.index()).map(|b| b.body_type()).ok_or(SpaceError::NotOwned)?;
        if !ty.is_dynamic() {
            return Err(SpaceError::NotDynamic(body));
        }
        if self.lock.is_locked() {
            self.lock.defer_activation(body);
            log::trace!("activate({:?}) deferred: space is locked", body);
            return Ok(());
        }
        self.migrate_to_awake(body);
        Ok(())
    }

    pub fn activate(&mut self, body: BodyKey) {
        expect_ok(self.try_activate(body))
    }

    /// Forces `body`'s whole awake island to sleep immediately, bypassing
    /// the idle-time threshold.
    pub fn try_deactivate(&mut self, body: BodyKey) -> Result<()> {
        self.lock.check_unlocked()?;
        let ty = self.bodies.get(body.index()).map(|b| b.body_type()).ok_or(SpaceError::NotOwned)?;
        if !ty.is_dynamic() {
            return Err(SpaceError::NotDynamic(body));
        }
        if self.bodies[body.index()].is_sleeping {
            return Ok(());
        }

        let island = self.find_awake_island(body);
        for &key in &island {
            self.bodies[key.index()].is_sleeping = true;
            self.bodies[key.index()].sleeping_idle_time = self.sleep_time_threshold;
            self.dynamic_bodies.retain(|&d| d != key);
            if let Some(shapes) = self.body_shapes.get(&key).cloned() {
                for s in shapes {
                    self.dynamic_index.remove(s);
                    self.static_index.insert(s, self.shapes[s.index()].aabb());
                }
            }
        }
        log::trace!("deactivate({:?}): island of {} bodies asleep", body, island.len());
        self.sleeping_islands.push(island);
        Ok(())
    }

    pub fn deactivate(&mut self, body: BodyKey) {
        expect_ok(self.try_deactivate(body))
    }

    /// Walks active arbiters and constraints from `start`, collecting every
    /// reachable awake dynamic body. Used by [`Self::try_deactivate`] to put
    /// a whole island to sleep at once, the mirror image of the wake side in
    /// [`Self::migrate_to_awake`].
    fn find_awake_island(&self, start: BodyKey) -> Vec<BodyKey> {
        let mut visited = HashSet::new();
        let mut stack = vec![start];
        visited.insert(start);
        while let Some(b) = stack.pop() {
            let mut neighbor = |o: BodyKey| {
                let awake_dynamic = self
                    .bodies
                    .get(o.index())
                    .map(|body| body.body_type().is_dynamic() && !body.is_sleeping)
                    .unwrap_or(false);
                if awake_dynamic && visited.insert(o) {
                    stack.push(o);
                }
            };
            for &ak in &self.active_arbiters {
                let a = &self.arbiters[ak.index()];
                if a.body_a() == b {
                    neighbor(a.body_b());
                } else if a.body_b() == b {
                    neighbor(a.body_a());
                }
            }
            for &ck in &self.constraint_list {
                let c = &self.constraints[ck.index()];
                if c.body_a() == b {
                    neighbor(c.body_b());
                } else if c.body_b() == b {
                    neighbor(c.body_a());
                }
            }
        }
        visited.into_iter().collect()
    }

    /// Wakes `body`: if it's part of a sleeping island, migrates the whole
    /// island back to the dynamic index; otherwise a no-op if it's already
    /// awake.
    fn migrate_to_awake(&mut self, body_key: BodyKey) {
        if let Some(pos) = self.sleeping_islands.iter().position(|island| island.contains(&body_key)) {
            let island = self.sleeping_islands.remove(pos);
            for member in island {
                self.bodies[member.index()].is_sleeping = false;
                self.bodies[member.index()].sleeping_idle_time = 0.0;
                if !self.dynamic_bodies.contains(&member) {
                    self.dynamic_bodies.push(member);
                }
                if let Some(shapes) = self.body_shapes.get(&member).cloned() {
                    for s in shapes {
                        self.static_index.remove(s);
                        self.dynamic_index.insert(s, self.shapes[s.index()].aabb());
                    }
                }
            }
        } else if !self.dynamic_bodies.contains(&body_key) {
            self.dynamic_bodies.push(body_key);
        }
    }

    fn wake_all(&mut self) {
        let islands = std::mem::take(&mut self.sleeping_islands);
        for island in islands {
            for member in island {
                self.migrate_to_awake(member);
            }
        }
    }

    //
    // iteration and queries
    //

    /// Visits every body in the space, dynamic bodies first, then static,
    /// then each sleeping island (§6).
    pub fn each_body(&self, mut f: impl FnMut(BodyKey, &Body)) {
        for &key in &self.dynamic_bodies {
            f(key, &self.bodies[key.index()]);
        }
        for &key in &self.kinematic_bodies {
            f(key, &self.bodies[key.index()]);
        }
        for &key in &self.static_bodies {
            f(key, &self.bodies[key.index()]);
        }
        for island in &self.sleeping_islands {
            for &key in island {
                f(key, &self.bodies[key.index()]);
            }
        }
    }

    pub fn active_arbiters(&self) -> &[ArbiterKey] {
        &self.active_arbiters
    }

    pub fn arbiter(&self, key: ArbiterKey) -> Option<&Arbiter> {
        self.arbiters.get(key.index())
    }

    pub fn stamp(&self) -> u64 {
        self.stamp
    }

    pub fn query_region(&self, region: Aabb) -> Vec<ShapeKey> {
        let mut out = Vec::new();
        self.dynamic_index.query(region, &mut out);
        self.static_index.query(region, &mut out);
        out
    }

    /// Finds the solid shape closest to `point`, no farther than `max_distance`.
    pub fn point_query_nearest(&self, point: DVec2, max_distance: f64, filter: CollisionFilter) -> PointQueryInfo {
        let mut best = PointQueryInfo {
            shape: None,
            point,
            distance: max_distance,
        };
        let mut candidates = Vec::new();
        self.dynamic_index.each(&mut |k| candidates.push(k));
        self.static_index.each(&mut |k| candidates.push(k));
        for key in candidates {
            let shape = &self.shapes[key.index()];
            if shape.is_sensor() || !shape.filter.allows(&filter) {
                continue;
            }
            let body = &self.bodies[shape.body().index()];
            let (distance, nearest) = shape_point_distance(shape, body, point);
            if distance <= max_distance && distance < best.distance {
                best = PointQueryInfo {
                    shape: Some(key),
                    point: nearest,
                    distance,
                };
            }
        }
        best
    }

    /// Finds the first solid shape hit by the segment from `start` to `end`.
    pub fn segment_query_first(&self, start: DVec2, end: DVec2, filter: CollisionFilter) -> Option<SegmentQueryInfo> {
        let region = Aabb::new(
            DVec2::new(start.x.min(end.x), start.y.min(end.y)),
            DVec2::new(start.x.max(end.x), start.y.max(end.y)),
        );
        let mut best: Option<SegmentQueryInfo> = None;
        for key in self.query_region(region) {
            let shape = &self.shapes[key.index()];
            if shape.is_sensor() || !shape.filter.allows(&filter) {
                continue;
            }
            let body = &self.bodies[shape.body().index()];
            if let Some((t, point, normal)) = ray_circle_hit(start, end, shape, body) {
                if best.map(|b| t < b.t).unwrap_or(true) {
                    best = Some(SegmentQueryInfo { shape: key, point, normal, t });
                }
            }
        }
        best
    }

    //
    // step pipeline (§4.7)
    //

    pub fn step(&mut self, dt: f64) {
        let _span = tracy_span!("space step", "step");

        // 1. stamp and dt bookkeeping.
        self.stamp += 1;
        let stamp = self.stamp;

        // 2. arbiters untouched since the previous step regain NORMAL state
        // (only the previous step's active set can be stale Ignore-carriers;
        // arbiters the narrowphase never reaches this step are left alone).
        for &key in &self.active_arbiters {
            let arbiter = &mut self.arbiters[key.index()];
            if arbiter.state != crate::arbiter::ArbiterState::Ignore {
                arbiter.state = crate::arbiter::ArbiterState::Normal;
            }
        }

        // 3. clear last step's active set.
        self.active_arbiters.clear();

        self.lock.lock();

        // 4.a integrate positions for every awake dynamic and kinematic body.
        {
            let _span = tracy_span!("integrate positions", "step");
            log::trace!("step {}: integrating positions, dt={}", stamp, dt);
            for &key in self.dynamic_bodies.iter().chain(self.kinematic_bodies.iter()) {
                integrate_position(&mut self.bodies[key.index()], dt);
            }
        }

        // 4.b fresh contact buffer slab for this step's narrowphase output.
        self.contacts.push_fresh_contact_buffer(stamp);

        // 4.c refresh the dynamic index from current AABBs.
        {
            let _span = tracy_span!("rebuild dynamic index", "step");
            log::trace!("step {}: rebuilding dynamic index", stamp);
            let mut fresh = Vec::new();
            for &key in self.dynamic_bodies.iter().chain(self.kinematic_bodies.iter()) {
                if let Some(shapes) = self.body_shapes.get(&key) {
                    for &s in shapes {
                        let aabb = shape_world_aabb(&self.shapes[s.index()], &self.bodies[key.index()]);
                        self.shapes[s.index()].aabb = aabb;
                        fresh.push((s, aabb));
                    }
                }
            }
            self.dynamic_index.rebuild(&fresh);
        }

        // 4.d broadphase + narrowphase: dynamic-vs-dynamic and
        // dynamic-vs-static pairs.
        {
            let _span = tracy_span!("narrowphase", "step");
            log::trace!("step {}: running narrowphase", stamp);
            self.run_narrowphase(stamp);
        }

        // 5. unlock without flushing deferred activations yet -- the sleep
        // pass below still needs a consistent view of who's awake.
        self.lock.unlock().expect("lock depth is managed internally by Space::step");

        // 6. island-based sleeping.
        {
            let _span = tracy_span!("sleep graph", "step");
            log::trace!("step {}: running sleep graph", stamp);
            self.run_sleep_pass(dt);
        }

        self.lock.lock();

        // 7.a evict stale arbiters from the cache.
        {
            let _span = tracy_span!("arbiter filter", "step");
            let verdicts = self.arbiter_cache.filter(stamp, &self.bodies, &mut self.arbiters);
            for (pair, verdict) in verdicts {
                if let StaleVerdict::Evict { arbiter_key } = verdict {
                    self.arbiter_cache.remove(&pair);
                    self.fire_separate(arbiter_key);
                    if let Some(arbiter) = self.arbiters.remove(arbiter_key.index()) {
                        self.arbiter_pool.give_back(arbiter);
                    }
                }
            }
        }

        // 7.b-7.h solve.
        {
            let _span = tracy_span!("solve", "step");
            log::trace!("step {}: solving {} active arbiters", stamp, self.active_arbiters.len());
            self.solve(dt);
        }

        self.prev_dt = dt;

        // 8. unlock and flush deferred activations queued by callbacks.
        self.lock.unlock().expect("lock depth is managed internally by Space::step");
        let roused = self.lock.take_roused();
        for body in roused {
            self.migrate_to_awake(body);
        }
    }

    fn run_narrowphase(&mut self, stamp: u64) {
        let mut dynamic_shapes = Vec::new();
        self.dynamic_index.each(&mut |k| dynamic_shapes.push(k));
        let dynamic_set: HashSet<ShapeKey> = dynamic_shapes.iter().copied().collect();

        for &shape_key in &dynamic_shapes {
            let aabb = self.shapes[shape_key.index()].aabb();

            let mut pairs = Vec::new();
            self.dynamic_index.potential_pairs(shape_key, aabb, &mut pairs);
            self.static_index.query(aabb, &mut pairs);

            for other in pairs {
                // the dynamic index pairs every shape with every other one
                // twice (once from each side); only evaluate each unordered
                // pair once using slot order as the tiebreaker. Static shapes
                // are never in `dynamic_set`, so dynamic-vs-static pairs are
                // always evaluated (once, from the dynamic shape's visit).
                if dynamic_set.contains(&other) && other.index().slot() <= shape_key.index().slot() {
                    continue;
                }
                let collider = &*self.collider;
                let mut ctx = NarrowphaseCtx {
                    bodies: &mut self.bodies,
                    shapes: &self.shapes,
                    arbiters: &mut self.arbiters,
                    cache: &mut self.arbiter_cache,
                    pool: &mut self.arbiter_pool,
                    contacts: &mut self.contacts,
                    handlers: &mut self.handlers,
                    collider,
                    stamp,
                    no_collide_pairs: &self.no_collide_pairs,
                };
                narrowphase::evaluate_pair(&mut ctx, shape_key, other, 0, &mut self.active_arbiters);
            }
        }
    }

    fn run_sleep_pass(&mut self, dt: f64) {
        let arbiter_edges: Vec<ArbiterEdge> = self
            .active_arbiters
            .iter()
            .map(|&key| {
                let a = &self.arbiters[key.index()];
                ArbiterEdge {
                    key,
                    body_a: a.body_a(),
                    body_b: a.body_b(),
                }
            })
            .collect();
        let constraint_edges: Vec<ConstraintEdge> = self
            .constraint_list
            .iter()
            .map(|&key| {
                let c = &self.constraints[key.index()];
                ConstraintEdge {
                    key,
                    body_a: c.body_a(),
                    body_b: c.body_b(),
                }
            })
            .collect();

        let params = SleepPassParams {
            dt,
            gravity: self.gravity,
            idle_speed_threshold: self.idle_speed_threshold,
            sleep_time_threshold: self.sleep_time_threshold,
        };
        let outcome = self
            .sleep_graph
            .run(&mut self.bodies, &self.dynamic_bodies, &arbiter_edges, &constraint_edges, &params);

        for island in outcome.newly_slept_islands {
            self.dynamic_bodies.retain(|k| !island.contains(k));
            for &key in &island {
                if let Some(shapes) = self.body_shapes.get(&key).cloned() {
                    for s in shapes {
                        self.dynamic_index.remove(s);
                        self.static_index.insert(s, self.shapes[s.index()].aabb());
                    }
                }
            }
            log::trace!("island of {} bodies fell asleep", island.len());
            self.sleeping_islands.push(island);
        }
        for body in outcome.woken {
            self.migrate_to_awake(body);
        }
    }

    fn solve(&mut self, dt: f64) {
        let slop = self.collision_slop;
        let bias_coef = 1.0 - self.collision_bias.powf(dt);

        // 7.b precompute per-contact effective mass and bias for every
        // active arbiter.
        for &key in &self.active_arbiters {
            let (shape_a, shape_b) = self.arbiters[key.index()].shapes();
            let material_a = shape_material(&self.shapes[shape_a.index()]);
            let material_b = shape_material(&self.shapes[shape_b.index()]);
            let (body_a, body_b) = two_bodies(&self.bodies, self.arbiters[key.index()].body_a(), self.arbiters[key.index()].body_b());
            self.arbiters[key.index()].pre_step(dt, slop, bias_coef, &body_a, &body_b, &material_a, &material_b);
        }

        // 7.c constraint preSolve + preStep. Constraints whose preSolve
        // rejects this step are excluded from warm-start and solving, same
        // as a collision handler's pre_solve.
        let mut active_constraints = Vec::with_capacity(self.constraint_list.len());
        for &key in &self.constraint_list {
            let (ka, kb) = {
                let c = &self.constraints[key.index()];
                (c.body_a(), c.body_b())
            };
            let (body_a, body_b) = two_bodies(&self.bodies, ka, kb);
            let accepted = self.constraints[key.index()].run_pre_solve(&body_a, &body_b);
            if accepted {
                self.constraints[key.index()].class.pre_step(dt, &body_a, &body_b);
                active_constraints.push(key);
            }
        }

        // 7.d integrate velocities for awake dynamic bodies.
        let damping_factor = self.damping.powf(dt);
        for &key in &self.dynamic_bodies {
            integrate_velocity(&mut self.bodies[key.index()], self.gravity, damping_factor, dt);
        }

        // 7.e warm-start from last step's accumulated impulses.
        let dt_coef = if self.prev_dt == 0.0 { 0.0 } else { dt / self.prev_dt };
        for &key in &self.active_arbiters {
            let (ka, kb) = (self.arbiters[key.index()].body_a(), self.arbiters[key.index()].body_b());
            with_two_bodies_mut(&mut self.bodies, ka, kb, |a, b| {
                self.arbiters[key.index()].apply_cached_impulse(dt_coef, a, b);
            });
        }
        for &key in &active_constraints {
            let (ka, kb) = {
                let c = &self.constraints[key.index()];
                (c.body_a(), c.body_b())
            };
            with_two_bodies_mut(&mut self.bodies, ka, kb, |a, b| {
                self.constraints[key.index()].class.apply_cached_impulse(dt_coef, a, b);
            });
        }

        // 7.f sequential-impulse solver iterations: arbiters, then
        // constraints, `iterations` times.
        let iterations = self.iterations.max(1);
        for _ in 0..iterations {
            for &key in &self.active_arbiters {
                let (ka, kb) = (self.arbiters[key.index()].body_a(), self.arbiters[key.index()].body_b());
                with_two_bodies_mut(&mut self.bodies, ka, kb, |a, b| {
                    self.arbiters[key.index()].apply_impulse(a, b);
                });
            }
            for &key in &active_constraints {
                let (ka, kb) = {
                    let c = &self.constraints[key.index()];
                    (c.body_a(), c.body_b())
                };
                with_two_bodies_mut(&mut self.bodies, ka, kb, |a, b| {
                    self.constraints[key.index()].class.apply_impulse(a, b);
                });
            }
        }

        // 7.g constraint postSolve.
        for &key in &active_constraints {
            let (ka, kb) = {
                let c = &self.constraints[key.index()];
                (c.body_a(), c.body_b())
            };
            let (body_a, body_b) = two_bodies(&self.bodies, ka, kb);
            self.constraints[key.index()].run_post_solve(&body_a, &body_b);
        }

        // 7.h arbiter postSolve callback.
        for &key in &self.active_arbiters {
            let (ka, kb, types) = {
                let a = &self.arbiters[key.index()];
                (a.body_a(), a.body_b(), a.types)
            };
            let (body_a, body_b) = two_bodies(&self.bodies, ka, kb);
            let ctx = CollisionContext {
                arbiter: &self.arbiters[key.index()],
                body_a: &body_a,
                body_b: &body_b,
            };
            self.handlers.dispatch_post_solve(types.0, types.1, &ctx);
        }
    }

    fn fire_separate(&mut self, key: ArbiterKey) {
        let (ka, kb, types) = {
            let a = &self.arbiters[key.index()];
            (a.body_a(), a.body_b(), a.types)
        };
        let (body_a, body_b) = two_bodies(&self.bodies, ka, kb);
        let ctx = CollisionContext {
            arbiter: &self.arbiters[key.index()],
            body_a: &body_a,
            body_b: &body_b,
        };
        self.handlers.dispatch_separate(types.0, types.1, &ctx);
    }
}

/// Bodies are `Copy`, so reading two distinct arena slots out by value and
/// writing the mutated copies back avoids needing simultaneous mutable
/// borrows of the same `thunderdome::Arena`.
#[inline]
fn two_bodies(bodies: &td::Arena<Body>, a: BodyKey, b: BodyKey) -> (Body, Body) {
    (bodies[a.index()], bodies[b.index()])
}

#[inline]
fn with_two_bodies_mut<R>(bodies: &mut td::Arena<Body>, a: BodyKey, b: BodyKey, f: impl FnOnce(&mut Body, &mut Body) -> R) -> R {
    let mut body_a = bodies[a.index()];
    let mut body_b = bodies[b.index()];
    let result = f(&mut body_a, &mut body_b);
    bodies[a.index()] = body_a;
    bodies[b.index()] = body_b;
    result
}

fn integrate_position(body: &mut Body, dt: f64) {
    body.pose.translation += body.velocity.linear * dt;
    body.pose.rotation = (body.pose.rotation * ultraviolet::DRotor2::from_angle(body.velocity.angular * dt)).normalized();
}

fn integrate_velocity(body: &mut Body, gravity: DVec2, damping_factor: f64, dt: f64) {
    if !body.ignores_gravity {
        body.velocity.linear += gravity * dt;
    }
    body.velocity.linear += body.force * body.mass.inv() * dt;
    body.velocity.angular += body.torque * body.moment_of_inertia.inv() * dt;
    body.velocity.linear *= damping_factor;
    body.velocity.angular *= damping_factor;
    body.force = DVec2::zero();
    body.torque = 0.0;
}

fn shape_world_aabb(shape: &Shape, body: &Body) -> Aabb {
    shape.geometry.local_aabb().offset_by(body.pose.translation).padded(AABB_MARGIN)
}

fn shape_material(shape: &Shape) -> Material {
    match shape.ty {
        ColliderType::Solid(m) => m,
        ColliderType::Sensor => Material::default(),
    }
}

fn shape_point_distance(shape: &Shape, body: &Body, point: DVec2) -> (f64, DVec2) {
    match shape.geometry {
        Geometry::Circle(c) => {
            let center = body.pose.translation;
            let delta = point - center;
            let dist_to_center = delta.mag();
            let distance = dist_to_center - c.radius;
            let nearest = if dist_to_center > 1e-9 {
                center + delta / dist_to_center * c.radius
            } else {
                center + DVec2::new(c.radius, 0.0)
            };
            (distance, nearest)
        }
    }
}

fn ray_circle_hit(start: DVec2, end: DVec2, shape: &Shape, body: &Body) -> Option<(f64, DVec2, DVec2)> {
    match shape.geometry {
        Geometry::Circle(c) => {
            let d = end - start;
            let f = start - body.pose.translation;
            let a = d.dot(d);
            if a < 1e-12 {
                return None;
            }
            let b = 2.0 * f.dot(d);
            let cc = f.dot(f) - c.radius * c.radius;
            let discriminant = b * b - 4.0 * a * cc;
            if discriminant < 0.0 {
                return None;
            }
            let sqrt_disc = discriminant.sqrt();
            let t1 = (-b - sqrt_disc) / (2.0 * a);
            let t2 = (-b + sqrt_disc) / (2.0 * a);
            let t = if (0.0..=1.0).contains(&t1) {
                Some(t1)
            } else if (0.0..=1.0).contains(&t2) {
                Some(t2)
            } else {
                None
            };
            t.map(|t| {
                let point = start + d * t;
                let normal = (point - body.pose.translation).normalized();
                (t, point, normal)
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::body::{Body, Velocity};
    use crate::shape::Shape;

    #[test]
    fn new_space_has_a_static_body_and_nothing_else() {
        let space = Space::new();
        assert_eq!(space.static_bodies.len(), 1);
        assert!(space.dynamic_bodies.is_empty());
        assert_eq!(space.static_body(), space.static_bodies[0]);
    }

    #[test]
    fn free_falling_body_gains_downward_velocity() {
        let mut space = Space::new();
        let body = space.add_body(Body::new_dynamic(1.0, 1.0));
        space.step(1.0 / 60.0);
        let v = space.body(body).unwrap().velocity.linear;
        assert!(v.y < 0.0);
    }

    #[test]
    fn adding_a_shape_to_a_sleeping_body_wakes_it() {
        let mut space = Space::new();
        let body = space.add_body(Body::new_dynamic(1.0, 1.0));
        space.try_deactivate(body).unwrap();
        assert!(space.body(body).unwrap().is_sleeping);

        space.add_shape(Shape::new_circle(body, 1.0));
        assert!(!space.body(body).unwrap().is_sleeping);
        assert!(space.dynamic_bodies.contains(&body));
    }

    #[test]
    fn structural_mutation_fails_while_locked() {
        let mut space = Space::new();
        space.lock.lock();
        let err = space.try_add_body(Body::new_dynamic(1.0, 1.0)).unwrap_err();
        assert_eq!(err, SpaceError::Locked { depth: 1 });
        space.lock.unlock().unwrap();
    }

    #[test]
    fn activate_while_locked_is_deferred_not_an_error() {
        let mut space = Space::new();
        let body = space.add_body(Body::new_dynamic(1.0, 1.0));
        space.try_deactivate(body).unwrap();
        space.lock.lock();
        space.try_activate(body).unwrap();
        assert!(space.body(body).unwrap().is_sleeping);
        space.lock.unlock().unwrap();
        let roused = space.lock.take_roused();
        for b in roused {
            space.migrate_to_awake(b);
        }
        assert!(!space.body(body).unwrap().is_sleeping);
    }

    #[test]
    fn resting_body_eventually_sleeps_once_a_threshold_is_set() {
        let mut space = Space::new();
        space.sleep_time_threshold = 0.1;
        space.gravity = DVec2::zero();
        let body = space.add_body(Body::new_dynamic(1.0, 1.0).with_velocity(Velocity::default()));
        for _ in 0..10 {
            space.step(1.0 / 60.0);
        }
        assert!(space.body(body).unwrap().is_sleeping);
    }

    #[test]
    fn point_query_finds_nearest_circle() {
        let mut space = Space::new();
        let body = space.add_body(Body::new_dynamic(1.0, 1.0));
        space.add_shape(Shape::new_circle(body, 1.0));
        let result = space.point_query_nearest(DVec2::new(3.0, 0.0), 5.0, CollisionFilter::default());
        assert_eq!(result.shape, Some(space.body_shapes[&body][0]));
        assert!((result.distance - 2.0).abs() < 1e-9);
    }
}
