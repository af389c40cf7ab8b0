//! Constraints: persistent, user-authored restrictions on relative body motion.
//!
//! Sources for the impulse math used by the built-in pin constraint:
//! [Cat05] Catto, E. (2005). Iterative Dynamics With Temporal Coherence.
//! [Cat11] Catto, E. (2011). Soft Constraints.
//! [Tam15] Tamis, M. (2015). 3D Constraint Derivations for Impulse Solvers.

pub mod pin;

use crate::body::Body;
use crate::handle::BodyKey;

pub use pin::DistancePin;

/// The per-type solver hooks a constraint's concrete class must implement.
/// Driven by the step pipeline in the fixed order `pre_step` →
/// `apply_cached_impulse` (once, at warm-start) → `apply_impulse` (once per
/// solver iteration).
pub trait ConstraintClass: std::fmt::Debug {
    /// Precompute per-step quantities (effective mass, bias velocity) from
    /// the current body poses. Called once per step before any impulses are
    /// applied.
    fn pre_step(&mut self, dt: f64, body_a: &Body, body_b: &Body);

    /// Re-apply last step's accumulated impulse, scaled by `dt_coef =
    /// dt / prev_dt` (zero on the first step or after a `prev_dt` of zero).
    fn apply_cached_impulse(&mut self, dt_coef: f64, body_a: &mut Body, body_b: &mut Body);

    /// One sequential-impulse solver iteration.
    fn apply_impulse(&mut self, body_a: &mut Body, body_b: &mut Body);
}

/// Connects two bodies (or one body to the world) with a persistent
/// restriction on relative motion (§3).
pub struct Constraint {
    pub(crate) body_a: BodyKey,
    pub(crate) body_b: BodyKey,
    /// If `false`, this constraint's endpoints are rejected during
    /// narrowphase (§4.8 step 1) and never generate a contact arbiter.
    pub collide_bodies: bool,
    pub(crate) class: Box<dyn ConstraintClass>,
    /// Runs once per step before `class`'s own `pre_step`. Returning `false`
    /// skips this constraint's impulse application for the step, same as a
    /// collision handler's `pre_solve`.
    pub(crate) pre_solve: Option<Box<dyn FnMut(&Body, &Body) -> bool>>,
    /// Runs once per step after all solver iterations complete.
    pub(crate) post_solve: Option<Box<dyn FnMut(&Body, &Body)>>,
}

impl Constraint {
    pub(crate) fn new(body_a: BodyKey, body_b: BodyKey, class: Box<dyn ConstraintClass>) -> Self {
        Constraint {
            body_a,
            body_b,
            collide_bodies: true,
            class,
            pre_solve: None,
            post_solve: None,
        }
    }

    pub(crate) fn run_pre_solve(&mut self, body_a: &Body, body_b: &Body) -> bool {
        match &mut self.pre_solve {
            Some(f) => f(body_a, body_b),
            None => true,
        }
    }

    pub(crate) fn run_post_solve(&mut self, body_a: &Body, body_b: &Body) {
        if let Some(f) = &mut self.post_solve {
            f(body_a, body_b);
        }
    }

    #[inline]
    pub fn body_a(&self) -> BodyKey {
        self.body_a
    }

    #[inline]
    pub fn body_b(&self) -> BodyKey {
        self.body_b
    }
}

/// Ergonomic construction of a [`Constraint`] bound to a pair of bodies.
///
/// Building with only `owner` set (no `with_target`) is not supported by
/// this crate's built-in constraint set (there is no implicit "world" body);
/// callers wanting a body-to-world anchor should add a static body and use
/// it as the target explicitly.
pub struct ConstraintBuilder {
    owner: BodyKey,
    owner_anchor: ultraviolet::DVec2,
    target: BodyKey,
    target_anchor: ultraviolet::DVec2,
    collide_bodies: bool,
}

impl ConstraintBuilder {
    pub fn new(owner: BodyKey, target: BodyKey) -> Self {
        ConstraintBuilder {
            owner,
            owner_anchor: ultraviolet::DVec2::zero(),
            target,
            target_anchor: ultraviolet::DVec2::zero(),
            collide_bodies: true,
        }
    }

    /// Set the anchor point on the owning body, in the owning body's local
    /// space.
    pub fn with_origin(mut self, point: ultraviolet::DVec2) -> Self {
        self.owner_anchor = point;
        self
    }

    /// Set the anchor point on the target body, in the target body's local
    /// space.
    pub fn with_target_origin(mut self, point: ultraviolet::DVec2) -> Self {
        self.target_anchor = point;
        self
    }

    /// Suppress contact generation between this constraint's two endpoints.
    pub fn without_collision(mut self) -> Self {
        self.collide_bodies = false;
        self
    }

    /// Build a distance pin holding the two anchors at a fixed separation.
    pub fn build_distance_pin(self, distance: f64) -> Constraint {
        let class = DistancePin::new(self.owner_anchor, self.target_anchor, distance);
        let mut c = Constraint::new(self.owner, self.target, Box::new(class));
        c.collide_bodies = self.collide_bodies;
        c
    }
}
