//! Rigid bodies: the things that move (or don't).

use ultraviolet as uv;

/// The three kinds of body the core distinguishes. See §3 of the design
/// document for the invariants attached to each.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BodyType {
    /// Participates fully in the simulation: integrates under forces,
    /// responds to impulses, can sleep.
    Dynamic,
    /// Infinite mass, finite externally-driven velocity. Never sleeps, and
    /// its presence in a contact wakes the other side.
    Kinematic,
    /// Infinite mass, zero velocity, lives in the static spatial index.
    /// Never sleeps and cannot be activated.
    Static,
}

impl BodyType {
    #[inline]
    pub fn is_dynamic(self) -> bool {
        matches!(self, BodyType::Dynamic)
    }

    #[inline]
    pub fn is_static(self) -> bool {
        matches!(self, BodyType::Static)
    }

    #[inline]
    pub fn is_kinematic(self) -> bool {
        matches!(self, BodyType::Kinematic)
    }

    /// Static and kinematic bodies both have infinite mass; only dynamic
    /// bodies are affected by forces and impulses.
    #[inline]
    pub fn has_finite_mass(self) -> bool {
        matches!(self, BodyType::Dynamic)
    }
}

/// Mass or moment of inertia, which can be infinite (static/kinematic
/// bodies, or a body pinned to never rotate).
///
/// Stores both the value and its inverse because the inverse is what's
/// actually needed in the solver's hot loop, and computing it once up front
/// is cheaper than re-deriving it every contact.
#[derive(Clone, Copy, Debug)]
pub enum Mass {
    Finite { mass: f64, inverse: f64 },
    Infinite,
}

impl From<f64> for Mass {
    #[inline]
    fn from(mass: f64) -> Self {
        if mass.is_finite() && mass > 0.0 {
            Mass::Finite {
                mass,
                inverse: 1.0 / mass,
            }
        } else {
            Mass::Infinite
        }
    }
}

impl Mass {
    #[inline]
    pub fn inv(&self) -> f64 {
        match self {
            Mass::Finite { inverse, .. } => *inverse,
            Mass::Infinite => 0.0,
        }
    }

    #[inline]
    pub fn value(&self) -> f64 {
        match self {
            Mass::Finite { mass, .. } => *mass,
            Mass::Infinite => f64::INFINITY,
        }
    }
}

/// A position and orientation in world space.
#[derive(Clone, Copy, Debug)]
pub struct Pose {
    pub translation: uv::DVec2,
    pub rotation: uv::DRotor2,
}

impl Default for Pose {
    fn default() -> Self {
        Pose {
            translation: uv::DVec2::zero(),
            rotation: uv::DRotor2::identity(),
        }
    }
}

impl Pose {
    /// Transform a point given in this pose's local space into world space.
    #[inline]
    pub fn point_to_world(&self, local: uv::DVec2) -> uv::DVec2 {
        self.translation + self.rotation * local
    }

    /// Rotate (but do not translate) a direction vector into world space.
    #[inline]
    pub fn dir_to_world(&self, local: uv::DVec2) -> uv::DVec2 {
        self.rotation * local
    }
}

/// Linear and angular velocity.
#[derive(Clone, Copy, Debug, Default)]
pub struct Velocity {
    pub linear: uv::DVec2,
    pub angular: f64,
}

impl Velocity {
    /// The linear velocity of a point offset from the center of mass,
    /// combining the body's linear velocity with the tangential velocity
    /// induced by its spin.
    #[inline]
    pub fn point_velocity(&self, offset: uv::DVec2) -> uv::DVec2 {
        let tangent = uv::DVec2::new(-offset.y, offset.x) * self.angular;
        self.linear + tangent
    }
}

/// A simulated rigid body.
///
/// A body on its own has no geometry; attach one or more [`crate::shape::Shape`]s
/// to it via [`crate::Space::add_shape`] to let it collide with things.
#[derive(Clone, Copy, Debug)]
pub struct Body {
    pub(crate) ty: BodyType,
    pub pose: Pose,
    pub velocity: Velocity,
    pub mass: Mass,
    pub moment_of_inertia: Mass,
    /// Accumulated external force for the next integration step, cleared
    /// after each [`crate::Space::step`].
    pub(crate) force: uv::DVec2,
    pub(crate) torque: f64,
    /// Does this body ignore gravity specifically (but still respond to
    /// other forces and impulses)?
    pub ignores_gravity: bool,

    // sleep bookkeeping -- see sleep.rs
    pub(crate) sleeping_idle_time: f64,
    pub(crate) is_sleeping: bool,
}

impl Body {
    pub fn new_dynamic(mass: f64, moment_of_inertia: f64) -> Self {
        Self::new(BodyType::Dynamic, Mass::from(mass), Mass::from(moment_of_inertia))
    }

    pub fn new_kinematic() -> Self {
        Self::new(BodyType::Kinematic, Mass::Infinite, Mass::Infinite)
    }

    pub fn new_static() -> Self {
        Self::new(BodyType::Static, Mass::Infinite, Mass::Infinite)
    }

    fn new(ty: BodyType, mass: Mass, moment_of_inertia: Mass) -> Self {
        Body {
            ty,
            pose: Pose::default(),
            velocity: Velocity::default(),
            mass,
            moment_of_inertia,
            force: uv::DVec2::zero(),
            torque: 0.0,
            ignores_gravity: false,
            sleeping_idle_time: 0.0,
            is_sleeping: false,
        }
    }

    #[inline]
    pub fn body_type(&self) -> BodyType {
        self.ty
    }

    #[inline]
    pub fn is_sleeping(&self) -> bool {
        // static bodies are "always asleep" conceptually (§3) but are never
        // tracked by the sleep graph; report them as sleeping for callers
        // that branch on this.
        self.ty.is_static() || self.is_sleeping
    }

    pub fn with_pose(mut self, pose: Pose) -> Self {
        self.pose = pose;
        self
    }

    pub fn with_velocity(mut self, velocity: Velocity) -> Self {
        self.velocity = velocity;
        self
    }

    pub fn with_gravity_ignored(mut self) -> Self {
        self.ignores_gravity = true;
        self
    }

    /// Apply a force at the center of mass, to take effect on the next step.
    pub fn apply_force(&mut self, force: uv::DVec2) {
        self.force += force;
    }

    /// Apply a force at a world-space point, inducing both linear and
    /// angular acceleration.
    pub fn apply_force_at_point(&mut self, force: uv::DVec2, world_point: uv::DVec2) {
        let offset = world_point - self.pose.translation;
        self.force += force;
        self.torque += offset.x * force.y - offset.y * force.x;
    }

    pub(crate) fn kinetic_energy(&self) -> f64 {
        let linear = 0.5 * self.mass.value().max(0.0) * self.velocity.linear.mag_sq();
        let angular = 0.5 * self.moment_of_inertia.value().max(0.0) * self.velocity.angular.powi(2);
        match (self.mass, self.moment_of_inertia) {
            (Mass::Infinite, Mass::Infinite) => 0.0,
            _ => linear + angular,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mass_from_finite() {
        let m = Mass::from(2.0);
        assert_eq!(m.inv(), 0.5);
    }

    #[test]
    fn mass_from_zero_is_infinite() {
        let m = Mass::from(0.0);
        assert_eq!(m.inv(), 0.0);
    }

    #[test]
    fn point_velocity_combines_spin() {
        let v = Velocity {
            linear: uv::DVec2::new(1.0, 0.0),
            angular: 1.0,
        };
        let p = v.point_velocity(uv::DVec2::new(1.0, 0.0));
        // tangential velocity from spin at offset (1, 0) with angular=1 is (0, 1)
        assert!((p - uv::DVec2::new(1.0, 1.0)).mag_sq() < 1e-12);
    }

    #[test]
    fn static_and_kinematic_have_infinite_mass() {
        assert!(!BodyType::Static.has_finite_mass());
        assert!(!BodyType::Kinematic.has_finite_mass());
        assert!(BodyType::Dynamic.has_finite_mass());
    }
}
