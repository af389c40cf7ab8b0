//! Collision geometry bound to bodies.

use ultraviolet as uv;

use crate::collision::Aabb;
use crate::handle::BodyKey;
use crate::handler::CollisionType;

/// Which rigid body owns a shape, and whether it currently sits in the
/// dynamic or static spatial index (§3: "determined by its Body's type at
/// insertion time and re-classified on Body type change").
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ShapeHome {
    Dynamic,
    Static,
}

/// Surface properties used when resolving a contact between two solid
/// shapes. Uses a simplified model where every material carries its own
/// coefficients and a pair's effective coefficient is derived from both,
/// rather than a full N×N materials-by-materials table.
#[derive(Clone, Copy, Debug)]
pub struct Material {
    pub static_friction_coef: f64,
    pub dynamic_friction_coef: f64,
    pub restitution_coef: f64,
}

impl Default for Material {
    fn default() -> Self {
        Material {
            static_friction_coef: 0.6,
            dynamic_friction_coef: 0.4,
            restitution_coef: 0.0,
        }
    }
}

impl Material {
    pub fn static_friction_with(&self, other: &Self) -> f64 {
        (self.static_friction_coef + other.static_friction_coef) / 2.0
    }

    pub fn dynamic_friction_with(&self, other: &Self) -> f64 {
        (self.dynamic_friction_coef + other.dynamic_friction_coef) / 2.0
    }

    /// Restitution uses the larger of the two coefficients, matching the
    /// usual convention that a bouncy surface dominates a dead one.
    pub fn restitution_with(&self, other: &Self) -> f64 {
        self.restitution_coef.max(other.restitution_coef)
    }
}

/// Whether a shape participates in contact resolution (`Solid`) or only
/// reports overlap through collision handler callbacks (`Sensor`).
#[derive(Clone, Copy, Debug)]
pub enum ColliderType {
    Solid(Material),
    Sensor,
}

impl Default for ColliderType {
    fn default() -> Self {
        Self::Solid(Material::default())
    }
}

/// Category/mask filter used to veto pairs during narrowphase reject (§4.8).
/// A pair is allowed to collide if, in both directions, the first shape's
/// `categories` intersects the second's `mask` -- the same bitmask-filter
/// convention used by most 2D physics engines.
#[derive(Clone, Copy, Debug)]
pub struct CollisionFilter {
    pub categories: u32,
    pub mask: u32,
    /// Shapes sharing a nonzero, equal group never collide with each other
    /// regardless of category/mask, and a negative group always collides
    /// regardless of category/mask. Zero means "no group".
    pub group: i32,
}

impl Default for CollisionFilter {
    fn default() -> Self {
        CollisionFilter {
            categories: u32::MAX,
            mask: u32::MAX,
            group: 0,
        }
    }
}

impl CollisionFilter {
    pub fn allows(&self, other: &Self) -> bool {
        if self.group != 0 && self.group == other.group {
            return false;
        }
        (self.categories & other.mask) != 0 && (other.categories & self.mask) != 0
    }
}

/// The one built-in geometric primitive this crate ships, sufficient to
/// drive the full pipeline end-to-end; a real consumer plugs in its own
/// shapes through the [`crate::collision::Collide`] collaborator interface.
#[derive(Clone, Copy, Debug)]
pub struct Circle {
    pub radius: f64,
}

/// The concrete geometry carried by a [`Shape`].
#[derive(Clone, Copy, Debug)]
pub enum Geometry {
    Circle(Circle),
}

impl Geometry {
    pub(crate) fn local_aabb(&self) -> Aabb {
        match self {
            Geometry::Circle(c) => Aabb {
                min: uv::DVec2::new(-c.radius, -c.radius),
                max: uv::DVec2::new(c.radius, c.radius),
            },
        }
    }
}

/// A geometric primitive bound to exactly one body.
#[derive(Clone, Copy, Debug)]
pub struct Shape {
    pub(crate) body: BodyKey,
    pub geometry: Geometry,
    pub filter: CollisionFilter,
    pub ty: ColliderType,
    /// Classifies this shape for [`crate::handler::CollisionHandlerRegistry`]
    /// dispatch (§3: "CollisionHandler ... bound by shape collision types").
    /// Defaults to 0, which collides with itself under the default handler
    /// (no handler registered for `(0, 0)`) unless the caller assigns
    /// distinct types and registers handlers for them.
    pub collision_type: CollisionType,
    pub(crate) home: ShapeHome,
    /// Cached world-space AABB, refreshed once per step before broadphase.
    pub(crate) aabb: Aabb,
}

impl Shape {
    pub fn new_circle(body: BodyKey, radius: f64) -> Self {
        Shape::new(body, Geometry::Circle(Circle { radius }))
    }

    fn new(body: BodyKey, geometry: Geometry) -> Self {
        let aabb = geometry.local_aabb();
        Shape {
            body,
            geometry,
            filter: CollisionFilter::default(),
            ty: ColliderType::default(),
            collision_type: 0,
            home: ShapeHome::Dynamic,
            aabb,
        }
    }

    pub fn with_filter(mut self, filter: CollisionFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_collision_type(mut self, collision_type: CollisionType) -> Self {
        self.collision_type = collision_type;
        self
    }

    pub fn with_material(mut self, material: Material) -> Self {
        self.ty = ColliderType::Solid(material);
        self
    }

    pub fn as_sensor(mut self) -> Self {
        self.ty = ColliderType::Sensor;
        self
    }

    #[inline]
    pub fn body(&self) -> BodyKey {
        self.body
    }

    #[inline]
    pub fn is_sensor(&self) -> bool {
        matches!(self.ty, ColliderType::Sensor)
    }

    #[inline]
    pub fn aabb(&self) -> Aabb {
        self.aabb
    }

    pub fn area(&self) -> f64 {
        match self.geometry {
            Geometry::Circle(c) => std::f64::consts::PI * c.radius * c.radius,
        }
    }

    /// Coefficient multiplying mass to get moment of inertia, for callers
    /// that want to derive body inertia from attached shapes. See
    /// <https://en.wikipedia.org/wiki/List_of_moments_of_inertia>.
    pub fn moment_of_inertia_coef(&self) -> f64 {
        match self.geometry {
            Geometry::Circle(c) => c.radius * c.radius / 2.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use thunderdome as td;

    fn dummy_body_key() -> BodyKey {
        let mut arena: td::Arena<()> = td::Arena::new();
        BodyKey(arena.insert(()))
    }

    #[test]
    fn filter_same_group_never_collides() {
        let a = CollisionFilter {
            categories: 1,
            mask: 1,
            group: 5,
        };
        let b = CollisionFilter {
            categories: 1,
            mask: 1,
            group: 5,
        };
        assert!(!a.allows(&b));
    }

    #[test]
    fn filter_default_allows_everything() {
        let a = CollisionFilter::default();
        let b = CollisionFilter::default();
        assert!(a.allows(&b));
    }

    #[test]
    fn filter_disjoint_masks_reject() {
        let a = CollisionFilter {
            categories: 0b01,
            mask: 0b01,
            group: 0,
        };
        let b = CollisionFilter {
            categories: 0b10,
            mask: 0b10,
            group: 0,
        };
        assert!(!a.allows(&b));
    }

    #[test]
    fn circle_area() {
        let s = Shape::new_circle(dummy_body_key(), 2.0);
        assert!((s.area() - std::f64::consts::PI * 4.0).abs() < 1e-9);
    }
}
