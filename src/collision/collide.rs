//! The `Collide` collaborator interface (§4.8) and its one built-in
//! implementation, circle vs. circle.
//!
//! Concrete narrowphase geometry is explicitly out of scope for this crate
//! (§1): a real consumer is expected to plug in its own shape types and
//! `Collide` impl. The circle-circle case ships so the pipeline can be
//! exercised end-to-end without an external geometry crate.

use ultraviolet::DVec2;

use crate::contact_buffer::Contact;
use crate::shape::{Geometry, Shape};

/// The result of one `Collide` invocation: which two shapes were actually
/// tested (the collaborator may swap `a`/`b` from the order it was called
/// with -- the returned order is authoritative, per §4.8 step 2) plus zero,
/// one, or two contact points.
pub struct CollideInfo {
    pub swapped: bool,
    pub contacts: [Contact; crate::contact_buffer::MAX_CONTACTS_PER_ARBITER],
    pub count: usize,
}

impl CollideInfo {
    fn none() -> Self {
        CollideInfo {
            swapped: false,
            contacts: [Contact::default(); crate::contact_buffer::MAX_CONTACTS_PER_ARBITER],
            count: 0,
        }
    }
}

/// Generates contact manifolds between two shapes given their world
/// transforms. The core calls this once per broadphase-surviving pair,
/// after filter/AABB/constraint rejection (§4.8 step 1).
pub trait Collide {
    fn collide(
        &self,
        shape_a: &Shape,
        pose_a: crate::body::Pose,
        shape_b: &Shape,
        pose_b: crate::body::Pose,
    ) -> CollideInfo;
}

/// The crate's one built-in narrowphase implementation: circle vs. circle.
/// Anything else (circle vs. a user shape, user shape vs. user shape) is
/// the consuming application's responsibility to implement against the
/// same [`Collide`] trait.
#[derive(Default, Clone, Copy, Debug)]
pub struct CircleCollider;

impl Collide for CircleCollider {
    fn collide(
        &self,
        shape_a: &Shape,
        pose_a: crate::body::Pose,
        shape_b: &Shape,
        pose_b: crate::body::Pose,
    ) -> CollideInfo {
        let (Geometry::Circle(ca), Geometry::Circle(cb)) = (shape_a.geometry, shape_b.geometry);

        let center_a = pose_a.translation;
        let center_b = pose_b.translation;
        let delta = center_b - center_a;
        let dist_sq = delta.mag_sq();
        let radius_sum = ca.radius + cb.radius;

        if dist_sq >= radius_sum * radius_sum {
            return CollideInfo::none();
        }

        let dist = dist_sq.sqrt();
        let normal = if dist > 1e-9 {
            delta / dist
        } else {
            DVec2::unit_y()
        };
        let depth = radius_sum - dist;
        let point = center_a + normal * ca.radius;

        let mut info = CollideInfo::none();
        info.contacts[0] = Contact {
            point,
            normal,
            depth,
            normal_impulse: 0.0,
            tangent_impulse: 0.0,
            bias: 0.0,
        };
        info.count = 1;
        info
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::body::Pose;
    use crate::handle::BodyKey;
    use crate::shape::Shape;
    use thunderdome as td;

    fn dummy_body() -> BodyKey {
        let mut arena: td::Arena<()> = td::Arena::new();
        BodyKey(arena.insert(()))
    }

    #[test]
    fn overlapping_circles_produce_one_contact() {
        let body = dummy_body();
        let a = Shape::new_circle(body, 1.0);
        let b = Shape::new_circle(body, 1.0);
        let pose_a = Pose::default();
        let mut pose_b = Pose::default();
        pose_b.translation = DVec2::new(1.5, 0.0);

        let info = CircleCollider.collide(&a, pose_a, &b, pose_b);
        assert_eq!(info.count, 1);
        assert!((info.contacts[0].depth - 0.5).abs() < 1e-9);
    }

    #[test]
    fn distant_circles_produce_no_contact() {
        let body = dummy_body();
        let a = Shape::new_circle(body, 1.0);
        let b = Shape::new_circle(body, 1.0);
        let pose_a = Pose::default();
        let mut pose_b = Pose::default();
        pose_b.translation = DVec2::new(10.0, 0.0);

        let info = CircleCollider.collide(&a, pose_a, &b, pose_b);
        assert_eq!(info.count, 0);
    }
}
