//! Built-in two-body distance pin, kept minimal to exercise the constraint
//! list and constraint graph machinery end-to-end (§1 out-of-scope note:
//! concrete constraint sub-types beyond this one are an external concern).

use ultraviolet::DVec2;

use super::ConstraintClass;
use crate::body::Body;

/// Holds two anchor points, one per body, at a fixed distance apart.
/// Solved as a single scalar equality constraint along the line connecting
/// the anchors, sequential-impulse style with Baumgarte position bias
/// ([Cat05], [Tam15]).
#[derive(Debug)]
pub struct DistancePin {
    anchor_a: DVec2,
    anchor_b: DVec2,
    distance: f64,

    // precomputed each pre_step
    ra: DVec2,
    rb: DVec2,
    normal: DVec2,
    effective_mass: f64,
    bias: f64,

    accumulated_impulse: f64,
}

impl DistancePin {
    pub fn new(anchor_a: DVec2, anchor_b: DVec2, distance: f64) -> Self {
        DistancePin {
            anchor_a,
            anchor_b,
            distance,
            ra: DVec2::zero(),
            rb: DVec2::zero(),
            normal: DVec2::unit_x(),
            effective_mass: 0.0,
            bias: 0.0,
            accumulated_impulse: 0.0,
        }
    }

    #[inline]
    fn cross_scalar(r: DVec2, n: DVec2) -> f64 {
        r.x * n.y - r.y * n.x
    }
}

/// Fraction of positional error corrected per step. 0.2 is a conservative,
/// commonly-used value that avoids overshoot without feeling mushy.
const BAUMGARTE: f64 = 0.2;

impl ConstraintClass for DistancePin {
    fn pre_step(&mut self, dt: f64, body_a: &Body, body_b: &Body) {
        self.ra = body_a.pose.dir_to_world(self.anchor_a);
        self.rb = body_b.pose.dir_to_world(self.anchor_b);
        let pa = body_a.pose.translation + self.ra;
        let pb = body_b.pose.translation + self.rb;
        let delta = pb - pa;
        let dist = delta.mag();
        self.normal = if dist > 1e-9 {
            delta / dist
        } else {
            DVec2::unit_x()
        };

        let ra_cross_n = Self::cross_scalar(self.ra, self.normal);
        let rb_cross_n = Self::cross_scalar(self.rb, self.normal);
        let k = body_a.mass.inv()
            + body_b.mass.inv()
            + body_a.moment_of_inertia.inv() * ra_cross_n * ra_cross_n
            + body_b.moment_of_inertia.inv() * rb_cross_n * rb_cross_n;
        self.effective_mass = if k > 0.0 { 1.0 / k } else { 0.0 };

        let position_error = dist - self.distance;
        self.bias = if dt > 0.0 {
            (BAUMGARTE / dt) * position_error
        } else {
            0.0
        };
    }

    fn apply_cached_impulse(&mut self, dt_coef: f64, body_a: &mut Body, body_b: &mut Body) {
        let impulse = self.normal * (self.accumulated_impulse * dt_coef);
        self.accumulated_impulse *= dt_coef;
        apply_pair_impulse(body_a, body_b, self.ra, self.rb, impulse);
    }

    fn apply_impulse(&mut self, body_a: &mut Body, body_b: &mut Body) {
        if self.effective_mass == 0.0 {
            return;
        }
        let rel_vel = body_b.velocity.point_velocity(self.rb) - body_a.velocity.point_velocity(self.ra);
        let cdot = rel_vel.dot(self.normal);
        let lambda = -self.effective_mass * (cdot + self.bias);
        self.accumulated_impulse += lambda;

        let impulse = self.normal * lambda;
        apply_pair_impulse(body_a, body_b, self.ra, self.rb, impulse);
    }
}

fn apply_pair_impulse(body_a: &mut Body, body_b: &mut Body, ra: DVec2, rb: DVec2, impulse: DVec2) {
    body_a.velocity.linear -= impulse * body_a.mass.inv();
    body_a.velocity.angular -= DistancePin::cross_scalar(ra, impulse) * body_a.moment_of_inertia.inv();
    body_b.velocity.linear += impulse * body_b.mass.inv();
    body_b.velocity.angular += DistancePin::cross_scalar(rb, impulse) * body_b.moment_of_inertia.inv();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::body::Velocity;

    #[test]
    fn pulls_separating_bodies_together() {
        let mut a = Body::new_dynamic(1.0, 1.0);
        let mut b = Body::new_dynamic(1.0, 1.0);
        b.pose.translation = DVec2::new(2.0, 0.0);
        b.velocity = Velocity {
            linear: DVec2::new(1.0, 0.0),
            angular: 0.0,
        };

        let mut pin = DistancePin::new(DVec2::zero(), DVec2::zero(), 1.0);
        pin.pre_step(1.0 / 60.0, &a, &b);
        pin.apply_impulse(&mut a, &mut b);

        // bodies are 2 units apart but pinned to 1: the solver should pull
        // them together, slowing b's separating velocity and accelerating a
        // toward b.
        assert!(b.velocity.linear.x < 1.0);
        assert!(a.velocity.linear.x > 0.0);
    }
}
