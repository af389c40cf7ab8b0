//! Axis-aligned bounding boxes.

use ultraviolet::DVec2;

/// An axis-aligned bounding box in world space.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Aabb {
    pub min: DVec2,
    pub max: DVec2,
}

impl Aabb {
    pub fn new(min: DVec2, max: DVec2) -> Self {
        Aabb { min, max }
    }

    /// Translates a local-space AABB into world space given a pose.
    pub(crate) fn offset_by(&self, translation: DVec2) -> Self {
        Aabb {
            min: self.min + translation,
            max: self.max + translation,
        }
    }

    /// Grows the box by a fixed margin on every side, used to reduce how
    /// often a slow-moving shape needs to be reindexed in the spatial index.
    pub fn padded(&self, margin: f64) -> Self {
        let pad = DVec2::new(margin, margin);
        Aabb {
            min: self.min - pad,
            max: self.max + pad,
        }
    }

    #[inline]
    pub fn intersects(&self, other: &Self) -> bool {
        self.min.x <= other.max.x
            && self.max.x >= other.min.x
            && self.min.y <= other.max.y
            && self.max.y >= other.min.y
    }

    #[inline]
    pub fn contains_point(&self, point: DVec2) -> bool {
        point.x >= self.min.x && point.x <= self.max.x && point.y >= self.min.y && point.y <= self.max.y
    }

    pub fn union(&self, other: &Self) -> Self {
        Aabb {
            min: DVec2::new(self.min.x.min(other.min.x), self.min.y.min(other.min.y)),
            max: DVec2::new(self.max.x.max(other.max.x), self.max.y.max(other.max.y)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disjoint_boxes_do_not_intersect() {
        let a = Aabb::new(DVec2::new(0.0, 0.0), DVec2::new(1.0, 1.0));
        let b = Aabb::new(DVec2::new(2.0, 2.0), DVec2::new(3.0, 3.0));
        assert!(!a.intersects(&b));
    }

    #[test]
    fn touching_boxes_intersect() {
        let a = Aabb::new(DVec2::new(0.0, 0.0), DVec2::new(1.0, 1.0));
        let b = Aabb::new(DVec2::new(1.0, 0.0), DVec2::new(2.0, 1.0));
        assert!(a.intersects(&b));
    }
}
