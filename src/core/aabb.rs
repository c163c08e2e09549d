//! Axis-aligned bounding box used by culling and traversal queries.

use glam::DVec3;

/// Axis-aligned box in world coordinates.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Aabb {
    /// Minimum corner.
    pub min: DVec3,
    /// Maximum corner.
    pub max: DVec3,
}

impl Aabb {
    /// Box covering all of space.
    pub const EVERYTHING: Aabb = Aabb {
        min: DVec3::splat(f64::NEG_INFINITY),
        max: DVec3::splat(f64::INFINITY),
    };

    /// Create from corners. The corners are normalised so `min <= max`
    /// holds on every axis.
    pub fn new(a: DVec3, b: DVec3) -> Self {
        Self {
            min: a.min(b),
            max: a.max(b),
        }
    }

    /// Box centred on `centre` with the given half extents.
    pub fn centred(centre: DVec3, half_extents: DVec3) -> Self {
        Self {
            min: centre - half_extents,
            max: centre + half_extents,
        }
    }

    /// Centre point.
    #[inline]
    pub fn centre(&self) -> DVec3 {
        0.5 * (self.min + self.max)
    }

    /// True when `point` lies inside or on the boundary.
    #[inline]
    pub fn contains_point(&self, point: DVec3) -> bool {
        point.x >= self.min.x
            && point.y >= self.min.y
            && point.z >= self.min.z
            && point.x <= self.max.x
            && point.y <= self.max.y
            && point.z <= self.max.z
    }

    /// True when the boxes overlap, boundary contact included.
    #[inline]
    pub fn overlaps(&self, other: &Aabb) -> bool {
        self.min.x <= other.max.x
            && self.max.x >= other.min.x
            && self.min.y <= other.max.y
            && self.max.y >= other.min.y
            && self.min.z <= other.max.z
            && self.max.z >= other.min.z
    }

    /// True when a line segment from `start` to `end` intersects the box.
    ///
    /// Slab test; degenerate (zero length) segments reduce to a point
    /// containment check.
    pub fn intersects_segment(&self, start: DVec3, end: DVec3) -> bool {
        let dir = end - start;
        let mut t_min = 0.0f64;
        let mut t_max = 1.0f64;

        for axis in 0..3 {
            if dir[axis].abs() < f64::EPSILON {
                if start[axis] < self.min[axis] || start[axis] > self.max[axis] {
                    return false;
                }
                continue;
            }
            let inv = 1.0 / dir[axis];
            let mut t0 = (self.min[axis] - start[axis]) * inv;
            let mut t1 = (self.max[axis] - start[axis]) * inv;
            if t0 > t1 {
                std::mem::swap(&mut t0, &mut t1);
            }
            t_min = t_min.max(t0);
            t_max = t_max.min(t1);
            if t_min > t_max {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contains_and_overlaps() {
        let a = Aabb::new(DVec3::ZERO, DVec3::splat(2.0));
        assert!(a.contains_point(DVec3::splat(1.0)));
        assert!(a.contains_point(DVec3::ZERO));
        assert!(!a.contains_point(DVec3::splat(2.1)));

        let b = Aabb::new(DVec3::splat(2.0), DVec3::splat(3.0));
        assert!(a.overlaps(&b));
        let c = Aabb::new(DVec3::splat(2.5), DVec3::splat(3.0));
        assert!(!a.overlaps(&c));
    }

    #[test]
    fn test_segment_intersection() {
        let a = Aabb::new(DVec3::ZERO, DVec3::splat(1.0));
        assert!(a.intersects_segment(DVec3::new(-1.0, 0.5, 0.5), DVec3::new(2.0, 0.5, 0.5)));
        assert!(!a.intersects_segment(DVec3::new(-1.0, 2.0, 0.5), DVec3::new(2.0, 2.0, 0.5)));
        // Degenerate segment inside the box.
        assert!(a.intersects_segment(DVec3::splat(0.5), DVec3::splat(0.5)));
    }
}
