//! Pre-integration ray filters.
//!
//! A filter may rewrite a ray in place (clipping it), reject it outright,
//! or pass it through while reporting what it did via
//! [`RayFilterFlags`]. Rejected rays are dropped silently by the
//! integrators and counted on the map.

use std::sync::Arc;

use glam::DVec3;

/// Maximum range applied by the default filter; effectively unbounded.
pub const DEFAULT_RANGE_LIMIT: f64 = 1e10;

/// Flags reported by a ray filter.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RayFilterFlags(u32);

impl RayFilterFlags {
    /// Nothing was changed.
    pub const NONE: RayFilterFlags = RayFilterFlags(0);
    /// The ray origin was moved along the ray.
    pub const CLIPPED_START: RayFilterFlags = RayFilterFlags(1 << 0);
    /// The sample point was pulled back along the ray. The integrators
    /// treat the new end point as free space rather than a surface sample.
    pub const CLIPPED_END: RayFilterFlags = RayFilterFlags(1 << 1);

    /// True when every flag in `other` is set.
    #[inline]
    pub fn contains(self, other: RayFilterFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Set every flag in `other`.
    #[inline]
    pub fn insert(&mut self, other: RayFilterFlags) {
        self.0 |= other.0;
    }
}

impl std::ops::BitOr for RayFilterFlags {
    type Output = RayFilterFlags;

    fn bitor(self, rhs: RayFilterFlags) -> RayFilterFlags {
        RayFilterFlags(self.0 | rhs.0)
    }
}

/// A ray rewrite/reject hook. Returns false to reject the ray.
pub type RayFilter =
    Arc<dyn Fn(&mut DVec3, &mut DVec3, &mut RayFilterFlags) -> bool + Send + Sync>;

/// Basic validity check: finite endpoints and length within `max_range`.
pub fn good_ray(start: DVec3, end: DVec3, max_range: f64) -> bool {
    if start.is_nan() || end.is_nan() || !start.is_finite() || !end.is_finite() {
        return false;
    }
    if max_range > 0.0 && (end - start).length_squared() > max_range * max_range {
        return false;
    }
    true
}

/// Filter rejecting NaN rays and rays longer than `max_range`.
pub fn good_ray_filter(max_range: f64) -> RayFilter {
    Arc::new(move |start, end, _flags| good_ray(*start, *end, max_range))
}

/// Filter clipping rays to at most `max_length`, marking clipped rays so
/// the pulled-back end point is not treated as a surface sample. NaN rays
/// are rejected.
pub fn clip_range_filter(max_length: f64) -> RayFilter {
    Arc::new(move |start, end, flags| {
        if !good_ray(*start, *end, 0.0) {
            return false;
        }
        let ray = *end - *start;
        let length = ray.length();
        if length > max_length {
            *end = *start + ray * (max_length / length);
            flags.insert(RayFilterFlags::CLIPPED_END);
        }
        true
    })
}
