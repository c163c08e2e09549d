//! Voxel addressing.
//!
//! A voxel address is split into a signed 16-bit region coordinate (which
//! chunk) and an unsigned 8-bit local coordinate (which voxel inside the
//! chunk). Regions are corner-anchored: region `r` spans the half-open world
//! interval `[origin + r * region_extent, origin + (r + 1) * region_extent)`
//! along each axis, so a point exactly on a boundary always belongs to the
//! region with the larger coordinate. The same rule applies to voxel
//! boundaries within a region. This keeps point-to-key assignment
//! reproducible; floating point error must never flip a boundary point
//! between two regions depending on the code path.

use glam::{DVec3, I16Vec3, IVec3, U8Vec3};

/// Address of a single voxel: `(region, local)`.
///
/// The null key is a reserved sentinel which compares unequal to every real
/// key. Accessors on a null key return the sentinel coordinates; callers
/// that cannot tolerate a null key should check [`Key::is_null`] first.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Key {
    region: I16Vec3,
    local: U8Vec3,
}

impl Key {
    /// The reserved null key.
    pub const NULL: Key = Key {
        region: I16Vec3::new(i16::MIN, i16::MIN, i16::MIN),
        local: U8Vec3::new(u8::MAX, u8::MAX, u8::MAX),
    };

    /// Create a key from region and local coordinates.
    #[inline]
    pub fn new(region: I16Vec3, local: U8Vec3) -> Self {
        Self { region, local }
    }

    /// Key addressing the first voxel of `region`.
    #[inline]
    pub fn region_origin(region: I16Vec3) -> Self {
        Self {
            region,
            local: U8Vec3::ZERO,
        }
    }

    /// True when this is the reserved null key.
    #[inline]
    pub fn is_null(&self) -> bool {
        *self == Self::NULL
    }

    /// The region (chunk) coordinate.
    #[inline]
    pub fn region(&self) -> I16Vec3 {
        self.region
    }

    /// The voxel coordinate within the region.
    #[inline]
    pub fn local(&self) -> U8Vec3 {
        self.local
    }

    /// Set a single axis of the region coordinate.
    #[inline]
    pub fn set_region_axis(&mut self, axis: usize, value: i16) {
        self.region[axis] = value;
    }

    /// Set a single axis of the local coordinate.
    #[inline]
    pub fn set_local_axis(&mut self, axis: usize, value: u8) {
        self.local[axis] = value;
    }

    /// True when the local coordinate fits `dims` on every axis.
    #[inline]
    pub fn is_local_valid(&self, dims: U8Vec3) -> bool {
        self.local.x < dims.x && self.local.y < dims.y && self.local.z < dims.z
    }

    /// Linear index of the local coordinate for a region of `dims` voxels.
    ///
    /// Voxels are ordered x-fastest: `x + y * dx + z * dx * dy`.
    #[inline]
    pub fn local_index(&self, dims: U8Vec3) -> usize {
        voxel_index(self.local, dims)
    }

    /// Advance one voxel along `axis` in direction `dir` (+1 or -1),
    /// carrying into the region coordinate at chunk boundaries.
    ///
    /// At the extremes of the region coordinate range the key saturates:
    /// stepping outward from a voxel in region `i16::MAX`/`i16::MIN` leaves
    /// the key unchanged rather than wrapping.
    pub fn step(&mut self, axis: usize, dir: i32, dims: U8Vec3) {
        debug_assert!(axis < 3);
        debug_assert!(dir == 1 || dir == -1);

        let mut local = self.local[axis] as i32 + dir;
        let mut region = self.region[axis] as i32;
        if local < 0 {
            region -= 1;
            local = dims[axis] as i32 - 1;
        } else if local >= dims[axis] as i32 {
            region += 1;
            local = 0;
        }

        if region < i16::MIN as i32 || region > i16::MAX as i32 {
            // Saturate at the addressable extent.
            return;
        }

        self.region[axis] = region as i16;
        self.local[axis] = local as u8;
    }

    /// Signed voxel delta `to - from`, counting across region boundaries.
    pub fn range_to(&self, to: &Key, dims: U8Vec3) -> IVec3 {
        let region_diff = IVec3::new(
            to.region.x as i32 - self.region.x as i32,
            to.region.y as i32 - self.region.y as i32,
            to.region.z as i32 - self.region.z as i32,
        );
        let mut delta = IVec3::ZERO;
        for axis in 0..3 {
            delta[axis] = to.local[axis] as i32 - self.local[axis] as i32
                + region_diff[axis] * dims[axis] as i32;
        }
        delta
    }
}

impl Default for Key {
    fn default() -> Self {
        Self::NULL
    }
}

/// Linear voxel index within a region of `dims` voxels, x-fastest.
#[inline]
pub fn voxel_index(local: U8Vec3, dims: U8Vec3) -> usize {
    local.x as usize + local.y as usize * dims.x as usize
        + local.z as usize * dims.x as usize * dims.y as usize
}

/// Inverse of [`voxel_index`].
#[inline]
pub fn local_from_index(index: usize, dims: U8Vec3) -> U8Vec3 {
    let dx = dims.x as usize;
    let dy = dims.y as usize;
    U8Vec3::new(
        (index % dx) as u8,
        ((index / dx) % dy) as u8,
        (index / (dx * dy)) as u8,
    )
}

/// Map a point in map-local coordinates (already relative to the map origin)
/// to the key of the voxel containing it.
///
/// This is the single source of truth for point-to-key assignment; the map
/// front end and the device kernel both resolve keys through it so the two
/// integration paths can never disagree on boundary assignment.
pub fn voxel_key_local(
    point_local: DVec3,
    region_extent: DVec3,
    dims: U8Vec3,
    resolution: f64,
) -> Key {
    let mut region = I16Vec3::ZERO;
    let mut local = U8Vec3::ZERO;
    for axis in 0..3 {
        let r = (point_local[axis] / region_extent[axis]).floor();
        let r = r.clamp(i16::MIN as f64, i16::MAX as f64) as i16;
        region[axis] = r;

        let region_min = r as f64 * region_extent[axis];
        let v = ((point_local[axis] - region_min) / resolution).floor();
        local[axis] = v.clamp(0.0, dims[axis] as f64 - 1.0) as u8;
    }
    Key::new(region, local)
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIMS: U8Vec3 = U8Vec3::new(32, 32, 32);

    #[test]
    fn test_null_key() {
        let null = Key::NULL;
        assert!(null.is_null());
        assert_ne!(null, Key::new(I16Vec3::ZERO, U8Vec3::ZERO));
        assert_eq!(Key::default(), Key::NULL);
    }

    #[test]
    fn test_step_within_region() {
        let mut key = Key::new(I16Vec3::ZERO, U8Vec3::new(5, 5, 5));
        key.step(0, 1, DIMS);
        assert_eq!(key.local(), U8Vec3::new(6, 5, 5));
        assert_eq!(key.region(), I16Vec3::ZERO);
    }

    #[test]
    fn test_step_carries_across_region_boundary() {
        let mut key = Key::new(I16Vec3::ZERO, U8Vec3::new(31, 0, 0));
        key.step(0, 1, DIMS);
        assert_eq!(key.region(), I16Vec3::new(1, 0, 0));
        assert_eq!(key.local(), U8Vec3::new(0, 0, 0));

        key.step(0, -1, DIMS);
        assert_eq!(key.region(), I16Vec3::ZERO);
        assert_eq!(key.local(), U8Vec3::new(31, 0, 0));
    }

    #[test]
    fn test_step_saturates_at_extents() {
        let mut key = Key::new(I16Vec3::new(i16::MAX, 0, 0), U8Vec3::new(31, 0, 0));
        let before = key;
        key.step(0, 1, DIMS);
        assert_eq!(key, before);

        let mut key = Key::new(I16Vec3::new(i16::MIN, 0, 0), U8Vec3::new(0, 0, 0));
        let before = key;
        key.step(0, -1, DIMS);
        assert_eq!(key, before);
    }

    #[test]
    fn test_range_to() {
        let a = Key::new(I16Vec3::ZERO, U8Vec3::new(30, 0, 0));
        let b = Key::new(I16Vec3::new(1, 0, 0), U8Vec3::new(2, 0, 0));
        assert_eq!(a.range_to(&b, DIMS), IVec3::new(4, 0, 0));
        assert_eq!(b.range_to(&a, DIMS), IVec3::new(-4, 0, 0));
    }

    #[test]
    fn test_voxel_index_round_trip() {
        for &local in &[
            U8Vec3::new(0, 0, 0),
            U8Vec3::new(31, 0, 0),
            U8Vec3::new(3, 17, 29),
            U8Vec3::new(31, 31, 31),
        ] {
            let idx = voxel_index(local, DIMS);
            assert_eq!(local_from_index(idx, DIMS), local);
        }
    }

    #[test]
    fn test_voxel_key_local_boundaries() {
        let extent = DVec3::splat(3.2);
        // A point exactly on a region boundary belongs to the region with
        // the larger coordinate.
        let key = voxel_key_local(DVec3::new(3.2, 0.0, 0.0), extent, DIMS, 0.1);
        assert_eq!(key.region(), I16Vec3::new(1, 0, 0));
        assert_eq!(key.local().x, 0);

        // Just below the boundary stays in the lower region's last voxel.
        let key = voxel_key_local(DVec3::new(3.2 - 1e-9, 0.0, 0.0), extent, DIMS, 0.1);
        assert_eq!(key.region(), I16Vec3::new(0, 0, 0));
        assert_eq!(key.local().x, 31);

        // Negative coordinates floor toward negative infinity.
        let key = voxel_key_local(DVec3::new(-0.05, 0.0, 0.0), extent, DIMS, 0.1);
        assert_eq!(key.region(), I16Vec3::new(-1, 0, 0));
        assert_eq!(key.local().x, 31);
    }
}
