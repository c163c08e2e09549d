//! Segment traversal over voxels and regions.
//!
//! Both walkers implement the Amanatides & Woo 3D-DDA ("A Faster Voxel
//! Traversal Algorithm for Ray Tracing"): per axis, track the ray parameter
//! of the next boundary crossing (`t_max`) and the parameter distance
//! between crossings (`t_delta`); repeatedly advance along the axis whose
//! crossing comes first.
//!
//! [`GridWalk`] steps voxel keys and is shared verbatim by the scalar
//! integrator and the device kernel, so the two paths cannot disagree on
//! which voxels a ray covers. [`RegionWalk`] is the coarse variant stepping
//! whole regions; it yields the start region first, the end region last and
//! every region exactly once.
//!
//! Both walkers work in map-local coordinates (world minus map origin) and
//! terminate for zero-length segments by yielding the single end voxel.

use glam::{DVec3, I16Vec3, U8Vec3};

use crate::core::{voxel_key_local, Key};
use crate::map::OccupancyMap;

/// Pick the axis with the nearest boundary crossing.
///
/// The tie-break order is fixed; it is part of the walk's determinism
/// contract across integration paths.
#[inline]
fn min_axis(t_max: DVec3) -> usize {
    if t_max.x < t_max.z {
        if t_max.x < t_max.y {
            0
        } else {
            1
        }
    } else if t_max.y < t_max.z {
        1
    } else {
        2
    }
}

/// Voxel-stepping segment walk.
pub struct GridWalk {
    current: Key,
    end: Key,
    t_max: DVec3,
    t_delta: DVec3,
    step: [i32; 3],
    length: f64,
    dims: U8Vec3,
    include_end: bool,
    done: bool,
}

impl GridWalk {
    /// Walk the voxels intersected by a segment given in map-local
    /// coordinates.
    ///
    /// When `include_end` is false the segment's final voxel is suppressed;
    /// the caller typically treats it separately (sample voxel handling).
    pub fn new_local(
        start: DVec3,
        end: DVec3,
        include_end: bool,
        region_extent: DVec3,
        dims: U8Vec3,
        resolution: f64,
    ) -> Self {
        let start_key = voxel_key_local(start, region_extent, dims, resolution);
        let end_key = voxel_key_local(end, region_extent, dims, resolution);
        let direction = end - start;
        let length = direction.length();

        let mut walk = Self {
            current: start_key,
            end: end_key,
            t_max: DVec3::splat(f64::MAX),
            t_delta: DVec3::splat(f64::MAX),
            step: [0; 3],
            length,
            dims,
            include_end,
            done: false,
        };

        if start_key == end_key || length < f64::EPSILON {
            walk.current = end_key;
            return walk;
        }

        let dir = direction / length;
        let voxel_min = start_key.region().as_dvec3() * region_extent
            + start_key.local().as_dvec3() * resolution;
        for axis in 0..3 {
            if dir[axis] != 0.0 {
                let inv = 1.0 / dir[axis];
                walk.step[axis] = if dir[axis] > 0.0 { 1 } else { -1 };
                walk.t_delta[axis] = resolution * inv.abs();
                let next_boundary =
                    voxel_min[axis] + if walk.step[axis] > 0 { resolution } else { 0.0 };
                walk.t_max[axis] = (next_boundary - start[axis]) * inv;
            }
        }
        walk
    }

    /// Walk the voxels intersected by a world-space segment of `map`.
    pub fn through_map(map: &OccupancyMap, start: DVec3, end: DVec3, include_end: bool) -> Self {
        Self::new_local(
            start - map.origin(),
            end - map.origin(),
            include_end,
            map.region_spatial_dims(),
            map.region_voxel_dims(),
            map.resolution(),
        )
    }
}

impl Iterator for GridWalk {
    type Item = Key;

    fn next(&mut self) -> Option<Key> {
        if self.done {
            return None;
        }
        if self.current == self.end {
            self.done = true;
            return self.include_end.then_some(self.end);
        }

        let out = self.current;
        let axis = min_axis(self.t_max);
        if self.t_max[axis] >= self.length {
            // No further boundary crossing inside the segment: close on the
            // end voxel directly. Guards against accumulated rounding ever
            // walking past the end key.
            self.current = self.end;
        } else {
            self.t_max[axis] += self.t_delta[axis];
            self.current.step(axis, self.step[axis], self.dims);
        }
        Some(out)
    }
}

/// Collect the keys of every voxel a world-space segment intersects.
pub fn segment_keys(map: &OccupancyMap, start: DVec3, end: DVec3, include_end: bool) -> Vec<Key> {
    GridWalk::through_map(map, start, end, include_end).collect()
}

/// Region-stepping segment walk.
pub struct RegionWalk {
    current: I16Vec3,
    end: I16Vec3,
    t_max: DVec3,
    t_delta: DVec3,
    step: [i32; 3],
    length: f64,
    done: bool,
}

impl RegionWalk {
    /// Walk the regions intersected by a segment given in map-local
    /// coordinates.
    pub fn new_local(start: DVec3, end: DVec3, region_extent: DVec3) -> Self {
        let start_region = region_of(start, region_extent);
        let end_region = region_of(end, region_extent);
        let direction = end - start;
        let length = direction.length();

        let mut walk = Self {
            current: start_region,
            end: end_region,
            t_max: DVec3::splat(f64::MAX),
            t_delta: DVec3::splat(f64::MAX),
            step: [0; 3],
            length,
            done: false,
        };

        if start_region == end_region || length < f64::EPSILON {
            walk.current = end_region;
            return walk;
        }

        let dir = direction / length;
        let region_min = start_region.as_dvec3() * region_extent;
        for axis in 0..3 {
            if dir[axis] != 0.0 {
                let inv = 1.0 / dir[axis];
                walk.step[axis] = if dir[axis] > 0.0 { 1 } else { -1 };
                walk.t_delta[axis] = region_extent[axis] * inv.abs();
                let next_boundary = region_min[axis]
                    + if walk.step[axis] > 0 {
                        region_extent[axis]
                    } else {
                        0.0
                    };
                walk.t_max[axis] = (next_boundary - start[axis]) * inv;
            }
        }
        walk
    }

    /// Walk the regions intersected by a world-space segment of `map`.
    pub fn through_map(map: &OccupancyMap, start: DVec3, end: DVec3) -> Self {
        Self::new_local(
            start - map.origin(),
            end - map.origin(),
            map.region_spatial_dims(),
        )
    }
}

#[inline]
fn region_of(point_local: DVec3, region_extent: DVec3) -> I16Vec3 {
    let mut region = I16Vec3::ZERO;
    for axis in 0..3 {
        let r = (point_local[axis] / region_extent[axis]).floor();
        region[axis] = r.clamp(i16::MIN as f64, i16::MAX as f64) as i16;
    }
    region
}

impl Iterator for RegionWalk {
    type Item = I16Vec3;

    fn next(&mut self) -> Option<I16Vec3> {
        if self.done {
            return None;
        }
        if self.current == self.end {
            self.done = true;
            return Some(self.end);
        }

        let out = self.current;
        let axis = min_axis(self.t_max);
        if self.t_max[axis] >= self.length {
            self.current = self.end;
        } else {
            self.t_max[axis] += self.t_delta[axis];
            let stepped = self.current[axis] as i32 + self.step[axis];
            if (i16::MIN as i32..=i16::MAX as i32).contains(&stepped) {
                self.current[axis] = stepped as i16;
            } else {
                self.current = self.end;
            }
        }
        Some(out)
    }
}
