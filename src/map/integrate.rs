//! Scalar ray integration.
//!
//! Rays arrive as `(origin, sample)` pairs. Every voxel the ray passes
//! through receives a miss (free-space evidence); the sample voxel receives
//! a hit, plus sub-voxel, sample-mean and incident-normal refinement where
//! those layers are enabled. Behaviour is modulated by [`RayFlags`].
//!
//! Mapper variants share the small [`RayMapper`] capability so callers can
//! hold "something that integrates rays" without caring which: the plain
//! occupancy mapper, the tracing wrapper, or the accelerated front end.

use glam::DVec3;

use crate::core::UNOBSERVED_VALUE;
use crate::map::filter::RayFilterFlags;
use crate::map::traversal::segment_keys;
use crate::map::{ChunkHint, OccupancyMap};

/// Ray integration mode flags.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RayFlags(u32);

impl RayFlags {
    /// Default behaviour: misses along the ray, hit at the sample.
    pub const NONE: RayFlags = RayFlags(0);
    /// Samples only: skip the free-space walk entirely.
    pub const EXCLUDE_RAY: RayFlags = RayFlags(1 << 0);
    /// Erosion only: never update the sample voxel.
    pub const EXCLUDE_SAMPLE: RayFlags = RayFlags(1 << 1);
    /// Only erode already-occupied voxels; leave free/uncertain voxels
    /// untouched along the ray.
    pub const CLEAR_ONLY: RayFlags = RayFlags(1 << 2);
    /// Stop the walk at the first occupied voxel, eroding it, without
    /// reaching the sample.
    pub const STOP_ON_FIRST_OCCUPIED: RayFlags = RayFlags(1 << 3);
    /// Treat the sample point as free space instead of a surface.
    pub const END_POINT_AS_FREE: RayFlags = RayFlags(1 << 4);

    /// True when every flag in `other` is set.
    #[inline]
    pub fn contains(self, other: RayFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for RayFlags {
    type Output = RayFlags;

    fn bitor(self, rhs: RayFlags) -> RayFlags {
        RayFlags(self.0 | rhs.0)
    }
}

/// A batch of sensor rays with optional per-ray metadata.
///
/// `points` holds two entries per ray: the sensor origin followed by the
/// sample point. `timestamps` and `intensities`, when given, carry one
/// entry per ray.
#[derive(Clone, Copy, Debug)]
pub struct SensorRays<'a> {
    /// Origin/sample pairs.
    pub points: &'a [DVec3],
    /// Per-ray acquisition times (seconds).
    pub timestamps: Option<&'a [f64]>,
    /// Per-ray return intensities.
    pub intensities: Option<&'a [f32]>,
}

impl<'a> SensorRays<'a> {
    /// Wrap a plain origin/sample pair buffer.
    pub fn new(points: &'a [DVec3]) -> Self {
        Self {
            points,
            timestamps: None,
            intensities: None,
        }
    }

    /// Attach per-ray timestamps.
    pub fn with_timestamps(mut self, timestamps: &'a [f64]) -> Self {
        self.timestamps = Some(timestamps);
        self
    }

    /// Attach per-ray intensities.
    pub fn with_intensities(mut self, intensities: &'a [f32]) -> Self {
        self.intensities = Some(intensities);
        self
    }

    /// Number of complete rays in the batch.
    #[inline]
    pub fn ray_count(&self) -> usize {
        self.points.len() / 2
    }
}

/// Which mapper variant sits behind a [`RayMapper`] handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MapperKind {
    /// Plain scalar occupancy integration.
    Occupancy,
    /// A tracing wrapper around another mapper.
    Trace,
    /// The device-accelerated pipeline.
    Accelerated,
}

/// Capability shared by all mapper variants.
pub trait RayMapper {
    /// Which variant this is.
    fn kind(&self) -> MapperKind;

    /// Integrate a batch of rays; returns the number of rays integrated
    /// (rejected rays are excluded).
    fn integrate(&mut self, rays: &SensorRays<'_>, flags: RayFlags) -> usize;
}

impl OccupancyMap {
    /// Integrate origin/sample ray pairs into the map.
    ///
    /// Returns the number of rays integrated; rays rejected by the
    /// installed filter are skipped and counted.
    pub fn integrate_rays(&mut self, points: &[DVec3], flags: RayFlags) -> usize {
        self.integrate_sensor_rays(&SensorRays::new(points), flags)
    }

    /// Integrate a sensor ray batch with optional metadata.
    pub fn integrate_sensor_rays(&mut self, rays: &SensorRays<'_>, flags: RayFlags) -> usize {
        let filter = self.ray_filter().cloned();
        let mut hint = ChunkHint::default();
        let mut integrated = 0usize;

        for (ray_index, pair) in rays.points.chunks_exact(2).enumerate() {
            let mut start = pair[0];
            let mut end = pair[1];
            let mut filter_flags = RayFilterFlags::NONE;

            if let Some(filter) = &filter {
                if !filter(&mut start, &mut end, &mut filter_flags) {
                    self.count_rejected_ray();
                    continue;
                }
            }

            // A clipped sample is no longer a surface observation: the end
            // voxel joins the free-space walk instead of receiving a hit.
            let mut clipped = filter_flags.contains(RayFilterFlags::CLIPPED_END);

            if !flags.contains(RayFlags::EXCLUDE_RAY) {
                for key in segment_keys(self, start, end, clipped) {
                    let value = self.value(key).unwrap_or(UNOBSERVED_VALUE);
                    let occupied = self.occupancy_params().is_occupied(value);
                    let stop = flags.contains(RayFlags::STOP_ON_FIRST_OCCUPIED) && occupied;

                    if !flags.contains(RayFlags::CLEAR_ONLY) || occupied {
                        self.apply_miss(key, &mut hint);
                    }
                    if stop {
                        clipped = true;
                        break;
                    }
                }
            }

            if !clipped && !flags.contains(RayFlags::EXCLUDE_SAMPLE) {
                let key = self.voxel_key(end);
                if flags.contains(RayFlags::END_POINT_AS_FREE) {
                    self.apply_miss(key, &mut hint);
                } else {
                    self.apply_hit(key, Some(end), Some(start), &mut hint);
                }
            }

            if let Some(timestamps) = rays.timestamps {
                if let Some(&time) = timestamps.get(ray_index) {
                    let region = self.region_key(end);
                    self.touch_region(region, time, true);
                }
            }

            integrated += 1;
        }

        integrated
    }
}

/// The plain scalar occupancy mapper: owns its map and integrates in
/// place.
pub struct OccupancyRayMapper {
    map: OccupancyMap,
}

impl OccupancyRayMapper {
    /// Wrap a map.
    pub fn new(map: OccupancyMap) -> Self {
        Self { map }
    }

    /// The wrapped map.
    pub fn map(&self) -> &OccupancyMap {
        &self.map
    }

    /// Mutable access to the wrapped map.
    pub fn map_mut(&mut self) -> &mut OccupancyMap {
        &mut self.map
    }

    /// Unwrap the map.
    pub fn into_map(self) -> OccupancyMap {
        self.map
    }
}

impl RayMapper for OccupancyRayMapper {
    fn kind(&self) -> MapperKind {
        MapperKind::Occupancy
    }

    fn integrate(&mut self, rays: &SensorRays<'_>, flags: RayFlags) -> usize {
        self.map.integrate_sensor_rays(rays, flags)
    }
}

/// Tracing wrapper: forwards to a base mapper while logging and counting
/// batches.
pub struct TraceRayMapper<M: RayMapper> {
    inner: M,
    batches: u64,
    rays: u64,
}

impl<M: RayMapper> TraceRayMapper<M> {
    /// Wrap a base mapper.
    pub fn new(inner: M) -> Self {
        Self {
            inner,
            batches: 0,
            rays: 0,
        }
    }

    /// The wrapped mapper.
    pub fn inner(&self) -> &M {
        &self.inner
    }

    /// Mutable access to the wrapped mapper.
    pub fn inner_mut(&mut self) -> &mut M {
        &mut self.inner
    }

    /// Unwrap the base mapper.
    pub fn into_inner(self) -> M {
        self.inner
    }

    /// Batches forwarded so far.
    pub fn batch_count(&self) -> u64 {
        self.batches
    }

    /// Rays forwarded so far (after per-ray rejection).
    pub fn ray_count(&self) -> u64 {
        self.rays
    }
}

impl<M: RayMapper> RayMapper for TraceRayMapper<M> {
    fn kind(&self) -> MapperKind {
        MapperKind::Trace
    }

    fn integrate(&mut self, rays: &SensorRays<'_>, flags: RayFlags) -> usize {
        log::trace!(
            "integrating batch {}: {} rays, flags {flags:?}",
            self.batches,
            rays.ray_count()
        );
        let integrated = self.inner.integrate(rays, flags);
        self.batches += 1;
        self.rays += integrated as u64;
        integrated
    }
}
