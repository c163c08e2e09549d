//! Accelerated map front end: the double-buffered ray integration
//! pipeline.
//!
//! Two pipeline slots alternate so host-side preparation of one batch
//! overlaps device execution of the previous one. Each slot owns a ray
//! buffer, a region-key buffer, a region-offset buffer and the four events
//! tracking their uploads and the kernel launch. A slot is reused only
//! after all four events have completed.
//!
//! Per batch: filter rays, collect the set of regions the rays intersect,
//! make each region's occupancy slice resident through the layer cache,
//! upload rays and region tables, then launch the region-update kernel
//! behind the three upload events. A full cache mid-batch is recovered by
//! submitting what has been gathered so far and retrying the failed region
//! against the freed pages; only a retry failure surfaces as an error.

use std::collections::HashSet;

use glam::{DQuat, DVec3, I16Vec3};

use crate::config::MapConfig;
use crate::core::Aabb;
use crate::device::{Device, DeviceBuffer, Event, PinMode, PinnedBuffer};
use crate::error::{MapError, Result};
use crate::layout::MapLayout;
use crate::map::filter::good_ray;
use crate::map::integrate::{MapperKind, RayFlags, RayMapper, SensorRays};
use crate::map::traversal::RegionWalk;
use crate::map::OccupancyMap;

use super::cache::{GpuCache, OCCUPANCY_CACHE};
use super::kernel::{enqueue_region_update, RegionUpdateParams};
use super::layer_cache::CacheStatus;

/// Default maximum ray length on the accelerated path (metres).
pub const DEFAULT_MAX_RANGE: f64 = 500.0;

const SLOT_COUNT: usize = 2;

/// A time-tagged sensor trajectory: one translation and rotation per time.
#[derive(Clone, Copy, Debug)]
pub struct SensorTransforms<'a> {
    /// Sample times, ascending.
    pub times: &'a [f64],
    /// Sensor positions.
    pub translations: &'a [DVec3],
    /// Sensor orientations.
    pub rotations: &'a [DQuat],
}

impl<'a> SensorTransforms<'a> {
    /// Number of usable transform samples.
    pub fn len(&self) -> usize {
        self.times
            .len()
            .min(self.translations.len())
            .min(self.rotations.len())
    }

    /// True when no transform is available.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Interpolate the trajectory at `time` (clamped to the covered
    /// interval).
    pub fn sample(&self, time: f64) -> (DVec3, DQuat) {
        let len = self.len();
        debug_assert!(len > 0);
        let upper = self.times[..len].partition_point(|&t| t < time);
        if upper == 0 {
            return (self.translations[0], self.rotations[0]);
        }
        if upper >= len {
            return (self.translations[len - 1], self.rotations[len - 1]);
        }
        let t0 = self.times[upper - 1];
        let t1 = self.times[upper];
        let s = if t1 > t0 { (time - t0) / (t1 - t0) } else { 0.0 };
        let translation = self.translations[upper - 1].lerp(self.translations[upper], s);
        let rotation = self.rotations[upper - 1].slerp(self.rotations[upper], s);
        (translation, rotation.normalize())
    }
}

/// Occupancy map with a device-resident ray integration pipeline.
///
/// Owns the map and its device cache; structural operations (layout
/// changes, culling, clearing) go through this front end so map and cache
/// stay consistent.
pub struct GpuMap {
    map: OccupancyMap,
    cache: GpuCache,
    max_range: f64,

    ray_buffers: [DeviceBuffer; SLOT_COUNT],
    region_key_buffers: [DeviceBuffer; SLOT_COUNT],
    region_offset_buffers: [DeviceBuffer; SLOT_COUNT],
    ray_upload_events: [Event; SLOT_COUNT],
    region_key_upload_events: [Event; SLOT_COUNT],
    region_offset_upload_events: [Event; SLOT_COUNT],
    region_update_events: [Event; SLOT_COUNT],
    ray_counts: [usize; SLOT_COUNT],
    region_counts: [usize; SLOT_COUNT],
    next_buffers_index: usize,
    batch_marker: u64,

    regions: Vec<I16Vec3>,
    region_set: HashSet<I16Vec3>,
    bad_rays: u64,
    cache_full_retries: u64,
}

impl GpuMap {
    /// Take over `map`, bringing up a device and its layer caches.
    pub fn new(map: OccupancyMap, target_layer_mem: usize, mappable: bool) -> Result<GpuMap> {
        let device = Device::new();
        let mut cache = GpuCache::new(device, target_layer_mem, mappable);
        cache.reinitialise(&map);
        if cache.layer_cache(OCCUPANCY_CACHE).is_none() {
            return Err(MapError::LayoutMismatch(
                "map layout has no occupancy layer".to_string(),
            ));
        }
        log::info!(
            "accelerated mapping enabled: {} bytes target layer memory",
            cache.target_layer_mem()
        );

        const PREALLOC_RAYS: usize = 2048;
        const PREALLOC_REGIONS: usize = 1024;
        let ray_bytes = PREALLOC_RAYS * 2 * std::mem::size_of::<[f32; 4]>();
        let key_bytes = PREALLOC_REGIONS * std::mem::size_of::<[i32; 3]>();
        let offset_bytes = PREALLOC_REGIONS * std::mem::size_of::<u64>();

        Ok(GpuMap {
            map,
            cache,
            max_range: DEFAULT_MAX_RANGE,
            ray_buffers: [DeviceBuffer::new(ray_bytes), DeviceBuffer::new(ray_bytes)],
            region_key_buffers: [DeviceBuffer::new(key_bytes), DeviceBuffer::new(key_bytes)],
            region_offset_buffers: [
                DeviceBuffer::new(offset_bytes),
                DeviceBuffer::new(offset_bytes),
            ],
            ray_upload_events: Default::default(),
            region_key_upload_events: Default::default(),
            region_offset_upload_events: Default::default(),
            region_update_events: Default::default(),
            ray_counts: [0; SLOT_COUNT],
            region_counts: [0; SLOT_COUNT],
            next_buffers_index: 0,
            batch_marker: 0,
            regions: Vec::new(),
            region_set: HashSet::new(),
            bad_rays: 0,
            cache_full_retries: 0,
        })
    }

    /// Build the map from a configuration and take it over.
    pub fn from_config(config: &MapConfig) -> Result<GpuMap> {
        let map = OccupancyMap::with_config(config);
        let mut gpu = Self::new(map, config.gpu_target_layer_mem, config.mappable_buffers)?;
        gpu.max_range = config.max_range_filter;
        Ok(gpu)
    }

    /// The wrapped map.
    pub fn map(&self) -> &OccupancyMap {
        &self.map
    }

    /// Mutable access to the wrapped map.
    ///
    /// Layout changes must go through [`GpuMap::set_layout`] instead so the
    /// device cache is evicted and rebuilt around them.
    pub fn map_mut(&mut self) -> &mut OccupancyMap {
        &mut self.map
    }

    /// The device cache set.
    pub fn cache_mut(&mut self) -> &mut GpuCache {
        &mut self.cache
    }

    /// Maximum accepted ray length.
    pub fn max_range_filter(&self) -> f64 {
        self.max_range
    }

    /// Set the maximum accepted ray length.
    pub fn set_max_range_filter(&mut self, range: f64) {
        self.max_range = range;
    }

    /// Rays dropped by the NaN/range filter so far.
    pub fn bad_ray_count(&self) -> u64 {
        self.bad_rays
    }

    /// Batches submitted early because the cache filled mid-batch.
    pub fn cache_full_retry_count(&self) -> u64 {
        self.cache_full_retries
    }

    /// Write every dirty device page back into the map. Blocks on
    /// outstanding kernels for the affected pages.
    pub fn sync(&mut self) {
        let GpuMap { map, cache, .. } = self;
        cache.sync_to_host(map);
    }

    /// Write back the occupancy layer only.
    pub fn sync_occupancy(&mut self) {
        self.sync_layer(OCCUPANCY_CACHE);
    }

    /// Write back a single cache slot (see the constants in
    /// [`crate::gpu::cache`]).
    pub fn sync_layer(&mut self, slot: usize) {
        let GpuMap { map, cache, .. } = self;
        if let Some(layer_cache) = cache.layer_cache(slot) {
            layer_cache.sync_to_host(map);
        }
    }

    /// Drain the pipeline, write everything back and return the map.
    pub fn into_map(mut self) -> OccupancyMap {
        self.drain();
        self.sync();
        self.map
    }

    fn drain(&mut self) {
        for slot in 0..SLOT_COUNT {
            self.wait_on_previous_operation(slot);
        }
    }

    /// Remove regions last touched before `before_time` from map and
    /// cache.
    pub fn expire_regions(&mut self, before_time: f64) -> usize {
        let removed = self.map.expire_regions_keys(before_time);
        for region in &removed {
            self.cache.remove(*region);
        }
        removed.len()
    }

    /// Remove regions entirely outside `bounds` from map and cache.
    pub fn cull_outside(&mut self, bounds: &Aabb) -> usize {
        let removed = self.map.cull_outside_keys(bounds);
        for region in &removed {
            self.cache.remove(*region);
        }
        removed.len()
    }

    /// Remove regions centred at least `distance` from `relative_to` from
    /// map and cache.
    pub fn cull_by_distance(&mut self, relative_to: DVec3, distance: f64) -> usize {
        let removed = self.map.cull_by_distance_keys(relative_to, distance);
        for region in &removed {
            self.cache.remove(*region);
        }
        removed.len()
    }

    /// Clear every chunk and every device residency.
    pub fn clear(&mut self) {
        self.drain();
        self.cache.clear();
        self.map.clear();
    }

    /// Replace the map's layout, migrating chunks. The cache is synced
    /// and evicted first and rebuilt for the new layout afterwards.
    pub fn set_layout(&mut self, layout: MapLayout) {
        self.drain();
        self.sync();
        self.cache.clear();
        self.map.set_layout(layout);
        self.cache.reinitialise(&self.map);
    }

    /// Toggle packed sub-voxel positions, migrating chunks; cache handling
    /// as for [`GpuMap::set_layout`].
    pub fn set_sub_voxel_enabled(&mut self, enable: bool) {
        self.drain();
        self.sync();
        self.cache.clear();
        self.map.set_sub_voxel_enabled(enable);
        self.cache.reinitialise(&self.map);
    }

    /// Integrate origin/sample ray pairs through the device pipeline.
    ///
    /// When `end_points_as_occupied` is false, sample voxels receive the
    /// miss adjustment instead of the hit adjustment (erosion mode).
    /// Returns the number of rays accepted into the batch; NaN and
    /// over-range rays are dropped and counted. The map reflects the
    /// update only after a subsequent [`GpuMap::sync`].
    pub fn integrate_rays(
        &mut self,
        rays: &[DVec3],
        end_points_as_occupied: bool,
    ) -> Result<usize> {
        if rays.len() < 2 {
            return Ok(0);
        }

        let mut buf = self.next_buffers_index;
        self.wait_on_previous_operation(buf);

        self.map.touch();
        self.batch_marker = self
            .cache
            .layer_cache(OCCUPANCY_CACHE)
            .expect("occupancy cache present")
            .begin_batch();

        // Filter rays, stage them in map-local single precision (the wire
        // format), and gather the affected region set in discovery order.
        let origin = self.map.origin();
        self.regions.clear();
        self.region_set.clear();
        let mut staging: Vec<[f32; 4]> = Vec::with_capacity(rays.len());
        for pair in rays.chunks_exact(2) {
            if !good_ray(pair[0], pair[1], self.max_range) {
                self.bad_rays += 1;
                self.map.count_rejected_ray();
                continue;
            }
            let start = pair[0] - origin;
            let end = pair[1] - origin;
            staging.push([start.x as f32, start.y as f32, start.z as f32, 0.0]);
            staging.push([end.x as f32, end.y as f32, end.z as f32, 0.0]);

            for region in RegionWalk::through_map(&self.map, pair[0], pair[1]) {
                if self.region_set.insert(region) {
                    self.regions.push(region);
                }
            }
        }
        if staging.is_empty() {
            return Ok(0);
        }
        let ray_count = staging.len() / 2;

        let queue = self.cache.queue().clone();

        // Upload the rays.
        self.ray_buffers[buf].elements_resize::<[f32; 4]>(staging.len());
        let mut ray_pinned = PinnedBuffer::new(&self.ray_buffers[buf], PinMode::Write);
        ray_pinned.write_elements(&staging, 0);
        self.ray_upload_events[buf] = ray_pinned.unpin(&queue, &[]);
        self.ray_counts[buf] = ray_count;

        // Region tables for this slot.
        let regions = std::mem::take(&mut self.regions);
        self.region_key_buffers[buf].elements_resize::<[i32; 3]>(regions.len());
        self.region_offset_buffers[buf].elements_resize::<u64>(regions.len());
        let mut keys_pinned = PinnedBuffer::new(&self.region_key_buffers[buf], PinMode::Write);
        let mut offsets_pinned = PinnedBuffer::new(&self.region_offset_buffers[buf], PinMode::Write);
        self.region_counts[buf] = 0;

        let mut index = 0;
        let mut retried_for: Option<usize> = None;
        while index < regions.len() {
            let region = regions[index];
            let marker = self.batch_marker;
            let upload = {
                let GpuMap { map, cache, .. } = &mut *self;
                cache
                    .layer_cache(OCCUPANCY_CACHE)
                    .expect("occupancy cache present")
                    .upload(map, region, marker, true)
            };

            if upload.status != CacheStatus::CacheFull {
                let entry = self.region_counts[buf];
                keys_pinned.write_elements(
                    &[[region.x as i32, region.y as i32, region.z as i32]],
                    entry,
                );
                offsets_pinned.write_elements(&[upload.offset], entry);
                self.region_counts[buf] = entry + 1;
                index += 1;
                continue;
            }

            if retried_for == Some(index) {
                // Even a fresh batch could not admit this region: the pool
                // is smaller than one batch's working set.
                return Err(MapError::CacheFull);
            }

            // Submit what we have, then retry this region against the
            // freed pages.
            log::debug!("region cache full mid-batch; submitting {} regions early", self.region_counts[buf]);
            self.cache_full_retries += 1;
            retried_for = Some(index);

            self.finalise_batch(buf, keys_pinned, offsets_pinned, end_points_as_occupied);

            let previous = buf;
            buf = self.next_buffers_index;
            self.wait_on_previous_operation(buf);

            // The new slot reuses the rays already on the device.
            self.ray_buffers[buf].elements_resize::<[f32; 4]>(staging.len());
            self.ray_upload_events[buf] =
                self.ray_buffers[buf].copy_from(&self.ray_buffers[previous], &queue, &[]);
            self.ray_counts[buf] = ray_count;

            let remaining = regions.len() - index;
            self.region_key_buffers[buf].elements_resize::<[i32; 3]>(remaining);
            self.region_offset_buffers[buf].elements_resize::<u64>(remaining);
            keys_pinned = PinnedBuffer::new(&self.region_key_buffers[buf], PinMode::Write);
            offsets_pinned = PinnedBuffer::new(&self.region_offset_buffers[buf], PinMode::Write);
            self.region_counts[buf] = 0;
        }

        self.finalise_batch(buf, keys_pinned, offsets_pinned, end_points_as_occupied);
        self.regions = regions;

        if let Some(message) = self.cache.device().take_error() {
            return Err(MapError::Device(message));
        }
        Ok(ray_count)
    }

    /// Integrate time-tagged sensor-local samples: each sample is placed
    /// in the world through the interpolated trajectory, producing an
    /// (origin, sample) ray integrated through the device pipeline.
    pub fn integrate_local_rays(
        &mut self,
        transforms: &SensorTransforms<'_>,
        sample_times: &[f64],
        local_samples: &[DVec3],
        end_points_as_occupied: bool,
    ) -> Result<usize> {
        if transforms.is_empty() || local_samples.is_empty() {
            return Ok(0);
        }
        let count = sample_times.len().min(local_samples.len());
        let mut rays = Vec::with_capacity(count * 2);
        for i in 0..count {
            let (translation, rotation) = transforms.sample(sample_times[i]);
            rays.push(translation);
            rays.push(translation + rotation * local_samples[i]);
        }
        self.integrate_rays(&rays, end_points_as_occupied)
    }

    fn wait_on_previous_operation(&mut self, slot: usize) {
        // The kernel-done event is known to complete last, but each event
        // is drained so a failed launch cannot leak a pending upload.
        for events in [
            &mut self.region_update_events,
            &mut self.ray_upload_events,
            &mut self.region_key_upload_events,
            &mut self.region_offset_upload_events,
        ] {
            events[slot].wait();
            events[slot].release();
        }
    }

    fn finalise_batch(
        &mut self,
        buf: usize,
        keys_pinned: PinnedBuffer,
        offsets_pinned: PinnedBuffer,
        end_points_as_occupied: bool,
    ) {
        let queue = self.cache.queue().clone();
        self.region_key_upload_events[buf] = keys_pinned.unpin(&queue, &[]);
        self.region_offset_upload_events[buf] = offsets_pinned.unpin(&queue, &[]);

        let params = self.map.occupancy_params();
        let occupancy_layer = self
            .map
            .layout()
            .occupancy_layer()
            .expect("occupancy layer present");
        let kernel_params = RegionUpdateParams {
            region_dims: self.map.region_voxel_dims(),
            resolution: self.map.resolution(),
            miss_adjust: params.miss_value,
            hit_adjust: if end_points_as_occupied {
                params.hit_value
            } else {
                params.miss_value
            },
            min_value: params.min_value,
            max_value: params.max_value,
            saturate_min: params.saturate_at_min,
            saturate_max: params.saturate_at_max,
            voxel_stride_words: self.map.layout().layer(occupancy_layer).voxel_words(),
        };

        let wait = [
            self.ray_upload_events[buf].clone(),
            self.region_key_upload_events[buf].clone(),
            self.region_offset_upload_events[buf].clone(),
        ];
        let occ_cache = self
            .cache
            .layer_cache(OCCUPANCY_CACHE)
            .expect("occupancy cache present");
        let done = enqueue_region_update(
            &queue,
            occ_cache.buffer(),
            &self.region_key_buffers[buf],
            &self.region_offset_buffers[buf],
            self.region_counts[buf],
            &self.ray_buffers[buf],
            self.ray_counts[buf],
            kernel_params,
            &wait,
        );
        occ_cache.update_events(self.batch_marker, &done);
        self.region_update_events[buf] = done;

        self.region_counts[buf] = 0;
        self.batch_marker = occ_cache.begin_batch();
        self.next_buffers_index = 1 - self.next_buffers_index;
    }
}

impl RayMapper for GpuMap {
    fn kind(&self) -> MapperKind {
        MapperKind::Accelerated
    }

    fn integrate(&mut self, rays: &SensorRays<'_>, flags: RayFlags) -> usize {
        let end_points_as_occupied = !flags.contains(RayFlags::END_POINT_AS_FREE);
        match self.integrate_rays(rays.points, end_points_as_occupied) {
            Ok(count) => count,
            Err(error) => {
                log::error!("accelerated ray integration failed: {error}");
                0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::MapFlags;
    use glam::U8Vec3;

    fn gpu_map() -> GpuMap {
        let map = OccupancyMap::new(0.1, U8Vec3::splat(32), MapFlags::NONE);
        GpuMap::new(map, 8 * 1024 * 1024, true).expect("gpu map")
    }

    #[test]
    fn test_empty_batches_are_noops() {
        let mut gpu = gpu_map();
        assert_eq!(gpu.integrate_rays(&[], true).expect("empty"), 0);
        let nan = [DVec3::new(f64::NAN, 0.0, 0.0), DVec3::ZERO];
        assert_eq!(gpu.integrate_rays(&nan, true).expect("filtered"), 0);
        assert_eq!(gpu.bad_ray_count(), 1);
        assert_eq!(gpu.map().region_count(), 0);
    }

    #[test]
    fn test_single_batch_updates_map_after_sync() {
        let mut gpu = gpu_map();
        let rays = [DVec3::ZERO, DVec3::new(0.45, 0.0, 0.0)];
        assert_eq!(gpu.integrate_rays(&rays, true).expect("batch"), 1);

        // Nothing observable before sync is required, everything after.
        gpu.sync();
        let map = gpu.map();
        let sample = map.voxel_key(DVec3::new(0.45, 0.05, 0.05));
        let value = map.value(sample).expect("observed");
        assert!((value - map.hit_value()).abs() < 1e-5);
        let first = map.voxel_key(DVec3::new(0.05, 0.05, 0.05));
        let value = map.value(first).expect("observed");
        assert!((value - map.miss_value()).abs() < 1e-5);
    }

    #[test]
    fn test_end_points_as_free() {
        let mut gpu = gpu_map();
        let rays = [DVec3::ZERO, DVec3::new(0.45, 0.0, 0.0)];
        gpu.integrate_rays(&rays, false).expect("batch");
        gpu.sync();
        let map = gpu.map();
        let sample = map.voxel_key(DVec3::new(0.45, 0.05, 0.05));
        let value = map.value(sample).expect("observed");
        assert!((value - map.miss_value()).abs() < 1e-5);
    }

    #[test]
    fn test_local_ray_transforms() {
        let mut gpu = gpu_map();
        let times = [0.0, 1.0];
        let translations = [DVec3::ZERO, DVec3::new(1.0, 0.0, 0.0)];
        let rotations = [DQuat::IDENTITY, DQuat::IDENTITY];
        let transforms = SensorTransforms {
            times: &times,
            translations: &translations,
            rotations: &rotations,
        };
        // A sample half way through the trajectory.
        let integrated = gpu
            .integrate_local_rays(
                &transforms,
                &[0.5],
                &[DVec3::new(0.4, 0.0, 0.0)],
                true,
            )
            .expect("batch");
        assert_eq!(integrated, 1);
        gpu.sync();

        let map = gpu.map();
        let sample = map.voxel_key(DVec3::new(0.9, 0.0, 0.0));
        assert!(map.value(sample).is_some());
        assert!(map.occupancy_params().is_occupied(map.value(sample).expect("observed")));
    }
}
