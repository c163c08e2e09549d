//! The region-update kernel.
//!
//! # Contract
//!
//! Any backend kernel invoked through [`enqueue_region_update`] must
//! satisfy the following, which the host execution below implements:
//!
//! - **Inputs**: the occupancy page pool as a flat word buffer; a
//!   region-key buffer of `N` packed `[i32; 3]` entries; a region-offset
//!   buffer of `N` byte offsets into the pool (each a page start); a ray
//!   buffer of `2 * M` four-float entries (`[x, y, z, pad]`, map-local
//!   coordinates, origin then sample per ray); region voxel dimensions;
//!   voxel resolution; miss and hit adjustments (equal when sample points
//!   are to be treated as free space); value clamps and saturation flags;
//!   the occupancy voxel stride in words. The occupancy value occupies
//!   word 0 of each voxel record; any further words (packed sub-voxel
//!   position) are left untouched.
//! - **Grid**: one work item per `(region, ray)` pair, `N * M` items.
//! - **Per item**: walk the ray's voxels front to back; apply the miss
//!   adjustment to every walked voxel lying in this region, excluding the
//!   sample voxel; if the sample voxel lies in this region, apply the hit
//!   adjustment there.
//! - **Atomicity**: voxel updates use compare-and-swap loops in log-odds
//!   space, as multiple rays of one batch may touch the same voxel.
//!   Updates are otherwise unordered.
//! - **Value semantics**: identical to the scalar path: the never-observed
//!   sentinel starts from log-odds zero, results clamp to
//!   `[min_value, max_value]`, and a voxel resting on a clamp boundary
//!   only moves when the matching saturation flag permits. Voxel walking
//!   and boundary tie-breaks use the same arithmetic as the host walk, so
//!   the two paths agree up to floating-point summation order.

use std::sync::atomic::{AtomicU32, Ordering};

use glam::{DVec3, I16Vec3, U8Vec3};
use rayon::prelude::*;

use crate::core::{voxel_key_local, Aabb, OccupancyParams};
use crate::device::{DeviceBuffer, Event, Queue};
use crate::map::traversal::GridWalk;

/// Scalar parameters of one region-update launch.
#[derive(Clone, Copy, Debug)]
pub struct RegionUpdateParams {
    /// Voxels per region per axis.
    pub region_dims: U8Vec3,
    /// Voxel edge length in metres.
    pub resolution: f64,
    /// Log-odds adjustment for walked voxels.
    pub miss_adjust: f32,
    /// Log-odds adjustment for sample voxels.
    pub hit_adjust: f32,
    /// Lower value clamp.
    pub min_value: f32,
    /// Upper value clamp.
    pub max_value: f32,
    /// Keep voxels mobile at the lower clamp.
    pub saturate_min: bool,
    /// Keep voxels mobile at the upper clamp.
    pub saturate_max: bool,
    /// Words per voxel in the occupancy page layout.
    pub voxel_stride_words: usize,
}

/// Enqueue a region-update launch. The kernel runs after every event in
/// `wait`; the returned event completes with the kernel.
#[allow(clippy::too_many_arguments)]
pub(crate) fn enqueue_region_update(
    queue: &Queue,
    pool: &DeviceBuffer,
    region_keys: &DeviceBuffer,
    region_offsets: &DeviceBuffer,
    region_count: usize,
    rays: &DeviceBuffer,
    ray_count: usize,
    params: RegionUpdateParams,
    wait: &[Event],
) -> Event {
    let pool = pool.clone();
    let region_keys = region_keys.clone();
    let region_offsets = region_offsets.clone();
    let rays = rays.clone();

    queue.submit(wait, move || {
        if region_count == 0 || ray_count == 0 {
            return;
        }
        let mut keys = vec![[0i32; 3]; region_count];
        region_keys.read_elements(&mut keys, 0);
        let mut offsets = vec![0u64; region_count];
        region_offsets.read_elements(&mut offsets, 0);
        let mut ray_points = vec![[0f32; 4]; ray_count * 2];
        rays.read_elements(&mut ray_points, 0);

        pool.with_atomic_words(|pool_words| {
            run_region_update(pool_words, &keys, &offsets, &ray_points, &params);
        });
    })
}

fn run_region_update(
    pool: &[AtomicU32],
    region_keys: &[[i32; 3]],
    region_offsets: &[u64],
    rays: &[[f32; 4]],
    params: &RegionUpdateParams,
) {
    let dims = params.region_dims;
    let resolution = params.resolution;
    let region_extent = dims.as_dvec3() * resolution;
    let stride = params.voxel_stride_words;

    let mut model = OccupancyParams::default();
    model.min_value = params.min_value;
    model.max_value = params.max_value;
    model.saturate_at_min = params.saturate_min;
    model.saturate_at_max = params.saturate_max;

    let ray_count = rays.len() / 2;
    let work_items = region_keys.len() * ray_count;

    (0..work_items).into_par_iter().for_each(|item| {
        let region_index = item / ray_count;
        let ray_index = item % ray_count;

        let raw = region_keys[region_index];
        let region = I16Vec3::new(raw[0] as i16, raw[1] as i16, raw[2] as i16);
        let base_word = (region_offsets[region_index] / 4) as usize;

        let start = vec4_point(rays[ray_index * 2]);
        let end = vec4_point(rays[ray_index * 2 + 1]);

        // Most rays of a batch never enter this work item's region; skip
        // the voxel walk for those.
        let region_min = region.as_dvec3() * region_extent;
        let bounds = Aabb::new(region_min, region_min + region_extent);
        if !bounds.intersects_segment(start, end) {
            return;
        }

        let end_key = voxel_key_local(end, region_extent, dims, resolution);

        for key in GridWalk::new_local(start, end, false, region_extent, dims, resolution) {
            if key.region() == region {
                let word = base_word + key.local_index(dims) * stride;
                atomic_adjust(&pool[word], params.miss_adjust, &model);
            }
        }
        if end_key.region() == region {
            let word = base_word + end_key.local_index(dims) * stride;
            atomic_adjust(&pool[word], params.hit_adjust, &model);
        }
    });
}

#[inline]
fn vec4_point(v: [f32; 4]) -> DVec3 {
    DVec3::new(v[0] as f64, v[1] as f64, v[2] as f64)
}

#[inline]
fn atomic_adjust(cell: &AtomicU32, adjustment: f32, model: &OccupancyParams) {
    let mut current = cell.load(Ordering::Relaxed);
    loop {
        let old = f32::from_bits(current);
        let new_bits = model.adjust(old, adjustment).to_bits();
        if new_bits == current {
            return;
        }
        match cell.compare_exchange_weak(current, new_bits, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => return,
            Err(actual) => current = actual,
        }
    }
}
