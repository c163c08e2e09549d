//! The sparse chunked occupancy map.
//!
//! Voxel storage is a hash map from region coordinate to [`MapChunk`];
//! chunks are created lazily the first time a voxel in their region is
//! written and destroyed by culling policies or [`OccupancyMap::clear`].
//! Regions are corner-anchored on the map origin (see [`crate::core::Key`]).
//!
//! All mutation goes through `&mut self`, so the structure needs no
//! internal locking; the device pipeline stages copies of chunk data at
//! submission time and never aliases chunk memory from another thread.

mod chunk;
pub mod filter;
pub mod integrate;
pub mod traversal;

pub use chunk::{ChunkFlags, MapChunk};

use std::collections::HashMap;

use glam::{DVec3, I16Vec3, IVec3, U8Vec3, Vec3};

use crate::config::MapConfig;
use crate::core::{
    is_unobserved, subvoxel, voxel_key_local, Aabb, Key, OccupancyParams, OccupancyType,
    UNOBSERVED_VALUE,
};
use crate::core::incident;
use crate::error::{MapError, Result};
use crate::layout::{
    add_voxel_mean_layer, region_volume, MapLayout, INCIDENT_LAYER, MEAN_LAYER, OCCUPANCY_MEMBER,
    SUB_VOXEL_MEMBER,
};
use filter::RayFilter;

/// Map construction flags.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MapFlags(u32);

impl MapFlags {
    /// No optional layers.
    pub const NONE: MapFlags = MapFlags(0);
    /// Maintain a per-voxel sample mean layer.
    pub const VOXEL_MEAN: MapFlags = MapFlags(1 << 0);
    /// Pack a sub-voxel sample position into the occupancy layer.
    pub const SUB_VOXEL_POSITION: MapFlags = MapFlags(1 << 1);
    /// Reserved: transparent chunk compression is not implemented.
    pub const COMPRESSED: MapFlags = MapFlags(1 << 2);

    /// True when every flag in `other` is set.
    #[inline]
    pub fn contains(self, other: MapFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for MapFlags {
    type Output = MapFlags;

    fn bitor(self, rhs: MapFlags) -> MapFlags {
        MapFlags(self.0 | rhs.0)
    }
}

/// Single-slot memo of the most recently written region.
///
/// Carried by the integrators across consecutive voxel writes, which very
/// often land in the same chunk; a matching hint skips the create-on-miss
/// path entirely.
#[derive(Clone, Copy, Debug, Default)]
pub struct ChunkHint {
    region: Option<I16Vec3>,
}

impl ChunkHint {
    /// Forget the memoised region.
    pub fn clear(&mut self) {
        self.region = None;
    }
}

/// Pre-resolved layer indices, recomputed whenever the layout changes.
#[derive(Clone, Copy, Debug, Default)]
struct LayerIndices {
    occupancy: Option<usize>,
    occ_stride: usize,
    occ_member: usize,
    sub_voxel_member: Option<usize>,
    mean: Option<usize>,
    incident: Option<usize>,
}

impl LayerIndices {
    fn compute(layout: &MapLayout) -> Self {
        let occupancy = layout.occupancy_layer();
        let (occ_stride, occ_member, sub_voxel_member) = occupancy
            .map(|i| {
                let layer = layout.layer(i);
                (
                    layer.voxel_words(),
                    layer.member_index(OCCUPANCY_MEMBER).unwrap_or_default(),
                    layer.member_index(SUB_VOXEL_MEMBER),
                )
            })
            .unwrap_or((0, 0, None));
        Self {
            occupancy,
            occ_stride,
            occ_member,
            sub_voxel_member,
            mean: layout.layer_index(MEAN_LAYER),
            incident: layout.layer_index(INCIDENT_LAYER),
        }
    }
}

/// Probabilistic 3D occupancy map over a sparse chunked voxel grid.
pub struct OccupancyMap {
    resolution: f64,
    region_voxel_dims: U8Vec3,
    region_spatial_dims: DVec3,
    origin: DVec3,
    layout: MapLayout,
    layer_indices: LayerIndices,
    chunks: HashMap<I16Vec3, MapChunk>,
    stamp: u64,
    params: OccupancyParams,
    sub_voxel_weighting: f32,
    ray_filter: Option<RayFilter>,
    flags: MapFlags,
    rejected_rays: u64,
}

impl OccupancyMap {
    /// Default voxels per region per axis.
    pub const DEFAULT_REGION_DIM: u8 = 32;

    /// Create a map with the given voxel edge length (metres), voxels per
    /// region (zero components fall back to the default of 32) and optional
    /// layers.
    pub fn new(resolution: f64, region_voxel_dims: U8Vec3, flags: MapFlags) -> Self {
        let dims = U8Vec3::new(
            if region_voxel_dims.x > 0 {
                region_voxel_dims.x
            } else {
                Self::DEFAULT_REGION_DIM
            },
            if region_voxel_dims.y > 0 {
                region_voxel_dims.y
            } else {
                Self::DEFAULT_REGION_DIM
            },
            if region_voxel_dims.z > 0 {
                region_voxel_dims.z
            } else {
                Self::DEFAULT_REGION_DIM
            },
        );

        let mut layout = MapLayout::with_occupancy(flags.contains(MapFlags::SUB_VOXEL_POSITION));
        if flags.contains(MapFlags::VOXEL_MEAN) {
            add_voxel_mean_layer(&mut layout);
        }
        let layer_indices = LayerIndices::compute(&layout);

        Self {
            resolution,
            region_voxel_dims: dims,
            region_spatial_dims: dims.as_dvec3() * resolution,
            origin: DVec3::ZERO,
            layout,
            layer_indices,
            chunks: HashMap::new(),
            stamp: 0,
            params: OccupancyParams::default(),
            sub_voxel_weighting: 0.3,
            ray_filter: Some(filter::good_ray_filter(filter::DEFAULT_RANGE_LIMIT)),
            flags,
            rejected_rays: 0,
        }
    }

    /// Create a map from a full configuration.
    pub fn with_config(config: &MapConfig) -> Self {
        let mut flags = MapFlags::NONE;
        if config.voxel_mean {
            flags = flags | MapFlags::VOXEL_MEAN;
        }
        if config.sub_voxel_position {
            flags = flags | MapFlags::SUB_VOXEL_POSITION;
        }

        let mut map = Self::new(config.resolution, U8Vec3::from_array(config.region_voxel_dims), flags);
        map.origin = config.origin;
        map.params.set_hit_probability(config.hit_probability);
        map.params.set_miss_probability(config.miss_probability);
        map.params.set_threshold_probability(config.threshold_probability);
        map.params.min_value = config.min_voxel_value;
        map.params.max_value = config.max_voxel_value;
        map.params.saturate_at_min = config.saturate_at_min;
        map.params.saturate_at_max = config.saturate_at_max;
        map.sub_voxel_weighting = config.sub_voxel_weighting;
        map
    }

    // === Geometry ===

    /// Voxel edge length in metres.
    #[inline]
    pub fn resolution(&self) -> f64 {
        self.resolution
    }

    /// Voxels per region along each axis.
    #[inline]
    pub fn region_voxel_dims(&self) -> U8Vec3 {
        self.region_voxel_dims
    }

    /// Region edge lengths in metres.
    #[inline]
    pub fn region_spatial_dims(&self) -> DVec3 {
        self.region_spatial_dims
    }

    /// Voxels per region.
    #[inline]
    pub fn region_volume(&self) -> usize {
        region_volume(self.region_voxel_dims)
    }

    /// Map origin: the minimum corner of region (0, 0, 0).
    #[inline]
    pub fn origin(&self) -> DVec3 {
        self.origin
    }

    /// Move the map origin. Only meaningful before any chunk exists.
    pub fn set_origin(&mut self, origin: DVec3) {
        self.origin = origin;
    }

    /// Construction flags.
    #[inline]
    pub fn flags(&self) -> MapFlags {
        self.flags
    }

    /// The layer layout.
    #[inline]
    pub fn layout(&self) -> &MapLayout {
        &self.layout
    }

    /// Minimum corner of a region in world coordinates.
    pub fn region_min(&self, region: I16Vec3) -> DVec3 {
        self.origin + region.as_dvec3() * self.region_spatial_dims
    }

    /// Centre of a region in world coordinates.
    pub fn region_centre(&self, region: I16Vec3) -> DVec3 {
        self.origin + (region.as_dvec3() + DVec3::splat(0.5)) * self.region_spatial_dims
    }

    /// World-space bounds of a region.
    pub fn region_aabb(&self, region: I16Vec3) -> Aabb {
        let min = self.region_min(region);
        Aabb::new(min, min + self.region_spatial_dims)
    }

    /// Region containing a world point.
    pub fn region_key(&self, point: DVec3) -> I16Vec3 {
        let local = point - self.origin;
        let mut region = I16Vec3::ZERO;
        for axis in 0..3 {
            let r = (local[axis] / self.region_spatial_dims[axis]).floor();
            region[axis] = r.clamp(i16::MIN as f64, i16::MAX as f64) as i16;
        }
        region
    }

    /// Key of the voxel containing a world point.
    pub fn voxel_key(&self, point: DVec3) -> Key {
        voxel_key_local(
            point - self.origin,
            self.region_spatial_dims,
            self.region_voxel_dims,
            self.resolution,
        )
    }

    /// World-space centre of a voxel.
    pub fn voxel_centre(&self, key: Key) -> DVec3 {
        self.region_min(key.region())
            + (key.local().as_dvec3() + DVec3::splat(0.5)) * self.resolution
    }

    /// Step a key one voxel along an axis, carrying across regions.
    #[inline]
    pub fn step_key(&self, key: &mut Key, axis: usize, dir: i32) {
        key.step(axis, dir, self.region_voxel_dims);
    }

    /// Signed voxel delta between two keys.
    #[inline]
    pub fn range_between(&self, from: &Key, to: &Key) -> IVec3 {
        from.range_to(to, self.region_voxel_dims)
    }

    // === Probability parameters ===

    /// The full probability parameter set.
    #[inline]
    pub fn occupancy_params(&self) -> &OccupancyParams {
        &self.params
    }

    /// Probability a hit ray endpoint asserts.
    pub fn hit_probability(&self) -> f32 {
        self.params.hit_probability
    }

    /// Log-odds increment applied by a hit.
    pub fn hit_value(&self) -> f32 {
        self.params.hit_value
    }

    /// Set the hit probability (log-odds form derived).
    pub fn set_hit_probability(&mut self, probability: f32) {
        self.params.set_hit_probability(probability);
    }

    /// Probability a pass-through assigns.
    pub fn miss_probability(&self) -> f32 {
        self.params.miss_probability
    }

    /// Log-odds increment applied by a miss.
    pub fn miss_value(&self) -> f32 {
        self.params.miss_value
    }

    /// Set the miss probability (log-odds form derived).
    pub fn set_miss_probability(&mut self, probability: f32) {
        self.params.set_miss_probability(probability);
    }

    /// Occupied classification threshold as a probability.
    pub fn threshold_probability(&self) -> f32 {
        self.params.threshold_probability
    }

    /// Occupied classification threshold as a log-odds value.
    pub fn threshold_value(&self) -> f32 {
        self.params.threshold_value
    }

    /// Set the occupied classification threshold.
    pub fn set_threshold_probability(&mut self, probability: f32) {
        self.params.set_threshold_probability(probability);
    }

    /// Lower log-odds clamp.
    pub fn min_voxel_value(&self) -> f32 {
        self.params.min_value
    }

    /// Set the lower log-odds clamp.
    pub fn set_min_voxel_value(&mut self, value: f32) {
        self.params.min_value = value;
    }

    /// Upper log-odds clamp.
    pub fn max_voxel_value(&self) -> f32 {
        self.params.max_value
    }

    /// Set the upper log-odds clamp.
    pub fn set_max_voxel_value(&mut self, value: f32) {
        self.params.max_value = value;
    }

    /// Whether voxels clamped at the minimum stay mobile.
    pub fn saturate_at_min(&self) -> bool {
        self.params.saturate_at_min
    }

    /// Set minimum-clamp saturation behaviour.
    pub fn set_saturate_at_min(&mut self, saturate: bool) {
        self.params.saturate_at_min = saturate;
    }

    /// Whether voxels clamped at the maximum stay mobile.
    pub fn saturate_at_max(&self) -> bool {
        self.params.saturate_at_max
    }

    /// Set maximum-clamp saturation behaviour.
    pub fn set_saturate_at_max(&mut self, saturate: bool) {
        self.params.saturate_at_max = saturate;
    }

    /// EMA weight for the packed sub-voxel position.
    pub fn sub_voxel_weighting(&self) -> f32 {
        self.sub_voxel_weighting
    }

    /// Set the EMA weight for the packed sub-voxel position.
    pub fn set_sub_voxel_weighting(&mut self, weighting: f32) {
        self.sub_voxel_weighting = weighting;
    }

    // === Ray filter ===

    /// Install a pre-integration ray filter.
    pub fn set_ray_filter(&mut self, ray_filter: RayFilter) {
        self.ray_filter = Some(ray_filter);
    }

    /// The installed ray filter, if any.
    pub fn ray_filter(&self) -> Option<&RayFilter> {
        self.ray_filter.as_ref()
    }

    /// Remove the ray filter.
    pub fn clear_ray_filter(&mut self) {
        self.ray_filter = None;
    }

    /// Rays rejected by the filter or range checks since construction.
    pub fn rejected_ray_count(&self) -> u64 {
        self.rejected_rays
    }

    pub(crate) fn count_rejected_ray(&mut self) {
        self.rejected_rays += 1;
    }

    // === Stamp ===

    /// Monotonic stamp of the last semantic change.
    #[inline]
    pub fn stamp(&self) -> u64 {
        self.stamp
    }

    /// Advance and return the semantic-change stamp.
    pub fn touch(&mut self) -> u64 {
        self.stamp += 1;
        self.stamp
    }

    pub(crate) fn restore_stamp(&mut self, stamp: u64) {
        self.stamp = stamp;
    }

    // === Chunk store ===

    /// Number of populated regions.
    pub fn region_count(&self) -> usize {
        self.chunks.len()
    }

    /// Chunk of a region, if populated.
    pub fn region_chunk(&self, region: I16Vec3) -> Option<&MapChunk> {
        self.chunks.get(&region)
    }

    /// Chunk of a region, optionally creating it.
    pub fn region_chunk_mut(&mut self, region: I16Vec3, create: bool) -> Option<&mut MapChunk> {
        if create {
            let centre = self.region_centre(region);
            let dims = self.region_voxel_dims;
            let layout = &self.layout;
            Some(
                self.chunks
                    .entry(region)
                    .or_insert_with(|| MapChunk::new(region, centre, layout, dims)),
            )
        } else {
            self.chunks.get_mut(&region)
        }
    }

    /// Iterate populated chunks in unspecified order.
    pub fn chunks(&self) -> impl Iterator<Item = &MapChunk> {
        self.chunks.values()
    }

    /// Record a wall-clock touch time on a region.
    pub fn touch_region(&mut self, region: I16Vec3, timestamp: f64, create: bool) {
        if let Some(chunk) = self.region_chunk_mut(region, create) {
            chunk.touched_time = timestamp;
        }
    }

    /// Remove every chunk. Device caches layered above the map must be
    /// cleared alongside (the accelerated map front end does this).
    pub fn clear(&mut self) {
        self.chunks.clear();
    }

    // === Voxel access ===

    fn check_key(&self, key: Key) -> Result<()> {
        if key.is_null() || !key.is_local_valid(self.region_voxel_dims) {
            return Err(MapError::InvalidKey(key));
        }
        Ok(())
    }

    /// Stored occupancy value of a voxel; `None` when the region does not
    /// exist, the sentinel when the voxel exists but was never observed.
    pub fn value(&self, key: Key) -> Option<f32> {
        if key.is_null() || !key.is_local_valid(self.region_voxel_dims) {
            return None;
        }
        let occ = self.layer_indices.occupancy?;
        let chunk = self.chunks.get(&key.region())?;
        let wi = key.local_index(self.region_voxel_dims) * self.layer_indices.occ_stride
            + self.layer_indices.occ_member;
        Some(f32::from_bits(chunk.layer_words(occ)[wi]))
    }

    /// Classify a voxel's occupancy state.
    pub fn occupancy_type(&self, key: Key) -> OccupancyType {
        self.params.occupancy_type(self.value(key))
    }

    /// Lightweight read probe for a voxel. `None` when the region does not
    /// exist or the key is invalid.
    pub fn voxel(&self, key: Key) -> Option<Voxel<'_>> {
        if key.is_null() || !key.is_local_valid(self.region_voxel_dims) {
            return None;
        }
        let chunk = self.chunks.get(&key.region())?;
        Some(Voxel {
            map: self,
            chunk,
            key,
        })
    }

    /// Iterate voxel probes over every populated chunk, starting each chunk
    /// at its first observed voxel. Chunks with no observed voxel are
    /// skipped.
    pub fn voxels(&self) -> Voxels<'_> {
        Voxels {
            map: self,
            chunks: self.chunks.values(),
            current: None,
        }
    }

    /// Set a voxel's occupancy value directly, creating its chunk.
    ///
    /// The value is clamped to the configured range unless it is the
    /// never-observed sentinel.
    pub fn set_value(&mut self, key: Key, value: f32) -> Result<()> {
        self.check_key(key)?;
        let value = if is_unobserved(value) {
            value
        } else {
            value.clamp(self.params.min_value, self.params.max_value)
        };
        let stamp = self.touch();
        let dims = self.region_voxel_dims;
        let indices = self.layer_indices;
        let occ = indices
            .occupancy
            .ok_or_else(|| MapError::LayoutMismatch("map has no occupancy layer".to_string()))?;
        let chunk = self
            .region_chunk_mut(key.region(), true)
            .expect("chunk created on demand");
        let wi = key.local_index(dims) * indices.occ_stride + indices.occ_member;
        chunk.layer_words_mut(occ)[wi] = value.to_bits();
        chunk.touch_layer(occ, stamp);
        if !is_unobserved(value) {
            chunk.note_valid(key.local(), dims);
        }
        Ok(())
    }

    /// Apply a hit observation with the exact sample coordinate, creating
    /// the chunk on demand. Returns the new occupancy value.
    pub fn integrate_hit(&mut self, key: Key, sample: DVec3) -> Result<f32> {
        self.check_key(key)?;
        Ok(self.apply_hit(key, Some(sample), None, &mut ChunkHint::default()))
    }

    /// Apply a miss observation, creating the chunk on demand. Returns the
    /// new occupancy value.
    pub fn integrate_miss(&mut self, key: Key) -> Result<f32> {
        self.check_key(key)?;
        Ok(self.apply_miss(key, &mut ChunkHint::default()))
    }

    pub(crate) fn apply_hit(
        &mut self,
        key: Key,
        sample: Option<DVec3>,
        origin: Option<DVec3>,
        hint: &mut ChunkHint,
    ) -> f32 {
        let adjustment = self.params.hit_value;
        self.apply_adjustment(key, adjustment, sample, origin, hint)
    }

    pub(crate) fn apply_miss(&mut self, key: Key, hint: &mut ChunkHint) -> f32 {
        let adjustment = self.params.miss_value;
        self.apply_adjustment(key, adjustment, None, None, hint)
    }

    fn apply_adjustment(
        &mut self,
        key: Key,
        adjustment: f32,
        sample: Option<DVec3>,
        origin: Option<DVec3>,
        hint: &mut ChunkHint,
    ) -> f32 {
        let params = self.params;
        let dims = self.region_voxel_dims;
        let indices = self.layer_indices;
        let resolution = self.resolution;
        let weighting = self.sub_voxel_weighting;
        let centre = self.voxel_centre(key);
        let region = key.region();
        let region_centre = self.region_centre(region);
        let occ = match indices.occupancy {
            Some(occ) => occ,
            None => return UNOBSERVED_VALUE,
        };

        self.stamp += 1;
        let stamp = self.stamp;

        let layout = &self.layout;
        let chunks = &mut self.chunks;
        // The hint skips the create-on-miss probe; it can be stale when the
        // memoised chunk was culled, so verify before trusting it.
        if hint.region != Some(region) || !chunks.contains_key(&region) {
            chunks
                .entry(region)
                .or_insert_with(|| MapChunk::new(region, region_centre, layout, dims));
            hint.region = Some(region);
        }
        let chunk = chunks.get_mut(&region).expect("chunk ensured above");

        let linear = key.local_index(dims);
        let wi = linear * indices.occ_stride + indices.occ_member;
        let old = f32::from_bits(chunk.layer_words(occ)[wi]);
        let new = params.adjust(old, adjustment);
        chunk.layer_words_mut(occ)[wi] = new.to_bits();
        chunk.touch_layer(occ, stamp);
        chunk.note_valid(key.local(), dims);

        if let Some(sample) = sample {
            let offset = sample - centre;

            if let Some(sv) = indices.sub_voxel_member {
                let wj = linear * indices.occ_stride + sv;
                let voxel_offset = (offset / resolution).as_vec3();
                let packed = chunk.layer_words(occ)[wj];
                chunk.layer_words_mut(occ)[wj] =
                    subvoxel::update_offset(packed, voxel_offset, weighting);
            }

            if let Some(mean_layer) = indices.mean {
                let base = linear * 4;
                let words = chunk.layer_words_mut(mean_layer);
                let count = words[base + 3];
                let one_on = 1.0 / (count as f32 + 1.0);
                for axis in 0..3 {
                    let m = f32::from_bits(words[base + axis]);
                    let m = m + (offset[axis] as f32 - m) * one_on;
                    words[base + axis] = m.to_bits();
                }
                words[base + 3] = count.saturating_add(1);
                chunk.touch_layer(mean_layer, stamp);
            }

            if let (Some(inc_layer), Some(origin)) = (indices.incident, origin) {
                let base = linear * 2;
                let words = chunk.layer_words_mut(inc_layer);
                let packed = words[base];
                let count = words[base + 1];
                words[base] =
                    incident::update_incident_normal(packed, count, (origin - sample).as_vec3());
                words[base + 1] = count.saturating_add(1);
                chunk.touch_layer(inc_layer, stamp);
            }
        }

        new
    }

    // === Layout migration ===

    /// Replace the layer layout, migrating every chunk.
    ///
    /// Cells are projected member-wise by name within layers of the same
    /// name; new members take their clear value, removed members are
    /// dropped. An accelerated front end must evict its device cache before
    /// calling this and reinitialise it afterwards.
    pub fn set_layout(&mut self, new_layout: MapLayout) {
        let dims = self.region_voxel_dims;
        let volume = region_volume(dims);
        let old_layout = std::mem::replace(&mut self.layout, new_layout);

        for chunk in self.chunks.values_mut() {
            let mut new_layers = Vec::with_capacity(self.layout.layer_count());
            for new_layer in self.layout.layers() {
                let mut words = new_layer.allocate(dims);
                if let Some(old_layer) = old_layout.layer_by_name(new_layer.name()) {
                    let old_words = chunk.layer_words(old_layer.index());
                    let old_stride = old_layer.voxel_words();
                    let new_stride = new_layer.voxel_words();
                    for (dst_member, member) in new_layer.members().iter().enumerate() {
                        if let Some(src_member) = old_layer.member_index(&member.name) {
                            for v in 0..volume {
                                words[v * new_stride + dst_member] =
                                    old_words[v * old_stride + src_member];
                            }
                        }
                    }
                }
                new_layers.push(words);
            }
            chunk.replace_layers(new_layers, self.layout.layer_count());
        }

        self.layer_indices = LayerIndices::compute(&self.layout);

        // The first-valid hint keys on the occupancy layer; rebuild it.
        if let Some(occ) = self.layer_indices.occupancy {
            let layer = self.layout.layer(occ).clone();
            for chunk in self.chunks.values_mut() {
                chunk.search_and_update_first_valid(&layer, dims);
            }
        }
    }

    /// Enable or disable the packed sub-voxel position, migrating chunks.
    pub fn set_sub_voxel_enabled(&mut self, enable: bool) {
        if self.layout.has_sub_voxel() == enable {
            return;
        }
        let mut layout = self.layout.clone();
        if let Some(occ) = layout.occupancy_layer() {
            let layer = layout.layer_mut(occ);
            if enable {
                layer.add_member(SUB_VOXEL_MEMBER, crate::layout::DataType::UInt32, 0);
            } else {
                layer.remove_member(SUB_VOXEL_MEMBER);
            }
        }
        self.set_layout(layout);
        if enable {
            self.flags = self.flags | MapFlags::SUB_VOXEL_POSITION;
        }
    }

    /// True when the occupancy layer carries sub-voxel positions.
    pub fn sub_voxel_enabled(&self) -> bool {
        self.layout.has_sub_voxel()
    }

    // === Culling ===

    pub(crate) fn cull_where(&mut self, predicate: impl Fn(&MapChunk) -> bool) -> Vec<I16Vec3> {
        let removed: Vec<I16Vec3> = self
            .chunks
            .iter()
            .filter(|(_, chunk)| predicate(chunk))
            .map(|(region, _)| *region)
            .collect();
        for region in &removed {
            self.chunks.remove(region);
        }
        removed
    }

    pub(crate) fn expire_regions_keys(&mut self, before_time: f64) -> Vec<I16Vec3> {
        self.cull_where(|chunk| chunk.touched_time < before_time)
    }

    pub(crate) fn cull_outside_keys(&mut self, bounds: &Aabb) -> Vec<I16Vec3> {
        let half = 0.5 * self.region_spatial_dims;
        let bounds = *bounds;
        self.cull_where(move |chunk| !bounds.overlaps(&Aabb::centred(chunk.centre(), half)))
    }

    pub(crate) fn cull_by_distance_keys(&mut self, relative_to: DVec3, distance: f64) -> Vec<I16Vec3> {
        let dist_sq = distance * distance;
        self.cull_where(move |chunk| (chunk.centre() - relative_to).length_squared() >= dist_sq)
    }

    /// Remove regions whose last touch time precedes `before_time`.
    /// Returns the number removed.
    pub fn expire_regions(&mut self, before_time: f64) -> usize {
        self.expire_regions_keys(before_time).len()
    }

    /// Remove regions entirely outside `bounds`. Returns the number
    /// removed.
    pub fn cull_outside(&mut self, bounds: &Aabb) -> usize {
        self.cull_outside_keys(bounds).len()
    }

    /// Remove regions whose centre lies at least `distance` from
    /// `relative_to`. Returns the number removed.
    pub fn cull_by_distance(&mut self, relative_to: DVec3, distance: f64) -> usize {
        self.cull_by_distance_keys(relative_to, distance).len()
    }

    // === Queries ===

    /// World-space and key extents of the populated map, or `None` when
    /// empty.
    pub fn calculate_extents(&self) -> Option<(Aabb, Key, Key)> {
        let mut min_region = I16Vec3::MAX;
        let mut max_region = I16Vec3::MIN;
        let mut any = false;
        for chunk in self.chunks.values() {
            min_region = min_region.min(chunk.region());
            max_region = max_region.max(chunk.region());
            any = true;
        }
        if !any {
            return None;
        }
        let bounds = Aabb::new(
            self.region_min(min_region),
            self.region_min(max_region) + self.region_spatial_dims,
        );
        let min_key = Key::region_origin(min_region);
        let max_key = Key::new(max_region, self.region_voxel_dims - U8Vec3::ONE);
        Some((bounds, min_key, max_key))
    }

    /// Regions dirtied after `from_stamp`, oldest first.
    pub fn collect_dirty_regions(&self, from_stamp: u64) -> Vec<(u64, I16Vec3)> {
        let mut dirty: Vec<(u64, I16Vec3)> = self
            .chunks
            .values()
            .filter(|chunk| chunk.dirty_stamp > from_stamp)
            .map(|chunk| (chunk.dirty_stamp, chunk.region()))
            .collect();
        dirty.sort_by_key(|(stamp, _)| *stamp);
        dirty
    }

    /// Region-key bounds of chunks dirtied after `*from_stamp`. Advances
    /// `*from_stamp` to the current map stamp.
    pub fn calculate_dirty_extents(&self, from_stamp: &mut u64) -> Option<(I16Vec3, I16Vec3)> {
        let mut min_region = I16Vec3::MAX;
        let mut max_region = I16Vec3::MIN;
        let mut any = false;
        for chunk in self.chunks.values() {
            if chunk.dirty_stamp > *from_stamp {
                min_region = min_region.min(chunk.region());
                max_region = max_region.max(chunk.region());
                any = true;
            }
        }
        *from_stamp = self.stamp;
        any.then_some((min_region, max_region))
    }

    /// Approximate heap memory in bytes.
    pub fn approximate_memory(&self) -> usize {
        let mut bytes = std::mem::size_of::<Self>();
        let per_chunk: usize = self
            .layout
            .layers()
            .iter()
            .map(|l| l.layer_byte_size(self.region_voxel_dims))
            .sum();
        bytes += self.chunks.len() * (per_chunk + std::mem::size_of::<MapChunk>());
        bytes
    }

    // === Cloning ===

    /// Deep copy of the whole map.
    pub fn clone_map(&self) -> OccupancyMap {
        self.clone_within(&Aabb::EVERYTHING)
    }

    /// Deep copy restricted to regions overlapping `bounds`.
    pub fn clone_within(&self, bounds: &Aabb) -> OccupancyMap {
        let mut cloned = OccupancyMap::new(self.resolution, self.region_voxel_dims, self.flags);
        cloned.origin = self.origin;
        cloned.layout = self.layout.clone();
        cloned.layer_indices = self.layer_indices;
        cloned.params = self.params;
        cloned.sub_voxel_weighting = self.sub_voxel_weighting;
        cloned.ray_filter = self.ray_filter.clone();
        cloned.stamp = self.stamp;

        let half = 0.5 * self.region_spatial_dims;
        for (region, chunk) in &self.chunks {
            if bounds.overlaps(&Aabb::centred(chunk.centre(), half)) {
                cloned.chunks.insert(*region, chunk.clone());
            }
        }
        cloned
    }
}

/// Read-only probe of one voxel.
///
/// Carries the voxel's key and a borrow of its chunk; it never outlives the
/// map borrow it was created from.
#[derive(Clone, Copy)]
pub struct Voxel<'a> {
    map: &'a OccupancyMap,
    chunk: &'a MapChunk,
    key: Key,
}

impl<'a> Voxel<'a> {
    /// The voxel's key.
    #[inline]
    pub fn key(&self) -> Key {
        self.key
    }

    /// Stored occupancy value (possibly the never-observed sentinel).
    pub fn value(&self) -> f32 {
        let indices = &self.map.layer_indices;
        match indices.occupancy {
            Some(occ) => {
                let wi = self.key.local_index(self.map.region_voxel_dims) * indices.occ_stride
                    + indices.occ_member;
                f32::from_bits(self.chunk.layer_words(occ)[wi])
            }
            None => UNOBSERVED_VALUE,
        }
    }

    /// Occupancy probability of an observed voxel.
    pub fn probability(&self) -> Option<f32> {
        let value = self.value();
        (!is_unobserved(value)).then(|| crate::core::value_to_probability(value))
    }

    /// True when this voxel classifies as occupied.
    pub fn is_occupied(&self) -> bool {
        self.map.params.is_occupied(self.value())
    }

    /// Occupancy classification.
    pub fn occupancy_type(&self) -> OccupancyType {
        self.map.params.occupancy_type(Some(self.value()))
    }

    /// World-space centre of the voxel.
    pub fn centre(&self) -> DVec3 {
        self.map.voxel_centre(self.key)
    }

    /// Best-known sample position: the sub-voxel refined position when
    /// recorded, otherwise the voxel centre.
    pub fn position(&self) -> DVec3 {
        match self.sub_voxel_offset() {
            Some(offset) => self.centre() + offset.as_dvec3() * self.map.resolution,
            None => self.centre(),
        }
    }

    /// Recorded sub-voxel offset in voxel units, when present.
    pub fn sub_voxel_offset(&self) -> Option<Vec3> {
        let indices = &self.map.layer_indices;
        let sv = indices.sub_voxel_member?;
        let occ = indices.occupancy?;
        let wi = self.key.local_index(self.map.region_voxel_dims) * indices.occ_stride + sv;
        let packed = self.chunk.layer_words(occ)[wi];
        subvoxel::has_position(packed).then(|| subvoxel::decode_offset(packed))
    }

    /// Sample mean (offset from the voxel centre, metres) and count from
    /// the voxel-mean layer, when present.
    pub fn sample_mean(&self) -> Option<(Vec3, u32)> {
        let mean_layer = self.map.layer_indices.mean?;
        let base = self.key.local_index(self.map.region_voxel_dims) * 4;
        let words = self.chunk.layer_words(mean_layer);
        Some((
            Vec3::new(
                f32::from_bits(words[base]),
                f32::from_bits(words[base + 1]),
                f32::from_bits(words[base + 2]),
            ),
            words[base + 3],
        ))
    }

    /// Mean incident-ray normal and count from the incident layer, when
    /// present.
    pub fn incident_normal(&self) -> Option<(Vec3, u32)> {
        let inc_layer = self.map.layer_indices.incident?;
        let base = self.key.local_index(self.map.region_voxel_dims) * 2;
        let words = self.chunk.layer_words(inc_layer);
        Some((incident::decode_normal(words[base]), words[base + 1]))
    }
}

/// Iterator over voxel probes; see [`OccupancyMap::voxels`].
pub struct Voxels<'a> {
    map: &'a OccupancyMap,
    chunks: std::collections::hash_map::Values<'a, I16Vec3, MapChunk>,
    current: Option<(&'a MapChunk, usize)>,
}

impl<'a> Iterator for Voxels<'a> {
    type Item = Voxel<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let dims = self.map.region_voxel_dims;
        let volume = self.map.region_volume();
        loop {
            if let Some((chunk, index)) = &mut self.current {
                if *index < volume {
                    let key = Key::new(chunk.region(), crate::core::local_from_index(*index, dims));
                    *index += 1;
                    return Some(Voxel {
                        map: self.map,
                        chunk: *chunk,
                        key,
                    });
                }
                self.current = None;
            }
            let chunk = self.chunks.next()?;
            if let Some(first) = chunk.first_valid_index(dims) {
                self.current = Some((chunk, first));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_map() -> OccupancyMap {
        OccupancyMap::new(0.1, U8Vec3::splat(32), MapFlags::NONE)
    }

    #[test]
    fn test_voxel_key_centre_round_trip() {
        let map = test_map();
        for &point in &[
            DVec3::new(0.05, 0.05, 0.05),
            DVec3::new(3.15, 0.05, -0.05),
            DVec3::new(-10.23, 7.77, 0.51),
            DVec3::new(101.0, -52.3, 33.3),
        ] {
            let key = map.voxel_key(point);
            let centre = map.voxel_centre(key);
            assert_eq!(map.voxel_key(centre), key, "round trip failed for {point:?}");
            assert!((centre - point).abs().max_element() <= 0.05 + 1e-12);
        }
    }

    #[test]
    fn test_region_boundary_tie_break() {
        let map = test_map();
        // 3.2 m is exactly the region extent: the point belongs to region 1.
        let key = map.voxel_key(DVec3::new(3.2, 0.0, 0.0));
        assert_eq!(key.region(), I16Vec3::new(1, 0, 0));
        assert_eq!(key.local().x, 0);

        // A voxel boundary inside a region: larger voxel wins.
        let key = map.voxel_key(DVec3::new(0.2, 0.0, 0.0));
        assert_eq!(key.local().x, 2);
    }

    #[test]
    fn test_chunks_created_lazily_on_write() {
        let mut map = test_map();
        let key = map.voxel_key(DVec3::new(0.05, 0.05, 0.05));
        assert_eq!(map.region_count(), 0);
        assert_eq!(map.occupancy_type(key), OccupancyType::Null);

        map.integrate_hit(key, DVec3::new(0.05, 0.05, 0.05))
            .expect("valid key");
        assert_eq!(map.region_count(), 1);
        assert_eq!(map.occupancy_type(key), OccupancyType::Occupied);

        // A neighbouring voxel in the same region exists but is uncertain.
        let mut neighbour = key;
        map.step_key(&mut neighbour, 0, 1);
        assert_eq!(map.occupancy_type(neighbour), OccupancyType::Uncertain);
    }

    #[test]
    fn test_set_value_clamps() {
        let mut map = test_map();
        let key = map.voxel_key(DVec3::ZERO);
        map.set_value(key, 100.0).expect("valid key");
        assert_eq!(map.value(key), Some(map.max_voxel_value()));
        map.set_value(key, -100.0).expect("valid key");
        assert_eq!(map.value(key), Some(map.min_voxel_value()));
    }

    #[test]
    fn test_invalid_key_rejected() {
        let mut map = test_map();
        assert!(matches!(
            map.integrate_miss(Key::NULL),
            Err(MapError::InvalidKey(_))
        ));
        let bad = Key::new(I16Vec3::ZERO, U8Vec3::new(32, 0, 0));
        assert!(matches!(map.set_value(bad, 0.0), Err(MapError::InvalidKey(_))));
    }

    #[test]
    fn test_cull_by_distance_and_outside() {
        let mut map = test_map();
        for x in -3..=3i16 {
            let region = I16Vec3::new(x, 0, 0);
            map.region_chunk_mut(region, true);
        }
        assert_eq!(map.region_count(), 7);

        let removed = map.cull_by_distance(DVec3::ZERO, 5.0);
        assert!(removed > 0);
        let remaining_far = map
            .chunks()
            .filter(|c| c.centre().length() >= 5.0)
            .count();
        assert_eq!(remaining_far, 0);

        let mut map = test_map();
        for x in -3..=3i16 {
            map.region_chunk_mut(I16Vec3::new(x, 0, 0), true);
        }
        map.cull_outside(&Aabb::new(DVec3::splat(-2.0), DVec3::splat(2.0)));
        for chunk in map.chunks() {
            assert!(chunk.region().x.abs() <= 1);
        }
    }

    #[test]
    fn test_expire_regions() {
        let mut map = test_map();
        map.touch_region(I16Vec3::new(0, 0, 0), 1.0, true);
        map.touch_region(I16Vec3::new(1, 0, 0), 5.0, true);
        assert_eq!(map.expire_regions(2.0), 1);
        assert_eq!(map.region_count(), 1);
        assert!(map.region_chunk(I16Vec3::new(1, 0, 0)).is_some());
    }

    #[test]
    fn test_clone_within_crops() {
        let mut map = test_map();
        map.integrate_hit(map.voxel_key(DVec3::splat(0.5)), DVec3::splat(0.5))
            .expect("valid key");
        map.integrate_hit(map.voxel_key(DVec3::splat(10.0)), DVec3::splat(10.0))
            .expect("valid key");
        assert_eq!(map.region_count(), 2);

        let cropped = map.clone_within(&Aabb::new(DVec3::ZERO, DVec3::splat(1.0)));
        assert_eq!(cropped.region_count(), 1);
        let key = cropped.voxel_key(DVec3::splat(0.5));
        assert_eq!(cropped.occupancy_type(key), OccupancyType::Occupied);

        // Fresh chunks appear when writing into the culled area again.
        let mut cropped = cropped;
        let key = cropped.voxel_key(DVec3::splat(10.0));
        assert_eq!(cropped.occupancy_type(key), OccupancyType::Null);
        cropped.integrate_miss(key).expect("valid key");
        assert_eq!(cropped.occupancy_type(key), OccupancyType::Free);
    }

    #[test]
    fn test_sub_voxel_migration() {
        let mut map = test_map();
        let key = map.voxel_key(DVec3::new(0.07, 0.01, 0.02));
        map.integrate_hit(key, DVec3::new(0.07, 0.01, 0.02))
            .expect("valid key");
        let value_before = map.value(key).expect("observed");

        map.set_sub_voxel_enabled(true);
        assert!(map.sub_voxel_enabled());
        assert_eq!(map.value(key), Some(value_before));

        // New hits refine the position.
        map.integrate_hit(key, DVec3::new(0.07, 0.01, 0.02))
            .expect("valid key");
        let voxel = map.voxel(key).expect("voxel exists");
        let position = voxel.position();
        assert!((position - DVec3::new(0.07, 0.01, 0.02)).length() < 0.05);

        map.set_sub_voxel_enabled(false);
        assert!(!map.sub_voxel_enabled());
        assert_eq!(map.value(key), Some(map.params.hit(value_before)));
    }

    #[test]
    fn test_voxel_mean_layer() {
        let mut map = OccupancyMap::new(0.1, U8Vec3::splat(32), MapFlags::VOXEL_MEAN);
        let sample = DVec3::new(0.07, 0.02, 0.04);
        let key = map.voxel_key(sample);
        map.integrate_hit(key, sample).expect("valid key");
        map.integrate_hit(key, sample).expect("valid key");

        let voxel = map.voxel(key).expect("voxel exists");
        let (mean, count) = voxel.sample_mean().expect("mean layer present");
        assert_eq!(count, 2);
        let expected = (sample - map.voxel_centre(key)).as_vec3();
        assert!((mean - expected).length() < 1e-5);
    }

    #[test]
    fn test_voxel_iteration_covers_written_voxels() {
        let mut map = test_map();
        let points = [
            DVec3::new(0.05, 0.05, 0.05),
            DVec3::new(1.15, 2.05, 0.35),
            DVec3::new(-4.05, 0.05, 7.15),
        ];
        for p in points {
            map.integrate_hit(map.voxel_key(p), p).expect("valid key");
        }
        let occupied: Vec<Key> = map
            .voxels()
            .filter(|v| v.is_occupied())
            .map(|v| v.key())
            .collect();
        assert_eq!(occupied.len(), points.len());
        for p in points {
            assert!(occupied.contains(&map.voxel_key(p)));
        }
    }

    #[test]
    fn test_dirty_region_tracking() {
        let mut map = test_map();
        let stamp0 = map.stamp();
        map.integrate_miss(map.voxel_key(DVec3::splat(0.05)))
            .expect("valid key");
        map.integrate_miss(map.voxel_key(DVec3::splat(5.0)))
            .expect("valid key");

        let dirty = map.collect_dirty_regions(stamp0);
        assert_eq!(dirty.len(), 2);
        assert!(dirty[0].0 < dirty[1].0);

        let mut from = stamp0;
        let extents = map.calculate_dirty_extents(&mut from);
        assert!(extents.is_some());
        assert_eq!(from, map.stamp());
        assert!(map.calculate_dirty_extents(&mut from).is_none());
    }

    #[test]
    fn test_extents() {
        let mut map = test_map();
        assert!(map.calculate_extents().is_none());
        map.region_chunk_mut(I16Vec3::new(-1, 0, 0), true);
        map.region_chunk_mut(I16Vec3::new(2, 1, 0), true);
        let (bounds, min_key, max_key) = map.calculate_extents().expect("non-empty");
        assert_eq!(min_key.region(), I16Vec3::new(-1, 0, 0));
        assert_eq!(max_key.region(), I16Vec3::new(2, 1, 0));
        assert!((bounds.min.x - -3.2).abs() < 1e-9);
        assert!((bounds.max.x - 9.6).abs() < 1e-9);
    }
}
