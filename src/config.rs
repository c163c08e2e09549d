//! Map configuration.

use glam::DVec3;
use serde::{Deserialize, Serialize};

/// Full configuration for an occupancy map and its optional accelerated
/// pipeline.
///
/// Probabilities are given in probability space; the map converts to
/// log-odds on construction.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MapConfig {
    /// Voxel edge length in metres.
    #[serde(default = "default_resolution")]
    pub resolution: f64,

    /// Voxels per region per axis. Zero components fall back to 32.
    #[serde(default = "default_region_dims")]
    pub region_voxel_dims: [u8; 3],

    /// World-space position of the minimum corner of region (0, 0, 0).
    #[serde(default)]
    pub origin: DVec3,

    /// Occupancy probability asserted by a hit. Must be > 0.5.
    #[serde(default = "default_hit_probability")]
    pub hit_probability: f32,

    /// Occupancy probability asserted by a miss. Must be < 0.5.
    #[serde(default = "default_miss_probability")]
    pub miss_probability: f32,

    /// Occupied classification cutoff.
    #[serde(default = "default_threshold_probability")]
    pub threshold_probability: f32,

    /// Lower log-odds clamp.
    #[serde(default = "default_min_voxel_value")]
    pub min_voxel_value: f32,

    /// Upper log-odds clamp.
    #[serde(default = "default_max_voxel_value")]
    pub max_voxel_value: f32,

    /// Keep voxels mobile once clamped at the minimum.
    #[serde(default)]
    pub saturate_at_min: bool,

    /// Keep voxels mobile once clamped at the maximum.
    #[serde(default)]
    pub saturate_at_max: bool,

    /// Maintain the per-voxel sample mean layer.
    #[serde(default)]
    pub voxel_mean: bool,

    /// Pack sub-voxel sample positions into the occupancy layer.
    #[serde(default)]
    pub sub_voxel_position: bool,

    /// EMA weight for sub-voxel position updates.
    #[serde(default = "default_sub_voxel_weighting")]
    pub sub_voxel_weighting: f32,

    /// Drop rays longer than this on the accelerated path (metres).
    #[serde(default = "default_max_range_filter")]
    pub max_range_filter: f64,

    /// Soft per-layer device memory budget in bytes.
    #[serde(default = "default_gpu_target_layer_mem")]
    pub gpu_target_layer_mem: usize,

    /// Prefer pinned/mapped host-device transfers when the device shares
    /// host memory.
    #[serde(default = "default_true")]
    pub mappable_buffers: bool,
}

fn default_resolution() -> f64 {
    0.1
}
fn default_region_dims() -> [u8; 3] {
    [32, 32, 32]
}
fn default_hit_probability() -> f32 {
    0.7
}
fn default_miss_probability() -> f32 {
    0.4
}
fn default_threshold_probability() -> f32 {
    0.5
}
fn default_min_voxel_value() -> f32 {
    -2.0
}
fn default_max_voxel_value() -> f32 {
    3.511
}
fn default_sub_voxel_weighting() -> f32 {
    0.3
}
fn default_max_range_filter() -> f64 {
    500.0
}
fn default_gpu_target_layer_mem() -> usize {
    256 * 1024 * 1024
}
fn default_true() -> bool {
    true
}

impl Default for MapConfig {
    fn default() -> Self {
        Self {
            resolution: default_resolution(),
            region_voxel_dims: default_region_dims(),
            origin: DVec3::ZERO,
            hit_probability: default_hit_probability(),
            miss_probability: default_miss_probability(),
            threshold_probability: default_threshold_probability(),
            min_voxel_value: default_min_voxel_value(),
            max_voxel_value: default_max_voxel_value(),
            saturate_at_min: false,
            saturate_at_max: false,
            voxel_mean: false,
            sub_voxel_position: false,
            sub_voxel_weighting: default_sub_voxel_weighting(),
            max_range_filter: default_max_range_filter(),
            gpu_target_layer_mem: default_gpu_target_layer_mem(),
            mappable_buffers: default_true(),
        }
    }
}

impl MapConfig {
    /// Default configuration at a given voxel edge length.
    pub fn with_resolution(resolution: f64) -> Self {
        Self {
            resolution,
            ..Default::default()
        }
    }

    /// Per-chunk byte cost of the occupancy layer under this
    /// configuration.
    pub fn occupancy_chunk_bytes(&self) -> usize {
        let volume = self.region_voxel_dims.iter().map(|&d| d as usize).product::<usize>();
        let voxel_bytes = if self.sub_voxel_position { 8 } else { 4 };
        volume * voxel_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = MapConfig::default();
        assert_eq!(config.resolution, 0.1);
        assert_eq!(config.region_voxel_dims, [32, 32, 32]);
        assert_eq!(config.occupancy_chunk_bytes(), 32 * 32 * 32 * 4);
    }

    #[test]
    fn test_sub_voxel_doubles_occupancy_cost() {
        let config = MapConfig {
            sub_voxel_position: true,
            ..Default::default()
        };
        assert_eq!(config.occupancy_chunk_bytes(), 32 * 32 * 32 * 8);
    }
}
