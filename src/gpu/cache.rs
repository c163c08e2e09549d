//! The per-map device cache: one layer cache per known logical layer.

use glam::I16Vec3;

use crate::device::{Device, Queue};
use crate::layout::MapLayer;
use crate::map::{MapChunk, OccupancyMap};

use super::layer_cache::{ChunkSyncHook, GpuCacheFlags, GpuLayerCache, GpuLayerCacheParams};
use glam::U8Vec3;

/// Cache slot hosting the occupancy layer.
pub const OCCUPANCY_CACHE: usize = 0;
/// Cache slot hosting the voxel-mean layer.
pub const MEAN_CACHE: usize = 1;
/// Cache slot hosting the covariance layer.
pub const COVARIANCE_CACHE: usize = 2;
/// Cache slot for clearance queries. Reads the occupancy layer, as that is
/// the input clearance computation consumes.
pub const CLEARANCE_CACHE: usize = 3;

const CACHE_SLOTS: usize = 4;

fn occupancy_sync_hook(chunk: &mut MapChunk, layer: &MapLayer, dims: U8Vec3) {
    chunk.search_and_update_first_valid(layer, dims);
}

/// Device residency caches for a map, one per known logical layer.
pub struct GpuCache {
    device: Device,
    queue: Queue,
    target_layer_mem: usize,
    mappable: bool,
    layers: Vec<Option<GpuLayerCache>>,
}

impl GpuCache {
    /// Default total device memory budget distributed across the layer
    /// caches.
    pub const DEFAULT_TARGET_MEM: usize = 256 * 1024 * 1024;

    /// Create an empty cache set against `device`.
    pub fn new(device: Device, target_layer_mem: usize, mappable: bool) -> Self {
        let queue = device.queue();
        let target_layer_mem = if target_layer_mem > 0 {
            target_layer_mem
        } else {
            Self::DEFAULT_TARGET_MEM
        };
        Self {
            device,
            queue,
            target_layer_mem,
            mappable,
            layers: (0..CACHE_SLOTS).map(|_| None).collect(),
        }
    }

    /// The backing device.
    #[inline]
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// The shared submission queue.
    #[inline]
    pub fn queue(&self) -> &Queue {
        &self.queue
    }

    /// Total device memory budget in bytes.
    #[inline]
    pub fn target_layer_mem(&self) -> usize {
        self.target_layer_mem
    }

    /// Number of cache slots (present or not).
    #[inline]
    pub fn layer_count(&self) -> usize {
        self.layers.len()
    }

    /// Install a layer cache in a slot, replacing any present one.
    pub fn create_cache(&mut self, slot: usize, layer: MapLayer, dims: U8Vec3, params: &GpuLayerCacheParams) {
        self.layers[slot] = Some(GpuLayerCache::new(self.queue.clone(), layer, dims, params));
    }

    /// The cache in a slot, if present.
    pub fn layer_cache(&mut self, slot: usize) -> Option<&mut GpuLayerCache> {
        self.layers.get_mut(slot).and_then(|c| c.as_mut())
    }

    /// Drop every residency in every cache.
    pub fn clear(&mut self) {
        for cache in self.layers.iter_mut().flatten() {
            cache.clear();
        }
    }

    /// Drop one region's residency in every cache (chunk destruction).
    pub fn remove(&mut self, region: I16Vec3) {
        for cache in self.layers.iter_mut().flatten() {
            cache.remove(region);
        }
    }

    /// Write every dirty page of every writable cache back to the map.
    pub fn sync_to_host(&mut self, map: &mut OccupancyMap) {
        for cache in self.layers.iter_mut().flatten() {
            cache.sync_to_host(map);
        }
    }

    /// Rebuild the layer caches for the map's current layout.
    ///
    /// The memory budget is split across the known layers present in the
    /// layout proportionally to their per-chunk byte cost. Existing
    /// residencies are dropped; callers must have synced beforehand if
    /// device results matter.
    pub fn reinitialise(&mut self, map: &OccupancyMap) {
        self.clear();
        self.layers = (0..CACHE_SLOTS).map(|_| None).collect();

        let mappable_flag = if self.mappable && self.device.unified_memory() {
            GpuCacheFlags::MAPPABLE
        } else {
            GpuCacheFlags::NONE
        };

        let layout = map.layout();
        let dims = map.region_voxel_dims();

        let occupancy = layout.occupancy_layer();
        let mean = layout.mean_layer();
        let covariance = layout.covariance_layer();
        let clearance = layout.clearance_layer();

        // Weight each present slot by its hosted layer's per-chunk cost.
        let layer_cost = |index: Option<usize>| -> usize {
            index
                .map(|i| layout.layer(i).layer_byte_size(dims))
                .unwrap_or(0)
        };
        let total_weight = layer_cost(occupancy)
            + layer_cost(mean)
            + layer_cost(covariance)
            + layer_cost(clearance);
        if total_weight == 0 {
            return;
        }
        let target_layer_mem = self.target_layer_mem;
        let share = move |index: Option<usize>| -> usize {
            layer_cost(index) * target_layer_mem / total_weight
        };

        if let Some(occ) = occupancy {
            let mem_size = share(occupancy);
            self.create_cache(
                OCCUPANCY_CACHE,
                layout.layer(occ).clone(),
                dims,
                &GpuLayerCacheParams {
                    mem_size,
                    layer_index: occ,
                    flags: GpuCacheFlags::READ | GpuCacheFlags::WRITE | mappable_flag,
                    // Write-back invalidates the incrementally maintained
                    // first-valid hint; rescan on sync.
                    sync_hook: Some(occupancy_sync_hook as ChunkSyncHook),
                },
            );
        }

        if let Some(mean_layer) = mean {
            self.create_cache(
                MEAN_CACHE,
                layout.layer(mean_layer).clone(),
                dims,
                &GpuLayerCacheParams {
                    mem_size: share(mean),
                    layer_index: mean_layer,
                    flags: GpuCacheFlags::READ | GpuCacheFlags::WRITE | mappable_flag,
                    sync_hook: None,
                },
            );
        }

        if let Some(cov_layer) = covariance {
            self.create_cache(
                COVARIANCE_CACHE,
                layout.layer(cov_layer).clone(),
                dims,
                &GpuLayerCacheParams {
                    mem_size: share(covariance),
                    layer_index: cov_layer,
                    flags: GpuCacheFlags::READ | GpuCacheFlags::WRITE | mappable_flag,
                    sync_hook: None,
                },
            );
        }

        if clearance.is_some() {
            if let Some(occ) = occupancy {
                // Clearance computation reads occupancy; its cache hosts
                // that layer read-only.
                self.create_cache(
                    CLEARANCE_CACHE,
                    layout.layer(occ).clone(),
                    dims,
                    &GpuLayerCacheParams {
                        mem_size: share(clearance),
                        layer_index: occ,
                        flags: GpuCacheFlags::READ | mappable_flag,
                        sync_hook: None,
                    },
                );
            }
        }
    }
}
