//! Device-accelerated mapping: residency caches, the double-buffered ray
//! pipeline and the region-update kernel contract.
//!
//! The entry point is [`GpuMap::new`] (or [`enable_gpu`]), which takes
//! ownership of an [`crate::map::OccupancyMap`], brings up a device and
//! builds one residency cache per known logical layer. Ray batches then
//! flow through [`GpuMap::integrate_rays`]; results become observable in
//! the map after [`GpuMap::sync`].

pub mod cache;
pub mod kernel;
pub mod layer_cache;
mod map;

pub use cache::{GpuCache, CLEARANCE_CACHE, COVARIANCE_CACHE, MEAN_CACHE, OCCUPANCY_CACHE};
pub use kernel::RegionUpdateParams;
pub use layer_cache::{
    CacheStatus, CacheUpload, ChunkSyncHook, GpuCacheFlags, GpuLayerCache, GpuLayerCacheParams,
    ALLOW_REGION_CREATE,
};
pub use map::{GpuMap, SensorTransforms, DEFAULT_MAX_RANGE};

use crate::error::Result;
use crate::map::OccupancyMap;

/// Take over `map` with a device pipeline; see [`GpuMap::new`].
///
/// `target_layer_mem` is the total device memory budget distributed across
/// the map's known layers (zero picks the default); `mappable_buffers`
/// prefers mapped transfers on devices sharing host memory.
pub fn enable_gpu(
    map: OccupancyMap,
    target_layer_mem: usize,
    mappable_buffers: bool,
) -> Result<GpuMap> {
    GpuMap::new(map, target_layer_mem, mappable_buffers)
}
