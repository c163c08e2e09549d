//! Device residency cache for one map layer.
//!
//! A layer cache owns a fixed pool of device pages, each sized to hold one
//! chunk's slice of the layer. Residency maps region coordinates to pages;
//! pages are recycled by least-recently-used eviction, guarded two ways:
//!
//! - an entry is never evicted within the batch that admitted it (batch
//!   markers are odd integers advancing by two per batch), which rules out
//!   a kernel referencing a page rebound under it;
//! - rebinding waits on the entry's last recorded event, so in-flight work
//!   drains first, and dirty pages are written back to their chunk before
//!   the page is reused.
//!
//! Chunk-to-page uploads are enqueued on the cache's queue; the kernel
//! launch that consumes them is enqueued behind them on the same queue, so
//! FIFO submission order covers that dependency without explicit events.

use std::collections::HashMap;

use glam::{I16Vec3, U8Vec3};

use crate::device::{DeviceBuffer, Event, Queue};
use crate::layout::MapLayer;
use crate::map::{MapChunk, OccupancyMap};

/// Access flags of a layer cache.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GpuCacheFlags(u32);

impl GpuCacheFlags {
    /// No access.
    pub const NONE: GpuCacheFlags = GpuCacheFlags(0);
    /// The device reads this layer: chunk data is uploaded into pages.
    pub const READ: GpuCacheFlags = GpuCacheFlags(1 << 0);
    /// The device writes this layer: pages are written back to chunks.
    pub const WRITE: GpuCacheFlags = GpuCacheFlags(1 << 1);
    /// Prefer mapped transfers when the device shares host memory.
    pub const MAPPABLE: GpuCacheFlags = GpuCacheFlags(1 << 2);

    /// True when every flag in `other` is set.
    #[inline]
    pub fn contains(self, other: GpuCacheFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for GpuCacheFlags {
    type Output = GpuCacheFlags;

    fn bitor(self, rhs: GpuCacheFlags) -> GpuCacheFlags {
        GpuCacheFlags(self.0 | rhs.0)
    }
}

/// Post-write-back hook, invoked with the chunk after a page has been
/// copied back into it.
pub type ChunkSyncHook = fn(&mut MapChunk, &MapLayer, U8Vec3);

/// Construction parameters for one layer cache.
#[derive(Clone)]
pub struct GpuLayerCacheParams {
    /// Device memory budget for this layer's page pool, in bytes.
    pub mem_size: usize,
    /// Index of the map layer this cache hosts.
    pub layer_index: usize,
    /// Access flags.
    pub flags: GpuCacheFlags,
    /// Optional post-write-back hook.
    pub sync_hook: Option<ChunkSyncHook>,
}

/// Result status of an upload request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CacheStatus {
    /// The region was already resident; its existing page is reused.
    AlreadyCached,
    /// The region was bound to a page (and uploaded, for readable
    /// layers).
    New,
    /// No page could be recycled: every page belongs to the active batch.
    /// Retryable after submitting the current batch.
    CacheFull,
}

/// Outcome of an upload request. `offset` is only meaningful when
/// `status != CacheStatus::CacheFull`.
#[derive(Clone, Copy, Debug)]
pub struct CacheUpload {
    /// What happened.
    pub status: CacheStatus,
    /// Byte offset of the region's page within the pool buffer.
    pub offset: u64,
}

/// Allow chunk creation for regions not yet backed by the map.
pub const ALLOW_REGION_CREATE: bool = true;

#[derive(Debug)]
struct PageEntry {
    page: usize,
    event: Event,
    batch_marker: u64,
    dirty: bool,
    /// The chunk's layer touch stamp captured when the page content was
    /// last reconciled with the chunk. A chunk stamp beyond this means the
    /// host wrote the chunk since, and the page must be refreshed.
    chunk_stamp: u64,
    last_use: u64,
}

/// Fixed-pool device residency cache for one layer.
pub struct GpuLayerCache {
    layer: MapLayer,
    dims: U8Vec3,
    flags: GpuCacheFlags,
    sync_hook: Option<ChunkSyncHook>,
    buffer: DeviceBuffer,
    queue: Queue,
    page_size: usize,
    page_count: usize,
    residents: HashMap<I16Vec3, PageEntry>,
    free_pages: Vec<usize>,
    next_unused: usize,
    use_counter: u64,
    batch_marker: u64,
}

impl GpuLayerCache {
    /// Create a cache for `layer` with a pool sized from
    /// `params.mem_size` (at least one page).
    pub fn new(queue: Queue, layer: MapLayer, dims: U8Vec3, params: &GpuLayerCacheParams) -> Self {
        let page_size = layer.layer_byte_size(dims);
        let page_count = (params.mem_size / page_size).max(1);
        log::debug!(
            "layer cache '{}': {} pages of {} bytes",
            layer.name(),
            page_count,
            page_size
        );
        Self {
            layer,
            dims,
            flags: params.flags,
            sync_hook: params.sync_hook,
            buffer: DeviceBuffer::new(page_count * page_size),
            queue,
            page_size,
            page_count,
            residents: HashMap::new(),
            free_pages: Vec::new(),
            next_unused: 0,
            use_counter: 0,
            batch_marker: 1,
        }
    }

    /// Index of the map layer this cache hosts.
    #[inline]
    pub fn layer_index(&self) -> usize {
        self.layer.index()
    }

    /// Pages in the pool.
    #[inline]
    pub fn page_count(&self) -> usize {
        self.page_count
    }

    /// Bytes per page (one chunk's layer slice).
    #[inline]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// The pool buffer.
    #[inline]
    pub fn buffer(&self) -> &DeviceBuffer {
        &self.buffer
    }

    /// The cache's submission queue.
    #[inline]
    pub fn queue(&self) -> &Queue {
        &self.queue
    }

    /// Access flags.
    #[inline]
    pub fn flags(&self) -> GpuCacheFlags {
        self.flags
    }

    /// The active batch marker.
    #[inline]
    pub fn batch_marker(&self) -> u64 {
        self.batch_marker
    }

    /// Open a new batch and return its marker. Markers are odd and
    /// advance by two; entries admitted under the returned marker are
    /// shielded from eviction until the next batch opens.
    pub fn begin_batch(&mut self) -> u64 {
        self.batch_marker = self.batch_marker.wrapping_add(2);
        self.batch_marker
    }

    /// Number of currently resident regions.
    pub fn resident_count(&self) -> usize {
        self.residents.len()
    }

    /// Request residency for `region`'s slice of this layer.
    ///
    /// On success the returned offset addresses the region's page within
    /// the pool buffer. `CacheStatus::CacheFull` means every page belongs
    /// to the active batch (or the region has no chunk and `allow_create`
    /// is false); the caller may submit the batch and retry.
    ///
    /// May block waiting on the evicted page's last event; dirty evicted
    /// pages are written back to their chunks first, so device results are
    /// never dropped by eviction.
    pub fn upload(
        &mut self,
        map: &mut OccupancyMap,
        region: I16Vec3,
        batch_marker: u64,
        allow_create: bool,
    ) -> CacheUpload {
        let layer_index = self.layer.index();
        self.use_counter += 1;
        let use_stamp = self.use_counter;

        // Resident fast path.
        let snapshot = self
            .residents
            .get(&region)
            .map(|e| (e.page, e.batch_marker, e.chunk_stamp, e.dirty, e.event.clone()));
        if let Some((page, entry_batch, entry_stamp, dirty, event)) = snapshot {
            let offset = (page * self.page_size) as u64;
            let chunk_stamp = map
                .region_chunk(region)
                .map(|c| c.touched_stamp(layer_index))
                .unwrap_or(entry_stamp);
            let stale = chunk_stamp > entry_stamp;

            if entry_batch == batch_marker && !stale {
                let entry = self.residents.get_mut(&region).expect("resident");
                entry.last_use = use_stamp;
                return CacheUpload {
                    status: CacheStatus::AlreadyCached,
                    offset,
                };
            }

            let mut new_event = event.clone();
            if stale && self.flags.contains(GpuCacheFlags::READ) {
                // The host wrote the chunk since the page was populated and
                // the page must be refreshed. Unsynced device results are
                // pulled back first; host edits racing an unsynced dirty
                // page lose to the device content.
                if dirty && self.flags.contains(GpuCacheFlags::WRITE) {
                    self.sync_entry_to_chunk(map, region);
                } else {
                    event.wait();
                }
                if let Some(chunk) = map.region_chunk(region) {
                    let bytes = chunk.layer_bytes(layer_index).to_vec();
                    new_event =
                        self.buffer
                            .write_queued(&self.queue, bytes, page * self.page_size, &[]);
                }
            }

            let stamp = self.mark_chunk(map, region);
            let entry = self.residents.get_mut(&region).expect("resident");
            entry.last_use = use_stamp;
            entry.batch_marker = batch_marker;
            entry.event = new_event;
            entry.dirty = dirty || self.flags.contains(GpuCacheFlags::WRITE);
            entry.chunk_stamp = stamp;
            return CacheUpload {
                status: CacheStatus::AlreadyCached,
                offset,
            };
        }

        // Not resident: the region needs a chunk and a page.
        if map.region_chunk(region).is_none() && !allow_create {
            return CacheUpload {
                status: CacheStatus::CacheFull,
                offset: 0,
            };
        }
        let page = match self.acquire_page(map, batch_marker) {
            Some(page) => page,
            None => {
                return CacheUpload {
                    status: CacheStatus::CacheFull,
                    offset: 0,
                }
            }
        };

        let offset = page * self.page_size;
        let _ = map.region_chunk_mut(region, true);
        let stamp = self.mark_chunk(map, region);

        let event = if self.flags.contains(GpuCacheFlags::READ) {
            let chunk = map.region_chunk(region).expect("chunk just created");
            let bytes = chunk.layer_bytes(layer_index).to_vec();
            self.buffer.write_queued(&self.queue, bytes, offset, &[])
        } else {
            Event::complete()
        };

        self.residents.insert(
            region,
            PageEntry {
                page,
                event,
                batch_marker,
                dirty: self.flags.contains(GpuCacheFlags::WRITE),
                chunk_stamp: stamp,
                last_use: use_stamp,
            },
        );

        CacheUpload {
            status: CacheStatus::New,
            offset: offset as u64,
        }
    }

    /// Stamp the chunk dirty for this batch (writable caches only) and
    /// return the resulting layer touch stamp.
    fn mark_chunk(&self, map: &mut OccupancyMap, region: I16Vec3) -> u64 {
        let layer_index = self.layer.index();
        if self.flags.contains(GpuCacheFlags::WRITE) {
            let stamp = map.stamp();
            if let Some(chunk) = map.region_chunk_mut(region, false) {
                chunk.touch_layer(layer_index, stamp);
                return stamp;
            }
        }
        map.region_chunk(region)
            .map(|c| c.touched_stamp(layer_index))
            .unwrap_or(0)
    }

    fn acquire_page(&mut self, map: &mut OccupancyMap, active_batch: u64) -> Option<usize> {
        if let Some(page) = self.free_pages.pop() {
            return Some(page);
        }
        if self.next_unused < self.page_count {
            let page = self.next_unused;
            self.next_unused += 1;
            return Some(page);
        }

        // LRU among entries outside the active batch.
        let victim = self
            .residents
            .iter()
            .filter(|(_, e)| e.batch_marker != active_batch)
            .min_by_key(|(_, e)| e.last_use)
            .map(|(region, _)| *region)?;

        let dirty = self.residents.get(&victim).map(|e| e.dirty).unwrap_or(false);
        if dirty && self.flags.contains(GpuCacheFlags::WRITE) {
            self.sync_entry_to_chunk(map, victim);
        } else if let Some(entry) = self.residents.get(&victim) {
            entry.event.wait();
        }

        let entry = self.residents.remove(&victim).expect("victim resident");
        log::debug!(
            "layer cache '{}': evicting region {victim:?} from page {}",
            self.layer.name(),
            entry.page
        );
        Some(entry.page)
    }

    /// Attach `event` as the latest completion event of every entry
    /// admitted under `batch_marker` (the batch's kernel-done event).
    pub fn update_events(&mut self, batch_marker: u64, event: &Event) {
        for entry in self.residents.values_mut() {
            if entry.batch_marker == batch_marker {
                entry.event = event.clone();
            }
        }
    }

    /// Write one resident, dirty page back into its chunk: wait on its
    /// last event, copy the page, invoke the sync hook, clear dirty.
    fn sync_entry_to_chunk(&mut self, map: &mut OccupancyMap, region: I16Vec3) {
        let layer_index = self.layer.index();
        let Some((page, event)) = self
            .residents
            .get(&region)
            .map(|e| (e.page, e.event.clone()))
        else {
            return;
        };
        event.wait();

        if let Some(chunk) = map.region_chunk_mut(region, false) {
            let mut bytes = vec![0u8; self.page_size];
            self.buffer.read_bytes(&mut bytes, page * self.page_size);
            chunk.write_layer_bytes(layer_index, &bytes);
            if let Some(hook) = self.sync_hook {
                hook(chunk, &self.layer, self.dims);
            }
        }
        if let Some(entry) = self.residents.get_mut(&region) {
            entry.dirty = false;
        }
    }

    /// Write every dirty resident page back to its chunk. Idempotent.
    pub fn sync_to_host(&mut self, map: &mut OccupancyMap) {
        if !self.flags.contains(GpuCacheFlags::WRITE) {
            return;
        }
        let dirty: Vec<I16Vec3> = self
            .residents
            .iter()
            .filter(|(_, e)| e.dirty)
            .map(|(region, _)| *region)
            .collect();
        for region in dirty {
            self.sync_entry_to_chunk(map, region);
        }
    }

    /// Write one region's page back to its chunk, if resident and dirty.
    pub fn sync_region_to_host(&mut self, map: &mut OccupancyMap, region: I16Vec3) {
        if !self.flags.contains(GpuCacheFlags::WRITE) {
            return;
        }
        let is_dirty = self.residents.get(&region).map(|e| e.dirty).unwrap_or(false);
        if is_dirty {
            self.sync_entry_to_chunk(map, region);
        }
    }

    /// Drop a region's residency without write-back (used when its chunk
    /// is being destroyed).
    pub fn remove(&mut self, region: I16Vec3) {
        if let Some(entry) = self.residents.remove(&region) {
            entry.event.wait();
            self.free_pages.push(entry.page);
        }
    }

    /// Drop every residency without write-back.
    pub fn clear(&mut self) {
        for entry in self.residents.values() {
            entry.event.wait();
        }
        self.residents.clear();
        self.free_pages.clear();
        self.next_unused = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Device;
    use crate::map::MapFlags;
    use glam::DVec3;

    fn setup(pages: usize) -> (Device, OccupancyMap, GpuLayerCache) {
        let device = Device::new();
        let map = OccupancyMap::new(0.1, U8Vec3::splat(32), MapFlags::NONE);
        let layer_index = map.layout().occupancy_layer().expect("occupancy layer");
        let layer = map.layout().layer(layer_index).clone();
        let page_size = layer.layer_byte_size(map.region_voxel_dims());
        let cache = GpuLayerCache::new(
            device.queue(),
            layer,
            map.region_voxel_dims(),
            &GpuLayerCacheParams {
                mem_size: pages * page_size,
                layer_index,
                flags: GpuCacheFlags::READ | GpuCacheFlags::WRITE,
                sync_hook: None,
            },
        );
        (device, map, cache)
    }

    #[test]
    fn test_upload_statuses() {
        let (_device, mut map, mut cache) = setup(2);
        let batch = cache.begin_batch();
        let region = I16Vec3::ZERO;

        let first = cache.upload(&mut map, region, batch, ALLOW_REGION_CREATE);
        assert_eq!(first.status, CacheStatus::New);
        assert!(map.region_chunk(region).is_some());

        let again = cache.upload(&mut map, region, batch, ALLOW_REGION_CREATE);
        assert_eq!(again.status, CacheStatus::AlreadyCached);
        assert_eq!(again.offset, first.offset);
    }

    #[test]
    fn test_missing_chunk_without_create() {
        let (_device, mut map, mut cache) = setup(2);
        let batch = cache.begin_batch();
        let result = cache.upload(&mut map, I16Vec3::new(5, 0, 0), batch, false);
        assert_eq!(result.status, CacheStatus::CacheFull);
        assert!(map.region_chunk(I16Vec3::new(5, 0, 0)).is_none());
    }

    #[test]
    fn test_cache_full_within_active_batch() {
        let (_device, mut map, mut cache) = setup(2);
        let batch = cache.begin_batch();
        for x in 0..2i16 {
            let result = cache.upload(&mut map, I16Vec3::new(x, 0, 0), batch, ALLOW_REGION_CREATE);
            assert_eq!(result.status, CacheStatus::New);
        }
        // Pool exhausted and every page is shielded by the active batch.
        let full = cache.upload(&mut map, I16Vec3::new(9, 0, 0), batch, ALLOW_REGION_CREATE);
        assert_eq!(full.status, CacheStatus::CacheFull);

        // A new batch unshields the pages: LRU eviction proceeds.
        let next_batch = cache.begin_batch();
        let result = cache.upload(&mut map, I16Vec3::new(9, 0, 0), next_batch, ALLOW_REGION_CREATE);
        assert_eq!(result.status, CacheStatus::New);
        assert_eq!(cache.resident_count(), 2);
    }

    #[test]
    fn test_eviction_writes_back_device_results() {
        let (_device, mut map, mut cache) = setup(1);
        let batch = cache.begin_batch();
        let region = I16Vec3::ZERO;
        let upload = cache.upload(&mut map, region, batch, ALLOW_REGION_CREATE);
        assert_eq!(upload.status, CacheStatus::New);

        // Simulate a kernel writing the page.
        cache.queue().finish();
        cache.buffer().write_elements(&[0.75f32.to_bits()], 0);

        // Admitting another region in a later batch evicts and must carry
        // the device result back into the chunk.
        let next_batch = cache.begin_batch();
        let result = cache.upload(&mut map, I16Vec3::new(1, 0, 0), next_batch, ALLOW_REGION_CREATE);
        assert_eq!(result.status, CacheStatus::New);

        let key = map.voxel_key(DVec3::splat(0.05));
        assert_eq!(map.value(key), Some(0.75));
    }

    #[test]
    fn test_sync_to_host_is_idempotent() {
        let (_device, mut map, mut cache) = setup(2);
        let batch = cache.begin_batch();
        let region = I16Vec3::ZERO;
        cache.upload(&mut map, region, batch, ALLOW_REGION_CREATE);

        cache.queue().finish();
        cache.buffer().write_elements(&[1.25f32.to_bits()], 0);

        cache.sync_to_host(&mut map);
        let key = map.voxel_key(DVec3::splat(0.05));
        assert_eq!(map.value(key), Some(1.25));

        // Second sync is a no-op even if the page were to change.
        cache.buffer().write_elements(&[2.5f32.to_bits()], 0);
        cache.sync_to_host(&mut map);
        assert_eq!(map.value(key), Some(1.25));
    }

    #[test]
    fn test_host_edit_forces_refresh() {
        let (_device, mut map, mut cache) = setup(2);
        let batch = cache.begin_batch();
        let region = I16Vec3::ZERO;
        cache.upload(&mut map, region, batch, ALLOW_REGION_CREATE);
        cache.sync_to_host(&mut map);

        // Host writes the chunk after the page was populated.
        let key = map.voxel_key(DVec3::splat(0.05));
        map.set_value(key, 2.0).expect("valid key");

        let next_batch = cache.begin_batch();
        let result = cache.upload(&mut map, region, next_batch, ALLOW_REGION_CREATE);
        assert_eq!(result.status, CacheStatus::AlreadyCached);
        cache.queue().finish();

        // The page now reflects the host edit.
        let mut word = [0u32];
        cache.buffer().read_elements(&mut word, 0);
        assert_eq!(f32::from_bits(word[0]), 2.0);
    }

    #[test]
    fn test_remove_frees_page() {
        let (_device, mut map, mut cache) = setup(1);
        let batch = cache.begin_batch();
        cache.upload(&mut map, I16Vec3::ZERO, batch, ALLOW_REGION_CREATE);
        cache.remove(I16Vec3::ZERO);
        assert_eq!(cache.resident_count(), 0);

        // The freed page is reusable within the same batch.
        let result = cache.upload(&mut map, I16Vec3::new(1, 0, 0), batch, ALLOW_REGION_CREATE);
        assert_eq!(result.status, CacheStatus::New);
    }
}
