//! Chunk storage: one populated region's voxel data across all layers.

use glam::{DVec3, I16Vec3, U8Vec3};

use crate::core::{is_unobserved, local_from_index, voxel_index};
use crate::layout::{MapLayer, MapLayout, OCCUPANCY_MEMBER};

/// Chunk state flags.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ChunkFlags(u16);

impl ChunkFlags {
    /// No flags set.
    pub const NONE: ChunkFlags = ChunkFlags(0);
    /// At least one voxel of the chunk has been written since allocation.
    pub const TOUCHED: ChunkFlags = ChunkFlags(1);

    /// True when every flag in `other` is set.
    #[inline]
    pub fn contains(self, other: ChunkFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Set every flag in `other`.
    #[inline]
    pub fn insert(&mut self, other: ChunkFlags) {
        self.0 |= other.0;
    }
}

impl std::ops::BitOr for ChunkFlags {
    type Output = ChunkFlags;

    fn bitor(self, rhs: ChunkFlags) -> ChunkFlags {
        ChunkFlags(self.0 | rhs.0)
    }
}

/// Voxel data for one populated region.
///
/// Owns one word buffer per layer of the map's layout. Word buffers keep
/// every member naturally aligned for reinterpretation as `f32`/`u32` and
/// for transfer to a device page.
#[derive(Clone, Debug)]
pub struct MapChunk {
    region: I16Vec3,
    centre: DVec3,
    layers: Vec<Vec<u32>>,
    touched_stamps: Vec<u64>,
    /// Stamp of the map mutation that most recently dirtied this chunk.
    pub dirty_stamp: u64,
    /// Wall-clock time (caller supplied, seconds) of the last touch.
    pub touched_time: f64,
    first_valid: U8Vec3,
    flags: ChunkFlags,
}

impl MapChunk {
    /// Allocate a chunk with every layer cleared.
    pub fn new(region: I16Vec3, centre: DVec3, layout: &MapLayout, dims: U8Vec3) -> Self {
        Self {
            region,
            centre,
            layers: layout.layers().iter().map(|l| l.allocate(dims)).collect(),
            touched_stamps: vec![0; layout.layer_count()],
            dirty_stamp: 0,
            touched_time: 0.0,
            // One past the last voxel: no valid voxel yet.
            first_valid: dims,
            flags: ChunkFlags::NONE,
        }
    }

    /// Region coordinate.
    #[inline]
    pub fn region(&self) -> I16Vec3 {
        self.region
    }

    /// World-space centre of the region.
    #[inline]
    pub fn centre(&self) -> DVec3 {
        self.centre
    }

    /// Chunk state flags.
    #[inline]
    pub fn flags(&self) -> ChunkFlags {
        self.flags
    }

    /// Set chunk state flags.
    #[inline]
    pub fn set_flags(&mut self, flags: ChunkFlags) {
        self.flags.insert(flags);
    }

    /// Word buffer of one layer.
    #[inline]
    pub fn layer_words(&self, layer: usize) -> &[u32] {
        &self.layers[layer]
    }

    /// Mutable word buffer of one layer.
    #[inline]
    pub fn layer_words_mut(&mut self, layer: usize) -> &mut [u32] {
        &mut self.layers[layer]
    }

    /// Byte view of one layer, suitable for transfer.
    #[inline]
    pub fn layer_bytes(&self, layer: usize) -> &[u8] {
        bytemuck::cast_slice(&self.layers[layer])
    }

    /// Replace a layer's contents from a byte image of equal size.
    pub fn write_layer_bytes(&mut self, layer: usize, bytes: &[u8]) {
        let words: &mut [u32] = &mut self.layers[layer];
        bytemuck::cast_slice_mut::<u32, u8>(words).copy_from_slice(bytes);
    }

    /// Replace the layer buffers wholesale (layout migration).
    pub(crate) fn replace_layers(&mut self, layers: Vec<Vec<u32>>, layer_count: usize) {
        self.layers = layers;
        self.touched_stamps.resize(layer_count, 0);
    }

    /// Monotonic stamp of the last mutation touching `layer`.
    #[inline]
    pub fn touched_stamp(&self, layer: usize) -> u64 {
        self.touched_stamps[layer]
    }

    /// Record a mutation of `layer` at `stamp`.
    #[inline]
    pub fn touch_layer(&mut self, layer: usize, stamp: u64) {
        self.touched_stamps[layer] = stamp;
        self.dirty_stamp = self.dirty_stamp.max(stamp);
    }

    /// Smallest local coordinate holding an observed occupancy value, or
    /// `dims` when the chunk holds none.
    #[inline]
    pub fn first_valid(&self) -> U8Vec3 {
        self.first_valid
    }

    /// Linear index of the first observed voxel, if any.
    pub fn first_valid_index(&self, dims: U8Vec3) -> Option<usize> {
        if self.first_valid == dims {
            None
        } else {
            Some(voxel_index(self.first_valid, dims))
        }
    }

    /// Lower the first-valid hint to `local` if it precedes the current
    /// hint in linear order.
    pub fn note_valid(&mut self, local: U8Vec3, dims: U8Vec3) {
        let candidate = voxel_index(local, dims);
        let current = if self.first_valid == dims {
            usize::MAX
        } else {
            voxel_index(self.first_valid, dims)
        };
        if candidate < current {
            self.first_valid = local;
        }
        self.flags.insert(ChunkFlags::TOUCHED);
    }

    pub(crate) fn restore_first_valid(&mut self, first_valid: U8Vec3) {
        self.first_valid = first_valid;
    }

    /// Recompute the first-valid hint by scanning the occupancy layer.
    ///
    /// Used after a device page is written back, when the hint can no
    /// longer be maintained incrementally.
    pub fn search_and_update_first_valid(&mut self, occupancy: &MapLayer, dims: U8Vec3) {
        let stride = occupancy.voxel_words();
        let member = occupancy
            .member_index(OCCUPANCY_MEMBER)
            .unwrap_or_default();
        let words = &self.layers[occupancy.index()];
        let volume = words.len() / stride.max(1);

        self.first_valid = dims;
        for i in 0..volume {
            if !is_unobserved(f32::from_bits(words[i * stride + member])) {
                self.first_valid = local_from_index(i, dims);
                self.flags.insert(ChunkFlags::TOUCHED);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::UNOBSERVED_VALUE;
    use crate::layout::MapLayout;

    const DIMS: U8Vec3 = U8Vec3::new(8, 8, 8);

    fn chunk() -> (MapChunk, MapLayout) {
        let layout = MapLayout::with_occupancy(false);
        (
            MapChunk::new(I16Vec3::ZERO, DVec3::ZERO, &layout, DIMS),
            layout,
        )
    }

    #[test]
    fn test_new_chunk_has_no_valid_voxel() {
        let (chunk, _) = chunk();
        assert_eq!(chunk.first_valid(), DIMS);
        assert_eq!(chunk.first_valid_index(DIMS), None);
        assert!(!chunk.flags().contains(ChunkFlags::TOUCHED));
    }

    #[test]
    fn test_note_valid_keeps_minimum() {
        let (mut chunk, _) = chunk();
        chunk.note_valid(U8Vec3::new(4, 2, 1), DIMS);
        assert_eq!(chunk.first_valid(), U8Vec3::new(4, 2, 1));
        // Later in linear order: ignored.
        chunk.note_valid(U8Vec3::new(0, 0, 3), DIMS);
        assert_eq!(chunk.first_valid(), U8Vec3::new(4, 2, 1));
        // Earlier: adopted.
        chunk.note_valid(U8Vec3::new(7, 1, 1), DIMS);
        assert_eq!(chunk.first_valid(), U8Vec3::new(7, 1, 1));
        assert!(chunk.flags().contains(ChunkFlags::TOUCHED));
    }

    #[test]
    fn test_search_first_valid() {
        let (mut chunk, layout) = chunk();
        let target = U8Vec3::new(3, 5, 2);
        let idx = voxel_index(target, DIMS);
        chunk.layer_words_mut(0)[idx] = 0.5f32.to_bits();

        chunk.search_and_update_first_valid(layout.layer(0), DIMS);
        assert_eq!(chunk.first_valid(), target);

        // Clearing the voxel and rescanning resets the hint.
        chunk.layer_words_mut(0)[idx] = UNOBSERVED_VALUE.to_bits();
        chunk.search_and_update_first_valid(layout.layer(0), DIMS);
        assert_eq!(chunk.first_valid(), DIMS);
    }

    #[test]
    fn test_touch_layer_tracks_dirty_stamp() {
        let (mut chunk, _) = chunk();
        chunk.touch_layer(0, 7);
        assert_eq!(chunk.touched_stamp(0), 7);
        assert_eq!(chunk.dirty_stamp, 7);
        chunk.touch_layer(0, 3);
        assert_eq!(chunk.dirty_stamp, 7);
    }
}
