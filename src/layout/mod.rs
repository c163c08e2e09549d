//! Map layer layout.
//!
//! A map stores one byte buffer per chunk per named layer. The layout
//! declares, for each layer, an ordered list of word-sized typed members
//! and a per-member clear pattern. Layer indices are stable for the life of
//! a layout; well-known layers are looked up by name.
//!
//! All members are 32-bit words, which keeps every layer buffer naturally
//! aligned for reinterpretation as `f32`/`u32` slices on both the host and
//! the device.

use glam::U8Vec3;

use crate::core::UNOBSERVED_VALUE;

/// Well-known layer name: log-odds occupancy (plus optional packed
/// sub-voxel position).
pub const OCCUPANCY_LAYER: &str = "occupancy";
/// Well-known layer name: per-voxel sample mean and count.
pub const MEAN_LAYER: &str = "mean";
/// Well-known layer name: upper-triangular sample covariance.
pub const COVARIANCE_LAYER: &str = "covariance";
/// Well-known layer name: clearance distance field.
pub const CLEARANCE_LAYER: &str = "clearance";
/// Well-known layer name: accumulated traversal distance.
pub const TRAVERSAL_LAYER: &str = "traversal";
/// Well-known layer name: packed incident-normal mean.
pub const INCIDENT_LAYER: &str = "incident_normal";

/// Member name of the occupancy value within the occupancy layer.
pub const OCCUPANCY_MEMBER: &str = "occupancy";
/// Member name of the packed sub-voxel position within the occupancy layer.
pub const SUB_VOXEL_MEMBER: &str = "sub_voxel";

/// Storage type of a voxel member. All types are one 32-bit word.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DataType {
    /// IEEE-754 single precision float.
    Float32,
    /// Unsigned 32-bit integer.
    UInt32,
}

impl DataType {
    /// Stable identifier used by the serialised form.
    pub fn id(self) -> u8 {
        match self {
            DataType::Float32 => 0,
            DataType::UInt32 => 1,
        }
    }

    /// Inverse of [`DataType::id`].
    pub fn from_id(id: u8) -> Option<Self> {
        match id {
            0 => Some(DataType::Float32),
            1 => Some(DataType::UInt32),
            _ => None,
        }
    }
}

/// One typed member of a layer's per-voxel structure.
#[derive(Clone, Debug)]
pub struct VoxelMember {
    /// Member name, unique within its layer.
    pub name: String,
    /// Storage type.
    pub data_type: DataType,
    /// Bit pattern newly allocated voxels start from.
    pub clear_value: u32,
}

/// A named layer: an ordered list of members.
#[derive(Clone, Debug)]
pub struct MapLayer {
    name: String,
    index: usize,
    members: Vec<VoxelMember>,
}

impl MapLayer {
    fn new(name: &str, index: usize) -> Self {
        Self {
            name: name.to_string(),
            index,
            members: Vec::new(),
        }
    }

    /// Layer name.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stable index of this layer within its layout.
    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Append a member; returns its word offset within the voxel.
    pub fn add_member(&mut self, name: &str, data_type: DataType, clear_value: u32) -> usize {
        self.members.push(VoxelMember {
            name: name.to_string(),
            data_type,
            clear_value,
        });
        self.members.len() - 1
    }

    /// Remove a member by name. Returns whether anything was removed.
    pub fn remove_member(&mut self, name: &str) -> bool {
        let before = self.members.len();
        self.members.retain(|m| m.name != name);
        self.members.len() != before
    }

    /// Word offset of a member within the voxel.
    pub fn member_index(&self, name: &str) -> Option<usize> {
        self.members.iter().position(|m| m.name == name)
    }

    /// The ordered member list.
    #[inline]
    pub fn members(&self) -> &[VoxelMember] {
        &self.members
    }

    /// Words per voxel.
    #[inline]
    pub fn voxel_words(&self) -> usize {
        self.members.len()
    }

    /// Bytes per voxel.
    #[inline]
    pub fn voxel_byte_size(&self) -> usize {
        self.members.len() * 4
    }

    /// Total words for one chunk of `dims` voxels.
    pub fn layer_words(&self, dims: U8Vec3) -> usize {
        self.voxel_words() * region_volume(dims)
    }

    /// Total bytes for one chunk of `dims` voxels.
    pub fn layer_byte_size(&self, dims: U8Vec3) -> usize {
        self.layer_words(dims) * 4
    }

    /// Allocate a chunk buffer for this layer with every voxel cleared.
    pub fn allocate(&self, dims: U8Vec3) -> Vec<u32> {
        let volume = region_volume(dims);
        let mut words = Vec::with_capacity(volume * self.voxel_words());
        for _ in 0..volume {
            words.extend(self.members.iter().map(|m| m.clear_value));
        }
        words
    }
}

/// Voxel count of a region of `dims` voxels.
#[inline]
pub fn region_volume(dims: U8Vec3) -> usize {
    dims.x as usize * dims.y as usize * dims.z as usize
}

/// An ordered list of named layers.
#[derive(Clone, Debug, Default)]
pub struct MapLayout {
    layers: Vec<MapLayer>,
}

impl MapLayout {
    /// Empty layout.
    pub fn new() -> Self {
        Self::default()
    }

    /// The standard starting layout: a single occupancy layer, optionally
    /// carrying a packed sub-voxel position per voxel.
    pub fn with_occupancy(sub_voxel: bool) -> Self {
        let mut layout = Self::new();
        let layer = layout.add_layer(OCCUPANCY_LAYER);
        layer.add_member(OCCUPANCY_MEMBER, DataType::Float32, UNOBSERVED_VALUE.to_bits());
        if sub_voxel {
            layer.add_member(SUB_VOXEL_MEMBER, DataType::UInt32, 0);
        }
        layout
    }

    /// Append a new empty layer and return it for member registration.
    pub fn add_layer(&mut self, name: &str) -> &mut MapLayer {
        let index = self.layers.len();
        self.layers.push(MapLayer::new(name, index));
        self.layers.last_mut().expect("layer just pushed")
    }

    /// Layer by stable index.
    #[inline]
    pub fn layer(&self, index: usize) -> &MapLayer {
        &self.layers[index]
    }

    /// Mutable layer by stable index.
    #[inline]
    pub fn layer_mut(&mut self, index: usize) -> &mut MapLayer {
        &mut self.layers[index]
    }

    /// Number of layers.
    #[inline]
    pub fn layer_count(&self) -> usize {
        self.layers.len()
    }

    /// The ordered layer list.
    #[inline]
    pub fn layers(&self) -> &[MapLayer] {
        &self.layers
    }

    /// Index of a layer by name.
    pub fn layer_index(&self, name: &str) -> Option<usize> {
        self.layers.iter().position(|l| l.name == name)
    }

    /// Layer by name.
    pub fn layer_by_name(&self, name: &str) -> Option<&MapLayer> {
        self.layers.iter().find(|l| l.name == name)
    }

    /// Index of the occupancy layer.
    pub fn occupancy_layer(&self) -> Option<usize> {
        self.layer_index(OCCUPANCY_LAYER)
    }

    /// Index of the voxel-mean layer.
    pub fn mean_layer(&self) -> Option<usize> {
        self.layer_index(MEAN_LAYER)
    }

    /// Index of the covariance layer.
    pub fn covariance_layer(&self) -> Option<usize> {
        self.layer_index(COVARIANCE_LAYER)
    }

    /// Index of the clearance layer.
    pub fn clearance_layer(&self) -> Option<usize> {
        self.layer_index(CLEARANCE_LAYER)
    }

    /// Index of the traversal layer.
    pub fn traversal_layer(&self) -> Option<usize> {
        self.layer_index(TRAVERSAL_LAYER)
    }

    /// Index of the incident-normal layer.
    pub fn incident_layer(&self) -> Option<usize> {
        self.layer_index(INCIDENT_LAYER)
    }

    /// True when the occupancy layer carries a packed sub-voxel position.
    pub fn has_sub_voxel(&self) -> bool {
        self.layer_by_name(OCCUPANCY_LAYER)
            .map(|l| l.member_index(SUB_VOXEL_MEMBER).is_some())
            .unwrap_or(false)
    }
}

/// Add the standard voxel-mean layer: per-voxel sample mean relative to the
/// voxel centre plus a sample count.
pub fn add_voxel_mean_layer(layout: &mut MapLayout) -> usize {
    let layer = layout.add_layer(MEAN_LAYER);
    layer.add_member("mean_x", DataType::Float32, 0);
    layer.add_member("mean_y", DataType::Float32, 0);
    layer.add_member("mean_z", DataType::Float32, 0);
    layer.add_member("count", DataType::UInt32, 0);
    layer.index()
}

/// Add the standard covariance layer: upper triangle of the 3x3 sample
/// covariance.
pub fn add_covariance_layer(layout: &mut MapLayout) -> usize {
    let layer = layout.add_layer(COVARIANCE_LAYER);
    for name in ["cov_xx", "cov_xy", "cov_yy", "cov_xz", "cov_yz", "cov_zz"] {
        layer.add_member(name, DataType::Float32, 0);
    }
    layer.index()
}

/// Add the standard clearance layer. Voxels start at -1 (clearance
/// unknown).
pub fn add_clearance_layer(layout: &mut MapLayout) -> usize {
    let layer = layout.add_layer(CLEARANCE_LAYER);
    layer.add_member("clearance", DataType::Float32, (-1.0f32).to_bits());
    layer.index()
}

/// Add the standard traversal layer: accumulated in-voxel ray length.
pub fn add_traversal_layer(layout: &mut MapLayout) -> usize {
    let layer = layout.add_layer(TRAVERSAL_LAYER);
    layer.add_member("traversal", DataType::Float32, 0);
    layer.index()
}

/// Add the incident-normal layer: packed progressive normal plus count.
pub fn add_incident_normal_layer(layout: &mut MapLayout) -> usize {
    let layer = layout.add_layer(INCIDENT_LAYER);
    layer.add_member("normal", DataType::UInt32, 0);
    layer.add_member("count", DataType::UInt32, 0);
    layer.index()
}
