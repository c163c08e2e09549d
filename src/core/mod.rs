//! Fundamental types: voxel addressing, bounding volumes and the per-voxel
//! value encodings shared by the host and device integration paths.

mod aabb;
pub mod incident;
mod key;
mod occupancy;
pub mod subvoxel;

pub use aabb::Aabb;
pub use key::{local_from_index, voxel_index, voxel_key_local, Key};
pub use occupancy::{
    is_unobserved, probability_to_value, value_to_probability, OccupancyParams, OccupancyType,
    UNOBSERVED_VALUE,
};
