//! # Akasha-Map: Probabilistic 3D Occupancy Mapping
//!
//! A sparse, chunked voxel mapping library for real-time integration of
//! LiDAR-like sensor rays, with an accelerated ray-integration pipeline
//! layered over a device abstraction.
//!
//! ## Overview
//!
//! The map stores per-voxel log-odds occupancy in fixed-size regions
//! (default 32x32x32 voxels), allocated lazily as rays touch them.
//! Optional layers refine each voxel: a packed sub-voxel sample position,
//! a sample mean, and an incident-normal estimate.
//!
//! Two integration paths produce the same values (up to floating-point
//! summation order):
//!
//! - **Scalar**: [`OccupancyMap::integrate_rays`] walks each ray with a
//!   3D-DDA and updates voxels in place.
//! - **Accelerated**: [`gpu::GpuMap`] batches rays through a
//!   double-buffered pipeline feeding a region-update kernel, with a
//!   fixed-pool residency cache coordinating chunk data on the device.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use akasha_map::{MapFlags, OccupancyMap, RayFlags};
//! use glam::{DVec3, U8Vec3};
//!
//! let mut map = OccupancyMap::new(0.1, U8Vec3::splat(32), MapFlags::NONE);
//!
//! // One ray: sensor at the origin, sample one metre out.
//! let rays = [DVec3::ZERO, DVec3::new(1.0, 0.0, 0.0)];
//! let integrated = map.integrate_rays(&rays, RayFlags::NONE);
//! assert_eq!(integrated, 1);
//!
//! let key = map.voxel_key(DVec3::new(1.0, 0.0, 0.0));
//! println!("sample voxel is {:?}", map.occupancy_type(key));
//! ```
//!
//! ## Architecture
//!
//! - [`core`]: voxel addressing, value encodings, probability model
//! - [`layout`]: named layers and their per-voxel members
//! - [`map`]: the chunked map, traversal, filters, scalar integration
//! - [`device`]: buffers, events and queues of the compute backend
//! - [`gpu`]: residency caches and the accelerated pipeline
//! - [`io`]: chunk-store persistence
//!
//! ## Coordinate Frame
//!
//! World coordinates are metres in a right-handed frame. The map origin
//! anchors the minimum corner of region (0, 0, 0); points exactly on a
//! region or voxel boundary belong to the cell with the larger
//! coordinate.

#![warn(missing_docs)]

pub mod config;
pub mod core;
pub mod device;
pub mod error;
pub mod gpu;
pub mod io;
pub mod layout;
pub mod map;

pub use crate::core::{
    probability_to_value, value_to_probability, Aabb, Key, OccupancyParams, OccupancyType,
    UNOBSERVED_VALUE,
};
pub use config::MapConfig;
pub use error::{MapError, Result};
pub use gpu::{enable_gpu, GpuMap};
pub use map::filter::{clip_range_filter, good_ray_filter, RayFilter, RayFilterFlags};
pub use map::integrate::{
    MapperKind, OccupancyRayMapper, RayFlags, RayMapper, SensorRays, TraceRayMapper,
};
pub use map::traversal::{GridWalk, RegionWalk};
pub use map::{ChunkFlags, MapChunk, MapFlags, OccupancyMap, Voxel};
