//! Error types for akasha-map.
//!
//! # Error Recovery Strategies
//!
//! ## Retryable
//!
//! - **`CacheFull`**: No device page could be recycled for an upload. The
//!   accelerated integrator recovers from this internally by submitting the
//!   batch in flight and retrying once; if it reaches the caller it means a
//!   single region's layer slice exceeds the whole cache budget. Raise
//!   `gpu_target_layer_mem` and retry.
//!
//! ## Per-ray (silent)
//!
//! - **`BadRay`**: A ray containing NaN components or exceeding the range
//!   filter. These are never surfaced per-ray; they are dropped and counted.
//!   The variant exists so batch-level APIs can report a wholly-rejected
//!   input set.
//!
//! ## Caller errors
//!
//! - **`InvalidKey`**: A null key or out-of-range local coordinate was used
//!   to address a voxel. Keys produced by this crate are always valid;
//!   hand-built keys may not be.
//! - **`NoSuchRegion`**: A region lookup without create-on-miss found
//!   nothing.
//! - **`LayoutMismatch`**: Persisted data or a migration request does not
//!   agree with the map's current layer layout.
//!
//! ## Fatal for the batch
//!
//! - **`Device`**: A device transfer or kernel execution failed. Events for
//!   the affected batch still complete and remain safe to wait on; the
//!   batch's voxel updates must be considered lost.
//!
//! ## I/O
//!
//! - **`Serialisation`**: Underlying file I/O or a malformed map file.

use thiserror::Error;

use crate::core::Key;
use glam::I16Vec3;

/// Errors produced by map, cache and device operations.
///
/// See the module documentation for recovery strategies.
#[derive(Error, Debug)]
pub enum MapError {
    /// A null key or out-of-range local coordinate addressed a voxel.
    #[error("invalid voxel key: {0:?}")]
    InvalidKey(Key),

    /// A region lookup without create-on-miss found nothing.
    #[error("no chunk exists for region ({}, {}, {})", .0.x, .0.y, .0.z)]
    NoSuchRegion(I16Vec3),

    /// No device page could be recycled for an upload.
    #[error("device cache full: no evictable page outside the active batch")]
    CacheFull,

    /// A device transfer or kernel execution failed.
    #[error("device error: {0}")]
    Device(String),

    /// Every ray of a batch was rejected by filtering.
    #[error("rejected ray batch: every ray was filtered")]
    BadRay,

    /// Persisted data or a migration request disagrees with the layout.
    #[error("layout mismatch: {0}")]
    LayoutMismatch(String),

    /// File I/O failed or a map file is malformed.
    #[error("serialisation error: {0}")]
    Serialisation(#[from] std::io::Error),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, MapError>;
