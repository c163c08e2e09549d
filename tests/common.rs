//! Shared helpers for integration tests.

#![allow(dead_code)]

use glam::DVec3;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Truncate a point to single precision, so both integration paths see
/// bit-identical coordinates regardless of their internal wire format.
pub fn f32_clean(p: DVec3) -> DVec3 {
    DVec3::new(p.x as f32 as f64, p.y as f32 as f64, p.z as f32 as f64)
}

/// A deterministic spherical scan: `count` rays from a fixed origin along
/// uniformly random directions, with ranges in `[min_range, max_range)`.
///
/// Returns origin/sample pairs. Pass-through voxels only ever receive
/// misses and shell voxels almost only hits, which keeps clamped values
/// insensitive to update order across integration paths.
pub fn sphere_scan(
    seed: u64,
    count: usize,
    origin: DVec3,
    min_range: f64,
    max_range: f64,
) -> Vec<DVec3> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut rays = Vec::with_capacity(count * 2);
    for _ in 0..count {
        let z: f64 = rng.gen_range(-1.0..1.0);
        let azimuth: f64 = rng.gen_range(0.0..std::f64::consts::TAU);
        let r = (1.0 - z * z).sqrt();
        let direction = DVec3::new(r * azimuth.cos(), r * azimuth.sin(), z);
        let range = rng.gen_range(min_range..max_range);

        rays.push(f32_clean(origin));
        rays.push(f32_clean(origin + direction * range));
    }
    rays
}
