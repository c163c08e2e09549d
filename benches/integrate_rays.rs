//! Ray integration throughput, scalar vs accelerated.

use akasha_map::{enable_gpu, MapFlags, OccupancyMap, RayFlags};
use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use glam::{DVec3, U8Vec3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn sphere_scan(seed: u64, count: usize) -> Vec<DVec3> {
    let mut rng = StdRng::seed_from_u64(seed);
    let origin = DVec3::new(0.5, 0.5, 0.5);
    let mut rays = Vec::with_capacity(count * 2);
    for _ in 0..count {
        let z: f64 = rng.gen_range(-1.0..1.0);
        let azimuth: f64 = rng.gen_range(0.0..std::f64::consts::TAU);
        let r = (1.0 - z * z).sqrt();
        let direction = DVec3::new(r * azimuth.cos(), r * azimuth.sin(), z);
        let range = rng.gen_range(2.0..6.0);
        rays.push(origin);
        rays.push(origin + direction * range);
    }
    rays
}

fn bench_integrate(c: &mut Criterion) {
    let rays = sphere_scan(99, 2048);

    c.bench_function("scalar_integrate_2k_rays", |b| {
        b.iter_batched(
            || OccupancyMap::new(0.1, U8Vec3::splat(32), MapFlags::NONE),
            |mut map| {
                map.integrate_rays(&rays, RayFlags::NONE);
                map
            },
            BatchSize::LargeInput,
        )
    });

    c.bench_function("accelerated_integrate_2k_rays", |b| {
        b.iter_batched(
            || {
                let map = OccupancyMap::new(0.1, U8Vec3::splat(32), MapFlags::NONE);
                enable_gpu(map, 64 * 1024 * 1024, true).expect("enable gpu")
            },
            |mut gpu| {
                gpu.integrate_rays(&rays, true).expect("integrate");
                gpu.sync();
                gpu
            },
            BatchSize::LargeInput,
        )
    });
}

criterion_group!(benches, bench_integrate);
criterion_main!(benches);
