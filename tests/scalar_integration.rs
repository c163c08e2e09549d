//! End-to-end scenarios for the scalar integration path.

mod common;

use akasha_map::map::traversal::segment_keys;
use akasha_map::{
    clip_range_filter, io, probability_to_value, Aabb, Key, MapFlags, OccupancyMap, OccupancyType,
    RayFlags, UNOBSERVED_VALUE,
};
use glam::{DVec3, U8Vec3};

fn default_map() -> OccupancyMap {
    OccupancyMap::new(0.1, U8Vec3::splat(32), MapFlags::NONE)
}

#[test]
fn single_ray_produces_expected_values() {
    let mut map = default_map();
    let rays = [DVec3::ZERO, DVec3::new(0.45, 0.0, 0.0)];
    assert_eq!(map.integrate_rays(&rays, RayFlags::NONE), 1);

    let expected_miss = probability_to_value(0.4);
    let expected_hit = probability_to_value(0.7);
    assert!((expected_miss + 0.405).abs() < 1e-3);
    assert!((expected_hit - 0.847).abs() < 1e-3);

    let mut observed = 0;
    for voxel in map.voxels() {
        if akasha_map::core::is_unobserved(voxel.value()) {
            continue;
        }
        observed += 1;
        let local = voxel.key().local();
        assert_eq!(voxel.key().region(), glam::I16Vec3::ZERO);
        assert_eq!((local.y, local.z), (0, 0));
        if local.x < 4 {
            assert!((voxel.value() - expected_miss).abs() < 1e-5);
            assert_eq!(voxel.occupancy_type(), OccupancyType::Free);
        } else {
            assert_eq!(local.x, 4);
            assert!((voxel.value() - expected_hit).abs() < 1e-5);
            assert_eq!(voxel.occupancy_type(), OccupancyType::Occupied);
        }
    }
    assert_eq!(observed, 5);
}

#[test]
fn repeated_rays_saturate_at_clamps() {
    let mut map = default_map();
    let rays = [DVec3::ZERO, DVec3::new(3.2, 0.0, 0.0)];
    for _ in 0..1000 {
        map.integrate_rays(&rays, RayFlags::NONE);
    }

    let sample = map.voxel_key(DVec3::new(3.2, 0.0, 0.0));
    assert_eq!(map.value(sample), Some(3.511));
    assert_eq!(map.occupancy_type(sample), OccupancyType::Occupied);

    for x in 0..32 {
        let key = Key::new(glam::I16Vec3::ZERO, U8Vec3::new(x, 0, 0));
        assert_eq!(map.value(key), Some(-2.0), "voxel {x}");
    }
}

#[test]
fn ray_filter_limits_update_extent() {
    let mut map = default_map();
    map.set_ray_filter(clip_range_filter(1.0));
    map.integrate_rays(&[DVec3::ZERO, DVec3::new(10.0, 0.0, 0.0)], RayFlags::NONE);

    for voxel in map.voxels() {
        if akasha_map::core::is_unobserved(voxel.value()) {
            continue;
        }
        let centre = voxel.centre();
        assert!(
            centre.x < 1.1,
            "voxel at {centre:?} beyond the clip range was modified"
        );
        // The clipped end is treated as free space, never as a surface.
        assert_eq!(voxel.occupancy_type(), OccupancyType::Free);
    }
    let original_sample = map.voxel_key(DVec3::new(10.0, 0.0, 0.0));
    assert_eq!(map.occupancy_type(original_sample), OccupancyType::Null);
}

#[test]
fn culling_and_repopulation() {
    let mut map = default_map();
    // Populate regions along x in [-10, 10] m.
    for x in -10..=10 {
        let p = DVec3::new(x as f64 + 0.5, 0.5, 0.5);
        map.integrate_rays(&[p, p], RayFlags::NONE);
    }
    let before = map.region_count();
    assert!(before >= 6);

    map.cull_outside(&Aabb::new(DVec3::splat(-2.0), DVec3::splat(2.0)));
    for chunk in map.chunks() {
        assert!(map
            .region_aabb(chunk.region())
            .overlaps(&Aabb::new(DVec3::splat(-2.0), DVec3::splat(2.0))));
    }
    assert!(map.region_count() < before);

    // Re-entering a culled area creates fresh, default chunks.
    let p = DVec3::new(9.55, 0.55, 0.55);
    let key = map.voxel_key(p);
    assert_eq!(map.occupancy_type(key), OccupancyType::Null);
    map.integrate_rays(&[p, p], RayFlags::NONE);
    assert_eq!(map.occupancy_type(key), OccupancyType::Occupied);
    let neighbour = map.voxel_key(p + DVec3::new(0.1, 0.0, 0.0));
    assert_eq!(map.occupancy_type(neighbour), OccupancyType::Uncertain);
}

#[test]
fn modified_voxels_match_ray_walks() {
    let mut map = default_map();
    let rays = common::sphere_scan(101, 64, DVec3::new(0.5, 0.5, 0.5), 1.0, 3.0);
    map.integrate_rays(&rays, RayFlags::NONE);

    // The set of observed voxels equals the union of per-ray walks.
    let mut expected: std::collections::HashSet<Key> = std::collections::HashSet::new();
    for pair in rays.chunks_exact(2) {
        for key in segment_keys(&map, pair[0], pair[1], true) {
            expected.insert(key);
        }
    }

    let mut observed = std::collections::HashSet::new();
    for voxel in map.voxels() {
        if !akasha_map::core::is_unobserved(voxel.value()) {
            observed.insert(voxel.key());
        }
    }
    assert_eq!(observed, expected);
}

#[test]
fn stored_values_stay_in_range() {
    let mut map = default_map();
    let rays = common::sphere_scan(7, 512, DVec3::new(0.5, 0.5, 0.5), 0.5, 4.0);
    map.integrate_rays(&rays, RayFlags::NONE);

    let params = *map.occupancy_params();
    for voxel in map.voxels() {
        let value = voxel.value();
        assert!(
            value == UNOBSERVED_VALUE
                || (params.min_value..=params.max_value).contains(&value),
            "voxel {:?} holds out-of-range value {value}",
            voxel.key()
        );
    }
}

#[test]
fn first_valid_hints_point_at_observed_voxels() {
    let mut map = default_map();
    let rays = common::sphere_scan(13, 128, DVec3::new(0.5, 0.5, 0.5), 1.0, 3.0);
    map.integrate_rays(&rays, RayFlags::NONE);

    let dims = map.region_voxel_dims();
    for chunk in map.chunks() {
        let first = chunk.first_valid();
        assert_ne!(first, dims, "populated chunk reports no valid voxel");
        let key = Key::new(chunk.region(), first);
        let value = map.value(key).expect("hinted voxel exists");
        assert!(!akasha_map::core::is_unobserved(value));
    }
}

#[test]
fn serialisation_round_trips_after_integration() {
    let mut map = OccupancyMap::new(0.1, U8Vec3::splat(32), MapFlags::SUB_VOXEL_POSITION);
    let rays = common::sphere_scan(29, 256, DVec3::new(0.5, 0.5, 0.5), 1.0, 3.0);
    map.integrate_rays(&rays, RayFlags::NONE);

    let file = tempfile::NamedTempFile::new().expect("temp file");
    io::save(&map, file.path()).expect("save");
    let loaded = io::load(file.path()).expect("load");

    assert_eq!(loaded.region_count(), map.region_count());
    for chunk in map.chunks() {
        let other = loaded.region_chunk(chunk.region()).expect("chunk loaded");
        for layer in 0..map.layout().layer_count() {
            assert_eq!(other.layer_words(layer), chunk.layer_words(layer));
        }
    }

    // A loaded map keeps integrating consistently.
    let mut loaded = loaded;
    let more = [DVec3::ZERO, DVec3::new(0.45, 0.0, 0.0)];
    assert_eq!(loaded.integrate_rays(&more, RayFlags::NONE), 1);
}
