//! Packed sub-voxel sample position.
//!
//! Each occupancy voxel may carry a 32-bit pattern refining where inside
//! the voxel its samples have landed. The offset from the voxel centre is
//! expressed in voxel units (each component in `[-0.5, 0.5]`), quantised to
//! 10 bits per axis. Bit 31 marks that a position has been recorded; the
//! all-zero pattern therefore decodes to the voxel centre rather than the
//! minimum corner.
//!
//! Updates blend an exponential moving average with a configured weight.

use glam::Vec3;

const AXIS_MAX: f32 = 1023.0;
const AXIS_MASK: u32 = 0x3FF;
const OCCUPIED_BIT: u32 = 1 << 31;

#[inline]
fn encode_axis(offset: f32) -> u32 {
    ((offset.clamp(-0.5, 0.5) + 0.5) * AXIS_MAX).round() as u32 & AXIS_MASK
}

#[inline]
fn decode_axis(bits: u32) -> f32 {
    (bits & AXIS_MASK) as f32 / AXIS_MAX - 0.5
}

/// Pack an offset from the voxel centre (voxel units, each component in
/// `[-0.5, 0.5]`).
pub fn encode_offset(offset: Vec3) -> u32 {
    encode_axis(offset.x) | encode_axis(offset.y) << 10 | encode_axis(offset.z) << 20
        | OCCUPIED_BIT
}

/// Unpack a sub-voxel offset. The empty pattern decodes to the voxel
/// centre.
pub fn decode_offset(packed: u32) -> Vec3 {
    if packed & OCCUPIED_BIT == 0 {
        return Vec3::ZERO;
    }
    Vec3::new(
        decode_axis(packed),
        decode_axis(packed >> 10),
        decode_axis(packed >> 20),
    )
}

/// True when `packed` carries a recorded position.
#[inline]
pub fn has_position(packed: u32) -> bool {
    packed & OCCUPIED_BIT != 0
}

/// Blend a new sample offset into a packed pattern.
///
/// The first sample is stored directly; later samples blend by
/// `new = old * (1 - weight) + sample * weight`.
pub fn update_offset(packed: u32, sample_offset: Vec3, weight: f32) -> u32 {
    if !has_position(packed) {
        return encode_offset(sample_offset);
    }
    let old = decode_offset(packed);
    let blended = old * (1.0 - weight) + sample_offset * weight;
    encode_offset(blended)
}

#[cfg(test)]
mod tests {
    use super::*;

    // Half a quantisation step plus float slack.
    const GRID_TOLERANCE: f32 = 0.5 / AXIS_MAX + 1e-6;

    #[test]
    fn test_encode_decode_round_trip() {
        for &offset in &[
            Vec3::ZERO,
            Vec3::new(0.5, -0.5, 0.25),
            Vec3::new(-0.013, 0.49, -0.27),
            Vec3::splat(-0.5),
        ] {
            let decoded = decode_offset(encode_offset(offset));
            for axis in 0..3 {
                assert!(
                    (decoded[axis] - offset[axis]).abs() <= GRID_TOLERANCE,
                    "{offset:?} -> {decoded:?}"
                );
            }
        }
    }

    #[test]
    fn test_empty_pattern_is_centre() {
        assert_eq!(decode_offset(0), Vec3::ZERO);
        assert!(!has_position(0));
        assert!(has_position(encode_offset(Vec3::ZERO)));
    }

    #[test]
    fn test_out_of_range_offsets_clamp() {
        let decoded = decode_offset(encode_offset(Vec3::new(2.0, -2.0, 0.0)));
        assert!((decoded.x - 0.5).abs() <= GRID_TOLERANCE);
        assert!((decoded.y + 0.5).abs() <= GRID_TOLERANCE);
    }

    #[test]
    fn test_first_sample_stored_directly() {
        let sample = Vec3::new(0.25, -0.125, 0.0);
        let packed = update_offset(0, sample, 0.3);
        let decoded = decode_offset(packed);
        for axis in 0..3 {
            assert!((decoded[axis] - sample[axis]).abs() <= GRID_TOLERANCE);
        }
    }

    #[test]
    fn test_moving_average_converges() {
        let target = Vec3::new(0.3, -0.2, 0.1);
        let mut packed = update_offset(0, Vec3::ZERO, 0.3);
        for _ in 0..64 {
            packed = update_offset(packed, target, 0.3);
        }
        let decoded = decode_offset(packed);
        for axis in 0..3 {
            assert!(
                (decoded[axis] - target[axis]).abs() <= 4.0 * GRID_TOLERANCE,
                "{decoded:?}"
            );
        }
    }
}
