//! Packed incident-normal representation.
//!
//! Stores the progressive mean of the directions rays have arrived at a
//! voxel from, packed into 32 bits: 15 signed bits for X, 15 signed bits
//! for Y, and the sign of Z in bit 31 (bit 30 is unused). Z's magnitude is
//! reconstructed from the unit-length constraint on decode.

use glam::Vec3;

const QUANT: f32 = 16383.0;
const AXIS_MASK: u32 = 0x7FFF;
const SHIFT_X: u32 = 0;
const SHIFT_Y: u32 = 15;
const SIGN_BIT_Z: u32 = 1 << 31;

#[inline]
fn sign_extend_15(bits: u32) -> i32 {
    ((bits << 17) as i32) >> 17
}

/// Pack a unit-length normal into 32 bits.
pub fn encode_normal(normal: Vec3) -> u32 {
    let x = (normal.x.clamp(-1.0, 1.0) * QUANT) as i32;
    let y = (normal.y.clamp(-1.0, 1.0) * QUANT) as i32;

    let mut packed = (x as u32 & AXIS_MASK) << SHIFT_X;
    packed |= (y as u32 & AXIS_MASK) << SHIFT_Y;
    if normal.z < 0.0 {
        packed |= SIGN_BIT_Z;
    }
    packed
}

/// Unpack a normal encoded with [`encode_normal`].
pub fn decode_normal(packed: u32) -> Vec3 {
    let x = sign_extend_15((packed >> SHIFT_X) & AXIS_MASK) as f32 / QUANT;
    let y = sign_extend_15((packed >> SHIFT_Y) & AXIS_MASK) as f32 / QUANT;
    let z_sq = (1.0 - (x * x + y * y)).max(0.0);
    let z = if packed & SIGN_BIT_Z != 0 {
        -z_sq.sqrt()
    } else {
        z_sq.sqrt()
    };
    Vec3::new(x, y, z).normalize_or_zero()
}

/// Fold one more incident ray direction into a packed normal.
///
/// `count` is the number of rays already folded in; the new direction is
/// weighted `1 / (count + 1)` so the result tracks the running mean.
/// `incident` points from the sample back toward the sensor and need not be
/// normalised.
pub fn update_incident_normal(packed: u32, count: u32, incident: Vec3) -> u32 {
    let weight = 1.0 / (count as f32 + 1.0);
    let incident = incident.normalize_or_zero();
    let mean = decode_normal(packed);
    let updated = (mean + (incident - mean) * weight).normalize_or_zero();
    encode_normal(updated)
}
