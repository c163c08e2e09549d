//! Log-odds occupancy model.
//!
//! Occupancy is stored per voxel as a log-odds value
//! `v = ln(p / (1 - p))`, clamped to a configured `[min_value, max_value]`
//! range. A reserved magnitude ([`UNOBSERVED_VALUE`]) marks voxels that have
//! never been observed; the first observation treats such a voxel as
//! log-odds zero (probability 0.5) and applies the adjustment from there.
//!
//! Updates never fail on out-of-range values; they clamp. Once a voxel has
//! been driven onto a clamp boundary it is saturated: unless the matching
//! `saturate_at_*` option is set it can no longer move, in either
//! direction. This makes heavily observed surfaces sticky against isolated
//! contradicting rays.

use serde::{Deserialize, Serialize};

/// Reserved occupancy magnitude marking a voxel that has never been
/// observed.
pub const UNOBSERVED_VALUE: f32 = f32::INFINITY;

/// True when `value` is the never-observed sentinel.
#[inline]
pub fn is_unobserved(value: f32) -> bool {
    value == UNOBSERVED_VALUE
}

/// Convert a probability in `(0, 1)` to a log-odds value.
#[inline]
pub fn probability_to_value(probability: f32) -> f32 {
    (probability / (1.0 - probability)).ln()
}

/// Convert a log-odds value to a probability.
#[inline]
pub fn value_to_probability(value: f32) -> f32 {
    1.0 / (1.0 + (-value).exp())
}

/// Classification of a voxel's occupancy state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OccupancyType {
    /// The voxel's region has never been allocated.
    Null,
    /// The voxel exists but has never been observed.
    Uncertain,
    /// Observed and below the occupancy threshold.
    Free,
    /// Observed and at or above the occupancy threshold.
    Occupied,
}

/// Probability parameters of an occupancy map.
///
/// Probabilities and their log-odds forms are kept in sync: setting one
/// recomputes the other, mirroring how callers sometimes reason in
/// probability space (configuration) and sometimes in value space
/// (thresholding stored voxels).
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct OccupancyParams {
    /// Log-odds increment applied by a hit.
    pub hit_value: f32,
    /// Probability form of `hit_value`.
    pub hit_probability: f32,
    /// Log-odds increment applied by a miss (negative).
    pub miss_value: f32,
    /// Probability form of `miss_value`.
    pub miss_probability: f32,
    /// Occupied classification cutoff, stored as a value.
    pub threshold_value: f32,
    /// Probability form of `threshold_value`.
    pub threshold_probability: f32,
    /// Lower clamp for stored values.
    pub min_value: f32,
    /// Upper clamp for stored values.
    pub max_value: f32,
    /// When false, a voxel clamped at `min_value` can no longer change.
    pub saturate_at_min: bool,
    /// When false, a voxel clamped at `max_value` can no longer change.
    pub saturate_at_max: bool,
}

impl Default for OccupancyParams {
    fn default() -> Self {
        let mut params = Self {
            hit_value: 0.0,
            hit_probability: 0.0,
            miss_value: 0.0,
            miss_probability: 0.0,
            threshold_value: 0.0,
            threshold_probability: 0.0,
            // Default clamps follow octomap.
            min_value: -2.0,
            max_value: 3.511,
            saturate_at_min: false,
            saturate_at_max: false,
        };
        params.set_hit_probability(0.7);
        params.set_miss_probability(0.4);
        params.set_threshold_probability(0.5);
        params
    }
}

impl OccupancyParams {
    /// Set the hit adjustment from a probability (must be > 0.5 to add
    /// occupancy evidence).
    pub fn set_hit_probability(&mut self, probability: f32) {
        self.hit_probability = probability;
        self.hit_value = probability_to_value(probability);
    }

    /// Set the hit adjustment directly as a log-odds value.
    pub fn set_hit_value(&mut self, value: f32) {
        self.hit_value = value;
        self.hit_probability = value_to_probability(value);
    }

    /// Set the miss adjustment from a probability (must be < 0.5 to remove
    /// occupancy evidence).
    pub fn set_miss_probability(&mut self, probability: f32) {
        self.miss_probability = probability;
        self.miss_value = probability_to_value(probability);
    }

    /// Set the miss adjustment directly as a log-odds value.
    pub fn set_miss_value(&mut self, value: f32) {
        self.miss_value = value;
        self.miss_probability = value_to_probability(value);
    }

    /// Set the occupied classification cutoff from a probability.
    pub fn set_threshold_probability(&mut self, probability: f32) {
        self.threshold_probability = probability;
        self.threshold_value = probability_to_value(probability);
    }

    /// Apply a signed log-odds adjustment to a stored value.
    ///
    /// An unobserved voxel starts from log-odds zero. A voxel sitting on a
    /// clamp boundary only moves when the matching saturation option
    /// permits it.
    #[inline]
    pub fn adjust(&self, value: f32, adjustment: f32) -> f32 {
        if is_unobserved(value) {
            return adjustment.clamp(self.min_value, self.max_value);
        }
        let locked_low = !self.saturate_at_min && value <= self.min_value;
        let locked_high = !self.saturate_at_max && value >= self.max_value;
        if locked_low || locked_high {
            return value;
        }
        (value + adjustment).clamp(self.min_value, self.max_value)
    }

    /// Apply a hit observation to a stored value.
    #[inline]
    pub fn hit(&self, value: f32) -> f32 {
        self.adjust(value, self.hit_value)
    }

    /// Apply a miss observation to a stored value.
    #[inline]
    pub fn miss(&self, value: f32) -> f32 {
        self.adjust(value, self.miss_value)
    }

    /// True when a stored value classifies as occupied.
    #[inline]
    pub fn is_occupied(&self, value: f32) -> bool {
        !is_unobserved(value) && value >= self.threshold_value
    }

    /// Classify a stored value; `None` means the voxel's region does not
    /// exist.
    pub fn occupancy_type(&self, value: Option<f32>) -> OccupancyType {
        match value {
            None => OccupancyType::Null,
            Some(v) if is_unobserved(v) => OccupancyType::Uncertain,
            Some(v) if v < self.threshold_value => OccupancyType::Free,
            Some(_) => OccupancyType::Occupied,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probability_value_round_trip() {
        for &v in &[-2.0f32, -0.405, 0.0, 0.847, 3.511] {
            let p = value_to_probability(v);
            let back = probability_to_value(p);
            assert!((back - v).abs() <= 1e-6, "{v} -> {p} -> {back}");
        }
    }

    #[test]
    fn test_default_values_match_probabilities() {
        let params = OccupancyParams::default();
        assert!((params.hit_value - 0.8473).abs() < 1e-3);
        assert!((params.miss_value + 0.4055).abs() < 1e-3);
        assert!(params.threshold_value.abs() < 1e-6);
    }

    #[test]
    fn test_first_observation_starts_from_zero() {
        let params = OccupancyParams::default();
        let v = params.hit(UNOBSERVED_VALUE);
        assert!((v - params.hit_value).abs() < 1e-6);
        let v = params.miss(UNOBSERVED_VALUE);
        assert!((v - params.miss_value).abs() < 1e-6);
    }

    #[test]
    fn test_clamping_and_saturation_lock() {
        let params = OccupancyParams::default();
        // Drive to the upper clamp.
        let mut v = params.hit(UNOBSERVED_VALUE);
        for _ in 0..10 {
            v = params.hit(v);
        }
        assert_eq!(v, params.max_value);
        // Saturated: a miss can no longer move it.
        assert_eq!(params.miss(v), params.max_value);

        // With saturate_at_max the voxel stays mobile.
        let mut mobile = params;
        mobile.saturate_at_max = true;
        let down = mobile.miss(v);
        assert!(down < mobile.max_value);
    }

    #[test]
    fn test_occupancy_classification() {
        let params = OccupancyParams::default();
        assert_eq!(params.occupancy_type(None), OccupancyType::Null);
        assert_eq!(
            params.occupancy_type(Some(UNOBSERVED_VALUE)),
            OccupancyType::Uncertain
        );
        assert_eq!(params.occupancy_type(Some(-0.4)), OccupancyType::Free);
        assert_eq!(params.occupancy_type(Some(0.85)), OccupancyType::Occupied);
        assert!(params.is_occupied(0.85));
        assert!(!params.is_occupied(UNOBSERVED_VALUE));
    }
}
