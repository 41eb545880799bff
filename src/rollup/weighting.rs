//! Recency and frequency weighting for rollups.

/// Recency half-life: an item last seen 30 days before the reference point
/// weighs half as much as one seen at the reference point.
pub const HALF_LIFE_SECS: f64 = 30.0 * 24.0 * 60.0 * 60.0;

/// `ln(1 + plays) * 0.5^(age / half_life)`, with age measured back from
/// `reference`. Items seen after the reference are not boosted.
pub fn recency_weight(play_count: u64, last_seen: i64, reference: i64) -> f64 {
    let frequency = (1.0 + play_count as f64).ln();
    let age = (reference - last_seen).max(0) as f64;
    frequency * 0.5f64.powf(age / HALF_LIFE_SECS)
}

/// Running weighted mean that degrades to a plain mean when every weight is 0.
#[derive(Debug, Default, Clone)]
pub struct WeightedMean {
    weighted_sum: f64,
    total_weight: f64,
    plain_sum: f64,
    samples: usize,
}

impl WeightedMean {
    pub fn add(&mut self, value: f64, weight: f64) {
        self.weighted_sum += value * weight;
        self.total_weight += weight;
        self.plain_sum += value;
        self.samples += 1;
    }

    pub fn is_weighted(&self) -> bool {
        self.total_weight > 0.0
    }

    pub fn value(&self) -> Option<f64> {
        if self.samples == 0 {
            None
        } else if self.is_weighted() {
            Some(self.weighted_sum / self.total_weight)
        } else {
            Some(self.plain_sum / self.samples as f64)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weight_grows_with_plays() {
        assert!(recency_weight(10, 0, 0) > recency_weight(1, 0, 0));
        assert_eq!(recency_weight(0, 0, 0), 0.0);
    }

    #[test]
    fn weight_halves_after_half_life() {
        let now = 10_000_000;
        let fresh = recency_weight(5, now, now);
        let old = recency_weight(5, now - HALF_LIFE_SECS as i64, now);
        assert!((old - fresh / 2.0).abs() < 1e-12);
    }

    #[test]
    fn future_items_are_not_boosted() {
        assert_eq!(recency_weight(3, 200, 100), recency_weight(3, 100, 100));
    }

    #[test]
    fn mean_falls_back_to_plain_average() {
        let mut mean = WeightedMean::default();
        assert_eq!(mean.value(), None);
        mean.add(10.0, 0.0);
        mean.add(20.0, 0.0);
        assert!(!mean.is_weighted());
        assert_eq!(mean.value(), Some(15.0));
    }

    #[test]
    fn mean_is_weighted() {
        let mut mean = WeightedMean::default();
        mean.add(10.0, 1.0);
        mean.add(40.0, 2.0);
        assert_eq!(mean.value(), Some(30.0));
    }
}
