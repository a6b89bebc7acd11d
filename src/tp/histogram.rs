//! Weight histogram for hypothesis-count pruning.

use crate::constants::tp::{HISTOGRAM_BINS, HISTOGRAM_STEP};

/// Counts hypotheses of a frame in fixed-width weight bins above a base
/// weight. The threshold derived from it keeps roughly a target number of
/// hypotheses for the next frame.
#[derive(Debug, Clone)]
pub struct Histogram {
    bins: [u32; HISTOGRAM_BINS],
    base: f64,
    enabled: bool,
}

impl Default for Histogram {
    fn default() -> Self {
        Self {
            bins: [0; HISTOGRAM_BINS],
            base: 0.0,
            enabled: false,
        }
    }
}

impl Histogram {
    /// Empty the bins and start counting above `base`.
    pub fn reset(&mut self, base: f64, enabled: bool) {
        self.bins = [0; HISTOGRAM_BINS];
        self.base = if base.is_finite() { base } else { 0.0 };
        self.enabled = enabled;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Count `weight` in its nearest bin. Weights below the base land in
    /// bin 0; weights past the last bin are not counted.
    pub fn add(&mut self, weight: f64) {
        if !self.enabled {
            return;
        }
        let bin = ((weight - self.base) / HISTOGRAM_STEP + 0.5) as i64;
        let bin = bin.max(0) as usize;
        if bin < HISTOGRAM_BINS {
            self.bins[bin] += 1;
        }
    }

    pub fn count(&self) -> u64 {
        self.bins.iter().map(|&c| c as u64).sum()
    }

    /// Weight threshold keeping about `target` hypotheses: the upper edge of
    /// the bin in which the running count reaches `target`. Infinite when
    /// the bins run out first.
    pub fn threshold(&self, target: u32) -> f64 {
        if !self.enabled || target == 0 {
            return f64::INFINITY;
        }
        let mut remaining = target as i64;
        let mut bin = 0;
        while bin < HISTOGRAM_BINS && remaining > 0 {
            remaining -= self.bins[bin] as i64;
            bin += 1;
        }
        if bin == HISTOGRAM_BINS {
            return f64::INFINITY;
        }
        self.base + bin as f64 * HISTOGRAM_STEP
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_never_prunes() {
        let mut h = Histogram::default();
        h.add(1.0);
        assert_eq!(h.count(), 0);
        assert_eq!(h.threshold(1), f64::INFINITY);
    }

    #[test]
    fn test_threshold_after_crossing_bin() {
        let mut h = Histogram::default();
        h.reset(10.0, true);
        // bin 0: 10.0, 11.0; bin 1: 13.5, 14.0; bin 2: 16.0
        for w in [10.0, 11.0, 13.5, 14.0, 16.0] {
            h.add(w);
        }
        assert_eq!(h.count(), 5);
        assert_eq!(h.threshold(1), 10.0 + HISTOGRAM_STEP);
        assert_eq!(h.threshold(2), 10.0 + HISTOGRAM_STEP);
        assert_eq!(h.threshold(3), 16.0);
        assert_eq!(h.threshold(4), 16.0);
        assert_eq!(h.threshold(5), 10.0 + 3.0 * HISTOGRAM_STEP);
        // walks off the end
        assert_eq!(h.threshold(6), f64::INFINITY);
    }

    #[test]
    fn test_nearest_bin_rounding() {
        let mut h = Histogram::default();
        h.reset(0.0, true);
        // 1.4 rounds down into bin 0, 1.6 up into bin 1
        h.add(1.4);
        h.add(1.6);
        assert_eq!(h.threshold(1), HISTOGRAM_STEP);
        assert_eq!(h.threshold(2), 2.0 * HISTOGRAM_STEP);
    }

    #[test]
    fn test_out_of_range_weights() {
        let mut h = Histogram::default();
        h.reset(0.0, true);
        h.add(-4.0);
        h.add(1e9);
        assert_eq!(h.count(), 1);
        assert_eq!(h.threshold(0), f64::INFINITY);
        assert_eq!(h.threshold(1), HISTOGRAM_STEP);
        assert_eq!(h.threshold(2), f64::INFINITY);
    }
}
