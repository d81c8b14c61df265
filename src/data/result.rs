//! Output of one integration.

use ndarray::{Array1, Zip};
use std::time::Duration;

/// Time spent in one `execute` call.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ExecutionTiming {
    /// Kernel run time.
    pub kernel: Duration,
    /// Host/device transfer time.
    pub memcpy: Duration,
}

/// Histogram produced by one `execute` call.
#[derive(Clone, Debug)]
pub struct ExecutionResult {
    /// Bin positions, `lower + k * delta`.
    pub bin_centers: Array1<f64>,
    /// Accumulated corrected intensity per bin.
    pub weighted_sum: Array1<f64>,
    /// Accumulated pixel weight per bin.
    pub weight_sum: Array1<f64>,
    pub timing: ExecutionTiming,
}

impl ExecutionResult {
    /// Number of bins.
    #[inline]
    pub fn len(&self) -> usize {
        self.bin_centers.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bin_centers.is_empty()
    }

    /// Normalized intensity `weighted_sum / weight_sum`.
    ///
    /// Bins without weight are NaN.
    pub fn normalized(&self) -> Array1<f64> {
        Zip::from(&self.weighted_sum)
            .and(&self.weight_sum)
            .map_collect(|&sum, &weight| if weight == 0.0 { f64::NAN } else { sum / weight })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_normalized_with_empty_bin() {
        let result = ExecutionResult {
            bin_centers: array![0.0, 1.0, 2.0],
            weighted_sum: array![20.0, 0.0, 9.0],
            weight_sum: array![2.0, 0.0, 3.0],
            timing: ExecutionTiming::default(),
        };

        let normalized = result.normalized();
        assert_eq!(normalized[0], 10.0);
        assert!(normalized[1].is_nan());
        assert_eq!(normalized[2], 3.0);
        assert_eq!(result.len(), 3);
    }
}
