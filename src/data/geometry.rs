//! Per-pixel angular geometry.

use super::config::Precision;
use crate::error::{IntegratorError, IntegratorResult};

/// Angular position and span of every pixel, with the integration range.
#[derive(Clone, Debug)]
pub struct AngularGeometry {
    /// Pixel center angles (2θ).
    pub tth: Vec<f64>,
    /// Pixel half-widths in 2θ.
    pub half_width: Vec<f64>,
    /// Extent derived from the data: (min, max).
    data_extent: (f64, f64),
    /// Bounds used for binning.
    active_range: (f64, f64),
    /// Whether `active_range` was set explicitly.
    overridden: bool,
}

impl AngularGeometry {
    /// Build geometry from per-pixel arrays.
    ///
    /// The upper bound is widened by one epsilon of `precision` so that a
    /// pixel edge sitting exactly on the maximum still lands in the last bin.
    pub fn new(tth: Vec<f64>, half_width: Vec<f64>, precision: Precision) -> IntegratorResult<Self> {
        IntegratorError::check_len("half_width", tth.len(), half_width.len())?;
        if tth.is_empty() {
            return Err(IntegratorError::invalid_argument("geometry has no pixels"));
        }
        if let Some(i) = tth.iter().position(|v| !v.is_finite()) {
            return Err(IntegratorError::invalid_argument(format!(
                "tth[{i}] is not finite"
            )));
        }
        if let Some(i) = half_width.iter().position(|v| !v.is_finite() || *v < 0.0) {
            return Err(IntegratorError::invalid_argument(format!(
                "half_width[{i}] must be finite and non-negative"
            )));
        }

        let (lower, upper) = tth.iter().zip(&half_width).fold(
            (f64::INFINITY, f64::NEG_INFINITY),
            |(lo, hi), (&t, &d)| (lo.min(t - d), hi.max(t + d)),
        );
        let data_max = upper * (1.0 + precision.epsilon());
        let data_min = lower.max(0.0);
        if data_max <= data_min {
            return Err(IntegratorError::invalid_argument(format!(
                "degenerate angular extent [{data_min}, {data_max}]"
            )));
        }

        Ok(Self {
            tth,
            half_width,
            data_extent: (data_min, data_max),
            active_range: (data_min, data_max),
            overridden: false,
        })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.tth.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.tth.is_empty()
    }

    #[inline]
    pub fn data_extent(&self) -> (f64, f64) {
        self.data_extent
    }

    #[inline]
    pub fn active_range(&self) -> (f64, f64) {
        self.active_range
    }

    #[inline]
    pub fn is_overridden(&self) -> bool {
        self.overridden
    }

    /// Override the integration bounds.
    pub fn set_range(&mut self, lower: f64, upper: f64) -> IntegratorResult<()> {
        if !lower.is_finite() || !upper.is_finite() || lower >= upper {
            return Err(IntegratorError::invalid_argument(format!(
                "range must satisfy lower < upper, got [{lower}, {upper}]"
            )));
        }
        self.active_range = (lower, upper);
        self.overridden = true;
        Ok(())
    }

    /// Restore the data-derived bounds.
    pub fn unset_range(&mut self) {
        self.active_range = self.data_extent;
        self.overridden = false;
    }

    /// Bin width for `n_bins` bins over the active range.
    #[inline]
    pub fn delta(&self, n_bins: usize) -> f64 {
        (self.active_range.1 - self.active_range.0) / n_bins as f64
    }

    /// Lower edge of every bin: `lower + k * delta`.
    pub fn bin_centers(&self, n_bins: usize) -> Vec<f64> {
        let lower = self.active_range.0;
        let delta = self.delta(n_bins);
        (0..n_bins).map(|k| lower + k as f64 * delta).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_geometry() -> AngularGeometry {
        AngularGeometry::new(
            vec![0.1, 0.1, 0.3, 0.3],
            vec![0.05; 4],
            Precision::Single,
        )
        .unwrap()
    }

    #[test]
    fn test_data_extent() {
        let geometry = sample_geometry();
        let (lo, hi) = geometry.data_extent();
        assert!((lo - 0.05).abs() < 1e-12);
        assert!(hi > 0.35);
        assert!((hi - 0.35 * (1.0 + f32::EPSILON as f64)).abs() < 1e-15);
    }

    #[test]
    fn test_extent_clamped_at_zero() {
        let geometry =
            AngularGeometry::new(vec![0.01, 0.2], vec![0.05, 0.05], Precision::Double).unwrap();
        assert_eq!(geometry.data_extent().0, 0.0);
    }

    #[test]
    fn test_set_and_unset_range() {
        let mut geometry = sample_geometry();
        let original = geometry.bin_centers(2);

        geometry.set_range(0.1, 0.2).unwrap();
        assert!(geometry.is_overridden());
        let centers = geometry.bin_centers(2);
        assert_eq!(centers[0], 0.1);
        assert!((centers[1] - 0.15).abs() < 1e-12);

        geometry.unset_range();
        assert!(!geometry.is_overridden());
        assert_eq!(geometry.bin_centers(2), original);
    }

    #[test]
    fn test_invalid_inputs() {
        assert!(matches!(
            AngularGeometry::new(vec![0.1, 0.2], vec![0.1], Precision::Single),
            Err(IntegratorError::SizeMismatch { .. })
        ));
        assert!(AngularGeometry::new(vec![0.1], vec![-0.1], Precision::Single).is_err());
        assert!(AngularGeometry::new(vec![f64::NAN], vec![0.1], Precision::Single).is_err());
        assert!(AngularGeometry::new(vec![0.0], vec![0.0], Precision::Single).is_err());

        let mut geometry = sample_geometry();
        assert!(geometry.set_range(0.3, 0.1).is_err());
        assert!(!geometry.is_overridden());
    }
}
