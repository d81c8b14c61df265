//! Kernel bodies executed by the host device.
//!
//! Each function is the host equivalent of one entry point in the bundled
//! kernel source and runs on the calling rayon pool.

use num_traits::Float;
use rayon::prelude::*;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Real element type a kernel can run at.
pub trait DeviceReal: Float + bytemuck::Pod + Send + Sync + 'static {
    /// Atomic cell holding the bits of `Self`.
    type Atomic: Send + Sync;

    fn from_f64(value: f64) -> Self;
    fn to_f64(self) -> f64;

    fn atomic_zero() -> Self::Atomic;
    fn atomic_add(cell: &Self::Atomic, value: Self);
    fn atomic_load(cell: &Self::Atomic) -> Self;
}

impl DeviceReal for f32 {
    type Atomic = AtomicU32;

    #[inline]
    fn from_f64(value: f64) -> Self {
        value as f32
    }

    #[inline]
    fn to_f64(self) -> f64 {
        self as f64
    }

    fn atomic_zero() -> AtomicU32 {
        AtomicU32::new(0f32.to_bits())
    }

    #[inline]
    fn atomic_add(cell: &AtomicU32, value: f32) {
        // The closure always returns Some, so the update cannot fail.
        let _ = cell.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |bits| {
            Some((f32::from_bits(bits) + value).to_bits())
        });
    }

    fn atomic_load(cell: &AtomicU32) -> f32 {
        f32::from_bits(cell.load(Ordering::Acquire))
    }
}

impl DeviceReal for f64 {
    type Atomic = AtomicU64;

    #[inline]
    fn from_f64(value: f64) -> Self {
        value
    }

    #[inline]
    fn to_f64(self) -> f64 {
        self
    }

    fn atomic_zero() -> AtomicU64 {
        AtomicU64::new(0f64.to_bits())
    }

    #[inline]
    fn atomic_add(cell: &AtomicU64, value: f64) {
        let _ = cell.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |bits| {
            Some((f64::from_bits(bits) + value).to_bits())
        });
    }

    fn atomic_load(cell: &AtomicU64) -> f64 {
        f64::from_bits(cell.load(Ordering::Acquire))
    }
}

/// Per-pixel correction inputs, each `None` when disabled.
pub struct CorrectionInputs<'a, T> {
    pub dark: Option<&'a [T]>,
    pub flat: Option<&'a [T]>,
    pub solid_angle: Option<&'a [T]>,
    pub polarization: Option<&'a [T]>,
    /// 0/1 exclusion mask.
    pub mask: Option<&'a [T]>,
    /// `(value, tolerance)`
    pub dummy: Option<(T, T)>,
}

/// Compensated running sum.
#[derive(Clone, Copy)]
struct Kahan<T> {
    sum: T,
    carry: T,
}

impl<T: Float> Kahan<T> {
    fn new() -> Self {
        Self {
            sum: T::zero(),
            carry: T::zero(),
        }
    }

    #[inline]
    fn add(&mut self, value: T) {
        let y = value - self.carry;
        let t = self.sum + y;
        self.carry = (t - self.sum) - y;
        self.sum = t;
    }
}

pub fn memset<T: DeviceReal>(target: &mut [T]) {
    target.par_iter_mut().for_each(|v| *v = T::zero());
}

/// Correct `image` into `corrected` and write 1 (kept) or 0 (excluded)
/// into `pixel_weight`.
///
/// Order: dark, flat, solid angle, polarization, mask, dummy. The dummy
/// test runs on the raw reading. A pixel whose corrected value is not
/// finite is excluded as well.
pub fn corrections<T: DeviceReal>(
    image: &[T],
    inputs: &CorrectionInputs<'_, T>,
    corrected: &mut [T],
    pixel_weight: &mut [T],
) {
    corrected
        .par_iter_mut()
        .zip(pixel_weight.par_iter_mut())
        .enumerate()
        .for_each(|(i, (out, weight))| {
            let raw = image[i];
            let mut value = raw;
            if let Some(dark) = inputs.dark {
                value = value - dark[i];
            }
            if let Some(flat) = inputs.flat {
                value = value / flat[i];
            }
            if let Some(solid_angle) = inputs.solid_angle {
                value = value * solid_angle[i];
            }
            if let Some(polarization) = inputs.polarization {
                value = value / polarization[i];
            }

            let mut keep = value.is_finite();
            if let Some(mask) = inputs.mask {
                keep &= mask[i] == T::zero();
            }
            if let Some((dummy, tolerance)) = inputs.dummy {
                keep &= (raw - dummy).abs() > tolerance;
            }

            if keep {
                *out = value;
                *weight = T::one();
            } else {
                *out = T::zero();
                *weight = T::zero();
            }
        });
}

/// Bin-major table: row `b` lists `(pixel, weight)` pairs feeding bin `b`.
///
/// Bins are independent, so each lane owns one output element.
pub fn integrate_lut_bin<T: DeviceReal>(
    corrected: &[T],
    pixel_weight: &[T],
    offsets: &[u32],
    indices: &[u32],
    weights: &[T],
    weighted_sum: &mut [T],
    weight_sum: &mut [T],
) {
    weighted_sum
        .par_iter_mut()
        .zip(weight_sum.par_iter_mut())
        .enumerate()
        .for_each(|(bin, (sum_out, weight_out))| {
            let start = offsets[bin] as usize;
            let end = offsets[bin + 1] as usize;
            let mut sum = Kahan::new();
            let mut count = Kahan::new();
            for k in start..end {
                let pixel = indices[k] as usize;
                let w = weights[k] * pixel_weight[pixel];
                sum.add(w * corrected[pixel]);
                count.add(w);
            }
            *sum_out = sum.sum;
            *weight_out = count.sum;
        });
}

/// Pixel-major table: row `p` lists `(bin, weight)` pairs pixel `p` feeds.
///
/// Lanes accumulate private histograms that are merged at the end.
pub fn integrate_lut_pixel<T: DeviceReal>(
    corrected: &[T],
    pixel_weight: &[T],
    offsets: &[u32],
    indices: &[u32],
    weights: &[T],
    weighted_sum: &mut [T],
    weight_sum: &mut [T],
) {
    let n_bins = weighted_sum.len();
    let n_pixels = offsets.len().saturating_sub(1);
    let empty = || (vec![T::zero(); n_bins], vec![T::zero(); n_bins]);

    let (sums, counts) = (0..n_pixels)
        .into_par_iter()
        .fold(empty, |(mut sums, mut counts), pixel| {
            let valid = pixel_weight[pixel];
            if valid != T::zero() {
                let start = offsets[pixel] as usize;
                let end = offsets[pixel + 1] as usize;
                for k in start..end {
                    let bin = indices[k] as usize;
                    let w = weights[k] * valid;
                    sums[bin] = sums[bin] + w * corrected[pixel];
                    counts[bin] = counts[bin] + w;
                }
            }
            (sums, counts)
        })
        .reduce(empty, |(mut sa, mut ca), (sb, cb)| {
            for (a, b) in sa.iter_mut().zip(sb) {
                *a = *a + b;
            }
            for (a, b) in ca.iter_mut().zip(cb) {
                *a = *a + b;
            }
            (sa, ca)
        });

    weighted_sum.copy_from_slice(&sums);
    weight_sum.copy_from_slice(&counts);
}

/// Index of the bin whose interval `[lower + k*delta, lower + (k+1)*delta)`
/// holds `tth`.
#[inline]
pub fn bin_of(tth: f64, lower: f64, delta: f64, n_bins: usize) -> Option<usize> {
    let position = (tth - lower) / delta;
    if position >= 0.0 && position < n_bins as f64 {
        Some((position as usize).min(n_bins - 1))
    } else {
        None
    }
}

/// Index of the bin whose center `lower + k*delta` is nearest `tth`, for an
/// angle inside `[lower, lower + n_bins*delta]`.
#[inline]
pub fn nearest_bin(tth: f64, lower: f64, delta: f64, n_bins: usize) -> Option<usize> {
    let position = (tth - lower) / delta;
    if position >= 0.0 && position <= n_bins as f64 {
        Some((position.round() as usize).min(n_bins - 1))
    } else {
        None
    }
}

/// Add every valid pixel whole into its nearest bin with atomic adds.
pub fn integrate_atomic<T: DeviceReal>(
    corrected: &[T],
    pixel_weight: &[T],
    tth: &[T],
    lower: f64,
    delta: f64,
    weighted_sum: &mut [T],
    weight_sum: &mut [T],
) {
    let n_bins = weighted_sum.len();
    let sums: Vec<T::Atomic> = (0..n_bins).map(|_| T::atomic_zero()).collect();
    let counts: Vec<T::Atomic> = (0..n_bins).map(|_| T::atomic_zero()).collect();

    corrected
        .par_iter()
        .zip(pixel_weight.par_iter())
        .zip(tth.par_iter())
        .for_each(|((&value, &valid), &angle)| {
            if valid == T::zero() {
                return;
            }
            if let Some(bin) = nearest_bin(DeviceReal::to_f64(angle), lower, delta, n_bins) {
                T::atomic_add(&sums[bin], value * valid);
                T::atomic_add(&counts[bin], valid);
            }
        });

    for (out, cell) in weighted_sum.iter_mut().zip(&sums) {
        *out = T::atomic_load(cell);
    }
    for (out, cell) in weight_sum.iter_mut().zip(&counts) {
        *out = T::atomic_load(cell);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_corrections<'a>() -> CorrectionInputs<'a, f64> {
        CorrectionInputs {
            dark: None,
            flat: None,
            solid_angle: None,
            polarization: None,
            mask: None,
            dummy: None,
        }
    }

    #[test]
    fn test_corrections_order() {
        let image = [12.0, 12.0];
        let dark = [2.0, 2.0];
        let flat = [2.0, 2.0];
        let solid = [3.0, 3.0];
        let inputs = CorrectionInputs {
            dark: Some(&dark[..]),
            flat: Some(&flat[..]),
            solid_angle: Some(&solid[..]),
            ..no_corrections()
        };
        let mut corrected = [0.0; 2];
        let mut weight = [0.0; 2];

        corrections(&image, &inputs, &mut corrected, &mut weight);

        // (12 - 2) / 2 * 3
        assert_eq!(corrected, [15.0, 15.0]);
        assert_eq!(weight, [1.0, 1.0]);
    }

    #[test]
    fn test_corrections_exclusions() {
        let image = [1.0, -1.0, 5.0, 7.0];
        let mask = [0.0, 0.0, 1.0, 0.0];
        let flat = [1.0, 1.0, 1.0, 0.0];
        let inputs = CorrectionInputs {
            flat: Some(&flat[..]),
            mask: Some(&mask[..]),
            dummy: Some((-1.0, 0.0)),
            ..no_corrections()
        };
        let mut corrected = [9.0; 4];
        let mut weight = [9.0; 4];

        corrections(&image, &inputs, &mut corrected, &mut weight);

        assert_eq!(weight, [1.0, 0.0, 0.0, 0.0]);
        assert_eq!(corrected, [1.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_lut_layouts_agree() {
        // Two pixels, two bins; pixel 1 is split evenly.
        let corrected = [4.0f32, 8.0];
        let valid = [1.0f32, 1.0];

        let pixel_offsets = [0u32, 1, 3];
        let pixel_indices = [0u32, 0, 1];
        let pixel_weights = [1.0f32, 0.5, 0.5];

        let bin_offsets = [0u32, 2, 3];
        let bin_indices = [0u32, 1, 1];
        let bin_weights = [1.0f32, 0.5, 0.5];

        let mut sum_a = [0.0f32; 2];
        let mut count_a = [0.0f32; 2];
        integrate_lut_pixel(
            &corrected,
            &valid,
            &pixel_offsets,
            &pixel_indices,
            &pixel_weights,
            &mut sum_a,
            &mut count_a,
        );

        let mut sum_b = [0.0f32; 2];
        let mut count_b = [0.0f32; 2];
        integrate_lut_bin(
            &corrected,
            &valid,
            &bin_offsets,
            &bin_indices,
            &bin_weights,
            &mut sum_b,
            &mut count_b,
        );

        assert_eq!(sum_a, [8.0, 4.0]);
        assert_eq!(count_a, [1.5, 0.5]);
        assert_eq!(sum_a, sum_b);
        assert_eq!(count_a, count_b);
    }

    #[test]
    fn test_atomic_histogram() {
        let corrected = [1.0f64, 2.0, 3.0, 4.0];
        let valid = [1.0f64, 1.0, 0.0, 1.0];
        let tth = [0.05f64, 0.15, 0.15, 0.3];
        let mut sums = [0.0; 2];
        let mut counts = [0.0; 2];

        integrate_atomic(&corrected, &valid, &tth, 0.0, 0.5, &mut sums, &mut counts);

        assert_eq!(sums, [3.0, 4.0]);
        assert_eq!(counts, [2.0, 1.0]);
    }

    #[test]
    fn test_bin_of_bounds() {
        assert_eq!(bin_of(0.0, 0.0, 1.0, 2), Some(0));
        assert_eq!(bin_of(1.999, 0.0, 1.0, 2), Some(1));
        assert_eq!(bin_of(2.0, 0.0, 1.0, 2), None);
        assert_eq!(bin_of(-0.1, 0.0, 1.0, 2), None);
    }

    #[test]
    fn test_nearest_bin() {
        // centers at 0.0 and 0.5
        assert_eq!(nearest_bin(0.2, 0.0, 0.5, 2), Some(0));
        assert_eq!(nearest_bin(0.3, 0.0, 0.5, 2), Some(1));
        assert_eq!(nearest_bin(0.9, 0.0, 0.5, 2), Some(1));
        assert_eq!(nearest_bin(1.0, 0.0, 0.5, 2), Some(1));
        assert_eq!(nearest_bin(1.1, 0.0, 0.5, 2), None);
        assert_eq!(nearest_bin(-0.01, 0.0, 0.5, 2), None);
    }
}
