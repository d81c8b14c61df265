//! Angular binning: geometry upload, lookup tables and accumulation.

use crate::data::{AngularGeometry, IntegrationConfig};
use crate::device::buffer::{bound, bound_mut};
use crate::device::kernels::bin_of;
use crate::device::{
    BufferSlots, BufferTag, DeviceBuffer, DeviceBufferManager, DeviceContext, DeviceDescriptor,
    ElementKind, KernelLaunch, LutLayout, Program,
};
use crate::error::{IntegratorError, IntegratorResult};
use std::time::Duration;
use tracing::debug;

/// How pixel intensity is redistributed into bins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinningStrategy {
    /// Split each pixel over the bins its span overlaps.
    LookupTable(LutLayout),
    /// Add each pixel whole into the bin whose center is nearest its angle.
    DirectHistogram,
}

impl BinningStrategy {
    /// Default for a device: pixel-major tables on wide devices, bin-major
    /// otherwise.
    pub fn auto(descriptor: &DeviceDescriptor) -> Self {
        if descriptor.class.is_wide() {
            BinningStrategy::LookupTable(LutLayout::PixelMajor)
        } else {
            BinningStrategy::LookupTable(LutLayout::BinMajor)
        }
    }

    /// Check that `descriptor` can run this strategy.
    pub fn validate(self, descriptor: &DeviceDescriptor) -> IntegratorResult<()> {
        if self == BinningStrategy::DirectHistogram && !descriptor.supports_atomics {
            return Err(IntegratorError::configuration(format!(
                "device {} has no atomic add; direct histogram unavailable",
                descriptor.name
            )));
        }
        Ok(())
    }

    pub fn layout(self) -> Option<LutLayout> {
        match self {
            BinningStrategy::LookupTable(layout) => Some(layout),
            BinningStrategy::DirectHistogram => None,
        }
    }
}

/// Compressed sparse pixel/bin weight table.
///
/// Row `r` spans `indices[offsets[r]..offsets[r + 1]]`; rows are pixels for
/// [`LutLayout::PixelMajor`] and bins for [`LutLayout::BinMajor`].
#[derive(Debug, Clone, PartialEq)]
pub struct SparseLut {
    pub layout: LutLayout,
    pub offsets: Vec<u32>,
    pub indices: Vec<u32>,
    pub weights: Vec<f64>,
}

impl SparseLut {
    /// Number of stored weights.
    #[inline]
    pub fn nnz(&self) -> usize {
        self.weights.len()
    }

    fn transpose(&self, n_cols: usize, layout: LutLayout) -> Self {
        let mut counts = vec![0u32; n_cols + 1];
        for &col in &self.indices {
            counts[col as usize + 1] += 1;
        }
        for i in 1..counts.len() {
            counts[i] += counts[i - 1];
        }

        let offsets = counts.clone();
        let mut cursor = counts;
        let mut indices = vec![0u32; self.nnz()];
        let mut weights = vec![0.0; self.nnz()];
        for row in 0..self.offsets.len() - 1 {
            for k in self.offsets[row] as usize..self.offsets[row + 1] as usize {
                let col = self.indices[k] as usize;
                let slot = cursor[col] as usize;
                indices[slot] = row as u32;
                weights[slot] = self.weights[k];
                cursor[col] += 1;
            }
        }

        Self {
            layout,
            offsets,
            indices,
            weights,
        }
    }
}

/// Build the weight table for `geometry` over its active range.
///
/// A pixel spanning `[tth - hw, tth + hw]` gives each bin the fraction of
/// its span that overlaps the bin, so a pixel fully inside the range has
/// total weight 1. A zero-width pixel gives weight 1 to the bin holding it.
pub fn build_lut(
    geometry: &AngularGeometry,
    n_bins: usize,
    layout: LutLayout,
) -> IntegratorResult<SparseLut> {
    let (lower, upper) = geometry.active_range();
    let delta = geometry.delta(n_bins);
    let edge = |k: usize| {
        if k == n_bins {
            upper
        } else {
            lower + k as f64 * delta
        }
    };

    let mut offsets = Vec::with_capacity(geometry.len() + 1);
    let mut indices = Vec::new();
    let mut weights = Vec::new();
    offsets.push(0u32);

    for (&tth, &hw) in geometry.tth.iter().zip(&geometry.half_width) {
        let lo = tth - hw;
        let hi = tth + hw;
        let span = hi - lo;

        if span <= 0.0 {
            if let Some(bin) = bin_of(tth, lower, delta, n_bins) {
                indices.push(bin as u32);
                weights.push(1.0);
            }
        } else if hi > lower && lo < upper {
            let first = ((lo - lower) / delta).floor().max(0.0) as usize;
            let last = (((hi - lower) / delta).floor() as usize).min(n_bins - 1);
            for bin in first.min(n_bins - 1)..=last {
                let overlap = hi.min(edge(bin + 1)) - lo.max(edge(bin));
                if overlap > 0.0 {
                    indices.push(bin as u32);
                    weights.push(overlap / span);
                }
            }
        }

        let end = u32::try_from(indices.len()).map_err(|_| {
            IntegratorError::configuration("lookup table exceeds 32-bit indexing")
        })?;
        offsets.push(end);
    }

    let pixel_major = SparseLut {
        layout: LutLayout::PixelMajor,
        offsets,
        indices,
        weights,
    };
    Ok(match layout {
        LutLayout::PixelMajor => pixel_major,
        LutLayout::BinMajor => pixel_major.transpose(n_bins, LutLayout::BinMajor),
    })
}

/// Owns the angular geometry and keeps its device buffers current.
#[derive(Debug, Default)]
pub struct AngularBinner {
    geometry: Option<AngularGeometry>,
}

impl AngularBinner {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn geometry(&self) -> Option<&AngularGeometry> {
        self.geometry.as_ref()
    }

    /// Upload `geometry` and everything derived from it.
    pub fn load(
        &mut self,
        ctx: &mut dyn DeviceContext,
        buffers: &mut DeviceBufferManager,
        geometry: AngularGeometry,
        config: &IntegrationConfig,
        strategy: BinningStrategy,
    ) -> IntegratorResult<()> {
        IntegratorError::check_len("tth", config.n_pixels, geometry.len())?;
        Self::rebuild(ctx, buffers, &geometry, config, strategy)?;
        self.geometry = Some(geometry);
        Ok(())
    }

    /// Integrate over `[lower, upper)` instead of the data extent.
    pub fn set_range(
        &mut self,
        ctx: &mut dyn DeviceContext,
        buffers: &mut DeviceBufferManager,
        lower: f64,
        upper: f64,
        config: &IntegrationConfig,
        strategy: BinningStrategy,
    ) -> IntegratorResult<()> {
        let mut next = self.loaded()?.clone();
        next.set_range(lower, upper)?;
        Self::rebuild(ctx, buffers, &next, config, strategy)?;
        self.geometry = Some(next);
        Ok(())
    }

    /// Integrate over the data extent again.
    pub fn unset_range(
        &mut self,
        ctx: &mut dyn DeviceContext,
        buffers: &mut DeviceBufferManager,
        config: &IntegrationConfig,
        strategy: BinningStrategy,
    ) -> IntegratorResult<()> {
        let mut next = self.loaded()?.clone();
        next.unset_range();
        Self::rebuild(ctx, buffers, &next, config, strategy)?;
        self.geometry = Some(next);
        Ok(())
    }

    pub fn clear(&mut self) {
        self.geometry = None;
    }

    fn loaded(&self) -> IntegratorResult<&AngularGeometry> {
        self.geometry
            .as_ref()
            .ok_or(IntegratorError::NotConfigured {
                missing: "geometry_loaded",
            })
    }

    /// Stage every derived buffer, then install them together.
    fn rebuild(
        ctx: &mut dyn DeviceContext,
        buffers: &mut DeviceBufferManager,
        geometry: &AngularGeometry,
        config: &IntegrationConfig,
        strategy: BinningStrategy,
    ) -> IntegratorResult<()> {
        let mut staged = Vec::with_capacity(6);
        if let Err(e) = Self::stage_all(ctx, buffers, geometry, config, strategy, &mut staged) {
            for buffer in staged {
                ctx.release(buffer);
            }
            return Err(e);
        }

        for buffer in staged {
            buffers.install(ctx, buffer);
        }
        if strategy.layout().is_none() {
            for tag in [BufferTag::LutOffsets, BufferTag::LutIndices, BufferTag::LutWeights] {
                buffers.release(ctx, tag);
            }
        }

        let (lower, upper) = geometry.active_range();
        debug!(lower, upper, n_bins = config.n_bins, ?strategy, "rebuilt angular bins");
        Ok(())
    }

    fn stage_all(
        ctx: &mut dyn DeviceContext,
        buffers: &DeviceBufferManager,
        geometry: &AngularGeometry,
        config: &IntegrationConfig,
        strategy: BinningStrategy,
        staged: &mut Vec<DeviceBuffer>,
    ) -> IntegratorResult<()> {
        let real = ElementKind::real(config.precision);
        let centers = geometry.bin_centers(config.n_bins);

        stage_reals(ctx, buffers, BufferTag::Tth, &geometry.tth, real, staged)?;
        stage_reals(ctx, buffers, BufferTag::HalfWidth, &geometry.half_width, real, staged)?;
        stage_reals(ctx, buffers, BufferTag::BinCenters, &centers, real, staged)?;

        if let Some(layout) = strategy.layout() {
            let lut = build_lut(geometry, config.n_bins, layout)?;
            debug!(nnz = lut.nnz(), ?layout, "built lookup table");
            stage_indices(ctx, buffers, BufferTag::LutOffsets, &lut.offsets, staged)?;
            stage_indices(ctx, buffers, BufferTag::LutIndices, &lut.indices, staged)?;
            stage_reals(ctx, buffers, BufferTag::LutWeights, &lut.weights, real, staged)?;
        }
        Ok(())
    }

    /// Zero the outputs and accumulate the corrected image into them.
    pub fn integrate(
        &self,
        ctx: &mut dyn DeviceContext,
        program: &Program,
        buffers: &mut DeviceBufferManager,
        strategy: BinningStrategy,
        n_bins: usize,
    ) -> IntegratorResult<Duration> {
        let geometry = self.loaded()?;
        let BufferSlots {
            tth,
            corrected,
            pixel_weight,
            lut_offsets,
            lut_indices,
            lut_weights,
            weighted_sum,
            weight_sum,
            ..
        } = buffers.slots_mut();

        let mut elapsed = ctx.launch(
            program,
            KernelLaunch::Memset {
                target: bound_mut(weighted_sum, BufferTag::WeightedSum)?,
            },
        )?;
        elapsed += ctx.launch(
            program,
            KernelLaunch::Memset {
                target: bound_mut(weight_sum, BufferTag::WeightSum)?,
            },
        )?;

        let launch = match strategy {
            BinningStrategy::LookupTable(layout) => KernelLaunch::IntegrateLut {
                layout,
                corrected: bound(corrected, BufferTag::Corrected)?,
                pixel_weight: bound(pixel_weight, BufferTag::PixelWeight)?,
                offsets: bound(lut_offsets, BufferTag::LutOffsets)?,
                indices: bound(lut_indices, BufferTag::LutIndices)?,
                weights: bound(lut_weights, BufferTag::LutWeights)?,
                weighted_sum: bound_mut(weighted_sum, BufferTag::WeightedSum)?,
                weight_sum: bound_mut(weight_sum, BufferTag::WeightSum)?,
            },
            BinningStrategy::DirectHistogram => KernelLaunch::IntegrateAtomic {
                corrected: bound(corrected, BufferTag::Corrected)?,
                pixel_weight: bound(pixel_weight, BufferTag::PixelWeight)?,
                tth: bound(tth, BufferTag::Tth)?,
                lower: geometry.active_range().0,
                delta: geometry.delta(n_bins),
                weighted_sum: bound_mut(weighted_sum, BufferTag::WeightedSum)?,
                weight_sum: bound_mut(weight_sum, BufferTag::WeightSum)?,
            },
        };
        elapsed += ctx.launch(program, launch)?;
        Ok(elapsed)
    }
}

fn stage_reals(
    ctx: &mut dyn DeviceContext,
    buffers: &DeviceBufferManager,
    tag: BufferTag,
    data: &[f64],
    element: ElementKind,
    staged: &mut Vec<DeviceBuffer>,
) -> IntegratorResult<()> {
    let mut buffer = buffers.stage(ctx, tag, data.len(), element)?;
    let written = ctx.write(&mut buffer, data);
    staged.push(buffer);
    written.map(|_| ())
}

fn stage_indices(
    ctx: &mut dyn DeviceContext,
    buffers: &DeviceBufferManager,
    tag: BufferTag,
    data: &[u32],
    staged: &mut Vec<DeviceBuffer>,
) -> IntegratorResult<()> {
    let mut buffer = buffers.stage(ctx, tag, data.len(), ElementKind::U32)?;
    let written = ctx.write_indices(&mut buffer, data);
    staged.push(buffer);
    written.map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{DeviceClass, Precision};
    use crate::device::{DeviceIds, HostDevice, KernelSource};

    fn geometry() -> AngularGeometry {
        AngularGeometry::new(
            vec![0.1, 0.1, 0.3, 0.3],
            vec![0.05; 4],
            Precision::Double,
        )
        .unwrap()
    }

    #[test]
    fn test_auto_strategy() {
        let cpu = DeviceDescriptor::default();
        assert_eq!(
            BinningStrategy::auto(&cpu),
            BinningStrategy::LookupTable(LutLayout::BinMajor)
        );

        let gpu = DeviceDescriptor {
            class: DeviceClass::Gpu,
            ..DeviceDescriptor::default()
        };
        assert_eq!(
            BinningStrategy::auto(&gpu),
            BinningStrategy::LookupTable(LutLayout::PixelMajor)
        );

        let no_atomics = DeviceDescriptor {
            supports_atomics: false,
            ..DeviceDescriptor::default()
        };
        assert!(BinningStrategy::DirectHistogram.validate(&no_atomics).is_err());
        assert!(BinningStrategy::auto(&no_atomics).validate(&no_atomics).is_ok());
    }

    #[test]
    fn test_lut_whole_pixels() {
        let lut = build_lut(&geometry(), 2, LutLayout::PixelMajor).unwrap();
        assert_eq!(lut.offsets, vec![0, 1, 2, 3, 4]);
        assert_eq!(lut.indices, vec![0, 0, 1, 1]);
        for w in &lut.weights {
            assert!((w - 1.0).abs() < 1e-9);
        }
    }

    #[test]
    fn test_lut_split_pixel() {
        let mut geometry =
            AngularGeometry::new(vec![0.5, 1.5], vec![0.25, 0.0], Precision::Double).unwrap();
        geometry.set_range(0.0, 2.0).unwrap();

        // The first pixel straddles bins 0 and 1; the second has no width.
        let lut = build_lut(&geometry, 4, LutLayout::PixelMajor).unwrap();

        assert_eq!(lut.offsets, vec![0, 2, 3]);
        assert_eq!(lut.indices, vec![0, 1, 3]);
        assert!((lut.weights[0] - 0.5).abs() < 1e-12);
        assert!((lut.weights[1] - 0.5).abs() < 1e-12);
        assert_eq!(lut.weights[2], 1.0);
    }

    #[test]
    fn test_lut_clips_to_range() {
        let mut geometry = geometry();
        geometry.set_range(0.0, 0.1).unwrap();
        let lut = build_lut(&geometry, 2, LutLayout::PixelMajor).unwrap();

        // Half of each low pixel overlaps the range; the high pixels miss it.
        assert_eq!(lut.offsets, vec![0, 1, 2, 2, 2]);
        assert_eq!(lut.indices, vec![1, 1]);
        assert!((lut.weights[0] - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_bin_major_transpose() {
        let pixel = build_lut(&geometry(), 2, LutLayout::PixelMajor).unwrap();
        let bin = build_lut(&geometry(), 2, LutLayout::BinMajor).unwrap();

        assert_eq!(bin.layout, LutLayout::BinMajor);
        assert_eq!(bin.offsets, vec![0, 2, 4]);
        assert_eq!(bin.indices, vec![0, 1, 2, 3]);
        assert_eq!(bin.nnz(), pixel.nnz());
        let total: f64 = bin.weights.iter().sum();
        assert!((total - 4.0).abs() < 1e-9);
    }

    #[test]
    fn test_rebuild_failure_leaves_buffers() {
        let descriptor = DeviceDescriptor {
            compute_units: 1,
            global_mem: 400,
            ..DeviceDescriptor::default()
        };
        let mut device = HostDevice::open(descriptor, DeviceIds::default()).unwrap();
        let config = IntegrationConfig::new(4, 2, Precision::Double).unwrap();
        let mut buffers = DeviceBufferManager::new();
        buffers.configure(&mut device, &config).unwrap();
        let used = device.used_memory();

        let strategy = BinningStrategy::LookupTable(LutLayout::BinMajor);
        let mut binner = AngularBinner::new();
        let overlapping =
            AngularGeometry::new(vec![0.1; 4], vec![0.05; 4], Precision::Double).unwrap();
        let wrong_size =
            AngularGeometry::new(vec![0.1; 8], vec![0.05; 8], Precision::Double).unwrap();
        assert!(matches!(
            binner.load(&mut device, &mut buffers, wrong_size, &config, strategy),
            Err(IntegratorError::SizeMismatch { buffer: "tth", .. })
        ));

        binner
            .load(&mut device, &mut buffers, overlapping, &config, strategy)
            .unwrap();
        let after_load = device.used_memory();
        assert!(after_load > used);

        // Staging a second copy of every derived buffer exceeds the budget.
        let err = binner
            .set_range(&mut device, &mut buffers, 0.0, 0.2, &config, strategy)
            .unwrap_err();
        assert!(matches!(err, IntegratorError::Allocation { .. }));
        assert_eq!(device.used_memory(), after_load);
        assert!(!binner.geometry().unwrap().is_overridden());
    }

    #[test]
    fn test_integrate_strategies() {
        let descriptor = DeviceDescriptor {
            compute_units: 2,
            ..DeviceDescriptor::default()
        };
        let mut device = HostDevice::open(descriptor, DeviceIds::default()).unwrap();
        let program = device
            .build_program(&KernelSource::load(None).unwrap())
            .unwrap();
        let config = IntegrationConfig::new(4, 2, Precision::Double).unwrap();

        for strategy in [
            BinningStrategy::LookupTable(LutLayout::PixelMajor),
            BinningStrategy::LookupTable(LutLayout::BinMajor),
            BinningStrategy::DirectHistogram,
        ] {
            let mut buffers = DeviceBufferManager::new();
            buffers.configure(&mut device, &config).unwrap();
            let mut binner = AngularBinner::new();
            binner
                .load(&mut device, &mut buffers, geometry(), &config, strategy)
                .unwrap();

            buffers
                .upload(&mut device, BufferTag::Corrected, &[10.0, 10.0, 20.0, 20.0])
                .unwrap();
            buffers
                .upload(&mut device, BufferTag::PixelWeight, &[1.0; 4])
                .unwrap();
            binner
                .integrate(&mut device, &program, &mut buffers, strategy, 2)
                .unwrap();

            let (sums, _) = buffers.download(&mut device, BufferTag::WeightedSum).unwrap();
            let (counts, _) = buffers.download(&mut device, BufferTag::WeightSum).unwrap();
            assert!((sums[0] - 20.0).abs() < 1e-9, "{strategy:?}");
            assert!((sums[1] - 40.0).abs() < 1e-9, "{strategy:?}");
            assert!((counts[0] - 2.0).abs() < 1e-9, "{strategy:?}");
            assert!((counts[1] - 2.0).abs() < 1e-9, "{strategy:?}");
            assert_eq!(
                buffers.is_allocated(BufferTag::LutWeights),
                strategy.layout().is_some()
            );

            buffers.release_all(&mut device);
        }
        assert_eq!(device.used_memory(), 0);
    }
}
