//! Per-pixel intensity corrections.

use super::status::StatusFlags;
use crate::data::IntegrationConfig;
use crate::device::buffer::{bound, bound_mut};
use crate::device::{
    BufferSlots, BufferTag, DeviceBuffer, DeviceBufferManager, DeviceContext, ElementKind,
    KernelLaunch, Program,
};
use crate::error::{IntegratorError, IntegratorResult};
use std::time::Duration;
use tracing::{debug, warn};

/// A correction backed by per-pixel device data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Correction {
    Dark,
    Flat,
    SolidAngle,
    Polarization,
    Mask,
}

impl Correction {
    pub fn tag(self) -> BufferTag {
        match self {
            Correction::Dark => BufferTag::Dark,
            Correction::Flat => BufferTag::Flat,
            Correction::SolidAngle => BufferTag::SolidAngle,
            Correction::Polarization => BufferTag::Polarization,
            Correction::Mask => BufferTag::Mask,
        }
    }

    pub fn name(self) -> &'static str {
        self.tag().name()
    }

    /// Status flag mirroring this correction, if it has one.
    pub fn status_flag(self) -> Option<StatusFlags> {
        match self {
            Correction::Dark => Some(StatusFlags::DARK),
            Correction::SolidAngle => Some(StatusFlags::SOLID_ANGLE),
            Correction::Mask => Some(StatusFlags::MASK),
            Correction::Flat | Correction::Polarization => None,
        }
    }

    /// Whether a one-element buffer stays bound while disabled.
    fn has_placeholder(self) -> bool {
        DeviceBufferManager::PLACEHOLDERS.contains(&self.tag())
    }
}

/// Which corrections the next `execute` applies.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CorrectionState {
    pub dark: bool,
    pub flat: bool,
    pub solid_angle: bool,
    pub polarization: bool,
    pub mask: bool,
    /// `(value, tolerance)`
    pub dummy: Option<(f64, f64)>,
}

impl CorrectionState {
    pub fn is_enabled(&self, kind: Correction) -> bool {
        match kind {
            Correction::Dark => self.dark,
            Correction::Flat => self.flat,
            Correction::SolidAngle => self.solid_angle,
            Correction::Polarization => self.polarization,
            Correction::Mask => self.mask,
        }
    }

    fn assign(&mut self, kind: Correction, enabled: bool) {
        match kind {
            Correction::Dark => self.dark = enabled,
            Correction::Flat => self.flat = enabled,
            Correction::SolidAngle => self.solid_angle = enabled,
            Correction::Polarization => self.polarization = enabled,
            Correction::Mask => self.mask = enabled,
        }
    }
}

/// Uploads correction data and runs the corrections kernel.
#[derive(Debug, Default)]
pub struct CorrectionPipeline {
    state: CorrectionState,
}

impl CorrectionPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn state(&self) -> &CorrectionState {
        &self.state
    }

    /// Upload `data` for `kind` and enable it.
    ///
    /// The new buffer is filled before it replaces the current one, so a
    /// failure leaves the previous data and state in place. Mask entries
    /// are reduced to 0 (keep) or 1 (exclude).
    pub fn enable(
        &mut self,
        ctx: &mut dyn DeviceContext,
        buffers: &mut DeviceBufferManager,
        kind: Correction,
        data: &[f64],
        config: &IntegrationConfig,
    ) -> IntegratorResult<Duration> {
        IntegratorError::check_len(kind.name(), config.n_pixels, data.len())?;

        let mask_values;
        let values = if kind == Correction::Mask {
            mask_values = data
                .iter()
                .map(|&v| if v != 0.0 { 1.0 } else { 0.0 })
                .collect::<Vec<f64>>();
            &mask_values[..]
        } else {
            data
        };

        let element = ElementKind::real(config.precision);
        let mut staged = buffers.stage(ctx, kind.tag(), config.n_pixels, element)?;
        let elapsed = match ctx.write(&mut staged, values) {
            Ok(elapsed) => elapsed,
            Err(e) => {
                ctx.release(staged);
                return Err(e);
            }
        };
        buffers.install(ctx, staged);
        self.state.assign(kind, true);

        debug!(correction = kind.name(), "enabled correction");
        Ok(elapsed)
    }

    /// Disable `kind` and free its data. No-op when already disabled.
    pub fn disable(
        &mut self,
        ctx: &mut dyn DeviceContext,
        buffers: &mut DeviceBufferManager,
        kind: Correction,
        config: &IntegrationConfig,
    ) {
        if !self.state.is_enabled(kind) {
            return;
        }

        let tag = kind.tag();
        buffers.release(ctx, tag);
        if kind.has_placeholder() {
            let element = ElementKind::real(config.precision);
            if let Err(e) = buffers.allocate(ctx, tag, 1, element) {
                warn!(correction = kind.name(), error = %e, "could not rebind placeholder");
            }
        }
        self.state.assign(kind, false);
        debug!(correction = kind.name(), "disabled correction");
    }

    /// Exclude pixels whose raw value lies within `tolerance` of `value`.
    pub fn set_dummy(&mut self, value: f64, tolerance: f64) -> IntegratorResult<()> {
        if !value.is_finite() {
            return Err(IntegratorError::invalid_argument(format!(
                "dummy value must be finite, got {value}"
            )));
        }
        if !tolerance.is_finite() || tolerance < 0.0 {
            return Err(IntegratorError::invalid_argument(format!(
                "dummy tolerance must be finite and non-negative, got {tolerance}"
            )));
        }
        self.state.dummy = Some((value, tolerance));
        Ok(())
    }

    pub fn unset_dummy(&mut self) {
        self.state.dummy = None;
    }

    /// Forget every correction; buffers are owned by the caller's manager.
    pub fn reset(&mut self) {
        self.state = CorrectionState::default();
    }

    /// Run the corrections kernel over the uploaded image.
    pub fn apply(
        &self,
        ctx: &mut dyn DeviceContext,
        program: &Program,
        buffers: &mut DeviceBufferManager,
    ) -> IntegratorResult<Duration> {
        let BufferSlots {
            image,
            dark,
            flat,
            solid_angle,
            polarization,
            mask,
            corrected,
            pixel_weight,
            ..
        } = buffers.slots_mut();

        let state = &self.state;
        let launch = KernelLaunch::Corrections {
            image: bound(image, BufferTag::Image)?,
            dark: optional(state.dark, dark, BufferTag::Dark)?,
            flat: optional(state.flat, flat, BufferTag::Flat)?,
            solid_angle: optional(state.solid_angle, solid_angle, BufferTag::SolidAngle)?,
            polarization: optional(state.polarization, polarization, BufferTag::Polarization)?,
            mask: optional(state.mask, mask, BufferTag::Mask)?,
            dummy: state.dummy,
            corrected: bound_mut(corrected, BufferTag::Corrected)?,
            pixel_weight: bound_mut(pixel_weight, BufferTag::PixelWeight)?,
        };
        ctx.launch(program, launch)
    }
}

fn optional(
    enabled: bool,
    slot: &Option<DeviceBuffer>,
    tag: BufferTag,
) -> IntegratorResult<Option<&DeviceBuffer>> {
    if enabled {
        bound(slot, tag).map(Some)
    } else {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Precision;
    use crate::device::{DeviceDescriptor, DeviceIds, HostDevice, KernelSource};

    struct Fixture {
        device: HostDevice,
        buffers: DeviceBufferManager,
        config: IntegrationConfig,
        program: Program,
    }

    fn fixture() -> Fixture {
        let descriptor = DeviceDescriptor {
            compute_units: 1,
            ..DeviceDescriptor::default()
        };
        let mut device = HostDevice::open(descriptor, DeviceIds::default()).unwrap();
        let config = IntegrationConfig::new(4, 2, Precision::Double).unwrap();
        let mut buffers = DeviceBufferManager::new();
        buffers.configure(&mut device, &config).unwrap();
        let program = device
            .build_program(&KernelSource::load(None).unwrap())
            .unwrap();
        Fixture {
            device,
            buffers,
            config,
            program,
        }
    }

    fn run(f: &mut Fixture, pipeline: &CorrectionPipeline, image: &[f64]) -> (Vec<f64>, Vec<f64>) {
        f.buffers.upload(&mut f.device, BufferTag::Image, image).unwrap();
        pipeline.apply(&mut f.device, &f.program, &mut f.buffers).unwrap();
        let (corrected, _) = f.buffers.download(&mut f.device, BufferTag::Corrected).unwrap();
        let (weight, _) = f.buffers.download(&mut f.device, BufferTag::PixelWeight).unwrap();
        (corrected, weight)
    }

    #[test]
    fn test_correction_order() {
        let mut f = fixture();
        let mut pipeline = CorrectionPipeline::new();
        let config = f.config;

        for (kind, data) in [
            (Correction::Dark, [2.0; 4]),
            (Correction::Flat, [2.0; 4]),
            (Correction::SolidAngle, [3.0; 4]),
            (Correction::Polarization, [0.5; 4]),
        ] {
            pipeline
                .enable(&mut f.device, &mut f.buffers, kind, &data, &config)
                .unwrap();
        }

        // ((10 - 2) / 2) * 3 / 0.5
        let (corrected, weight) = run(&mut f, &pipeline, &[10.0; 4]);
        assert_eq!(corrected, vec![24.0; 4]);
        assert_eq!(weight, vec![1.0; 4]);
    }

    #[test]
    fn test_mask_and_dummy_exclude() {
        let mut f = fixture();
        let mut pipeline = CorrectionPipeline::new();
        let config = f.config;

        pipeline
            .enable(
                &mut f.device,
                &mut f.buffers,
                Correction::Mask,
                &[0.0, 7.0, 0.0, 0.0],
                &config,
            )
            .unwrap();
        pipeline.set_dummy(-1.0, 0.5).unwrap();

        let (corrected, weight) = run(&mut f, &pipeline, &[1.0, 2.0, -1.2, 4.0]);
        assert_eq!(weight, vec![1.0, 0.0, 0.0, 1.0]);
        assert_eq!(corrected, vec![1.0, 0.0, 0.0, 4.0]);

        let mask = f.buffers.get(BufferTag::Mask).unwrap();
        assert_eq!(mask.as_slice::<f64>(), &[0.0, 1.0, 0.0, 0.0]);
    }

    #[test]
    fn test_failed_enable_keeps_previous_data() {
        let mut f = fixture();
        let mut pipeline = CorrectionPipeline::new();
        let config = f.config;

        pipeline
            .enable(&mut f.device, &mut f.buffers, Correction::Dark, &[1.0; 4], &config)
            .unwrap();
        let err = pipeline
            .enable(&mut f.device, &mut f.buffers, Correction::Dark, &[5.0; 3], &config)
            .unwrap_err();

        assert!(matches!(
            err,
            IntegratorError::SizeMismatch {
                buffer: "dark",
                expected: 4,
                actual: 3
            }
        ));
        assert!(pipeline.state().dark);
        let (corrected, _) = run(&mut f, &pipeline, &[3.0; 4]);
        assert_eq!(corrected, vec![2.0; 4]);
    }

    #[test]
    fn test_disable_rebinds_placeholder() {
        let mut f = fixture();
        let mut pipeline = CorrectionPipeline::new();
        let config = f.config;

        pipeline
            .enable(&mut f.device, &mut f.buffers, Correction::Flat, &[2.0; 4], &config)
            .unwrap();
        pipeline
            .enable(&mut f.device, &mut f.buffers, Correction::Mask, &[1.0; 4], &config)
            .unwrap();
        pipeline.disable(&mut f.device, &mut f.buffers, Correction::Flat, &config);
        pipeline.disable(&mut f.device, &mut f.buffers, Correction::Mask, &config);
        pipeline.disable(&mut f.device, &mut f.buffers, Correction::Mask, &config);

        assert_eq!(f.buffers.get(BufferTag::Flat).unwrap().len(), 1);
        assert!(!f.buffers.is_allocated(BufferTag::Mask));
        assert_eq!(*pipeline.state(), CorrectionState::default());

        let (corrected, weight) = run(&mut f, &pipeline, &[3.0; 4]);
        assert_eq!(corrected, vec![3.0; 4]);
        assert_eq!(weight, vec![1.0; 4]);
    }

    #[test]
    fn test_dummy_validation() {
        let mut pipeline = CorrectionPipeline::new();
        assert!(pipeline.set_dummy(0.0, -1.0).is_err());
        assert!(pipeline.set_dummy(0.0, f64::NAN).is_err());
        assert!(pipeline.set_dummy(f64::INFINITY, 0.0).is_err());
        assert!(pipeline.state().dummy.is_none());

        pipeline.set_dummy(0.0, 0.0).unwrap();
        assert_eq!(pipeline.state().dummy, Some((0.0, 0.0)));
        pipeline.unset_dummy();
        assert!(pipeline.state().dummy.is_none());
    }

    #[test]
    fn test_status_flags() {
        assert_eq!(Correction::Dark.status_flag(), Some(StatusFlags::DARK));
        assert_eq!(Correction::Flat.status_flag(), None);
        assert_eq!(Correction::Mask.name(), "mask");
    }
}
