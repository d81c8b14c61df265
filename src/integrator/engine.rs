//! The integrator: setup state machine and the execute path.

use super::binner::{AngularBinner, BinningStrategy};
use super::correction::{Correction, CorrectionPipeline, CorrectionState};
use super::profiling::ProfilingCounters;
use super::status::{StatusFlags, StatusTracker};
use crate::data::{
    AngularGeometry, DeviceClass, ExecutionResult, ExecutionTiming, IntegrationConfig,
    IntegratorConfig, Precision,
};
use crate::device::{
    BufferTag, DeviceBufferManager, DeviceContext, DeviceDescriptor, DeviceIds, DeviceProvider,
    HostPlatform, KernelSource, Program,
};
use crate::error::{IntegratorError, IntegratorResult};
use ndarray::{Array1, ArrayView2};
use num_traits::Zero;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const CONTEXT: (StatusFlags, &str) = (StatusFlags::CONTEXT_READY, "context_ready");
const SIZED: (StatusFlags, &str) = (StatusFlags::SIZED, "sized");
const GEOMETRY: (StatusFlags, &str) = (StatusFlags::GEOMETRY_LOADED, "geometry_loaded");

/// Everything guarded by the integrator lock.
#[derive(Default)]
struct IntegratorState {
    context: Option<Box<dyn DeviceContext>>,
    config: Option<IntegrationConfig>,
    program: Option<Program>,
    strategy: Option<BinningStrategy>,
    buffers: DeviceBufferManager,
    corrections: CorrectionPipeline,
    binner: AngularBinner,
    status: StatusTracker,
    profiling: ProfilingCounters,
}

impl IntegratorState {
    /// Drop every sized resource; the context survives.
    fn reset_sized(&mut self) {
        match self.context.as_deref_mut() {
            Some(ctx) => self.buffers.release_all(ctx),
            None => self.buffers.forget_all(),
        }
        self.config = None;
        self.program = None;
        self.strategy = None;
        self.corrections.reset();
        self.binner.clear();
        self.status.reset(true);
    }
}

fn context_mut(
    context: &mut Option<Box<dyn DeviceContext>>,
) -> IntegratorResult<&mut (dyn DeviceContext + 'static)> {
    context
        .as_deref_mut()
        .ok_or(IntegratorError::NotConfigured { missing: CONTEXT.1 })
}

fn sized(config: &Option<IntegrationConfig>) -> IntegratorResult<&IntegrationConfig> {
    config
        .as_ref()
        .ok_or(IntegratorError::NotConfigured { missing: SIZED.1 })
}

fn chosen(strategy: Option<BinningStrategy>) -> IntegratorResult<BinningStrategy> {
    strategy.ok_or(IntegratorError::NotConfigured { missing: SIZED.1 })
}

/// Azimuthal integrator bound to one device.
///
/// Every method takes `&self` and holds one lock for its whole span, so an
/// integrator can be shared through an `Arc` and setup calls never
/// interleave with an `execute`.
pub struct Integrator {
    settings: IntegratorConfig,
    provider: Arc<dyn DeviceProvider>,
    state: Mutex<IntegratorState>,
}

impl Integrator {
    /// Integrator over the host platform.
    pub fn new(settings: IntegratorConfig) -> Self {
        Self::with_provider(settings, Arc::new(HostPlatform::default()))
    }

    pub fn with_provider(settings: IntegratorConfig, provider: Arc<dyn DeviceProvider>) -> Self {
        Self {
            settings,
            provider,
            state: Mutex::new(IntegratorState::default()),
        }
    }

    /// Create and initialize on the device named by `settings`.
    pub fn from_config(
        settings: IntegratorConfig,
        provider: Arc<dyn DeviceProvider>,
    ) -> IntegratorResult<Self> {
        let integrator = Self::with_provider(settings, provider);
        integrator.init_default()?;
        Ok(integrator)
    }

    pub fn settings(&self) -> &IntegratorConfig {
        &self.settings
    }

    /// Select a device and create its context.
    ///
    /// Re-initializing releases every resource of the previous context.
    pub fn init(
        &self,
        class: DeviceClass,
        use_fp64: bool,
        platform: Option<usize>,
        device: Option<usize>,
    ) -> IntegratorResult<DeviceIds> {
        let mut state = self.state.lock();

        let ids = self.provider.select(class, use_fp64, platform, device)?;
        let context = self.provider.open(ids)?;

        state.reset_sized();
        state.status.reset(false);
        state.context = Some(context);
        state.status.set(StatusFlags::CONTEXT_READY);

        info!(?class, use_fp64, ?ids, "integrator context ready");
        Ok(ids)
    }

    /// `init` with the class, precision and ids from the settings.
    pub fn init_default(&self) -> IntegratorResult<DeviceIds> {
        self.init(
            self.settings.device_class,
            self.settings.precision.is_double(),
            self.settings.platform_id,
            self.settings.device_id,
        )
    }

    /// Size every device buffer and build the kernels.
    ///
    /// Reconfiguring drops corrections, geometry and range. When the kernel
    /// build fails the integrator stays sized without compiled kernels.
    pub fn configure(
        &self,
        n_pixels: usize,
        n_bins: usize,
        use_fp64: Option<bool>,
    ) -> IntegratorResult<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.context.is_none() {
            return Err(IntegratorError::configuration("configure called before init"));
        }

        let precision = use_fp64
            .map(Precision::from_fp64)
            .unwrap_or(self.settings.precision);
        let config = IntegrationConfig::new(n_pixels, n_bins, precision)?;

        state.reset_sized();
        let ctx = context_mut(&mut state.context)?;
        let descriptor = ctx.descriptor().clone();
        if precision.is_double() && !descriptor.supports_fp64 {
            return Err(IntegratorError::configuration(format!(
                "device {} has no double precision",
                descriptor.name
            )));
        }
        let strategy = self
            .settings
            .strategy
            .unwrap_or_else(|| BinningStrategy::auto(&descriptor));
        strategy.validate(&descriptor)?;

        if let Err(e) = state.buffers.configure(ctx, &config) {
            state.buffers.release_all(ctx);
            return Err(e);
        }
        state.config = Some(config);
        state.strategy = Some(strategy);
        state.status.set(StatusFlags::SIZED);
        info!(n_pixels, n_bins, ?precision, ?strategy, "integrator sized");

        let program = KernelSource::load(self.settings.kernel.as_deref())
            .and_then(|source| ctx.build_program(&source));
        match program {
            Ok(program) => {
                debug!(source = %program.source_name, "kernels compiled");
                state.program = Some(program);
                state.status.set(StatusFlags::KERNELS_COMPILED);
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "kernel build failed");
                Err(e)
            }
        }
    }

    /// Load per-pixel angles and build the binning tables.
    ///
    /// `lower`/`upper` override the data extent; a missing one falls back
    /// to its data-derived value.
    pub fn load_geometry(
        &self,
        tth: &[f64],
        half_width: &[f64],
        lower: Option<f64>,
        upper: Option<f64>,
    ) -> IntegratorResult<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.status.require(&[CONTEXT, SIZED])?;
        let config = *sized(&state.config)?;
        let strategy = chosen(state.strategy)?;
        IntegratorError::check_len("tth", config.n_pixels, tth.len())?;

        let mut geometry =
            AngularGeometry::new(tth.to_vec(), half_width.to_vec(), config.precision)?;
        if lower.is_some() || upper.is_some() {
            let (data_min, data_max) = geometry.data_extent();
            geometry.set_range(lower.unwrap_or(data_min), upper.unwrap_or(data_max))?;
        }
        let overridden = geometry.is_overridden();
        let (data_min, data_max) = geometry.data_extent();

        let ctx = context_mut(&mut state.context)?;
        state
            .binner
            .load(ctx, &mut state.buffers, geometry, &config, strategy)?;
        state.status.set(StatusFlags::GEOMETRY_LOADED);
        state.status.assign(StatusFlags::RANGE_SET, overridden);

        info!(data_min, data_max, overridden, "geometry loaded");
        Ok(())
    }

    fn enable(&self, kind: Correction, data: &[f64]) -> IntegratorResult<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.status.require(&[CONTEXT, SIZED])?;
        let config = *sized(&state.config)?;
        let ctx = context_mut(&mut state.context)?;

        state
            .corrections
            .enable(ctx, &mut state.buffers, kind, data, &config)?;
        if let Some(flag) = kind.status_flag() {
            state.status.set(flag);
        }
        Ok(())
    }

    fn disable(&self, kind: Correction) -> IntegratorResult<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.status.require(&[CONTEXT, SIZED])?;
        let config = *sized(&state.config)?;
        let ctx = context_mut(&mut state.context)?;

        state
            .corrections
            .disable(ctx, &mut state.buffers, kind, &config);
        if let Some(flag) = kind.status_flag() {
            state.status.clear(flag);
        }
        Ok(())
    }

    /// Multiply each pixel by its solid-angle factor.
    pub fn set_solid_angle(&self, solid_angle: &[f64]) -> IntegratorResult<()> {
        self.enable(Correction::SolidAngle, solid_angle)
    }

    pub fn unset_solid_angle(&self) -> IntegratorResult<()> {
        self.disable(Correction::SolidAngle)
    }

    /// Subtract a dark-current image.
    pub fn set_dark(&self, dark: &[f64]) -> IntegratorResult<()> {
        self.enable(Correction::Dark, dark)
    }

    pub fn unset_dark(&self) -> IntegratorResult<()> {
        self.disable(Correction::Dark)
    }

    /// Divide by a flat-field image.
    pub fn set_flat(&self, flat: &[f64]) -> IntegratorResult<()> {
        self.enable(Correction::Flat, flat)
    }

    pub fn unset_flat(&self) -> IntegratorResult<()> {
        self.disable(Correction::Flat)
    }

    /// Divide by a polarization factor.
    pub fn set_polarization(&self, polarization: &[f64]) -> IntegratorResult<()> {
        self.enable(Correction::Polarization, polarization)
    }

    pub fn unset_polarization(&self) -> IntegratorResult<()> {
        self.disable(Correction::Polarization)
    }

    /// Exclude every pixel whose mask entry is non-zero.
    pub fn set_mask<M: Zero + Copy>(&self, mask: &[M]) -> IntegratorResult<()> {
        let mask: Vec<f64> = mask
            .iter()
            .map(|m| if m.is_zero() { 0.0 } else { 1.0 })
            .collect();
        self.enable(Correction::Mask, &mask)
    }

    pub fn unset_mask(&self) -> IntegratorResult<()> {
        self.disable(Correction::Mask)
    }

    /// Exclude pixels whose raw value is within `tolerance` of `value`.
    pub fn set_dummy_value(&self, value: f64, tolerance: f64) -> IntegratorResult<()> {
        let mut state = self.state.lock();
        state.status.require(&[CONTEXT, SIZED])?;
        state.corrections.set_dummy(value, tolerance)?;
        state.status.set(StatusFlags::DUMMY);
        debug!(value, tolerance, "dummy value set");
        Ok(())
    }

    pub fn unset_dummy_value(&self) -> IntegratorResult<()> {
        let mut state = self.state.lock();
        state.status.require(&[CONTEXT, SIZED])?;
        state.corrections.unset_dummy();
        state.status.clear(StatusFlags::DUMMY);
        Ok(())
    }

    /// Bin over `[lower, upper)` instead of the data extent.
    pub fn set_range(&self, lower: f64, upper: f64) -> IntegratorResult<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.status.require(&[CONTEXT, SIZED, GEOMETRY])?;
        let config = *sized(&state.config)?;
        let strategy = chosen(state.strategy)?;
        let ctx = context_mut(&mut state.context)?;

        state
            .binner
            .set_range(ctx, &mut state.buffers, lower, upper, &config, strategy)?;
        state.status.set(StatusFlags::RANGE_SET);
        debug!(lower, upper, "range set");
        Ok(())
    }

    /// Bin over the data extent again.
    pub fn unset_range(&self) -> IntegratorResult<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.status.require(&[CONTEXT, SIZED, GEOMETRY])?;
        let config = *sized(&state.config)?;
        let strategy = chosen(state.strategy)?;
        let ctx = context_mut(&mut state.context)?;

        state
            .binner
            .unset_range(ctx, &mut state.buffers, &config, strategy)?;
        state.status.clear(StatusFlags::RANGE_SET);
        debug!("range unset");
        Ok(())
    }

    /// Correct and integrate one flattened image.
    ///
    /// A failed call changes neither configuration nor counters.
    pub fn execute(&self, image: &[f64]) -> IntegratorResult<ExecutionResult> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.status.require_ready()?;
        let config = *sized(&state.config)?;
        let strategy = chosen(state.strategy)?;
        IntegratorError::check_len("image", config.n_pixels, image.len())?;

        let ctx = context_mut(&mut state.context)?;
        let program = state.program.as_ref().ok_or(IntegratorError::NotConfigured {
            missing: "kernels_compiled",
        })?;

        let mut timing = ExecutionTiming::default();
        timing.memcpy += state.buffers.upload(ctx, BufferTag::Image, image)?;
        timing.kernel += state.corrections.apply(ctx, program, &mut state.buffers)?;
        timing.kernel +=
            state
                .binner
                .integrate(ctx, program, &mut state.buffers, strategy, config.n_bins)?;
        ctx.finish();

        let mut download = |tag| -> IntegratorResult<Array1<f64>> {
            let (values, elapsed) = state.buffers.download(&mut *ctx, tag)?;
            timing.memcpy += elapsed;
            Ok(Array1::from(values))
        };
        let bin_centers = download(BufferTag::BinCenters)?;
        let weighted_sum = download(BufferTag::WeightedSum)?;
        let weight_sum = download(BufferTag::WeightSum)?;

        state.profiling.record(&timing);
        debug!(
            exec_count = state.profiling.exec_count(),
            kernel_us = timing.kernel.as_micros() as u64,
            memcpy_us = timing.memcpy.as_micros() as u64,
            "execute finished"
        );

        Ok(ExecutionResult {
            bin_centers,
            weighted_sum,
            weight_sum,
            timing,
        })
    }

    /// `execute` over a 2-D image in row-major order.
    pub fn execute_2d(&self, image: ArrayView2<'_, f64>) -> IntegratorResult<ExecutionResult> {
        match image.as_slice() {
            Some(flat) => self.execute(flat),
            None => {
                let flat: Vec<f64> = image.iter().copied().collect();
                self.execute(&flat)
            }
        }
    }

    /// Run `execute` on the blocking pool, giving up after `timeout`.
    ///
    /// Device work is not cancelled; a timed-out call still finishes and
    /// is counted.
    pub async fn execute_with_timeout(
        self: Arc<Self>,
        image: Vec<f64>,
        timeout: Duration,
    ) -> IntegratorResult<ExecutionResult> {
        let task = tokio::task::spawn_blocking(move || self.execute(&image));
        match tokio::time::timeout(timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join)) => Err(IntegratorError::KernelExecution {
                kernel: "execute",
                message: join.to_string(),
            }),
            Err(_) => {
                warn!(?timeout, "execute timed out");
                Err(IntegratorError::Timeout)
            }
        }
    }

    /// Release device resources.
    ///
    /// With `preserve_context` only the sized state goes and `configure`
    /// can run again directly; otherwise `init` is needed too. Profiling
    /// counters survive. Safe to call repeatedly.
    pub fn clean(&self, preserve_context: bool) {
        let mut state = self.state.lock();
        state.reset_sized();
        if !preserve_context {
            if let Some(mut ctx) = state.context.take() {
                ctx.finish();
            }
            state.status.reset(false);
        }
        info!(preserve_context, "integrator cleaned");
    }

    pub fn status(&self) -> StatusFlags {
        self.state.lock().status.flags()
    }

    pub fn exec_count(&self) -> u64 {
        self.state.lock().profiling.exec_count()
    }

    pub fn kernel_time(&self) -> Duration {
        self.state.lock().profiling.kernel_time()
    }

    pub fn memcpy_time(&self) -> Duration {
        self.state.lock().profiling.memcpy_time()
    }

    /// Snapshot of all counters.
    pub fn profiling(&self) -> ProfilingCounters {
        self.state.lock().profiling.clone()
    }

    pub fn reset_time(&self) {
        self.state.lock().profiling.reset_time();
    }

    pub fn device_ids(&self) -> Option<DeviceIds> {
        self.state.lock().context.as_ref().map(|ctx| ctx.ids())
    }

    pub fn device_descriptor(&self) -> Option<DeviceDescriptor> {
        self.state
            .lock()
            .context
            .as_ref()
            .map(|ctx| ctx.descriptor().clone())
    }

    pub fn correction_state(&self) -> CorrectionState {
        *self.state.lock().corrections.state()
    }

    pub fn configuration(&self) -> Option<IntegrationConfig> {
        self.state.lock().config
    }

    pub fn strategy(&self) -> Option<BinningStrategy> {
        self.state.lock().strategy
    }

    /// Active binning range, once geometry is loaded.
    pub fn active_range(&self) -> Option<(f64, f64)> {
        self.state
            .lock()
            .binner
            .geometry()
            .map(AngularGeometry::active_range)
    }
}

impl Default for Integrator {
    fn default() -> Self {
        Self::new(IntegratorConfig::default())
    }
}
