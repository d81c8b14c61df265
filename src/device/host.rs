//! Host device: runs kernels on a rayon pool over modelled device memory.

use super::buffer::{BufferTag, DeviceBuffer, ElementKind};
use super::context::{DeviceContext, DeviceDescriptor, DeviceIds, KernelLaunch, LutLayout, Program};
use super::kernels::{self, CorrectionInputs, DeviceReal};
use super::source::KernelSource;
use crate::error::{IntegratorError, IntegratorResult};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// A device backed by host memory and a dedicated thread pool.
///
/// Memory is accounted against `descriptor.global_mem` so allocation
/// failures behave as on a real accelerator.
pub struct HostDevice {
    descriptor: DeviceDescriptor,
    ids: DeviceIds,
    pool: rayon::ThreadPool,
    used: usize,
}

impl HostDevice {
    pub fn open(descriptor: DeviceDescriptor, ids: DeviceIds) -> IntegratorResult<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(descriptor.compute_units.max(1))
            .thread_name(|i| format!("azim-host-{i}"))
            .build()
            .map_err(|e| IntegratorError::configuration(format!("thread pool: {e}")))?;

        info!(
            device = %descriptor.name,
            class = %descriptor.class,
            platform = ids.platform,
            device_id = ids.device,
            "opened host device context"
        );

        Ok(Self {
            descriptor,
            ids,
            pool,
            used: 0,
        })
    }

    /// Bytes currently allocated.
    #[inline]
    pub fn used_memory(&self) -> usize {
        self.used
    }
}

fn run_typed<T: DeviceReal>(launch: KernelLaunch<'_>) {
    match launch {
        KernelLaunch::Memset { target } => kernels::memset(target.as_mut_slice::<T>()),
        KernelLaunch::Corrections {
            image,
            dark,
            flat,
            solid_angle,
            polarization,
            mask,
            dummy,
            corrected,
            pixel_weight,
        } => {
            let inputs = CorrectionInputs {
                dark: dark.map(DeviceBuffer::as_slice::<T>),
                flat: flat.map(DeviceBuffer::as_slice::<T>),
                solid_angle: solid_angle.map(DeviceBuffer::as_slice::<T>),
                polarization: polarization.map(DeviceBuffer::as_slice::<T>),
                mask: mask.map(DeviceBuffer::as_slice::<T>),
                dummy: dummy.map(|(value, tolerance)| (T::from_f64(value), T::from_f64(tolerance))),
            };
            kernels::corrections(
                image.as_slice::<T>(),
                &inputs,
                corrected.as_mut_slice::<T>(),
                pixel_weight.as_mut_slice::<T>(),
            );
        }
        KernelLaunch::IntegrateLut {
            layout,
            corrected,
            pixel_weight,
            offsets,
            indices,
            weights,
            weighted_sum,
            weight_sum,
        } => {
            let integrate = match layout {
                LutLayout::PixelMajor => kernels::integrate_lut_pixel::<T>,
                LutLayout::BinMajor => kernels::integrate_lut_bin::<T>,
            };
            integrate(
                corrected.as_slice::<T>(),
                pixel_weight.as_slice::<T>(),
                offsets.as_slice::<u32>(),
                indices.as_slice::<u32>(),
                weights.as_slice::<T>(),
                weighted_sum.as_mut_slice::<T>(),
                weight_sum.as_mut_slice::<T>(),
            );
        }
        KernelLaunch::IntegrateAtomic {
            corrected,
            pixel_weight,
            tth,
            lower,
            delta,
            weighted_sum,
            weight_sum,
        } => kernels::integrate_atomic(
            corrected.as_slice::<T>(),
            pixel_weight.as_slice::<T>(),
            tth.as_slice::<T>(),
            lower,
            delta,
            weighted_sum.as_mut_slice::<T>(),
            weight_sum.as_mut_slice::<T>(),
        ),
    }
}

/// Element type of the buffer a launch writes.
fn output_element(launch: &KernelLaunch<'_>) -> ElementKind {
    match launch {
        KernelLaunch::Memset { target } => target.element(),
        KernelLaunch::Corrections { corrected, .. } => corrected.element(),
        KernelLaunch::IntegrateLut { weighted_sum, .. } => weighted_sum.element(),
        KernelLaunch::IntegrateAtomic { weighted_sum, .. } => weighted_sum.element(),
    }
}

impl DeviceContext for HostDevice {
    fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    fn ids(&self) -> DeviceIds {
        self.ids
    }

    fn allocate(
        &mut self,
        tag: BufferTag,
        len: usize,
        element: ElementKind,
    ) -> IntegratorResult<DeviceBuffer> {
        let requested = len * element.size();
        let available = self.descriptor.global_mem.saturating_sub(self.used);
        if requested > available {
            return Err(IntegratorError::Allocation {
                buffer: tag.name(),
                requested,
                available,
            });
        }
        self.used += requested;
        Ok(DeviceBuffer::zeroed(tag, len, element))
    }

    fn release(&mut self, buffer: DeviceBuffer) {
        self.used = self.used.saturating_sub(buffer.byte_size());
    }

    fn write(&mut self, buffer: &mut DeviceBuffer, data: &[f64]) -> IntegratorResult<Duration> {
        IntegratorError::check_len(buffer.tag().name(), buffer.len(), data.len())?;
        let start = Instant::now();
        match buffer.element() {
            ElementKind::F32 => {
                for (dst, &src) in buffer.as_mut_slice::<f32>().iter_mut().zip(data) {
                    *dst = src as f32;
                }
            }
            ElementKind::F64 => buffer.as_mut_slice::<f64>().copy_from_slice(data),
            ElementKind::U32 => {
                return Err(IntegratorError::configuration(format!(
                    "buffer {} holds indices, not reals",
                    buffer.tag().name()
                )))
            }
        }
        Ok(start.elapsed())
    }

    fn write_indices(&mut self, buffer: &mut DeviceBuffer, data: &[u32]) -> IntegratorResult<Duration> {
        IntegratorError::check_len(buffer.tag().name(), buffer.len(), data.len())?;
        if buffer.element() != ElementKind::U32 {
            return Err(IntegratorError::configuration(format!(
                "buffer {} holds reals, not indices",
                buffer.tag().name()
            )));
        }
        let start = Instant::now();
        buffer.as_mut_slice::<u32>().copy_from_slice(data);
        Ok(start.elapsed())
    }

    fn read(&mut self, buffer: &DeviceBuffer, out: &mut [f64]) -> IntegratorResult<Duration> {
        IntegratorError::check_len(buffer.tag().name(), buffer.len(), out.len())?;
        let start = Instant::now();
        match buffer.element() {
            ElementKind::F32 => {
                for (dst, &src) in out.iter_mut().zip(buffer.as_slice::<f32>()) {
                    *dst = src as f64;
                }
            }
            ElementKind::F64 => out.copy_from_slice(buffer.as_slice::<f64>()),
            ElementKind::U32 => {
                for (dst, &src) in out.iter_mut().zip(buffer.as_slice::<u32>()) {
                    *dst = src as f64;
                }
            }
        }
        Ok(start.elapsed())
    }

    fn build_program(&mut self, source: &KernelSource) -> IntegratorResult<Program> {
        let entry_points = source.entry_points();
        if entry_points.is_empty() {
            return Err(IntegratorError::KernelExecution {
                kernel: "build",
                message: format!("{} defines no kernels", source.name()),
            });
        }
        debug!(source = source.name(), kernels = ?entry_points, "built program");
        Ok(Program::new(source.name(), entry_points))
    }

    fn launch(&mut self, program: &Program, launch: KernelLaunch<'_>) -> IntegratorResult<Duration> {
        let kernel = launch.entry_point();
        if !program.has_entry(kernel) {
            return Err(IntegratorError::KernelExecution {
                kernel,
                message: format!("entry point missing from {}", program.source_name),
            });
        }
        let element = output_element(&launch);
        if element == ElementKind::U32 {
            return Err(IntegratorError::KernelExecution {
                kernel,
                message: "output buffer is not real-valued".to_string(),
            });
        }

        let start = Instant::now();
        self.pool.install(|| match element {
            ElementKind::F64 => run_typed::<f64>(launch),
            _ => run_typed::<f32>(launch),
        });
        Ok(start.elapsed())
    }
}
