//! Contract every device backend satisfies.

use super::buffer::{BufferTag, DeviceBuffer, ElementKind};
use super::source::KernelSource;
use crate::data::DeviceClass;
use crate::error::IntegratorResult;
use std::collections::BTreeSet;
use std::time::Duration;

/// Platform and device index as returned by device selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct DeviceIds {
    pub platform: usize,
    pub device: usize,
}

/// Capabilities of one device.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceDescriptor {
    pub name: String,
    pub class: DeviceClass,
    /// Device has native 64-bit floats.
    pub supports_fp64: bool,
    /// Device has an atomic add over its float representation.
    pub supports_atomics: bool,
    /// Global memory in bytes.
    pub global_mem: usize,
    /// Parallel compute units.
    pub compute_units: usize,
}

impl Default for DeviceDescriptor {
    fn default() -> Self {
        Self {
            name: "host".to_string(),
            class: DeviceClass::Cpu,
            supports_fp64: true,
            supports_atomics: true,
            global_mem: 1 << 30,
            compute_units: num_cpus::get(),
        }
    }
}

/// Entry points available after a kernel build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Program {
    pub source_name: String,
    entry_points: BTreeSet<String>,
}

impl Program {
    pub fn new(source_name: impl Into<String>, entry_points: impl IntoIterator<Item = String>) -> Self {
        Self {
            source_name: source_name.into(),
            entry_points: entry_points.into_iter().collect(),
        }
    }

    #[inline]
    pub fn has_entry(&self, name: &str) -> bool {
        self.entry_points.contains(name)
    }

    pub fn entry_points(&self) -> impl Iterator<Item = &str> {
        self.entry_points.iter().map(String::as_str)
    }
}

/// Memory order of the sparse pixel/bin weight table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LutLayout {
    /// One row per pixel listing the bins it feeds.
    PixelMajor,
    /// One row per bin listing the pixels feeding it.
    BinMajor,
}

/// One kernel launch with its bound arguments.
pub enum KernelLaunch<'a> {
    /// Zero-fill an output buffer.
    Memset { target: &'a mut DeviceBuffer },
    /// Apply the correction chain and compute per-pixel validity.
    Corrections {
        image: &'a DeviceBuffer,
        dark: Option<&'a DeviceBuffer>,
        flat: Option<&'a DeviceBuffer>,
        solid_angle: Option<&'a DeviceBuffer>,
        polarization: Option<&'a DeviceBuffer>,
        mask: Option<&'a DeviceBuffer>,
        /// `(value, tolerance)`
        dummy: Option<(f64, f64)>,
        corrected: &'a mut DeviceBuffer,
        pixel_weight: &'a mut DeviceBuffer,
    },
    /// Accumulate through the sparse weight table.
    IntegrateLut {
        layout: LutLayout,
        corrected: &'a DeviceBuffer,
        pixel_weight: &'a DeviceBuffer,
        offsets: &'a DeviceBuffer,
        indices: &'a DeviceBuffer,
        weights: &'a DeviceBuffer,
        weighted_sum: &'a mut DeviceBuffer,
        weight_sum: &'a mut DeviceBuffer,
    },
    /// Add each pixel whole into the bin whose center is nearest its angle.
    IntegrateAtomic {
        corrected: &'a DeviceBuffer,
        pixel_weight: &'a DeviceBuffer,
        tth: &'a DeviceBuffer,
        lower: f64,
        delta: f64,
        weighted_sum: &'a mut DeviceBuffer,
        weight_sum: &'a mut DeviceBuffer,
    },
}

impl KernelLaunch<'_> {
    /// Name of the kernel entry point this launch runs.
    pub fn entry_point(&self) -> &'static str {
        match self {
            KernelLaunch::Memset { .. } => "memset_out",
            KernelLaunch::Corrections { .. } => "corrections",
            KernelLaunch::IntegrateLut {
                layout: LutLayout::PixelMajor,
                ..
            } => "integrate_lut_pixel",
            KernelLaunch::IntegrateLut {
                layout: LutLayout::BinMajor,
                ..
            } => "integrate_lut_bin",
            KernelLaunch::IntegrateAtomic { .. } => "integrate_atomic",
        }
    }
}

/// A device context with one in-order command queue.
///
/// Every call blocks until the device has finished the work it submits.
pub trait DeviceContext: Send {
    fn descriptor(&self) -> &DeviceDescriptor;

    fn ids(&self) -> DeviceIds;

    /// Reserve a zero-filled region.
    fn allocate(
        &mut self,
        tag: BufferTag,
        len: usize,
        element: ElementKind,
    ) -> IntegratorResult<DeviceBuffer>;

    /// Return a region's memory to the device.
    fn release(&mut self, buffer: DeviceBuffer);

    /// Copy real values to the device, converting to the buffer's element type.
    fn write(&mut self, buffer: &mut DeviceBuffer, data: &[f64]) -> IntegratorResult<Duration>;

    /// Copy index values to a `U32` buffer.
    fn write_indices(&mut self, buffer: &mut DeviceBuffer, data: &[u32]) -> IntegratorResult<Duration>;

    /// Copy a buffer back to the host as real values.
    fn read(&mut self, buffer: &DeviceBuffer, out: &mut [f64]) -> IntegratorResult<Duration>;

    /// Build the kernels in `source`.
    fn build_program(&mut self, source: &KernelSource) -> IntegratorResult<Program>;

    /// Run one kernel to completion; returns its device time.
    fn launch(&mut self, program: &Program, launch: KernelLaunch<'_>) -> IntegratorResult<Duration>;

    /// Wait for every queued command.
    fn finish(&mut self) {}
}
