//! Device memory regions and the slot table that owns them.

use super::context::DeviceContext;
use crate::data::{IntegrationConfig, Precision};
use crate::error::{IntegratorError, IntegratorResult};
use bytemuck::Pod;
use std::time::Duration;
use tracing::debug;

/// Content tag of a device buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferTag {
    Tth,
    HalfWidth,
    Image,
    Corrected,
    PixelWeight,
    Dark,
    Flat,
    SolidAngle,
    Polarization,
    Mask,
    LutOffsets,
    LutIndices,
    LutWeights,
    BinCenters,
    WeightedSum,
    WeightSum,
}

impl BufferTag {
    pub const ALL: [BufferTag; 16] = [
        BufferTag::Tth,
        BufferTag::HalfWidth,
        BufferTag::Image,
        BufferTag::Corrected,
        BufferTag::PixelWeight,
        BufferTag::Dark,
        BufferTag::Flat,
        BufferTag::SolidAngle,
        BufferTag::Polarization,
        BufferTag::Mask,
        BufferTag::LutOffsets,
        BufferTag::LutIndices,
        BufferTag::LutWeights,
        BufferTag::BinCenters,
        BufferTag::WeightedSum,
        BufferTag::WeightSum,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            BufferTag::Tth => "tth",
            BufferTag::HalfWidth => "half_width",
            BufferTag::Image => "image",
            BufferTag::Corrected => "corrected",
            BufferTag::PixelWeight => "pixel_weight",
            BufferTag::Dark => "dark",
            BufferTag::Flat => "flat",
            BufferTag::SolidAngle => "solid_angle",
            BufferTag::Polarization => "polarization",
            BufferTag::Mask => "mask",
            BufferTag::LutOffsets => "lut_offsets",
            BufferTag::LutIndices => "lut_indices",
            BufferTag::LutWeights => "lut_weights",
            BufferTag::BinCenters => "bin_centers",
            BufferTag::WeightedSum => "weighted_sum",
            BufferTag::WeightSum => "weight_sum",
        }
    }
}

/// Element type stored in a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementKind {
    F32,
    F64,
    U32,
}

impl ElementKind {
    /// Real-valued element for `precision`.
    pub fn real(precision: Precision) -> Self {
        match precision {
            Precision::Single => ElementKind::F32,
            Precision::Double => ElementKind::F64,
        }
    }

    #[inline]
    pub fn size(self) -> usize {
        match self {
            ElementKind::F32 | ElementKind::U32 => 4,
            ElementKind::F64 => 8,
        }
    }
}

/// A region of device memory.
///
/// Storage is word-aligned so it can be viewed as any element type through
/// `bytemuck`.
#[derive(Debug)]
pub struct DeviceBuffer {
    tag: BufferTag,
    len: usize,
    element: ElementKind,
    storage: Vec<u64>,
}

impl DeviceBuffer {
    /// Zero-filled region of `len` elements.
    pub fn zeroed(tag: BufferTag, len: usize, element: ElementKind) -> Self {
        let words = (len * element.size()).div_ceil(8);
        Self {
            tag,
            len,
            element,
            storage: vec![0; words],
        }
    }

    #[inline]
    pub fn tag(&self) -> BufferTag {
        self.tag
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn element(&self) -> ElementKind {
        self.element
    }

    #[inline]
    pub fn byte_size(&self) -> usize {
        self.len * self.element.size()
    }

    /// Typed view of the contents.
    ///
    /// `T` must have the buffer's element size.
    pub fn as_slice<T: Pod>(&self) -> &[T] {
        debug_assert_eq!(std::mem::size_of::<T>(), self.element.size());
        &bytemuck::cast_slice::<u64, T>(&self.storage)[..self.len]
    }

    pub fn as_mut_slice<T: Pod>(&mut self) -> &mut [T] {
        debug_assert_eq!(std::mem::size_of::<T>(), self.element.size());
        let len = self.len;
        &mut bytemuck::cast_slice_mut::<u64, T>(&mut self.storage)[..len]
    }
}

/// One optional buffer per tag.
#[derive(Debug, Default)]
pub struct BufferSlots {
    pub tth: Option<DeviceBuffer>,
    pub half_width: Option<DeviceBuffer>,
    pub image: Option<DeviceBuffer>,
    pub corrected: Option<DeviceBuffer>,
    pub pixel_weight: Option<DeviceBuffer>,
    pub dark: Option<DeviceBuffer>,
    pub flat: Option<DeviceBuffer>,
    pub solid_angle: Option<DeviceBuffer>,
    pub polarization: Option<DeviceBuffer>,
    pub mask: Option<DeviceBuffer>,
    pub lut_offsets: Option<DeviceBuffer>,
    pub lut_indices: Option<DeviceBuffer>,
    pub lut_weights: Option<DeviceBuffer>,
    pub bin_centers: Option<DeviceBuffer>,
    pub weighted_sum: Option<DeviceBuffer>,
    pub weight_sum: Option<DeviceBuffer>,
}

impl BufferSlots {
    pub fn get(&self, tag: BufferTag) -> &Option<DeviceBuffer> {
        match tag {
            BufferTag::Tth => &self.tth,
            BufferTag::HalfWidth => &self.half_width,
            BufferTag::Image => &self.image,
            BufferTag::Corrected => &self.corrected,
            BufferTag::PixelWeight => &self.pixel_weight,
            BufferTag::Dark => &self.dark,
            BufferTag::Flat => &self.flat,
            BufferTag::SolidAngle => &self.solid_angle,
            BufferTag::Polarization => &self.polarization,
            BufferTag::Mask => &self.mask,
            BufferTag::LutOffsets => &self.lut_offsets,
            BufferTag::LutIndices => &self.lut_indices,
            BufferTag::LutWeights => &self.lut_weights,
            BufferTag::BinCenters => &self.bin_centers,
            BufferTag::WeightedSum => &self.weighted_sum,
            BufferTag::WeightSum => &self.weight_sum,
        }
    }

    pub fn get_mut(&mut self, tag: BufferTag) -> &mut Option<DeviceBuffer> {
        match tag {
            BufferTag::Tth => &mut self.tth,
            BufferTag::HalfWidth => &mut self.half_width,
            BufferTag::Image => &mut self.image,
            BufferTag::Corrected => &mut self.corrected,
            BufferTag::PixelWeight => &mut self.pixel_weight,
            BufferTag::Dark => &mut self.dark,
            BufferTag::Flat => &mut self.flat,
            BufferTag::SolidAngle => &mut self.solid_angle,
            BufferTag::Polarization => &mut self.polarization,
            BufferTag::Mask => &mut self.mask,
            BufferTag::LutOffsets => &mut self.lut_offsets,
            BufferTag::LutIndices => &mut self.lut_indices,
            BufferTag::LutWeights => &mut self.lut_weights,
            BufferTag::BinCenters => &mut self.bin_centers,
            BufferTag::WeightedSum => &mut self.weighted_sum,
            BufferTag::WeightSum => &mut self.weight_sum,
        }
    }
}

/// A bound kernel argument: the slot must hold a buffer.
pub(crate) fn bound(slot: &Option<DeviceBuffer>, tag: BufferTag) -> IntegratorResult<&DeviceBuffer> {
    slot.as_ref().ok_or_else(|| unbound(tag))
}

pub(crate) fn bound_mut(
    slot: &mut Option<DeviceBuffer>,
    tag: BufferTag,
) -> IntegratorResult<&mut DeviceBuffer> {
    slot.as_mut().ok_or_else(|| unbound(tag))
}

fn unbound(tag: BufferTag) -> IntegratorError {
    IntegratorError::configuration(format!("buffer {} is not allocated", tag.name()))
}

/// Owns every device region of one integrator.
///
/// Callers hold the integrator lock for every method; the manager itself
/// does no locking.
#[derive(Debug, Default)]
pub struct DeviceBufferManager {
    slots: BufferSlots,
}

impl DeviceBufferManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the fixed-size buffers for `config`.
    ///
    /// Optional corrections get one-element placeholders until real data
    /// is uploaded.
    pub fn configure(
        &mut self,
        ctx: &mut dyn DeviceContext,
        config: &IntegrationConfig,
    ) -> IntegratorResult<()> {
        let real = ElementKind::real(config.precision);

        for tag in [BufferTag::BinCenters, BufferTag::WeightedSum, BufferTag::WeightSum] {
            self.allocate(ctx, tag, config.n_bins, real)?;
        }
        for tag in [BufferTag::Image, BufferTag::Corrected, BufferTag::PixelWeight] {
            self.allocate(ctx, tag, config.n_pixels, real)?;
        }
        for tag in Self::PLACEHOLDERS {
            self.allocate(ctx, tag, 1, real)?;
        }
        Ok(())
    }

    /// Corrections that keep a bindable placeholder while disabled.
    pub const PLACEHOLDERS: [BufferTag; 4] = [
        BufferTag::Dark,
        BufferTag::Flat,
        BufferTag::SolidAngle,
        BufferTag::Polarization,
    ];

    /// Create or resize the region for `tag`.
    pub fn allocate(
        &mut self,
        ctx: &mut dyn DeviceContext,
        tag: BufferTag,
        len: usize,
        element: ElementKind,
    ) -> IntegratorResult<()> {
        if let Some(existing) = self.slots.get(tag) {
            if existing.len() == len && existing.element() == element {
                return Ok(());
            }
        }
        self.release(ctx, tag);
        let buffer = ctx.allocate(tag, len, element)?;
        debug!(buffer = tag.name(), len, bytes = buffer.byte_size(), "allocated device buffer");
        *self.slots.get_mut(tag) = Some(buffer);
        Ok(())
    }

    /// Allocate a region that is not yet visible to kernels.
    pub fn stage(
        &self,
        ctx: &mut dyn DeviceContext,
        tag: BufferTag,
        len: usize,
        element: ElementKind,
    ) -> IntegratorResult<DeviceBuffer> {
        ctx.allocate(tag, len, element)
    }

    /// Make a staged buffer current, freeing the one it replaces.
    pub fn install(&mut self, ctx: &mut dyn DeviceContext, buffer: DeviceBuffer) {
        let tag = buffer.tag();
        debug!(buffer = tag.name(), len = buffer.len(), "installed device buffer");
        if let Some(previous) = self.slots.get_mut(tag).replace(buffer) {
            ctx.release(previous);
        }
    }

    /// Free the region for `tag`; no-op when already free.
    pub fn release(&mut self, ctx: &mut dyn DeviceContext, tag: BufferTag) {
        if let Some(buffer) = self.slots.get_mut(tag).take() {
            debug!(buffer = tag.name(), "released device buffer");
            ctx.release(buffer);
        }
    }

    /// Free every tracked region.
    pub fn release_all(&mut self, ctx: &mut dyn DeviceContext) {
        for tag in BufferTag::ALL {
            self.release(ctx, tag);
        }
    }

    /// Drop every slot without returning memory to a device.
    ///
    /// Used when the context itself is gone.
    pub fn forget_all(&mut self) {
        self.slots = BufferSlots::default();
    }

    #[inline]
    pub fn get(&self, tag: BufferTag) -> Option<&DeviceBuffer> {
        self.slots.get(tag).as_ref()
    }

    #[inline]
    pub fn is_allocated(&self, tag: BufferTag) -> bool {
        self.slots.get(tag).is_some()
    }

    /// Total bytes held across all slots.
    pub fn allocated_bytes(&self) -> usize {
        BufferTag::ALL
            .iter()
            .filter_map(|&tag| self.get(tag))
            .map(DeviceBuffer::byte_size)
            .sum()
    }

    pub fn slots(&self) -> &BufferSlots {
        &self.slots
    }

    pub fn slots_mut(&mut self) -> &mut BufferSlots {
        &mut self.slots
    }

    /// Copy host values into the region for `tag`.
    pub fn upload(
        &mut self,
        ctx: &mut dyn DeviceContext,
        tag: BufferTag,
        data: &[f64],
    ) -> IntegratorResult<Duration> {
        let buffer = bound_mut(self.slots.get_mut(tag), tag)?;
        IntegratorError::check_len(tag.name(), buffer.len(), data.len())?;
        ctx.write(buffer, data)
    }

    /// Copy the region for `tag` back to the host.
    pub fn download(
        &self,
        ctx: &mut dyn DeviceContext,
        tag: BufferTag,
    ) -> IntegratorResult<(Vec<f64>, Duration)> {
        let buffer = bound(self.slots.get(tag), tag)?;
        let mut out = vec![0.0; buffer.len()];
        let elapsed = ctx.read(buffer, &mut out)?;
        Ok((out, elapsed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceDescriptor, DeviceIds, HostDevice};

    fn small_device(global_mem: usize) -> HostDevice {
        let descriptor = DeviceDescriptor {
            global_mem,
            compute_units: 1,
            ..DeviceDescriptor::default()
        };
        HostDevice::open(descriptor, DeviceIds::default()).unwrap()
    }

    #[test]
    fn test_typed_views() {
        let mut buffer = DeviceBuffer::zeroed(BufferTag::Image, 3, ElementKind::F32);
        assert_eq!(buffer.byte_size(), 12);
        buffer.as_mut_slice::<f32>().copy_from_slice(&[1.0, 2.0, 3.0]);
        assert_eq!(buffer.as_slice::<f32>(), &[1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_configure_allocates_fixed_buffers() {
        let mut device = small_device(1 << 20);
        let mut manager = DeviceBufferManager::new();
        let config = IntegrationConfig::new(100, 10, Precision::Double).unwrap();

        manager.configure(&mut device, &config).unwrap();

        assert_eq!(manager.get(BufferTag::WeightedSum).unwrap().len(), 10);
        assert_eq!(manager.get(BufferTag::Image).unwrap().len(), 100);
        assert_eq!(manager.get(BufferTag::Dark).unwrap().len(), 1);
        assert!(!manager.is_allocated(BufferTag::Mask));
        assert_eq!(manager.allocated_bytes(), device.used_memory());
    }

    #[test]
    fn test_release_is_idempotent() {
        let mut device = small_device(1 << 20);
        let mut manager = DeviceBufferManager::new();

        manager
            .allocate(&mut device, BufferTag::Mask, 16, ElementKind::F32)
            .unwrap();
        manager.release(&mut device, BufferTag::Mask);
        manager.release(&mut device, BufferTag::Mask);

        assert!(!manager.is_allocated(BufferTag::Mask));
        assert_eq!(device.used_memory(), 0);
    }

    #[test]
    fn test_allocation_failure() {
        let mut device = small_device(64);
        let mut manager = DeviceBufferManager::new();

        let err = manager
            .allocate(&mut device, BufferTag::Image, 32, ElementKind::F64)
            .unwrap_err();
        assert!(matches!(
            err,
            IntegratorError::Allocation {
                buffer: "image",
                requested: 256,
                available: 64
            }
        ));
        assert!(!manager.is_allocated(BufferTag::Image));
    }

    #[test]
    fn test_stage_and_install_replace() {
        let mut device = small_device(1 << 20);
        let mut manager = DeviceBufferManager::new();
        manager
            .allocate(&mut device, BufferTag::Dark, 1, ElementKind::F32)
            .unwrap();

        let staged = manager
            .stage(&mut device, BufferTag::Dark, 8, ElementKind::F32)
            .unwrap();
        assert_eq!(manager.get(BufferTag::Dark).unwrap().len(), 1);

        manager.install(&mut device, staged);
        assert_eq!(manager.get(BufferTag::Dark).unwrap().len(), 8);
        assert_eq!(device.used_memory(), 32);
    }

    #[test]
    fn test_upload_download() {
        let mut device = small_device(1 << 20);
        let mut manager = DeviceBufferManager::new();
        manager
            .allocate(&mut device, BufferTag::Tth, 2, ElementKind::F32)
            .unwrap();

        manager.upload(&mut device, BufferTag::Tth, &[0.5, 1.5]).unwrap();
        let (values, _) = manager.download(&mut device, BufferTag::Tth).unwrap();
        assert_eq!(values, vec![0.5, 1.5]);

        assert!(matches!(
            manager.upload(&mut device, BufferTag::Tth, &[1.0]),
            Err(IntegratorError::SizeMismatch { .. })
        ));
    }
}
