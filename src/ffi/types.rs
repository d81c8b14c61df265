//! C-compatible type definitions for FFI.

use crate::data::DeviceClass;
use crate::device::LutLayout;
use crate::error::{IntegratorError, IntegratorResult};
use crate::integrator::BinningStrategy;
use tracing::warn;

/// Result status codes for FFI functions.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AzimStatus {
    /// Operation succeeded.
    Ok = 0,
    /// Null pointer was passed.
    NullPointer = 1,
    /// Invalid argument.
    InvalidArgument = 2,
    /// Array length mismatch.
    SizeMismatch = 3,
    /// A setup step has not run.
    NotConfigured = 4,
    /// Call out of order or unsupported by the device.
    ConfigurationError = 5,
    /// Device memory exhausted.
    AllocationError = 6,
    /// No device matches the request.
    NoSuitableDevice = 7,
    /// Kernel source could not be found.
    KernelSourceNotFound = 8,
    /// A kernel failed to run.
    KernelExecution = 9,
    /// Operation timed out.
    Timeout = 10,
    /// Invalid UTF-8 string.
    InvalidUtf8 = 11,
}

impl From<&IntegratorError> for AzimStatus {
    fn from(err: &IntegratorError) -> Self {
        match err {
            IntegratorError::NotConfigured { .. } => AzimStatus::NotConfigured,
            IntegratorError::Configuration { .. } => AzimStatus::ConfigurationError,
            IntegratorError::SizeMismatch { .. } => AzimStatus::SizeMismatch,
            IntegratorError::Allocation { .. } => AzimStatus::AllocationError,
            IntegratorError::NoSuitableDevice { .. } => AzimStatus::NoSuitableDevice,
            IntegratorError::KernelSourceNotFound { .. } => AzimStatus::KernelSourceNotFound,
            IntegratorError::KernelExecution { .. } => AzimStatus::KernelExecution,
            IntegratorError::InvalidArgument { .. } => AzimStatus::InvalidArgument,
            IntegratorError::Timeout => AzimStatus::Timeout,
        }
    }
}

/// Collapse a result into a status code, logging the error.
pub(crate) fn status_of<T>(result: IntegratorResult<T>) -> AzimStatus {
    match result {
        Ok(_) => AzimStatus::Ok,
        Err(err) => {
            warn!(error = %err, "integrator call failed");
            AzimStatus::from(&err)
        }
    }
}

/// C-compatible array view (pointer + length).
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct CArrayView {
    pub data: *const f64,
    pub len: usize,
}

impl CArrayView {
    /// # Safety
    /// `data` must point to `len` readable values or be null.
    pub(crate) unsafe fn as_slice<'a>(&self) -> Option<&'a [f64]> {
        borrow_slice(self.data, self.len)
    }
}

/// C-compatible mutable array view.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct CMutArrayView {
    pub data: *mut f64,
    pub len: usize,
}

impl CMutArrayView {
    /// # Safety
    /// `data` must point to `len` writable values or be null.
    pub(crate) unsafe fn as_mut_slice<'a>(&self) -> Option<&'a mut [f64]> {
        if self.data.is_null() {
            return None;
        }
        Some(std::slice::from_raw_parts_mut(self.data, self.len))
    }
}

/// Borrow a caller array; `None` for a null pointer.
///
/// # Safety
/// A non-null `data` must point to `len` readable values.
pub(crate) unsafe fn borrow_slice<'a, T>(data: *const T, len: usize) -> Option<&'a [T]> {
    if data.is_null() {
        return None;
    }
    Some(std::slice::from_raw_parts(data, len))
}

/// Device class selector.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CDeviceClass {
    Any = 0,
    Cpu = 1,
    Gpu = 2,
    Accelerator = 3,
}

impl From<CDeviceClass> for DeviceClass {
    fn from(c: CDeviceClass) -> Self {
        match c {
            CDeviceClass::Any => DeviceClass::Any,
            CDeviceClass::Cpu => DeviceClass::Cpu,
            CDeviceClass::Gpu => DeviceClass::Gpu,
            CDeviceClass::Accelerator => DeviceClass::Accelerator,
        }
    }
}

/// Redistribution strategy selector.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CStrategy {
    /// Chosen from the device at configure time.
    Auto = 0,
    LutPixelMajor = 1,
    LutBinMajor = 2,
    DirectHistogram = 3,
}

impl CStrategy {
    pub fn into_strategy(self) -> Option<BinningStrategy> {
        match self {
            CStrategy::Auto => None,
            CStrategy::LutPixelMajor => Some(BinningStrategy::LookupTable(LutLayout::PixelMajor)),
            CStrategy::LutBinMajor => Some(BinningStrategy::LookupTable(LutLayout::BinMajor)),
            CStrategy::DirectHistogram => Some(BinningStrategy::DirectHistogram),
        }
    }
}

/// Optional id from C: negative means unset.
#[inline]
pub(crate) fn optional_id(id: i32) -> Option<usize> {
    usize::try_from(id).ok()
}

/// Optional bound from C: NaN means unset.
#[inline]
pub(crate) fn optional_bound(value: f64) -> Option<f64> {
    if value.is_nan() {
        None
    } else {
        Some(value)
    }
}
