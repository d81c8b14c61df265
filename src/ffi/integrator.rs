//! FFI functions for Integrator management.

use super::types::{
    borrow_slice, optional_bound, optional_id, status_of, AzimStatus, CArrayView, CDeviceClass,
    CMutArrayView, CStrategy,
};
use crate::data::{DeviceClass, IntegratorConfig, Precision};
use crate::error::IntegratorError;
use crate::integrator::Integrator;
use std::ffi::{c_char, CStr};

/// Opaque handle to an Integrator.
pub type IntegratorHandle = *mut Integrator;

/// Configuration for creating an integrator.
#[repr(C)]
#[derive(Debug, Clone)]
pub struct CIntegratorConfig {
    /// Requested device class.
    pub device_class: CDeviceClass,
    /// Default to double precision.
    pub use_fp64: bool,
    /// Platform id (negative = auto-select).
    pub platform_id: i32,
    /// Device id (negative = auto-select).
    pub device_id: i32,
    /// Redistribution strategy.
    pub strategy: CStrategy,
    /// Kernel source name or path (null = bundled).
    pub kernel: *const c_char,
}

impl Default for CIntegratorConfig {
    fn default() -> Self {
        Self {
            device_class: CDeviceClass::Any,
            use_fp64: false,
            platform_id: -1,
            device_id: -1,
            strategy: CStrategy::Auto,
            kernel: std::ptr::null(),
        }
    }
}

impl CIntegratorConfig {
    /// # Safety
    /// `kernel` must be null or a valid C string.
    unsafe fn to_settings(&self) -> Result<IntegratorConfig, AzimStatus> {
        let kernel = if self.kernel.is_null() {
            None
        } else {
            match CStr::from_ptr(self.kernel).to_str() {
                Ok(s) => Some(s.to_string()),
                Err(_) => return Err(AzimStatus::InvalidUtf8),
            }
        };

        Ok(IntegratorConfig {
            device_class: self.device_class.into(),
            precision: Precision::from_fp64(self.use_fp64),
            platform_id: optional_id(self.platform_id),
            device_id: optional_id(self.device_id),
            kernel,
            strategy: self.strategy.into_strategy(),
        })
    }
}

/// Borrow the integrator behind a handle.
unsafe fn integrator<'a>(handle: IntegratorHandle) -> Option<&'a Integrator> {
    handle.as_ref()
}

/// Create a new integrator over the host platform.
///
/// The integrator still needs `azim_integrator_init`.
///
/// # Safety
/// out_handle must be a valid pointer; config must be null or valid.
#[no_mangle]
pub unsafe extern "C" fn azim_integrator_create(
    config: *const CIntegratorConfig,
    out_handle: *mut IntegratorHandle,
) -> AzimStatus {
    if out_handle.is_null() {
        return AzimStatus::NullPointer;
    }

    let settings = if config.is_null() {
        IntegratorConfig::default()
    } else {
        match (*config).to_settings() {
            Ok(settings) => settings,
            Err(status) => return status,
        }
    };

    *out_handle = Box::into_raw(Box::new(Integrator::new(settings)));
    AzimStatus::Ok
}

/// Free an integrator handle, releasing its device.
///
/// # Safety
/// Handle must be valid or null.
#[no_mangle]
pub unsafe extern "C" fn azim_integrator_free(handle: IntegratorHandle) {
    if !handle.is_null() {
        let integrator = Box::from_raw(handle);
        integrator.clean(false);
    }
}

/// Select a device and create its context.
///
/// Negative ids select automatically.
///
/// # Safety
/// Handle must be valid.
#[no_mangle]
pub unsafe extern "C" fn azim_integrator_init(
    handle: IntegratorHandle,
    device_class: CDeviceClass,
    use_fp64: bool,
    platform_id: i32,
    device_id: i32,
) -> AzimStatus {
    let Some(integrator) = integrator(handle) else {
        return AzimStatus::NullPointer;
    };
    status_of(integrator.init(
        DeviceClass::from(device_class),
        use_fp64,
        optional_id(platform_id),
        optional_id(device_id),
    ))
}

/// Size the integrator and build its kernels.
///
/// `use_fp64`: 0 = single, 1 = double, negative = integrator default.
///
/// # Safety
/// Handle must be valid.
#[no_mangle]
pub unsafe extern "C" fn azim_integrator_configure(
    handle: IntegratorHandle,
    n_pixels: usize,
    n_bins: usize,
    use_fp64: i32,
) -> AzimStatus {
    let Some(integrator) = integrator(handle) else {
        return AzimStatus::NullPointer;
    };
    let use_fp64 = (use_fp64 >= 0).then_some(use_fp64 > 0);
    status_of(integrator.configure(n_pixels, n_bins, use_fp64))
}

/// Load per-pixel angles.
///
/// Pass NaN for `lower`/`upper` to use the data extent.
///
/// # Safety
/// Handle must be valid; both arrays must have `len` elements.
#[no_mangle]
pub unsafe extern "C" fn azim_integrator_load_geometry(
    handle: IntegratorHandle,
    tth: *const f64,
    half_width: *const f64,
    len: usize,
    lower: f64,
    upper: f64,
) -> AzimStatus {
    let (Some(integrator), Some(tth), Some(half_width)) = (
        integrator(handle),
        borrow_slice(tth, len),
        borrow_slice(half_width, len),
    ) else {
        return AzimStatus::NullPointer;
    };
    status_of(integrator.load_geometry(
        tth,
        half_width,
        optional_bound(lower),
        optional_bound(upper),
    ))
}

/// Multiply by a per-pixel solid-angle factor.
///
/// # Safety
/// Handle must be valid; data must have `len` elements.
#[no_mangle]
pub unsafe extern "C" fn azim_integrator_set_solid_angle(
    handle: IntegratorHandle,
    data: *const f64,
    len: usize,
) -> AzimStatus {
    let (Some(integrator), Some(data)) = (integrator(handle), borrow_slice(data, len)) else {
        return AzimStatus::NullPointer;
    };
    status_of(integrator.set_solid_angle(data))
}

/// # Safety
/// Handle must be valid.
#[no_mangle]
pub unsafe extern "C" fn azim_integrator_unset_solid_angle(handle: IntegratorHandle) -> AzimStatus {
    let Some(integrator) = integrator(handle) else {
        return AzimStatus::NullPointer;
    };
    status_of(integrator.unset_solid_angle())
}

/// Subtract a dark-current image.
///
/// # Safety
/// Handle must be valid; data must have `len` elements.
#[no_mangle]
pub unsafe extern "C" fn azim_integrator_set_dark(
    handle: IntegratorHandle,
    data: *const f64,
    len: usize,
) -> AzimStatus {
    let (Some(integrator), Some(data)) = (integrator(handle), borrow_slice(data, len)) else {
        return AzimStatus::NullPointer;
    };
    status_of(integrator.set_dark(data))
}

/// # Safety
/// Handle must be valid.
#[no_mangle]
pub unsafe extern "C" fn azim_integrator_unset_dark(handle: IntegratorHandle) -> AzimStatus {
    let Some(integrator) = integrator(handle) else {
        return AzimStatus::NullPointer;
    };
    status_of(integrator.unset_dark())
}

/// Divide by a flat-field image.
///
/// # Safety
/// Handle must be valid; data must have `len` elements.
#[no_mangle]
pub unsafe extern "C" fn azim_integrator_set_flat(
    handle: IntegratorHandle,
    data: *const f64,
    len: usize,
) -> AzimStatus {
    let (Some(integrator), Some(data)) = (integrator(handle), borrow_slice(data, len)) else {
        return AzimStatus::NullPointer;
    };
    status_of(integrator.set_flat(data))
}

/// # Safety
/// Handle must be valid.
#[no_mangle]
pub unsafe extern "C" fn azim_integrator_unset_flat(handle: IntegratorHandle) -> AzimStatus {
    let Some(integrator) = integrator(handle) else {
        return AzimStatus::NullPointer;
    };
    status_of(integrator.unset_flat())
}

/// Divide by a per-pixel polarization factor.
///
/// # Safety
/// Handle must be valid; data must have `len` elements.
#[no_mangle]
pub unsafe extern "C" fn azim_integrator_set_polarization(
    handle: IntegratorHandle,
    data: *const f64,
    len: usize,
) -> AzimStatus {
    let (Some(integrator), Some(data)) = (integrator(handle), borrow_slice(data, len)) else {
        return AzimStatus::NullPointer;
    };
    status_of(integrator.set_polarization(data))
}

/// # Safety
/// Handle must be valid.
#[no_mangle]
pub unsafe extern "C" fn azim_integrator_unset_polarization(
    handle: IntegratorHandle,
) -> AzimStatus {
    let Some(integrator) = integrator(handle) else {
        return AzimStatus::NullPointer;
    };
    status_of(integrator.unset_polarization())
}

/// Exclude every pixel whose mask entry is non-zero.
///
/// # Safety
/// Handle must be valid; mask must have `len` elements.
#[no_mangle]
pub unsafe extern "C" fn azim_integrator_set_mask(
    handle: IntegratorHandle,
    mask: *const i8,
    len: usize,
) -> AzimStatus {
    let (Some(integrator), Some(mask)) = (integrator(handle), borrow_slice(mask, len)) else {
        return AzimStatus::NullPointer;
    };
    status_of(integrator.set_mask(mask))
}

/// # Safety
/// Handle must be valid.
#[no_mangle]
pub unsafe extern "C" fn azim_integrator_unset_mask(handle: IntegratorHandle) -> AzimStatus {
    let Some(integrator) = integrator(handle) else {
        return AzimStatus::NullPointer;
    };
    status_of(integrator.unset_mask())
}

/// Exclude pixels whose raw value is within `tolerance` of `value`.
///
/// # Safety
/// Handle must be valid.
#[no_mangle]
pub unsafe extern "C" fn azim_integrator_set_dummy_value(
    handle: IntegratorHandle,
    value: f64,
    tolerance: f64,
) -> AzimStatus {
    let Some(integrator) = integrator(handle) else {
        return AzimStatus::NullPointer;
    };
    status_of(integrator.set_dummy_value(value, tolerance))
}

/// # Safety
/// Handle must be valid.
#[no_mangle]
pub unsafe extern "C" fn azim_integrator_unset_dummy_value(handle: IntegratorHandle) -> AzimStatus {
    let Some(integrator) = integrator(handle) else {
        return AzimStatus::NullPointer;
    };
    status_of(integrator.unset_dummy_value())
}

/// Bin over `[lower, upper)` instead of the data extent.
///
/// # Safety
/// Handle must be valid.
#[no_mangle]
pub unsafe extern "C" fn azim_integrator_set_range(
    handle: IntegratorHandle,
    lower: f64,
    upper: f64,
) -> AzimStatus {
    let Some(integrator) = integrator(handle) else {
        return AzimStatus::NullPointer;
    };
    status_of(integrator.set_range(lower, upper))
}

/// # Safety
/// Handle must be valid.
#[no_mangle]
pub unsafe extern "C" fn azim_integrator_unset_range(handle: IntegratorHandle) -> AzimStatus {
    let Some(integrator) = integrator(handle) else {
        return AzimStatus::NullPointer;
    };
    status_of(integrator.unset_range())
}

/// Integrate one flattened image into caller-provided arrays.
///
/// Each output must hold exactly `n_bins` values; a null output is
/// skipped.
///
/// # Safety
/// Handle must be valid; every view must describe valid memory.
#[no_mangle]
pub unsafe extern "C" fn azim_integrator_execute(
    handle: IntegratorHandle,
    image: CArrayView,
    out_bin_centers: CMutArrayView,
    out_weighted_sum: CMutArrayView,
    out_weight_sum: CMutArrayView,
) -> AzimStatus {
    let (Some(integrator), Some(image)) = (integrator(handle), image.as_slice()) else {
        return AzimStatus::NullPointer;
    };
    let Some(config) = integrator.configuration() else {
        return AzimStatus::NotConfigured;
    };
    let outputs = [
        ("bin_centers", out_bin_centers),
        ("weighted_sum", out_weighted_sum),
        ("weight_sum", out_weight_sum),
    ];
    for (name, view) in &outputs {
        if !view.data.is_null() && view.len != config.n_bins {
            return status_of::<()>(Err(IntegratorError::SizeMismatch {
                buffer: *name,
                expected: config.n_bins,
                actual: view.len,
            }));
        }
    }

    let result = match integrator.execute(image) {
        Ok(result) => result,
        Err(err) => return status_of::<()>(Err(err)),
    };
    for ((_, view), values) in outputs
        .iter()
        .zip([&result.bin_centers, &result.weighted_sum, &result.weight_sum])
    {
        if let Some(out) = view.as_mut_slice() {
            for (dst, &src) in out.iter_mut().zip(values.iter()) {
                *dst = src;
            }
        }
    }
    AzimStatus::Ok
}

/// Release device resources; keep the context when `preserve_context`.
///
/// # Safety
/// Handle must be valid.
#[no_mangle]
pub unsafe extern "C" fn azim_integrator_clean(
    handle: IntegratorHandle,
    preserve_context: bool,
) -> AzimStatus {
    let Some(integrator) = integrator(handle) else {
        return AzimStatus::NullPointer;
    };
    integrator.clean(preserve_context);
    AzimStatus::Ok
}

/// Status bits (bit 0 context ready ... bit 8 dummy); 0 for a null handle.
///
/// # Safety
/// Handle must be null or valid.
#[no_mangle]
pub unsafe extern "C" fn azim_integrator_get_status(handle: IntegratorHandle) -> u32 {
    integrator(handle).map_or(0, |integrator| integrator.status().bits())
}

/// Number of successful executions.
///
/// # Safety
/// Handle must be null or valid.
#[no_mangle]
pub unsafe extern "C" fn azim_integrator_exec_count(handle: IntegratorHandle) -> u64 {
    integrator(handle).map_or(0, Integrator::exec_count)
}

/// Accumulated kernel time in milliseconds.
///
/// # Safety
/// Handle must be null or valid.
#[no_mangle]
pub unsafe extern "C" fn azim_integrator_kernel_time_ms(handle: IntegratorHandle) -> f64 {
    integrator(handle).map_or(0.0, |integrator| integrator.profiling().kernel_time_ms())
}

/// Accumulated transfer time in milliseconds.
///
/// # Safety
/// Handle must be null or valid.
#[no_mangle]
pub unsafe extern "C" fn azim_integrator_memcpy_time_ms(handle: IntegratorHandle) -> f64 {
    integrator(handle).map_or(0.0, |integrator| integrator.profiling().memcpy_time_ms())
}

/// Zero both timers; the execution count is kept.
///
/// # Safety
/// Handle must be valid.
#[no_mangle]
pub unsafe extern "C" fn azim_integrator_reset_time(handle: IntegratorHandle) -> AzimStatus {
    let Some(integrator) = integrator(handle) else {
        return AzimStatus::NullPointer;
    };
    integrator.reset_time();
    AzimStatus::Ok
}
