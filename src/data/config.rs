//! Integration and integrator configuration.

use crate::error::{IntegratorError, IntegratorResult};
use crate::integrator::BinningStrategy;
use std::fmt;
use std::str::FromStr;

/// Floating-point precision used on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Precision {
    /// 32-bit floats.
    #[default]
    Single,
    /// 64-bit floats.
    Double,
}

impl Precision {
    pub fn from_fp64(use_fp64: bool) -> Self {
        if use_fp64 {
            Precision::Double
        } else {
            Precision::Single
        }
    }

    /// Size in bytes of one device element.
    #[inline]
    pub fn element_size(self) -> usize {
        match self {
            Precision::Single => std::mem::size_of::<f32>(),
            Precision::Double => std::mem::size_of::<f64>(),
        }
    }

    /// Smallest relative step representable at this precision.
    #[inline]
    pub fn epsilon(self) -> f64 {
        match self {
            Precision::Single => f32::EPSILON as f64,
            Precision::Double => f64::EPSILON,
        }
    }

    #[inline]
    pub fn is_double(self) -> bool {
        self == Precision::Double
    }
}

/// Class of compute device requested from the selection collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DeviceClass {
    Cpu,
    #[default]
    Gpu,
    Accelerator,
    /// Any class is acceptable.
    Any,
}

impl DeviceClass {
    pub fn name(&self) -> &'static str {
        match self {
            DeviceClass::Cpu => "cpu",
            DeviceClass::Gpu => "gpu",
            DeviceClass::Accelerator => "accelerator",
            DeviceClass::Any => "any",
        }
    }

    /// Whether a device of class `actual` satisfies a request for `self`.
    pub fn accepts(&self, actual: DeviceClass) -> bool {
        *self == DeviceClass::Any || *self == actual
    }

    /// Wide devices run many lanes per accumulation step.
    pub fn is_wide(&self) -> bool {
        matches!(self, DeviceClass::Gpu | DeviceClass::Accelerator)
    }
}

impl fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DeviceClass {
    type Err = IntegratorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cpu" => Ok(DeviceClass::Cpu),
            "gpu" => Ok(DeviceClass::Gpu),
            "acc" | "accelerator" => Ok(DeviceClass::Accelerator),
            "any" | "all" | "def" => Ok(DeviceClass::Any),
            other => Err(IntegratorError::invalid_argument(format!(
                "unknown device class '{other}'"
            ))),
        }
    }
}

/// Sizes of one integration problem.
///
/// Every device buffer size derives from this; it is fixed between two
/// calls to `configure`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntegrationConfig {
    /// Number of image elements.
    pub n_pixels: usize,
    /// Number of output bins.
    pub n_bins: usize,
    /// Device precision.
    pub precision: Precision,
}

impl IntegrationConfig {
    pub fn new(n_pixels: usize, n_bins: usize, precision: Precision) -> IntegratorResult<Self> {
        if n_pixels == 0 {
            return Err(IntegratorError::invalid_argument("n_pixels must be non-zero"));
        }
        if n_bins == 0 {
            return Err(IntegratorError::invalid_argument("n_bins must be non-zero"));
        }
        Ok(Self {
            n_pixels,
            n_bins,
            precision,
        })
    }
}

/// Configuration for creating an integrator.
#[derive(Clone, Debug, Default)]
pub struct IntegratorConfig {
    /// Requested device class.
    pub device_class: DeviceClass,
    /// Default precision; `configure` may override it.
    pub precision: Precision,
    /// Explicit platform id (both ids must be set to bypass selection).
    pub platform_id: Option<usize>,
    /// Explicit device id.
    pub device_id: Option<usize>,
    /// Kernel source name or path (None = bundled default).
    pub kernel: Option<String>,
    /// Redistribution strategy (None = chosen from the device).
    pub strategy: Option<BinningStrategy>,
}

impl IntegratorConfig {
    pub fn new(device_class: DeviceClass, precision: Precision) -> Self {
        Self {
            device_class,
            precision,
            ..Default::default()
        }
    }

    pub fn with_device(mut self, platform_id: usize, device_id: usize) -> Self {
        self.platform_id = Some(platform_id);
        self.device_id = Some(device_id);
        self
    }

    pub fn with_kernel(mut self, kernel: impl Into<String>) -> Self {
        self.kernel = Some(kernel.into());
        self
    }

    pub fn with_strategy(mut self, strategy: BinningStrategy) -> Self {
        self.strategy = Some(strategy);
        self
    }
}
