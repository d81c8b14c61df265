//! Azimuthal integration of 2-D detector images on a compute device.
//!
//! Each pixel is corrected (dark, flat, solid angle, polarization, mask,
//! dummy value) and its intensity redistributed into angular bins:
//!
//! - Device-resident buffers sized once per configuration
//! - Fractional pixel splitting through a sparse lookup table, or a
//!   whole-pixel atomic histogram
//! - A status state machine guarding setup order
//! - FFI layer for Python (cffi) and other language bindings
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────┐
//! │     FFI Layer (azimrs.h)            │
//! │  C-compatible functions & types     │
//! └─────────────────────────────────────┘
//!                   │
//!                   ▼
//! ┌─────────────────────────────────────┐
//! │            Integrator               │
//! │  ┌────────────┐  ┌──────────────┐   │
//! │  │ Correction │  │   Angular    │   │
//! │  │  Pipeline  │  │   Binner     │   │
//! │  └────────────┘  └──────────────┘   │
//! │  ┌────────────┐  ┌──────────────┐   │
//! │  │   Status   │  │  Profiling   │   │
//! │  │  Tracker   │  │  Counters    │   │
//! │  └────────────┘  └──────────────┘   │
//! └─────────────────────────────────────┘
//!                   │
//!                   ▼
//! ┌─────────────────────────────────────┐
//! │  Device: buffers, kernels, context  │
//! │  (host backend on a rayon pool)     │
//! └─────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```no_run
//! use azimrs::{DeviceClass, Integrator, IntegratorConfig, Precision};
//!
//! let integrator = Integrator::new(IntegratorConfig::new(DeviceClass::Any, Precision::Double));
//! integrator.init(DeviceClass::Any, true, None, None)?;
//! integrator.configure(4, 2, None)?;
//! integrator.load_geometry(&[0.1, 0.1, 0.3, 0.3], &[0.05; 4], None, None)?;
//! integrator.set_mask(&[0u8, 0, 0, 1])?;
//!
//! let result = integrator.execute(&[10.0, 10.0, 20.0, 20.0])?;
//! println!("{}", result.normalized());
//! # Ok::<(), azimrs::IntegratorError>(())
//! ```
//!
//! # FFI Usage
//!
//! ```c
//! IntegratorHandle integrator;
//! azim_integrator_create(NULL, &integrator);
//! azim_integrator_init(integrator, CDeviceClass_ANY, true, -1, -1);
//! azim_integrator_configure(integrator, n_pixels, n_bins, 1);
//! azim_integrator_load_geometry(integrator, tth, half_width, n_pixels, NAN, NAN);
//!
//! CArrayView image = { pixels, n_pixels };
//! CMutArrayView sums = { weighted_sum, n_bins };
//! CMutArrayView counts = { weight_sum, n_bins };
//! CMutArrayView centers = { NULL, 0 };
//! azim_integrator_execute(integrator, image, centers, sums, counts);
//! azim_integrator_free(integrator);
//! ```

pub mod data;
pub mod device;
pub mod error;
pub mod ffi;
pub mod integrator;

// Re-export commonly used items
pub use data::{
    AngularGeometry, DeviceClass, ExecutionResult, ExecutionTiming, IntegrationConfig,
    IntegratorConfig, Precision,
};
pub use device::{
    DeviceContext, DeviceDescriptor, DeviceIds, DeviceProvider, HostPlatform, LutLayout,
};
pub use error::{IntegratorError, IntegratorResult};
pub use integrator::{BinningStrategy, CorrectionState, Integrator, ProfilingCounters, StatusFlags};

// Re-export FFI types for cbindgen
pub use ffi::integrator::*;
pub use ffi::types::*;
