//! Data structures for azimuthal integration.

pub mod config;
pub mod geometry;
pub mod result;

pub use config::{DeviceClass, IntegrationConfig, IntegratorConfig, Precision};
pub use geometry::AngularGeometry;
pub use result::{ExecutionResult, ExecutionTiming};
