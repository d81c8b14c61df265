//! Azimuthal integrator and its components.

pub mod binner;
pub mod correction;
pub mod engine;
pub mod profiling;
pub mod status;

pub use binner::{build_lut, AngularBinner, BinningStrategy, SparseLut};
pub use correction::{Correction, CorrectionPipeline, CorrectionState};
pub use engine::Integrator;
pub use profiling::ProfilingCounters;
pub use status::{StatusFlags, StatusTracker};
