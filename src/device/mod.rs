//! Device layer: memory, kernels and the backend contract.

pub mod buffer;
pub mod context;
pub mod host;
pub mod kernels;
pub mod select;
pub mod source;

pub use buffer::{BufferSlots, BufferTag, DeviceBuffer, DeviceBufferManager, ElementKind};
pub use context::{DeviceContext, DeviceDescriptor, DeviceIds, KernelLaunch, LutLayout, Program};
pub use host::HostDevice;
pub use select::{DeviceProvider, HostPlatform};
pub use source::{resolve_kernel, KernelSource, DEFAULT_KERNEL};
