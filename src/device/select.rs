//! Device selection collaborator.

use super::context::{DeviceContext, DeviceDescriptor, DeviceIds};
use super::host::HostDevice;
use crate::data::DeviceClass;
use crate::error::{IntegratorError, IntegratorResult};
use tracing::debug;

/// Selects a device and opens contexts on it.
pub trait DeviceProvider: Send + Sync {
    /// Pick a device.
    ///
    /// Explicit ids, when both are given, bypass the class and precision
    /// filters but must name an existing device.
    fn select(
        &self,
        class: DeviceClass,
        requires_fp64: bool,
        platform: Option<usize>,
        device: Option<usize>,
    ) -> IntegratorResult<DeviceIds>;

    /// Open a context with one command queue on the device at `ids`.
    fn open(&self, ids: DeviceIds) -> IntegratorResult<Box<dyn DeviceContext>>;
}

/// Platforms of host devices, indexed `[platform][device]`.
#[derive(Debug, Clone)]
pub struct HostPlatform {
    platforms: Vec<Vec<DeviceDescriptor>>,
}

impl HostPlatform {
    pub fn new(platforms: Vec<Vec<DeviceDescriptor>>) -> Self {
        Self { platforms }
    }

    /// One platform with one device.
    pub fn single(descriptor: DeviceDescriptor) -> Self {
        Self::new(vec![vec![descriptor]])
    }

    fn descriptor(&self, ids: DeviceIds) -> Option<&DeviceDescriptor> {
        self.platforms.get(ids.platform)?.get(ids.device)
    }

    pub fn platforms(&self) -> &[Vec<DeviceDescriptor>] {
        &self.platforms
    }
}

impl Default for HostPlatform {
    fn default() -> Self {
        Self::single(DeviceDescriptor::default())
    }
}

impl DeviceProvider for HostPlatform {
    fn select(
        &self,
        class: DeviceClass,
        requires_fp64: bool,
        platform: Option<usize>,
        device: Option<usize>,
    ) -> IntegratorResult<DeviceIds> {
        let not_found = || IntegratorError::NoSuitableDevice {
            class: class.name(),
            fp64: requires_fp64,
        };

        if let (Some(platform), Some(device)) = (platform, device) {
            let ids = DeviceIds { platform, device };
            return self.descriptor(ids).map(|_| ids).ok_or_else(not_found);
        }

        self.platforms
            .iter()
            .enumerate()
            .filter(|(p, _)| platform.map_or(true, |wanted| wanted == *p))
            .flat_map(|(p, devices)| {
                devices
                    .iter()
                    .enumerate()
                    .map(move |(d, descriptor)| (DeviceIds { platform: p, device: d }, descriptor))
            })
            .find(|(_, descriptor)| {
                class.accepts(descriptor.class) && (!requires_fp64 || descriptor.supports_fp64)
            })
            .map(|(ids, descriptor)| {
                debug!(device = %descriptor.name, ?ids, "selected device");
                ids
            })
            .ok_or_else(not_found)
    }

    fn open(&self, ids: DeviceIds) -> IntegratorResult<Box<dyn DeviceContext>> {
        let descriptor = self
            .descriptor(ids)
            .cloned()
            .ok_or_else(|| IntegratorError::configuration(format!("no device at {ids:?}")))?;
        Ok(Box::new(HostDevice::open(descriptor, ids)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn platform() -> HostPlatform {
        HostPlatform::new(vec![
            vec![DeviceDescriptor {
                name: "cpu".to_string(),
                compute_units: 1,
                ..DeviceDescriptor::default()
            }],
            vec![DeviceDescriptor {
                name: "gpu-sp".to_string(),
                class: DeviceClass::Gpu,
                supports_fp64: false,
                compute_units: 1,
                ..DeviceDescriptor::default()
            }],
        ])
    }

    #[test]
    fn test_select_by_class() {
        let platform = platform();
        let ids = platform.select(DeviceClass::Gpu, false, None, None).unwrap();
        assert_eq!(ids, DeviceIds { platform: 1, device: 0 });

        let ids = platform.select(DeviceClass::Any, false, None, None).unwrap();
        assert_eq!(ids, DeviceIds { platform: 0, device: 0 });
    }

    #[test]
    fn test_select_requires_fp64() {
        let err = platform()
            .select(DeviceClass::Gpu, true, None, None)
            .unwrap_err();
        assert!(matches!(
            err,
            IntegratorError::NoSuitableDevice {
                class: "gpu",
                fp64: true
            }
        ));
    }

    #[test]
    fn test_explicit_ids() {
        let platform = platform();
        let ids = platform.select(DeviceClass::Cpu, true, Some(1), Some(0)).unwrap();
        assert_eq!(ids, DeviceIds { platform: 1, device: 0 });

        assert!(platform.select(DeviceClass::Cpu, false, Some(3), Some(0)).is_err());
    }

    #[test]
    fn test_open() {
        let platform = platform();
        let ctx = platform.open(DeviceIds { platform: 1, device: 0 }).unwrap();
        assert_eq!(ctx.descriptor().name, "gpu-sp");
        assert_eq!(ctx.ids(), DeviceIds { platform: 1, device: 0 });
    }
}
