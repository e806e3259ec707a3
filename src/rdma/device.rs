//! Device enumeration.

use std::ops::Index;
use std::sync::Arc;

use crate::error::Result;
use crate::fabric::{DeviceInfo, Fabric};

/// A snapshot of the RDMA devices visible to this process.
pub struct DeviceList {
    devices: Vec<DeviceInfo>,
}

impl DeviceList {
    /// Enumerate the devices the given fabric can see.
    pub fn new(fabric: &Arc<dyn Fabric>) -> Result<Self> {
        let devices = fabric.devices()?;
        Ok(Self { devices })
    }

    /// Get the number of devices in the list.
    #[inline]
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// Check if the device list is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Find a device by name.
    #[inline]
    pub fn find(&self, name: &str) -> Option<&DeviceInfo> {
        self.devices.iter().find(|dev| dev.name == name)
    }

    /// Iterate over the enumerated devices.
    #[inline]
    pub fn iter(&self) -> impl Iterator<Item = &DeviceInfo> {
        self.devices.iter()
    }
}

impl Index<usize> for DeviceList {
    type Output = DeviceInfo;

    fn index(&self, idx: usize) -> &Self::Output {
        &self.devices[idx]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fabric::sim::SimNet;

    #[test]
    fn enumerates_sim_devices() {
        let net = SimNet::new();
        let fabric: Arc<dyn Fabric> = net.add_fabric();

        let list = DeviceList::new(&fabric).unwrap();
        assert!(!list.is_empty());
        assert!(list.find("mlx4_0").is_some());
        assert!(list.find("bogus0").is_none());
        assert_ne!(list[0].guid, 0);
    }
}
