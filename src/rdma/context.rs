//! Device context: the opened device plus the chosen port.

use std::sync::Arc;
use std::{fmt, io};

use log::debug;

use super::device::DeviceList;
use super::types::{Lid, PortNum};
use crate::error::{Error, Result};
use crate::fabric::{DeviceAttr, DeviceHandle, Fabric, PortAttr, PortState};

struct ContextInner {
    fabric: Arc<dyn Fabric>,
    dev: DeviceHandle,
    dev_name: String,
    guid: u64,
    dev_attr: DeviceAttr,
    port_num: PortNum,
    port_attr: PortAttr,
}

impl Drop for ContextInner {
    fn drop(&mut self) {
        self.fabric.close_device(self.dev);
    }
}

impl fmt::Debug for ContextInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("device", &self.dev_name)
            .field("port", &self.port_num)
            .field("lid", &self.port_attr.lid)
            .finish()
    }
}

/// Device context.
///
/// This type is a reference-counted handle to the opened device; clones
/// share the underlying device context, which stays open until the last
/// clone is dropped. A context is bound to exactly one port; this crate
/// supports a single device/port pair per process.
#[derive(Debug, Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

impl Context {
    /// Open the named device and capture its attributes and those of the
    /// given port.
    ///
    /// Performs no network interaction. Fails with [`Error::NoSuchDevice`]
    /// if the name matches no enumerated device, and [`Error::NoSuchPort`]
    /// if the port index is out of range or the port is not active.
    pub fn open(fabric: Arc<dyn Fabric>, dev_name: &str, port_num: PortNum) -> Result<Self> {
        let list = DeviceList::new(&fabric)?;
        let info = list
            .find(dev_name)
            .ok_or_else(|| Error::NoSuchDevice(dev_name.to_owned()))?;
        let guid = info.guid;

        let (dev, dev_attr) = fabric.open_device(dev_name)?;

        if port_num == 0 || port_num > dev_attr.phys_port_cnt {
            fabric.close_device(dev);
            return Err(Error::NoSuchPort {
                device: dev_name.to_owned(),
                port: port_num,
            });
        }
        let port_attr = match fabric.query_port(dev, port_num) {
            Ok(attr) => attr,
            Err(e) => {
                fabric.close_device(dev);
                return Err(Error::Io(e));
            }
        };
        if port_attr.state != PortState::Active {
            fabric.close_device(dev);
            return Err(Error::NoSuchPort {
                device: dev_name.to_owned(),
                port: port_num,
            });
        }

        debug!(
            "opened device {} (guid {:#x}), port {} with lid {:#x}",
            dev_name, guid, port_num, port_attr.lid
        );
        Ok(Context {
            inner: Arc::new(ContextInner {
                fabric,
                dev,
                dev_name: dev_name.to_owned(),
                guid,
                dev_attr,
                port_num,
                port_attr,
            }),
        })
    }

    /// Get the fabric this context was opened on.
    #[inline]
    pub(crate) fn fabric(&self) -> &Arc<dyn Fabric> {
        &self.inner.fabric
    }

    /// Get the underlying device handle.
    #[inline]
    pub(crate) fn handle(&self) -> DeviceHandle {
        self.inner.dev
    }

    /// Get the name of the opened device.
    #[inline]
    pub fn dev_name(&self) -> &str {
        &self.inner.dev_name
    }

    /// Get the globally unique identifier of the opened device.
    #[inline]
    pub fn guid(&self) -> u64 {
        self.inner.guid
    }

    /// Get the capability attributes of the opened device.
    #[inline]
    pub fn attr(&self) -> &DeviceAttr {
        &self.inner.dev_attr
    }

    /// Get the LID of the chosen port.
    #[inline]
    pub fn lid(&self) -> Lid {
        self.inner.port_attr.lid
    }

    /// Get the port number passed by the user when opening this context.
    #[inline]
    pub fn port_num(&self) -> PortNum {
        self.inner.port_num
    }

    /// Get the active path MTU of the chosen port (`ibv_mtu` encoding).
    #[inline]
    pub fn active_mtu(&self) -> u32 {
        self.inner.port_attr.active_mtu
    }
}

/// Map a fabric-level allocation failure into [`Error::ResourceExhausted`].
pub(crate) fn exhausted(what: &'static str) -> impl FnOnce(io::Error) -> Error {
    move |source| Error::ResourceExhausted { what, source }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fabric::sim::SimNet;

    #[test]
    fn open_by_name() {
        let net = SimNet::new();
        let fabric: Arc<dyn Fabric> = net.add_fabric();

        let ctx = Context::open(fabric, "mlx4_0", 1).unwrap();
        assert_eq!(ctx.dev_name(), "mlx4_0");
        assert_ne!(ctx.lid(), 0);
        assert_eq!(ctx.port_num(), 1);
    }

    #[test]
    fn unknown_device_is_rejected() {
        let net = SimNet::new();
        let fabric: Arc<dyn Fabric> = net.add_fabric();

        let err = Context::open(fabric, "mlx9_9", 1).unwrap_err();
        assert!(matches!(err, Error::NoSuchDevice(name) if name == "mlx9_9"));
    }

    #[test]
    fn bad_ports_are_rejected() {
        let net = SimNet::new();
        let fabric: Arc<dyn Fabric> = net.add_fabric();

        // Port 0 and out-of-range ports do not exist; port 2 exists but is
        // down in the simulated fabric.
        for port in [0, 2, 7] {
            let err = Context::open(fabric.clone(), "mlx4_0", port).unwrap_err();
            assert!(matches!(err, Error::NoSuchPort { port: p, .. } if p == port));
        }
    }
}
