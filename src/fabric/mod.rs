//! The hardware seam.
//!
//! Everything the core needs from an RDMA device is expressed as the
//! [`Fabric`] trait so that the queue pair state machine and the connection
//! protocol can be exercised without hardware. Two backends are provided:
//!
//! - [`sim`]: an in-process software fabric. It assigns LIDs, queue pair
//!   numbers and memory keys, enforces queue depths and the queue pair state
//!   machine, and moves real bytes for RDMA reads/writes and two-sided
//!   sends. All tests run against it.
//! - [`verbs`] (cargo feature `hw-verbs`): the real thing, via `libibverbs`.

use std::fmt;
use std::io;

use crate::rdma::cq::Wc;
use crate::rdma::mr::Permission;
use crate::rdma::qp::{QpCaps, QpTransition};
use crate::rdma::types::{LKey, PortNum, Qpn, RKey};
use crate::rdma::wr::{RecvWr, SendWr};

pub mod sim;
#[cfg(feature = "hw-verbs")]
pub mod verbs;

macro_rules! fabric_handle {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub struct $name(pub(crate) u64);
    };
}

fabric_handle!(
    /// Opaque handle to an open device context.
    DeviceHandle
);
fabric_handle!(
    /// Opaque handle to a protection domain.
    PdHandle
);
fabric_handle!(
    /// Opaque handle to a completion queue.
    CqHandle
);
fabric_handle!(
    /// Opaque handle to a queue pair.
    QpHandle
);
fabric_handle!(
    /// Opaque handle to a registered memory region.
    MrHandle
);

/// One enumerated RDMA device, prior to opening it.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    /// Device name, e.g. `mlx4_0`.
    pub name: String,
    /// Globally unique hardware identifier.
    pub guid: u64,
}

/// Capability attributes of an opened device.
#[derive(Debug, Clone, Copy)]
pub struct DeviceAttr {
    /// Maximum outstanding work requests per queue.
    pub max_qp_wr: u32,
    /// Maximum scatter/gather elements per work request.
    pub max_sge: u32,
    /// Maximum completion queue depth.
    pub max_cqe: u32,
    /// Maximum outstanding RDMA reads/atomics per queue pair.
    pub max_qp_rd_atom: u8,
    /// Number of physical ports.
    pub phys_port_cnt: u8,
}

/// Link state of a physical port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortState {
    /// Link down.
    Down,
    /// Link initializing.
    Init,
    /// Link armed.
    Armed,
    /// Link up and usable.
    Active,
}

/// Attributes of one physical port.
#[derive(Debug, Clone, Copy)]
pub struct PortAttr {
    /// Link state.
    pub state: PortState,
    /// Link-layer address of this port on the fabric.
    pub lid: u16,
    /// Active path MTU, encoded as in `ibv_mtu` (3 = 1024 bytes).
    pub active_mtu: u32,
}

/// Keys and handle issued for a registered memory region.
#[derive(Debug, Clone, Copy)]
pub struct MrKeys {
    /// Region handle, for deregistration.
    pub handle: MrHandle,
    /// Local access key.
    pub lkey: LKey,
    /// Remote access key.
    pub rkey: RKey,
}

/// The set of verbs the core needs from an RDMA provider.
///
/// All methods are non-blocking. Fallible methods report driver-level
/// failures as [`io::Error`]; the wrappers in [`crate::rdma`] translate them
/// into the crate error taxonomy. Destructors are infallible by contract:
/// backends log and swallow driver errors on teardown.
pub trait Fabric: fmt::Debug + Send + Sync {
    /// Enumerate locally visible RDMA devices.
    fn devices(&self) -> io::Result<Vec<DeviceInfo>>;

    /// Open the device with the given name and query its attributes.
    fn open_device(&self, name: &str) -> io::Result<(DeviceHandle, DeviceAttr)>;

    /// Close an open device context.
    fn close_device(&self, dev: DeviceHandle);

    /// Query the attributes of one port of an open device.
    ///
    /// Fails if the port number is out of range. Port numbers start at 1.
    fn query_port(&self, dev: DeviceHandle, port: PortNum) -> io::Result<PortAttr>;

    /// Allocate a protection domain.
    fn alloc_pd(&self, dev: DeviceHandle) -> io::Result<PdHandle>;

    /// Deallocate a protection domain.
    fn dealloc_pd(&self, pd: PdHandle);

    /// Create a completion queue with at least `depth` entries.
    fn create_cq(&self, dev: DeviceHandle, depth: u32) -> io::Result<CqHandle>;

    /// Destroy a completion queue.
    fn destroy_cq(&self, cq: CqHandle);

    /// Create a reliable-connection queue pair bound to the given protection
    /// domain and completion queues. Returns the handle and the
    /// hardware-assigned queue pair number.
    fn create_qp(
        &self,
        pd: PdHandle,
        send_cq: CqHandle,
        recv_cq: CqHandle,
        caps: &QpCaps,
    ) -> io::Result<(QpHandle, Qpn)>;

    /// Destroy a queue pair.
    fn destroy_qp(&self, qp: QpHandle);

    /// Apply one state machine transition to a queue pair.
    fn modify_qp(&self, qp: QpHandle, transition: &QpTransition) -> io::Result<()>;

    /// Register (pin) `len` bytes at `addr` with the protection domain.
    fn reg_mr(&self, pd: PdHandle, addr: usize, len: usize, perm: Permission)
        -> io::Result<MrKeys>;

    /// Deregister a memory region.
    fn dereg_mr(&self, mr: MrHandle);

    /// Enqueue a send-type work request. Non-blocking; completion is
    /// reported through the queue pair's send completion queue.
    fn post_send(&self, qp: QpHandle, wr: &SendWr) -> io::Result<()>;

    /// Enqueue a receive work request.
    fn post_recv(&self, qp: QpHandle, wr: &RecvWr) -> io::Result<()>;

    /// Drain up to `max` completions. Never blocks; an empty vector means
    /// nothing was ready.
    fn poll_cq(&self, cq: CqHandle, max: usize) -> io::Result<Vec<Wc>>;
}
