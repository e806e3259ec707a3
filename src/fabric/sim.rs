//! In-process software fabric.
//!
//! [`SimNet`] models one RDMA fabric; [`SimNet::add_fabric`] attaches one
//! simulated HCA to it and hands back the [`SimFabric`] a participant uses
//! as its [`Fabric`]. LIDs, queue pair numbers and memory keys are assigned
//! from shared counters, the queue pair state machine and queue depths are
//! enforced, and data-moving verbs copy real bytes between the registered
//! regions of the attached fabrics.
//!
//! All participants of a simulated job must live in the same OS process
//! (typically one thread each): remote addresses are dereferenced directly.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::io;
use std::sync::{Arc, Mutex};

use super::{CqHandle, DeviceAttr, DeviceHandle, DeviceInfo, Fabric, MrHandle, MrKeys, PdHandle,
            PortAttr, PortState, QpHandle};
use crate::rdma::cq::{Wc, WcOpcode, WcStatus};
use crate::rdma::mr::{MrRemote, Permission};
use crate::rdma::qp::{QpCaps, QpState, QpTransition};
use crate::rdma::types::{Lid, PortNum, Qpn};
use crate::rdma::wr::{RecvWr, SendOp, SendWr, Sge};

fn einval(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, msg.to_owned())
}

fn enomem() -> io::Error {
    io::Error::from_raw_os_error(libc::ENOMEM)
}

struct SimDevice {
    name: String,
    guid: u64,
    /// Port states, index 0 = port number 1.
    ports: Vec<PortState>,
}

struct SimCq {
    depth: u32,
    queue: VecDeque<Wc>,
}

struct SimQp {
    qpn: Qpn,
    /// Index of the device the owning protection domain was allocated on.
    dev: usize,
    send_cq: u64,
    recv_cq: u64,
    caps: QpCaps,
    state: QpState,
    /// Port bound at the `ResetToInit` transition, 0 before that.
    port: PortNum,
    access: Permission,
    dest: Option<(Lid, Qpn)>,
    recvs: VecDeque<RecvWr>,
    sq_inflight: u32,
}

struct SimMr {
    addr: usize,
    len: usize,
    lkey: u32,
    rkey: u32,
    perm: Permission,
}

#[derive(Default)]
struct FabricState {
    devices: Vec<SimDevice>,
    lid: Lid,
    open: HashMap<u64, usize>,
    /// Protection domain handle to the index of its device.
    pds: HashMap<u64, usize>,
    cqs: HashMap<u64, SimCq>,
    qps: HashMap<u64, SimQp>,
    mrs: HashMap<u64, SimMr>,
}

struct NetInner {
    next_lid: Lid,
    next_guid: u64,
    next_qpn: Qpn,
    next_key: u32,
    next_handle: u64,
    fabrics: Vec<FabricState>,
}

impl NetInner {
    fn handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    fn fabric_by_lid(&self, lid: Lid) -> Option<usize> {
        self.fabrics.iter().position(|f| f.lid == lid)
    }

    fn qp_key_by_qpn(&self, fab: usize, qpn: Qpn) -> Option<u64> {
        self.fabrics[fab]
            .qps
            .iter()
            .find(|(_, qp)| qp.qpn == qpn)
            .map(|(k, _)| *k)
    }

    /// Check one local scatter/gather element against the fabric's
    /// registered regions.
    fn sge_valid(&self, fab: usize, sge: &Sge, need_local_write: bool) -> bool {
        self.fabrics[fab].mrs.values().any(|mr| {
            mr.lkey == sge.lkey
                && sge.addr as usize >= mr.addr
                && sge.addr as usize + sge.len as usize <= mr.addr + mr.len
                && (!need_local_write || mr.perm.contains(Permission::LOCAL_WRITE))
        })
    }

    /// Check a remote address range against the target fabric's registered
    /// regions and required remote permission.
    fn remote_valid(&self, fab: usize, remote: &MrRemote, needed: Permission) -> bool {
        self.fabrics[fab].mrs.values().any(|mr| {
            mr.rkey == remote.rkey
                && remote.addr as usize >= mr.addr
                && remote.addr as usize + remote.len <= mr.addr + mr.len
                && mr.perm.contains(needed)
        })
    }

    fn push_wc(&mut self, fab: usize, cq_key: u64, wc: Wc) -> io::Result<()> {
        let cq = self.fabrics[fab]
            .cqs
            .get_mut(&cq_key)
            .ok_or_else(|| einval("completion queue destroyed"))?;
        if cq.queue.len() >= cq.depth as usize {
            // Completion queue overrun is catastrophic on real hardware;
            // refuse the post that would cause it.
            return Err(enomem());
        }
        cq.queue.push_back(wc);
        Ok(())
    }

    /// Gather the bytes a scatter/gather list refers to.
    fn gather(&self, sgl: &[Sge]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(sgl.iter().map(|s| s.len as usize).sum());
        for sge in sgl {
            // SAFETY: the range was validated against a live registered
            // region, and registered memory outlives its `Mr`, which this
            // call races with only if the caller violates the `Mr` lifetime.
            let src =
                unsafe { std::slice::from_raw_parts(sge.addr as *const u8, sge.len as usize) };
            buf.extend_from_slice(src);
        }
        buf
    }

    /// Scatter `data` into a scatter/gather list. Returns false if the list
    /// is too small.
    fn scatter(&self, sgl: &[Sge], data: &[u8]) -> bool {
        let capacity: usize = sgl.iter().map(|s| s.len as usize).sum();
        if data.len() > capacity {
            return false;
        }
        let mut off = 0;
        for sge in sgl {
            if off >= data.len() {
                break;
            }
            let n = (data.len() - off).min(sge.len as usize);
            // SAFETY: same argument as in `gather`; ranges were validated.
            unsafe {
                std::ptr::copy_nonoverlapping(data[off..].as_ptr(), sge.addr as *mut u8, n);
            }
            off += n;
        }
        true
    }
}

/// A simulated RDMA fabric shared by all participants of one test job.
#[derive(Clone)]
pub struct SimNet {
    inner: Arc<Mutex<NetInner>>,
}

impl Default for SimNet {
    fn default() -> Self {
        Self::new()
    }
}

impl SimNet {
    /// Create an empty fabric.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(NetInner {
                next_lid: 0,
                next_guid: 0x2c90_3000_0000_0000,
                next_qpn: 0x40,
                next_key: 0x1000,
                next_handle: 0,
                fabrics: Vec::new(),
            })),
        }
    }

    /// Attach one simulated HCA named `mlx4_0` with two ports: port 1
    /// active, port 2 down.
    pub fn add_fabric(&self) -> Arc<SimFabric> {
        self.add_fabric_with_devices(&["mlx4_0"])
    }

    /// Attach one simulated HCA per device name.
    pub fn add_fabric_with_devices(&self, names: &[&str]) -> Arc<SimFabric> {
        let mut net = self.inner.lock().unwrap();
        net.next_lid += 1;
        let lid = net.next_lid;
        let devices = names
            .iter()
            .map(|name| {
                net.next_guid += 1;
                SimDevice {
                    name: (*name).to_owned(),
                    guid: net.next_guid,
                    ports: vec![PortState::Active, PortState::Down],
                }
            })
            .collect();
        let id = net.fabrics.len();
        net.fabrics.push(FabricState {
            devices,
            lid,
            ..FabricState::default()
        });
        Arc::new(SimFabric {
            net: self.inner.clone(),
            id,
        })
    }
}

/// Counts of the resources a [`SimFabric`] currently holds. Useful for
/// asserting that failed setups do not leak.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimResources {
    /// Open device contexts.
    pub open_devices: usize,
    /// Allocated protection domains.
    pub pds: usize,
    /// Live completion queues.
    pub cqs: usize,
    /// Live queue pairs.
    pub qps: usize,
    /// Registered memory regions.
    pub mrs: usize,
}

/// One participant's view of a [`SimNet`].
pub struct SimFabric {
    net: Arc<Mutex<NetInner>>,
    id: usize,
}

impl fmt::Debug for SimFabric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SimFabric").field(&self.id).finish()
    }
}

impl SimFabric {
    /// Count the live hardware resources this fabric holds.
    pub fn live_resources(&self) -> SimResources {
        let net = self.net.lock().unwrap();
        let fab = &net.fabrics[self.id];
        SimResources {
            open_devices: fab.open.len(),
            pds: fab.pds.len(),
            cqs: fab.cqs.len(),
            qps: fab.qps.len(),
            mrs: fab.mrs.len(),
        }
    }

    fn execute(&self, net: &mut NetInner, fab: usize, qp_key: u64, wr: &SendWr) -> io::Result<()> {
        let (qpn, send_cq, caps, dest, sq_inflight, state) = {
            let qp = net.fabrics[fab]
                .qps
                .get(&qp_key)
                .ok_or_else(|| einval("no such queue pair"))?;
            (
                qp.qpn,
                qp.send_cq,
                qp.caps,
                qp.dest,
                qp.sq_inflight,
                qp.state,
            )
        };
        if state != QpState::Rts {
            return Err(einval("queue pair is not ready to send"));
        }
        if sq_inflight >= caps.max_send_wr {
            return Err(enomem());
        }
        if wr.sgl.len() > caps.max_send_sge as usize {
            return Err(einval("too many scatter/gather elements"));
        }

        let (dest_lid, dest_qpn) = dest.ok_or_else(|| einval("queue pair has no destination"))?;
        let opcode = match wr.op {
            SendOp::Send { .. } => WcOpcode::Send,
            SendOp::Write { .. } => WcOpcode::RdmaWrite,
            SendOp::Read { .. } => WcOpcode::RdmaRead,
        };
        let payload_len = wr.payload_len();
        let complete = |net: &mut NetInner, status: WcStatus, bytes: usize| -> io::Result<()> {
            if wr.signaled {
                net.push_wc(
                    fab,
                    send_cq,
                    Wc::new(wr.wr_id, status, opcode, bytes, qpn, None),
                )?;
                net.fabrics[fab].qps.get_mut(&qp_key).unwrap().sq_inflight += 1;
            }
            Ok(())
        };

        // Local scatter/gather entries must reference registered memory.
        // Reads additionally require local write access on the target.
        let need_local_write = matches!(wr.op, SendOp::Read { .. });
        if !wr
            .sgl
            .iter()
            .all(|sge| net.sge_valid(fab, sge, need_local_write))
        {
            return complete(net, WcStatus::LocProtErr, 0);
        }

        // Resolve the remote end. A missing or not-yet-ready responder shows
        // up as a transport retry timeout, exactly as on hardware.
        let remote_fab = match net.fabric_by_lid(dest_lid) {
            Some(f) => f,
            None => return complete(net, WcStatus::RetryExcErr, 0),
        };
        let remote_key = match net.qp_key_by_qpn(remote_fab, dest_qpn) {
            Some(k) => k,
            None => return complete(net, WcStatus::RetryExcErr, 0),
        };
        let (remote_state, remote_access, remote_recv_cq, remote_qpn) = {
            let qp = &net.fabrics[remote_fab].qps[&remote_key];
            (qp.state, qp.access, qp.recv_cq, qp.qpn)
        };
        if remote_state != QpState::Rtr && remote_state != QpState::Rts {
            return complete(net, WcStatus::RetryExcErr, 0);
        }

        match &wr.op {
            SendOp::Send { imm, .. } => {
                let data = net.gather(&wr.sgl);
                let recv = match net.fabrics[remote_fab]
                    .qps
                    .get_mut(&remote_key)
                    .unwrap()
                    .recvs
                    .pop_front()
                {
                    Some(recv) => recv,
                    // rnr_retry is 0 in this design: no posted receive
                    // buffer means immediate failure, not a wait.
                    None => return complete(net, WcStatus::RnrRetryExcErr, 0),
                };
                if !net.scatter(&recv.sgl, &data) {
                    net.push_wc(
                        remote_fab,
                        remote_recv_cq,
                        Wc::new(recv.wr_id, WcStatus::LocLenErr, WcOpcode::Recv, 0, remote_qpn, None),
                    )?;
                    return complete(net, WcStatus::RemInvReqErr, 0);
                }
                net.push_wc(
                    remote_fab,
                    remote_recv_cq,
                    Wc::new(
                        recv.wr_id,
                        WcStatus::Success,
                        WcOpcode::Recv,
                        data.len(),
                        remote_qpn,
                        *imm,
                    ),
                )?;
                complete(net, WcStatus::Success, data.len())
            }

            SendOp::Write { remote, imm } => {
                if !remote_access.contains(Permission::REMOTE_WRITE)
                    || !net.remote_valid(
                        remote_fab,
                        &MrRemote::new(remote.addr, payload_len, remote.rkey),
                        Permission::REMOTE_WRITE,
                    )
                {
                    return complete(net, WcStatus::RemAccessErr, 0);
                }
                let data = net.gather(&wr.sgl);
                // SAFETY: destination range validated against a live
                // registered region of the remote fabric.
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        data.as_ptr(),
                        remote.addr as *mut u8,
                        data.len(),
                    );
                }
                if let Some(imm) = imm {
                    // Write-with-immediate consumes a receive at the target.
                    let recv = match net.fabrics[remote_fab]
                        .qps
                        .get_mut(&remote_key)
                        .unwrap()
                        .recvs
                        .pop_front()
                    {
                        Some(recv) => recv,
                        None => return complete(net, WcStatus::RnrRetryExcErr, 0),
                    };
                    net.push_wc(
                        remote_fab,
                        remote_recv_cq,
                        Wc::new(
                            recv.wr_id,
                            WcStatus::Success,
                            WcOpcode::Recv,
                            data.len(),
                            remote_qpn,
                            Some(*imm),
                        ),
                    )?;
                }
                complete(net, WcStatus::Success, data.len())
            }

            SendOp::Read { remote } => {
                if !remote_access.contains(Permission::REMOTE_READ)
                    || !net.remote_valid(remote_fab, remote, Permission::REMOTE_READ)
                {
                    return complete(net, WcStatus::RemAccessErr, 0);
                }
                // SAFETY: source range validated against a live registered
                // region of the remote fabric.
                let data = unsafe {
                    std::slice::from_raw_parts(remote.addr as *const u8, remote.len).to_vec()
                };
                if !net.scatter(&wr.sgl, &data) {
                    return complete(net, WcStatus::LocLenErr, 0);
                }
                complete(net, WcStatus::Success, data.len())
            }
        }
    }
}

impl Fabric for SimFabric {
    fn devices(&self) -> io::Result<Vec<DeviceInfo>> {
        let net = self.net.lock().unwrap();
        Ok(net.fabrics[self.id]
            .devices
            .iter()
            .map(|dev| DeviceInfo {
                name: dev.name.clone(),
                guid: dev.guid,
            })
            .collect())
    }

    fn open_device(&self, name: &str) -> io::Result<(DeviceHandle, DeviceAttr)> {
        let mut net = self.net.lock().unwrap();
        let idx = net.fabrics[self.id]
            .devices
            .iter()
            .position(|dev| dev.name == name)
            .ok_or_else(|| io::Error::from_raw_os_error(libc::ENODEV))?;
        let phys_port_cnt = net.fabrics[self.id].devices[idx].ports.len() as u8;
        let handle = net.handle();
        net.fabrics[self.id].open.insert(handle, idx);
        Ok((
            DeviceHandle(handle),
            DeviceAttr {
                max_qp_wr: 1024,
                max_sge: 16,
                max_cqe: 4096,
                max_qp_rd_atom: 16,
                phys_port_cnt,
            },
        ))
    }

    fn close_device(&self, dev: DeviceHandle) {
        let mut net = self.net.lock().unwrap();
        net.fabrics[self.id].open.remove(&dev.0);
    }

    fn query_port(&self, dev: DeviceHandle, port: PortNum) -> io::Result<PortAttr> {
        let net = self.net.lock().unwrap();
        let fab = &net.fabrics[self.id];
        let idx = *fab
            .open
            .get(&dev.0)
            .ok_or_else(|| einval("device not open"))?;
        let ports = &fab.devices[idx].ports;
        if port == 0 || port as usize > ports.len() {
            return Err(einval("port number out of range"));
        }
        Ok(PortAttr {
            state: ports[port as usize - 1],
            lid: fab.lid,
            active_mtu: 3,
        })
    }

    fn alloc_pd(&self, dev: DeviceHandle) -> io::Result<PdHandle> {
        let mut net = self.net.lock().unwrap();
        let idx = *net.fabrics[self.id]
            .open
            .get(&dev.0)
            .ok_or_else(|| einval("device not open"))?;
        let handle = net.handle();
        net.fabrics[self.id].pds.insert(handle, idx);
        Ok(PdHandle(handle))
    }

    fn dealloc_pd(&self, pd: PdHandle) {
        let mut net = self.net.lock().unwrap();
        net.fabrics[self.id].pds.remove(&pd.0);
    }

    fn create_cq(&self, _dev: DeviceHandle, depth: u32) -> io::Result<CqHandle> {
        let mut net = self.net.lock().unwrap();
        if depth == 0 {
            return Err(einval("zero-depth completion queue"));
        }
        let handle = net.handle();
        net.fabrics[self.id].cqs.insert(
            handle,
            SimCq {
                depth,
                queue: VecDeque::new(),
            },
        );
        Ok(CqHandle(handle))
    }

    fn destroy_cq(&self, cq: CqHandle) {
        let mut net = self.net.lock().unwrap();
        net.fabrics[self.id].cqs.remove(&cq.0);
    }

    fn create_qp(
        &self,
        pd: PdHandle,
        send_cq: CqHandle,
        recv_cq: CqHandle,
        caps: &QpCaps,
    ) -> io::Result<(QpHandle, Qpn)> {
        let mut net = self.net.lock().unwrap();
        let fab = &net.fabrics[self.id];
        let dev = *fab
            .pds
            .get(&pd.0)
            .ok_or_else(|| einval("no such protection domain"))?;
        if !fab.cqs.contains_key(&send_cq.0) || !fab.cqs.contains_key(&recv_cq.0) {
            return Err(einval("no such completion queue"));
        }
        net.next_qpn += 1;
        let qpn = net.next_qpn;
        let handle = net.handle();
        net.fabrics[self.id].qps.insert(
            handle,
            SimQp {
                qpn,
                dev,
                send_cq: send_cq.0,
                recv_cq: recv_cq.0,
                caps: *caps,
                state: QpState::Reset,
                port: 0,
                access: Permission::EMPTY,
                dest: None,
                recvs: VecDeque::new(),
                sq_inflight: 0,
            },
        );
        Ok((QpHandle(handle), qpn))
    }

    fn destroy_qp(&self, qp: QpHandle) {
        let mut net = self.net.lock().unwrap();
        net.fabrics[self.id].qps.remove(&qp.0);
    }

    fn modify_qp(&self, qp: QpHandle, transition: &QpTransition) -> io::Result<()> {
        let mut net = self.net.lock().unwrap();

        let (state, dev, bound_port) = {
            let entry = net.fabrics[self.id]
                .qps
                .get(&qp.0)
                .ok_or_else(|| einval("no such queue pair"))?;
            (entry.state, entry.dev, entry.port)
        };
        let (from, to) = transition.states();
        if state != from {
            return Err(einval("queue pair is not in the transition's source state"));
        }

        match transition {
            QpTransition::ResetToInit { port_num, .. } => {
                let ports = net.fabrics[self.id].devices[dev].ports.len() as u8;
                if *port_num == 0 || *port_num > ports {
                    return Err(einval("port number out of range"));
                }
            }
            QpTransition::InitToRtr {
                port_num, dest_lid, ..
            } => {
                if *port_num != bound_port {
                    return Err(einval("address handle port differs from the bound port"));
                }
                if net.fabric_by_lid(*dest_lid).is_none() {
                    return Err(io::Error::from_raw_os_error(libc::EHOSTUNREACH));
                }
            }
            QpTransition::RtrToRts { .. } => {}
        }

        let entry = net.fabrics[self.id].qps.get_mut(&qp.0).unwrap();
        match transition {
            QpTransition::ResetToInit { port_num, access } => {
                entry.port = *port_num;
                entry.access = *access;
            }
            QpTransition::InitToRtr {
                dest_lid, dest_qpn, ..
            } => entry.dest = Some((*dest_lid, *dest_qpn)),
            QpTransition::RtrToRts { .. } => {}
        }
        entry.state = to;
        Ok(())
    }

    fn reg_mr(
        &self,
        pd: PdHandle,
        addr: usize,
        len: usize,
        perm: Permission,
    ) -> io::Result<MrKeys> {
        let mut net = self.net.lock().unwrap();
        if !net.fabrics[self.id].pds.contains_key(&pd.0) {
            return Err(einval("no such protection domain"));
        }
        if addr == 0 || len == 0 {
            return Err(einval("invalid memory range"));
        }
        net.next_key += 1;
        let lkey = net.next_key;
        net.next_key += 1;
        let rkey = net.next_key;
        let handle = net.handle();
        net.fabrics[self.id].mrs.insert(
            handle,
            SimMr {
                addr,
                len,
                lkey,
                rkey,
                perm,
            },
        );
        Ok(MrKeys {
            handle: MrHandle(handle),
            lkey,
            rkey,
        })
    }

    fn dereg_mr(&self, mr: MrHandle) {
        let mut net = self.net.lock().unwrap();
        net.fabrics[self.id].mrs.remove(&mr.0);
    }

    fn post_send(&self, qp: QpHandle, wr: &SendWr) -> io::Result<()> {
        let mut net = self.net.lock().unwrap();
        self.execute(&mut net, self.id, qp.0, wr)
    }

    fn post_recv(&self, qp: QpHandle, wr: &RecvWr) -> io::Result<()> {
        let mut net = self.net.lock().unwrap();
        let entry = net.fabrics[self.id]
            .qps
            .get_mut(&qp.0)
            .ok_or_else(|| einval("no such queue pair"))?;
        if entry.state == QpState::Reset || entry.state == QpState::Error {
            return Err(einval("queue pair cannot accept receives"));
        }
        if entry.recvs.len() >= entry.caps.max_recv_wr as usize {
            return Err(enomem());
        }
        entry.recvs.push_back(wr.clone());
        Ok(())
    }

    fn poll_cq(&self, cq: CqHandle, max: usize) -> io::Result<Vec<Wc>> {
        let mut net = self.net.lock().unwrap();
        let entry = net.fabrics[self.id]
            .cqs
            .get_mut(&cq.0)
            .ok_or_else(|| einval("no such completion queue"))?;
        let n = max.min(entry.queue.len());
        let wcs: Vec<Wc> = entry.queue.drain(..n).collect();

        // A drained send-side completion frees its send queue slot.
        for wc in &wcs {
            if wc.opcode() != WcOpcode::Recv {
                if let Some(qp) = net.fabrics[self.id]
                    .qps
                    .values_mut()
                    .find(|qp| qp.qpn == wc.qp_num())
                {
                    qp.sq_inflight = qp.sq_inflight.saturating_sub(1);
                }
            }
        }
        Ok(wcs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lids_are_unique_and_nonzero() {
        let net = SimNet::new();
        let a = net.add_fabric();
        let b = net.add_fabric();

        let (dev_a, _) = a.open_device("mlx4_0").unwrap();
        let (dev_b, _) = b.open_device("mlx4_0").unwrap();
        let lid_a = a.query_port(dev_a, 1).unwrap().lid;
        let lid_b = b.query_port(dev_b, 1).unwrap().lid;
        assert_ne!(lid_a, 0);
        assert_ne!(lid_b, 0);
        assert_ne!(lid_a, lid_b);
    }

    #[test]
    fn guids_differ_per_device() {
        let net = SimNet::new();
        let fab = net.add_fabric_with_devices(&["mlx4_0", "mlx4_1"]);
        let devs = fab.devices().unwrap();
        assert_eq!(devs.len(), 2);
        assert_ne!(devs[0].guid, devs[1].guid);
    }

    #[test]
    fn init_validates_ports_of_the_owning_device() {
        let net = SimNet::new();
        let fab = net.add_fabric_with_devices(&["mlx4_0", "mlx4_1"]);
        // Give the second device a third port the first does not have.
        net.inner.lock().unwrap().fabrics[0].devices[1]
            .ports
            .push(PortState::Active);

        let (dev, _) = fab.open_device("mlx4_1").unwrap();
        let pd = fab.alloc_pd(dev).unwrap();
        let cq = fab.create_cq(dev, 16).unwrap();
        let caps = QpCaps::default();

        // Port 3 exists only on mlx4_1; the check must resolve the queue
        // pair's own device, not the first one in the list.
        let (qp, _) = fab.create_qp(pd, cq, cq, &caps).unwrap();
        fab.modify_qp(
            qp,
            &QpTransition::ResetToInit {
                port_num: 3,
                access: Permission::default(),
            },
        )
        .unwrap();

        let (other, _) = fab.create_qp(pd, cq, cq, &caps).unwrap();
        assert!(fab
            .modify_qp(
                other,
                &QpTransition::ResetToInit {
                    port_num: 4,
                    access: Permission::default(),
                },
            )
            .is_err());
    }

    #[test]
    fn rtr_address_handle_must_use_the_bound_port() {
        let net = SimNet::new();
        let fab = net.add_fabric();
        let (dev, _) = fab.open_device("mlx4_0").unwrap();
        let lid = fab.query_port(dev, 1).unwrap().lid;
        let pd = fab.alloc_pd(dev).unwrap();
        let cq = fab.create_cq(dev, 16).unwrap();
        let (qp, qpn) = fab.create_qp(pd, cq, cq, &QpCaps::default()).unwrap();
        fab.modify_qp(
            qp,
            &QpTransition::ResetToInit {
                port_num: 1,
                access: Permission::default(),
            },
        )
        .unwrap();

        let rtr = |port_num| QpTransition::InitToRtr {
            mtu: 3,
            port_num,
            dest_lid: lid,
            dest_qpn: qpn,
            rq_psn: 0,
            min_rnr_timer: 0x12,
            max_dest_rd_atomic: 16,
        };
        assert!(fab.modify_qp(qp, &rtr(2)).is_err());
        fab.modify_qp(qp, &rtr(1)).unwrap();
    }
}
