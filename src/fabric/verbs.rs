//! `libibverbs` fabric backend.
//!
//! Thin shims from the [`Fabric`] trait onto the raw `rdma-sys` bindings.
//! Handles are the underlying verbs object pointers. All addressing is
//! LID-based reliable connection, which keeps it to InfiniBand (or RoCE
//! setups that emulate LIDs).

use std::ffi::CStr;
use std::io;
use std::ptr::{self, NonNull};

use log::warn;
use rdma_sys::*;

use super::{CqHandle, DeviceAttr, DeviceHandle, DeviceInfo, Fabric, MrHandle, MrKeys, PdHandle,
            PortAttr, PortState, QpHandle};
use crate::rdma::cq::{Wc, WcOpcode, WcStatus};
use crate::rdma::mr::Permission;
use crate::rdma::qp::{QpCaps, QpState, QpTransition};
use crate::rdma::types::{PortNum, Qpn};
use crate::rdma::wr::{RecvWr, SendWr, SendOp, Sge};

fn from_errno(ret: i32) -> io::Error {
    io::Error::from_raw_os_error(if ret > 0 { ret } else { -ret })
}

fn last_error() -> io::Error {
    io::Error::last_os_error()
}

/// Verbs-backed fabric. One instance per process is enough; contexts are
/// tracked per open device handle.
#[derive(Debug, Default)]
pub struct VerbsFabric;

impl VerbsFabric {
    pub fn new() -> Self {
        VerbsFabric
    }

    /// Run `f` over the device list, releasing the list afterwards.
    fn with_device_list<T>(
        &self,
        f: impl FnOnce(&[NonNull<ibv_device>]) -> io::Result<T>,
    ) -> io::Result<T> {
        let mut n = 0i32;
        // SAFETY: FFI.
        let list = unsafe { ibv_get_device_list(&mut n) };
        if list.is_null() {
            return Err(last_error());
        }
        // SAFETY: the returned array holds `n` valid device pointers.
        let devices = unsafe {
            std::slice::from_raw_parts(list as *const NonNull<ibv_device>, n as usize)
        };
        let ret = f(devices);
        // SAFETY: `list` came from `ibv_get_device_list`.
        unsafe { ibv_free_device_list(list) };
        ret
    }
}

fn sge_array(sgl: &[Sge]) -> Vec<ibv_sge> {
    sgl.iter()
        .map(|sge| ibv_sge {
            addr: sge.addr,
            length: sge.len,
            lkey: sge.lkey,
        })
        .collect()
}

fn map_status(status: ibv_wc_status::Type) -> WcStatus {
    match status {
        ibv_wc_status::IBV_WC_SUCCESS => WcStatus::Success,
        ibv_wc_status::IBV_WC_LOC_LEN_ERR => WcStatus::LocLenErr,
        ibv_wc_status::IBV_WC_LOC_PROT_ERR => WcStatus::LocProtErr,
        ibv_wc_status::IBV_WC_WR_FLUSH_ERR => WcStatus::WrFlushErr,
        ibv_wc_status::IBV_WC_REM_INV_REQ_ERR => WcStatus::RemInvReqErr,
        ibv_wc_status::IBV_WC_REM_ACCESS_ERR => WcStatus::RemAccessErr,
        ibv_wc_status::IBV_WC_REM_OP_ERR => WcStatus::RemOpErr,
        ibv_wc_status::IBV_WC_RETRY_EXC_ERR => WcStatus::RetryExcErr,
        ibv_wc_status::IBV_WC_RNR_RETRY_EXC_ERR => WcStatus::RnrRetryExcErr,
        _ => WcStatus::GeneralErr,
    }
}

fn map_opcode(opcode: ibv_wc_opcode::Type) -> WcOpcode {
    match opcode {
        ibv_wc_opcode::IBV_WC_SEND => WcOpcode::Send,
        ibv_wc_opcode::IBV_WC_RDMA_WRITE => WcOpcode::RdmaWrite,
        ibv_wc_opcode::IBV_WC_RDMA_READ => WcOpcode::RdmaRead,
        _ => WcOpcode::Recv,
    }
}

fn qp_state_code(state: QpState) -> ibv_qp_state::Type {
    match state {
        QpState::Reset => ibv_qp_state::IBV_QPS_RESET,
        QpState::Init => ibv_qp_state::IBV_QPS_INIT,
        QpState::Rtr => ibv_qp_state::IBV_QPS_RTR,
        QpState::Rts => ibv_qp_state::IBV_QPS_RTS,
        QpState::Error => ibv_qp_state::IBV_QPS_ERR,
    }
}

impl Fabric for VerbsFabric {
    fn devices(&self) -> io::Result<Vec<DeviceInfo>> {
        self.with_device_list(|devices| {
            devices
                .iter()
                .map(|dev| {
                    // SAFETY: `dev` points to a live device entry.
                    let name = unsafe { ibv_get_device_name(dev.as_ptr()) };
                    if name.is_null() {
                        return Err(last_error());
                    }
                    // SAFETY: verbs device names are NUL-terminated ASCII.
                    let name = unsafe { CStr::from_ptr(name) }
                        .to_string_lossy()
                        .into_owned();
                    // SAFETY: same as above.
                    let guid = unsafe { ibv_get_device_guid(dev.as_ptr()) };
                    Ok(DeviceInfo {
                        name,
                        guid: u64::from_be(guid),
                    })
                })
                .collect()
        })
    }

    fn open_device(&self, name: &str) -> io::Result<(DeviceHandle, DeviceAttr)> {
        let ctx = self.with_device_list(|devices| {
            for dev in devices {
                // SAFETY: `dev` points to a live device entry.
                let dev_name = unsafe { ibv_get_device_name(dev.as_ptr()) };
                if dev_name.is_null() {
                    continue;
                }
                // SAFETY: NUL-terminated name from the driver.
                if unsafe { CStr::from_ptr(dev_name) }.to_string_lossy() == name {
                    // SAFETY: FFI.
                    let ctx = unsafe { ibv_open_device(dev.as_ptr()) };
                    if ctx.is_null() {
                        return Err(last_error());
                    }
                    return Ok(ctx);
                }
            }
            Err(io::Error::from_raw_os_error(libc::ENODEV))
        })?;

        let mut attr = unsafe { std::mem::zeroed::<ibv_device_attr>() };
        // SAFETY: `ctx` is a live context, `attr` is writable.
        let ret = unsafe { ibv_query_device(ctx, &mut attr) };
        if ret != 0 {
            // SAFETY: `ctx` was just opened.
            unsafe { ibv_close_device(ctx) };
            return Err(from_errno(ret));
        }
        Ok((
            DeviceHandle(ctx as u64),
            DeviceAttr {
                max_qp_wr: attr.max_qp_wr as u32,
                max_sge: attr.max_sge as u32,
                max_cqe: attr.max_cqe as u32,
                max_qp_rd_atom: attr.max_qp_rd_atom as u8,
                phys_port_cnt: attr.phys_port_cnt,
            },
        ))
    }

    fn close_device(&self, dev: DeviceHandle) {
        // SAFETY: the handle came from `open_device`.
        let ret = unsafe { ibv_close_device(dev.0 as *mut ibv_context) };
        if ret != 0 {
            warn!("failed to close device context: {}", from_errno(ret));
        }
    }

    fn query_port(&self, dev: DeviceHandle, port: PortNum) -> io::Result<PortAttr> {
        let mut attr = unsafe { std::mem::zeroed::<ibv_port_attr>() };
        // SAFETY: live context, writable attr.
        let ret = unsafe {
            ___ibv_query_port(dev.0 as *mut ibv_context, port, &mut attr as *mut _ as *mut _)
        };
        if ret != 0 {
            return Err(from_errno(ret));
        }
        let state = match attr.state {
            ibv_port_state::IBV_PORT_INIT => PortState::Init,
            ibv_port_state::IBV_PORT_ARMED => PortState::Armed,
            ibv_port_state::IBV_PORT_ACTIVE => PortState::Active,
            _ => PortState::Down,
        };
        Ok(PortAttr {
            state,
            lid: attr.lid,
            active_mtu: attr.active_mtu as u32,
        })
    }

    fn alloc_pd(&self, dev: DeviceHandle) -> io::Result<PdHandle> {
        // SAFETY: live context.
        let pd = unsafe { ibv_alloc_pd(dev.0 as *mut ibv_context) };
        if pd.is_null() {
            return Err(last_error());
        }
        Ok(PdHandle(pd as u64))
    }

    fn dealloc_pd(&self, pd: PdHandle) {
        // SAFETY: the handle came from `alloc_pd`.
        let ret = unsafe { ibv_dealloc_pd(pd.0 as *mut ibv_pd) };
        if ret != 0 {
            warn!("failed to deallocate protection domain: {}", from_errno(ret));
        }
    }

    fn create_cq(&self, dev: DeviceHandle, depth: u32) -> io::Result<CqHandle> {
        // SAFETY: live context; no completion channel, no vector affinity.
        let cq = unsafe {
            ibv_create_cq(
                dev.0 as *mut ibv_context,
                depth as i32,
                ptr::null_mut(),
                ptr::null_mut(),
                0,
            )
        };
        if cq.is_null() {
            return Err(last_error());
        }
        Ok(CqHandle(cq as u64))
    }

    fn destroy_cq(&self, cq: CqHandle) {
        // SAFETY: the handle came from `create_cq`.
        let ret = unsafe { ibv_destroy_cq(cq.0 as *mut ibv_cq) };
        if ret != 0 {
            warn!("failed to destroy completion queue: {}", from_errno(ret));
        }
    }

    fn create_qp(
        &self,
        pd: PdHandle,
        send_cq: CqHandle,
        recv_cq: CqHandle,
        caps: &QpCaps,
    ) -> io::Result<(QpHandle, Qpn)> {
        let mut init_attr = unsafe { std::mem::zeroed::<ibv_qp_init_attr>() };
        init_attr.send_cq = send_cq.0 as *mut ibv_cq;
        init_attr.recv_cq = recv_cq.0 as *mut ibv_cq;
        init_attr.qp_type = ibv_qp_type::IBV_QPT_RC;
        init_attr.sq_sig_all = 0;
        init_attr.cap = ibv_qp_cap {
            max_send_wr: caps.max_send_wr,
            max_recv_wr: caps.max_recv_wr,
            max_send_sge: caps.max_send_sge,
            max_recv_sge: caps.max_recv_sge,
            max_inline_data: caps.max_inline_data,
        };
        // SAFETY: live protection domain and completion queues.
        let qp = unsafe { ibv_create_qp(pd.0 as *mut ibv_pd, &mut init_attr) };
        if qp.is_null() {
            return Err(last_error());
        }
        // SAFETY: just created.
        let qpn = unsafe { (*qp).qp_num };
        Ok((QpHandle(qp as u64), qpn))
    }

    fn destroy_qp(&self, qp: QpHandle) {
        // SAFETY: the handle came from `create_qp`.
        let ret = unsafe { ibv_destroy_qp(qp.0 as *mut ibv_qp) };
        if ret != 0 {
            warn!("failed to destroy queue pair: {}", from_errno(ret));
        }
    }

    fn modify_qp(&self, qp: QpHandle, transition: &QpTransition) -> io::Result<()> {
        let mut attr = unsafe { std::mem::zeroed::<ibv_qp_attr>() };
        let (_, to) = transition.states();
        attr.qp_state = qp_state_code(to);
        let mask = match transition {
            QpTransition::ResetToInit { port_num, access } => {
                attr.pkey_index = 0;
                attr.port_num = *port_num;
                attr.qp_access_flags = access.bits();
                ibv_qp_attr_mask::IBV_QP_STATE
                    | ibv_qp_attr_mask::IBV_QP_PKEY_INDEX
                    | ibv_qp_attr_mask::IBV_QP_PORT
                    | ibv_qp_attr_mask::IBV_QP_ACCESS_FLAGS
            }
            QpTransition::InitToRtr {
                mtu,
                port_num,
                dest_lid,
                dest_qpn,
                rq_psn,
                min_rnr_timer,
                max_dest_rd_atomic,
            } => {
                attr.path_mtu = *mtu;
                attr.dest_qp_num = *dest_qpn;
                attr.rq_psn = *rq_psn;
                attr.max_dest_rd_atomic = *max_dest_rd_atomic;
                attr.min_rnr_timer = *min_rnr_timer;
                attr.ah_attr.is_global = 0;
                attr.ah_attr.dlid = *dest_lid;
                attr.ah_attr.sl = 0;
                attr.ah_attr.src_path_bits = 0;
                attr.ah_attr.port_num = *port_num;
                ibv_qp_attr_mask::IBV_QP_STATE
                    | ibv_qp_attr_mask::IBV_QP_AV
                    | ibv_qp_attr_mask::IBV_QP_PATH_MTU
                    | ibv_qp_attr_mask::IBV_QP_DEST_QPN
                    | ibv_qp_attr_mask::IBV_QP_RQ_PSN
                    | ibv_qp_attr_mask::IBV_QP_MAX_DEST_RD_ATOMIC
                    | ibv_qp_attr_mask::IBV_QP_MIN_RNR_TIMER
            }
            QpTransition::RtrToRts {
                sq_psn,
                timeout,
                retry_count,
                rnr_retry,
                max_rd_atomic,
            } => {
                attr.sq_psn = *sq_psn;
                attr.timeout = *timeout;
                attr.retry_cnt = *retry_count;
                attr.rnr_retry = *rnr_retry;
                attr.max_rd_atomic = *max_rd_atomic;
                ibv_qp_attr_mask::IBV_QP_STATE
                    | ibv_qp_attr_mask::IBV_QP_TIMEOUT
                    | ibv_qp_attr_mask::IBV_QP_RETRY_CNT
                    | ibv_qp_attr_mask::IBV_QP_RNR_RETRY
                    | ibv_qp_attr_mask::IBV_QP_SQ_PSN
                    | ibv_qp_attr_mask::IBV_QP_MAX_QP_RD_ATOMIC
            }
        };
        // SAFETY: live queue pair, fully initialized attr for the mask.
        let ret = unsafe { ibv_modify_qp(qp.0 as *mut ibv_qp, &mut attr, mask.0 as i32) };
        if ret != 0 {
            return Err(from_errno(ret));
        }
        Ok(())
    }

    fn reg_mr(
        &self,
        pd: PdHandle,
        addr: usize,
        len: usize,
        perm: Permission,
    ) -> io::Result<MrKeys> {
        // SAFETY: live protection domain; the caller guarantees the range
        // stays valid for the region's lifetime.
        let mr = unsafe {
            ibv_reg_mr(
                pd.0 as *mut ibv_pd,
                addr as *mut libc::c_void,
                len,
                perm.bits() as i32,
            )
        };
        if mr.is_null() {
            return Err(last_error());
        }
        // SAFETY: just registered.
        let (lkey, rkey) = unsafe { ((*mr).lkey, (*mr).rkey) };
        Ok(MrKeys {
            handle: MrHandle(mr as u64),
            lkey,
            rkey,
        })
    }

    fn dereg_mr(&self, mr: MrHandle) {
        // SAFETY: the handle came from `reg_mr`.
        let ret = unsafe { ibv_dereg_mr(mr.0 as *mut ibv_mr) };
        if ret != 0 {
            warn!("failed to deregister memory region: {}", from_errno(ret));
        }
    }

    fn post_send(&self, qp: QpHandle, wr: &SendWr) -> io::Result<()> {
        let mut sgl = sge_array(&wr.sgl);
        let mut raw = unsafe { std::mem::zeroed::<ibv_send_wr>() };
        raw.wr_id = wr.wr_id;
        raw.sg_list = sgl.as_mut_ptr();
        raw.num_sge = sgl.len() as i32;
        if wr.signaled {
            raw.send_flags |= ibv_send_flags::IBV_SEND_SIGNALED.0;
        }
        match &wr.op {
            SendOp::Send { imm, inline } => {
                raw.opcode = match imm {
                    Some(imm) => {
                        raw.imm_data_invalidated_rkey_union.imm_data = *imm;
                        ibv_wr_opcode::IBV_WR_SEND_WITH_IMM
                    }
                    None => ibv_wr_opcode::IBV_WR_SEND,
                };
                if *inline {
                    raw.send_flags |= ibv_send_flags::IBV_SEND_INLINE.0;
                }
            }
            SendOp::Write { remote, imm } => {
                raw.opcode = match imm {
                    Some(imm) => {
                        raw.imm_data_invalidated_rkey_union.imm_data = *imm;
                        ibv_wr_opcode::IBV_WR_RDMA_WRITE_WITH_IMM
                    }
                    None => ibv_wr_opcode::IBV_WR_RDMA_WRITE,
                };
                raw.wr.rdma.remote_addr = remote.addr;
                raw.wr.rdma.rkey = remote.rkey;
            }
            SendOp::Read { remote } => {
                raw.opcode = ibv_wr_opcode::IBV_WR_RDMA_READ;
                raw.wr.rdma.remote_addr = remote.addr;
                raw.wr.rdma.rkey = remote.rkey;
            }
        }
        let mut bad = ptr::null_mut::<ibv_send_wr>();
        // SAFETY: live queue pair; sgl outlives the call.
        let ret = unsafe { ibv_post_send(qp.0 as *mut ibv_qp, &mut raw, &mut bad) };
        if ret != 0 {
            return Err(from_errno(ret));
        }
        Ok(())
    }

    fn post_recv(&self, qp: QpHandle, wr: &RecvWr) -> io::Result<()> {
        let mut sgl = sge_array(&wr.sgl);
        let mut raw = unsafe { std::mem::zeroed::<ibv_recv_wr>() };
        raw.wr_id = wr.wr_id;
        raw.sg_list = sgl.as_mut_ptr();
        raw.num_sge = sgl.len() as i32;
        let mut bad = ptr::null_mut::<ibv_recv_wr>();
        // SAFETY: live queue pair; sgl outlives the call.
        let ret = unsafe { ibv_post_recv(qp.0 as *mut ibv_qp, &mut raw, &mut bad) };
        if ret != 0 {
            return Err(from_errno(ret));
        }
        Ok(())
    }

    fn poll_cq(&self, cq: CqHandle, max: usize) -> io::Result<Vec<Wc>> {
        let mut raw: Vec<ibv_wc> =
            (0..max).map(|_| unsafe { std::mem::zeroed() }).collect();
        // SAFETY: live completion queue; `raw` has room for `max` entries.
        let n = unsafe { ibv_poll_cq(cq.0 as *mut ibv_cq, max as i32, raw.as_mut_ptr()) };
        if n < 0 {
            return Err(from_errno(n));
        }
        Ok(raw[..n as usize]
            .iter()
            .map(|wc| {
                let imm = if wc.wc_flags & ibv_wc_flags::IBV_WC_WITH_IMM.0 != 0 {
                    // SAFETY: the flag guarantees the union holds imm_data.
                    Some(unsafe { wc.imm_data_invalidated_rkey_union.imm_data })
                } else {
                    None
                };
                Wc::new(
                    wc.wr_id,
                    map_status(wc.status),
                    map_opcode(wc.opcode),
                    wc.byte_len as usize,
                    wc.qp_num,
                    imm,
                )
            })
            .collect())
    }
}

// SAFETY: libibverbs is thread-safe for independent objects, and all
// mutation of shared driver state happens inside the library.
unsafe impl Send for VerbsFabric {}
unsafe impl Sync for VerbsFabric {}
