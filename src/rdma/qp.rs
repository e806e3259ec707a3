//! Queue pair and its state machine.
//!
//! The hardware mandates an exact transition sequence before a reliable
//! connection can carry traffic: `Reset -> Init -> Rtr -> Rts`, strictly
//! forward, with exact parameters at each step, or the queue pair silently
//! fails to pass traffic. The current state is therefore tracked as an
//! explicit tag on [`Qp`], and every transition and post validates it before
//! touching the fabric, so that software-side misuse is caught early even on
//! the simulated backend.

use std::cell::Cell;
use std::{fmt, io};

use log::debug;
use serde::{Deserialize, Serialize};

use super::cq::Cq;
use super::mr::Permission;
use super::pd::Pd;
use super::types::{Lid, PortNum, Psn, Qpn};
use super::wr::{RecvWr, SendOp, SendWr};
use crate::error::{Error, Result};
use crate::fabric::QpHandle;

/// Initial packet sequence number used on both ends of every connection.
pub const INIT_PSN: Psn = 0;

/// Queue pair state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QpState {
    /// Freshly created, uninitialized.
    Reset,
    /// Initialized: bound to a port, access rights set.
    Init,
    /// Ready to receive: destination address programmed.
    Rtr,
    /// Ready to send: may carry traffic in both directions.
    Rts,
    /// Error state; the queue pair is unusable.
    Error,
}

/// Queue pair capability attributes.
#[derive(Debug, Clone, Copy)]
pub struct QpCaps {
    /// Maximum outstanding work requests on the send queue.
    pub max_send_wr: u32,
    /// Maximum outstanding work requests on the receive queue.
    pub max_recv_wr: u32,
    /// Maximum scatter/gather elements per send work request.
    pub max_send_sge: u32,
    /// Maximum scatter/gather elements per receive work request.
    pub max_recv_sge: u32,
    /// Maximum message size (bytes) that can be posted inline.
    pub max_inline_data: u32,
}

impl Default for QpCaps {
    /// Defaults for an RDMA-only mesh: a shallow send queue, a single-slot
    /// receive queue (no receive-driven traffic by default), one SGE per
    /// operation, and a 16-byte inline threshold (message rate drops sharply
    /// for inlined payloads much above that).
    fn default() -> Self {
        QpCaps {
            max_send_wr: 16,
            max_recv_wr: 1,
            max_send_sge: 1,
            max_recv_sge: 1,
            max_inline_data: 16,
        }
    }
}

/// Endpoint addressing data for one queue pair, as exchanged over the
/// rendezvous channel: the port's LID and the queue pair number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QpEndpoint {
    /// Link-layer local identifier of the owning port.
    pub lid: Lid,
    /// Hardware-assigned queue pair number.
    pub qpn: Qpn,
}

/// Timing and capacity parameters for the `Rtr`/`Rts` transitions.
///
/// The defaults are the values the Mellanox RDMA-Aware Programming manual
/// recommends; they rarely need touching. `rnr_retry` is 0 because an
/// RDMA-only mesh never legitimately hits receiver-not-ready.
#[derive(Debug, Clone, Copy)]
pub struct ConnectParams {
    /// Path MTU (`ibv_mtu` encoding), normally the port's active MTU.
    pub mtu: u32,
    /// Initial packet sequence number for both directions.
    pub psn: Psn,
    /// Minimum RNR NAK timer.
    pub min_rnr_timer: u8,
    /// Local ACK timeout (4.096 us * 2^timeout).
    pub timeout: u8,
    /// Transport retry count.
    pub retry_count: u8,
    /// RNR retry count.
    pub rnr_retry: u8,
    /// Outstanding RDMA reads/atomics initiated by the local end.
    pub max_rd_atomic: u8,
    /// Outstanding RDMA reads/atomics the remote end may have in flight
    /// against us.
    pub max_dest_rd_atomic: u8,
}

impl Default for ConnectParams {
    fn default() -> Self {
        ConnectParams {
            mtu: 3, // 1024 bytes
            psn: INIT_PSN,
            min_rnr_timer: 0x12,
            timeout: 0x12,
            retry_count: 6,
            rnr_retry: 0,
            max_rd_atomic: 16,
            max_dest_rd_atomic: 16,
        }
    }
}

/// One state machine transition, with the parameters the hardware needs to
/// apply it. Consumed by [`crate::fabric::Fabric::modify_qp`].
#[derive(Debug, Clone, Copy)]
pub enum QpTransition {
    /// `Reset -> Init`: bind the port, set access rights.
    ResetToInit {
        /// Port the queue pair sends and receives through.
        port_num: PortNum,
        /// Access rights granted to remote peers.
        access: Permission,
    },

    /// `Init -> Rtr`: program the destination address and receive-side
    /// timing.
    InitToRtr {
        /// Path MTU (`ibv_mtu` encoding).
        mtu: u32,
        /// Egress port for the address handle, the same port bound at
        /// `ResetToInit`.
        port_num: PortNum,
        /// Remote port's LID.
        dest_lid: Lid,
        /// Remote queue pair number.
        dest_qpn: Qpn,
        /// Expected first packet sequence number.
        rq_psn: Psn,
        /// Minimum RNR NAK timer.
        min_rnr_timer: u8,
        /// Outstanding reads/atomics the remote may drive into us.
        max_dest_rd_atomic: u8,
    },

    /// `Rtr -> Rts`: program send-side timing and the initial send sequence
    /// number.
    RtrToRts {
        /// Initial send packet sequence number.
        sq_psn: Psn,
        /// Local ACK timeout.
        timeout: u8,
        /// Transport retry count.
        retry_count: u8,
        /// RNR retry count.
        rnr_retry: u8,
        /// Outstanding reads/atomics we may initiate.
        max_rd_atomic: u8,
    },
}

impl QpTransition {
    /// The `(from, to)` states this transition connects.
    pub fn states(&self) -> (QpState, QpState) {
        match self {
            QpTransition::ResetToInit { .. } => (QpState::Reset, QpState::Init),
            QpTransition::InitToRtr { .. } => (QpState::Init, QpState::Rtr),
            QpTransition::RtrToRts { .. } => (QpState::Rtr, QpState::Rts),
        }
    }
}

/// Queue pair: the unit of addressable RDMA communication with one remote
/// peer. Bound at creation to a protection domain and to completion queues.
pub struct Qp {
    pd: Pd,
    send_cq: Cq,
    recv_cq: Cq,
    qp: QpHandle,
    qpn: Qpn,
    caps: QpCaps,
    state: Cell<QpState>,
    peer: Cell<Option<QpEndpoint>>,
}

impl fmt::Debug for Qp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Qp")
            .field("qpn", &self.qpn)
            .field("state", &self.state.get())
            .finish()
    }
}

impl Drop for Qp {
    fn drop(&mut self) {
        self.pd.context().fabric().destroy_qp(self.qp);
    }
}

impl Qp {
    /// Create a new reliable-connection queue pair in the `Reset` state.
    ///
    /// Fails with [`Error::ResourceExhausted`] if the requested capabilities
    /// exceed the device's, or the driver refuses creation.
    pub fn new(pd: &Pd, send_cq: &Cq, recv_cq: &Cq, caps: QpCaps) -> Result<Self> {
        Self::check_caps(pd, &caps)?;
        let (qp, qpn) = pd
            .context()
            .fabric()
            .create_qp(pd.handle(), send_cq.handle(), recv_cq.handle(), &caps)
            .map_err(|source| Error::ResourceExhausted {
                what: "queue pair",
                source,
            })?;
        Ok(Self {
            pd: pd.clone(),
            send_cq: send_cq.clone(),
            recv_cq: recv_cq.clone(),
            qp,
            qpn,
            caps,
            state: Cell::new(QpState::Reset),
            peer: Cell::new(None),
        })
    }

    fn check_caps(pd: &Pd, caps: &QpCaps) -> Result<()> {
        let attr = pd.context().attr();
        let check = |name: &'static str, value: u32, max: u32| -> Result<()> {
            if value > max {
                return Err(Error::ResourceExhausted {
                    what: "queue pair",
                    source: io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!("{name} supports up to {max}, {value} required"),
                    ),
                });
            }
            Ok(())
        };
        check("max_send_wr", caps.max_send_wr, attr.max_qp_wr)?;
        check("max_recv_wr", caps.max_recv_wr, attr.max_qp_wr)?;
        check("max_send_sge", caps.max_send_sge, attr.max_sge)?;
        check("max_recv_sge", caps.max_recv_sge, attr.max_sge)?;
        Ok(())
    }

    /// Get the queue pair number.
    #[inline]
    pub fn qp_num(&self) -> Qpn {
        self.qpn
    }

    /// Get the software-tracked state.
    #[inline]
    pub fn state(&self) -> QpState {
        self.state.get()
    }

    /// Get the capability attributes this queue pair was created with.
    #[inline]
    pub fn caps(&self) -> &QpCaps {
        &self.caps
    }

    /// Get the protection domain this queue pair belongs to.
    #[inline]
    pub fn pd(&self) -> &Pd {
        &self.pd
    }

    /// Get the addressing data a peer needs to connect to this queue pair.
    #[inline]
    pub fn endpoint(&self) -> QpEndpoint {
        QpEndpoint {
            lid: self.pd.context().lid(),
            qpn: self.qpn,
        }
    }

    /// Get the remote endpoint this queue pair is connected to, if any.
    #[inline]
    pub fn peer(&self) -> Option<QpEndpoint> {
        self.peer.get()
    }

    fn apply(&self, transition: QpTransition) -> Result<()> {
        let (from, to) = transition.states();
        if self.state.get() != from {
            return Err(Error::QueuePairTransitionFailed {
                from: self.state.get(),
                to,
                source: io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("queue pair is in state {:?}, not {:?}", self.state.get(), from),
                ),
            });
        }
        self.pd
            .context()
            .fabric()
            .modify_qp(self.qp, &transition)
            .map_err(|source| {
                self.state.set(QpState::Error);
                Error::QueuePairTransitionFailed { from, to, source }
            })?;
        self.state.set(to);
        debug!("qp {:#x}: {:?} -> {:?}", self.qpn, from, to);
        Ok(())
    }

    /// Transition `Reset -> Init`, binding the port and granting `access`
    /// to remote peers.
    pub fn modify_reset2init(&self, port_num: PortNum, access: Permission) -> Result<()> {
        self.apply(QpTransition::ResetToInit { port_num, access })
    }

    /// Transition `Init -> Rtr`, programming the destination address.
    pub fn modify_init2rtr(&self, peer: QpEndpoint, params: &ConnectParams) -> Result<()> {
        self.apply(QpTransition::InitToRtr {
            mtu: params.mtu,
            port_num: self.pd.context().port_num(),
            dest_lid: peer.lid,
            dest_qpn: peer.qpn,
            rq_psn: params.psn,
            min_rnr_timer: params.min_rnr_timer,
            max_dest_rd_atomic: params.max_dest_rd_atomic,
        })?;
        self.peer.set(Some(peer));
        Ok(())
    }

    /// Transition `Rtr -> Rts`. After this the queue pair may carry traffic
    /// in both directions.
    pub fn modify_rtr2rts(&self, params: &ConnectParams) -> Result<()> {
        self.apply(QpTransition::RtrToRts {
            sq_psn: params.psn,
            timeout: params.timeout,
            retry_count: params.retry_count,
            rnr_retry: params.rnr_retry,
            max_rd_atomic: params.max_rd_atomic,
        })
    }

    /// Connect this queue pair to a remote endpoint: `Init -> Rtr -> Rts`.
    pub fn connect(&self, peer: QpEndpoint, params: &ConnectParams) -> Result<()> {
        self.modify_init2rtr(peer, params)?;
        self.modify_rtr2rts(params)
    }

    /// Enqueue a send-type work request.
    ///
    /// Precondition: the queue pair has reached `Rts`; otherwise fails with
    /// [`Error::NotReady`]. The send queue depth is *not* checked here:
    /// exceeding it surfaces from the fabric as
    /// [`Error::OperationQueueOverflow`]. Callers size their queues and
    /// drain completions; nothing is queued on their behalf.
    pub fn post_send(&self, wr: &SendWr) -> Result<()> {
        if self.state.get() != QpState::Rts {
            return Err(Error::NotReady(self.state.get()));
        }
        if wr.sgl.len() > self.caps.max_send_sge as usize {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                "scatter/gather list exceeds queue pair capability",
            )));
        }
        if let SendOp::Send { inline: true, .. } = wr.op {
            if wr.payload_len() > self.caps.max_inline_data as usize {
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "payload exceeds inline threshold",
                )));
            }
        }
        self.pd
            .context()
            .fabric()
            .post_send(self.qp, wr)
            .map_err(Error::from_post)
    }

    /// Enqueue a receive work request.
    ///
    /// Receives may be posted as soon as the queue pair reaches `Init`.
    pub fn post_recv(&self, wr: &RecvWr) -> Result<()> {
        match self.state.get() {
            QpState::Init | QpState::Rtr | QpState::Rts => {}
            state => return Err(Error::NotReady(state)),
        }
        if wr.sgl.len() > self.caps.max_recv_sge as usize {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                "scatter/gather list exceeds queue pair capability",
            )));
        }
        self.pd
            .context()
            .fabric()
            .post_recv(self.qp, wr)
            .map_err(Error::from_post)
    }

    /// The send completion queue.
    #[inline]
    pub fn send_cq(&self) -> &Cq {
        &self.send_cq
    }

    /// The receive completion queue.
    #[inline]
    pub fn recv_cq(&self) -> &Cq {
        &self.recv_cq
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::fabric::sim::SimNet;
    use crate::fabric::Fabric;
    use crate::rdma::context::Context;
    use crate::rdma::cq::WcStatus;
    use crate::rdma::mr::Mr;
    use crate::rdma::wr::Sge;

    fn setup(net: &SimNet) -> (Pd, Cq) {
        let fabric: Arc<dyn Fabric> = net.add_fabric();
        let ctx = Context::open(fabric, "mlx4_0", 1).unwrap();
        let pd = Pd::alloc(&ctx).unwrap();
        let cq = Cq::new(&ctx, 256).unwrap();
        (pd, cq)
    }

    /// Connect two queue pairs on distinct simulated nodes back to back.
    fn connected_pair(net: &SimNet) -> ((Pd, Cq, Qp), (Pd, Cq, Qp)) {
        let (pd_a, cq_a) = setup(net);
        let (pd_b, cq_b) = setup(net);
        let qp_a = Qp::new(&pd_a, &cq_a, &cq_a, QpCaps::default()).unwrap();
        let qp_b = Qp::new(&pd_b, &cq_b, &cq_b, QpCaps::default()).unwrap();

        let access = Permission::default();
        qp_a.modify_reset2init(1, access).unwrap();
        qp_b.modify_reset2init(1, access).unwrap();

        let params = ConnectParams::default();
        qp_a.connect(qp_b.endpoint(), &params).unwrap();
        qp_b.connect(qp_a.endpoint(), &params).unwrap();
        ((pd_a, cq_a, qp_a), (pd_b, cq_b, qp_b))
    }

    #[test]
    fn fresh_qp_is_reset() {
        let net = SimNet::new();
        let (pd, cq) = setup(&net);
        let qp = Qp::new(&pd, &cq, &cq, QpCaps::default()).unwrap();
        assert_eq!(qp.state(), QpState::Reset);
        assert_ne!(qp.qp_num(), 0);
    }

    #[test]
    fn transitions_cannot_be_skipped() {
        let net = SimNet::new();
        let (pd, cq) = setup(&net);
        let qp = Qp::new(&pd, &cq, &cq, QpCaps::default()).unwrap();

        // Rtr straight from Reset must be rejected by the software tag.
        let err = qp
            .modify_init2rtr(QpEndpoint { lid: 1, qpn: 1 }, &ConnectParams::default())
            .unwrap_err();
        assert!(matches!(
            err,
            Error::QueuePairTransitionFailed {
                from: QpState::Reset,
                to: QpState::Rtr,
                ..
            }
        ));
        assert_eq!(qp.state(), QpState::Reset);
    }

    #[test]
    fn post_before_rts_is_rejected() {
        let net = SimNet::new();
        let (pd, cq) = setup(&net);
        let qp = Qp::new(&pd, &cq, &cq, QpCaps::default()).unwrap();
        qp.modify_reset2init(1, Permission::default()).unwrap();

        let wr = SendWr::send(vec![], 7);
        let err = qp.post_send(&wr).unwrap_err();
        assert!(matches!(err, Error::NotReady(QpState::Init)));
    }

    #[test]
    fn rtr_to_unreachable_lid_fails() {
        let net = SimNet::new();
        let (pd, cq) = setup(&net);
        let qp = Qp::new(&pd, &cq, &cq, QpCaps::default()).unwrap();
        qp.modify_reset2init(1, Permission::default()).unwrap();

        let err = qp
            .modify_init2rtr(
                QpEndpoint {
                    lid: 0xFFFF,
                    qpn: 1,
                },
                &ConnectParams::default(),
            )
            .unwrap_err();
        assert!(matches!(err, Error::QueuePairTransitionFailed { .. }));
        assert_eq!(qp.state(), QpState::Error);
    }

    #[test]
    fn rdma_write_moves_bytes() {
        let net = SimNet::new();
        let ((pd_a, cq_a, qp_a), (pd_b, _cq_b, _qp_b)) = connected_pair(&net);

        let src = b"mesh payload".to_vec();
        let dst = vec![0u8; 64];
        let src_mr = Mr::reg(&pd_a, &src, Permission::default()).unwrap();
        let dst_mr = Mr::reg(&pd_b, &dst, Permission::default()).unwrap();

        let wr = SendWr::write(vec![Sge::of(&src_mr)], dst_mr.as_remote(), 42);
        qp_a.post_send(&wr).unwrap();

        let wcs = cq_a.poll_some(8).unwrap();
        assert_eq!(wcs.len(), 1);
        assert_eq!(wcs[0].wr_id(), 42);
        assert_eq!(wcs[0].ok().unwrap(), src.len());
        assert_eq!(&dst[..src.len()], &src[..]);
    }

    #[test]
    fn send_without_posted_recv_reports_rnr() {
        let net = SimNet::new();
        let ((pd_a, cq_a, qp_a), _b) = connected_pair(&net);

        let src = vec![1u8; 8];
        let src_mr = Mr::reg(&pd_a, &src, Permission::default()).unwrap();
        qp_a.post_send(&SendWr::send(vec![Sge::of(&src_mr)], 1))
            .unwrap();

        let wcs = cq_a.poll_some(8).unwrap();
        assert_eq!(wcs.len(), 1);
        assert_eq!(wcs[0].status(), WcStatus::RnrRetryExcErr);
    }

    #[test]
    fn send_queue_overflow_is_fatal() {
        let net = SimNet::new();
        let ((pd_a, _cq_a, qp_a), (pd_b, _cq_b, _qp_b)) = connected_pair(&net);

        let src = vec![0u8; 8];
        let dst = vec![0u8; 8];
        let src_mr = Mr::reg(&pd_a, &src, Permission::default()).unwrap();
        let dst_mr = Mr::reg(&pd_b, &dst, Permission::default()).unwrap();

        // Fill the send queue without draining completions.
        let depth = qp_a.caps().max_send_wr as usize;
        for i in 0..depth {
            let wr = SendWr::write(vec![Sge::of(&src_mr)], dst_mr.as_remote(), i as u64);
            qp_a.post_send(&wr).unwrap();
        }
        let wr = SendWr::write(vec![Sge::of(&src_mr)], dst_mr.as_remote(), 99);
        let err = qp_a.post_send(&wr).unwrap_err();
        assert!(matches!(err, Error::OperationQueueOverflow));
    }
}
