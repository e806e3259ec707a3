//! Completion queue and work completion.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use super::context::{exhausted, Context};
use super::types::{ImmData, Qpn, WrId};
use crate::error::{Error as CrateError, Result};
use crate::fabric::CqHandle;

/// Opcode of a completion queue entry.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WcOpcode {
    /// Send request.
    Send,
    /// RDMA write request.
    RdmaWrite,
    /// RDMA read request.
    RdmaRead,
    /// Receive request.
    Recv,
}

/// Status of a completion queue entry.
///
/// Error messages follow the `libibverbs` wording.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum WcStatus {
    /// Operation completed successfully.
    #[error("success")]
    Success,

    /// A local scatter/gather entry did not fit the posted buffer, or the
    /// incoming message exceeded the posted receive buffer.
    #[error("local length error")]
    LocLenErr,

    /// A local scatter/gather entry referenced memory not valid for the
    /// requested operation.
    #[error("local protection error")]
    LocProtErr,

    /// The work request was flushed because the queue pair transitioned to
    /// the error state with the request still outstanding.
    #[error("WR flush error")]
    WrFlushErr,

    /// The responder detected an invalid message on the channel.
    #[error("remote invalid request error")]
    RemInvReqErr,

    /// A protection error occurred against the remote data buffer.
    #[error("remote access error")]
    RemAccessErr,

    /// The responder could not complete the operation.
    #[error("remote operation error")]
    RemOpErr,

    /// The transport retry counter was exceeded; the remote side stopped
    /// responding, or was never reachable.
    #[error("transport retry counter exceeded")]
    RetryExcErr,

    /// The RNR NAK retry count was exceeded; the remote side had no receive
    /// buffer posted.
    #[error("RNR retry counter exceeded")]
    RnrRetryExcErr,

    /// Any other error.
    #[error("general error")]
    GeneralErr,
}

/// Work completion entry, as drained from a completion queue.
///
/// Completions carry the posting side's work request identifier; callers
/// needing per-peer ordering must correlate on it, since the shared
/// completion queue orders entries only by hardware completion time.
#[derive(Clone, Copy)]
pub struct Wc {
    pub(crate) wr_id: WrId,
    pub(crate) status: WcStatus,
    pub(crate) opcode: WcOpcode,
    pub(crate) byte_len: usize,
    pub(crate) qp_num: Qpn,
    pub(crate) imm: Option<ImmData>,
}

impl Wc {
    pub(crate) fn new(
        wr_id: WrId,
        status: WcStatus,
        opcode: WcOpcode,
        byte_len: usize,
        qp_num: Qpn,
        imm: Option<ImmData>,
    ) -> Self {
        Self {
            wr_id,
            status,
            opcode,
            byte_len,
            qp_num,
            imm,
        }
    }

    /// Get the work request ID.
    #[inline]
    pub fn wr_id(&self) -> WrId {
        self.wr_id
    }

    /// Get the completion status.
    #[inline]
    pub fn status(&self) -> WcStatus {
        self.status
    }

    /// Get the completion status as a `Result`.
    ///
    /// On success, returns the number of bytes processed or transferred.
    #[inline]
    pub fn ok(&self) -> std::result::Result<usize, WcStatus> {
        match self.status {
            WcStatus::Success => Ok(self.byte_len),
            status => Err(status),
        }
    }

    /// Get the opcode of the completed work request.
    #[inline]
    pub fn opcode(&self) -> WcOpcode {
        self.opcode
    }

    /// Get the number of bytes processed or transferred.
    #[inline]
    pub fn bytes(&self) -> usize {
        self.byte_len
    }

    /// Get the number of the queue pair this completion belongs to.
    #[inline]
    pub fn qp_num(&self) -> Qpn {
        self.qp_num
    }

    /// Get the immediate data, if the completion carries any.
    #[inline]
    pub fn imm(&self) -> Option<ImmData> {
        self.imm
    }
}

impl fmt::Debug for Wc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Wc")
            .field("wr_id", &self.wr_id)
            .field("status", &self.status)
            .field("opcode", &self.opcode)
            .finish()
    }
}

struct CqInner {
    ctx: Context,
    cq: CqHandle,
    depth: u32,
}

impl Drop for CqInner {
    fn drop(&mut self) {
        self.ctx.fabric().destroy_cq(self.cq);
    }
}

/// Completion queue: a bounded ring of completed-operation notifications.
///
/// One instance is shared by all queue pairs of a process; clones refer to
/// the same underlying queue. It must be drained by a single logical
/// consumer.
#[derive(Clone)]
pub struct Cq {
    inner: Arc<CqInner>,
}

impl fmt::Debug for Cq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Cq").field(&self.inner.cq).finish()
    }
}

impl Cq {
    /// Create a new completion queue of the given depth.
    ///
    /// Fails with [`CrateError::ResourceExhausted`] if the depth exceeds the
    /// device limit or the driver refuses the allocation.
    pub fn new(ctx: &Context, depth: u32) -> Result<Self> {
        if depth > ctx.attr().max_cqe {
            return Err(CrateError::ResourceExhausted {
                what: "completion queue",
                source: std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("depth {} exceeds device maximum {}", depth, ctx.attr().max_cqe),
                ),
            });
        }
        let cq = ctx
            .fabric()
            .create_cq(ctx.handle(), depth)
            .map_err(exhausted("completion queue"))?;
        Ok(Self {
            inner: Arc::new(CqInner {
                ctx: ctx.clone(),
                cq,
                depth,
            }),
        })
    }

    /// Get the underlying handle.
    #[inline]
    pub(crate) fn handle(&self) -> CqHandle {
        self.inner.cq
    }

    /// Get the underlying [`Context`].
    #[inline]
    pub fn context(&self) -> &Context {
        &self.inner.ctx
    }

    /// Get the capacity of the completion queue.
    #[inline]
    pub fn capacity(&self) -> u32 {
        self.inner.depth
    }

    /// Non-blockingly poll up to `max` work completions.
    ///
    /// Returns at most `max` entries; an empty vector means no completion
    /// was ready. It is the caller's responsibility to check the status of
    /// each returned entry.
    #[inline]
    pub fn poll_some(&self, max: usize) -> Result<Vec<Wc>> {
        let wcs = self.inner.ctx.fabric().poll_cq(self.inner.cq, max)?;
        debug_assert!(wcs.len() <= max);
        Ok(wcs)
    }

    /// Non-blockingly poll one work completion.
    #[inline]
    pub fn poll_one(&self) -> Result<Option<Wc>> {
        Ok(self.poll_some(1)?.pop())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fabric::sim::SimNet;
    use crate::fabric::Fabric;

    fn ctx() -> Context {
        let net = SimNet::new();
        let fabric: Arc<dyn Fabric> = net.add_fabric();
        Context::open(fabric, "mlx4_0", 1).unwrap()
    }

    #[test]
    fn empty_poll_returns_zero() {
        let ctx = ctx();
        let cq = Cq::new(&ctx, 256).unwrap();
        assert!(cq.poll_some(16).unwrap().is_empty());
        assert!(cq.poll_one().unwrap().is_none());
    }

    #[test]
    fn oversized_depth_is_rejected() {
        let ctx = ctx();
        let max = ctx.attr().max_cqe;
        let err = Cq::new(&ctx, max + 1).unwrap_err();
        assert!(matches!(err, CrateError::ResourceExhausted { .. }));
    }
}
