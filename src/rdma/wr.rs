//! Work request types.

use super::mr::{Mr, MrRemote};
use super::types::{ImmData, LKey, WrId};

/// A scatter/gather element: one span of registered local memory.
#[derive(Debug, Clone, Copy)]
pub struct Sge {
    /// Start address.
    pub addr: u64,
    /// Length in bytes.
    pub len: u32,
    /// Local key of the memory region containing the span.
    pub lkey: LKey,
}

impl Sge {
    /// Create a scatter/gather element from raw parts.
    pub fn new(addr: u64, len: u32, lkey: LKey) -> Self {
        Self { addr, len, lkey }
    }

    /// A scatter/gather element covering an entire memory region.
    pub fn of(mr: &Mr<'_>) -> Self {
        Self {
            addr: mr.addr() as u64,
            len: mr.len() as u32,
            lkey: mr.lkey(),
        }
    }

    /// A scatter/gather element covering `len` bytes of `mr` at `offset`.
    ///
    /// # Panics
    ///
    /// Panics if the requested range is out of bounds.
    pub fn of_slice(mr: &Mr<'_>, offset: usize, len: usize) -> Self {
        assert!(offset + len <= mr.len(), "slice out of bounds");
        Self {
            addr: (mr.addr() + offset) as u64,
            len: len as u32,
            lkey: mr.lkey(),
        }
    }
}

/// The operation a send-type work request performs.
#[derive(Debug, Clone)]
pub enum SendOp {
    /// Two-sided send, consuming a receive buffer at the remote end.
    Send {
        /// Optional immediate data.
        imm: Option<ImmData>,
        /// Copy the payload into the work request instead of referencing
        /// registered memory. Only valid for payloads at or below the queue
        /// pair's inline threshold; improves message rate for tiny payloads.
        inline: bool,
    },

    /// One-sided RDMA write into remote memory.
    Write {
        /// Remote destination.
        remote: MrRemote,
        /// Optional immediate data (consumes a remote receive if present).
        imm: Option<ImmData>,
    },

    /// One-sided RDMA read from remote memory.
    Read {
        /// Remote source.
        remote: MrRemote,
    },
}

/// Send-type work request: an RDMA read, RDMA write, or two-sided send.
#[derive(Debug, Clone)]
pub struct SendWr {
    /// Caller-chosen identifier, reported back in the completion.
    pub wr_id: WrId,
    /// Local scatter/gather list (data source, or destination for reads).
    pub sgl: Vec<Sge>,
    /// The operation to perform.
    pub op: SendOp,
    /// Whether to generate a completion entry for this request.
    pub signaled: bool,
}

impl SendWr {
    /// A signaled two-sided send.
    pub fn send(sgl: Vec<Sge>, wr_id: WrId) -> Self {
        Self {
            wr_id,
            sgl,
            op: SendOp::Send {
                imm: None,
                inline: false,
            },
            signaled: true,
        }
    }

    /// A signaled RDMA write to `remote`.
    pub fn write(sgl: Vec<Sge>, remote: MrRemote, wr_id: WrId) -> Self {
        Self {
            wr_id,
            sgl,
            op: SendOp::Write { remote, imm: None },
            signaled: true,
        }
    }

    /// A signaled RDMA read from `remote`.
    pub fn read(sgl: Vec<Sge>, remote: MrRemote, wr_id: WrId) -> Self {
        Self {
            wr_id,
            sgl,
            op: SendOp::Read { remote },
            signaled: true,
        }
    }

    /// Total payload length in bytes.
    pub fn payload_len(&self) -> usize {
        self.sgl.iter().map(|sge| sge.len as usize).sum()
    }
}

/// Receive work request: a buffer made available for an incoming send.
#[derive(Debug, Clone)]
pub struct RecvWr {
    /// Caller-chosen identifier, reported back in the completion.
    pub wr_id: WrId,
    /// Local scatter/gather list the incoming payload is written to.
    pub sgl: Vec<Sge>,
}

impl RecvWr {
    /// A receive request scattering into `sgl`.
    pub fn new(sgl: Vec<Sge>, wr_id: WrId) -> Self {
        Self { wr_id, sgl }
    }
}
