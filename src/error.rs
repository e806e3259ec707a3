//! Crate-wide error taxonomy.
//!
//! Setup-phase errors (device selection, resource allocation, queue pair
//! transitions, the bootstrap exchange) leave the process unable to
//! participate in the job at all; callers are expected to abort on them.
//! Steady-state errors (a failed registration, a full send queue) are local
//! to the call site and never trigger an automatic retry.

use std::io;

use thiserror::Error;

use crate::rdma::qp::QpState;
use crate::rdma::types::PortNum;

/// Errors produced by this crate.
#[derive(Debug, Error)]
pub enum Error {
    /// The requested device name matched no local RDMA device.
    #[error("no RDMA device named `{0}`")]
    NoSuchDevice(String),

    /// The requested port does not exist on the device or is not active.
    #[error("no active port {port} on device `{device}`")]
    NoSuchPort {
        /// Name of the opened device.
        device: String,
        /// The offending port number.
        port: PortNum,
    },

    /// The driver or hardware refused to allocate a resource.
    #[error("failed to allocate {what}: {source}")]
    ResourceExhausted {
        /// What was being allocated.
        what: &'static str,
        #[source]
        source: io::Error,
    },

    /// A queue pair state transition was rejected.
    ///
    /// This is fatal and never retried: it usually indicates a fabric-level
    /// misconfiguration (wrong device/port pairing, unreachable remote), and
    /// a half-connected mesh has no safe degraded mode.
    #[error("queue pair transition {from:?} -> {to:?} failed: {source}")]
    QueuePairTransitionFailed {
        /// State the queue pair was in.
        from: QpState,
        /// State the transition targeted.
        to: QpState,
        #[source]
        source: io::Error,
    },

    /// Memory registration was rejected (bad address range, or size or
    /// permission limits exceeded). Fatal only to the registering call.
    #[error("memory registration failed: {0}")]
    RegistrationFailed(#[source] io::Error),

    /// The send queue capacity was exceeded.
    ///
    /// No backpressure or retry happens at this layer; callers size their
    /// queues and drain completions.
    #[error("send queue overflow; operation rate exceeds queue capacity")]
    OperationQueueOverflow,

    /// A work request was posted to a queue pair that has not completed the
    /// state machine transitions required to accept it.
    #[error("queue pair in state {0:?} cannot accept this work request")]
    NotReady(QpState),

    /// A rank outside `0..job_size` was addressed.
    #[error("rank {rank} out of range for job of size {size}")]
    NoSuchRank {
        /// The offending rank.
        rank: usize,
        /// Job size.
        size: usize,
    },

    /// An operation addressed the local rank, but the mesh was built without
    /// a self-loop queue pair.
    #[error("self-communication is disabled for this mesh")]
    SelfLoopDisabled,

    /// The mesh has already been finalized.
    #[error("mesh has been finalized")]
    Finalized,

    /// The rendezvous channel failed during setup.
    #[error("rendezvous channel failure: {0}")]
    Rendezvous(String),

    /// Any other I/O error from the fabric layer.
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Crate-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Map an I/O error coming back from a post operation.
    ///
    /// `ENOMEM` from the driver means the queue had no free slot.
    pub(crate) fn from_post(err: io::Error) -> Self {
        match err.raw_os_error() {
            Some(code) if code == libc::ENOMEM => Error::OperationQueueOverflow,
            _ => Error::Io(err),
        }
    }

    /// Wrap a rendezvous transport error with context.
    pub(crate) fn rendezvous(ctx: &str, err: impl std::fmt::Display) -> Self {
        Error::Rendezvous(format!("{ctx}: {err}"))
    }
}
