//! Out-of-band bootstrap connectivity.
//!
//! Queue pair meshing needs a side channel that exists before any RDMA
//! connectivity does: every participant must learn its rank, gather the
//! endpoints of all peers, and synchronize at a handful of points during
//! setup and teardown. The [`Rendezvous`] trait captures exactly that
//! surface; [`TcpRendezvous`] implements it over plain sockets for real
//! multi-process jobs and [`LocalRendezvous`] over shared memory for tests
//! that run all participants as threads.

mod local;
mod tcp;

pub use local::LocalRendezvous;
pub use tcp::{BootstrapConfig, TcpRendezvous};

use crate::Result;

/// A bootstrap channel connecting all participants of a job.
///
/// Ranks are dense in `0..size` and stable for the lifetime of the job.
/// Participants sharing a physical node occupy a contiguous rank range, and
/// `local()` exposes the position within that range.
pub trait Rendezvous {
    /// This participant's rank and the total number of participants.
    fn global(&self) -> (usize, usize);

    /// This participant's rank within its node and the number of
    /// participants on that node.
    fn local(&self) -> (usize, usize);

    /// Contribute `data` and collect every participant's contribution,
    /// ordered by rank. The returned vector has `size` entries and entry
    /// `rank` equals `data`.
    fn all_gather(&self, data: &[u8]) -> Result<Vec<Vec<u8>>>;

    /// Block until every participant has entered the barrier.
    fn barrier(&self) -> Result<()>;
}
