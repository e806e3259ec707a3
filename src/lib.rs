//! Full-mesh RDMA queue pair bootstrap.
//!
//! This crate brings up all-to-all reliable-connection queue pair
//! connectivity across the participants of a distributed job: every rank
//! gets one queue pair per peer, endpoint addresses are exchanged over an
//! out-of-band rendezvous channel, and every queue pair is driven through
//! the `Reset -> Init -> Rtr -> Rts` state machine before anyone is allowed
//! to post.
//!
//! Hardware access goes through the [`fabric::Fabric`] trait. The
//! always-available [`fabric::sim`] backend models a fabric in process so
//! jobs can run as plain threads in tests; the `hw-verbs` feature adds a
//! `libibverbs` backend for real InfiniBand hardware.
//!
//! ```
//! use std::sync::Arc;
//! use meshverbs::ctrl::LocalRendezvous;
//! use meshverbs::fabric::{sim::SimNet, Fabric};
//! use meshverbs::{Mesh, MeshConfig};
//!
//! let net = SimNet::new();
//! let rz = LocalRendezvous::group(&[1]).remove(0);
//! let mesh = Mesh::new(net.add_fabric() as Arc<dyn Fabric>, &rz, &MeshConfig::default())?;
//!
//! assert_eq!((mesh.rank(), mesh.size()), (0, 1));
//! let buf = vec![0u8; 4096];
//! let mr = mesh.register_memory_region(&buf)?;
//! assert_ne!(mr.lkey(), mr.rkey());
//! # Ok::<(), meshverbs::Error>(())
//! ```

pub mod ctrl;
pub mod fabric;
pub mod rdma;

mod error;
mod mesh;

pub use error::{Error, Result};
pub use mesh::{Endpoint, Mesh, MeshConfig};
