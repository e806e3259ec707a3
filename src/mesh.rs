//! Full-mesh queue pair bootstrap.
//!
//! A [`Mesh`] connects every participant of a job to every other with one
//! reliable-connection queue pair per pair, all sharing a single protection
//! domain and completion queue. Construction runs the whole bring-up
//! protocol: open the device, create one queue pair per peer, exchange
//! endpoint addresses over the rendezvous channel, and drive every queue
//! pair through `Reset -> Init -> Rtr -> Rts` against its remote
//! counterpart. When [`Mesh::new`] returns on every participant, any rank
//! may issue one-sided or two-sided operations toward any other.

use std::sync::Arc;

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::ctrl::Rendezvous;
use crate::fabric::Fabric;
use crate::rdma::cq::{Cq, Wc};
use crate::rdma::mr::{Mr, Permission};
use crate::rdma::pd::Pd;
use crate::rdma::qp::{ConnectParams, Qp, QpCaps, QpEndpoint};
use crate::rdma::types::{Lid, PortNum, Qpn};
use crate::rdma::wr::{RecvWr, SendWr};
use crate::rdma::Context;
use crate::{Error, Result};

/// Settings for [`Mesh::new`]. The defaults match a stock ConnectX setup
/// and work unchanged on the software fabric.
#[derive(Debug, Clone)]
pub struct MeshConfig {
    /// Device to open.
    pub device: String,
    /// Port to use on that device.
    pub port: PortNum,
    /// Whether to also connect each participant to itself. Self-targeted
    /// operations go through the loopback queue pair like any other.
    pub self_loop: bool,
    /// Depth of the shared completion queue.
    pub completion_queue_depth: u32,
    /// Per-queue-pair capability limits.
    pub caps: QpCaps,
    /// Timing and rd-atomic parameters for connection setup. The MTU field
    /// is overwritten with the port's active MTU during bring-up.
    pub connect: ConnectParams,
}

impl Default for MeshConfig {
    fn default() -> Self {
        MeshConfig {
            device: "mlx4_0".to_owned(),
            port: 1,
            self_loop: true,
            completion_queue_depth: 256,
            caps: QpCaps::default(),
            connect: ConnectParams::default(),
        }
    }
}

/// What one participant publishes during endpoint exchange: its port LID
/// and the number of the queue pair it dedicated to each peer.
#[derive(Serialize, Deserialize)]
struct ExchangeRecord {
    lid: Lid,
    qpns: Vec<Option<Qpn>>,
}

/// The connection to one peer: its address plus the local queue pair
/// facing it. The queue pair is absent at this participant's own index
/// when the self loop is disabled.
pub struct Endpoint {
    lid: Lid,
    qpn: Qpn,
    qp: Option<Qp>,
}

impl Endpoint {
    /// The peer port's LID.
    #[inline]
    pub fn lid(&self) -> Lid {
        self.lid
    }

    /// The number of the peer's queue pair facing us.
    #[inline]
    pub fn qpn(&self) -> Qpn {
        self.qpn
    }

    /// The local queue pair facing this peer, if one exists.
    #[inline]
    pub fn qp(&self) -> Option<&Qp> {
        self.qp.as_ref()
    }
}

/// Owned hardware resources, declared in reverse teardown order so that
/// field drop order releases queue pairs before their completion queue,
/// the completion queue before the protection domain, and the protection
/// domain before the device context.
struct MeshInner {
    endpoints: Vec<Endpoint>,
    cq: Cq,
    pd: Pd,
    #[allow(dead_code)]
    ctx: Context,
}

/// A fully connected queue pair mesh over the participants of one job.
pub struct Mesh {
    inner: Option<MeshInner>,
    rank: usize,
    size: usize,
    local_rank: usize,
    node_size: usize,
}

impl Mesh {
    /// Bring up the mesh. Collective: every participant of the job must
    /// call this, and nobody returns before everyone's queue pairs are
    /// ready to receive.
    pub fn new(
        fabric: Arc<dyn Fabric>,
        rz: &dyn Rendezvous,
        config: &MeshConfig,
    ) -> Result<Self> {
        let (rank, size) = rz.global();
        let (local_rank, node_size) = rz.local();
        info!(
            "meshing rank {rank} of {size} (node slot {local_rank} of {node_size}) via {}:{}",
            config.device, config.port
        );

        let ctx = Context::open(fabric, &config.device, config.port)?;
        let pd = Pd::alloc(&ctx)?;
        let cq = Cq::new(&ctx, config.completion_queue_depth)?;

        // One queue pair per peer, all moved to Init before the exchange so
        // every published queue pair number refers to a live queue pair.
        let mut qps: Vec<Option<Qp>> = Vec::with_capacity(size);
        for peer in 0..size {
            if peer == rank && !config.self_loop {
                qps.push(None);
                continue;
            }
            let qp = Qp::new(&pd, &cq, &cq, config.caps)?;
            qp.modify_reset2init(config.port, Permission::default())?;
            qps.push(Some(qp));
        }
        debug!("rank {rank}: {} queue pairs at Init", size);

        let record = ExchangeRecord {
            lid: ctx.lid(),
            qpns: qps
                .iter()
                .map(|qp| qp.as_ref().map(|qp| qp.qp_num()))
                .collect(),
        };
        let encoded =
            serde_json::to_vec(&record).map_err(|e| Error::rendezvous("encode endpoints", e))?;
        let gathered = rz.all_gather(&encoded)?;

        let mut params = config.connect;
        params.mtu = ctx.active_mtu();

        let mut endpoints = Vec::with_capacity(size);
        for (peer, (qp, raw)) in qps.into_iter().zip(gathered.iter()).enumerate() {
            let peer_record: ExchangeRecord = serde_json::from_slice(raw)
                .map_err(|e| Error::rendezvous("decode endpoints", e))?;
            // The peer's queue pair facing us sits at our rank in its list.
            // The slot may only be empty at the peer's own index (no self
            // loop); a short or empty record is a malformed exchange.
            let qpn = match peer_record.qpns.get(rank).copied() {
                Some(Some(qpn)) => qpn,
                Some(None) if peer == rank => 0,
                _ => {
                    return Err(Error::rendezvous(
                        "decode endpoints",
                        format!(
                            "rank {peer} published no queue pair toward rank {rank}"
                        ),
                    ))
                }
            };
            if let Some(qp) = &qp {
                let remote = QpEndpoint {
                    lid: peer_record.lid,
                    qpn,
                };
                qp.connect(remote, &params)?;
                debug!(
                    "rank {rank}: connected to rank {peer} (lid {}, qpn {})",
                    remote.lid, remote.qpn
                );
            }
            endpoints.push(Endpoint {
                lid: peer_record.lid,
                qpn,
                qp,
            });
        }

        // Nobody may post toward a peer that has not reached Rts yet.
        rz.barrier()?;
        info!("rank {rank}: mesh ready");

        Ok(Mesh {
            inner: Some(MeshInner {
                endpoints,
                cq,
                pd,
                ctx,
            }),
            rank,
            size,
            local_rank,
            node_size,
        })
    }

    fn live(&self) -> Result<&MeshInner> {
        self.inner.as_ref().ok_or(Error::Finalized)
    }

    fn qp_toward(&self, rank: usize) -> Result<&Qp> {
        let inner = self.live()?;
        let endpoint = inner.endpoints.get(rank).ok_or(Error::NoSuchRank {
            rank,
            size: self.size,
        })?;
        endpoint.qp().ok_or(Error::SelfLoopDisabled)
    }

    /// This participant's rank.
    #[inline]
    pub fn rank(&self) -> usize {
        self.rank
    }

    /// Total number of participants.
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// This participant's rank within its node.
    #[inline]
    pub fn local_rank(&self) -> usize {
        self.local_rank
    }

    /// Number of participants on this node.
    #[inline]
    pub fn node_size(&self) -> usize {
        self.node_size
    }

    /// The shared protection domain.
    pub fn pd(&self) -> Result<&Pd> {
        Ok(&self.live()?.pd)
    }

    /// The connection toward the given rank.
    pub fn endpoint(&self, rank: usize) -> Result<&Endpoint> {
        let inner = self.live()?;
        inner.endpoints.get(rank).ok_or(Error::NoSuchRank {
            rank,
            size: self.size,
        })
    }

    /// Register `buf` in the mesh's protection domain with full local and
    /// remote access.
    pub fn register_memory_region<'a>(&self, buf: &'a [u8]) -> Result<Mr<'a>> {
        Mr::reg(&self.live()?.pd, buf, Permission::default())
    }

    /// Post a send-side work request toward `rank`.
    pub fn post_send(&self, rank: usize, wr: &SendWr) -> Result<()> {
        self.qp_toward(rank)?.post_send(wr)
    }

    /// Post a receive buffer for messages arriving from `rank`.
    pub fn post_receive(&self, rank: usize, wr: &RecvWr) -> Result<()> {
        self.qp_toward(rank)?.post_recv(wr)
    }

    /// Poll up to `max` completions from the shared completion queue.
    pub fn poll(&self, max: usize) -> Result<Vec<Wc>> {
        self.live()?.cq.poll_some(max)
    }

    /// Tear down every hardware resource the mesh owns. Idempotent; any
    /// operation after this fails with [`Error::Finalized`].
    pub fn finalize(&mut self) {
        if let Some(inner) = self.inner.take() {
            debug!("rank {}: finalizing mesh", self.rank);
            drop(inner);
        }
    }
}

impl Drop for Mesh {
    fn drop(&mut self) {
        self.finalize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ctrl::LocalRendezvous;
    use crate::fabric::sim::SimNet;
    use std::thread;

    fn mesh_pair(config: &MeshConfig) -> Vec<Mesh> {
        let net = SimNet::new();
        let group = LocalRendezvous::group(&[1, 1]);
        let handles: Vec<_> = group
            .into_iter()
            .map(|rz| {
                let fabric = net.add_fabric() as Arc<dyn Fabric>;
                let config = config.clone();
                thread::spawn(move || Mesh::new(fabric, &rz, &config).unwrap())
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    }

    #[test]
    fn single_participant_self_loop() {
        let net = SimNet::new();
        let group = LocalRendezvous::group(&[1]);
        let mesh = Mesh::new(
            net.add_fabric() as Arc<dyn Fabric>,
            &group[0],
            &MeshConfig::default(),
        )
        .unwrap();
        assert_eq!((mesh.rank(), mesh.size()), (0, 1));
        let endpoint = mesh.endpoint(0).unwrap();
        assert_ne!(endpoint.lid(), 0);
        assert_ne!(endpoint.qpn(), 0);
        assert!(endpoint.qp().is_some());
    }

    #[test]
    fn disabled_self_loop_rejects_self_posts() {
        let net = SimNet::new();
        let group = LocalRendezvous::group(&[1]);
        let config = MeshConfig {
            self_loop: false,
            ..MeshConfig::default()
        };
        let mesh = Mesh::new(net.add_fabric() as Arc<dyn Fabric>, &group[0], &config).unwrap();
        assert!(mesh.endpoint(0).unwrap().qp().is_none());
        let wr = SendWr::send(vec![], 1);
        assert!(matches!(
            mesh.post_send(0, &wr),
            Err(Error::SelfLoopDisabled)
        ));
    }

    #[test]
    fn out_of_range_rank_is_rejected() {
        let meshes = mesh_pair(&MeshConfig::default());
        let wr = SendWr::send(vec![], 1);
        assert!(matches!(
            meshes[0].post_send(2, &wr),
            Err(Error::NoSuchRank { rank: 2, size: 2 })
        ));
        assert!(matches!(
            meshes[0].endpoint(9),
            Err(Error::NoSuchRank { rank: 9, size: 2 })
        ));
    }

    #[test]
    fn finalize_is_idempotent() {
        let mut meshes = mesh_pair(&MeshConfig::default());
        let mut mesh = meshes.remove(0);
        mesh.finalize();
        mesh.finalize();
        assert!(matches!(mesh.poll(1), Err(Error::Finalized)));
        assert!(matches!(mesh.pd(), Err(Error::Finalized)));
        let wr = SendWr::send(vec![], 1);
        assert!(matches!(mesh.post_send(0, &wr), Err(Error::Finalized)));
    }

    /// Pretends a second participant exists whose gathered record carries
    /// no queue pair numbers at all.
    struct TruncatedExchange;

    impl Rendezvous for TruncatedExchange {
        fn global(&self) -> (usize, usize) {
            (0, 2)
        }

        fn local(&self) -> (usize, usize) {
            (0, 1)
        }

        fn all_gather(&self, data: &[u8]) -> Result<Vec<Vec<u8>>> {
            let bogus = ExchangeRecord {
                lid: 0x7,
                qpns: vec![],
            };
            Ok(vec![data.to_vec(), serde_json::to_vec(&bogus).unwrap()])
        }

        fn barrier(&self) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn short_exchange_record_fails_the_handshake() {
        let net = SimNet::new();
        let err = Mesh::new(
            net.add_fabric() as Arc<dyn Fabric>,
            &TruncatedExchange,
            &MeshConfig::default(),
        )
        .err()
        .unwrap();
        assert!(matches!(err, Error::Rendezvous(_)));
    }

    #[test]
    fn failed_open_leaks_nothing() {
        let net = SimNet::new();
        let fabric = net.add_fabric();
        let group = LocalRendezvous::group(&[1]);
        let config = MeshConfig {
            device: "mlx9_9".to_owned(),
            ..MeshConfig::default()
        };
        let err = Mesh::new(fabric.clone() as Arc<dyn Fabric>, &group[0], &config)
            .err()
            .unwrap();
        assert!(matches!(err, Error::NoSuchDevice(_)));
        let live = fabric.live_resources();
        assert_eq!(live.open_devices, 0);
        assert_eq!(live.pds, 0);
        assert_eq!(live.cqs, 0);
        assert_eq!(live.qps, 0);
    }
}
