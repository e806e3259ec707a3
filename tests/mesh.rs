//! End-to-end mesh bring-up on the software fabric.
//!
//! Four participants laid out as two nodes of two run as threads against
//! one simulated fabric, mesh up, and move real bytes with one-sided and
//! two-sided operations.

use std::sync::Arc;
use std::thread;

use meshverbs::ctrl::{LocalRendezvous, Rendezvous};
use meshverbs::fabric::{sim::SimNet, Fabric};
use meshverbs::rdma::{MrRemote, QpState, RecvWr, SendWr, Sge, WcOpcode};
use meshverbs::{Mesh, MeshConfig};

const REGION: usize = 4096;

/// Poll until one successful completion arrives or the attempt budget runs
/// out. Panics on an error completion.
fn await_completion(mesh: &Mesh, expected: WcOpcode) -> usize {
    for _ in 0..10_000 {
        let wcs = mesh.poll(8).unwrap();
        for wc in wcs {
            assert_eq!(wc.opcode(), expected);
            return wc.ok().unwrap();
        }
        thread::yield_now();
    }
    panic!("no completion within the polling budget");
}

fn run_participant(rz: LocalRendezvous, net: SimNet) {
    let fabric = net.add_fabric() as Arc<dyn Fabric>;
    let mesh = Mesh::new(fabric, &rz, &MeshConfig::default()).unwrap();
    let (rank, size) = rz.global();
    assert_eq!((mesh.rank(), mesh.size()), (rank, size));
    assert_eq!((mesh.local_rank(), mesh.node_size()), rz.local());

    // Every endpoint record, the self loop included, names a live port
    // and queue pair.
    for peer in 0..size {
        let endpoint = mesh.endpoint(peer).unwrap();
        assert_ne!(endpoint.lid(), 0);
        assert_ne!(endpoint.qpn(), 0);
        let qp = endpoint.qp().expect("self loop is on by default");
        assert_eq!(qp.state(), QpState::Rts);
    }

    // Publish a writable region to all peers.
    let buf = vec![rank as u8; REGION];
    let mr = mesh.register_memory_region(&buf).unwrap();
    let remotes: Vec<MrRemote> = rz
        .all_gather(&serde_json::to_vec(&mr.as_remote()).unwrap())
        .unwrap()
        .iter()
        .map(|raw| serde_json::from_slice(raw).unwrap())
        .collect();

    // One-sided: rank 0 writes the first half of its region into rank 2's.
    if rank == 0 {
        let wr = SendWr::write(
            vec![Sge::of_slice(&mr, 0, REGION / 2)],
            remotes[2].slice(0, REGION / 2),
            7,
        );
        mesh.post_send(2, &wr).unwrap();
        assert_eq!(await_completion(&mesh, WcOpcode::RdmaWrite), REGION / 2);
    }
    rz.barrier().unwrap();
    if rank == 2 {
        assert!(buf[..REGION / 2].iter().all(|&b| b == 0));
        assert!(buf[REGION / 2..].iter().all(|&b| b == 2));
    }

    // Two-sided: rank 3 sends a message to rank 1. The receive is posted
    // before the barrier that releases the sender.
    if rank == 1 {
        let wr = RecvWr::new(vec![Sge::of(&mr)], 11);
        mesh.post_receive(3, &wr).unwrap();
    }
    rz.barrier().unwrap();
    if rank == 3 {
        let wr = SendWr::send(vec![Sge::of_slice(&mr, 0, 64)], 13);
        mesh.post_send(1, &wr).unwrap();
        assert_eq!(await_completion(&mesh, WcOpcode::Send), 64);
    }
    if rank == 1 {
        assert_eq!(await_completion(&mesh, WcOpcode::Recv), 64);
        assert!(buf[..64].iter().all(|&b| b == 3));
        assert!(buf[64..].iter().all(|&b| b == 1));
    }

    // One-sided read: rank 2 pulls from rank 1's region (now starting with
    // rank 3's payload).
    rz.barrier().unwrap();
    if rank == 2 {
        let scratch = vec![0u8; 64];
        let scratch_mr = mesh.register_memory_region(&scratch).unwrap();
        let wr = SendWr::read(vec![Sge::of(&scratch_mr)], remotes[1].slice(0, 64), 17);
        mesh.post_send(1, &wr).unwrap();
        assert_eq!(await_completion(&mesh, WcOpcode::RdmaRead), 64);
        assert!(scratch.iter().all(|&b| b == 3));
    }

    // Everyone must still be meshed while any peer may read or write.
    rz.barrier().unwrap();
}

#[test]
fn four_participants_on_two_nodes() {
    let net = SimNet::new();
    let group = LocalRendezvous::group(&[2, 2]);
    let handles: Vec<_> = group
        .into_iter()
        .map(|rz| {
            let net = net.clone();
            thread::spawn(move || run_participant(rz, net))
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
}

#[test]
fn poll_respects_the_requested_limit() {
    let net = SimNet::new();
    let rz = LocalRendezvous::group(&[1]).remove(0);
    let mesh = Mesh::new(net.add_fabric() as Arc<dyn Fabric>, &rz, &MeshConfig::default())
        .unwrap();
    assert!(mesh.poll(4).unwrap().is_empty());

    // Three self-loop writes produce three completions; drain them two at
    // a time.
    let buf = vec![9u8; 256];
    let mr = mesh.register_memory_region(&buf).unwrap();
    for wr_id in 0..3 {
        let wr = SendWr::write(vec![Sge::of(&mr)], mr.as_remote(), wr_id);
        mesh.post_send(0, &wr).unwrap();
    }
    let first = mesh.poll(2).unwrap();
    assert_eq!(first.len(), 2);
    let rest = mesh.poll(16).unwrap();
    assert_eq!(rest.len(), 1);
    assert!(mesh.poll(16).unwrap().is_empty());
}

#[test]
fn regions_register_independently() {
    let net = SimNet::new();
    let rz = LocalRendezvous::group(&[1]).remove(0);
    let mesh = Mesh::new(net.add_fabric() as Arc<dyn Fabric>, &rz, &MeshConfig::default())
        .unwrap();
    let buf = vec![0u8; 128];
    let a = mesh.register_memory_region(&buf).unwrap();
    let b = mesh.register_memory_region(&buf).unwrap();
    assert_ne!(a.lkey(), b.lkey());
    assert_ne!(a.rkey(), b.rkey());
}
