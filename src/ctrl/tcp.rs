//! Socket-based rendezvous for multi-process jobs.
//!
//! One participant binds the configured root address and becomes the
//! coordinator; the others connect to it. The coordinator groups
//! participants by node identity, hands out contiguous rank ranges per
//! node, and relays gathers and barriers over the persistent streams it
//! keeps to every other participant.

use std::collections::BTreeMap;
use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::Path;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use log::{debug, info};
use serde::{Deserialize, Serialize};

use super::Rendezvous;
use crate::{Error, Result};

/// Write a length-prefixed frame.
fn stream_write(stream: &mut TcpStream, data: &[u8]) -> io::Result<()> {
    stream.write_all(&(data.len() as u32).to_le_bytes())?;
    stream.write_all(data)?;
    Ok(())
}

/// Read a length-prefixed frame.
fn stream_read(stream: &mut TcpStream) -> io::Result<Vec<u8>> {
    let mut len = [0u8; 4];
    stream.read_exact(&mut len)?;
    let mut buf = vec![0u8; u32::from_le_bytes(len) as usize];
    stream.read_exact(&mut buf)?;
    Ok(buf)
}

/// Settings for [`TcpRendezvous::bootstrap`].
#[derive(Debug, Clone, Deserialize)]
pub struct BootstrapConfig {
    /// Address the coordinator listens on, `host:port`.
    pub root: String,
    /// Total number of participants in the job.
    pub size: usize,
    /// Node identity used for rank grouping. Defaults to the local IP
    /// address, which places co-located processes on the same node.
    #[serde(default)]
    pub node: Option<String>,
}

impl BootstrapConfig {
    /// Create a config with the default node identity.
    pub fn new(root: impl Into<String>, size: usize) -> Self {
        Self {
            root: root.into(),
            size,
            node: None,
        }
    }

    /// Load settings from the `[bootstrap]` table of a TOML file.
    pub fn load_toml(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let value: toml::Value =
            toml::from_str(&text).map_err(|e| Error::rendezvous("config parse", e))?;
        let table = value
            .get("bootstrap")
            .ok_or_else(|| Error::rendezvous("config parse", "missing [bootstrap] table"))?;
        table
            .clone()
            .try_into()
            .map_err(|e| Error::rendezvous("config parse", e))
    }

    fn node_key(&self) -> String {
        if let Some(node) = &self.node {
            return node.clone();
        }
        match local_ip_address::local_ip() {
            Ok(ip) => ip.to_string(),
            Err(_) => "localhost".to_owned(),
        }
    }
}

#[derive(Serialize, Deserialize)]
struct Hello {
    node: String,
}

#[derive(Clone, Serialize, Deserialize)]
struct Assignment {
    rank: usize,
    size: usize,
    local_rank: usize,
    node_size: usize,
}

enum Role {
    /// Coordinator, holding one stream per other participant keyed by the
    /// rank it assigned.
    Root { streams: Mutex<Vec<(usize, TcpStream)>> },
    Client { stream: Mutex<TcpStream> },
}

/// Socket-based bootstrap channel.
pub struct TcpRendezvous {
    rank: usize,
    size: usize,
    local_rank: usize,
    node_size: usize,
    role: Role,
}

const CONNECT_ATTEMPTS: u32 = 100;
const CONNECT_DELAY: Duration = Duration::from_millis(100);

impl TcpRendezvous {
    /// Join the job described by `config`.
    ///
    /// Whichever participant manages to bind the root address becomes the
    /// coordinator; everyone else connects to it. Blocks until all `size`
    /// participants have joined and ranks are assigned.
    pub fn bootstrap(config: &BootstrapConfig) -> Result<Self> {
        if config.size == 0 {
            return Err(Error::rendezvous("bootstrap", "job size must be positive"));
        }
        match TcpListener::bind(&config.root) {
            Ok(listener) => Self::run_root(config, listener),
            Err(e) if e.kind() == io::ErrorKind::AddrInUse => Self::run_client(config),
            Err(e) => Err(Error::rendezvous("bind root address", e)),
        }
    }

    fn run_root(config: &BootstrapConfig, listener: TcpListener) -> Result<Self> {
        info!(
            "coordinating bootstrap of {} participants on {}",
            config.size, config.root
        );

        // Index 0 is the coordinator itself; the rest arrive over TCP.
        let mut nodes = vec![config.node_key()];
        let mut streams = Vec::with_capacity(config.size - 1);
        for _ in 1..config.size {
            let (mut stream, addr) = listener
                .accept()
                .map_err(|e| Error::rendezvous("accept participant", e))?;
            stream
                .set_nodelay(true)
                .map_err(|e| Error::rendezvous("accept participant", e))?;
            let hello: Hello = serde_json::from_slice(
                &stream_read(&mut stream).map_err(|e| Error::rendezvous("read hello", e))?,
            )
            .map_err(|e| Error::rendezvous("decode hello", e))?;
            debug!("participant from {addr} on node {}", hello.node);
            nodes.push(hello.node);
            streams.push(stream);
        }

        // Group participants by node so each node owns a contiguous rank
        // range. BTreeMap keeps the node order deterministic across runs.
        let mut by_node: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
        for (idx, node) in nodes.iter().enumerate() {
            by_node.entry(node).or_default().push(idx);
        }
        let mut assignments = vec![
            Assignment {
                rank: 0,
                size: config.size,
                local_rank: 0,
                node_size: 0,
            };
            config.size
        ];
        let mut next_rank = 0;
        for members in by_node.values() {
            for (local_rank, &idx) in members.iter().enumerate() {
                assignments[idx] = Assignment {
                    rank: next_rank,
                    size: config.size,
                    local_rank,
                    node_size: members.len(),
                };
                next_rank += 1;
            }
        }

        let mut ranked = Vec::with_capacity(streams.len());
        for (mut stream, assignment) in streams.into_iter().zip(assignments.iter().skip(1)) {
            let frame = serde_json::to_vec(assignment)
                .map_err(|e| Error::rendezvous("encode assignment", e))?;
            stream_write(&mut stream, &frame)
                .map_err(|e| Error::rendezvous("send assignment", e))?;
            ranked.push((assignment.rank, stream));
        }

        let own = &assignments[0];
        info!(
            "bootstrap complete, this participant is rank {} of {}",
            own.rank, own.size
        );
        Ok(Self {
            rank: own.rank,
            size: own.size,
            local_rank: own.local_rank,
            node_size: own.node_size,
            role: Role::Root {
                streams: Mutex::new(ranked),
            },
        })
    }

    fn run_client(config: &BootstrapConfig) -> Result<Self> {
        let mut stream = Self::connect_with_retry(&config.root)?;
        stream
            .set_nodelay(true)
            .map_err(|e| Error::rendezvous("connect root", e))?;
        let hello = serde_json::to_vec(&Hello {
            node: config.node_key(),
        })
        .map_err(|e| Error::rendezvous("encode hello", e))?;
        stream_write(&mut stream, &hello).map_err(|e| Error::rendezvous("send hello", e))?;

        let assignment: Assignment = serde_json::from_slice(
            &stream_read(&mut stream).map_err(|e| Error::rendezvous("read assignment", e))?,
        )
        .map_err(|e| Error::rendezvous("decode assignment", e))?;
        info!(
            "bootstrap complete, this participant is rank {} of {}",
            assignment.rank, assignment.size
        );
        Ok(Self {
            rank: assignment.rank,
            size: assignment.size,
            local_rank: assignment.local_rank,
            node_size: assignment.node_size,
            role: Role::Client {
                stream: Mutex::new(stream),
            },
        })
    }

    fn connect_with_retry(addr: &str) -> Result<TcpStream> {
        let mut last = None;
        for _ in 0..CONNECT_ATTEMPTS {
            match TcpStream::connect(addr) {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    last = Some(e);
                    thread::sleep(CONNECT_DELAY);
                }
            }
        }
        Err(Error::rendezvous(
            "connect root",
            last.unwrap_or_else(|| io::Error::from(io::ErrorKind::TimedOut)),
        ))
    }
}

impl Rendezvous for TcpRendezvous {
    fn global(&self) -> (usize, usize) {
        (self.rank, self.size)
    }

    fn local(&self) -> (usize, usize) {
        (self.local_rank, self.node_size)
    }

    fn all_gather(&self, data: &[u8]) -> Result<Vec<Vec<u8>>> {
        match &self.role {
            Role::Root { streams } => {
                let mut streams = streams
                    .lock()
                    .map_err(|e| Error::rendezvous("gather", e.to_string()))?;
                let mut parts = vec![Vec::new(); self.size];
                parts[self.rank] = data.to_vec();
                for (rank, stream) in streams.iter_mut() {
                    parts[*rank] =
                        stream_read(stream).map_err(|e| Error::rendezvous("gather", e))?;
                }
                let frame = serde_json::to_vec(&parts)
                    .map_err(|e| Error::rendezvous("encode gather", e))?;
                for (_, stream) in streams.iter_mut() {
                    stream_write(stream, &frame)
                        .map_err(|e| Error::rendezvous("broadcast gather", e))?;
                }
                Ok(parts)
            }
            Role::Client { stream } => {
                let mut stream = stream
                    .lock()
                    .map_err(|e| Error::rendezvous("gather", e.to_string()))?;
                stream_write(&mut stream, data).map_err(|e| Error::rendezvous("gather", e))?;
                let frame =
                    stream_read(&mut stream).map_err(|e| Error::rendezvous("gather", e))?;
                serde_json::from_slice(&frame)
                    .map_err(|e| Error::rendezvous("decode gather", e))
            }
        }
    }

    fn barrier(&self) -> Result<()> {
        // A gather of empty frames is a barrier: nobody leaves before the
        // coordinator has heard from everyone.
        self.all_gather(&[]).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn free_port_addr() -> String {
        // Bind port 0, note the port, release it. The race window before
        // the coordinator rebinds it is negligible in tests.
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        addr.to_string()
    }

    #[test]
    fn three_participants_agree_on_ranks() {
        let addr = free_port_addr();
        let handles: Vec<_> = (0..3)
            .map(|i| {
                let mut config = BootstrapConfig::new(addr.clone(), 3);
                config.node = Some(format!("node{}", i % 2));
                thread::spawn(move || {
                    let rz = TcpRendezvous::bootstrap(&config).unwrap();
                    let (rank, size) = rz.global();
                    assert_eq!(size, 3);
                    let gathered = rz.all_gather(&[rank as u8]).unwrap();
                    assert_eq!(gathered.len(), 3);
                    for (r, part) in gathered.iter().enumerate() {
                        assert_eq!(part, &[r as u8]);
                    }
                    rz.barrier().unwrap();
                    rank
                })
            })
            .collect();
        let mut ranks: Vec<usize> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        ranks.sort_unstable();
        assert_eq!(ranks, vec![0, 1, 2]);
    }

    #[test]
    fn co_located_participants_get_contiguous_ranks() {
        let addr = free_port_addr();
        let handles: Vec<_> = ["a", "b", "a", "b"]
            .iter()
            .map(|node| {
                let mut config = BootstrapConfig::new(addr.clone(), 4);
                config.node = Some((*node).to_owned());
                thread::spawn(move || {
                    let rz = TcpRendezvous::bootstrap(&config).unwrap();
                    let (rank, _) = rz.global();
                    let (local_rank, node_size) = rz.local();
                    rz.barrier().unwrap();
                    (rank, local_rank, node_size)
                })
            })
            .collect();
        let mut results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        results.sort_unstable();
        // Node "a" owns ranks 0..2 and node "b" ranks 2..4.
        assert_eq!(
            results,
            vec![(0, 0, 2), (1, 1, 2), (2, 0, 2), (3, 1, 2)]
        );
    }

    #[test]
    fn zero_size_is_rejected() {
        let config = BootstrapConfig::new("127.0.0.1:9", 0);
        assert!(matches!(
            TcpRendezvous::bootstrap(&config),
            Err(Error::Rendezvous(_))
        ));
    }
}
