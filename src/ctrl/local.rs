//! Shared-memory rendezvous for single-process jobs.

use std::sync::{Arc, Condvar, Mutex};

use super::Rendezvous;
use crate::{Error, Result};

struct Shared {
    size: usize,
    state: Mutex<State>,
    cv: Condvar,
}

struct State {
    /// Per-rank contributions of the gather in flight.
    slots: Vec<Option<Vec<u8>>>,
    /// How many participants still have to pick up the finished gather.
    pending_reads: usize,
    /// Barrier bookkeeping. The generation counter lets a fast participant
    /// re-enter the next barrier while stragglers are still leaving this one.
    arrived: usize,
    generation: u64,
}

/// In-process rendezvous connecting the threads of one test job.
///
/// Created in bulk by [`LocalRendezvous::group`], which also fixes the
/// node layout: participants are assigned to simulated nodes in rank order.
pub struct LocalRendezvous {
    shared: Arc<Shared>,
    rank: usize,
    local_rank: usize,
    node_size: usize,
}

impl LocalRendezvous {
    /// Create one rendezvous handle per participant.
    ///
    /// `nodes` gives the number of participants on each simulated node;
    /// the job size is the sum. Handle `i` gets global rank `i`.
    ///
    /// # Panics
    ///
    /// Panics if `nodes` is empty or contains a zero.
    pub fn group(nodes: &[usize]) -> Vec<LocalRendezvous> {
        assert!(!nodes.is_empty(), "at least one node required");
        assert!(nodes.iter().all(|&n| n > 0), "empty nodes are not allowed");

        let size: usize = nodes.iter().sum();
        let shared = Arc::new(Shared {
            size,
            state: Mutex::new(State {
                slots: vec![None; size],
                pending_reads: 0,
                arrived: 0,
                generation: 0,
            }),
            cv: Condvar::new(),
        });

        let mut out = Vec::with_capacity(size);
        for &node_size in nodes {
            for local_rank in 0..node_size {
                out.push(LocalRendezvous {
                    shared: shared.clone(),
                    rank: out.len(),
                    local_rank,
                    node_size,
                });
            }
        }
        out
    }
}

impl Rendezvous for LocalRendezvous {
    fn global(&self) -> (usize, usize) {
        (self.rank, self.shared.size)
    }

    fn local(&self) -> (usize, usize) {
        (self.local_rank, self.node_size)
    }

    fn all_gather(&self, data: &[u8]) -> Result<Vec<Vec<u8>>> {
        let mut state = self
            .shared
            .state
            .lock()
            .map_err(|e| Error::rendezvous("local gather", e.to_string()))?;

        // A previous gather may still be read out by stragglers.
        while state.pending_reads > 0 && state.slots[self.rank].is_some() {
            state = self
                .shared
                .cv
                .wait(state)
                .map_err(|e| Error::rendezvous("local gather", e.to_string()))?;
        }

        state.slots[self.rank] = Some(data.to_vec());
        if state.slots.iter().all(|s| s.is_some()) {
            state.pending_reads = self.shared.size;
            self.shared.cv.notify_all();
        }
        while state.pending_reads == 0 {
            state = self
                .shared
                .cv
                .wait(state)
                .map_err(|e| Error::rendezvous("local gather", e.to_string()))?;
        }

        let out: Vec<Vec<u8>> = state
            .slots
            .iter()
            .map(|s| s.as_ref().cloned().unwrap_or_default())
            .collect();
        state.pending_reads -= 1;
        if state.pending_reads == 0 {
            for slot in &mut state.slots {
                *slot = None;
            }
            self.shared.cv.notify_all();
        }
        Ok(out)
    }

    fn barrier(&self) -> Result<()> {
        let mut state = self
            .shared
            .state
            .lock()
            .map_err(|e| Error::rendezvous("local barrier", e.to_string()))?;
        let generation = state.generation;
        state.arrived += 1;
        if state.arrived == self.shared.size {
            state.arrived = 0;
            state.generation += 1;
            self.shared.cv.notify_all();
            return Ok(());
        }
        while state.generation == generation {
            state = self
                .shared
                .cv
                .wait(state)
                .map_err(|e| Error::rendezvous("local barrier", e.to_string()))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn ranks_follow_node_layout() {
        let group = LocalRendezvous::group(&[2, 3]);
        assert_eq!(group.len(), 5);
        assert_eq!(group[0].global(), (0, 5));
        assert_eq!(group[0].local(), (0, 2));
        assert_eq!(group[1].local(), (1, 2));
        assert_eq!(group[2].global(), (2, 5));
        assert_eq!(group[2].local(), (0, 3));
        assert_eq!(group[4].local(), (2, 3));
    }

    #[test]
    fn gather_orders_by_rank() {
        let group = LocalRendezvous::group(&[1, 2]);
        let handles: Vec<_> = group
            .into_iter()
            .map(|rz| {
                thread::spawn(move || {
                    let (rank, _) = rz.global();
                    let gathered = rz.all_gather(&[rank as u8; 4]).unwrap();
                    for (i, part) in gathered.iter().enumerate() {
                        assert_eq!(part, &[i as u8; 4]);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn barriers_and_gathers_interleave() {
        let group = LocalRendezvous::group(&[4]);
        let handles: Vec<_> = group
            .into_iter()
            .map(|rz| {
                thread::spawn(move || {
                    for round in 0u8..3 {
                        rz.barrier().unwrap();
                        let gathered = rz.all_gather(&[round]).unwrap();
                        assert!(gathered.iter().all(|p| p == &[round]));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
    }
}
