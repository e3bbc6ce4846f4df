//! In-process communication backend: ranks are threads of one process.
//!
//! Every collective is a post / barrier / read / barrier sequence over shared
//! slots. Reads fold contributions in rank order, so every rank sees the
//! bit-identical result, matching what an all-reduce guarantees.

use std::collections::HashMap;
use std::sync::{Arc, Barrier, Mutex, MutexGuard, PoisonError};

use super::comm::{CommunicationBackend, HaloNeighbor, PendingReduction};

struct Shared {
    size: usize,
    barrier: Barrier,
    scalars: Mutex<Vec<f64>>,
    vectors: Mutex<Vec<Vec<f64>>>,
    /// Halo payloads keyed by (sender, receiver).
    mailbox: Mutex<HashMap<(usize, usize), Vec<f64>>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One rank of a thread-backed communicator group.
///
/// Create the whole group with [`ThreadComm::group`] and move one member
/// into each worker thread.
pub struct ThreadComm {
    rank: usize,
    shared: Arc<Shared>,
}

impl ThreadComm {
    /// Build a group of `size` ranks sharing one set of collective slots.
    pub fn group(size: usize) -> Vec<ThreadComm> {
        let shared = Arc::new(Shared {
            size,
            barrier: Barrier::new(size),
            scalars: Mutex::new(vec![0.0; size]),
            vectors: Mutex::new(vec![Vec::new(); size]),
            mailbox: Mutex::new(HashMap::new()),
        });
        (0..size)
            .map(|rank| ThreadComm {
                rank,
                shared: Arc::clone(&shared),
            })
            .collect()
    }

    fn post_scalar(&self, local: f64) {
        lock(&self.shared.scalars)[self.rank] = local;
    }

    fn sum_scalars(&self) -> f64 {
        self.shared.barrier.wait();
        let result = lock(&self.shared.scalars).iter().fold(0.0, |acc, &v| acc + v);
        // Nobody may overwrite a slot until every rank has read them all.
        self.shared.barrier.wait();
        result
    }
}

impl CommunicationBackend for ThreadComm {
    fn all_reduce_sum(&self, local: f64) -> f64 {
        self.post_scalar(local);
        self.sum_scalars()
    }

    fn start_all_reduce_sum(&self, local: f64) -> PendingReduction<'_> {
        self.post_scalar(local);
        PendingReduction::in_flight(move || self.sum_scalars())
    }

    fn halo_exchange(
        &self,
        neighbors: &[HaloNeighbor],
        local_data: &[f64],
        recv_halo: &mut [f64],
    ) {
        {
            let mut mailbox = lock(&self.shared.mailbox);
            for nbr in neighbors {
                let payload: Vec<f64> = nbr.send_indices.iter().map(|&i| local_data[i]).collect();
                mailbox.insert((self.rank, nbr.rank), payload);
            }
        }
        self.shared.barrier.wait();
        {
            let mut mailbox = lock(&self.shared.mailbox);
            for nbr in neighbors {
                let dst = &mut recv_halo[nbr.recv_start..nbr.recv_start + nbr.recv_count];
                match mailbox.remove(&(nbr.rank, self.rank)) {
                    Some(payload) => {
                        let k = payload.len().min(dst.len());
                        dst[..k].copy_from_slice(&payload[..k]);
                    }
                    None => tracing::warn!(
                        rank = self.rank,
                        peer = nbr.rank,
                        "halo exchange: no payload from neighbor"
                    ),
                }
            }
        }
        self.shared.barrier.wait();
    }

    fn rank(&self) -> usize {
        self.rank
    }

    fn num_ranks(&self) -> usize {
        self.shared.size
    }

    fn all_reduce_sum_vec(&self, local: &mut [f64]) {
        lock(&self.shared.vectors)[self.rank] = local.to_vec();
        self.shared.barrier.wait();
        {
            let vectors = lock(&self.shared.vectors);
            local.fill(0.0);
            for contribution in vectors.iter() {
                for (dst, &v) in local.iter_mut().zip(contribution) {
                    *dst += v;
                }
            }
        }
        self.shared.barrier.wait();
    }
}
