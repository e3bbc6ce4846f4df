//! MPI communicator over `MPI_COMM_WORLD`.
//!
//! Requires the `distributed` feature flag and an MPI installation.
//! Initialize MPI and keep the universe alive for as long as any `MpiComm`
//! is in use:
//!
//! ```ignore
//! let universe = mpi::initialize().expect("MPI init failed");
//! let comm = MpiComm::new();
//! ```
//!
//! Reductions are blocking, including `start_all_reduce_sum` (the trait's
//! eager default): rsmpi only hands out non-blocking collective requests
//! inside a lexical `scope`, and the PCG driver's `PendingReduction` outlives
//! any scope this backend could open. The driver issues its `x` update before
//! starting the residual reduction, so device work still overlaps it. Halo
//! exchange is non-blocking: all receives and sends are posted, then waited
//! on together.

use mpi::collective::SystemOperation;
use mpi::request::{self, Request};
use mpi::topology::SimpleCommunicator;
use mpi::traits::*;

use super::comm::{CommunicationBackend, HaloNeighbor};

/// Stateless handle; each call looks up the world communicator.
#[derive(Debug, Clone, Copy, Default)]
pub struct MpiComm;

impl MpiComm {
    pub fn new() -> Self {
        Self
    }

    fn world() -> SimpleCommunicator {
        SimpleCommunicator::world()
    }
}

/// Carve `recv_halo` into one disjoint slice per neighbor.
///
/// Receive regions must be ascending and non-overlapping, as
/// `SubdomainMap::neighbors` lays them out.
fn receive_regions<'h>(neighbors: &[HaloNeighbor], recv_halo: &'h mut [f64]) -> Vec<&'h mut [f64]> {
    let mut regions = Vec::with_capacity(neighbors.len());
    let mut rest = recv_halo;
    let mut offset = 0;
    for nbr in neighbors {
        let (_, tail) = rest.split_at_mut(nbr.recv_start - offset);
        let (region, tail) = tail.split_at_mut(nbr.recv_count);
        regions.push(region);
        rest = tail;
        offset = nbr.recv_start + nbr.recv_count;
    }
    regions
}

impl CommunicationBackend for MpiComm {
    fn all_reduce_sum(&self, local: f64) -> f64 {
        let mut global = 0.0f64;
        Self::world().all_reduce_into(&local, &mut global, SystemOperation::sum());
        global
    }

    fn halo_exchange(&self, neighbors: &[HaloNeighbor], local_data: &[f64], recv_halo: &mut [f64]) {
        if neighbors.is_empty() {
            return;
        }
        let world = Self::world();
        let payloads: Vec<Vec<f64>> = neighbors
            .iter()
            .map(|nbr| nbr.send_indices.iter().map(|&i| local_data[i]).collect())
            .collect();
        let regions = receive_regions(neighbors, recv_halo);

        request::scope(|scope| {
            let mut pending: Vec<Request<'_, [f64], _>> = Vec::with_capacity(2 * neighbors.len());
            for (nbr, region) in neighbors.iter().zip(regions) {
                let peer = world.process_at_rank(nbr.rank as i32);
                pending.push(peer.immediate_receive_into(scope, region));
            }
            for (nbr, payload) in neighbors.iter().zip(&payloads) {
                let peer = world.process_at_rank(nbr.rank as i32);
                pending.push(peer.immediate_send(scope, &payload[..]));
            }
            for req in pending {
                req.wait();
            }
        });
    }

    fn all_reduce_sum_vec(&self, local: &mut [f64]) {
        let contribution = local.to_vec();
        Self::world().all_reduce_into(&contribution[..], local, SystemOperation::sum());
    }

    fn rank(&self) -> usize {
        Self::world().rank() as usize
    }

    fn num_ranks(&self) -> usize {
        Self::world().size() as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn receive_regions_split_packed_halo() {
        let neighbors = vec![
            HaloNeighbor { rank: 0, send_indices: vec![], recv_start: 0, recv_count: 2 },
            HaloNeighbor { rank: 2, send_indices: vec![], recv_start: 2, recv_count: 3 },
        ];
        let mut halo = vec![0.0; 5];
        let mut regions = receive_regions(&neighbors, &mut halo);
        regions[0].fill(1.0);
        regions[1].fill(2.0);
        drop(regions);
        assert_eq!(halo, vec![1.0, 1.0, 2.0, 2.0, 2.0]);
    }
}
