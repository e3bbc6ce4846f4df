//! Graph partitioning and subdomain mapping for distributed solves.
//!
//! A `Partitioner` assigns every global unknown to a rank. `SubdomainMap`
//! then describes one rank's view: owned unknowns first, a one-layer
//! overlap halo after, and the send/receive lists that keep the halo in
//! sync with the neighbouring owners.

use std::collections::{HashMap, HashSet};

use crate::error::{FlexcgError, Result};
use crate::sparse::CsrMatrix;

use super::comm::{CommunicationBackend, HaloNeighbor};
use super::scalar::Scalar;

/// Graph partitioner trait. Returns a partition ID per node.
pub trait Partitioner {
    fn partition(&self, adjacency: &CsrMatrix<f64>, num_parts: usize) -> Vec<usize>;
}

/// Contiguous blocks of near-equal size in index order.
///
/// For a lexicographically numbered structured grid this yields strips,
/// whose halo is one grid line per neighbour.
#[derive(Debug, Clone, Copy, Default)]
pub struct BlockPartitioner;

impl Partitioner for BlockPartitioner {
    fn partition(&self, adjacency: &CsrMatrix<f64>, num_parts: usize) -> Vec<usize> {
        let n = adjacency.nrows;
        if num_parts <= 1 || n == 0 {
            return vec![0; n];
        }
        (0..n).map(|i| i * num_parts / n).collect()
    }
}

/// Subdomain-to-global index mapping with overlap halo.
///
/// Local ordering: owned nodes first (0..n_owned), halo nodes after
/// (n_owned..n_owned+n_halo). Dot products sum over 0..n_owned, so no
/// unknown is counted twice across ranks.
#[derive(Debug, Clone)]
pub struct SubdomainMap {
    pub rank: usize,
    /// Global indices owned by this subdomain.
    pub owned_global: Vec<usize>,
    /// Global indices in the overlap halo (from neighboring partitions).
    pub halo_global: Vec<usize>,
    /// Global -> local index mapping (owned + halo).
    pub global_to_local: HashMap<usize, usize>,
    /// Ranks of neighboring subdomains (those sharing halo nodes).
    pub neighbor_ranks: Vec<usize>,
    /// Per-neighbor: local indices of owned nodes to send during halo exchange.
    pub send_indices: Vec<Vec<usize>>,
    /// Per-neighbor: local indices where received halo values are written.
    pub recv_indices: Vec<Vec<usize>>,
}

impl SubdomainMap {
    /// Build a subdomain map for the given rank from a partition assignment.
    ///
    /// Only the sparsity pattern of `adjacency` is used and it must be
    /// structurally symmetric. `parts[i]` is the partition ID for node i.
    /// `overlap_layers` is how many hops of overlap to add; the halo
    /// exchange pairing assumes 1.
    pub fn build<T>(
        adjacency: &CsrMatrix<T>,
        parts: &[usize],
        rank: usize,
        overlap_layers: usize,
    ) -> Self {
        let n = adjacency.nrows;
        let neighbors_of = |node: usize| {
            adjacency.col_indices[adjacency.row_pointers[node]..adjacency.row_pointers[node + 1]]
                .iter()
                .copied()
        };

        let owned_global: Vec<usize> = (0..n).filter(|&i| parts[i] == rank).collect();
        let owned_set: HashSet<usize> = owned_global.iter().copied().collect();

        // Expand by overlap_layers hops to find halo nodes.
        let mut frontier: HashSet<usize> = owned_set.clone();
        let mut all_nodes: HashSet<usize> = owned_set.clone();
        for _ in 0..overlap_layers {
            let mut next_frontier = HashSet::new();
            for &node in &frontier {
                for neighbor in neighbors_of(node) {
                    if !all_nodes.contains(&neighbor) {
                        next_frontier.insert(neighbor);
                    }
                }
            }
            all_nodes.extend(&next_frontier);
            frontier = next_frontier;
        }

        let mut halo_global: Vec<usize> = all_nodes.difference(&owned_set).copied().collect();
        halo_global.sort_unstable();

        let n_owned = owned_global.len();
        let mut global_to_local = HashMap::with_capacity(n_owned + halo_global.len());
        for (local, &global) in owned_global.iter().enumerate() {
            global_to_local.insert(global, local);
        }
        for (i, &global) in halo_global.iter().enumerate() {
            global_to_local.insert(global, n_owned + i);
        }

        // A neighbor rank is any rank that owns a halo node.
        let mut neighbor_map: HashMap<usize, Vec<usize>> = HashMap::new();
        for &halo_node in &halo_global {
            neighbor_map.entry(parts[halo_node]).or_default().push(halo_node);
        }
        let mut neighbor_ranks: Vec<usize> = neighbor_map.keys().copied().collect();
        neighbor_ranks.sort_unstable();

        // Both lists are ordered by global index, so the sender's send list
        // and the receiver's recv list pair up entry by entry.
        let mut send_indices = Vec::with_capacity(neighbor_ranks.len());
        let mut recv_indices = Vec::with_capacity(neighbor_ranks.len());
        for &nbr_rank in &neighbor_ranks {
            let recv: Vec<usize> = neighbor_map[&nbr_rank]
                .iter()
                .map(|g| global_to_local[g])
                .collect();

            let send: Vec<usize> = owned_global
                .iter()
                .enumerate()
                .filter(|&(_, &node)| neighbors_of(node).any(|c| parts[c] == nbr_rank))
                .map(|(local, _)| local)
                .collect();

            send_indices.push(send);
            recv_indices.push(recv);
        }

        SubdomainMap {
            rank,
            owned_global,
            halo_global,
            global_to_local,
            neighbor_ranks,
            send_indices,
            recv_indices,
        }
    }

    /// Number of owned nodes.
    pub fn n_owned(&self) -> usize {
        self.owned_global.len()
    }

    /// Number of halo nodes.
    pub fn n_halo(&self) -> usize {
        self.halo_global.len()
    }

    /// Total local size (owned + halo).
    pub fn local_size(&self) -> usize {
        self.n_owned() + self.n_halo()
    }

    /// Halo exchange descriptors, one per neighbor, with receive regions
    /// laid out back to back.
    pub fn neighbors(&self) -> Vec<HaloNeighbor> {
        let mut recv_start = 0;
        self.neighbor_ranks
            .iter()
            .zip(&self.send_indices)
            .zip(&self.recv_indices)
            .map(|((&rank, send), recv)| {
                let nbr = HaloNeighbor {
                    rank,
                    send_indices: send.clone(),
                    recv_start,
                    recv_count: recv.len(),
                };
                recv_start += recv.len();
                nbr
            })
            .collect()
    }

    /// Owned rows of `global`, with columns renumbered to local indices.
    ///
    /// The result is `n_owned x local_size`; applied to a local vector whose
    /// halo is current it yields the owned entries of the global product.
    pub fn restrict_matrix<T: Scalar>(&self, global: &CsrMatrix<T>) -> Result<CsrMatrix<T>> {
        let mut triplets = Vec::new();
        for (local_row, &global_row) in self.owned_global.iter().enumerate() {
            for (global_col, v) in global.row(global_row) {
                let local_col = self.global_to_local.get(&global_col).ok_or_else(|| {
                    FlexcgError::Dimension(format!(
                        "row {global_row} couples to column {global_col}, \
                         which is outside rank {}'s halo",
                        self.rank
                    ))
                })?;
                triplets.push((local_row, *local_col, v));
            }
        }
        Ok(CsrMatrix::from_triplets(
            self.n_owned(),
            self.local_size(),
            &triplets,
        ))
    }

    /// Local vector (owned then halo) read from a global one.
    pub fn scatter<T: Copy>(&self, global: &[T]) -> Vec<T> {
        self.owned_global
            .iter()
            .chain(&self.halo_global)
            .map(|&g| global[g])
            .collect()
    }

    /// Write this rank's owned entries of `local` into `global`.
    pub fn gather_into<T: Copy>(&self, local: &[T], global: &mut [T]) {
        for (&g, &v) in self.owned_global.iter().zip(local) {
            global[g] = v;
        }
    }

    /// Reassemble a global vector on every rank from each rank's owned
    /// entries. Collective.
    pub fn assemble<T: Scalar>(
        &self,
        local: &[T],
        n_global: usize,
        comm: &dyn CommunicationBackend,
    ) -> Vec<f64> {
        let mut global = vec![0.0; n_global];
        for (&g, &v) in self.owned_global.iter().zip(local) {
            global[g] = v.to_f64();
        }
        comm.all_reduce_sum_vec(&mut global);
        global
    }
}

/// Reusable halo synchronisation for one subdomain.
///
/// The communicator moves `f64`; vectors of other precisions are staged
/// through scratch buffers kept across calls.
pub struct HaloExchange {
    neighbors: Vec<HaloNeighbor>,
    recv_indices: Vec<usize>,
    send_scratch: Vec<f64>,
    recv_scratch: Vec<f64>,
}

impl HaloExchange {
    pub fn new(map: &SubdomainMap) -> Self {
        let recv_indices: Vec<usize> = map.recv_indices.iter().flatten().copied().collect();
        Self {
            neighbors: map.neighbors(),
            recv_scratch: vec![0.0; recv_indices.len()],
            send_scratch: vec![0.0; map.n_owned()],
            recv_indices,
        }
    }

    /// Overwrite the halo entries of `data` with the owners' values.
    /// Collective: every rank of the group must call it.
    pub fn exchange<T: Scalar>(&mut self, comm: &dyn CommunicationBackend, data: &mut [T]) {
        for nbr in &self.neighbors {
            for &i in &nbr.send_indices {
                self.send_scratch[i] = data[i].to_f64();
            }
        }
        comm.halo_exchange(&self.neighbors, &self.send_scratch, &mut self.recv_scratch);
        for (&idx, &v) in self.recv_indices.iter().zip(&self.recv_scratch) {
            data[idx] = T::from_f64(v);
        }
    }
}
