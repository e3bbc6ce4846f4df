//! Communication backend abstraction for distributed solves.
//!
//! Provides a trait for cross-rank coordination (scalar reductions, halo
//! exchange), a split-phase reduction handle, and a no-op single-process
//! implementation.

/// Neighbor data for halo exchange: rank and the local indices to send/receive.
#[derive(Debug, Clone)]
pub struct HaloNeighbor {
    pub rank: usize,
    pub send_indices: Vec<usize>,
    pub recv_start: usize,
    pub recv_count: usize,
}

/// A sum-reduction that has been started but not yet completed.
///
/// Obtained from [`CommunicationBackend::start_all_reduce_sum`]. Local work
/// independent of the result may run before [`PendingReduction::wait`].
/// Dropping an unfinished reduction completes it, so peers are never left
/// waiting on a collective this rank abandoned.
pub struct PendingReduction<'a> {
    state: Option<Pending<'a>>,
}

enum Pending<'a> {
    Ready(f64),
    InFlight(Box<dyn FnOnce() -> f64 + 'a>),
}

impl<'a> PendingReduction<'a> {
    /// A reduction whose value is already known.
    pub fn ready(value: f64) -> Self {
        Self {
            state: Some(Pending::Ready(value)),
        }
    }

    /// A reduction completed by running `finish`.
    pub fn in_flight(finish: impl FnOnce() -> f64 + 'a) -> Self {
        Self {
            state: Some(Pending::InFlight(Box::new(finish))),
        }
    }

    /// Block until every rank has contributed and return the global sum.
    pub fn wait(mut self) -> f64 {
        self.complete()
    }

    fn complete(&mut self) -> f64 {
        match self.state.take() {
            Some(Pending::Ready(v)) => v,
            Some(Pending::InFlight(finish)) => finish(),
            None => 0.0,
        }
    }
}

impl Drop for PendingReduction<'_> {
    fn drop(&mut self) {
        if self.state.is_some() {
            self.complete();
        }
    }
}

/// Abstraction over inter-process communication for distributed solvers.
///
/// Implementations: `SingleProcessComm` (no-op), `ThreadComm` (ranks as
/// threads of one process), `MpiComm` (via the mpi crate).
///
/// All methods are collectives except `rank`/`num_ranks`: every rank must
/// call them in the same order.
pub trait CommunicationBackend: Send + Sync {
    /// Sum a local scalar across all ranks.
    fn all_reduce_sum(&self, local: f64) -> f64;

    /// Begin summing a local scalar across all ranks.
    ///
    /// At most one reduction may be in flight per rank, and no other
    /// collective may be issued until it is waited on. The default
    /// implementation reduces eagerly.
    fn start_all_reduce_sum(&self, local: f64) -> PendingReduction<'_> {
        PendingReduction::ready(self.all_reduce_sum(local))
    }

    /// Exchange halo boundary values with neighbor ranks.
    ///
    /// `neighbors` describes which ranks to exchange with and which local
    /// indices to send. `local_data` contains the full local vector.
    /// `recv_halo` is filled with received values in the order defined by
    /// the neighbor recv regions.
    fn halo_exchange(
        &self,
        neighbors: &[HaloNeighbor],
        local_data: &[f64],
        recv_halo: &mut [f64],
    );

    /// This process's rank (subdomain index).
    fn rank(&self) -> usize;

    /// Total number of ranks (subdomains).
    fn num_ranks(&self) -> usize;

    /// Element-wise sum of a vector across all ranks, in place.
    ///
    /// Each rank contributes its local values (zeros for non-owned positions).
    /// After the call, every rank holds the global sum. Used for reassembling
    /// a distributed solution vector.
    fn all_reduce_sum_vec(&self, local: &mut [f64]);
}

/// No-op communication backend for single-process execution.
///
/// All operations pass through unchanged. Halo exchange is a no-op
/// because there are no neighbor ranks.
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleProcessComm;

impl CommunicationBackend for SingleProcessComm {
    fn all_reduce_sum(&self, local: f64) -> f64 {
        local
    }

    fn halo_exchange(
        &self,
        _neighbors: &[HaloNeighbor],
        _local_data: &[f64],
        _recv_halo: &mut [f64],
    ) {
        // Single process: no neighbors, nothing to exchange.
    }

    fn all_reduce_sum_vec(&self, _local: &mut [f64]) {
        // Single process: vector is already complete.
    }

    fn rank(&self) -> usize {
        0
    }

    fn num_ranks(&self) -> usize {
        1
    }
}
