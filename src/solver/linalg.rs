//! Distributed vector primitives: a device kernel followed by a global reduction.

use std::cell::Cell;

use crate::error::Result;

use super::backend::Device;
use super::comm::{CommunicationBackend, PendingReduction};
use super::scalar::Scalar;

/// Device kernels paired with a communicator.
///
/// Inner products and norms are computed locally over the owned entries in
/// working precision, then summed across ranks as `f64`.
pub struct LinAlg<'a, D: Device> {
    device: &'a D,
    comm: &'a dyn CommunicationBackend,
    reductions: Cell<u32>,
}

impl<'a, D: Device> LinAlg<'a, D> {
    pub fn new(device: &'a D, comm: &'a dyn CommunicationBackend) -> Self {
        Self {
            device,
            comm,
            reductions: Cell::new(0),
        }
    }

    pub fn device(&self) -> &'a D {
        self.device
    }

    pub fn comm(&self) -> &'a dyn CommunicationBackend {
        self.comm
    }

    /// `y = alpha * x + beta * y` on the owned entries. No communication.
    pub fn axpy(
        &self,
        n: usize,
        alpha: f64,
        x: &D::WorkVector,
        beta: f64,
        y: &mut D::WorkVector,
    ) -> Result<()> {
        self.device
            .axpy(n, D::Work::from_f64(alpha), x, D::Work::from_f64(beta), y)
    }

    /// Global inner product `<x, y>`.
    pub fn inner_prod(&self, n: usize, x: &D::WorkVector, y: &D::WorkVector) -> Result<f64> {
        let local = self.device.inner_prod(n, x, y)?;
        Ok(self.all_reduce(local.to_f64()))
    }

    /// Global 2-norm `||x||`.
    pub fn norm2(&self, n: usize, x: &D::WorkVector) -> Result<f64> {
        Ok(self.inner_prod(n, x, x)?.sqrt())
    }

    /// Blocking global sum of a local value.
    pub fn all_reduce(&self, local: f64) -> f64 {
        self.reductions.set(self.reductions.get() + 1);
        self.comm.all_reduce_sum(local)
    }

    /// Split-phase global sum of a local value.
    pub fn start_all_reduce(&self, local: f64) -> PendingReduction<'a> {
        self.reductions.set(self.reductions.get() + 1);
        self.comm.start_all_reduce_sum(local)
    }

    /// Number of global reductions issued so far.
    pub fn reductions(&self) -> u32 {
        self.reductions.get()
    }
}
