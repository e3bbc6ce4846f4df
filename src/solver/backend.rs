//! Device abstraction for the solver's vector kernels.
//!
//! Defines the `Device` trait the PCG driver is written against, and
//! `HostDevice`, which runs the kernels on the rayon thread pool. The wgpu
//! implementation lives in `gpu.rs`.
//!
//! Every kernel takes the number of owned entries `n` explicitly: vectors
//! may be longer (ghost slots, pool alignment padding) and the tail is
//! never touched.

use std::any::Any;
use std::marker::PhantomData;

use rayon::prelude::*;

use crate::error::{FlexcgError, Result};

use super::scalar::Scalar;

/// Entries per alignment unit for host pool buffers (one 128-byte line of f64).
const HOST_POOL_ALIGNMENT: usize = 16;

const HOST_DOT_CHUNK: usize = 4096;

/// Abstract executor of the solver's vector kernels.
///
/// A device fixes two precisions: `Work` for the solver state (x, r, p, Ap)
/// and `Precon` for preconditioner application. Kernels may run
/// asynchronously with respect to the caller but are ordered with respect to
/// later kernels and readbacks on the same device.
pub trait Device {
    type Work: Scalar;
    type Precon: Scalar;
    type WorkVector: 'static;
    type PreconVector: 'static;

    /// Human-readable device name for logs.
    fn name(&self) -> String;

    /// Pool buffer lengths are rounded up to a multiple of this many entries.
    fn mem_pool_alignment(&self) -> usize;

    /// Allocate a working-precision vector. Contents are unspecified.
    fn alloc_work(&self, len: usize) -> Result<Self::WorkVector>;

    /// Allocate a preconditioner-precision vector. Contents are unspecified.
    fn alloc_precon(&self, len: usize) -> Result<Self::PreconVector>;

    /// Copy host data into a new working-precision vector.
    fn upload(&self, data: &[Self::Work]) -> Result<Self::WorkVector>;

    /// Copy a working-precision vector back to the host.
    fn download(&self, v: &Self::WorkVector) -> Result<Vec<Self::Work>>;

    /// Allocated length of a working vector.
    fn work_len(&self, v: &Self::WorkVector) -> usize;

    /// `y = alpha * x + beta * y` over the first `n` entries.
    ///
    /// When `beta == 0` the old contents of `y` are not read (BLAS
    /// convention), so `y` may be uninitialised pool memory.
    fn axpy(
        &self,
        n: usize,
        alpha: Self::Work,
        x: &Self::WorkVector,
        beta: Self::Work,
        y: &mut Self::WorkVector,
    ) -> Result<()>;

    /// Local (this rank only) inner product over the first `n` entries,
    /// accumulated in working precision.
    fn inner_prod(&self, n: usize, x: &Self::WorkVector, y: &Self::WorkVector)
        -> Result<Self::Work>;

    /// Fused PCG residual update: `r = r - alpha * ap` over the first `n`
    /// entries, writing one partial sum of the updated `r^2` per block into
    /// `partials[..n_blocks]`, and returning the local sum of those partials.
    ///
    /// `n_blocks` bounds the number of partial sums regardless of `n`; it
    /// must be non-zero whenever `n` is.
    fn update_pcg(
        &self,
        n: usize,
        n_blocks: usize,
        alpha: Self::Work,
        ap: &Self::WorkVector,
        r: &mut Self::WorkVector,
        partials: &mut Self::WorkVector,
    ) -> Result<Self::Work>;

    /// Convert the first `n` entries from working to preconditioner precision.
    fn narrow(&self, n: usize, src: &Self::WorkVector, dst: &mut Self::PreconVector);

    /// Convert the first `n` entries from preconditioner to working precision.
    fn widen(&self, n: usize, src: &Self::PreconVector, dst: &mut Self::WorkVector);

    /// View a working vector as a preconditioner vector when both precisions
    /// share one representation; `None` when a conversion is required.
    fn as_precon<'v>(&self, v: &'v Self::WorkVector) -> Option<&'v Self::PreconVector>;

    /// Mutable counterpart of [`Device::as_precon`].
    fn as_precon_mut<'v>(&self, v: &'v mut Self::WorkVector)
        -> Option<&'v mut Self::PreconVector>;
}

/// Host implementation of `Device` using rayon for intra-process parallelism.
///
/// `W` is the working precision, `P` the preconditioner precision.
pub struct HostDevice<W = f64, P = W> {
    _precision: PhantomData<fn() -> (W, P)>,
}

impl<W, P> HostDevice<W, P> {
    pub const fn new() -> Self {
        Self {
            _precision: PhantomData,
        }
    }
}

impl<W, P> Default for HostDevice<W, P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<W, P> Clone for HostDevice<W, P> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<W, P> Copy for HostDevice<W, P> {}

impl<W: Scalar, P: Scalar> Device for HostDevice<W, P> {
    type Work = W;
    type Precon = P;
    type WorkVector = Vec<W>;
    type PreconVector = Vec<P>;

    fn name(&self) -> String {
        format!("host({}/{})", W::NAME, P::NAME)
    }

    fn mem_pool_alignment(&self) -> usize {
        HOST_POOL_ALIGNMENT
    }

    fn alloc_work(&self, len: usize) -> Result<Vec<W>> {
        Ok(vec![W::ZERO; len])
    }

    fn alloc_precon(&self, len: usize) -> Result<Vec<P>> {
        Ok(vec![P::ZERO; len])
    }

    fn upload(&self, data: &[W]) -> Result<Vec<W>> {
        Ok(data.to_vec())
    }

    fn download(&self, v: &Vec<W>) -> Result<Vec<W>> {
        Ok(v.clone())
    }

    fn work_len(&self, v: &Vec<W>) -> usize {
        v.len()
    }

    fn axpy(&self, n: usize, alpha: W, x: &Vec<W>, beta: W, y: &mut Vec<W>) -> Result<()> {
        let (x, y) = (&x[..n], &mut y[..n]);
        if beta == W::ZERO {
            y.par_iter_mut()
                .zip(x.par_iter())
                .for_each(|(yi, &xi)| *yi = alpha * xi);
        } else {
            y.par_iter_mut()
                .zip(x.par_iter())
                .for_each(|(yi, &xi)| *yi = alpha * xi + beta * *yi);
        }
        Ok(())
    }

    fn inner_prod(&self, n: usize, x: &Vec<W>, y: &Vec<W>) -> Result<W> {
        // Fixed chunking keeps the summation order independent of scheduling.
        let partials: Vec<W> = x[..n]
            .par_chunks(HOST_DOT_CHUNK)
            .zip(y[..n].par_chunks(HOST_DOT_CHUNK))
            .map(|(xs, ys)| xs.iter().zip(ys).fold(W::ZERO, |acc, (&a, &b)| acc + a * b))
            .collect();
        Ok(partials.into_iter().fold(W::ZERO, |acc, v| acc + v))
    }

    fn update_pcg(
        &self,
        n: usize,
        n_blocks: usize,
        alpha: W,
        ap: &Vec<W>,
        r: &mut Vec<W>,
        partials: &mut Vec<W>,
    ) -> Result<W> {
        if n == 0 {
            return Ok(W::ZERO);
        }
        if n_blocks == 0 {
            return Err(FlexcgError::Dimension(format!(
                "{n} entries to update with zero reduction blocks"
            )));
        }
        if partials.len() < n_blocks {
            return Err(FlexcgError::Dimension(format!(
                "reduction staging holds {} entries, {} blocks requested",
                partials.len(),
                n_blocks
            )));
        }

        // Each block owns a contiguous span; the span count never exceeds n_blocks.
        let span = n.div_ceil(n_blocks);
        let used = n.div_ceil(span);

        r[..n]
            .par_chunks_mut(span)
            .zip(ap[..n].par_chunks(span))
            .zip(partials[..used].par_iter_mut())
            .for_each(|((r_blk, ap_blk), partial)| {
                let mut acc = W::ZERO;
                for (ri, &api) in r_blk.iter_mut().zip(ap_blk) {
                    *ri = *ri - alpha * api;
                    acc += *ri * *ri;
                }
                *partial = acc;
            });

        let mut local = W::ZERO;
        for &p in &partials[..used] {
            local += p;
        }
        Ok(local)
    }

    fn narrow(&self, n: usize, src: &Vec<W>, dst: &mut Vec<P>) {
        dst[..n]
            .par_iter_mut()
            .zip(src[..n].par_iter())
            .for_each(|(d, &s)| *d = s.cast());
    }

    fn widen(&self, n: usize, src: &Vec<P>, dst: &mut Vec<W>) {
        dst[..n]
            .par_iter_mut()
            .zip(src[..n].par_iter())
            .for_each(|(d, &s)| *d = s.cast());
    }

    fn as_precon<'v>(&self, v: &'v Vec<W>) -> Option<&'v Vec<P>> {
        (v as &dyn Any).downcast_ref::<Vec<P>>()
    }

    fn as_precon_mut<'v>(&self, v: &'v mut Vec<W>) -> Option<&'v mut Vec<P>> {
        (v as &mut dyn Any).downcast_mut::<Vec<P>>()
    }
}
