//! Host-side operators: assembled CSR, the matrix-free screened Poisson
//! stencil, and a distributed wrapper that refreshes the halo before each
//! local product.

use std::sync::Arc;

use rayon::prelude::*;

use crate::error::{FlexcgError, Result};
use crate::sparse::CsrMatrix;

use super::comm::CommunicationBackend;
use super::partition::{HaloExchange, SubdomainMap};
use super::scalar::Scalar;
use super::Operator;

fn check_lengths(what: &str, input: usize, need_in: usize, output: usize, need_out: usize) -> Result<()> {
    if input < need_in || output < need_out {
        return Err(FlexcgError::Dimension(format!(
            "{what}: input holds {input} of {need_in} entries, output {output} of {need_out}"
        )));
    }
    Ok(())
}

impl<T: Scalar> Operator<Vec<T>> for CsrMatrix<T> {
    fn apply(&mut self, input: &Vec<T>, output: &mut Vec<T>) -> Result<()> {
        check_lengths("csr", input.len(), self.ncols, output.len(), self.nrows)?;
        self.spmv_into(input, output);
        Ok(())
    }
}

/// Matrix-free `-Δ + λ` on an `nx x ny` grid, five-point stencil with
/// homogeneous Dirichlet boundaries and unit grid spacing.
///
/// Unknowns are numbered row-major (`i + nx * j`). The operator is SPD for
/// `λ >= 0`; `λ` plays the role of the Helmholtz shift in the implicit
/// viscous and pressure solves.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Laplacian2d {
    pub nx: usize,
    pub ny: usize,
    pub lambda: f64,
}

impl Laplacian2d {
    pub fn new(nx: usize, ny: usize, lambda: f64) -> Self {
        Self { nx, ny, lambda }
    }

    pub fn n(&self) -> usize {
        self.nx * self.ny
    }

    pub fn diagonal_value(&self) -> f64 {
        4.0 + self.lambda
    }

    /// Assemble the same operator as a CSR matrix.
    pub fn to_csr<T: Scalar>(&self) -> CsrMatrix<T> {
        let (nx, ny) = (self.nx, self.ny);
        let diag = T::from_f64(self.diagonal_value());
        let off = T::from_f64(-1.0);
        let mut triplets = Vec::with_capacity(5 * self.n());
        for j in 0..ny {
            for i in 0..nx {
                let k = i + nx * j;
                triplets.push((k, k, diag));
                if i > 0 {
                    triplets.push((k, k - 1, off));
                }
                if i + 1 < nx {
                    triplets.push((k, k + 1, off));
                }
                if j > 0 {
                    triplets.push((k, k - nx, off));
                }
                if j + 1 < ny {
                    triplets.push((k, k + nx, off));
                }
            }
        }
        CsrMatrix::from_triplets(self.n(), self.n(), &triplets)
    }
}

impl<T: Scalar> Operator<Vec<T>> for Laplacian2d {
    fn apply(&mut self, input: &Vec<T>, output: &mut Vec<T>) -> Result<()> {
        let n = self.n();
        check_lengths("laplacian", input.len(), n, output.len(), n)?;
        if n == 0 {
            return Ok(());
        }
        let (nx, ny) = (self.nx, self.ny);
        let diag = T::from_f64(self.diagonal_value());
        output[..n]
            .par_chunks_mut(nx)
            .enumerate()
            .for_each(|(j, row)| {
                let base = nx * j;
                for (i, out) in row.iter_mut().enumerate() {
                    let k = base + i;
                    let mut v = diag * input[k];
                    if i > 0 {
                        v = v - input[k - 1];
                    }
                    if i + 1 < nx {
                        v = v - input[k + 1];
                    }
                    if j > 0 {
                        v = v - input[k - nx];
                    }
                    if j + 1 < ny {
                        v = v - input[k + nx];
                    }
                    *out = v;
                }
            });
        Ok(())
    }
}

/// One rank's share of a distributed CSR operator.
///
/// `apply` copies the owned entries of the input, pulls the halo from the
/// neighbouring owners, and multiplies by the owned rows of the global
/// matrix. Collective: all ranks must apply together.
pub struct DistributedOperator<T> {
    local: CsrMatrix<T>,
    map: SubdomainMap,
    halo: HaloExchange,
    comm: Arc<dyn CommunicationBackend>,
    scratch: Vec<T>,
}

impl<T: Scalar> DistributedOperator<T> {
    pub fn new(
        global: &CsrMatrix<T>,
        map: SubdomainMap,
        comm: Arc<dyn CommunicationBackend>,
    ) -> Result<Self> {
        let local = map.restrict_matrix(global)?;
        let halo = HaloExchange::new(&map);
        let scratch = vec![T::ZERO; map.local_size()];
        tracing::debug!(
            rank = map.rank,
            n_owned = map.n_owned(),
            n_halo = map.n_halo(),
            nnz = local.nnz(),
            "distributed operator built"
        );
        Ok(Self {
            local,
            map,
            halo,
            comm,
            scratch,
        })
    }

    pub fn map(&self) -> &SubdomainMap {
        &self.map
    }

    /// Owned rows in local column numbering.
    pub fn local_matrix(&self) -> &CsrMatrix<T> {
        &self.local
    }
}

impl<T: Scalar> Operator<Vec<T>> for DistributedOperator<T> {
    fn apply(&mut self, input: &Vec<T>, output: &mut Vec<T>) -> Result<()> {
        let n_owned = self.map.n_owned();
        check_lengths("distributed", input.len(), n_owned, output.len(), n_owned)?;
        self.scratch[..n_owned].copy_from_slice(&input[..n_owned]);
        self.halo.exchange(self.comm.as_ref(), &mut self.scratch);
        self.local.spmv_into(&self.scratch, output);
        Ok(())
    }
}
