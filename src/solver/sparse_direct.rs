//! Sparse LU reference solve.
//!
//! Used to verify iterative solutions on small problems, not inside the
//! PCG loop.

use crate::error::{FlexcgError, Result};
use crate::sparse::CsrMatrix;
use faer::prelude::*;
use faer::sparse::{SparseColMat, Triplet};

/// Solve `A x = b` with faer's sparse LU.
pub fn solve_sparse_lu(a: &CsrMatrix<f64>, b: &[f64]) -> Result<Vec<f64>> {
    let n = a.nrows;
    if a.ncols != n || b.len() != n {
        return Err(FlexcgError::Dimension(format!(
            "sparse LU: matrix is {}x{}, rhs length is {}",
            a.nrows,
            a.ncols,
            b.len()
        )));
    }
    if n == 0 {
        return Ok(Vec::new());
    }

    let mut triplets = Vec::with_capacity(a.nnz());
    for row in 0..n {
        for (col, val) in a.row(row) {
            if !val.is_finite() {
                return Err(FlexcgError::Solve("sparse LU input contains NaN/Inf".into()));
            }
            triplets.push(Triplet::new(row, col, val));
        }
    }

    let a_sp = SparseColMat::<usize, f64>::try_new_from_triplets(n, n, &triplets)
        .map_err(|e| FlexcgError::Solve(format!("sparse matrix build failed: {e:?}")))?;

    let lu = a_sp
        .sp_lu()
        .map_err(|e| FlexcgError::Solve(format!("sparse LU factorization failed: {e:?}")))?;

    let rhs = faer::Mat::<f64>::from_fn(n, 1, |i, _| b[i]);
    let x = lu.solve(rhs);

    (0..n)
        .map(|i| {
            let xi = x[(i, 0)];
            if xi.is_finite() {
                Ok(xi)
            } else {
                Err(FlexcgError::Solve("sparse LU produced NaN/Inf solution".into()))
            }
        })
        .collect()
}
