//! Host preconditioners.
//!
//! - `Identity`: `z = r`.
//! - `Jacobi`: damped diagonal scaling, `z = omega * D^{-1} r`.
//! - `InnerCg`: a fixed number of unpreconditioned CG steps on `A z = r`
//!   from a zero guess. The result depends nonlinearly on `r`, so the
//!   outer solve must use the flexible variant.
//!
//! All of them only touch the owned entries of their output.

use std::sync::Arc;

use crate::error::{FlexcgError, Result};
use crate::sparse::CsrMatrix;

use super::comm::CommunicationBackend;
use super::scalar::Scalar;
use super::Operator;

/// `z = r` on the owned entries.
#[derive(Debug, Clone, Copy)]
pub struct Identity {
    pub n: usize,
}

impl<T: Scalar> Operator<Vec<T>> for Identity {
    fn apply(&mut self, input: &Vec<T>, output: &mut Vec<T>) -> Result<()> {
        output[..self.n].copy_from_slice(&input[..self.n]);
        Ok(())
    }
}

/// Damped Jacobi: `z_i = omega * r_i / a_ii`.
#[derive(Debug, Clone)]
pub struct Jacobi<T> {
    inv_diag: Vec<T>,
}

impl<T: Scalar> Jacobi<T> {
    /// Build from the owned diagonal. Every entry must be finite and nonzero.
    pub fn from_diagonal(diag: &[f64], omega: f64) -> Result<Self> {
        let inv_diag = diag
            .iter()
            .enumerate()
            .map(|(i, &d)| {
                if d == 0.0 || !d.is_finite() {
                    Err(FlexcgError::Solve(format!(
                        "Jacobi: diagonal entry {i} is {d}"
                    )))
                } else {
                    Ok(T::from_f64(omega / d))
                }
            })
            .collect::<Result<Vec<T>>>()?;
        Ok(Self { inv_diag })
    }

    /// Build from the owned rows of a matrix (columns in local numbering).
    pub fn from_matrix<S: Scalar>(matrix: &CsrMatrix<S>, omega: f64) -> Result<Self> {
        let diag: Vec<f64> = matrix.diagonal().iter().map(|v| v.to_f64()).collect();
        Self::from_diagonal(&diag, omega)
    }

    /// Scaling factors `omega / a_ii`.
    pub fn inv_diag(&self) -> &[T] {
        &self.inv_diag
    }
}

impl<T: Scalar> Operator<Vec<T>> for Jacobi<T> {
    fn apply(&mut self, input: &Vec<T>, output: &mut Vec<T>) -> Result<()> {
        for ((z, &r), &d) in output.iter_mut().zip(input).zip(&self.inv_diag) {
            *z = d * r;
        }
        Ok(())
    }
}

/// Fixed-step inner conjugate gradient.
///
/// Inner products are reduced over `comm`, so the same number of steps runs
/// on every rank and the wrapped operator may be a distributed one.
pub struct InnerCg<A, T> {
    op: A,
    steps: usize,
    n: usize,
    comm: Arc<dyn CommunicationBackend>,
    r: Vec<T>,
    p: Vec<T>,
    ap: Vec<T>,
}

impl<A, T> InnerCg<A, T>
where
    A: Operator<Vec<T>>,
    T: Scalar,
{
    /// `n` owned entries, `n_total` including halo.
    pub fn new(
        op: A,
        n: usize,
        n_total: usize,
        steps: usize,
        comm: Arc<dyn CommunicationBackend>,
    ) -> Self {
        Self {
            op,
            steps,
            n,
            comm,
            r: vec![T::ZERO; n_total],
            p: vec![T::ZERO; n_total],
            ap: vec![T::ZERO; n_total],
        }
    }

    fn dot(&self, x: &[T], y: &[T]) -> f64 {
        let local: f64 = x[..self.n]
            .iter()
            .zip(&y[..self.n])
            .map(|(&a, &b)| a.to_f64() * b.to_f64())
            .sum();
        self.comm.all_reduce_sum(local)
    }
}

impl<A, T> Operator<Vec<T>> for InnerCg<A, T>
where
    A: Operator<Vec<T>>,
    T: Scalar,
{
    fn apply(&mut self, input: &Vec<T>, output: &mut Vec<T>) -> Result<()> {
        let n = self.n;
        output[..n].fill(T::ZERO);
        self.r[..n].copy_from_slice(&input[..n]);
        self.p[..n].copy_from_slice(&input[..n]);
        let mut rr = self.dot(&self.r, &self.r);

        for _ in 0..self.steps {
            if rr == 0.0 {
                break;
            }
            self.op.apply(&self.p, &mut self.ap)?;
            let pap = self.dot(&self.p, &self.ap);
            if pap <= 0.0 || pap.is_nan() {
                break;
            }
            let alpha = T::from_f64(rr / pap);
            for i in 0..n {
                output[i] += alpha * self.p[i];
                self.r[i] = self.r[i] - alpha * self.ap[i];
            }
            let rr_new = self.dot(&self.r, &self.r);
            let beta = T::from_f64(rr_new / rr);
            for i in 0..n {
                self.p[i] = self.r[i] + beta * self.p[i];
            }
            rr = rr_new;
        }
        Ok(())
    }
}
