//! Compressed Sparse Row (CSR) matrix.
//!
//! Used for assembled operators, their diagonal (Jacobi), the per-rank
//! restriction of a global matrix, and the reference direct solve.

use std::ops::AddAssign;

use rayon::prelude::*;

use crate::solver::scalar::Scalar;

/// Sparse matrix in Compressed Sparse Row format.
#[derive(Debug, Clone, PartialEq)]
pub struct CsrMatrix<T> {
    pub nrows: usize,
    pub ncols: usize,
    /// Non-zero values, stored row by row.
    pub values: Vec<T>,
    /// Column index for each non-zero value.
    pub col_indices: Vec<usize>,
    /// `row_pointers[i]` is the index into values/col_indices where row i starts.
    /// `row_pointers[nrows]` = total number of non-zeros.
    pub row_pointers: Vec<usize>,
}

impl<T: Copy + Default + AddAssign> CsrMatrix<T> {
    /// Create an empty matrix with no non-zero entries.
    pub fn new(nrows: usize, ncols: usize) -> Self {
        Self {
            nrows,
            ncols,
            values: Vec::new(),
            col_indices: Vec::new(),
            row_pointers: vec![0; nrows + 1],
        }
    }

    /// Number of non-zero entries.
    pub fn nnz(&self) -> usize {
        self.values.len()
    }

    /// Column indices and values of one row.
    pub fn row(&self, row: usize) -> impl Iterator<Item = (usize, T)> + '_ {
        let span = self.row_pointers[row]..self.row_pointers[row + 1];
        self.col_indices[span.clone()]
            .iter()
            .copied()
            .zip(self.values[span].iter().copied())
    }

    /// Build CSR matrix from (row, col, value) triplets.
    /// Duplicate entries at the same (row, col) are summed.
    pub fn from_triplets(nrows: usize, ncols: usize, triplets: &[(usize, usize, T)]) -> Self {
        if triplets.is_empty() {
            return Self::new(nrows, ncols);
        }

        let mut indices: Vec<usize> = (0..triplets.len()).collect();
        indices.sort_by_key(|&i| (triplets[i].0, triplets[i].1));

        let mut values = Vec::with_capacity(triplets.len());
        let mut col_indices = Vec::with_capacity(triplets.len());
        let mut row_pointers = vec![0usize; nrows + 1];

        let first = indices[0];
        let mut cur_row = triplets[first].0;
        let mut cur_col = triplets[first].1;
        let mut cur_val = triplets[first].2;

        for &idx in &indices[1..] {
            let (row, col, val) = triplets[idx];
            if row == cur_row && col == cur_col {
                cur_val += val;
            } else {
                values.push(cur_val);
                col_indices.push(cur_col);
                row_pointers[cur_row + 1] += 1;
                cur_row = row;
                cur_col = col;
                cur_val = val;
            }
        }
        values.push(cur_val);
        col_indices.push(cur_col);
        row_pointers[cur_row + 1] += 1;

        // Per-row counts to cumulative offsets
        for i in 1..=nrows {
            row_pointers[i] += row_pointers[i - 1];
        }

        Self {
            nrows,
            ncols,
            values,
            col_indices,
            row_pointers,
        }
    }

    /// Convert to dense matrix (row-major). For testing and small matrices only.
    pub fn to_dense(&self) -> Vec<Vec<T>> {
        let mut dense = vec![vec![T::default(); self.ncols]; self.nrows];
        for row in 0..self.nrows {
            for (col, v) in self.row(row) {
                dense[row][col] = v;
            }
        }
        dense
    }
}

impl<T: Scalar> CsrMatrix<T> {
    /// `y[..nrows] = A x`. Entries of `y` past `nrows` are left alone.
    pub fn spmv_into(&self, x: &[T], y: &mut [T]) {
        y[..self.nrows]
            .par_iter_mut()
            .enumerate()
            .for_each(|(row, yi)| {
                let mut sum = T::ZERO;
                for idx in self.row_pointers[row]..self.row_pointers[row + 1] {
                    sum += self.values[idx] * x[self.col_indices[idx]];
                }
                *yi = sum;
            });
    }

    /// Sparse matrix-vector multiply: y = A * x
    pub fn spmv(&self, x: &[T]) -> Vec<T> {
        let mut y = vec![T::ZERO; self.nrows];
        self.spmv_into(x, &mut y);
        y
    }

    /// Main diagonal; missing entries are zero.
    pub fn diagonal(&self) -> Vec<T> {
        (0..self.nrows.min(self.ncols))
            .map(|row| {
                self.row(row)
                    .find(|&(col, _)| col == row)
                    .map_or(T::ZERO, |(_, v)| v)
            })
            .collect()
    }

    /// Same pattern, values converted to another precision.
    pub fn cast<S: Scalar>(&self) -> CsrMatrix<S> {
        CsrMatrix {
            nrows: self.nrows,
            ncols: self.ncols,
            values: self.values.iter().map(|v| v.cast()).collect(),
            col_indices: self.col_indices.clone(),
            row_pointers: self.row_pointers.clone(),
        }
    }

    /// Structural and numerical symmetry within `tol` (absolute).
    pub fn is_symmetric(&self, tol: f64) -> bool {
        if self.nrows != self.ncols {
            return false;
        }
        (0..self.nrows).all(|row| {
            self.row(row).all(|(col, v)| {
                let mirror = self
                    .row(col)
                    .find(|&(c, _)| c == row)
                    .map_or(0.0, |(_, w)| w.to_f64());
                (v.to_f64() - mirror).abs() <= tol
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_matrix() {
        let m: CsrMatrix<f64> = CsrMatrix::new(3, 3);
        assert_eq!(m.nnz(), 0);
        assert_eq!(m.row_pointers, vec![0, 0, 0, 0]);
    }

    #[test]
    fn test_from_triplets_duplicates_summed() {
        let triplets = vec![(1, 1, 3.0), (0, 0, 1.0), (0, 0, 2.0)];
        let m = CsrMatrix::from_triplets(2, 2, &triplets);
        assert_eq!(m.nnz(), 2);
        assert_eq!(m.to_dense(), vec![vec![3.0, 0.0], vec![0.0, 3.0]]);
    }

    #[test]
    fn test_spmv() {
        // [[2, 1], [0, 3]] * [1, 2] = [4, 6]
        let triplets = vec![(0, 0, 2.0), (0, 1, 1.0), (1, 1, 3.0)];
        let m = CsrMatrix::from_triplets(2, 2, &triplets);
        assert_eq!(m.spmv(&[1.0, 2.0]), vec![4.0, 6.0]);
        assert!(!m.is_symmetric(0.0));
    }

    #[test]
    fn spmv_into_leaves_ghost_tail() {
        let m = CsrMatrix::from_triplets(2, 3, &[(0, 0, 1.0f32), (0, 2, 1.0), (1, 1, 2.0)]);
        let mut y = vec![9.0f32; 4];
        m.spmv_into(&[1.0, 2.0, 3.0], &mut y);
        assert_eq!(y, vec![4.0, 4.0, 9.0, 9.0]);
    }

    #[test]
    fn diagonal_and_cast() {
        let m = CsrMatrix::from_triplets(3, 3, &[(0, 0, 4.0), (0, 1, -1.0), (1, 0, -1.0), (2, 2, 0.5)]);
        assert_eq!(m.diagonal(), vec![4.0, 0.0, 0.5]);
        assert!(m.is_symmetric(0.0));
        let narrow: CsrMatrix<f32> = m.cast();
        assert_eq!(narrow.values, vec![4.0f32, -1.0, -1.0, 0.5]);
        assert_eq!(narrow.row_pointers, m.row_pointers);
    }
}
