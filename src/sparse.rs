//! Sparse matrices with a fixed sparsity pattern and a sparse Cholesky factorization whose
//! symbolic analysis can be reused across numeric factorizations.

use faer::linalg::solvers::Solve;
use faer::sparse::linalg::solvers::{Llt, SymbolicLlt};
use faer::sparse::{SparseColMat, Triplet};
use faer::{Mat, Side};
use nalgebra::{DMatrix, DVector};
use std::collections::BTreeMap;

use crate::{Error, Result};

/// Real sparse matrix in compressed column storage.
#[derive(Debug, Clone)]
pub struct SparseMatrix {
    inner: SparseColMat<usize, f64>,
}

impl SparseMatrix {
    /// Build from `(row, col, value)` entries. Duplicate entries are summed. Every listed
    /// position is part of the sparsity pattern, even if its value is zero.
    pub fn from_triplets(
        nrows: usize,
        ncols: usize,
        entries: &[(usize, usize, f64)],
    ) -> Result<Self> {
        let mut accumulated: BTreeMap<(usize, usize), f64> = BTreeMap::new();
        for &(row, col, value) in entries {
            if row >= nrows || col >= ncols {
                return Err(Error::InvalidMatrix(format!(
                    "entry ({}, {}) outside of {}x{} matrix",
                    row, col, nrows, ncols
                )));
            }
            *accumulated.entry((col, row)).or_insert(0.0) += value;
        }
        Self::from_column_major(nrows, ncols, accumulated)
    }

    /// Sparse copy of the non-zero entries of a dense matrix.
    pub fn from_dense(m: &DMatrix<f64>) -> Result<Self> {
        let mut entries = Vec::new();
        for col in 0..m.ncols() {
            for row in 0..m.nrows() {
                let value = m[(row, col)];
                if value != 0.0 {
                    entries.push((row, col, value));
                }
            }
        }
        Self::from_triplets(m.nrows(), m.ncols(), &entries)
    }

    fn from_column_major(
        nrows: usize,
        ncols: usize,
        entries: BTreeMap<(usize, usize), f64>,
    ) -> Result<Self> {
        let triplets = entries
            .into_iter()
            .map(|((col, row), value)| Triplet::new(row, col, value))
            .collect::<Vec<_>>();
        let inner = SparseColMat::try_new_from_triplets(nrows, ncols, &triplets)
            .map_err(|e| Error::InvalidMatrix(format!("{:?}", e)))?;
        Ok(SparseMatrix { inner })
    }

    pub fn nrows(&self) -> usize {
        self.inner.nrows()
    }

    pub fn ncols(&self) -> usize {
        self.inner.ncols()
    }

    /// Number of stored entries.
    pub fn nnz(&self) -> usize {
        (0..self.ncols())
            .map(|col| self.inner.symbolic().row_idx_of_col_raw(col).len())
            .sum()
    }

    pub fn as_faer(&self) -> &SparseColMat<usize, f64> {
        &self.inner
    }

    /// Stored `(row, value)` entries of column `col`.
    pub fn column(&self, col: usize) -> impl Iterator<Item = (usize, f64)> + '_ {
        let rows = self.inner.symbolic().row_idx_of_col_raw(col);
        let values = self.inner.val_of_col(col);
        rows.iter().copied().zip(values.iter().copied())
    }

    /// Value at `(row, col)`, zero if the position is not stored.
    pub fn get(&self, row: usize, col: usize) -> f64 {
        self.column(col)
            .find(|(r, _)| *r == row)
            .map(|(_, v)| v)
            .unwrap_or(0.0)
    }

    /// `A * x`
    pub fn mul_vec(&self, x: &DVector<f64>) -> DVector<f64> {
        assert_eq!(x.len(), self.ncols());
        let mut y = DVector::zeros(self.nrows());
        for col in 0..self.ncols() {
            let xc = x[col];
            for (row, value) in self.column(col) {
                y[row] += value * xc;
            }
        }
        y
    }

    /// `A^T * y`
    pub fn transpose_mul_vec(&self, y: &DVector<f64>) -> DVector<f64> {
        assert_eq!(y.len(), self.nrows());
        DVector::from_iterator(
            self.ncols(),
            (0..self.ncols()).map(|col| self.column(col).map(|(row, v)| v * y[row]).sum()),
        )
    }

    /// `A^T * diag(weights) * A`, or `A^T * A` without weights.
    ///
    /// The sparsity pattern of the result only depends on the pattern of `A`, so repeated calls
    /// with different weights can reuse one symbolic factorization.
    pub fn weighted_gram(&self, weights: Option<&DVector<f64>>) -> Result<SparseMatrix> {
        if let Some(w) = weights {
            assert_eq!(w.len(), self.nrows());
        }
        let mut rows: Vec<Vec<(usize, f64)>> = vec![Vec::new(); self.nrows()];
        for col in 0..self.ncols() {
            for (row, value) in self.column(col) {
                rows[row].push((col, value));
            }
        }

        let mut gram: BTreeMap<(usize, usize), f64> = BTreeMap::new();
        for (row, entries) in rows.iter().enumerate() {
            let w = weights.map(|w| w[row]).unwrap_or(1.0);
            for &(c1, v1) in entries {
                for &(c2, v2) in entries {
                    *gram.entry((c2, c1)).or_insert(0.0) += w * v1 * v2;
                }
            }
        }
        Self::from_column_major(self.ncols(), self.ncols(), gram)
    }

    pub fn to_dense(&self) -> DMatrix<f64> {
        let mut m = DMatrix::zeros(self.nrows(), self.ncols());
        for col in 0..self.ncols() {
            for (row, value) in self.column(col) {
                m[(row, col)] += value;
            }
        }
        m
    }
}

/// Sparse Cholesky `LL^T` factorization of a symmetric positive definite matrix.
///
/// [SparseCholeskyLlt::analyze_pattern] computes the elimination structure once; subsequent
/// calls to [SparseCholeskyLlt::factorize] with matrices of the same pattern only redo the
/// numeric work.
#[derive(Default)]
pub struct SparseCholeskyLlt {
    symbolic: Option<SymbolicLlt<usize>>,
    factor: Option<Llt<usize, f64>>,
}

impl SparseCholeskyLlt {
    pub fn new() -> Self {
        SparseCholeskyLlt::default()
    }

    pub fn analyze_pattern(&mut self, m: &SparseMatrix) -> Result<()> {
        let symbolic = SymbolicLlt::try_new(m.inner.symbolic(), Side::Lower)
            .map_err(|e| Error::Factorization(format!("symbolic analysis failed: {:?}", e)))?;
        self.symbolic = Some(symbolic);
        self.factor = None;
        Ok(())
    }

    /// Numeric factorization against the analyzed pattern. Analyzes `m` first if no pattern is
    /// available.
    pub fn factorize(&mut self, m: &SparseMatrix) -> Result<()> {
        if self.symbolic.is_none() {
            self.analyze_pattern(m)?;
        }
        let symbolic = match &self.symbolic {
            Some(s) => s.clone(),
            None => return Err(Error::Factorization("missing symbolic analysis".into())),
        };
        self.factor = None;
        let factor = Llt::try_new_with_symbolic(symbolic, m.inner.as_ref(), Side::Lower)
            .map_err(|e| Error::Factorization(format!("{:?}", e)))?;
        self.factor = Some(factor);
        Ok(())
    }

    /// Pattern analysis followed by numeric factorization.
    pub fn compute(&mut self, m: &SparseMatrix) -> Result<()> {
        self.analyze_pattern(m)?;
        self.factorize(m)
    }

    pub fn solve(&self, rhs: &DVector<f64>) -> Result<DVector<f64>> {
        let factor = self
            .factor
            .as_ref()
            .ok_or_else(|| Error::LinearSolve("matrix has not been factorized".into()))?;
        let b = Mat::from_fn(rhs.len(), 1, |i, _| rhs[i]);
        let x = factor.solve(&b);
        let solution = DVector::from_iterator(rhs.len(), (0..rhs.len()).map(|i| x[(i, 0)]));
        if solution.iter().all(|v| v.is_finite()) {
            Ok(solution)
        } else {
            Err(Error::LinearSolve("solution is not finite".into()))
        }
    }
}

#[test]
fn test_products_match_dense() {
    let dense = DMatrix::from_row_slice(3, 2, &[1.0, 0.0, -2.0, 3.0, 0.0, 4.0]);
    let sparse = SparseMatrix::from_dense(&dense).unwrap();
    assert_eq!(sparse.nnz(), 4);

    let x = DVector::from_vec(vec![0.5, -1.0]);
    assert!((sparse.mul_vec(&x) - &dense * &x).norm() < 1e-12);

    let y = DVector::from_vec(vec![1.0, 2.0, 3.0]);
    assert!((sparse.transpose_mul_vec(&y) - dense.transpose() * &y).norm() < 1e-12);

    let w = DVector::from_vec(vec![2.0, 1.0, 0.5]);
    let expected = dense.transpose() * DMatrix::from_diagonal(&w) * &dense;
    let gram = sparse.weighted_gram(Some(&w)).unwrap();
    assert!((gram.to_dense() - expected).norm() < 1e-12);
}

#[test]
fn test_duplicate_triplets_are_summed() {
    let m = SparseMatrix::from_triplets(2, 2, &[(0, 0, 1.0), (0, 0, 2.0), (1, 1, 1.0)]).unwrap();
    assert_eq!(m.get(0, 0), 3.0);
    assert_eq!(m.get(1, 0), 0.0);
    assert!(SparseMatrix::from_triplets(2, 2, &[(2, 0, 1.0)]).is_err());
}

#[test]
fn test_cholesky_refactorization() {
    let a = SparseMatrix::from_triplets(
        3,
        3,
        &[
            (0, 0, 4.0),
            (1, 0, -1.0),
            (0, 1, -1.0),
            (1, 1, 4.0),
            (2, 1, -1.0),
            (1, 2, -1.0),
            (2, 2, 4.0),
        ],
    )
    .unwrap();
    let mut llt = SparseCholeskyLlt::new();
    llt.compute(&a).unwrap();
    let b = DVector::from_vec(vec![1.0, 2.0, 3.0]);
    let x = llt.solve(&b).unwrap();
    assert!((a.mul_vec(&x) - &b).norm() < 1e-10);

    // same pattern, new values
    let scaled = SparseMatrix::from_dense(&(a.to_dense() * 2.0)).unwrap();
    llt.factorize(&scaled).unwrap();
    let x2 = llt.solve(&b).unwrap();
    assert!((x2 * 2.0 - x).norm() < 1e-10);
}
