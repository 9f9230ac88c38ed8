//! Sparse LU linear solver (faer).
//!
//! Default linear solver service for Newton corrections on the coupled
//! device/circuit system.

use crate::error::{MixError, Result};
use crate::sparse::CsrMatrix;
use faer::prelude::*;
use faer::sparse::{SparseColMat, Triplet};

/// Linear solver backed by faer's sparse LU factorization.
pub struct SparseLuSolver;

impl super::LinearSolver for SparseLuSolver {
    fn solve_real(&self, a: &CsrMatrix<f64>, b: &[f64]) -> Result<Vec<f64>> {
        solve_real_sparse_lu(a, b)
    }
}

/// Solve a real-valued linear system with sparse LU on CPU.
pub fn solve_real_sparse_lu(a: &CsrMatrix<f64>, b: &[f64]) -> Result<Vec<f64>> {
    let n = a.nrows;
    if a.ncols != n || b.len() != n {
        return Err(MixError::Solve(format!(
            "dimension mismatch: matrix is {}x{}, rhs length is {}",
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
        let (cols, vals) = a.row(row);
        for (&col, &val) in cols.iter().zip(vals) {
            if !val.is_finite() {
                return Err(MixError::Solve(format!(
                    "Jacobian entry ({row}, {col}) is not finite"
                )));
            }
            triplets.push(Triplet::new(row, col, val));
        }
    }

    let a_sp = SparseColMat::<usize, f64>::try_new_from_triplets(n, n, &triplets)
        .map_err(|e| MixError::Solve(format!("sparse matrix build failed: {e:?}")))?;

    let lu = a_sp
        .sp_lu()
        .map_err(|e| MixError::Solve(format!("sparse LU factorization failed: {e:?}")))?;

    let rhs = faer::Mat::<f64>::from_fn(n, 1, |i, _| b[i]);
    let x = lu.solve(rhs);

    let out: Vec<f64> = (0..n).map(|i| x[(i, 0)]).collect();
    if out.iter().any(|v| !v.is_finite()) {
        return Err(MixError::Solve("sparse LU produced NaN/Inf solution".into()));
    }
    Ok(out)
}
