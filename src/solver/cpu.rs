//! Dense direct solver using LU decomposition with partial pivoting.
//!
//! Converts CSR to a row-major dense buffer. Only sensible for small coupled
//! systems; the sparse LU path is the default.

use crate::error::{MixError, Result};
use crate::sparse::CsrMatrix;

/// Pivots smaller than this are treated as singular.
const PIVOT_FLOOR: f64 = 1e-300;

/// CPU-based dense linear solver.
pub struct CpuSolver;

impl CpuSolver {
    pub fn new() -> Self {
        Self
    }
}

impl Default for CpuSolver {
    fn default() -> Self {
        Self::new()
    }
}

impl super::LinearSolver for CpuSolver {
    fn solve_real(&self, a: &CsrMatrix<f64>, b: &[f64]) -> Result<Vec<f64>> {
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

        let mut lu = vec![0.0; n * n];
        for row in 0..n {
            let (cols, vals) = a.row(row);
            for (&c, &v) in cols.iter().zip(vals) {
                lu[row * n + c] = v;
            }
        }
        let mut x = b.to_vec();

        for k in 0..n {
            let pivot_row = (k..n)
                .max_by(|&i, &j| lu[i * n + k].abs().total_cmp(&lu[j * n + k].abs()))
                .unwrap_or(k);
            let pivot = lu[pivot_row * n + k];
            if !(pivot.abs() > PIVOT_FLOOR) {
                return Err(MixError::Solve("singular matrix".into()));
            }
            if pivot_row != k {
                for j in 0..n {
                    lu.swap(k * n + j, pivot_row * n + j);
                }
                x.swap(k, pivot_row);
            }
            for i in (k + 1)..n {
                let factor = lu[i * n + k] / pivot;
                if factor == 0.0 {
                    continue;
                }
                for j in (k + 1)..n {
                    lu[i * n + j] -= factor * lu[k * n + j];
                }
                lu[i * n + k] = 0.0;
                x[i] -= factor * x[k];
            }
        }

        for i in (0..n).rev() {
            let tail: f64 = ((i + 1)..n).map(|j| lu[i * n + j] * x[j]).sum();
            x[i] = (x[i] - tail) / lu[i * n + i];
        }

        if x.iter().any(|v| !v.is_finite()) {
            return Err(MixError::Solve("dense LU produced NaN/Inf solution".into()));
        }
        Ok(x)
    }
}
