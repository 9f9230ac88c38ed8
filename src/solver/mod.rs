//! Nonlinear and linear solver services.

pub mod comm;
#[cfg(feature = "distributed")]
pub mod comm_mpi;
pub mod convergence;
pub mod cpu;
pub mod newton;
pub mod sparse_direct;

use crate::config::LinearBackend;
use crate::error::Result;
use crate::sparse::CsrMatrix;

/// A solver for real linear systems Ax = b.
pub trait LinearSolver {
    fn solve_real(&self, a: &CsrMatrix<f64>, b: &[f64]) -> Result<Vec<f64>>;
}

/// Construct the linear solver selected in the settings.
pub fn linear_solver(backend: LinearBackend) -> Box<dyn LinearSolver> {
    match backend {
        LinearBackend::SparseLu => Box::new(sparse_direct::SparseLuSolver),
        LinearBackend::Dense => Box::new(cpu::CpuSolver::new()),
    }
}
