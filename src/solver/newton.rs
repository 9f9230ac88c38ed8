//! Newton-Raphson nonlinear solver service.
//!
//! The solve is a blocking collective. Each rank assembles the residual
//! rows and Jacobian entries it owns, the contributions are combined so
//! every rank holds the full system, and every rank then performs the same
//! linear solve and update on its replica of the solution vector.

use super::comm::CommunicationBackend;
use super::convergence::{ConvergenceMonitor, IterationReport, ResidualNorms, Tolerances, Verdict};
use super::{linear_solver, LinearSolver};
use crate::config::NewtonSettings;
use crate::error::Result;
use crate::sparse::TripletMatrix;

/// A square nonlinear system `F(x) = 0` assembled cooperatively by all ranks.
pub trait NonlinearProblem {
    /// Global number of unknowns.
    fn n_dofs(&self) -> usize;

    /// Add this rank's residual contributions into `f` (zero on entry).
    fn residual(&mut self, x: &[f64], f: &mut [f64]) -> Result<()>;

    /// Adjust the combined residual; runs on every rank after the reduction.
    fn finalize_residual(&mut self, _f: &mut [f64]) -> Result<()> {
        Ok(())
    }

    /// Add this rank's Jacobian entries.
    fn jacobian(&mut self, x: &[f64], jac: &mut TripletMatrix) -> Result<()>;

    /// Adjust the combined Jacobian; runs on every rank after the gather.
    fn finalize_jacobian(&mut self, _jac: &mut TripletMatrix) {}

    /// Expected number of Jacobian entries contributed by this rank.
    fn jacobian_capacity(&self) -> usize {
        0
    }

    fn residual_norms(&self, f: &[f64]) -> ResidualNorms;

    /// Given a provisional verdict, return true to force another iteration.
    fn convergence_veto(&mut self, _verdict: Verdict) -> bool {
        false
    }
}

/// Result of one nonlinear solve.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SolveOutcome {
    pub verdict: Verdict,
    pub iterations: usize,
    pub function_evals: usize,
}

impl SolveOutcome {
    pub fn converged(&self) -> bool {
        self.verdict.is_converged()
    }
}

/// Anything that can drive a [`NonlinearProblem`] to a verdict.
pub trait NonlinearSolve {
    /// Iterate in place on `x`. Divergence is reported in the outcome, not
    /// as an error.
    fn solve(&mut self, problem: &mut dyn NonlinearProblem, x: &mut [f64]) -> Result<SolveOutcome>;
}

/// Tolerances and limits for the Newton loop, scaled to a system size.
#[derive(Debug, Clone)]
pub struct NewtonParams {
    pub max_iterations: usize,
    pub tolerances: Tolerances,
    pub linear: LinearTolerances,
}

impl NewtonParams {
    pub fn scaled(settings: &NewtonSettings, n_dofs: usize) -> Self {
        Self {
            max_iterations: settings.max_iterations,
            tolerances: Tolerances::scaled(settings, n_dofs),
            linear: LinearTolerances {
                rel_tol: settings.linear.rel_tol * n_dofs as f64,
                abs_tol: settings.linear.abs_tol * n_dofs as f64,
                max_iterations: (n_dofs / 10).clamp(50, 1000),
            },
        }
    }
}

/// Acceptance test for a linear correction, with a cap on refinement passes.
#[derive(Debug, Clone, Copy)]
pub struct LinearTolerances {
    pub rel_tol: f64,
    pub abs_tol: f64,
    pub max_iterations: usize,
}

/// Newton-Raphson with full steps.
pub struct NewtonSolver<'a> {
    comm: &'a dyn CommunicationBackend,
    params: NewtonParams,
    linear: Box<dyn LinearSolver>,
}

impl<'a> NewtonSolver<'a> {
    pub fn new(comm: &'a dyn CommunicationBackend, settings: &NewtonSettings, n_dofs: usize) -> Self {
        let params = NewtonParams::scaled(settings, n_dofs);
        tracing::debug!(
            n_dofs,
            abs_tol = params.tolerances.abs_tol,
            linear_rel_tol = params.linear.rel_tol,
            linear_abs_tol = params.linear.abs_tol,
            linear_max_iterations = params.linear.max_iterations,
            "Newton solver configured"
        );
        Self {
            comm,
            params,
            linear: linear_solver(settings.linear.backend),
        }
    }

    pub fn params(&self) -> &NewtonParams {
        &self.params
    }

    fn assemble_residual(&self, problem: &mut dyn NonlinearProblem, x: &[f64]) -> Result<Vec<f64>> {
        let mut f = vec![0.0; x.len()];
        problem.residual(x, &mut f)?;
        self.comm.all_reduce_sum_vec(&mut f);
        problem.finalize_residual(&mut f)?;
        Ok(f)
    }

    fn assemble_jacobian(&self, problem: &mut dyn NonlinearProblem, x: &[f64]) -> Result<TripletMatrix> {
        let n = x.len();
        let mut jac = TripletMatrix::with_capacity(n, problem.jacobian_capacity());
        problem.jacobian(x, &mut jac)?;
        if self.comm.num_ranks() > 1 {
            let gathered = self.comm.all_gather_vec(&jac.to_flat());
            jac = TripletMatrix::from_flat(n, &gathered);
        }
        problem.finalize_jacobian(&mut jac);
        Ok(jac)
    }

    /// Solve `J dx = -f`, refining until the linear residual meets the
    /// scaled tolerances. `None` means the linear solve failed.
    fn correction(&self, jac: &TripletMatrix, f: &[f64]) -> Option<Vec<f64>> {
        let a = jac.to_csr();
        let rhs: Vec<f64> = f.iter().map(|v| -v).collect();
        let mut dx = match self.linear.solve_real(&a, &rhs) {
            Ok(dx) => dx,
            Err(e) => {
                tracing::debug!(?e, "linear solve failed");
                return None;
            }
        };

        let lin = self.params.linear;
        let target = (lin.rel_tol * norm2(&rhs)).max(lin.abs_tol);
        for _ in 0..lin.max_iterations {
            let r: Vec<f64> = a.spmv(&dx).iter().zip(&rhs).map(|(ax, b)| b - ax).collect();
            if norm2(&r) <= target {
                break;
            }
            match self.linear.solve_real(&a, &r) {
                Ok(delta) => dx.iter_mut().zip(&delta).for_each(|(d, e)| *d += e),
                Err(_) => break,
            }
        }
        Some(dx)
    }
}

impl NonlinearSolve for NewtonSolver<'_> {
    fn solve(&mut self, problem: &mut dyn NonlinearProblem, x: &mut [f64]) -> Result<SolveOutcome> {
        let _span = tracing::info_span!("newton").entered();
        let mut monitor = ConvergenceMonitor::new(self.params.tolerances.clone());
        let mut step_norm = 0.0;
        let mut function_evals = 0;

        for iteration in 0..=self.params.max_iterations {
            let f = self.assemble_residual(problem, x)?;
            function_evals += 1;

            let report = IterationReport {
                iteration,
                step_norm,
                function_norm: norm2(&f),
                norms: problem.residual_norms(&f),
                function_evals,
            };
            let verdict = monitor.check(&report, |v| problem.convergence_veto(v));
            if verdict != Verdict::Iterating {
                return Ok(SolveOutcome {
                    verdict,
                    iterations: iteration,
                    function_evals,
                });
            }
            if iteration == self.params.max_iterations {
                break;
            }

            let jac = self.assemble_jacobian(problem, x)?;
            let Some(dx) = self.correction(&jac, &f) else {
                return Ok(SolveOutcome {
                    verdict: Verdict::DivergedLinearSolve,
                    iterations: iteration,
                    function_evals,
                });
            };
            for (xi, di) in x.iter_mut().zip(&dx) {
                *xi += di;
            }
            step_norm = norm2(&dx) / (1.0 + norm2(x));
        }

        Ok(SolveOutcome {
            verdict: Verdict::DivergedIterationLimit,
            iterations: self.params.max_iterations,
            function_evals,
        })
    }
}

pub(crate) fn norm2(v: &[f64]) -> f64 {
    v.iter().map(|x| x * x).sum::<f64>().sqrt()
}
