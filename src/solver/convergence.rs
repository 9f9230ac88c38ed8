//! Convergence monitor for the coupled Newton solve.
//!
//! The verdict combines per-group absolute residual tolerances with a
//! relaxed variant (every group within `relax_factor` times its tolerance)
//! that is only trusted together with a relative criterion. A converged
//! verdict can still be vetoed by the circuit engine when it has to switch
//! its internal initialisation mode; the iteration then continues.

use crate::config::{GroupTolerances, NewtonSettings};
use std::fmt;

/// Equation groups reported separately in the residual diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EquationGroup {
    Potential,
    ElectronContinuity,
    HoleContinuity,
    LatticeTemperature,
    ElectronTemperature,
    HoleTemperature,
    Electrode,
}

impl EquationGroup {
    pub const ALL: [EquationGroup; 7] = [
        EquationGroup::Potential,
        EquationGroup::ElectronContinuity,
        EquationGroup::HoleContinuity,
        EquationGroup::LatticeTemperature,
        EquationGroup::ElectronTemperature,
        EquationGroup::HoleTemperature,
        EquationGroup::Electrode,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    /// Column heading in the iteration table.
    pub fn label(self) -> &'static str {
        match self {
            EquationGroup::Potential => "Eq(V)",
            EquationGroup::ElectronContinuity => "Eq(n)",
            EquationGroup::HoleContinuity => "Eq(p)",
            EquationGroup::LatticeTemperature => "Eq(T)",
            EquationGroup::ElectronTemperature => "Eq(Tn)",
            EquationGroup::HoleTemperature => "Eq(Tp)",
            EquationGroup::Electrode => "Eq(BC)",
        }
    }
}

/// 2-norm of the residual restricted to each equation group.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ResidualNorms([f64; 7]);

impl ResidualNorms {
    pub fn get(&self, group: EquationGroup) -> f64 {
        self.0[group.index()]
    }

    pub fn set(&mut self, group: EquationGroup, value: f64) {
        self.0[group.index()] = value;
    }

    /// Build from a residual vector and a dof-to-group map.
    pub fn from_residual(f: &[f64], group_of: impl Fn(usize) -> EquationGroup) -> Self {
        let mut sq = [0.0; 7];
        for (i, fi) in f.iter().enumerate() {
            sq[group_of(i).index()] += fi * fi;
        }
        Self(sq.map(f64::sqrt))
    }
}

/// Outcome of one convergence check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Iterating,
    ConvergedAbsolute,
    ConvergedRelativeResidual,
    ConvergedRelativeStep,
    DivergedNan,
    DivergedIterationLimit,
    DivergedLinearSolve,
}

impl Verdict {
    pub fn is_converged(self) -> bool {
        matches!(
            self,
            Verdict::ConvergedAbsolute
                | Verdict::ConvergedRelativeResidual
                | Verdict::ConvergedRelativeStep
        )
    }

    pub fn is_diverged(self) -> bool {
        matches!(
            self,
            Verdict::DivergedNan | Verdict::DivergedIterationLimit | Verdict::DivergedLinearSolve
        )
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            Verdict::Iterating => "still iterating",
            Verdict::ConvergedAbsolute => "converged: residual below absolute tolerance",
            Verdict::ConvergedRelativeResidual => "converged: residual stagnated within tolerance",
            Verdict::ConvergedRelativeStep => "converged: update below relative tolerance",
            Verdict::DivergedNan => "diverged: residual is NaN",
            Verdict::DivergedIterationLimit => "diverged: iteration limit reached",
            Verdict::DivergedLinearSolve => "diverged: linear solve failed",
        };
        f.write_str(reason)
    }
}

/// Thresholds used by [`ConvergenceMonitor`].
#[derive(Debug, Clone)]
pub struct Tolerances {
    pub groups: ResidualNorms,
    pub relax_factor: f64,
    /// Total residual norm accepted at iteration 0.
    pub abs_tol: f64,
    pub rel_tol: f64,
    pub step_rel_tol: f64,
    pub max_function_evals: usize,
}

impl Tolerances {
    /// Settings scaled to a system with `n_dofs` global unknowns.
    pub fn scaled(settings: &NewtonSettings, n_dofs: usize) -> Self {
        Self {
            groups: group_norms(&settings.groups),
            relax_factor: settings.relax_factor,
            abs_tol: settings.function_abs_tol * n_dofs as f64,
            rel_tol: settings.function_rel_tol,
            step_rel_tol: settings.step_rel_tol,
            max_function_evals: settings.max_function_evals,
        }
    }
}

fn group_norms(t: &GroupTolerances) -> ResidualNorms {
    ResidualNorms([
        t.potential,
        t.electron,
        t.hole,
        t.lattice_temperature,
        t.electron_temperature,
        t.hole_temperature,
        t.electrode,
    ])
}

/// What the nonlinear solver knows at the end of an iteration.
#[derive(Debug, Clone, Copy)]
pub struct IterationReport {
    pub iteration: usize,
    /// Normalised length of the last update.
    pub step_norm: f64,
    /// 2-norm of the full residual.
    pub function_norm: f64,
    pub norms: ResidualNorms,
    pub function_evals: usize,
}

/// Stateful convergence test; one instance per nonlinear solve.
#[derive(Debug, Clone)]
pub struct ConvergenceMonitor {
    tolerances: Tolerances,
    last_function_norm: f64,
}

impl ConvergenceMonitor {
    pub fn new(tolerances: Tolerances) -> Self {
        Self {
            tolerances,
            last_function_norm: 0.0,
        }
    }

    pub fn tolerances(&self) -> &Tolerances {
        &self.tolerances
    }

    /// Classify the current iterate.
    ///
    /// `veto` is consulted with the provisional verdict on every call; when
    /// it returns true the verdict becomes [`Verdict::Iterating`] and the
    /// stored residual norm is left untouched.
    pub fn check(&mut self, report: &IterationReport, veto: impl FnOnce(Verdict) -> bool) -> Verdict {
        if report.iteration == 0 {
            tracing::info!("{}", table_header());
        }
        tracing::info!("{}", self.table_line(report));

        let verdict = self.classify(report);
        if veto(verdict) {
            return Verdict::Iterating;
        }
        self.last_function_norm = report.function_norm;
        verdict
    }

    fn classify(&self, report: &IterationReport) -> Verdict {
        let t = &self.tolerances;
        let fnorm = report.function_norm;

        if fnorm.is_nan() {
            return Verdict::DivergedNan;
        }
        if report.function_evals >= t.max_function_evals {
            return Verdict::DivergedIterationLimit;
        }
        if report.iteration == 0 && fnorm < t.abs_tol {
            return Verdict::ConvergedAbsolute;
        }

        let mut strict = true;
        let mut relaxed = true;
        for g in EquationGroup::ALL {
            let norm = report.norms.get(g);
            let tol = t.groups.get(g);
            strict &= norm < tol;
            relaxed &= norm < tol * t.relax_factor;
        }

        if strict {
            Verdict::ConvergedAbsolute
        } else if (fnorm - self.last_function_norm).abs() / fnorm <= t.rel_tol && relaxed {
            Verdict::ConvergedRelativeResidual
        } else if report.iteration > 0 && report.step_norm < t.step_rel_tol && relaxed {
            Verdict::ConvergedRelativeStep
        } else {
            Verdict::Iterating
        }
    }

    fn table_line(&self, report: &IterationReport) -> String {
        let mut line = format!("{:>3} |", report.iteration);
        for g in EquationGroup::ALL {
            let norm = report.norms.get(g);
            // locally converged: within the relaxed tolerance
            let tol = self.tolerances.groups.get(g) * self.tolerances.relax_factor;
            let mark = if norm < tol { '*' } else { ' ' };
            line.push_str(&format!(" {norm:>8.2e}{mark} |"));
        }
        let lg = if report.step_norm == 0.0 {
            f64::NEG_INFINITY
        } else {
            report.step_norm.log10()
        };
        let mark = if report.step_norm < self.tolerances.step_rel_tol { "*" } else { "" };
        line.push_str(&format!(" {lg:>6.2}{mark}"));
        line
    }
}

fn table_header() -> String {
    let mut header = String::from("  n |");
    for g in EquationGroup::ALL {
        header.push_str(&format!(" {:>9} |", g.label()));
    }
    header.push_str(" Lg(dx)");
    header
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tolerances() -> Tolerances {
        Tolerances {
            groups: ResidualNorms([1e-9; 7]),
            relax_factor: 1e4,
            abs_tol: 1e-12,
            rel_tol: 1e-14,
            step_rel_tol: 1e-5,
            max_function_evals: 100,
        }
    }

    fn report(iteration: usize, fnorm: f64, group_norm: f64, step_norm: f64) -> IterationReport {
        IterationReport {
            iteration,
            step_norm,
            function_norm: fnorm,
            norms: ResidualNorms([group_norm; 7]),
            function_evals: iteration + 1,
        }
    }

    fn never(_: Verdict) -> bool {
        false
    }

    #[test]
    fn nan_residual_diverges() {
        let mut m = ConvergenceMonitor::new(tolerances());
        assert_eq!(m.check(&report(2, f64::NAN, 1.0, 0.1), never), Verdict::DivergedNan);
    }

    #[test]
    fn function_eval_budget_diverges() {
        let mut m = ConvergenceMonitor::new(tolerances());
        let mut r = report(3, 1.0, 1.0, 0.1);
        r.function_evals = 100;
        assert_eq!(m.check(&r, never), Verdict::DivergedIterationLimit);
    }

    #[test]
    fn tiny_initial_residual_is_absolute() {
        let mut m = ConvergenceMonitor::new(tolerances());
        assert_eq!(m.check(&report(0, 1e-13, 1.0, 0.0), never), Verdict::ConvergedAbsolute);
    }

    #[test]
    fn all_groups_below_tolerance_is_absolute() {
        let mut m = ConvergenceMonitor::new(tolerances());
        assert_eq!(m.check(&report(1, 1e-6, 1e-10, 1.0), never), Verdict::ConvergedAbsolute);
    }

    #[test]
    fn one_loose_group_keeps_iterating() {
        let mut m = ConvergenceMonitor::new(tolerances());
        let mut r = report(1, 1e-6, 1e-10, 1.0);
        r.norms.set(EquationGroup::Electrode, 1e-3);
        assert_eq!(m.check(&r, never), Verdict::Iterating);
    }

    #[test]
    fn stagnated_residual_within_relaxed_band_converges() {
        let mut m = ConvergenceMonitor::new(tolerances());
        assert_eq!(m.check(&report(1, 1e-7, 1e-7, 1.0), never), Verdict::Iterating);
        assert_eq!(
            m.check(&report(2, 1e-7, 1e-7, 1.0), never),
            Verdict::ConvergedRelativeResidual
        );
    }

    #[test]
    fn small_update_needs_relaxed_residual() {
        let mut m = ConvergenceMonitor::new(tolerances());
        assert_eq!(m.check(&report(1, 2e-7, 1e-7, 1e-8), never), Verdict::ConvergedRelativeStep);

        let mut m = ConvergenceMonitor::new(tolerances());
        assert_eq!(m.check(&report(1, 2e-3, 1e-3, 1e-8), never), Verdict::Iterating);
    }

    #[test]
    fn step_criterion_ignored_at_iteration_zero() {
        let mut m = ConvergenceMonitor::new(tolerances());
        assert_eq!(m.check(&report(0, 2e-7, 1e-7, 0.0), never), Verdict::Iterating);
    }

    #[test]
    fn veto_turns_convergence_into_iterating() {
        let mut m = ConvergenceMonitor::new(tolerances());
        let mut seen = None;
        let v = m.check(&report(1, 1e-6, 1e-10, 1.0), |v| {
            seen = Some(v);
            true
        });
        assert_eq!(seen, Some(Verdict::ConvergedAbsolute));
        assert_eq!(v, Verdict::Iterating);
        assert_eq!(m.last_function_norm, 0.0);
    }

    #[test]
    fn verdict_classification() {
        assert!(Verdict::ConvergedRelativeStep.is_converged());
        assert!(!Verdict::Iterating.is_converged());
        assert!(!Verdict::Iterating.is_diverged());
        assert!(Verdict::DivergedLinearSolve.is_diverged());
        assert!(Verdict::DivergedNan.to_string().contains("NaN"));
    }

    #[test]
    fn table_line_marks_converged_columns() {
        let m = ConvergenceMonitor::new(tolerances());
        let mut r = report(4, 1.0, 1e-12, 0.0);
        r.norms.set(EquationGroup::Potential, 1.0);
        let line = m.table_line(&r);
        assert!(line.starts_with("  4 |"));
        assert_eq!(line.matches('*').count(), 7);
        assert!(line.ends_with("-inf*"));
        assert!(table_header().contains("Eq(BC)"));
    }

    #[test]
    fn table_marks_groups_within_relaxed_tolerance() {
        let m = ConvergenceMonitor::new(tolerances());
        // 1e-7 misses the 1e-9 group tolerance but is within 1e4 of it
        let mut r = report(2, 1.0, 1e-7, 1.0);
        r.norms.set(EquationGroup::Electrode, 1e-4);
        let line = m.table_line(&r);
        assert_eq!(line.matches('*').count(), 6);
    }

    #[test]
    fn norms_split_by_group() {
        let f = [3.0, 4.0, 1.0];
        let n = ResidualNorms::from_residual(&f, |i| {
            if i < 2 {
                EquationGroup::Potential
            } else {
                EquationGroup::Electrode
            }
        });
        assert_eq!(n.get(EquationGroup::Potential), 5.0);
        assert_eq!(n.get(EquationGroup::Electrode), 1.0);
        assert_eq!(n.get(EquationGroup::HoleContinuity), 0.0);
    }
}
