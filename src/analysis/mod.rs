//! Continuation controllers and the driver that runs netlist analyses.
//!
//! Each controller owns the solution history for the duration of its phase
//! and reports recoverable failures through [`PhaseStatus`] rather than
//! errors.

pub mod dcop;
pub mod sweep;
pub mod transient;

use std::time::Instant;

use crate::context::AnalysisContext;
use crate::error::Result;
use crate::ir::Analysis;
use crate::simulation::Simulation;
use crate::stats::Stats;

pub use dcop::OpMode;
pub use transient::StepEvent;

/// Why a phase stopped before reaching its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    /// The very first solve of the phase diverged.
    FirstStepFailed,
    /// Too many consecutive recovery attempts failed.
    RetryBudgetExhausted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseStatus {
    Completed,
    Aborted(AbortReason),
}

impl PhaseStatus {
    pub fn is_completed(self) -> bool {
        self == PhaseStatus::Completed
    }
}

/// DC operating point results.
#[derive(Debug, Clone)]
pub struct OpResult {
    pub status: PhaseStatus,
    /// Accepted ramp fractions, in order.
    pub ramp_fractions: Vec<f64>,
    /// Ramp solves that diverged and were retried with a smaller step.
    pub retries: usize,
    /// Shunt conductance in effect at the end of the phase.
    pub gmin: f64,
    /// Circuit node names; empty on ranks that do not own the circuit.
    pub node_names: Vec<String>,
    pub node_values: Vec<f64>,
}

/// DC sweep results, one entry per accepted point.
#[derive(Debug, Clone)]
pub struct SweepResult {
    pub status: PhaseStatus,
    pub source: String,
    pub values: Vec<f64>,
    pub node_names: Vec<String>,
    pub node_values: Vec<Vec<f64>>,
    /// Points that diverged and were bisected.
    pub rejected: usize,
}

/// Transient results, one entry per accepted time point.
#[derive(Debug, Clone)]
pub struct TranResult {
    pub status: PhaseStatus,
    pub times: Vec<f64>,
    pub node_names: Vec<String>,
    pub node_values: Vec<Vec<f64>>,
    pub events: Vec<StepEvent>,
}

#[derive(Debug, Clone)]
pub enum AnalysisResult {
    Op(OpResult),
    DcSweep(SweepResult),
    Tran(TranResult),
}

impl AnalysisResult {
    pub fn status(&self) -> PhaseStatus {
        match self {
            AnalysisResult::Op(r) => r.status,
            AnalysisResult::DcSweep(r) => r.status,
            AnalysisResult::Tran(r) => r.status,
        }
    }
}

/// Run every analysis in order on the same coupled system.
///
/// An aborted phase does not stop later analyses; it is reported in its
/// result's status.
pub fn run(
    sim: &mut Simulation<'_>,
    ctx: &mut AnalysisContext,
    analyses: &[Analysis],
    mut stats: Option<&mut Stats>,
) -> Result<Vec<AnalysisResult>> {
    let mut results = Vec::with_capacity(analyses.len());

    for analysis in analyses {
        let start = stats.is_some().then(Instant::now);
        let (name, result) = match analysis {
            Analysis::Op => (
                "Operating point",
                AnalysisResult::Op(dcop::run(sim, ctx, OpMode::Standalone, stats.as_deref_mut())?),
            ),
            Analysis::DcSweep {
                source,
                start,
                stop,
                step,
            } => (
                "DC sweep",
                AnalysisResult::DcSweep(sweep::run(sim, ctx, source, *start, *stop, *step, stats.as_deref_mut())?),
            ),
            Analysis::Tran {
                tstep,
                tstop,
                tstart,
                uic,
            } => (
                "Transient",
                AnalysisResult::Tran(transient::run(
                    sim,
                    ctx,
                    *tstep,
                    *tstop,
                    *tstart,
                    *uic,
                    stats.as_deref_mut(),
                )?),
            ),
        };
        if let (Some(s), Some(t0)) = (stats.as_deref_mut(), start) {
            s.add_phase(name, t0.elapsed());
        }
        results.push(result);
    }

    Ok(results)
}
