//! DC operating point by source ramping and gmin relaxation.
//!
//! All independent sources are scaled from zero to their targets in `N`
//! equal fractions. A diverged fraction is retried halfway back to the last
//! accepted one. Once the ramp completes, the shunt conductance added to
//! every circuit node is relaxed toward the configured value.

use super::{AbortReason, OpResult, PhaseStatus};
use crate::circuit::{AnalysisMode, CircuitMode, InitMode, SourceValue};
use crate::config::RampSettings;
use crate::context::{AnalysisContext, TimeState};
use crate::error::{MixError, Result};
use crate::history::HistoryRing;
use crate::simulation::Simulation;
use crate::stats::Stats;

/// Consecutive diverged ramp steps tolerated before giving up.
const MAX_RAMP_RETRIES: usize = 3;
/// Largest ramp step count accepted from the settings.
const MAX_RAMP_STEPS: usize = 1 << 24;
/// Factor applied to gmin per relaxation stage.
const GMIN_REDUCTION: f64 = 1e-2;

/// How the operating point is being computed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OpMode {
    /// `.OP`: a DC operating point at time zero.
    Standalone,
    /// Initial state of a transient starting at `tstart`. With `uic` the
    /// circuit's initial conditions are taken as-is without a solve.
    TransientStart { tstart: f64, uic: bool },
}

/// Number of ramp steps needed so no voltage source moves by more than
/// `voltage_step` and no current source by more than `current_step` per step.
///
/// Errors if the step sizes are not positive or the count does not fit
/// the broadcast.
pub fn ramp_step_count(vsrcs: &[SourceValue], isrcs: &[SourceValue], settings: &RampSettings) -> Result<usize> {
    let peak = |sources: &[SourceValue]| sources.iter().map(|s| s.value.abs()).fold(0.0, f64::max);
    let steps = (peak(vsrcs) / settings.voltage_step)
        .max(peak(isrcs) / settings.current_step)
        .floor();
    if !(steps >= 0.0 && steps <= MAX_RAMP_STEPS as f64) {
        return Err(MixError::Config(format!(
            "source ramp needs {steps} steps; check ramp.voltage_step and ramp.current_step"
        )));
    }
    Ok((steps as usize).max(settings.min_steps))
}

/// Position within the source ramp: step `step` of `steps`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RampSchedule {
    step: usize,
    steps: usize,
}

impl RampSchedule {
    pub fn new(steps: usize) -> Self {
        Self {
            step: 1,
            steps: steps.max(1),
        }
    }

    pub fn step(&self) -> usize {
        self.step
    }

    pub fn steps(&self) -> usize {
        self.steps
    }

    /// Source scale of the current step.
    pub fn fraction(&self) -> f64 {
        self.step as f64 / self.steps as f64
    }

    pub fn done(&self) -> bool {
        self.step > self.steps
    }

    pub fn advance(&mut self) {
        self.step += 1;
    }

    /// Halve the step size and retry halfway between the last accepted
    /// fraction and the current one.
    pub fn refine(&mut self) {
        self.step = 2 * self.step - 1;
        self.steps *= 2;
    }
}

/// Gmin values visited while relaxing from `initial` down to `target`.
pub fn gmin_schedule(initial: f64, target: f64) -> Vec<f64> {
    let mut stages = Vec::new();
    let mut gmin = initial;
    while gmin > target {
        gmin *= GMIN_REDUCTION;
        if gmin < target * (1.0 + 1e-9) {
            gmin = target;
        }
        stages.push(gmin);
    }
    stages
}

/// Compute the operating point. On abort the last accepted solution is
/// left in `sim`.
pub fn run(
    sim: &mut Simulation<'_>,
    ctx: &mut AnalysisContext,
    mode: OpMode,
    mut stats: Option<&mut Stats>,
) -> Result<OpResult> {
    ctx.settings.validate()?;
    let _span = tracing::info_span!("dcop").entered();
    tracing::info!("Compute DC operating point");

    let clock = match mode {
        OpMode::Standalone => 0.0,
        OpMode::TransientStart { tstart, .. } => tstart,
    };
    ctx.time = TimeState::steady(clock);
    ctx.dc_cycles = 0;
    let ramp = ctx.settings.ramp.clone();

    if let Some(circuit) = sim.circuit_mut() {
        match mode {
            OpMode::Standalone => circuit.set_mode(CircuitMode::new(AnalysisMode::DcOp, InitMode::Junction)),
            OpMode::TransientStart { .. } => {
                circuit.set_mode(CircuitMode::new(AnalysisMode::TranOp, InitMode::Junction));
                circuit.set_time(clock);
            }
        }
    }

    if let OpMode::TransientStart { uic: true, .. } = mode {
        tracing::info!("Use initial condition");
        if let Some(circuit) = sim.circuit_mut() {
            circuit.set_mode(CircuitMode::new(AnalysisMode::TranOp, InitMode::Junction).with_uic());
            circuit.exchange_rhs();
            circuit.load()?;
        }
        sim.pre_solve(true)?;
        sim.post_solve();
        return Ok(result(sim, PhaseStatus::Completed, Vec::new(), 0));
    }

    sim.update_stimulus(clock);

    let (vsrcs, isrcs) = match sim.circuit_mut() {
        Some(circuit) => {
            circuit.set_gmin(ramp.gmin_init);
            (circuit.voltage_sources(), circuit.current_sources())
        }
        None => (Vec::new(), Vec::new()),
    };
    let comm = sim.comm();
    // a failed count is broadcast as -1 so every rank returns the error
    let local_steps = if comm.is_last_rank() {
        ramp_step_count(&vsrcs, &isrcs, &ramp)
            .ok()
            .and_then(|n| i64::try_from(n).ok())
            .unwrap_or(-1)
    } else {
        0
    };
    let steps = comm.broadcast_i64(local_steps, comm.last_rank());
    let steps = usize::try_from(steps)
        .map_err(|_| MixError::Config("source ramp step count out of range".into()))?
        .max(1);
    tracing::info!(steps, "DC ramp-up");

    let mut schedule = RampSchedule::new(steps);
    let mut history = HistoryRing::new();
    let mut fractions = Vec::new();
    let mut retry = 0;
    let mut retries = 0;
    let mut status = PhaseStatus::Completed;

    while !schedule.done() {
        let fraction = schedule.fraction();
        tracing::info!("DC ramp step {} of {}", schedule.step(), schedule.steps());

        if let Some(circuit) = sim.circuit_mut() {
            for s in &vsrcs {
                circuit.set_voltage(&s.name, s.value * fraction)?;
            }
            for s in &isrcs {
                circuit.set_current(&s.name, s.value * fraction)?;
            }
        }

        sim.pre_solve(ctx.dc_cycles == 0)?;
        let outcome = sim.solve(ctx.time)?;
        if let Some(ref mut s) = stats {
            s.record_solve(&outcome);
        }

        if outcome.converged() {
            sim.post_solve();
            if let Some(circuit) = sim.circuit_mut() {
                circuit.rotate_state_vectors();
            }
            if ramp.predict {
                history.push(fraction, sim.solution());
            }
            ctx.dc_cycles += 1;
            retry = 0;
            fractions.push(fraction);
            if let Some(ref mut s) = stats {
                s.ramp_steps += 1;
            }
            tracing::info!("      {}", outcome.verdict);
            schedule.advance();
        } else {
            if ctx.dc_cycles == 0 {
                tracing::warn!("Failed in the first step");
                sim.diverged_recovery();
                status = PhaseStatus::Aborted(AbortReason::FirstStepFailed);
                break;
            }
            if retry >= MAX_RAMP_RETRIES {
                tracing::warn!("Too many failed steps, giving up");
                sim.diverged_recovery();
                status = PhaseStatus::Aborted(AbortReason::RetryBudgetExhausted);
                break;
            }
            retry += 1;
            retries += 1;
            sim.diverged_recovery();
            schedule.refine();
            tracing::info!("nonlinear solver {}, do recovery...", outcome.verdict);
        }

        if ramp.predict && !schedule.done() {
            if let Some(order) = history.best_projection() {
                sim.predict(&history, order, schedule.fraction());
            }
        }
    }

    if !status.is_completed() {
        return Ok(result(sim, status, fractions, retries));
    }

    let mut gmin = ramp.gmin_init;
    for next in gmin_schedule(ramp.gmin_init, ramp.gmin) {
        tracing::info!("DC reduce gmin to {next:e}");
        if let Some(circuit) = sim.circuit_mut() {
            circuit.set_gmin(next);
        }

        sim.pre_solve(ctx.dc_cycles == 0)?;
        let outcome = sim.solve(ctx.time)?;
        if let Some(ref mut s) = stats {
            s.record_solve(&outcome);
        }

        if !outcome.converged() {
            tracing::info!("nonlinear solver {}, stop reducing gmin", outcome.verdict);
            sim.diverged_recovery();
            if let Some(circuit) = sim.circuit_mut() {
                circuit.set_gmin(gmin);
            }
            break;
        }

        tracing::info!("      {}", outcome.verdict);
        sim.post_solve();
        if let Some(circuit) = sim.circuit_mut() {
            circuit.rotate_state_vectors();
        }
        gmin = next;
        if let Some(ref mut s) = stats {
            s.gmin_stages += 1;
        }
    }

    Ok(result(sim, status, fractions, retries))
}

/// Collective: the final gmin is broadcast from the circuit owner.
fn result(sim: &Simulation<'_>, status: PhaseStatus, ramp_fractions: Vec<f64>, retries: usize) -> OpResult {
    let comm = sim.comm();
    let local_gmin = sim.circuit().map_or(0.0, |c| c.gmin());
    OpResult {
        status,
        ramp_fractions,
        retries,
        gmin: comm.broadcast_f64(local_gmin, comm.last_rank()),
        node_names: sim.node_names(),
        node_values: sim.circuit_values(),
    }
}
