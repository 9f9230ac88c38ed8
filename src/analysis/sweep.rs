//! DC transfer curve: sweep one independent source with bisection backoff.

use super::{AbortReason, PhaseStatus, SweepResult};
use crate::circuit::{AnalysisMode, CircuitMode, InitMode};
use crate::context::{AnalysisContext, TimeState};
use crate::error::{MixError, Result};
use crate::history::{HistoryRing, RetryStack};
use crate::ir::SweepSource;
use crate::simulation::Simulation;
use crate::stats::Stats;

/// Bisections that may be pending at once.
const MAX_PENDING: usize = 8;
const STEP_GROWTH: f64 = 1.1;

/// Swept value, adaptive step and pending retry targets.
#[derive(Debug, Clone)]
pub struct SweepState {
    value: f64,
    step: f64,
    step_max: f64,
    direction: f64,
    nominal_step: f64,
    stop: f64,
    last_accepted: Option<f64>,
    pending: RetryStack,
}

impl SweepState {
    pub fn new(start: f64, stop: f64, step: f64, step_max: f64) -> Self {
        Self {
            value: start,
            step,
            step_max: step_max.abs().max(step.abs()),
            direction: step.signum(),
            nominal_step: step,
            stop,
            last_accepted: None,
            pending: RetryStack::new(MAX_PENDING),
        }
    }

    /// Value to solve at next.
    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn step(&self) -> f64 {
        self.step
    }

    pub fn last_accepted(&self) -> Option<f64> {
        self.last_accepted
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// True while the value has not passed the stop value.
    pub fn in_range(&self) -> bool {
        (self.value - self.stop) * self.direction <= 1e-7 * self.nominal_step.abs()
    }

    /// Record the current value as accepted and pick the next one.
    pub fn accept(&mut self) {
        let accepted = self.value;
        self.last_accepted = Some(accepted);

        self.value = match self.pending.pop() {
            Some(pending) => pending,
            None => accepted + self.step,
        };
        if (self.value - self.stop).abs() < 1e-10 {
            self.value = self.stop;
        }

        if self.step.abs() < self.step_max {
            self.step = (self.step.abs() * STEP_GROWTH).min(self.step_max) * self.direction;
        }

        let overshoots = (self.value - self.stop) * self.direction > 0.0;
        let short_of_stop = (accepted - self.stop) * self.direction < 0.0;
        if overshoots && short_of_stop {
            self.value = self.stop;
        }
    }

    /// Bisect back toward the last accepted value. Returns false, leaving
    /// the state unchanged, when no point has been accepted yet or too many
    /// bisections are already pending.
    pub fn reject(&mut self) -> bool {
        let Some(last) = self.last_accepted else {
            return false;
        };
        if !self.pending.push(self.value) {
            return false;
        }
        self.value = 0.5 * (self.value + last);
        true
    }
}

/// Sweep `source` from `start` to `stop`.
///
/// Errors if the circuit has no such source. Divergence is recovered by
/// bisection; the phase aborts if the first point fails or too many
/// bisections pile up.
#[allow(clippy::too_many_arguments)]
pub fn run(
    sim: &mut Simulation<'_>,
    ctx: &mut AnalysisContext,
    source: &SweepSource,
    start: f64,
    stop: f64,
    step: f64,
    mut stats: Option<&mut Stats>,
) -> Result<SweepResult> {
    ctx.settings.validate()?;
    let _span = tracing::info_span!("dc_sweep", source = source.name()).entered();

    if step == 0.0 || !step.is_finite() {
        return Err(MixError::Analysis(format!("sweep of {} has zero step", source.name())));
    }

    ctx.time = TimeState::steady(0.0);
    ctx.dc_cycles = 0;
    sim.update_stimulus(0.0);

    let local_found = match sim.circuit_mut() {
        Some(circuit) => {
            circuit.set_mode(CircuitMode::new(AnalysisMode::DcSweep, InitMode::Junction));
            match source {
                SweepSource::Voltage(name) => circuit.has_voltage_source(name),
                SweepSource::Current(name) => circuit.has_current_source(name),
            }
        }
        None => false,
    };
    let comm = sim.comm();
    if !comm.broadcast_bool(local_found, comm.last_rank()) {
        return Err(MixError::Analysis(format!(
            "sweep source {} not found in circuit",
            source.name()
        )));
    }

    let (kind, unit, step_max, predict) = match source {
        SweepSource::Voltage(_) => ("voltage", "V", ctx.settings.sweep.voltage_step_max, ctx.settings.sweep.predict),
        SweepSource::Current(_) => ("current", "A", ctx.settings.sweep.current_step_max, ctx.settings.sweep.predict),
    };
    tracing::info!("DC {kind} scan from {start} step {step} to {stop}");

    let mut state = SweepState::new(start, stop, step, step_max);
    let mut history = HistoryRing::new();
    let mut values = Vec::new();
    let mut node_values = Vec::new();
    let mut rejected = 0;
    let mut status = PhaseStatus::Completed;

    while state.in_range() {
        let value = state.value();
        tracing::info!("DC scan: {} = {value} {unit}", source.name());

        if let Some(circuit) = sim.circuit_mut() {
            match source {
                SweepSource::Voltage(name) => circuit.set_voltage(name, value)?,
                SweepSource::Current(name) => circuit.set_current(name, value)?,
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
            ctx.dc_cycles += 1;
            if predict {
                history.push(value, sim.solution());
            }
            values.push(value);
            node_values.push(sim.circuit_values());
            if let Some(ref mut s) = stats {
                s.sweep_points += 1;
            }
            state.accept();
            tracing::info!("      {}", outcome.verdict);
        } else {
            if ctx.dc_cycles == 0 {
                tracing::warn!("Failed in the first step");
                sim.diverged_recovery();
                status = PhaseStatus::Aborted(AbortReason::FirstStepFailed);
                break;
            }
            if !state.reject() {
                tracing::warn!("Too many failed steps, giving up");
                sim.diverged_recovery();
                status = PhaseStatus::Aborted(AbortReason::RetryBudgetExhausted);
                break;
            }
            rejected += 1;
            sim.diverged_recovery();
            tracing::info!("nonlinear solver {}, do recovery...", outcome.verdict);
        }

        if predict && state.in_range() {
            if let Some(order) = history.best_projection() {
                sim.predict(&history, order, state.value());
            }
        }
    }

    Ok(SweepResult {
        status,
        source: source.name().to_string(),
        values,
        node_names: sim.node_names(),
        node_values,
        rejected,
    })
}
