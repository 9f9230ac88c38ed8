//! Adaptive implicit time integration of the coupled system.
//!
//! Each step runs through an explicit phase machine:
//! `AdvanceStimulus -> Solve -> EvaluateDivergence -> EvaluateLte ->
//! Accept | Reject -> PredictNext -> AdvanceStimulus`. A diverged solve
//! halves the step and re-enters `AdvanceStimulus`; an LTE rejection
//! shrinks the step and re-solves the same step from a new guess.

use rayon::prelude::*;

use super::dcop::{self, OpMode};
use super::{AbortReason, PhaseStatus, TranResult};
use crate::circuit::{AnalysisMode, CircuitMode, InitMode, IntegrationMethod};
use crate::config::IntegrationScheme;
use crate::context::{AnalysisContext, TimeState};
use crate::error::{MixError, Result};
use crate::history::{HistoryRing, Projection};
use crate::simulation::Simulation;
use crate::solver::newton::SolveOutcome;
use crate::stats::Stats;

/// Consecutive diverged solves tolerated within one step.
const MAX_DIVERGED_RETRIES: usize = 8;

/// Step-size change implied by an LTE ratio.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StepDecision {
    /// Discard the step and retry with `dt * factor`.
    Reject { factor: f64 },
    /// Keep the step; the next one uses `dt * factor`.
    Accept { factor: f64 },
}

/// Map the LTE ratio `r` (tolerance over error, order-scaled) to a decision.
pub fn lte_step_decision(r: f64) -> StepDecision {
    if r < 0.9 {
        return StepDecision::Reject { factor: 0.9 * r };
    }
    let factor = if r > 10.0 {
        2.0
    } else if r > 3.0 {
        1.5
    } else if r > 1.3 {
        1.1
    } else if r > 1.0 {
        1.0
    } else {
        0.9
    };
    StepDecision::Accept { factor }
}

/// Accepted steps needed before LTE control and prediction engage.
pub fn history_threshold(scheme: IntegrationScheme) -> usize {
    match scheme {
        IntegrationScheme::Bdf1 => 3,
        IntegrationScheme::Bdf2 => 4,
    }
}

fn projection_for(scheme: IntegrationScheme) -> Projection {
    match scheme {
        IntegrationScheme::Bdf1 => Projection::Linear,
        IntegrationScheme::Bdf2 => Projection::Quadratic,
    }
}

/// Weighted RMS of the local truncation error of `x` at `time.clock`.
///
/// The error is estimated from the difference between the solution and the
/// polynomial predictor through the accepted history, scaled by the step
/// ratio of the scheme. `None` if the history is too short.
pub fn lte_norm(
    x: &[f64],
    history: &HistoryRing,
    time: &TimeState,
    rel_tol: f64,
    abs_tol: f64,
) -> Option<f64> {
    let order = projection_for(time.scheme);
    let w = history.weights(order, time.clock)?;
    let newest = &history.get(0)?.solution;
    let middle = &history.get(1)?.solution;
    let oldest = history.get(2).map(|e| e.solution.as_slice());

    let h = time.dt;
    let c = match time.scheme {
        IntegrationScheme::Bdf1 => h / (h + time.dt_last),
        IntegrationScheme::Bdf2 => h / (h + time.dt_last + time.dt_last_last),
    };

    let sum: f64 = x
        .par_iter()
        .enumerate()
        .map(|(i, &xi)| {
            let predicted = w[0] * newest[i] + w[1] * middle[i] + oldest.map_or(0.0, |o| w[2] * o[i]);
            let err = c * (xi - predicted) / (rel_tol * xi.abs() + abs_tol);
            err * err
        })
        .sum();
    Some((sum / x.len().max(1) as f64).sqrt())
}

/// Something notable that happened during the run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StepEvent {
    /// The solve at `time` diverged; the step was halved.
    Diverged { time: f64, dt_before: f64, dt_after: f64 },
    /// A converged step of `dt_before` failed the LTE test with ratio `r`;
    /// it is retried at `time` with the shorter `dt_after`.
    LteRejected { time: f64, r: f64, dt_before: f64, dt_after: f64 },
    Accepted { time: f64, dt: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Phase {
    AdvanceStimulus,
    Solve,
    EvaluateDivergence(SolveOutcome),
    EvaluateLte(SolveOutcome),
    Accept { factor: f64, outcome: SolveOutcome },
    Reject { factor: f64, r: f64 },
    PredictNext,
    Done(PhaseStatus),
}

/// Integrate from `tstart` to `tstop` with nominal step `tstep`.
#[allow(clippy::too_many_arguments)]
pub fn run(
    sim: &mut Simulation<'_>,
    ctx: &mut AnalysisContext,
    tstep: f64,
    tstop: f64,
    tstart: f64,
    uic: bool,
    mut stats: Option<&mut Stats>,
) -> Result<TranResult> {
    ctx.settings.validate()?;
    if !(tstep > 0.0) || !(tstop > tstart) {
        return Err(MixError::Analysis(format!(
            "transient needs tstep > 0 and tstop > tstart, got tstep={tstep} tstart={tstart} tstop={tstop}"
        )));
    }
    let settings = ctx.settings.transient.clone();

    if settings.tran_op {
        let op = dcop::run(sim, ctx, OpMode::TransientStart { tstart, uic }, stats.as_deref_mut())?;
        if !op.status.is_completed() {
            tracing::warn!("transient operating point did not complete, starting from last accepted state");
        }
    }
    sim.log_circuit_nodes();

    let _span = tracing::info_span!("transient", tstep, tstop).entered();
    let scheme = settings.scheme;
    let threshold = history_threshold(scheme);
    let max_step = settings.max_step.unwrap_or(10.0 * tstep);

    ctx.time = TimeState {
        clock: tstart,
        dt: tstep / 10.0,
        dt_last: f64::INFINITY,
        dt_last_last: f64::INFINITY,
        time_dependent: true,
        scheme,
        bdf2_restart: scheme == IntegrationScheme::Bdf2,
    };
    ctx.t_cycles = 0;
    tracing::info!("Transient compute from {tstart} to {tstop}");

    let dt0 = ctx.time.dt;
    if let Some(circuit) = sim.circuit_mut() {
        circuit.set_mode(CircuitMode::new(AnalysisMode::Tran, InitMode::Transient));
        circuit.set_delta(dt0);
        circuit.rotate_state_vectors();
        circuit.set_integration_method(IntegrationMethod::Gear);
        circuit.set_time_order(1);
    }

    let mut history = HistoryRing::new();
    let mut times = Vec::new();
    let mut node_values = Vec::new();
    let mut events = Vec::new();
    let mut diverged_retry = 0;
    let mut phase = Phase::AdvanceStimulus;

    let status = loop {
        phase = match phase {
            Phase::AdvanceStimulus => {
                let t = &ctx.time;
                if t.clock >= tstop + 0.5 * t.dt {
                    Phase::Done(PhaseStatus::Completed)
                } else {
                    tracing::info!("t = {}", t.clock);
                    let (clock, dt) = (t.clock, t.dt);
                    if let Some(circuit) = sim.circuit_mut() {
                        circuit.set_time(clock);
                        circuit.set_delta(dt);
                    }
                    sim.update_stimulus(clock);
                    Phase::Solve
                }
            }

            Phase::Solve => {
                sim.pre_solve(ctx.t_cycles == 0)?;
                let outcome = sim.solve(ctx.time)?;
                if let Some(ref mut s) = stats {
                    s.record_solve(&outcome);
                }
                Phase::EvaluateDivergence(outcome)
            }

            Phase::EvaluateDivergence(outcome) if outcome.converged() => {
                diverged_retry = 0;
                Phase::EvaluateLte(outcome)
            }

            Phase::EvaluateDivergence(outcome) => {
                diverged_retry += 1;
                sim.diverged_recovery();
                if diverged_retry >= MAX_DIVERGED_RETRIES {
                    tracing::warn!("Too many failed steps, giving up");
                    Phase::Done(PhaseStatus::Aborted(AbortReason::RetryBudgetExhausted))
                } else {
                    tracing::info!("nonlinear solver {}, do recovery...", outcome.verdict);
                    let t = &mut ctx.time;
                    let (failed_at, dt_before) = (t.clock, t.dt);
                    t.dt /= 2.0;
                    t.clock = (t.clock - t.dt).max(tstart);
                    events.push(StepEvent::Diverged {
                        time: failed_at,
                        dt_before,
                        dt_after: t.dt,
                    });
                    Phase::AdvanceStimulus
                }
            }

            Phase::EvaluateLte(outcome) => {
                if settings.auto_step && ctx.t_cycles >= threshold {
                    let norm = lte_norm(
                        sim.solution(),
                        &history,
                        &ctx.time,
                        settings.lte_rel_tol,
                        settings.lte_abs_tol,
                    )
                    .unwrap_or(0.0);
                    let r = norm.powf(-1.0 / (scheme.order() as f64 + 1.0));
                    tracing::debug!(norm, r, "local truncation error");
                    match lte_step_decision(r) {
                        StepDecision::Reject { factor } => Phase::Reject { factor, r },
                        StepDecision::Accept { factor } => Phase::Accept { factor, outcome },
                    }
                } else {
                    let factor = if ctx.time.dt.abs() < tstep.abs() { 1.1 } else { 1.0 };
                    Phase::Accept { factor, outcome }
                }
            }

            Phase::Reject { factor, r } => {
                tracing::info!("LTE too large, time step rejected");
                if let Some(ref mut s) = stats {
                    s.timesteps_rejected += 1;
                }
                let t = &mut ctx.time;
                let hn = t.dt;
                t.clock -= t.dt;
                t.dt *= factor;
                t.clock += t.dt;
                events.push(StepEvent::LteRejected {
                    time: t.clock,
                    r,
                    dt_before: hn,
                    dt_after: t.dt,
                });
                let ratio = t.dt / hn;
                if let Some(latest) = history.latest() {
                    sim.interpolate(ratio, &latest.solution);
                }
                Phase::PredictNext
            }

            Phase::Accept { factor, outcome } => {
                let t = &mut ctx.time;
                t.dt_last_last = t.dt_last;
                t.dt_last = t.dt;
                t.dt *= factor;
                if settings.auto_step && ctx.t_cycles >= threshold {
                    t.dt = t.dt.min(max_step);
                }
                tracing::info!("      {}", outcome.verdict);

                sim.post_solve();
                if ctx.t_cycles == 0 {
                    if let Some(circuit) = sim.circuit_mut() {
                        circuit.prepare_first_step();
                    }
                }
                ctx.t_cycles += 1;
                if let Some(ref mut s) = stats {
                    s.timesteps_accepted += 1;
                }

                let t = &mut ctx.time;
                let accepted_at = t.clock;
                events.push(StepEvent::Accepted {
                    time: accepted_at,
                    dt: t.dt_last,
                });
                times.push(accepted_at);
                node_values.push(sim.circuit_values());
                history.push(accepted_at, sim.solution());

                t.clock += t.dt;
                if t.clock > tstop && t.clock < tstop + t.dt - 1e-10 * t.dt {
                    t.dt -= t.clock - tstop;
                    t.clock = tstop;
                }
                t.bdf2_restart = false;

                if let Some(circuit) = sim.circuit_mut() {
                    circuit.rotate_state_vectors();
                    circuit.set_mode(CircuitMode::new(AnalysisMode::Tran, InitMode::Predict));
                    circuit.set_time_order(2);
                }
                Phase::PredictNext
            }

            Phase::PredictNext => {
                if settings.predict && ctx.t_cycles >= threshold {
                    sim.predict(&history, projection_for(scheme), ctx.time.clock);
                }
                Phase::AdvanceStimulus
            }

            Phase::Done(status) => break status,
        };
    };

    Ok(TranResult {
        status,
        times,
        node_names: sim.node_names(),
        node_values,
        events,
    })
}
