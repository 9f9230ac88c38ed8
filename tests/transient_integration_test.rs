//! End-to-end tests for adaptive time integration.

mod common;

use approx::assert_abs_diff_eq;
use mixsolve::analysis::{self, transient, AnalysisResult, PhaseStatus, StepEvent, TranResult};
use mixsolve::config::{IntegrationScheme, SolverSettings};
use mixsolve::context::AnalysisContext;
use mixsolve::error::MixError;
use mixsolve::output;
use mixsolve::solver::comm::SingleProcessComm;
use mixsolve::stats::Stats;

const RAMPED_RC: &str = "\
* 0 to 5 V over 10 s into a 1 mF cap and the 2k bar
V1 in 0 PWL(0 0 10 5)
R1 in a 1k
C1 a 0 1m
.ELECTRODE anode a
.ELECTRODE cathode 0
.TRAN 1 10
";

const HELD_RC: &str = "\
V1 in 0 DC 5
R1 in a 1k
C1 a 0 1m
.ELECTRODE anode a
.ELECTRODE cathode 0
";

fn bdf1_settings() -> SolverSettings {
    let mut settings = common::bar_settings();
    settings.transient.scheme = IntegrationScheme::Bdf1;
    settings.transient.tran_op = false;
    settings
}

/// Ramped RC with tolerances tight enough to force LTE rejections.
fn tight_lte_settings() -> SolverSettings {
    let mut settings = bdf1_settings();
    settings.transient.lte_rel_tol = 1e-7;
    settings.transient.lte_abs_tol = 1e-9;
    settings
}

fn assert_times_increase(result: &TranResult) {
    assert!(
        result.times.windows(2).all(|w| w[1] > w[0]),
        "times not increasing: {:?}",
        result.times
    );
}

#[test]
fn divergence_halves_the_step_and_the_run_completes() {
    let comm = SingleProcessComm;
    let settings = bdf1_settings();
    let netlist = common::parse(RAMPED_RC);
    let mut sim = common::simulation(&comm, &netlist, &settings);
    common::inject_failures(&mut sim, &comm, &settings, &[3]);
    let mut ctx = AnalysisContext::new(settings);
    let mut stats = Stats::new();

    let result = transient::run(&mut sim, &mut ctx, 1.0, 10.0, 0.0, false, Some(&mut stats)).unwrap();

    assert_eq!(result.status, PhaseStatus::Completed);
    let diverged: Vec<_> = result
        .events
        .iter()
        .filter_map(|e| match *e {
            StepEvent::Diverged { dt_before, dt_after, .. } => Some((dt_before, dt_after)),
            _ => None,
        })
        .collect();
    assert_eq!(diverged.len(), 1);
    assert_abs_diff_eq!(diverged[0].1, diverged[0].0 / 2.0, epsilon = 1e-15);
    assert_eq!(stats.divergences, 1);

    assert_eq!(result.times[0], 0.0);
    assert_eq!(*result.times.last().unwrap(), 10.0);
    assert_times_increase(&result);
    assert_eq!(result.times.len(), result.node_values.len());
    assert_eq!(stats.timesteps_accepted as usize, result.times.len());

    // ramp response of a 2/3 divider with a 0.667 s time constant
    let a = common::node_index(&sim, "a");
    let v_end = result.node_values.last().unwrap()[a];
    assert!(v_end > 0.0 && v_end < 5.0);
    assert_abs_diff_eq!(v_end, 10.0 / 3.0 - 2.0 / 9.0, epsilon = 0.05);
}

#[test]
fn first_steps_grow_toward_the_nominal_step() {
    let comm = SingleProcessComm;
    let settings = bdf1_settings();
    let netlist = common::parse(RAMPED_RC);
    let mut sim = common::simulation(&comm, &netlist, &settings);
    let mut ctx = AnalysisContext::new(settings);

    let result = transient::run(&mut sim, &mut ctx, 1.0, 10.0, 0.0, false, None).unwrap();

    let accepted: Vec<f64> = result
        .events
        .iter()
        .filter_map(|e| match *e {
            StepEvent::Accepted { dt, .. } => Some(dt),
            _ => None,
        })
        .collect();
    assert_abs_diff_eq!(accepted[0], 0.1, epsilon = 1e-15);
    assert_abs_diff_eq!(accepted[1], 0.11, epsilon = 1e-12);
    assert_abs_diff_eq!(accepted[2], 0.121, epsilon = 1e-12);
    assert!(accepted.iter().all(|&dt| dt <= 10.0 + 1e-12));
}

#[test]
fn operating_point_seeds_the_first_step() {
    let comm = SingleProcessComm;
    let settings = common::bar_settings();
    let netlist = common::parse(&format!("{HELD_RC}.TRAN 0.1 1\n"));
    let mut sim = common::simulation(&comm, &netlist, &settings);
    let mut ctx = AnalysisContext::new(settings);

    let results = analysis::run(&mut sim, &mut ctx, &netlist.analyses, None).unwrap();
    let AnalysisResult::Tran(result) = &results[0] else {
        panic!("expected a transient result");
    };

    assert!(result.status.is_completed());
    assert_eq!(*result.times.last().unwrap(), 1.0);
    let a = common::node_index(&sim, "a");
    for nodes in &result.node_values {
        assert_abs_diff_eq!(nodes[a], 10.0 / 3.0, epsilon = 1e-3);
    }
}

#[test]
fn uic_starts_from_the_stored_state() {
    let comm = SingleProcessComm;
    let settings = common::bar_settings();
    let netlist = common::parse(&format!("{HELD_RC}.TRAN 0.1 1 UIC\n"));
    let mut sim = common::simulation(&comm, &netlist, &settings);
    let mut ctx = AnalysisContext::new(settings);

    let results = analysis::run(&mut sim, &mut ctx, &netlist.analyses, None).unwrap();
    let AnalysisResult::Tran(result) = &results[0] else {
        panic!("expected a transient result");
    };

    assert!(result.status.is_completed());
    assert_times_increase(result);
    let a = common::node_index(&sim, "a");
    let first = result.node_values[0][a];
    let last = result.node_values.last().unwrap()[a];
    // the capacitor charges from zero
    assert!(first < 1.0, "first V(a) = {first}");
    assert!(last > first);
    assert!(last < 10.0 / 3.0 + 1e-6);
}

#[test]
fn bdf2_charges_the_device_capacitance() {
    let comm = SingleProcessComm;
    let mut settings = common::bar_settings();
    settings.device.node_capacitance = 1e-3;
    settings.device.injection = Some("PWL(0 0 1 1m)".into());
    settings.transient.scheme = IntegrationScheme::Bdf2;
    let netlist = common::parse(
        "\
V1 a 0 DC 0
.ELECTRODE anode a
.ELECTRODE cathode 0
.TRAN 0.1 5
",
    );
    let mut sim = common::simulation(&comm, &netlist, &settings);
    let mut ctx = AnalysisContext::new(settings);
    let mut stats = Stats::new();

    let results = analysis::run(&mut sim, &mut ctx, &netlist.analyses, Some(&mut stats)).unwrap();
    let AnalysisResult::Tran(result) = &results[0] else {
        panic!("expected a transient result");
    };

    assert!(result.status.is_completed());
    assert_eq!(*result.times.last().unwrap(), 5.0);
    assert_times_increase(result);
    assert_eq!(stats.phases().len(), 1);

    // 1 mA into two 1k halves in parallel, settled after ten time constants
    let mid_psi = sim.solution()[2];
    assert_abs_diff_eq!(mid_psi, 0.5, epsilon = 1e-2);
}

#[test]
fn lte_rejection_rolls_back_and_shrinks_the_step() {
    let comm = SingleProcessComm;
    let settings = tight_lte_settings();
    let netlist = common::parse(RAMPED_RC);
    let mut sim = common::simulation(&comm, &netlist, &settings);
    let mut ctx = AnalysisContext::new(settings);
    let mut stats = Stats::new();

    let result = transient::run(&mut sim, &mut ctx, 1.0, 10.0, 0.0, false, Some(&mut stats)).unwrap();

    assert_eq!(result.status, PhaseStatus::Completed);
    assert_eq!(*result.times.last().unwrap(), 10.0);
    assert_times_increase(&result);

    let mut last_accepted = f64::NAN;
    let mut rejected = 0;
    for event in &result.events {
        match *event {
            StepEvent::Accepted { time, dt } => {
                assert!(dt <= 10.0 + 1e-12, "dt {dt} above max_step");
                last_accepted = time;
            }
            StepEvent::LteRejected {
                time,
                r,
                dt_before,
                dt_after,
            } => {
                rejected += 1;
                assert!(r < 0.9);
                assert_abs_diff_eq!(dt_after, 0.9 * r * dt_before, epsilon = 1e-15);
                assert!(dt_after < dt_before);
                // retried from the last accepted time
                assert_abs_diff_eq!(time, last_accepted + dt_after, epsilon = 1e-12);
            }
            StepEvent::Diverged { .. } => panic!("unexpected divergence"),
        }
    }
    assert!(rejected >= 1);
    assert_eq!(stats.timesteps_rejected as usize, rejected);
    assert_eq!(stats.timesteps_accepted as usize, result.times.len());
}

#[test]
fn lte_rejection_does_not_use_the_divergence_budget() {
    let comm = SingleProcessComm;
    let settings = tight_lte_settings();
    let netlist = common::parse(RAMPED_RC);

    let first_rejection = {
        let mut sim = common::simulation(&comm, &netlist, &settings);
        let mut ctx = AnalysisContext::new(settings.clone());
        let result = transient::run(&mut sim, &mut ctx, 1.0, 10.0, 0.0, false, None).unwrap();
        result
            .events
            .iter()
            .position(|e| matches!(e, StepEvent::LteRejected { .. }))
            .expect("no LTE rejection")
    };

    // one event per solve, so the rejected solve is call first_rejection + 1;
    // seven divergences right after it stay under the budget of eight
    let fail_on: Vec<usize> = (first_rejection + 2..=first_rejection + 8).collect();
    let mut sim = common::simulation(&comm, &netlist, &settings);
    common::inject_failures(&mut sim, &comm, &settings, &fail_on);
    let mut ctx = AnalysisContext::new(settings.clone());

    let result = transient::run(&mut sim, &mut ctx, 1.0, 10.0, 0.0, false, None).unwrap();

    assert_eq!(result.status, PhaseStatus::Completed);
    assert!(matches!(result.events[first_rejection], StepEvent::LteRejected { .. }));
    let diverged = result
        .events
        .iter()
        .filter(|e| matches!(e, StepEvent::Diverged { .. }))
        .count();
    assert_eq!(diverged, 7);
    assert_times_increase(&result);
}

#[test]
fn step_growth_is_capped_at_max_step() {
    let comm = SingleProcessComm;
    let mut settings = common::bar_settings();
    settings.transient.max_step = Some(0.25);
    let netlist = common::parse(&format!("{HELD_RC}.TRAN 0.1 3\n"));
    let mut sim = common::simulation(&comm, &netlist, &settings);
    let mut ctx = AnalysisContext::new(settings);

    let results = analysis::run(&mut sim, &mut ctx, &netlist.analyses, None).unwrap();
    let AnalysisResult::Tran(result) = &results[0] else {
        panic!("expected a transient result");
    };

    assert!(result.status.is_completed());
    assert_eq!(*result.times.last().unwrap(), 3.0);
    let steps: Vec<f64> = result
        .events
        .iter()
        .filter_map(|e| match *e {
            StepEvent::Accepted { dt, .. } => Some(dt),
            _ => None,
        })
        .collect();
    assert!(steps.iter().all(|&dt| dt <= 0.25 + 1e-12), "steps: {steps:?}");
    assert!(steps.iter().any(|&dt| (dt - 0.25).abs() < 1e-12), "steps: {steps:?}");
}

#[test]
fn non_positive_max_step_is_a_config_error() {
    let comm = SingleProcessComm;
    let mut settings = bdf1_settings();
    let netlist = common::parse(RAMPED_RC);
    let mut sim = common::simulation(&comm, &netlist, &settings);
    settings.transient.max_step = Some(0.0);
    let mut ctx = AnalysisContext::new(settings);

    let err = transient::run(&mut sim, &mut ctx, 1.0, 10.0, 0.0, false, None).unwrap_err();
    assert!(matches!(err, MixError::Config(ref msg) if msg.contains("transient.max_step")));
}

#[test]
fn invalid_time_window_is_an_error() {
    let comm = SingleProcessComm;
    let settings = bdf1_settings();
    let netlist = common::parse(RAMPED_RC);
    let mut sim = common::simulation(&comm, &netlist, &settings);
    let mut ctx = AnalysisContext::new(settings);

    assert!(transient::run(&mut sim, &mut ctx, 0.0, 10.0, 0.0, false, None).is_err());
    assert!(transient::run(&mut sim, &mut ctx, 1.0, 1.0, 1.0, false, None).is_err());
}

#[test]
fn transient_csv_has_time_column() {
    let comm = SingleProcessComm;
    let settings = bdf1_settings();
    let netlist = common::parse(RAMPED_RC);
    let mut sim = common::simulation(&comm, &netlist, &settings);
    let mut ctx = AnalysisContext::new(settings);
    let result = transient::run(&mut sim, &mut ctx, 1.0, 10.0, 0.0, false, None).unwrap();

    let mut buf = Vec::new();
    output::write_tran_csv(&result, &mut buf).unwrap();
    let csv = String::from_utf8(buf).unwrap();
    let lines: Vec<&str> = csv.lines().collect();
    assert_eq!(lines[0], "Time,V(in),V(a),I(V1)");
    assert_eq!(lines.len(), result.times.len() + 1);
    assert!(lines.last().unwrap().starts_with("10,"));
}
