//! Shared helpers for the end-to-end tests.

#![allow(dead_code)]

use std::cell::Cell;
use std::rc::Rc;

use mixsolve::circuit::MnaCircuit;
use mixsolve::config::{BarSettings, SolverSettings};
use mixsolve::device::ResistiveBar;
use mixsolve::ir::Netlist;
use mixsolve::parser;
use mixsolve::simulation::Simulation;
use mixsolve::solver::comm::SingleProcessComm;
use mixsolve::solver::convergence::Verdict;
use mixsolve::solver::newton::{NewtonSolver, NonlinearProblem, NonlinearSolve, SolveOutcome};

/// Settings with a linear 3-node bar of 2 kOhm between its electrodes.
pub fn bar_settings() -> SolverSettings {
    SolverSettings {
        device: BarSettings {
            nodes: 3,
            segment_conductance: 1e-3,
            ..BarSettings::default()
        },
        ..SolverSettings::default()
    }
}

pub fn parse(src: &str) -> Netlist {
    parser::parse(src).expect("parse failed")
}

/// Single-process simulation of the bar coupled to `netlist`.
pub fn simulation<'a>(comm: &'a SingleProcessComm, netlist: &Netlist, settings: &SolverSettings) -> Simulation<'a> {
    let bar = ResistiveBar::new(&settings.device, 0, 1).expect("bad device settings");
    let circuit = MnaCircuit::from_netlist(netlist).expect("bad circuit");
    Simulation::new(Box::new(bar), Some(Box::new(circuit)), comm, settings).expect("setup failed")
}

/// Index of circuit node `name` within the circuit values.
pub fn node_index(sim: &Simulation<'_>, name: &str) -> usize {
    sim.node_names()
        .iter()
        .position(|n| n == name)
        .unwrap_or_else(|| panic!("node {} not found", name))
}

/// Newton solver that reports a spurious divergence on selected calls
/// (1-based) without touching the iterate.
pub struct FailingSolve<'a> {
    inner: NewtonSolver<'a>,
    fail_on: Vec<usize>,
    calls: Rc<Cell<usize>>,
}

impl<'a> FailingSolve<'a> {
    pub fn new(inner: NewtonSolver<'a>, fail_on: &[usize]) -> (Self, Rc<Cell<usize>>) {
        let calls = Rc::new(Cell::new(0));
        let solver = Self {
            inner,
            fail_on: fail_on.to_vec(),
            calls: calls.clone(),
        };
        (solver, calls)
    }
}

impl NonlinearSolve for FailingSolve<'_> {
    fn solve(&mut self, problem: &mut dyn NonlinearProblem, x: &mut [f64]) -> mixsolve::error::Result<SolveOutcome> {
        let call = self.calls.get() + 1;
        self.calls.set(call);
        if self.fail_on.contains(&call) {
            return Ok(SolveOutcome {
                verdict: Verdict::DivergedIterationLimit,
                iterations: 0,
                function_evals: 0,
            });
        }
        self.inner.solve(problem, x)
    }
}

/// Install a [`FailingSolve`] on `sim`; returns the call counter.
pub fn inject_failures<'a>(
    sim: &mut Simulation<'a>,
    comm: &'a SingleProcessComm,
    settings: &SolverSettings,
    fail_on: &[usize],
) -> Rc<Cell<usize>> {
    let newton = NewtonSolver::new(comm, &settings.newton, sim.n_dofs());
    let (solver, calls) = FailingSolve::new(newton, fail_on);
    sim.replace_solver(Box::new(solver));
    calls
}
