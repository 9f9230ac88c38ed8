//! The coupled device/circuit system and the solution state the
//! continuation controllers drive.

use crate::circuit::CircuitEngine;
use crate::config::SolverSettings;
use crate::context::TimeState;
use crate::coupling::{CircuitCoupling, CircuitRole, SparsityPattern};
use crate::device::DeviceProblem;
use crate::error::Result;
use crate::history::{clamp_densities, HistoryRing, Projection};
use crate::solver::comm::CommunicationBackend;
use crate::solver::convergence::{EquationGroup, ResidualNorms, Verdict};
use crate::solver::newton::{NewtonSolver, NonlinearProblem, NonlinearSolve, SolveOutcome};
use crate::sparse::TripletMatrix;

/// Device equations followed by circuit node equations, as one nonlinear
/// problem.
pub struct MixedSystem<'a> {
    device: Box<dyn DeviceProblem + 'a>,
    coupling: CircuitCoupling<'a>,
    groups: Vec<EquationGroup>,
    capacity: usize,
    time: TimeState,
}

impl MixedSystem<'_> {
    pub fn time(&self) -> &TimeState {
        &self.time
    }

    fn group_of(&self, dof: usize) -> EquationGroup {
        self.groups.get(dof).copied().unwrap_or(EquationGroup::Electrode)
    }
}

impl NonlinearProblem for MixedSystem<'_> {
    fn n_dofs(&self) -> usize {
        self.device.n_dofs() + self.coupling.n_dofs()
    }

    fn residual(&mut self, x: &[f64], f: &mut [f64]) -> Result<()> {
        self.device.residual(x, f, &self.time)?;
        self.coupling.fill_residual(x, f)
    }

    fn finalize_residual(&mut self, f: &mut [f64]) -> Result<()> {
        self.coupling.ground_residual(f);
        Ok(())
    }

    fn jacobian(&mut self, x: &[f64], jac: &mut TripletMatrix) -> Result<()> {
        self.device.jacobian(x, jac, &self.time)?;
        self.coupling.fill_jacobian(x, jac)
    }

    fn finalize_jacobian(&mut self, jac: &mut TripletMatrix) {
        self.coupling.ground_jacobian(jac);
    }

    fn jacobian_capacity(&self) -> usize {
        self.capacity
    }

    fn residual_norms(&self, f: &[f64]) -> ResidualNorms {
        ResidualNorms::from_residual(f, |i| self.group_of(i))
    }

    fn convergence_veto(&mut self, verdict: Verdict) -> bool {
        self.coupling.convergence_veto(verdict)
    }
}

/// Solution vector, recovery snapshot and nonlinear solver for one run.
///
/// Every rank holds a full replica of the solution vector.
pub struct Simulation<'a> {
    system: MixedSystem<'a>,
    solver: Box<dyn NonlinearSolve + 'a>,
    comm: &'a dyn CommunicationBackend,
    x: Vec<f64>,
    accepted: Vec<f64>,
    density_dofs: Vec<usize>,
}

impl<'a> Simulation<'a> {
    /// Bind electrodes, declare sparsity and configure the Newton solver.
    ///
    /// Collective. The last rank must pass the circuit engine; the others
    /// pass `None`.
    pub fn new(
        mut device: Box<dyn DeviceProblem + 'a>,
        circuit: Option<Box<dyn CircuitEngine + 'a>>,
        comm: &'a dyn CommunicationBackend,
        settings: &SolverSettings,
    ) -> Result<Self> {
        let role = match circuit {
            Some(engine) => CircuitRole::Owner(engine),
            None => CircuitRole::Follower,
        };
        let mut coupling = CircuitCoupling::new(role, comm)?;
        let n_device = device.n_dofs();
        coupling.set_offset(n_device);

        let bcs = device.boundary_conditions().to_vec();
        for binding in coupling.bind_electrodes(&bcs) {
            device.bind_electrode(binding.bc, coupling.dof(binding.node));
        }

        let n = n_device + coupling.n_dofs();
        let n_local = device.n_owned_dofs() + if coupling.is_owner() { coupling.n_dofs() } else { 0 };
        let mut pattern = SparsityPattern::new(n);
        device.declare_sparsity(&mut pattern);
        coupling.declare_sparsity(&bcs, &mut pattern, n_local, n);
        let capacity = pattern.total();

        tracing::info!(
            n_dofs = n,
            device_dofs = n_device,
            circuit_dofs = coupling.n_dofs(),
            capacity,
            "coupled system created"
        );

        let groups = (0..n_device).map(|dof| device.equation_group(dof)).collect();
        let density_dofs = device.density_dofs();
        let mut x = vec![0.0; n];
        device.load_solution(&mut x);

        Ok(Self {
            solver: Box::new(NewtonSolver::new(comm, &settings.newton, n)),
            system: MixedSystem {
                device,
                coupling,
                groups,
                capacity,
                time: TimeState::default(),
            },
            comm,
            accepted: x.clone(),
            x,
            density_dofs,
        })
    }

    /// Swap in a different nonlinear solver.
    pub fn replace_solver(&mut self, solver: Box<dyn NonlinearSolve + 'a>) {
        self.solver = solver;
    }

    pub fn comm(&self) -> &'a dyn CommunicationBackend {
        self.comm
    }

    pub fn n_dofs(&self) -> usize {
        self.x.len()
    }

    pub fn solution(&self) -> &[f64] {
        &self.x
    }

    pub fn solution_mut(&mut self) -> &mut [f64] {
        &mut self.x
    }

    /// Last accepted solution.
    pub fn accepted(&self) -> &[f64] {
        &self.accepted
    }

    pub fn coupling(&self) -> &CircuitCoupling<'a> {
        &self.system.coupling
    }

    pub fn circuit(&self) -> Option<&(dyn CircuitEngine + 'a)> {
        self.system.coupling.engine()
    }

    /// The circuit engine, on the owning rank only.
    pub fn circuit_mut(&mut self) -> Option<&mut (dyn CircuitEngine + 'a)> {
        self.system.coupling.engine_mut()
    }

    pub fn device(&self) -> &(dyn DeviceProblem + 'a) {
        self.system.device.as_ref()
    }

    pub fn update_stimulus(&mut self, clock: f64) {
        self.system.device.update_stimulus(clock);
    }

    /// Prepare the next solve. With `load`, the stored device state and
    /// the circuit's node values become the initial guess.
    pub fn pre_solve(&mut self, load: bool) -> Result<()> {
        if load {
            self.system.device.load_solution(&mut self.x);
            self.system.coupling.load_state(&mut self.x)?;
        }
        Ok(())
    }

    /// Run the nonlinear solver on the current guess.
    pub fn solve(&mut self, time: TimeState) -> Result<SolveOutcome> {
        self.system.time = time;
        self.solver.solve(&mut self.system, &mut self.x)
    }

    /// Record the current solution as accepted.
    pub fn post_solve(&mut self) {
        let time = self.system.time;
        self.system.device.post_solve(&self.x, &time);
        self.system.coupling.sync_from(&self.x);
        self.accepted.copy_from_slice(&self.x);
    }

    /// Restore the last accepted solution after a failed solve.
    pub fn diverged_recovery(&mut self) {
        self.x.copy_from_slice(&self.accepted);
        self.system.coupling.sync_from(&self.x);
    }

    /// Extrapolate the history to `target` as the next initial guess.
    /// Returns false when the history is too short for `order`.
    pub fn predict(&mut self, history: &HistoryRing, order: Projection, target: f64) -> bool {
        let Some(latest) = history.latest() else {
            return false;
        };
        if !history.project(order, target, &mut self.x) {
            return false;
        }
        clamp_densities(&mut self.x, &latest.solution, &self.density_dofs);
        true
    }

    /// Blend the current solution toward `reference`:
    /// `x = ratio x + (1 - ratio) reference`.
    pub fn interpolate(&mut self, ratio: f64, reference: &[f64]) {
        for (xi, ri) in self.x.iter_mut().zip(reference) {
            *xi = ratio * *xi + (1.0 - ratio) * ri;
        }
        clamp_densities(&mut self.x, reference, &self.density_dofs);
    }

    pub fn circuit_values(&self) -> Vec<f64> {
        self.system.coupling.node_values(&self.x)
    }

    pub fn node_names(&self) -> Vec<String> {
        self.system.coupling.node_names()
    }

    pub fn log_circuit_nodes(&self) {
        self.system.coupling.log_nodes(&self.x);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit::MnaCircuit;
    use crate::config::BarSettings;
    use crate::device::ResistiveBar;
    use crate::parser;
    use crate::solver::comm::SingleProcessComm;
    use approx::assert_abs_diff_eq;

    const DIVIDER: &str = "\
V1 in 0 DC 2
R1 in a 1k
.ELECTRODE anode a
.ELECTRODE cathode 0
.OP
";

    fn simulation(comm: &SingleProcessComm) -> Simulation<'_> {
        let netlist = parser::parse(DIVIDER).unwrap();
        let circuit = MnaCircuit::from_netlist(&netlist).unwrap();
        let settings = SolverSettings {
            device: BarSettings {
                nodes: 3,
                segment_conductance: 1e-3,
                ..BarSettings::default()
            },
            ..SolverSettings::default()
        };
        let bar = ResistiveBar::new(&settings.device, 0, 1).unwrap();
        Simulation::new(Box::new(bar), Some(Box::new(circuit)), comm, &settings).unwrap()
    }

    #[test]
    fn circuit_block_follows_device_block() {
        let comm = SingleProcessComm;
        let sim = simulation(&comm);
        // 3 bar nodes x 2 dofs, then ground, in, a, V1 branch
        assert_eq!(sim.n_dofs(), 10);
        assert_eq!(sim.coupling().offset(), 6);
        assert_eq!(sim.node_names()[0], "0");
    }

    #[test]
    fn solves_divider_through_the_bar() {
        let comm = SingleProcessComm;
        let mut sim = simulation(&comm);
        sim.pre_solve(true).unwrap();
        let out = sim.solve(TimeState::steady(0.0)).unwrap();
        assert!(out.converged(), "{:?}", out.verdict);
        sim.post_solve();

        // bar resistance is 2k, external 1k
        let a = sim.coupling().dof(2);
        assert_abs_diff_eq!(sim.solution()[a], 4.0 / 3.0, epsilon = 1e-6);
        assert_abs_diff_eq!(sim.solution()[sim.coupling().dof(0)], 0.0, epsilon = 1e-12);
        assert_eq!(sim.accepted(), sim.solution());
    }

    #[test]
    fn recovery_restores_accepted_solution() {
        let comm = SingleProcessComm;
        let mut sim = simulation(&comm);
        let before = sim.accepted().to_vec();
        sim.solution_mut().iter_mut().for_each(|v| *v = 42.0);
        sim.diverged_recovery();
        assert_eq!(sim.solution(), &before[..]);
    }

    #[test]
    fn prediction_clamps_densities() {
        let comm = SingleProcessComm;
        let mut sim = simulation(&comm);
        let n = sim.n_dofs();
        let mut ring = HistoryRing::new();
        ring.push(0.0, &vec![1.0; n]);
        ring.push(1.0, &vec![0.2; n]);
        assert!(sim.predict(&ring, Projection::Linear, 2.0));
        // potentials extrapolate to -0.6, densities fall back to 0.2
        assert_abs_diff_eq!(sim.solution()[0], -0.6, epsilon = 1e-12);
        assert_abs_diff_eq!(sim.solution()[1], 0.2, epsilon = 1e-12);
        assert!(!sim.predict(&ring, Projection::Quadratic, 2.0));
    }
}
