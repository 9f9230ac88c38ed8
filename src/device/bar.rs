//! One-dimensional resistive bar between two electrodes.
//!
//! Nodes `0..m` carry a potential `psi` and a carrier density `n`. Segment
//! `i` joins nodes `i` and `i+1` and carries
//! `I_i = g0 (n_i + n_{i+1}) / (2 n0) * (psi_i - psi_{i+1})`.
//! The density follows `n_i = n0 (1 + alpha psi_i^2)`, so `alpha = 0` gives a
//! linear resistor of `(m - 1) / g0` ohms. Interior nodes may carry a
//! capacitance to ground, and the mid node may receive an injected current
//! waveform. The end nodes are the `anode` and `cathode` electrodes.

use super::{BoundaryCondition, BoundaryNode, DeviceProblem};
use crate::circuit::waveform::Waveform;
use crate::config::BarSettings;
use crate::context::TimeState;
use crate::coupling::SparsityPattern;
use crate::error::{MixError, Result};
use crate::parser;
use crate::solver::convergence::EquationGroup;
use crate::sparse::TripletMatrix;

const ANODE: usize = 0;
const CATHODE: usize = 1;

pub struct ResistiveBar {
    nodes: usize,
    g0: f64,
    n0: f64,
    alpha: f64,
    capacitance: f64,
    rank: usize,
    num_ranks: usize,
    bcs: Vec<BoundaryCondition>,
    electrode_dof: [Option<usize>; 2],
    injection: Option<Waveform>,
    injected: f64,
    /// Last accepted device unknowns.
    state: Vec<f64>,
    psi_prev: Vec<f64>,
    psi_prev2: Vec<f64>,
}

fn psi(node: usize) -> usize {
    2 * node
}

fn dens(node: usize) -> usize {
    2 * node + 1
}

impl ResistiveBar {
    pub fn new(settings: &BarSettings, rank: usize, num_ranks: usize) -> Result<Self> {
        let m = settings.nodes;
        if m < 2 {
            return Err(MixError::Config(format!("device needs at least 2 nodes, got {m}")));
        }
        if !(settings.segment_conductance > 0.0) || !(settings.reference_density > 0.0) {
            return Err(MixError::Config(
                "device conductance and reference density must be positive".into(),
            ));
        }
        let injection = settings
            .injection
            .as_deref()
            .map(parser::parse_waveform)
            .transpose()?;

        let mut bar = Self {
            nodes: m,
            g0: settings.segment_conductance,
            n0: settings.reference_density,
            alpha: settings.nonlinearity,
            capacitance: settings.node_capacitance,
            rank,
            num_ranks: num_ranks.max(1),
            bcs: Vec::new(),
            electrode_dof: [None, None],
            injection,
            injected: 0.0,
            state: Vec::new(),
            psi_prev: vec![0.0; m],
            psi_prev2: vec![0.0; m],
        };
        bar.state = (0..m).flat_map(|_| [0.0, bar.n0]).collect();
        bar.bcs = vec![
            bar.electrode_bc(&settings.anode, 0),
            bar.electrode_bc(&settings.cathode, m - 1),
        ];
        Ok(bar)
    }

    fn electrode_bc(&self, label: &str, node: usize) -> BoundaryCondition {
        BoundaryCondition {
            label: label.to_string(),
            is_electrode: true,
            nodes: vec![BoundaryNode {
                owner: self.owner_of(node),
                neighbors: 1,
                dofs: vec![psi(node), dens(node)],
            }],
        }
    }

    /// Block partition of nodes over ranks.
    pub fn owner_of(&self, node: usize) -> usize {
        node * self.num_ranks / self.nodes
    }

    fn owns(&self, node: usize) -> bool {
        self.owner_of(node) == self.rank
    }

    fn mid_node(&self) -> Option<usize> {
        (self.nodes >= 3).then_some(self.nodes / 2)
    }

    /// Current through segment `i` and its partials w.r.t.
    /// `psi_i`, `psi_{i+1}`, `n_i`, `n_{i+1}`.
    fn segment(&self, x: &[f64], i: usize) -> (f64, [(usize, f64); 4]) {
        let s = self.g0 / (2.0 * self.n0);
        let carriers = x[dens(i)] + x[dens(i + 1)];
        let drop = x[psi(i)] - x[psi(i + 1)];
        let current = s * carriers * drop;
        (
            current,
            [
                (psi(i), s * carriers),
                (psi(i + 1), -s * carriers),
                (dens(i), s * drop),
                (dens(i + 1), s * drop),
            ],
        )
    }

    /// Coefficients `(c0, c1, c2)` of `dpsi/dt ~ c0 psi + c1 psi_prev + c2 psi_prev2`.
    fn bdf_coefficients(time: &TimeState) -> (f64, f64, f64) {
        let h = time.dt;
        if time.effective_order() == 1 || !time.dt_last.is_finite() {
            return (1.0 / h, -1.0 / h, 0.0);
        }
        let h1 = time.dt_last;
        (
            (2.0 * h + h1) / (h * (h + h1)),
            -(h + h1) / (h * h1),
            h / (h1 * (h + h1)),
        )
    }

    fn has_storage(&self, time: &TimeState) -> bool {
        time.time_dependent && self.capacitance > 0.0
    }

    pub fn terminal_current(&self, x: &[f64], electrode: usize) -> f64 {
        match electrode {
            ANODE => self.segment(x, 0).0,
            _ => -self.segment(x, self.nodes - 2).0,
        }
    }
}

impl DeviceProblem for ResistiveBar {
    fn n_dofs(&self) -> usize {
        2 * self.nodes
    }

    fn n_owned_dofs(&self) -> usize {
        2 * (0..self.nodes).filter(|&i| self.owns(i)).count()
    }

    fn boundary_conditions(&self) -> &[BoundaryCondition] {
        &self.bcs
    }

    fn bind_electrode(&mut self, bc: usize, circuit_dof: usize) {
        if let Some(slot) = self.electrode_dof.get_mut(bc) {
            *slot = Some(circuit_dof);
        }
    }

    fn load_solution(&self, x: &mut [f64]) {
        x[..self.state.len()].copy_from_slice(&self.state);
    }

    fn update_stimulus(&mut self, clock: f64) {
        self.injected = self.injection.as_ref().map_or(0.0, |w| w.value_at(clock));
    }

    fn residual(&mut self, x: &[f64], f: &mut [f64], time: &TimeState) -> Result<()> {
        let m = self.nodes;
        let storage = self.has_storage(time);
        let (c0, c1, c2) = if storage { Self::bdf_coefficients(time) } else { (0.0, 0.0, 0.0) };

        for i in (0..m).filter(|&i| self.owns(i)) {
            let p = x[psi(i)];
            f[dens(i)] += x[dens(i)] - self.n0 * (1.0 + self.alpha * p * p);

            if i == 0 || i == m - 1 {
                let which = if i == 0 { ANODE } else { CATHODE };
                let applied = self.electrode_dof[which].map_or(0.0, |e| x[e]);
                f[psi(i)] += p - applied;
                if let Some(e) = self.electrode_dof[which] {
                    f[e] += self.terminal_current(x, which);
                }
                continue;
            }

            let out = self.segment(x, i).0 - self.segment(x, i - 1).0;
            f[psi(i)] += out;
            if storage {
                f[psi(i)] += self.capacitance * (c0 * p + c1 * self.psi_prev[i] + c2 * self.psi_prev2[i]);
            }
            if Some(i) == self.mid_node() {
                f[psi(i)] -= self.injected;
            }
        }
        Ok(())
    }

    fn jacobian(&mut self, x: &[f64], jac: &mut TripletMatrix, time: &TimeState) -> Result<()> {
        let m = self.nodes;
        let storage = self.has_storage(time);

        for i in (0..m).filter(|&i| self.owns(i)) {
            jac.add(dens(i), dens(i), 1.0);
            jac.add(dens(i), psi(i), -2.0 * self.n0 * self.alpha * x[psi(i)]);

            if i == 0 || i == m - 1 {
                let which = if i == 0 { ANODE } else { CATHODE };
                jac.add(psi(i), psi(i), 1.0);
                if let Some(e) = self.electrode_dof[which] {
                    jac.add(psi(i), e, -1.0);
                    let (seg, sign) = if i == 0 { (0, 1.0) } else { (m - 2, -1.0) };
                    for (col, d) in self.segment(x, seg).1 {
                        jac.add(e, col, sign * d);
                    }
                }
                continue;
            }

            for (col, d) in self.segment(x, i).1 {
                jac.add(psi(i), col, d);
            }
            for (col, d) in self.segment(x, i - 1).1 {
                jac.add(psi(i), col, -d);
            }
            if storage {
                let (c0, _, _) = Self::bdf_coefficients(time);
                jac.add(psi(i), psi(i), self.capacitance * c0);
            }
        }
        Ok(())
    }

    fn declare_sparsity(&self, pattern: &mut SparsityPattern) {
        let m = self.nodes;
        for i in (0..m).filter(|&i| self.owns(i)) {
            pattern.add_entries(dens(i), 2, 0);
            if i == 0 || i == m - 1 {
                // the electrode column lives on the circuit-owning rank
                let remote = usize::from(self.num_ranks > 1 && self.rank != self.num_ranks - 1);
                pattern.add_entries(psi(i), 2 - remote, remote);
                continue;
            }
            let mut on = 2;
            let mut off = 0;
            for nb in [i - 1, i + 1] {
                if self.owns(nb) {
                    on += 2;
                } else {
                    off += 2;
                }
            }
            pattern.add_entries(psi(i), on, off);
        }
    }

    fn equation_group(&self, dof: usize) -> EquationGroup {
        if dof % 2 == 0 {
            EquationGroup::Potential
        } else {
            EquationGroup::ElectronContinuity
        }
    }

    fn density_dofs(&self) -> Vec<usize> {
        (0..self.nodes).map(dens).collect()
    }

    fn post_solve(&mut self, x: &[f64], time: &TimeState) {
        let n = self.state.len();
        self.state.copy_from_slice(&x[..n]);
        for i in 0..self.nodes {
            let p = x[psi(i)];
            self.psi_prev2[i] = if time.time_dependent { self.psi_prev[i] } else { p };
            self.psi_prev[i] = p;
        }
    }
}
