//! Modified nodal analysis engine for lumped circuits.
//!
//! Unknowns are the node voltages (ground first) followed by one branch
//! current per voltage source. Every row is written in residual form,
//! `sum of currents leaving the node = 0`, so the coupled Newton solve can
//! add device terminal currents straight into electrode rows.

use super::waveform::Waveform;
use super::{
    AnalysisMode, CircuitEngine, CircuitMode, InitMode, IntegrationMethod, SourceValue,
};
use crate::error::{MixError, Result};
use crate::ir::{Component, Netlist};
use crate::solver::convergence::Verdict;
use crate::sparse::CsrMatrix;
use std::collections::HashMap;

#[derive(Debug, Clone)]
struct Source {
    name: String,
    /// Configured DC value.
    dc: f64,
    waveform: Option<Waveform>,
    /// Value currently applied in DC modes (ramped or swept).
    applied: f64,
}

#[derive(Debug, Clone)]
enum Element {
    Resistor { a: usize, b: usize, g: f64 },
    Capacitor { a: usize, b: usize, c: f64, slot: usize },
    VSource { src: usize, p: usize, n: usize, branch: usize },
    ISource { src: usize, p: usize, n: usize },
}

pub struct MnaCircuit {
    names: Vec<String>,
    /// Voltage nodes, ground included; branch unknowns follow.
    n_voltage_nodes: usize,
    elements: Vec<Element>,
    vsources: Vec<Source>,
    isources: Vec<Source>,
    electrodes: Vec<(String, usize)>,
    linked: Vec<Option<String>>,
    row_nnz: Vec<usize>,
    ordered: bool,

    rhs_old: Vec<f64>,
    state_prev: Vec<f64>,
    state_prev2: Vec<f64>,
    cap_current: Vec<f64>,
    cap_current_prev: Vec<f64>,
    residual: Vec<f64>,
    matrix: CsrMatrix<f64>,

    mode: CircuitMode,
    method: IntegrationMethod,
    order: usize,
    time: f64,
    delta: f64,
    delta_old: f64,
    gmin: f64,
}

impl MnaCircuit {
    pub fn from_netlist(netlist: &Netlist) -> Result<Self> {
        let mut index: HashMap<String, usize> = HashMap::from([("0".to_string(), 0)]);
        let mut names = vec!["0".to_string()];
        let mut node = |name: &str| -> usize {
            *index.entry(name.to_string()).or_insert_with(|| {
                names.push(name.to_string());
                names.len() - 1
            })
        };

        let mut elements = Vec::new();
        let mut vsources = Vec::new();
        let mut isources = Vec::new();
        let mut n_caps = 0;
        let mut pending_branches = Vec::new();

        for comp in &netlist.components {
            match comp {
                Component::Resistor { nodes, value, .. } => elements.push(Element::Resistor {
                    a: node(&nodes.0),
                    b: node(&nodes.1),
                    g: 1.0 / value,
                }),
                Component::Capacitor { nodes, value, .. } => {
                    elements.push(Element::Capacitor {
                        a: node(&nodes.0),
                        b: node(&nodes.1),
                        c: *value,
                        slot: n_caps,
                    });
                    n_caps += 1;
                }
                Component::VSource { name, nodes, dc, waveform } => {
                    let src = vsources.len();
                    vsources.push(Source::new(name, *dc, waveform.clone()));
                    pending_branches.push(elements.len());
                    elements.push(Element::VSource {
                        src,
                        p: node(&nodes.0),
                        n: node(&nodes.1),
                        branch: 0,
                    });
                }
                Component::ISource { name, nodes, dc, waveform } => {
                    let src = isources.len();
                    isources.push(Source::new(name, *dc, waveform.clone()));
                    elements.push(Element::ISource {
                        src,
                        p: node(&nodes.0),
                        n: node(&nodes.1),
                    });
                }
            }
        }
        let electrodes: Vec<(String, usize)> = netlist
            .electrodes
            .iter()
            .map(|e| (e.label.clone(), node(&e.node)))
            .collect();

        let n_voltage_nodes = names.len();
        for k in pending_branches {
            if let Element::VSource { src, branch, .. } = &mut elements[k] {
                names.push(format!("{}#branch", vsources[*src].name));
                *branch = names.len() - 1;
            }
        }
        if names.len() < 2 {
            return Err(MixError::Setup("circuit has no nodes besides ground".into()));
        }

        let n = names.len();
        let mut circuit = Self {
            n_voltage_nodes,
            elements,
            vsources,
            isources,
            electrodes,
            linked: vec![None; n],
            row_nnz: Vec::new(),
            ordered: false,
            rhs_old: vec![0.0; n],
            state_prev: vec![0.0; n],
            state_prev2: vec![0.0; n],
            cap_current: vec![0.0; n_caps],
            cap_current_prev: vec![0.0; n_caps],
            residual: vec![0.0; n],
            matrix: CsrMatrix::new(n, n),
            mode: CircuitMode::new(AnalysisMode::DcOp, InitMode::Junction),
            method: IntegrationMethod::Trapezoidal,
            order: 1,
            time: 0.0,
            delta: 0.0,
            delta_old: 0.0,
            gmin: 1e-12,
            names,
        };
        circuit.row_nnz = circuit.structure();
        Ok(circuit)
    }

    pub fn is_ordered(&self) -> bool {
        self.ordered
    }

    /// Node voltages and branch currents of the current iterate.
    pub fn solution(&self) -> &[f64] {
        &self.rhs_old
    }

    fn structure(&self) -> Vec<usize> {
        let n = self.names.len();
        let mut t = Vec::new();
        for e in &self.elements {
            match *e {
                Element::Resistor { a, b, .. } | Element::Capacitor { a, b, .. } => {
                    t.extend([(a, a, 1.0), (a, b, 1.0), (b, a, 1.0), (b, b, 1.0)]);
                }
                Element::VSource { p, n, branch, .. } => {
                    t.extend([(p, branch, 1.0), (n, branch, 1.0), (branch, p, 1.0), (branch, n, 1.0)]);
                }
                Element::ISource { .. } => {}
            }
        }
        t.extend((1..self.n_voltage_nodes).map(|i| (i, i, 1.0)));
        let pattern = CsrMatrix::from_triplets(n, n, &t);
        (0..n).map(|row| pattern.row_nnz(row)).collect()
    }

    fn source_value(&self, s: &Source) -> f64 {
        match (&s.waveform, self.mode.analysis) {
            (Some(w), AnalysisMode::Tran) => w.value_at(self.time),
            _ => s.applied,
        }
    }

    fn nominal_value(&self, s: &Source) -> f64 {
        match (&s.waveform, self.mode.analysis) {
            (Some(w), AnalysisMode::TranOp | AnalysisMode::Tran) => w.value_at(self.time),
            _ => s.dc,
        }
    }

    /// Companion conductance and current of a capacitor with branch voltage `v`.
    fn capacitor_companion(&self, c: f64, slot: usize, v: f64, v_prev: f64, v_prev2: f64) -> (f64, f64) {
        let h = self.delta;
        if self.order == 1 || self.mode.init == InitMode::Transient {
            let geq = c / h;
            return (geq, geq * (v - v_prev));
        }
        match self.method {
            IntegrationMethod::Trapezoidal => {
                let geq = 2.0 * c / h;
                (geq, geq * (v - v_prev) - self.cap_current_prev[slot])
            }
            IntegrationMethod::Gear => {
                let h1 = self.delta_old;
                let a0 = (2.0 * h + h1) / (h * (h + h1));
                let a1 = -(h + h1) / (h * h1);
                let a2 = h / (h1 * (h + h1));
                (c * a0, c * (a0 * v + a1 * v_prev + a2 * v_prev2))
            }
        }
    }

    fn find(sources: &[Source], name: &str) -> Option<usize> {
        sources.iter().position(|s| s.name.eq_ignore_ascii_case(name))
    }
}

impl Source {
    fn new(name: &str, dc: Option<f64>, waveform: Option<Waveform>) -> Self {
        let dc = dc.unwrap_or_else(|| waveform.as_ref().map_or(0.0, |w| w.value_at(0.0)));
        Self {
            name: name.to_string(),
            dc,
            waveform,
            applied: dc,
        }
    }
}

impl CircuitEngine for MnaCircuit {
    fn n_nodes(&self) -> usize {
        self.names.len()
    }

    fn node_name(&self, node: usize) -> &str {
        &self.names[node]
    }

    fn electrode_info(&self) -> Vec<(String, usize)> {
        self.electrodes.clone()
    }

    fn link_electrode(&mut self, node: usize, label: &str) {
        tracing::debug!(node = %self.names[node], label, "electrode linked");
        self.linked[node] = Some(label.to_string());
    }

    fn n_nonzero(&self, node: usize) -> usize {
        self.row_nnz[node]
    }

    fn rhs_old(&self, node: usize) -> f64 {
        self.rhs_old[node]
    }

    fn set_rhs_old(&mut self, node: usize, value: f64) {
        self.rhs_old[node] = value;
    }

    fn load(&mut self) -> Result<()> {
        let n = self.names.len();
        let x = &self.rhs_old;
        let transient = self.mode.is_transient();
        let mut r = vec![0.0; n];
        let mut t = Vec::with_capacity(self.row_nnz.iter().sum());
        let mut cap_current = vec![0.0; self.cap_current.len()];

        for e in &self.elements {
            match *e {
                Element::Resistor { a, b, g } => {
                    let i = g * (x[a] - x[b]);
                    r[a] += i;
                    r[b] -= i;
                    t.extend([(a, a, g), (a, b, -g), (b, a, -g), (b, b, g)]);
                }
                Element::Capacitor { a, b, c, slot } => {
                    if !transient {
                        continue;
                    }
                    let v = x[a] - x[b];
                    let vp = self.state_prev[a] - self.state_prev[b];
                    let vpp = self.state_prev2[a] - self.state_prev2[b];
                    let (geq, i) = self.capacitor_companion(c, slot, v, vp, vpp);
                    cap_current[slot] = i;
                    r[a] += i;
                    r[b] -= i;
                    t.extend([(a, a, geq), (a, b, -geq), (b, a, -geq), (b, b, geq)]);
                }
                Element::VSource { src, p, n, branch } => {
                    let value = self.source_value(&self.vsources[src]);
                    r[p] += x[branch];
                    r[n] -= x[branch];
                    r[branch] += x[p] - x[n] - value;
                    t.extend([(p, branch, 1.0), (n, branch, -1.0), (branch, p, 1.0), (branch, n, -1.0)]);
                }
                Element::ISource { src, p, n } => {
                    let value = self.source_value(&self.isources[src]);
                    r[p] += value;
                    r[n] -= value;
                }
            }
        }
        for i in 1..self.n_voltage_nodes {
            r[i] += self.gmin * x[i];
            t.push((i, i, self.gmin));
        }

        self.residual = r;
        self.matrix = CsrMatrix::from_triplets(n, n, &t);
        self.cap_current = cap_current;
        Ok(())
    }

    fn preorder(&mut self) {
        self.row_nnz = self.structure();
        self.ordered = true;
        tracing::debug!(nnz = self.row_nnz.iter().sum::<usize>(), "circuit matrix ordered");
    }

    fn residual_rows(&self) -> Vec<(usize, f64)> {
        self.residual.iter().copied().enumerate().collect()
    }

    fn matrix_row(&self, node: usize) -> (Vec<usize>, Vec<f64>) {
        let (cols, vals) = self.matrix.row(node);
        (cols.to_vec(), vals.to_vec())
    }

    fn rotate_state_vectors(&mut self) {
        std::mem::swap(&mut self.state_prev2, &mut self.state_prev);
        self.state_prev.copy_from_slice(&self.rhs_old);
        self.cap_current_prev.copy_from_slice(&self.cap_current);
        self.delta_old = self.delta;
    }

    fn exchange_rhs(&mut self) {
        self.rhs_old.copy_from_slice(&self.state_prev);
    }

    fn mode(&self) -> CircuitMode {
        self.mode
    }

    fn set_mode(&mut self, mode: CircuitMode) {
        self.mode = mode;
    }

    fn change_mode(&mut self, verdict: Verdict) -> bool {
        if !verdict.is_converged() {
            return false;
        }
        let (next, veto) = match self.mode.init {
            InitMode::Junction => (InitMode::Fix, true),
            InitMode::Fix | InitMode::Transient => (InitMode::Float, true),
            InitMode::Predict => (InitMode::Float, false),
            InitMode::Float => (InitMode::Float, false),
        };
        self.mode.init = next;
        veto
    }

    fn set_time(&mut self, time: f64) {
        self.time = time;
    }

    fn set_delta(&mut self, delta: f64) {
        self.delta = delta;
    }

    fn set_gmin(&mut self, gmin: f64) {
        self.gmin = gmin;
    }

    fn gmin(&self) -> f64 {
        self.gmin
    }

    fn set_integration_method(&mut self, method: IntegrationMethod) {
        self.method = method;
    }

    fn set_time_order(&mut self, order: usize) {
        self.order = order.clamp(1, 2);
    }

    fn prepare_first_step(&mut self) {
        self.state_prev2.copy_from_slice(&self.state_prev);
    }

    fn voltage_sources(&self) -> Vec<SourceValue> {
        self.vsources
            .iter()
            .map(|s| SourceValue {
                name: s.name.clone(),
                value: self.nominal_value(s),
            })
            .collect()
    }

    fn current_sources(&self) -> Vec<SourceValue> {
        self.isources
            .iter()
            .map(|s| SourceValue {
                name: s.name.clone(),
                value: self.nominal_value(s),
            })
            .collect()
    }

    fn set_voltage(&mut self, name: &str, value: f64) -> Result<()> {
        let k = Self::find(&self.vsources, name)
            .ok_or_else(|| MixError::Analysis(format!("no voltage source named {name}")))?;
        self.vsources[k].applied = value;
        Ok(())
    }

    fn set_current(&mut self, name: &str, value: f64) -> Result<()> {
        let k = Self::find(&self.isources, name)
            .ok_or_else(|| MixError::Analysis(format!("no current source named {name}")))?;
        self.isources[k].applied = value;
        Ok(())
    }
}
