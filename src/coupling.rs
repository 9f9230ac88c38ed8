//! Coupling between the device unknowns and the circuit engine.
//!
//! Circuit nodes become extra global dofs appended after the device dofs.
//! Only the last rank holds the engine ([`CircuitRole::Owner`]); every
//! value the other ranks need from it is broadcast explicitly. The ground
//! node's row is pinned to an identity row so node 0 stays at its
//! reference value.

use crate::circuit::CircuitEngine;
use crate::device::BoundaryCondition;
use crate::error::{MixError, Result};
use crate::solver::comm::CommunicationBackend;
use crate::solver::convergence::Verdict;
use crate::sparse::TripletMatrix;

/// Whether this rank runs the circuit engine.
pub enum CircuitRole<'a> {
    Owner(Box<dyn CircuitEngine + 'a>),
    Follower,
}

/// Result of matching one electrode boundary to a circuit node.
#[derive(Debug, Clone, PartialEq)]
pub struct ElectrodeBinding {
    /// Index into the device's boundary conditions.
    pub bc: usize,
    pub label: String,
    pub node: usize,
    /// No circuit electrode matched; bound to ground.
    pub grounded: bool,
}

/// Per-row nonzero estimates, split into columns owned by this rank and
/// columns owned elsewhere. Indexed by global row; rows owned by other
/// ranks stay zero.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SparsityPattern {
    pub n_nz: Vec<usize>,
    pub n_oz: Vec<usize>,
}

impl SparsityPattern {
    pub fn new(n_rows: usize) -> Self {
        Self {
            n_nz: vec![0; n_rows],
            n_oz: vec![0; n_rows],
        }
    }

    pub fn add_entries(&mut self, row: usize, on: usize, off: usize) {
        self.n_nz[row] += on;
        self.n_oz[row] += off;
    }

    pub fn total(&self) -> usize {
        self.n_nz.iter().sum::<usize>() + self.n_oz.iter().sum::<usize>()
    }
}

pub struct CircuitCoupling<'a> {
    role: CircuitRole<'a>,
    comm: &'a dyn CommunicationBackend,
    n_nodes: usize,
    offset: usize,
    bindings: Vec<ElectrodeBinding>,
    warnings: Vec<String>,
    ordered: bool,
}

impl<'a> CircuitCoupling<'a> {
    /// Collective: the circuit size is broadcast from the owning rank.
    pub fn new(role: CircuitRole<'a>, comm: &'a dyn CommunicationBackend) -> Result<Self> {
        let root = comm.last_rank();
        let local_nodes = match (&role, comm.is_last_rank()) {
            (CircuitRole::Owner(engine), true) => engine.n_nodes() as i64,
            (CircuitRole::Follower, false) => 0,
            (CircuitRole::Owner(_), false) => {
                return Err(MixError::Setup(format!(
                    "rank {} holds a circuit engine but rank {root} owns the circuit",
                    comm.rank()
                )));
            }
            (CircuitRole::Follower, true) => {
                return Err(MixError::Setup("circuit-owning rank has no circuit engine".into()));
            }
        };
        let n_nodes = comm.broadcast_i64(local_nodes, root) as usize;
        Ok(Self {
            role,
            comm,
            n_nodes,
            offset: 0,
            bindings: Vec::new(),
            warnings: Vec::new(),
            ordered: false,
        })
    }

    pub fn n_dofs(&self) -> usize {
        self.n_nodes
    }

    /// Place the circuit block at `offset` (the device dof count).
    pub fn set_offset(&mut self, offset: usize) {
        self.offset = offset;
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Global dof of circuit node `node`.
    pub fn dof(&self, node: usize) -> usize {
        self.offset + node
    }

    pub fn is_owner(&self) -> bool {
        matches!(self.role, CircuitRole::Owner(_))
    }

    pub fn engine(&self) -> Option<&(dyn CircuitEngine + 'a)> {
        match &self.role {
            CircuitRole::Owner(engine) => Some(engine.as_ref()),
            CircuitRole::Follower => None,
        }
    }

    pub fn engine_mut(&mut self) -> Option<&mut (dyn CircuitEngine + 'a)> {
        match &mut self.role {
            CircuitRole::Owner(engine) => Some(engine.as_mut()),
            CircuitRole::Follower => None,
        }
    }

    pub fn bindings(&self) -> &[ElectrodeBinding] {
        &self.bindings
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    /// Match every electrode boundary to a circuit electrode by
    /// case-insensitive label. Unmatched electrodes are grounded.
    ///
    /// Collective: the owner's node choice is broadcast per boundary.
    pub fn bind_electrodes(&mut self, bcs: &[BoundaryCondition]) -> Vec<ElectrodeBinding> {
        let root = self.comm.last_rank();
        let mut bindings = Vec::new();

        for (bc, cond) in bcs.iter().enumerate().filter(|(_, c)| c.is_electrode) {
            let mut local = -1i64;
            if let Some(engine) = self.engine_mut() {
                let found = engine
                    .electrode_info()
                    .into_iter()
                    .find(|(label, _)| label.eq_ignore_ascii_case(&cond.label));
                if let Some((_, node)) = found {
                    engine.link_electrode(node, &cond.label);
                    local = node as i64;
                }
            }
            let node = self.comm.broadcast_i64(local, root);
            let grounded = node < 0;
            if grounded {
                let msg = format!("Electrode {} not linked to circuit, set it to ground", cond.label);
                tracing::warn!("{msg}");
                self.warnings.push(msg);
            }
            bindings.push(ElectrodeBinding {
                bc,
                label: cond.label.clone(),
                node: node.max(0) as usize,
                grounded,
            });
        }

        self.bindings = bindings.clone();
        bindings
    }

    /// Add the circuit rows and the electrode coupling entries to `pattern`.
    ///
    /// Collective: each boundary's coupling entry count is summed over ranks.
    pub fn declare_sparsity(
        &self,
        bcs: &[BoundaryCondition],
        pattern: &mut SparsityPattern,
        n_local: usize,
        n_global: usize,
    ) {
        let rank = self.comm.rank();
        if let Some(engine) = self.engine() {
            for node in 0..self.n_nodes {
                pattern.add_entries(self.dof(node), engine.n_nonzero(node) + self.bindings.len(), 0);
            }
        }

        for binding in &self.bindings {
            let bc = &bcs[binding.bc];
            let local = bc.local_coupling_entries(rank);
            let total = self.comm.all_reduce_sum_count(local);

            for node in bc.nodes.iter().filter(|n| n.owner == rank) {
                for &dof in &node.dofs {
                    if self.is_owner() {
                        pattern.add_entries(dof, 1, 0);
                    } else {
                        pattern.add_entries(dof, 0, 1);
                    }
                }
            }

            if self.is_owner() {
                let on = local.min(n_local);
                let off = (total - local).min(n_global.saturating_sub(on));
                pattern.add_entries(self.dof(binding.node), on, off);
            }
        }
    }

    /// Load and order the circuit once, before it is first evaluated.
    fn ensure_ordered(&mut self) -> Result<()> {
        if self.ordered {
            return Ok(());
        }
        if let Some(engine) = self.engine_mut() {
            engine.load()?;
            engine.preorder();
        }
        self.ordered = true;
        Ok(())
    }

    /// Copy the circuit slice of `x` into the engine's node values.
    pub fn sync_from(&mut self, x: &[f64]) {
        let offset = self.offset;
        let n = self.n_nodes;
        if let Some(engine) = self.engine_mut() {
            for node in 0..n {
                engine.set_rhs_old(node, x[offset + node]);
            }
        }
    }

    /// Write the engine's stored node values into the circuit slice of `x`.
    ///
    /// Collective: the owner's values reach every rank by vector reduction.
    pub fn load_state(&mut self, x: &mut [f64]) -> Result<()> {
        self.ensure_ordered()?;
        let mut values = vec![0.0; self.n_nodes];
        if let Some(engine) = self.engine() {
            for (node, v) in values.iter_mut().enumerate() {
                *v = engine.rhs_old(node);
            }
        }
        self.comm.all_reduce_sum_vec(&mut values);
        x[self.offset..self.offset + self.n_nodes].copy_from_slice(&values);
        Ok(())
    }

    /// Add circuit KCL rows (except ground) into the residual.
    pub fn fill_residual(&mut self, x: &[f64], f: &mut [f64]) -> Result<()> {
        self.ensure_ordered()?;
        self.sync_from(x);
        let offset = self.offset;
        if let Some(engine) = self.engine_mut() {
            engine.load()?;
            for (row, value) in engine.residual_rows() {
                if row != 0 {
                    f[offset + row] += value;
                }
            }
        }
        Ok(())
    }

    /// Add circuit Jacobian rows (except ground) into the triplet matrix.
    pub fn fill_jacobian(&mut self, x: &[f64], jac: &mut TripletMatrix) -> Result<()> {
        self.ensure_ordered()?;
        self.sync_from(x);
        let offset = self.offset;
        let n = self.n_nodes;
        if let Some(engine) = self.engine_mut() {
            engine.load()?;
            for row in 1..n {
                let (cols, vals) = engine.matrix_row(row);
                for (col, v) in cols.into_iter().zip(vals) {
                    jac.add(offset + row, offset + col, v);
                }
            }
        }
        Ok(())
    }

    /// Overwrite the ground row of the combined residual with the engine's
    /// stored ground value.
    ///
    /// Collective.
    pub fn ground_residual(&self, f: &mut [f64]) {
        let local = self.engine().map_or(0.0, |e| e.rhs_old(0));
        f[self.dof(0)] = self.comm.broadcast_f64(local, self.comm.last_rank());
    }

    /// Replace the ground row of the combined Jacobian with an identity row.
    pub fn ground_jacobian(&self, jac: &mut TripletMatrix) {
        jac.zero_row_set_diag(self.dof(0), 1.0);
    }

    /// Let the circuit veto a verdict. Collective.
    pub fn convergence_veto(&mut self, verdict: Verdict) -> bool {
        let local = self.engine_mut().is_some_and(|e| e.change_mode(verdict));
        self.comm.broadcast_bool(local, self.comm.last_rank())
    }

    /// Names of the circuit unknowns; empty on followers.
    pub fn node_names(&self) -> Vec<String> {
        self.engine()
            .map(|e| (0..self.n_nodes).map(|n| e.node_name(n).to_string()).collect())
            .unwrap_or_default()
    }

    pub fn node_values(&self, x: &[f64]) -> Vec<f64> {
        x[self.offset..self.offset + self.n_nodes].to_vec()
    }

    /// Log the circuit node table (owner only).
    pub fn log_nodes(&self, x: &[f64]) {
        let Some(engine) = self.engine() else {
            return;
        };
        tracing::info!("{:>16} | {:>14}", "circuit node", "value");
        for node in 0..self.n_nodes {
            tracing::info!("{:>16} | {:>14.6e}", engine.node_name(node), x[self.dof(node)]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit::{CircuitMode, IntegrationMethod, SourceValue};
    use crate::device::BoundaryNode;
    use crate::solver::comm::SingleProcessComm;
    use std::cell::Cell;
    use std::collections::VecDeque;
    use std::rc::Rc;
    use std::sync::Mutex;

    /// Engine that records calls. Row `r` has residual `10 r + v_r` and
    /// Jacobian row `{r: 2, 0: 5}`.
    struct MockEngine {
        rhs: Vec<f64>,
        electrodes: Vec<(String, usize)>,
        linked: Vec<(usize, String)>,
        loads: Rc<Cell<usize>>,
        preorders: Rc<Cell<usize>>,
        veto: bool,
        mode: CircuitMode,
    }

    impl MockEngine {
        fn new(n: usize, electrodes: &[(&str, usize)]) -> Self {
            Self {
                rhs: vec![0.0; n],
                electrodes: electrodes.iter().map(|(l, n)| (l.to_string(), *n)).collect(),
                linked: Vec::new(),
                loads: Rc::default(),
                preorders: Rc::default(),
                veto: false,
                mode: CircuitMode::new(crate::circuit::AnalysisMode::DcOp, crate::circuit::InitMode::Float),
            }
        }
    }

    impl CircuitEngine for MockEngine {
        fn n_nodes(&self) -> usize {
            self.rhs.len()
        }
        fn node_name(&self, _node: usize) -> &str {
            "n"
        }
        fn electrode_info(&self) -> Vec<(String, usize)> {
            self.electrodes.clone()
        }
        fn link_electrode(&mut self, node: usize, label: &str) {
            self.linked.push((node, label.to_string()));
        }
        fn n_nonzero(&self, _node: usize) -> usize {
            2
        }
        fn rhs_old(&self, node: usize) -> f64 {
            self.rhs[node]
        }
        fn set_rhs_old(&mut self, node: usize, value: f64) {
            self.rhs[node] = value;
        }
        fn load(&mut self) -> Result<()> {
            self.loads.set(self.loads.get() + 1);
            Ok(())
        }
        fn preorder(&mut self) {
            self.preorders.set(self.preorders.get() + 1);
        }
        fn residual_rows(&self) -> Vec<(usize, f64)> {
            self.rhs.iter().enumerate().map(|(r, v)| (r, 10.0 * r as f64 + v)).collect()
        }
        fn matrix_row(&self, node: usize) -> (Vec<usize>, Vec<f64>) {
            (vec![node, 0], vec![2.0, 5.0])
        }
        fn rotate_state_vectors(&mut self) {}
        fn exchange_rhs(&mut self) {}
        fn mode(&self) -> CircuitMode {
            self.mode
        }
        fn set_mode(&mut self, mode: CircuitMode) {
            self.mode = mode;
        }
        fn change_mode(&mut self, verdict: Verdict) -> bool {
            verdict.is_converged() && self.veto
        }
        fn set_time(&mut self, _time: f64) {}
        fn set_delta(&mut self, _delta: f64) {}
        fn set_gmin(&mut self, _gmin: f64) {}
        fn gmin(&self) -> f64 {
            0.0
        }
        fn set_integration_method(&mut self, _method: IntegrationMethod) {}
        fn set_time_order(&mut self, _order: usize) {}
        fn prepare_first_step(&mut self) {}
        fn voltage_sources(&self) -> Vec<SourceValue> {
            Vec::new()
        }
        fn current_sources(&self) -> Vec<SourceValue> {
            Vec::new()
        }
        fn set_voltage(&mut self, _name: &str, _value: f64) -> Result<()> {
            Ok(())
        }
        fn set_current(&mut self, _name: &str, _value: f64) -> Result<()> {
            Ok(())
        }
    }

    /// Rank 0 or 1 of a two-rank run. Broadcasts from the other rank
    /// replay scripted values; count reductions add `remote_count`.
    struct TwoRankComm {
        rank: usize,
        scripted: Mutex<VecDeque<f64>>,
        remote_count: usize,
    }

    impl TwoRankComm {
        fn new(rank: usize, scripted: &[f64], remote_count: usize) -> Self {
            Self {
                rank,
                scripted: Mutex::new(scripted.iter().copied().collect()),
                remote_count,
            }
        }

        fn remote(&self, value: f64, root: usize) -> f64 {
            if root == self.rank {
                return value;
            }
            self.scripted.lock().unwrap().pop_front().unwrap()
        }
    }

    impl CommunicationBackend for TwoRankComm {
        fn all_reduce_sum_count(&self, local: usize) -> usize {
            local + self.remote_count
        }
        fn all_reduce_sum_vec(&self, _local: &mut [f64]) {}
        fn all_gather_vec(&self, local: &[f64]) -> Vec<f64> {
            local.to_vec()
        }
        fn broadcast_f64(&self, value: f64, root: usize) -> f64 {
            self.remote(value, root)
        }
        fn broadcast_i64(&self, value: i64, root: usize) -> i64 {
            self.remote(value as f64, root) as i64
        }
        fn rank(&self) -> usize {
            self.rank
        }
        fn num_ranks(&self) -> usize {
            2
        }
    }

    fn electrode(label: &str, owner: usize, dofs: Vec<usize>) -> BoundaryCondition {
        BoundaryCondition {
            label: label.into(),
            is_electrode: true,
            nodes: vec![BoundaryNode { owner, neighbors: 1, dofs }],
        }
    }

    fn owner(engine: MockEngine, comm: &dyn CommunicationBackend) -> CircuitCoupling<'_> {
        CircuitCoupling::new(CircuitRole::Owner(Box::new(engine)), comm).unwrap()
    }

    #[test]
    fn binds_case_insensitively_and_grounds_the_rest() {
        let comm = SingleProcessComm;
        let mut c = owner(MockEngine::new(4, &[("ANODE", 2)]), &comm);
        let mut gate = electrode("gate", 0, vec![0]);
        gate.is_electrode = false;
        let bcs = vec![electrode("anode", 0, vec![0]), gate, electrode("cathode", 0, vec![1])];

        let b = c.bind_electrodes(&bcs);
        assert_eq!(b.len(), 2);
        assert_eq!((b[0].bc, b[0].node, b[0].grounded), (0, 2, false));
        assert_eq!((b[1].bc, b[1].node, b[1].grounded), (2, 0, true));
        assert_eq!(c.warnings().len(), 1);
        assert!(c.warnings()[0].contains("cathode"));
    }

    #[test]
    fn residual_skips_ground_and_pins_it_afterwards() {
        let comm = SingleProcessComm;
        let mut c = owner(MockEngine::new(3, &[]), &comm);
        c.set_offset(2);
        let x = vec![0.0, 0.0, 0.25, 1.0, 2.0];
        let mut f = vec![7.0; 5];
        c.fill_residual(&x, &mut f).unwrap();
        assert_eq!(f, vec![7.0, 7.0, 7.0, 7.0 + 11.0, 7.0 + 22.0]);
        c.ground_residual(&mut f);
        assert_eq!(f[2], 0.25);
    }

    #[test]
    fn jacobian_rows_map_to_global_and_ground_is_identity() {
        let comm = SingleProcessComm;
        let mut c = owner(MockEngine::new(3, &[]), &comm);
        c.set_offset(1);
        let x = vec![0.0; 4];
        let mut jac = TripletMatrix::new(4);
        jac.add(1, 0, 9.0);
        c.fill_jacobian(&x, &mut jac).unwrap();
        c.ground_jacobian(&mut jac);
        let d = jac.to_csr().to_dense();
        assert_eq!(d[1], vec![0.0, 1.0, 0.0, 0.0]);
        assert_eq!(d[2], vec![0.0, 5.0, 2.0, 0.0]);
        assert_eq!(d[3], vec![0.0, 5.0, 0.0, 2.0]);
    }

    #[test]
    fn circuit_is_ordered_exactly_once() {
        let comm = SingleProcessComm;
        let engine = MockEngine::new(2, &[]);
        let (loads, preorders) = (engine.loads.clone(), engine.preorders.clone());
        let mut c = owner(engine, &comm);
        let mut x = vec![0.0; 2];
        let mut f = vec![0.0; 2];
        c.load_state(&mut x).unwrap();
        c.fill_residual(&x, &mut f).unwrap();
        c.fill_jacobian(&x, &mut TripletMatrix::new(2)).unwrap();
        c.fill_residual(&x, &mut f).unwrap();
        assert_eq!(preorders.get(), 1);
        assert_eq!(loads.get(), 4);
    }

    #[test]
    fn load_state_copies_engine_values() {
        let comm = SingleProcessComm;
        let mut engine = MockEngine::new(3, &[]);
        engine.rhs = vec![0.0, 1.5, -2.0];
        let mut c = owner(engine, &comm);
        c.set_offset(1);
        let mut x = vec![9.0; 4];
        c.load_state(&mut x).unwrap();
        assert_eq!(x, vec![9.0, 0.0, 1.5, -2.0]);
        assert_eq!(c.node_values(&x), vec![0.0, 1.5, -2.0]);
    }

    #[test]
    fn veto_comes_from_the_engine() {
        let comm = SingleProcessComm;
        let mut engine = MockEngine::new(2, &[]);
        engine.veto = true;
        let mut c = owner(engine, &comm);
        assert!(c.convergence_veto(Verdict::ConvergedAbsolute));
        assert!(!c.convergence_veto(Verdict::DivergedNan));
    }

    #[test]
    fn follower_receives_owner_decisions() {
        // circuit size, anode node, ground value, veto
        let comm = TwoRankComm::new(0, &[5.0, 3.0, 0.5, 1.0], 0);
        let mut c = CircuitCoupling::new(CircuitRole::Follower, &comm).unwrap();
        assert_eq!(c.n_dofs(), 5);
        c.set_offset(4);

        let b = c.bind_electrodes(&[electrode("anode", 0, vec![0])]);
        assert_eq!(b[0].node, 3);
        assert!(!b[0].grounded);

        let x = vec![1.0; 9];
        let mut f = vec![0.0; 9];
        c.fill_residual(&x, &mut f).unwrap();
        assert!(f.iter().all(|&v| v == 0.0));
        c.ground_residual(&mut f);
        assert_eq!(f[4], 0.5);
        assert!(c.convergence_veto(Verdict::ConvergedAbsolute));
        assert!(c.node_names().is_empty());
    }

    #[test]
    fn mismatched_role_is_rejected() {
        let comm = TwoRankComm::new(1, &[], 0);
        assert!(CircuitCoupling::new(CircuitRole::Follower, &comm).is_err());
        let comm = TwoRankComm::new(0, &[], 0);
        assert!(CircuitCoupling::new(CircuitRole::Owner(Box::new(MockEngine::new(2, &[]))), &comm).is_err());
    }

    #[test]
    fn sparsity_splits_on_and_off_rank_entries() {
        // owner is rank 1; the electrode's boundary node lives on rank 1,
        // rank 0 contributes 6 more coupling entries
        let comm = TwoRankComm::new(1, &[], 6);
        let mut c = owner(MockEngine::new(3, &[("anode", 1)]), &comm);
        c.set_offset(4);
        c.bind_electrodes(&[electrode("anode", 1, vec![2, 3])]);

        let mut p = SparsityPattern::new(7);
        c.declare_sparsity(&[electrode("anode", 1, vec![2, 3])], &mut p, 5, 7);
        assert_eq!((p.n_nz[2], p.n_oz[2]), (1, 0));
        assert_eq!((p.n_nz[3], p.n_oz[3]), (1, 0));
        // node 1 row: 2 structural + 1 electrode, plus 4 local and 6 remote coupling entries
        assert_eq!((p.n_nz[5], p.n_oz[5]), (3 + 4, 3));
        assert_eq!((p.n_nz[4], p.n_oz[4]), (3, 0));
    }
}
