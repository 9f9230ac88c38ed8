//! Circuit engine interface and the reference MNA engine.
//!
//! The engine runs on the circuit-owning rank only. Node indices are local
//! to the engine, with node 0 the ground reference; the coupling adapter
//! maps them to global dofs.

pub mod mna;
pub mod waveform;

use crate::error::Result;
use crate::solver::convergence::Verdict;

pub use mna::MnaCircuit;

/// Analysis the circuit is being loaded for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalysisMode {
    DcOp,
    DcSweep,
    TranOp,
    Tran,
}

/// Initialisation state of the nonlinear iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitMode {
    /// First iterations of an operating point from scratch.
    Junction,
    Fix,
    Float,
    /// First step of a transient.
    Transient,
    /// Accepted-step prediction at the start of a transient step.
    Predict,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitMode {
    pub analysis: AnalysisMode,
    pub init: InitMode,
    /// Use initial conditions instead of an operating point.
    pub uic: bool,
}

impl CircuitMode {
    pub fn new(analysis: AnalysisMode, init: InitMode) -> Self {
        Self {
            analysis,
            init,
            uic: false,
        }
    }

    pub fn with_uic(mut self) -> Self {
        self.uic = true;
        self
    }

    pub fn is_transient(&self) -> bool {
        self.analysis == AnalysisMode::Tran
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntegrationMethod {
    Trapezoidal,
    Gear,
}

/// A named independent source and its nominal value.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceValue {
    pub name: String,
    pub value: f64,
}

/// Lumped circuit simulator driven by the coupling adapter.
///
/// `load` evaluates the circuit at the node values last written with
/// `set_rhs_old`; `residual_rows` and `matrix_row` then report the result.
pub trait CircuitEngine {
    /// Number of circuit unknowns, ground included.
    fn n_nodes(&self) -> usize;

    fn node_name(&self, node: usize) -> &str;

    /// Electrode declarations as `(label, node)`.
    fn electrode_info(&self) -> Vec<(String, usize)>;

    /// Mark `node` as driven by the device electrode `label`.
    fn link_electrode(&mut self, node: usize, label: &str);

    /// Structural nonzeros in the row of `node`.
    fn n_nonzero(&self, node: usize) -> usize;

    fn rhs_old(&self, node: usize) -> f64;

    fn set_rhs_old(&mut self, node: usize, value: f64);

    fn load(&mut self) -> Result<()>;

    /// Prepare the matrix ordering; called once before the first solve.
    fn preorder(&mut self);

    /// Residual of every row after `load`, as `(node, value)`.
    fn residual_rows(&self) -> Vec<(usize, f64)>;

    /// Columns and values of one Jacobian row after `load`.
    fn matrix_row(&self, node: usize) -> (Vec<usize>, Vec<f64>);

    /// Accept the current node values as the newest time level.
    fn rotate_state_vectors(&mut self);

    /// Load stored initial conditions as the current iterate.
    fn exchange_rhs(&mut self);

    fn mode(&self) -> CircuitMode;

    fn set_mode(&mut self, mode: CircuitMode);

    /// Advance the initialisation state after a nonlinear verdict. Returns
    /// true when a converged verdict must be rejected.
    fn change_mode(&mut self, verdict: Verdict) -> bool;

    fn set_time(&mut self, time: f64);

    fn set_delta(&mut self, delta: f64);

    fn set_gmin(&mut self, gmin: f64);

    fn gmin(&self) -> f64;

    fn set_integration_method(&mut self, method: IntegrationMethod);

    fn set_time_order(&mut self, order: usize);

    /// Duplicate the initial time level after the first transient step.
    fn prepare_first_step(&mut self);

    fn voltage_sources(&self) -> Vec<SourceValue>;

    fn current_sources(&self) -> Vec<SourceValue>;

    fn set_voltage(&mut self, name: &str, value: f64) -> Result<()>;

    fn set_current(&mut self, name: &str, value: f64) -> Result<()>;

    fn has_voltage_source(&self, name: &str) -> bool {
        self.voltage_sources().iter().any(|s| s.name.eq_ignore_ascii_case(name))
    }

    fn has_current_source(&self, name: &str) -> bool {
        self.current_sources().iter().any(|s| s.name.eq_ignore_ascii_case(name))
    }
}
