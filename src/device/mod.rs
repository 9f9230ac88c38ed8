//! Device side of the coupled system.
//!
//! A device contributes the leading block of global unknowns. Electrode
//! boundary conditions couple it to circuit nodes: once bound, an electrode
//! boundary reads the node's potential from the circuit block and adds its
//! terminal current to that node's KCL row.

pub mod bar;

use crate::context::TimeState;
use crate::coupling::SparsityPattern;
use crate::error::Result;
use crate::solver::convergence::EquationGroup;
use crate::sparse::TripletMatrix;

pub use bar::ResistiveBar;

/// A mesh node lying on a boundary condition.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundaryNode {
    /// Rank that owns the node's rows.
    pub owner: usize,
    /// Mesh neighbours of the node.
    pub neighbors: usize,
    /// Global dofs of the node that the boundary equation touches.
    pub dofs: Vec<usize>,
}

/// A named boundary condition of the device mesh.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundaryCondition {
    pub label: String,
    pub is_electrode: bool,
    pub nodes: Vec<BoundaryNode>,
}

impl BoundaryCondition {
    /// Jacobian entries this rank's boundary nodes contribute to a coupled row.
    pub fn local_coupling_entries(&self, rank: usize) -> usize {
        self.nodes
            .iter()
            .filter(|n| n.owner == rank)
            .map(|n| (n.neighbors + 1) * n.dofs.len())
            .sum()
    }
}

/// Discretised device equations over a partitioned mesh.
///
/// `residual` and `jacobian` add only the rows owned by this rank; the
/// nonlinear solver combines ranks.
pub trait DeviceProblem {
    /// Global number of device unknowns.
    fn n_dofs(&self) -> usize;

    /// Device unknowns whose rows this rank owns.
    fn n_owned_dofs(&self) -> usize;

    fn boundary_conditions(&self) -> &[BoundaryCondition];

    /// Attach electrode boundary `bc` to the global dof of a circuit node.
    fn bind_electrode(&mut self, bc: usize, circuit_dof: usize);

    /// Write the stored (last accepted) device state into `x`.
    fn load_solution(&self, x: &mut [f64]);

    /// Refresh time-dependent excitations for simulation time `clock`.
    fn update_stimulus(&mut self, clock: f64);

    fn residual(&mut self, x: &[f64], f: &mut [f64], time: &TimeState) -> Result<()>;

    fn jacobian(&mut self, x: &[f64], jac: &mut TripletMatrix, time: &TimeState) -> Result<()>;

    /// Add this rank's nonzero estimate per owned device row.
    fn declare_sparsity(&self, pattern: &mut SparsityPattern);

    fn equation_group(&self, dof: usize) -> EquationGroup;

    /// Dofs holding carrier densities, which must stay non-negative.
    fn density_dofs(&self) -> Vec<usize>;

    /// Record an accepted solution.
    fn post_solve(&mut self, x: &[f64], time: &TimeState);
}
