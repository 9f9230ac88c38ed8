//! Communication backend for the SPMD solve.
//!
//! Every rank runs the same controller code. The circuit engine lives on the
//! last rank only, so anything it computes that other ranks need (step
//! counts, node bindings, mode vetoes) must pass through an explicit
//! broadcast. The global solution vector is replicated on every rank and
//! owned contributions are combined with vector reductions.

/// Abstraction over inter-process communication.
///
/// Implementations: `SingleProcessComm` (no-op), `MpiComm` (via mpi crate).
pub trait CommunicationBackend: Send + Sync {
    /// Sum a local count across all ranks.
    fn all_reduce_sum_count(&self, local: usize) -> usize;

    /// Element-wise sum of a vector across all ranks, in place.
    ///
    /// Each rank contributes its local values (zeros for non-owned positions).
    /// After the call, every rank holds the global sum.
    fn all_reduce_sum_vec(&self, local: &mut [f64]);

    /// Concatenate variable-length local vectors in rank order.
    fn all_gather_vec(&self, local: &[f64]) -> Vec<f64>;

    /// Every rank receives `root`'s value.
    fn broadcast_f64(&self, value: f64, root: usize) -> f64;

    /// Every rank receives `root`'s value.
    fn broadcast_i64(&self, value: i64, root: usize) -> i64;

    /// This process's rank.
    fn rank(&self) -> usize;

    /// Total number of ranks.
    fn num_ranks(&self) -> usize;

    /// Rank that owns the circuit engine and the circuit dofs.
    fn last_rank(&self) -> usize {
        self.num_ranks().saturating_sub(1)
    }

    fn is_last_rank(&self) -> bool {
        self.rank() == self.last_rank()
    }

    fn broadcast_bool(&self, value: bool, root: usize) -> bool {
        self.broadcast_i64(i64::from(value), root) != 0
    }
}

/// No-op communication backend for single-process execution.
///
/// All operations pass through unchanged.
pub struct SingleProcessComm;

impl CommunicationBackend for SingleProcessComm {
    fn all_reduce_sum_count(&self, local: usize) -> usize {
        local
    }

    fn all_reduce_sum_vec(&self, _local: &mut [f64]) {
        // Single process: vector is already complete.
    }

    fn all_gather_vec(&self, local: &[f64]) -> Vec<f64> {
        local.to_vec()
    }

    fn broadcast_f64(&self, value: f64, _root: usize) -> f64 {
        value
    }

    fn broadcast_i64(&self, value: i64, _root: usize) -> i64 {
        value
    }

    fn rank(&self) -> usize {
        0
    }

    fn num_ranks(&self) -> usize {
        1
    }
}
