//! MPI communication backend.
//!
//! Requires the `distributed` feature flag and an MPI installation.
//! MPI must be initialised before any collective is called:
//!
//! ```ignore
//! let universe = mpi::initialize().expect("MPI init failed");
//! let comm = MpiComm::new();
//! ```

use super::comm::CommunicationBackend;
use mpi::collective::SystemOperation;
use mpi::datatype::PartitionMut;
use mpi::topology::SimpleCommunicator;
use mpi::traits::*;
use mpi::Count;

/// Backend over the world communicator.
///
/// Holds no handle; the world communicator is looked up per call so the
/// backend stays `Send + Sync`.
#[derive(Debug, Default, Clone, Copy)]
pub struct MpiComm;

impl MpiComm {
    pub fn new() -> Self {
        Self
    }
}

fn world() -> SimpleCommunicator {
    SimpleCommunicator::world()
}

/// Exclusive prefix sum of per-rank counts.
fn displacements(counts: &[Count]) -> Vec<Count> {
    counts
        .iter()
        .scan(0, |offset, &c| {
            let d = *offset;
            *offset += c;
            Some(d)
        })
        .collect()
}

impl CommunicationBackend for MpiComm {
    fn all_reduce_sum_count(&self, local: usize) -> usize {
        let mut global = 0u64;
        world().all_reduce_into(&(local as u64), &mut global, SystemOperation::sum());
        global as usize
    }

    fn all_reduce_sum_vec(&self, local: &mut [f64]) {
        let send = local.to_vec();
        world().all_reduce_into(&send[..], local, SystemOperation::sum());
    }

    fn all_gather_vec(&self, local: &[f64]) -> Vec<f64> {
        let world = world();
        let mut counts: Vec<Count> = vec![0; world.size() as usize];
        world.all_gather_into(&(local.len() as Count), &mut counts[..]);

        let displs = displacements(&counts);
        let total = counts.iter().map(|&c| c as usize).sum();
        let mut gathered = vec![0.0f64; total];
        {
            let mut partition = PartitionMut::new(&mut gathered[..], counts, &displs[..]);
            world.all_gather_varcount_into(local, &mut partition);
        }
        gathered
    }

    fn broadcast_f64(&self, mut value: f64, root: usize) -> f64 {
        world().process_at_rank(root as i32).broadcast_into(&mut value);
        value
    }

    fn broadcast_i64(&self, mut value: i64, root: usize) -> i64 {
        world().process_at_rank(root as i32).broadcast_into(&mut value);
        value
    }

    fn rank(&self) -> usize {
        world().rank() as usize
    }

    fn num_ranks(&self) -> usize {
        world().size() as usize
    }
}
