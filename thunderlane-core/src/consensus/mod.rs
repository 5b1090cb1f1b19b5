//! Ising annealing bursts that arbitrate lane disagreement.
//!
//! A burst never fails for lack of convergence: a run that exhausts its step
//! budget is recorded with `success = false` and an efficiency of zero.

/// Metropolis annealing kernel.
pub mod anneal;
/// Burst execution and run bookkeeping.
pub mod engine;
/// Run records and derived scores.
pub mod run;

pub use anneal::{AnnealOutcome, AnnealParams, Lattice, MAX_MATRIX_SIZE, anneal};
pub use engine::{ConsensusEngine, ConsensusRequest, disagreement, lane_bias};
pub use run::{ConsensusResult, ConsensusRun, RunStatus, TriggerReason};
