//! ThunderLane multi-scale lane coordination engine.
//!
//! The control plane partitions a three-dimensional cellular grid across
//! compute nodes, supervises one processing lane per axis, tunes the
//! directional coupling between lanes, and resolves lane disagreement with a
//! simulated-annealing consensus burst. The cellular kernels themselves run
//! inside compute processes and are opaque to this crate.

#![cfg_attr(docsrs, feature(doc_cfg))]
// Safety-focused Clippy lints to keep error handling explicit
#![warn(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::unimplemented,
    clippy::todo
)]
#![deny(clippy::unwrap_in_result, clippy::panic_in_result_fn)]

/// Configuration schema shared by the CLI and runtime.
pub mod config;
/// Annealing bursts that resolve lane disagreement.
pub mod consensus;
/// Directional couplings between lanes and their tuning loop.
pub mod coupling;
/// The assembled control plane.
pub mod engine;
/// Error taxonomy.
pub mod error;
/// Named events and the bus they travel on.
pub mod events;
/// Per-axis lane coordinators and their compute processes.
pub mod lane;
/// Counters, trends, heartbeats and alerts.
pub mod metrics;
/// Advisory parameter prediction.
pub mod oracle;
/// Versioned, signed rule configurations.
pub mod ruleset;
/// Grid partitioning and placement.
pub mod topology;
/// Identifiers and small shared types.
pub mod types;

pub use config::ThunderlaneConfig;
pub use engine::{BackgroundTasks, ConsensusCheck, ThunderLane, ThunderLaneBuilder};
pub use error::{CoordinationError, ErrorKind};
pub use events::{BroadcastEventBus, EventBus, LaneEvent, NullEventBus, RecordingEventBus};
pub use types::{
    ConsensusRunId, CouplingId, Dimension, DimensionParseError, LaneId, NodeId, OracleId,
    PartitionId, RuleSetId, TopologyId,
};
