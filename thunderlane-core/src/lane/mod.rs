//! Per-axis lane coordinators and their supervised compute processes.

/// Coordinator record, snapshots and lifecycle operations.
pub mod coordinator;
/// Compute process abstraction and the tokio task implementation.
pub mod process;
/// Registry addressing coordinators by typed id.
pub mod registry;
/// Lane status machine.
pub mod state;

pub use coordinator::{
    ActiveRules, LaneCoordinator, LaneLimits, LaneRuntimeMetrics, LaneSnapshot, LaneSpec,
    LaneStatusReport, RebalanceFence,
};
pub use process::{
    ComputeProcess, LaneLaunch, ProcessError, ProcessLauncher, ProcessStatus, RuleUpdate,
    TaskLauncher, TaskProcess,
};
pub use registry::{LaneRegistry, RebalanceHold};
pub use state::{LaneStatus, LaneTransition, transition};
