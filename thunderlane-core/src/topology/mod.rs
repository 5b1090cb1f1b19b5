//! Grid partitioning, placement onto compute nodes, and rebalancing.

mod curve;
/// Placement onto compute nodes and distribution health.
pub mod distribution;
/// Grid geometry and the topology record.
pub mod grid;
/// Owner of topology records.
pub mod manager;
/// Partition strategies and metrics.
pub mod partition;
/// Load-driven reassignment between nodes.
pub mod rebalance;

pub use distribution::{AlwaysReachable, ComputeNode, DistributionMetrics, NodeProbe, StaticProbe};
pub use grid::{
    AxisBoundaries, BoundaryCondition, BoundingBox, CellCoord, GridShape, Neighborhood,
    NeighborhoodType, Topology, TopologySpec, TopologyStatus, TopologyType,
};
pub use manager::{DistributionOutcome, PartitionOutcome, TopologyManager};
pub use partition::{
    CellAssigner, CellSet, LoadModel, Partition, PartitionMetrics, PartitionRequest,
    PartitionStrategy,
};
pub use rebalance::{NoLanes, PartitionMove, QuiescenceCheck, RebalanceOutcome, RebalanceReason};
