use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{info, warn};

use super::distribution::{
    ComputeNode, DistributionMetrics, NodeProbe, assign_contiguous, measure, unreachable_nodes,
};
use super::grid::{Topology, TopologySpec, TopologyStatus};
use super::partition::{
    Partition, PartitionMetrics, PartitionRequest, PartitionStrategy, PlanFailure, compute,
};
use super::rebalance::{QuiescenceCheck, RebalanceOutcome, RebalanceReason, plan_moves};
use crate::config::TopologyConfig;
use crate::error::{CoordinationError, Result};
use crate::events::{EventBus, LaneEvent, names, publish_or_log};
use crate::types::{NodeId, PartitionId, TopologyId};

/// Committed partition set and its summary.
#[derive(Debug, Clone, Serialize)]
pub struct PartitionOutcome {
    /// Partitions in id order.
    pub partitions: Vec<Partition>,
    /// Summary metrics.
    pub metrics: PartitionMetrics,
}

/// Committed placement and its health.
#[derive(Debug, Clone, Serialize)]
pub struct DistributionOutcome {
    /// Partition → node.
    pub assignments: BTreeMap<PartitionId, NodeId>,
    /// Placement metrics.
    pub health: DistributionMetrics,
}

/// Sole owner of topology records; all mutation goes through
/// [`partition`](Self::partition), [`distribute`](Self::distribute) and
/// [`rebalance`](Self::rebalance).
pub struct TopologyManager {
    topologies: DashMap<TopologyId, Arc<RwLock<Topology>>>,
    probe: Arc<dyn NodeProbe>,
    bus: Arc<dyn EventBus>,
    config: TopologyConfig,
}

impl TopologyManager {
    /// Create a manager with the given reachability probe and event bus.
    pub fn new(config: TopologyConfig, probe: Arc<dyn NodeProbe>, bus: Arc<dyn EventBus>) -> Self {
        Self {
            topologies: DashMap::new(),
            probe,
            bus,
            config,
        }
    }

    /// Active configuration.
    #[must_use]
    pub const fn config(&self) -> &TopologyConfig {
        &self.config
    }

    /// Register a new topology in `pending`.
    pub fn create(&self, spec: TopologySpec) -> Result<TopologyId> {
        spec.validate()?;
        let topology = Topology::from_spec(spec);
        let id = topology.id;
        info!(topology = %id, name = %topology.name, shape = %topology.shape, "topology created");
        self.topologies.insert(id, Arc::new(RwLock::new(topology)));
        Ok(id)
    }

    /// Snapshot of a topology.
    pub fn get(&self, id: TopologyId) -> Result<Topology> {
        Ok(self.entry(id)?.read().clone())
    }

    /// Ids of every registered topology.
    #[must_use]
    pub fn list(&self) -> Vec<TopologyId> {
        let mut ids: Vec<_> = self.topologies.iter().map(|entry| *entry.key()).collect();
        ids.sort();
        ids
    }

    /// Forget a topology.
    pub fn remove(&self, id: TopologyId) -> Result<Topology> {
        let (_, record) = self
            .topologies
            .remove(&id)
            .ok_or_else(|| CoordinationError::not_found("topology", id))?;
        let topology = record.read().clone();
        Ok(topology)
    }

    /// Nodes the topology is currently distributed over.
    pub fn nodes_of(&self, id: TopologyId) -> Result<Vec<ComputeNode>> {
        Ok(self.entry(id)?.read().nodes.clone())
    }

    /// Compute and commit a partition set.
    ///
    /// Unsupported requests are rejected with no state change. A strategy that
    /// runs and fails marks the topology `error`; the previous partition set is
    /// kept either way.
    pub fn partition(
        &self,
        id: TopologyId,
        strategy: PartitionStrategy,
        request: &PartitionRequest,
    ) -> Result<PartitionOutcome> {
        let record = self.entry(id)?;
        let shape = record.read().shape;

        let partitions = match compute(&shape, strategy, request, &self.config) {
            Ok(partitions) => partitions,
            Err(PlanFailure::Unsupported(reason)) => {
                return Err(CoordinationError::InvalidStrategy {
                    strategy: strategy.label().to_string(),
                    reason,
                });
            }
            Err(PlanFailure::Failed(reason)) => {
                self.fail(&record, reason.clone());
                return Err(CoordinationError::Partition {
                    topology: id,
                    strategy: strategy.label().to_string(),
                    reason,
                });
            }
        };
        let metrics = PartitionMetrics::from_partitions(&shape, &partitions);

        {
            let mut topology = record.write();
            topology.strategy = Some(strategy);
            topology.partitions = partitions.clone();
            topology.partition_metrics = Some(metrics.clone());
            topology.nodes.clear();
            topology.distribution = None;
            topology.status = TopologyStatus::Partitioned;
            topology.last_error = None;
            topology.updated_at = Utc::now();
        }

        info!(
            topology = %id,
            strategy = %strategy,
            partitions = metrics.partition_count,
            load_variance = metrics.load_variance,
            "topology partitioned"
        );
        publish_or_log(
            self.bus.as_ref(),
            LaneEvent::new(names::TOPOLOGY_PARTITIONED, id)
                .with("strategy", strategy)
                .with("status", TopologyStatus::Partitioned)
                .with("metrics", &metrics),
        );
        Ok(PartitionOutcome {
            partitions,
            metrics,
        })
    }

    /// Probe every node, then assign all partitions at once.
    ///
    /// Any unreachable node aborts the call before a single assignment is
    /// written and marks the topology `error`.
    pub async fn distribute(
        &self,
        id: TopologyId,
        nodes: Vec<ComputeNode>,
    ) -> Result<DistributionOutcome> {
        let record = self.entry(id)?;
        validate_nodes(&nodes)?;
        {
            let topology = record.read();
            if topology.partitions.is_empty() {
                return Err(CoordinationError::InvalidTransition {
                    entity: "topology",
                    from: topology.status.label(),
                    event: "distribute",
                });
            }
        }

        let unreachable = unreachable_nodes(&self.probe, &nodes, self.config.node_probe_timeout).await;
        if !unreachable.is_empty() {
            let listed = unreachable
                .iter()
                .map(NodeId::as_str)
                .collect::<Vec<_>>()
                .join(", ");
            self.fail(&record, format!("unreachable nodes: {listed}"));
            return Err(CoordinationError::NodeUnreachable {
                topology: id,
                unreachable,
            });
        }

        let outcome = {
            let mut topology = record.write();
            let mut partitions = topology.partitions.clone();
            assign_contiguous(&mut partitions, &nodes);
            let health = measure(&partitions, &nodes);
            topology.partitions = partitions;
            topology.nodes = nodes;
            topology.distribution = Some(health.clone());
            topology.status = TopologyStatus::Distributed;
            topology.last_error = None;
            topology.updated_at = Utc::now();
            DistributionOutcome {
                assignments: topology.assignments(),
                health,
            }
        };

        info!(
            topology = %id,
            nodes = outcome.health.node_loads.len(),
            health = outcome.health.distribution_health,
            "topology distributed"
        );
        publish_or_log(
            self.bus.as_ref(),
            LaneEvent::new(names::TOPOLOGY_DISTRIBUTED, id)
                .with("status", TopologyStatus::Distributed)
                .with("distribution_health", outcome.health.distribution_health)
                .with("assignments", &outcome.assignments),
        );
        Ok(outcome)
    }

    /// Threshold check against the current placement.
    pub fn needs_rebalance(&self, id: TopologyId) -> Result<Option<RebalanceReason>> {
        let record = self.entry(id)?;
        let topology = record.read();
        Ok(topology
            .distribution
            .as_ref()
            .and_then(|metrics| RebalanceReason::evaluate(metrics, &self.config)))
    }

    /// Reassign partitions between the nodes already in use.
    ///
    /// Every lane bound to the topology must be quiesced first so no cell is
    /// owned twice during the handoff.
    pub fn rebalance(
        &self,
        id: TopologyId,
        lanes: &dyn QuiescenceCheck,
    ) -> Result<RebalanceOutcome> {
        let record = self.entry(id)?;
        let busy = lanes.busy_lanes(id);
        if !busy.is_empty() {
            return Err(CoordinationError::validation(
                "lanes",
                format!("lanes still running: {}", busy.join(", ")),
                "every lane bound to the topology paused or drained",
            ));
        }

        let outcome = {
            let mut topology = record.write();
            if topology.status != TopologyStatus::Distributed {
                return Err(CoordinationError::InvalidTransition {
                    entity: "topology",
                    from: topology.status.label(),
                    event: "rebalance",
                });
            }
            let reason = topology
                .distribution
                .as_ref()
                .and_then(|metrics| RebalanceReason::evaluate(metrics, &self.config))
                .unwrap_or(RebalanceReason::Manual);
            let mut partitions = topology.partitions.clone();
            let moved = plan_moves(&mut partitions, &topology.nodes);
            let health = measure(&partitions, &topology.nodes);
            topology.partitions = partitions;
            topology.distribution = Some(health.clone());
            topology.updated_at = Utc::now();
            RebalanceOutcome {
                reason,
                moved_partitions: moved,
                new_assignments: topology.assignments(),
                health,
                completed_at: Utc::now(),
            }
        };

        info!(
            topology = %id,
            reason = ?outcome.reason,
            moved = outcome.moved_partitions.len(),
            health = outcome.health.distribution_health,
            "topology rebalanced"
        );
        publish_or_log(
            self.bus.as_ref(),
            LaneEvent::new(names::TOPOLOGY_REBALANCED, id)
                .with("reason", outcome.reason)
                .with("moved_partitions", &outcome.moved_partitions)
                .with("distribution_health", outcome.health.distribution_health),
        );
        Ok(outcome)
    }

    fn entry(&self, id: TopologyId) -> Result<Arc<RwLock<Topology>>> {
        self.topologies
            .get(&id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| CoordinationError::not_found("topology", id))
    }

    fn fail(&self, record: &RwLock<Topology>, reason: String) {
        let id = {
            let mut topology = record.write();
            topology.mark_error(reason.clone());
            topology.id
        };
        warn!(topology = %id, "topology entered error state: {reason}");
        publish_or_log(
            self.bus.as_ref(),
            LaneEvent::new(names::TOPOLOGY_ERROR, id)
                .with("status", TopologyStatus::Error)
                .with("reason", reason),
        );
    }
}

fn validate_nodes(nodes: &[ComputeNode]) -> Result<()> {
    if nodes.is_empty() {
        return Err(CoordinationError::validation(
            "nodes",
            "no compute nodes supplied",
            "at least one node",
        ));
    }
    let mut seen = HashSet::new();
    for node in nodes {
        if !(node.capacity.is_finite() && node.capacity > 0.0) {
            return Err(CoordinationError::validation(
                "nodes.capacity",
                format!("{} has capacity {}", node.id, node.capacity),
                "a finite capacity > 0",
            ));
        }
        if !seen.insert(&node.id) {
            return Err(CoordinationError::validation(
                "nodes.id",
                format!("{} listed twice", node.id),
                "unique node ids",
            ));
        }
    }
    Ok(())
}
