//! Placement of partitions onto compute nodes and distribution health scoring.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::partition::{Partition, coefficient_of_variation};
use crate::types::NodeId;

const LOCALITY_WEIGHT: f64 = 0.4;
const OVERHEAD_WEIGHT: f64 = 0.3;
const MEMORY_WEIGHT: f64 = 0.3;

/// A compute node that can host partitions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComputeNode {
    /// Node identifier.
    pub id: NodeId,
    /// Address the deployment transport delivers to.
    pub address: String,
    /// Relative capacity weight (> 0).
    pub capacity: f64,
    /// Failure/latency zone.
    pub zone: Option<String>,
}

impl ComputeNode {
    /// Node with unit capacity and no zone.
    pub fn new(id: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            id: NodeId::new(id),
            address: address.into(),
            capacity: 1.0,
            zone: None,
        }
    }

    /// Override the capacity weight.
    #[must_use]
    pub fn with_capacity(mut self, capacity: f64) -> Self {
        self.capacity = capacity;
        self
    }

    /// Place the node in a zone.
    #[must_use]
    pub fn in_zone(mut self, zone: impl Into<String>) -> Self {
        self.zone = Some(zone.into());
        self
    }
}

/// Reachability check run against every node before a distribution commits.
#[async_trait]
pub trait NodeProbe: Send + Sync {
    /// Return `Err(reason)` when the node cannot accept work.
    async fn probe(&self, node: &ComputeNode) -> Result<(), String>;
}

/// Probe that reports every node reachable.
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysReachable;

#[async_trait]
impl NodeProbe for AlwaysReachable {
    async fn probe(&self, _node: &ComputeNode) -> Result<(), String> {
        Ok(())
    }
}

/// Probe backed by an explicit down-list; useful for operators and tests.
#[derive(Debug, Default)]
pub struct StaticProbe {
    down: RwLock<HashSet<NodeId>>,
}

impl StaticProbe {
    /// Probe with every node reachable.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a node unreachable.
    pub fn mark_down(&self, node: impl Into<NodeId>) {
        self.down.write().insert(node.into());
    }

    /// Mark a node reachable again.
    pub fn mark_up(&self, node: &NodeId) {
        self.down.write().remove(node);
    }
}

#[async_trait]
impl NodeProbe for StaticProbe {
    async fn probe(&self, node: &ComputeNode) -> Result<(), String> {
        if self.down.read().contains(&node.id) {
            Err(format!("{} marked down", node.address))
        } else {
            Ok(())
        }
    }
}

/// Probe every node concurrently; returns the unreachable ids in input order.
pub(crate) async fn unreachable_nodes(
    probe: &Arc<dyn NodeProbe>,
    nodes: &[ComputeNode],
    timeout: Duration,
) -> Vec<NodeId> {
    let handles: Vec<_> = nodes
        .iter()
        .cloned()
        .map(|node| {
            let probe = Arc::clone(probe);
            let id = node.id.clone();
            let handle = tokio::spawn(async move {
                match tokio::time::timeout(timeout, probe.probe(&node)).await {
                    Ok(result) => result,
                    Err(_) => Err(format!("no answer within {timeout:?}")),
                }
            });
            (id, handle)
        })
        .collect();

    let mut unreachable = Vec::new();
    for (id, handle) in handles {
        let outcome = handle
            .await
            .unwrap_or_else(|err| Err(format!("probe task failed: {err}")));
        match outcome {
            Ok(()) => debug!(node = %id, "node reachable"),
            Err(reason) => {
                warn!(node = %id, "node unreachable: {reason}");
                unreachable.push(id);
            }
        }
    }
    unreachable
}

/// Locality and balance of the current placement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistributionMetrics {
    /// Credit for adjacent partitions sharing a node (1) or a zone (0.5).
    pub locality_score: f64,
    /// Share of partition contact surface that crosses nodes.
    pub communication_overhead: f64,
    /// Least over most loaded node, relative to capacity.
    pub memory_efficiency: f64,
    /// Coefficient of variation of capacity-relative node load.
    pub node_load_variance: f64,
    /// `0.4·locality + 0.3·(1 − overhead) + 0.3·memory_efficiency`, in [0, 1].
    pub distribution_health: f64,
    /// Raw load per node.
    pub node_loads: BTreeMap<NodeId, f64>,
}

/// Assign partitions in id order to nodes in contiguous runs sized by capacity.
///
/// A partition goes to the first node whose cumulative capacity share covers
/// the partition's load midpoint, so neighbouring ids stay together.
pub(crate) fn assign_contiguous(partitions: &mut [Partition], nodes: &[ComputeNode]) {
    let total_load: f64 = partitions.iter().map(|p| p.load).sum();
    let total_capacity: f64 = nodes.iter().map(|n| n.capacity).sum();
    let mut targets = Vec::with_capacity(nodes.len());
    let mut cumulative = 0.0;
    for node in nodes {
        cumulative += node.capacity;
        targets.push(total_load * cumulative / total_capacity);
    }

    let mut acc = 0.0;
    for partition in partitions.iter_mut() {
        let midpoint = acc + partition.load / 2.0;
        let slot = targets
            .iter()
            .position(|target| *target >= midpoint)
            .unwrap_or(nodes.len().saturating_sub(1));
        partition.assigned_node = nodes.get(slot).map(|node| node.id.clone());
        acc += partition.load;
    }
}

/// Capacity-relative load per node, in `nodes` order.
pub(crate) fn relative_loads(partitions: &[Partition], nodes: &[ComputeNode]) -> Vec<f64> {
    let raw = raw_loads(partitions, nodes);
    nodes
        .iter()
        .map(|node| raw.get(&node.id).copied().unwrap_or(0.0) / node.capacity)
        .collect()
}

fn raw_loads(partitions: &[Partition], nodes: &[ComputeNode]) -> BTreeMap<NodeId, f64> {
    let mut loads: BTreeMap<NodeId, f64> = nodes.iter().map(|n| (n.id.clone(), 0.0)).collect();
    for partition in partitions {
        if let Some(node) = &partition.assigned_node
            && let Some(load) = loads.get_mut(node)
        {
            *load += partition.load;
        }
    }
    loads
}

/// Score the placement recorded on `partitions`.
pub(crate) fn measure(partitions: &[Partition], nodes: &[ComputeNode]) -> DistributionMetrics {
    let zone_of: BTreeMap<&NodeId, Option<&str>> = nodes
        .iter()
        .map(|n| (&n.id, n.zone.as_deref()))
        .collect();

    let mut pairs = 0_u64;
    let mut credit = 0.0;
    let mut contact_total = 0_u64;
    let mut contact_cross = 0_u64;
    for (i, a) in partitions.iter().enumerate() {
        for b in &partitions[i + 1..] {
            let contact = a.bounds.contact(&b.bounds);
            if contact == 0 {
                continue;
            }
            pairs += 1;
            contact_total += contact;
            match (&a.assigned_node, &b.assigned_node) {
                (Some(na), Some(nb)) if na == nb => credit += 1.0,
                (Some(na), Some(nb)) => {
                    contact_cross += contact;
                    let za = zone_of.get(na).copied().flatten();
                    let zb = zone_of.get(nb).copied().flatten();
                    if za.is_some() && za == zb {
                        credit += 0.5;
                    }
                }
                _ => contact_cross += contact,
            }
        }
    }

    let locality_score = if pairs == 0 { 1.0 } else { credit / pairs as f64 };
    let communication_overhead = if contact_total == 0 {
        0.0
    } else {
        contact_cross as f64 / contact_total as f64
    };

    let relative = relative_loads(partitions, nodes);
    let max = relative.iter().copied().fold(0.0_f64, f64::max);
    let min = relative.iter().copied().fold(f64::INFINITY, f64::min);
    let memory_efficiency = if max <= f64::EPSILON { 1.0 } else { min / max };

    let distribution_health = (LOCALITY_WEIGHT * locality_score
        + OVERHEAD_WEIGHT * (1.0 - communication_overhead)
        + MEMORY_WEIGHT * memory_efficiency)
        .clamp(0.0, 1.0);

    DistributionMetrics {
        locality_score,
        communication_overhead,
        memory_efficiency,
        node_load_variance: coefficient_of_variation(&relative),
        distribution_health,
        node_loads: raw_loads(partitions, nodes),
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::config::TopologyConfig;
    use crate::topology::grid::GridShape;
    use crate::topology::partition::{PartitionRequest, PartitionStrategy, compute};

    fn blocks(count: u32) -> Vec<Partition> {
        compute(
            &GridShape::new(12, 12, 12),
            PartitionStrategy::Grid3d,
            &PartitionRequest::with_count(count),
            &TopologyConfig::default(),
        )
        .unwrap()
    }

    #[test]
    fn contiguous_assignment_follows_capacity() {
        let mut partitions = blocks(8);
        let nodes = vec![
            ComputeNode::new("a", "10.0.0.1:7000"),
            ComputeNode::new("b", "10.0.0.2:7000"),
            ComputeNode::new("c", "10.0.0.3:7000"),
        ];
        assign_contiguous(&mut partitions, &nodes);
        let per_node = |id: &str| {
            partitions
                .iter()
                .filter(|p| p.assigned_node.as_ref().map(NodeId::as_str) == Some(id))
                .count()
        };
        assert_eq!((per_node("a"), per_node("b"), per_node("c")), (3, 2, 3));
    }

    #[test]
    fn single_node_is_perfectly_healthy() {
        let mut partitions = blocks(8);
        let nodes = vec![ComputeNode::new("solo", "127.0.0.1:7000")];
        assign_contiguous(&mut partitions, &nodes);
        let metrics = measure(&partitions, &nodes);
        assert!((metrics.distribution_health - 1.0).abs() < 1e-12);
        assert!(metrics.communication_overhead.abs() < 1e-12);
    }

    #[test]
    fn idle_node_drags_memory_efficiency() {
        let mut partitions = blocks(2);
        let nodes = vec![
            ComputeNode::new("a", "a:1"),
            ComputeNode::new("b", "b:1").with_capacity(0.001),
        ];
        for p in &mut partitions {
            p.assigned_node = Some(NodeId::new("a"));
        }
        let metrics = measure(&partitions, &nodes);
        assert!(metrics.memory_efficiency.abs() < 1e-12);
        assert!(metrics.distribution_health < 0.71);
    }

    #[tokio::test]
    async fn static_probe_reports_down_nodes() {
        let probe = Arc::new(StaticProbe::new());
        probe.mark_down("b");
        let nodes = vec![ComputeNode::new("a", "a:1"), ComputeNode::new("b", "b:1")];
        let dyn_probe: Arc<dyn NodeProbe> = probe.clone();
        let down = unreachable_nodes(&dyn_probe, &nodes, Duration::from_millis(100)).await;
        assert_eq!(down, vec![NodeId::new("b")]);

        probe.mark_up(&NodeId::new("b"));
        let down = unreachable_nodes(&dyn_probe, &nodes, Duration::from_millis(100)).await;
        assert!(down.is_empty());
    }
}
