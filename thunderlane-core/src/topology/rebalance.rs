use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::distribution::{ComputeNode, DistributionMetrics, relative_loads};
use super::partition::{Partition, coefficient_of_variation};
use crate::config::TopologyConfig;
use crate::types::{NodeId, PartitionId, TopologyId};

const IMPROVEMENT_EPSILON: f64 = 1e-12;

/// Why a rebalance was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RebalanceReason {
    /// Distribution health dropped below the configured threshold.
    LowHealth,
    /// Node load variance exceeded the configured threshold.
    LoadVariance,
    /// Requested by an operator regardless of thresholds.
    Manual,
}

impl RebalanceReason {
    /// Threshold check; `None` when the placement is within policy.
    #[must_use]
    pub fn evaluate(metrics: &DistributionMetrics, config: &TopologyConfig) -> Option<Self> {
        if metrics.distribution_health < config.rebalance_health_threshold {
            Some(Self::LowHealth)
        } else if metrics.node_load_variance > config.rebalance_variance_threshold {
            Some(Self::LoadVariance)
        } else {
            None
        }
    }
}

/// One partition handed from one node to another.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionMove {
    /// Partition that moved.
    pub partition: PartitionId,
    /// Previous owner.
    pub from: NodeId,
    /// New owner.
    pub to: NodeId,
}

/// Result of a committed rebalance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RebalanceOutcome {
    /// Why the rebalance ran.
    pub reason: RebalanceReason,
    /// Moves in the order they were chosen.
    pub moved_partitions: Vec<PartitionMove>,
    /// Assignments after the moves.
    pub new_assignments: BTreeMap<PartitionId, NodeId>,
    /// Metrics after the moves.
    pub health: DistributionMetrics,
    /// Commit time.
    pub completed_at: DateTime<Utc>,
}

/// Lanes that still own cells of a topology.
///
/// Rebalance refuses to reassign partitions while any lane bound to the
/// topology is neither paused nor drained.
pub trait QuiescenceCheck: Send + Sync {
    /// Labels of lanes that are not quiesced.
    fn busy_lanes(&self, topology: TopologyId) -> Vec<String>;
}

/// For topologies with no lanes attached.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoLanes;

impl QuiescenceCheck for NoLanes {
    fn busy_lanes(&self, _topology: TopologyId) -> Vec<String> {
        Vec::new()
    }
}

/// Greedy heaviest-to-lightest moves.
///
/// Each round considers every partition on the most loaded node (capacity
/// relative, ties to the lower node id) and moves the one that leaves the
/// lowest node-load variance when handed to the least loaded node. Ties go to
/// the smaller partition, then to the lower partition id. Rounds stop as soon
/// as no candidate strictly lowers the variance.
pub(crate) fn plan_moves(partitions: &mut [Partition], nodes: &[ComputeNode]) -> Vec<PartitionMove> {
    let mut moves = Vec::new();
    if nodes.len() < 2 {
        return moves;
    }
    let rounds = partitions.len() * nodes.len();
    for _ in 0..rounds {
        let loads = relative_loads(partitions, nodes);
        let current = coefficient_of_variation(&loads);
        let (Some(heavy), Some(light)) = (extreme(&loads, nodes, true), extreme(&loads, nodes, false))
        else {
            break;
        };
        if heavy == light {
            break;
        }
        let (from, to) = (&nodes[heavy], &nodes[light]);

        let mut best: Option<(f64, f64, usize)> = None;
        for (idx, partition) in partitions.iter().enumerate() {
            if partition.assigned_node.as_ref() != Some(&from.id) {
                continue;
            }
            let mut trial = loads.clone();
            trial[heavy] -= partition.load / from.capacity;
            trial[light] += partition.load / to.capacity;
            let variance = coefficient_of_variation(&trial);
            if variance >= current - IMPROVEMENT_EPSILON {
                continue;
            }
            let better = best.is_none_or(|(best_var, best_load, best_idx)| {
                (variance, partition.load, partitions[idx].id)
                    < (best_var, best_load, partitions[best_idx].id)
            });
            if better {
                best = Some((variance, partition.load, idx));
            }
        }

        let Some((_, _, idx)) = best else {
            break;
        };
        partitions[idx].assigned_node = Some(to.id.clone());
        moves.push(PartitionMove {
            partition: partitions[idx].id,
            from: from.id.clone(),
            to: to.id.clone(),
        });
    }
    moves
}

/// Index of the most (or least) loaded node; ties resolve to the lower id.
fn extreme(loads: &[f64], nodes: &[ComputeNode], heaviest: bool) -> Option<usize> {
    let mut pick: Option<usize> = None;
    for (idx, load) in loads.iter().enumerate() {
        pick = match pick {
            None => Some(idx),
            Some(cur) => {
                let wins = if heaviest {
                    *load > loads[cur]
                } else {
                    *load < loads[cur]
                };
                let ties = (*load - loads[cur]).abs() <= IMPROVEMENT_EPSILON
                    && nodes[idx].id < nodes[cur].id;
                if wins || ties { Some(idx) } else { Some(cur) }
            }
        };
    }
    pick
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::grid::{BoundingBox, CellCoord};
    use crate::topology::partition::CellSet;

    fn slab(id: u32, load: f64, node: &str) -> Partition {
        Partition {
            id: PartitionId(id),
            cell_count: load as u64,
            bounds: BoundingBox::point(CellCoord::new(id, 0, 0)),
            cells: CellSet::Block,
            assigned_node: Some(NodeId::new(node)),
            load,
        }
    }

    fn nodes() -> Vec<ComputeNode> {
        vec![ComputeNode::new("a", "a:1"), ComputeNode::new("b", "b:1")]
    }

    #[test]
    fn lowest_partition_id_moves_first_on_ties() {
        let mut partitions: Vec<_> = (0..4).map(|id| slab(id, 10.0, "a")).collect();
        let moves = plan_moves(&mut partitions, &nodes());
        let moved: Vec<u32> = moves.iter().map(|m| m.partition.0).collect();
        assert_eq!(moved, vec![0, 1]);
        assert!(moves.iter().all(|m| m.to.as_str() == "b"));
    }

    #[test]
    fn balanced_placement_is_left_alone() {
        let mut partitions = vec![slab(0, 5.0, "a"), slab(1, 5.0, "b"), slab(2, 5.0, "a")];
        assert!(plan_moves(&mut partitions, &nodes()).is_empty());
    }

    #[test]
    fn single_best_move_beats_many_small_ones() {
        let mut partitions = vec![
            slab(0, 1.0, "a"),
            slab(1, 1.0, "a"),
            slab(2, 8.0, "a"),
            slab(3, 8.0, "b"),
        ];
        let moves = plan_moves(&mut partitions, &nodes());
        assert_eq!(moves.len(), 1);
        assert_eq!(moves[0].partition, PartitionId(0));
    }

    #[test]
    fn trigger_reasons_follow_thresholds() {
        let config = TopologyConfig::default();
        let mut metrics = DistributionMetrics {
            locality_score: 1.0,
            communication_overhead: 0.0,
            memory_efficiency: 1.0,
            node_load_variance: 0.0,
            distribution_health: 0.95,
            node_loads: BTreeMap::new(),
        };
        assert_eq!(RebalanceReason::evaluate(&metrics, &config), None);
        metrics.node_load_variance = 0.31;
        assert_eq!(
            RebalanceReason::evaluate(&metrics, &config),
            Some(RebalanceReason::LoadVariance)
        );
        metrics.distribution_health = 0.69;
        assert_eq!(
            RebalanceReason::evaluate(&metrics, &config),
            Some(RebalanceReason::LowHealth)
        );
    }
}
