//! Deployment wire format and delivery to compute nodes.

use std::collections::HashSet;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::model::{CouplingMatrix, LaneRules, Params, RuleSet};
use crate::error::Result;
use crate::topology::{ComputeNode, TopologyManager};
use crate::types::{NodeId, RuleSetId, TopologyId};

/// Exact document pushed to compute nodes on activation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentPayload {
    /// Ruleset lineage id.
    pub id: RuleSetId,
    /// Deployed version.
    pub version: u64,
    /// Per-lane rules.
    pub lanes: LaneRules,
    /// Coupling gains.
    pub coupling: CouplingMatrix,
    /// Schedule atom.
    pub schedule: String,
    /// Schedule parameters.
    pub schedule_params: Params,
    /// Boundary conditions.
    pub boundaries: Params,
    /// Base64 signature.
    pub signature: String,
}

impl DeploymentPayload {
    /// Build the payload for a signed ruleset; `None` when unsigned.
    #[must_use]
    pub fn from_ruleset(ruleset: &RuleSet) -> Option<Self> {
        let signature = ruleset.signature.clone()?;
        let content = &ruleset.content;
        Some(Self {
            id: ruleset.id,
            version: ruleset.version,
            lanes: content.lanes.clone(),
            coupling: content.coupling,
            schedule: content.schedule.clone(),
            schedule_params: content.schedule_params.clone(),
            boundaries: content.boundaries.clone(),
            signature,
        })
    }

    /// Serialized wire bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// Pushes deployment payloads to compute nodes.
#[async_trait]
pub trait DeploymentTransport: Send + Sync {
    /// Deliver one payload to one node.
    async fn deliver(&self, node: &ComputeNode, payload: &[u8]) -> Result<(), String>;
}

/// Resolves the nodes bound to a topology.
pub trait NodeDirectory: Send + Sync {
    /// Nodes currently hosting partitions of `topology`.
    fn nodes_for(&self, topology: TopologyId) -> Vec<ComputeNode>;
}

impl NodeDirectory for TopologyManager {
    fn nodes_for(&self, topology: TopologyId) -> Vec<ComputeNode> {
        self.nodes_of(topology).unwrap_or_default()
    }
}

/// Directory with no nodes; deployments become no-ops.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoNodes;

impl NodeDirectory for NoNodes {
    fn nodes_for(&self, _topology: TopologyId) -> Vec<ComputeNode> {
        Vec::new()
    }
}

/// A delivery recorded by [`InMemoryTransport`].
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    /// Receiving node.
    pub node: NodeId,
    /// Decoded payload.
    pub payload: serde_json::Value,
}

/// Transport that records deliveries in memory and can simulate failures.
#[derive(Debug, Default)]
pub struct InMemoryTransport {
    delivered: Mutex<Vec<Delivery>>,
    failing: Mutex<HashSet<NodeId>>,
}

impl InMemoryTransport {
    /// Empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make deliveries to `node` fail.
    pub fn fail_node(&self, node: impl Into<NodeId>) {
        self.failing.lock().insert(node.into());
    }

    /// Snapshot of successful deliveries.
    #[must_use]
    pub fn deliveries(&self) -> Vec<Delivery> {
        self.delivered.lock().clone()
    }
}

#[async_trait]
impl DeploymentTransport for InMemoryTransport {
    async fn deliver(&self, node: &ComputeNode, payload: &[u8]) -> Result<(), String> {
        if self.failing.lock().contains(&node.id) {
            return Err(format!("connection to {} refused", node.address));
        }
        let payload = serde_json::from_slice(payload).map_err(|err| err.to_string())?;
        self.delivered.lock().push(Delivery {
            node: node.id.clone(),
            payload,
        });
        Ok(())
    }
}

/// Outcome of pushing one activation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeploymentReport {
    /// Ruleset deployed.
    pub ruleset: RuleSetId,
    /// Version deployed.
    pub version: u64,
    /// Nodes that accepted the payload.
    pub delivered: Vec<NodeId>,
    /// Nodes that did not, with the transport's reason.
    pub failed: Vec<(NodeId, String)>,
}
