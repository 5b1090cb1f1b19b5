//! Versioned, signed lane rule configurations and their deployment.

/// Wire format, transports and node lookup.
pub mod deploy;
/// Ruleset records and the lifecycle transition table.
pub mod model;
/// Registry serializing writes per lineage.
pub mod registry;
/// Ed25519 signing over canonical content.
pub mod signing;

pub use deploy::{
    Delivery, DeploymentPayload, DeploymentReport, DeploymentTransport, InMemoryTransport,
    NoNodes, NodeDirectory,
};
pub use model::{
    CouplingMatrix, LaneRule, LaneRules, NewRuleSet, Params, RuleSet, RuleSetContent,
    RuleSetEvent, RuleSetStatus, transition,
};
pub use registry::RuleSetRegistry;
pub use signing::{RuleSigner, SIGNING_ALGORITHM, canonical_bytes};
