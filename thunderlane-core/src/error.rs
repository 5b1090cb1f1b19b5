//! Error taxonomy for the coordination control plane.
//!
//! Every fallible operation returns a [`CoordinationError`]. Callers classify
//! failures through [`CoordinationError::kind`]: validation and signature
//! failures call for reconfiguration, connectivity failures may be retried by
//! the caller, and partition failures leave the topology in `error` until it is
//! partitioned again. Annealing non-convergence is not an error; it is recorded
//! on the consensus run as `success = false`.

use thiserror::Error;

use crate::types::{LaneId, NodeId, RuleSetId, TopologyId};

/// Coarse classification used by callers to choose a recovery path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Rejected locally with no side effects; fix the input.
    Validation,
    /// A remote collaborator was unreachable; the caller may retry.
    Connectivity,
    /// Signature did not match content; re-sign before deploying.
    Signature,
    /// Partition computation failed; the topology is marked `error`.
    Partition,
}

impl ErrorKind {
    /// Whether retrying the identical call can succeed without reconfiguration.
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::Connectivity)
    }
}

/// Errors surfaced by every ThunderLane component.
#[derive(Debug, Error)]
pub enum CoordinationError {
    /// A field failed validation.
    #[error(
        "Invalid value for '{field}': {reason}\n  Expected: {expected}\n  Suggestion: correct the field and resubmit; no state was changed"
    )]
    Validation {
        /// Field that failed validation.
        field: &'static str,
        /// Human readable reason.
        reason: String,
        /// Description of an acceptable value.
        expected: String,
    },

    /// An alpha gain fell outside the coupling's adaptation bounds.
    #[error(
        "Alpha gain {value:.4} is outside adaptation bounds [{min:.4}, {max:.4}]\n  Expected: min <= alpha_gain <= max\n  Suggestion: clamp the proposed gain or widen the bounds first"
    )]
    OutOfBounds {
        /// Rejected gain.
        value: f64,
        /// Lower bound.
        min: f64,
        /// Upper bound.
        max: f64,
    },

    /// Requested partitioning strategy is not usable for this request.
    #[error(
        "Partitioning strategy '{strategy}' cannot be used: {reason}\n  Expected: grid_3d, spatial_hash, hilbert_curve, load_balanced or custom with an assigner\n  Suggestion: pick a supported strategy"
    )]
    InvalidStrategy {
        /// Strategy label.
        strategy: String,
        /// Why it was rejected.
        reason: String,
    },

    /// Ruleset is not in a state that allows the requested operation.
    #[error(
        "Ruleset {id} v{version} is '{status}', which does not allow this operation\n  Expected: {expected}\n  Suggestion: activate the ruleset or target a different version"
    )]
    InvalidRuleSet {
        /// Ruleset id.
        id: RuleSetId,
        /// Version observed.
        version: u64,
        /// Status observed.
        status: String,
        /// Status required.
        expected: &'static str,
    },

    /// State machine rejected an event.
    #[error("{entity} cannot handle '{event}' while '{from}'")]
    InvalidTransition {
        /// Entity kind (lane, coupling, ruleset, oracle, consensus).
        entity: &'static str,
        /// Current state label.
        from: &'static str,
        /// Event label.
        event: &'static str,
    },

    /// Entity lookup failed.
    #[error("{entity} '{id}' not found")]
    NotFound {
        /// Entity kind.
        entity: &'static str,
        /// Identifier that was looked up.
        id: String,
    },

    /// A uniqueness constraint was violated.
    #[error("{entity} already exists: {detail}")]
    Conflict {
        /// Entity kind.
        entity: &'static str,
        /// Which key collided.
        detail: String,
    },

    /// One or more compute nodes failed reachability checks.
    #[error(
        "Topology {topology}: {} node(s) unreachable ({})\n  Expected: every target node answers the reachability probe\n  Suggestion: restore the nodes or distribute onto a smaller node set",
        .unreachable.len(),
        .unreachable.iter().map(NodeId::as_str).collect::<Vec<_>>().join(", ")
    )]
    NodeUnreachable {
        /// Topology whose distribution failed.
        topology: TopologyId,
        /// Nodes that failed the probe.
        unreachable: Vec<NodeId>,
    },

    /// Stored signature does not verify against stored content.
    #[error("Signature check failed for ruleset {id} v{version}: {reason}")]
    Signature {
        /// Ruleset id.
        id: RuleSetId,
        /// Version checked.
        version: u64,
        /// Verification failure detail.
        reason: String,
    },

    /// Partition computation failed; nothing was committed.
    #[error("Partitioning topology {topology} with '{strategy}' failed: {reason}")]
    Partition {
        /// Topology being partitioned.
        topology: TopologyId,
        /// Strategy label.
        strategy: String,
        /// Failure detail.
        reason: String,
    },

    /// The supervised compute process behind a lane failed.
    #[error("Compute process for lane {lane} failed: {reason}")]
    Process {
        /// Lane whose process failed.
        lane: LaneId,
        /// Failure detail.
        reason: String,
    },

    /// A background computation was cancelled or panicked.
    #[error("{task} did not complete: {reason}")]
    Aborted {
        /// What was running.
        task: &'static str,
        /// Join failure detail.
        reason: String,
    },

    /// Canonical serialization failed.
    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CoordinationError {
    /// Classify the error for caller-side recovery decisions.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation { .. }
            | Self::OutOfBounds { .. }
            | Self::InvalidStrategy { .. }
            | Self::InvalidRuleSet { .. }
            | Self::InvalidTransition { .. }
            | Self::NotFound { .. }
            | Self::Conflict { .. }
            | Self::Serialization(_) => ErrorKind::Validation,
            Self::NodeUnreachable { .. } | Self::Process { .. } | Self::Aborted { .. } => {
                ErrorKind::Connectivity
            }
            Self::Signature { .. } => ErrorKind::Signature,
            Self::Partition { .. } => ErrorKind::Partition,
        }
    }

    pub(crate) fn validation(
        field: &'static str,
        reason: impl Into<String>,
        expected: impl Into<String>,
    ) -> Self {
        Self::Validation {
            field,
            reason: reason.into(),
            expected: expected.into(),
        }
    }

    pub(crate) fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }
}

/// Result alias used across the crate.
pub type Result<T, E = CoordinationError> = std::result::Result<T, E>;
