use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CoordinationError, Result};
use crate::types::{Dimension, RuleSetId, TopologyId};

/// Free-form JSON parameters, key-sorted so serialization is canonical.
pub type Params = BTreeMap<String, Value>;

/// Rule executed by one lane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaneRule {
    /// Rule identifier (lowercase atom, e.g. `game_of_life`).
    pub rule: String,
    /// Rule parameters.
    #[serde(default)]
    pub params: Params,
}

impl LaneRule {
    /// Rule with no parameters.
    pub fn new(rule: impl Into<String>) -> Self {
        Self {
            rule: rule.into(),
            params: Params::new(),
        }
    }

    /// Attach a parameter.
    #[must_use]
    pub fn param(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.params.insert(key.to_string(), value.into());
        self
    }
}

/// Per-axis rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaneRules {
    /// X lane.
    pub x: LaneRule,
    /// Y lane.
    pub y: LaneRule,
    /// Z lane.
    pub z: LaneRule,
}

impl LaneRules {
    /// The same rule on every lane.
    #[must_use]
    pub fn uniform(rule: &LaneRule) -> Self {
        Self {
            x: rule.clone(),
            y: rule.clone(),
            z: rule.clone(),
        }
    }

    /// Rule for one lane.
    #[must_use]
    pub const fn get(&self, dimension: Dimension) -> &LaneRule {
        match dimension {
            Dimension::X => &self.x,
            Dimension::Y => &self.y,
            Dimension::Z => &self.z,
        }
    }
}

/// Directional α-gains between the three lanes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CouplingMatrix {
    /// X → Y.
    pub alpha_xy: f64,
    /// X → Z.
    pub alpha_xz: f64,
    /// Y → X.
    pub alpha_yx: f64,
    /// Y → Z.
    pub alpha_yz: f64,
    /// Z → X.
    pub alpha_zx: f64,
    /// Z → Y.
    pub alpha_zy: f64,
}

impl Default for CouplingMatrix {
    fn default() -> Self {
        Self::uniform(0.5)
    }
}

impl CouplingMatrix {
    /// Directed pairs in wire order.
    pub const PAIRS: [(Dimension, Dimension); 6] = [
        (Dimension::X, Dimension::Y),
        (Dimension::X, Dimension::Z),
        (Dimension::Y, Dimension::X),
        (Dimension::Y, Dimension::Z),
        (Dimension::Z, Dimension::X),
        (Dimension::Z, Dimension::Y),
    ];

    /// Every gain set to `alpha`.
    #[must_use]
    pub const fn uniform(alpha: f64) -> Self {
        Self {
            alpha_xy: alpha,
            alpha_xz: alpha,
            alpha_yx: alpha,
            alpha_yz: alpha,
            alpha_zx: alpha,
            alpha_zy: alpha,
        }
    }

    /// Build from a function of the directed pair.
    pub fn from_fn(mut gain: impl FnMut(Dimension, Dimension) -> f64) -> Self {
        let mut matrix = Self::uniform(0.0);
        for (source, target) in Self::PAIRS {
            matrix.set(source, target, gain(source, target));
        }
        matrix
    }

    /// Gain from `source` to `target`; `None` on the diagonal.
    #[must_use]
    pub const fn get(&self, source: Dimension, target: Dimension) -> Option<f64> {
        match (source, target) {
            (Dimension::X, Dimension::Y) => Some(self.alpha_xy),
            (Dimension::X, Dimension::Z) => Some(self.alpha_xz),
            (Dimension::Y, Dimension::X) => Some(self.alpha_yx),
            (Dimension::Y, Dimension::Z) => Some(self.alpha_yz),
            (Dimension::Z, Dimension::X) => Some(self.alpha_zx),
            (Dimension::Z, Dimension::Y) => Some(self.alpha_zy),
            _ => None,
        }
    }

    /// Set the gain from `source` to `target`; ignored on the diagonal.
    pub fn set(&mut self, source: Dimension, target: Dimension, alpha: f64) {
        let slot = match (source, target) {
            (Dimension::X, Dimension::Y) => &mut self.alpha_xy,
            (Dimension::X, Dimension::Z) => &mut self.alpha_xz,
            (Dimension::Y, Dimension::X) => &mut self.alpha_yx,
            (Dimension::Y, Dimension::Z) => &mut self.alpha_yz,
            (Dimension::Z, Dimension::X) => &mut self.alpha_zx,
            (Dimension::Z, Dimension::Y) => &mut self.alpha_zy,
            _ => return,
        };
        *slot = alpha;
    }

    /// `(key, value)` entries in wire order.
    #[must_use]
    pub fn entries(&self) -> [(&'static str, f64); 6] {
        [
            ("alpha_xy", self.alpha_xy),
            ("alpha_xz", self.alpha_xz),
            ("alpha_yx", self.alpha_yx),
            ("alpha_yz", self.alpha_yz),
            ("alpha_zx", self.alpha_zx),
            ("alpha_zy", self.alpha_zy),
        ]
    }

    /// Mean of the six gains.
    #[must_use]
    pub fn mean(&self) -> f64 {
        self.entries().iter().map(|(_, v)| v).sum::<f64>() / 6.0
    }

    /// Non-zero differences `other - self`, keyed by wire name.
    #[must_use]
    pub fn deltas(&self, other: &Self) -> BTreeMap<&'static str, f64> {
        self.entries()
            .into_iter()
            .zip(other.entries())
            .filter_map(|((key, old), (_, new))| {
                let delta = new - old;
                (delta.abs() > f64::EPSILON).then_some((key, delta))
            })
            .collect()
    }

    /// Every gain must lie in [0, 1].
    pub fn validate(&self) -> Result<()> {
        for (key, value) in self.entries() {
            if !(0.0..=1.0).contains(&value) {
                return Err(CoordinationError::validation(
                    "coupling",
                    format!("{key} = {value} is outside [0, 1]"),
                    "every alpha gain between 0 and 1",
                ));
            }
        }
        Ok(())
    }
}

/// Signed content of a ruleset version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleSetContent {
    /// Per-lane rules.
    pub lanes: LaneRules,
    /// Coupling matrix.
    pub coupling: CouplingMatrix,
    /// Schedule type (atom, e.g. `synchronous`).
    pub schedule: String,
    /// Schedule parameters.
    #[serde(default)]
    pub schedule_params: Params,
    /// Boundary conditions.
    #[serde(default)]
    pub boundaries: Params,
}

impl RuleSetContent {
    /// Same rule on every lane, synchronous schedule, default coupling.
    #[must_use]
    pub fn uniform(rule: &LaneRule) -> Self {
        Self {
            lanes: LaneRules::uniform(rule),
            coupling: CouplingMatrix::default(),
            schedule: "synchronous".to_string(),
            schedule_params: Params::new(),
            boundaries: Params::new(),
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        for dimension in Dimension::ALL {
            validate_atom("lanes.rule", &self.lanes.get(dimension).rule)?;
        }
        validate_atom("schedule", &self.schedule)?;
        self.coupling.validate()
    }
}

fn validate_atom(field: &'static str, value: &str) -> Result<()> {
    let valid = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(CoordinationError::validation(
            field,
            format!("'{value}' is not a valid atom"),
            "a non-empty lowercase identifier ([a-z0-9_])",
        ))
    }
}

/// Ruleset lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleSetStatus {
    /// Editable, not deployed.
    Draft,
    /// Deployed; only α-gains may change.
    Active,
    /// Withdrawn from service.
    Deprecated,
    /// Terminal.
    Archived,
}

impl RuleSetStatus {
    /// Lowercase label.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Active => "active",
            Self::Deprecated => "deprecated",
            Self::Archived => "archived",
        }
    }
}

/// Inputs to the ruleset state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleSetEvent {
    /// Replace content.
    Edit,
    /// Replace only the coupling matrix.
    TuneAlpha,
    /// Deploy (re-deploy when already active).
    Activate,
    /// Withdraw from service.
    Deprecate,
    /// Retire permanently.
    Archive,
}

impl RuleSetEvent {
    /// Lowercase label.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Edit => "edit",
            Self::TuneAlpha => "tune_alpha",
            Self::Activate => "activate",
            Self::Deprecate => "deprecate",
            Self::Archive => "archive",
        }
    }
}

/// Pure ruleset transition table.
pub fn transition(current: RuleSetStatus, event: RuleSetEvent) -> Result<RuleSetStatus> {
    use RuleSetEvent as E;
    use RuleSetStatus as S;
    let next = match (current, event) {
        (S::Draft, E::Edit) => S::Draft,
        (S::Draft | S::Active, E::TuneAlpha) => current,
        (S::Draft | S::Active | S::Deprecated, E::Activate) => S::Active,
        (S::Draft | S::Active, E::Deprecate) => S::Deprecated,
        (S::Draft | S::Deprecated, E::Archive) => S::Archived,
        _ => {
            return Err(CoordinationError::InvalidTransition {
                entity: "ruleset",
                from: current.label(),
                event: event.label(),
            });
        }
    };
    Ok(next)
}

/// One committed version of a ruleset lineage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleSet {
    /// Lineage id shared by all versions.
    pub id: RuleSetId,
    /// Display name.
    pub name: String,
    /// Topology whose nodes receive deployments.
    pub topology: Option<TopologyId>,
    /// Strictly increasing per lineage, starting at 1.
    pub version: u64,
    /// Signed content.
    pub content: RuleSetContent,
    /// Lifecycle status.
    pub status: RuleSetStatus,
    /// Base64 signature over the canonical content.
    pub signature: Option<String>,
    /// Signing algorithm label.
    pub signing_algorithm: String,
    /// Last recorded optimization score.
    pub performance_score: Option<f64>,
    /// Creation time of the lineage.
    pub created_at: DateTime<Utc>,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
    /// Last activation time.
    pub deployed_at: Option<DateTime<Utc>>,
}

/// Input to [`RuleSetRegistry::create`](super::RuleSetRegistry::create).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewRuleSet {
    /// Display name.
    pub name: String,
    /// Topology to deploy onto.
    pub topology: Option<TopologyId>,
    /// Initial content.
    pub content: RuleSetContent,
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn transitions_follow_lifecycle() {
        use RuleSetEvent as E;
        use RuleSetStatus as S;
        assert_eq!(transition(S::Draft, E::Activate).unwrap(), S::Active);
        assert_eq!(transition(S::Active, E::TuneAlpha).unwrap(), S::Active);
        assert_eq!(transition(S::Active, E::Deprecate).unwrap(), S::Deprecated);
        assert_eq!(transition(S::Deprecated, E::Archive).unwrap(), S::Archived);
        assert!(transition(S::Active, E::Edit).is_err());
        assert!(transition(S::Active, E::Archive).is_err());
        assert!(transition(S::Archived, E::Activate).is_err());
    }

    #[test]
    fn matrix_accessors_match_wire_names() {
        let mut matrix = CouplingMatrix::uniform(0.1);
        matrix.set(Dimension::Z, Dimension::Y, 0.9);
        assert_eq!(matrix.get(Dimension::Z, Dimension::Y), Some(0.9));
        assert_eq!(matrix.get(Dimension::X, Dimension::X), None);
        let deltas = CouplingMatrix::uniform(0.1).deltas(&matrix);
        assert_eq!(deltas.len(), 1);
        assert!((deltas["alpha_zy"] - 0.8).abs() < 1e-12);
    }

    #[test]
    fn content_rejects_bad_atoms_and_gains() {
        let mut content = RuleSetContent::uniform(&LaneRule::new("game_of_life"));
        content.validate().unwrap();
        content.lanes.y.rule = "Game Of Life".into();
        assert!(content.validate().is_err());

        let mut content = RuleSetContent::uniform(&LaneRule::new("life"));
        content.coupling.alpha_yx = 1.2;
        assert!(content.validate().is_err());
    }
}
