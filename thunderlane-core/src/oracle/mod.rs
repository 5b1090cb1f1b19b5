//! Advisory rule oracle.
//!
//! An oracle predicts coupling and annealing parameters from observed lane
//! features. Every caller treats it as optional: errors fall back to static
//! defaults and never fail the surrounding operation.

/// Lifecycle owner and running counters for an oracle.
pub mod service;

use std::cmp::Ordering;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ruleset::CouplingMatrix;

pub use service::{
    OracleCounters, OracleEvent, OracleModelConfig, OracleService, OracleState, transition,
};

/// Observations fed to [`RuleOracle::predict`].
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct OracleFeatures {
    /// Mean coupling health in [0, 1].
    pub coupling_health: f64,
    /// Lane disagreement in [0, 1].
    pub disagreement: f64,
    /// Per-lane health scores in x, y, z order.
    pub lane_health: [f64; 3],
}

impl OracleFeatures {
    fn distance(&self, other: &Self) -> f64 {
        let mut sum = (self.coupling_health - other.coupling_health).powi(2)
            + (self.disagreement - other.disagreement).powi(2);
        for (a, b) in self.lane_health.iter().zip(other.lane_health) {
            sum += (a - b).powi(2);
        }
        sum.sqrt()
    }
}

/// Suggested parameters; any field may be absent.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RuleParameters {
    /// Suggested coupling matrix.
    pub coupling: Option<CouplingMatrix>,
    /// Suggested starting temperature for consensus.
    pub initial_temperature: Option<f64>,
    /// Confidence in [0, 1].
    pub confidence: f64,
}

/// One scored observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingExample {
    /// Context the coupling ran under, when known.
    pub features: Option<OracleFeatures>,
    /// Coupling that was in effect.
    pub coupling: CouplingMatrix,
    /// Achieved score in [0, 1].
    pub score: f64,
}

/// Oracle failures; callers log and fall back.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum OracleError {
    /// The oracle cannot serve requests right now.
    #[error("oracle unavailable: {0}")]
    Unavailable(String),
    /// No examples have been recorded yet.
    #[error("oracle has no training data")]
    Untrained,
}

/// Predicts rule/coupling parameters.
#[async_trait]
pub trait RuleOracle: Send + Sync {
    /// Suggest parameters for the observed features.
    async fn predict(&self, features: &OracleFeatures) -> Result<RuleParameters, OracleError>;

    /// Fold new examples into the model; returns the new model version.
    async fn train(&self, examples: &[TrainingExample]) -> Result<u64, OracleError>;
}

/// Oracle that has nothing to say.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullOracle;

#[async_trait]
impl RuleOracle for NullOracle {
    async fn predict(&self, _features: &OracleFeatures) -> Result<RuleParameters, OracleError> {
        Ok(RuleParameters::default())
    }

    async fn train(&self, _examples: &[TrainingExample]) -> Result<u64, OracleError> {
        Ok(0)
    }
}

const HISTORY_LIMIT: usize = 512;
const NEIGHBOURS: usize = 3;

/// Nearest-neighbour oracle over recorded examples.
///
/// Predictions blend the couplings of the best scoring examples, weighting
/// each by `score / (1 + distance)` when both sides carry features.
#[derive(Debug, Default)]
pub struct HistoryOracle {
    examples: RwLock<Vec<TrainingExample>>,
    version: RwLock<u64>,
}

impl HistoryOracle {
    /// Empty oracle.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of retained examples.
    #[must_use]
    pub fn len(&self) -> usize {
        self.examples.read().len()
    }

    /// Whether no examples are retained.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.examples.read().is_empty()
    }
}

#[async_trait]
impl RuleOracle for HistoryOracle {
    async fn predict(&self, features: &OracleFeatures) -> Result<RuleParameters, OracleError> {
        let examples = self.examples.read();
        if examples.is_empty() {
            return Err(OracleError::Untrained);
        }
        let mut weighted: Vec<(f64, &TrainingExample)> = examples
            .iter()
            .map(|example| {
                let distance = example
                    .features
                    .as_ref()
                    .map_or(0.0, |known| known.distance(features));
                (example.score.max(0.0) / (1.0 + distance), example)
            })
            .collect();
        weighted.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(Ordering::Equal));
        weighted.truncate(NEIGHBOURS);

        let total: f64 = weighted.iter().map(|(w, _)| w).sum();
        if total <= f64::EPSILON {
            return Err(OracleError::Untrained);
        }
        let coupling = CouplingMatrix::from_fn(|source, target| {
            weighted
                .iter()
                .map(|(w, ex)| w * ex.coupling.get(source, target).unwrap_or(0.0))
                .sum::<f64>()
                / total
        });
        let confidence = (total / weighted.len() as f64).clamp(0.0, 1.0);
        // Hot lanes settle from a higher starting temperature.
        let initial_temperature = 1.0 + features.disagreement.clamp(0.0, 1.0);
        Ok(RuleParameters {
            coupling: Some(coupling),
            initial_temperature: Some(initial_temperature),
            confidence,
        })
    }

    async fn train(&self, examples: &[TrainingExample]) -> Result<u64, OracleError> {
        let mut stored = self.examples.write();
        stored.extend(examples.iter().cloned());
        let overflow = stored.len().saturating_sub(HISTORY_LIMIT);
        stored.drain(..overflow);
        drop(stored);
        let mut version = self.version.write();
        *version += 1;
        Ok(*version)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    fn example(alpha: f64, score: f64, coupling_health: f64) -> TrainingExample {
        TrainingExample {
            features: Some(OracleFeatures {
                coupling_health,
                ..OracleFeatures::default()
            }),
            coupling: CouplingMatrix::uniform(alpha),
            score,
        }
    }

    #[tokio::test]
    async fn history_oracle_prefers_high_scores() {
        let oracle = HistoryOracle::new();
        assert_eq!(
            oracle.predict(&OracleFeatures::default()).await,
            Err(OracleError::Untrained)
        );
        let version = oracle
            .train(&[example(0.2, 0.1, 0.5), example(0.8, 0.9, 0.5)])
            .await
            .unwrap();
        assert_eq!(version, 1);
        let prediction = oracle
            .predict(&OracleFeatures {
                coupling_health: 0.5,
                ..OracleFeatures::default()
            })
            .await
            .unwrap();
        let alpha = prediction.coupling.unwrap().alpha_xy;
        assert!(alpha > 0.6 && alpha <= 0.8, "{alpha}");
    }

    #[tokio::test]
    async fn null_oracle_predicts_nothing() {
        let prediction = NullOracle.predict(&OracleFeatures::default()).await.unwrap();
        assert!(prediction.coupling.is_none());
        assert!(prediction.initial_temperature.is_none());
    }
}
