use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::{OracleFeatures, RuleOracle, RuleParameters, TrainingExample};
use crate::error::{CoordinationError, Result};
use crate::events::{EventBus, LaneEvent, names, publish_or_log};
use crate::metrics::LockFreeCounter;
use crate::types::OracleId;

/// Oracle lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OracleState {
    /// Loading; not serving.
    Initializing,
    /// Serving predictions.
    Active,
    /// Folding in new examples; predictions paused.
    Training,
    /// Failed; must be stopped and restarted.
    Error,
    /// Stopped; may restart.
    Stopped,
}

impl OracleState {
    /// Lowercase label.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::Active => "active",
            Self::Training => "training",
            Self::Error => "error",
            Self::Stopped => "stopped",
        }
    }
}

/// Inputs to the oracle state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OracleEvent {
    /// Model loaded.
    Ready,
    /// Training started.
    BeginTraining,
    /// Training finished.
    FinishTraining,
    /// Something broke.
    Fail,
    /// Operator stop.
    Stop,
    /// Start over from `initializing`.
    Restart,
}

impl OracleEvent {
    const fn label(self) -> &'static str {
        match self {
            Self::Ready => "ready",
            Self::BeginTraining => "begin_training",
            Self::FinishTraining => "finish_training",
            Self::Fail => "fail",
            Self::Stop => "stop",
            Self::Restart => "restart",
        }
    }
}

/// Pure oracle transition table.
pub fn transition(current: OracleState, event: OracleEvent) -> Result<OracleState> {
    use OracleEvent as E;
    use OracleState as S;
    match (current, event) {
        (S::Initializing, E::Ready) | (S::Training, E::FinishTraining) => Ok(S::Active),
        (S::Active, E::BeginTraining) => Ok(S::Training),
        (S::Active | S::Training, E::Fail) => Ok(S::Error),
        (S::Active | S::Training | S::Error, E::Stop) => Ok(S::Stopped),
        (S::Stopped, E::Restart) => Ok(S::Initializing),
        _ => Err(CoordinationError::InvalidTransition {
            entity: "oracle",
            from: current.label(),
            event: event.label(),
        }),
    }
}

/// Model hyperparameters reported alongside the oracle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OracleModelConfig {
    /// Feature vector width.
    pub input_size: usize,
    /// Hidden layer width.
    pub hidden_size: usize,
    /// Training batch size.
    pub batch_size: usize,
    /// Sampling temperature.
    pub temperature: f64,
}

impl Default for OracleModelConfig {
    fn default() -> Self {
        Self {
            input_size: 5,
            hidden_size: 32,
            batch_size: 16,
            temperature: 1.0,
        }
    }
}

/// Running counters snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct OracleCounters {
    /// Inferences attempted.
    pub total_inferences: u64,
    /// Failed share of inferences.
    pub error_rate: f64,
    /// Mean inference latency.
    pub avg_latency: Duration,
}

/// Owns an oracle's lifecycle and counters; every call is best-effort.
pub struct OracleService {
    id: OracleId,
    oracle: Arc<dyn RuleOracle>,
    model: OracleModelConfig,
    state: RwLock<OracleState>,
    rules: RwLock<Option<RuleParameters>>,
    total: LockFreeCounter,
    failed: LockFreeCounter,
    latency_micros: LockFreeCounter,
    bus: Arc<dyn EventBus>,
}

impl OracleService {
    /// Wrap an oracle; starts in `initializing`.
    pub fn new(oracle: Arc<dyn RuleOracle>, model: OracleModelConfig, bus: Arc<dyn EventBus>) -> Self {
        Self {
            id: OracleId::new(),
            oracle,
            model,
            state: RwLock::new(OracleState::Initializing),
            rules: RwLock::new(None),
            total: LockFreeCounter::new(),
            failed: LockFreeCounter::new(),
            latency_micros: LockFreeCounter::new(),
            bus,
        }
    }

    /// Identifier.
    #[must_use]
    pub const fn id(&self) -> OracleId {
        self.id
    }

    /// Hyperparameters.
    #[must_use]
    pub const fn model(&self) -> &OracleModelConfig {
        &self.model
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> OracleState {
        *self.state.read()
    }

    /// Apply a lifecycle event.
    pub fn apply(&self, event: OracleEvent) -> Result<OracleState> {
        let (from, to) = {
            let mut state = self.state.write();
            let from = *state;
            let to = transition(from, event)?;
            *state = to;
            (from, to)
        };
        info!(oracle = %self.id, from = from.label(), to = to.label(), "oracle transitioned");
        publish_or_log(
            self.bus.as_ref(),
            LaneEvent::new(names::ORACLE_STATE, self.id)
                .with("from", from)
                .with("state", to),
        );
        Ok(to)
    }

    /// Count one inference.
    pub fn record_inference(&self, latency: Duration, success: bool) {
        self.total.increment(1);
        if !success {
            self.failed.increment(1);
        }
        let micros = u64::try_from(latency.as_micros()).unwrap_or(u64::MAX);
        self.latency_micros.increment(micros);
    }

    /// Publish new rule parameters for consumers.
    pub fn update_rules(&self, rules: RuleParameters) {
        *self.rules.write() = Some(rules.clone());
        publish_or_log(
            self.bus.as_ref(),
            LaneEvent::new(names::ORACLE_RULES_UPDATED, self.id).with("rule_parameters", rules),
        );
    }

    /// Last published rule parameters.
    #[must_use]
    pub fn latest_rules(&self) -> Option<RuleParameters> {
        self.rules.read().clone()
    }

    /// Failed share of inferences; 0 before the first inference.
    #[must_use]
    pub fn error_rate(&self) -> f64 {
        let total = self.total.get();
        if total == 0 {
            0.0
        } else {
            self.failed.get() as f64 / total as f64
        }
    }

    /// Mean inference latency.
    #[must_use]
    pub fn avg_latency(&self) -> Duration {
        let total = self.total.get();
        if total == 0 {
            Duration::ZERO
        } else {
            Duration::from_micros(self.latency_micros.get() / total)
        }
    }

    /// Counter snapshot.
    #[must_use]
    pub fn counters(&self) -> OracleCounters {
        OracleCounters {
            total_inferences: self.total.get(),
            error_rate: self.error_rate(),
            avg_latency: self.avg_latency(),
        }
    }

    /// Ask for parameters; `None` unless active and the oracle answered.
    pub async fn predict(&self, features: &OracleFeatures) -> Option<RuleParameters> {
        if self.state() != OracleState::Active {
            return None;
        }
        let started = Instant::now();
        let outcome = self.oracle.predict(features).await;
        self.record_inference(started.elapsed(), outcome.is_ok());
        match outcome {
            Ok(rules) => {
                self.update_rules(rules.clone());
                Some(rules)
            }
            Err(err) => {
                warn!(oracle = %self.id, "oracle prediction unavailable: {err}");
                None
            }
        }
    }

    /// Train on new examples; a failure moves the oracle to `error`.
    pub async fn train(&self, examples: &[TrainingExample]) -> Option<u64> {
        if self.apply(OracleEvent::BeginTraining).is_err() {
            return None;
        }
        match self.oracle.train(examples).await {
            Ok(version) => {
                if let Err(err) = self.apply(OracleEvent::FinishTraining) {
                    warn!(oracle = %self.id, "oracle left training unexpectedly: {err}");
                }
                Some(version)
            }
            Err(err) => {
                warn!(oracle = %self.id, "oracle training failed: {err}");
                if let Err(err) = self.apply(OracleEvent::Fail) {
                    warn!(oracle = %self.id, "oracle could not record failure: {err}");
                }
                None
            }
        }
    }
}
