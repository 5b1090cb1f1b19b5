use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::anneal::{AnnealOutcome, AnnealParams, MAX_MATRIX_SIZE, anneal};
use super::run::{ConsensusResult, ConsensusRun, RunStatus, TriggerReason};
use crate::config::ConsensusConfig;
use crate::error::{CoordinationError, Result};
use crate::events::{EventBus, LaneEvent, names, publish_or_log};
use crate::oracle::{OracleFeatures, OracleService};
use crate::types::{ConsensusRunId, Dimension, RuleSetId};

/// Parameters for one burst; unset overrides fall back to configuration.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ConsensusRequest {
    /// Number of spins, 1 to 10 000.
    pub matrix_size: usize,
    /// What started the burst.
    pub trigger_reason: Option<TriggerReason>,
    /// Ruleset the burst arbitrates for.
    pub ruleset: Option<RuleSetId>,
    /// Coupling J override.
    pub coupling_strength: Option<f64>,
    /// Starting temperature override; takes precedence over the oracle.
    pub initial_temperature: Option<f64>,
    /// Final temperature override.
    pub final_temperature: Option<f64>,
    /// Sweep budget override.
    pub max_steps: Option<u32>,
    /// RNG seed override.
    pub seed: Option<u64>,
    /// Per-spin local field.
    pub bias: Option<Vec<f64>>,
    /// Starting configuration, each entry +1 or -1.
    pub initial_spins: Option<Vec<i8>>,
    /// Observations handed to the oracle.
    pub features: Option<OracleFeatures>,
}

impl ConsensusRequest {
    /// Request with every override unset.
    #[must_use]
    pub fn new(matrix_size: usize, reason: TriggerReason) -> Self {
        Self {
            matrix_size,
            trigger_reason: Some(reason),
            ..Self::default()
        }
    }
}

/// Spread between the healthiest and least healthy lane.
#[must_use]
pub fn disagreement(lane_health: [f64; 3]) -> f64 {
    let max = lane_health.iter().copied().fold(f64::MIN, f64::max);
    let min = lane_health.iter().copied().fold(f64::MAX, f64::min);
    (max - min).clamp(0.0, 1.0)
}

/// Local field splitting `matrix_size` spins into x, y and z blocks.
///
/// Each block is pushed up by a healthy lane and down by an unhealthy one
/// (`h = 2 * health - 1`). Spins past the last full block get no field.
#[must_use]
pub fn lane_bias(matrix_size: usize, lane_health: [f64; 3]) -> Vec<f64> {
    let block = matrix_size / 3;
    let mut bias = vec![0.0; matrix_size];
    for dimension in Dimension::ALL {
        let field = 2.0 * lane_health[dimension.index()].clamp(0.0, 1.0) - 1.0;
        let start = dimension.index() * block;
        bias[start..start + block].fill(field);
    }
    bias
}

/// Runs annealing bursts and keeps their records.
pub struct ConsensusEngine {
    config: ConsensusConfig,
    oracle: Option<Arc<OracleService>>,
    runs: Arc<DashMap<ConsensusRunId, ConsensusRun>>,
    bus: Arc<dyn EventBus>,
}

impl ConsensusEngine {
    /// Create an engine; the oracle, when present, is consulted best-effort.
    pub fn new(
        config: ConsensusConfig,
        oracle: Option<Arc<OracleService>>,
        bus: Arc<dyn EventBus>,
    ) -> Self {
        Self {
            config,
            oracle,
            runs: Arc::new(DashMap::new()),
            bus,
        }
    }

    /// Engine configuration.
    #[must_use]
    pub const fn config(&self) -> &ConsensusConfig {
        &self.config
    }

    /// Whether current observations warrant a burst.
    ///
    /// Coupling health is checked first; `None` means no coupling has been
    /// measured yet and never triggers.
    #[must_use]
    pub fn should_trigger(
        &self,
        coupling_health: Option<f64>,
        disagreement: f64,
    ) -> Option<TriggerReason> {
        if coupling_health.is_some_and(|health| health < self.config.coupling_health_threshold) {
            Some(TriggerReason::CouplingHealth)
        } else if disagreement > self.config.disagreement_threshold {
            Some(TriggerReason::Disagreement)
        } else {
            None
        }
    }

    /// Run one burst to completion.
    ///
    /// Invalid requests are rejected before a run is recorded. A burst that
    /// exhausts its budget is returned with `success = false`. Once recorded,
    /// the burst is finished on a detached task: dropping the returned future
    /// stops waiting for it but the run still reaches a terminal status.
    pub async fn run(&self, request: ConsensusRequest) -> Result<ConsensusRun> {
        let mut params = self.resolve(&request);
        validate(&params, &request)?;

        let mut oracle_seeded = false;
        if request.initial_temperature.is_none()
            && let Some(suggested) = self.suggest_temperature(&request).await
        {
            if suggested.is_finite() && suggested > params.final_temperature {
                params.initial_temperature = suggested;
                oracle_seeded = true;
            } else {
                debug!(suggested, "ignoring oracle temperature outside the schedule");
            }
        }

        let run = ConsensusRun {
            id: ConsensusRunId::new(),
            matrix_size: params.matrix_size,
            coupling_strength: params.coupling_strength,
            initial_temperature: params.initial_temperature,
            final_temperature: params.final_temperature,
            max_steps: params.max_steps,
            trigger_reason: request.trigger_reason.unwrap_or(TriggerReason::Manual),
            seed: params.seed,
            oracle_seeded,
            ruleset: request.ruleset,
            status: RunStatus::Running,
            result: None,
            started_at: Utc::now(),
            completed_at: None,
        };
        let id = run.id;
        self.runs.insert(id, run);
        info!(
            run = %id,
            matrix_size = params.matrix_size,
            max_steps = params.max_steps,
            seed = params.seed,
            "consensus burst started"
        );

        let ConsensusRequest {
            bias, initial_spins, ..
        } = request;
        let runs = Arc::clone(&self.runs);
        let bus = Arc::clone(&self.bus);
        let burst = tokio::spawn(async move {
            let anneal_params = params.clone();
            let joined = tokio::task::spawn_blocking(move || {
                anneal(&anneal_params, bias.as_deref(), initial_spins.as_deref())
            })
            .await;
            match joined {
                Ok(outcome) => finish(&runs, bus.as_ref(), id, params.max_steps, outcome),
                Err(err) => Err(abort(&runs, id, &err.to_string())),
            }
        });

        match burst.await {
            Ok(finished) => finished,
            Err(err) => Err(abort(&self.runs, id, &err.to_string())),
        }
    }

    /// Look up a run.
    pub fn get(&self, id: ConsensusRunId) -> Result<ConsensusRun> {
        self.runs
            .get(&id)
            .map(|run| run.clone())
            .ok_or_else(|| CoordinationError::not_found("consensus run", id))
    }

    /// All runs, oldest first.
    #[must_use]
    pub fn list(&self) -> Vec<ConsensusRun> {
        let mut runs: Vec<ConsensusRun> = self.runs.iter().map(|run| run.clone()).collect();
        runs.sort_by_key(|run| (run.started_at, run.id));
        runs
    }

    fn resolve(&self, request: &ConsensusRequest) -> AnnealParams {
        let seed = request.seed.or(self.config.seed).unwrap_or_else(rand::random);
        AnnealParams {
            matrix_size: request.matrix_size,
            coupling_strength: request
                .coupling_strength
                .unwrap_or(self.config.coupling_strength),
            initial_temperature: request
                .initial_temperature
                .unwrap_or(self.config.initial_temperature),
            final_temperature: request
                .final_temperature
                .unwrap_or(self.config.final_temperature),
            max_steps: request.max_steps.unwrap_or(self.config.max_steps),
            convergence_epsilon: self.config.convergence_epsilon,
            convergence_patience: self.config.convergence_patience,
            seed,
        }
    }

    async fn suggest_temperature(&self, request: &ConsensusRequest) -> Option<f64> {
        let oracle = self.oracle.as_ref()?;
        let features = request.features?;
        oracle.predict(&features).await?.initial_temperature
    }
}

fn finish(
    runs: &DashMap<ConsensusRunId, ConsensusRun>,
    bus: &dyn EventBus,
    id: ConsensusRunId,
    max_steps: u32,
    outcome: AnnealOutcome,
) -> Result<ConsensusRun> {
    let success = outcome.converged && outcome.convergence_steps < max_steps;
    let result = ConsensusResult {
        final_energy: outcome.final_energy,
        convergence_steps: outcome.convergence_steps,
        success,
        spin_configuration: outcome.spins,
    };
    let finished = {
        let mut entry = runs
            .get_mut(&id)
            .ok_or_else(|| CoordinationError::not_found("consensus run", id))?;
        entry.status = if success {
            RunStatus::Succeeded
        } else {
            RunStatus::Failed
        };
        entry.result = Some(result);
        entry.completed_at = Some(Utc::now());
        entry.clone()
    };

    let efficiency = finished.efficiency_score();
    info!(
        run = %id,
        success,
        steps = outcome.convergence_steps,
        energy = outcome.final_energy,
        efficiency,
        "consensus burst completed"
    );
    publish_or_log(
        bus,
        LaneEvent::new(names::CONSENSUS_COMPLETED, id)
            .with("success", success)
            .with("final_energy", outcome.final_energy)
            .with("convergence_steps", outcome.convergence_steps)
            .with("efficiency_score", efficiency)
            .with("trigger_reason", finished.trigger_reason.label())
            .with("ruleset", finished.ruleset.map(|r| r.to_string())),
    );
    Ok(finished)
}

fn abort(runs: &DashMap<ConsensusRunId, ConsensusRun>, id: ConsensusRunId, reason: &str) -> CoordinationError {
    if let Some(mut run) = runs.get_mut(&id)
        && run.status == RunStatus::Running
    {
        run.status = RunStatus::Failed;
        run.completed_at = Some(Utc::now());
    }
    warn!(run = %id, "consensus burst aborted: {reason}");
    CoordinationError::Aborted {
        task: "consensus burst",
        reason: reason.to_string(),
    }
}

fn validate(params: &AnnealParams, request: &ConsensusRequest) -> Result<()> {
    let n = params.matrix_size;
    if n == 0 || n > MAX_MATRIX_SIZE {
        return Err(CoordinationError::validation(
            "matrix_size",
            format!("{n} spins requested"),
            format!("1 <= matrix_size <= {MAX_MATRIX_SIZE}"),
        ));
    }
    if !params.coupling_strength.is_finite() || params.coupling_strength < 0.0 {
        return Err(CoordinationError::validation(
            "coupling_strength",
            format!("{} is not a usable coupling", params.coupling_strength),
            "a finite value >= 0",
        ));
    }
    let (t0, t1) = (params.initial_temperature, params.final_temperature);
    if !(t0.is_finite() && t1.is_finite() && t1 > 0.0 && t0 > t1) {
        return Err(CoordinationError::validation(
            "initial_temperature",
            format!("schedule {t0} -> {t1} does not cool"),
            "initial_temperature > final_temperature > 0",
        ));
    }
    if params.max_steps == 0 {
        return Err(CoordinationError::validation(
            "max_steps",
            "budget of zero sweeps",
            "max_steps >= 1",
        ));
    }
    if let Some(bias) = &request.bias
        && (bias.len() != n || bias.iter().any(|h| !h.is_finite()))
    {
        return Err(CoordinationError::validation(
            "bias",
            format!("{} finite entries for {n} spins", bias.len()),
            "one finite field per spin",
        ));
    }
    if let Some(spins) = &request.initial_spins
        && (spins.len() != n || spins.iter().any(|&s| s != 1 && s != -1))
    {
        return Err(CoordinationError::validation(
            "initial_spins",
            format!("{} entries for {n} spins", spins.len()),
            "one entry per spin, each +1 or -1",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use async_trait::async_trait;
    use proptest::prelude::*;

    use super::*;
    use crate::error::ErrorKind;
    use crate::events::RecordingEventBus;
    use crate::oracle::{
        OracleError, OracleEvent, OracleModelConfig, RuleOracle, RuleParameters, TrainingExample,
    };

    fn engine(config: ConsensusConfig) -> (ConsensusEngine, RecordingEventBus) {
        let bus = RecordingEventBus::new();
        (ConsensusEngine::new(config, None, Arc::new(bus.clone())), bus)
    }

    fn seeded() -> ConsensusConfig {
        ConsensusConfig {
            seed: Some(11),
            ..ConsensusConfig::default()
        }
    }

    #[test]
    fn trigger_prefers_coupling_health() {
        let (engine, _) = engine(ConsensusConfig::default());
        assert_eq!(
            engine.should_trigger(Some(0.1), 0.9),
            Some(TriggerReason::CouplingHealth)
        );
        assert_eq!(
            engine.should_trigger(Some(0.9), 0.9),
            Some(TriggerReason::Disagreement)
        );
        assert_eq!(engine.should_trigger(None, 0.1), None);
    }

    #[test]
    fn lane_bias_fills_whole_blocks() {
        let bias = lane_bias(7, [1.0, 0.5, 0.0]);
        assert_eq!(bias, vec![1.0, 1.0, 0.0, 0.0, -1.0, -1.0, 0.0]);
        assert!((disagreement([0.9, 0.4, 0.6]) - 0.5).abs() < 1e-12);
    }

    #[tokio::test]
    async fn rejects_invalid_requests_without_recording() {
        let (engine, bus) = engine(seeded());
        for request in [
            ConsensusRequest::new(0, TriggerReason::Manual),
            ConsensusRequest::new(MAX_MATRIX_SIZE + 1, TriggerReason::Manual),
            ConsensusRequest {
                initial_temperature: Some(0.05),
                ..ConsensusRequest::new(9, TriggerReason::Manual)
            },
            ConsensusRequest {
                bias: Some(vec![0.0; 8]),
                ..ConsensusRequest::new(9, TriggerReason::Manual)
            },
            ConsensusRequest {
                initial_spins: Some(vec![0; 9]),
                ..ConsensusRequest::new(9, TriggerReason::Manual)
            },
            ConsensusRequest {
                max_steps: Some(0),
                ..ConsensusRequest::new(9, TriggerReason::Manual)
            },
        ] {
            let err = engine.run(request).await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Validation);
        }
        assert!(engine.list().is_empty());
        assert!(bus.events().is_empty());
    }

    #[tokio::test]
    async fn converged_burst_is_recorded_and_published() {
        let (engine, bus) = engine(seeded());
        let request = ConsensusRequest {
            initial_temperature: Some(0.5),
            initial_spins: Some(vec![1; 25]),
            bias: Some(vec![0.5; 25]),
            ..ConsensusRequest::new(25, TriggerReason::Disagreement)
        };
        let run = engine.run(request).await.unwrap();
        assert_eq!(run.status, RunStatus::Succeeded);
        assert!(run.succeeded());
        assert!(run.efficiency_score() > 0.0);
        assert_eq!(run.seed, 11);
        assert_eq!(engine.get(run.id).unwrap(), run);

        let events = bus.named(names::CONSENSUS_COMPLETED);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].fields["success"], true);
        assert_eq!(events[0].fields["trigger_reason"], "disagreement");
    }

    #[tokio::test]
    async fn exhausted_budget_is_an_outcome() {
        let (engine, _) = engine(ConsensusConfig {
            convergence_epsilon: 0.0,
            ..seeded()
        });
        let run = engine
            .run(ConsensusRequest::new(50, TriggerReason::Manual))
            .await
            .unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        let result = run.result.as_ref().unwrap();
        assert!(!result.success);
        assert_eq!(result.convergence_steps, 50);
        assert!(run.efficiency_score().abs() < f64::EPSILON);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn abandoned_burst_still_completes() {
        let (engine, bus) = engine(ConsensusConfig {
            convergence_epsilon: 0.0,
            ..seeded()
        });
        let request = ConsensusRequest {
            max_steps: Some(400),
            ..ConsensusRequest::new(MAX_MATRIX_SIZE, TriggerReason::Manual)
        };
        let abandoned =
            tokio::time::timeout(std::time::Duration::from_millis(1), engine.run(request)).await;
        assert!(abandoned.is_err(), "burst finished before the caller gave up");
        assert_eq!(engine.list().len(), 1);

        let mut run = engine.list().remove(0);
        for _ in 0..600 {
            if run.status != RunStatus::Running {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            run = engine.get(run.id).unwrap();
        }
        assert_eq!(run.status, RunStatus::Failed);
        assert!(run.completed_at.is_some());
        assert_eq!(run.result.as_ref().unwrap().convergence_steps, 400);
        assert_eq!(bus.named(names::CONSENSUS_COMPLETED).len(), 1);
    }

    struct Hot;

    #[async_trait]
    impl RuleOracle for Hot {
        async fn predict(
            &self,
            _features: &OracleFeatures,
        ) -> std::result::Result<RuleParameters, OracleError> {
            Ok(RuleParameters {
                initial_temperature: Some(2.5),
                ..RuleParameters::default()
            })
        }

        async fn train(&self, _examples: &[TrainingExample]) -> std::result::Result<u64, OracleError> {
            Ok(1)
        }
    }

    #[tokio::test]
    async fn active_oracle_seeds_the_temperature() {
        let bus = Arc::new(RecordingEventBus::new());
        let oracle = Arc::new(OracleService::new(
            Arc::new(Hot),
            OracleModelConfig::default(),
            bus.clone(),
        ));
        oracle.apply(OracleEvent::Ready).unwrap();
        let engine = ConsensusEngine::new(seeded(), Some(oracle), bus);

        let mut request = ConsensusRequest::new(16, TriggerReason::CouplingHealth);
        request.features = Some(OracleFeatures::default());
        let seeded_run = engine.run(request.clone()).await.unwrap();
        assert!(seeded_run.oracle_seeded);
        assert!((seeded_run.initial_temperature - 2.5).abs() < f64::EPSILON);

        request.initial_temperature = Some(1.2);
        let explicit = engine.run(request).await.unwrap();
        assert!(!explicit.oracle_seeded);
        assert_eq!(engine.list().len(), 2);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn efficiency_stays_in_unit_range(
            size in 1usize..64,
            steps in 1u32..40,
            seed in any::<u64>(),
            epsilon in 0.0f64..0.5,
        ) {
            let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
            let (engine, _) = engine(ConsensusConfig {
                convergence_epsilon: epsilon,
                seed: Some(seed),
                ..ConsensusConfig::default()
            });
            let request = ConsensusRequest {
                max_steps: Some(steps),
                ..ConsensusRequest::new(size, TriggerReason::Manual)
            };
            let run = runtime.block_on(engine.run(request)).unwrap();
            let efficiency = run.efficiency_score();
            prop_assert!((0.0..=1.0).contains(&efficiency));
            let result = run.result.unwrap();
            prop_assert!(result.convergence_steps <= steps);
            if !result.success {
                prop_assert!(efficiency == 0.0);
            }
        }
    }
}
