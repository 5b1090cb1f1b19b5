use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::consensus::MAX_MATRIX_SIZE;
use crate::coupling::AdaptationBounds;
use crate::error::{CoordinationError, Result};

/// Top-level configuration shared by the CLI and the runtime components.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct ThunderlaneConfig {
    /// Partitioning, distribution and rebalance tuning.
    pub topology: TopologyConfig,
    /// Lane coordinator defaults and liveness policy.
    pub lanes: LaneConfig,
    /// Cross-lane coupling defaults and adaptive loop cadence.
    pub coupling: CouplingConfig,
    /// Annealing defaults and trigger thresholds.
    pub consensus: ConsensusConfig,
    /// Health scoring and alerting thresholds.
    pub metrics: MetricsConfig,
    /// Event bus sizing.
    pub events: EventsConfig,
}

impl ThunderlaneConfig {
    /// Reject configurations whose values cannot be honoured at runtime.
    pub fn validate(&self) -> Result<()> {
        let topology = &self.topology;
        if !(0.0..=1.0).contains(&topology.rebalance_health_threshold) {
            return Err(CoordinationError::validation(
                "topology.rebalance_health_threshold",
                format!("{} is outside [0, 1]", topology.rebalance_health_threshold),
                "a fraction between 0 and 1",
            ));
        }
        if topology.rebalance_variance_threshold < 0.0 {
            return Err(CoordinationError::validation(
                "topology.rebalance_variance_threshold",
                "must not be negative",
                "a non-negative coefficient of variation",
            ));
        }
        self.coupling.default_bounds.validate()?;
        if !(0.0..=1.0).contains(&self.coupling.adaptation_rate) {
            return Err(CoordinationError::validation(
                "coupling.adaptation_rate",
                format!("{} is outside [0, 1]", self.coupling.adaptation_rate),
                "a per-step gain delta between 0 and 1",
            ));
        }
        let consensus = &self.consensus;
        if consensus.initial_temperature <= consensus.final_temperature
            || consensus.final_temperature <= 0.0
        {
            return Err(CoordinationError::validation(
                "consensus.initial_temperature",
                format!(
                    "initial {} must exceed final {} and both must be positive",
                    consensus.initial_temperature, consensus.final_temperature
                ),
                "initial_temperature > final_temperature > 0",
            ));
        }
        if !(3..=MAX_MATRIX_SIZE).contains(&consensus.matrix_size) {
            return Err(CoordinationError::validation(
                "consensus.matrix_size",
                format!("{} spins", consensus.matrix_size),
                format!("3 <= matrix_size <= {MAX_MATRIX_SIZE}, one block per lane"),
            ));
        }
        if consensus.max_steps == 0 {
            return Err(CoordinationError::validation(
                "consensus.max_steps",
                "must be at least 1",
                "a positive step budget",
            ));
        }
        if self.lanes.default_target_ups <= 0.0 {
            return Err(CoordinationError::validation(
                "lanes.default_target_ups",
                "must be positive",
                "updates per second > 0",
            ));
        }
        Ok(())
    }
}

/// Partitioning and rebalance parameters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TopologyConfig {
    /// Rebalance when distribution health drops below this value.
    pub rebalance_health_threshold: f64,
    /// Rebalance when load variance (coefficient of variation) exceeds this value.
    pub rebalance_variance_threshold: f64,
    /// Timeout for each node reachability probe during distribution.
    #[serde(with = "humantime_serde")]
    pub node_probe_timeout: Duration,
    /// Refinement passes for the `load_balanced` strategy.
    pub load_balance_iterations: usize,
    /// Hash buckets allocated per requested partition by `spatial_hash`.
    pub spatial_hash_buckets_per_partition: usize,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            rebalance_health_threshold: 0.7,
            rebalance_variance_threshold: 0.3,
            node_probe_timeout: Duration::from_millis(500),
            load_balance_iterations: 32,
            spatial_hash_buckets_per_partition: 4,
        }
    }
}

/// Lane coordinator defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LaneConfig {
    /// Heartbeat silence after which the collector flags a lane.
    #[serde(with = "humantime_serde")]
    pub heartbeat_timeout: Duration,
    /// Default updates-per-second target.
    pub default_target_ups: f64,
    /// Default latency ceiling.
    #[serde(with = "humantime_serde")]
    pub default_max_latency: Duration,
    /// Default queue ceiling.
    pub default_max_queue: usize,
    /// Buffered commands per supervised process.
    pub command_buffer: usize,
}

impl Default for LaneConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout: Duration::from_secs(10),
            default_target_ups: 60.0,
            default_max_latency: Duration::from_millis(50),
            default_max_queue: 1_024,
            command_buffer: 64,
        }
    }
}

/// Coupling defaults and adaptive loop cadence.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CouplingConfig {
    /// Bounds applied to new couplings that do not specify their own.
    pub default_bounds: AdaptationBounds,
    /// Maximum alpha delta per tuning step.
    pub adaptation_rate: f64,
    /// Cadence of the adaptive tuning loop.
    #[serde(with = "humantime_serde")]
    pub tuning_interval: Duration,
    /// Health score the default policy steers toward.
    pub target_health: f64,
}

impl Default for CouplingConfig {
    fn default() -> Self {
        Self {
            default_bounds: AdaptationBounds::default(),
            adaptation_rate: 0.05,
            tuning_interval: Duration::from_secs(5),
            target_health: 0.8,
        }
    }
}

/// Annealing defaults and trigger thresholds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConsensusConfig {
    /// Spins used by triggered bursts, split evenly across the three lanes.
    pub matrix_size: usize,
    /// Default ferromagnetic coupling strength J.
    pub coupling_strength: f64,
    /// Default starting temperature.
    pub initial_temperature: f64,
    /// Default final temperature.
    pub final_temperature: f64,
    /// Default sweep budget.
    pub max_steps: u32,
    /// Per-spin energy delta below which a sweep counts as quiet.
    pub convergence_epsilon: f64,
    /// Consecutive quiet sweeps required to declare convergence.
    pub convergence_patience: u32,
    /// Lane disagreement above which a burst is triggered.
    pub disagreement_threshold: f64,
    /// Coupling health below which a burst is triggered.
    pub coupling_health_threshold: f64,
    /// Fixed RNG seed; random when absent.
    pub seed: Option<u64>,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            matrix_size: 300,
            coupling_strength: 1.0,
            initial_temperature: 1.5,
            final_temperature: 0.1,
            max_steps: 50,
            convergence_epsilon: 1e-3,
            convergence_patience: 3,
            disagreement_threshold: 0.35,
            coupling_health_threshold: 0.4,
            seed: None,
        }
    }
}

/// Health scoring and alerting thresholds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MetricsConfig {
    /// Samples considered by the trend classifier.
    pub trend_window: usize,
    /// Alerts retained in the ring buffer.
    pub alert_history: usize,
    /// Queue occupancy ratio that raises a warning.
    pub queue_depth_alert_ratio: f64,
    /// Error rate that raises a warning.
    pub error_rate_alert: f64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            trend_window: 8,
            alert_history: 256,
            queue_depth_alert_ratio: 0.9,
            error_rate_alert: 0.05,
        }
    }
}

/// Event bus sizing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EventsConfig {
    /// Events buffered per lagging subscriber.
    pub capacity: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self { capacity: 1_024 }
    }
}
