use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::CouplingConfig;
use crate::error::{CoordinationError, Result};
use crate::types::{CouplingId, Dimension, RuleSetId, TopologyId};

/// Closed range every committed alpha gain must stay inside.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AdaptationBounds {
    /// Lower bound.
    pub min: f64,
    /// Upper bound.
    pub max: f64,
}

impl Default for AdaptationBounds {
    fn default() -> Self {
        Self { min: 0.0, max: 1.0 }
    }
}

impl AdaptationBounds {
    /// Bounds from explicit limits.
    #[must_use]
    pub const fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    /// Reject bounds that are not an ordered sub-range of [0, 1].
    pub fn validate(&self) -> Result<()> {
        let ordered = self.min <= self.max;
        let unit = (0.0..=1.0).contains(&self.min) && (0.0..=1.0).contains(&self.max);
        if ordered && unit {
            Ok(())
        } else {
            Err(CoordinationError::validation(
                "adaptation_bounds",
                format!("[{}, {}] is not an ordered sub-range of [0, 1]", self.min, self.max),
                "0 <= min <= max <= 1",
            ))
        }
    }

    /// Whether `gain` lies inside the bounds.
    #[must_use]
    pub fn contains(&self, gain: f64) -> bool {
        (self.min..=self.max).contains(&gain)
    }

    /// Nearest gain inside the bounds.
    #[must_use]
    pub fn clamp(&self, gain: f64) -> f64 {
        gain.clamp(self.min, self.max)
    }
}

/// How the source lane's state enters the target lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CouplingType {
    /// Added to the target's local field.
    #[default]
    Additive,
    /// Scales the target's local field.
    Multiplicative,
    /// Diffuses across the shared boundary.
    Diffusive,
}

/// Transfer function applied to the source signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CouplingFunction {
    /// Identity.
    #[default]
    Linear,
    /// Logistic squashing.
    Sigmoid,
    /// Hyperbolic tangent.
    Tanh,
    /// Hard threshold at one half.
    Step,
}

/// Spatial footprint of the coupling.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SpatialKernel {
    /// Same cell only.
    #[default]
    Local,
    /// Flat kernel over a Chebyshev radius.
    Uniform {
        /// Radius in cells.
        radius: u32,
    },
    /// Gaussian falloff.
    Gaussian {
        /// Standard deviation in cells.
        sigma: f64,
    },
}

/// Coupling lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CouplingStatus {
    /// Not applied during lane execution.
    Inactive,
    /// Applied.
    Active,
    /// Applied with a gain that has not been measured yet.
    Tuning,
    /// Failed; reactivate to clear.
    Error,
}

impl CouplingStatus {
    /// Lowercase label.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Inactive => "inactive",
            Self::Active => "active",
            Self::Tuning => "tuning",
            Self::Error => "error",
        }
    }

    /// Whether lanes apply the coupling.
    #[must_use]
    pub const fn is_applied(self) -> bool {
        matches!(self, Self::Active | Self::Tuning)
    }
}

/// Inputs to the coupling state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CouplingEvent {
    /// Apply during lane execution.
    Activate,
    /// Stop applying.
    Deactivate,
    /// A new gain was committed.
    Tune,
    /// A performance sample was recorded.
    Measured,
    /// An error was recorded.
    Fail,
}

impl CouplingEvent {
    const fn label(self) -> &'static str {
        match self {
            Self::Activate => "activate",
            Self::Deactivate => "deactivate",
            Self::Tune => "tune",
            Self::Measured => "measured",
            Self::Fail => "fail",
        }
    }
}

/// Pure coupling transition table. Activation and deactivation are
/// idempotent; an errored coupling must be reactivated before tuning.
pub fn transition(current: CouplingStatus, event: CouplingEvent) -> Result<CouplingStatus> {
    use CouplingEvent as E;
    use CouplingStatus as S;
    match (current, event) {
        (S::Tuning, E::Activate | E::Tune) | (S::Active, E::Tune) => Ok(S::Tuning),
        (S::Inactive | S::Active | S::Error, E::Activate) | (S::Tuning, E::Measured) => Ok(S::Active),
        (_, E::Deactivate) => Ok(S::Inactive),
        (S::Inactive, E::Tune) => Ok(S::Inactive),
        (status, E::Measured) if status != S::Tuning => Ok(status),
        (_, E::Fail) => Ok(S::Error),
        _ => Err(CoordinationError::InvalidTransition {
            entity: "coupling",
            from: current.label(),
            event: event.label(),
        }),
    }
}

/// Discrete direction of a health signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PerformanceTrend {
    /// Getting better.
    Improving,
    /// Holding steady.
    Stable,
    /// Getting worse.
    Degrading,
    /// Not enough signal.
    Unknown,
}

impl PerformanceTrend {
    /// Classify a health score with the fixed 0.8 / 0.6 / 0.0 cutoffs.
    #[must_use]
    pub fn classify(health: f64) -> Self {
        if health > 0.8 {
            Self::Improving
        } else if health > 0.6 {
            Self::Stable
        } else if health > 0.0 {
            Self::Degrading
        } else {
            Self::Unknown
        }
    }

    /// Lowercase label.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Improving => "improving",
            Self::Stable => "stable",
            Self::Degrading => "degrading",
            Self::Unknown => "unknown",
        }
    }
}

/// One measurement of how the coupling performs.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PerformanceSample {
    /// Effective influence in [0, 1].
    pub coupling_strength: f64,
    /// Shared information in bits over binary cell states, so at most 1.
    pub mutual_information: f64,
    /// Phase agreement in [0, 1].
    pub phase_coherence: f64,
    /// Energy moved from source to target per step.
    pub energy_transfer: f64,
    /// Stability in [0, 1].
    pub stability: f64,
    /// Propagation latency.
    #[serde(with = "humantime_serde")]
    pub latency: Duration,
}

impl PerformanceSample {
    /// Mean of strength, normalised mutual information, coherence and
    /// stability, clamped to [0, 1].
    #[must_use]
    pub fn health_score(&self) -> f64 {
        let mi = self.mutual_information.clamp(0.0, 1.0);
        let mean = (self.coupling_strength + mi + self.phase_coherence + self.stability) / 4.0;
        mean.clamp(0.0, 1.0)
    }

    fn validate(&self) -> Result<()> {
        let fields = [
            ("coupling_strength", self.coupling_strength),
            ("mutual_information", self.mutual_information),
            ("phase_coherence", self.phase_coherence),
            ("energy_transfer", self.energy_transfer),
            ("stability", self.stability),
        ];
        for (field, value) in fields {
            if !value.is_finite() {
                return Err(CoordinationError::validation(
                    field,
                    format!("{value} is not finite"),
                    "a finite measurement",
                ));
            }
        }
        Ok(())
    }
}

/// Audit entry appended on every committed gain.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TuningRecord {
    /// Commit time.
    pub at: DateTime<Utc>,
    /// Gain committed.
    pub gain: f64,
}

/// Input to [`CrossLaneCoupling::create`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewCoupling {
    /// Display name; derived from the lanes when absent.
    pub name: Option<String>,
    /// Influencing lane.
    pub source: Dimension,
    /// Influenced lane.
    pub target: Dimension,
    /// Ruleset the coupling belongs to.
    pub ruleset: Option<RuleSetId>,
    /// Topology whose lanes are coupled.
    pub topology: Option<TopologyId>,
    /// Initial gain.
    pub alpha_gain: f64,
    /// Coupling type.
    pub coupling_type: CouplingType,
    /// Transfer function.
    pub coupling_function: CouplingFunction,
    /// Spatial kernel.
    pub spatial_kernel: SpatialKernel,
    /// Steps between source update and target effect.
    pub temporal_delay: u32,
    /// Steps averaged by the target.
    pub temporal_window: u32,
    /// Whether the adaptive loop tunes this coupling.
    pub adaptive_enabled: bool,
    /// Per-step gain delta for the adaptive loop; configured default when absent.
    pub adaptation_rate: Option<f64>,
    /// Gain bounds; configured default when absent.
    pub bounds: Option<AdaptationBounds>,
}

impl NewCoupling {
    /// Coupling from `source` to `target` with gain 0.5 and defaults elsewhere.
    #[must_use]
    pub const fn between(source: Dimension, target: Dimension) -> Self {
        Self {
            name: None,
            source,
            target,
            ruleset: None,
            topology: None,
            alpha_gain: 0.5,
            coupling_type: CouplingType::Additive,
            coupling_function: CouplingFunction::Linear,
            spatial_kernel: SpatialKernel::Local,
            temporal_delay: 0,
            temporal_window: 1,
            adaptive_enabled: false,
            adaptation_rate: None,
            bounds: None,
        }
    }
}

/// Directional influence of one lane on another.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrossLaneCoupling {
    /// Identifier.
    pub id: CouplingId,
    /// Display name.
    pub name: String,
    /// Influencing lane.
    pub source: Dimension,
    /// Influenced lane.
    pub target: Dimension,
    /// Owning ruleset.
    pub ruleset: Option<RuleSetId>,
    /// Topology whose lanes are coupled.
    pub topology: Option<TopologyId>,
    /// Current gain, always inside `bounds`.
    pub alpha_gain: f64,
    /// Coupling type.
    pub coupling_type: CouplingType,
    /// Transfer function.
    pub coupling_function: CouplingFunction,
    /// Spatial kernel.
    pub spatial_kernel: SpatialKernel,
    /// Steps between source update and target effect.
    pub temporal_delay: u32,
    /// Steps averaged by the target.
    pub temporal_window: u32,
    /// Whether the adaptive loop tunes this coupling.
    pub adaptive_enabled: bool,
    /// Maximum gain delta per adaptive step.
    pub adaptation_rate: f64,
    /// Gain bounds.
    pub bounds: AdaptationBounds,
    /// Last measurement.
    pub performance: Option<PerformanceSample>,
    /// Health of the last measurement.
    pub health_score: Option<f64>,
    /// Trend of the last measurement.
    pub performance_trend: PerformanceTrend,
    /// Lifecycle status.
    pub status: CouplingStatus,
    /// Every committed gain, oldest first.
    pub tuning_history: Vec<TuningRecord>,
    /// Errors recorded.
    pub error_count: u64,
    /// Last error message.
    pub last_error: Option<String>,
    /// Last error time.
    pub last_error_at: Option<DateTime<Utc>>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
}

impl CrossLaneCoupling {
    /// Validate and build an `inactive` coupling.
    pub fn create(new: NewCoupling, defaults: &CouplingConfig) -> Result<Self> {
        if new.source == new.target {
            return Err(CoordinationError::validation(
                "target",
                format!("lane {} cannot couple to itself", new.source),
                "two distinct lanes",
            ));
        }
        let bounds = new.bounds.unwrap_or(defaults.default_bounds);
        bounds.validate()?;
        let adaptation_rate = new.adaptation_rate.unwrap_or(defaults.adaptation_rate);
        if !(0.0..=1.0).contains(&adaptation_rate) {
            return Err(CoordinationError::validation(
                "adaptation_rate",
                format!("{adaptation_rate} is outside [0, 1]"),
                "a per-step gain delta between 0 and 1",
            ));
        }
        check_gain(new.alpha_gain, &bounds)?;
        if let SpatialKernel::Gaussian { sigma } = new.spatial_kernel
            && !(sigma.is_finite() && sigma > 0.0)
        {
            return Err(CoordinationError::validation(
                "spatial_kernel.sigma",
                format!("{sigma} is not a positive width"),
                "sigma > 0",
            ));
        }
        if new.temporal_window == 0 {
            return Err(CoordinationError::validation(
                "temporal_window",
                "must be at least 1",
                "a positive number of steps",
            ));
        }

        let now = Utc::now();
        let name = new
            .name
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| format!("{}_to_{}_coupling", new.source, new.target));
        Ok(Self {
            id: CouplingId::new(),
            name,
            source: new.source,
            target: new.target,
            ruleset: new.ruleset,
            topology: new.topology,
            alpha_gain: new.alpha_gain,
            coupling_type: new.coupling_type,
            coupling_function: new.coupling_function,
            spatial_kernel: new.spatial_kernel,
            temporal_delay: new.temporal_delay,
            temporal_window: new.temporal_window,
            adaptive_enabled: new.adaptive_enabled,
            adaptation_rate,
            bounds,
            performance: None,
            health_score: None,
            performance_trend: PerformanceTrend::Unknown,
            status: CouplingStatus::Inactive,
            tuning_history: Vec::new(),
            error_count: 0,
            last_error: None,
            last_error_at: None,
            created_at: now,
            updated_at: now,
        })
    }

    /// Apply during lane execution; returns whether the status changed.
    pub fn activate(&mut self) -> Result<bool> {
        self.apply(CouplingEvent::Activate)
    }

    /// Stop applying; returns whether the status changed.
    pub fn deactivate(&mut self) -> Result<bool> {
        self.apply(CouplingEvent::Deactivate)
    }

    /// Commit a new gain inside the adaptation bounds.
    pub fn tune_alpha(&mut self, gain: f64) -> Result<()> {
        check_gain(gain, &self.bounds)?;
        let next = transition(self.status, CouplingEvent::Tune)?;
        let now = Utc::now();
        self.alpha_gain = gain;
        self.status = next;
        self.tuning_history.push(TuningRecord { at: now, gain });
        self.updated_at = now;
        Ok(())
    }

    /// Record a measurement and classify its trend.
    pub fn measure_performance(&mut self, sample: PerformanceSample) -> Result<PerformanceTrend> {
        sample.validate()?;
        let next = transition(self.status, CouplingEvent::Measured)?;
        let health = sample.health_score();
        let trend = PerformanceTrend::classify(health);
        self.performance = Some(sample);
        self.health_score = Some(health);
        self.performance_trend = trend;
        self.status = next;
        self.updated_at = Utc::now();
        Ok(trend)
    }

    /// Record a failure.
    pub fn record_error(&mut self, message: impl Into<String>) {
        let now = Utc::now();
        self.status = CouplingStatus::Error;
        self.error_count += 1;
        self.last_error = Some(message.into());
        self.last_error_at = Some(now);
        self.updated_at = now;
    }

    fn apply(&mut self, event: CouplingEvent) -> Result<bool> {
        let next = transition(self.status, event)?;
        let changed = next != self.status;
        if changed {
            self.status = next;
            self.updated_at = Utc::now();
        }
        Ok(changed)
    }
}

fn check_gain(gain: f64, bounds: &AdaptationBounds) -> Result<()> {
    if !gain.is_finite() {
        return Err(CoordinationError::validation(
            "alpha_gain",
            format!("{gain} is not finite"),
            "a gain between the adaptation bounds",
        ));
    }
    if !bounds.contains(gain) {
        return Err(CoordinationError::OutOfBounds {
            value: gain,
            min: bounds.min,
            max: bounds.max,
        });
    }
    Ok(())
}
