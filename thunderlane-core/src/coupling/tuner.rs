use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::model::CrossLaneCoupling;
use super::registry::CouplingRegistry;
use crate::config::CouplingConfig;
use crate::lane::LaneRegistry;
use crate::types::CouplingId;

/// Gain changes smaller than this are not committed.
const MIN_STEP: f64 = 1e-6;

/// Decides the next gain for a measured coupling.
pub trait AlphaPolicy: Send + Sync {
    /// Proposed gain, or `None` to leave the coupling alone.
    fn propose(&self, coupling: &CrossLaneCoupling) -> Option<f64>;
}

/// Steps the gain toward a target health in proportion to the shortfall.
///
/// A coupling below target gets a stronger gain, one above target a weaker
/// gain. The step never exceeds the coupling's adaptation rate and the result
/// is clamped to its bounds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProportionalPolicy {
    /// Health to steer toward.
    pub target_health: f64,
}

impl ProportionalPolicy {
    /// Policy from coupling configuration.
    #[must_use]
    pub const fn from_config(config: &CouplingConfig) -> Self {
        Self {
            target_health: config.target_health,
        }
    }
}

impl AlphaPolicy for ProportionalPolicy {
    fn propose(&self, coupling: &CrossLaneCoupling) -> Option<f64> {
        let health = coupling.health_score?;
        let rate = coupling.adaptation_rate;
        let step = (self.target_health - health).clamp(-rate, rate);
        let next = coupling.bounds.clamp(coupling.alpha_gain + step);
        ((next - coupling.alpha_gain).abs() > MIN_STEP).then_some(next)
    }
}

/// Counts from one tuning pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TuningReport {
    /// Couplings measured.
    pub measured: usize,
    /// Couplings whose gain changed.
    pub tuned: usize,
    /// Couplings not eligible this pass.
    pub skipped: usize,
    /// Couplings whose measurement or tuning failed.
    pub failed: usize,
}

/// Periodic measure-then-tune loop over adaptive couplings.
pub struct AdaptiveTuner {
    couplings: Arc<CouplingRegistry>,
    lanes: Arc<LaneRegistry>,
    policy: Arc<dyn AlphaPolicy>,
    interval: Duration,
}

impl AdaptiveTuner {
    /// Create a tuner; `interval` is the pass cadence for [`spawn`](Self::spawn).
    pub fn new(
        couplings: Arc<CouplingRegistry>,
        lanes: Arc<LaneRegistry>,
        policy: Arc<dyn AlphaPolicy>,
        interval: Duration,
    ) -> Self {
        Self {
            couplings,
            lanes,
            policy,
            interval,
        }
    }

    /// One pass over every adaptive, applied coupling bound to a topology.
    pub fn run_once(&self) -> TuningReport {
        let mut report = TuningReport::default();
        for id in self.couplings.ids() {
            match self.tune_one(id) {
                Ok(Some(true)) => {
                    report.measured += 1;
                    report.tuned += 1;
                }
                Ok(Some(false)) => report.measured += 1,
                Ok(None) => report.skipped += 1,
                Err(err) => {
                    report.failed += 1;
                    warn!(coupling = %id, "adaptive tuning failed: {err}");
                }
            }
        }
        debug!(?report, "tuning pass complete");
        report
    }

    fn tune_one(&self, id: CouplingId) -> crate::error::Result<Option<bool>> {
        let coupling = self.couplings.get(id)?;
        let Some(topology) = coupling.topology else {
            return Ok(None);
        };
        if !coupling.adaptive_enabled || !coupling.status.is_applied() {
            return Ok(None);
        }
        let lane = |dimension| {
            self.lanes
                .lane_for(topology, dimension)
                .and_then(|lane| self.lanes.snapshot(lane).ok())
        };
        let (Some(source), Some(target)) = (lane(coupling.source), lane(coupling.target)) else {
            return Ok(None);
        };
        if !source.status.is_live() || !target.status.is_live() {
            return Ok(None);
        }

        self.couplings.measure_from_lanes(id, &source, &target)?;
        let measured = self.couplings.get(id)?;
        match self.policy.propose(&measured) {
            Some(gain) => {
                self.couplings.tune_alpha(id, gain)?;
                Ok(Some(true))
            }
            None => Ok(Some(false)),
        }
    }

    /// Run passes every interval until `shutdown` changes.
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(interval = ?self.interval, "adaptive tuner starting");
            let mut ticker = tokio::time::interval(self.interval);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => {
                        self.run_once();
                    }
                }
            }
            info!("adaptive tuner stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::coupling::{AdaptationBounds, NewCoupling};
    use crate::events::RecordingEventBus;
    use crate::lane::{LaneStatusReport, TaskLauncher};
    use crate::topology::GridShape;
    use crate::types::{Dimension, TopologyId};

    fn coupling_with(health: f64, alpha: f64) -> CrossLaneCoupling {
        let mut new = NewCoupling::between(Dimension::X, Dimension::Y);
        new.alpha_gain = alpha;
        new.adaptation_rate = Some(0.05);
        new.bounds = Some(AdaptationBounds::new(0.2, 0.6));
        let mut coupling = CrossLaneCoupling::create(new, &CouplingConfig::default()).unwrap();
        coupling.health_score = Some(health);
        coupling
    }

    #[test]
    fn proportional_step_is_rate_limited_and_clamped() {
        let policy = ProportionalPolicy { target_health: 0.8 };
        let up = policy.propose(&coupling_with(0.2, 0.4)).unwrap();
        assert!((up - 0.45).abs() < 1e-9);
        let down = policy.propose(&coupling_with(0.79, 0.4)).unwrap();
        assert!((down - 0.41).abs() < 1e-9);
        let clamped = policy.propose(&coupling_with(0.0, 0.58)).unwrap();
        assert!((clamped - 0.6).abs() < 1e-9);
        assert!(policy.propose(&coupling_with(0.0, 0.6)).is_none());
    }

    #[test]
    fn unmeasured_coupling_is_left_alone() {
        let mut coupling = coupling_with(0.5, 0.4);
        coupling.health_score = None;
        assert!(ProportionalPolicy { target_health: 0.8 }.propose(&coupling).is_none());
    }

    #[tokio::test]
    async fn pass_tunes_adaptive_couplings_only() {
        let bus = Arc::new(RecordingEventBus::new());
        let lanes = Arc::new(LaneRegistry::new(
            Default::default(),
            Arc::new(TaskLauncher::new(8)),
            bus.clone(),
        ));
        let couplings = Arc::new(CouplingRegistry::new(CouplingConfig::default(), bus));
        let topology = TopologyId::new();
        for dimension in Dimension::ALL {
            let snapshot = lanes
                .bring_up(lanes.spec(dimension, topology, GridShape::new(2, 2, 2)))
                .await
                .unwrap();
            let coordinator = lanes.coordinator(snapshot.id).unwrap();
            coordinator
                .lock()
                .await
                .sync_status(LaneStatusReport {
                    cells_managed: 8,
                    updates_per_second: 30.0,
                    coupling_buffer_occupancy: 0.2,
                    ..LaneStatusReport::default()
                })
                .unwrap();
        }

        let mut adaptive = NewCoupling::between(Dimension::X, Dimension::Y);
        adaptive.topology = Some(topology);
        adaptive.adaptive_enabled = true;
        let adaptive = couplings.create(adaptive).unwrap().id;
        couplings.activate(adaptive).unwrap();

        let mut fixed = NewCoupling::between(Dimension::Y, Dimension::Z);
        fixed.topology = Some(topology);
        let fixed = couplings.create(fixed).unwrap().id;
        couplings.activate(fixed).unwrap();

        let tuner = AdaptiveTuner::new(
            Arc::clone(&couplings),
            lanes,
            Arc::new(ProportionalPolicy { target_health: 0.8 }),
            Duration::from_millis(10),
        );
        let report = tuner.run_once();
        assert_eq!(report.tuned, 1);
        assert_eq!(report.skipped, 1);
        let tuned = couplings.get(adaptive).unwrap();
        assert_eq!(tuned.tuning_history.len(), 1);
        assert!(tuned.alpha_gain > 0.5);
        assert!((couplings.get(fixed).unwrap().alpha_gain - 0.5).abs() < f64::EPSILON);
    }
}
