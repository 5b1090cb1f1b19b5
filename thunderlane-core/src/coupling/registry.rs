use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use tracing::{info, warn};

use super::model::{CrossLaneCoupling, NewCoupling, PerformanceSample, PerformanceTrend};
use crate::config::CouplingConfig;
use crate::error::{CoordinationError, Result};
use crate::events::{EventBus, LaneEvent, names, publish_or_log};
use crate::lane::LaneSnapshot;
use crate::ruleset::CouplingMatrix;
use crate::types::{CouplingId, Dimension, RuleSetId};

type CouplingKey = (Dimension, Dimension, Option<RuleSetId>);

/// Couplings keyed by id, unique per (source, target, ruleset).
pub struct CouplingRegistry {
    couplings: DashMap<CouplingId, Arc<Mutex<CrossLaneCoupling>>>,
    keys: DashMap<CouplingKey, CouplingId>,
    bus: Arc<dyn EventBus>,
    config: CouplingConfig,
}

impl CouplingRegistry {
    /// Create an empty registry.
    pub fn new(config: CouplingConfig, bus: Arc<dyn EventBus>) -> Self {
        Self {
            couplings: DashMap::new(),
            keys: DashMap::new(),
            bus,
            config,
        }
    }

    /// Configured defaults.
    #[must_use]
    pub const fn config(&self) -> &CouplingConfig {
        &self.config
    }

    /// Create an `inactive` coupling.
    pub fn create(&self, new: NewCoupling) -> Result<CrossLaneCoupling> {
        let coupling = CrossLaneCoupling::create(new, &self.config)?;
        let key = (coupling.source, coupling.target, coupling.ruleset);
        match self.keys.entry(key) {
            Entry::Occupied(existing) => {
                return Err(CoordinationError::Conflict {
                    entity: "coupling",
                    detail: format!(
                        "{} -> {} already coupled by {}",
                        coupling.source,
                        coupling.target,
                        existing.get()
                    ),
                });
            }
            Entry::Vacant(slot) => {
                slot.insert(coupling.id);
            }
        }
        self.couplings
            .insert(coupling.id, Arc::new(Mutex::new(coupling.clone())));
        info!(coupling = %coupling.id, name = %coupling.name, "coupling created");
        Ok(coupling)
    }

    /// Current record.
    pub fn get(&self, id: CouplingId) -> Result<CrossLaneCoupling> {
        Ok(self.entry(id)?.lock().clone())
    }

    /// All records, oldest first.
    #[must_use]
    pub fn list(&self) -> Vec<CrossLaneCoupling> {
        let mut all: Vec<CrossLaneCoupling> = self
            .couplings
            .iter()
            .map(|entry| entry.value().lock().clone())
            .collect();
        all.sort_by_key(|coupling| (coupling.created_at, coupling.source, coupling.target));
        all
    }

    /// Records belonging to a ruleset.
    #[must_use]
    pub fn for_ruleset(&self, ruleset: RuleSetId) -> Vec<CrossLaneCoupling> {
        self.list()
            .into_iter()
            .filter(|coupling| coupling.ruleset == Some(ruleset))
            .collect()
    }

    /// Apply during lane execution. Idempotent.
    pub fn activate(&self, id: CouplingId) -> Result<CrossLaneCoupling> {
        let record = self.entry(id)?;
        let mut coupling = record.lock();
        if coupling.activate()? {
            info!(coupling = %id, "coupling activated");
            publish_or_log(
                self.bus.as_ref(),
                LaneEvent::new(names::COUPLING_ACTIVATED, id).with("status", coupling.status),
            );
        }
        Ok(coupling.clone())
    }

    /// Stop applying. Idempotent.
    pub fn deactivate(&self, id: CouplingId) -> Result<CrossLaneCoupling> {
        let record = self.entry(id)?;
        let mut coupling = record.lock();
        if coupling.deactivate()? {
            info!(coupling = %id, "coupling deactivated");
            publish_or_log(
                self.bus.as_ref(),
                LaneEvent::new(names::COUPLING_DEACTIVATED, id).with("status", coupling.status),
            );
        }
        Ok(coupling.clone())
    }

    /// Commit a new gain; rejected with `OutOfBounds` outside the bounds.
    pub fn tune_alpha(&self, id: CouplingId, gain: f64) -> Result<CrossLaneCoupling> {
        let record = self.entry(id)?;
        let mut coupling = record.lock();
        let previous = coupling.alpha_gain;
        coupling.tune_alpha(gain)?;
        info!(coupling = %id, previous, gain, "coupling tuned");
        publish_or_log(
            self.bus.as_ref(),
            LaneEvent::new(names::COUPLING_TUNED, id)
                .with("source", coupling.source)
                .with("target", coupling.target)
                .with("previous", previous)
                .with("alpha_gain", gain),
        );
        Ok(coupling.clone())
    }

    /// Record a measurement.
    pub fn measure_performance(&self, id: CouplingId, sample: PerformanceSample) -> Result<PerformanceTrend> {
        let record = self.entry(id)?;
        let mut coupling = record.lock();
        let trend = coupling.measure_performance(sample)?;
        publish_or_log(
            self.bus.as_ref(),
            LaneEvent::new(names::COUPLING_MEASURED, id)
                .with("health", coupling.health_score)
                .with("trend", trend)
                .with("energy_transfer", sample.energy_transfer),
        );
        Ok(trend)
    }

    /// Measure from the two lanes' published snapshots.
    ///
    /// Strength is the gain scaled by how closely the lanes' health agrees.
    /// Mutual information is the shared coupling buffer traffic, coherence the
    /// agreement of their throughput ratios, energy transfer the gain applied
    /// to the source buffer, and stability decays with recorded lane errors.
    pub fn measure_from_lanes(
        &self,
        id: CouplingId,
        source: &LaneSnapshot,
        target: &LaneSnapshot,
    ) -> Result<PerformanceTrend> {
        let sample = {
            let record = self.entry(id)?;
            let coupling = record.lock();
            if source.dimension != coupling.source || target.dimension != coupling.target {
                return Err(CoordinationError::validation(
                    "lanes",
                    format!(
                        "got {} -> {} for a {} -> {} coupling",
                        source.dimension, target.dimension, coupling.source, coupling.target
                    ),
                    "snapshots of the coupled source and target lanes",
                ));
            }
            if !source.status.is_live() || !target.status.is_live() {
                return Err(CoordinationError::validation(
                    "lanes",
                    format!("lanes are {} and {}", source.status.label(), target.status.label()),
                    "both lanes running",
                ));
            }
            sample_between(coupling.alpha_gain, source, target)
        };
        self.measure_performance(id, sample)
    }

    /// Record a failure.
    pub fn record_error(&self, id: CouplingId, message: &str) -> Result<CrossLaneCoupling> {
        let record = self.entry(id)?;
        let mut coupling = record.lock();
        coupling.record_error(message);
        warn!(coupling = %id, errors = coupling.error_count, "coupling error: {message}");
        publish_or_log(
            self.bus.as_ref(),
            LaneEvent::new(names::COUPLING_ERROR, id)
                .with("message", message)
                .with("error_count", coupling.error_count),
        );
        Ok(coupling.clone())
    }

    /// Coupling matrix from a ruleset's applied couplings, starting from `base`.
    #[must_use]
    pub fn matrix_for(&self, ruleset: RuleSetId, base: CouplingMatrix) -> CouplingMatrix {
        let mut matrix = base;
        for coupling in self.for_ruleset(ruleset) {
            if coupling.status.is_applied() {
                matrix.set(coupling.source, coupling.target, coupling.alpha_gain);
            }
        }
        matrix
    }

    /// Mean health of measured, applied couplings; `None` before any measurement.
    #[must_use]
    pub fn mean_health(&self, ruleset: Option<RuleSetId>) -> Option<f64> {
        let scores: Vec<f64> = self
            .list()
            .into_iter()
            .filter(|coupling| ruleset.is_none_or(|id| coupling.ruleset == Some(id)))
            .filter(|coupling| coupling.status.is_applied())
            .filter_map(|coupling| coupling.health_score)
            .collect();
        if scores.is_empty() {
            None
        } else {
            Some(scores.iter().sum::<f64>() / scores.len() as f64)
        }
    }

    pub(crate) fn ids(&self) -> Vec<CouplingId> {
        self.couplings.iter().map(|entry| *entry.key()).collect()
    }

    fn entry(&self, id: CouplingId) -> Result<Arc<Mutex<CrossLaneCoupling>>> {
        self.couplings
            .get(&id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| CoordinationError::not_found("coupling", id))
    }
}

fn sample_between(alpha: f64, source: &LaneSnapshot, target: &LaneSnapshot) -> PerformanceSample {
    let ratio = |lane: &LaneSnapshot| {
        (lane.metrics.updates_per_second / lane.limits.target_ups).clamp(0.0, 1.0)
    };
    let agreement = 1.0 - (source.health_score() - target.health_score()).abs();
    let src = &source.metrics;
    let dst = &target.metrics;
    PerformanceSample {
        coupling_strength: (alpha * agreement).clamp(0.0, 1.0),
        mutual_information: src.coupling_buffer_occupancy.min(dst.coupling_buffer_occupancy),
        phase_coherence: 1.0 - (ratio(source) - ratio(target)).abs(),
        energy_transfer: alpha * src.coupling_buffer_occupancy,
        stability: 1.0 / (1.0 + (src.error_count + dst.error_count) as f64),
        latency: src.latency.max(dst.latency),
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use std::time::Duration;

    use super::*;
    use crate::coupling::CouplingStatus;
    use crate::events::RecordingEventBus;
    use crate::lane::{LaneLimits, LaneRuntimeMetrics, LaneStatus};
    use crate::types::{LaneId, TopologyId};

    fn registry() -> (CouplingRegistry, RecordingEventBus) {
        let bus = RecordingEventBus::new();
        (
            CouplingRegistry::new(CouplingConfig::default(), Arc::new(bus.clone())),
            bus,
        )
    }

    fn lane(dimension: Dimension, ups: f64, occupancy: f64) -> LaneSnapshot {
        LaneSnapshot {
            id: LaneId::new(),
            dimension,
            topology: TopologyId::new(),
            status: LaneStatus::Active,
            rules: None,
            metrics: LaneRuntimeMetrics {
                cells_managed: 8,
                updates_per_second: ups,
                latency: Duration::from_millis(5),
                queue_depth: 0,
                dropped_events: 0,
                coupling_buffer_occupancy: occupancy,
                error_count: 0,
            },
            limits: LaneLimits {
                target_ups: 60.0,
                max_latency: Duration::from_millis(50),
                max_queue: 100,
            },
            last_heartbeat_at: None,
            last_sync_at: None,
            last_error: None,
            drained: false,
            created_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn duplicate_pair_conflicts_per_ruleset() {
        let (registry, _) = registry();
        let ruleset = RuleSetId::new();
        let mut new = NewCoupling::between(Dimension::X, Dimension::Y);
        new.ruleset = Some(ruleset);
        registry.create(new.clone()).unwrap();
        let err = registry.create(new.clone()).unwrap_err();
        assert!(matches!(err, CoordinationError::Conflict { entity: "coupling", .. }));

        new.ruleset = Some(RuleSetId::new());
        registry.create(new).unwrap();
        registry
            .create(NewCoupling::between(Dimension::Y, Dimension::X))
            .unwrap();
        assert_eq!(registry.list().len(), 3);
    }

    #[test]
    fn repeated_activation_publishes_once() {
        let (registry, bus) = registry();
        let id = registry
            .create(NewCoupling::between(Dimension::X, Dimension::Z))
            .unwrap()
            .id;
        registry.activate(id).unwrap();
        let again = registry.activate(id).unwrap();
        assert_eq!(again.status, CouplingStatus::Active);
        assert_eq!(bus.named(names::COUPLING_ACTIVATED).len(), 1);
    }

    #[test]
    fn aligned_lanes_measure_healthy() {
        let (registry, bus) = registry();
        let mut new = NewCoupling::between(Dimension::X, Dimension::Y);
        new.alpha_gain = 1.0;
        let id = registry.create(new).unwrap().id;
        registry.activate(id).unwrap();
        let trend = registry
            .measure_from_lanes(id, &lane(Dimension::X, 60.0, 0.9), &lane(Dimension::Y, 60.0, 0.9))
            .unwrap();
        // strength 1, mi 0.9, coherence 1, stability 1
        assert_eq!(trend, PerformanceTrend::Improving);
        let health = registry.get(id).unwrap().health_score.unwrap();
        assert!((health - 0.975).abs() < 1e-9);
        assert_eq!(registry.mean_health(None), Some(health));
        assert_eq!(bus.named(names::COUPLING_MEASURED).len(), 1);
    }

    #[test]
    fn swapped_lanes_are_rejected() {
        let (registry, _) = registry();
        let id = registry
            .create(NewCoupling::between(Dimension::X, Dimension::Y))
            .unwrap()
            .id;
        let result = registry.measure_from_lanes(
            id,
            &lane(Dimension::Y, 60.0, 0.5),
            &lane(Dimension::X, 60.0, 0.5),
        );
        assert!(result.is_err());
    }

    #[test]
    fn matrix_picks_up_applied_gains() {
        let (registry, _) = registry();
        let ruleset = RuleSetId::new();
        let mut new = NewCoupling::between(Dimension::Z, Dimension::X);
        new.ruleset = Some(ruleset);
        let id = registry.create(new).unwrap().id;
        registry.activate(id).unwrap();
        registry.tune_alpha(id, 0.9).unwrap();
        let matrix = registry.matrix_for(ruleset, CouplingMatrix::uniform(0.5));
        assert_eq!(matrix.get(Dimension::Z, Dimension::X), Some(0.9));
        assert_eq!(matrix.get(Dimension::X, Dimension::Z), Some(0.5));
    }
}
