use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedRwLockReadGuard, RwLock, watch};
use tracing::{info, warn};

use super::process::{ComputeProcess, LaneLaunch, ProcessLauncher, RuleUpdate};
use super::state::{LaneStatus, LaneTransition, transition};
use crate::config::LaneConfig;
use crate::error::{CoordinationError, Result};
use crate::events::{EventBus, LaneEvent, names, publish_or_log};
use crate::ruleset::{RuleSet, RuleSetStatus};
use crate::topology::GridShape;
use crate::types::{Dimension, LaneId, RuleSetId, TopologyId};

/// Throughput targets a lane is measured against.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LaneLimits {
    /// Target updates per second.
    pub target_ups: f64,
    /// Latency ceiling.
    #[serde(with = "humantime_serde")]
    pub max_latency: Duration,
    /// Queue ceiling.
    pub max_queue: usize,
}

impl LaneLimits {
    /// Defaults from configuration.
    #[must_use]
    pub const fn from_config(config: &LaneConfig) -> Self {
        Self {
            target_ups: config.default_target_ups,
            max_latency: config.default_max_latency,
            max_queue: config.default_max_queue,
        }
    }

    fn validate(&self) -> Result<()> {
        if !self.target_ups.is_finite() || self.target_ups <= 0.0 {
            return Err(CoordinationError::validation(
                "target_ups",
                format!("{} is not a positive rate", self.target_ups),
                "updates per second > 0",
            ));
        }
        if self.max_latency.is_zero() {
            return Err(CoordinationError::validation(
                "max_latency",
                "must be non-zero",
                "a positive latency ceiling",
            ));
        }
        if self.max_queue == 0 {
            return Err(CoordinationError::validation(
                "max_queue",
                "must be at least 1",
                "a positive queue ceiling",
            ));
        }
        Ok(())
    }
}

/// What to bring up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaneSpec {
    /// Axis.
    pub dimension: Dimension,
    /// Topology the lane is bound to.
    pub topology: TopologyId,
    /// Grid extents of that topology.
    pub shape: GridShape,
    /// Throughput targets.
    pub limits: LaneLimits,
}

/// Runtime metrics written only by the owning coordinator.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LaneRuntimeMetrics {
    /// Cells the lane processes.
    pub cells_managed: u64,
    /// Measured update rate.
    pub updates_per_second: f64,
    /// Measured step latency.
    #[serde(with = "humantime_serde")]
    pub latency: Duration,
    /// Work units waiting.
    pub queue_depth: usize,
    /// Events dropped since the last sync.
    pub dropped_events: u64,
    /// Occupancy of the inter-lane coupling buffer in [0, 1].
    pub coupling_buffer_occupancy: f64,
    /// Process failures recorded.
    pub error_count: u64,
}

/// Periodic status reported by a lane process.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LaneStatusReport {
    /// Cells the lane processes.
    pub cells_managed: u64,
    /// Measured update rate.
    pub updates_per_second: f64,
    /// Measured step latency.
    #[serde(with = "humantime_serde")]
    pub latency: Duration,
    /// Work units waiting.
    pub queue_depth: usize,
    /// Events dropped since the last sync.
    pub dropped_events: u64,
    /// Coupling buffer occupancy in [0, 1].
    pub coupling_buffer_occupancy: f64,
}

/// Ruleset version a lane runs.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ActiveRules {
    /// Ruleset id.
    pub ruleset: RuleSetId,
    /// Version applied.
    pub version: u64,
    /// When it was applied.
    pub applied_at: DateTime<Utc>,
}

/// Read-only view of a coordinator, published after every change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaneSnapshot {
    /// Lane id.
    pub id: LaneId,
    /// Axis.
    pub dimension: Dimension,
    /// Bound topology.
    pub topology: TopologyId,
    /// Lifecycle status.
    pub status: LaneStatus,
    /// Rules in effect.
    pub rules: Option<ActiveRules>,
    /// Runtime metrics.
    pub metrics: LaneRuntimeMetrics,
    /// Throughput targets.
    pub limits: LaneLimits,
    /// Last liveness ping.
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    /// Last status ingestion.
    pub last_sync_at: Option<DateTime<Utc>>,
    /// Last recorded failure.
    pub last_error: Option<String>,
    /// Set by `drain`, cleared when the lane consumes work again.
    pub drained: bool,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl LaneSnapshot {
    /// Health in [0, 1]: mean of throughput, latency, queue headroom and error
    /// scores. Lanes without a live process score 0.
    #[must_use]
    pub fn health_score(&self) -> f64 {
        if !self.status.is_live() {
            return 0.0;
        }
        let metrics = &self.metrics;
        let throughput = (metrics.updates_per_second / self.limits.target_ups).clamp(0.0, 1.0);
        let latency = if metrics.latency <= self.limits.max_latency {
            1.0
        } else {
            self.limits.max_latency.as_secs_f64() / metrics.latency.as_secs_f64()
        };
        let queue = 1.0 - (metrics.queue_depth as f64 / self.limits.max_queue as f64).min(1.0);
        let errors = 1.0 / (1.0 + metrics.error_count as f64);
        ((throughput + latency + queue + errors) / 4.0).clamp(0.0, 1.0)
    }

    /// Whether the lane no longer consumes cells of its topology.
    #[must_use]
    pub const fn is_quiesced(&self) -> bool {
        self.drained || !matches!(self.status, LaneStatus::Active)
    }
}

/// Shared by the lanes of one topology. Held for writing while the
/// topology's partitions move; resuming a lane needs a read share.
pub type RebalanceFence = Arc<RwLock<()>>;

#[derive(Debug, Clone, Copy)]
enum Signal {
    Pause,
    Resume,
}

/// Owns one lane's lifecycle and its supervised process.
///
/// Only the coordinator writes its runtime metrics. Readers subscribe to the
/// snapshot channel returned by [`LaneCoordinator::subscribe`].
pub struct LaneCoordinator {
    state: LaneSnapshot,
    process: Option<Box<dyn ComputeProcess>>,
    snapshots: watch::Sender<LaneSnapshot>,
    bus: Arc<dyn EventBus>,
    fence: RebalanceFence,
}

impl LaneCoordinator {
    /// Allocate a coordinator and start its process.
    ///
    /// Only invalid limits are returned as errors. A launch failure leaves the
    /// coordinator in `error` with the cause recorded.
    pub async fn create(
        spec: LaneSpec,
        launcher: &dyn ProcessLauncher,
        bus: Arc<dyn EventBus>,
    ) -> Result<Self> {
        Self::create_with_id(LaneId::new(), spec, launcher, bus, RebalanceFence::default()).await
    }

    pub(crate) async fn create_with_id(
        id: LaneId,
        spec: LaneSpec,
        launcher: &dyn ProcessLauncher,
        bus: Arc<dyn EventBus>,
        fence: RebalanceFence,
    ) -> Result<Self> {
        spec.limits.validate()?;
        let state = LaneSnapshot {
            id,
            dimension: spec.dimension,
            topology: spec.topology,
            status: LaneStatus::Initializing,
            rules: None,
            metrics: LaneRuntimeMetrics {
                cells_managed: spec.shape.cell_count(),
                ..LaneRuntimeMetrics::default()
            },
            limits: spec.limits,
            last_heartbeat_at: None,
            last_sync_at: None,
            last_error: None,
            drained: false,
            created_at: Utc::now(),
        };
        let (snapshots, _rx) = watch::channel(state.clone());
        let mut coordinator = Self {
            state,
            process: None,
            snapshots,
            bus,
            fence,
        };

        let launch = LaneLaunch {
            lane: id,
            dimension: spec.dimension,
            topology: spec.topology,
            shape: spec.shape,
        };
        match launcher.launch(&launch).await {
            Ok(process) => {
                coordinator.process = Some(process);
                coordinator.state.status = transition(LaneStatus::Initializing, LaneTransition::Started)?;
                coordinator.state.last_heartbeat_at = Some(Utc::now());
                info!(lane = %id, dimension = %spec.dimension, topology = %spec.topology, "lane active");
                coordinator.publish(LaneEvent::new(names::LANE_ACTIVATED, id).with("status", LaneStatus::Active));
            }
            Err(err) => {
                let _ = coordinator.fail(format!("launch failed: {err}"));
            }
        }
        Ok(coordinator)
    }

    /// Lane id.
    #[must_use]
    pub const fn id(&self) -> LaneId {
        self.state.id
    }

    /// Current state.
    #[must_use]
    pub const fn snapshot(&self) -> &LaneSnapshot {
        &self.state
    }

    /// Receive every published snapshot.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<LaneSnapshot> {
        self.snapshots.subscribe()
    }

    /// Hot-swap the lane's rules to an active ruleset.
    pub async fn coordinate(&mut self, ruleset: &RuleSet) -> Result<()> {
        if ruleset.status != RuleSetStatus::Active {
            return Err(CoordinationError::InvalidRuleSet {
                id: ruleset.id,
                version: ruleset.version,
                status: ruleset.status.label().to_string(),
                expected: "active",
            });
        }
        self.require_live("coordinate")?;
        let update = RuleUpdate {
            ruleset: ruleset.id,
            version: ruleset.version,
            rule: ruleset.content.lanes.get(self.state.dimension).clone(),
            coupling: ruleset.content.coupling,
        };
        let outcome = match self.process.as_deref() {
            Some(process) => process.apply_rules(update).await,
            None => return Err(self.missing_process()),
        };
        if let Err(err) = outcome {
            return Err(self.fail(format!("rule swap failed: {err}")));
        }
        self.state.rules = Some(ActiveRules {
            ruleset: ruleset.id,
            version: ruleset.version,
            applied_at: Utc::now(),
        });
        info!(lane = %self.state.id, ruleset = %ruleset.id, version = ruleset.version, "lane rules applied");
        self.publish(
            LaneEvent::new(names::LANE_RULES_APPLIED, self.state.id)
                .with("ruleset", ruleset.id)
                .with("version", ruleset.version),
        );
        Ok(())
    }

    /// Ingest a periodic status report.
    pub fn sync_status(&mut self, report: LaneStatusReport) -> Result<()> {
        if self.state.status == LaneStatus::Shutdown {
            return Err(self.rejected("sync_status"));
        }
        if !report.updates_per_second.is_finite() || report.updates_per_second < 0.0 {
            return Err(CoordinationError::validation(
                "updates_per_second",
                format!("{} is not a rate", report.updates_per_second),
                "a finite non-negative rate",
            ));
        }
        if !(0.0..=1.0).contains(&report.coupling_buffer_occupancy) {
            return Err(CoordinationError::validation(
                "coupling_buffer_occupancy",
                format!("{} is outside [0, 1]", report.coupling_buffer_occupancy),
                "an occupancy fraction",
            ));
        }
        let error_count = self.state.metrics.error_count;
        self.state.metrics = LaneRuntimeMetrics {
            cells_managed: report.cells_managed,
            updates_per_second: report.updates_per_second,
            latency: report.latency,
            queue_depth: report.queue_depth,
            dropped_events: report.dropped_events,
            coupling_buffer_occupancy: report.coupling_buffer_occupancy,
            error_count,
        };
        self.state.last_sync_at = Some(Utc::now());
        let health = self.state.health_score();
        self.publish(
            LaneEvent::new(names::LANE_SYNCED, self.state.id)
                .with("dimension", self.state.dimension)
                .with("updates_per_second", report.updates_per_second)
                .with("queue_depth", report.queue_depth)
                .with("max_queue", self.state.limits.max_queue)
                .with("dropped_events", report.dropped_events)
                .with("health", health),
        );
        Ok(())
    }

    /// Liveness ping.
    pub fn heartbeat(&mut self) -> Result<()> {
        if self.state.status == LaneStatus::Shutdown {
            return Err(self.rejected("heartbeat"));
        }
        let now = Utc::now();
        self.state.last_heartbeat_at = Some(now);
        self.publish(LaneEvent::new(names::LANE_HEARTBEAT, self.state.id).with("at", now));
        Ok(())
    }

    /// Stop consuming work, keeping state.
    pub async fn pause(&mut self) -> Result<()> {
        let next = transition(self.state.status, LaneTransition::Pause)?;
        self.signal("pause", Signal::Pause).await?;
        self.state.status = next;
        info!(lane = %self.state.id, "lane paused");
        self.publish(LaneEvent::new(names::LANE_PAUSED, self.state.id).with("drained", false));
        Ok(())
    }

    /// Consume work again.
    ///
    /// Rejected with `Conflict` while the lane's topology is rebalancing.
    pub async fn resume(&mut self) -> Result<()> {
        let _admitted = self.admit("resume")?;
        self.resume_held().await
    }

    /// Resume on behalf of the holder of the rebalance fence.
    pub(crate) async fn resume_held(&mut self) -> Result<()> {
        let next = transition(self.state.status, LaneTransition::Resume)?;
        self.signal("resume", Signal::Resume).await?;
        self.state.status = next;
        self.state.drained = false;
        info!(lane = %self.state.id, "lane resumed");
        self.publish(LaneEvent::new(names::LANE_RESUMED, self.state.id));
        Ok(())
    }

    /// Take the lane out of service; the process holds its work.
    pub async fn enter_maintenance(&mut self) -> Result<()> {
        let next = transition(self.state.status, LaneTransition::EnterMaintenance)?;
        self.signal("enter_maintenance", Signal::Pause).await?;
        self.state.status = next;
        info!(lane = %self.state.id, "lane entered maintenance");
        self.publish(LaneEvent::new(names::LANE_MAINTENANCE, self.state.id).with("maintenance", true));
        Ok(())
    }

    /// Return the lane to service.
    ///
    /// Rejected with `Conflict` while the lane's topology is rebalancing.
    pub async fn exit_maintenance(&mut self) -> Result<()> {
        let _admitted = self.admit("exit_maintenance")?;
        let next = transition(self.state.status, LaneTransition::ExitMaintenance)?;
        self.signal("exit_maintenance", Signal::Resume).await?;
        self.state.status = next;
        self.state.drained = false;
        info!(lane = %self.state.id, "lane left maintenance");
        self.publish(LaneEvent::new(names::LANE_MAINTENANCE, self.state.id).with("maintenance", false));
        Ok(())
    }

    /// Finish queued work and hold, so partitions can be reassigned.
    pub async fn drain(&mut self) -> Result<()> {
        let next = match self.state.status {
            LaneStatus::Paused => LaneStatus::Paused,
            status => transition(status, LaneTransition::Pause)?,
        };
        let outcome = match self.process.as_deref() {
            Some(process) => process.drain().await,
            None => return Err(self.missing_process()),
        };
        let status = match outcome {
            Ok(status) => status,
            Err(err) => return Err(self.fail(format!("drain failed: {err}"))),
        };
        self.state.status = next;
        self.state.drained = true;
        self.state.metrics.queue_depth = status.queue_depth;
        info!(lane = %self.state.id, processed = status.processed, "lane drained");
        self.publish(LaneEvent::new(names::LANE_PAUSED, self.state.id).with("drained", true));
        Ok(())
    }

    /// Stop permanently. Process errors during shutdown are logged; the lane
    /// is shut down regardless.
    pub async fn shutdown(&mut self) -> Result<()> {
        let next = transition(self.state.status, LaneTransition::Shutdown)?;
        if let Some(process) = self.process.take()
            && let Err(err) = process.shutdown().await
        {
            warn!(lane = %self.state.id, "process did not stop cleanly: {err}");
        }
        self.state.status = next;
        info!(lane = %self.state.id, dimension = %self.state.dimension, "lane shut down");
        self.publish(LaneEvent::new(names::LANE_SHUTDOWN, self.state.id));
        Ok(())
    }

    async fn signal(&mut self, action: &str, signal: Signal) -> Result<()> {
        let outcome = match self.process.as_deref() {
            Some(process) => match signal {
                Signal::Pause => process.pause().await,
                Signal::Resume => process.resume().await,
            },
            None => return Err(self.missing_process()),
        };
        outcome.map_err(|err| self.fail(format!("{action} failed: {err}")))
    }

    fn admit(&self, event: &'static str) -> Result<OwnedRwLockReadGuard<()>> {
        Arc::clone(&self.fence).try_read_owned().map_err(|_| {
            CoordinationError::Conflict {
                entity: "lane",
                detail: format!(
                    "{event} of lane {} refused while topology {} rebalances",
                    self.state.id, self.state.topology
                ),
            }
        })
    }

    fn require_live(&self, event: &'static str) -> Result<()> {
        if self.state.status.is_live() {
            Ok(())
        } else {
            Err(self.rejected(event))
        }
    }

    fn rejected(&self, event: &'static str) -> CoordinationError {
        CoordinationError::InvalidTransition {
            entity: "lane",
            from: self.state.status.label(),
            event,
        }
    }

    fn missing_process(&self) -> CoordinationError {
        CoordinationError::Process {
            lane: self.state.id,
            reason: "no process attached".to_string(),
        }
    }

    fn fail(&mut self, reason: String) -> CoordinationError {
        if let Ok(next) = transition(self.state.status, LaneTransition::Fail) {
            self.state.status = next;
        }
        self.state.metrics.error_count += 1;
        self.state.last_error = Some(reason.clone());
        warn!(lane = %self.state.id, dimension = %self.state.dimension, "lane failed: {reason}");
        self.publish(
            LaneEvent::new(names::LANE_ERROR, self.state.id)
                .with("reason", &reason)
                .with("error_count", self.state.metrics.error_count),
        );
        CoordinationError::Process {
            lane: self.state.id,
            reason,
        }
    }

    fn publish(&self, event: LaneEvent) {
        self.snapshots.send_replace(self.state.clone());
        publish_or_log(self.bus.as_ref(), event);
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::events::RecordingEventBus;
    use crate::lane::TaskLauncher;
    use crate::ruleset::{LaneRule, RuleSetContent};

    fn spec(dimension: Dimension) -> LaneSpec {
        LaneSpec {
            dimension,
            topology: TopologyId::new(),
            shape: GridShape::new(4, 4, 4),
            limits: LaneLimits::from_config(&LaneConfig::default()),
        }
    }

    fn ruleset(status: RuleSetStatus) -> RuleSet {
        let now = Utc::now();
        RuleSet {
            id: RuleSetId::new(),
            name: "life".into(),
            topology: None,
            version: 3,
            content: RuleSetContent::uniform(&LaneRule::new("conway")),
            status,
            signature: None,
            signing_algorithm: "ed25519".into(),
            performance_score: None,
            created_at: now,
            updated_at: now,
            deployed_at: None,
        }
    }

    async fn active_lane(bus: &RecordingEventBus) -> LaneCoordinator {
        let launcher = TaskLauncher::new(8);
        LaneCoordinator::create(spec(Dimension::X), &launcher, Arc::new(bus.clone()))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn create_activates_and_records_heartbeat() {
        let bus = RecordingEventBus::new();
        let lane = active_lane(&bus).await;
        assert_eq!(lane.snapshot().status, LaneStatus::Active);
        assert!(lane.snapshot().last_heartbeat_at.is_some());
        assert_eq!(lane.snapshot().metrics.cells_managed, 64);
        assert_eq!(bus.named(names::LANE_ACTIVATED).len(), 1);
    }

    #[tokio::test]
    async fn launch_failure_keeps_record_in_error() {
        let bus = RecordingEventBus::new();
        let launcher = TaskLauncher::new(8);
        launcher.refuse(Dimension::Z);
        let lane = LaneCoordinator::create(spec(Dimension::Z), &launcher, Arc::new(bus.clone()))
            .await
            .unwrap();
        assert_eq!(lane.snapshot().status, LaneStatus::Error);
        assert_eq!(lane.snapshot().metrics.error_count, 1);
        assert!(lane.snapshot().last_error.as_deref().unwrap().contains("launch failed"));
        assert_eq!(bus.named(names::LANE_ERROR).len(), 1);
    }

    #[tokio::test]
    async fn invalid_limits_are_rejected() {
        let mut spec = spec(Dimension::X);
        spec.limits.max_queue = 0;
        let launcher = TaskLauncher::new(8);
        let result = LaneCoordinator::create(spec, &launcher, Arc::new(RecordingEventBus::new())).await;
        assert!(matches!(result, Err(CoordinationError::Validation { field: "max_queue", .. })));
    }

    #[tokio::test]
    async fn coordinate_requires_active_ruleset() {
        let bus = RecordingEventBus::new();
        let mut lane = active_lane(&bus).await;
        let err = lane.coordinate(&ruleset(RuleSetStatus::Draft)).await.unwrap_err();
        assert!(matches!(err, CoordinationError::InvalidRuleSet { expected: "active", .. }));
        assert!(lane.snapshot().rules.is_none());

        let active = ruleset(RuleSetStatus::Active);
        lane.coordinate(&active).await.unwrap();
        let rules = lane.snapshot().rules.unwrap();
        assert_eq!((rules.ruleset, rules.version), (active.id, 3));
        assert_eq!(bus.named(names::LANE_RULES_APPLIED).len(), 1);
    }

    #[tokio::test]
    async fn shutdown_is_irreversible() {
        let bus = RecordingEventBus::new();
        let mut lane = active_lane(&bus).await;
        lane.pause().await.unwrap();
        lane.shutdown().await.unwrap();
        assert_eq!(lane.snapshot().status, LaneStatus::Shutdown);
        assert!(lane.resume().await.is_err());
        assert!(lane.heartbeat().is_err());
        assert!(lane.shutdown().await.is_err());
        assert_eq!(bus.named(names::LANE_SHUTDOWN).len(), 1);
    }

    #[tokio::test]
    async fn drain_quiesces_and_resume_clears() {
        let bus = RecordingEventBus::new();
        let mut lane = active_lane(&bus).await;
        assert!(!lane.snapshot().is_quiesced());
        lane.drain().await.unwrap();
        assert_eq!(lane.snapshot().status, LaneStatus::Paused);
        assert!(lane.snapshot().drained);
        assert!(lane.snapshot().is_quiesced());
        lane.resume().await.unwrap();
        assert!(!lane.snapshot().drained);
    }

    #[tokio::test]
    async fn maintenance_round_trip() {
        let bus = RecordingEventBus::new();
        let mut lane = active_lane(&bus).await;
        lane.enter_maintenance().await.unwrap();
        assert_eq!(lane.snapshot().status, LaneStatus::Maintenance);
        assert!(lane.pause().await.is_err());
        lane.exit_maintenance().await.unwrap();
        assert_eq!(lane.snapshot().status, LaneStatus::Active);
        assert_eq!(bus.named(names::LANE_MAINTENANCE).len(), 2);
    }

    #[tokio::test]
    async fn held_fence_refuses_reactivation() {
        let bus = RecordingEventBus::new();
        let fence = RebalanceFence::default();
        let launcher = TaskLauncher::new(8);
        let mut lane = LaneCoordinator::create_with_id(
            LaneId::new(),
            spec(Dimension::X),
            &launcher,
            Arc::new(bus.clone()),
            Arc::clone(&fence),
        )
        .await
        .unwrap();
        lane.drain().await.unwrap();

        let hold = Arc::clone(&fence).write_owned().await;
        let err = lane.resume().await.unwrap_err();
        assert!(matches!(err, CoordinationError::Conflict { entity: "lane", .. }));
        assert_eq!(lane.snapshot().status, LaneStatus::Paused);
        lane.resume_held().await.unwrap();
        lane.enter_maintenance().await.unwrap();
        assert!(lane.exit_maintenance().await.is_err());
        assert_eq!(lane.snapshot().status, LaneStatus::Maintenance);

        drop(hold);
        lane.exit_maintenance().await.unwrap();
        assert_eq!(lane.snapshot().status, LaneStatus::Active);
    }

    #[tokio::test]
    async fn subscribers_see_synced_metrics() {
        let bus = RecordingEventBus::new();
        let mut lane = active_lane(&bus).await;
        let rx = lane.subscribe();
        lane.sync_status(LaneStatusReport {
            cells_managed: 64,
            updates_per_second: 30.0,
            latency: Duration::from_millis(10),
            queue_depth: 512,
            dropped_events: 0,
            coupling_buffer_occupancy: 0.5,
        })
        .unwrap();
        let seen = rx.borrow().clone();
        assert!(seen.last_sync_at.is_some());
        // throughput 0.5, latency 1, queue 0.5, errors 1
        assert!((seen.health_score() - 0.75).abs() < 1e-9);
    }

    #[tokio::test]
    async fn rejects_occupancy_outside_unit_range() {
        let bus = RecordingEventBus::new();
        let mut lane = active_lane(&bus).await;
        let report = LaneStatusReport {
            coupling_buffer_occupancy: 1.5,
            ..LaneStatusReport::default()
        };
        assert!(lane.sync_status(report).is_err());
        assert!(lane.snapshot().last_sync_at.is_none());
    }
}
