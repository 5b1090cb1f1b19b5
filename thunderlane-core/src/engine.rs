//! In-process control plane wiring every component to one configuration.
//!
//! [`ThunderLane`] owns the registries and exposes the control loop as plain
//! async calls: bring lanes up, deploy a ruleset onto them, check whether the
//! lanes need a consensus burst and fold its result back, rebalance with the
//! lanes drained. [`ThunderLane::start`] spawns the adaptive tuner and the
//! metrics subscriber.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ThunderlaneConfig;
use crate::consensus::{
    ConsensusEngine, ConsensusRequest, ConsensusRun, TriggerReason, disagreement, lane_bias,
};
use crate::coupling::{AdaptiveTuner, AlphaPolicy, CouplingRegistry, NewCoupling, ProportionalPolicy};
use crate::error::{CoordinationError, Result};
use crate::events::{BroadcastEventBus, EventBus, LaneEvent};
use crate::lane::{LaneRegistry, LaneSnapshot, ProcessLauncher, TaskLauncher};
use crate::metrics::{HealthReport, MetricsCollector};
use crate::oracle::{
    NullOracle, OracleEvent, OracleFeatures, OracleModelConfig, OracleService, RuleOracle,
};
use crate::ruleset::{
    CouplingMatrix, DeploymentReport, DeploymentTransport, InMemoryTransport, RuleSet,
    RuleSetRegistry, RuleSigner,
};
use crate::topology::{AlwaysReachable, NodeProbe, RebalanceOutcome, TopologyManager};
use crate::types::{Dimension, RuleSetId, TopologyId};

/// Collaborators injected into [`ThunderLane`]; defaults run everything in
/// process.
pub struct ThunderLaneBuilder {
    config: ThunderlaneConfig,
    probe: Arc<dyn NodeProbe>,
    launcher: Option<Arc<dyn ProcessLauncher>>,
    transport: Arc<dyn DeploymentTransport>,
    oracle: Arc<dyn RuleOracle>,
    policy: Option<Arc<dyn AlphaPolicy>>,
    signer: Option<RuleSigner>,
}

impl ThunderLaneBuilder {
    /// Node reachability probe used by `distribute`.
    #[must_use]
    pub fn probe(mut self, probe: Arc<dyn NodeProbe>) -> Self {
        self.probe = probe;
        self
    }

    /// Launcher for lane compute processes.
    #[must_use]
    pub fn launcher(mut self, launcher: Arc<dyn ProcessLauncher>) -> Self {
        self.launcher = Some(launcher);
        self
    }

    /// Transport used to push activated rulesets to nodes.
    #[must_use]
    pub fn transport(mut self, transport: Arc<dyn DeploymentTransport>) -> Self {
        self.transport = transport;
        self
    }

    /// Advisory oracle; the service wrapping it starts `active`.
    #[must_use]
    pub fn oracle(mut self, oracle: Arc<dyn RuleOracle>) -> Self {
        self.oracle = oracle;
        self
    }

    /// Gain policy for the adaptive tuner.
    #[must_use]
    pub fn policy(mut self, policy: Arc<dyn AlphaPolicy>) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Ruleset signing key; generated when absent.
    #[must_use]
    pub fn signer(mut self, signer: RuleSigner) -> Self {
        self.signer = Some(signer);
        self
    }

    /// Validate the configuration and wire the components.
    pub fn build(self) -> Result<ThunderLane> {
        self.config.validate()?;
        let config = self.config;
        let hub = Arc::new(BroadcastEventBus::new(config.events.capacity));
        let metrics_events = hub.subscribe();
        let bus: Arc<dyn EventBus> = hub.clone();

        let topologies = Arc::new(TopologyManager::new(
            config.topology.clone(),
            self.probe,
            Arc::clone(&bus),
        ));
        let launcher = self
            .launcher
            .unwrap_or_else(|| Arc::new(TaskLauncher::new(config.lanes.command_buffer)));
        let lanes = Arc::new(LaneRegistry::new(
            config.lanes.clone(),
            launcher,
            Arc::clone(&bus),
        ));
        let couplings = Arc::new(CouplingRegistry::new(config.coupling.clone(), Arc::clone(&bus)));
        let rulesets = Arc::new(RuleSetRegistry::new(
            self.signer.unwrap_or_else(RuleSigner::generate),
            self.transport,
            topologies.clone(),
            Arc::clone(&self.oracle),
            Arc::clone(&bus),
        ));
        let oracle = Arc::new(OracleService::new(
            self.oracle,
            OracleModelConfig::default(),
            Arc::clone(&bus),
        ));
        if let Err(err) = oracle.apply(OracleEvent::Ready) {
            warn!("oracle did not become ready: {err}");
        }
        let consensus = Arc::new(ConsensusEngine::new(
            config.consensus.clone(),
            Some(Arc::clone(&oracle)),
            Arc::clone(&bus),
        ));
        let metrics = Arc::new(MetricsCollector::new(
            config.metrics.clone(),
            config.lanes.heartbeat_timeout,
            Arc::clone(&bus),
        ));
        let policy = self
            .policy
            .unwrap_or_else(|| Arc::new(ProportionalPolicy::from_config(&config.coupling)));
        let tuner = Arc::new(AdaptiveTuner::new(
            Arc::clone(&couplings),
            Arc::clone(&lanes),
            policy,
            config.coupling.tuning_interval,
        ));

        info!("thunderlane control plane assembled");
        Ok(ThunderLane {
            config,
            hub,
            metrics_events: Mutex::new(Some(metrics_events)),
            topologies,
            lanes,
            couplings,
            rulesets,
            oracle,
            consensus,
            metrics,
            tuner,
        })
    }
}

/// Result of [`ThunderLane::consensus_check`].
#[derive(Debug, Clone, Serialize)]
pub struct ConsensusCheck {
    /// Mean coupling health of the ruleset, when measured.
    pub coupling_health: Option<f64>,
    /// Spread of lane health.
    pub disagreement: f64,
    /// Why a burst ran; `None` when no threshold was crossed.
    pub trigger: Option<TriggerReason>,
    /// The burst, when one ran.
    pub run: Option<ConsensusRun>,
    /// Ruleset version holding the folded-back coupling matrix.
    pub folded_version: Option<u64>,
}

/// Handles for the background loops started by [`ThunderLane::start`].
pub struct BackgroundTasks {
    stop: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl BackgroundTasks {
    /// Signal every loop and wait for it to exit.
    pub async fn shutdown(self) {
        let _ = self.stop.send(true);
        for handle in self.handles {
            if let Err(err) = handle.await {
                warn!("background task ended abnormally: {err}");
            }
        }
    }
}

/// The assembled control plane.
pub struct ThunderLane {
    config: ThunderlaneConfig,
    hub: Arc<BroadcastEventBus>,
    metrics_events: Mutex<Option<broadcast::Receiver<LaneEvent>>>,
    topologies: Arc<TopologyManager>,
    lanes: Arc<LaneRegistry>,
    couplings: Arc<CouplingRegistry>,
    rulesets: Arc<RuleSetRegistry>,
    oracle: Arc<OracleService>,
    consensus: Arc<ConsensusEngine>,
    metrics: Arc<MetricsCollector>,
    tuner: Arc<AdaptiveTuner>,
}

impl ThunderLane {
    /// Builder with in-process defaults.
    #[must_use]
    pub fn builder(config: ThunderlaneConfig) -> ThunderLaneBuilder {
        ThunderLaneBuilder {
            config,
            probe: Arc::new(AlwaysReachable),
            launcher: None,
            transport: Arc::new(InMemoryTransport::new()),
            oracle: Arc::new(NullOracle),
            policy: None,
            signer: None,
        }
    }

    /// Assemble with every default collaborator.
    pub fn new(config: ThunderlaneConfig) -> Result<Self> {
        Self::builder(config).build()
    }

    /// Active configuration.
    #[must_use]
    pub const fn config(&self) -> &ThunderlaneConfig {
        &self.config
    }

    /// Topology owner.
    #[must_use]
    pub fn topologies(&self) -> &Arc<TopologyManager> {
        &self.topologies
    }

    /// Lane coordinators.
    #[must_use]
    pub fn lanes(&self) -> &Arc<LaneRegistry> {
        &self.lanes
    }

    /// Cross-lane couplings.
    #[must_use]
    pub fn couplings(&self) -> &Arc<CouplingRegistry> {
        &self.couplings
    }

    /// Versioned rulesets.
    #[must_use]
    pub fn rulesets(&self) -> &Arc<RuleSetRegistry> {
        &self.rulesets
    }

    /// Advisory oracle service.
    #[must_use]
    pub fn oracle(&self) -> &Arc<OracleService> {
        &self.oracle
    }

    /// Consensus engine.
    #[must_use]
    pub fn consensus(&self) -> &Arc<ConsensusEngine> {
        &self.consensus
    }

    /// Metrics collector.
    #[must_use]
    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    /// Adaptive tuner, for running single passes.
    #[must_use]
    pub fn tuner(&self) -> &Arc<AdaptiveTuner> {
        &self.tuner
    }

    /// Subscribe to every event published from here on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<LaneEvent> {
        self.hub.subscribe()
    }

    /// Spawn the adaptive tuner and the metrics subscriber.
    ///
    /// The metrics subscriber is attached once; later calls start only the
    /// tuner.
    pub fn start(&self) -> BackgroundTasks {
        let (stop, shutdown) = watch::channel(false);
        let mut handles = vec![Arc::clone(&self.tuner).spawn(shutdown.clone())];
        if let Some(events) = self.metrics_events.lock().take() {
            handles.push(Arc::clone(&self.metrics).spawn(events, shutdown));
        }
        BackgroundTasks { stop, handles }
    }

    /// Bring up the x, y and z lanes of a topology.
    pub async fn bring_up_lanes(&self, topology: TopologyId) -> Result<Vec<LaneSnapshot>> {
        let shape = self.topologies.get(topology)?.shape;
        let mut snapshots = Vec::with_capacity(Dimension::ALL.len());
        for dimension in Dimension::ALL {
            let snapshot = self
                .lanes
                .bring_up(self.lanes.spec(dimension, topology, shape))
                .await?;
            snapshots.push(snapshot);
        }
        Ok(snapshots)
    }

    /// Activate a ruleset, make sure its couplings exist and are active, then
    /// apply it to every active lane of its topology.
    pub async fn deploy_ruleset(&self, id: RuleSetId) -> Result<DeploymentReport> {
        let report = self.rulesets.activate(id).await?;
        let ruleset = self.rulesets.get(id).await?;
        self.ensure_couplings(&ruleset)?;
        if let Some(topology) = ruleset.topology {
            let applied = self.lanes.coordinate_topology(topology, &ruleset).await?;
            info!(ruleset = %id, topology = %topology, lanes = applied.len(), "ruleset applied to lanes");
        }
        Ok(report)
    }

    fn ensure_couplings(&self, ruleset: &RuleSet) -> Result<()> {
        let existing = self.couplings.for_ruleset(ruleset.id);
        for (source, target) in CouplingMatrix::PAIRS {
            let id = match existing
                .iter()
                .find(|coupling| coupling.source == source && coupling.target == target)
            {
                Some(coupling) => coupling.id,
                None => {
                    let mut new = NewCoupling::between(source, target);
                    new.ruleset = Some(ruleset.id);
                    new.topology = ruleset.topology;
                    new.adaptive_enabled = true;
                    let bounds = self.couplings.config().default_bounds;
                    new.alpha_gain = bounds.clamp(
                        ruleset
                            .content
                            .coupling
                            .get(source, target)
                            .unwrap_or(new.alpha_gain),
                    );
                    self.couplings.create(new)?.id
                }
            };
            self.couplings.activate(id)?;
        }
        Ok(())
    }

    /// Evaluate the trigger for a ruleset's lanes and, when crossed, run a
    /// burst and fold a successful result back into the ruleset.
    pub async fn consensus_check(&self, id: RuleSetId) -> Result<ConsensusCheck> {
        let ruleset = self.rulesets.get(id).await?;
        let topology = ruleset.topology.ok_or_else(|| {
            CoordinationError::validation(
                "topology",
                format!("ruleset {id} is not bound to a topology"),
                "a ruleset created with a topology",
            )
        })?;
        let mut lane_health = [0.0; 3];
        for snapshot in self.lanes.snapshots(topology) {
            lane_health[snapshot.dimension.index()] = snapshot.health_score();
        }
        let coupling_health = self.couplings.mean_health(Some(id));
        let spread = disagreement(lane_health);
        let trigger = self.consensus.should_trigger(coupling_health, spread);

        let mut check = ConsensusCheck {
            coupling_health,
            disagreement: spread,
            trigger,
            run: None,
            folded_version: None,
        };
        let Some(reason) = trigger else {
            debug!(ruleset = %id, disagreement = spread, "no consensus needed");
            return Ok(check);
        };

        let size = self.config.consensus.matrix_size;
        let mut request = ConsensusRequest::new(size, reason);
        request.ruleset = Some(id);
        request.bias = Some(lane_bias(size, lane_health));
        request.features = Some(OracleFeatures {
            coupling_health: coupling_health.unwrap_or(0.0),
            disagreement: spread,
            lane_health,
        });
        let run = self.consensus.run(request).await?;

        if run.succeeded() {
            let base = self.couplings.matrix_for(id, ruleset.content.coupling);
            if let Some(resolved) = run.resolved_coupling(&base) {
                let committed = self.rulesets.tune_alpha_gains(id, resolved).await?;
                self.sync_couplings(id, &resolved);
                check.folded_version = Some(committed.version);
            }
        }
        check.run = Some(run);
        Ok(check)
    }

    fn sync_couplings(&self, ruleset: RuleSetId, matrix: &CouplingMatrix) {
        for coupling in self.couplings.for_ruleset(ruleset) {
            let Some(gain) = matrix.get(coupling.source, coupling.target) else {
                continue;
            };
            let gain = coupling.bounds.clamp(gain);
            if (gain - coupling.alpha_gain).abs() <= f64::EPSILON {
                continue;
            }
            if let Err(err) = self.couplings.tune_alpha(coupling.id, gain) {
                warn!(coupling = %coupling.id, "consensus gain not applied: {err}");
            }
        }
    }

    /// Drain the topology's lanes, rebalance, then resume them.
    ///
    /// The lanes stay held from the drain until the new assignments are
    /// committed; concurrent resumes are refused meanwhile. Lanes are resumed
    /// whether or not the rebalance succeeded.
    pub async fn rebalance(&self, topology: TopologyId) -> Result<RebalanceOutcome> {
        let hold = self.lanes.hold_for_rebalance(topology).await?;
        let outcome = self.topologies.rebalance(topology, self.lanes.as_ref());
        if let Err(err) = self.lanes.release(hold).await {
            warn!(topology = %topology, "lanes not resumed after rebalance: {err}");
        }
        outcome
    }

    /// Health of one topology's lanes and couplings, or of everything.
    #[must_use]
    pub fn health_report(&self, topology: Option<TopologyId>) -> HealthReport {
        let lanes = match topology {
            Some(topology) => self.lanes.snapshots(topology),
            None => self.lanes.all(),
        };
        self.metrics
            .health_report(&lanes, self.couplings.mean_health(None))
    }

    /// Shut down every lane of a topology.
    pub async fn shutdown_topology(&self, topology: TopologyId) -> Result<()> {
        self.lanes.shutdown_topology(topology).await
    }
}
