//! Subcommand implementations, kept out of `main` so they can be tested.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use thunderlane_core::consensus::{ConsensusEngine, ConsensusRequest, ConsensusRun, TriggerReason, lane_bias};
use thunderlane_core::lane::{LaneSnapshot, LaneStatusReport};
use thunderlane_core::metrics::HealthReport;
use thunderlane_core::ruleset::{LaneRule, NewRuleSet, RuleSetContent};
use thunderlane_core::topology::{
    AlwaysReachable, ComputeNode, GridShape, PartitionOutcome, PartitionRequest, PartitionStrategy,
    TopologyManager, TopologySpec,
};
use thunderlane_core::{NullEventBus, ThunderLane, ThunderlaneConfig, TopologyId};
use tracing::{debug, info, warn};

/// Parse `WxHxD`, or a single extent for a cube.
pub fn parse_shape(text: &str) -> Result<GridShape> {
    let extents = text
        .split(['x', 'X'])
        .map(|part| {
            part.trim()
                .parse::<u32>()
                .with_context(|| format!("'{part}' is not a grid extent"))
        })
        .collect::<Result<Vec<_>>>()?;
    match extents.as_slice() {
        [side] => Ok(GridShape::new(*side, *side, *side)),
        [width, height, depth] => Ok(GridShape::new(*width, *height, *depth)),
        _ => bail!("expected WIDTHxHEIGHTxDEPTH or a single extent, got '{text}'"),
    }
}

/// Partition a throwaway topology and return the committed plan.
pub fn plan_partition(
    config: &ThunderlaneConfig,
    shape: GridShape,
    strategy: PartitionStrategy,
    count: u32,
) -> Result<PartitionOutcome> {
    let manager = TopologyManager::new(
        config.topology.clone(),
        Arc::new(AlwaysReachable),
        Arc::new(NullEventBus),
    );
    let id = manager.create(TopologySpec::rectangular("plan", shape))?;
    Ok(manager.partition(id, strategy, &PartitionRequest::with_count(count))?)
}

/// Overrides for a one-off consensus burst.
#[derive(Debug, Clone, Default)]
pub struct BurstOptions {
    /// Spins; the configured size when absent.
    pub matrix_size: Option<usize>,
    /// Sweep budget override.
    pub max_steps: Option<u32>,
    /// RNG seed override.
    pub seed: Option<u64>,
    /// Starting temperature override.
    pub initial_temperature: Option<f64>,
    /// Health of the x, y and z lanes, used as a local field.
    pub lane_health: Option<[f64; 3]>,
}

/// Run one burst outside any control plane.
pub async fn run_burst(config: &ThunderlaneConfig, options: BurstOptions) -> Result<ConsensusRun> {
    let engine = ConsensusEngine::new(config.consensus.clone(), None, Arc::new(NullEventBus));
    let size = options.matrix_size.unwrap_or(config.consensus.matrix_size);
    let request = ConsensusRequest {
        max_steps: options.max_steps,
        seed: options.seed,
        initial_temperature: options.initial_temperature,
        bias: options.lane_health.map(|health| lane_bias(size, health)),
        ..ConsensusRequest::new(size, TriggerReason::Manual)
    };
    Ok(engine.run(request).await?)
}

/// Parameters of an in-process control plane run.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Grid to coordinate.
    pub shape: GridShape,
    /// Partition strategy.
    pub strategy: PartitionStrategy,
    /// Requested partitions.
    pub partitions: u32,
    /// Synthetic compute nodes.
    pub nodes: usize,
    /// Control tick.
    pub tick: Duration,
    /// Stop after this long; runs until interrupted when absent.
    pub duration: Option<Duration>,
    /// Seed for the synthetic lane load.
    pub seed: u64,
}

/// What happened during a control plane run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    /// Topology coordinated.
    pub topology: TopologyId,
    /// Control ticks completed.
    pub ticks: u64,
    /// Consensus bursts run.
    pub bursts: u64,
    /// Bursts that converged.
    pub converged: u64,
    /// Ruleset versions committed by folding consensus back.
    pub folds: u64,
    /// Rebalances performed.
    pub rebalances: u64,
    /// Health at the last tick.
    pub health: HealthReport,
}

/// Bring up a full control plane over synthetic nodes and lanes, then run
/// the control loop until `duration` elapses or the process is interrupted.
pub async fn run_control_plane(config: ThunderlaneConfig, options: RunOptions) -> Result<RunSummary> {
    if options.nodes == 0 {
        bail!("at least one compute node is required");
    }
    let plane = ThunderLane::new(config).context("failed to assemble control plane")?;
    let background = plane.start();

    let topology = plane
        .topologies()
        .create(TopologySpec::rectangular("cli", options.shape))?;
    let plan = plane.topologies().partition(
        topology,
        options.strategy,
        &PartitionRequest::with_count(options.partitions),
    )?;
    info!(
        topology = %topology,
        partitions = plan.metrics.partition_count,
        load_variance = plan.metrics.load_variance,
        "topology partitioned"
    );
    let nodes = (0..options.nodes)
        .map(|i| ComputeNode::new(format!("node-{i}"), format!("127.0.0.1:{}", 7000 + i)))
        .collect();
    plane.topologies().distribute(topology, nodes).await?;
    plane.bring_up_lanes(topology).await?;

    let ruleset = plane
        .rulesets()
        .create(NewRuleSet {
            name: "cli".into(),
            topology: Some(topology),
            content: RuleSetContent::uniform(&LaneRule::new("b3s23")),
        })
        .await?;
    let deployment = plane.deploy_ruleset(ruleset.id).await?;
    if !deployment.failed.is_empty() {
        warn!(failed = deployment.failed.len(), "ruleset not delivered everywhere");
    }

    let mut load = LoadSimulator::new(options.seed);
    let mut summary = RunSummary {
        topology,
        ticks: 0,
        bursts: 0,
        converged: 0,
        folds: 0,
        rebalances: 0,
        health: plane.health_report(Some(topology)),
    };
    let deadline = options.duration.map(|d| tokio::time::Instant::now() + d);
    let mut ticker = tokio::time::interval(options.tick);
    let mut placement_settled = false;

    loop {
        let stop = async {
            match deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            _ = stop => break,
            signal = tokio::signal::ctrl_c() => {
                signal.context("failed to listen for interrupt")?;
                info!("interrupted");
                break;
            }
            _ = ticker.tick() => {}
        }

        for snapshot in plane.lanes().snapshots(topology) {
            if !snapshot.status.is_live() {
                continue;
            }
            let coordinator = plane.lanes().coordinator(snapshot.id)?;
            let mut lane = coordinator.lock().await;
            lane.heartbeat()?;
            lane.sync_status(load.report(&snapshot, options.shape.cell_count()))?;
        }

        let check = plane.consensus_check(ruleset.id).await?;
        if let Some(run) = &check.run {
            summary.bursts += 1;
            if run.succeeded() {
                summary.converged += 1;
            }
        }
        if check.folded_version.is_some() {
            summary.folds += 1;
        }

        // a rebalance that moved nothing is not retried until placement changes
        match plane.topologies().needs_rebalance(topology)? {
            Some(reason) if !placement_settled => {
                info!(topology = %topology, ?reason, "rebalancing");
                let outcome = plane.rebalance(topology).await?;
                placement_settled = outcome.moved_partitions.is_empty();
                summary.rebalances += 1;
            }
            Some(_) => {}
            None => placement_settled = false,
        }

        summary.ticks += 1;
        summary.health = plane.health_report(Some(topology));
        debug!(
            tick = summary.ticks,
            status = ?summary.health.status,
            score = summary.health.score,
            disagreement = check.disagreement,
            "control tick"
        );
    }

    background.shutdown().await;
    plane
        .shutdown_topology(topology)
        .await
        .map_err(|err| anyhow!("lanes did not shut down cleanly: {err}"))?;
    Ok(summary)
}

/// Seeded synthetic lane load; each lane drifts around its targets.
struct LoadSimulator {
    rng: StdRng,
}

impl LoadSimulator {
    fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    fn report(&mut self, lane: &LaneSnapshot, cells: u64) -> LaneStatusReport {
        let limits = &lane.limits;
        let max_latency = limits.max_latency.as_secs_f64();
        LaneStatusReport {
            cells_managed: cells,
            updates_per_second: limits.target_ups * self.rng.gen_range(0.5..1.1),
            latency: Duration::from_secs_f64(max_latency * self.rng.gen_range(0.2..1.4)),
            queue_depth: self.rng.gen_range(0..=limits.max_queue / 2),
            dropped_events: u64::from(self.rng.gen_bool(0.05)),
            coupling_buffer_occupancy: self.rng.gen_range(0.1..0.9),
        }
    }
}
