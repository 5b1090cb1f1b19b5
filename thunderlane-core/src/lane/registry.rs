use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::{Mutex, OwnedRwLockWriteGuard, watch};
use tracing::{debug, info};

use super::coordinator::{LaneCoordinator, LaneLimits, LaneSnapshot, LaneSpec, RebalanceFence};
use super::process::ProcessLauncher;
use super::state::LaneStatus;
use crate::config::LaneConfig;
use crate::error::{CoordinationError, Result};
use crate::events::EventBus;
use crate::ruleset::RuleSet;
use crate::topology::{GridShape, QuiescenceCheck};
use crate::types::{Dimension, LaneId, TopologyId};

struct LaneEntry {
    coordinator: Arc<Mutex<LaneCoordinator>>,
    snapshot: watch::Receiver<LaneSnapshot>,
}

/// Exclusive hold on a topology's lanes, from [`LaneRegistry::hold_for_rebalance`].
///
/// While it lives no lane of the topology can be resumed, leave maintenance
/// or be brought up. Hand it back through [`LaneRegistry::release`].
#[must_use = "dropping the hold leaves the drained lanes paused"]
pub struct RebalanceHold {
    topology: TopologyId,
    _fence: OwnedRwLockWriteGuard<()>,
}

impl RebalanceHold {
    /// Topology held.
    #[must_use]
    pub const fn topology(&self) -> TopologyId {
        self.topology
    }
}

/// Lane coordinators addressed by id.
///
/// At most one non-shutdown coordinator exists per (topology, dimension).
/// Commands lock the coordinator; reads come from its published snapshot and
/// never wait on a command in flight.
pub struct LaneRegistry {
    lanes: DashMap<LaneId, LaneEntry>,
    slots: DashMap<(TopologyId, Dimension), LaneId>,
    fences: DashMap<TopologyId, RebalanceFence>,
    launcher: Arc<dyn ProcessLauncher>,
    bus: Arc<dyn EventBus>,
    config: LaneConfig,
}

impl LaneRegistry {
    /// Create an empty registry.
    pub fn new(config: LaneConfig, launcher: Arc<dyn ProcessLauncher>, bus: Arc<dyn EventBus>) -> Self {
        Self {
            lanes: DashMap::new(),
            slots: DashMap::new(),
            fences: DashMap::new(),
            launcher,
            bus,
            config,
        }
    }

    /// Lane spec with configured defaults.
    #[must_use]
    pub const fn spec(&self, dimension: Dimension, topology: TopologyId, shape: GridShape) -> LaneSpec {
        LaneSpec {
            dimension,
            topology,
            shape,
            limits: LaneLimits::from_config(&self.config),
        }
    }

    /// Create a coordinator and start its process.
    ///
    /// Fails with `Conflict` while another coordinator for the same dimension
    /// of the topology has not been shut down. A coordinator whose launch
    /// failed is still registered, in `error`. Waits while the topology is
    /// held for a rebalance.
    pub async fn bring_up(&self, spec: LaneSpec) -> Result<LaneSnapshot> {
        let fence = self.fence(spec.topology);
        let _admitted = Arc::clone(&fence).read_owned().await;
        let id = self.reserve(spec.topology, spec.dimension)?;
        let coordinator =
            match LaneCoordinator::create_with_id(id, spec.clone(), self.launcher.as_ref(), Arc::clone(&self.bus), fence).await {
                Ok(coordinator) => coordinator,
                Err(err) => {
                    self.slots.remove_if(&(spec.topology, spec.dimension), |_, lane| *lane == id);
                    return Err(err);
                }
            };
        let snapshot = coordinator.snapshot().clone();
        self.lanes.insert(
            id,
            LaneEntry {
                snapshot: coordinator.subscribe(),
                coordinator: Arc::new(Mutex::new(coordinator)),
            },
        );
        info!(lane = %id, dimension = %spec.dimension, topology = %spec.topology, status = snapshot.status.label(), "lane registered");
        Ok(snapshot)
    }

    fn fence(&self, topology: TopologyId) -> RebalanceFence {
        Arc::clone(self.fences.entry(topology).or_default().value())
    }

    fn reserve(&self, topology: TopologyId, dimension: Dimension) -> Result<LaneId> {
        let id = LaneId::new();
        match self.slots.entry((topology, dimension)) {
            Entry::Vacant(slot) => {
                slot.insert(id);
            }
            Entry::Occupied(mut slot) => {
                let holder = *slot.get();
                let retired = self
                    .lanes
                    .get(&holder)
                    .is_some_and(|entry| entry.snapshot.borrow().status == LaneStatus::Shutdown);
                if !retired {
                    return Err(CoordinationError::Conflict {
                        entity: "lane",
                        detail: format!("dimension {dimension} of topology {topology} is held by {holder}"),
                    });
                }
                debug!(lane = %holder, "replacing shut down lane");
                slot.insert(id);
            }
        }
        Ok(id)
    }

    /// Latest snapshot of a lane.
    pub fn snapshot(&self, id: LaneId) -> Result<LaneSnapshot> {
        self.lanes
            .get(&id)
            .map(|entry| entry.snapshot.borrow().clone())
            .ok_or_else(|| CoordinationError::not_found("lane", id))
    }

    /// Snapshots of the current lanes of a topology, in x, y, z order.
    #[must_use]
    pub fn snapshots(&self, topology: TopologyId) -> Vec<LaneSnapshot> {
        Dimension::ALL
            .into_iter()
            .filter_map(|dimension| self.lane_for(topology, dimension))
            .filter_map(|id| self.snapshot(id).ok())
            .collect()
    }

    /// Every registered lane, including shut down ones.
    #[must_use]
    pub fn all(&self) -> Vec<LaneSnapshot> {
        let mut all: Vec<LaneSnapshot> = self
            .lanes
            .iter()
            .map(|entry| entry.snapshot.borrow().clone())
            .collect();
        all.sort_by_key(|snapshot| (snapshot.created_at, snapshot.dimension));
        all
    }

    /// Current lane holding a dimension of a topology.
    #[must_use]
    pub fn lane_for(&self, topology: TopologyId, dimension: Dimension) -> Option<LaneId> {
        self.slots.get(&(topology, dimension)).map(|slot| *slot)
    }

    /// Coordinator handle for issuing commands.
    pub fn coordinator(&self, id: LaneId) -> Result<Arc<Mutex<LaneCoordinator>>> {
        self.lanes
            .get(&id)
            .map(|entry| Arc::clone(&entry.coordinator))
            .ok_or_else(|| CoordinationError::not_found("lane", id))
    }

    /// Apply an active ruleset to every live lane of a topology.
    pub async fn coordinate_topology(&self, topology: TopologyId, ruleset: &RuleSet) -> Result<Vec<LaneId>> {
        let mut applied = Vec::new();
        for snapshot in self.snapshots(topology) {
            if !snapshot.status.is_live() {
                continue;
            }
            let coordinator = self.coordinator(snapshot.id)?;
            coordinator.lock().await.coordinate(ruleset).await?;
            applied.push(snapshot.id);
        }
        Ok(applied)
    }

    /// Take the topology's fence exclusively, then drain its lanes.
    ///
    /// Waits for resumes and bring-ups already in flight. Once this returns,
    /// no lane of the topology can start consuming cells again until the hold
    /// is released, so a quiescence check made under it stays true. On a
    /// drain failure the hold is released before the error is returned.
    pub async fn hold_for_rebalance(&self, topology: TopologyId) -> Result<RebalanceHold> {
        let hold = RebalanceHold {
            topology,
            _fence: self.fence(topology).write_owned().await,
        };
        debug!(topology = %topology, "topology held for rebalance");
        if let Err(err) = self.drain_topology(topology).await {
            if let Err(resume) = self.release(hold).await {
                debug!(topology = %topology, "resume after failed drain: {resume}");
            }
            return Err(err);
        }
        Ok(hold)
    }

    /// Resume every paused lane of the held topology, then drop the hold.
    pub async fn release(&self, hold: RebalanceHold) -> Result<()> {
        let mut outcome = Ok(());
        for snapshot in self.snapshots(hold.topology) {
            if snapshot.status != LaneStatus::Paused {
                continue;
            }
            let coordinator = self.coordinator(snapshot.id)?;
            if let Err(err) = coordinator.lock().await.resume_held().await {
                outcome = Err(err);
            }
        }
        debug!(topology = %hold.topology, "topology released");
        outcome
    }

    /// Drain every active lane of a topology ahead of a rebalance.
    pub async fn drain_topology(&self, topology: TopologyId) -> Result<()> {
        for snapshot in self.snapshots(topology) {
            if snapshot.is_quiesced() {
                continue;
            }
            let coordinator = self.coordinator(snapshot.id)?;
            coordinator.lock().await.drain().await?;
        }
        Ok(())
    }

    /// Resume every drained or paused lane of a topology.
    pub async fn resume_topology(&self, topology: TopologyId) -> Result<()> {
        for snapshot in self.snapshots(topology) {
            if snapshot.status != LaneStatus::Paused {
                continue;
            }
            let coordinator = self.coordinator(snapshot.id)?;
            coordinator.lock().await.resume().await?;
        }
        Ok(())
    }

    /// Shut down every lane of a topology that is not already shut down.
    pub async fn shutdown_topology(&self, topology: TopologyId) -> Result<()> {
        for snapshot in self.snapshots(topology) {
            if snapshot.status == LaneStatus::Shutdown || snapshot.status == LaneStatus::Initializing {
                continue;
            }
            let coordinator = self.coordinator(snapshot.id)?;
            coordinator.lock().await.shutdown().await?;
        }
        Ok(())
    }
}

impl QuiescenceCheck for LaneRegistry {
    fn busy_lanes(&self, topology: TopologyId) -> Vec<String> {
        self.snapshots(topology)
            .into_iter()
            .filter(|snapshot| !snapshot.is_quiesced())
            .map(|snapshot| format!("{}:{}", snapshot.dimension, snapshot.id))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::events::RecordingEventBus;
    use crate::lane::TaskLauncher;

    fn registry(launcher: TaskLauncher) -> LaneRegistry {
        LaneRegistry::new(
            LaneConfig::default(),
            Arc::new(launcher),
            Arc::new(RecordingEventBus::new()),
        )
    }

    #[tokio::test]
    async fn one_lane_per_dimension() {
        let lanes = registry(TaskLauncher::new(8));
        let topology = TopologyId::new();
        let shape = GridShape::new(2, 2, 2);
        let first = lanes.bring_up(lanes.spec(Dimension::X, topology, shape)).await.unwrap();
        let err = lanes
            .bring_up(lanes.spec(Dimension::X, topology, shape))
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinationError::Conflict { entity: "lane", .. }));

        let coordinator = lanes.coordinator(first.id).unwrap();
        coordinator.lock().await.shutdown().await.unwrap();
        let replacement = lanes.bring_up(lanes.spec(Dimension::X, topology, shape)).await.unwrap();
        assert_ne!(replacement.id, first.id);
        assert_eq!(lanes.lane_for(topology, Dimension::X), Some(replacement.id));
        assert_eq!(lanes.snapshot(first.id).unwrap().status, LaneStatus::Shutdown);
        assert_eq!(lanes.all().len(), 2);
    }

    #[tokio::test]
    async fn quiescence_tracks_drain() {
        let lanes = registry(TaskLauncher::new(8));
        let topology = TopologyId::new();
        let shape = GridShape::new(2, 2, 2);
        for dimension in Dimension::ALL {
            lanes.bring_up(lanes.spec(dimension, topology, shape)).await.unwrap();
        }
        assert_eq!(lanes.busy_lanes(topology).len(), 3);
        lanes.drain_topology(topology).await.unwrap();
        assert!(lanes.busy_lanes(topology).is_empty());
        lanes.resume_topology(topology).await.unwrap();
        assert_eq!(lanes.busy_lanes(topology).len(), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn held_topology_refuses_reactivation() {
        let lanes = Arc::new(registry(TaskLauncher::new(8)));
        let topology = TopologyId::new();
        let shape = GridShape::new(2, 2, 2);
        for dimension in Dimension::ALL {
            lanes.bring_up(lanes.spec(dimension, topology, shape)).await.unwrap();
        }
        let z = lanes.lane_for(topology, Dimension::Z).unwrap();
        lanes.coordinator(z).unwrap().lock().await.enter_maintenance().await.unwrap();

        let hold = lanes.hold_for_rebalance(topology).await.unwrap();
        assert_eq!(hold.topology(), topology);
        assert!(lanes.busy_lanes(topology).is_empty());

        let x = lanes.lane_for(topology, Dimension::X).unwrap();
        let err = lanes.coordinator(x).unwrap().lock().await.resume().await.unwrap_err();
        assert!(matches!(err, CoordinationError::Conflict { entity: "lane", .. }));
        let err = lanes.coordinator(z).unwrap().lock().await.exit_maintenance().await.unwrap_err();
        assert!(matches!(err, CoordinationError::Conflict { .. }));
        lanes.resume_topology(topology).await.unwrap_err();
        assert!(lanes.busy_lanes(topology).is_empty());

        // a second topology is not affected
        let other = TopologyId::new();
        lanes.bring_up(lanes.spec(Dimension::X, other, shape)).await.unwrap();

        lanes.release(hold).await.unwrap();
        assert_eq!(lanes.busy_lanes(topology).len(), 2);
        assert_eq!(lanes.snapshot(z).unwrap().status, LaneStatus::Maintenance);
        lanes.coordinator(z).unwrap().lock().await.exit_maintenance().await.unwrap();
        assert_eq!(lanes.busy_lanes(topology).len(), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn bring_up_waits_for_the_hold() {
        let lanes = Arc::new(registry(TaskLauncher::new(8)));
        let topology = TopologyId::new();
        let shape = GridShape::new(2, 2, 2);
        lanes.bring_up(lanes.spec(Dimension::X, topology, shape)).await.unwrap();
        let hold = lanes.hold_for_rebalance(topology).await.unwrap();

        let pending = tokio::spawn({
            let lanes = Arc::clone(&lanes);
            async move { lanes.bring_up(lanes.spec(Dimension::Y, topology, shape)).await }
        });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!pending.is_finished());
        assert!(lanes.busy_lanes(topology).is_empty());

        lanes.release(hold).await.unwrap();
        let y = pending.await.unwrap().unwrap();
        assert_eq!(y.status, LaneStatus::Active);
        assert_eq!(lanes.busy_lanes(topology).len(), 2);
    }

    #[tokio::test]
    async fn failed_launch_stays_registered_in_error() {
        let launcher = TaskLauncher::new(8);
        launcher.refuse(Dimension::Y);
        let lanes = registry(launcher);
        let topology = TopologyId::new();
        let snapshot = lanes
            .bring_up(lanes.spec(Dimension::Y, topology, GridShape::new(2, 2, 2)))
            .await
            .unwrap();
        assert_eq!(snapshot.status, LaneStatus::Error);
        assert!(lanes.busy_lanes(topology).is_empty());
        assert!(matches!(
            lanes.bring_up(lanes.spec(Dimension::Y, topology, GridShape::new(2, 2, 2))).await,
            Err(CoordinationError::Conflict { .. })
        ));
    }
}
