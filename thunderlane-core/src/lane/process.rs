//! Supervised compute processes behind lane coordinators.
//!
//! A coordinator never runs cellular kernels itself. It launches one process
//! through a [`ProcessLauncher`] and drives it with the commands of
//! [`ComputeProcess`]. [`TaskProcess`] is the in-process implementation: a
//! tokio task fed by an mpsc command channel, answering each command on a
//! oneshot reply channel.

use std::collections::HashSet;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::ruleset::{CouplingMatrix, LaneRule};
use crate::topology::GridShape;
use crate::types::{Dimension, LaneId, RuleSetId, TopologyId};

/// Everything a launcher needs to start a lane process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaneLaunch {
    /// Lane being started.
    pub lane: LaneId,
    /// Axis it processes.
    pub dimension: Dimension,
    /// Topology it is bound to.
    pub topology: TopologyId,
    /// Grid extents.
    pub shape: GridShape,
}

/// Rules hot-swapped into a running process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleUpdate {
    /// Source ruleset.
    pub ruleset: RuleSetId,
    /// Source version.
    pub version: u64,
    /// Rule for this lane's axis.
    pub rule: LaneRule,
    /// Coupling matrix in effect.
    pub coupling: CouplingMatrix,
}

/// Process-side counters returned by status and drain calls.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ProcessStatus {
    /// Work units completed.
    pub processed: u64,
    /// Work units waiting.
    pub queue_depth: usize,
    /// Whether the process is holding work.
    pub paused: bool,
    /// Ruleset version currently loaded.
    pub rules: Option<(RuleSetId, u64)>,
}

/// Failures reported by a compute process.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProcessError {
    /// The process could not be started.
    #[error("launch failed: {0}")]
    Launch(String),
    /// The process refused the command.
    #[error("command rejected: {0}")]
    Rejected(String),
    /// The process is gone.
    #[error("process exited")]
    Exited,
}

/// Handle to one supervised process.
#[async_trait]
pub trait ComputeProcess: Send + Sync {
    /// Hot-swap rules without restarting.
    async fn apply_rules(&self, update: RuleUpdate) -> Result<(), ProcessError>;

    /// Stop consuming work, keeping state.
    async fn pause(&self) -> Result<(), ProcessError>;

    /// Consume work again.
    async fn resume(&self) -> Result<(), ProcessError>;

    /// Finish queued work, then hold.
    async fn drain(&self) -> Result<ProcessStatus, ProcessError>;

    /// Current counters.
    async fn status(&self) -> Result<ProcessStatus, ProcessError>;

    /// Stop permanently.
    async fn shutdown(&self) -> Result<(), ProcessError>;
}

/// Starts compute processes for lanes.
#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    /// Start a process for `launch`.
    async fn launch(&self, launch: &LaneLaunch) -> Result<Box<dyn ComputeProcess>, ProcessError>;
}

enum Command {
    Apply(RuleUpdate, oneshot::Sender<()>),
    Submit(usize, oneshot::Sender<()>),
    Pause(oneshot::Sender<()>),
    Resume(oneshot::Sender<()>),
    Drain(oneshot::Sender<ProcessStatus>),
    Status(oneshot::Sender<ProcessStatus>),
    Shutdown(oneshot::Sender<()>),
}

/// In-process compute process running on a tokio task.
pub struct TaskProcess {
    lane: LaneId,
    commands: mpsc::Sender<Command>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl TaskProcess {
    /// Spawn the process task; `buffer` bounds queued commands.
    #[must_use]
    pub fn spawn(launch: &LaneLaunch, buffer: usize) -> Self {
        let (commands, rx) = mpsc::channel(buffer.max(1));
        let lane = launch.lane;
        let dimension = launch.dimension;
        let task = tokio::spawn(Self::run(lane, dimension, rx));
        Self {
            lane,
            commands,
            task: Mutex::new(Some(task)),
        }
    }

    /// Queue `units` of work; processed at once unless paused.
    pub async fn submit(&self, units: usize) -> Result<(), ProcessError> {
        self.request(|reply| Command::Submit(units, reply)).await
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, ProcessError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(command(tx))
            .await
            .map_err(|_| ProcessError::Exited)?;
        rx.await.map_err(|_| ProcessError::Exited)
    }

    async fn run(lane: LaneId, dimension: Dimension, mut rx: mpsc::Receiver<Command>) {
        let mut status = ProcessStatus::default();
        debug!(lane = %lane, dimension = %dimension, "lane process started");
        while let Some(command) = rx.recv().await {
            match command {
                Command::Apply(update, reply) => {
                    status.rules = Some((update.ruleset, update.version));
                    debug!(lane = %lane, rule = %update.rule.rule, version = update.version, "rules swapped");
                    let _ = reply.send(());
                }
                Command::Submit(units, reply) => {
                    if status.paused {
                        status.queue_depth += units;
                    } else {
                        status.processed += units as u64;
                    }
                    let _ = reply.send(());
                }
                Command::Pause(reply) => {
                    status.paused = true;
                    let _ = reply.send(());
                }
                Command::Resume(reply) => {
                    status.paused = false;
                    status.processed += status.queue_depth as u64;
                    status.queue_depth = 0;
                    let _ = reply.send(());
                }
                Command::Drain(reply) => {
                    status.processed += status.queue_depth as u64;
                    status.queue_depth = 0;
                    status.paused = true;
                    let _ = reply.send(status.clone());
                }
                Command::Status(reply) => {
                    let _ = reply.send(status.clone());
                }
                Command::Shutdown(reply) => {
                    let _ = reply.send(());
                    break;
                }
            }
        }
        info!(lane = %lane, processed = status.processed, "lane process stopped");
    }
}

#[async_trait]
impl ComputeProcess for TaskProcess {
    async fn apply_rules(&self, update: RuleUpdate) -> Result<(), ProcessError> {
        self.request(|reply| Command::Apply(update, reply)).await
    }

    async fn pause(&self) -> Result<(), ProcessError> {
        self.request(Command::Pause).await
    }

    async fn resume(&self) -> Result<(), ProcessError> {
        self.request(Command::Resume).await
    }

    async fn drain(&self) -> Result<ProcessStatus, ProcessError> {
        self.request(Command::Drain).await
    }

    async fn status(&self) -> Result<ProcessStatus, ProcessError> {
        self.request(Command::Status).await
    }

    async fn shutdown(&self) -> Result<(), ProcessError> {
        self.request(Command::Shutdown).await?;
        let task = self.task.lock().take();
        if let Some(task) = task {
            task.await.map_err(|err| ProcessError::Rejected(err.to_string()))?;
        }
        Ok(())
    }
}

impl Drop for TaskProcess {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.abort();
            debug!(lane = %self.lane, "lane process aborted on drop");
        }
    }
}

/// Launches [`TaskProcess`]es; individual dimensions can be set to refuse.
#[derive(Debug, Default)]
pub struct TaskLauncher {
    buffer: usize,
    refused: Mutex<HashSet<Dimension>>,
}

impl TaskLauncher {
    /// Launcher whose processes buffer `buffer` commands.
    #[must_use]
    pub fn new(buffer: usize) -> Self {
        Self {
            buffer,
            refused: Mutex::new(HashSet::new()),
        }
    }

    /// Make launches for `dimension` fail.
    pub fn refuse(&self, dimension: Dimension) {
        self.refused.lock().insert(dimension);
    }
}

#[async_trait]
impl ProcessLauncher for TaskLauncher {
    async fn launch(&self, launch: &LaneLaunch) -> Result<Box<dyn ComputeProcess>, ProcessError> {
        if self.refused.lock().contains(&launch.dimension) {
            return Err(ProcessError::Launch(format!(
                "no capacity for lane {}",
                launch.dimension
            )));
        }
        Ok(Box::new(TaskProcess::spawn(launch, self.buffer)))
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    fn launch() -> LaneLaunch {
        LaneLaunch {
            lane: LaneId::new(),
            dimension: Dimension::Y,
            topology: TopologyId::new(),
            shape: GridShape::new(4, 4, 4),
        }
    }

    #[tokio::test]
    async fn paused_process_queues_work() {
        let process = TaskProcess::spawn(&launch(), 8);
        process.submit(5).await.unwrap();
        process.pause().await.unwrap();
        process.submit(3).await.unwrap();
        let status = process.status().await.unwrap();
        assert_eq!(status.processed, 5);
        assert_eq!(status.queue_depth, 3);

        process.resume().await.unwrap();
        let status = process.status().await.unwrap();
        assert_eq!(status.processed, 8);
        assert_eq!(status.queue_depth, 0);
    }

    #[tokio::test]
    async fn drain_empties_queue_and_holds() {
        let process = TaskProcess::spawn(&launch(), 8);
        process.pause().await.unwrap();
        process.submit(4).await.unwrap();
        let drained = process.drain().await.unwrap();
        assert_eq!(drained.queue_depth, 0);
        assert_eq!(drained.processed, 4);
        assert!(drained.paused);
    }

    #[tokio::test]
    async fn commands_fail_after_shutdown() {
        let process = TaskProcess::spawn(&launch(), 8);
        process.shutdown().await.unwrap();
        assert_eq!(process.status().await.unwrap_err(), ProcessError::Exited);
    }

    #[tokio::test]
    async fn refused_dimension_fails_launch() {
        let launcher = TaskLauncher::new(4);
        launcher.refuse(Dimension::Y);
        assert!(matches!(
            launcher.launch(&launch()).await,
            Err(ProcessError::Launch(_))
        ));
    }
}
