use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ruleset::CouplingMatrix;
use crate::types::{ConsensusRunId, Dimension, RuleSetId};

/// Why a burst was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerReason {
    /// Mean coupling health fell below threshold.
    CouplingHealth,
    /// Lane disagreement rose above threshold.
    Disagreement,
    /// Operator request.
    Manual,
}

impl TriggerReason {
    /// Lowercase label.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::CouplingHealth => "coupling_health",
            Self::Disagreement => "disagreement",
            Self::Manual => "manual",
        }
    }
}

/// Run lifecycle; `succeeded` and `failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Annealing in progress.
    Running,
    /// Converged inside the step budget.
    Succeeded,
    /// Exhausted the budget or aborted.
    Failed,
}

/// Outcome of a finished burst.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusResult {
    /// Energy of the final configuration.
    pub final_energy: f64,
    /// Sweeps performed, at most `max_steps`.
    pub convergence_steps: u32,
    /// Whether the run converged strictly inside its budget.
    pub success: bool,
    /// Final spins, each +1 or -1.
    pub spin_configuration: Vec<i8>,
}

/// One consensus burst.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusRun {
    /// Identifier.
    pub id: ConsensusRunId,
    /// Number of spins.
    pub matrix_size: usize,
    /// Coupling J.
    pub coupling_strength: f64,
    /// First sweep temperature.
    pub initial_temperature: f64,
    /// Last sweep temperature.
    pub final_temperature: f64,
    /// Sweep budget.
    pub max_steps: u32,
    /// What started the run.
    pub trigger_reason: TriggerReason,
    /// Seed used, for replay.
    pub seed: u64,
    /// Whether the oracle supplied the starting temperature.
    pub oracle_seeded: bool,
    /// Ruleset the burst arbitrates for.
    pub ruleset: Option<RuleSetId>,
    /// Lifecycle status.
    pub status: RunStatus,
    /// Set once the run is terminal; absent for aborted runs.
    pub result: Option<ConsensusResult>,
    /// Start time.
    pub started_at: DateTime<Utc>,
    /// Completion time.
    pub completed_at: Option<DateTime<Utc>>,
}

impl ConsensusRun {
    /// `(max_steps - convergence_steps) / max_steps` for successful runs, else 0.
    #[must_use]
    pub fn efficiency_score(&self) -> f64 {
        match &self.result {
            Some(result) if result.success && self.max_steps > 0 => {
                f64::from(self.max_steps - result.convergence_steps.min(self.max_steps))
                    / f64::from(self.max_steps)
            }
            _ => 0.0,
        }
    }

    /// Whether the run finished inside its budget.
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.result.as_ref().is_some_and(|result| result.success)
    }

    /// Mean spin of each lane's third of the configuration, in x, y, z order.
    ///
    /// `None` before the run finishes or when there are fewer than three spins.
    #[must_use]
    pub fn lane_magnetization(&self) -> Option<[f64; 3]> {
        let spins = &self.result.as_ref()?.spin_configuration;
        let block = spins.len() / 3;
        if block == 0 {
            return None;
        }
        let mut out = [0.0; 3];
        for dimension in Dimension::ALL {
            let start = dimension.index() * block;
            let sum: i64 = spins[start..start + block].iter().map(|&s| i64::from(s)).sum();
            out[dimension.index()] = sum as f64 / block as f64;
        }
        Some(out)
    }

    /// Coupling matrix resolved by the burst, blended evenly with `base`.
    ///
    /// Lanes whose blocks settled to the same orientation are pulled toward
    /// full coupling, opposed lanes toward none.
    #[must_use]
    pub fn resolved_coupling(&self, base: &CouplingMatrix) -> Option<CouplingMatrix> {
        let spins = &self.result.as_ref()?.spin_configuration;
        let block = spins.len() / 3;
        if block == 0 {
            return None;
        }
        let lane = |dimension: Dimension| {
            let start = dimension.index() * block;
            &spins[start..start + block]
        };
        Some(CouplingMatrix::from_fn(|source, target| {
            let agreement: i64 = lane(source)
                .iter()
                .zip(lane(target))
                .map(|(&a, &b)| i64::from(a * b))
                .sum();
            let resolved = (1.0 + agreement as f64 / block as f64) / 2.0;
            let prior = base.get(source, target).unwrap_or(resolved);
            ((prior + resolved) / 2.0).clamp(0.0, 1.0)
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(max_steps: u32, result: Option<ConsensusResult>) -> ConsensusRun {
        ConsensusRun {
            id: ConsensusRunId::new(),
            matrix_size: 6,
            coupling_strength: 1.0,
            initial_temperature: 1.5,
            final_temperature: 0.1,
            max_steps,
            trigger_reason: TriggerReason::Manual,
            seed: 1,
            oracle_seeded: false,
            ruleset: None,
            status: RunStatus::Succeeded,
            result,
            started_at: Utc::now(),
            completed_at: Some(Utc::now()),
        }
    }

    fn result(steps: u32, success: bool, spins: Vec<i8>) -> ConsensusResult {
        ConsensusResult {
            final_energy: -3.0,
            convergence_steps: steps,
            success,
            spin_configuration: spins,
        }
    }

    #[test]
    fn efficiency_rewards_early_convergence() {
        let early = run(50, Some(result(10, true, vec![1; 6])));
        assert!((early.efficiency_score() - 0.8).abs() < 1e-12);
        let failed = run(50, Some(result(50, false, vec![1; 6])));
        assert!(failed.efficiency_score().abs() < f64::EPSILON);
        assert!(run(50, None).efficiency_score().abs() < f64::EPSILON);
    }

    #[test]
    fn resolved_coupling_follows_block_agreement() {
        // x up, y up, z down
        let finished = run(50, Some(result(5, true, vec![1, 1, 1, 1, -1, -1])));
        let matrix = finished
            .resolved_coupling(&CouplingMatrix::uniform(0.5))
            .unwrap_or_default();
        assert!((matrix.alpha_xy - 0.75).abs() < 1e-12);
        assert!((matrix.alpha_xz - 0.25).abs() < 1e-12);
        assert_eq!(finished.lane_magnetization(), Some([1.0, 1.0, -1.0]));
    }

    #[test]
    fn too_few_spins_resolve_nothing() {
        let finished = run(50, Some(result(5, true, vec![1, -1])));
        assert!(finished.resolved_coupling(&CouplingMatrix::default()).is_none());
    }
}
