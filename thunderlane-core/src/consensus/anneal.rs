//! Metropolis annealing over an Ising spin chain.
//!
//! Spins sit on a helical lattice: spin `i` bonds to `i + 1` and `i + w`
//! (modulo `n`), where `w = floor(sqrt(n))`. With `n = w²` this is a periodic
//! square lattice; other sizes wrap the last row into the first. Energy is
//!
//! ```text
//! E = -J * sum_{(i, j) bonded} s_i s_j - sum_i h_i s_i
//! ```
//!
//! Each step is one sweep of `n` single-spin Metropolis proposals at a
//! temperature that falls geometrically from the initial to the final value.

use std::collections::BTreeSet;

use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tracing::trace;

/// Largest spin matrix a burst may use.
pub const MAX_MATRIX_SIZE: usize = 10_000;

/// Parameters of one annealing run.
#[derive(Debug, Clone, PartialEq)]
pub struct AnnealParams {
    /// Number of spins.
    pub matrix_size: usize,
    /// Ferromagnetic coupling J.
    pub coupling_strength: f64,
    /// Temperature of the first sweep.
    pub initial_temperature: f64,
    /// Temperature of the last sweep.
    pub final_temperature: f64,
    /// Sweep budget.
    pub max_steps: u32,
    /// Per-spin energy delta below which a sweep is quiet.
    pub convergence_epsilon: f64,
    /// Consecutive quiet sweeps that count as convergence.
    pub convergence_patience: u32,
    /// RNG seed.
    pub seed: u64,
}

impl AnnealParams {
    /// Temperature of sweep `step` (zero based).
    ///
    /// The last sweep always runs at `final_temperature`, so a single-sweep
    /// budget skips the hot end of the schedule.
    #[must_use]
    pub fn temperature(&self, step: u32) -> f64 {
        if self.max_steps <= 1 {
            return self.final_temperature;
        }
        let progress = f64::from(step) / f64::from(self.max_steps - 1);
        let ratio = self.final_temperature / self.initial_temperature;
        self.initial_temperature * ratio.powf(progress)
    }
}

/// Result of [`anneal`].
#[derive(Debug, Clone, PartialEq)]
pub struct AnnealOutcome {
    /// Energy of the final configuration.
    pub final_energy: f64,
    /// Sweeps performed; `max_steps` when the budget ran out.
    pub convergence_steps: u32,
    /// Whether the quiet-sweep criterion was met.
    pub converged: bool,
    /// Final spins, each +1 or -1.
    pub spins: Vec<i8>,
}

/// Bond structure of the helical lattice.
#[derive(Debug, Clone)]
pub struct Lattice {
    neighbours: Vec<Vec<usize>>,
    bonds: Vec<(usize, usize)>,
}

impl Lattice {
    /// Lattice over `n` spins.
    #[must_use]
    pub fn helical(n: usize) -> Self {
        let width = n.isqrt().max(1);
        let mut unique = BTreeSet::new();
        for i in 0..n {
            for j in [(i + 1) % n, (i + width) % n] {
                if i != j {
                    unique.insert((i.min(j), i.max(j)));
                }
            }
        }
        let mut neighbours = vec![Vec::new(); n];
        for &(a, b) in &unique {
            neighbours[a].push(b);
            neighbours[b].push(a);
        }
        Self {
            neighbours,
            bonds: unique.into_iter().collect(),
        }
    }

    /// Number of spins.
    #[must_use]
    pub fn len(&self) -> usize {
        self.neighbours.len()
    }

    /// Whether the lattice has no spins.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.neighbours.is_empty()
    }

    /// Total energy of `spins`.
    #[must_use]
    pub fn energy(&self, spins: &[i8], coupling: f64, bias: &[f64]) -> f64 {
        let bonded: f64 = self
            .bonds
            .iter()
            .map(|&(a, b)| f64::from(spins[a] * spins[b]))
            .sum();
        let field: f64 = spins
            .iter()
            .zip(bias)
            .map(|(&s, &h)| h * f64::from(s))
            .sum();
        -coupling * bonded - field
    }

    fn flip_delta(&self, spins: &[i8], i: usize, coupling: f64, bias: &[f64]) -> f64 {
        let local: i32 = self.neighbours[i].iter().map(|&j| i32::from(spins[j])).sum();
        2.0 * f64::from(spins[i]) * (coupling * f64::from(local) + bias[i])
    }
}

/// Anneal from `initial` (random when absent) under an optional per-spin bias.
///
/// Callers validate sizes; a bias or initial configuration of the wrong length
/// is ignored.
#[must_use]
pub fn anneal(params: &AnnealParams, bias: Option<&[f64]>, initial: Option<&[i8]>) -> AnnealOutcome {
    let n = params.matrix_size;
    let lattice = Lattice::helical(n);
    let mut rng = ChaCha8Rng::seed_from_u64(params.seed);
    let zero = vec![0.0; n];
    let bias = bias.filter(|b| b.len() == n).unwrap_or(zero.as_slice());
    let mut spins: Vec<i8> = match initial.filter(|s| s.len() == n) {
        Some(seed) => seed.iter().map(|&s| if s < 0 { -1 } else { 1 }).collect(),
        None => (0..n).map(|_| if rng.gen_bool(0.5) { 1 } else { -1 }).collect(),
    };

    let j = params.coupling_strength;
    let mut energy = lattice.energy(&spins, j, bias);
    let mut quiet = 0u32;
    let mut steps = params.max_steps;
    let mut converged = false;

    for step in 0..params.max_steps {
        let temperature = params.temperature(step);
        let before = energy;
        for _ in 0..n {
            let i = rng.gen_range(0..n);
            let delta = lattice.flip_delta(&spins, i, j, bias);
            if delta <= 0.0 || rng.gen_bool((-delta / temperature).exp().min(1.0)) {
                spins[i] = -spins[i];
                energy += delta;
            }
        }
        let per_spin = (energy - before).abs() / n as f64;
        trace!(step, temperature, energy, per_spin, "annealing sweep");
        if per_spin < params.convergence_epsilon {
            quiet += 1;
            if quiet >= params.convergence_patience {
                steps = step + 1;
                converged = true;
                break;
            }
        } else {
            quiet = 0;
        }
    }

    AnnealOutcome {
        final_energy: lattice.energy(&spins, j, bias),
        convergence_steps: steps,
        converged,
        spins,
    }
}
