//! Partition strategies.
//!
//! Every strategy produces a dense `p0..pN` partition set whose cell counts sum
//! to the grid volume. Computation is pure; the manager decides what to commit.

use std::cmp::Reverse;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::curve::{cell_bucket, hilbert_index, hilbert_order};
use super::grid::{BoundingBox, CellCoord, GridShape};
use crate::config::TopologyConfig;
use crate::error::CoordinationError;
use crate::types::{NodeId, PartitionId};

/// How the grid is cut into partitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PartitionStrategy {
    /// Regular 3D blocks.
    #[serde(rename = "grid_3d")]
    Grid3d,
    /// Hash-bucketed cells.
    #[serde(rename = "spatial_hash")]
    SpatialHash,
    /// Hilbert ordering folded into contiguous runs.
    #[serde(rename = "hilbert_curve")]
    HilbertCurve,
    /// Slabs along the longest axis, iteratively equalised by load.
    #[serde(rename = "load_balanced")]
    LoadBalanced,
    /// Caller-supplied [`CellAssigner`].
    #[serde(rename = "custom")]
    Custom,
}

impl PartitionStrategy {
    /// Every strategy, in documentation order.
    pub const ALL: [Self; 5] = [
        Self::Grid3d,
        Self::SpatialHash,
        Self::HilbertCurve,
        Self::LoadBalanced,
        Self::Custom,
    ];

    /// Wire label.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Grid3d => "grid_3d",
            Self::SpatialHash => "spatial_hash",
            Self::HilbertCurve => "hilbert_curve",
            Self::LoadBalanced => "load_balanced",
            Self::Custom => "custom",
        }
    }
}

impl fmt::Display for PartitionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for PartitionStrategy {
    type Err = CoordinationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|strategy| strategy.label() == wanted)
            .ok_or_else(|| CoordinationError::InvalidStrategy {
                strategy: s.to_string(),
                reason: "unknown strategy".to_string(),
            })
    }
}

/// Maps every cell to a partition ordinal for the `custom` strategy.
pub trait CellAssigner: Send + Sync {
    /// Number of partitions the assigner produces.
    fn partition_count(&self) -> u32;

    /// Partition ordinal owning `coord`; must be `< partition_count()`.
    fn assign(&self, coord: CellCoord) -> u32;
}

/// Per-cell work estimate.
pub trait LoadModel: Send + Sync {
    /// Relative load of `coord`; negative values are treated as zero.
    fn load(&self, coord: CellCoord) -> f64;
}

/// Parameters for one partition computation.
#[derive(Clone, Default)]
pub struct PartitionRequest {
    /// Requested partition count (ignored by `custom`).
    pub partition_count: u32,
    /// Optional per-cell load; uniform when absent.
    pub load_model: Option<Arc<dyn LoadModel>>,
    /// Assigner for the `custom` strategy.
    pub assigner: Option<Arc<dyn CellAssigner>>,
}

impl PartitionRequest {
    /// Uniform-load request for `partition_count` partitions.
    #[must_use]
    pub fn with_count(partition_count: u32) -> Self {
        Self {
            partition_count,
            ..Self::default()
        }
    }
}

impl fmt::Debug for PartitionRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PartitionRequest")
            .field("partition_count", &self.partition_count)
            .field("load_model", &self.load_model.is_some())
            .field("assigner", &self.assigner.is_some())
            .finish()
    }
}

/// Cells owned by a partition, beyond its bounding box.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CellSet {
    /// Every cell inside the bounding box.
    Block,
    /// Cells whose Hilbert index lies in `start..end`.
    CurveRange {
        /// Bits per axis of the curve.
        bits: u32,
        /// First curve index (inclusive).
        start: u64,
        /// Last curve index (exclusive).
        end: u64,
    },
    /// Cells hashing into one of `buckets` modulo `modulus`.
    HashBuckets {
        /// Sorted bucket ids.
        buckets: Vec<u32>,
        /// Total bucket count.
        modulus: u32,
    },
    /// Half-open row-major ordinal ranges.
    Ordinals {
        /// Sorted, non-overlapping ranges.
        ranges: Vec<(u64, u64)>,
    },
}

/// A contiguous cell range assigned to one compute node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Partition {
    /// Dense ordinal within the topology.
    pub id: PartitionId,
    /// Cells owned.
    pub cell_count: u64,
    /// Axis-aligned bounding shape.
    pub bounds: BoundingBox,
    /// Exact ownership description.
    pub cells: CellSet,
    /// Node the partition is placed on.
    pub assigned_node: Option<NodeId>,
    /// Load metric (cell count unless a load model was supplied).
    pub load: f64,
}

impl Partition {
    /// Whether this partition owns `coord`.
    #[must_use]
    pub fn contains(&self, shape: &GridShape, coord: CellCoord) -> bool {
        if !self.bounds.contains(coord) {
            return false;
        }
        match &self.cells {
            CellSet::Block => true,
            CellSet::CurveRange { bits, start, end } => {
                let index = hilbert_index(coord, *bits);
                (*start..*end).contains(&index)
            }
            CellSet::HashBuckets { buckets, modulus } => {
                buckets.binary_search(&cell_bucket(coord, *modulus)).is_ok()
            }
            CellSet::Ordinals { ranges } => {
                let ordinal = shape.ordinal(coord);
                ranges.iter().any(|(lo, hi)| (*lo..*hi).contains(&ordinal))
            }
        }
    }
}

/// Summary emitted with every committed partition set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionMetrics {
    /// Number of partitions.
    pub partition_count: usize,
    /// Grid volume divided by partition count (integer division).
    pub cells_per_partition: u64,
    /// Largest partition by cells.
    pub max_partition_size: u64,
    /// Smallest partition by cells.
    pub min_partition_size: u64,
    /// Coefficient of variation of partition load.
    pub load_variance: f64,
}

impl PartitionMetrics {
    pub(crate) fn from_partitions(shape: &GridShape, partitions: &[Partition]) -> Self {
        let loads: Vec<f64> = partitions.iter().map(|p| p.load).collect();
        let count = partitions.len();
        Self {
            partition_count: count,
            cells_per_partition: shape.cell_count() / (count.max(1) as u64),
            max_partition_size: partitions.iter().map(|p| p.cell_count).max().unwrap_or(0),
            min_partition_size: partitions.iter().map(|p| p.cell_count).min().unwrap_or(0),
            load_variance: coefficient_of_variation(&loads),
        }
    }
}

/// Population standard deviation over mean; 0 for empty or zero-mean input.
pub(crate) fn coefficient_of_variation(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    if mean <= f64::EPSILON {
        return 0.0;
    }
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    variance.sqrt() / mean
}

/// Why a computation produced no partition set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum PlanFailure {
    /// The request cannot be served by this strategy; nothing was attempted.
    Unsupported(String),
    /// The strategy ran and produced an unusable result.
    Failed(String),
}

/// Compute a partition set for `shape`.
pub(crate) fn compute(
    shape: &GridShape,
    strategy: PartitionStrategy,
    request: &PartitionRequest,
    config: &TopologyConfig,
) -> Result<Vec<Partition>, PlanFailure> {
    let total = shape.cell_count();
    let count = match strategy {
        PartitionStrategy::Custom => request
            .assigner
            .as_ref()
            .map(|assigner| assigner.partition_count())
            .ok_or_else(|| PlanFailure::Unsupported("custom requires a cell assigner".into()))?,
        _ => request.partition_count,
    };
    if count == 0 || u64::from(count) > total {
        return Err(PlanFailure::Unsupported(format!(
            "partition count {count} must be between 1 and {total} cells"
        )));
    }

    let mut partitions = match strategy {
        PartitionStrategy::Grid3d => grid_blocks(shape, count)?,
        PartitionStrategy::SpatialHash => {
            let per_partition = u32::try_from(config.spatial_hash_buckets_per_partition.max(1))
                .unwrap_or(u32::MAX);
            spatial_hash(shape, count, count.saturating_mul(per_partition))?
        }
        PartitionStrategy::HilbertCurve => hilbert_runs(shape, count),
        PartitionStrategy::LoadBalanced => load_balanced(
            shape,
            count,
            request.load_model.as_deref(),
            config.load_balance_iterations,
        )?,
        PartitionStrategy::Custom => match request.assigner.as_deref() {
            Some(assigner) => custom(shape, count, assigner)?,
            None => return Err(PlanFailure::Unsupported("custom requires a cell assigner".into())),
        },
    };

    if strategy != PartitionStrategy::LoadBalanced
        && let Some(model) = request.load_model.as_deref()
    {
        apply_load_model(shape, &mut partitions, model);
    }

    let assigned: u64 = partitions.iter().map(|p| p.cell_count).sum();
    if assigned != total {
        return Err(PlanFailure::Failed(format!(
            "partitions cover {assigned} cells but the grid has {total}"
        )));
    }
    if let Some(empty) = partitions.iter().find(|p| p.cell_count == 0) {
        return Err(PlanFailure::Failed(format!("{} received no cells", empty.id)));
    }
    Ok(partitions)
}

fn partition(id: u32, cell_count: u64, bounds: BoundingBox, cells: CellSet) -> Partition {
    Partition {
        id: PartitionId(id),
        cell_count,
        bounds,
        cells,
        assigned_node: None,
        load: cell_count as f64,
    }
}

/// Inclusive ranges splitting `len` into `parts` near-equal runs, larger first.
fn split_axis(len: u32, parts: u32) -> Vec<(u32, u32)> {
    let base = len / parts;
    let extra = len % parts;
    let mut start = 0;
    (0..parts)
        .map(|i| {
            let size = base + u32::from(i < extra);
            let range = (start, start + size - 1);
            start += size;
            range
        })
        .collect()
}

/// Factorisation of `count` into per-axis block counts with the smallest block
/// surface; the first candidate in (x, y) ascending order wins ties.
fn block_factors(shape: &GridShape, count: u32) -> Option<[u32; 3]> {
    let mut best: Option<([u32; 3], u64)> = None;
    for px in (1..=count).filter(|d| count % d == 0 && *d <= shape.width) {
        let rest = count / px;
        for py in (1..=rest).filter(|d| rest % d == 0 && *d <= shape.height) {
            let pz = rest / py;
            if pz > shape.depth {
                continue;
            }
            let bx = u64::from(shape.width.div_ceil(px));
            let by = u64::from(shape.height.div_ceil(py));
            let bz = u64::from(shape.depth.div_ceil(pz));
            let surface = bx * by + by * bz + bx * bz;
            if best.is_none_or(|(_, score)| surface < score) {
                best = Some(([px, py, pz], surface));
            }
        }
    }
    best.map(|(factors, _)| factors)
}

fn grid_blocks(shape: &GridShape, count: u32) -> Result<Vec<Partition>, PlanFailure> {
    let [px, py, pz] = block_factors(shape, count).ok_or_else(|| {
        PlanFailure::Unsupported(format!("{shape} cannot be cut into {count} regular blocks"))
    })?;
    let (xs, ys, zs) = (
        split_axis(shape.width, px),
        split_axis(shape.height, py),
        split_axis(shape.depth, pz),
    );
    let mut partitions = Vec::with_capacity(count as usize);
    for &(z0, z1) in &zs {
        for &(y0, y1) in &ys {
            for &(x0, x1) in &xs {
                let bounds = BoundingBox {
                    min: CellCoord::new(x0, y0, z0),
                    max: CellCoord::new(x1, y1, z1),
                };
                let id = partitions.len() as u32;
                partitions.push(partition(id, bounds.volume(), bounds, CellSet::Block));
            }
        }
    }
    Ok(partitions)
}

/// Accumulates counts and bounds while cells are attributed to owners.
struct Accumulator {
    counts: Vec<u64>,
    bounds: Vec<Option<BoundingBox>>,
}

impl Accumulator {
    fn new(count: u32) -> Self {
        Self {
            counts: vec![0; count as usize],
            bounds: vec![None; count as usize],
        }
    }

    fn add(&mut self, owner: usize, coord: CellCoord) {
        self.counts[owner] += 1;
        match &mut self.bounds[owner] {
            Some(bounds) => bounds.include(coord),
            slot @ None => *slot = Some(BoundingBox::point(coord)),
        }
    }

    fn finish(
        self,
        mut cells: impl FnMut(usize) -> CellSet,
    ) -> Result<Vec<Partition>, PlanFailure> {
        self.counts
            .into_iter()
            .zip(self.bounds)
            .enumerate()
            .map(|(owner, (count, bounds))| {
                let bounds = bounds
                    .ok_or_else(|| PlanFailure::Failed(format!("p{owner} received no cells")))?;
                Ok(partition(owner as u32, count, bounds, cells(owner)))
            })
            .collect()
    }
}

/// Largest-first bucket packing onto the least-filled partition.
fn spatial_hash(shape: &GridShape, count: u32, buckets: u32) -> Result<Vec<Partition>, PlanFailure> {
    let buckets = buckets.max(count);
    let mut sizes = vec![0_u64; buckets as usize];
    for coord in shape.cells() {
        sizes[cell_bucket(coord, buckets) as usize] += 1;
    }

    let mut order: Vec<u32> = (0..buckets).collect();
    order.sort_by_key(|bucket| (Reverse(sizes[*bucket as usize]), *bucket));
    let mut fill = vec![0_u64; count as usize];
    let mut owner_of_bucket = vec![0_usize; buckets as usize];
    let mut owned: Vec<Vec<u32>> = vec![Vec::new(); count as usize];
    for bucket in order {
        let target = fill
            .iter()
            .enumerate()
            .min_by_key(|(idx, filled)| (**filled, *idx))
            .map_or(0, |(idx, _)| idx);
        fill[target] += sizes[bucket as usize];
        owner_of_bucket[bucket as usize] = target;
        owned[target].push(bucket);
    }

    let mut acc = Accumulator::new(count);
    for coord in shape.cells() {
        acc.add(owner_of_bucket[cell_bucket(coord, buckets) as usize], coord);
    }
    acc.finish(|owner| {
        let mut list = std::mem::take(&mut owned[owner]);
        list.sort_unstable();
        CellSet::HashBuckets {
            buckets: list,
            modulus: buckets,
        }
    })
}

fn hilbert_runs(shape: &GridShape, count: u32) -> Vec<Partition> {
    let bits = hilbert_order(shape);
    let mut cells: Vec<(u64, CellCoord)> = shape
        .cells()
        .map(|coord| (hilbert_index(coord, bits), coord))
        .collect();
    cells.sort_unstable_by_key(|(index, _)| *index);

    let total = cells.len() as u64;
    let base = total / u64::from(count);
    let extra = total % u64::from(count);
    let mut partitions = Vec::with_capacity(count as usize);
    let mut offset = 0_usize;
    for id in 0..count {
        let size = (base + u64::from(u64::from(id) < extra)) as usize;
        let run = &cells[offset..offset + size];
        offset += size;
        let mut bounds = BoundingBox::point(run[0].1);
        for (_, coord) in run {
            bounds.include(*coord);
        }
        let start = run[0].0;
        let end = run[run.len() - 1].0 + 1;
        partitions.push(partition(
            id,
            size as u64,
            bounds,
            CellSet::CurveRange { bits, start, end },
        ));
    }
    partitions
}

fn load_balanced(
    shape: &GridShape,
    count: u32,
    model: Option<&dyn LoadModel>,
    iterations: usize,
) -> Result<Vec<Partition>, PlanFailure> {
    let extents = shape.extents();
    let axis = (0..3)
        .max_by_key(|axis| (extents[*axis], Reverse(*axis)))
        .unwrap_or(0);
    let length = extents[axis];
    if count > length {
        return Err(PlanFailure::Unsupported(format!(
            "load_balanced slabs need {count} <= {length} slices along the longest axis"
        )));
    }

    let slice_cells = shape.cell_count() / u64::from(length);
    let mut slice_load = vec![0.0_f64; length as usize];
    match model {
        Some(model) => {
            for coord in shape.cells() {
                let position = [coord.x, coord.y, coord.z][axis] as usize;
                slice_load[position] += model.load(coord).max(0.0);
            }
        }
        None => slice_load.fill(slice_cells as f64),
    }

    let mut cuts = initial_cuts(&slice_load, count as usize);
    refine_cuts(&slice_load, &mut cuts, iterations);

    let full = shape.full_bounds();
    let mut partitions = Vec::with_capacity(count as usize);
    for (id, window) in cuts.windows(2).enumerate() {
        let (lo, hi) = (window[0], window[1]);
        let mut bounds = full;
        match axis {
            0 => (bounds.min.x, bounds.max.x) = (lo as u32, hi as u32 - 1),
            1 => (bounds.min.y, bounds.max.y) = (lo as u32, hi as u32 - 1),
            _ => (bounds.min.z, bounds.max.z) = (lo as u32, hi as u32 - 1),
        }
        let mut slab = partition(id as u32, bounds.volume(), bounds, CellSet::Block);
        slab.load = slice_load[lo..hi].iter().sum();
        partitions.push(slab);
    }
    Ok(partitions)
}

/// Boundaries `0 = c0 < c1 < .. < cN = len` placed at cumulative load targets.
fn initial_cuts(loads: &[f64], parts: usize) -> Vec<usize> {
    let total: f64 = loads.iter().sum();
    let mut cuts = vec![0];
    let mut acc = 0.0;
    for (idx, load) in loads.iter().enumerate() {
        acc += load;
        let placed = cuts.len();
        if placed == parts {
            break;
        }
        let remaining_slices = loads.len() - (idx + 1);
        let remaining_parts = parts - placed;
        let target = total * placed as f64 / parts as f64;
        if (acc >= target && remaining_slices >= remaining_parts)
            || remaining_slices == remaining_parts
        {
            cuts.push(idx + 1);
        }
    }
    cuts.push(loads.len());
    cuts
}

/// Nudge interior boundaries one slice at a time while the two adjacent slabs
/// move closer in load; stops early when a pass changes nothing.
fn refine_cuts(loads: &[f64], cuts: &mut [usize], iterations: usize) {
    let sum = |lo: usize, hi: usize| loads[lo..hi].iter().sum::<f64>();
    for _ in 0..iterations {
        let mut moved = false;
        for k in 1..cuts.len() - 1 {
            let (lo, mid, hi) = (cuts[k - 1], cuts[k], cuts[k + 1]);
            let current = (sum(lo, mid) - sum(mid, hi)).abs();
            if mid > lo + 1 && (sum(lo, mid - 1) - sum(mid - 1, hi)).abs() < current {
                cuts[k] = mid - 1;
                moved = true;
            } else if mid + 1 < hi && (sum(lo, mid + 1) - sum(mid + 1, hi)).abs() < current {
                cuts[k] = mid + 1;
                moved = true;
            }
        }
        if !moved {
            break;
        }
    }
}

fn custom(
    shape: &GridShape,
    count: u32,
    assigner: &dyn CellAssigner,
) -> Result<Vec<Partition>, PlanFailure> {
    let mut acc = Accumulator::new(count);
    let mut ranges: Vec<Vec<(u64, u64)>> = vec![Vec::new(); count as usize];
    for (ordinal, coord) in shape.cells().enumerate() {
        let owner = assigner.assign(coord);
        if owner >= count {
            return Err(PlanFailure::Failed(format!(
                "assigner placed ({}, {}, {}) in partition {owner} but declared {count}",
                coord.x, coord.y, coord.z
            )));
        }
        let owner = owner as usize;
        acc.add(owner, coord);
        let ordinal = ordinal as u64;
        match ranges[owner].last_mut() {
            Some((_, end)) if *end == ordinal => *end += 1,
            _ => ranges[owner].push((ordinal, ordinal + 1)),
        }
    }
    acc.finish(|owner| CellSet::Ordinals {
        ranges: std::mem::take(&mut ranges[owner]),
    })
}

fn apply_load_model(shape: &GridShape, partitions: &mut [Partition], model: &dyn LoadModel) {
    for p in partitions.iter_mut() {
        p.load = 0.0;
    }
    for coord in shape.cells() {
        if let Some(owner) = partitions.iter_mut().find(|p| p.contains(shape, coord)) {
            owner.load += model.load(coord).max(0.0);
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use proptest::prelude::*;

    use super::*;

    fn plan(shape: GridShape, strategy: PartitionStrategy, count: u32) -> Vec<Partition> {
        compute(
            &shape,
            strategy,
            &PartitionRequest::with_count(count),
            &TopologyConfig::default(),
        )
        .unwrap()
    }

    fn assert_exclusive(shape: &GridShape, partitions: &[Partition]) {
        for coord in shape.cells() {
            let owners = partitions.iter().filter(|p| p.contains(shape, coord)).count();
            assert_eq!(owners, 1, "{coord:?} owned {owners} times");
        }
    }

    struct Halves;

    impl CellAssigner for Halves {
        fn partition_count(&self) -> u32 {
            2
        }

        fn assign(&self, coord: CellCoord) -> u32 {
            u32::from(coord.x >= 2)
        }
    }

    struct Broken;

    impl CellAssigner for Broken {
        fn partition_count(&self) -> u32 {
            2
        }

        fn assign(&self, _coord: CellCoord) -> u32 {
            5
        }
    }

    struct HotCorner;

    impl LoadModel for HotCorner {
        fn load(&self, coord: CellCoord) -> f64 {
            if coord.x < 2 { 10.0 } else { 1.0 }
        }
    }

    #[test]
    fn grid_blocks_split_evenly() {
        let shape = GridShape::new(12, 12, 12);
        let partitions = plan(shape, PartitionStrategy::Grid3d, 8);
        let metrics = PartitionMetrics::from_partitions(&shape, &partitions);
        assert_eq!(metrics.partition_count, 8);
        assert_eq!(metrics.cells_per_partition, 216);
        assert_eq!(metrics.max_partition_size, 216);
        assert!(metrics.load_variance.abs() < 1e-12);
        assert_exclusive(&shape, &partitions);
    }

    #[test]
    fn prime_counts_fall_back_to_slabs() {
        let shape = GridShape::new(10, 4, 4);
        let partitions = plan(shape, PartitionStrategy::Grid3d, 5);
        assert_eq!(partitions.len(), 5);
        assert!(partitions.iter().all(|p| p.cell_count == 32));
    }

    #[test]
    fn strategy_labels_parse() {
        assert_eq!(
            "Hilbert_Curve".parse::<PartitionStrategy>().unwrap(),
            PartitionStrategy::HilbertCurve
        );
        assert!("voronoi".parse::<PartitionStrategy>().is_err());
    }

    #[test]
    fn non_block_strategies_own_every_cell_once() {
        let shape = GridShape::new(6, 5, 3);
        for strategy in [PartitionStrategy::SpatialHash, PartitionStrategy::HilbertCurve] {
            let partitions = plan(shape, strategy, 4);
            assert_eq!(partitions.len(), 4);
            assert_exclusive(&shape, &partitions);
        }
    }

    #[test]
    fn custom_assigner_is_respected() {
        let shape = GridShape::new(4, 2, 2);
        let request = PartitionRequest {
            assigner: Some(Arc::new(Halves)),
            ..PartitionRequest::default()
        };
        let partitions = compute(
            &shape,
            PartitionStrategy::Custom,
            &request,
            &TopologyConfig::default(),
        )
        .unwrap();
        assert_eq!(partitions.len(), 2);
        assert_eq!(partitions[0].cell_count, 8);
        assert_exclusive(&shape, &partitions);
    }

    #[test]
    fn custom_failures_are_classified() {
        let shape = GridShape::new(4, 2, 2);
        let config = TopologyConfig::default();
        let missing = compute(
            &shape,
            PartitionStrategy::Custom,
            &PartitionRequest::with_count(2),
            &config,
        );
        assert!(matches!(missing, Err(PlanFailure::Unsupported(_))));

        let request = PartitionRequest {
            assigner: Some(Arc::new(Broken)),
            ..PartitionRequest::default()
        };
        let broken = compute(&shape, PartitionStrategy::Custom, &request, &config);
        assert!(matches!(broken, Err(PlanFailure::Failed(_))));
    }

    #[test]
    fn load_balanced_shrinks_hot_slabs() {
        let shape = GridShape::new(16, 2, 2);
        let request = PartitionRequest {
            partition_count: 2,
            load_model: Some(Arc::new(HotCorner)),
            ..PartitionRequest::default()
        };
        let partitions = compute(
            &shape,
            PartitionStrategy::LoadBalanced,
            &request,
            &TopologyConfig::default(),
        )
        .unwrap();
        assert!(partitions[0].cell_count < partitions[1].cell_count);
        let uniform = plan(shape, PartitionStrategy::LoadBalanced, 2);
        let weighted = PartitionMetrics::from_partitions(&shape, &partitions);
        assert!(weighted.load_variance < 0.5);
        assert_eq!(uniform[0].cell_count, 32);
    }

    #[test]
    fn oversized_counts_are_unsupported() {
        let result = compute(
            &GridShape::new(2, 2, 2),
            PartitionStrategy::Grid3d,
            &PartitionRequest::with_count(9),
            &TopologyConfig::default(),
        );
        assert!(matches!(result, Err(PlanFailure::Unsupported(_))));
    }

    proptest! {
        #[test]
        fn cell_counts_are_conserved(
            w in 1_u32..9,
            h in 1_u32..9,
            d in 1_u32..9,
            count in 1_u32..6,
            pick in 0_usize..4,
        ) {
            let shape = GridShape::new(w, h, d);
            let strategy = PartitionStrategy::ALL[pick];
            let result = compute(
                &shape,
                strategy,
                &PartitionRequest::with_count(count),
                &TopologyConfig::default(),
            );
            if let Ok(partitions) = result {
                let total: u64 = partitions.iter().map(|p| p.cell_count).sum();
                prop_assert_eq!(total, shape.cell_count());
            }
        }
    }
}
