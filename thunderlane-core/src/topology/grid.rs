//! Grid geometry and the topology record owned by the topology manager.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::distribution::{ComputeNode, DistributionMetrics};
use super::partition::{Partition, PartitionMetrics, PartitionStrategy};
use crate::error::{CoordinationError, Result};
use crate::types::{NodeId, PartitionId, TopologyId};

/// Integer cell coordinate inside a grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CellCoord {
    /// X position.
    pub x: u32,
    /// Y position.
    pub y: u32,
    /// Z position.
    pub z: u32,
}

impl CellCoord {
    /// Build a coordinate.
    #[must_use]
    pub const fn new(x: u32, y: u32, z: u32) -> Self {
        Self { x, y, z }
    }
}

/// Width × height × depth of a grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridShape {
    /// Cells along X.
    pub width: u32,
    /// Cells along Y.
    pub height: u32,
    /// Cells along Z.
    pub depth: u32,
}

impl GridShape {
    /// Build a shape.
    #[must_use]
    pub const fn new(width: u32, height: u32, depth: u32) -> Self {
        Self {
            width,
            height,
            depth,
        }
    }

    /// Total number of cells.
    #[must_use]
    pub const fn cell_count(&self) -> u64 {
        self.width as u64 * self.height as u64 * self.depth as u64
    }

    /// Extents as an array in x, y, z order.
    #[must_use]
    pub const fn extents(&self) -> [u32; 3] {
        [self.width, self.height, self.depth]
    }

    /// Row-major ordinal (x fastest) of a coordinate.
    #[must_use]
    pub const fn ordinal(&self, coord: CellCoord) -> u64 {
        (coord.z as u64 * self.height as u64 + coord.y as u64) * self.width as u64 + coord.x as u64
    }

    /// Inverse of [`Self::ordinal`].
    #[must_use]
    pub const fn coord(&self, ordinal: u64) -> CellCoord {
        let w = self.width as u64;
        let h = self.height as u64;
        CellCoord {
            x: (ordinal % w) as u32,
            y: ((ordinal / w) % h) as u32,
            z: (ordinal / (w * h)) as u32,
        }
    }

    /// Iterate every coordinate in row-major order.
    pub fn cells(&self) -> impl Iterator<Item = CellCoord> + '_ {
        (0..self.cell_count()).map(|ordinal| self.coord(ordinal))
    }

    /// Bounding box covering the whole grid.
    #[must_use]
    pub const fn full_bounds(&self) -> BoundingBox {
        BoundingBox {
            min: CellCoord::new(0, 0, 0),
            max: CellCoord::new(
                self.width.saturating_sub(1),
                self.height.saturating_sub(1),
                self.depth.saturating_sub(1),
            ),
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 || self.depth == 0 {
            return Err(CoordinationError::validation(
                "shape",
                format!("{self} has a zero extent"),
                "width, height and depth >= 1",
            ));
        }
        Ok(())
    }
}

impl fmt::Display for GridShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}x{}", self.width, self.height, self.depth)
    }
}

/// Inclusive axis-aligned bounding box.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    /// Lowest corner (inclusive).
    pub min: CellCoord,
    /// Highest corner (inclusive).
    pub max: CellCoord,
}

impl BoundingBox {
    /// Box containing exactly one cell.
    #[must_use]
    pub const fn point(coord: CellCoord) -> Self {
        Self {
            min: coord,
            max: coord,
        }
    }

    /// Grow the box to include `coord`.
    pub fn include(&mut self, coord: CellCoord) {
        self.min.x = self.min.x.min(coord.x);
        self.min.y = self.min.y.min(coord.y);
        self.min.z = self.min.z.min(coord.z);
        self.max.x = self.max.x.max(coord.x);
        self.max.y = self.max.y.max(coord.y);
        self.max.z = self.max.z.max(coord.z);
    }

    /// Whether the box contains `coord`.
    #[must_use]
    pub const fn contains(&self, coord: CellCoord) -> bool {
        coord.x >= self.min.x
            && coord.x <= self.max.x
            && coord.y >= self.min.y
            && coord.y <= self.max.y
            && coord.z >= self.min.z
            && coord.z <= self.max.z
    }

    /// Number of cells covered.
    #[must_use]
    pub const fn volume(&self) -> u64 {
        (self.max.x - self.min.x + 1) as u64
            * (self.max.y - self.min.y + 1) as u64
            * (self.max.z - self.min.z + 1) as u64
    }

    fn lo(&self) -> [u32; 3] {
        [self.min.x, self.min.y, self.min.z]
    }

    fn hi(&self) -> [u32; 3] {
        [self.max.x, self.max.y, self.max.z]
    }

    /// Shared surface with `other`.
    ///
    /// Face-adjacent boxes return the face area; boxes touching only along an
    /// edge or corner return 0. Overlapping boxes (interleaved partitions)
    /// return the overlap volume.
    #[must_use]
    pub fn contact(&self, other: &Self) -> u64 {
        let (a_lo, a_hi, b_lo, b_hi) = (self.lo(), self.hi(), other.lo(), other.hi());
        let mut overlap = [1_u64; 3];
        let mut touching = None;
        for axis in 0..3 {
            let lo = a_lo[axis].max(b_lo[axis]);
            let hi = a_hi[axis].min(b_hi[axis]);
            if lo <= hi {
                overlap[axis] = u64::from(hi - lo + 1);
            } else if a_hi[axis].checked_add(1) == Some(b_lo[axis])
                || b_hi[axis].checked_add(1) == Some(a_lo[axis])
            {
                if touching.is_some() {
                    return 0;
                }
                touching = Some(axis);
            } else {
                return 0;
            }
        }
        overlap.iter().product()
    }
}

/// Lattice family of the grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TopologyType {
    /// Plain rectangular lattice.
    #[default]
    Rectangular,
    /// Hexagonal columns.
    Hexagonal,
    /// Rectangular lattice with every axis wrapped.
    Torus,
    /// Spherical shell mapping.
    Spherical,
}

/// Boundary behaviour along one axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BoundaryCondition {
    /// Wraps around.
    #[default]
    Periodic,
    /// Fixed-value ghost cells.
    Fixed,
    /// Mirrors the edge cells.
    Reflective,
    /// Cells beyond the edge are absent.
    Open,
}

/// Boundary condition per axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct AxisBoundaries {
    /// X axis boundary.
    pub x: BoundaryCondition,
    /// Y axis boundary.
    pub y: BoundaryCondition,
    /// Z axis boundary.
    pub z: BoundaryCondition,
}

impl AxisBoundaries {
    /// Same boundary on every axis.
    #[must_use]
    pub const fn uniform(condition: BoundaryCondition) -> Self {
        Self {
            x: condition,
            y: condition,
            z: condition,
        }
    }

    fn all_periodic(&self) -> bool {
        [self.x, self.y, self.z]
            .iter()
            .all(|b| *b == BoundaryCondition::Periodic)
    }
}

/// Neighbourhood family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum NeighborhoodType {
    /// All cells within Chebyshev distance `radius`.
    #[default]
    Moore,
    /// All cells within Manhattan distance `radius`.
    VonNeumann,
    /// Hexagonal ring neighbourhood.
    Hexagonal,
}

/// Neighbourhood type and radius.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Neighborhood {
    /// Family.
    pub kind: NeighborhoodType,
    /// Radius in cells (>= 1).
    pub radius: u32,
}

impl Default for Neighborhood {
    fn default() -> Self {
        Self {
            kind: NeighborhoodType::Moore,
            radius: 1,
        }
    }
}

/// Parameters for creating a topology.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopologySpec {
    /// Display name.
    pub name: String,
    /// Grid extents.
    pub shape: GridShape,
    /// Lattice family.
    #[serde(default)]
    pub topology_type: TopologyType,
    /// Boundary conditions.
    #[serde(default)]
    pub boundaries: AxisBoundaries,
    /// Neighbourhood definition.
    #[serde(default)]
    pub neighborhood: Neighborhood,
}

impl TopologySpec {
    /// Rectangular grid with periodic boundaries and a radius-1 Moore neighbourhood.
    pub fn rectangular(name: impl Into<String>, shape: GridShape) -> Self {
        Self {
            name: name.into(),
            shape,
            topology_type: TopologyType::Rectangular,
            boundaries: AxisBoundaries::default(),
            neighborhood: Neighborhood::default(),
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        self.shape.validate()?;
        if self.neighborhood.radius == 0 {
            return Err(CoordinationError::validation(
                "neighborhood.radius",
                "radius 0 has no neighbours",
                "radius >= 1",
            ));
        }
        if self.topology_type == TopologyType::Torus && !self.boundaries.all_periodic() {
            return Err(CoordinationError::validation(
                "boundaries",
                "a torus wraps every axis",
                "periodic boundaries on x, y and z",
            ));
        }
        Ok(())
    }
}

/// Lifecycle of a topology record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TopologyStatus {
    /// Created, not yet partitioned.
    Pending,
    /// Partition set committed, not yet placed.
    Partitioned,
    /// Every partition is assigned to a node.
    Distributed,
    /// A partition or distribution step failed.
    Error,
}

impl TopologyStatus {
    /// Lowercase label.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Partitioned => "partitioned",
            Self::Distributed => "distributed",
            Self::Error => "error",
        }
    }
}

/// A partitioned grid and its placement onto compute nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Topology {
    /// Identifier.
    pub id: TopologyId,
    /// Display name.
    pub name: String,
    /// Grid extents.
    pub shape: GridShape,
    /// Lattice family.
    pub topology_type: TopologyType,
    /// Boundary conditions.
    pub boundaries: AxisBoundaries,
    /// Neighbourhood definition.
    pub neighborhood: Neighborhood,
    /// Strategy of the committed partition set.
    pub strategy: Option<PartitionStrategy>,
    /// Committed partition set.
    pub partitions: Vec<Partition>,
    /// Metrics of the committed partition set.
    pub partition_metrics: Option<PartitionMetrics>,
    /// Nodes the partitions are distributed over.
    pub nodes: Vec<ComputeNode>,
    /// Latest distribution metrics.
    pub distribution: Option<DistributionMetrics>,
    /// Lifecycle status.
    pub status: TopologyStatus,
    /// Last failure message, if any.
    pub last_error: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
}

impl Topology {
    pub(crate) fn from_spec(spec: TopologySpec) -> Self {
        let now = Utc::now();
        Self {
            id: TopologyId::new(),
            name: spec.name,
            shape: spec.shape,
            topology_type: spec.topology_type,
            boundaries: spec.boundaries,
            neighborhood: spec.neighborhood,
            strategy: None,
            partitions: Vec::new(),
            partition_metrics: None,
            nodes: Vec::new(),
            distribution: None,
            status: TopologyStatus::Pending,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Distribution health, or 0 when the topology is not distributed.
    #[must_use]
    pub fn distribution_health(&self) -> f64 {
        self.distribution
            .as_ref()
            .map_or(0.0, |metrics| metrics.distribution_health)
    }

    /// Current partition → node assignments.
    #[must_use]
    pub fn assignments(&self) -> BTreeMap<PartitionId, NodeId> {
        self.partitions
            .iter()
            .filter_map(|p| p.assigned_node.clone().map(|node| (p.id, node)))
            .collect()
    }

    /// Sum of committed partition cell counts.
    #[must_use]
    pub fn assigned_cells(&self) -> u64 {
        self.partitions.iter().map(|p| p.cell_count).sum()
    }

    pub(crate) fn mark_error(&mut self, reason: String) {
        self.status = TopologyStatus::Error;
        self.last_error = Some(reason);
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordinal_round_trips_corners() {
        let shape = GridShape::new(4, 3, 2);
        let last = CellCoord::new(3, 2, 1);
        assert_eq!(shape.ordinal(last), shape.cell_count() - 1);
        assert_eq!(shape.coord(shape.ordinal(last)), last);
    }

    #[test]
    fn contact_measures_shared_face() {
        let a = BoundingBox {
            min: CellCoord::new(0, 0, 0),
            max: CellCoord::new(5, 5, 5),
        };
        let b = BoundingBox {
            min: CellCoord::new(6, 0, 0),
            max: CellCoord::new(11, 5, 5),
        };
        let far = BoundingBox {
            min: CellCoord::new(8, 0, 0),
            max: CellCoord::new(11, 5, 5),
        };
        assert_eq!(a.contact(&b), 36);
        assert_eq!(a.contact(&far), 0);
    }

    #[test]
    fn torus_requires_periodic_boundaries() {
        let mut spec = TopologySpec::rectangular("t", GridShape::new(4, 4, 4));
        spec.topology_type = TopologyType::Torus;
        spec.boundaries.z = BoundaryCondition::Open;
        assert!(spec.validate().is_err());
    }
}
