//! Identifier newtypes and the lane axis enum shared by every component.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Generate a fresh random identifier.
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Wrap an existing UUID.
            #[must_use]
            pub const fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Borrow the underlying UUID.
            #[must_use]
            pub const fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "-{}"), self.0.simple())
            }
        }
    };
}

uuid_id!(
    /// Identifies a topology owned by the topology manager.
    TopologyId,
    "topo"
);
uuid_id!(
    /// Identifies a lane coordinator.
    LaneId,
    "lane"
);
uuid_id!(
    /// Identifies a cross-lane coupling.
    CouplingId,
    "coupling"
);
uuid_id!(
    /// Identifies a ruleset lineage; versions share the id.
    RuleSetId,
    "ruleset"
);
uuid_id!(
    /// Identifies a single consensus burst.
    ConsensusRunId,
    "consensus"
);
uuid_id!(
    /// Identifies a rule oracle instance.
    OracleId,
    "oracle"
);

/// Partition ids are dense ordinals within one topology; ties in the
/// rebalance heuristic are broken by the lowest id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartitionId(pub u32);

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "p{}", self.0)
    }
}

/// Stable compute node identifier as advertised by the node itself.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    /// Create a node id from any string-like value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the raw identifier.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// One of the three orthogonal processing lanes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dimension {
    /// X axis lane.
    X,
    /// Y axis lane.
    Y,
    /// Z axis lane.
    Z,
}

impl Dimension {
    /// All lanes in canonical order.
    pub const ALL: [Self; 3] = [Self::X, Self::Y, Self::Z];

    /// Lowercase label used in names and the deployment wire format.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::X => "x",
            Self::Y => "y",
            Self::Z => "z",
        }
    }

    /// Index into per-axis arrays (`x = 0`, `y = 1`, `z = 2`).
    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            Self::X => 0,
            Self::Y => 1,
            Self::Z => 2,
        }
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raised when a string does not name a lane axis.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown lane dimension '{0}' (expected one of x, y, z)")]
pub struct DimensionParseError(pub String);

impl FromStr for Dimension {
    type Err = DimensionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "x" => Ok(Self::X),
            "y" => Ok(Self::Y),
            "z" => Ok(Self::Z),
            other => Err(DimensionParseError(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn dimension_parses_case_insensitively() {
        assert_eq!("X".parse::<Dimension>().unwrap(), Dimension::X);
        assert_eq!(" z ".parse::<Dimension>().unwrap(), Dimension::Z);
        assert!("w".parse::<Dimension>().is_err());
    }

    #[test]
    fn ids_render_with_prefix() {
        let id = TopologyId::new();
        assert!(id.to_string().starts_with("topo-"));
        assert_eq!(PartitionId(7).to_string(), "p7");
    }
}
