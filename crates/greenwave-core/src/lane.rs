//! Lane identifiers.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Number of lanes in one intersection batch.
pub const LANE_COUNT: usize = 4;

/// One of the four approach directions, in the order the optimizer expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Lane {
    North,
    South,
    West,
    East,
}

impl Lane {
    /// All lanes in optimizer argument order.
    pub const ALL: [Lane; LANE_COUNT] = [Lane::North, Lane::South, Lane::West, Lane::East];

    /// Lane for a positional index, if in range.
    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    /// Positional index of this lane.
    pub fn index(self) -> usize {
        match self {
            Lane::North => 0,
            Lane::South => 1,
            Lane::West => 2,
            Lane::East => 3,
        }
    }

    /// Key used for this lane's green time in optimizer output.
    pub fn as_str(self) -> &'static str {
        match self {
            Lane::North => "north",
            Lane::South => "south",
            Lane::West => "west",
            Lane::East => "east",
        }
    }
}

impl fmt::Display for Lane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
