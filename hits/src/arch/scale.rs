use std::fmt;

use serde::{Deserialize, Serialize};

/// Which of the two residual blocks of a `DualResNet` takes a step.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scale {
    /// Advances the state by `step_size` base units.
    Large,
    /// Advances the state by a single base unit.
    Small,
}

impl Scale {
    /// Returns how many base units a step of this scale covers.
    ///
    /// # Arguments
    /// * `step_size` - The stride of the large block.
    pub fn units(self, step_size: usize) -> usize {
        match self {
            Scale::Large => step_size,
            Scale::Small => 1,
        }
    }
}

impl fmt::Display for Scale {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scale::Large => write!(f, "large"),
            Scale::Small => write!(f, "small"),
        }
    }
}
