use std::{num::NonZeroUsize, path::PathBuf};

use serde::{Deserialize, Serialize};

/// The knobs of a training run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainConfig {
    /// The amount of optimizer iterations after which training gives up.
    pub max_epoch: usize,
    pub batch_size: NonZeroUsize,
    pub learning_rate: f32,
    /// The share of the loss that is the mean error, the rest is the max error.
    #[serde(default = "default_weight")]
    pub weight: f32,
    /// Where improved models are persisted, nothing is written when unset.
    #[serde(default)]
    pub checkpoint_path: Option<PathBuf>,
    /// The amount of iterations between validations.
    #[serde(default = "default_log_every")]
    pub log_every: usize,
    /// The validation loss at which training stops early.
    #[serde(default = "default_tolerance")]
    pub tolerance: f32,
    #[serde(default)]
    pub seed: Option<u64>,
}

fn default_weight() -> f32 {
    1.
}

fn default_log_every() -> usize {
    1000
}

fn default_tolerance() -> f32 {
    1e-8
}

impl TrainConfig {
    /// Creates a new `TrainConfig` with the default weight, tolerance and logging interval.
    ///
    /// # Arguments
    /// * `max_epoch` - The amount of optimizer iterations after which training gives up.
    /// * `batch_size` - The amount of samples per iteration.
    /// * `learning_rate` - The step size of the optimizer.
    pub fn new(max_epoch: usize, batch_size: NonZeroUsize, learning_rate: f32) -> Self {
        Self {
            max_epoch,
            batch_size,
            learning_rate,
            weight: default_weight(),
            checkpoint_path: None,
            log_every: default_log_every(),
            tolerance: default_tolerance(),
            seed: None,
        }
    }
}
