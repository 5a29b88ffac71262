use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, bail};
use hits::{
    arch::{ActFn, ResNetConfig, Scale},
    loss::CompositionTable,
    training::TrainConfig,
};
use serde::{Deserialize, Serialize};

/// Which compositions the loss scores.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Objective {
    /// Every ordering of large and small steps up to `n_horizons`.
    #[default]
    Exhaustive,
    /// The fixed five horizon table, only valid with `step_size == 2`.
    Legacy,
    SingleSmall,
    SingleLarge,
}

/// Everything a training run needs.
#[derive(Debug, Clone, Deserialize)]
pub struct RunConfig {
    /// A safetensors file with `train`, `val` and `test` trajectories.
    pub data: PathBuf,
    /// Where the model is loaded from, if present, and persisted to.
    pub checkpoint: PathBuf,
    pub dt: f32,
    pub step_size: usize,
    pub n_horizons: usize,
    pub arch: Vec<usize>,
    #[serde(default)]
    pub activation: ActFn,
    #[serde(default)]
    pub objective: Objective,
    pub training: TrainConfig,
    /// How many steps of the test trajectories to forecast after training.
    #[serde(default)]
    pub forecast_steps: Option<usize>,
}

impl RunConfig {
    /// Reads a JSON run configuration.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("couldn't read config {}", path.display()))?;

        serde_json::from_str(&raw).with_context(|| format!("malformed config {}", path.display()))
    }

    pub fn model_config(&self) -> ResNetConfig {
        ResNetConfig {
            arch: self.arch.clone(),
            act_fn: self.activation,
            dt: self.dt,
            step_size: self.step_size,
        }
    }

    /// The training knobs, persisting to `checkpoint` unless told otherwise.
    pub fn train_config(&self) -> TrainConfig {
        let mut training = self.training.clone();
        training
            .checkpoint_path
            .get_or_insert_with(|| self.checkpoint.clone());
        training
    }

    /// Builds the composition table of the chosen objective.
    pub fn table(&self) -> Result<CompositionTable> {
        let table = match self.objective {
            Objective::Exhaustive => CompositionTable::exhaustive(self.step_size, self.n_horizons)?,
            Objective::Legacy => {
                if self.step_size != 2 || self.n_horizons < 5 {
                    bail!(
                        "the legacy objective needs step_size 2 and 5 horizons, got {} and {}",
                        self.step_size,
                        self.n_horizons
                    );
                }

                CompositionTable::legacy()
            }
            Objective::SingleSmall => {
                CompositionTable::single_scale(Scale::Small, self.step_size, self.n_horizons)?
            }
            Objective::SingleLarge => {
                let n_steps = self.n_horizons / self.step_size;
                if n_steps == 0 {
                    bail!(
                        "{} horizons don't reach a single large step of {}",
                        self.n_horizons,
                        self.step_size
                    );
                }

                CompositionTable::single_scale(Scale::Large, self.step_size, n_steps)?
            }
        };

        Ok(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(objective: &str, step_size: usize, n_horizons: usize) -> RunConfig {
        let json = format!(
            r#"{{
                "data": "data.safetensors",
                "checkpoint": "model.safetensors",
                "dt": 0.01,
                "step_size": {step_size},
                "n_horizons": {n_horizons},
                "arch": [2, 64, 2],
                "activation": {{ "kind": "tanh" }},
                "objective": "{objective}",
                "training": {{ "max_epoch": 100, "batch_size": 16, "learning_rate": 0.001 }}
            }}"#
        );
        serde_json::from_str(&json).unwrap()
    }

    #[test]
    fn checkpoint_path_defaults_to_the_model_file() {
        let config = config("exhaustive", 4, 8);
        assert_eq!(
            config.train_config().checkpoint_path,
            Some(PathBuf::from("model.safetensors"))
        );
        assert_eq!(config.model_config().act_fn, ActFn::Tanh);
        assert_eq!(config.forecast_steps, None);
    }

    #[test]
    fn objectives_build_their_tables() {
        assert_eq!(config("legacy", 2, 5).table().unwrap().len(), 16);
        assert!(config("legacy", 4, 5).table().is_err());
        assert_eq!(config("single_large", 4, 9).table().unwrap().len(), 2);
        assert_eq!(config("single_small", 4, 9).table().unwrap().len(), 9);
        assert!(config("single_large", 4, 3).table().is_err());
    }
}
