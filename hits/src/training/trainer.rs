use std::time::Instant;

use rand::{Rng, SeedableRng, rngs::StdRng, seq::SliceRandom};

use super::TrainConfig;
use crate::{
    MlErr, Result,
    arch::DualResNet,
    checkpoint,
    dataset::MultiscaleDataset,
    loss::CompositeLoss,
    optimization::{Adam, Optimizer},
};

/// The amount of leading iterations whose duration is logged.
const TIMED_ITERATIONS: usize = 10;

/// Where a training run stands.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrainState {
    Running,
    /// The best validation loss reached the tolerance.
    Converged,
    /// `max_epoch` iterations went by.
    Exhausted,
}

/// The outcome of `Trainer::train`.
#[derive(Clone, Debug, PartialEq)]
pub struct TrainReport {
    pub state: TrainState,
    /// The amount of iterations started, the last one may have stopped before its update.
    pub epochs: usize,
    pub optimizer_steps: usize,
    /// The best validation loss seen at a logging interval, `+∞` if none was.
    pub best_loss: f32,
    /// The amount of times the model was persisted.
    pub checkpoints: usize,
    /// The validation loss of the model as it was returned.
    pub last_val_loss: f32,
}

/// Generates a random number generator given (or not) a seed.
pub fn generate_rng(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_os_rng(),
    }
}

/// Trains a `DualResNet` with random minibatches of a `MultiscaleDataset`.
pub struct Trainer<O: Optimizer, R: Rng> {
    config: TrainConfig,
    optimizer: O,
    rng: R,
    grad: Vec<f32>,
}

impl Trainer<Adam, StdRng> {
    /// Creates a new `Trainer` driving an `Adam` optimizer seeded by the configuration.
    ///
    /// # Arguments
    /// * `config` - The knobs of the run.
    /// * `num_params` - The amount of parameters of the model to train.
    pub fn adam(config: TrainConfig, num_params: usize) -> Self {
        let optimizer = Adam::with_defaults(num_params, config.learning_rate);
        let rng = generate_rng(config.seed);
        Self::new(config, optimizer, rng)
    }
}

impl<O: Optimizer, R: Rng> Trainer<O, R> {
    /// Creates a new `Trainer`.
    ///
    /// # Arguments
    /// * `config` - The knobs of the run.
    /// * `optimizer` - The optimizer updating the model parameters.
    /// * `rng` - The source of the minibatch permutations.
    pub fn new(config: TrainConfig, optimizer: O, rng: R) -> Self {
        Self {
            config,
            optimizer,
            rng,
            grad: Vec::new(),
        }
    }

    pub fn config(&self) -> &TrainConfig {
        &self.config
    }

    /// Trains `model` until its validation loss reaches the tolerance or `max_epoch`
    /// iterations went by.
    ///
    /// Every iteration reshuffles the whole training split and takes its first `batch_size`
    /// samples. Every `log_every` iterations the validation loss is logged, and the model is
    /// persisted when it improved. A last validation at the end persists the model once more
    /// if it beats the best logged loss.
    ///
    /// # Arguments
    /// * `model` - The model to train, updated in place.
    /// * `dataset` - The data, which must have been prepared for `model`.
    /// * `loss` - The objective to minimize.
    ///
    /// # Returns
    /// A report of the run, or an error as soon as any loss stops being finite.
    pub fn train(
        &mut self,
        model: &mut DualResNet,
        dataset: &MultiscaleDataset,
        loss: &CompositeLoss,
    ) -> Result<TrainReport> {
        model.check_data_info(dataset)?;

        if self.config.log_every == 0 {
            return Err(MlErr::invalid("log_every must be positive"));
        }

        let weight = self.config.weight;
        let train = dataset.train();
        let batch_size = self.config.batch_size.get().min(train.len());
        let mut indices: Vec<usize> = (0..train.len()).collect();

        self.grad.clear();
        self.grad.resize(model.num_params(), 0.);

        log::info!(
            "training {} parameters on {} samples, batches of {batch_size}, up to {} iterations",
            model.num_params(),
            train.len(),
            self.config.max_epoch
        );

        let mut state = TrainState::Running;
        let mut best_loss = f32::INFINITY;
        let mut epoch = 0;
        let mut optimizer_steps = 0;
        let mut checkpoints = 0;

        while state == TrainState::Running {
            if epoch == self.config.max_epoch {
                state = TrainState::Exhausted;
                continue;
            }

            epoch += 1;
            let start = Instant::now();

            indices.shuffle(&mut self.rng);
            let (x, ys) = train.batch(&indices[..batch_size]);

            self.grad.fill(0.);
            let train_loss =
                loss.loss_and_grad(model, x.view(), ys.view(), weight, &mut self.grad)?;
            finite(epoch, train_loss)?;

            if best_loss <= self.config.tolerance {
                log::info!("best validation loss {best_loss:e} reached the tolerance");
                state = TrainState::Converged;
                continue;
            }

            self.optimizer.update_params(&self.grad, model.params_mut())?;
            optimizer_steps += 1;

            if epoch <= TIMED_ITERATIONS {
                log::debug!("iteration {epoch} took {:?}", start.elapsed());
            }

            if epoch % self.config.log_every == 0 {
                let val_loss = loss.loss(model, dataset.val_x(), dataset.val_ys(), weight)?;
                finite(epoch, val_loss)?;

                log::info!(
                    "epoch {epoch}: train loss {train_loss:.4e}, validation loss {val_loss:.4e}"
                );

                if val_loss < best_loss {
                    checkpoints += self.persist(model)?;
                    best_loss = val_loss;
                }
            }
        }

        let last_val_loss = loss.loss(model, dataset.val_x(), dataset.val_ys(), weight)?;
        finite(epoch, last_val_loss)?;

        if best_loss.is_finite() && last_val_loss < best_loss {
            checkpoints += self.persist(model)?;
            best_loss = last_val_loss;
        }

        log::info!(
            "training stopped after {epoch} iterations ({state:?}), best validation loss \
             {best_loss:.4e}"
        );

        Ok(TrainReport {
            state,
            epochs: epoch,
            optimizer_steps,
            best_loss,
            checkpoints,
            last_val_loss,
        })
    }

    /// Saves `model` if there's somewhere to save it.
    ///
    /// # Returns
    /// The amount of checkpoints written.
    fn persist(&self, model: &DualResNet) -> Result<usize> {
        let Some(path) = &self.config.checkpoint_path else {
            return Ok(0);
        };

        checkpoint::save(model, path)?;
        log::info!("saved improved model to {}", path.display());
        Ok(1)
    }
}

fn finite(epoch: usize, loss: f32) -> Result<()> {
    if loss.is_finite() {
        Ok(())
    } else {
        Err(MlErr::NonFinite { epoch, loss })
    }
}
