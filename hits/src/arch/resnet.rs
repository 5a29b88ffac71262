use std::ops::Range;

use ndarray::{Array2, Array3, ArrayView2, Axis};
use rand::Rng;
use serde::{Deserialize, Serialize};

use super::{ActFn, BlockTrace, ResidualBlock, Scale};
use crate::{
    MlErr, Result,
    dataset::MultiscaleDataset,
    forecast::{self, ForecastLevel, ScaledStep},
};

/// Everything needed to rebuild a `DualResNet` besides its parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResNetConfig {
    /// Layer widths shared by both blocks, `[n_dim, hidden.., n_dim]`.
    pub arch: Vec<usize>,
    #[serde(default)]
    pub act_fn: ActFn,
    /// The base time unit.
    pub dt: f32,
    /// The stride of the large block, in base units.
    pub step_size: usize,
}

/// The record of a traced composition, consumed by `DualResNet::backward`.
#[derive(Debug, Clone)]
pub struct Tape {
    steps: Vec<(Scale, BlockTrace)>,
}

impl Tape {
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// A residual network approximating the flow map of a dynamical system at two resolutions.
///
/// The `large` block advances a state by `step_size` base units and the `small` block by
/// one. Both blocks share the architecture and live in one flat parameter buffer laid out
/// as `[large | small]`.
#[derive(Debug, Clone)]
pub struct DualResNet {
    config: ResNetConfig,
    large: ResidualBlock,
    small: ResidualBlock,
    params: Vec<f32>,
}

impl DualResNet {
    /// Creates a new `DualResNet` with freshly initialized parameters.
    ///
    /// # Arguments
    /// * `config` - The architecture and time scales of the model.
    /// * `rng` - The random number generator used for initialization.
    ///
    /// # Returns
    /// A new `DualResNet` or an error if the configuration is invalid.
    pub fn new<R: Rng + ?Sized>(config: ResNetConfig, rng: &mut R) -> Result<Self> {
        let (large, small) = Self::blocks(&config)?;

        let mut params = large.init(rng)?;
        params.extend(small.init(rng)?);

        Ok(Self {
            config,
            large,
            small,
            params,
        })
    }

    /// Rebuilds a `DualResNet` from a configuration and the parameters of both blocks.
    ///
    /// # Returns
    /// The model or an error if the configuration is invalid or the parameter counts don't
    /// match the architecture.
    pub fn from_params(
        config: ResNetConfig,
        large_params: &[f32],
        small_params: &[f32],
    ) -> Result<Self> {
        let (large, small) = Self::blocks(&config)?;

        for (what, got, expected) in [
            ("large block parameters", large_params.len(), large.size()),
            ("small block parameters", small_params.len(), small.size()),
        ] {
            if got != expected {
                return Err(MlErr::SizeMismatch {
                    what,
                    got,
                    expected,
                });
            }
        }

        let mut params = Vec::with_capacity(large.size() + small.size());
        params.extend_from_slice(large_params);
        params.extend_from_slice(small_params);

        Ok(Self {
            config,
            large,
            small,
            params,
        })
    }

    fn blocks(config: &ResNetConfig) -> Result<(ResidualBlock, ResidualBlock)> {
        if config.step_size < 2 {
            return Err(MlErr::invalid(format!(
                "the large step must span at least 2 base units, got {}",
                config.step_size
            )));
        }

        if !(config.dt.is_finite() && config.dt > 0.) {
            return Err(MlErr::invalid(format!(
                "dt must be positive, got {}",
                config.dt
            )));
        }

        let large = ResidualBlock::new(&config.arch, config.act_fn)?;
        let small = ResidualBlock::new(&config.arch, config.act_fn)?;
        Ok((large, small))
    }

    pub fn config(&self) -> &ResNetConfig {
        &self.config
    }

    pub fn n_dim(&self) -> usize {
        self.large.n_dim()
    }

    pub fn dt(&self) -> f32 {
        self.config.dt
    }

    pub fn step_size(&self) -> usize {
        self.config.step_size
    }

    /// Returns the amount of parameters of both blocks together.
    pub fn num_params(&self) -> usize {
        self.params.len()
    }

    pub fn params(&self) -> &[f32] {
        &self.params
    }

    pub fn params_mut(&mut self) -> &mut [f32] {
        &mut self.params
    }

    /// Returns the parameter slice of one of the blocks.
    pub fn block_params(&self, scale: Scale) -> &[f32] {
        &self.params[self.range(scale)]
    }

    fn block(&self, scale: Scale) -> &ResidualBlock {
        match scale {
            Scale::Large => &self.large,
            Scale::Small => &self.small,
        }
    }

    fn range(&self, scale: Scale) -> Range<usize> {
        match scale {
            Scale::Large => 0..self.large.size(),
            Scale::Small => self.large.size()..self.large.size() + self.small.size(),
        }
    }

    /// Advances a batch of states by one step of the given scale, `x + block(x)`.
    ///
    /// # Arguments
    /// * `x` - A batch of states, one per row.
    /// * `scale` - Which block takes the step.
    ///
    /// # Returns
    /// The advanced states, with the same shape as `x`.
    pub fn step(&self, x: ArrayView2<f32>, scale: Scale) -> Result<Array2<f32>> {
        let mut y = self.block(scale).forward(self.block_params(scale), x)?;
        y += &x;
        Ok(y)
    }

    /// Applies `step` once per element of `seq`, in order.
    pub fn compose(&self, x: ArrayView2<f32>, seq: &[Scale]) -> Result<Array2<f32>> {
        let mut y = x.to_owned();
        for &scale in seq {
            y = self.step(y.view(), scale)?;
        }

        Ok(y)
    }

    /// Same as `compose` but records the tape needed by `backward`.
    pub fn compose_traced(
        &self,
        x: ArrayView2<f32>,
        seq: &[Scale],
    ) -> Result<(Array2<f32>, Tape)> {
        let mut steps = Vec::with_capacity(seq.len());
        let mut y = x.to_owned();

        for &scale in seq {
            let (mut next, trace) = self
                .block(scale)
                .forward_traced(self.block_params(scale), y.view())?;
            next += &y;
            steps.push((scale, trace));
            y = next;
        }

        Ok((y, Tape { steps }))
    }

    /// Backpropagates through a traced composition.
    ///
    /// # Arguments
    /// * `tape` - The tape of the composition being differentiated.
    /// * `d` - The derivative of the loss with respect to the composition output.
    /// * `grad` - A buffer of `self.num_params()` gradients, accumulated into.
    ///
    /// # Returns
    /// The derivative of the loss with respect to the composition input.
    pub fn backward(
        &self,
        tape: &Tape,
        mut d: Array2<f32>,
        grad: &mut [f32],
    ) -> Result<Array2<f32>> {
        if grad.len() != self.params.len() {
            return Err(MlErr::SizeMismatch {
                what: "model gradient",
                got: grad.len(),
                expected: self.params.len(),
            });
        }

        for (scale, trace) in tape.steps.iter().rev() {
            let range = self.range(*scale);
            let d_inc = self.block(*scale).backward(
                &self.params[range.clone()],
                &mut grad[range],
                trace,
                d.clone(),
            )?;
            d += &d_inc;
        }

        Ok(d)
    }

    /// Checks that `dataset` was prepared for this model.
    ///
    /// # Returns
    /// A `Consistency` error naming the first of `n_dim`, `dt` or `step_size` that differs.
    pub fn check_data_info(&self, dataset: &MultiscaleDataset) -> Result<()> {
        if self.n_dim() != dataset.n_dim() {
            return Err(MlErr::Consistency {
                field: "n_dim",
                model: self.n_dim().to_string(),
                dataset: dataset.n_dim().to_string(),
            });
        }

        if self.dt() != dataset.dt() {
            return Err(MlErr::Consistency {
                field: "dt",
                model: self.dt().to_string(),
                dataset: dataset.dt().to_string(),
            });
        }

        if self.step_size() != dataset.step_size() {
            return Err(MlErr::Consistency {
                field: "step_size",
                model: self.step_size().to_string(),
                dataset: dataset.step_size().to_string(),
            });
        }

        Ok(())
    }

    /// Forecasts `n_steps` base units by walking with the large block only.
    ///
    /// The large block lands on every multiple of `step_size`; the steps in between are
    /// linearly interpolated. Step 0 is the initial condition, copied as is.
    ///
    /// # Arguments
    /// * `x_init` - The initial states, one per row.
    /// * `n_steps` - The amount of steps to produce, starting at step 0.
    ///
    /// # Returns
    /// An array of shape `(n_test, n_steps, n_dim)`.
    pub fn single_scale_forecast(
        &self,
        x_init: ArrayView2<f32>,
        n_steps: usize,
    ) -> Result<Array3<f32>> {
        let (n_test, n_dim) = x_init.dim();
        if n_dim != self.n_dim() {
            return Err(MlErr::SizeMismatch {
                what: "initial state dimension",
                got: n_dim,
                expected: self.n_dim(),
            });
        }

        if n_steps == 0 {
            return Ok(Array3::zeros((n_test, 0, n_dim)));
        }

        let mut indices = vec![0];
        let mut preds = vec![x_init.to_owned()];
        let mut cur = 0;

        while cur < n_steps - 1 {
            let next = self.step(preds[preds.len() - 1].view(), Scale::Large)?;
            cur += self.step_size();
            indices.push(cur);
            preds.push(next);
        }

        let views: Vec<_> = preds.iter().map(|p| p.view()).collect();
        let values = ndarray::stack(Axis(1), &views)?;
        forecast::interpolate(&indices, values.view(), 0..n_steps)
    }

    /// Forecasts `n_steps` base units alternating this model's large and small blocks.
    ///
    /// # Returns
    /// An array of shape `(n_test, n_steps, n_dim)` holding steps `1..=n_steps`.
    pub fn multiscale_forecast(
        &self,
        x_init: ArrayView2<f32>,
        n_steps: usize,
    ) -> Result<Array3<f32>> {
        let large = ScaledStep::new(self, Scale::Large);
        let small = ScaledStep::new(self, Scale::Small);
        let levels = [
            ForecastLevel::new(&large, self.step_size()),
            ForecastLevel::new(&small, 1),
        ];

        forecast::multiscale_forecast(x_init, n_steps, &levels)
    }
}
