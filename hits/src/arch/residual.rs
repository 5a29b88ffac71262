use ndarray::{Array2, ArrayView2};
use rand::Rng;

use super::{
    ActFn,
    layers::{Dense, DenseCache},
};
use crate::{MlErr, Result};

/// The per-layer caches of one traced call to a `ResidualBlock`.
#[derive(Debug, Clone)]
pub struct BlockTrace {
    caches: Vec<DenseCache>,
}

/// A feed-forward network predicting the increment to add to a state.
///
/// The block maps `n_dim` to `n_dim`, with the activation applied after every layer but
/// the last one. Adding the increment to the input is the caller's job.
#[derive(Debug, Clone)]
pub struct ResidualBlock {
    layers: Vec<Dense>,
    n_dim: usize,
    size: usize,
}

impl ResidualBlock {
    /// Creates a new `ResidualBlock`.
    ///
    /// # Arguments
    /// * `arch` - The width of every layer boundary, `[n_dim, hidden.., n_dim]`.
    /// * `act_fn` - The nonlinearity between layers.
    ///
    /// # Returns
    /// A new `ResidualBlock` or an error if the architecture doesn't map the state space
    /// onto itself.
    pub fn new(arch: &[usize], act_fn: ActFn) -> Result<Self> {
        if arch.len() < 2 {
            return Err(MlErr::invalid(format!(
                "an architecture needs at least two widths, got {arch:?}"
            )));
        }

        let n_dim = arch[0];
        if n_dim == 0 || arch[arch.len() - 1] != n_dim {
            return Err(MlErr::invalid(format!(
                "the first and last widths must be the same nonzero state dimension, got {arch:?}"
            )));
        }

        if arch.contains(&0) {
            return Err(MlErr::invalid(format!("zero width layer in {arch:?}")));
        }

        let nlayers = arch.len() - 1;
        let layers: Vec<_> = arch
            .windows(2)
            .enumerate()
            .map(|(i, w)| {
                let act_fn = (i + 1 < nlayers).then_some(act_fn);
                Dense::new((w[0], w[1]), act_fn)
            })
            .collect();

        let size = layers.iter().map(Dense::size).sum();

        Ok(Self {
            layers,
            n_dim,
            size,
        })
    }

    /// Returns the amount of parameters in this block.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn n_dim(&self) -> usize {
        self.n_dim
    }

    /// Samples a fresh parameter buffer for this block.
    pub fn init<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<Vec<f32>> {
        let mut params = Vec::with_capacity(self.size);
        for layer in &self.layers {
            params.extend(layer.init(rng)?);
        }

        Ok(params)
    }

    /// Computes the increment for a batch of states.
    ///
    /// # Arguments
    /// * `params` - This block's parameter slice.
    /// * `x` - A batch of states, one per row.
    pub fn forward(&self, params: &[f32], x: ArrayView2<f32>) -> Result<Array2<f32>> {
        let mut chunks = self.chunks(params)?.into_iter();
        let mut layers = self.layers.iter();

        // arch always yields at least one layer
        let (Some(first), Some(p)) = (layers.next(), chunks.next()) else {
            return Err(MlErr::invalid("residual block without layers"));
        };

        let mut out = first.forward(p, x)?;
        for (layer, p) in layers.zip(chunks) {
            out = layer.forward(p, out.view())?;
        }

        Ok(out)
    }

    /// Computes the increment for a batch of states, keeping what's needed to backpropagate.
    pub fn forward_traced(
        &self,
        params: &[f32],
        x: ArrayView2<f32>,
    ) -> Result<(Array2<f32>, BlockTrace)> {
        let chunks = self.chunks(params)?;
        let mut caches = Vec::with_capacity(self.layers.len());
        let mut out = x.to_owned();

        for (layer, p) in self.layers.iter().zip(chunks) {
            let (next, cache) = layer.forward_traced(p, out.view())?;
            caches.push(cache);
            out = next;
        }

        Ok((out, BlockTrace { caches }))
    }

    /// Backpropagates through the block call recorded in `trace`.
    ///
    /// # Arguments
    /// * `params` - This block's parameter slice.
    /// * `grad` - This block's gradient slice, accumulated into.
    /// * `trace` - The trace of the call being differentiated.
    /// * `d` - The derivative of the loss with respect to the increment.
    ///
    /// # Returns
    /// The derivative of the loss with respect to the block input through the increment
    /// only, the identity path is added by the caller.
    pub fn backward(
        &self,
        params: &[f32],
        grad: &mut [f32],
        trace: &BlockTrace,
        mut d: Array2<f32>,
    ) -> Result<Array2<f32>> {
        if trace.caches.len() != self.layers.len() {
            return Err(MlErr::SizeMismatch {
                what: "block trace",
                got: trace.caches.len(),
                expected: self.layers.len(),
            });
        }

        if grad.len() != self.size {
            return Err(MlErr::SizeMismatch {
                what: "block gradient",
                got: grad.len(),
                expected: self.size,
            });
        }

        let chunks = self.chunks(params)?;
        let mut offsets = Vec::with_capacity(self.layers.len());
        let mut offset = 0;
        for layer in &self.layers {
            offsets.push(offset);
            offset += layer.size();
        }

        for (i, layer) in self.layers.iter().enumerate().rev() {
            let start = offsets[i];
            let layer_grad = &mut grad[start..start + layer.size()];
            d = layer.backward(chunks[i], layer_grad, &trace.caches[i], d)?;
        }

        Ok(d)
    }

    /// Splits a block parameter slice into one slice per layer.
    fn chunks<'a>(&self, params: &'a [f32]) -> Result<Vec<&'a [f32]>> {
        if params.len() != self.size {
            return Err(MlErr::SizeMismatch {
                what: "block parameters",
                got: params.len(),
                expected: self.size,
            });
        }

        let mut rest = params;
        let mut chunks = Vec::with_capacity(self.layers.len());
        for layer in &self.layers {
            let chunk;
            (chunk, rest) = rest.split_at(layer.size());
            chunks.push(chunk);
        }

        Ok(chunks)
    }
}
