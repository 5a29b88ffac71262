use ndarray::{linalg, prelude::*};
use rand::Rng;
use rand_distr::{Distribution, Uniform};

use crate::{MlErr, Result, arch::activations::ActFn};

/// What a traced `Dense::forward` keeps around for the backward pass.
#[derive(Debug, Clone)]
pub struct DenseCache {
    x: Array2<f32>,
    z: Array2<f32>,
}

/// A fully connected layer `a = act(x · W + b)`.
///
/// The layer owns no parameters, it views a slice of the model's flat parameter buffer laid
/// out as `[W (in × out, row major) | b (out)]`.
#[derive(Debug, Clone)]
pub struct Dense {
    dim: (usize, usize),
    act_fn: Option<ActFn>,
    size: usize,
}

impl Dense {
    /// Creates a new `Dense` layer.
    ///
    /// # Arguments
    /// * `dim` - The input and output dimensions of the layer.
    /// * `act_fn` - The activation applied to the affine output, if any.
    ///
    /// # Returns
    /// A new `Dense` instance.
    pub fn new(dim: (usize, usize), act_fn: Option<ActFn>) -> Self {
        Self {
            dim,
            act_fn,
            size: (dim.0 + 1) * dim.1,
        }
    }

    /// Returns the amount of parameters this layer has.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn dim(&self) -> (usize, usize) {
        self.dim
    }

    /// Samples the initial parameters of this layer, weights and biases alike, from
    /// `U(-1/√in, 1/√in)`.
    ///
    /// # Arguments
    /// * `rng` - The random number generator to sample from.
    ///
    /// # Returns
    /// A buffer of `self.size()` parameters or an error if the fan in is zero.
    pub fn init<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<Vec<f32>> {
        if self.dim.0 == 0 {
            return Err(MlErr::invalid("a dense layer needs at least one input"));
        }

        let bound = 1. / (self.dim.0 as f32).sqrt();
        let distribution =
            Uniform::new(-bound, bound).map_err(|e| MlErr::invalid(e.to_string()))?;

        Ok((0..self.size).map(|_| distribution.sample(rng)).collect())
    }

    /// Makes a forward pass through the layer without keeping anything for the backward pass.
    pub fn forward(&self, params: &[f32], x: ArrayView2<f32>) -> Result<Array2<f32>> {
        let z = self.affine(params, x)?;
        Ok(self.activate(z))
    }

    /// Makes a forward pass through the layer.
    ///
    /// # Arguments
    /// * `params` - This layer's parameter slice.
    /// * `x` - A batch of inputs, one per row.
    ///
    /// # Returns
    /// The layer output and the cache needed to backpropagate through this call.
    pub fn forward_traced(
        &self,
        params: &[f32],
        x: ArrayView2<f32>,
    ) -> Result<(Array2<f32>, DenseCache)> {
        let z = self.affine(params, x)?;
        let a = match self.act_fn {
            Some(act_fn) => z.mapv(|z| act_fn.f(z)),
            None => z.clone(),
        };

        let cache = DenseCache { x: x.to_owned(), z };
        Ok((a, cache))
    }

    /// Backpropagates `d` (the derivative of the loss with respect to this layer's output)
    /// through the call that produced `cache`.
    ///
    /// The parameter gradient is *added* to `grad`, a layer may be called several times
    /// before the optimizer consumes the gradient.
    ///
    /// # Arguments
    /// * `params` - This layer's parameter slice.
    /// * `grad` - This layer's gradient slice.
    /// * `cache` - The cache of the forward call being differentiated.
    /// * `d` - The derivative of the loss with respect to the output of that call.
    ///
    /// # Returns
    /// The derivative of the loss with respect to the input of that call.
    pub fn backward(
        &self,
        params: &[f32],
        grad: &mut [f32],
        cache: &DenseCache,
        mut d: Array2<f32>,
    ) -> Result<Array2<f32>> {
        if let Some(act_fn) = self.act_fn {
            d.zip_mut_with(&cache.z, |d, &z| *d *= act_fn.df(z));
        }

        let (mut dw, mut db) = self.view_grad(grad)?;
        linalg::general_mat_mul(1.0, &cache.x.t(), &d, 1.0, &mut dw);
        db += &d.sum_axis(Axis(0));

        let (w, _) = self.view_params(params)?;
        Ok(d.dot(&w.t()))
    }

    fn affine(&self, params: &[f32], x: ArrayView2<f32>) -> Result<Array2<f32>> {
        if x.ncols() != self.dim.0 {
            return Err(MlErr::SizeMismatch {
                what: "dense input columns",
                got: x.ncols(),
                expected: self.dim.0,
            });
        }

        let (w, b) = self.view_params(params)?;
        let mut z = x.dot(&w);
        z += &b;
        Ok(z)
    }

    fn activate(&self, z: Array2<f32>) -> Array2<f32> {
        match self.act_fn {
            Some(act_fn) => z.mapv_into(|z| act_fn.f(z)),
            None => z,
        }
    }

    /// Gives a view of the raw gradient slice as the delta weights and delta biases of this layer.
    fn view_grad<'a>(
        &self,
        grad: &'a mut [f32],
    ) -> Result<(ArrayViewMut2<'a, f32>, ArrayViewMut1<'a, f32>)> {
        if grad.len() != self.size {
            return Err(MlErr::SizeMismatch {
                what: "dense gradient",
                got: grad.len(),
                expected: self.size,
            });
        }

        let w_size = self.size - self.dim.1;
        let (dw_raw, db_raw) = grad.split_at_mut(w_size);
        let dw = ArrayViewMut2::from_shape(self.dim, dw_raw)?;
        let db = ArrayViewMut1::from_shape(self.dim.1, db_raw)?;
        Ok((dw, db))
    }

    /// Gives a view of the raw parameter slice as the weights and biases of this layer.
    fn view_params<'a>(
        &self,
        params: &'a [f32],
    ) -> Result<(ArrayView2<'a, f32>, ArrayView1<'a, f32>)> {
        if params.len() != self.size {
            return Err(MlErr::SizeMismatch {
                what: "dense parameters",
                got: params.len(),
                expected: self.size,
            });
        }

        let w_size = self.size - self.dim.1;
        let weights = ArrayView2::from_shape(self.dim, &params[..w_size])?;
        let biases = ArrayView1::from_shape(self.dim.1, &params[w_size..])?;
        Ok((weights, biases))
    }
}
