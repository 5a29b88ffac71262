use ndarray::{Array2, ArrayView2, ArrayView3, Axis, Ix2, Zip};

use super::{CompositionTable, Reduction};
use crate::{MlErr, Result, arch::DualResNet};

/// The multi-horizon objective of a `DualResNet`.
///
/// Every term of the table composes steps from the same initial states and is compared
/// against its target column. The squared errors of all the terms are reduced elementwise
/// into `S`, a `(batch, n_dim)` array, and the objective is
/// `weight * mean(S) + (1 - weight) * max`. A summed table takes `max(S)`, an averaged one
/// the largest squared error of any term. Unweighted tables score `mean(S)` alone.
#[derive(Clone, Debug)]
pub struct CompositeLoss {
    table: CompositionTable,
}

impl CompositeLoss {
    pub fn new(table: CompositionTable) -> Self {
        Self { table }
    }

    pub fn table(&self) -> &CompositionTable {
        &self.table
    }

    /// Evaluates the objective without keeping anything for the backward pass.
    ///
    /// # Arguments
    /// * `model` - The model being evaluated.
    /// * `x` - A batch of initial states, one per row.
    /// * `ys` - The targets, of shape `(batch, horizons, n_dim)`.
    /// * `weight` - How much of the objective is the mean error, the rest is the max.
    ///
    /// # Returns
    /// The scalar objective or an error if the shapes don't fit the model or the table.
    pub fn loss(
        &self,
        model: &DualResNet,
        x: ArrayView2<f32>,
        ys: ArrayView3<f32>,
        weight: f32,
    ) -> Result<f32> {
        self.check(model, x, ys, weight)?;

        let mut errors = SquaredErrors::new(x.raw_dim(), &self.table);
        for (t, term) in self.table.terms().iter().enumerate() {
            let pred = model.compose(x, &term.steps)?;
            let err = pred - &ys.index_axis(Axis(1), term.column);
            errors.add(t, &err);
        }

        let (loss, _) = errors.objective(self.weight(weight));
        Ok(loss)
    }

    /// Evaluates the objective and accumulates its gradient.
    ///
    /// # Arguments
    /// * `model` - The model being trained.
    /// * `x` - A batch of initial states, one per row.
    /// * `ys` - The targets, of shape `(batch, horizons, n_dim)`.
    /// * `weight` - How much of the objective is the mean error, the rest is the max.
    /// * `grad` - A buffer of `model.num_params()` gradients, accumulated into.
    ///
    /// # Returns
    /// The scalar objective.
    pub fn loss_and_grad(
        &self,
        model: &DualResNet,
        x: ArrayView2<f32>,
        ys: ArrayView3<f32>,
        weight: f32,
        grad: &mut [f32],
    ) -> Result<f32> {
        self.check(model, x, ys, weight)?;

        let weight = self.weight(weight);
        let mut errors = SquaredErrors::new(x.raw_dim(), &self.table);
        let mut traced = Vec::with_capacity(self.table.len());

        for (t, term) in self.table.terms().iter().enumerate() {
            let (pred, tape) = model.compose_traced(x, &term.steps)?;
            let err = pred - &ys.index_axis(Axis(1), term.column);

            errors.add(t, &err);
            traced.push((tape, err));
        }

        let r = errors.scale;
        let mean_grad = weight * r / errors.sum.len() as f32;
        let (loss, peak) = errors.objective(weight);

        for (t, (tape, err)) in traced.into_iter().enumerate() {
            // dL/d(err²) of this term
            let mut d_sq = Array2::from_elem(err.raw_dim(), mean_grad);
            match peak {
                Some(Peak::Summed(idx)) => d_sq[idx] += (1. - weight) * r,
                Some(Peak::Term(k, idx)) if k == t => d_sq[idx] += 1. - weight,
                _ => {}
            }

            let d = err * &d_sq * 2.;
            model.backward(&tape, d, grad)?;
        }

        Ok(loss)
    }

    /// The weight the objective is actually computed with.
    fn weight(&self, weight: f32) -> f32 {
        if self.table.is_weighted() { weight } else { 1. }
    }

    fn check(
        &self,
        model: &DualResNet,
        x: ArrayView2<f32>,
        ys: ArrayView3<f32>,
        weight: f32,
    ) -> Result<()> {
        if !(0. ..=1.).contains(&weight) {
            return Err(MlErr::invalid(format!(
                "the loss weight must be within [0, 1], got {weight}"
            )));
        }

        if x.nrows() == 0 {
            return Err(MlErr::invalid("empty batch"));
        }

        if x.ncols() != model.n_dim() {
            return Err(MlErr::SizeMismatch {
                what: "state dimension",
                got: x.ncols(),
                expected: model.n_dim(),
            });
        }

        let (batch, horizons, n_dim) = ys.dim();
        if batch != x.nrows() || n_dim != x.ncols() {
            return Err(MlErr::invalid(format!(
                "targets of shape {:?} don't match a batch of shape {:?}",
                ys.dim(),
                x.dim()
            )));
        }

        if horizons < self.table.n_columns() {
            return Err(MlErr::invalid(format!(
                "the loss reads {} target columns but only {horizons} were given",
                self.table.n_columns()
            )));
        }

        Ok(())
    }
}

/// Where the max error of the objective sits.
#[derive(Clone, Copy, Debug, PartialEq)]
enum Peak {
    /// An element of the summed errors, shared by every term.
    Summed((usize, usize)),
    /// An element of the squared error of a single term.
    Term(usize, (usize, usize)),
}

/// The squared errors of the terms, reduced as they come in.
struct SquaredErrors {
    sum: Array2<f32>,
    scale: f32,
    reduction: Reduction,
    peak: Option<(Peak, f32)>,
}

impl SquaredErrors {
    fn new(dim: Ix2, table: &CompositionTable) -> Self {
        let scale = match table.reduction() {
            Reduction::Sum => 1.,
            Reduction::Mean => 1. / table.len() as f32,
        };

        Self {
            sum: Array2::zeros(dim),
            scale,
            reduction: table.reduction(),
            peak: None,
        }
    }

    /// Adds the error `err` of the `t`-th term.
    fn add(&mut self, t: usize, err: &Array2<f32>) {
        let Self {
            sum,
            scale,
            reduction,
            peak,
        } = self;

        Zip::indexed(sum).and(err).for_each(|idx, s, &e| {
            let sq = e * e;
            *s += *scale * sq;
            if *reduction == Reduction::Mean {
                keep_peak(peak, Peak::Term(t, idx), sq);
            }
        });
    }

    /// Reduces every error added into the objective, along with the position of the max.
    fn objective(mut self, weight: f32) -> (f32, Option<Peak>) {
        if self.reduction == Reduction::Sum {
            for (idx, &v) in self.sum.indexed_iter() {
                keep_peak(&mut self.peak, Peak::Summed(idx), v);
            }
        }

        let mean = self.sum.mean().unwrap_or_default();
        match self.peak {
            Some((peak, max)) => (weight * mean + (1. - weight) * max, Some(peak)),
            None => (mean, None),
        }
    }
}

/// Replaces `best` with `(key, v)` if `v` is larger, the first NaN sticks.
fn keep_peak(best: &mut Option<(Peak, f32)>, key: Peak, v: f32) {
    let replace = match best {
        None => true,
        Some((_, m)) => !m.is_nan() && (v > *m || v.is_nan()),
    };

    if replace {
        *best = Some((key, v));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::{ActFn, ResNetConfig, Scale};
    use ndarray::{Array, Array3, array};
    use rand::{SeedableRng, rngs::StdRng};
    use rand_distr::{Distribution, Normal};

    fn model(act_fn: ActFn, step_size: usize) -> DualResNet {
        let config = ResNetConfig {
            arch: vec![2, 5, 2],
            act_fn,
            dt: 0.1,
            step_size,
        };
        DualResNet::new(config, &mut StdRng::seed_from_u64(11)).unwrap()
    }

    fn batch(rows: usize, horizons: usize) -> (Array2<f32>, Array3<f32>) {
        let mut rng = StdRng::seed_from_u64(12);
        let normal = Normal::new(0f32, 0.5).unwrap();

        let x = Array::from_shape_fn((rows, 2), |_| normal.sample(&mut rng));
        let ys = Array::from_shape_fn((rows, horizons, 2), |_| normal.sample(&mut rng));
        (x, ys)
    }

    #[test]
    fn mean_weight_adds_up_every_branch() {
        let model = model(ActFn::Relu, 2);
        let loss = CompositeLoss::new(CompositionTable::legacy());
        let (x, ys) = batch(6, 5);

        let expected: f32 = loss
            .table()
            .terms()
            .iter()
            .map(|t| {
                let pred = model.compose(x.view(), &t.steps).unwrap();
                let err = &pred - &ys.index_axis(Axis(1), t.column);
                err.mapv(|e| e * e).mean().unwrap()
            })
            .sum();

        let got = loss.loss(&model, x.view(), ys.view(), 1.).unwrap();
        assert!((got - expected).abs() <= 1e-4 * expected.max(1.), "{got} vs {expected}");
    }

    #[test]
    fn zero_weight_is_the_worst_error() {
        let model = model(ActFn::Relu, 2);
        let loss = CompositeLoss::new(CompositionTable::single_scale(Scale::Small, 2, 1).unwrap());
        let (x, ys) = batch(4, 1);

        let pred = model.step(x.view(), Scale::Small).unwrap();
        let err = (&pred - &ys.index_axis(Axis(1), 0)).mapv(|e| e * e);
        let max = err.iter().copied().fold(f32::MIN, f32::max);

        let got = loss.loss(&model, x.view(), ys.view(), 0.).unwrap();
        assert!((got - max).abs() <= 1e-6);
    }

    #[test]
    fn traced_and_plain_losses_agree() {
        let model = model(ActFn::Tanh, 3);
        let loss = CompositeLoss::new(CompositionTable::exhaustive(3, 4).unwrap());
        let (x, ys) = batch(5, 4);

        let mut grad = vec![0.; model.num_params()];
        let traced = loss
            .loss_and_grad(&model, x.view(), ys.view(), 0.6, &mut grad)
            .unwrap();
        let plain = loss.loss(&model, x.view(), ys.view(), 0.6).unwrap();

        assert_eq!(traced, plain);
    }

    #[test]
    fn gradient_matches_finite_differences() {
        let mut model = model(ActFn::Tanh, 2);
        let loss = CompositeLoss::new(CompositionTable::exhaustive(2, 3).unwrap());
        let (x, ys) = batch(3, 3);

        let mut grad = vec![0.; model.num_params()];
        loss.loss_and_grad(&model, x.view(), ys.view(), 1., &mut grad).unwrap();

        let eps = 1e-2;
        for i in 0..model.num_params() {
            let p = model.params()[i];
            model.params_mut()[i] = p + eps;
            let up = loss.loss(&model, x.view(), ys.view(), 1.).unwrap();
            model.params_mut()[i] = p - eps;
            let down = loss.loss(&model, x.view(), ys.view(), 1.).unwrap();
            model.params_mut()[i] = p;

            let numeric = (up - down) / (2. * eps);
            assert!(
                (numeric - grad[i]).abs() <= 1e-2 * grad[i].abs().max(1.),
                "param {i}: numeric {numeric}, analytic {}",
                grad[i]
            );
        }
    }

    #[test]
    fn averaged_table_takes_the_worst_error_of_any_term() {
        let mut model = model(ActFn::Relu, 2);
        model.params_mut().fill(0.);

        let loss = CompositeLoss::new(CompositionTable::single_scale(Scale::Small, 2, 2).unwrap());
        let x = Array2::zeros((1, 2));
        let ys = array![[[0f32, 0.], [2., 0.]]];

        let worst = loss.loss(&model, x.view(), ys.view(), 0.).unwrap();
        let blended = loss.loss(&model, x.view(), ys.view(), 0.5).unwrap();

        assert_eq!(worst, 4.);
        assert_eq!(blended, 0.5 * 1. + 0.5 * 4.);
    }

    #[test]
    fn unweighted_table_ignores_the_weight() {
        let model = model(ActFn::Relu, 2);
        let loss = CompositeLoss::new(CompositionTable::legacy());
        let (x, ys) = batch(4, 5);

        let mean = loss.loss(&model, x.view(), ys.view(), 1.).unwrap();
        let mut grad = vec![0.; model.num_params()];
        let traced = loss
            .loss_and_grad(&model, x.view(), ys.view(), 0.2, &mut grad)
            .unwrap();

        assert_eq!(loss.loss(&model, x.view(), ys.view(), 0.).unwrap(), mean);
        assert_eq!(traced, mean);
    }

    #[test]
    fn max_term_gradient_matches_finite_differences() {
        let tables = [
            CompositionTable::single_scale(Scale::Small, 2, 3).unwrap(),
            CompositionTable::exhaustive(2, 3).unwrap(),
        ];

        for table in tables {
            let mut model = model(ActFn::Tanh, 2);
            let loss = CompositeLoss::new(table);
            let (x, ys) = batch(3, 3);

            let mut grad = vec![0.; model.num_params()];
            loss.loss_and_grad(&model, x.view(), ys.view(), 0.5, &mut grad).unwrap();

            let eps = 1e-2;
            for i in 0..model.num_params() {
                let p = model.params()[i];
                model.params_mut()[i] = p + eps;
                let up = loss.loss(&model, x.view(), ys.view(), 0.5).unwrap();
                model.params_mut()[i] = p - eps;
                let down = loss.loss(&model, x.view(), ys.view(), 0.5).unwrap();
                model.params_mut()[i] = p;

                let numeric = (up - down) / (2. * eps);
                assert!(
                    (numeric - grad[i]).abs() <= 2e-2 * grad[i].abs().max(1.),
                    "param {i}: numeric {numeric}, analytic {}",
                    grad[i]
                );
            }
        }
    }

    #[test]
    fn too_few_target_columns_are_rejected() {
        let model = model(ActFn::Relu, 2);
        let loss = CompositeLoss::new(CompositionTable::exhaustive(2, 5).unwrap());
        let (x, ys) = batch(3, 4);

        assert!(loss.loss(&model, x.view(), ys.view(), 1.).is_err());
    }

    #[test]
    fn weight_out_of_range_is_rejected() {
        let model = model(ActFn::Relu, 2);
        let loss = CompositeLoss::new(CompositionTable::legacy());
        let (x, ys) = batch(3, 5);

        assert!(loss.loss(&model, x.view(), ys.view(), 1.5).is_err());
        assert!(loss.loss(&model, x.view(), ys.view(), f32::NAN).is_err());
    }
}
