use ndarray::{Array2, Array3, ArrayView2, ArrayView3, Axis, Zip};

use crate::{
    MlErr, Result,
    arch::{DualResNet, Scale},
};

/// A learned (or known) map advancing a batch of states by a fixed stride.
pub trait FlowMap {
    /// Advances every row of `x` by this map's stride.
    fn advance(&self, x: ArrayView2<f32>) -> Result<Array2<f32>>;
}

/// One of the blocks of a `DualResNet` seen as a `FlowMap`.
#[derive(Clone, Copy)]
pub struct ScaledStep<'m> {
    model: &'m DualResNet,
    scale: Scale,
}

impl<'m> ScaledStep<'m> {
    pub fn new(model: &'m DualResNet, scale: Scale) -> Self {
        Self { model, scale }
    }
}

impl FlowMap for ScaledStep<'_> {
    fn advance(&self, x: ArrayView2<f32>) -> Result<Array2<f32>> {
        self.model.step(x, self.scale)
    }
}

/// A flow map paired with the stride, in base units, it advances by.
#[derive(Clone, Copy)]
pub struct ForecastLevel<'a> {
    map: &'a dyn FlowMap,
    step_size: usize,
}

impl<'a> ForecastLevel<'a> {
    pub fn new(map: &'a dyn FlowMap, step_size: usize) -> Self {
        Self { map, step_size }
    }

    pub fn step_size(&self) -> usize {
        self.step_size
    }
}

/// Linearly interpolates `values` along its step axis.
///
/// # Arguments
/// * `indices` - The strictly increasing step of every column of `values`.
/// * `values` - An array of shape `(batch, indices.len(), n_dim)`.
/// * `samples` - The steps to evaluate, all within `indices[0]..=indices[last]`.
///
/// # Returns
/// An array of shape `(batch, samples, n_dim)`. A sample landing on a known step copies
/// that step's values untouched.
pub fn interpolate<I>(indices: &[usize], values: ArrayView3<f32>, samples: I) -> Result<Array3<f32>>
where
    I: IntoIterator<Item = usize>,
{
    let (batch, len, n_dim) = values.dim();
    if indices.len() != len {
        return Err(MlErr::SizeMismatch {
            what: "interpolation indices",
            got: indices.len(),
            expected: len,
        });
    }

    if indices.is_empty() {
        return Err(MlErr::invalid("nothing to interpolate from"));
    }

    if indices.windows(2).any(|w| w[0] >= w[1]) {
        return Err(MlErr::invalid(format!(
            "interpolation indices must be strictly increasing, got {indices:?}"
        )));
    }

    let samples: Vec<usize> = samples.into_iter().collect();
    let mut out = Array3::zeros((batch, samples.len(), n_dim));

    for (j, &t) in samples.iter().enumerate() {
        let mut dst = out.index_axis_mut(Axis(1), j);

        match indices.binary_search(&t) {
            Ok(k) => dst.assign(&values.index_axis(Axis(1), k)),
            Err(k) if k == 0 || k == indices.len() => {
                return Err(MlErr::invalid(format!(
                    "step {t} is outside of the known range {}..={}",
                    indices[0],
                    indices[indices.len() - 1]
                )));
            }
            Err(k) => {
                let (lo, hi) = (indices[k - 1], indices[k]);
                let w = (t - lo) as f32 / (hi - lo) as f32;

                Zip::from(&mut dst)
                    .and(&values.index_axis(Axis(1), k - 1))
                    .and(&values.index_axis(Axis(1), k))
                    .for_each(|o, &a, &b| *o = a + (b - a) * w);
            }
        }
    }

    Ok(out)
}

/// Forecasts `n_steps` base units by composing flow maps of decreasing strides.
///
/// The coarsest level walks the whole horizon from step 0. Every finer level then starts
/// from all the steps reached so far and only covers the gap left by the previous stride.
/// If the last reached step still falls short of `n_steps`, the finest level keeps walking.
/// Every step in `1..=n_steps` that wasn't landed on is linearly interpolated.
///
/// # Arguments
/// * `x_init` - The initial states, one per row.
/// * `n_steps` - The forecast horizon, in base units.
/// * `levels` - The flow maps, ordered by non-increasing stride.
///
/// # Returns
/// An array of shape `(batch, n_steps, n_dim)` holding steps `1..=n_steps`.
pub fn multiscale_forecast(
    x_init: ArrayView2<f32>,
    n_steps: usize,
    levels: &[ForecastLevel],
) -> Result<Array3<f32>> {
    let Some(finest) = levels.last() else {
        return Err(MlErr::invalid("a multiscale forecast needs at least one level"));
    };

    if levels.iter().any(|l| l.step_size == 0) {
        return Err(MlErr::invalid("forecast strides must be positive"));
    }

    if levels.windows(2).any(|w| w[0].step_size < w[1].step_size) {
        return Err(MlErr::invalid(
            "forecast levels must be ordered by non-increasing stride",
        ));
    }

    let (n_test, n_dim) = x_init.dim();
    if n_steps == 0 {
        return Ok(Array3::zeros((n_test, 0, n_dim)));
    }

    // every level may overshoot the previous landing by less than the previous stride,
    // and the tail by less than the finest one
    let reach = n_steps + levels.iter().map(|l| l.step_size).sum::<usize>();
    let mut preds = Array3::zeros((n_test, reach + 1, n_dim));
    preds.index_axis_mut(Axis(1), 0).assign(&x_init);

    let mut indices = vec![0];
    let mut span = n_steps;

    for level in levels {
        let stride = level.step_size;
        let n_forward = span / stride;
        let k = indices.len();

        let mut y_prev = preds
            .select(Axis(1), &indices)
            .as_standard_layout()
            .into_owned()
            .into_shape_with_order((n_test * k, n_dim))?;
        let mut lists = vec![indices.clone()];

        for t in 0..n_forward {
            let y_next = level.map.advance(y_prev.view())?;
            let shifted: Vec<_> = indices.iter().map(|i| i + (t + 1) * stride).collect();

            let grouped = y_next.view().into_shape_with_order((n_test, k, n_dim))?;
            for (j, &idx) in shifted.iter().enumerate() {
                preds
                    .index_axis_mut(Axis(1), idx)
                    .assign(&grouped.index_axis(Axis(1), j));
            }

            lists.push(shifted);
            y_prev = y_next;
        }

        indices = (0..k)
            .flat_map(|j| lists.iter().map(move |l| l[j]))
            .collect();
        // with three or more levels a finer walk may reach the start of the next group
        indices.sort_unstable();
        indices.dedup();

        span = stride - 1;
    }

    let mut last = indices[indices.len() - 1];
    let mut y_prev = preds.index_axis(Axis(1), last).to_owned();
    while last < n_steps {
        let y_next = finest.map.advance(y_prev.view())?;
        last += finest.step_size;
        preds.index_axis_mut(Axis(1), last).assign(&y_next);
        indices.push(last);
        y_prev = y_next;
    }

    log::debug!(
        "multiscale forecast of {n_steps} steps simulated {} of them",
        indices.len() - 1
    );

    let known = preds.select(Axis(1), &indices);
    interpolate(&indices, known.view(), 1..=n_steps)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::{ActFn, ResNetConfig};
    use ndarray::{Array, array, s};
    use rand::{SeedableRng, rngs::StdRng};

    /// Moves every coordinate forward by its stride, so step `t` holds `x + t`.
    struct Clock(usize);

    impl FlowMap for Clock {
        fn advance(&self, x: ArrayView2<f32>) -> Result<Array2<f32>> {
            Ok(&x + self.0 as f32)
        }
    }

    fn model(step_size: usize) -> DualResNet {
        let config = ResNetConfig {
            arch: vec![2, 12, 2],
            act_fn: ActFn::Relu,
            dt: 0.1,
            step_size,
        };
        DualResNet::new(config, &mut StdRng::seed_from_u64(5)).unwrap()
    }

    #[test]
    fn interpolate_copies_known_steps_and_blends_the_rest() {
        let values = array![[[0f32, 10.], [4., 30.]]];
        let out = interpolate(&[0, 4], values.view(), 0..=4).unwrap();

        assert_eq!(out.dim(), (1, 5, 2));
        assert_eq!(out.slice(s![0, 0, ..]), array![0f32, 10.]);
        assert_eq!(out.slice(s![0, 1, ..]), array![1f32, 15.]);
        assert_eq!(out.slice(s![0, 2, ..]), array![2f32, 20.]);
        assert_eq!(out.slice(s![0, 4, ..]), array![4f32, 30.]);
    }

    #[test]
    fn interpolate_rejects_steps_out_of_range() {
        let values = array![[[0f32], [1.]]];
        assert!(interpolate(&[1, 3], values.view(), [0]).is_err());
        assert!(interpolate(&[1, 3], values.view(), [4]).is_err());
        assert!(interpolate(&[3, 1], values.view(), [2]).is_err());
    }

    #[test]
    fn clock_is_reproduced_exactly() {
        let (coarse, mid, fine) = (Clock(8), Clock(3), Clock(1));
        let levels = [
            ForecastLevel::new(&coarse, 8),
            ForecastLevel::new(&mid, 3),
            ForecastLevel::new(&fine, 1),
        ];
        let x = array![[0f32, 100.], [5., -5.]];

        let preds = multiscale_forecast(x.view(), 30, &levels).unwrap();
        assert_eq!(preds.dim(), (2, 30, 2));

        for t in 1..=30 {
            let expected = &x + t as f32;
            assert_eq!(preds.slice(s![.., t - 1, ..]), expected, "step {t}");
        }
    }

    #[test]
    fn tail_is_walked_with_the_finest_level() {
        let (coarse, fine) = (Clock(6), Clock(4));
        let levels = [ForecastLevel::new(&coarse, 6), ForecastLevel::new(&fine, 4)];
        let x = array![[0f32]];

        // 6 and 4 land on 0, 4, 6 and 10, the tail adds 14
        let preds = multiscale_forecast(x.view(), 11, &levels).unwrap();
        assert_eq!(preds.dim(), (1, 11, 1));
        for t in 1..=11 {
            assert!((preds[[0, t - 1, 0]] - t as f32).abs() < 1e-5, "step {t}");
        }
    }

    #[test]
    fn three_levels_with_close_strides_stay_in_bounds() {
        let (coarse, mid, fine) = (Clock(5), Clock(4), Clock(3));
        let levels = [
            ForecastLevel::new(&coarse, 5),
            ForecastLevel::new(&mid, 4),
            ForecastLevel::new(&fine, 3),
        ];
        let x = array![[0f32]];

        for n_steps in [5, 7, 12] {
            let preds = multiscale_forecast(x.view(), n_steps, &levels).unwrap();
            assert_eq!(preds.dim(), (1, n_steps, 1));
            for t in 1..=n_steps {
                assert!((preds[[0, t - 1, 0]] - t as f32).abs() < 1e-5, "step {t}");
            }
        }
    }

    #[test]
    fn unit_stride_matches_repeated_small_steps() {
        let model = model(4);
        let small = ScaledStep::new(&model, Scale::Small);
        let x = Array::linspace(-1f32, 1., 8)
            .into_shape_with_order((4, 2))
            .unwrap();

        let preds = multiscale_forecast(x.view(), 6, &[ForecastLevel::new(&small, 1)]).unwrap();

        let mut y = x.clone();
        for t in 0..6 {
            y = model.step(y.view(), Scale::Small).unwrap();
            let diff = (&preds.slice(s![.., t, ..]) - &y).mapv(f32::abs);
            assert!(diff.iter().all(|&d| d <= 1e-6), "step {}", t + 1);
        }
    }

    #[test]
    fn levels_must_be_ordered_coarsest_first() {
        let model = model(4);
        let large = ScaledStep::new(&model, Scale::Large);
        let small = ScaledStep::new(&model, Scale::Small);
        let x = array![[0f32, 0.]];

        let levels = [ForecastLevel::new(&small, 1), ForecastLevel::new(&large, 4)];
        assert!(multiscale_forecast(x.view(), 8, &levels).is_err());
        assert!(multiscale_forecast(x.view(), 8, &[]).is_err());
    }

    #[test]
    fn zero_steps_yields_an_empty_forecast() {
        let clock = Clock(2);
        let x = array![[1f32, 2., 3.]];
        let preds = multiscale_forecast(x.view(), 0, &[ForecastLevel::new(&clock, 2)]).unwrap();
        assert_eq!(preds.dim(), (1, 0, 3));
    }
}
