use std::{collections::HashMap, fs, path::Path};

use ndarray::{Array2, Array3, ArrayView2, ArrayView3, Axis, s};
use safetensors::{Dtype, SafeTensors, tensor::TensorView};

use crate::{MlErr, Result};

/// Initial states and their targets at every horizon.
#[derive(Debug, Clone, PartialEq)]
pub struct Split {
    /// Shape `(n, n_dim)`.
    pub x: Array2<f32>,
    /// Shape `(n, n_horizons, n_dim)`, horizon `h` lives in column `h - 1`.
    pub ys: Array3<f32>,
}

impl Split {
    /// Creates a new `Split`, checking that `x` and `ys` describe the same samples.
    pub fn new(x: Array2<f32>, ys: Array3<f32>) -> Result<Self> {
        let (n, n_dim) = x.dim();
        let (ys_n, _, ys_dim) = ys.dim();

        if ys_n != n || ys_dim != n_dim {
            return Err(MlErr::invalid(format!(
                "targets of shape {:?} don't match initial states of shape {:?}",
                ys.dim(),
                x.dim()
            )));
        }

        Ok(Self { x, ys })
    }

    pub fn len(&self) -> usize {
        self.x.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn n_dim(&self) -> usize {
        self.x.ncols()
    }

    pub fn n_horizons(&self) -> usize {
        self.ys.len_of(Axis(1))
    }

    /// Gathers the given rows into a new batch.
    pub fn batch(&self, rows: &[usize]) -> (Array2<f32>, Array3<f32>) {
        (self.x.select(Axis(0), rows), self.ys.select(Axis(0), rows))
    }
}

/// The train, validation and test splits of a set of trajectories, along with the time scales
/// they were sampled at.
#[derive(Debug, Clone)]
pub struct MultiscaleDataset {
    train: Split,
    val: Split,
    test: Split,
    dt: f32,
    step_size: usize,
}

impl MultiscaleDataset {
    /// Creates a new `MultiscaleDataset` out of already prepared splits.
    ///
    /// # Arguments
    /// * `train`, `val`, `test` - The splits, which must agree on `n_dim` and horizons.
    /// * `dt` - The base time unit between consecutive samples.
    /// * `step_size` - The stride of the large block the data is prepared for.
    ///
    /// # Returns
    /// A new `MultiscaleDataset` or an error if the splits are inconsistent.
    pub fn new(train: Split, val: Split, test: Split, dt: f32, step_size: usize) -> Result<Self> {
        if !(dt.is_finite() && dt > 0.) {
            return Err(MlErr::invalid(format!("dt must be positive, got {dt}")));
        }

        if step_size == 0 {
            return Err(MlErr::invalid("the step size must be positive"));
        }

        if train.is_empty() || val.is_empty() {
            return Err(MlErr::invalid(
                "the train and validation splits need at least one sample",
            ));
        }

        for (name, split) in [("validation", &val), ("test", &test)] {
            if split.n_dim() != train.n_dim() || split.n_horizons() != train.n_horizons() {
                return Err(MlErr::invalid(format!(
                    "the {name} split has {} dimensions and {} horizons, train has {} and {}",
                    split.n_dim(),
                    split.n_horizons(),
                    train.n_dim(),
                    train.n_horizons()
                )));
            }
        }

        Ok(Self {
            train,
            val,
            test,
            dt,
            step_size,
        })
    }

    /// Prepares a dataset out of sampled trajectories.
    ///
    /// Every trajectory contributes one sample, its first state as `x` and the following
    /// `n_horizons` states as targets.
    ///
    /// # Arguments
    /// * `train`, `val`, `test` - Trajectories of shape `(n_traj, n_time, n_dim)`.
    /// * `dt` - The time between consecutive states of a trajectory.
    /// * `step_size` - The stride of the large block the data is prepared for.
    /// * `n_horizons` - The amount of targets per sample.
    ///
    /// # Returns
    /// A new `MultiscaleDataset` or an error if some trajectory is too short.
    pub fn from_trajectories(
        train: ArrayView3<f32>,
        val: ArrayView3<f32>,
        test: ArrayView3<f32>,
        dt: f32,
        step_size: usize,
        n_horizons: usize,
    ) -> Result<Self> {
        if n_horizons == 0 {
            return Err(MlErr::invalid("at least one horizon is needed"));
        }

        let split = |name: &str, traj: ArrayView3<f32>| {
            let n_time = traj.len_of(Axis(1));
            if n_time <= n_horizons {
                return Err(MlErr::invalid(format!(
                    "{name} trajectories have {n_time} states, {} are needed for {n_horizons} \
                     horizons",
                    n_horizons + 1
                )));
            }

            let x = traj.index_axis(Axis(1), 0).to_owned();
            let ys = traj.slice(s![.., 1..=n_horizons, ..]).to_owned();
            Split::new(x, ys)
        };

        let dataset = Self::new(
            split("train", train)?,
            split("validation", val)?,
            split("test", test)?,
            dt,
            step_size,
        )?;

        log::debug!(
            "prepared {} train, {} validation and {} test samples with {n_horizons} horizons",
            dataset.n_train(),
            dataset.n_val(),
            dataset.n_test()
        );

        Ok(dataset)
    }

    pub fn train(&self) -> &Split {
        &self.train
    }

    pub fn val(&self) -> &Split {
        &self.val
    }

    pub fn test(&self) -> &Split {
        &self.test
    }

    pub fn n_train(&self) -> usize {
        self.train.len()
    }

    pub fn n_val(&self) -> usize {
        self.val.len()
    }

    pub fn n_test(&self) -> usize {
        self.test.len()
    }

    pub fn n_dim(&self) -> usize {
        self.train.n_dim()
    }

    pub fn n_horizons(&self) -> usize {
        self.train.n_horizons()
    }

    pub fn dt(&self) -> f32 {
        self.dt
    }

    pub fn step_size(&self) -> usize {
        self.step_size
    }

    pub fn train_x(&self) -> ArrayView2<'_, f32> {
        self.train.x.view()
    }

    pub fn train_ys(&self) -> ArrayView3<'_, f32> {
        self.train.ys.view()
    }

    pub fn val_x(&self) -> ArrayView2<'_, f32> {
        self.val.x.view()
    }

    pub fn val_ys(&self) -> ArrayView3<'_, f32> {
        self.val.ys.view()
    }

    pub fn test_x(&self) -> ArrayView2<'_, f32> {
        self.test.x.view()
    }

    pub fn test_ys(&self) -> ArrayView3<'_, f32> {
        self.test.ys.view()
    }
}

/// Raw sampled trajectories, `(n_traj, n_time, n_dim)` per split.
#[derive(Debug, Clone, PartialEq)]
pub struct Trajectories {
    pub train: Array3<f32>,
    pub val: Array3<f32>,
    pub test: Array3<f32>,
}

impl Trajectories {
    /// Reads the `train`, `val` and `test` tensors of a safetensors file.
    ///
    /// A missing `val` or `test` tensor falls back to a copy of `train`.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let bytes = fs::read(path)?;
        let tensors = SafeTensors::deserialize(&bytes)
            .map_err(|e| MlErr::invalid(format!("{}: {e}", path.display())))?;

        let Some(train) = read_tensor(&tensors, "train")? else {
            return Err(MlErr::invalid(format!(
                "{} has no train tensor",
                path.display()
            )));
        };

        let fallback = |name: &str| -> Result<Array3<f32>> {
            Ok(match read_tensor(&tensors, name)? {
                Some(t) => t,
                None => {
                    log::warn!("{} has no {name} tensor, using train", path.display());
                    train.clone()
                }
            })
        };

        let val = fallback("val")?;
        let test = fallback("test")?;

        log::info!(
            "loaded trajectories from {}: train {:?}, val {:?}, test {:?}",
            path.display(),
            train.dim(),
            val.dim(),
            test.dim()
        );

        Ok(Self { train, val, test })
    }

    /// Writes the three splits as a safetensors file readable by `load`.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let raw: Vec<(&str, Vec<usize>, Vec<u8>)> = [
            ("train", &self.train),
            ("val", &self.val),
            ("test", &self.test),
        ]
        .into_iter()
        .map(|(name, t)| {
            let data: Vec<f32> = t.iter().copied().collect();
            let bytes = bytemuck::cast_slice::<f32, u8>(&data).to_vec();
            (name, t.shape().to_vec(), bytes)
        })
        .collect();

        let mut views = Vec::with_capacity(raw.len());
        for (name, shape, bytes) in &raw {
            let view = TensorView::new(Dtype::F32, shape.clone(), bytes)
                .map_err(|e| MlErr::invalid(e.to_string()))?;
            views.push((*name, view));
        }

        let info: Option<HashMap<String, String>> = None;
        let out = safetensors::serialize(views, &info)
            .map_err(|e| MlErr::invalid(e.to_string()))?;
        fs::write(path, out)?;

        Ok(())
    }

    /// Prepares the trajectories for a model, see `MultiscaleDataset::from_trajectories`.
    pub fn prepare(
        &self,
        dt: f32,
        step_size: usize,
        n_horizons: usize,
    ) -> Result<MultiscaleDataset> {
        MultiscaleDataset::from_trajectories(
            self.train.view(),
            self.val.view(),
            self.test.view(),
            dt,
            step_size,
            n_horizons,
        )
    }
}

fn read_tensor(tensors: &SafeTensors, name: &str) -> Result<Option<Array3<f32>>> {
    let Ok(view) = tensors.tensor(name) else {
        return Ok(None);
    };

    if view.dtype() != Dtype::F32 {
        return Err(MlErr::invalid(format!(
            "tensor {name} holds {:?}, expected F32",
            view.dtype()
        )));
    }

    let &[n_traj, n_time, n_dim] = view.shape() else {
        return Err(MlErr::invalid(format!(
            "tensor {name} has shape {:?}, expected (n_traj, n_time, n_dim)",
            view.shape()
        )));
    };

    let data: Vec<f32> = view
        .data()
        .chunks_exact(4)
        .map(bytemuck::pod_read_unaligned)
        .collect();

    Ok(Some(Array3::from_shape_vec((n_traj, n_time, n_dim), data)?))
}
