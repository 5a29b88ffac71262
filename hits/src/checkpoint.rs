use std::{
    collections::HashMap,
    error::Error,
    fmt::{self, Display},
    fs, io,
    path::Path,
};

use safetensors::{Dtype, SafeTensorError, SafeTensors, tensor::TensorView};

use crate::{
    Result,
    arch::{DualResNet, ResNetConfig, Scale},
};

/// The value of the `format` metadata entry written by `save`.
pub const FORMAT: &str = "hits-dual-resnet/1";

/// Why a checkpoint couldn't be read.
#[derive(Debug)]
pub enum CheckpointErr {
    Io(io::Error),
    Format(SafeTensorError),
    Metadata(String),
}

impl Display for CheckpointErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckpointErr::Io(e) => write!(f, "io error: {e}"),
            CheckpointErr::Format(e) => write!(f, "malformed safetensors: {e}"),
            CheckpointErr::Metadata(msg) => write!(f, "bad checkpoint metadata: {msg}"),
        }
    }
}

impl Error for CheckpointErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            CheckpointErr::Io(e) => Some(e),
            CheckpointErr::Format(e) => Some(e),
            CheckpointErr::Metadata(_) => None,
        }
    }
}

impl From<io::Error> for CheckpointErr {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<SafeTensorError> for CheckpointErr {
    fn from(value: SafeTensorError) -> Self {
        Self::Format(value)
    }
}

/// Persists the configuration and the parameters of both blocks of `model`.
///
/// # Arguments
/// * `model` - The model to persist.
/// * `path` - Where to write the safetensors file, replacing it if it exists.
pub fn save<P: AsRef<Path>>(model: &DualResNet, path: P) -> Result<()> {
    let path = path.as_ref();
    let config = serde_json::to_string(model.config())
        .map_err(|e| CheckpointErr::Metadata(e.to_string()))?;

    let metadata = HashMap::from([
        ("config".to_string(), config),
        ("format".to_string(), FORMAT.to_string()),
    ]);

    let large = model.block_params(Scale::Large);
    let small = model.block_params(Scale::Small);
    let tensors = [
        (
            "large",
            TensorView::new(Dtype::F32, vec![large.len()], bytemuck::cast_slice(large))
                .map_err(CheckpointErr::from)?,
        ),
        (
            "small",
            TensorView::new(Dtype::F32, vec![small.len()], bytemuck::cast_slice(small))
                .map_err(CheckpointErr::from)?,
        ),
    ];

    let bytes = safetensors::serialize(tensors, &Some(metadata)).map_err(CheckpointErr::from)?;
    fs::write(path, bytes).map_err(CheckpointErr::from)?;

    log::debug!("saved checkpoint to {}", path.display());
    Ok(())
}

/// Rebuilds a model out of a file written by `save`.
pub fn load<P: AsRef<Path>>(path: P) -> std::result::Result<DualResNet, CheckpointErr> {
    let bytes = fs::read(path)?;

    let (_, metadata) = SafeTensors::read_metadata(&bytes)?;
    let Some(entries) = metadata.metadata() else {
        return Err(CheckpointErr::Metadata("missing metadata".into()));
    };

    match entries.get("format") {
        Some(format) if format == FORMAT => {}
        other => {
            return Err(CheckpointErr::Metadata(format!(
                "unsupported format {other:?}, expected {FORMAT}"
            )));
        }
    }

    let config = entries
        .get("config")
        .ok_or_else(|| CheckpointErr::Metadata("missing model configuration".into()))?;
    let config: ResNetConfig =
        serde_json::from_str(config).map_err(|e| CheckpointErr::Metadata(e.to_string()))?;

    let tensors = SafeTensors::deserialize(&bytes)?;
    let large = read_params(&tensors, "large")?;
    let small = read_params(&tensors, "small")?;

    DualResNet::from_params(config, &large, &small)
        .map_err(|e| CheckpointErr::Metadata(e.to_string()))
}

/// Same as `load`, but a checkpoint that can't be read is logged and dismissed.
///
/// # Returns
/// The model, or `None` if the caller has to build a fresh one.
pub fn try_load<P: AsRef<Path>>(path: P) -> Option<DualResNet> {
    let path = path.as_ref();
    match load(path) {
        Ok(model) => {
            log::info!("loaded checkpoint from {}", path.display());
            Some(model)
        }
        Err(e) => {
            log::warn!("couldn't load checkpoint {}: {e}", path.display());
            None
        }
    }
}

fn read_params(
    tensors: &SafeTensors,
    name: &str,
) -> std::result::Result<Vec<f32>, CheckpointErr> {
    let view = tensors.tensor(name)?;
    if view.dtype() != Dtype::F32 {
        return Err(CheckpointErr::Metadata(format!(
            "tensor {name} holds {:?}, expected F32",
            view.dtype()
        )));
    }

    Ok(view
        .data()
        .chunks_exact(4)
        .map(bytemuck::pod_read_unaligned)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::ActFn;
    use ndarray::array;
    use rand::{SeedableRng, rngs::StdRng};

    fn model() -> DualResNet {
        let config = ResNetConfig {
            arch: vec![2, 7, 2],
            act_fn: ActFn::Sigmoid { amp: 1.5 },
            dt: 0.05,
            step_size: 4,
        };
        DualResNet::new(config, &mut StdRng::seed_from_u64(21)).unwrap()
    }

    #[test]
    fn saved_model_predicts_the_same() {
        let path = std::env::temp_dir().join("hits_checkpoint_round_trip.safetensors");
        let model = model();

        save(&model, &path).unwrap();
        let loaded = load(&path).unwrap();
        let _ = fs::remove_file(&path);

        assert_eq!(loaded.config(), model.config());
        assert_eq!(loaded.params(), model.params());

        let x = array![[0.3f32, -0.2]];
        assert_eq!(
            loaded.step(x.view(), Scale::Large).unwrap(),
            model.step(x.view(), Scale::Large).unwrap()
        );
    }

    #[test]
    fn missing_file_is_dismissed() {
        let path = std::env::temp_dir().join("hits_checkpoint_that_does_not_exist.safetensors");
        assert!(matches!(load(&path), Err(CheckpointErr::Io(_))));
        assert!(try_load(&path).is_none());
    }

    #[test]
    fn corrupt_file_is_dismissed() {
        let path = std::env::temp_dir().join("hits_checkpoint_corrupt.safetensors");
        fs::write(&path, b"definitely not a checkpoint").unwrap();

        let res = load(&path);
        let dismissed = try_load(&path).is_none();
        let _ = fs::remove_file(&path);

        assert!(matches!(res, Err(CheckpointErr::Format(_))));
        assert!(dismissed);
    }

    #[test]
    fn foreign_safetensors_file_is_rejected() {
        let path = std::env::temp_dir().join("hits_checkpoint_foreign.safetensors");
        let data = [1f32, 2.];
        let view =
            TensorView::new(Dtype::F32, vec![2], bytemuck::cast_slice::<f32, u8>(&data)).unwrap();
        fs::write(&path, safetensors::serialize([("weights", view)], &None).unwrap()).unwrap();

        let res = load(&path);
        let _ = fs::remove_file(&path);

        assert!(matches!(res, Err(CheckpointErr::Metadata(_))));
    }
}
