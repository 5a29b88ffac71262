use std::{
    error::Error,
    fmt::{self, Display},
    io,
};

use ndarray::ShapeError;

use crate::checkpoint::CheckpointErr;

/// The result type used in the entire crate.
pub type Result<T> = std::result::Result<T, MlErr>;

/// The crate's error type.
#[derive(Debug)]
pub enum MlErr {
    /// The model and the dataset disagree on a configuration value.
    Consistency {
        field: &'static str,
        model: String,
        dataset: String,
    },
    SizeMismatch {
        what: &'static str,
        got: usize,
        expected: usize,
    },
    InvalidInput(String),
    Shape(ShapeError),
    /// A loss stopped being a finite number during training.
    NonFinite {
        epoch: usize,
        loss: f32,
    },
    Checkpoint(CheckpointErr),
    Io(io::Error),
}

impl MlErr {
    pub(crate) fn invalid<S: Into<String>>(msg: S) -> Self {
        Self::InvalidInput(msg.into())
    }
}

impl Display for MlErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MlErr::Consistency {
                field,
                model,
                dataset,
            } => write!(
                f,
                "model and dataset disagree on {field}: model has {model}, dataset has {dataset}"
            ),
            MlErr::SizeMismatch {
                what,
                got,
                expected,
            } => write!(
                f,
                "size mismatch for {what}: got {got}, expected {expected}"
            ),
            MlErr::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            MlErr::Shape(e) => write!(f, "shape error: {e}"),
            MlErr::NonFinite { epoch, loss } => {
                write!(f, "loss became {loss} at epoch {epoch}")
            }
            MlErr::Checkpoint(e) => write!(f, "checkpoint error: {e}"),
            MlErr::Io(e) => write!(f, "io error: {e}"),
        }
    }
}

impl Error for MlErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            MlErr::Shape(e) => Some(e),
            MlErr::Checkpoint(e) => Some(e),
            MlErr::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ShapeError> for MlErr {
    fn from(value: ShapeError) -> Self {
        Self::Shape(value)
    }
}

impl From<CheckpointErr> for MlErr {
    fn from(value: CheckpointErr) -> Self {
        Self::Checkpoint(value)
    }
}

impl From<io::Error> for MlErr {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}
