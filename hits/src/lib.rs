pub mod arch;
pub mod checkpoint;
pub mod dataset;
pub mod error;
pub mod forecast;
pub mod loss;
pub mod optimization;
pub mod training;

pub use error::{MlErr, Result};
