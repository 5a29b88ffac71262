mod config;
mod trainer;

pub use config::TrainConfig;
pub use trainer::{TrainReport, TrainState, Trainer, generate_rng};
