mod activations;
pub mod layers;
mod resnet;
mod residual;
mod scale;

pub use activations::ActFn;
pub use resnet::{DualResNet, ResNetConfig, Tape};
pub use residual::{BlockTrace, ResidualBlock};
pub use scale::Scale;
