mod composite;
mod composition;

pub use composite::CompositeLoss;
pub use composition::{Composition, CompositionTable, Reduction};
