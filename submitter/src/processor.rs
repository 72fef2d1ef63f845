//! The submission pipeline run for each boop once it reaches the head of its track.

pub use fees::{apply_gas_margin, FeeParams, FeePolicy};
pub use pipeline::BoopProcessor;
pub use simulate::{SimulationOutput, Simulator};

mod fees;
mod pipeline;
mod simulate;
