//! Per-account, per-nonce-track buffering of boops.
//!
//! Boops are grouped into tracks keyed by `(account, nonce_track)`. Each track hands its
//! boops to a [`Processor`] strictly in nonce order, one at a time, while distinct tracks
//! make progress independently.

use async_trait::async_trait;

pub use manager::QueueManager;
pub use registry::{Admission, Admitted, NonceTrackRegistry};
pub use track::{BufferedEntry, NonceTrack, PendingBoop};

use crate::boop::Boop;
use crate::chain::ChainResult;
use crate::error::SubmitterError;

mod manager;
mod registry;
mod track;

#[cfg(test)]
mod tests;

/// Does the actual work for a boop once it reaches the head of its track.
#[async_trait]
pub trait Processor: Send + Sync + 'static {
    type Output: Send + 'static;

    async fn process(&self, boop: Boop) -> Result<Self::Output, SubmitterError>;

    /// Label of a completed boop in the `processed_boops` metric.
    fn outcome_label(_output: &Self::Output) -> &'static str {
        "processed"
    }
}

/// Source of truth for the next nonce of a track.
#[async_trait]
pub trait NonceRetriever: Send + Sync + 'static {
    async fn fetch_nonce(&self, boop: &Boop) -> ChainResult<u64>;
}
