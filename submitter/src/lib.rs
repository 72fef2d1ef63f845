//! Transaction submission core of a boop relay.
//!
//! Boops are admitted into per-`(account, nonce_track)` queues, handed to the
//! processor strictly in nonce order, sent to the entry point through a pool of
//! executor keys, and reconciled into receipts once mined.

#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used, clippy::panic)]
#![deny(clippy::arithmetic_side_effects)]

pub use boop::{Boop, BoopHash, TrackKey};
pub use error::{SimulationFailure, SubmitterError};
pub use executor::{ExecutorKey, ExecutorKeyPool};
pub use metrics::SubmitterMetrics;
pub use processor::{BoopProcessor, FeeParams, FeePolicy, SimulationOutput, Simulator};
pub use queue::{NonceRetriever, NonceTrackRegistry, PendingBoop, Processor, QueueManager};
pub use receipt::{
    BoopLog, BoopReceipt, InMemoryReceiptDb, ReceiptDb, ReceiptReconciler, RocksReceiptDb,
};
pub use service::SubmitterService;
pub use settings::{load_settings, SubmitterSettings};
pub use status::{BoopStatus, RejectReason};
pub use trace::TracingConfig;

pub mod boop;
pub mod chain;
mod error;
mod executor;
pub mod metrics;
mod processor;
pub mod queue;
pub mod receipt;
mod service;
pub mod settings;
mod status;
pub mod trace;
