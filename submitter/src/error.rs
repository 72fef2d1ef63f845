use std::fmt::{Display, Formatter};
use std::time::Duration;

use ethers::types::{Bytes, U256};

use crate::boop::TrackKey;
use crate::chain::ChainCommunicationError;
use crate::receipt::DbError;
use crate::status::BoopStatus;

#[derive(Debug, thiserror::Error)]
pub enum SubmitterError {
    #[error("Buffer exceeded: track {key} already holds {limit} boops")]
    BufferExceeded { key: TrackKey, limit: usize },
    #[error("Nonce out of range: {nonce} is more than {limit} ahead of {next_nonce}")]
    NonceOutOfRange {
        nonce: u64,
        next_nonce: u64,
        limit: usize,
    },
    #[error("Nonce too low: {nonce} is below the next nonce {next_nonce}")]
    NonceTooLow { nonce: u64, next_nonce: u64 },
    #[error("Submitter is at capacity and no queued boop can be evicted")]
    CapacityExceeded,
    #[error("Boop evicted because the submitter reached capacity")]
    CapacityEvicted,
    #[error("Boop superseded by a newer boop with the same nonce")]
    Superseded,
    #[error("Simulation failed: {0}")]
    Simulation(SimulationFailure),
    #[error("The onchain gas price is higher than the boop's max fee per gas ({max_fee_per_gas} < {required})")]
    GasPriceTooHigh { max_fee_per_gas: U256, required: U256 },
    #[error("Base fee {base_fee} is above the maximum of {max_base_fee}")]
    BaseFeeTooHigh { base_fee: U256, max_base_fee: U256 },
    #[error("Self-paying boop must specify its max fee per gas and gas limits")]
    MissingGasValues,
    #[error("Boop was not included after {0:?}")]
    SubmitTimeout(Duration),
    #[error("Malformed receipt: {0}")]
    MalformedReceipt(String),
    #[error("Could not decode event: {0}")]
    UndecodableEvent(String),
    #[error("Signing error: {0}")]
    SigningError(String),
    #[error("Chain communication error: {0}")]
    ChainCommunicationError(#[from] ChainCommunicationError),
    #[error("DB error: {0}")]
    DbError(#[from] DbError),
    #[error("Processor panicked")]
    ProcessorPanicked,
    #[error("Channel closed")]
    ChannelClosed,
    #[error("{0}")]
    EyreError(#[from] eyre::Report),
}

/// A simulation that did not end in `Success`, as reported to the caller.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SimulationFailure {
    pub status: BoopStatus,
    pub revert_data: Bytes,
}

impl Display for SimulationFailure {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.status.description())?;
        if !self.revert_data.is_empty() {
            write!(f, " (revert data {})", self.revert_data)?;
        }
        Ok(())
    }
}

impl SubmitterError {
    /// Rejected at enqueue time, before any chain write.
    pub fn is_admission_error(&self) -> bool {
        matches!(
            self,
            SubmitterError::BufferExceeded { .. }
                | SubmitterError::NonceOutOfRange { .. }
                | SubmitterError::NonceTooLow { .. }
                | SubmitterError::CapacityExceeded
        )
    }

    /// Onchain status this error corresponds to, if any.
    pub fn status(&self) -> Option<BoopStatus> {
        match self {
            SubmitterError::Simulation(failure) => Some(failure.status),
            SubmitterError::GasPriceTooHigh { .. } => Some(BoopStatus::GasPriceTooHigh),
            _ => None,
        }
    }

    /// Short label used in metrics and logs.
    pub fn label(&self) -> &'static str {
        use SubmitterError::*;
        match self {
            BufferExceeded { .. } => "buffer_exceeded",
            NonceOutOfRange { .. } => "nonce_out_of_range",
            NonceTooLow { .. } => "nonce_too_low",
            CapacityExceeded => "capacity_exceeded",
            CapacityEvicted => "capacity_evicted",
            Superseded => "superseded",
            Simulation(failure) => failure.status.as_str(),
            GasPriceTooHigh { .. } => "gas_price_too_high",
            BaseFeeTooHigh { .. } => "base_fee_too_high",
            MissingGasValues => "missing_gas_values",
            SubmitTimeout(_) => "submit_timeout",
            MalformedReceipt(_) => "malformed_receipt",
            UndecodableEvent(_) => "undecodable_event",
            SigningError(_) => "signing_error",
            ChainCommunicationError(_) => "rpc_error",
            DbError(_) => "db_error",
            ProcessorPanicked => "processor_panicked",
            ChannelClosed => "channel_closed",
            EyreError(_) => "unexpected_error",
        }
    }
}
