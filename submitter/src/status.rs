use serde::{Deserialize, Serialize};

/// Outcome of a boop, either as predicted by simulation or as observed onchain.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BoopStatus {
    Success,
    /// The nonce is not the next one for its track.
    InvalidNonce,
    InsufficientStake,
    /// A self-paying account cannot cover its own fees.
    InsufficientBalance,
    /// The boop's `max_fee_per_gas` is below the current gas price.
    GasPriceTooHigh,
    MalformedBoop,
    PayoutFailed,
    /// The account's `validate` returned an error.
    ValidationRejected(RejectReason),
    /// The account's `validate` reverted.
    ValidationReverted,
    PaymentValidationRejected,
    PaymentValidationReverted,
    /// The call made by the account reverted.
    CallReverted,
    ExecuteRejected,
    ExecuteReverted,
    EntryPointOutOfGas,
    UnexpectedReverted,
}

/// Why validation rejected a boop, decoded from the nested error selector.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RejectReason {
    InvalidSignature,
    InvalidExtensionValue,
    ExtensionNotRegistered,
    /// Validation needs data the simulation could not provide, most likely a signature.
    UnknownDuringSimulation,
    Other,
}

impl BoopStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, BoopStatus::Success)
    }

    pub fn as_str(&self) -> &'static str {
        use BoopStatus::*;
        match self {
            Success => "success",
            InvalidNonce => "invalid_nonce",
            InsufficientStake => "insufficient_stake",
            InsufficientBalance => "insufficient_balance",
            GasPriceTooHigh => "gas_price_too_high",
            MalformedBoop => "malformed_boop",
            PayoutFailed => "payout_failed",
            ValidationRejected(_) => "validation_rejected",
            ValidationReverted => "validation_reverted",
            PaymentValidationRejected => "payment_validation_rejected",
            PaymentValidationReverted => "payment_validation_reverted",
            CallReverted => "call_reverted",
            ExecuteRejected => "execute_rejected",
            ExecuteReverted => "execute_reverted",
            EntryPointOutOfGas => "entry_point_out_of_gas",
            UnexpectedReverted => "unexpected_reverted",
        }
    }

    pub fn description(&self) -> &'static str {
        use BoopStatus::*;
        match self {
            Success => "Boop executed successfully.",
            InvalidNonce => "The nonce provided was invalid outside of simulation.",
            InsufficientStake => "The paymaster does not have sufficient stake.",
            InsufficientBalance => "The self-paying account does not have enough balance to pay for gas.",
            GasPriceTooHigh => "The onchain gas price is higher than the boop's max fee per gas.",
            MalformedBoop => "The boop could not be decoded by the entry point.",
            PayoutFailed => "The payer failed to pay the submitter.",
            ValidationRejected(RejectReason::InvalidSignature) => {
                "Account rejected the boop because its signature is invalid."
            }
            ValidationRejected(RejectReason::InvalidExtensionValue) => {
                "Account rejected the boop because an extension value is invalid."
            }
            ValidationRejected(RejectReason::ExtensionNotRegistered) => {
                "Account rejected the boop because an extension is not registered."
            }
            ValidationRejected(RejectReason::UnknownDuringSimulation) => {
                "More information is needed for the boop to pass validation, most likely a signature."
            }
            ValidationRejected(RejectReason::Other) => "Account rejected the boop.",
            ValidationReverted => "Account reverted during validation.",
            PaymentValidationRejected => "Paymaster rejected the boop.",
            PaymentValidationReverted => "Paymaster reverted during payment validation.",
            CallReverted => "The call made by the account reverted.",
            ExecuteRejected => "The account's execute function rejected the call.",
            ExecuteReverted => "The account's execute function reverted.",
            EntryPointOutOfGas => {
                "The boop was included onchain but ran out of gas. For self-paying boops this can \
                 indicate a payout that uses more gas onchain than during simulation."
            }
            UnexpectedReverted => "The boop reverted for an unexpected reason.",
        }
    }
}
