use std::time::Duration;

use ethers::types::Bytes;
use moka::future::Cache;
use tracing::{debug, instrument, trace};

use crate::boop::{Boop, BoopHash};
use crate::chain::entry_point::{
    decode_bytes_arg, has_selector, EXTENSION_NOT_REGISTERED_ERROR, GAS_PRICE_TOO_HIGH_ERROR,
    INSUFFICIENT_BALANCE_ERROR, INSUFFICIENT_STAKE_ERROR, INVALID_EXTENSION_VALUE_ERROR,
    INVALID_NONCE_ERROR, INVALID_SIGNATURE_ERROR, MALFORMED_BOOP_ERROR,
    PAYMENT_VALIDATION_REJECTED_ERROR, PAYMENT_VALIDATION_REVERTED_ERROR, PAYOUT_FAILED_ERROR,
    UNKNOWN_DURING_SIMULATION_ERROR, VALIDATION_REJECTED_ERROR, VALIDATION_REVERTED_ERROR,
};
use crate::chain::{CallStatus, EntryPoint, SubmitOutput};
use crate::error::{SimulationFailure, SubmitterError};
use crate::status::{BoopStatus, RejectReason};

/// Outcome of a dry run of `EntryPoint.submit`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SimulationOutput {
    pub status: BoopStatus,
    pub gas: u32,
    pub validate_gas: u32,
    pub validate_payment_gas: u32,
    pub execute_gas: u32,
    /// The boop's nonce is ahead of the onchain nonce of its track
    pub future_nonce: bool,
    pub revert_data: Bytes,
}

impl SimulationOutput {
    fn failed(status: BoopStatus, revert_data: Bytes) -> Self {
        Self {
            status,
            gas: 0,
            validate_gas: 0,
            validate_payment_gas: 0,
            execute_gas: 0,
            future_nonce: false,
            revert_data,
        }
    }

    /// The output as a caller facing error, unless the simulation succeeded.
    pub fn into_result(self) -> Result<Self, SubmitterError> {
        if self.status.is_success() {
            return Ok(self);
        }
        Err(SubmitterError::Simulation(SimulationFailure {
            status: self.status,
            revert_data: self.revert_data,
        }))
    }
}

impl From<SubmitOutput> for SimulationOutput {
    fn from(output: SubmitOutput) -> Self {
        let status = if output.validity_unknown_during_simulation
            || output.payment_validity_unknown_during_simulation
        {
            BoopStatus::ValidationReverted
        } else {
            match output.call_status {
                CallStatus::Succeeded => BoopStatus::Success,
                CallStatus::CallReverted => BoopStatus::CallReverted,
                CallStatus::ExecuteFailed => BoopStatus::ExecuteRejected,
                CallStatus::ExecuteReverted => BoopStatus::ExecuteReverted,
            }
        };
        Self {
            status,
            gas: output.gas,
            validate_gas: output.validate_gas,
            validate_payment_gas: output.validate_payment_gas,
            execute_gas: output.execute_gas,
            future_nonce: output.future_nonce_during_simulation,
            revert_data: output.revert_data,
        }
    }
}

/// Maps an entry point revert to a status by its custom error selector.
pub(crate) fn status_from_revert(data: &[u8]) -> BoopStatus {
    let simple = [
        (INVALID_NONCE_ERROR, BoopStatus::InvalidNonce),
        (INSUFFICIENT_STAKE_ERROR, BoopStatus::InsufficientStake),
        (INSUFFICIENT_BALANCE_ERROR, BoopStatus::InsufficientBalance),
        (GAS_PRICE_TOO_HIGH_ERROR, BoopStatus::GasPriceTooHigh),
        (MALFORMED_BOOP_ERROR, BoopStatus::MalformedBoop),
        (PAYOUT_FAILED_ERROR, BoopStatus::PayoutFailed),
        (VALIDATION_REVERTED_ERROR, BoopStatus::ValidationReverted),
        (PAYMENT_VALIDATION_REJECTED_ERROR, BoopStatus::PaymentValidationRejected),
        (PAYMENT_VALIDATION_REVERTED_ERROR, BoopStatus::PaymentValidationReverted),
    ];
    if has_selector(data, VALIDATION_REJECTED_ERROR) {
        let reason = data
            .get(4..)
            .and_then(decode_bytes_arg)
            .map(|inner| reject_reason(&inner))
            .unwrap_or(RejectReason::Other);
        return BoopStatus::ValidationRejected(reason);
    }
    simple
        .iter()
        .find(|(signature, _)| has_selector(data, signature))
        .map(|(_, status)| *status)
        .unwrap_or(BoopStatus::UnexpectedReverted)
}

fn reject_reason(inner: &[u8]) -> RejectReason {
    [
        (INVALID_SIGNATURE_ERROR, RejectReason::InvalidSignature),
        (INVALID_EXTENSION_VALUE_ERROR, RejectReason::InvalidExtensionValue),
        (EXTENSION_NOT_REGISTERED_ERROR, RejectReason::ExtensionNotRegistered),
        (UNKNOWN_DURING_SIMULATION_ERROR, RejectReason::UnknownDuringSimulation),
    ]
    .iter()
    .find(|(signature, _)| has_selector(inner, signature))
    .map(|(_, reason)| *reason)
    .unwrap_or(RejectReason::Other)
}

/// Runs boops against the entry point without submitting them, and remembers the
/// latest outcome for each boop hash.
#[derive(Clone, Debug)]
pub struct Simulator {
    entry_point: EntryPoint,
    cache: Cache<BoopHash, SimulationOutput>,
}

impl Simulator {
    pub fn new(entry_point: EntryPoint, cache_size: u64, cache_ttl: Duration) -> Self {
        let cache = Cache::builder()
            .max_capacity(cache_size)
            .time_to_live(cache_ttl)
            .build();
        Self { entry_point, cache }
    }

    /// Simulates the boop. Reverts are classified into a status rather than returned
    /// as errors; only failing to reach the chain is an error.
    #[instrument(skip_all, fields(boop_hash = ?boop.hash()), level = "debug")]
    pub async fn simulate(&self, boop: &Boop) -> Result<SimulationOutput, SubmitterError> {
        let output = match self.entry_point.simulate_submit(boop).await {
            Ok(output) => SimulationOutput::from(output),
            Err(err) => match err.revert_data() {
                Some(revert_data) => {
                    let status = status_from_revert(&revert_data);
                    debug!(?status, %revert_data, "Simulation reverted");
                    SimulationOutput::failed(status, revert_data)
                }
                None => return Err(err.into()),
            },
        };
        trace!(?output, "Simulated boop");
        self.cache.insert(boop.hash(), output.clone()).await;
        Ok(output)
    }

    /// The latest simulation outcome of a boop, if still cached.
    pub async fn cached_simulation(&self, boop_hash: &BoopHash) -> Option<SimulationOutput> {
        self.cache.get(boop_hash).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use ethers::abi::Token;
    use ethers::types::Address;

    use super::*;
    use crate::boop::test_utils::sponsored_boop;
    use crate::chain::entry_point::test_utils::encoded_error;
    use crate::chain::test_utils::{rpc_error, MockEvmProvider};
    use crate::chain::ChainCommunicationError;

    fn submit_output(call_status: CallStatus) -> SubmitOutput {
        SubmitOutput {
            gas: 100_000,
            execute_gas: 60_000,
            validate_gas: 20_000,
            validate_payment_gas: 0,
            validity_unknown_during_simulation: false,
            payment_validity_unknown_during_simulation: false,
            future_nonce_during_simulation: false,
            call_status,
            revert_data: Bytes::new(),
        }
    }

    fn simulator(provider: MockEvmProvider) -> Simulator {
        let entry_point = EntryPoint::new(Address::repeat_byte(0xee), Arc::new(provider));
        Simulator::new(entry_point, 100, Duration::from_secs(60))
    }

    fn revert(data: Bytes) -> ChainCommunicationError {
        ChainCommunicationError::JsonRpc {
            code: 3,
            message: "execution reverted".to_owned(),
            data: Some(data),
        }
    }

    #[test]
    fn test_nested_validation_rejections_are_decoded() {
        let rejected = |inner: Bytes| {
            encoded_error(VALIDATION_REJECTED_ERROR, &[Token::Bytes(inner.to_vec())])
        };
        assert_eq!(
            status_from_revert(&rejected(encoded_error(INVALID_SIGNATURE_ERROR, &[]))),
            BoopStatus::ValidationRejected(RejectReason::InvalidSignature)
        );
        assert_eq!(
            status_from_revert(&rejected(encoded_error(
                EXTENSION_NOT_REGISTERED_ERROR,
                &[Token::Address(Address::zero()), Token::Uint(1u8.into())]
            ))),
            BoopStatus::ValidationRejected(RejectReason::ExtensionNotRegistered)
        );
        assert_eq!(
            status_from_revert(&rejected(vec![0x12, 0x34, 0x56, 0x78].into())),
            BoopStatus::ValidationRejected(RejectReason::Other)
        );
        assert_eq!(
            status_from_revert(&encoded_error(PAYOUT_FAILED_ERROR, &[])),
            BoopStatus::PayoutFailed
        );
        assert_eq!(status_from_revert(&[]), BoopStatus::UnexpectedReverted);
    }

    #[test]
    fn test_call_status_maps_to_boop_status() {
        for (call_status, status) in [
            (CallStatus::Succeeded, BoopStatus::Success),
            (CallStatus::CallReverted, BoopStatus::CallReverted),
            (CallStatus::ExecuteFailed, BoopStatus::ExecuteRejected),
            (CallStatus::ExecuteReverted, BoopStatus::ExecuteReverted),
        ] {
            assert_eq!(SimulationOutput::from(submit_output(call_status)).status, status);
        }

        let unknown = SubmitOutput {
            validity_unknown_during_simulation: true,
            ..submit_output(CallStatus::Succeeded)
        };
        assert_eq!(
            SimulationOutput::from(unknown).status,
            BoopStatus::ValidationReverted
        );
    }

    #[tokio::test]
    async fn test_outcomes_are_cached_before_returning() {
        let mut provider = MockEvmProvider::new();
        provider
            .expect_call()
            .times(1)
            .returning(|_| Ok(submit_output(CallStatus::Succeeded).encode()));
        let simulator = simulator(provider);
        let boop = sponsored_boop(Address::repeat_byte(1), 0, 0);

        let output = simulator.simulate(&boop).await.unwrap();
        assert_eq!(output.status, BoopStatus::Success);
        assert_eq!(output.gas, 100_000);
        assert_eq!(simulator.cached_simulation(&boop.hash()).await, Some(output));
    }

    #[tokio::test]
    async fn test_reverts_become_failed_outcomes() {
        let mut provider = MockEvmProvider::new();
        provider
            .expect_call()
            .returning(|_| Err(revert(encoded_error(INVALID_NONCE_ERROR, &[]))));
        let simulator = simulator(provider);
        let boop = sponsored_boop(Address::repeat_byte(1), 0, 0);

        let output = simulator.simulate(&boop).await.unwrap();
        assert_eq!(output.status, BoopStatus::InvalidNonce);
        let cached = simulator.cached_simulation(&boop.hash()).await.unwrap();
        assert_eq!(cached.status, BoopStatus::InvalidNonce);

        let err = output.into_result().unwrap_err();
        assert_eq!(err.status(), Some(BoopStatus::InvalidNonce));
    }

    #[tokio::test]
    async fn test_transport_errors_are_not_cached() {
        let mut provider = MockEvmProvider::new();
        provider
            .expect_call()
            .returning(|_| Err(rpc_error(-32000, "header not found")));
        let simulator = simulator(provider);
        let boop = sponsored_boop(Address::repeat_byte(1), 0, 0);

        let err = simulator.simulate(&boop).await.unwrap_err();
        assert!(matches!(err, SubmitterError::ChainCommunicationError(_)));
        assert_eq!(simulator.cached_simulation(&boop.hash()).await, None);
    }
}
