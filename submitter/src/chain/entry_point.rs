use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use async_trait::async_trait;
use ethers::abi::{self, ParamType, Token};
use ethers::types::{
    transaction::eip2718::TypedTransaction, Address, Bytes, Eip1559TransactionRequest, Log, H256,
    U256,
};
use ethers::utils::{id, keccak256};

use crate::boop::Boop;
use crate::queue::NonceRetriever;

use super::{ChainCommunicationError, ChainResult, EvmProvider};

const SUBMIT_SIGNATURE: &str = "submit(bytes)";
const NONCE_VALUES_SIGNATURE: &str = "nonceValues(address,uint192)";

pub(crate) const BOOP_EXECUTION_STARTED_EVENT: &str = "BoopExecutionStarted()";
pub(crate) const BOOP_SUBMITTED_EVENT: &str = "BoopSubmitted(address,address,address,uint256,uint192,uint64,uint256,int256,uint32,uint32,uint32,uint32,bytes,bytes,bytes)";
pub(crate) const CALL_REVERTED_EVENT: &str = "CallReverted(bytes)";
pub(crate) const EXECUTION_REJECTED_EVENT: &str = "ExecutionRejected(bytes)";
pub(crate) const EXECUTION_REVERTED_EVENT: &str = "ExecutionReverted(bytes)";

pub(crate) const GAS_PRICE_TOO_HIGH_ERROR: &str = "GasPriceTooHigh()";
pub(crate) const INSUFFICIENT_BALANCE_ERROR: &str = "InsufficientBalance()";
pub(crate) const INSUFFICIENT_STAKE_ERROR: &str = "InsufficientStake()";
pub(crate) const INVALID_NONCE_ERROR: &str = "InvalidNonce()";
pub(crate) const MALFORMED_BOOP_ERROR: &str = "MalformedBoop()";
pub(crate) const PAYOUT_FAILED_ERROR: &str = "PayoutFailed()";
pub(crate) const VALIDATION_REVERTED_ERROR: &str = "ValidationReverted(bytes)";
pub(crate) const VALIDATION_REJECTED_ERROR: &str = "ValidationRejected(bytes)";
pub(crate) const PAYMENT_VALIDATION_REVERTED_ERROR: &str = "PaymentValidationReverted(bytes)";
pub(crate) const PAYMENT_VALIDATION_REJECTED_ERROR: &str = "PaymentValidationRejected(bytes)";
pub(crate) const INVALID_SIGNATURE_ERROR: &str = "InvalidSignature()";
pub(crate) const UNKNOWN_DURING_SIMULATION_ERROR: &str = "UnknownDuringSimulation()";
pub(crate) const INVALID_EXTENSION_VALUE_ERROR: &str = "InvalidExtensionValue()";
pub(crate) const EXTENSION_NOT_REGISTERED_ERROR: &str = "ExtensionNotRegistered(address,uint8)";

/// Topic0 of an event with the given signature.
pub(crate) fn event_topic(signature: &str) -> H256 {
    H256(keccak256(signature))
}

/// Whether `data` starts with the selector of `signature`.
pub(crate) fn has_selector(data: &[u8], signature: &str) -> bool {
    data.get(..4) == Some(&id(signature)[..])
}

/// Decodes the single `bytes` argument of an error or event payload.
pub(crate) fn decode_bytes_arg(data: &[u8]) -> Option<Bytes> {
    abi::decode(&[ParamType::Bytes], data)
        .ok()?
        .into_iter()
        .next()?
        .into_bytes()
        .map(Into::into)
}

/// What the entry point's `submit` reports when called from the zero address.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubmitOutput {
    pub gas: u32,
    pub execute_gas: u32,
    pub validate_gas: u32,
    pub validate_payment_gas: u32,
    pub validity_unknown_during_simulation: bool,
    pub payment_validity_unknown_during_simulation: bool,
    pub future_nonce_during_simulation: bool,
    pub call_status: CallStatus,
    pub revert_data: Bytes,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallStatus {
    Succeeded,
    CallReverted,
    ExecuteFailed,
    ExecuteReverted,
}

impl TryFrom<U256> for CallStatus {
    type Error = ChainCommunicationError;

    fn try_from(value: U256) -> Result<Self, Self::Error> {
        match value.low_u64() {
            0 => Ok(CallStatus::Succeeded),
            1 => Ok(CallStatus::CallReverted),
            2 => Ok(CallStatus::ExecuteFailed),
            3 => Ok(CallStatus::ExecuteReverted),
            other => Err(ChainCommunicationError::Decode(format!(
                "Unknown call status {other}"
            ))),
        }
    }
}

impl SubmitOutput {
    fn param_type() -> ParamType {
        ParamType::Tuple(vec![
            ParamType::Uint(32),
            ParamType::Uint(32),
            ParamType::Uint(32),
            ParamType::Uint(32),
            ParamType::Bool,
            ParamType::Bool,
            ParamType::Bool,
            ParamType::Uint(8),
            ParamType::Bytes,
        ])
    }

    pub fn decode(data: &[u8]) -> ChainResult<Self> {
        let malformed = || ChainCommunicationError::Decode("Malformed submit output".to_owned());
        let tokens = abi::decode(&[Self::param_type()], data)
            .map_err(|e| ChainCommunicationError::Decode(e.to_string()))?;
        let fields = tokens
            .into_iter()
            .next()
            .and_then(Token::into_tuple)
            .ok_or_else(malformed)?;
        let [gas, execute_gas, validate_gas, validate_payment_gas, validity_unknown, payment_validity_unknown, future_nonce, call_status, revert_data]: [Token; 9] =
            fields.try_into().map_err(|_| malformed())?;

        let gas_value = |t: Token| -> ChainResult<u32> {
            t.into_uint()
                .and_then(|v| u32::try_from(v).ok())
                .ok_or_else(malformed)
        };
        Ok(Self {
            gas: gas_value(gas)?,
            execute_gas: gas_value(execute_gas)?,
            validate_gas: gas_value(validate_gas)?,
            validate_payment_gas: gas_value(validate_payment_gas)?,
            validity_unknown_during_simulation: validity_unknown
                .into_bool()
                .ok_or_else(malformed)?,
            payment_validity_unknown_during_simulation: payment_validity_unknown
                .into_bool()
                .ok_or_else(malformed)?,
            future_nonce_during_simulation: future_nonce.into_bool().ok_or_else(malformed)?,
            call_status: call_status.into_uint().ok_or_else(malformed)?.try_into()?,
            revert_data: revert_data.into_bytes().ok_or_else(malformed)?.into(),
        })
    }

    #[cfg(test)]
    pub(crate) fn encode(&self) -> Bytes {
        let status: u8 = match self.call_status {
            CallStatus::Succeeded => 0,
            CallStatus::CallReverted => 1,
            CallStatus::ExecuteFailed => 2,
            CallStatus::ExecuteReverted => 3,
        };
        abi::encode(&[Token::Tuple(vec![
            Token::Uint(self.gas.into()),
            Token::Uint(self.execute_gas.into()),
            Token::Uint(self.validate_gas.into()),
            Token::Uint(self.validate_payment_gas.into()),
            Token::Bool(self.validity_unknown_during_simulation),
            Token::Bool(self.payment_validity_unknown_during_simulation),
            Token::Bool(self.future_nonce_during_simulation),
            Token::Uint(status.into()),
            Token::Bytes(self.revert_data.to_vec()),
        ])])
        .into()
    }
}

/// The entry point contract, reached through an `EvmProvider`.
#[derive(Clone)]
pub struct EntryPoint {
    address: Address,
    provider: Arc<dyn EvmProvider>,
}

impl Debug for EntryPoint {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntryPoint")
            .field("address", &self.address)
            .finish()
    }
}

impl EntryPoint {
    pub fn new(address: Address, provider: Arc<dyn EvmProvider>) -> Self {
        Self { address, provider }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn provider(&self) -> &Arc<dyn EvmProvider> {
        &self.provider
    }

    pub fn submit_calldata(&self, boop: &Boop) -> Bytes {
        let mut data = id(SUBMIT_SIGNATURE).to_vec();
        data.extend(abi::encode(&[Token::Bytes(boop.encode().to_vec())]));
        data.into()
    }

    /// Dry-runs `submit` from the zero address, which lets the entry point
    /// report a future nonce instead of reverting.
    pub async fn simulate_submit(&self, boop: &Boop) -> ChainResult<SubmitOutput> {
        let tx: TypedTransaction = Eip1559TransactionRequest::new()
            .from(Address::zero())
            .to(self.address)
            .data(self.submit_calldata(boop))
            .into();
        let output = self.provider.call(&tx).await?;
        SubmitOutput::decode(&output)
    }

    pub async fn nonce_value(&self, account: Address, nonce_track: U256) -> ChainResult<u64> {
        let mut data = id(NONCE_VALUES_SIGNATURE).to_vec();
        data.extend(abi::encode(&[
            Token::Address(account),
            Token::Uint(nonce_track),
        ]));
        let tx: TypedTransaction = Eip1559TransactionRequest::new()
            .to(self.address)
            .data(data)
            .into();
        let output = self.provider.call(&tx).await?;
        let value = abi::decode(&[ParamType::Uint(64)], &output)
            .ok()
            .and_then(|tokens| tokens.into_iter().next())
            .and_then(Token::into_uint)
            .ok_or_else(|| ChainCommunicationError::Decode("Malformed nonce value".to_owned()))?;
        u64::try_from(value)
            .map_err(|_| ChainCommunicationError::Decode(format!("Nonce {value} overflows u64")))
    }
}

#[async_trait]
impl NonceRetriever for EntryPoint {
    async fn fetch_nonce(&self, boop: &Boop) -> ChainResult<u64> {
        self.nonce_value(boop.account, boop.nonce_track).await
    }
}

/// Decodes the boop carried by a `BoopSubmitted` log. `None` if the log is
/// not one, `Some(Err)` if it claims to be but cannot be decoded.
pub(crate) fn decode_boop_submitted(log: &Log) -> Option<Result<Boop, String>> {
    if log.topics.first() != Some(&event_topic(BOOP_SUBMITTED_EVENT)) {
        return None;
    }
    let decoded = abi::decode(&Boop::param_types(), &log.data)
        .map_err(|e| e.to_string())
        .and_then(|tokens| {
            Boop::from_tokens(tokens).ok_or_else(|| "field out of range".to_owned())
        });
    Some(decoded)
}
