use std::fmt::{Display, Formatter};

use derive_new::new;
use ethers::abi::{self, ParamType, Token};
use ethers::types::{Address, Bytes, H256, I256, U256};
use ethers::utils::keccak256;
use serde::{Deserialize, Serialize};

/// Content hash identifying a boop. See [`Boop::hash`].
pub type BoopHash = H256;

/// A signed operation submitted on behalf of `account`.
///
/// Only `account`, `nonce_track` and `nonce_value` matter to the queue; the
/// rest is forwarded to the entry point untouched, except for the gas and fee
/// fields of sponsored boops which the submitter fills from simulation.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Boop {
    pub account: Address,
    pub dest: Address,
    pub payer: Address,
    pub value: U256,
    /// Ordering lane within the account, a `uint192` onchain.
    pub nonce_track: U256,
    pub nonce_value: u64,
    pub max_fee_per_gas: U256,
    pub submitter_fee: i128,
    pub gas_limit: u32,
    pub validate_gas_limit: u32,
    pub validate_payment_gas_limit: u32,
    pub execute_gas_limit: u32,
    pub call_data: Bytes,
    pub validator_data: Bytes,
    pub extra_data: Bytes,
}

/// Identifies the ordering lane a boop belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, new, Serialize, Deserialize)]
pub struct TrackKey {
    pub account: Address,
    pub nonce_track: U256,
}

impl Display for TrackKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}-{}", self.account, self.nonce_track)
    }
}

impl Boop {
    pub fn key(&self) -> TrackKey {
        TrackKey::new(self.account, self.nonce_track)
    }

    pub fn is_self_paying(&self) -> bool {
        self.payer == self.account
    }

    /// `keccak256` of the ABI-encoded boop.
    ///
    /// Sponsored boops are hashed with their gas limits, `max_fee_per_gas` and
    /// `submitter_fee` zeroed: the submitter may fill those after the user signed,
    /// and the hash must still identify the same boop.
    pub fn hash(&self) -> BoopHash {
        let tokens = if self.is_self_paying() {
            self.to_tokens()
        } else {
            Boop {
                max_fee_per_gas: U256::zero(),
                submitter_fee: 0,
                gas_limit: 0,
                validate_gas_limit: 0,
                validate_payment_gas_limit: 0,
                execute_gas_limit: 0,
                ..self.clone()
            }
            .to_tokens()
        };
        H256(keccak256(abi::encode(&tokens)))
    }

    /// ABI encoding passed to `EntryPoint.submit`.
    pub fn encode(&self) -> Bytes {
        abi::encode(&self.to_tokens()).into()
    }

    pub fn param_types() -> Vec<ParamType> {
        vec![
            ParamType::Address,
            ParamType::Address,
            ParamType::Address,
            ParamType::Uint(256),
            ParamType::Uint(192),
            ParamType::Uint(64),
            ParamType::Uint(256),
            ParamType::Int(256),
            ParamType::Uint(32),
            ParamType::Uint(32),
            ParamType::Uint(32),
            ParamType::Uint(32),
            ParamType::Bytes,
            ParamType::Bytes,
            ParamType::Bytes,
        ]
    }

    pub fn to_tokens(&self) -> Vec<Token> {
        vec![
            Token::Address(self.account),
            Token::Address(self.dest),
            Token::Address(self.payer),
            Token::Uint(self.value),
            Token::Uint(self.nonce_track),
            Token::Uint(self.nonce_value.into()),
            Token::Uint(self.max_fee_per_gas),
            Token::Int(I256::from(self.submitter_fee).into_raw()),
            Token::Uint(self.gas_limit.into()),
            Token::Uint(self.validate_gas_limit.into()),
            Token::Uint(self.validate_payment_gas_limit.into()),
            Token::Uint(self.execute_gas_limit.into()),
            Token::Bytes(self.call_data.to_vec()),
            Token::Bytes(self.validator_data.to_vec()),
            Token::Bytes(self.extra_data.to_vec()),
        ]
    }

    /// Inverse of [`Boop::to_tokens`]. Returns `None` if the tokens do not have
    /// the expected shape or a value does not fit its field.
    pub fn from_tokens(tokens: Vec<Token>) -> Option<Self> {
        let mut it = tokens.into_iter();
        let mut next = || it.next();
        let account = next()?.into_address()?;
        let dest = next()?.into_address()?;
        let payer = next()?.into_address()?;
        let value = next()?.into_uint()?;
        let nonce_track = next()?.into_uint()?;
        let nonce_value = u64::try_from(next()?.into_uint()?).ok()?;
        let max_fee_per_gas = next()?.into_uint()?;
        let submitter_fee = i128::try_from(I256::from_raw(next()?.into_int()?)).ok()?;
        let gas_limit = u32::try_from(next()?.into_uint()?).ok()?;
        let validate_gas_limit = u32::try_from(next()?.into_uint()?).ok()?;
        let validate_payment_gas_limit = u32::try_from(next()?.into_uint()?).ok()?;
        let execute_gas_limit = u32::try_from(next()?.into_uint()?).ok()?;
        let call_data = next()?.into_bytes()?.into();
        let validator_data = next()?.into_bytes()?.into();
        let extra_data = next()?.into_bytes()?.into();
        Some(Self {
            account,
            dest,
            payer,
            value,
            nonce_track,
            nonce_value,
            max_fee_per_gas,
            submitter_fee,
            gas_limit,
            validate_gas_limit,
            validate_payment_gas_limit,
            execute_gas_limit,
            call_data,
            validator_data,
            extra_data,
        })
    }
}

#[cfg(test)]
pub(crate) mod test_utils {
    use super::*;

    pub fn sponsored_boop(account: Address, nonce_track: u64, nonce_value: u64) -> Boop {
        Boop {
            account,
            dest: Address::repeat_byte(0xde),
            payer: Address::repeat_byte(0xfe),
            nonce_track: nonce_track.into(),
            nonce_value,
            call_data: vec![0xca, 0xfe].into(),
            ..Default::default()
        }
    }
}
