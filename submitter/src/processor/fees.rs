use ethers::types::U256;

use crate::error::SubmitterError;
use crate::settings::GasSettings;

/// EIP-1559 fees of an EVM transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeeParams {
    pub max_fee_per_gas: U256,
    pub max_priority_fee_per_gas: U256,
}

/// Computes and escalates the fees of entry point transactions.
#[derive(Debug, Clone)]
pub struct FeePolicy {
    base_fee_margin: u32,
    min_base_fee_margin: u32,
    fee_bump_percent: u32,
    max_base_fee: U256,
    initial_priority_fee: U256,
    max_priority_fee: U256,
}

/// `value * (100 + percent) / 100`, rounded down.
fn add_percent(value: U256, percent: u32) -> U256 {
    value
        .saturating_mul(U256::from(100u32.saturating_add(percent)))
        .checked_div(U256::from(100))
        .unwrap_or(U256::MAX)
}

/// Pads a simulated gas figure by `margin` percent, rounding up.
pub fn apply_gas_margin(value: u32, margin: u32) -> u32 {
    let padded = u64::from(value).saturating_mul(u64::from(100u32.saturating_add(margin)));
    let rounded = padded.saturating_add(99).checked_div(100).unwrap_or(u64::MAX);
    u32::try_from(rounded).unwrap_or(u32::MAX)
}

impl FeePolicy {
    pub fn new(gas: &GasSettings) -> Self {
        Self {
            base_fee_margin: gas.base_fee_margin,
            min_base_fee_margin: gas.min_base_fee_margin,
            fee_bump_percent: gas.fee_bump_percent,
            max_base_fee: U256::from(gas.max_base_fee),
            initial_priority_fee: U256::from(gas.initial_priority_fee),
            max_priority_fee: U256::from(gas.max_priority_fee),
        }
    }

    /// Lowest `max_fee_per_gas` accepted at the given base fee.
    pub fn min_fee(&self, base_fee: U256) -> U256 {
        add_percent(base_fee, self.min_base_fee_margin)
    }

    /// Fees of a first submission at the given base fee.
    ///
    /// Uses the regular margin over the base fee. If that is above the configured
    /// maximum, the minimum margin is tried and the fee clipped to the maximum.
    pub fn initial_fees(&self, base_fee: U256) -> Result<FeeParams, SubmitterError> {
        let preferred = add_percent(base_fee, self.base_fee_margin);
        let max_fee_per_gas = if preferred <= self.max_base_fee {
            preferred
        } else if self.min_fee(base_fee) <= self.max_base_fee {
            self.max_base_fee
        } else {
            return Err(SubmitterError::BaseFeeTooHigh {
                base_fee,
                max_base_fee: self.max_base_fee,
            });
        };
        let max_priority_fee_per_gas = self
            .initial_priority_fee
            .min(self.max_priority_fee)
            .min(max_fee_per_gas);
        Ok(FeeParams {
            max_fee_per_gas,
            max_priority_fee_per_gas,
        })
    }

    /// Rejects a user chosen `max_fee_per_gas` that cannot cover the base fee.
    pub fn check_user_max_fee(
        &self,
        max_fee_per_gas: U256,
        base_fee: U256,
    ) -> Result<(), SubmitterError> {
        let required = self.min_fee(base_fee);
        if max_fee_per_gas < required {
            return Err(SubmitterError::GasPriceTooHigh {
                max_fee_per_gas,
                required,
            });
        }
        Ok(())
    }

    fn bump_value(&self, value: U256) -> U256 {
        add_percent(value, self.fee_bump_percent).max(value.saturating_add(U256::one()))
    }

    /// Fees of a replacement transaction, or `None` if they cannot go any higher.
    ///
    /// Both fees go up by `fee_bump_percent`, the max fee never drops below a `fresh`
    /// estimate, and both stay within their configured maximum.
    pub fn bump(&self, current: FeeParams, fresh: Option<FeeParams>) -> Option<FeeParams> {
        let mut max_fee_per_gas = self.bump_value(current.max_fee_per_gas);
        if let Some(fresh) = fresh {
            max_fee_per_gas = max_fee_per_gas.max(fresh.max_fee_per_gas);
        }
        let max_fee_per_gas = max_fee_per_gas.min(self.max_base_fee);
        let max_priority_fee_per_gas = self
            .bump_value(current.max_priority_fee_per_gas)
            .min(self.max_priority_fee)
            .min(max_fee_per_gas);

        let bumped = FeeParams {
            max_fee_per_gas,
            max_priority_fee_per_gas,
        };
        if bumped.max_fee_per_gas <= current.max_fee_per_gas
            && bumped.max_priority_fee_per_gas <= current.max_priority_fee_per_gas
        {
            return None;
        }
        Some(bumped)
    }
}
