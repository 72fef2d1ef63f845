use ethers::types::{Address, Bytes, Log, H256, U256};
use serde::{Deserialize, Serialize};

use crate::boop::{Boop, BoopHash};
use crate::status::BoopStatus;

/// A log emitted while the entry point executed a specific boop.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BoopLog {
    pub address: Address,
    pub topics: Vec<H256>,
    pub data: Bytes,
}

impl From<&Log> for BoopLog {
    fn from(log: &Log) -> Self {
        Self {
            address: log.address,
            topics: log.topics.clone(),
            data: log.data.clone(),
        }
    }
}

/// Final outcome of an included boop. Written once per boop hash and never updated.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BoopReceipt {
    pub boop_hash: BoopHash,
    pub entry_point: Address,
    pub status: BoopStatus,
    pub description: String,
    /// Logs emitted between the boop's start and submission markers
    pub logs: Vec<BoopLog>,
    pub revert_data: Bytes,
    pub evm_tx_hash: H256,
    pub block_hash: Option<H256>,
    pub block_number: Option<u64>,
    pub gas_used: U256,
    pub effective_gas_price: U256,
    pub gas_cost: U256,
    pub boop: Boop,
}

impl BoopReceipt {
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}
