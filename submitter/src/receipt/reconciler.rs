use std::sync::Arc;
use std::time::Duration;

use ethers::types::{Address, Bytes, Log, TransactionReceipt, U256, U64};
use tokio::time::{sleep, Instant};
use tracing::{debug, instrument, warn};

use crate::boop::{Boop, BoopHash};
use crate::chain::entry_point::{
    decode_boop_submitted, decode_bytes_arg, event_topic, BOOP_EXECUTION_STARTED_EVENT,
    CALL_REVERTED_EVENT, EXECUTION_REJECTED_EVENT, EXECUTION_REVERTED_EVENT,
};
use crate::error::SubmitterError;
use crate::status::BoopStatus;

use super::{BoopLog, BoopReceipt, ReceiptDb};

/// Turns mined EVM receipts into boop receipts and serves them back by boop hash.
pub struct ReceiptReconciler {
    entry_point: Address,
    db: Arc<dyn ReceiptDb>,
}

impl std::fmt::Debug for ReceiptReconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReceiptReconciler")
            .field("entry_point", &self.entry_point)
            .finish()
    }
}

impl ReceiptReconciler {
    pub fn new(entry_point: Address, db: Arc<dyn ReceiptDb>) -> Self {
        Self { entry_point, db }
    }

    /// Looks up the receipt of a boop.
    ///
    /// A zero `timeout` checks once. Otherwise the store is polled every `poll_interval`
    /// until the receipt shows up or `timeout` elapses, in which case `None` is returned.
    #[instrument(skip(self), level = "debug")]
    pub async fn find_receipt(
        &self,
        boop_hash: BoopHash,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<Option<BoopReceipt>, SubmitterError> {
        let deadline = Instant::now().checked_add(timeout);
        loop {
            if let Some(receipt) = self.db.retrieve_receipt(&boop_hash).await? {
                return Ok(Some(receipt));
            }
            let Some(remaining) = deadline.and_then(|d| d.checked_duration_since(Instant::now()))
            else {
                return Ok(None);
            };
            if remaining.is_zero() {
                return Ok(None);
            }
            sleep(poll_interval.min(remaining)).await;
        }
    }

    /// Logs emitted while executing the boop with `boop_hash`.
    ///
    /// Collection starts after the entry point's `BoopExecutionStarted` marker and ends at
    /// the matching `BoopSubmitted` marker. Markers themselves are left out. A
    /// `BoopSubmitted` for another boop in the same transaction discards what was
    /// collected so far.
    pub fn filter_logs(
        &self,
        logs: &[Log],
        boop_hash: BoopHash,
    ) -> Result<Vec<BoopLog>, SubmitterError> {
        let started = event_topic(BOOP_EXECUTION_STARTED_EVENT);
        let mut select = false;
        let mut filtered = Vec::new();
        for log in logs {
            let from_entry_point = log.address == self.entry_point;
            let submitted = if from_entry_point {
                decode_boop_submitted(log)
            } else {
                None
            };
            if let Some(decoded) = submitted {
                let boop = decoded.map_err(|e| {
                    SubmitterError::UndecodableEvent(format!("BoopSubmitted: {e}"))
                })?;
                if boop.hash() == boop_hash {
                    return Ok(filtered);
                }
                select = false;
                filtered.clear();
            } else if select {
                filtered.push(BoopLog::from(log));
            } else if from_entry_point && log.topics.first() == Some(&started) {
                select = true;
            }
        }
        Ok(vec![])
    }

    /// Builds the boop receipt for a mined transaction.
    ///
    /// `simulated_gas` is the gas of a successful cached simulation, used to tell an
    /// out-of-gas entry point call from other reverts.
    pub fn build_receipt(
        &self,
        boop: &Boop,
        evm_receipt: &TransactionReceipt,
        simulated_gas: Option<u32>,
    ) -> Result<BoopReceipt, SubmitterError> {
        let boop_hash = boop.hash();
        let entry_point = evm_receipt.to.ok_or_else(|| {
            SubmitterError::MalformedReceipt(format!(
                "receipt of {:?} has no recipient",
                evm_receipt.transaction_hash
            ))
        })?;
        let gas_used = evm_receipt.gas_used.unwrap_or_default();
        let effective_gas_price = evm_receipt.effective_gas_price.unwrap_or_default();

        let (status, logs, revert_data) = if evm_receipt.status == Some(U64::one()) {
            let logs = self.filter_logs(&evm_receipt.logs, boop_hash)?;
            let (status, revert_data) = execution_outcome(entry_point, &logs);
            (status, logs, revert_data)
        } else {
            let out_of_gas = simulated_gas.is_some_and(|gas| gas_used == U256::from(gas));
            let status = if out_of_gas {
                BoopStatus::EntryPointOutOfGas
            } else {
                BoopStatus::UnexpectedReverted
            };
            warn!(?boop_hash, evm_tx_hash = ?evm_receipt.transaction_hash, ?status, "Boop transaction reverted");
            (status, vec![], Bytes::new())
        };

        Ok(BoopReceipt {
            boop_hash,
            entry_point,
            status,
            description: status.description().to_owned(),
            logs,
            revert_data,
            evm_tx_hash: evm_receipt.transaction_hash,
            block_hash: evm_receipt.block_hash,
            block_number: evm_receipt.block_number.map(|n| n.as_u64()),
            gas_used,
            effective_gas_price,
            gas_cost: gas_used.saturating_mul(effective_gas_price),
            boop: boop.clone(),
        })
    }

    /// Builds and stores the receipt. If one was already stored for the boop, that one
    /// is returned unchanged.
    #[instrument(skip_all, fields(boop_hash = ?boop.hash(), evm_tx_hash = ?evm_receipt.transaction_hash))]
    pub async fn reconcile(
        &self,
        boop: &Boop,
        evm_receipt: &TransactionReceipt,
        simulated_gas: Option<u32>,
    ) -> Result<BoopReceipt, SubmitterError> {
        let receipt = self.build_receipt(boop, evm_receipt, simulated_gas)?;
        let stored = self.db.store_receipt_if_absent(&receipt).await?;
        debug!(status = ?stored.status, "Stored boop receipt");
        Ok(stored)
    }
}

/// Status and revert data set by the last execution error event the entry point emitted.
fn execution_outcome(entry_point: Address, logs: &[BoopLog]) -> (BoopStatus, Bytes) {
    let events = [
        (event_topic(CALL_REVERTED_EVENT), BoopStatus::CallReverted),
        (event_topic(EXECUTION_REJECTED_EVENT), BoopStatus::ExecuteRejected),
        (event_topic(EXECUTION_REVERTED_EVENT), BoopStatus::ExecuteReverted),
    ];
    let mut outcome = (BoopStatus::Success, Bytes::new());
    for log in logs.iter().filter(|log| log.address == entry_point) {
        let Some(topic) = log.topics.first() else {
            continue;
        };
        if let Some((_, status)) = events.iter().find(|(t, _)| t == topic) {
            outcome = (*status, decode_bytes_arg(&log.data).unwrap_or_default());
        }
    }
    outcome
}
