use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ethers::types::{
    transaction::eip2718::TypedTransaction, Address, Bytes, Eip1559TransactionRequest,
    TransactionReceipt, H256, U256,
};
use ethers::utils::keccak256;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, instrument, warn};

use crate::boop::Boop;
use crate::chain::{ChainCommunicationError, EntryPoint};
use crate::error::SubmitterError;
use crate::executor::{ExecutorKey, ExecutorKeyPool};
use crate::metrics::SubmitterMetrics;
use crate::queue::Processor;
use crate::receipt::{BoopReceipt, ReceiptReconciler};
use crate::settings::{GasSettings, TuningSettings};

use super::fees::{apply_gas_margin, FeeParams, FeePolicy};
use super::simulate::{SimulationOutput, Simulator};

const CANCEL_GAS: u64 = 21_000;
/// Receipt polls after a cancellation before giving up on the boop
const CANCEL_GRACE_POLLS: u32 = 5;

/// Submits boops to the entry point: simulate, fill in gas and fees, send, keep the
/// transaction moving until it is mined, then reconcile the receipt.
pub struct BoopProcessor {
    entry_point: EntryPoint,
    simulator: Simulator,
    executors: ExecutorKeyPool,
    reconciler: Arc<ReceiptReconciler>,
    fees: FeePolicy,
    gas_safety_margin: u32,
    entry_point_gas_buffer: u32,
    max_submit_pending_time: Duration,
    stuck_tx_wait_time: Duration,
    receipt_poll_interval: Duration,
    metrics: SubmitterMetrics,
}

impl std::fmt::Debug for BoopProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoopProcessor")
            .field("entry_point", &self.entry_point)
            .field("executors", &self.executors)
            .finish()
    }
}

/// The EVM transaction carrying a boop, minus nonce and fees.
struct Submission {
    to: Address,
    data: Bytes,
    gas: u64,
}

/// Transactions sent so far for one boop. All share the same EVM nonce.
struct InFlight {
    key: Arc<ExecutorKey>,
    nonce: U256,
    fees: FeeParams,
    hashes: Vec<H256>,
}

impl BoopProcessor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        entry_point: EntryPoint,
        simulator: Simulator,
        executors: ExecutorKeyPool,
        reconciler: Arc<ReceiptReconciler>,
        gas: &GasSettings,
        tuning: &TuningSettings,
        metrics: SubmitterMetrics,
    ) -> Self {
        Self {
            entry_point,
            simulator,
            executors,
            reconciler,
            fees: FeePolicy::new(gas),
            gas_safety_margin: gas.gas_safety_margin,
            entry_point_gas_buffer: gas.entry_point_gas_buffer,
            max_submit_pending_time: tuning.max_submit_pending_time(),
            stuck_tx_wait_time: tuning.stuck_tx_wait_time(),
            receipt_poll_interval: tuning.receipt_poll_interval(),
            metrics,
        }
    }

    pub fn simulator(&self) -> &Simulator {
        &self.simulator
    }

    /// Simulates until the boop's nonce is current onchain, backing off linearly.
    async fn simulate_until_current(&self, boop: &Boop) -> Result<SimulationOutput, SubmitterError> {
        let start = Instant::now();
        let mut attempts: u32 = 0;
        loop {
            let output = self.simulator.simulate(boop).await?.into_result()?;
            if !output.future_nonce {
                return Ok(output);
            }
            attempts = attempts.saturating_add(1);
            let delay = self.receipt_poll_interval.saturating_mul(attempts);
            if start.elapsed().saturating_add(delay) > self.max_submit_pending_time {
                warn!(attempts, "Boop nonce never became current");
                return Err(SubmitterError::SubmitTimeout(self.max_submit_pending_time));
            }
            debug!(attempts, ?delay, "Boop nonce is ahead of the chain, simulating again");
            sleep(delay).await;
        }
    }

    /// Fills the gas limits and max fee of a sponsored boop from its simulation, and
    /// checks the max fee against the current base fee.
    pub(super) fn prepare(
        &self,
        mut boop: Boop,
        simulation: &SimulationOutput,
        base_fee: U256,
    ) -> Result<Boop, SubmitterError> {
        if boop.is_self_paying() {
            self.fees.check_user_max_fee(boop.max_fee_per_gas, base_fee)?;
            return Ok(boop);
        }

        let margin = self.gas_safety_margin;
        let fill = |current: u32, simulated: u32| {
            if current == 0 {
                apply_gas_margin(simulated, margin)
            } else {
                current
            }
        };
        boop.gas_limit = fill(boop.gas_limit, simulation.gas);
        boop.validate_gas_limit = fill(boop.validate_gas_limit, simulation.validate_gas);
        boop.validate_payment_gas_limit =
            fill(boop.validate_payment_gas_limit, simulation.validate_payment_gas);
        boop.execute_gas_limit = fill(boop.execute_gas_limit, simulation.execute_gas);

        if boop.max_fee_per_gas.is_zero() {
            boop.max_fee_per_gas = self.fees.initial_fees(base_fee)?.max_fee_per_gas;
        } else {
            self.fees.check_user_max_fee(boop.max_fee_per_gas, base_fee)?;
        }
        Ok(boop)
    }

    fn build_tx(
        key: &ExecutorKey,
        nonce: U256,
        to: Address,
        data: Bytes,
        gas: u64,
        fees: FeeParams,
    ) -> TypedTransaction {
        Eip1559TransactionRequest::new()
            .from(key.address())
            .to(to)
            .data(data)
            .gas(gas)
            .nonce(nonce)
            .max_fee_per_gas(fees.max_fee_per_gas)
            .max_priority_fee_per_gas(fees.max_priority_fee_per_gas)
            .chain_id(key.chain_id())
            .into()
    }

    /// Signs and broadcasts. A node that already knows the transaction counts as success.
    async fn send(&self, key: &ExecutorKey, tx: &TypedTransaction) -> Result<H256, SendError> {
        let raw = key.sign(tx).map_err(SendError::Signing)?;
        let hash = H256(keccak256(&raw));
        match self.entry_point.provider().send_raw_transaction(raw).await {
            Ok(hash) => Ok(hash),
            Err(err) if err.is_already_known() => {
                debug!(?hash, "Transaction already known to the node");
                Ok(hash)
            }
            Err(err) => Err(SendError::Chain(err)),
        }
    }

    /// First broadcast of a boop. Retries once with a freshly synced nonce if the local
    /// nonce of the executor turns out to be stale.
    async fn send_initial(
        &self,
        key: Arc<ExecutorKey>,
        submission: &Submission,
        fees: FeeParams,
    ) -> Result<InFlight, SubmitterError> {
        let provider = self.entry_point.provider().as_ref();
        let mut resynced = false;
        loop {
            let nonce = key.reserve_nonce(provider).await?;
            let tx = Self::build_tx(
                &key,
                nonce,
                submission.to,
                submission.data.clone(),
                submission.gas,
                fees,
            );
            match self.send(&key, &tx).await {
                Ok(hash) => {
                    info!(?hash, executor = ?key.address(), ?nonce, "Sent boop transaction");
                    return Ok(InFlight {
                        key,
                        nonce,
                        fees,
                        hashes: vec![hash],
                    });
                }
                Err(SendError::Chain(err)) if err.is_nonce_too_low() && !resynced => {
                    warn!(executor = ?key.address(), ?nonce, "Executor nonce too low, resyncing");
                    key.reset_nonce().await;
                    resynced = true;
                }
                Err(err) => {
                    key.reset_nonce().await;
                    return Err(err.into());
                }
            }
        }
    }

    /// Receipt of whichever sent transaction got mined, if any.
    async fn find_mined(&self, hashes: &[H256]) -> Option<TransactionReceipt> {
        let provider = self.entry_point.provider();
        for hash in hashes.iter().rev() {
            match provider.transaction_receipt(*hash).await {
                Ok(Some(receipt)) => return Some(receipt),
                Ok(None) => {}
                Err(err) => warn!(?hash, error = %err, "Failed to fetch transaction receipt"),
            }
        }
        None
    }

    async fn fresh_fees(&self) -> Option<FeeParams> {
        match self.entry_point.provider().latest_base_fee().await {
            Ok(base_fee) => self.fees.initial_fees(base_fee).ok(),
            Err(err) => {
                warn!(error = %err, "Failed to fetch base fee for fee bump");
                None
            }
        }
    }

    /// Replaces the pending transaction with a copy carrying higher fees.
    async fn bump(&self, in_flight: &mut InFlight, submission: &Submission) {
        let fresh = self.fresh_fees().await;
        let Some(fees) = self.fees.bump(in_flight.fees, fresh) else {
            debug!(fees = ?in_flight.fees, "Fees already at their maximum, waiting");
            return;
        };
        let tx = Self::build_tx(
            &in_flight.key,
            in_flight.nonce,
            submission.to,
            submission.data.clone(),
            submission.gas,
            fees,
        );
        match self.send(&in_flight.key, &tx).await {
            Ok(hash) => {
                info!(?hash, nonce = ?in_flight.nonce, ?fees, "Sent fee bumped replacement");
                self.metrics.update_fee_bumps_metric();
                in_flight.fees = fees;
                in_flight.hashes.push(hash);
            }
            // one of the earlier transactions got mined
            Err(SendError::Chain(err)) if err.is_nonce_too_low() => {
                debug!("Replacement nonce already used, waiting for receipt");
            }
            Err(err) => warn!(error = %err, "Failed to send replacement transaction"),
        }
    }

    /// Best effort: frees the executor nonce with a zero value self transfer. Returns
    /// true when the nonce turned out to be used already, i.e. something got mined.
    async fn cancel(&self, in_flight: &InFlight) -> bool {
        let fees = self.fees.bump(in_flight.fees, None).unwrap_or(in_flight.fees);
        let tx = Self::build_tx(
            &in_flight.key,
            in_flight.nonce,
            in_flight.key.address(),
            Bytes::new(),
            CANCEL_GAS,
            fees,
        );
        match self.send(&in_flight.key, &tx).await {
            Ok(hash) => {
                info!(?hash, nonce = ?in_flight.nonce, "Sent cancellation transaction");
                false
            }
            Err(SendError::Chain(err)) if err.is_nonce_too_low() => {
                debug!(nonce = ?in_flight.nonce, "Nonce used before cancellation");
                true
            }
            Err(err) => {
                warn!(error = %err, nonce = ?in_flight.nonce, "Failed to cancel stuck transaction");
                false
            }
        }
    }

    /// Gives a boop transaction that raced the cancellation a few polls to show up.
    async fn find_mined_after_cancel(&self, in_flight: &InFlight) -> Option<TransactionReceipt> {
        let nonce_used = self.cancel(in_flight).await;
        let polls = if nonce_used {
            CANCEL_GRACE_POLLS.saturating_mul(2)
        } else {
            CANCEL_GRACE_POLLS
        };
        for _ in 0..polls {
            sleep(self.receipt_poll_interval).await;
            if let Some(receipt) = self.find_mined(&in_flight.hashes).await {
                info!(hash = ?receipt.transaction_hash, "Boop transaction mined despite cancellation");
                return Some(receipt);
            }
        }
        if nonce_used {
            warn!(hashes = ?in_flight.hashes, "Nonce used but no boop transaction found");
        }
        None
    }

    /// Sends the boop and waits for one of its transactions to be mined.
    async fn submit_and_wait(
        &self,
        boop: &Boop,
        fees: FeeParams,
    ) -> Result<TransactionReceipt, SubmitterError> {
        let submission = Submission {
            to: self.entry_point.address(),
            data: self.entry_point.submit_calldata(boop),
            gas: u64::from(boop.gas_limit).saturating_add(u64::from(self.entry_point_gas_buffer)),
        };
        let key = self.executors.pick_key(boop.account);
        let mut in_flight = self.send_initial(key, &submission, fees).await?;

        let start = Instant::now();
        let mut last_sent = start;
        loop {
            if let Some(receipt) = self.find_mined(&in_flight.hashes).await {
                return Ok(receipt);
            }
            if start.elapsed() >= self.max_submit_pending_time {
                warn!(hashes = ?in_flight.hashes, "Boop not included in time, cancelling");
                if let Some(receipt) = self.find_mined_after_cancel(&in_flight).await {
                    return Ok(receipt);
                }
                return Err(SubmitterError::SubmitTimeout(self.max_submit_pending_time));
            }
            if last_sent.elapsed() >= self.stuck_tx_wait_time {
                self.bump(&mut in_flight, &submission).await;
                last_sent = Instant::now();
            }
            sleep(self.receipt_poll_interval).await;
        }
    }
}

#[async_trait]
impl Processor for BoopProcessor {
    type Output = BoopReceipt;

    #[instrument(skip_all, fields(boop_hash = ?boop.hash(), account = ?boop.account, nonce = boop.nonce_value))]
    async fn process(&self, boop: Boop) -> Result<BoopReceipt, SubmitterError> {
        if boop.is_self_paying()
            && (boop.max_fee_per_gas.is_zero() || boop.gas_limit == 0 || boop.validate_gas_limit == 0)
        {
            return Err(SubmitterError::MissingGasValues);
        }

        let simulation = self.simulate_until_current(&boop).await?;
        let base_fee = self.entry_point.provider().latest_base_fee().await?;
        let boop = self.prepare(boop, &simulation, base_fee)?;
        let fees = self.fees.initial_fees(base_fee)?;

        let evm_receipt = self.submit_and_wait(&boop, fees).await?;

        let simulated_gas = self
            .simulator
            .cached_simulation(&boop.hash())
            .await
            .filter(|output| output.status.is_success())
            .map(|output| output.gas);
        self.reconciler
            .reconcile(&boop, &evm_receipt, simulated_gas)
            .await
    }

    fn outcome_label(receipt: &BoopReceipt) -> &'static str {
        receipt.status.as_str()
    }
}

/// Why broadcasting a transaction failed.
#[derive(Debug, thiserror::Error)]
enum SendError {
    #[error(transparent)]
    Signing(SubmitterError),
    #[error(transparent)]
    Chain(ChainCommunicationError),
}

impl From<SendError> for SubmitterError {
    fn from(err: SendError) -> Self {
        match err {
            SendError::Signing(err) => err,
            SendError::Chain(err) => err.into(),
        }
    }
}
