use std::sync::Arc;
use std::time::Duration;

use ethers::types::Address;
use eyre::{Context, Result};
use prometheus::Registry;
use tracing::info;

use crate::boop::{Boop, BoopHash};
use crate::chain::{EntryPoint, EvmProvider, FallbackProvider, HttpEvmProvider};
use crate::error::SubmitterError;
use crate::executor::ExecutorKeyPool;
use crate::metrics::SubmitterMetrics;
use crate::processor::{BoopProcessor, Simulator};
use crate::queue::{PendingBoop, QueueManager};
use crate::receipt::{BoopReceipt, InMemoryReceiptDb, ReceiptDb, ReceiptReconciler, RocksReceiptDb};
use crate::settings::SubmitterSettings;

/// The submitter wired together: queue, processor and receipt store.
#[derive(Clone)]
pub struct SubmitterService {
    queue: QueueManager<BoopProcessor>,
    reconciler: Arc<ReceiptReconciler>,
    metrics: SubmitterMetrics,
    receipt_timeout: Duration,
    receipt_poll_interval: Duration,
}

impl std::fmt::Debug for SubmitterService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubmitterService")
            .field("queue", &self.queue)
            .field("reconciler", &self.reconciler)
            .finish()
    }
}

impl SubmitterService {
    /// Builds the service against the configured RPC endpoints and receipt store.
    pub fn from_settings(settings: &SubmitterSettings, registry: Registry) -> Result<Self> {
        settings.validate()?;
        let metrics = SubmitterMetrics::new(registry).context("Failed to register metrics")?;

        let providers = settings
            .rpc_urls
            .iter()
            .map(|url| {
                HttpEvmProvider::new(url, settings.tuning.rpc_request_timeout())
                    .map(|provider| Arc::new(provider) as Arc<dyn EvmProvider>)
            })
            .collect::<Result<Vec<_>>>()?;
        let provider = FallbackProvider::new(
            providers,
            settings.tuning.max_rpc_retries,
            metrics.clone(),
        );

        let db: Arc<dyn ReceiptDb> = match &settings.db_path {
            Some(path) => Arc::new(
                RocksReceiptDb::from_path(path)
                    .with_context(|| format!("Failed to open receipt db at {path:?}"))?,
            ),
            None => {
                info!("No db path configured, keeping receipts in memory");
                Arc::new(InMemoryReceiptDb::new())
            }
        };

        Self::new(settings, Arc::new(provider), db, metrics)
    }

    /// Builds the service on top of an existing provider and receipt store.
    pub fn new(
        settings: &SubmitterSettings,
        provider: Arc<dyn EvmProvider>,
        db: Arc<dyn ReceiptDb>,
        metrics: SubmitterMetrics,
    ) -> Result<Self> {
        let entry_point = EntryPoint::new(settings.entry_point, provider);
        let executors =
            ExecutorKeyPool::from_private_keys(&settings.executor_keys, settings.chain_id)?;
        info!(executors = ?executors.addresses(), entry_point = ?settings.entry_point, "Starting submitter");

        let simulator = Simulator::new(
            entry_point.clone(),
            settings.tuning.simulation_cache_size,
            settings.tuning.simulation_cache_ttl(),
        );
        let reconciler = Arc::new(ReceiptReconciler::new(settings.entry_point, db));
        let processor = BoopProcessor::new(
            entry_point.clone(),
            simulator,
            executors,
            reconciler.clone(),
            &settings.gas,
            &settings.tuning,
            metrics.clone(),
        );
        let queue = QueueManager::new(
            processor,
            Arc::new(entry_point),
            settings.limits.buffer_limit,
            settings.limits.max_capacity,
            metrics.clone(),
        );
        Ok(Self {
            queue,
            reconciler,
            metrics,
            receipt_timeout: settings.tuning.receipt_timeout(),
            receipt_poll_interval: settings.tuning.receipt_poll_interval(),
        })
    }

    /// Admits the boop. The returned future resolves with its receipt.
    pub async fn submit(&self, boop: Boop) -> Result<PendingBoop<BoopReceipt>, SubmitterError> {
        self.queue.enqueue(boop).await
    }

    /// Admits the boop and waits for its receipt.
    pub async fn execute(&self, boop: Boop) -> Result<BoopReceipt, SubmitterError> {
        self.queue.enqueue_and_wait(boop).await
    }

    pub fn list_pending(&self, account: Address) -> Vec<Boop> {
        self.queue.list_pending(account)
    }

    /// Waits up to `timeout` for the receipt of a boop, or the configured receipt
    /// timeout if none is given.
    pub async fn find_receipt(
        &self,
        boop_hash: BoopHash,
        timeout: Option<Duration>,
    ) -> Result<Option<BoopReceipt>, SubmitterError> {
        self.reconciler
            .find_receipt(
                boop_hash,
                timeout.unwrap_or(self.receipt_timeout),
                self.receipt_poll_interval,
            )
            .await
    }

    pub fn metrics(&self) -> &SubmitterMetrics {
        &self.metrics
    }
}
