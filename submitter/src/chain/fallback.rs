use std::fmt::{Debug, Formatter};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use derive_new::new;
use ethers::types::{
    transaction::eip2718::TypedTransaction, Address, Bytes, TransactionReceipt, H256, U256,
};
use tokio::sync::RwLock;
use tokio::time::sleep;
use tracing::{info, warn_span, Instrument};

use crate::metrics::SubmitterMetrics;

use super::{
    categorize_error, ChainCommunicationError, ChainResult, ErrorCategory, EvmProvider, ETH_CALL,
    ETH_GET_BLOCK_BY_NUMBER, ETH_GET_TRANSACTION_COUNT, ETH_GET_TRANSACTION_RECEIPT,
    ETH_SEND_RAW_TRANSACTION,
};

const FAILED_REQUEST_THRESHOLD: u32 = 3;

const RETRY_DELAY: Duration = Duration::from_millis(100);

/// Information about a provider in the priority list
#[derive(Clone, Copy, Debug, new)]
struct PrioritizedProvider {
    /// Index into `FallbackProvider::providers`
    index: usize,
    /// Failed requests since the last deprioritization
    #[new(default)]
    failed_count: u32,
}

/// Calls the first provider, then the second, and so on until one of them
/// answers or reports an error that another provider would report too.
pub struct FallbackProvider {
    providers: Vec<Arc<dyn EvmProvider>>,
    /// Sorted in descending order of reliability
    priorities: RwLock<Vec<PrioritizedProvider>>,
    max_retries: usize,
    metrics: SubmitterMetrics,
}

impl Debug for FallbackProvider {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FallbackProvider")
            .field("providers", &self.providers.len())
            .field("max_retries", &self.max_retries)
            .finish()
    }
}

impl FallbackProvider {
    pub fn new(
        providers: Vec<Arc<dyn EvmProvider>>,
        max_retries: usize,
        metrics: SubmitterMetrics,
    ) -> Self {
        let priorities = (0..providers.len()).map(PrioritizedProvider::new).collect();
        Self {
            providers,
            priorities: RwLock::new(priorities),
            max_retries,
            metrics,
        }
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    async fn take_priorities_snapshot(&self) -> Vec<PrioritizedProvider> {
        self.priorities.read().await.clone()
    }

    /// Counts a failure against the provider and moves it to the back of the
    /// queue once it crosses the threshold.
    async fn handle_failed_provider(&self, priority: &PrioritizedProvider) {
        let mut priorities = self.priorities.write().await;
        let Some(position) = priorities.iter().position(|p| p.index == priority.index) else {
            return;
        };
        let failed_count = priorities[position].failed_count.saturating_add(1);
        if failed_count >= FAILED_REQUEST_THRESHOLD {
            priorities.remove(position);
            priorities.push(PrioritizedProvider::new(priority.index));
            info!(
                provider_index = priority.index,
                "Deprioritizing an inner provider in FallbackProvider"
            );
        } else {
            priorities[position].failed_count = failed_count;
        }
    }

    async fn request<T, F, Fut>(&self, method: &'static str, f: F) -> ChainResult<T>
    where
        F: Fn(Arc<dyn EvmProvider>) -> Fut,
        Fut: Future<Output = ChainResult<T>>,
    {
        let mut errors = vec![];
        let mut round = 0usize;
        while round <= self.max_retries {
            if round > 0 {
                sleep(RETRY_DELAY).await;
            }
            round = round.saturating_add(1);

            let priorities_snapshot = self.take_priorities_snapshot().await;
            for (idx, priority) in priorities_snapshot.iter().enumerate() {
                let Some(provider) = self.providers.get(priority.index) else {
                    continue;
                };
                let span = warn_span!("request", fallback_count = idx, provider_index = priority.index, method);
                let resp = f(provider.clone()).instrument(span).await;
                let err = match resp {
                    Ok(v) => return Ok(v),
                    Err(err) => err,
                };
                let category = categorize_error(method, &err);
                self.metrics.update_rpc_errors_metric(method, category.as_str());
                match category {
                    ErrorCategory::NonRetryable => return Err(err),
                    ErrorCategory::RateLimited | ErrorCategory::Retryable => {
                        self.handle_failed_provider(priority).await;
                        errors.push(err);
                    }
                }
            }
        }
        Err(ChainCommunicationError::AllProvidersFailed(errors))
    }
}

#[async_trait]
impl EvmProvider for FallbackProvider {
    async fn call(&self, tx: &TypedTransaction) -> ChainResult<Bytes> {
        self.request(ETH_CALL, move |p| async move { p.call(tx).await })
            .await
    }

    async fn send_raw_transaction(&self, raw: Bytes) -> ChainResult<H256> {
        self.request(ETH_SEND_RAW_TRANSACTION, |p| {
            let raw = raw.clone();
            async move { p.send_raw_transaction(raw).await }
        })
        .await
    }

    async fn transaction_receipt(&self, hash: H256) -> ChainResult<Option<TransactionReceipt>> {
        self.request(ETH_GET_TRANSACTION_RECEIPT, move |p| async move {
            p.transaction_receipt(hash).await
        })
        .await
    }

    async fn pending_transaction_count(&self, address: Address) -> ChainResult<U256> {
        self.request(ETH_GET_TRANSACTION_COUNT, move |p| async move {
            p.pending_transaction_count(address).await
        })
        .await
    }

    async fn latest_base_fee(&self) -> ChainResult<U256> {
        self.request(ETH_GET_BLOCK_BY_NUMBER, |p| async move {
            p.latest_base_fee().await
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::chain::test_utils::{rpc_error, MockEvmProvider};

    fn provider_failing_with(
        err: ChainCommunicationError,
        calls: Arc<AtomicUsize>,
    ) -> Arc<dyn EvmProvider> {
        let mut mock = MockEvmProvider::new();
        mock.expect_latest_base_fee().returning(move || {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(err.clone())
        });
        mock.expect_send_raw_transaction()
            .returning(|_| Err(rpc_error(-32000, "nonce too low")));
        Arc::new(mock)
    }

    fn healthy_provider(calls: Arc<AtomicUsize>) -> Arc<dyn EvmProvider> {
        let mut mock = MockEvmProvider::new();
        mock.expect_latest_base_fee().returning(move || {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(U256::from(7))
        });
        Arc::new(mock)
    }

    #[tokio::test]
    async fn test_falls_back_to_next_provider_on_unhealthy_node() {
        let failing_calls = Arc::new(AtomicUsize::new(0));
        let healthy_calls = Arc::new(AtomicUsize::new(0));
        let provider = FallbackProvider::new(
            vec![
                provider_failing_with(
                    ChainCommunicationError::Transport("connection refused".into()),
                    failing_calls.clone(),
                ),
                healthy_provider(healthy_calls.clone()),
            ],
            3,
            SubmitterMetrics::dummy_instance(),
        );

        assert_eq!(provider.latest_base_fee().await.unwrap(), U256::from(7));
        assert_eq!(failing_calls.load(Ordering::SeqCst), 1);
        assert_eq!(healthy_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_chain_truth_is_surfaced_without_fallback() {
        let second_calls = Arc::new(AtomicUsize::new(0));
        let mut second = MockEvmProvider::new();
        let counter = second_calls.clone();
        second.expect_send_raw_transaction().returning(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(H256::zero())
        });
        let provider = FallbackProvider::new(
            vec![
                provider_failing_with(
                    ChainCommunicationError::Transport("unused".into()),
                    Arc::new(AtomicUsize::new(0)),
                ),
                Arc::new(second),
            ],
            3,
            SubmitterMetrics::dummy_instance(),
        );

        let err = provider
            .send_raw_transaction(vec![0x01].into())
            .await
            .unwrap_err();
        assert!(err.is_nonce_too_low());
        assert_eq!(second_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_all_providers_failed_after_retries() {
        let calls = Arc::new(AtomicUsize::new(0));
        let provider = FallbackProvider::new(
            vec![provider_failing_with(
                ChainCommunicationError::Transport("connection refused".into()),
                calls.clone(),
            )],
            2,
            SubmitterMetrics::dummy_instance(),
        );

        let err = provider.latest_base_fee().await.unwrap_err();
        match err {
            ChainCommunicationError::AllProvidersFailed(errors) => assert_eq!(errors.len(), 3),
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_repeatedly_failing_provider_is_deprioritized() {
        let failing_calls = Arc::new(AtomicUsize::new(0));
        let healthy_calls = Arc::new(AtomicUsize::new(0));
        let provider = FallbackProvider::new(
            vec![
                provider_failing_with(
                    ChainCommunicationError::Timeout(Duration::from_secs(1)),
                    failing_calls.clone(),
                ),
                healthy_provider(healthy_calls.clone()),
            ],
            0,
            SubmitterMetrics::dummy_instance(),
        );

        for _ in 0..FAILED_REQUEST_THRESHOLD {
            provider.latest_base_fee().await.unwrap();
        }
        let priorities = provider.take_priorities_snapshot().await;
        assert_eq!(priorities[0].index, 1);

        provider.latest_base_fee().await.unwrap();
        assert_eq!(
            failing_calls.load(Ordering::SeqCst),
            FAILED_REQUEST_THRESHOLD as usize
        );
    }
}
