use std::fmt::{Debug, Formatter};
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use ethers::providers::{Http, Middleware, Provider, ProviderError};
use ethers::types::{
    transaction::eip2718::TypedTransaction, Address, BlockNumber, Bytes, TransactionReceipt, H256,
    U256,
};
use eyre::{Context, Result};
use tokio::time::timeout;

use super::{ChainCommunicationError, ChainResult, EvmProvider};

/// `EvmProvider` over a single JSON-RPC HTTP endpoint.
pub struct HttpEvmProvider {
    provider: Provider<Http>,
    url: String,
    request_timeout: Duration,
}

impl Debug for HttpEvmProvider {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpEvmProvider")
            .field("url", &self.url)
            .finish()
    }
}

impl HttpEvmProvider {
    pub fn new(url: &str, request_timeout: Duration) -> Result<Self> {
        let provider = Provider::<Http>::try_from(url)
            .with_context(|| format!("Invalid RPC url {url}"))?;
        Ok(Self {
            provider,
            url: url.to_owned(),
            request_timeout,
        })
    }

    async fn bounded<T>(
        &self,
        fut: impl Future<Output = Result<T, ProviderError>>,
    ) -> ChainResult<T> {
        timeout(self.request_timeout, fut)
            .await
            .map_err(|_| ChainCommunicationError::Timeout(self.request_timeout))?
            .map_err(ChainCommunicationError::from)
    }
}

#[async_trait]
impl EvmProvider for HttpEvmProvider {
    async fn call(&self, tx: &TypedTransaction) -> ChainResult<Bytes> {
        self.bounded(self.provider.call(tx, None)).await
    }

    async fn send_raw_transaction(&self, raw: Bytes) -> ChainResult<H256> {
        let pending = self.bounded(self.provider.send_raw_transaction(raw)).await?;
        Ok(*pending)
    }

    async fn transaction_receipt(&self, hash: H256) -> ChainResult<Option<TransactionReceipt>> {
        self.bounded(self.provider.get_transaction_receipt(hash))
            .await
    }

    async fn pending_transaction_count(&self, address: Address) -> ChainResult<U256> {
        self.bounded(
            self.provider
                .get_transaction_count(address, Some(BlockNumber::Pending.into())),
        )
        .await
    }

    async fn latest_base_fee(&self) -> ChainResult<U256> {
        let block = self
            .bounded(self.provider.get_block(BlockNumber::Latest))
            .await?
            .ok_or_else(|| ChainCommunicationError::Transport("Latest block not found".into()))?;
        block
            .base_fee_per_gas
            .ok_or(ChainCommunicationError::MissingBaseFee)
    }
}
