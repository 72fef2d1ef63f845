use async_trait::async_trait;
use ethers::types::{
    transaction::eip2718::TypedTransaction, Address, Bytes, TransactionReceipt, H256, U256,
};

pub use entry_point::{CallStatus, EntryPoint, SubmitOutput};
pub use error::{categorize_error, ChainCommunicationError, ChainResult, ErrorCategory};
pub use fallback::FallbackProvider;
pub use http::HttpEvmProvider;

pub(crate) mod entry_point;
mod error;
mod fallback;
mod http;

pub(crate) const ETH_CALL: &str = "eth_call";
pub(crate) const ETH_SEND_RAW_TRANSACTION: &str = "eth_sendRawTransaction";
pub(crate) const ETH_GET_TRANSACTION_RECEIPT: &str = "eth_getTransactionReceipt";
pub(crate) const ETH_GET_TRANSACTION_COUNT: &str = "eth_getTransactionCount";
pub(crate) const ETH_GET_BLOCK_BY_NUMBER: &str = "eth_getBlockByNumber";

/// The JSON-RPC surface the submitter needs from a chain.
#[async_trait]
pub trait EvmProvider: Send + Sync {
    /// Read-only call against the latest state
    async fn call(&self, tx: &TypedTransaction) -> ChainResult<Bytes>;

    /// Broadcast a signed transaction
    async fn send_raw_transaction(&self, raw: Bytes) -> ChainResult<H256>;

    async fn transaction_receipt(&self, hash: H256) -> ChainResult<Option<TransactionReceipt>>;

    /// Transaction count of `address` including pending transactions
    async fn pending_transaction_count(&self, address: Address) -> ChainResult<U256>;

    /// Base fee of the latest block
    async fn latest_base_fee(&self) -> ChainResult<U256>;
}

#[cfg(test)]
pub(crate) mod test_utils {
    use super::*;

    mockall::mock! {
        pub EvmProvider {}

        #[async_trait]
        impl EvmProvider for EvmProvider {
            async fn call(&self, tx: &TypedTransaction) -> ChainResult<Bytes>;

            async fn send_raw_transaction(&self, raw: Bytes) -> ChainResult<H256>;

            async fn transaction_receipt(&self, hash: H256) -> ChainResult<Option<TransactionReceipt>>;

            async fn pending_transaction_count(&self, address: Address) -> ChainResult<U256>;

            async fn latest_base_fee(&self) -> ChainResult<U256>;
        }
    }

    pub fn rpc_error(code: i64, message: &str) -> ChainCommunicationError {
        ChainCommunicationError::JsonRpc {
            code,
            message: message.to_owned(),
            data: None,
        }
    }
}
