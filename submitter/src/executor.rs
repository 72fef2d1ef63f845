use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use ethers::signers::{LocalWallet, Signer};
use ethers::types::{transaction::eip2718::TypedTransaction, Address, Bytes, U256};
use ethers::utils::keccak256;
use eyre::{eyre, Context};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::chain::{ChainResult, EvmProvider};
use crate::error::SubmitterError;

/// An EOA that submits boops to the entry point, with its own view of its next EVM nonce.
pub struct ExecutorKey {
    wallet: LocalWallet,
    /// Next nonce to hand out. `None` until synced from the node, and after a failed send.
    next_nonce: Mutex<Option<U256>>,
}

impl Debug for ExecutorKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorKey")
            .field("address", &self.wallet.address())
            .finish()
    }
}

impl ExecutorKey {
    pub fn new(wallet: LocalWallet) -> Self {
        Self {
            wallet,
            next_nonce: Mutex::new(None),
        }
    }

    pub fn address(&self) -> Address {
        self.wallet.address()
    }

    pub fn chain_id(&self) -> u64 {
        self.wallet.chain_id()
    }

    /// Hands out the next EVM nonce, reading the pending transaction count first if the
    /// local value is unknown.
    pub async fn reserve_nonce(&self, provider: &dyn EvmProvider) -> ChainResult<U256> {
        let mut next_nonce = self.next_nonce.lock().await;
        let nonce = match *next_nonce {
            Some(nonce) => nonce,
            None => {
                let nonce = provider.pending_transaction_count(self.address()).await?;
                info!(address = ?self.address(), ?nonce, "Synced executor nonce");
                nonce
            }
        };
        *next_nonce = Some(nonce.saturating_add(U256::one()));
        Ok(nonce)
    }

    /// Forgets the local nonce so the next reservation reads it from the node.
    pub async fn reset_nonce(&self) {
        debug!(address = ?self.address(), "Resetting executor nonce");
        *self.next_nonce.lock().await = None;
    }

    /// Signs the transaction and returns its raw RLP encoding.
    pub fn sign(&self, tx: &TypedTransaction) -> Result<Bytes, SubmitterError> {
        let signature = self
            .wallet
            .sign_transaction_sync(tx)
            .map_err(|e| SubmitterError::SigningError(e.to_string()))?;
        Ok(tx.rlp_signed(&signature))
    }
}

/// The executor keys of the submitter. Each account always maps to the same key, so
/// boops of one account never race each other across executors.
#[derive(Debug, Clone)]
pub struct ExecutorKeyPool {
    first: Arc<ExecutorKey>,
    rest: Vec<Arc<ExecutorKey>>,
}

impl ExecutorKeyPool {
    pub fn new(wallets: Vec<LocalWallet>) -> eyre::Result<Self> {
        let mut keys = wallets
            .into_iter()
            .map(|wallet| Arc::new(ExecutorKey::new(wallet)));
        let first = keys
            .next()
            .ok_or_else(|| eyre!("At least one executor key is required"))?;
        Ok(Self {
            first,
            rest: keys.collect(),
        })
    }

    /// Builds the pool from hex encoded private keys.
    pub fn from_private_keys(private_keys: &[String], chain_id: u64) -> eyre::Result<Self> {
        let wallets = private_keys
            .iter()
            .enumerate()
            .map(|(index, key)| {
                key.trim_start_matches("0x")
                    .parse::<LocalWallet>()
                    .map(|wallet| wallet.with_chain_id(chain_id))
                    .with_context(|| format!("Invalid executor key at index {index}"))
            })
            .collect::<eyre::Result<Vec<_>>>()?;
        Self::new(wallets)
    }

    fn len(&self) -> usize {
        self.rest.len().saturating_add(1)
    }

    pub fn addresses(&self) -> Vec<Address> {
        self.keys().map(|key| key.address()).collect()
    }

    /// The key assigned to an account.
    pub fn pick_key(&self, account: Address) -> Arc<ExecutorKey> {
        let hash = keccak256(account);
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&hash[..8]);
        let len = u64::try_from(self.len()).unwrap_or(u64::MAX);
        let index = u64::from_be_bytes(prefix)
            .checked_rem(len)
            .and_then(|i| usize::try_from(i).ok())
            .unwrap_or_default();
        self.keys().nth(index).unwrap_or(&self.first).clone()
    }

    fn keys(&self) -> impl Iterator<Item = &Arc<ExecutorKey>> {
        std::iter::once(&self.first).chain(self.rest.iter())
    }
}
