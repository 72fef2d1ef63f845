use std::collections::HashMap;
use std::fmt::{Debug, Formatter};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use rocksdb::{Options, DB as Rocks};
use tracing::{debug, info};

use crate::boop::BoopHash;

use super::BoopReceipt;

const RECEIPT_BY_BOOP_HASH_STORAGE_PREFIX: &str = "boop_receipt_";

/// DB Error type
#[derive(thiserror::Error, Debug)]
pub enum DbError {
    /// Rocks DB Error
    #[error("{0}")]
    RockError(#[from] rocksdb::Error),
    /// Error opening the database
    #[error("Failed to open {path}, canonicalized as {canonicalized}: {source}")]
    OpeningError {
        #[source]
        source: rocksdb::Error,
        path: PathBuf,
        canonicalized: PathBuf,
    },
    /// Could not parse the provided database path string
    #[error("Invalid database path supplied {1:?}; {0}")]
    InvalidDbPath(#[source] io::Error, String),
    /// Stored value could not be (de)serialized
    #[error("{0}")]
    SerdeError(#[from] serde_json::Error),
}

pub type DbResult<T> = std::result::Result<T, DbError>;

/// Persistent store of final receipts, keyed by boop hash.
#[async_trait]
pub trait ReceiptDb: Send + Sync {
    /// Stores the receipt unless one already exists for its boop hash, and returns
    /// whichever receipt is stored afterwards.
    async fn store_receipt_if_absent(&self, receipt: &BoopReceipt) -> DbResult<BoopReceipt>;

    /// Retrieve a receipt by boop hash
    async fn retrieve_receipt(&self, boop_hash: &BoopHash) -> DbResult<Option<BoopReceipt>>;
}

#[derive(Debug, Default)]
pub struct InMemoryReceiptDb {
    receipts: RwLock<HashMap<BoopHash, BoopReceipt>>,
}

impl InMemoryReceiptDb {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ReceiptDb for InMemoryReceiptDb {
    async fn store_receipt_if_absent(&self, receipt: &BoopReceipt) -> DbResult<BoopReceipt> {
        let mut receipts = self.receipts.write();
        Ok(receipts
            .entry(receipt.boop_hash)
            .or_insert_with(|| receipt.clone())
            .clone())
    }

    async fn retrieve_receipt(&self, boop_hash: &BoopHash) -> DbResult<Option<BoopReceipt>> {
        Ok(self.receipts.read().get(boop_hash).cloned())
    }
}

/// Receipts persisted in RocksDB as JSON values.
#[derive(Clone)]
pub struct RocksReceiptDb {
    db: Arc<Rocks>,
    // serializes check-then-put so a receipt is only ever written once
    write_lock: Arc<Mutex<()>>,
}

impl Debug for RocksReceiptDb {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RocksReceiptDb")
            .field("path", &self.db.path())
            .finish()
    }
}

impl RocksReceiptDb {
    /// Opens db at `db_path` and creates if missing
    #[tracing::instrument(err)]
    pub fn from_path(db_path: &Path) -> DbResult<Self> {
        let path = {
            let mut path = db_path
                .parent()
                .unwrap_or(Path::new("."))
                .canonicalize()
                .map_err(|e| DbError::InvalidDbPath(e, db_path.to_string_lossy().into()))?;
            if let Some(file_name) = db_path.file_name() {
                path.push(file_name);
            }
            path
        };

        if path.is_dir() {
            info!(path=%path.to_string_lossy(), "Opening existing db")
        } else {
            info!(path=%path.to_string_lossy(), "Creating db")
        }

        let mut opts = Options::default();
        opts.create_if_missing(true);

        let db = Rocks::open(&opts, &path).map_err(|e| DbError::OpeningError {
            source: e,
            path: db_path.into(),
            canonicalized: path,
        })?;
        Ok(Self {
            db: Arc::new(db),
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    fn key(boop_hash: &BoopHash) -> Vec<u8> {
        let mut key = RECEIPT_BY_BOOP_HASH_STORAGE_PREFIX.as_bytes().to_vec();
        key.extend_from_slice(boop_hash.as_bytes());
        key
    }

    fn retrieve(&self, boop_hash: &BoopHash) -> DbResult<Option<BoopReceipt>> {
        self.db
            .get(Self::key(boop_hash))?
            .map(|bytes| serde_json::from_slice(&bytes))
            .transpose()
            .map_err(Into::into)
    }
}

#[async_trait]
impl ReceiptDb for RocksReceiptDb {
    async fn store_receipt_if_absent(&self, receipt: &BoopReceipt) -> DbResult<BoopReceipt> {
        let _guard = self.write_lock.lock();
        if let Some(existing) = self.retrieve(&receipt.boop_hash)? {
            debug!(boop_hash = ?receipt.boop_hash, "Receipt already stored");
            return Ok(existing);
        }
        let value = serde_json::to_vec(receipt)?;
        self.db.put(Self::key(&receipt.boop_hash), value)?;
        Ok(receipt.clone())
    }

    async fn retrieve_receipt(&self, boop_hash: &BoopHash) -> DbResult<Option<BoopReceipt>> {
        self.retrieve(boop_hash)
    }
}


#[cfg(test)]
mod tests {
    use ethers::types::H256;
    use tempfile::TempDir;

    use super::test_utils::dummy_receipt;
    use super::*;
    use crate::status::BoopStatus;

    async fn assert_stores_once(db: &dyn ReceiptDb) {
        let receipt = dummy_receipt(0);
        assert_eq!(db.retrieve_receipt(&receipt.boop_hash).await.unwrap(), None);

        let stored = db.store_receipt_if_absent(&receipt).await.unwrap();
        assert_eq!(stored, receipt);

        let conflicting = BoopReceipt {
            status: BoopStatus::CallReverted,
            evm_tx_hash: H256::repeat_byte(0xcc),
            ..receipt.clone()
        };
        let stored = db.store_receipt_if_absent(&conflicting).await.unwrap();
        assert_eq!(stored, receipt);
        assert_eq!(
            db.retrieve_receipt(&receipt.boop_hash).await.unwrap(),
            Some(receipt)
        );
    }

    #[tokio::test]
    async fn test_in_memory_db_stores_once() {
        assert_stores_once(&InMemoryReceiptDb::new()).await;
    }

    #[tokio::test]
    async fn test_rocks_db_stores_once() {
        let dir = TempDir::new().unwrap();
        let db = RocksReceiptDb::from_path(&dir.path().join("receipts")).unwrap();
        assert_stores_once(&db).await;
    }

    #[tokio::test]
    async fn test_rocks_db_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("receipts");
        let receipt = dummy_receipt(3);
        {
            let db = RocksReceiptDb::from_path(&path).unwrap();
            db.store_receipt_if_absent(&receipt).await.unwrap();
        }
        let db = RocksReceiptDb::from_path(&path).unwrap();
        assert_eq!(
            db.retrieve_receipt(&receipt.boop_hash).await.unwrap(),
            Some(receipt)
        );
    }

    #[test]
    fn test_rocks_db_rejects_missing_parent() {
        let err = RocksReceiptDb::from_path(Path::new("/does/not/exist/receipts")).unwrap_err();
        assert!(matches!(err, DbError::InvalidDbPath(..)));
    }
}
