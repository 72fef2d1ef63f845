pub use db::{DbError, DbResult, InMemoryReceiptDb, ReceiptDb, RocksReceiptDb};
pub use reconciler::ReceiptReconciler;
pub use types::{BoopLog, BoopReceipt};

mod db;
mod reconciler;
mod types;
