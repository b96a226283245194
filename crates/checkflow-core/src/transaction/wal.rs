//! Write-ahead log port and its in-memory implementation.
//!
//! The coordinator only needs monotonic append, full read-back and
//! per-transaction compaction. The file-backed log lives in checkflow-infra.

use std::sync::Arc;

use checkflow_types::error::StorageError;
use checkflow_types::transaction::{WalEntry, WalRecord};
use tokio::sync::Mutex;
use uuid::Uuid;

/// Append-only log of transaction entries.
///
/// Uses RPITIT (native async fn in traits, Rust 2024 edition).
/// Implementations live in checkflow-infra; `MemoryWal` is for tests and
/// embedders that do not need durability.
pub trait WalLog: Send + Sync {
    /// Append a record, assigning it the next sequence number.
    ///
    /// The entry is durable (per the implementation's sync policy) when the
    /// returned future resolves.
    fn append(
        &self,
        record: WalRecord,
    ) -> impl std::future::Future<Output = Result<WalEntry, StorageError>> + Send;

    /// All readable entries in sequence order.
    fn read_all(&self) -> impl std::future::Future<Output = Result<Vec<WalEntry>, StorageError>> + Send;

    /// Drop every entry belonging to one transaction.
    fn remove_transaction(
        &self,
        transaction_id: Uuid,
    ) -> impl std::future::Future<Output = Result<(), StorageError>> + Send;

    /// Drop every entry.
    fn clear(&self) -> impl std::future::Future<Output = Result<(), StorageError>> + Send;
}

impl<L: WalLog> WalLog for Arc<L> {
    async fn append(&self, record: WalRecord) -> Result<WalEntry, StorageError> {
        (**self).append(record).await
    }

    async fn read_all(&self) -> Result<Vec<WalEntry>, StorageError> {
        (**self).read_all().await
    }

    async fn remove_transaction(&self, transaction_id: Uuid) -> Result<(), StorageError> {
        (**self).remove_transaction(transaction_id).await
    }

    async fn clear(&self) -> Result<(), StorageError> {
        (**self).clear().await
    }
}

#[derive(Debug, Default)]
struct MemoryWalInner {
    entries: Vec<WalEntry>,
    last_sequence: u64,
}

/// In-memory `WalLog`. Sequence numbers keep increasing across `clear`.
#[derive(Debug, Default)]
pub struct MemoryWal {
    inner: Mutex<MemoryWalInner>,
}

impl MemoryWal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries currently held.
    pub async fn len(&self) -> usize {
        self.inner.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.entries.is_empty()
    }
}

impl WalLog for MemoryWal {
    async fn append(&self, record: WalRecord) -> Result<WalEntry, StorageError> {
        let mut inner = self.inner.lock().await;
        inner.last_sequence += 1;
        let entry = WalEntry {
            sequence: inner.last_sequence,
            record,
        };
        inner.entries.push(entry.clone());
        Ok(entry)
    }

    async fn read_all(&self) -> Result<Vec<WalEntry>, StorageError> {
        Ok(self.inner.lock().await.entries.clone())
    }

    async fn remove_transaction(&self, transaction_id: Uuid) -> Result<(), StorageError> {
        self.inner
            .lock()
            .await
            .entries
            .retain(|e| e.transaction_id() != transaction_id);
        Ok(())
    }

    async fn clear(&self) -> Result<(), StorageError> {
        self.inner.lock().await.entries.clear();
        Ok(())
    }
}
