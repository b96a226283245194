//! Transaction coordinator over a write-ahead log.
//!
//! Protocol for one transaction:
//!
//! 1. `begin` appends a `begin` entry whose payload is the baseline state.
//! 2. Each intended mutation is appended as an `operation` entry before it
//!    is applied to durable state.
//! 3. `commit` appends a `commit` marker, then compacts the transaction's
//!    entries out of the log.
//! 4. `rollback` appends a `rollback` marker, then compacts.
//!
//! On startup, `recover_from_wal` finds transactions without a `commit`
//! marker and replays them: operation entries for transactions that were
//! cut short, the baseline for transactions that were being rolled back.
//! The log is cleared only after every replay succeeds.

use std::collections::HashMap;
use std::future::Future;

use chrono::Utc;
use dashmap::DashMap;
use uuid::Uuid;

use checkflow_types::error::{StorageError, WorkflowError};
use checkflow_types::state::WorkflowState;
use checkflow_types::transaction::{
    STATE_TARGET, Transaction, TransactionStatus, WalEntry, WalEntryKind, WalRecord,
};

use super::wal::WalLog;

fn wal_error(context: &str, err: StorageError) -> WorkflowError {
    WorkflowError::Transaction(format!("{context}: {err}"))
}

/// Coordinates begin/commit/rollback and crash recovery over a `WalLog`.
pub struct TransactionCoordinator<L: WalLog> {
    wal: L,
    open: DashMap<Uuid, Transaction>,
}

impl<L: WalLog> TransactionCoordinator<L> {
    pub fn new(wal: L) -> Self {
        Self {
            wal,
            open: DashMap::new(),
        }
    }

    pub fn wal(&self) -> &L {
        &self.wal
    }

    /// Open a transaction, logging `baseline` before anything is mutated.
    pub async fn begin_transaction(
        &self,
        operation: &str,
        baseline: &WorkflowState,
    ) -> Result<Uuid, WorkflowError> {
        let id = Uuid::now_v7();
        let payload = serde_json::to_value(baseline)
            .map_err(|e| WorkflowError::Transaction(format!("failed to encode baseline: {e}")))?;

        let entry = self
            .wal
            .append(WalRecord::new(
                id,
                WalEntryKind::Begin,
                operation,
                STATE_TARGET,
                payload,
            ))
            .await
            .map_err(|e| wal_error("failed to log transaction begin", e))?;

        tracing::debug!(
            transaction_id = %id,
            operation,
            sequence = entry.sequence,
            "transaction begun"
        );

        self.open.insert(
            id,
            Transaction {
                id,
                operation: operation.to_string(),
                baseline: baseline.clone(),
                status: TransactionStatus::Open,
                started_at: Utc::now(),
                operation_count: 0,
            },
        );
        Ok(id)
    }

    /// Log an intended mutation for an open transaction.
    pub async fn add_operation(
        &self,
        transaction_id: Uuid,
        target: &str,
        operation: &str,
        payload: serde_json::Value,
    ) -> Result<WalEntry, WorkflowError> {
        self.ensure_open(transaction_id)?;

        let entry = self
            .wal
            .append(WalRecord::new(
                transaction_id,
                WalEntryKind::Operation,
                operation,
                target,
                payload,
            ))
            .await
            .map_err(|e| wal_error("failed to log operation", e))?;

        if let Some(mut tx) = self.open.get_mut(&transaction_id) {
            tx.operation_count += 1;
        }

        tracing::debug!(
            transaction_id = %transaction_id,
            operation,
            target,
            sequence = entry.sequence,
            "operation logged"
        );
        Ok(entry)
    }

    /// Mark the transaction committed and compact its entries.
    ///
    /// Once the commit marker is durable the transaction is committed; a
    /// failed compaction only leaves entries that recovery will ignore.
    pub async fn commit_transaction(&self, transaction_id: Uuid) -> Result<(), WorkflowError> {
        let operation = self.ensure_open(transaction_id)?;

        self.wal
            .append(WalRecord::new(
                transaction_id,
                WalEntryKind::Commit,
                operation.as_str(),
                STATE_TARGET,
                serde_json::Value::Null,
            ))
            .await
            .map_err(|e| wal_error("failed to log commit", e))?;

        if let Some(mut tx) = self.open.get_mut(&transaction_id) {
            tx.status = TransactionStatus::Committed;
        }
        self.open.remove(&transaction_id);

        if let Err(e) = self.wal.remove_transaction(transaction_id).await {
            tracing::warn!(
                transaction_id = %transaction_id,
                error = %e,
                "failed to compact committed transaction"
            );
        }

        tracing::debug!(transaction_id = %transaction_id, operation = %operation, "transaction committed");
        Ok(())
    }

    /// Abandon the transaction and return its baseline.
    ///
    /// The `rollback` marker is written before compaction so that a crash
    /// in between is recovered by restoring the baseline instead of
    /// replaying the abandoned mutation.
    pub async fn rollback_transaction(
        &self,
        transaction_id: Uuid,
    ) -> Result<WorkflowState, WorkflowError> {
        let Some((_, mut tx)) = self.open.remove(&transaction_id) else {
            return Err(WorkflowError::Transaction(format!(
                "transaction {transaction_id} is not open"
            )));
        };
        tx.status = TransactionStatus::RolledBack;

        let marker = self
            .wal
            .append(WalRecord::new(
                transaction_id,
                WalEntryKind::Rollback,
                tx.operation.as_str(),
                STATE_TARGET,
                serde_json::Value::Null,
            ))
            .await;
        let compacted = self.wal.remove_transaction(transaction_id).await;

        match (marker, compacted) {
            (_, Ok(())) => {}
            (Ok(_), Err(e)) => {
                tracing::warn!(
                    transaction_id = %transaction_id,
                    error = %e,
                    "rollback marker logged but compaction failed"
                );
            }
            (Err(marker_err), Err(e)) => {
                tracing::warn!(
                    transaction_id = %transaction_id,
                    marker_error = %marker_err,
                    error = %e,
                    "rollback could not be logged"
                );
                return Err(wal_error("failed to log rollback", e));
            }
        }

        tracing::warn!(
            transaction_id = %transaction_id,
            operation = %tx.operation,
            operations = tx.operation_count,
            "transaction rolled back"
        );
        Ok(tx.baseline)
    }

    /// Snapshot of the transactions opened by this process and not yet closed.
    pub fn open_transactions(&self) -> Vec<Transaction> {
        self.open.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Whether the log holds a transaction without a `commit` marker, or
    /// this process has one open.
    pub async fn has_incomplete_transactions(&self) -> Result<bool, WorkflowError> {
        if !self.open.is_empty() {
            return Ok(true);
        }
        let entries = self
            .wal
            .read_all()
            .await
            .map_err(|e| wal_error("failed to read WAL", e))?;
        Ok(group_by_transaction(entries)
            .iter()
            .any(|(_, group)| !is_committed(group)))
    }

    /// Replay every uncommitted transaction through `apply`.
    ///
    /// Returns the number of entries handed to `apply`. The log is cleared
    /// only when all of them succeed; on failure it is left intact so the
    /// next attempt replays again, so `apply` must be idempotent.
    pub async fn recover_from_wal<F, Fut>(&self, mut apply: F) -> Result<usize, WorkflowError>
    where
        F: FnMut(WalEntry) -> Fut,
        Fut: Future<Output = Result<(), WorkflowError>>,
    {
        let entries = self
            .wal
            .read_all()
            .await
            .map_err(|e| wal_error("failed to read WAL", e))?;

        let mut replay = Vec::new();
        for (transaction_id, group) in group_by_transaction(entries) {
            if is_committed(&group) {
                continue;
            }
            let rolled_back = group.iter().any(|e| e.kind() == WalEntryKind::Rollback);
            let selected: Vec<WalEntry> = if rolled_back {
                group
                    .into_iter()
                    .filter(|e| e.kind() == WalEntryKind::Begin)
                    .collect()
            } else {
                group
                    .into_iter()
                    .filter(|e| e.kind() == WalEntryKind::Operation)
                    .collect()
            };
            tracing::info!(
                transaction_id = %transaction_id,
                rolled_back,
                entries = selected.len(),
                "recovering incomplete transaction"
            );
            replay.extend(selected);
        }

        let recovered = replay.len();
        for entry in replay {
            let sequence = entry.sequence;
            if let Err(e) = apply(entry).await {
                tracing::warn!(sequence, error = %e, "WAL replay failed; log kept for retry");
                return Err(e);
            }
        }

        self.wal
            .clear()
            .await
            .map_err(|e| wal_error("failed to clear WAL after recovery", e))?;
        Ok(recovered)
    }

    fn ensure_open(&self, transaction_id: Uuid) -> Result<String, WorkflowError> {
        self.open
            .get(&transaction_id)
            .map(|tx| tx.operation.clone())
            .ok_or_else(|| {
                WorkflowError::Transaction(format!("transaction {transaction_id} is not open"))
            })
    }
}

/// Group entries by transaction, keeping first-appearance order.
fn group_by_transaction(entries: Vec<WalEntry>) -> Vec<(Uuid, Vec<WalEntry>)> {
    let mut positions: HashMap<Uuid, usize> = HashMap::new();
    let mut groups: Vec<(Uuid, Vec<WalEntry>)> = Vec::new();
    for entry in entries {
        let id = entry.transaction_id();
        match positions.get(&id) {
            Some(&i) => groups[i].1.push(entry),
            None => {
                positions.insert(id, groups.len());
                groups.push((id, vec![entry]));
            }
        }
    }
    groups
}

fn is_committed(group: &[WalEntry]) -> bool {
    group.iter().any(|e| e.kind() == WalEntryKind::Commit)
}
