//! Transaction and write-ahead-log record types.
//!
//! A transaction wraps one engine operation. Its WAL footprint is a `begin`
//! entry carrying the baseline state, one `operation` entry per intended
//! mutation, and a terminal `commit` (or `rollback`) marker.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::state::WorkflowState;

/// WAL target naming the persisted workflow state snapshot.
pub const STATE_TARGET: &str = "state";

/// Status of an in-flight transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Open,
    Committed,
    RolledBack,
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionStatus::Open => write!(f, "open"),
            TransactionStatus::Committed => write!(f, "committed"),
            TransactionStatus::RolledBack => write!(f, "rolled_back"),
        }
    }
}

/// A begin/commit-or-rollback unit around one engine operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub id: Uuid,
    /// Engine operation name (`advance`, `skip`, ...).
    pub operation: String,
    /// State snapshot taken before any mutation.
    pub baseline: WorkflowState,
    pub status: TransactionStatus,
    pub started_at: DateTime<Utc>,
    /// Number of operation entries appended so far.
    pub operation_count: usize,
}

/// Kind of a WAL entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WalEntryKind {
    Begin,
    Operation,
    Commit,
    Rollback,
}

/// A WAL record before the log assigns it a sequence number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalRecord {
    pub transaction_id: Uuid,
    pub kind: WalEntryKind,
    /// Operation name: the engine operation for `begin`, the mutation for
    /// `operation` entries.
    pub operation: String,
    /// What the payload applies to (see [`STATE_TARGET`]).
    pub target: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl WalRecord {
    pub fn new(
        transaction_id: Uuid,
        kind: WalEntryKind,
        operation: impl Into<String>,
        target: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            transaction_id,
            kind,
            operation: operation.into(),
            target: target.into(),
            payload,
            timestamp: Utc::now(),
        }
    }
}

/// A durable WAL entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalEntry {
    /// Monotonically increasing within a log.
    pub sequence: u64,
    #[serde(flatten)]
    pub record: WalRecord,
}

impl WalEntry {
    pub fn transaction_id(&self) -> Uuid {
        self.record.transaction_id
    }

    pub fn kind(&self) -> WalEntryKind {
        self.record.kind
    }
}
