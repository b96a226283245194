//! Transactions and write-ahead logging.
//!
//! - `wal` -- the `WalLog` port and `MemoryWal`
//! - `coordinator` -- begin/commit/rollback and crash recovery

pub mod coordinator;
pub mod wal;

pub use coordinator::TransactionCoordinator;
pub use wal::{MemoryWal, WalLog};
