//! Infrastructure layer for Checkflow.
//!
//! Contains implementations of the port traits defined in `checkflow-core`:
//! the file-backed write-ahead log, checksummed state snapshots, YAML/JSON
//! template loading, and the step validators that run shell commands and
//! check files.

pub mod config;
pub mod crypto;
pub mod filesystem;
pub mod state;
pub mod template;
pub mod validation;
pub mod wal;
