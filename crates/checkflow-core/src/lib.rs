//! Business logic and port trait definitions for Checkflow.
//!
//! This crate defines the "ports" (WAL, snapshot repository, template
//! source, step validator) that the infrastructure layer implements, plus
//! in-memory implementations for tests and embedders. It depends only on
//! `checkflow-types` -- never on `checkflow-infra` or any file/process I/O.

pub mod condition;
pub mod event;
pub mod state;
pub mod transaction;
pub mod validation;
pub mod workflow;
