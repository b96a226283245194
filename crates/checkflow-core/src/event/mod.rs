//! Event bus for workflow engine listeners.
//!
//! Provides an `EventBus` that delivers `WorkflowEvent` messages to
//! name-filtered handlers and to `tokio::sync::broadcast` receivers.

pub mod bus;

pub use bus::{EventBus, SubscriptionId};
