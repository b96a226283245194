use std::collections::BTreeMap;

use serde_json::json;
use thiserror::Error;

use crate::state::WorkflowStatus;

/// Errors raised by workflow engine operations.
///
/// Every variant carries a stable `code()`, a `recoverable` classification,
/// and structured `context()` for the `error` event.
#[derive(Debug, Clone, Error)]
pub enum WorkflowError {
    #[error("invalid state transition from '{from}' to '{to}'")]
    StateTransition {
        from: WorkflowStatus,
        to: WorkflowStatus,
    },

    #[error("validation failed for step '{step_id}': {message}")]
    Validation { step_id: String, message: String },

    #[error("condition '{expression}' could not be evaluated: {reason}")]
    ConditionEvaluation { expression: String, reason: String },

    #[error("state corruption detected: {reason}")]
    StateCorruption { reason: String },

    #[error("failed to load template '{template_id}': {reason}")]
    TemplateLoad { template_id: String, reason: String },

    #[error("workflow engine not initialized; call init first")]
    NotInitialized,

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("{message}")]
    Other {
        code: String,
        message: String,
        recoverable: bool,
        context: BTreeMap<String, serde_json::Value>,
    },
}

impl WorkflowError {
    /// Stable machine-readable error code.
    pub fn code(&self) -> &str {
        match self {
            WorkflowError::StateTransition { .. } => "STATE_TRANSITION_ERROR",
            WorkflowError::Validation { .. } => "VALIDATION_ERROR",
            WorkflowError::ConditionEvaluation { .. } => "CONDITION_EVALUATION_ERROR",
            WorkflowError::StateCorruption { .. } => "STATE_CORRUPTION_ERROR",
            WorkflowError::TemplateLoad { .. } => "TEMPLATE_LOAD_ERROR",
            WorkflowError::NotInitialized => "NOT_INITIALIZED",
            WorkflowError::InvalidOperation(_) => "INVALID_OPERATION",
            WorkflowError::Transaction(_) => "TRANSACTION_ERROR",
            WorkflowError::Storage(_) => "STORAGE_ERROR",
            WorkflowError::Other { code, .. } => code,
        }
    }

    /// Whether the engine may mitigate this error automatically.
    pub fn is_recoverable(&self) -> bool {
        match self {
            WorkflowError::Validation { .. } | WorkflowError::StateCorruption { .. } => true,
            WorkflowError::Other { recoverable, .. } => *recoverable,
            _ => false,
        }
    }

    /// Infrastructure faults that leave an active run unable to continue.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            WorkflowError::Transaction(_) | WorkflowError::Storage(_)
        )
    }

    /// Structured context attached to the `error` event.
    pub fn context(&self) -> serde_json::Value {
        match self {
            WorkflowError::StateTransition { from, to } => {
                json!({ "from": from.to_string(), "to": to.to_string() })
            }
            WorkflowError::Validation { step_id, .. } => json!({ "stepId": step_id }),
            WorkflowError::ConditionEvaluation { expression, .. } => {
                json!({ "expression": expression })
            }
            WorkflowError::TemplateLoad { template_id, .. } => {
                json!({ "templateId": template_id })
            }
            WorkflowError::Other { context, .. } => json!(context),
            _ => json!({}),
        }
    }
}

/// Errors from the storage ports (WAL and snapshot repositories).
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("corrupted data: {0}")]
    Corrupted(String),

    #[error("entity not found")]
    NotFound,
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

impl From<StorageError> for WorkflowError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Corrupted(reason) => WorkflowError::StateCorruption { reason },
            other => WorkflowError::Storage(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_and_recoverability() {
        let err = WorkflowError::StateCorruption {
            reason: "bad checksum".to_string(),
        };
        assert_eq!(err.code(), "STATE_CORRUPTION_ERROR");
        assert!(err.is_recoverable());

        let err = WorkflowError::TemplateLoad {
            template_id: "missing".to_string(),
            reason: "not found".to_string(),
        };
        assert_eq!(err.code(), "TEMPLATE_LOAD_ERROR");
        assert!(!err.is_recoverable());
        assert_eq!(err.context()["templateId"], "missing");

        let err = WorkflowError::Validation {
            step_id: "build".to_string(),
            message: "exit 1".to_string(),
        };
        assert!(err.is_recoverable());
        assert!(err.to_string().contains("build"));
    }

    #[test]
    fn test_other_error_carries_code_and_context() {
        let mut context = BTreeMap::new();
        context.insert("attempt".to_string(), json!(2));
        let err = WorkflowError::Other {
            code: "CUSTOM".to_string(),
            message: "something odd".to_string(),
            recoverable: true,
            context,
        };
        assert_eq!(err.code(), "CUSTOM");
        assert!(err.is_recoverable());
        assert_eq!(err.context()["attempt"], 2);
        assert_eq!(err.to_string(), "something odd");
    }

    #[test]
    fn test_storage_error_conversion() {
        let err: WorkflowError = StorageError::Corrupted("checksum mismatch".to_string()).into();
        assert!(matches!(err, WorkflowError::StateCorruption { .. }));

        let err: WorkflowError = StorageError::NotFound.into();
        assert!(matches!(err, WorkflowError::Storage(_)));
        assert!(err.is_fatal());
    }
}
