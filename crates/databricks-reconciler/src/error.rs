//! Reconciler error types

use databricks_store::StoreError;

/// Reconciler result type
pub type ReconcileResult<T> = Result<T, ReconcileError>;

/// Failures that escape a reconcile. Retryable Databricks errors never do;
/// they are retried and surfaced through the resource status instead.
#[derive(thiserror::Error, Debug)]
pub enum ReconcileError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
