//! Operator error types

use databricks_client::ClientError;
use databricks_store::StoreError;

pub type OperatorResult<T> = Result<T, OperatorError>;

#[derive(thiserror::Error, Debug)]
pub enum OperatorError {
    #[error("Kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Databricks client error: {0}")]
    Client(#[from] ClientError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Configuration error: {0}")]
    Config(#[from] serde_yaml::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Resource {0} has no name")]
    Unnamed(&'static str),
}
