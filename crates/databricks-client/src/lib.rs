//! # Databricks API client
//!
//! Typed async client for the cluster, job and run endpoints of the
//! Databricks REST API 2.0:
//! - [`RestClient`] talks to a workspace over HTTPS with a bearer token
//! - [`FakeClient`] (feature `testing`) is an in-memory workspace with
//!   scripted state progressions and failure injection

pub mod error;
pub mod rest;

#[cfg(any(test, feature = "testing"))]
pub mod fake;

pub use error::{ClientError, ClientResult};
pub use rest::RestClient;

#[cfg(any(test, feature = "testing"))]
pub use fake::{FakeClient, Operation};

use databricks_api::{
    ClusterId, ClusterInfo, ClusterSpec, IdempotencyKey, JobId, JobInfo, JobSpec, RunId, RunOutput,
    RunSpec,
};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Databricks API client trait
#[async_trait::async_trait]
pub trait DatabricksClient: Send + Sync {
    /// Create a cluster, returns its id
    async fn create_cluster(
        &self,
        cluster_name: &str,
        spec: &ClusterSpec,
        token: &IdempotencyKey,
    ) -> ClientResult<ClusterId>;

    async fn get_cluster(&self, id: &ClusterId) -> ClientResult<ClusterInfo>;

    /// Replace the configuration of a running or terminated cluster
    async fn edit_cluster(
        &self,
        id: &ClusterId,
        cluster_name: &str,
        spec: &ClusterSpec,
    ) -> ClientResult<()>;

    /// Permanently delete a cluster
    async fn delete_cluster(&self, id: &ClusterId) -> ClientResult<()>;

    async fn list_clusters(&self) -> ClientResult<Vec<ClusterInfo>>;

    /// Create a job, returns its id
    async fn create_job(
        &self,
        job_name: &str,
        spec: &JobSpec,
        token: &IdempotencyKey,
    ) -> ClientResult<JobId>;

    async fn get_job(&self, id: JobId) -> ClientResult<JobInfo>;

    /// Overwrite all settings of a job
    async fn reset_job(&self, id: JobId, job_name: &str, spec: &JobSpec) -> ClientResult<()>;

    async fn delete_job(&self, id: JobId) -> ClientResult<()>;

    /// Submit a one-time run on a new or existing cluster
    async fn submit_run(
        &self,
        run_name: &str,
        spec: &RunSpec,
        token: &IdempotencyKey,
    ) -> ClientResult<RunId>;

    /// Trigger a run of an existing job
    async fn run_now(&self, job_id: JobId, token: &IdempotencyKey) -> ClientResult<RunId>;

    /// Run metadata together with its output
    async fn get_run(&self, id: RunId) -> ClientResult<RunOutput>;

    async fn cancel_run(&self, id: RunId) -> ClientResult<()>;

    /// Delete a non-active run
    async fn delete_run(&self, id: RunId) -> ClientResult<()>;

    /// Health check
    async fn health_check(&self) -> ClientResult<bool>;
}

/// Databricks workspace connection settings
#[derive(Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Workspace URL, e.g. `https://adb-123.4.azuredatabricks.net`
    pub host: String,

    /// Personal access or AAD token sent as bearer token
    #[serde(default)]
    pub token: Option<String>,

    /// Per-request timeout
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
}

fn default_timeout_seconds() -> u64 {
    30
}

impl ClientConfig {
    pub fn new(host: &str) -> Self {
        Self {
            host: host.to_string(),
            token: None,
            timeout_seconds: default_timeout_seconds(),
        }
    }

    pub fn with_token(mut self, token: &str) -> Self {
        self.token = Some(token.to_string());
        self
    }

    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.timeout_seconds = seconds;
        self
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::new("")
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("host", &self.host)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("timeout_seconds", &self.timeout_seconds)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_debug_redacts_token() {
        let config = ClientConfig::new("https://example.azuredatabricks.net").with_token("dapi-secret");
        let debug = format!("{:?}", config);
        assert!(!debug.contains("dapi-secret"));
        assert!(debug.contains("<redacted>"));
    }

    #[test]
    fn test_config_defaults_from_yaml_like_json() {
        let config: ClientConfig =
            serde_json::from_str(r#"{"host": "https://example.azuredatabricks.net"}"#).unwrap();
        assert_eq!(config.timeout_seconds, 30);
        assert!(config.token.is_none());
    }
}
