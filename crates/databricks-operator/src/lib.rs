//! # Databricks Kubernetes Operator
//!
//! Watches `Dcluster`, `Djob` and `Run` custom resources, reconciles them
//! against a Databricks workspace and publishes the observed state back onto
//! the resource status.

pub mod controller;
pub mod crds;
pub mod error;
pub mod manager;
pub mod monitor;

pub use controller::*;
pub use crds::*;
pub use error::*;
pub use manager::*;
pub use monitor::*;

use databricks_client::ClientConfig;
use databricks_reconciler::ReconcilerConfig;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;

/// Operator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OperatorConfig {
    /// Namespace to watch, all namespaces when unset
    pub namespace: Option<String>,
    /// Create missing CRDs on startup
    pub install_crds: bool,
    pub health_addr: SocketAddr,
    pub enable_monitoring: bool,
    pub reconciler: ReconcilerConfig,
    pub client: ClientConfig,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            namespace: None,
            install_crds: true,
            health_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            enable_monitoring: true,
            reconciler: ReconcilerConfig::default(),
            client: ClientConfig::default(),
        }
    }
}

impl OperatorConfig {
    pub fn from_yaml(yaml: &str) -> OperatorResult<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn load(path: &Path) -> OperatorResult<Self> {
        let yaml = std::fs::read_to_string(path)?;
        Self::from_yaml(&yaml)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_operator_config_default() {
        let config = OperatorConfig::default();
        assert!(config.namespace.is_none());
        assert!(config.install_crds);
        assert_eq!(config.health_addr.port(), 8080);
        assert_eq!(config.reconciler.workers, 4);
    }

    #[test]
    fn test_operator_config_from_yaml() {
        let config = OperatorConfig::from_yaml(
            r#"
namespace: pipelines
health_addr: 127.0.0.1:9000
reconciler:
  workers: 8
  poll_interval: 2.5
client:
  host: https://adb-123.4.azuredatabricks.net
  token: dapi-secret
"#,
        )
        .unwrap();

        assert_eq!(config.namespace.as_deref(), Some("pipelines"));
        assert_eq!(config.health_addr.port(), 9000);
        assert_eq!(config.reconciler.workers, 8);
        assert_eq!(config.reconciler.poll_interval, Duration::from_millis(2500));
        assert_eq!(config.reconciler.max_attempts, 8);
        assert_eq!(config.client.host, "https://adb-123.4.azuredatabricks.net");
        assert_eq!(config.client.timeout_seconds, 30);
        assert!(config.enable_monitoring);
    }

    #[test]
    fn test_operator_config_rejects_bad_address() {
        assert!(OperatorConfig::from_yaml("health_addr: not-an-address").is_err());
    }
}
