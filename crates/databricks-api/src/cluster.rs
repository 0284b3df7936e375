//! Desired cluster settings and observed cluster state

use crate::ValidationError;
use schemars::JsonSchema;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Cluster identifier assigned by Databricks on create
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct ClusterId(pub String);

impl fmt::Display for ClusterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ClusterId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Desired cluster shape, used by `Dcluster` specs and `new_cluster` blocks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ClusterSpec {
    /// Runtime version, e.g. `5.3.x-scala2.11`
    pub spark_version: String,

    /// VM size of the driver and workers, e.g. `Standard_D3_v2`
    pub node_type_id: String,

    /// Spark configuration overrides
    #[serde(
        default,
        skip_serializing_if = "BTreeMap::is_empty",
        deserialize_with = "lenient_string_map"
    )]
    pub spark_conf: BTreeMap<String, String>,

    /// Number of worker nodes
    #[serde(default)]
    pub num_workers: i32,

    /// Idle minutes before Databricks terminates the cluster
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub autotermination_minutes: Option<i32>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub custom_tags: BTreeMap<String, String>,
}

impl ClusterSpec {
    pub fn new(spark_version: &str, node_type_id: &str, num_workers: i32) -> Self {
        Self {
            spark_version: spark_version.to_string(),
            node_type_id: node_type_id.to_string(),
            spark_conf: BTreeMap::new(),
            num_workers,
            autotermination_minutes: None,
            custom_tags: BTreeMap::new(),
        }
    }

    pub fn with_spark_conf(mut self, key: &str, value: &str) -> Self {
        self.spark_conf.insert(key.to_string(), value.to_string());
        self
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.spark_version.trim().is_empty() {
            return Err(ValidationError::Empty("spark_version"));
        }
        if self.node_type_id.trim().is_empty() {
            return Err(ValidationError::Empty("node_type_id"));
        }
        if self.num_workers < 0 {
            return Err(ValidationError::Negative {
                field: "num_workers",
                value: self.num_workers.into(),
            });
        }
        Ok(())
    }
}

/// Accepts booleans and numbers as configuration values and stores them as strings.
fn lenient_string_map<'de, D>(deserializer: D) -> Result<BTreeMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = BTreeMap::<String, serde_json::Value>::deserialize(deserializer)?;
    raw.into_iter()
        .map(|(key, value)| {
            let value = match value {
                serde_json::Value::String(value) => value,
                serde_json::Value::Bool(value) => value.to_string(),
                serde_json::Value::Number(value) => value.to_string(),
                other => {
                    return Err(serde::de::Error::custom(format!(
                        "spark_conf value for {key:?} must be a scalar, got {other}"
                    )))
                }
            };
            Ok((key, value))
        })
        .collect()
}

/// Cluster state as reported by `clusters/get`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClusterState {
    Pending,
    Running,
    Restarting,
    Resizing,
    Terminating,
    Terminated,
    Error,
    #[default]
    #[serde(other)]
    Unknown,
}

impl ClusterState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Restarting => "RESTARTING",
            Self::Resizing => "RESIZING",
            Self::Terminating => "TERMINATING",
            Self::Terminated => "TERMINATED",
            Self::Error => "ERROR",
            Self::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for ClusterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Observed cluster, as returned by `clusters/get` and `clusters/list`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ClusterInfo {
    pub cluster_id: ClusterId,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_name: Option<String>,

    #[serde(default)]
    pub state: ClusterState,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_message: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spark_version: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_type_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_workers: Option<i32>,
}
