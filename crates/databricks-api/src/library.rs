//! Library attachments for jobs and runs

use crate::ValidationError;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A library installed on the cluster before a task starts.
///
/// Serialized the way Databricks expects it: `{"jar": "dbfs:/my.jar"}` or
/// `{"maven": {"coordinates": "org.jsoup:jsoup:1.7.2"}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum LibrarySpec {
    Jar(String),
    Maven(MavenLibrary),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct MavenLibrary {
    /// `group:artifact:version`
    pub coordinates: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclusions: Vec<String>,
}

impl LibrarySpec {
    pub fn jar(path: &str) -> Self {
        Self::Jar(path.to_string())
    }

    pub fn maven(coordinates: &str) -> Self {
        Self::Maven(MavenLibrary {
            coordinates: coordinates.to_string(),
            repo: None,
            exclusions: Vec::new(),
        })
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        match self {
            Self::Jar(path) if path.trim().is_empty() => Err(ValidationError::Empty("jar")),
            Self::Maven(maven) if maven.coordinates.trim().is_empty() => {
                Err(ValidationError::Empty("maven.coordinates"))
            }
            _ => Ok(()),
        }
    }
}
