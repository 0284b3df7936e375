//! Job settings, task variants and observed job info

use crate::{ClusterSpec, LibrarySpec, ValidationError};
use schemars::gen::SchemaGenerator;
use schemars::schema::Schema;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Job identifier assigned by Databricks on create
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct JobId(pub i64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where a job's task runs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ClusterRef {
    NewCluster(ClusterSpec),
    ExistingClusterId(String),
}

/// What a job or run executes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Task {
    SparkJarTask(SparkJarTask),
    NotebookTask(NotebookTask),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct SparkJarTask {
    pub main_class_name: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameters: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct NotebookTask {
    pub notebook_path: String,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub base_parameters: BTreeMap<String, String>,
}

impl Task {
    pub fn spark_jar(main_class_name: &str) -> Self {
        Self::SparkJarTask(SparkJarTask {
            main_class_name: main_class_name.to_string(),
            parameters: Vec::new(),
        })
    }

    pub fn notebook(notebook_path: &str) -> Self {
        Self::NotebookTask(NotebookTask {
            notebook_path: notebook_path.to_string(),
            base_parameters: BTreeMap::new(),
        })
    }

    fn validate(&self) -> Result<(), ValidationError> {
        match self {
            Self::SparkJarTask(task) if task.main_class_name.trim().is_empty() => {
                Err(ValidationError::Empty("spark_jar_task.main_class_name"))
            }
            Self::NotebookTask(task) if task.notebook_path.trim().is_empty() => {
                Err(ValidationError::Empty("notebook_task.notebook_path"))
            }
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PauseStatus {
    Paused,
    Unpaused,
}

/// Cron trigger of a job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Schedule {
    /// Quartz syntax, e.g. `0 15 22 ? * *`
    #[serde(alias = "cron_expression")]
    pub quartz_cron_expression: String,

    /// Java timezone id, e.g. `America/Los_Angeles`
    pub timezone_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pause_status: Option<PauseStatus>,
}

/// Flat Databricks form of a job spec, as written in `Djob` resources.
///
/// Every union member is optional here; [`JobSpec`] is the validated form.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct JobSpecFields {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_cluster: Option<ClusterSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub existing_cluster_id: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub libraries: Vec<LibrarySpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<Schedule>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spark_jar_task: Option<SparkJarTask>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notebook_task: Option<NotebookTask>,
}

/// Validated job spec: exactly one cluster reference and exactly one task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "JobSpecFields", into = "JobSpecFields")]
pub struct JobSpec {
    pub cluster: ClusterRef,
    pub libraries: Vec<LibrarySpec>,
    pub timeout_seconds: Option<i32>,
    pub max_retries: Option<i32>,
    pub schedule: Option<Schedule>,
    pub task: Task,
}

impl JobSpec {
    pub fn new(cluster: ClusterRef, task: Task) -> Self {
        Self {
            cluster,
            libraries: Vec::new(),
            timeout_seconds: None,
            max_retries: None,
            schedule: None,
            task,
        }
    }

    pub fn with_library(mut self, library: LibrarySpec) -> Self {
        self.libraries.push(library);
        self
    }
}

impl TryFrom<JobSpecFields> for JobSpec {
    type Error = ValidationError;

    fn try_from(fields: JobSpecFields) -> Result<Self, Self::Error> {
        let cluster = cluster_ref(fields.new_cluster, fields.existing_cluster_id)?
            .ok_or(ValidationError::ExactlyOne("new_cluster, existing_cluster_id"))?;
        let task = task(fields.spark_jar_task, fields.notebook_task)?
            .ok_or(ValidationError::ExactlyOne("spark_jar_task, notebook_task"))?;
        validate_libraries(&fields.libraries)?;
        non_negative("timeout_seconds", fields.timeout_seconds)?;
        non_negative("max_retries", fields.max_retries)?;

        Ok(Self {
            cluster,
            libraries: fields.libraries,
            timeout_seconds: fields.timeout_seconds,
            max_retries: fields.max_retries,
            schedule: fields.schedule,
            task,
        })
    }
}

impl From<JobSpec> for JobSpecFields {
    fn from(spec: JobSpec) -> Self {
        let (new_cluster, existing_cluster_id) = match spec.cluster {
            ClusterRef::NewCluster(cluster) => (Some(cluster), None),
            ClusterRef::ExistingClusterId(id) => (None, Some(id)),
        };
        let (spark_jar_task, notebook_task) = match spec.task {
            Task::SparkJarTask(task) => (Some(task), None),
            Task::NotebookTask(task) => (None, Some(task)),
        };
        Self {
            new_cluster,
            existing_cluster_id,
            libraries: spec.libraries,
            timeout_seconds: spec.timeout_seconds,
            max_retries: spec.max_retries,
            schedule: spec.schedule,
            spark_jar_task,
            notebook_task,
        }
    }
}

impl JsonSchema for JobSpec {
    fn schema_name() -> String {
        JobSpecFields::schema_name()
    }

    fn json_schema(gen: &mut SchemaGenerator) -> Schema {
        JobSpecFields::json_schema(gen)
    }
}

/// Picks the single cluster reference, `None` when neither is set.
pub(crate) fn cluster_ref(
    new_cluster: Option<ClusterSpec>,
    existing_cluster_id: Option<String>,
) -> Result<Option<ClusterRef>, ValidationError> {
    match (new_cluster, existing_cluster_id) {
        (Some(_), Some(_)) => Err(ValidationError::ExactlyOne("new_cluster, existing_cluster_id")),
        (Some(cluster), None) => {
            cluster.validate()?;
            Ok(Some(ClusterRef::NewCluster(cluster)))
        }
        (None, Some(id)) if id.trim().is_empty() => Err(ValidationError::Empty("existing_cluster_id")),
        (None, Some(id)) => Ok(Some(ClusterRef::ExistingClusterId(id))),
        (None, None) => Ok(None),
    }
}

/// Picks the single task, `None` when neither is set.
pub(crate) fn task(
    spark_jar_task: Option<SparkJarTask>,
    notebook_task: Option<NotebookTask>,
) -> Result<Option<Task>, ValidationError> {
    let task = match (spark_jar_task, notebook_task) {
        (Some(_), Some(_)) => return Err(ValidationError::ExactlyOne("spark_jar_task, notebook_task")),
        (Some(task), None) => Task::SparkJarTask(task),
        (None, Some(task)) => Task::NotebookTask(task),
        (None, None) => return Ok(None),
    };
    task.validate()?;
    Ok(Some(task))
}

pub(crate) fn validate_libraries(libraries: &[LibrarySpec]) -> Result<(), ValidationError> {
    libraries.iter().try_for_each(LibrarySpec::validate)
}

pub(crate) fn non_negative(field: &'static str, value: Option<i32>) -> Result<(), ValidationError> {
    match value {
        Some(value) if value < 0 => Err(ValidationError::Negative {
            field,
            value: value.into(),
        }),
        _ => Ok(()),
    }
}

/// Observed job, as returned by `jobs/get`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct JobInfo {
    pub job_id: JobId,

    #[serde(default)]
    pub settings: JobSettingsSummary,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_time: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creator_user_name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct JobSettingsSummary {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pipeline_job() -> serde_json::Value {
        json!({
            "new_cluster": {
                "spark_version": "5.3.x-scala2.11",
                "node_type_id": "Standard_D3_v2",
                "num_workers": 2
            },
            "libraries": [
                { "jar": "dbfs:/my-jar.jar" },
                { "maven": { "coordinates": "org.jsoup:jsoup:1.7.2" } }
            ],
            "timeout_seconds": 3600,
            "max_retries": 1,
            "schedule": {
                "quartz_cron_expression": "0 15 22 ? * *",
                "timezone_id": "America/Los_Angeles"
            },
            "spark_jar_task": {
                "main_class_name": "com.databricks.ComputeModels"
            }
        })
    }

    #[test]
    fn test_job_spec_from_pipeline_json() {
        let spec: JobSpec = serde_json::from_value(pipeline_job()).unwrap();

        assert!(matches!(spec.cluster, ClusterRef::NewCluster(ref c) if c.num_workers == 2));
        assert_eq!(spec.libraries.len(), 2);
        assert_eq!(spec.timeout_seconds, Some(3600));
        assert_eq!(spec.task, Task::spark_jar("com.databricks.ComputeModels"));
        assert_eq!(
            spec.schedule.as_ref().map(|s| s.timezone_id.as_str()),
            Some("America/Los_Angeles")
        );

        // serializes back to the flat Databricks shape
        let value = serde_json::to_value(&spec).unwrap();
        assert!(value.get("new_cluster").is_some());
        assert!(value.get("spark_jar_task").is_some());
        assert!(value.get("cluster").is_none());
    }

    #[test]
    fn test_cron_expression_alias() {
        let schedule: Schedule = serde_json::from_value(json!({
            "cron_expression": "0 0 * * * ?",
            "timezone_id": "UTC"
        }))
        .unwrap();
        assert_eq!(schedule.quartz_cron_expression, "0 0 * * * ?");
    }

    #[test]
    fn test_both_cluster_references_rejected() {
        let mut value = pipeline_job();
        value["existing_cluster_id"] = json!("1234-567890-abcde123");

        let fields: JobSpecFields = serde_json::from_value(value).unwrap();
        assert_eq!(
            JobSpec::try_from(fields),
            Err(ValidationError::ExactlyOne("new_cluster, existing_cluster_id"))
        );
    }

    #[test]
    fn test_missing_task_rejected() {
        let mut value = pipeline_job();
        value.as_object_mut().unwrap().remove("spark_jar_task");

        let fields: JobSpecFields = serde_json::from_value(value).unwrap();
        assert_eq!(
            JobSpec::try_from(fields),
            Err(ValidationError::ExactlyOne("spark_jar_task, notebook_task"))
        );
    }

    #[test]
    fn test_existing_cluster_job() {
        let fields = JobSpecFields {
            existing_cluster_id: Some("1234-567890-abcde123".to_string()),
            notebook_task: Some(NotebookTask {
                notebook_path: "/Users/me/pi".to_string(),
                base_parameters: BTreeMap::new(),
            }),
            ..Default::default()
        };
        let spec = JobSpec::try_from(fields).unwrap();
        assert_eq!(
            spec.cluster,
            ClusterRef::ExistingClusterId("1234-567890-abcde123".to_string())
        );
        assert_eq!(spec.task, Task::notebook("/Users/me/pi"));
    }

    #[test]
    fn test_negative_retries_rejected() {
        let mut value = pipeline_job();
        value["max_retries"] = json!(-2);
        let fields: JobSpecFields = serde_json::from_value(value).unwrap();
        assert!(matches!(
            JobSpec::try_from(fields),
            Err(ValidationError::Negative { field: "max_retries", value: -2 })
        ));
    }
}
