//! One-time run submission and the Databricks run lifecycle

use crate::job::{cluster_ref, non_negative, task, validate_libraries};
use crate::{ClusterRef, ClusterSpec, JobId, LibrarySpec, NotebookTask, SparkJarTask, Task, ValidationError};
use schemars::gen::SchemaGenerator;
use schemars::schema::Schema;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Run identifier assigned by Databricks on submit
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct RunId(pub i64);

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a run executes on: a fresh cluster, an existing one, or an existing
/// `Djob` referenced by name (triggered with run-now).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum RunTarget {
    NewCluster(ClusterSpec),
    ExistingClusterId(String),
    JobName(String),
}

/// Flat Databricks form of a run submission, as written in `Run` resources
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RunSpecFields {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_cluster: Option<ClusterSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub existing_cluster_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_name: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub libraries: Vec<LibrarySpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spark_jar_task: Option<SparkJarTask>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notebook_task: Option<NotebookTask>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<i32>,
}

/// Validated run submission
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RunSpecFields", into = "RunSpecFields")]
pub struct RunSpec {
    pub target: RunTarget,
    pub libraries: Vec<LibrarySpec>,
    /// Required unless `target` is a job name
    pub task: Option<Task>,
    pub timeout_seconds: Option<i32>,
}

impl RunSpec {
    pub fn new(target: RunTarget, task: Option<Task>) -> Self {
        Self {
            target,
            libraries: Vec::new(),
            task,
            timeout_seconds: None,
        }
    }

    pub fn with_library(mut self, library: LibrarySpec) -> Self {
        self.libraries.push(library);
        self
    }

    /// Name of the referenced `Djob`, if this run triggers an existing job
    pub fn job_name(&self) -> Option<&str> {
        match &self.target {
            RunTarget::JobName(name) => Some(name),
            _ => None,
        }
    }
}

impl TryFrom<RunSpecFields> for RunSpec {
    type Error = ValidationError;

    fn try_from(fields: RunSpecFields) -> Result<Self, Self::Error> {
        const TARGETS: &str = "new_cluster, existing_cluster_id, job_name";

        let cluster = cluster_ref(fields.new_cluster, fields.existing_cluster_id)
            .map_err(|e| match e {
                ValidationError::ExactlyOne(_) => ValidationError::ExactlyOne(TARGETS),
                other => other,
            })?;
        let task = task(fields.spark_jar_task, fields.notebook_task)?;

        let target = match (cluster, fields.job_name) {
            (Some(_), Some(_)) => return Err(ValidationError::ExactlyOne(TARGETS)),
            (Some(ClusterRef::NewCluster(spec)), None) => RunTarget::NewCluster(spec),
            (Some(ClusterRef::ExistingClusterId(id)), None) => RunTarget::ExistingClusterId(id),
            (None, Some(name)) if name.trim().is_empty() => return Err(ValidationError::Empty("job_name")),
            (None, Some(name)) => RunTarget::JobName(name),
            (None, None) => return Err(ValidationError::ExactlyOne(TARGETS)),
        };

        match (&target, &task) {
            (RunTarget::JobName(name), Some(_)) => {
                return Err(ValidationError::TaskWithJobName(name.clone()))
            }
            (RunTarget::NewCluster(_) | RunTarget::ExistingClusterId(_), None) => {
                return Err(ValidationError::ExactlyOne("spark_jar_task, notebook_task"))
            }
            _ => {}
        }

        validate_libraries(&fields.libraries)?;
        non_negative("timeout_seconds", fields.timeout_seconds)?;

        Ok(Self {
            target,
            libraries: fields.libraries,
            task,
            timeout_seconds: fields.timeout_seconds,
        })
    }
}

impl From<RunSpec> for RunSpecFields {
    fn from(spec: RunSpec) -> Self {
        let mut fields = RunSpecFields {
            libraries: spec.libraries,
            timeout_seconds: spec.timeout_seconds,
            ..Default::default()
        };
        match spec.target {
            RunTarget::NewCluster(cluster) => fields.new_cluster = Some(cluster),
            RunTarget::ExistingClusterId(id) => fields.existing_cluster_id = Some(id),
            RunTarget::JobName(name) => fields.job_name = Some(name),
        }
        match spec.task {
            Some(Task::SparkJarTask(task)) => fields.spark_jar_task = Some(task),
            Some(Task::NotebookTask(task)) => fields.notebook_task = Some(task),
            None => {}
        }
        fields
    }
}

impl JsonSchema for RunSpec {
    fn schema_name() -> String {
        RunSpecFields::schema_name()
    }

    fn json_schema(gen: &mut SchemaGenerator) -> Schema {
        RunSpecFields::json_schema(gen)
    }
}

/// Whether a run has finished, in Databricks' own lifecycle order
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunLifeCycleState {
    Pending,
    Queued,
    Blocked,
    Running,
    Terminating,
    Terminated,
    Skipped,
    InternalError,
    WaitingForRetry,
    #[default]
    #[serde(other)]
    Unknown,
}

impl RunLifeCycleState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Terminated | Self::Skipped | Self::InternalError)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Queued => "QUEUED",
            Self::Blocked => "BLOCKED",
            Self::Running => "RUNNING",
            Self::Terminating => "TERMINATING",
            Self::Terminated => "TERMINATED",
            Self::Skipped => "SKIPPED",
            Self::InternalError => "INTERNAL_ERROR",
            Self::WaitingForRetry => "WAITING_FOR_RETRY",
            Self::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for RunLifeCycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a finished run succeeded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunResultState {
    Success,
    Failed,
    Timedout,
    Canceled,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RunState {
    #[serde(default)]
    pub life_cycle_state: RunLifeCycleState,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_state: Option<RunResultState>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_message: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RunMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<JobId>,

    pub run_id: RunId,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub number_in_job: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_name: Option<String>,

    #[serde(default)]
    pub state: RunState,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct NotebookOutput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,

    #[serde(default)]
    pub truncated: bool,
}

/// Observed run, as returned by `jobs/runs/get-output`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RunOutput {
    pub metadata: RunMetadata,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notebook_output: Option<NotebookOutput>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RunOutput {
    pub fn life_cycle_state(&self) -> RunLifeCycleState {
        self.metadata.state.life_cycle_state
    }

    pub fn is_terminal(&self) -> bool {
        self.life_cycle_state().is_terminal()
    }
}
