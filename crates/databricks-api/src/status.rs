//! Reconcile status and the status documents published on each resource

use crate::{
    ClusterInfo, Fingerprint, JobId, JobInfo, NotebookOutput, RemoteId, ResourceKind, RunMetadata,
    RunOutput,
};
use chrono::{DateTime, SecondsFormat, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Reconcile phase of a resource
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum Phase {
    #[default]
    Absent,
    Creating,
    Observed,
    Ready,
    Deleting,
    CreateFailed,
    DeleteFailed,
    ReconcileError,
}

impl Phase {
    /// Failure phases that stay put until the desired spec changes
    pub fn is_terminal_failure(&self) -> bool {
        matches!(self, Self::CreateFailed | Self::DeleteFailed | Self::ReconcileError)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Absent => "Absent",
            Self::Creating => "Creating",
            Self::Observed => "Observed",
            Self::Ready => "Ready",
            Self::Deleting => "Deleting",
            Self::CreateFailed => "CreateFailed",
            Self::DeleteFailed => "DeleteFailed",
            Self::ReconcileError => "ReconcileError",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Last observation of the remote object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteState {
    Cluster(ClusterInfo),
    Job(JobInfo),
    Run(RunOutput),
}

/// Status of one resource as held by the store. Replaced as a whole on
/// every commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceStatus {
    pub phase: Phase,
    pub remote_id: Option<RemoteId>,
    pub remote: Option<RemoteState>,
    /// Desired generation this status was computed from
    pub observed_generation: u64,
    /// Commit counter, set by the store
    pub revision: u64,
    /// Fingerprint of the spec last pushed to Databricks
    pub applied_fingerprint: Option<Fingerprint>,
    /// Consecutive retryable failures
    pub attempts: u32,
    pub message: Option<String>,
    pub last_transition: DateTime<Utc>,
}

impl Default for ResourceStatus {
    fn default() -> Self {
        Self {
            phase: Phase::Absent,
            remote_id: None,
            remote: None,
            observed_generation: 0,
            revision: 0,
            applied_fingerprint: None,
            attempts: 0,
            message: None,
            last_transition: Utc::now(),
        }
    }
}

impl ResourceStatus {
    /// Moves to `phase`, stamping the transition time only on change
    pub fn transition(mut self, phase: Phase) -> Self {
        if self.phase != phase {
            self.phase = phase;
            self.last_transition = Utc::now();
        }
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn without_message(mut self) -> Self {
        self.message = None;
        self
    }

    /// Drops the remote identifier and everything observed through it
    pub fn clear_remote(mut self) -> Self {
        self.remote_id = None;
        self.remote = None;
        self.applied_fingerprint = None;
        self
    }

    pub fn summary(&self) -> ReconcileSummary {
        ReconcileSummary {
            phase: self.phase,
            observed_generation: i64::try_from(self.observed_generation).unwrap_or(i64::MAX),
            attempts: self.attempts,
            message: self.message.clone(),
            applied_fingerprint: self
                .applied_fingerprint
                .as_ref()
                .map(|f| f.as_str().to_string()),
            last_transition: Some(
                self.last_transition
                    .to_rfc3339_opts(SecondsFormat::Secs, true),
            ),
        }
    }
}

/// Fields shared by every published status document
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ReconcileSummary {
    #[serde(default)]
    pub phase: Phase,

    #[serde(default)]
    pub observed_generation: i64,

    #[serde(default)]
    pub attempts: u32,

    #[serde(default)]
    pub message: Option<String>,

    /// Fingerprint of the spec last pushed to Databricks, read back after
    /// an operator restart
    #[serde(default)]
    pub applied_fingerprint: Option<String>,

    /// RFC 3339 timestamp of the last phase change
    #[serde(default)]
    pub last_transition: Option<String>,
}

/// `Dcluster` status
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ClusterResourceStatus {
    #[serde(flatten)]
    pub summary: ReconcileSummary,

    #[serde(default)]
    pub cluster_info: Option<ClusterInfo>,
}

/// Job identity as published under `status.job_status`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct JobStatus {
    pub job_id: JobId,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_time: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creator_user_name: Option<String>,
}

impl From<&JobInfo> for JobStatus {
    fn from(info: &JobInfo) -> Self {
        Self {
            job_id: info.job_id,
            job_name: info.settings.name.clone(),
            created_time: info.created_time,
            creator_user_name: info.creator_user_name.clone(),
        }
    }
}

/// `Djob` status
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct JobResourceStatus {
    #[serde(flatten)]
    pub summary: ReconcileSummary,

    #[serde(default)]
    pub job_status: Option<JobStatus>,
}

/// `Run` status
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RunResourceStatus {
    #[serde(flatten)]
    pub summary: ReconcileSummary,

    #[serde(default)]
    pub metadata: Option<RunMetadata>,

    #[serde(default)]
    pub notebook_output: Option<NotebookOutput>,

    #[serde(default)]
    pub error: Option<String>,
}

/// Status document of one resource, typed per kind
#[derive(Debug, Clone, PartialEq)]
pub enum ProjectedStatus {
    Cluster(ClusterResourceStatus),
    Job(JobResourceStatus),
    Run(RunResourceStatus),
}

impl ProjectedStatus {
    pub fn kind(&self) -> ResourceKind {
        match self {
            Self::Cluster(_) => ResourceKind::Cluster,
            Self::Job(_) => ResourceKind::Job,
            Self::Run(_) => ResourceKind::Run,
        }
    }

    pub fn summary(&self) -> &ReconcileSummary {
        match self {
            Self::Cluster(s) => &s.summary,
            Self::Job(s) => &s.summary,
            Self::Run(s) => &s.summary,
        }
    }

    pub fn to_value(&self) -> Result<serde_json::Value, serde_json::Error> {
        match self {
            Self::Cluster(s) => serde_json::to_value(s),
            Self::Job(s) => serde_json::to_value(s),
            Self::Run(s) => serde_json::to_value(s),
        }
    }
}
