//! Projection of reconcile status onto the documents pipelines poll.
//!
//! Everything here is pure: the same key and status always give the same
//! document, and missing fields come out as [`Projection::Unset`] instead of
//! an error since consumers poll long before the fields exist.

use crate::condition::{normalize_path, scalar, Condition, Operator, Requirement};
use databricks_api::{
    ClusterResourceStatus, JobResourceStatus, JobStatus, ProjectedStatus, RemoteState, ResourceKey,
    ResourceKind, ResourceStatus, RunResourceStatus,
};
use serde_json::{json, Value};
use std::collections::BTreeMap;

/// Result of looking up a field path
#[derive(Debug, Clone, PartialEq)]
pub enum Projection {
    Value(Value),
    Unset,
}

impl Projection {
    pub fn is_unset(&self) -> bool {
        matches!(self, Self::Unset)
    }

    /// Value as a pipeline output string
    pub fn as_text(&self) -> Option<String> {
        match self {
            Self::Value(value) => Some(scalar(value)),
            Self::Unset => None,
        }
    }
}

/// Looks up a dot path such as `status.cluster_info.state`.
/// Absent intermediate fields and nulls are `Unset`.
pub fn lookup(document: &Value, path: &str) -> Projection {
    let path = normalize_path(path);
    let mut current = document;
    for segment in path.split('.').filter(|s| !s.is_empty()) {
        let next = match current {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        };
        match next {
            Some(value) => current = value,
            None => return Projection::Unset,
        }
    }
    match current {
        Value::Null => Projection::Unset,
        value => Projection::Value(value.clone()),
    }
}

/// Typed status document of one resource
pub fn project(key: &ResourceKey, status: &ResourceStatus) -> ProjectedStatus {
    let summary = status.summary();
    match key.kind {
        ResourceKind::Cluster => ProjectedStatus::Cluster(ClusterResourceStatus {
            summary,
            cluster_info: match &status.remote {
                Some(RemoteState::Cluster(info)) => Some(info.clone()),
                _ => None,
            },
        }),
        ResourceKind::Job => ProjectedStatus::Job(JobResourceStatus {
            summary,
            job_status: match &status.remote {
                Some(RemoteState::Job(info)) => Some(JobStatus::from(info)),
                _ => None,
            },
        }),
        ResourceKind::Run => {
            let output = match &status.remote {
                Some(RemoteState::Run(output)) => Some(output),
                _ => None,
            };
            ProjectedStatus::Run(RunResourceStatus {
                summary,
                metadata: output.map(|o| o.metadata.clone()),
                notebook_output: output.and_then(|o| o.notebook_output.clone()),
                error: output.and_then(|o| o.error.clone()),
            })
        }
    }
}

/// Full document as seen by pipelines: `{kind, metadata: {name, namespace}, status}`
pub fn document(key: &ResourceKey, status: &ResourceStatus) -> Result<Value, serde_json::Error> {
    Ok(json!({
        "kind": key.kind.crd_kind(),
        "metadata": {
            "name": key.name,
            "namespace": key.namespace,
        },
        "status": project(key, status).to_value()?,
    }))
}

/// Fills `{.path}` placeholders, e.g.
/// `job-{.status.metadata.job_id}-run-{.status.metadata.number_in_job}`.
/// `None` while any referenced field is unset.
pub fn render(document: &Value, template: &str) -> Option<String> {
    let mut output = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        output.push_str(&rest[..start]);
        let end = rest[start..].find('}')? + start;
        output.push_str(&lookup(document, &rest[start + 1..end]).as_text()?);
        rest = &rest[end + 1..];
    }
    output.push_str(rest);
    Some(output)
}

/// Output names and templates consumed by pipelines, per kind
pub fn attribute_outputs(kind: ResourceKind) -> &'static [(&'static str, &'static str)] {
    match kind {
        ResourceKind::Cluster => &[
            ("name", "{.metadata.name}"),
            ("cluster_name", "{.status.cluster_info.cluster_name}"),
            ("cluster_id", "{.status.cluster_info.cluster_id}"),
            ("state", "{.status.cluster_info.state}"),
            ("phase", "{.status.phase}"),
        ],
        ResourceKind::Job => &[
            ("name", "{.metadata.name}"),
            ("job_name", "{.metadata.name}"),
            ("job_id", "{.status.job_status.job_id}"),
            ("phase", "{.status.phase}"),
        ],
        ResourceKind::Run => &[
            ("name", "job-{.status.metadata.job_id}-run-{.status.metadata.number_in_job}"),
            ("job_id", "{.status.metadata.job_id}"),
            ("number_in_job", "{.status.metadata.number_in_job}"),
            ("run_id", "{.status.metadata.run_id}"),
            ("run_name", "{.status.metadata.run_name}"),
            ("life_cycle_state", "{.status.metadata.state.life_cycle_state}"),
            ("result_state", "{.status.metadata.state.result_state}"),
            ("notebook_output_result", "{.status.notebook_output.result}"),
            ("notebook_output_truncated", "{.status.notebook_output.truncated}"),
            ("error", "{.status.error}"),
            ("phase", "{.status.phase}"),
        ],
    }
}

/// Rendered attribute outputs, `None` for outputs not available yet
pub fn outputs(document: &Value, kind: ResourceKind) -> BTreeMap<&'static str, Option<String>> {
    attribute_outputs(kind)
        .iter()
        .map(|(name, template)| (*name, render(document, template)))
        .collect()
}

/// Condition under which a resource of `kind` counts as ready
pub fn readiness(kind: ResourceKind) -> Condition {
    let requirement = match kind {
        ResourceKind::Cluster => Requirement::new(
            "status.cluster_info.state",
            Operator::In,
            &["RUNNING", "RESIZING"],
        ),
        ResourceKind::Job => Requirement::new("status.job_status.job_id", Operator::Gt, &["0"]),
        ResourceKind::Run => Requirement::new(
            "status.metadata.state.life_cycle_state",
            Operator::NotIn,
            &["PENDING", "QUEUED", "BLOCKED", "RUNNING", "TERMINATING", "WAITING_FOR_RETRY"],
        ),
    };
    Condition::new(vec![requirement])
}

/// Evaluates the readiness condition on the projected document
pub fn is_ready(key: &ResourceKey, status: &ResourceStatus) -> Result<bool, serde_json::Error> {
    Ok(readiness(key.kind).evaluate(&document(key, status)?))
}
