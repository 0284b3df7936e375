//! # Custom Resource Definitions
//!
//! `Dcluster`, `Djob` and `Run` resources of `databricks.microsoft.com/v1alpha1`.
//! Specs carry the flat Databricks JSON; validation happens when a resource is
//! turned into a [`ResourceSpec`], so a malformed spec surfaces as a
//! `CreateFailed` status instead of a watch error.

use databricks_api::{
    ClusterResourceStatus, ClusterSpec, Fingerprint, JobResourceStatus, JobSpec, JobSpecFields,
    ReconcileSummary, RemoteId, ResourceKey, ResourceKind, ResourceSpec, RunResourceStatus,
    RunSpec, RunSpecFields, ValidationError,
};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use k8s_openapi::NamespaceResourceScope;
use kube::{CustomResource, CustomResourceExt, Resource, ResourceExt};
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;

/// Databricks cluster
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "databricks.microsoft.com",
    version = "v1alpha1",
    kind = "Dcluster",
    plural = "dclusters",
    shortname = "dcluster",
    namespaced
)]
#[kube(status = "ClusterResourceStatus")]
#[kube(printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#)]
#[kube(printcolumn = r#"{"name":"ClusterID","type":"string","jsonPath":".status.cluster_info.cluster_id"}"#)]
#[kube(printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.cluster_info.state"}"#)]
pub struct DclusterSpec {
    /// Name of the cluster in Databricks, defaults to the resource name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_name: Option<String>,

    #[serde(flatten)]
    pub cluster: ClusterSpec,
}

/// Databricks job
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "databricks.microsoft.com",
    version = "v1alpha1",
    kind = "Djob",
    plural = "djobs",
    shortname = "djob",
    namespaced
)]
#[kube(status = "JobResourceStatus")]
#[kube(printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#)]
#[kube(printcolumn = r#"{"name":"JobID","type":"integer","jsonPath":".status.job_status.job_id"}"#)]
pub struct DjobSpec {
    /// Name of the job in Databricks, defaults to the resource name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_name: Option<String>,

    #[serde(flatten)]
    pub fields: JobSpecFields,
}

/// One-time Databricks run, either submitted directly or triggered on a `Djob`
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "databricks.microsoft.com",
    version = "v1alpha1",
    kind = "Run",
    plural = "runs",
    namespaced
)]
#[kube(status = "RunResourceStatus")]
#[kube(printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#)]
#[kube(printcolumn = r#"{"name":"RunID","type":"integer","jsonPath":".status.metadata.run_id"}"#)]
#[kube(printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.metadata.state.life_cycle_state"}"#)]
pub struct RunObjectSpec {
    /// Name of the run in Databricks, defaults to the resource name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_name: Option<String>,

    #[serde(flatten)]
    pub fields: RunSpecFields,
}

/// A custom resource reconciled against Databricks
pub trait DatabricksResource:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + CustomResourceExt
    + Clone
    + Debug
    + DeserializeOwned
    + Serialize
    + Send
    + Sync
    + 'static
{
    const KIND: ResourceKind;

    /// Validated desired spec
    fn desired(&self) -> Result<ResourceSpec, ValidationError>;

    /// Remote id published in the status by an earlier reconcile
    fn recorded_remote_id(&self) -> Option<RemoteId>;

    fn recorded_summary(&self) -> Option<&ReconcileSummary>;

    /// Fingerprint of the spec an earlier reconcile pushed to Databricks
    fn recorded_fingerprint(&self) -> Option<Fingerprint> {
        let digest = self.recorded_summary()?.applied_fingerprint.as_deref()?;
        (!digest.is_empty()).then(|| Fingerprint::from_recorded(digest))
    }

    fn key(&self) -> ResourceKey {
        ResourceKey::new(
            Self::KIND,
            &self.namespace().unwrap_or_else(|| "default".to_string()),
            &self.name_any(),
        )
    }
}

fn remote_name(explicit: &Option<String>, resource: &impl ResourceExt) -> String {
    explicit
        .as_deref()
        .filter(|name| !name.trim().is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| resource.name_any())
}

impl DatabricksResource for Dcluster {
    const KIND: ResourceKind = ResourceKind::Cluster;

    fn desired(&self) -> Result<ResourceSpec, ValidationError> {
        let name = remote_name(&self.spec.cluster_name, self);
        let spec = ResourceSpec::cluster(&name, self.spec.cluster.clone());
        spec.validate()?;
        Ok(spec)
    }

    fn recorded_remote_id(&self) -> Option<RemoteId> {
        let info = self.status.as_ref()?.cluster_info.as_ref()?;
        (!info.cluster_id.0.is_empty()).then(|| RemoteId::Cluster(info.cluster_id.clone()))
    }

    fn recorded_summary(&self) -> Option<&ReconcileSummary> {
        self.status.as_ref().map(|status| &status.summary)
    }
}

impl DatabricksResource for Djob {
    const KIND: ResourceKind = ResourceKind::Job;

    fn desired(&self) -> Result<ResourceSpec, ValidationError> {
        let name = remote_name(&self.spec.job_name, self);
        let spec = ResourceSpec::job(&name, JobSpec::try_from(self.spec.fields.clone())?);
        spec.validate()?;
        Ok(spec)
    }

    fn recorded_remote_id(&self) -> Option<RemoteId> {
        let job = self.status.as_ref()?.job_status.as_ref()?;
        (job.job_id.0 > 0).then_some(RemoteId::Job(job.job_id))
    }

    fn recorded_summary(&self) -> Option<&ReconcileSummary> {
        self.status.as_ref().map(|status| &status.summary)
    }
}

impl DatabricksResource for Run {
    const KIND: ResourceKind = ResourceKind::Run;

    fn desired(&self) -> Result<ResourceSpec, ValidationError> {
        let name = remote_name(&self.spec.run_name, self);
        let spec = ResourceSpec::run(&name, RunSpec::try_from(self.spec.fields.clone())?);
        spec.validate()?;
        Ok(spec)
    }

    fn recorded_remote_id(&self) -> Option<RemoteId> {
        let metadata = self.status.as_ref()?.metadata.as_ref()?;
        (metadata.run_id.0 > 0).then_some(RemoteId::Run(metadata.run_id))
    }

    fn recorded_summary(&self) -> Option<&ReconcileSummary> {
        self.status.as_ref().map(|status| &status.summary)
    }
}

/// Definitions of all three resources
pub fn all_crds() -> Vec<CustomResourceDefinition> {
    vec![Dcluster::crd(), Djob::crd(), Run::crd()]
}

/// All definitions as a multi-document YAML stream
pub fn crds_yaml() -> Result<String, serde_yaml::Error> {
    let mut output = String::new();
    for crd in all_crds() {
        output.push_str("---\n");
        output.push_str(&serde_yaml::to_string(&crd)?);
    }
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use databricks_api::{ClusterRef, JobId, JobStatus, RunTarget, Task};
    use serde_json::json;

    fn object<K: DeserializeOwned>(kind: &str, name: &str, spec: serde_json::Value) -> K {
        serde_json::from_value(json!({
            "apiVersion": "databricks.microsoft.com/v1alpha1",
            "kind": kind,
            "metadata": { "name": name, "namespace": "default" },
            "spec": spec,
        }))
        .unwrap()
    }

    #[test]
    fn test_crd_generation() {
        let crd = Dcluster::crd();
        assert_eq!(crd.metadata.name.as_deref(), Some("dclusters.databricks.microsoft.com"));
        assert_eq!(crd.spec.group, "databricks.microsoft.com");
        assert_eq!(crd.spec.names.kind, "Dcluster");
        assert_eq!(crd.spec.versions[0].name, "v1alpha1");

        assert_eq!(Djob::crd().spec.names.plural, "djobs");
        assert_eq!(Run::crd().spec.names.kind, "Run");
    }

    #[test]
    fn test_crds_yaml_has_three_documents() {
        let yaml = crds_yaml().unwrap();
        assert_eq!(yaml.matches("---\n").count(), 3);
        assert!(yaml.contains("name: runs.databricks.microsoft.com"));
    }

    #[test]
    fn test_dcluster_conversion() {
        let cluster: Dcluster = object(
            "Dcluster",
            "dcluster-interactive1",
            json!({
                "spark_version": "5.3.x-scala2.11",
                "node_type_id": "Standard_D3_v2",
                "num_workers": 2,
                "spark_conf": { "spark.speculation": true }
            }),
        );

        let key = cluster.key();
        assert_eq!(key, ResourceKey::cluster("default", "dcluster-interactive1"));
        let ResourceSpec::Cluster(spec) = cluster.desired().unwrap() else {
            panic!("expected a cluster spec");
        };
        assert_eq!(spec.cluster_name, "dcluster-interactive1");
        assert_eq!(spec.spec.spark_conf["spark.speculation"], "true");
        assert!(cluster.recorded_remote_id().is_none());
    }

    #[test]
    fn test_djob_conversion() {
        let job: Djob = object(
            "Djob",
            "test-job",
            json!({
                "job_name": "nightly",
                "existing_cluster_id": "1201-my-cluster",
                "spark_jar_task": { "main_class_name": "com.databricks.ComputeModels" },
                "libraries": [{ "jar": "dbfs:/my-jar.jar" }],
                "timeout_seconds": 3600
            }),
        );

        let ResourceSpec::Job(spec) = job.desired().unwrap() else {
            panic!("expected a job spec");
        };
        assert_eq!(spec.job_name, "nightly");
        assert_eq!(
            spec.spec.cluster,
            ClusterRef::ExistingClusterId("1201-my-cluster".into())
        );
        assert_eq!(spec.spec.task, Task::spark_jar("com.databricks.ComputeModels"));
    }

    #[test]
    fn test_djob_without_task_is_invalid() {
        let job: Djob = object(
            "Djob",
            "test-job",
            json!({ "existing_cluster_id": "1201-my-cluster" }),
        );
        assert_eq!(
            job.desired().unwrap_err(),
            ValidationError::ExactlyOne("spark_jar_task, notebook_task")
        );
    }

    #[test]
    fn test_run_conversion() {
        let run: Run = object("Run", "test-run", json!({ "job_name": "test-job" }));
        let ResourceSpec::Run(spec) = run.desired().unwrap() else {
            panic!("expected a run spec");
        };
        assert_eq!(spec.run_name, "test-run");
        assert_eq!(spec.spec.target, RunTarget::JobName("test-job".into()));

        let both: Run = object(
            "Run",
            "bad-run",
            json!({ "job_name": "test-job", "existing_cluster_id": "1201-my-cluster" }),
        );
        assert!(both.desired().is_err());
    }

    #[test]
    fn test_recorded_remote_id() {
        let mut job: Djob = object(
            "Djob",
            "test-job",
            json!({
                "existing_cluster_id": "1201-my-cluster",
                "notebook_task": { "notebook_path": "/Users/me/nb" }
            }),
        );
        job.status = Some(JobResourceStatus {
            job_status: Some(JobStatus {
                job_id: JobId(42),
                ..Default::default()
            }),
            ..Default::default()
        });
        assert_eq!(job.recorded_remote_id(), Some(RemoteId::Job(JobId(42))));
        assert_eq!(job.recorded_fingerprint(), None);
        assert_eq!(job.key(), ResourceKey::job("default", "test-job"));
    }

    #[test]
    fn test_recorded_fingerprint_read_from_status() {
        let mut cluster: Dcluster = object(
            "Dcluster",
            "test-cluster",
            json!({
                "spark_version": "5.3.x-scala2.11",
                "node_type_id": "Standard_D3_v2",
                "num_workers": 2
            }),
        );
        let applied = cluster.desired().unwrap().fingerprint().unwrap();
        cluster.status = Some(
            serde_json::from_value(json!({
                "phase": "Ready",
                "applied_fingerprint": applied.as_str(),
                "cluster_info": { "cluster_id": "0923-164208-meows279", "state": "RUNNING" }
            }))
            .unwrap(),
        );
        assert_eq!(cluster.recorded_fingerprint(), Some(applied));
        assert!(cluster.recorded_remote_id().is_some());
    }
}
