//! Resource identity, desired specs and their fingerprints

use crate::{ClusterId, ClusterSpec, JobId, JobSpec, RunId, RunSpec, ValidationError};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Kind of reconciled resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Cluster,
    Job,
    Run,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 3] = [Self::Cluster, Self::Job, Self::Run];

    /// Kind name of the custom resource
    pub fn crd_kind(&self) -> &'static str {
        match self {
            Self::Cluster => "Dcluster",
            Self::Job => "Djob",
            Self::Run => "Run",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cluster => "cluster",
            Self::Job => "job",
            Self::Run => "run",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a resource: kind plus namespaced name
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKey {
    pub kind: ResourceKind,
    pub namespace: String,
    pub name: String,
}

impl ResourceKey {
    pub fn new(kind: ResourceKind, namespace: &str, name: &str) -> Self {
        Self {
            kind,
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    pub fn cluster(namespace: &str, name: &str) -> Self {
        Self::new(ResourceKind::Cluster, namespace, name)
    }

    pub fn job(namespace: &str, name: &str) -> Self {
        Self::new(ResourceKind::Job, namespace, name)
    }

    pub fn run(namespace: &str, name: &str) -> Self {
        Self::new(ResourceKind::Run, namespace, name)
    }

    /// Key of another kind in the same namespace
    pub fn sibling(&self, kind: ResourceKind, name: &str) -> Self {
        Self::new(kind, &self.namespace, name)
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.kind.crd_kind(), self.namespace, self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterResourceSpec {
    pub cluster_name: String,
    pub spec: ClusterSpec,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResourceSpec {
    pub job_name: String,
    pub spec: JobSpec,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResourceSpec {
    pub run_name: String,
    pub spec: RunSpec,
}

/// Validated desired spec of one resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResourceSpec {
    Cluster(ClusterResourceSpec),
    Job(JobResourceSpec),
    Run(RunResourceSpec),
}

impl ResourceSpec {
    pub fn cluster(cluster_name: &str, spec: ClusterSpec) -> Self {
        Self::Cluster(ClusterResourceSpec {
            cluster_name: cluster_name.to_string(),
            spec,
        })
    }

    pub fn job(job_name: &str, spec: JobSpec) -> Self {
        Self::Job(JobResourceSpec {
            job_name: job_name.to_string(),
            spec,
        })
    }

    pub fn run(run_name: &str, spec: RunSpec) -> Self {
        Self::Run(RunResourceSpec {
            run_name: run_name.to_string(),
            spec,
        })
    }

    pub fn kind(&self) -> ResourceKind {
        match self {
            Self::Cluster(_) => ResourceKind::Cluster,
            Self::Job(_) => ResourceKind::Job,
            Self::Run(_) => ResourceKind::Run,
        }
    }

    /// Name the resource carries on the Databricks side
    pub fn remote_name(&self) -> &str {
        match self {
            Self::Cluster(c) => &c.cluster_name,
            Self::Job(j) => &j.job_name,
            Self::Run(r) => &r.run_name,
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.remote_name().trim().is_empty() {
            return Err(ValidationError::Empty(match self {
                Self::Cluster(_) => "cluster_name",
                Self::Job(_) => "job_name",
                Self::Run(_) => "run_name",
            }));
        }
        match self {
            Self::Cluster(c) => c.spec.validate(),
            // Job and run specs are checked on conversion from their wire form
            Self::Job(_) | Self::Run(_) => Ok(()),
        }
    }

    /// Hash of the canonical JSON form. Maps are ordered, so equal specs
    /// always hash equal.
    pub fn fingerprint(&self) -> Result<Fingerprint, serde_json::Error> {
        let bytes = serde_json::to_vec(self)?;
        Ok(Fingerprint::of_bytes(&bytes))
    }
}

/// SHA-256 hex digest identifying one desired state
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn of_bytes(bytes: &[u8]) -> Self {
        Self(format!("{:x}", Sha256::digest(bytes)))
    }

    /// Fingerprint of "the resource should not exist"
    pub fn absent() -> Self {
        Self::of_bytes(b"absent")
    }

    pub fn invalid(reason: &str) -> Self {
        Self::of_bytes(format!("invalid:{reason}").as_bytes())
    }

    /// Digest read back from a published status
    pub fn from_recorded(digest: impl Into<String>) -> Self {
        Self(digest.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form for logs
        f.write_str(&self.0[..self.0.len().min(12)])
    }
}

/// Token sent with create calls so a retried create does not duplicate
/// the remote object. Fits the 64 character Databricks limit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    pub fn derive(key: &ResourceKey, generation: u64) -> Self {
        let seed = format!("{}/{}/{}/{}", key.kind, key.namespace, key.name, generation);
        Self(format!("{:x}", Sha256::digest(seed.as_bytes())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Remote identifier recorded for a resource
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteId {
    Cluster(ClusterId),
    Job(JobId),
    Run(RunId),
}

impl RemoteId {
    pub fn kind(&self) -> ResourceKind {
        match self {
            Self::Cluster(_) => ResourceKind::Cluster,
            Self::Job(_) => ResourceKind::Job,
            Self::Run(_) => ResourceKind::Run,
        }
    }
}

impl fmt::Display for RemoteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cluster(id) => write!(f, "cluster {id}"),
            Self::Job(id) => write!(f, "job {id}"),
            Self::Run(id) => write!(f, "run {id}"),
        }
    }
}
