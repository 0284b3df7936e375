//! # Databricks resource store
//!
//! Keyed desired-state and status store shared by the watch bridge and
//! the reconcilers. Desired specs are set by the watch bridge, status is
//! written only by the reconciler owning a key, as a whole-document
//! replacement guarded by a revision check.

pub mod memory;

pub use memory::InMemoryStore;

use databricks_api::{Fingerprint, ResourceKey, ResourceKind, ResourceSpec, ResourceStatus};
use std::sync::Arc;

/// Store result type
pub type StoreResult<T> = Result<T, StoreError>;

/// Store error types
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("Resource not found: {0}")]
    NotFound(ResourceKey),

    /// The status changed since it was read
    #[error("Stale status for {key}: expected revision {expected}, found {actual}")]
    StaleGeneration {
        key: ResourceKey,
        expected: u64,
        actual: u64,
    },

    #[error("Spec of kind {spec} stored under {key}")]
    KindMismatch { key: ResourceKey, spec: ResourceKind },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// What the resource should look like on the Databricks side
#[derive(Debug, Clone, PartialEq)]
pub enum Desired {
    Present(Arc<ResourceSpec>),
    /// Present, but the spec failed local validation
    Invalid(String),
    Absent,
}

impl Desired {
    pub fn spec(&self) -> Option<&ResourceSpec> {
        match self {
            Self::Present(spec) => Some(spec),
            _ => None,
        }
    }

    pub fn is_absent(&self) -> bool {
        matches!(self, Self::Absent)
    }
}

/// Consistent view of one resource at the time of reading
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub key: ResourceKey,
    pub desired: Desired,
    /// Bumped whenever the desired fingerprint changes
    pub generation: u64,
    pub fingerprint: Fingerprint,
    pub status: Arc<ResourceStatus>,
}

/// Resource store trait
pub trait ResourceStore: Send + Sync {
    /// Set the desired spec, returns the desired generation
    fn apply(&self, key: &ResourceKey, spec: ResourceSpec) -> StoreResult<u64>;

    /// Record a desired spec that failed validation
    fn apply_invalid(&self, key: &ResourceKey, reason: &str) -> StoreResult<u64>;

    /// Mark the resource for deletion
    fn request_delete(&self, key: &ResourceKey) -> StoreResult<u64>;

    fn get(&self, key: &ResourceKey) -> Option<Snapshot>;

    /// All resources, optionally of one kind, ordered by key
    fn list(&self, kind: Option<ResourceKind>) -> Vec<Snapshot>;

    fn keys(&self) -> Vec<ResourceKey>;

    fn desired_fingerprint(&self, key: &ResourceKey) -> Option<Fingerprint>;

    /// Replace the status if its revision is still `expected_revision`.
    /// Returns the new revision.
    fn commit_status(
        &self,
        key: &ResourceKey,
        expected_revision: u64,
        status: ResourceStatus,
    ) -> StoreResult<u64>;

    /// Drop the entry, returns whether it existed
    fn forget(&self, key: &ResourceKey) -> bool;
}
