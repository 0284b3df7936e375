//! In-memory resource store

use crate::{Desired, ResourceStore, Snapshot, StoreError, StoreResult};
use databricks_api::{Fingerprint, ResourceKey, ResourceKind, ResourceSpec, ResourceStatus};
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;

struct Entry {
    desired: Desired,
    generation: u64,
    fingerprint: Fingerprint,
    status: Arc<ResourceStatus>,
}

impl Entry {
    fn snapshot(&self, key: &ResourceKey) -> Snapshot {
        Snapshot {
            key: key.clone(),
            desired: self.desired.clone(),
            generation: self.generation,
            fingerprint: self.fingerprint.clone(),
            status: Arc::clone(&self.status),
        }
    }
}

/// Resource store held in process memory.
///
/// The lock is only held for map operations; statuses are shared as `Arc`s
/// so readers never observe a half-written document.
#[derive(Default)]
pub struct InMemoryStore {
    entries: RwLock<BTreeMap<ResourceKey, Entry>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<ResourceKey, Entry>> {
        self.entries.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<ResourceKey, Entry>> {
        self.entries.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Set the desired state, bumping the generation only on a new fingerprint
    fn set_desired(&self, key: &ResourceKey, desired: Desired, fingerprint: Fingerprint) -> u64 {
        let mut entries = self.write();
        if let Some(entry) = entries.get_mut(key) {
            return entry.update(key, desired, fingerprint);
        }
        entries.insert(
            key.clone(),
            Entry {
                desired,
                generation: 1,
                fingerprint,
                status: Arc::new(ResourceStatus::default()),
            },
        );
        debug!(%key, "resource registered");
        1
    }
}

impl Entry {
    fn update(&mut self, key: &ResourceKey, desired: Desired, fingerprint: Fingerprint) -> u64 {
        if self.fingerprint != fingerprint {
            self.generation += 1;
            self.desired = desired;
            self.fingerprint = fingerprint;
            debug!(%key, generation = self.generation, "desired state changed");
        }
        self.generation
    }
}

impl ResourceStore for InMemoryStore {
    fn apply(&self, key: &ResourceKey, spec: ResourceSpec) -> StoreResult<u64> {
        if spec.kind() != key.kind {
            return Err(StoreError::KindMismatch {
                key: key.clone(),
                spec: spec.kind(),
            });
        }
        let fingerprint = spec.fingerprint()?;
        Ok(self.set_desired(key, Desired::Present(Arc::new(spec)), fingerprint))
    }

    fn apply_invalid(&self, key: &ResourceKey, reason: &str) -> StoreResult<u64> {
        Ok(self.set_desired(
            key,
            Desired::Invalid(reason.to_string()),
            Fingerprint::invalid(reason),
        ))
    }

    fn request_delete(&self, key: &ResourceKey) -> StoreResult<u64> {
        let mut entries = self.write();
        let entry = entries
            .get_mut(key)
            .ok_or_else(|| StoreError::NotFound(key.clone()))?;
        Ok(entry.update(key, Desired::Absent, Fingerprint::absent()))
    }

    fn get(&self, key: &ResourceKey) -> Option<Snapshot> {
        self.read().get(key).map(|entry| entry.snapshot(key))
    }

    fn list(&self, kind: Option<ResourceKind>) -> Vec<Snapshot> {
        self.read()
            .iter()
            .filter(|(key, _)| kind.map_or(true, |kind| key.kind == kind))
            .map(|(key, entry)| entry.snapshot(key))
            .collect()
    }

    fn keys(&self) -> Vec<ResourceKey> {
        self.read().keys().cloned().collect()
    }

    fn desired_fingerprint(&self, key: &ResourceKey) -> Option<Fingerprint> {
        self.read().get(key).map(|entry| entry.fingerprint.clone())
    }

    fn commit_status(
        &self,
        key: &ResourceKey,
        expected_revision: u64,
        mut status: ResourceStatus,
    ) -> StoreResult<u64> {
        let mut entries = self.write();
        let entry = entries
            .get_mut(key)
            .ok_or_else(|| StoreError::NotFound(key.clone()))?;

        let actual = entry.status.revision;
        if actual != expected_revision {
            return Err(StoreError::StaleGeneration {
                key: key.clone(),
                expected: expected_revision,
                actual,
            });
        }

        status.revision = actual + 1;
        entry.status = Arc::new(status);
        Ok(actual + 1)
    }

    fn forget(&self, key: &ResourceKey) -> bool {
        self.write().remove(key).is_some()
    }
}
