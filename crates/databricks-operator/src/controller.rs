//! # Kubernetes Controller
//!
//! Feeds custom resource watch events into the dispatcher and publishes
//! reconcile results back onto the resources.

use crate::crds::{all_crds, DatabricksResource, Dcluster, Djob, Run};
use crate::{OperatorError, OperatorResult};
use async_trait::async_trait;
use databricks_api::{Phase, ResourceKey, ResourceKind};
use databricks_reconciler::{projector, Dispatcher, StatusSink};
use databricks_store::Snapshot;
use futures::StreamExt;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, ApiResource, DynamicObject, Patch, PatchParams, PostParams, ResourceExt};
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use kube::{Client, Resource};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};

/// Finalizer holding a resource until its Databricks object is gone
pub const FINALIZER: &str = "databricks.microsoft.com/finalizer";

/// Finalizer list with ours added, `None` if already present
pub fn with_finalizer(finalizers: &[String]) -> Option<Vec<String>> {
    if finalizers.iter().any(|f| f == FINALIZER) {
        return None;
    }
    let mut finalizers = finalizers.to_vec();
    finalizers.push(FINALIZER.to_string());
    Some(finalizers)
}

/// Finalizer list with ours removed, `None` if it was not there
pub fn without_finalizer(finalizers: &[String]) -> Option<Vec<String>> {
    if !finalizers.iter().any(|f| f == FINALIZER) {
        return None;
    }
    Some(finalizers.iter().filter(|f| *f != FINALIZER).cloned().collect())
}

/// Watch bridge between the Kubernetes API and the dispatcher
pub struct WatchBridge {
    client: Client,
    dispatcher: Arc<Dispatcher>,
    namespace: Option<String>,
}

impl WatchBridge {
    pub fn new(client: Client, dispatcher: Arc<Dispatcher>, namespace: Option<String>) -> Self {
        Self {
            client,
            dispatcher,
            namespace,
        }
    }

    fn api<K: DatabricksResource>(&self) -> Api<K> {
        match &self.namespace {
            Some(namespace) => Api::namespaced(self.client.clone(), namespace),
            None => Api::all(self.client.clone()),
        }
    }

    /// Watches resources of kind `K` until the stream ends
    pub async fn run<K: DatabricksResource>(self: Arc<Self>) {
        let kind = K::KIND.crd_kind();
        info!(kind, namespace = ?self.namespace, "starting watcher");

        let mut events = watcher::watcher(self.api::<K>(), watcher::Config::default())
            .default_backoff()
            .boxed();
        while let Some(event) = events.next().await {
            match event {
                Ok(event) => self.handle(event).await,
                Err(e) => warn!(kind, error = %e, "watch stream error"),
            }
        }
        warn!(kind, "watch stream ended");
    }

    async fn handle<K: DatabricksResource>(&self, event: Event<K>) {
        match event {
            Event::Applied(resource) => self.applied(&resource).await,
            Event::Deleted(resource) => {
                let key = resource.key();
                if self.dispatcher.forget(&key) {
                    debug!(resource = %key, "resource removed");
                }
            }
            Event::Restarted(resources) => {
                let live: HashSet<ResourceKey> = resources.iter().map(K::key).collect();
                for snapshot in self.dispatcher.store().list(Some(K::KIND)) {
                    if !live.contains(&snapshot.key) {
                        debug!(resource = %snapshot.key, "resource gone during restart");
                        self.dispatcher.forget(&snapshot.key);
                    }
                }
                for resource in &resources {
                    self.applied(resource).await;
                }
            }
        }
    }

    async fn applied<K: DatabricksResource>(&self, resource: &K) {
        if let Err(e) = self.sync(resource).await {
            error!(resource = %resource.key(), error = %e, "failed to sync resource");
        }
    }

    async fn sync<K: DatabricksResource>(&self, resource: &K) -> OperatorResult<()> {
        let key = resource.key();
        let deleting = resource.meta().deletion_timestamp.is_some();
        let finalized = resource.finalizers().iter().any(|f| f == FINALIZER);
        let known = self.dispatcher.store().get(&key).is_some();

        if deleting {
            if !finalized {
                return Ok(());
            }
            if known {
                self.dispatcher.delete(&key)?;
                return Ok(());
            }
        } else if let Some(finalizers) = with_finalizer(resource.finalizers()) {
            let api: Api<K> = Api::namespaced(self.client.clone(), &key.namespace);
            let patch = json!({ "metadata": { "finalizers": finalizers } });
            api.patch(&key.name, &PatchParams::default(), &Patch::Merge(&patch))
                .await?;
            debug!(resource = %key, "added finalizer");
        }

        match resource.desired() {
            Ok(spec) => self.dispatcher.apply(&key, spec)?,
            Err(e) => {
                warn!(resource = %key, error = %e, "invalid spec");
                self.dispatcher.apply_invalid(&key, &e.to_string())?
            }
        };
        if !known {
            if let Some(id) = resource.recorded_remote_id() {
                self.dispatcher
                    .recover(&key, id, resource.recorded_fingerprint())?;
            }
        }
        if deleting {
            self.dispatcher.delete(&key)?;
        }
        Ok(())
    }
}

/// Publishes projected statuses onto the custom resources and releases the
/// finalizer once a deleted resource is gone from Databricks
pub struct KubeStatusSink {
    client: Client,
    published: Mutex<HashMap<ResourceKey, Value>>,
}

impl KubeStatusSink {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            published: Mutex::new(HashMap::new()),
        }
    }

    fn api(&self, key: &ResourceKey) -> Api<DynamicObject> {
        let resource = match key.kind {
            ResourceKind::Cluster => ApiResource::erase::<Dcluster>(&()),
            ResourceKind::Job => ApiResource::erase::<Djob>(&()),
            ResourceKind::Run => ApiResource::erase::<Run>(&()),
        };
        Api::namespaced_with(self.client.clone(), &key.namespace, &resource)
    }

    fn published(&self) -> std::sync::MutexGuard<'_, HashMap<ResourceKey, Value>> {
        self.published.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn try_publish(&self, snapshot: &Snapshot) -> OperatorResult<()> {
        let key = &snapshot.key;
        let api = self.api(key);

        let status = projector::project(key, &snapshot.status).to_value()?;
        let unchanged = self.published().get(key) == Some(&status);
        if !unchanged {
            let patch = json!({ "status": status });
            api.patch_status(&key.name, &PatchParams::default(), &Patch::Merge(&patch))
                .await?;
            self.published().insert(key.clone(), status);
        }

        if snapshot.desired.is_absent() && snapshot.status.phase == Phase::Absent {
            self.release(&api, key).await?;
        }
        Ok(())
    }

    async fn release(&self, api: &Api<DynamicObject>, key: &ResourceKey) -> OperatorResult<()> {
        self.published().remove(key);
        let Some(object) = api.get_opt(&key.name).await? else {
            return Ok(());
        };
        let Some(finalizers) = without_finalizer(object.finalizers()) else {
            return Ok(());
        };

        let patch = json!({
            "metadata": {
                "resourceVersion": object.resource_version(),
                "finalizers": finalizers,
            }
        });
        api.patch(&key.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        info!(resource = %key, "released finalizer");
        Ok(())
    }
}

#[async_trait]
impl StatusSink for KubeStatusSink {
    async fn publish(&self, snapshot: &Snapshot) {
        match self.try_publish(snapshot).await {
            Ok(()) => {}
            Err(OperatorError::Kube(kube::Error::Api(response))) if response.code == 404 => {
                debug!(resource = %snapshot.key, "resource already gone");
            }
            Err(e) => warn!(resource = %snapshot.key, error = %e, "failed to publish status"),
        }
    }
}

/// Creates the custom resource definitions that do not exist yet
pub async fn install_crds(client: &Client) -> OperatorResult<()> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    for crd in all_crds() {
        let name = crd.name_any();
        match crds.get(&name).await {
            Ok(_) => debug!("CRD {} already exists", name),
            Err(kube::Error::Api(e)) if e.code == 404 => {
                info!("Installing CRD {}", name);
                crds.create(&PostParams::default(), &crd).await?;
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}
