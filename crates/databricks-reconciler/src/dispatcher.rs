//! Watch/event loop: desired-state updates, the worker pool and resync

use crate::{Outcome, Reconciler, ReconcilerConfig, WorkQueue};
use async_trait::async_trait;
use databricks_api::{Fingerprint, Phase, RemoteId, ResourceKey, ResourceKind, ResourceSpec};
use databricks_client::DatabricksClient;
use databricks_store::{ResourceStore, Snapshot, StoreError, StoreResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Receives the latest snapshot of a resource after each reconcile.
/// Calls for one key arrive in reconcile order.
#[async_trait]
pub trait StatusSink: Send + Sync {
    async fn publish(&self, snapshot: &Snapshot);
}

/// Dispatcher counters
#[derive(Debug, Default)]
pub struct DispatcherMetrics {
    reconciles: AtomicU64,
    failures: AtomicU64,
    in_flight: Mutex<HashMap<ResourceKey, usize>>,
    max_in_flight_per_key: AtomicUsize,
}

impl DispatcherMetrics {
    fn enter(&self, key: &ResourceKey) {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(|p| p.into_inner());
        let count = in_flight.entry(key.clone()).or_insert(0);
        *count += 1;
        self.max_in_flight_per_key.fetch_max(*count, Ordering::SeqCst);
    }

    fn exit(&self, key: &ResourceKey) {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(count) = in_flight.get_mut(key) {
            *count -= 1;
            if *count == 0 {
                in_flight.remove(key);
            }
        }
    }

    pub fn reconciles(&self) -> u64 {
        self.reconciles.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Highest number of concurrent reconciles seen for a single key
    pub fn max_in_flight_per_key(&self) -> usize {
        self.max_in_flight_per_key.load(Ordering::SeqCst)
    }
}

/// Point-in-time view of the dispatcher
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DispatcherReport {
    pub resources: usize,
    pub phases: BTreeMap<String, usize>,
    pub reconciles: u64,
    pub failures: u64,
    pub stale_discards: u64,
    pub queue_depth: usize,
    pub delayed: usize,
    pub max_in_flight_per_key: usize,
}

/// Owns the store, the reconciler and the work queue
pub struct Dispatcher {
    store: Arc<dyn ResourceStore>,
    reconciler: Reconciler,
    queue: WorkQueue<ResourceKey>,
    sinks: Vec<Arc<dyn StatusSink>>,
    metrics: DispatcherMetrics,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn ResourceStore>,
        client: Arc<dyn DatabricksClient>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            reconciler: Reconciler::new(Arc::clone(&store), client, config),
            store,
            queue: WorkQueue::new(),
            sinks: Vec::new(),
            metrics: DispatcherMetrics::default(),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn StatusSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn store(&self) -> &Arc<dyn ResourceStore> {
        &self.store
    }

    pub fn metrics(&self) -> &DispatcherMetrics {
        &self.metrics
    }

    pub fn config(&self) -> &ReconcilerConfig {
        self.reconciler.config()
    }

    /// Set the desired spec. A reconcile is scheduled when the spec is new
    /// or differs from the stored one; re-applying the same spec is left to
    /// the periodic resync.
    pub fn apply(&self, key: &ResourceKey, spec: ResourceSpec) -> StoreResult<u64> {
        let previous = self.generation(key);
        let generation = self.store.apply(key, spec)?;
        self.schedule_if_changed(key, previous, generation);
        Ok(generation)
    }

    pub fn apply_invalid(&self, key: &ResourceKey, reason: &str) -> StoreResult<u64> {
        let previous = self.generation(key);
        let generation = self.store.apply_invalid(key, reason)?;
        self.schedule_if_changed(key, previous, generation);
        Ok(generation)
    }

    /// Request deletion and schedule a reconcile
    pub fn delete(&self, key: &ResourceKey) -> StoreResult<u64> {
        let previous = self.generation(key);
        let generation = self.store.request_delete(key)?;
        self.schedule_if_changed(key, previous, generation);
        Ok(generation)
    }

    fn generation(&self, key: &ResourceKey) -> Option<u64> {
        self.store.get(key).map(|snapshot| snapshot.generation)
    }

    fn schedule_if_changed(&self, key: &ResourceKey, previous: Option<u64>, generation: u64) {
        if previous != Some(generation) {
            self.queue.add(key.clone());
        }
    }

    /// Drop a resource whose custom resource is gone
    pub fn forget(&self, key: &ResourceKey) -> bool {
        self.store.forget(key)
    }

    /// Seeds the remote id recorded by an earlier operator instance, so a
    /// restart observes the existing object instead of creating another.
    /// `applied` is the fingerprint that instance last pushed; without one
    /// the current desired spec counts as applied. Returns whether the id
    /// was taken.
    pub fn recover(
        &self,
        key: &ResourceKey,
        id: RemoteId,
        applied: Option<Fingerprint>,
    ) -> StoreResult<bool> {
        let Some(snapshot) = self.store.get(key) else {
            return Err(StoreError::NotFound(key.clone()));
        };
        if snapshot.status.remote_id.is_some() || id.kind() != key.kind {
            return Ok(false);
        }

        let mut status = (*snapshot.status).clone();
        // Runs cannot be updated; the recorded run always counts as applied
        status.applied_fingerprint = match applied {
            Some(applied) if key.kind != ResourceKind::Run => Some(applied),
            _ => Some(snapshot.fingerprint.clone()),
        };
        status.remote_id = Some(id);
        let status = status.transition(Phase::Observed);
        match self.store.commit_status(key, snapshot.status.revision, status) {
            Ok(_) => {
                info!(resource = %key, "recovered remote id from resource status");
                self.queue.add(key.clone());
                Ok(true)
            }
            Err(StoreError::StaleGeneration { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub fn enqueue(&self, key: &ResourceKey) {
        self.queue.add(key.clone());
    }

    /// Enqueue every known resource
    pub fn resync(&self) {
        let keys = self.store.keys();
        debug!(count = keys.len(), "resync");
        for key in keys {
            self.queue.add(key);
        }
    }

    pub fn report(&self) -> DispatcherReport {
        let snapshots = self.store.list(None);
        let mut phases = BTreeMap::new();
        for snapshot in &snapshots {
            *phases.entry(snapshot.status.phase.to_string()).or_insert(0) += 1;
        }
        DispatcherReport {
            resources: snapshots.len(),
            phases,
            reconciles: self.metrics.reconciles(),
            failures: self.metrics.failures(),
            stale_discards: self.reconciler.stale_discards(),
            queue_depth: self.queue.len(),
            delayed: self.queue.delayed_len(),
            max_in_flight_per_key: self.metrics.max_in_flight_per_key(),
        }
    }

    /// Number of resources in `phase`
    pub fn count(&self, phase: Phase) -> usize {
        self.store
            .list(None)
            .iter()
            .filter(|s| s.status.phase == phase)
            .count()
    }

    /// Runs the worker pool and the resync ticker until shutdown.
    /// In-flight reconciles are aborted on shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let config = self.config().clone();
        info!(workers = config.workers, "starting dispatcher");

        let mut tasks = JoinSet::new();
        for worker in 0..config.workers.max(1) {
            let dispatcher = Arc::clone(&self);
            tasks.spawn(async move { dispatcher.worker(worker).await });
        }
        if config.resync_interval.is_zero() {
            warn!("resync interval is zero, periodic resync disabled");
        } else {
            let dispatcher = Arc::clone(&self);
            let period = config.resync_interval;
            tasks.spawn(async move { dispatcher.resync_loop(period).await });
        }

        let _ = shutdown.recv().await;
        info!("stopping dispatcher");
        self.queue.shut_down();
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }

    async fn worker(&self, worker: usize) {
        debug!(worker, "worker started");
        while let Some(key) = self.queue.get().await {
            self.process(&key).await;
            self.queue.done(&key);
        }
        debug!(worker, "worker stopped");
    }

    async fn resync_loop(&self, period: Duration) {
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            self.resync();
        }
    }

    /// One reconcile plus status publication for a key
    pub async fn process(&self, key: &ResourceKey) {
        self.metrics.enter(key);
        self.metrics.reconciles.fetch_add(1, Ordering::Relaxed);

        match self.reconciler.reconcile(key).await {
            Ok(Outcome::Requeue(delay)) => self.queue.add_after(key.clone(), delay),
            Ok(Outcome::Done | Outcome::AwaitChange | Outcome::Forget) => {}
            Err(e) => {
                self.metrics.failures.fetch_add(1, Ordering::Relaxed);
                error!(resource = %key, error = %e, "reconcile failed");
                self.queue.add_after(key.clone(), self.config().poll_interval);
            }
        }

        if let Some(snapshot) = self.store.get(key) {
            for sink in &self.sinks {
                sink.publish(&snapshot).await;
            }
        }
        self.metrics.exit(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use databricks_api::{ClusterSpec, IdempotencyKey};
    use databricks_client::{FakeClient, Operation};
    use databricks_store::InMemoryStore;

    fn cluster() -> ResourceSpec {
        ResourceSpec::cluster(
            "test-cluster",
            ClusterSpec::new("5.3.x-scala2.11", "Standard_D3_v2", 2),
        )
    }

    fn dispatcher(client: FakeClient, config: ReconcilerConfig) -> Dispatcher {
        Dispatcher::new(Arc::new(InMemoryStore::new()), Arc::new(client), config)
    }

    #[derive(Default)]
    struct RecordingSink {
        phases: Mutex<Vec<Phase>>,
    }

    #[async_trait]
    impl StatusSink for RecordingSink {
        async fn publish(&self, snapshot: &Snapshot) {
            self.phases.lock().unwrap().push(snapshot.status.phase);
        }
    }

    #[tokio::test]
    async fn test_sink_sees_every_pass() {
        let sink = Arc::new(RecordingSink::default());
        let dispatcher =
            dispatcher(FakeClient::new(), ReconcilerConfig::default()).with_sink(sink.clone());
        let key = ResourceKey::cluster("default", "test-cluster");
        dispatcher.apply(&key, cluster()).unwrap();

        for _ in 0..3 {
            dispatcher.process(&key).await;
        }
        assert_eq!(
            *sink.phases.lock().unwrap(),
            vec![Phase::Creating, Phase::Observed, Phase::Ready]
        );

        let report = dispatcher.report();
        assert_eq!(report.resources, 1);
        assert_eq!(report.reconciles, 3);
        assert_eq!(report.failures, 0);
        assert_eq!(report.phases.get("Ready"), Some(&1));
        assert_eq!(dispatcher.count(Phase::Ready), 1);
    }

    #[tokio::test]
    async fn test_recovered_remote_id_is_observed_not_recreated() {
        let client = Arc::new(FakeClient::new());
        let dispatcher = Dispatcher::new(
            Arc::new(InMemoryStore::new()),
            client.clone(),
            ReconcilerConfig::default(),
        );
        let key = ResourceKey::cluster("default", "test-cluster");
        let spec = ClusterSpec::new("5.3.x-scala2.11", "Standard_D3_v2", 2);
        let existing = client
            .create_cluster("test-cluster", &spec, &IdempotencyKey::derive(&key, 7))
            .await
            .unwrap();

        dispatcher.apply(&key, cluster()).unwrap();
        assert!(dispatcher
            .recover(&key, RemoteId::Cluster(existing.clone()), None)
            .unwrap());
        assert!(!dispatcher
            .recover(&key, RemoteId::Cluster(existing.clone()), None)
            .unwrap());

        dispatcher.process(&key).await;
        let snapshot = dispatcher.store().get(&key).unwrap();
        assert_eq!(snapshot.status.phase, Phase::Observed);
        assert_eq!(snapshot.status.remote_id, Some(RemoteId::Cluster(existing)));
        assert_eq!(client.count(Operation::CreateCluster), 1);
        assert_eq!(client.count(Operation::EditCluster), 0);
    }

    #[tokio::test]
    async fn test_recovered_cluster_with_older_applied_spec_is_edited() {
        let client = Arc::new(FakeClient::new());
        let dispatcher = Dispatcher::new(
            Arc::new(InMemoryStore::new()),
            client.clone(),
            ReconcilerConfig::default(),
        );
        let key = ResourceKey::cluster("default", "test-cluster");
        let old_spec = ClusterSpec::new("5.3.x-scala2.11", "Standard_D3_v2", 1);
        let existing = client
            .create_cluster("test-cluster", &old_spec, &IdempotencyKey::derive(&key, 1))
            .await
            .unwrap();

        dispatcher.apply(&key, cluster()).unwrap();
        let applied = ResourceSpec::cluster("test-cluster", old_spec)
            .fingerprint()
            .unwrap();
        assert!(dispatcher
            .recover(&key, RemoteId::Cluster(existing.clone()), Some(applied))
            .unwrap());

        dispatcher.process(&key).await;
        assert_eq!(client.count(Operation::EditCluster), 1);
        assert_eq!(client.cluster(&existing).unwrap().num_workers, Some(2));
        let snapshot = dispatcher.store().get(&key).unwrap();
        assert_eq!(snapshot.status.applied_fingerprint, Some(snapshot.fingerprint.clone()));
    }

    #[tokio::test]
    async fn test_unchanged_apply_is_not_scheduled() {
        let dispatcher = dispatcher(FakeClient::new(), ReconcilerConfig::default());
        let key = ResourceKey::cluster("default", "test-cluster");

        assert_eq!(dispatcher.apply(&key, cluster()).unwrap(), 1);
        assert_eq!(dispatcher.report().queue_depth, 1);
        dispatcher.apply(&key, cluster()).unwrap();
        assert_eq!(dispatcher.report().queue_depth, 1);

        dispatcher.process(&key).await;
        assert_eq!(dispatcher.apply(&key, cluster()).unwrap(), 1);
        assert_eq!(dispatcher.report().queue_depth, 1);

        assert_eq!(dispatcher.delete(&key).unwrap(), 2);
        assert_eq!(dispatcher.delete(&key).unwrap(), 2);
    }

    #[tokio::test]
    async fn test_delete_of_unknown_resource_fails() {
        let dispatcher = dispatcher(FakeClient::new(), ReconcilerConfig::default());
        assert!(dispatcher
            .delete(&ResourceKey::job("default", "missing"))
            .is_err());
    }

    #[tokio::test]
    async fn test_one_reconcile_per_key_at_a_time() {
        let config = ReconcilerConfig::default()
            .with_workers(4)
            .with_poll_interval(Duration::from_millis(10));
        let dispatcher = Arc::new(dispatcher(
            FakeClient::new().with_latency(Duration::from_millis(5)),
            config,
        ));
        let key = ResourceKey::cluster("default", "test-cluster");
        dispatcher.apply(&key, cluster()).unwrap();

        let (shutdown, rx) = broadcast::channel(1);
        let handle = tokio::spawn(Arc::clone(&dispatcher).run(rx));

        for _ in 0..40 {
            dispatcher.enqueue(&key);
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        shutdown.send(()).unwrap();
        handle.await.unwrap();

        let report = dispatcher.report();
        assert_eq!(report.max_in_flight_per_key, 1);
        assert!(report.reconciles >= 3);
        assert_eq!(dispatcher.count(Phase::Ready), 1);
    }

    #[tokio::test]
    async fn test_independent_keys_progress_in_parallel() {
        let config = ReconcilerConfig::default()
            .with_workers(4)
            .with_poll_interval(Duration::from_millis(10));
        let dispatcher = Arc::new(dispatcher(FakeClient::new(), config));
        let keys: Vec<_> = (0..8)
            .map(|i| ResourceKey::cluster("default", &format!("cluster-{i}")))
            .collect();
        for key in &keys {
            dispatcher
                .apply(
                    key,
                    ResourceSpec::cluster(
                        &key.name,
                        ClusterSpec::new("5.3.x-scala2.11", "Standard_D3_v2", 1),
                    ),
                )
                .unwrap();
        }

        let (shutdown, rx) = broadcast::channel(1);
        let handle = tokio::spawn(Arc::clone(&dispatcher).run(rx));
        for _ in 0..100 {
            if dispatcher.count(Phase::Ready) == keys.len() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        shutdown.send(()).unwrap();
        handle.await.unwrap();

        assert_eq!(dispatcher.count(Phase::Ready), keys.len());
    }

    #[tokio::test]
    async fn test_shutdown_stops_idle_workers() {
        let dispatcher = Arc::new(dispatcher(FakeClient::new(), ReconcilerConfig::default()));
        let (shutdown, rx) = broadcast::channel(1);
        let handle = tokio::spawn(Arc::clone(&dispatcher).run(rx));

        tokio::time::sleep(Duration::from_millis(10)).await;
        shutdown.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("dispatcher did not stop")
            .unwrap();
    }

    #[tokio::test]
    async fn test_zero_resync_interval_disables_resync() {
        let config = ReconcilerConfig::default()
            .with_poll_interval(Duration::from_millis(10))
            .with_resync_interval(Duration::ZERO);
        let dispatcher = Arc::new(dispatcher(FakeClient::new(), config));
        let key = ResourceKey::cluster("default", "test-cluster");
        dispatcher.apply(&key, cluster()).unwrap();

        let (shutdown, rx) = broadcast::channel(1);
        let handle = tokio::spawn(Arc::clone(&dispatcher).run(rx));
        for _ in 0..100 {
            if dispatcher.count(Phase::Ready) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let reconciles = dispatcher.metrics().reconciles();
        tokio::time::sleep(Duration::from_millis(50)).await;

        shutdown.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("dispatcher did not stop")
            .unwrap();
        assert_eq!(dispatcher.count(Phase::Ready), 1);
        assert_eq!(dispatcher.metrics().reconciles(), reconciles);
    }
}
