// Integration tests for the Databricks operator components
// These tests drive the dispatcher against the in-memory workspace end to end

use databricks_api::{
    ClusterRef, ClusterSpec, JobId, JobSpec, LibrarySpec, Phase, RemoteId, ResourceKey,
    ResourceKind, ResourceSpec, ResourceStatus, RunLifeCycleState, RunResultState, RunSpec,
    RunTarget, Task,
};
use databricks_client::{ClientError, FakeClient, Operation};
use databricks_reconciler::{projector, Dispatcher, ReconcilerConfig};
use databricks_store::{InMemoryStore, ResourceStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

fn fast_config() -> ReconcilerConfig {
    ReconcilerConfig::default()
        .with_workers(4)
        .with_poll_interval(Duration::from_millis(10))
        .with_resync_interval(Duration::from_secs(60))
        .with_call_timeout(Duration::from_secs(1))
        .with_backoff(Duration::from_millis(1), Duration::from_millis(10), 8)
}

fn setup(client: FakeClient) -> (Arc<FakeClient>, Arc<Dispatcher>) {
    let client = Arc::new(client);
    let dispatcher = Dispatcher::new(Arc::new(InMemoryStore::new()), client.clone(), fast_config());
    (client, Arc::new(dispatcher))
}

fn status(dispatcher: &Dispatcher, key: &ResourceKey) -> ResourceStatus {
    (*dispatcher.store().get(key).unwrap().status).clone()
}

fn cluster_spec() -> ResourceSpec {
    ResourceSpec::cluster(
        "dcluster-interactive1",
        ClusterSpec::new("5.3.x-scala2.11", "Standard_D3_v2", 2)
            .with_spark_conf("spark.speculation", "true"),
    )
}

fn job_spec(job_name: &str) -> ResourceSpec {
    ResourceSpec::job(
        job_name,
        JobSpec::new(
            ClusterRef::ExistingClusterId("1201-my-cluster".into()),
            Task::spark_jar("com.databricks.ComputeModels"),
        )
        .with_library(LibrarySpec::jar("dbfs:/my-jar.jar")),
    )
}

fn run_spec(run_name: &str) -> ResourceSpec {
    ResourceSpec::run(
        run_name,
        RunSpec::new(
            RunTarget::NewCluster(ClusterSpec::new("5.3.x-scala2.11", "Standard_D3_v2", 1)),
            Some(Task::notebook("/Users/me/test-notebook")),
        ),
    )
}

/// Processes `key` until it reaches `phase`, up to `passes` times
async fn drive(dispatcher: &Dispatcher, key: &ResourceKey, phase: Phase, passes: usize) -> bool {
    for _ in 0..passes {
        dispatcher.process(key).await;
        if status(dispatcher, key).phase == phase {
            return true;
        }
    }
    false
}

#[tokio::test]
async fn test_djob_lifecycle() {
    let (client, dispatcher) = setup(FakeClient::new().with_first_id(42));
    let key = ResourceKey::job("default", "test-job");
    dispatcher.apply(&key, job_spec("test-job")).unwrap();

    assert!(drive(&dispatcher, &key, Phase::Ready, 3).await);
    let ready = status(&dispatcher, &key);
    assert_eq!(ready.remote_id, Some(RemoteId::Job(JobId(42))));

    let document = projector::document(&key, &ready).unwrap();
    let outputs = projector::outputs(&document, ResourceKind::Job);
    assert_eq!(outputs["job_name"].as_deref(), Some("test-job"));
    assert_eq!(outputs["job_id"].as_deref(), Some("42"));
    assert_eq!(document["status"]["job_status"]["job_id"], 42);

    dispatcher.delete(&key).unwrap();
    assert!(drive(&dispatcher, &key, Phase::Absent, 3).await);
    assert!(status(&dispatcher, &key).remote_id.is_none());
    assert!(client.job(JobId(42)).is_none());
}

#[tokio::test]
async fn test_run_is_ready_exactly_when_terminated() {
    let (_, dispatcher) = setup(FakeClient::new());
    let key = ResourceKey::run("default", "test-run");
    dispatcher.apply(&key, run_spec("test-run")).unwrap();

    dispatcher.process(&key).await;
    let mut seen = Vec::new();
    for _ in 0..3 {
        dispatcher.process(&key).await;
        let current = status(&dispatcher, &key);
        let document = projector::document(&key, &current).unwrap();
        let outputs = projector::outputs(&document, ResourceKind::Run);
        seen.push((
            outputs["life_cycle_state"].clone(),
            projector::is_ready(&key, &current).unwrap(),
        ));
    }

    assert_eq!(
        seen,
        vec![
            (Some("PENDING".to_string()), false),
            (Some("RUNNING".to_string()), false),
            (Some("TERMINATED".to_string()), true),
        ]
    );
    let done = status(&dispatcher, &key);
    assert_eq!(done.phase, Phase::Ready);
    let document = projector::document(&key, &done).unwrap();
    assert_eq!(document["status"]["metadata"]["state"]["result_state"], "SUCCESS");
}

#[tokio::test]
async fn test_failed_run_is_never_ready() {
    let client = FakeClient::new().with_run_states(vec![
        (RunLifeCycleState::Pending, None),
        (RunLifeCycleState::InternalError, Some(RunResultState::Failed)),
    ]);
    let (_, dispatcher) = setup(client);
    let key = ResourceKey::run("default", "test-run");
    dispatcher.apply(&key, run_spec("test-run")).unwrap();

    for _ in 0..4 {
        dispatcher.process(&key).await;
    }
    // Terminal but unsuccessful runs still report their outcome
    let current = status(&dispatcher, &key);
    let document = projector::document(&key, &current).unwrap();
    assert_eq!(document["status"]["metadata"]["state"]["result_state"], "FAILED");
}

#[tokio::test]
async fn test_every_kind_returns_to_absent() {
    let (client, dispatcher) = setup(FakeClient::new());
    let keys = [
        (ResourceKey::cluster("default", "c"), cluster_spec()),
        (ResourceKey::job("default", "j"), job_spec("j")),
        (ResourceKey::run("default", "r"), run_spec("r")),
    ];

    for (key, spec) in &keys {
        dispatcher.apply(key, spec.clone()).unwrap();
        dispatcher.process(key).await;
        dispatcher.process(key).await;
        assert!(status(&dispatcher, key).remote_id.is_some());
    }
    assert_eq!(client.object_count(), 3);

    for (key, _) in &keys {
        dispatcher.delete(key).unwrap();
        assert!(drive(&dispatcher, key, Phase::Absent, 4).await, "{key} not deleted");
        assert!(status(&dispatcher, key).remote_id.is_none());
    }
    assert_eq!(client.object_count(), 0);
}

#[tokio::test]
async fn test_rejected_create_stays_failed_until_changed() {
    let (client, dispatcher) = setup(FakeClient::new());
    client.fail(
        Operation::CreateJob,
        ClientError::rejected(400, "INVALID_PARAMETER_VALUE", "Cluster 1201-my-cluster does not exist"),
    );
    let key = ResourceKey::job("default", "test-job");
    dispatcher.apply(&key, job_spec("test-job")).unwrap();

    for _ in 0..5 {
        dispatcher.process(&key).await;
        let phase = status(&dispatcher, &key).phase;
        assert_eq!(phase, Phase::CreateFailed);
    }
    assert_eq!(client.count(Operation::CreateJob), 1);

    dispatcher.apply(&key, job_spec("test-job-v2")).unwrap();
    assert!(drive(&dispatcher, &key, Phase::Ready, 3).await);
}

#[tokio::test]
async fn test_transient_failures_converge() {
    let (client, dispatcher) = setup(FakeClient::new());
    let unavailable = ClientError::Unavailable("503 Service Unavailable".into());
    client.fail_times(Operation::CreateCluster, unavailable.clone(), 3);
    client.fail_times(Operation::GetCluster, unavailable, 3);
    let key = ResourceKey::cluster("default", "c");
    dispatcher.apply(&key, cluster_spec()).unwrap();

    assert!(drive(&dispatcher, &key, Phase::Ready, 10).await);
    assert_eq!(client.object_count(), 1);
    assert_eq!(status(&dispatcher, &key).attempts, 0);
}

#[tokio::test]
async fn test_create_delete_create_ends_present() {
    let (client, dispatcher) = setup(FakeClient::new());
    let key = ResourceKey::cluster("default", "c");

    dispatcher.apply(&key, cluster_spec()).unwrap();
    dispatcher.process(&key).await;
    dispatcher.delete(&key).unwrap();
    dispatcher.apply(&key, cluster_spec()).unwrap();
    assert!(drive(&dispatcher, &key, Phase::Ready, 4).await);
    assert_eq!(client.object_count(), 1);

    dispatcher.delete(&key).unwrap();
    dispatcher.process(&key).await;
    dispatcher.apply(&key, cluster_spec()).unwrap();
    assert!(drive(&dispatcher, &key, Phase::Ready, 4).await);
    assert!(status(&dispatcher, &key).remote_id.is_some());
    assert_eq!(client.object_count(), 1);
    assert_eq!(client.count(Operation::CreateCluster), 2);
}

#[tokio::test]
async fn test_running_dispatcher_converges_job_and_run_by_name() {
    let (client, dispatcher) = setup(FakeClient::new().with_first_id(42));
    let job = ResourceKey::job("default", "test-job");
    let run = ResourceKey::run("default", "test-run");
    // The run is applied first and waits for its job
    dispatcher
        .apply(
            &run,
            ResourceSpec::run("test-run", RunSpec::new(RunTarget::JobName("test-job".into()), None)),
        )
        .unwrap();
    dispatcher.apply(&job, job_spec("test-job")).unwrap();

    let (shutdown, rx) = broadcast::channel(1);
    let handle = tokio::spawn(Arc::clone(&dispatcher).run(rx));
    for _ in 0..200 {
        if dispatcher.count(Phase::Ready) == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    shutdown.send(()).unwrap();
    handle.await.unwrap();

    assert_eq!(dispatcher.count(Phase::Ready), 2);
    let document = projector::document(&run, &status(&dispatcher, &run)).unwrap();
    let outputs = projector::outputs(&document, ResourceKind::Run);
    assert_eq!(outputs["name"].as_deref(), Some("job-42-run-1"));
    assert_eq!(client.count(Operation::RunNow), 1);
    assert_eq!(dispatcher.report().max_in_flight_per_key, 1);
}

#[tokio::test]
async fn test_running_dispatcher_serializes_each_key() {
    let client = FakeClient::new().with_latency(Duration::from_millis(3));
    let (_, dispatcher) = setup(client);
    let keys: Vec<ResourceKey> = (0..6)
        .map(|i| ResourceKey::cluster("default", &format!("c{i}")))
        .collect();
    for key in &keys {
        dispatcher.apply(key, cluster_spec()).unwrap();
    }

    let (shutdown, rx) = broadcast::channel(1);
    let handle = tokio::spawn(Arc::clone(&dispatcher).run(rx));
    for _ in 0..30 {
        for key in &keys {
            dispatcher.enqueue(key);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    shutdown.send(()).unwrap();
    handle.await.unwrap();

    let report = dispatcher.report();
    assert_eq!(report.max_in_flight_per_key, 1);
    assert_eq!(report.phases.get("Ready"), Some(&keys.len()));
    assert_eq!(report.failures, 0);
}

#[tokio::test]
async fn test_forgotten_resource_is_dropped() {
    let (_, dispatcher) = setup(FakeClient::new());
    let key = ResourceKey::cluster("default", "c");
    dispatcher.apply(&key, cluster_spec()).unwrap();
    dispatcher.process(&key).await;

    assert!(dispatcher.forget(&key));
    assert!(dispatcher.store().get(&key).is_none());
    // A queued pass for a forgotten key is a no-op
    dispatcher.process(&key).await;
    assert_eq!(dispatcher.report().failures, 0);
    assert!(dispatcher.store().keys().is_empty());
}
