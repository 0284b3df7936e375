//! In-memory Databricks workspace for tests

use crate::{ClientError, ClientResult, DatabricksClient};
use async_trait::async_trait;
use databricks_api::{
    ClusterId, ClusterInfo, ClusterSpec, ClusterState, IdempotencyKey, JobId, JobInfo, JobSettingsSummary,
    JobSpec, RemoteId, RunId, RunLifeCycleState, RunMetadata, RunOutput, RunResultState, RunSpec,
    RunState,
};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

/// Client operation, used for failure injection and the call log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    CreateCluster,
    GetCluster,
    EditCluster,
    DeleteCluster,
    ListClusters,
    CreateJob,
    GetJob,
    ResetJob,
    DeleteJob,
    SubmitRun,
    RunNow,
    GetRun,
    CancelRun,
    DeleteRun,
    HealthCheck,
}

type RunStep = (RunLifeCycleState, Option<RunResultState>);

struct FakeCluster {
    info: ClusterInfo,
    progression: VecDeque<ClusterState>,
}

struct FakeRun {
    output: RunOutput,
    progression: VecDeque<RunStep>,
}

struct FakeState {
    next_id: i64,
    cluster_script: Vec<ClusterState>,
    run_script: Vec<RunStep>,
    clusters: BTreeMap<ClusterId, FakeCluster>,
    jobs: BTreeMap<JobId, JobInfo>,
    runs: BTreeMap<RunId, FakeRun>,
    tokens: HashMap<String, RemoteId>,
    failures: HashMap<Operation, VecDeque<ClientError>>,
    calls: Vec<Operation>,
}

impl FakeState {
    fn allocate_id(&mut self) -> i64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn exists(&self, id: &RemoteId) -> bool {
        match id {
            RemoteId::Cluster(id) => self.clusters.contains_key(id),
            RemoteId::Job(id) => self.jobs.contains_key(id),
            RemoteId::Run(id) => self.runs.contains_key(id),
        }
    }

    /// Id previously created with the same token, if that object still exists
    fn replay(&self, token: &IdempotencyKey) -> Option<RemoteId> {
        self.tokens
            .get(token.as_str())
            .filter(|id| self.exists(id))
            .cloned()
    }

    fn new_run(&mut self, run_name: &str, job_id: Option<JobId>) -> RunId {
        let run_id = RunId(self.allocate_id());
        let mut progression: VecDeque<RunStep> = self.run_script.iter().copied().collect();
        let (life_cycle_state, result_state) = progression
            .front()
            .copied()
            .unwrap_or((RunLifeCycleState::Pending, None));
        if progression.is_empty() {
            progression.push_back((life_cycle_state, result_state));
        }

        let number_in_job = job_id.map(|job_id| {
            1 + self
                .runs
                .values()
                .filter(|run| run.output.metadata.job_id == Some(job_id))
                .count() as i64
        });

        self.runs.insert(
            run_id,
            FakeRun {
                output: RunOutput {
                    metadata: RunMetadata {
                        job_id,
                        run_id,
                        number_in_job,
                        run_name: Some(run_name.to_string()),
                        state: RunState {
                            life_cycle_state,
                            result_state,
                            state_message: None,
                        },
                    },
                    notebook_output: None,
                    error: None,
                },
                progression,
            },
        );
        run_id
    }
}

/// Scriptable in-memory Databricks.
///
/// Each `get_cluster`/`get_run` reports the next state of the scripted
/// progression and then stays on the last one.
pub struct FakeClient {
    state: Mutex<FakeState>,
    latency: Option<Duration>,
}

impl FakeClient {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeState {
                next_id: 1,
                cluster_script: vec![ClusterState::Pending, ClusterState::Running],
                run_script: vec![
                    (RunLifeCycleState::Pending, None),
                    (RunLifeCycleState::Running, None),
                    (RunLifeCycleState::Terminated, Some(RunResultState::Success)),
                ],
                clusters: BTreeMap::new(),
                jobs: BTreeMap::new(),
                runs: BTreeMap::new(),
                tokens: HashMap::new(),
                failures: HashMap::new(),
                calls: Vec::new(),
            }),
            latency: None,
        }
    }

    /// Delay every call, so tests can exercise deadlines and overlap
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// First identifier handed out; later ones count up from it
    pub fn with_first_id(self, id: i64) -> Self {
        self.lock().next_id = id;
        self
    }

    pub fn with_cluster_states(self, states: Vec<ClusterState>) -> Self {
        self.lock().cluster_script = states;
        self
    }

    pub fn with_run_states(self, states: Vec<(RunLifeCycleState, Option<RunResultState>)>) -> Self {
        self.lock().run_script = states;
        self
    }

    /// Make the next call of `operation` fail with `error`
    pub fn fail(&self, operation: Operation, error: ClientError) {
        self.fail_times(operation, error, 1);
    }

    pub fn fail_times(&self, operation: Operation, error: ClientError, times: usize) {
        let mut state = self.lock();
        let queue = state.failures.entry(operation).or_default();
        queue.extend(std::iter::repeat(error).take(times));
    }

    /// Every call made so far, in order
    pub fn calls(&self) -> Vec<Operation> {
        self.lock().calls.clone()
    }

    pub fn count(&self, operation: Operation) -> usize {
        self.lock().calls.iter().filter(|op| **op == operation).count()
    }

    pub fn cluster(&self, id: &ClusterId) -> Option<ClusterInfo> {
        self.lock().clusters.get(id).map(|c| c.info.clone())
    }

    pub fn job(&self, id: JobId) -> Option<JobInfo> {
        self.lock().jobs.get(&id).cloned()
    }

    pub fn run(&self, id: RunId) -> Option<RunOutput> {
        self.lock().runs.get(&id).map(|r| r.output.clone())
    }

    /// Number of clusters, jobs and runs currently held
    pub fn object_count(&self) -> usize {
        let state = self.lock();
        state.clusters.len() + state.jobs.len() + state.runs.len()
    }

    /// Remove an object behind the operator's back
    pub fn remove(&self, id: &RemoteId) {
        let mut state = self.lock();
        match id {
            RemoteId::Cluster(id) => {
                state.clusters.remove(id);
            }
            RemoteId::Job(id) => {
                state.jobs.remove(id);
            }
            RemoteId::Run(id) => {
                state.runs.remove(id);
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Common prologue: latency, call log and injected failure
    async fn enter(&self, operation: Operation) -> ClientResult<MutexGuard<'_, FakeState>> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        let mut state = self.lock();
        state.calls.push(operation);
        if let Some(error) = state.failures.get_mut(&operation).and_then(VecDeque::pop_front) {
            return Err(error);
        }
        Ok(state)
    }
}

impl Default for FakeClient {
    fn default() -> Self {
        Self::new()
    }
}

fn not_found(id: impl std::fmt::Display) -> ClientError {
    ClientError::NotFound(format!("{id} does not exist"))
}

#[async_trait]
impl DatabricksClient for FakeClient {
    async fn create_cluster(
        &self,
        cluster_name: &str,
        spec: &ClusterSpec,
        token: &IdempotencyKey,
    ) -> ClientResult<ClusterId> {
        let mut state = self.enter(Operation::CreateCluster).await?;
        if let Some(RemoteId::Cluster(id)) = state.replay(token) {
            return Ok(id);
        }

        let id = ClusterId(format!("fake-cluster-{}", state.allocate_id()));
        let progression: VecDeque<ClusterState> = state.cluster_script.iter().copied().collect();
        let info = ClusterInfo {
            cluster_id: id.clone(),
            cluster_name: Some(cluster_name.to_string()),
            state: progression.front().copied().unwrap_or(ClusterState::Pending),
            state_message: None,
            spark_version: Some(spec.spark_version.clone()),
            node_type_id: Some(spec.node_type_id.clone()),
            num_workers: Some(spec.num_workers),
        };
        state.clusters.insert(id.clone(), FakeCluster { info, progression });
        state
            .tokens
            .insert(token.as_str().to_string(), RemoteId::Cluster(id.clone()));
        Ok(id)
    }

    async fn get_cluster(&self, id: &ClusterId) -> ClientResult<ClusterInfo> {
        let mut state = self.enter(Operation::GetCluster).await?;
        let cluster = state.clusters.get_mut(id).ok_or_else(|| not_found(id))?;
        if let Some(next) = cluster.progression.front().copied() {
            cluster.info.state = next;
        }
        if cluster.progression.len() > 1 {
            cluster.progression.pop_front();
        }
        Ok(cluster.info.clone())
    }

    async fn edit_cluster(
        &self,
        id: &ClusterId,
        cluster_name: &str,
        spec: &ClusterSpec,
    ) -> ClientResult<()> {
        let mut state = self.enter(Operation::EditCluster).await?;
        let cluster = state.clusters.get_mut(id).ok_or_else(|| not_found(id))?;
        cluster.info.cluster_name = Some(cluster_name.to_string());
        cluster.info.spark_version = Some(spec.spark_version.clone());
        cluster.info.node_type_id = Some(spec.node_type_id.clone());
        cluster.info.num_workers = Some(spec.num_workers);
        Ok(())
    }

    async fn delete_cluster(&self, id: &ClusterId) -> ClientResult<()> {
        let mut state = self.enter(Operation::DeleteCluster).await?;
        state.clusters.remove(id).map(|_| ()).ok_or_else(|| not_found(id))
    }

    async fn list_clusters(&self) -> ClientResult<Vec<ClusterInfo>> {
        let state = self.enter(Operation::ListClusters).await?;
        Ok(state.clusters.values().map(|c| c.info.clone()).collect())
    }

    async fn create_job(
        &self,
        job_name: &str,
        _spec: &JobSpec,
        token: &IdempotencyKey,
    ) -> ClientResult<JobId> {
        let mut state = self.enter(Operation::CreateJob).await?;
        if let Some(RemoteId::Job(id)) = state.replay(token) {
            return Ok(id);
        }

        let id = JobId(state.allocate_id());
        state.jobs.insert(
            id,
            JobInfo {
                job_id: id,
                settings: JobSettingsSummary {
                    name: Some(job_name.to_string()),
                },
                created_time: None,
                creator_user_name: Some("fake@databricks".to_string()),
            },
        );
        state.tokens.insert(token.as_str().to_string(), RemoteId::Job(id));
        Ok(id)
    }

    async fn get_job(&self, id: JobId) -> ClientResult<JobInfo> {
        let state = self.enter(Operation::GetJob).await?;
        state.jobs.get(&id).cloned().ok_or_else(|| not_found(id))
    }

    async fn reset_job(&self, id: JobId, job_name: &str, _spec: &JobSpec) -> ClientResult<()> {
        let mut state = self.enter(Operation::ResetJob).await?;
        let job = state.jobs.get_mut(&id).ok_or_else(|| not_found(id))?;
        job.settings.name = Some(job_name.to_string());
        Ok(())
    }

    async fn delete_job(&self, id: JobId) -> ClientResult<()> {
        let mut state = self.enter(Operation::DeleteJob).await?;
        state.jobs.remove(&id).map(|_| ()).ok_or_else(|| not_found(id))
    }

    async fn submit_run(
        &self,
        run_name: &str,
        spec: &RunSpec,
        token: &IdempotencyKey,
    ) -> ClientResult<RunId> {
        let mut state = self.enter(Operation::SubmitRun).await?;
        if spec.job_name().is_some() {
            return Err(ClientError::rejected(
                400,
                "INVALID_PARAMETER_VALUE",
                "runs of existing jobs are triggered with run-now",
            ));
        }
        if let Some(RemoteId::Run(id)) = state.replay(token) {
            return Ok(id);
        }

        let id = state.new_run(run_name, None);
        state.tokens.insert(token.as_str().to_string(), RemoteId::Run(id));
        Ok(id)
    }

    async fn run_now(&self, job_id: JobId, token: &IdempotencyKey) -> ClientResult<RunId> {
        let mut state = self.enter(Operation::RunNow).await?;
        if let Some(RemoteId::Run(id)) = state.replay(token) {
            return Ok(id);
        }
        let job_name = state
            .jobs
            .get(&job_id)
            .ok_or_else(|| not_found(job_id))?
            .settings
            .name
            .clone()
            .unwrap_or_default();

        let id = state.new_run(&job_name, Some(job_id));
        state.tokens.insert(token.as_str().to_string(), RemoteId::Run(id));
        Ok(id)
    }

    async fn get_run(&self, id: RunId) -> ClientResult<RunOutput> {
        let mut state = self.enter(Operation::GetRun).await?;
        let run = state.runs.get_mut(&id).ok_or_else(|| not_found(id))?;
        if let Some((life_cycle_state, result_state)) = run.progression.front().copied() {
            run.output.metadata.state.life_cycle_state = life_cycle_state;
            run.output.metadata.state.result_state = result_state;
        }
        if run.progression.len() > 1 {
            run.progression.pop_front();
        }
        Ok(run.output.clone())
    }

    async fn cancel_run(&self, id: RunId) -> ClientResult<()> {
        let mut state = self.enter(Operation::CancelRun).await?;
        let run = state.runs.get_mut(&id).ok_or_else(|| not_found(id))?;
        if !run.output.is_terminal() {
            run.output.metadata.state.life_cycle_state = RunLifeCycleState::Terminating;
            run.progression = VecDeque::from([(
                RunLifeCycleState::Terminated,
                Some(RunResultState::Canceled),
            )]);
        }
        Ok(())
    }

    async fn delete_run(&self, id: RunId) -> ClientResult<()> {
        let mut state = self.enter(Operation::DeleteRun).await?;
        let run = state.runs.get(&id).ok_or_else(|| not_found(id))?;
        if !run.output.is_terminal() {
            return Err(ClientError::rejected(
                400,
                "INVALID_STATE",
                &format!("run {id} is still active"),
            ));
        }
        state.runs.remove(&id);
        Ok(())
    }

    async fn health_check(&self) -> ClientResult<bool> {
        self.enter(Operation::HealthCheck).await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use databricks_api::{ResourceKey, Task};

    fn token(name: &str) -> IdempotencyKey {
        IdempotencyKey::derive(&ResourceKey::cluster("default", name), 1)
    }

    #[tokio::test]
    async fn test_cluster_progression() {
        let client = FakeClient::new();
        let spec = ClusterSpec::new("5.3.x-scala2.11", "Standard_D3_v2", 2);
        let id = client.create_cluster("c", &spec, &token("c")).await.unwrap();

        assert_eq!(client.get_cluster(&id).await.unwrap().state, ClusterState::Pending);
        assert_eq!(client.get_cluster(&id).await.unwrap().state, ClusterState::Running);
        assert_eq!(client.get_cluster(&id).await.unwrap().state, ClusterState::Running);

        client.delete_cluster(&id).await.unwrap();
        assert!(client.get_cluster(&id).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_idempotent_create() {
        let client = FakeClient::new();
        let spec = ClusterSpec::new("5.3.x-scala2.11", "Standard_D3_v2", 2);
        let first = client.create_cluster("c", &spec, &token("c")).await.unwrap();
        let second = client.create_cluster("c", &spec, &token("c")).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(client.object_count(), 1);
    }

    #[tokio::test]
    async fn test_injected_failures_are_consumed_in_order() {
        let client = FakeClient::new();
        client.fail_times(Operation::HealthCheck, ClientError::Timeout, 2);

        assert_eq!(client.health_check().await, Err(ClientError::Timeout));
        assert_eq!(client.health_check().await, Err(ClientError::Timeout));
        assert_eq!(client.health_check().await, Ok(true));
        assert_eq!(client.count(Operation::HealthCheck), 3);
    }

    #[tokio::test]
    async fn test_cancel_then_delete_run() {
        let client = FakeClient::new();
        let spec = RunSpec::new(
            databricks_api::RunTarget::ExistingClusterId("c-1".into()),
            Some(Task::notebook("/Shared/nb")),
        );
        let id = client.submit_run("r", &spec, &token("r")).await.unwrap();

        let err = client.delete_run(id).await.unwrap_err();
        assert!(matches!(err, ClientError::Rejected { .. }));

        client.cancel_run(id).await.unwrap();
        let output = client.get_run(id).await.unwrap();
        assert_eq!(output.life_cycle_state(), RunLifeCycleState::Terminated);
        assert_eq!(output.metadata.state.result_state, Some(RunResultState::Canceled));

        client.delete_run(id).await.unwrap();
        assert_eq!(client.object_count(), 0);
    }
}
