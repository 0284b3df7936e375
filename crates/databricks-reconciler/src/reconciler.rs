//! Level-triggered reconcile of a single resource.
//!
//! Each pass reads a snapshot from the store, compares the desired state with
//! what is recorded and observed, performs at most one kind of remote action
//! and commits the resulting status against the revision it read.

use crate::{projector, Backoff, ReconcileError, ReconcileResult, ReconcilerConfig};
use databricks_api::{
    IdempotencyKey, JobId, Phase, RemoteId, RemoteState, ResourceKey, ResourceKind, ResourceSpec,
    ResourceStatus,
};
use databricks_client::{ClientError, ClientResult, DatabricksClient};
use databricks_store::{Desired, ResourceStore, Snapshot, StoreError};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

const RUN_IMMUTABLE: &str = "runs cannot be changed after submission; spec change ignored";

/// What the caller should do with the key after a reconcile
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Converged, nothing to do until the desired state changes
    Done,
    /// Held in a terminal failure phase until the desired state changes
    AwaitChange,
    /// Reconcile again after the delay
    Requeue(Duration),
    /// The key is no longer known to the store
    Forget,
}

enum Step {
    Commit(ResourceStatus, Outcome),
    /// The desired state moved on mid-pass; leave the status untouched
    Skip,
}

/// Reconciler for Databricks clusters, jobs and runs
pub struct Reconciler {
    store: Arc<dyn ResourceStore>,
    client: Arc<dyn DatabricksClient>,
    config: ReconcilerConfig,
    backoff: Backoff,
    stale_discards: AtomicU64,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn ResourceStore>,
        client: Arc<dyn DatabricksClient>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            backoff: Backoff::from(&config),
            store,
            client,
            config,
            stale_discards: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    /// Results dropped because the status changed underneath them
    pub fn stale_discards(&self) -> u64 {
        self.stale_discards.load(Ordering::Relaxed)
    }

    /// Main reconciliation logic
    #[instrument(skip(self, key), fields(resource = %key))]
    pub async fn reconcile(&self, key: &ResourceKey) -> ReconcileResult<Outcome> {
        let Some(snapshot) = self.store.get(key) else {
            debug!("resource no longer known");
            return Ok(Outcome::Forget);
        };
        let previous = snapshot.status.phase;
        let mut status = (*snapshot.status).clone();

        if status.observed_generation != snapshot.generation {
            status.attempts = 0;
            if status.phase.is_terminal_failure() {
                let resumed = if status.remote_id.is_some() {
                    Phase::Observed
                } else {
                    Phase::Absent
                };
                status = status.transition(resumed).without_message();
            }
        } else if status.phase.is_terminal_failure() {
            return Ok(Outcome::AwaitChange);
        }

        let step = match &snapshot.desired {
            Desired::Absent => self.delete(&snapshot, status).await,
            Desired::Invalid(reason) => match status.remote_id.clone() {
                None => self.reject_invalid(status, reason),
                Some(id) => {
                    self.observe(&snapshot, None, id, status, Some(reason.clone()))
                        .await
                }
            },
            Desired::Present(spec) => match status.remote_id.clone() {
                None => self.create(&snapshot, spec, status).await,
                Some(id) => self.observe(&snapshot, Some(spec), id, status, None).await,
            },
        };

        match step {
            Step::Skip => {
                debug!("desired state changed during reconcile, skipping");
                Ok(Outcome::Requeue(Duration::ZERO))
            }
            Step::Commit(status, outcome) => self.commit(&snapshot, previous, status, outcome),
        }
    }

    /// Present without a remote object: create it
    async fn create(&self, snapshot: &Snapshot, spec: &ResourceSpec, status: ResourceStatus) -> Step {
        let key = &snapshot.key;
        let status = status.transition(Phase::Creating);

        let job_id = match spec {
            ResourceSpec::Run(run) => match run.spec.job_name() {
                Some(job_name) => match self.resolve_job(key, job_name) {
                    Some(job_id) => Some(job_id),
                    None => return self.wait_for_job(status, job_name),
                },
                None => None,
            },
            _ => None,
        };

        let token = IdempotencyKey::derive(key, snapshot.generation);
        let created = match (spec, job_id) {
            (ResourceSpec::Cluster(cluster), _) => self
                .mutate(
                    snapshot,
                    self.client
                        .create_cluster(&cluster.cluster_name, &cluster.spec, &token),
                )
                .await
                .map(|r| r.map(RemoteId::Cluster)),
            (ResourceSpec::Job(job), _) => self
                .mutate(snapshot, self.client.create_job(&job.job_name, &job.spec, &token))
                .await
                .map(|r| r.map(RemoteId::Job)),
            (ResourceSpec::Run(_), Some(job_id)) => self
                .mutate(snapshot, self.client.run_now(job_id, &token))
                .await
                .map(|r| r.map(RemoteId::Run)),
            (ResourceSpec::Run(run), None) => self
                .mutate(snapshot, self.client.submit_run(&run.run_name, &run.spec, &token))
                .await
                .map(|r| r.map(RemoteId::Run)),
        };

        match created {
            None => Step::Skip,
            Some(Ok(id)) => {
                info!(%id, "created remote object");
                let mut status = status.without_message();
                status.remote_id = Some(id);
                status.remote = None;
                status.applied_fingerprint = Some(snapshot.fingerprint.clone());
                status.attempts = 0;
                Step::Commit(status, Outcome::Requeue(self.config.poll_interval))
            }
            // The referenced job vanished; its own reconcile recreates it
            Some(Err(ClientError::NotFound(_))) if job_id.is_some() => {
                let job_name = spec_job_name(spec).unwrap_or_default();
                self.wait_for_job(status, &job_name)
            }
            Some(Err(e)) if e.is_retryable() => self.retry(status, &e),
            Some(Err(e)) => self.fail(status, Phase::CreateFailed, &e),
        }
    }

    /// Present with a remote object: push spec changes, then observe
    async fn observe(
        &self,
        snapshot: &Snapshot,
        spec: Option<&ResourceSpec>,
        id: RemoteId,
        mut status: ResourceStatus,
        mut note: Option<String>,
    ) -> Step {
        let key = &snapshot.key;

        let changed = status.applied_fingerprint.as_ref() != Some(&snapshot.fingerprint);
        let mut deferred = false;
        if let Some(spec) = spec.filter(|_| changed) {
            let pushed = match (spec, &id) {
                (ResourceSpec::Cluster(cluster), RemoteId::Cluster(cluster_id)) => {
                    self.mutate(
                        snapshot,
                        self.client
                            .edit_cluster(cluster_id, &cluster.cluster_name, &cluster.spec),
                    )
                    .await
                }
                (ResourceSpec::Job(job), RemoteId::Job(job_id)) => {
                    self.mutate(snapshot, self.client.reset_job(*job_id, &job.job_name, &job.spec))
                        .await
                }
                _ => {
                    note = Some(RUN_IMMUTABLE.to_string());
                    Some(Ok(()))
                }
            };

            match pushed {
                None => return Step::Skip,
                Some(Ok(())) if note.is_none() => {
                    info!(%id, "pushed spec change");
                    status.applied_fingerprint = Some(snapshot.fingerprint.clone());
                }
                Some(Ok(())) => {}
                Some(Err(ClientError::NotFound(_))) => return self.vanished(status, &id),
                Some(Err(e)) if e.is_retryable() => return self.retry(status, &e),
                // Busy remote object; push again on the next poll
                Some(Err(e)) if e.is_invalid_state() => {
                    debug!(%id, error = %e, "spec change deferred");
                    deferred = true;
                    note = Some(format!("spec change deferred: {e}"));
                }
                Some(Err(e)) => return self.fail(status, Phase::CreateFailed, &e),
            }
        }

        let observed = match &id {
            RemoteId::Cluster(cluster_id) => self
                .call(self.client.get_cluster(cluster_id))
                .await
                .map(RemoteState::Cluster),
            RemoteId::Job(job_id) => self
                .call(self.client.get_job(*job_id))
                .await
                .map(RemoteState::Job),
            RemoteId::Run(run_id) => self
                .call(self.client.get_run(*run_id))
                .await
                .map(RemoteState::Run),
        };

        match observed {
            Ok(remote) => {
                status.remote = Some(remote);
                status.attempts = 0;
                status.message = note;
                let ready = projector::is_ready(key, &status).unwrap_or_else(|e| {
                    error!(error = %e, "failed to project status");
                    false
                });
                if ready {
                    let outcome = if deferred {
                        Outcome::Requeue(self.config.poll_interval)
                    } else if self.config.resync_interval.is_zero() {
                        Outcome::Done
                    } else {
                        Outcome::Requeue(self.config.resync_interval)
                    };
                    Step::Commit(status.transition(Phase::Ready), outcome)
                } else {
                    Step::Commit(
                        status.transition(Phase::Observed),
                        Outcome::Requeue(self.config.poll_interval),
                    )
                }
            }
            Err(ClientError::NotFound(_)) => self.vanished(status, &id),
            Err(e) if e.is_retryable() => self.retry(status, &e),
            Err(e) => self.fail(status, Phase::ReconcileError, &e),
        }
    }

    /// Desired absent: delete the remote object if there is one
    async fn delete(&self, snapshot: &Snapshot, status: ResourceStatus) -> Step {
        let Some(id) = status.remote_id.clone() else {
            let mut status = status.clear_remote().transition(Phase::Absent).without_message();
            status.attempts = 0;
            return Step::Commit(status, Outcome::Done);
        };

        let mut status = status.transition(Phase::Deleting);
        let deleted = match &id {
            RemoteId::Cluster(cluster_id) => {
                self.mutate(snapshot, self.client.delete_cluster(cluster_id)).await
            }
            RemoteId::Job(job_id) => self.mutate(snapshot, self.client.delete_job(*job_id)).await,
            RemoteId::Run(run_id) => match self.call(self.client.get_run(*run_id)).await {
                // Active runs cannot be deleted; cancel and come back
                Ok(output) if !output.is_terminal() => {
                    status.remote = Some(RemoteState::Run(output));
                    match self.mutate(snapshot, self.client.cancel_run(*run_id)).await {
                        None => return Step::Skip,
                        Some(Ok(())) => {
                            info!(%id, "cancelling active run before delete");
                            status.attempts = 0;
                            return Step::Commit(
                                status.with_message("cancelling active run"),
                                Outcome::Requeue(self.config.poll_interval),
                            );
                        }
                        Some(Err(e)) => Some(Err(e)),
                    }
                }
                Ok(_) => self.mutate(snapshot, self.client.delete_run(*run_id)).await,
                Err(e) => Some(Err(e)),
            },
        };

        match deleted {
            None => Step::Skip,
            Some(Ok(())) | Some(Err(ClientError::NotFound(_))) => {
                info!(%id, "deleted remote object");
                let mut status = status.clear_remote().transition(Phase::Absent).without_message();
                status.attempts = 0;
                Step::Commit(status, Outcome::Done)
            }
            Some(Err(e)) if e.is_retryable() => self.retry(status, &e),
            Some(Err(e)) => self.fail(status, Phase::DeleteFailed, &e),
        }
    }

    fn reject_invalid(&self, status: ResourceStatus, reason: &str) -> Step {
        error!(reason, "invalid spec");
        Step::Commit(
            status.transition(Phase::CreateFailed).with_message(reason),
            Outcome::AwaitChange,
        )
    }

    /// The remote object disappeared outside the operator
    fn vanished(&self, status: ResourceStatus, id: &RemoteId) -> Step {
        let finished_run = matches!(&status.remote, Some(RemoteState::Run(output)) if output.is_terminal());
        if finished_run {
            warn!(%id, "finished run removed outside the operator");
            let message = format!("{id} was removed outside the operator");
            return Step::Commit(status.with_message(message), Outcome::Done);
        }

        warn!(%id, "remote object vanished, recreating");
        let message = format!("{id} vanished, recreating");
        Step::Commit(
            status.clear_remote().transition(Phase::Absent).with_message(message),
            Outcome::Requeue(Duration::ZERO),
        )
    }

    fn wait_for_job(&self, status: ResourceStatus, job_name: &str) -> Step {
        debug!(job_name, "waiting for referenced job");
        Step::Commit(
            status.with_message(format!("waiting for Djob {job_name} to be created")),
            Outcome::Requeue(self.config.poll_interval),
        )
    }

    fn retry(&self, mut status: ResourceStatus, error: &ClientError) -> Step {
        status.attempts += 1;
        if self.backoff.exhausted(status.attempts) {
            error!(attempts = status.attempts, %error, "giving up after repeated failures");
            let message = format!("gave up after {} attempts: {error}", status.attempts);
            return Step::Commit(
                status.transition(Phase::ReconcileError).with_message(message),
                Outcome::AwaitChange,
            );
        }

        let delay = self.backoff.delay(status.attempts);
        warn!(attempts = status.attempts, ?delay, %error, "retryable Databricks failure");
        Step::Commit(status.with_message(error.to_string()), Outcome::Requeue(delay))
    }

    fn fail(&self, status: ResourceStatus, phase: Phase, error: &ClientError) -> Step {
        error!(%phase, %error, "Databricks rejected the request");
        Step::Commit(
            status.transition(phase).with_message(error.to_string()),
            Outcome::AwaitChange,
        )
    }

    fn commit(
        &self,
        snapshot: &Snapshot,
        previous: Phase,
        mut status: ResourceStatus,
        outcome: Outcome,
    ) -> ReconcileResult<Outcome> {
        let key = &snapshot.key;
        status.observed_generation = snapshot.generation;
        let phase = status.phase;
        let remote_id = status.remote_id.clone();
        let created = remote_id.is_some() && remote_id != snapshot.status.remote_id;

        // A result computed for a superseded desired state is never published
        let moved = self
            .store
            .desired_fingerprint(key)
            .is_some_and(|current| current != snapshot.fingerprint);
        if moved {
            self.stale_discards.fetch_add(1, Ordering::Relaxed);
            debug!(%phase, "desired state moved on, discarding reconcile result");
            if let Some(id) = remote_id.filter(|_| created) {
                self.adopt(key, id)?;
            }
            return Ok(Outcome::Requeue(Duration::ZERO));
        }

        match self.store.commit_status(key, snapshot.status.revision, status) {
            Ok(_) => {
                if phase != previous {
                    info!(from = %previous, to = %phase, "phase transition");
                }
                Ok(outcome)
            }
            Err(StoreError::StaleGeneration { expected, actual, .. }) => {
                self.stale_discards.fetch_add(1, Ordering::Relaxed);
                debug!(expected, actual, "discarding stale reconcile result");
                if let Some(id) = remote_id {
                    self.adopt(key, id)?;
                }
                Ok(Outcome::Requeue(Duration::ZERO))
            }
            Err(StoreError::NotFound(_)) => Ok(Outcome::Forget),
            Err(e) => Err(ReconcileError::from(e)),
        }
    }

    /// Records a remote id from a discarded result so the object is not leaked
    fn adopt(&self, key: &ResourceKey, id: RemoteId) -> ReconcileResult<()> {
        let Some(latest) = self.store.get(key) else {
            return Ok(());
        };
        if latest.status.remote_id.is_some() {
            return Ok(());
        }

        let mut status = (*latest.status).clone();
        status.remote_id = Some(id);
        let status = status.transition(Phase::Creating);
        match self.store.commit_status(key, latest.status.revision, status) {
            Ok(_) | Err(StoreError::StaleGeneration { .. }) | Err(StoreError::NotFound(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn resolve_job(&self, key: &ResourceKey, job_name: &str) -> Option<JobId> {
        let job = self.store.get(&key.sibling(ResourceKind::Job, job_name))?;
        if job.desired.is_absent() {
            return None;
        }
        match job.status.remote_id {
            Some(RemoteId::Job(job_id)) => Some(job_id),
            _ => None,
        }
    }

    /// Runs a remote call under the configured deadline
    async fn call<T>(&self, request: impl Future<Output = ClientResult<T>>) -> ClientResult<T> {
        tokio::time::timeout(self.config.call_timeout, request)
            .await
            .unwrap_or(Err(ClientError::Timeout))
    }

    /// Runs a remote mutation unless the desired state changed since the
    /// snapshot was taken, in which case `None` is returned
    async fn mutate<T>(
        &self,
        snapshot: &Snapshot,
        request: impl Future<Output = ClientResult<T>>,
    ) -> Option<ClientResult<T>> {
        let current = self.store.desired_fingerprint(&snapshot.key);
        if current.as_ref() != Some(&snapshot.fingerprint) {
            return None;
        }
        Some(self.call(request).await)
    }
}

fn spec_job_name(spec: &ResourceSpec) -> Option<String> {
    match spec {
        ResourceSpec::Run(run) => run.spec.job_name().map(str::to_string),
        _ => None,
    }
}
