//! Health and metrics of the running operator

use async_trait::async_trait;
use chrono::Utc;
use databricks_api::Phase;
use databricks_client::DatabricksClient;
use databricks_observability::{ControllerMetrics, HealthCheck, HealthMonitor, HealthStatus};
use databricks_reconciler::Dispatcher;
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;

/// Health monitor backed by the dispatcher and the Databricks client
pub struct OperatorMonitor {
    dispatcher: Arc<Dispatcher>,
    client: Arc<dyn DatabricksClient>,
    started: Instant,
}

impl OperatorMonitor {
    pub fn new(dispatcher: Arc<Dispatcher>, client: Arc<dyn DatabricksClient>) -> Self {
        Self {
            dispatcher,
            client,
            started: Instant::now(),
        }
    }

    /// Databricks unreachable degrades the operator; reconciles keep retrying
    async fn databricks_check(&self) -> HealthCheck {
        let start = Instant::now();
        let deadline = self.dispatcher.config().call_timeout;
        let result = tokio::time::timeout(deadline, self.client.health_check()).await;
        let elapsed = start.elapsed();
        match result {
            Ok(Ok(true)) => HealthCheck::new("databricks", HealthStatus::Up, elapsed),
            Ok(Ok(false)) => HealthCheck::new("databricks", HealthStatus::Degraded, elapsed)
                .with_message("workspace reported unhealthy"),
            Ok(Err(e)) => HealthCheck::new("databricks", HealthStatus::Degraded, elapsed)
                .with_message(e.to_string()),
            Err(_) => HealthCheck::new("databricks", HealthStatus::Degraded, elapsed)
                .with_message("health check timed out"),
        }
    }

    fn reconcile_check(&self) -> HealthCheck {
        let start = Instant::now();
        let report = self.dispatcher.report();
        let failed = [Phase::CreateFailed, Phase::DeleteFailed, Phase::ReconcileError]
            .iter()
            .map(|phase| report.phases.get(phase.as_str()).copied().unwrap_or(0))
            .sum::<usize>();

        let status = if failed == 0 {
            HealthStatus::Up
        } else {
            HealthStatus::Degraded
        };
        let check = HealthCheck::new("reconciler", status, start.elapsed())
            .with_details(json!({ "resources": report.resources, "phases": report.phases }));
        if failed == 0 {
            check
        } else {
            check.with_message(format!("{failed} resources in a failure phase"))
        }
    }
}

#[async_trait]
impl HealthMonitor for OperatorMonitor {
    async fn get_overall_health(&self) -> HealthStatus {
        HealthStatus::combine(&self.run_health_checks().await)
    }

    async fn run_health_checks(&self) -> Vec<HealthCheck> {
        vec![self.databricks_check().await, self.reconcile_check()]
    }

    async fn get_metrics(&self) -> ControllerMetrics {
        let report = self.dispatcher.report();
        ControllerMetrics {
            timestamp: Utc::now(),
            uptime_seconds: self.started.elapsed().as_secs(),
            resources: report.resources,
            phases: report.phases,
            reconciles: report.reconciles,
            failures: report.failures,
            stale_discards: report.stale_discards,
            queue_depth: report.queue_depth,
            delayed: report.delayed,
            max_in_flight_per_key: report.max_in_flight_per_key,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use databricks_api::{ClusterSpec, ResourceKey, ResourceSpec};
    use databricks_client::{ClientError, FakeClient, Operation};
    use databricks_reconciler::ReconcilerConfig;
    use databricks_store::InMemoryStore;

    fn monitor(client: Arc<FakeClient>) -> (Arc<Dispatcher>, OperatorMonitor) {
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::new(InMemoryStore::new()),
            client.clone(),
            ReconcilerConfig::default(),
        ));
        (dispatcher.clone(), OperatorMonitor::new(dispatcher, client))
    }

    #[tokio::test]
    async fn test_healthy_operator() {
        let (_, monitor) = monitor(Arc::new(FakeClient::new()));
        assert_eq!(monitor.get_overall_health().await, HealthStatus::Up);
        assert_eq!(monitor.run_health_checks().await.len(), 2);
    }

    #[tokio::test]
    async fn test_unreachable_workspace_degrades() {
        let client = Arc::new(FakeClient::new());
        client.fail(
            Operation::HealthCheck,
            ClientError::Unavailable("connection refused".into()),
        );
        let (_, monitor) = monitor(client);

        let checks = monitor.run_health_checks().await;
        assert_eq!(checks[0].status, HealthStatus::Degraded);
        assert!(checks[0].message.as_deref().unwrap().contains("connection refused"));
    }

    #[tokio::test]
    async fn test_failed_resources_degrade_and_show_in_metrics() {
        let client = Arc::new(FakeClient::new());
        client.fail(
            Operation::CreateCluster,
            ClientError::rejected(400, "INVALID_PARAMETER_VALUE", "unknown node type"),
        );
        let (dispatcher, monitor) = monitor(client);
        let key = ResourceKey::cluster("default", "test-cluster");
        dispatcher
            .apply(
                &key,
                ResourceSpec::cluster(
                    "test-cluster",
                    ClusterSpec::new("5.3.x-scala2.11", "Standard_D3_v2", 2),
                ),
            )
            .unwrap();
        dispatcher.process(&key).await;

        let checks = monitor.run_health_checks().await;
        assert_eq!(checks[1].status, HealthStatus::Degraded);
        assert_eq!(monitor.get_overall_health().await, HealthStatus::Degraded);

        let metrics = monitor.get_metrics().await;
        assert_eq!(metrics.resources, 1);
        assert_eq!(metrics.phases.get("CreateFailed"), Some(&1));
        assert_eq!(metrics.reconciles, 1);
    }
}
