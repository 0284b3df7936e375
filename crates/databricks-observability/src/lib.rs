//! Health and controller metrics abstractions and Axum routes

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Up,
    Down,
    Degraded,
}

impl HealthStatus {
    /// Overall status of a set of checks: down if any is down, degraded if
    /// any is degraded
    pub fn combine<'a>(checks: impl IntoIterator<Item = &'a HealthCheck>) -> Self {
        checks.into_iter().fold(Self::Up, |overall, check| {
            match (overall, check.status) {
                (Self::Down, _) | (_, Self::Down) => Self::Down,
                (Self::Degraded, _) | (_, Self::Degraded) => Self::Degraded,
                _ => Self::Up,
            }
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheck {
    pub name: String,
    pub status: HealthStatus,
    pub timestamp: DateTime<Utc>,
    pub duration_ms: u64,
    pub message: Option<String>,
    pub details: Option<serde_json::Value>,
}

impl HealthCheck {
    pub fn new(name: &str, status: HealthStatus, duration: Duration) -> Self {
        Self {
            name: name.to_string(),
            status,
            timestamp: Utc::now(),
            duration_ms: u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
            message: None,
            details: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Reconcile counters of the running controller
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ControllerMetrics {
    pub timestamp: DateTime<Utc>,
    pub uptime_seconds: u64,
    /// Resources known to the store
    pub resources: usize,
    /// Resource count per phase
    pub phases: BTreeMap<String, usize>,
    pub reconciles: u64,
    pub failures: u64,
    /// Reconcile results dropped because the status moved on
    pub stale_discards: u64,
    pub queue_depth: usize,
    pub delayed: usize,
    pub max_in_flight_per_key: usize,
}

#[async_trait::async_trait]
pub trait HealthMonitor: Send + Sync + 'static {
    async fn get_overall_health(&self) -> HealthStatus;
    async fn run_health_checks(&self) -> Vec<HealthCheck>;
    async fn get_metrics(&self) -> ControllerMetrics;
}

pub mod routes {
    use super::*;
    use axum::{
        extract::State,
        http::StatusCode,
        response::{IntoResponse, Json},
        routing::get,
        Router,
    };
    use std::sync::Arc;
    use tower_http::trace::TraceLayer;

    pub fn monitoring_routes(monitor: Arc<dyn HealthMonitor>) -> Router {
        Router::new()
            .route("/health", get(health))
            .route("/health/detailed", get(health_detailed))
            .route("/ready", get(ready))
            .route("/metrics", get(metrics))
            .layer(TraceLayer::new_for_http())
            .with_state(monitor)
    }

    async fn health(State(m): State<Arc<dyn HealthMonitor>>) -> impl IntoResponse {
        let status = m.get_overall_health().await;
        let status_code = match status {
            HealthStatus::Up => StatusCode::OK,
            HealthStatus::Degraded => StatusCode::OK,
            HealthStatus::Down => StatusCode::SERVICE_UNAVAILABLE,
        };
        (status_code, Json(status))
    }

    async fn health_detailed(State(m): State<Arc<dyn HealthMonitor>>) -> impl IntoResponse {
        let checks = m.run_health_checks().await;
        Json(checks)
    }

    // Degraded still serves traffic; only a failed check takes the pod out
    async fn ready(State(m): State<Arc<dyn HealthMonitor>>) -> impl IntoResponse {
        let checks = m.run_health_checks().await;
        match HealthStatus::combine(&checks) {
            HealthStatus::Down => (StatusCode::SERVICE_UNAVAILABLE, Json(checks)),
            _ => (StatusCode::OK, Json(checks)),
        }
    }

    async fn metrics(State(m): State<Arc<dyn HealthMonitor>>) -> impl IntoResponse {
        let s = m.get_metrics().await;
        Json(s)
    }
}
