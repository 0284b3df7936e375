//! # Kubernetes Operator Manager
//!
//! Wires the Kubernetes client, the Databricks client, the store and the
//! dispatcher together and runs them until a shutdown signal.

use crate::controller::{install_crds, KubeStatusSink, WatchBridge};
use crate::crds::{Dcluster, Djob, Run};
use crate::monitor::OperatorMonitor;
use crate::OperatorConfig;
use anyhow::Context;
use databricks_client::{DatabricksClient, RestClient};
use databricks_observability::routes::monitoring_routes;
use databricks_reconciler::Dispatcher;
use databricks_store::InMemoryStore;
use kube::Client;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Main operator manager
pub struct OperatorManager {
    config: OperatorConfig,
    client: Client,
    databricks: Arc<dyn DatabricksClient>,
    dispatcher: Arc<Dispatcher>,
    shutdown_tx: broadcast::Sender<()>,
}

impl OperatorManager {
    /// Create a new operator manager
    pub async fn new(config: OperatorConfig) -> anyhow::Result<Self> {
        let databricks: Arc<dyn DatabricksClient> = Arc::new(
            RestClient::new(config.client.clone()).context("invalid Databricks client configuration")?,
        );
        let client = Client::try_default()
            .await
            .context("failed to create Kubernetes client")?;
        let dispatcher = Dispatcher::new(
            Arc::new(InMemoryStore::new()),
            Arc::clone(&databricks),
            config.reconciler.clone(),
        )
        .with_sink(Arc::new(KubeStatusSink::new(client.clone())));
        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            config,
            client,
            databricks,
            dispatcher: Arc::new(dispatcher),
            shutdown_tx,
        })
    }

    /// Start the operator
    pub async fn run(self) -> anyhow::Result<()> {
        info!("Starting Databricks operator v{}", env!("CARGO_PKG_VERSION"));
        info!("Configuration: {:?}", self.config);

        if self.config.install_crds {
            install_crds(&self.client)
                .await
                .context("failed to install CRDs")?;
        }

        let dispatcher_handle = tokio::spawn(
            Arc::clone(&self.dispatcher).run(self.shutdown_tx.subscribe()),
        );

        let bridge = Arc::new(WatchBridge::new(
            self.client.clone(),
            Arc::clone(&self.dispatcher),
            self.config.namespace.clone(),
        ));
        let watchers = [
            tokio::spawn(Arc::clone(&bridge).run::<Dcluster>()),
            tokio::spawn(Arc::clone(&bridge).run::<Djob>()),
            tokio::spawn(Arc::clone(&bridge).run::<Run>()),
        ];

        let health_handle = if self.config.enable_monitoring {
            Some(self.start_health_server())
        } else {
            None
        };

        self.wait_for_shutdown().await;
        info!("Shutdown signal received, stopping operator...");

        for watcher in &watchers {
            watcher.abort();
        }
        let _ = self.shutdown_tx.send(());
        if let Err(e) = dispatcher_handle.await {
            error!("Dispatcher task failed: {}", e);
        }
        if let Some(handle) = health_handle {
            handle.abort();
        }

        info!("Databricks operator stopped");
        Ok(())
    }

    /// Start the health and metrics HTTP server
    fn start_health_server(&self) -> JoinHandle<()> {
        let addr = self.config.health_addr;
        let monitor = Arc::new(OperatorMonitor::new(
            Arc::clone(&self.dispatcher),
            Arc::clone(&self.databricks),
        ));
        info!("Starting health server on {}", addr);

        tokio::spawn(async move {
            let app = monitoring_routes(monitor);
            let listener = match tokio::net::TcpListener::bind(addr).await {
                Ok(listener) => listener,
                Err(e) => {
                    error!("Failed to bind health server on {}: {}", addr, e);
                    return;
                }
            };
            if let Err(e) = axum::serve(listener, app).await {
                error!("Health server failed: {}", e);
            }
        })
    }

    /// Wait for shutdown signals
    async fn wait_for_shutdown(&self) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        #[cfg(unix)]
        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut stream) => {
                    stream.recv().await;
                }
                Err(e) => {
                    error!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };
        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("Received SIGINT, shutting down");
            }
            _ = terminate => {
                info!("Received SIGTERM, shutting down");
            }
            _ = shutdown_rx.recv() => {
                info!("Received shutdown signal from internal component");
            }
        }
    }

    /// Get operator configuration
    pub fn config(&self) -> &OperatorConfig {
        &self.config
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Send shutdown signal
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}
