//! Databricks operator entry point

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use databricks_operator::{crds_yaml, OperatorConfig, OperatorManager};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Main CLI structure
#[derive(Parser)]
#[command(name = "databricks-operator")]
#[command(about = "Kubernetes operator for Databricks clusters, jobs and runs")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Emit logs as JSON
    #[arg(long, env = "LOG_JSON", global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the operator
    Run(RunArgs),

    /// Print the custom resource definitions as YAML
    Crd,
}

#[derive(Args)]
struct RunArgs {
    /// YAML configuration file; flags override its values
    #[arg(short, long, env = "OPERATOR_CONFIG")]
    config: Option<PathBuf>,

    /// Namespace to watch, all namespaces when unset
    #[arg(short, long, env = "WATCH_NAMESPACE")]
    namespace: Option<String>,

    /// Databricks workspace URL
    #[arg(long, env = "DATABRICKS_HOST")]
    host: Option<String>,

    /// Databricks bearer token
    #[arg(long, env = "DATABRICKS_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Number of reconcile workers
    #[arg(long, env = "RECONCILE_WORKERS")]
    workers: Option<usize>,

    /// Address of the health and metrics server
    #[arg(long, env = "HEALTH_ADDR")]
    health_addr: Option<SocketAddr>,

    /// Do not create missing CRDs on startup
    #[arg(long)]
    skip_crd_install: bool,
}

impl RunArgs {
    fn into_config(self) -> Result<OperatorConfig> {
        let mut config = match &self.config {
            Some(path) => OperatorConfig::load(path)
                .with_context(|| format!("failed to load {}", path.display()))?,
            None => OperatorConfig::default(),
        };

        if let Some(namespace) = self.namespace {
            config.namespace = Some(namespace);
        }
        if let Some(host) = self.host {
            config.client.host = host;
        }
        if let Some(token) = self.token {
            config.client.token = Some(token);
        }
        if let Some(workers) = self.workers {
            config.reconciler.workers = workers;
        }
        if let Some(addr) = self.health_addr {
            config.health_addr = addr;
        }
        if self.skip_crd_install {
            config.install_crds = false;
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if cli.log_json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    match cli.command {
        Commands::Crd => {
            print!("{}", crds_yaml()?);
            Ok(())
        }
        Commands::Run(args) => {
            let config = args.into_config()?;
            OperatorManager::new(config).await?.run().await
        }
    }
}
