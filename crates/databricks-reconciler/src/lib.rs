//! # Databricks reconciler
//!
//! Drives Databricks clusters, jobs and runs toward the desired state held
//! in a [`databricks_store::ResourceStore`]:
//! - [`Reconciler`]: one level-triggered pass over a single resource
//! - [`Dispatcher`]: work queue, worker pool and periodic resync
//! - [`projector`]: status projection and readiness conditions

pub mod backoff;
pub mod condition;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod projector;
pub mod queue;
pub mod reconciler;

pub use backoff::Backoff;
pub use condition::{Condition, ConditionError, Operator, Requirement};
pub use config::ReconcilerConfig;
pub use dispatcher::{Dispatcher, DispatcherMetrics, DispatcherReport, StatusSink};
pub use error::{ReconcileError, ReconcileResult};
pub use projector::Projection;
pub use queue::WorkQueue;
pub use reconciler::{Outcome, Reconciler};
