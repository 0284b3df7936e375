//! # Databricks API model
//!
//! Typed model of the Databricks resources reconciled by the operator:
//! desired specs for clusters, jobs and runs, the remote states observed
//! through the REST API, and the status documents pipelines poll.

pub mod cluster;
pub mod error;
pub mod job;
pub mod library;
pub mod resource;
pub mod run;
pub mod status;

pub use cluster::*;
pub use error::*;
pub use job::*;
pub use library::*;
pub use resource::*;
pub use run::*;
pub use status::*;

/// API group of the custom resources
pub const GROUP: &str = "databricks.microsoft.com";

/// API version of the custom resources
pub const VERSION: &str = "v1alpha1";
