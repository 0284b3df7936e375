//! Local validation errors for desired specs

/// Raised when a desired spec cannot be submitted as-is
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("exactly one of {0} must be set")]
    ExactlyOne(&'static str),

    #[error("{0} must not be empty")]
    Empty(&'static str),

    #[error("{field} must not be negative, got {value}")]
    Negative { field: &'static str, value: i64 },

    #[error("a task cannot be set when running job {0:?} by name")]
    TaskWithJobName(String),
}
