//! Client error taxonomy

/// Databricks client result type
pub type ClientResult<T> = Result<T, ClientError>;

/// Databricks client error types
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// Network failure, 5xx, throttling or an undecodable response
    #[error("Databricks unavailable: {0}")]
    Unavailable(String),

    #[error("Databricks call timed out")]
    Timeout,

    /// The request was understood and refused
    #[error("Databricks rejected the request: {status} {error_code} - {message}")]
    Rejected {
        status: u16,
        error_code: String,
        message: String,
    },

    #[error("Remote object not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl ClientError {
    /// Whether repeating the same call may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Timeout)
    }

    /// Refused because of the remote object's current state, e.g. an edit
    /// of a cluster that is still starting or resizing
    pub fn is_invalid_state(&self) -> bool {
        matches!(self, Self::Rejected { error_code, .. } if error_code == "INVALID_STATE")
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn rejected(status: u16, error_code: &str, message: &str) -> Self {
        Self::Rejected {
            status,
            error_code: error_code.to_string(),
            message: message.to_string(),
        }
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            Self::Timeout
        } else if error.is_builder() {
            Self::Config(error.to_string())
        } else {
            Self::Unavailable(error.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(ClientError::Unavailable("503".into()).is_retryable());
        assert!(ClientError::Timeout.is_retryable());
        assert!(!ClientError::rejected(400, "INVALID_PARAMETER_VALUE", "bad").is_retryable());
        assert!(!ClientError::NotFound("cluster 1".into()).is_retryable());
        assert!(!ClientError::Config("no host".into()).is_retryable());
    }

    #[test]
    fn test_invalid_state_classification() {
        assert!(ClientError::rejected(400, "INVALID_STATE", "cluster is PENDING").is_invalid_state());
        assert!(!ClientError::rejected(400, "INVALID_PARAMETER_VALUE", "bad").is_invalid_state());
        assert!(!ClientError::Unavailable("503".into()).is_invalid_state());
    }
}
