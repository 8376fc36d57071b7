//! Cluster Error Types

use thiserror::Error;

/// Result type alias for cluster operations
pub type Result<T> = std::result::Result<T, Error>;

/// Cluster control plane error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Cluster protocol errors
    #[error("Cluster is not configured on this node")]
    NotConfigured,

    #[error("Operation requires role {expected}, this node is {actual}")]
    RoleMismatch { expected: String, actual: String },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Invalid cluster secret")]
    Unauthorized,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("Promotion failed: {0}")]
    PromotionFailed(String),

    #[error("External operation failed: {0}")]
    ExternalOperation(String),

    // Storage errors
    #[error("State store error: {0}")]
    Store(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    // Network errors
    #[error("Network error: {0}")]
    Network(String),

    #[error("Connection failed to {address}: {reason}")]
    ConnectionFailed { address: String, reason: String },

    #[error("Connection timeout to {0}")]
    ConnectionTimeout(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Build a role mismatch error from the expected and actual role names
    pub fn role_mismatch(expected: impl ToString, actual: impl ToString) -> Self {
        Error::RoleMismatch {
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }

    /// HTTP status code for this error category
    pub fn status_code(&self) -> u16 {
        match self {
            Error::NotConfigured
            | Error::RoleMismatch { .. }
            | Error::Conflict(_)
            | Error::InvalidRequest(_) => 400,
            Error::Unauthorized => 401,
            Error::Forbidden(_) => 403,
            Error::NotFound(_) => 404,
            Error::PromotionFailed(_) | Error::ExternalOperation(_) => 502,
            Error::ConnectionFailed { .. } | Error::ConnectionTimeout(_) | Error::Network(_) => 502,
            _ => 500,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ConnectionTimeout(_) | Error::ConnectionFailed { .. } | Error::Network(_)
        )
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::Store(format!("SQLite error: {}", e))
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            let url = e.url().map(|u| u.to_string()).unwrap_or_default();
            Error::ConnectionTimeout(url)
        } else if e.is_connect() {
            Error::ConnectionFailed {
                address: e.url().map(|u| u.to_string()).unwrap_or_default(),
                reason: e.to_string(),
            }
        } else {
            Error::Network(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(Error::NotConfigured.status_code(), 400);
        assert_eq!(Error::role_mismatch("main", "secondary").status_code(), 400);
        assert_eq!(Error::Unauthorized.status_code(), 401);
        assert_eq!(Error::NotFound("node 7".into()).status_code(), 404);
        assert_eq!(Error::Conflict("busy".into()).status_code(), 400);
        assert_eq!(Error::InvalidRequest("bad json".into()).status_code(), 400);
        assert_eq!(Error::Forbidden("main".into()).status_code(), 403);
        assert_eq!(Error::Internal("x".into()).status_code(), 500);
    }

    #[test]
    fn test_role_mismatch_message() {
        let err = Error::role_mismatch("main", "secondary");
        assert_eq!(err.to_string(), "Operation requires role main, this node is secondary");
    }
}
