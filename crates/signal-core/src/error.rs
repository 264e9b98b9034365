//! Typed errors for the curation pipeline.
//!
//! Fetch and analysis errors are per-source and end up in the session's
//! failure list. Configuration and persistence errors are the only ones that
//! reach callers.

use std::time::Duration;
use thiserror::Error;

/// Failure to retrieve and normalize one source.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FetchError {
    #[error("network error: {0}")]
    Network(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The conversion service answered but refused the request.
    #[error("conversion service rejected request ({status}): {message}")]
    ServiceRejected {
        status: u16,
        message: String,
        /// Units the service reports as billed despite the failure.
        billed_units: Option<u64>,
    },

    #[error("conversion returned no usable content")]
    EmptyContent,
}

impl FetchError {
    pub fn billed_units(&self) -> Option<u64> {
        match self {
            FetchError::ServiceRejected { billed_units, .. } => *billed_units,
            _ => None,
        }
    }

    /// Whether another attempt could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Network(_) | FetchError::Timeout(_) => true,
            FetchError::ServiceRejected { status, .. } => *status == 429 || *status >= 500,
            FetchError::EmptyContent => false,
        }
    }
}

/// Failure to obtain a completion for fetched content.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AnalysisError {
    #[error("network error: {0}")]
    Network(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("rate limited by completion service")]
    RateLimited { retry_after: Option<Duration> },

    #[error("malformed prompt: {0}")]
    MalformedPrompt(String),

    #[error("completion service rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },
}

impl AnalysisError {
    pub fn is_transient(&self) -> bool {
        match self {
            AnalysisError::Network(_)
            | AnalysisError::Timeout(_)
            | AnalysisError::RateLimited { .. } => true,
            AnalysisError::Rejected { status, .. } => *status >= 500,
            AnalysisError::MalformedPrompt(_) => false,
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            AnalysisError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

/// Problems that prevent a sync pass from starting.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing credential: {0}")]
    MissingCredential(&'static str),

    #[error("invalid threshold: {0}")]
    InvalidThreshold(String),

    #[error("no sources configured")]
    NoSources,

    #[error("invalid source URL {url}: {reason}")]
    InvalidSource { url: String, reason: String },

    #[error("invalid setting {key}: {reason}")]
    InvalidSetting { key: &'static str, reason: String },

    #[error("failed to read configuration file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse configuration file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

/// Durable storage failed. The in-memory state is kept regardless.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// Errors surfaced by the sync facade.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error("sync task aborted: {0}")]
    Aborted(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_billed_units_only_on_rejection() {
        let rejected = FetchError::ServiceRejected {
            status: 402,
            message: "quota".to_string(),
            billed_units: Some(120),
        };
        assert_eq!(rejected.billed_units(), Some(120));
        assert_eq!(FetchError::EmptyContent.billed_units(), None);
    }

    #[test]
    fn test_transient_classification() {
        assert!(FetchError::Timeout(Duration::from_secs(1)).is_transient());
        assert!(!FetchError::EmptyContent.is_transient());
        assert!(AnalysisError::RateLimited { retry_after: None }.is_transient());
        assert!(!AnalysisError::MalformedPrompt("empty".into()).is_transient());
        assert!(!AnalysisError::Rejected {
            status: 401,
            message: "bad key".into()
        }
        .is_transient());
    }
}
