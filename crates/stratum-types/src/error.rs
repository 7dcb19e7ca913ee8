use std::error::Error as StdError;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Boxed error used to carry an arbitrary underlying cause.
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Coarse classification shared by every runtime error.
///
/// Circuit breakers use it to decide which failures count against a
/// dependency, and step/batch records persist it next to the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    NotFound,
    AlreadyExists,
    ResourceExhausted,
    Timeout,
    Connection,
    CircuitOpen,
    BatchProcessing,
    Api,
    Cancelled,
    Unexpected,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::NotFound => "not_found",
            Self::AlreadyExists => "already_exists",
            Self::ResourceExhausted => "resource_exhausted",
            Self::Timeout => "timeout",
            Self::Connection => "connection",
            Self::CircuitOpen => "circuit_open",
            Self::BatchProcessing => "batch_processing",
            Self::Api => "api",
            Self::Cancelled => "cancelled",
            Self::Unexpected => "unexpected",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Anything that can report its [`ErrorKind`].
pub trait HasErrorKind {
    fn error_kind(&self) -> ErrorKind;
}

/// Errors surfaced by remote-service adapters (secret, object, document and
/// model services).
///
/// Adapters map their client library errors onto this small set. Anything
/// that does not fit goes through [`AdapterError::unexpected`], which keeps
/// the original error as the `source()` for diagnostics.
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("resource not found: {0}")]
    NotFound(String),

    #[error("resource already exists: {0}")]
    AlreadyExists(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("api error{}: {message}", status_suffix(.status))]
    Api { status: Option<u16>, message: String },

    #[error("unexpected error: {message}")]
    Unexpected {
        message: String,
        #[source]
        source: Option<BoxError>,
    },
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" ({s})")).unwrap_or_default()
}

impl AdapterError {
    /// Wrap an error of any other type as a generic failure.
    pub fn unexpected<E>(err: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self::Unexpected {
            message: err.to_string(),
            source: Some(Box::new(err)),
        }
    }

    pub fn api(message: impl Into<String>) -> Self {
        Self::Api {
            status: None,
            message: message.into(),
        }
    }
}

impl HasErrorKind for AdapterError {
    fn error_kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::AlreadyExists(_) => ErrorKind::AlreadyExists,
            Self::ResourceExhausted(_) => ErrorKind::ResourceExhausted,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Connection(_) => ErrorKind::Connection,
            Self::Api { .. } => ErrorKind::Api,
            Self::Unexpected { .. } => ErrorKind::Unexpected,
        }
    }
}

/// Serializable record of a failure: the human message plus the cause chain.
///
/// This is what step results, batch tickets and run artifacts carry instead
/// of live error values, so it is `Clone` and survives a JSON/YAML round trip.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub causes: Vec<String>,
}

impl ErrorDetail {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            causes: Vec::new(),
        }
    }

    /// Capture an error and walk its `source()` chain.
    pub fn from_error<E>(err: &E) -> Self
    where
        E: StdError + HasErrorKind + ?Sized,
    {
        Self {
            kind: err.error_kind(),
            message: err.to_string(),
            causes: cause_chain(err),
        }
    }
}

impl fmt::Display for ErrorDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.kind, self.message)?;
        for cause in &self.causes {
            write!(f, ": {cause}")?;
        }
        Ok(())
    }
}

/// Collect the display strings of every error below `err` in its source chain.
pub fn cause_chain<E>(err: &E) -> Vec<String>
where
    E: StdError + ?Sized,
{
    let mut causes = Vec::new();
    let mut current = err.source();
    while let Some(cause) = current {
        causes.push(cause.to_string());
        current = cause.source();
    }
    causes
}

/// Invalid runtime configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {section} configuration: {message}")]
    Invalid {
        section: &'static str,
        message: String,
    },
}

impl ConfigError {
    pub fn invalid(section: &'static str, message: impl Into<String>) -> Self {
        Self::Invalid {
            section,
            message: message.into(),
        }
    }
}

impl HasErrorKind for ConfigError {
    fn error_kind(&self) -> ErrorKind {
        ErrorKind::Validation
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Error)]
    #[error("socket reset")]
    struct SocketReset;

    #[test]
    fn test_adapter_error_display() {
        let err = AdapterError::NotFound("secret/db-password".to_string());
        assert_eq!(err.to_string(), "resource not found: secret/db-password");

        let err = AdapterError::Api {
            status: Some(503),
            message: "backend unavailable".to_string(),
        };
        assert_eq!(err.to_string(), "api error (503): backend unavailable");

        let err = AdapterError::api("throttled");
        assert_eq!(err.to_string(), "api error: throttled");
    }

    #[test]
    fn test_unexpected_preserves_source() {
        let err = AdapterError::unexpected(SocketReset);
        assert_eq!(err.error_kind(), ErrorKind::Unexpected);
        assert_eq!(
            err.source().map(|s| s.to_string()),
            Some("socket reset".to_string())
        );
    }

    #[test]
    fn test_error_detail_captures_cause_chain() {
        let err = AdapterError::unexpected(SocketReset);
        let detail = ErrorDetail::from_error(&err);
        assert_eq!(detail.kind, ErrorKind::Unexpected);
        assert_eq!(detail.message, "unexpected error: socket reset");
        assert_eq!(detail.causes, vec!["socket reset".to_string()]);
        assert!(detail.to_string().starts_with("[unexpected]"));
    }

    #[test]
    fn test_error_kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::ResourceExhausted).unwrap();
        assert_eq!(json, "\"resource_exhausted\"");
        assert_eq!(ErrorKind::CircuitOpen.to_string(), "circuit_open");
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::invalid("pool", "max_size must be greater than zero");
        assert_eq!(
            err.to_string(),
            "invalid pool configuration: max_size must be greater than zero"
        );
    }
}
