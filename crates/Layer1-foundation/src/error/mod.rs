//! Error types for iso
//!
//! Every fallible operation in the workspace returns [`Result`]. Engine failures keep
//! a structured [`EngineErrorKind`] so callers can absorb the benign outcomes of
//! concurrent, redundant calls without matching on message text.

use std::fmt;
use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Category of a container engine failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineErrorKind {
    /// The resource does not exist (container, network, volume, image, exec)
    NotFound,
    /// A resource with the same name already exists or is already attached
    AlreadyExists,
    /// Removal or another state change is already in progress
    InProgress,
    /// The resource is already in the requested state (e.g. stopping a stopped container)
    NotModified,
    /// Any other state conflict reported by the engine
    Conflict,
    /// Transport failures, daemon errors, unexpected responses
    Other,
}

impl EngineErrorKind {
    /// Classify an engine response from its HTTP status code and message text.
    ///
    /// Status codes win; the message text is consulted when the status is ambiguous
    /// (409 covers both "already in use" and "already in progress") or absent.
    pub fn classify(status: Option<u16>, message: &str) -> Self {
        let lower = message.to_lowercase();

        if lower.contains("already in progress") {
            return Self::InProgress;
        }
        if lower.contains("already exists") || lower.contains("already in use") {
            return Self::AlreadyExists;
        }

        match status {
            Some(404) => Self::NotFound,
            Some(304) => Self::NotModified,
            Some(409) => Self::Conflict,
            _ if lower.contains("no such container") || lower.contains("not found") => {
                Self::NotFound
            }
            _ => Self::Other,
        }
    }
}

impl fmt::Display for EngineErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::NotFound => "not found",
            Self::AlreadyExists => "already exists",
            Self::InProgress => "already in progress",
            Self::NotModified => "not modified",
            Self::Conflict => "conflict",
            Self::Other => "engine failure",
        };
        f.write_str(label)
    }
}

/// iso error type
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Configuration
    // ========================================================================
    #[error("Configuration error: {0}")]
    Config(String),

    // ========================================================================
    // Container engine
    // ========================================================================
    #[error("Engine error: failed to {op} ({kind}): {message}")]
    Engine {
        op: String,
        kind: EngineErrorKind,
        message: String,
    },

    #[error("Service {service} not ready after {attempts} attempts")]
    ReadinessTimeout { service: String, attempts: u32 },

    // ========================================================================
    // Execution
    // ========================================================================
    #[error("Cancelled")]
    Cancelled,

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Not found: {0}")]
    NotFound(String),

    // ========================================================================
    // External conversions
    // ========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Engine error helper
    pub fn engine(op: impl Into<String>, kind: EngineErrorKind, message: impl Into<String>) -> Self {
        Error::Engine {
            op: op.into(),
            kind,
            message: message.into(),
        }
    }

    /// Engine category, if this is an engine error
    pub fn engine_kind(&self) -> Option<EngineErrorKind> {
        match self {
            Error::Engine { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// Outcomes of concurrent or redundant calls that count as success
    pub fn is_race_absorbable(&self) -> bool {
        matches!(
            self.engine_kind(),
            Some(
                EngineErrorKind::NotFound
                    | EngineErrorKind::AlreadyExists
                    | EngineErrorKind::InProgress
                    | EngineErrorKind::NotModified
            )
        )
    }

    pub fn is_not_found(&self) -> bool {
        self.engine_kind() == Some(EngineErrorKind::NotFound)
    }

    pub fn is_already_exists(&self) -> bool {
        self.engine_kind() == Some(EngineErrorKind::AlreadyExists)
    }

    /// Errors that should be shown to the user as a single line
    pub fn is_user_facing(&self) -> bool {
        matches!(
            self,
            Error::Config(_)
                | Error::InvalidInput(_)
                | Error::NotFound(_)
                | Error::ReadinessTimeout { .. }
                | Error::Cancelled
        )
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Internal(s)
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Internal(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_by_status() {
        assert_eq!(
            EngineErrorKind::classify(Some(404), "No such container: abc"),
            EngineErrorKind::NotFound
        );
        assert_eq!(
            EngineErrorKind::classify(Some(304), ""),
            EngineErrorKind::NotModified
        );
        assert_eq!(
            EngineErrorKind::classify(Some(500), "boom"),
            EngineErrorKind::Other
        );
    }

    #[test]
    fn test_classify_conflicts_by_message() {
        assert_eq!(
            EngineErrorKind::classify(
                Some(409),
                "removal of container abc is already in progress"
            ),
            EngineErrorKind::InProgress
        );
        assert_eq!(
            EngineErrorKind::classify(
                Some(409),
                "Conflict. The container name \"/demo-shell\" is already in use"
            ),
            EngineErrorKind::AlreadyExists
        );
        assert_eq!(
            EngineErrorKind::classify(Some(403), "endpoint with name x already exists in network y"),
            EngineErrorKind::AlreadyExists
        );
        assert_eq!(
            EngineErrorKind::classify(Some(409), "container is paused"),
            EngineErrorKind::Conflict
        );
    }

    #[test]
    fn test_classify_without_status() {
        assert_eq!(
            EngineErrorKind::classify(None, "Error: No such container: x"),
            EngineErrorKind::NotFound
        );
    }

    #[test]
    fn test_absorbable() {
        assert!(Error::engine("remove container", EngineErrorKind::InProgress, "x").is_race_absorbable());
        assert!(Error::engine("stop container", EngineErrorKind::NotModified, "").is_race_absorbable());
        assert!(!Error::engine("create container", EngineErrorKind::Other, "x").is_race_absorbable());
        assert!(!Error::engine("start container", EngineErrorKind::Conflict, "x").is_race_absorbable());
        assert!(!Error::Config("x".into()).is_race_absorbable());
    }

    #[test]
    fn test_display() {
        let err = Error::engine("create network", EngineErrorKind::Other, "daemon down");
        assert_eq!(
            err.to_string(),
            "Engine error: failed to create network (engine failure): daemon down"
        );
        let err = Error::ReadinessTimeout {
            service: "db".into(),
            attempts: 30,
        };
        assert_eq!(err.to_string(), "Service db not ready after 30 attempts");
    }
}
