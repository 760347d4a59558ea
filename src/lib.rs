//! Worklist - a synchronous client layer for workflow worklists.
//!
//! This library lets a caller open an authenticated [`Session`] against a
//! process-orchestration backend, query the worklist with server-side
//! [`WorklistCriteria`], open and complete [`WorklistItem`]s, and read or append
//! comments and attachments on process instances.
//!
//! The backend itself sits behind the [`backend::Backend`] trait. Two
//! implementations ship with the crate:
//! - [`backend::SqliteEngine`] - a local reference engine (embedding, tests)
//! - [`backend::HttpBackend`] - a JSON-over-HTTP transport to a remote engine

pub mod attachments;
pub mod backend;
pub mod config;
pub mod files;
pub mod item;
pub mod models;
pub mod process;
pub mod session;
pub mod worklist;

pub use attachments::{Attachment, AttachmentStream};
pub use config::ConnectionConfig;
pub use item::{Action, WorklistItem};
pub use models::criteria::{
    CriteriaValue, WcCompare, WcField, WcLogical, WcSortOrder, WorklistCriteria,
    WorklistCriteriaBuilder,
};
pub use models::fields::{DataFields, FieldKind, FieldValue};
pub use models::{Comment, Identity, ItemStatus, ProcessStatus, Scope, SerialNumber};
pub use process::ProcessInstance;
pub use session::{ConnectionState, Session};
pub use worklist::Worklist;

use serde::{Deserialize, Serialize};

/// Crate version, as compiled.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
/// Short git commit the crate was built from, or "unknown".
pub const GIT_COMMIT: &str = env!("WORKLIST_GIT_COMMIT");
/// UTC timestamp of the build.
pub const BUILD_TIMESTAMP: &str = env!("WORKLIST_BUILD_TIMESTAMP");

/// Discriminant of [`Error`], stable across the wire.
///
/// Remote backends report failures as `{ "kind": ..., "message": ... }` and the
/// client maps them back with [`Error::from_remote`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Connectivity,
    Authentication,
    Authorization,
    Permission,
    InvalidState,
    UnknownAction,
    NotFound,
    StaleReference,
    AlreadyUploaded,
    InvalidInput,
    Io,
    Internal,
}

impl ErrorKind {
    /// Whether the caller may retry the same call unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::Connectivity)
    }

    /// Get the string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Connectivity => "connectivity",
            ErrorKind::Authentication => "authentication",
            ErrorKind::Authorization => "authorization",
            ErrorKind::Permission => "permission",
            ErrorKind::InvalidState => "invalid_state",
            ErrorKind::UnknownAction => "unknown_action",
            ErrorKind::NotFound => "not_found",
            ErrorKind::StaleReference => "stale_reference",
            ErrorKind::AlreadyUploaded => "already_uploaded",
            ErrorKind::InvalidInput => "invalid_input",
            ErrorKind::Io => "io",
            ErrorKind::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Library-level error type for worklist operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Connectivity error: {0}")]
    Connectivity(String),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Not authorized: {0}")]
    Authorization(String),

    #[error("Permission denied: {0}")]
    Permission(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Unknown action: {0}")]
    UnknownAction(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Stale reference: {0}")]
    StaleReference(String),

    #[error("Attachment content already uploaded: {0}")]
    AlreadyUploaded(String),

    #[error("Type mismatch for field '{field}': expected {expected}, found {found}")]
    TypeMismatch {
        field: String,
        expected: FieldKind,
        found: FieldKind,
    },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Connectivity(_) => ErrorKind::Connectivity,
            Error::Authentication(_) => ErrorKind::Authentication,
            Error::Authorization(_) => ErrorKind::Authorization,
            Error::Permission(_) => ErrorKind::Permission,
            Error::InvalidState(_) => ErrorKind::InvalidState,
            Error::UnknownAction(_) => ErrorKind::UnknownAction,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::StaleReference(_) => ErrorKind::StaleReference,
            Error::AlreadyUploaded(_) => ErrorKind::AlreadyUploaded,
            Error::TypeMismatch { .. } | Error::InvalidInput(_) | Error::Config(_) => {
                ErrorKind::InvalidInput
            }
            Error::Io(_) => ErrorKind::Io,
            Error::Json(_) | Error::Database(_) | Error::Other(_) => ErrorKind::Internal,
        }
    }

    /// Rebuild an error reported by a remote backend.
    pub fn from_remote(kind: ErrorKind, message: String) -> Self {
        match kind {
            ErrorKind::Connectivity => Error::Connectivity(message),
            ErrorKind::Authentication => Error::Authentication(message),
            ErrorKind::Authorization => Error::Authorization(message),
            ErrorKind::Permission => Error::Permission(message),
            ErrorKind::InvalidState => Error::InvalidState(message),
            ErrorKind::UnknownAction => Error::UnknownAction(message),
            ErrorKind::NotFound => Error::NotFound(message),
            ErrorKind::StaleReference => Error::StaleReference(message),
            ErrorKind::AlreadyUploaded => Error::AlreadyUploaded(message),
            ErrorKind::InvalidInput => Error::InvalidInput(message),
            ErrorKind::Io => Error::Io(std::io::Error::other(message)),
            ErrorKind::Internal => Error::Other(message),
        }
    }
}

/// Result type alias for worklist operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_connectivity_is_retryable() {
        assert!(ErrorKind::Connectivity.is_retryable());
        assert!(!ErrorKind::Authentication.is_retryable());
        assert!(!ErrorKind::InvalidState.is_retryable());
    }

    #[test]
    fn test_remote_error_keeps_kind() {
        let kinds = [
            ErrorKind::Authorization,
            ErrorKind::UnknownAction,
            ErrorKind::AlreadyUploaded,
            ErrorKind::StaleReference,
        ];
        for kind in kinds {
            let err = Error::from_remote(kind, "boom".to_string());
            assert_eq!(err.kind(), kind);
            assert!(err.to_string().contains("boom"));
        }
    }

    #[test]
    fn test_type_mismatch_is_invalid_input() {
        let err = Error::TypeMismatch {
            field: "Amount".to_string(),
            expected: FieldKind::Integer,
            found: FieldKind::String,
        };
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
        assert_eq!(
            err.to_string(),
            "Type mismatch for field 'Amount': expected integer, found string"
        );
    }

    #[test]
    fn test_error_kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::AlreadyUploaded).unwrap();
        assert_eq!(json, "\"already_uploaded\"");
    }
}
