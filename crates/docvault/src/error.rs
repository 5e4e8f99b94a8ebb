//! Error types for the document vault

use serde::Serialize;
use thiserror::Error;

use crate::models::MutationStage;

/// Result type alias for vault operations
pub type VaultResult<T> = Result<T, VaultError>;

/// Vault error types
#[derive(Debug, Error)]
pub enum VaultError {
    #[error("Invalid path {path}: {reason}")]
    InvalidPath { path: String, reason: String },

    #[error("Not found: {path}")]
    NotFound { path: String },

    #[error("Conflict at {path}: {reason}")]
    Conflict { path: String, reason: String },

    #[error("Path already indexed: {path}")]
    DuplicatePath { path: String },

    #[error("Forbidden: {reason}")]
    Forbidden { reason: String },

    #[error("Renaming {from} to {to} would change the file extension")]
    ExtensionMismatch { from: String, to: String },

    #[error("Folder is not empty: {path} (pass force to delete recursively)")]
    NonEmptyFolder { path: String },

    #[error("Disk and index disagree about {path}: {detail}")]
    Drift { path: String, detail: String },

    #[error("Operation on {path} failed at {stage}: {reason}")]
    Partial {
        stage: MutationStage,
        path: String,
        reason: String,
    },

    #[error("Team not found: {0}")]
    TeamNotFound(String),

    #[error("Team already exists: {name}")]
    TeamExists { name: String },

    #[error("Member not found in team: {user_id}")]
    MemberNotFound { user_id: String },

    #[error("Member already exists in team: {user_id}")]
    MemberExists { user_id: String },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<sqlx::Error> for VaultError {
    fn from(err: sqlx::Error) -> Self {
        VaultError::Database(err.to_string())
    }
}

impl From<std::io::Error> for VaultError {
    fn from(err: std::io::Error) -> Self {
        VaultError::Io(err.to_string())
    }
}

impl From<walkdir::Error> for VaultError {
    fn from(err: walkdir::Error) -> Self {
        VaultError::Io(err.to_string())
    }
}

/// Closed failure taxonomy exposed to callers
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidPath,
    NotFound,
    Conflict,
    Forbidden,
    ExtensionMismatch,
    NonEmptyFolder,
    Drift,
    PartialFailure,
    Internal,
}

/// Typed failure record handed back to the transport layer
#[derive(Debug, Clone, Serialize)]
pub struct Failure {
    pub kind: ErrorKind,
    pub code: String,
    pub message: String,
}

impl VaultError {
    /// Convert to a stable error code
    pub fn code(&self) -> &'static str {
        match self {
            VaultError::InvalidPath { .. } => "INVALID_PATH",
            VaultError::NotFound { .. } => "NOT_FOUND",
            VaultError::Conflict { .. } => "CONFLICT",
            VaultError::DuplicatePath { .. } => "DUPLICATE_PATH",
            VaultError::Forbidden { .. } => "FORBIDDEN",
            VaultError::ExtensionMismatch { .. } => "EXTENSION_MISMATCH",
            VaultError::NonEmptyFolder { .. } => "NON_EMPTY_FOLDER",
            VaultError::Drift { .. } => "DRIFT",
            VaultError::Partial { .. } => "PARTIAL_FAILURE",
            VaultError::TeamNotFound(_) => "TEAM_NOT_FOUND",
            VaultError::TeamExists { .. } => "TEAM_EXISTS",
            VaultError::MemberNotFound { .. } => "MEMBER_NOT_FOUND",
            VaultError::MemberExists { .. } => "MEMBER_EXISTS",
            VaultError::Validation(_) => "VALIDATION_ERROR",
            VaultError::Database(_) => "DATABASE_ERROR",
            VaultError::Io(_) => "IO_ERROR",
            VaultError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Map onto the closed failure taxonomy
    pub fn kind(&self) -> ErrorKind {
        match self {
            VaultError::InvalidPath { .. } | VaultError::Validation(_) => ErrorKind::InvalidPath,

            VaultError::NotFound { .. }
            | VaultError::TeamNotFound(_)
            | VaultError::MemberNotFound { .. } => ErrorKind::NotFound,

            VaultError::Conflict { .. }
            | VaultError::DuplicatePath { .. }
            | VaultError::TeamExists { .. }
            | VaultError::MemberExists { .. } => ErrorKind::Conflict,

            VaultError::Forbidden { .. } => ErrorKind::Forbidden,
            VaultError::ExtensionMismatch { .. } => ErrorKind::ExtensionMismatch,
            VaultError::NonEmptyFolder { .. } => ErrorKind::NonEmptyFolder,
            VaultError::Drift { .. } => ErrorKind::Drift,
            VaultError::Partial { .. } => ErrorKind::PartialFailure,

            VaultError::Database(_)
            | VaultError::Io(_)
            | VaultError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// True when the request was rejected before any store was touched and
    /// can be resubmitted once the input is corrected.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::InvalidPath
                | ErrorKind::Conflict
                | ErrorKind::Forbidden
                | ErrorKind::ExtensionMismatch
        )
    }

    pub fn to_failure(&self) -> Failure {
        Failure {
            kind: self.kind(),
            code: self.code().to_string(),
            message: self.to_string(),
        }
    }

    pub(crate) fn invalid_path(path: impl Into<String>, reason: impl Into<String>) -> Self {
        VaultError::InvalidPath {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn not_found(path: impl Into<String>) -> Self {
        VaultError::NotFound { path: path.into() }
    }

    pub(crate) fn conflict(path: impl Into<String>, reason: impl Into<String>) -> Self {
        VaultError::Conflict {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn drift(path: impl Into<String>, detail: impl Into<String>) -> Self {
        VaultError::Drift {
            path: path.into(),
            detail: detail.into(),
        }
    }

    pub(crate) fn partial(
        stage: MutationStage,
        path: impl Into<String>,
        reason: impl std::fmt::Display,
    ) -> Self {
        VaultError::Partial {
            stage,
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

/// True if the database rejected a write because of a UNIQUE constraint
pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => db.is_unique_violation(),
        _ => false,
    }
}
