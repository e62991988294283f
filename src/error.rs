//! The public error taxonomy (spec §7).
//!
//! Internal plumbing keeps using [anyhow] the way the rest of this crate
//! does; this enum only exists at the boundary of a component, where a
//! caller (the orchestrator, a query, the CLI) needs a stable `code` to
//! hand to whatever transport sits in front of it.

use std::fmt;

/// One field-level validation failure, attached to [EngineError::ConfigInvalid].
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self { field: field.into(), message: message.into() }
    }
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("configuration invalid: {}", fields.iter().map(ToString::to_string).collect::<Vec<_>>().join("; "))]
    ConfigInvalid { fields: Vec<FieldError> },

    #[error("repository not found: {0}")]
    RepoNotFound(String),

    #[error("failed to read from the vcs mirror: {0}")]
    VcsReadFailed(#[source] anyhow::Error),

    #[error("failed to read from the store: {0}")]
    StoreReadFailed(#[source] anyhow::Error),

    #[error("failed to write to the store (rolled_back={rolled_back}): {source}")]
    StoreWriteFailed { rolled_back: bool, #[source] source: anyhow::Error },

    #[error("another analysis run is already active for this repository")]
    AnalysisBusy,

    #[error("run not found: {0}")]
    RunNotFound(String),

    #[error("cluster snapshot not found: {0}")]
    SnapshotNotFound(String),

    #[error("clustering request is infeasible: {0}")]
    ClusteringInfeasible(String),

    #[error("run was cancelled")]
    Cancelled,

    #[error("invalid parameter: {0}")]
    ParamInvalid(String),

    #[error("internal error: {0}")]
    Internal(#[source] anyhow::Error),
}

impl EngineError {
    /// Stable, transport-agnostic error code, as used in the `{code, message,
    /// details?}` envelope external callers are expected to shape their
    /// responses with.
    pub fn code(&self) -> &'static str {
        match self {
            Self::ConfigInvalid { .. } => "CONFIG_INVALID",
            Self::RepoNotFound(_) => "REPO_NOT_FOUND",
            Self::VcsReadFailed(_) => "VCS_READ_FAILED",
            Self::StoreReadFailed(_) => "STORE_READ_FAILED",
            Self::StoreWriteFailed { .. } => "STORE_WRITE_FAILED",
            Self::AnalysisBusy => "ANALYSIS_BUSY",
            Self::RunNotFound(_) => "RUN_NOT_FOUND",
            Self::SnapshotNotFound(_) => "SNAPSHOT_NOT_FOUND",
            Self::ClusteringInfeasible(_) => "CLUSTERING_INFEASIBLE",
            Self::Cancelled => "CANCELLED",
            Self::ParamInvalid(_) => "PARAM_INVALID",
            Self::Internal(_) => "INTERNAL",
        }
    }
}

impl From<rusqlite::Error> for EngineError {
    fn from(err: rusqlite::Error) -> Self {
        Self::StoreReadFailed(err.into())
    }
}

impl From<git2::Error> for EngineError {
    fn from(err: git2::Error) -> Self {
        Self::VcsReadFailed(err.into())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal(err.into())
    }
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        Self::Internal(err.into())
    }
}

impl From<csv::Error> for EngineError {
    fn from(err: csv::Error) -> Self {
        Self::Internal(err.into())
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
