//! Error types for the archive core

use thiserror::Error;

/// Result type alias for archive operations
pub type Result<T> = std::result::Result<T, ArchiveError>;

/// Error types that can occur during study intake and reconciliation
#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("DICOM object error: {0}")]
    Dicom(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Header index error: {0}")]
    Index(#[from] study_index::IndexError),

    #[error("Instance {sop_instance_uid} already exists with different content")]
    InstanceAlreadyExists { sop_instance_uid: String },

    #[error("No writable filesystem available")]
    NoWritableFilesystem,

    #[error("Study {0} is not in an updatable state")]
    StudyNotUpdatable(String),

    #[error("Rule error: {0}")]
    Rule(#[from] crate::rules::RuleCompileError),

    #[error("Command failed: {0}")]
    Command(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ArchiveError {
    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new DICOM object error
    pub fn dicom(msg: impl std::fmt::Display) -> Self {
        Self::Dicom(msg.to_string())
    }

    /// Create a new store error
    pub fn store(msg: impl std::fmt::Display) -> Self {
        Self::Store(msg.to_string())
    }

    /// Create a new command error
    pub fn command(msg: impl Into<String>) -> Self {
        Self::Command(msg.into())
    }

    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Check if this error is recoverable: the caller should reschedule or
    /// route to a fallback path instead of failing the work item for good.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ArchiveError::InstanceAlreadyExists { .. }
                | ArchiveError::NoWritableFilesystem
                | ArchiveError::Io(_)
        )
    }
}
