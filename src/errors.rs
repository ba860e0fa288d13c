//! Typed error hierarchy for the pipeline.
//!
//! Three top-level enums cover the three subsystems:
//! - `CollaboratorError` — failures of external LLM/service collaborators
//! - `SandboxError` — container and scratch-directory failures
//! - `PipelineError` — orchestrator-level failures

use thiserror::Error;

/// Errors from an external collaborator call. Every collaborator boundary
/// returns this explicitly; missing configuration is a value, not a caught
/// exception.
#[derive(Debug, Error)]
pub enum CollaboratorError {
    #[error("Collaborator '{name}' is not configured: {reason}")]
    NotConfigured { name: String, reason: String },

    #[error("Collaborator '{name}' call failed: {message}")]
    CallFailed { name: String, message: String },

    #[error("Collaborator '{name}' returned a malformed response: {message}")]
    MalformedResponse { name: String, message: String },
}

impl CollaboratorError {
    pub fn call_failed(name: &str, message: impl Into<String>) -> Self {
        Self::CallFailed {
            name: name.to_string(),
            message: message.into(),
        }
    }

    /// The collaborator this error came from.
    pub fn collaborator(&self) -> &str {
        match self {
            Self::NotConfigured { name, .. }
            | Self::CallFailed { name, .. }
            | Self::MalformedResponse { name, .. } => name,
        }
    }
}

/// Errors from the sandbox subsystem.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("Docker engine unavailable: {0}")]
    EngineUnavailable(String),

    #[error("Failed to prepare scratch directory: {0}")]
    ScratchDir(#[source] std::io::Error),

    #[error("Failed to write candidate file at {path}: {source}")]
    FileWrite {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Container operation failed: {0}")]
    Container(String),

    #[error("Sandbox image '{image}' could not be pulled: {message}")]
    ImagePull { image: String, message: String },
}

/// Errors from the orchestrator itself. Collaborator faults are normally
/// converted to ordinary execution failures at stage boundaries; this enum
/// covers failures of the machinery around the run.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Run {0} not found")]
    RunNotFound(uuid::Uuid),

    #[error("Run was cancelled")]
    Cancelled,

    #[error("Run task panicked: {0}")]
    TaskPanicked(String),

    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
