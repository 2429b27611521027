//! Error types for YTDLStem.

use std::path::PathBuf;

use uuid::Uuid;

/// Job registry and scheduling errors.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Job {id} not found")]
    NotFound { id: Uuid },

    #[error("Job {id} already in state {state}, cannot transition to {target}")]
    InvalidTransition {
        id: Uuid,
        state: String,
        target: String,
    },

    #[error("Failed to prepare output directory {path:?}: {source}")]
    Storage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Job {id} is a {expected} job, request for {found} rejected")]
    KindMismatch {
        id: Uuid,
        expected: String,
        found: String,
    },

    #[error("Job queue is closed")]
    QueueClosed,

    #[error("Workers already started")]
    AlreadyStarted,
}

/// Failures raised by a job handler. The display string becomes the job message.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("{0}")]
    InvalidInput(String),

    #[error(transparent)]
    Media(#[from] MediaError),

    #[error("{0}")]
    Failed(String),

    #[error("Handler panicked: {0}")]
    Panicked(String),
}

/// External media tool errors.
#[derive(Debug, thiserror::Error)]
pub enum MediaError {
    #[error("Failed to start {tool}: {source}")]
    Spawn {
        tool: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{tool} failed: {stderr}")]
    ToolFailed { tool: String, stderr: String },

    #[error("{0}")]
    MissingOutput(String),

    #[error("Could not parse {tool} output: {reason}")]
    Parse { tool: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
