//! Error types for trace sessions.

use hoptrace_model::SessionStatus;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TraceError {
    #[error("trace backend {program} is unavailable: {source}")]
    BackendUnavailable {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("address selection failed: {0}")]
    SelectionFailed(String),

    #[error("trace did not finish within {0:?}")]
    StreamTimeout(Duration),

    #[error("trace backend exited unexpectedly (code {code:?}): {output}")]
    ProcessTerminatedUnexpectedly { code: Option<i32>, output: String },

    #[error("invalid trace request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl TraceError {
    /// Terminal status a session resolves with when it ends on this error.
    pub fn status(&self) -> SessionStatus {
        match self {
            TraceError::StreamTimeout(_) => SessionStatus::TimedOut,
            other => SessionStatus::Failed {
                reason: other.to_string(),
            },
        }
    }

    /// Whether hops collected before the error are still trustworthy.
    pub fn keeps_partial_hops(&self) -> bool {
        !matches!(self, TraceError::SelectionFailed(_))
    }
}
