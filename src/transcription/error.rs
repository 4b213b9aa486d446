use std::io;
use std::sync::Arc;
use thiserror::Error;

use super::normalize::{summarize, NormalizedError};

/// Errors surfaced by the recognition worker supervisor
///
/// Every variant that can be caused by the worker carries the most recent
/// stderr tail so callers see why the worker misbehaved.
#[derive(Debug, Clone, Error)]
pub enum WorkerError {
    /// Worker did not emit its ready signal in time
    #[error("worker startup timeout after {timeout_ms} ms{}", diagnostics_suffix(.diagnostics))]
    StartupTimeout {
        /// Configured startup timeout
        timeout_ms: u64,
        /// Recent worker stderr
        diagnostics: String,
    },

    /// Worker process could not be launched
    #[error("failed to spawn worker process {program}: {source}")]
    SpawnFailure {
        /// Program that failed to start
        program: String,
        /// Underlying OS error
        source: Arc<io::Error>,
    },

    /// Worker process went away while work was outstanding
    #[error("worker process exit: {reason}{}", diagnostics_suffix(.diagnostics))]
    ProcessExit {
        /// Exit code, if the process exited normally
        code: Option<i32>,
        /// What happened to the process
        reason: String,
        /// Recent worker stderr
        diagnostics: String,
    },

    /// No response arrived within the request timeout
    #[error("request timeout after {duration_ms} ms{}", diagnostics_suffix(.diagnostics))]
    RequestTimeout {
        /// Configured request timeout
        duration_ms: u64,
        /// Recent worker stderr
        diagnostics: String,
    },

    /// Worker answered with `ok: false`
    #[error("{}{}", summarize(.report), diagnostics_suffix(.diagnostics))]
    WorkerReported {
        /// Decoded error payload
        report: NormalizedError,
        /// Recent worker stderr
        diagnostics: String,
    },

    /// `recognize` was called before a successful `initialize`
    #[error("recognizer not initialized")]
    NotInitialized,

    /// `initialize` failed and the worker was reset
    #[error("failed to initialize {model}: {summary}")]
    InitializeFailed {
        /// Recognition model that failed to load
        model: String,
        /// First line of the underlying error
        summary: String,
        /// Underlying error
        source: Box<WorkerError>,
    },

    /// Request could not be serialized
    #[error("failed to encode worker request: {0}")]
    Encode(#[source] Arc<serde_json::Error>),

    /// Successful response did not have the expected shape
    #[error("malformed worker response: {0}")]
    MalformedPayload(#[source] Arc<serde_json::Error>),
}

impl WorkerError {
    /// Exit error built from a reason and the current stderr tail
    pub fn process_exit(code: Option<i32>, reason: impl Into<String>, diagnostics: String) -> Self {
        Self::ProcessExit {
            code,
            reason: reason.into(),
            diagnostics,
        }
    }

    /// Check if this error came from the worker process going away
    #[must_use]
    pub const fn is_process_fault(&self) -> bool {
        matches!(
            self,
            Self::StartupTimeout { .. } | Self::SpawnFailure { .. } | Self::ProcessExit { .. }
        )
    }

    /// Decoded worker error, if the worker itself reported the failure
    #[must_use]
    pub fn report(&self) -> Option<&NormalizedError> {
        match self {
            Self::WorkerReported { report, .. } => Some(report),
            Self::InitializeFailed { source, .. } => source.report(),
            _ => None,
        }
    }

    /// First line of the rendered message
    #[must_use]
    pub fn headline(&self) -> String {
        self.to_string()
            .lines()
            .next()
            .unwrap_or_default()
            .to_owned()
    }
}

impl From<serde_json::Error> for WorkerError {
    fn from(err: serde_json::Error) -> Self {
        Self::MalformedPayload(Arc::new(err))
    }
}

fn diagnostics_suffix(diagnostics: &str) -> String {
    if diagnostics.is_empty() {
        String::new()
    } else {
        format!("\nrecent worker stderr:\n{diagnostics}")
    }
}
