//! Failure taxonomy carried by errored jobs.

use std::any::Any;
use std::backtrace::{Backtrace, BacktraceStatus};
use std::fmt::Write as _;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Category of a job failure, stored as `error_type` on errored jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The source string or request could not be resolved.
    Resolution,
    /// Fetching remote bytes failed, including integrity mismatches.
    Transfer,
    /// Writing the model record failed.
    Registration,
    /// A graph node or executor failed.
    Execution,
    /// A bug: panic, invariant violation, lost actor.
    Internal,
    /// The process died while the job was running.
    Interrupted,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Resolution => "resolution",
            ErrorKind::Transfer => "transfer",
            ErrorKind::Registration => "registration",
            ErrorKind::Execution => "execution",
            ErrorKind::Internal => "internal",
            ErrorKind::Interrupted => "interrupted",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a job that did not complete.
///
/// Executors return this from their futures; the worker boundary turns it
/// into the job's terminal state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobError {
    #[error("job was cancelled")]
    Cancelled,

    #[error("{kind} error: {message}")]
    Failed {
        kind: ErrorKind,
        message: String,
        traceback: String,
        origin: Option<String>,
    },
}

impl JobError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        let message = message.into();
        let traceback = with_backtrace(format!("{kind} error: {message}"));
        JobError::Failed {
            kind,
            message,
            traceback,
            origin: None,
        }
    }

    /// Build a failure from any error, recording its full source chain.
    pub fn from_error(kind: ErrorKind, err: &(dyn std::error::Error + 'static)) -> Self {
        let mut trace = format!("{kind} error: {err}");
        let mut source = err.source();
        while let Some(cause) = source {
            let _ = write!(trace, "\n  caused by: {cause}");
            source = cause.source();
        }
        JobError::Failed {
            kind,
            message: err.to_string(),
            traceback: with_backtrace(trace),
            origin: None,
        }
    }

    /// Build an internal failure from a caught panic payload.
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        };
        JobError::Failed {
            kind: ErrorKind::Internal,
            traceback: with_backtrace(format!("panic: {message}")),
            message: format!("executor panicked: {message}"),
            origin: None,
        }
    }

    /// Name the component that failed, e.g. a graph node id.
    pub fn with_origin(mut self, name: impl Into<String>) -> Self {
        if let JobError::Failed { origin, .. } = &mut self {
            *origin = Some(name.into());
        }
        self
    }

    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            JobError::Cancelled => None,
            JobError::Failed { kind, .. } => Some(*kind),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, JobError::Cancelled)
    }
}

fn with_backtrace(mut trace: String) -> String {
    let backtrace = Backtrace::capture();
    if backtrace.status() == BacktraceStatus::Captured {
        let _ = write!(trace, "\n\nbacktrace:\n{backtrace}");
    }
    trace
}
