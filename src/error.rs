//! Error taxonomy shared by the worker boundary and the orchestrator.

use thiserror::Error;

/// Failure reported by a worker operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WorkerError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("execution error: {0}")]
    Execution(String),
    #[error("engine error: {0}")]
    Engine(String),
    #[error("trace error: {0}")]
    Trace(String),
}

impl WorkerError {
    /// The bare description, without the category prefix.
    pub fn message(&self) -> &str {
        match self {
            WorkerError::Parse(m)
            | WorkerError::Execution(m)
            | WorkerError::Engine(m)
            | WorkerError::Trace(m) => m,
        }
    }

    /// Map a wire error kind to its variant. Unknown kinds count as engine failures.
    pub fn from_kind(kind: &str, message: String) -> Self {
        match kind {
            "parse" => WorkerError::Parse(message),
            "execution" => WorkerError::Execution(message),
            "trace" => WorkerError::Trace(message),
            _ => WorkerError::Engine(message),
        }
    }
}

/// Why a run pipeline stopped before reaching `Ready`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Worker(#[from] WorkerError),
    /// A newer `stop()`/`run()` replaced the session this pipeline was driving.
    #[error("session was superseded")]
    Superseded,
}

/// A trace request refused before reaching the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TraceRejected {
    #[error("no program is loaded")]
    NoProgram,
    #[error("worker is busy")]
    WorkerBusy,
}

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("worker unavailable: {0}")]
    Unavailable(#[from] TraceRejected),
    #[error("fetching rows of {predicate} failed: {source}")]
    Rows {
        predicate: String,
        #[source]
        source: WorkerError,
    },
    #[error("writing {} failed: {source}", path.display())]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_strips_category() {
        let e = WorkerError::Parse("unexpected token".into());
        assert_eq!(e.message(), "unexpected token");
        assert_eq!(e.to_string(), "parse error: unexpected token");
    }

    #[test]
    fn unknown_kind_is_engine_error() {
        assert_eq!(
            WorkerError::from_kind("segfault", "boom".into()),
            WorkerError::Engine("boom".into())
        );
        assert_eq!(
            WorkerError::from_kind("trace", "no such fact".into()),
            WorkerError::Trace("no such fact".into())
        );
    }
}
