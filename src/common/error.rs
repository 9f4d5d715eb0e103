//! Common error types for placement-bench
//!
//! # Design Principles (KISS)
//! - One variant per fatal failure class of a trial
//! - Best-effort telemetry never produces a `BenchError` (see `outcome`)
//! - Use thiserror for ergonomic error handling

use thiserror::Error;

use crate::supervisor::Role;

/// Fatal errors that unwind a trial
///
/// Every variant aborts the trial it occurs in. The trial's cleanup path
/// still runs exactly once afterwards.
#[derive(Error, Debug)]
pub enum BenchError {
    /// Missing binary, device node or prerequisite file
    #[error("Missing prerequisite: {0}")]
    MissingPrerequisite(String),

    /// Format or mount failure
    #[error("Provisioning failed: {0}")]
    Provision(String),

    /// A chunk could not be fetched, transformed or loaded
    #[error("Pipeline failed at chunk {chunk}: {reason}")]
    Pipeline { chunk: usize, reason: String },

    /// The process exited before its readiness probe ever succeeded
    #[error("{role} process (pid {pid}) died before becoming ready\n--- log tail ---\n{log_tail}")]
    ProcessDied {
        role: Role,
        pid: u32,
        log_tail: String,
    },

    /// The readiness probe never succeeded while the process stayed alive
    #[error("{role} process not ready after {waited_secs}s\n--- log tail ---\n{log_tail}")]
    NotReady {
        role: Role,
        waited_secs: u64,
        log_tail: String,
    },

    /// Detached launch succeeded but no matching process showed up
    #[error("No pid found for {role} process matching '{pattern}'\n--- log tail ---\n{log_tail}")]
    PidNotFound {
        role: Role,
        pattern: String,
        log_tail: String,
    },

    /// An external command could not be run or exited non-zero
    #[error("Command '{program}' failed: {reason}")]
    Command { program: String, reason: String },

    /// I/O error (file operations)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP transport error
    #[error("HTTP error: {0}")]
    Http(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Persisted artifact could not be parsed
    #[error("Parse error: {0}")]
    Parse(String),

    /// The run was interrupted (Ctrl+C)
    #[error("Interrupted")]
    Interrupted,

    /// Generic error with message
    #[error("{0}")]
    Other(String),
}

impl BenchError {
    /// Create a missing-prerequisite error
    pub fn missing(msg: impl Into<String>) -> Self {
        Self::MissingPrerequisite(msg.into())
    }

    /// Create a provisioning error
    pub fn provision(msg: impl Into<String>) -> Self {
        Self::Provision(msg.into())
    }

    /// Create a pipeline error for the given chunk
    pub fn pipeline(chunk: usize, reason: impl Into<String>) -> Self {
        Self::Pipeline {
            chunk,
            reason: reason.into(),
        }
    }

    /// Create a command error
    pub fn command(program: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Command {
            program: program.into(),
            reason: reason.into(),
        }
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a parse error
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse(msg.into())
    }

    /// Create a generic error
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }
}

/// Result type alias using BenchError
pub type BenchResult<T> = Result<T, BenchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error() {
        let err = BenchError::config("chunk_size must be positive");
        assert!(err.to_string().contains("Configuration error"));
        assert!(err.to_string().contains("chunk_size"));
    }

    #[test]
    fn test_pipeline_error_names_chunk() {
        let err = BenchError::pipeline(3, "artifact not produced");
        let msg = err.to_string();
        assert!(msg.contains("chunk 3"));
        assert!(msg.contains("artifact not produced"));
    }

    #[test]
    fn test_process_died_includes_log_tail() {
        let err = BenchError::ProcessDied {
            role: Role::Producer,
            pid: 4242,
            log_tail: "fatal: database locked".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("died before becoming ready"));
        assert!(msg.contains("database locked"));
    }

    #[test]
    fn test_not_ready_is_distinct_from_died() {
        let err = BenchError::NotReady {
            role: Role::Consumer,
            waited_secs: 60,
            log_tail: String::new(),
        };
        assert!(err.to_string().contains("not ready after 60s"));
        assert!(!matches!(err, BenchError::ProcessDied { .. }));
    }

    #[test]
    fn test_io_error_from() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: BenchError = io_err.into();
        assert!(err.to_string().contains("I/O error"));
    }
}
