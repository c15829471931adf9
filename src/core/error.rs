//! Pipeline error types

use crate::core::outcome::PipelineRun;
use crate::dispatch::DispatchError;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors raised while resolving, preparing or running pipeline stages
#[derive(Debug, Error)]
pub enum PipelineError {
    /// A required parameter or template placeholder has no value
    #[error("{context}: missing required parameter '{key}'")]
    MissingParameter { context: String, key: String },

    /// Discovery found nothing where at least one unit is required
    #[error("no units matching {pattern} found under {}", root.display())]
    EmptyDiscoverySet { root: PathBuf, pattern: String },

    /// A marker/listing file from another run is already in place
    #[error("{} already exists; refusing to overwrite state of another run", path.display())]
    AlreadyRunning { path: PathBuf },

    /// The external tool exited with a non-zero status
    #[error("command exited with status {}: {command}\n{stderr}", format_exit(*exit_code))]
    ExternalProcessFailure {
        command: String,
        exit_code: Option<i32>,
        stderr: String,
    },

    /// The external tool exceeded its wait bound and was terminated
    #[error("command timed out after {}s: {command}\n{stderr}", wait.as_secs())]
    ExternalProcessTimeout {
        command: String,
        wait: Duration,
        stderr: String,
    },

    /// An abort-on-failure stage failed; later stages were not started
    #[error("pipeline aborted at stage '{stage}': {source}")]
    PipelineAborted {
        stage: String,
        #[source]
        source: Box<PipelineError>,
        run: Box<PipelineRun>,
    },

    #[error("invalid pipeline definition: {0}")]
    InvalidDefinition(String),

    #[error("malformed config text at line {line}: {message}")]
    ConfigSyntax { line: usize, message: String },

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error("I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl PipelineError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        PipelineError::Io {
            path: path.into(),
            source,
        }
    }

    /// Errors detected before any external process was started.
    ///
    /// These point at configuration or layout problems and are never retried.
    pub fn is_pre_execution(&self) -> bool {
        matches!(
            self,
            PipelineError::MissingParameter { .. }
                | PipelineError::EmptyDiscoverySet { .. }
                | PipelineError::AlreadyRunning { .. }
        )
    }

    /// The partial run attached to an abort, if any
    pub fn run(&self) -> Option<&PipelineRun> {
        match self {
            PipelineError::PipelineAborted { run, .. } => Some(run),
            _ => None,
        }
    }
}

fn format_exit(code: Option<i32>) -> String {
    match code {
        Some(code) => code.to_string(),
        None => "signal".to_string(),
    }
}
