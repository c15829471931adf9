//! Remote dispatch - "run this command on a compute resource and wait"

pub mod local;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

pub use local::{DispatchConfig, LocalDispatch};

/// Error types for dispatch operations
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("dispatch timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("failed to start command: {0}")]
    Spawn(String),

    #[error("failed collecting command output: {0}")]
    Wait(String),

    #[error("compute endpoint error: {0}")]
    Endpoint(String),
}

/// One unit of work handed to a dispatcher
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchRequest {
    /// Full command text, interpreted by a shell
    pub command: String,

    /// Directory the command runs in. Never the caller's own working directory.
    pub working_dir: PathBuf,

    /// Upper bound on how long to wait for completion
    pub wait_bound: Duration,

    /// Whether the caller treats a failure of this action as fatal
    pub abort_on_failure: bool,

    /// Named compute resource, if the stage targets one
    pub endpoint: Option<String>,
}

impl DispatchRequest {
    pub fn new(command: impl Into<String>, working_dir: impl Into<PathBuf>, wait_bound: Duration) -> Self {
        Self {
            command: command.into(),
            working_dir: working_dir.into(),
            wait_bound,
            abort_on_failure: true,
            endpoint: None,
        }
    }

    pub fn with_endpoint(mut self, endpoint: Option<String>) -> Self {
        self.endpoint = endpoint;
        self
    }

    pub fn with_abort_on_failure(mut self, abort: bool) -> Self {
        self.abort_on_failure = abort;
        self
    }
}

/// What came back from a completed command
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchOutput {
    /// `None` when the process was ended by a signal
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub elapsed: Duration,
}

impl DispatchOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Trait for command dispatch - allows for different execution substrates
#[async_trait]
pub trait RemoteDispatch: Send + Sync {
    /// Run the request to completion and return its captured output.
    ///
    /// A non-zero exit is not an error at this level; the caller decides.
    async fn dispatch(&self, request: &DispatchRequest) -> Result<DispatchOutput, DispatchError>;
}

#[async_trait]
impl<T: RemoteDispatch + ?Sized> RemoteDispatch for std::sync::Arc<T> {
    async fn dispatch(&self, request: &DispatchRequest) -> Result<DispatchOutput, DispatchError> {
        (**self).dispatch(request).await
    }
}
