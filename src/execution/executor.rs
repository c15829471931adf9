//! Stage executor - runs one command under a wait bound and captures the result

use crate::core::outcome::{OutcomeStatus, StageOutcome};
use crate::dispatch::{DispatchError, DispatchRequest, RemoteDispatch};
use std::path::PathBuf;
use std::time::Instant;
use tokio::time::timeout;
use tracing::{debug, error, warn};

/// Thin "run and capture" primitive over a dispatcher.
///
/// Never looks at what the tool printed: exit status zero is success even
/// when stderr is not empty.
pub struct StageExecutor<D> {
    dispatcher: D,
}

impl<D: RemoteDispatch> StageExecutor<D> {
    pub fn new(dispatcher: D) -> Self {
        Self { dispatcher }
    }

    pub fn dispatcher(&self) -> &D {
        &self.dispatcher
    }

    /// Run `request` and turn whatever happened into an outcome
    pub async fn execute(&self, request: &DispatchRequest, unit: Option<PathBuf>) -> StageOutcome {
        debug!("Executing in {}: {}", request.working_dir.display(), request.command);
        let started = Instant::now();

        // The dispatcher enforces the bound too; this one covers dispatchers that don't
        let result = timeout(request.wait_bound, self.dispatcher.dispatch(request)).await;

        let (status, exit_code, stdout, stderr) = match result {
            Ok(Ok(output)) => {
                let status = if output.success() {
                    OutcomeStatus::Succeeded
                } else {
                    OutcomeStatus::Failed
                };
                (status, output.exit_code, output.stdout, output.stderr)
            }
            Ok(Err(DispatchError::Timeout(wait))) => {
                warn!("Timed out after {}s: {}", wait.as_secs(), request.command);
                (
                    OutcomeStatus::TimedOut,
                    None,
                    String::new(),
                    format!("terminated after exceeding the {}s wait bound", wait.as_secs()),
                )
            }
            Err(_) => {
                warn!("Timed out after {}s: {}", request.wait_bound.as_secs(), request.command);
                (
                    OutcomeStatus::TimedOut,
                    None,
                    String::new(),
                    format!(
                        "terminated after exceeding the {}s wait bound",
                        request.wait_bound.as_secs()
                    ),
                )
            }
            Ok(Err(e)) => {
                error!("Dispatch failed for `{}`: {}", request.command, e);
                (OutcomeStatus::Failed, None, String::new(), e.to_string())
            }
        };

        StageOutcome {
            unit,
            command: request.command.clone(),
            working_dir: request.working_dir.clone(),
            stdout,
            stderr,
            exit_code,
            elapsed: started.elapsed(),
            status,
        }
    }
}
