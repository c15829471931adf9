//! Execution state models

use serde::{Deserialize, Serialize};
use std::fmt;

/// Overall pipeline execution status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionStatus {
    /// Pipeline has not started
    Pending,
    /// Pipeline is currently running
    Running,
    /// Every stage ran; best-effort stages may have failed
    Completed,
    /// An abort-on-failure stage failed
    Aborted,
    /// Stopped by the abort flag before all stages ran
    Cancelled,
}

/// State of a single stage invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StageState {
    Pending,
    ResolvingInputs,
    RenderingConfig,
    Executing,
    Succeeded,
    Failed,
    TimedOut,
}

impl StageState {
    /// Check if stage is in a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StageState::Succeeded | StageState::Failed | StageState::TimedOut
        )
    }
}

impl fmt::Display for StageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            StageState::Pending => "pending",
            StageState::ResolvingInputs => "resolving-inputs",
            StageState::RenderingConfig => "rendering-config",
            StageState::Executing => "executing",
            StageState::Succeeded => "succeeded",
            StageState::Failed => "failed",
            StageState::TimedOut => "timed-out",
        };
        f.write_str(label)
    }
}

/// Forward-only state tracker for one stage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageLifecycle {
    current: StageState,
    history: Vec<StageState>,
}

impl StageLifecycle {
    pub fn new() -> Self {
        Self {
            current: StageState::Pending,
            history: vec![StageState::Pending],
        }
    }

    pub fn current(&self) -> StageState {
        self.current
    }

    pub fn history(&self) -> &[StageState] {
        &self.history
    }

    /// Move to `next`. Returns false (and stays put) for backward moves or
    /// moves out of a terminal state.
    pub fn advance(&mut self, next: StageState) -> bool {
        if self.current.is_terminal() || next <= self.current {
            return false;
        }
        self.current = next;
        self.history.push(next);
        true
    }
}

impl Default for StageLifecycle {
    fn default() -> Self {
        Self::new()
    }
}
