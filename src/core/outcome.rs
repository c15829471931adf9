//! Stage outcomes and the run history built from them

use crate::core::{
    error::PipelineError,
    state::{ExecutionStatus, StageLifecycle, StageState},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

/// How a single process invocation ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OutcomeStatus {
    Succeeded,
    Failed,
    TimedOut,
    /// Never started because the run was being aborted
    Cancelled,
}

impl OutcomeStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, OutcomeStatus::Succeeded)
    }

    /// Combine per-unit statuses into the stage verdict: success only if every
    /// unit succeeded, timed-out if every non-success was a timeout.
    pub fn aggregate<'a, I>(statuses: I) -> OutcomeStatus
    where
        I: IntoIterator<Item = &'a OutcomeStatus>,
    {
        let mut saw_timeout = false;
        let mut saw_failure = false;
        for status in statuses {
            match status {
                OutcomeStatus::Succeeded => {}
                OutcomeStatus::TimedOut => saw_timeout = true,
                OutcomeStatus::Failed | OutcomeStatus::Cancelled => saw_failure = true,
            }
        }
        match (saw_failure, saw_timeout) {
            (true, _) => OutcomeStatus::Failed,
            (false, true) => OutcomeStatus::TimedOut,
            (false, false) => OutcomeStatus::Succeeded,
        }
    }

    pub fn terminal_state(&self) -> StageState {
        match self {
            OutcomeStatus::Succeeded => StageState::Succeeded,
            OutcomeStatus::TimedOut => StageState::TimedOut,
            OutcomeStatus::Failed | OutcomeStatus::Cancelled => StageState::Failed,
        }
    }
}

/// Result of one external invocation. Never modified after construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageOutcome {
    /// Unit this invocation processed (None for whole-stage invocations)
    pub unit: Option<PathBuf>,
    pub command: String,
    pub working_dir: PathBuf,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub elapsed: Duration,
    pub status: OutcomeStatus,
}

impl StageOutcome {
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Outcome for a unit whose invocation could not be carried out at all
    pub fn from_error(unit: Option<PathBuf>, command: String, working_dir: PathBuf, error: &PipelineError) -> Self {
        let status = match error {
            PipelineError::ExternalProcessTimeout { .. } => OutcomeStatus::TimedOut,
            _ => OutcomeStatus::Failed,
        };
        Self {
            unit,
            command,
            working_dir,
            stdout: String::new(),
            stderr: error.to_string(),
            exit_code: None,
            elapsed: Duration::ZERO,
            status,
        }
    }

    /// Outcome for a unit skipped because the run is aborting
    pub fn cancelled(unit: Option<PathBuf>, working_dir: PathBuf) -> Self {
        Self {
            unit,
            command: String::new(),
            working_dir,
            stdout: String::new(),
            stderr: "not started: run is aborting".to_string(),
            exit_code: None,
            elapsed: Duration::ZERO,
            status: OutcomeStatus::Cancelled,
        }
    }
}

/// Everything known about one stage of a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageRecord {
    pub stage: String,
    pub status: OutcomeStatus,
    pub lifecycle: StageLifecycle,
    /// One outcome per invocation, in discovery order
    pub outcomes: Vec<StageOutcome>,
    /// Units whose invocation did not succeed
    pub failed_units: Vec<PathBuf>,
    pub output_dir: Option<PathBuf>,
    pub wait_bound: Duration,
    /// Set when the stage failed before any process was started
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl StageRecord {
    /// Record for a stage that ran its invocations to completion
    pub fn executed(
        stage: &str,
        mut lifecycle: StageLifecycle,
        outcomes: Vec<StageOutcome>,
        output_dir: PathBuf,
        wait_bound: Duration,
        started_at: DateTime<Utc>,
    ) -> Self {
        let status = OutcomeStatus::aggregate(outcomes.iter().map(|o| &o.status));
        lifecycle.advance(status.terminal_state());
        let failed_units = outcomes
            .iter()
            .filter(|o| !o.is_success())
            .filter_map(|o| o.unit.clone())
            .collect();

        Self {
            stage: stage.to_string(),
            status,
            lifecycle,
            outcomes,
            failed_units,
            output_dir: Some(output_dir),
            wait_bound,
            error: None,
            started_at,
            finished_at: Utc::now(),
        }
    }

    /// Record for a stage that failed before anything was executed
    pub fn not_executed(
        stage: &str,
        mut lifecycle: StageLifecycle,
        error: &PipelineError,
        wait_bound: Duration,
        started_at: DateTime<Utc>,
    ) -> Self {
        lifecycle.advance(StageState::Failed);
        Self {
            stage: stage.to_string(),
            status: OutcomeStatus::Failed,
            lifecycle,
            outcomes: Vec::new(),
            failed_units: Vec::new(),
            output_dir: None,
            wait_bound,
            error: Some(error.to_string()),
            started_at,
            finished_at: Utc::now(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub fn state(&self) -> StageState {
        self.lifecycle.current()
    }

    /// Single outcome summarising every invocation of the stage
    pub fn aggregate(&self) -> Option<StageOutcome> {
        let first = self.outcomes.first()?;
        if self.outcomes.len() == 1 {
            return Some(first.clone());
        }
        let join = |f: fn(&StageOutcome) -> &str| {
            self.outcomes.iter().map(f).collect::<Vec<_>>().join("\n")
        };
        Some(StageOutcome {
            unit: None,
            command: join(|o| o.command.as_str()),
            working_dir: self.output_dir.clone().unwrap_or_else(|| first.working_dir.clone()),
            stdout: join(|o| o.stdout.as_str()),
            stderr: join(|o| o.stderr.as_str()),
            exit_code: self
                .outcomes
                .iter()
                .find(|o| !o.is_success())
                .map_or(Some(0), |o| o.exit_code),
            elapsed: self.outcomes.iter().map(|o| o.elapsed).sum(),
            status: self.status,
        })
    }

    /// Error describing why the stage did not succeed, with the failing
    /// commands and their stderr so they can be reproduced by hand.
    ///
    /// None for successful stages and for stages that never executed.
    pub fn failure(&self) -> Option<PipelineError> {
        if self.is_success() || self.error.is_some() {
            return None;
        }
        let failing: Vec<&StageOutcome> = self.outcomes.iter().filter(|o| !o.is_success()).collect();
        let command = failing.iter().map(|o| o.command.as_str()).collect::<Vec<_>>().join("\n");
        let stderr = failing.iter().map(|o| o.stderr.as_str()).collect::<Vec<_>>().join("\n");

        Some(match self.status {
            OutcomeStatus::TimedOut => PipelineError::ExternalProcessTimeout {
                command,
                wait: self.wait_bound,
                stderr,
            },
            _ => PipelineError::ExternalProcessFailure {
                command,
                exit_code: failing.first().and_then(|o| o.exit_code),
                stderr,
            },
        })
    }
}

/// Full execution history of one pipeline invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    pub run_id: Uuid,
    pub pipeline: String,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub stages: Vec<StageRecord>,
}

impl PipelineRun {
    pub fn new(pipeline: &str) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            pipeline: pipeline.to_string(),
            status: ExecutionStatus::Running,
            started_at: Utc::now(),
            completed_at: None,
            stages: Vec::new(),
        }
    }

    pub fn push(&mut self, record: StageRecord) {
        self.stages.push(record);
    }

    pub fn finish(&mut self, status: ExecutionStatus) {
        self.status = status;
        self.completed_at = Some(Utc::now());
    }

    pub fn stage(&self, name: &str) -> Option<&StageRecord> {
        self.stages.iter().find(|s| s.stage == name)
    }

    /// Names of stages that were attempted, in order
    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.stage.as_str()).collect()
    }

    pub fn failed_stages(&self) -> Vec<&str> {
        self.stages
            .iter()
            .filter(|s| !s.is_success())
            .map(|s| s.stage.as_str())
            .collect()
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}
