//! Fan-out runner - one invocation per unit, outcomes kept in unit order

use crate::core::{
    error::PipelineError,
    outcome::{OutcomeStatus, StageOutcome},
    stage::FanOutMode,
};
use crate::discovery::BatchUnit;
use futures::stream::{self, StreamExt};
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Aggregated result of a fan-out
#[derive(Debug, Clone)]
pub struct FanOutReport {
    /// One outcome per unit, in unit order
    pub outcomes: Vec<StageOutcome>,
    /// Units whose invocation did not succeed, in unit order
    pub failed_units: Vec<PathBuf>,
    pub status: OutcomeStatus,
}

impl FanOutReport {
    fn new(outcomes: Vec<StageOutcome>, units: &[BatchUnit]) -> Self {
        let failed_units = outcomes
            .iter()
            .zip(units)
            .filter(|(outcome, _)| !outcome.is_success())
            .map(|(_, unit)| unit.path.clone())
            .collect();
        let status = OutcomeStatus::aggregate(outcomes.iter().map(|o| &o.status));
        Self {
            outcomes,
            failed_units,
            status,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}

/// Runs a per-unit invocation over every unit.
///
/// A failing unit does not stop the others; the verdict is made once all
/// units are done. Units not yet started when the abort flag is raised are
/// recorded as cancelled.
#[derive(Debug, Clone)]
pub struct FanOutRunner {
    mode: FanOutMode,
    concurrency: usize,
    abort: Arc<AtomicBool>,
}

impl FanOutRunner {
    pub fn new(mode: FanOutMode, concurrency: usize) -> Self {
        Self {
            mode,
            concurrency: concurrency.max(1),
            abort: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn sequential() -> Self {
        Self::new(FanOutMode::Sequential, 1)
    }

    pub fn parallel(concurrency: usize) -> Self {
        Self::new(FanOutMode::Parallel, concurrency)
    }

    pub fn with_abort_flag(mut self, abort: Arc<AtomicBool>) -> Self {
        self.abort = abort;
        self
    }

    /// Units in flight at once
    pub fn limit(&self) -> usize {
        match self.mode {
            FanOutMode::Sequential => 1,
            FanOutMode::Parallel => self.concurrency,
        }
    }

    pub async fn run<F, Fut>(&self, units: &[BatchUnit], invoke: F) -> FanOutReport
    where
        F: Fn(usize, &BatchUnit) -> Fut,
        Fut: Future<Output = Result<StageOutcome, PipelineError>>,
    {
        let limit = self.limit();
        info!("Fanning out over {} unit(s), {} at a time", units.len(), limit);

        // `buffered` yields in input order whatever the completion order
        let outcomes: Vec<StageOutcome> = stream::iter(units.iter().enumerate())
            .map(|(index, unit)| {
                let abort = Arc::clone(&self.abort);
                let path = unit.path.clone();
                let invocation = invoke(index, unit);
                async move {
                    if abort.load(Ordering::SeqCst) {
                        debug!("Not starting {}: run is aborting", path.display());
                        return StageOutcome::cancelled(Some(path), PathBuf::new());
                    }
                    match invocation.await {
                        Ok(outcome) => outcome,
                        Err(e) => {
                            warn!("Unit {} could not be run: {}", path.display(), e);
                            StageOutcome::from_error(Some(path), String::new(), PathBuf::new(), &e)
                        }
                    }
                }
            })
            .buffered(limit)
            .collect()
            .await;

        let report = FanOutReport::new(outcomes, units);
        if !report.failed_units.is_empty() {
            warn!(
                "{} of {} unit(s) did not succeed",
                report.failed_units.len(),
                units.len()
            );
        }
        report
    }
}
