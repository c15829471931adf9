//! Main execution engine - drives a stage pipeline from first stage to last

use crate::{
    core::{
        error::PipelineError,
        layout::StageDirs,
        outcome::{OutcomeStatus, PipelineRun, StageOutcome, StageRecord},
        params::ParameterSet,
        pipeline::StagePipeline,
        stage::{StageSpec, UNIT_KEYS},
        state::{ExecutionStatus, StageLifecycle, StageState},
    },
    discovery::{BatchUnit, DirectoryScanner, FrameWindow},
    dispatch::{DispatchRequest, RemoteDispatch},
    execution::{fanout::FanOutRunner, metadata, StageExecutor},
    render::{phil, write_atomic, write_new_atomic},
};
use chrono::Utc;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Events that can occur during pipeline execution
#[derive(Debug, Clone)]
pub enum ExecutionEvent {
    PipelineStarted {
        run_id: Uuid,
        pipeline: String,
        stages: usize,
    },
    StageStarted {
        stage: String,
        index: usize,
    },
    StageStateChanged {
        stage: String,
        state: StageState,
    },
    UnitFinished {
        stage: String,
        unit: Option<PathBuf>,
        status: OutcomeStatus,
        elapsed: Duration,
    },
    StageFinished {
        stage: String,
        status: OutcomeStatus,
        failed_units: Vec<PathBuf>,
    },
    /// A stage without abort-on-failure failed and the run went on
    StageFailureIgnored {
        stage: String,
        error: String,
    },
    PipelineFinished {
        run_id: Uuid,
        status: ExecutionStatus,
    },
}

/// Type for event handlers
pub type EventHandler = Arc<dyn Fn(ExecutionEvent) + Send + Sync>;

/// Everything a stage needs once its inputs are resolved and its files written
struct PreparedStage {
    params: ParameterSet,
    dirs: StageDirs,
    units: Vec<BatchUnit>,
    endpoint: Option<String>,
}

/// Main pipeline execution engine
pub struct ExecutionEngine<D> {
    executor: StageExecutor<D>,
    event_handlers: Vec<EventHandler>,
    abort: Arc<AtomicBool>,
}

impl<D: RemoteDispatch> ExecutionEngine<D> {
    pub fn new(dispatcher: D) -> Self {
        Self {
            executor: StageExecutor::new(dispatcher),
            event_handlers: Vec::new(),
            abort: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Add an event handler
    pub fn add_event_handler<F>(&mut self, handler: F)
    where
        F: Fn(ExecutionEvent) + Send + Sync + 'static,
    {
        self.event_handlers.push(Arc::new(handler));
    }

    /// Flag that, once set, stops new units and stages from starting
    pub fn abort_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.abort)
    }

    pub fn dispatcher(&self) -> &D {
        self.executor.dispatcher()
    }

    /// Emit an event to all handlers
    fn emit_event(&self, event: ExecutionEvent) {
        for handler in &self.event_handlers {
            handler(event.clone());
        }
    }

    fn transition(&self, stage: &str, lifecycle: &mut StageLifecycle, next: StageState) {
        if lifecycle.advance(next) {
            debug!("Stage {} -> {}", stage, next);
            self.emit_event(ExecutionEvent::StageStateChanged {
                stage: stage.to_string(),
                state: next,
            });
        }
    }

    /// Run every stage in order.
    ///
    /// Returns the run history, or `PipelineAborted` carrying the partial history
    /// when an abort-on-failure stage does not succeed.
    pub async fn execute(&self, pipeline: &StagePipeline, params: &ParameterSet) -> Result<PipelineRun, PipelineError> {
        pipeline.validate()?;

        let mut run = PipelineRun::new(&pipeline.name);
        info!("Starting pipeline {} ({})", pipeline.name, run.run_id);
        self.emit_event(ExecutionEvent::PipelineStarted {
            run_id: run.run_id,
            pipeline: pipeline.name.clone(),
            stages: pipeline.stages.len(),
        });

        let mut outputs: BTreeMap<String, PathBuf> = BTreeMap::new();
        let mut previous: Option<&str> = None;

        for (index, stage) in pipeline.stages.iter().enumerate() {
            if self.abort.load(Ordering::SeqCst) {
                warn!("Abort requested; not starting stage {}", stage.name);
                return Ok(self.finish(run, ExecutionStatus::Cancelled));
            }

            info!("Stage {}/{}: {}", index + 1, pipeline.stages.len(), stage.name);
            self.emit_event(ExecutionEvent::StageStarted {
                stage: stage.name.clone(),
                index,
            });

            let (record, error) = self.run_stage(pipeline, stage, params, &outputs, previous).await;
            if let Some(dir) = &record.output_dir {
                outputs.insert(stage.name.clone(), dir.clone());
            }

            self.emit_event(ExecutionEvent::StageFinished {
                stage: stage.name.clone(),
                status: record.status,
                failed_units: record.failed_units.clone(),
            });

            let succeeded = record.is_success();
            let cause = error.or_else(|| record.failure());
            run.push(record);

            if self.abort.load(Ordering::SeqCst) {
                warn!("Abort requested during stage {}", stage.name);
                return Ok(self.finish(run, ExecutionStatus::Cancelled));
            }

            if !succeeded {
                let cause = cause.unwrap_or_else(|| {
                    PipelineError::InvalidDefinition(format!("stage '{}' did not succeed", stage.name))
                });

                if stage.policy.abort_on_failure {
                    error!("Stage {} failed, aborting pipeline: {}", stage.name, cause);
                    let run = self.finish(run, ExecutionStatus::Aborted);
                    return Err(PipelineError::PipelineAborted {
                        stage: stage.name.clone(),
                        source: Box::new(cause),
                        run: Box::new(run),
                    });
                }

                warn!("Stage {} failed, continuing: {}", stage.name, cause);
                self.emit_event(ExecutionEvent::StageFailureIgnored {
                    stage: stage.name.clone(),
                    error: cause.to_string(),
                });
            }

            previous = Some(stage.name.as_str());
        }

        Ok(self.finish(run, ExecutionStatus::Completed))
    }

    fn finish(&self, mut run: PipelineRun, status: ExecutionStatus) -> PipelineRun {
        run.finish(status);
        info!("Pipeline {} finished: {:?}", run.pipeline, status);
        self.emit_event(ExecutionEvent::PipelineFinished {
            run_id: run.run_id,
            status,
        });
        run
    }

    async fn run_stage(
        &self,
        pipeline: &StagePipeline,
        stage: &StageSpec,
        caller: &ParameterSet,
        outputs: &BTreeMap<String, PathBuf>,
        previous: Option<&str>,
    ) -> (StageRecord, Option<PipelineError>) {
        let started_at = Utc::now();
        let mut lifecycle = StageLifecycle::new();
        let mut output_dir = None;

        let prepared = match self.prepare(pipeline, stage, caller, outputs, previous, &mut lifecycle, &mut output_dir) {
            Ok(prepared) => prepared,
            Err(e) => {
                error!("Stage {} could not start: {}", stage.name, e);
                let mut record =
                    StageRecord::not_executed(&stage.name, lifecycle, &e, stage.policy.wait_bound, started_at);
                record.output_dir = output_dir;
                self.emit_event(ExecutionEvent::StageStateChanged {
                    stage: stage.name.clone(),
                    state: record.state(),
                });
                return (record, Some(e));
            }
        };

        self.transition(&stage.name, &mut lifecycle, StageState::Executing);
        let concurrency = stage
            .fan_out
            .as_ref()
            .and_then(|f| f.concurrency)
            .unwrap_or(pipeline.max_concurrency);
        let outcomes = self.execute_prepared(stage, &prepared, concurrency).await;

        let record = StageRecord::executed(
            &stage.name,
            lifecycle,
            outcomes,
            prepared.dirs.output.clone(),
            stage.policy.wait_bound,
            started_at,
        );
        self.emit_event(ExecutionEvent::StageStateChanged {
            stage: stage.name.clone(),
            state: record.state(),
        });
        (record, None)
    }

    /// Resolve parameters, discover units and place generated files.
    ///
    /// Everything that can fail without running a process fails here, and the
    /// listing collision check happens before anything is written.
    #[allow(clippy::too_many_arguments)]
    fn prepare(
        &self,
        pipeline: &StagePipeline,
        stage: &StageSpec,
        caller: &ParameterSet,
        outputs: &BTreeMap<String, PathBuf>,
        previous: Option<&str>,
        lifecycle: &mut StageLifecycle,
        output_dir: &mut Option<PathBuf>,
    ) -> Result<PreparedStage, PipelineError> {
        self.transition(&stage.name, lifecycle, StageState::ResolvingInputs);

        // stage defaults < pipeline parameters < caller < wiring
        let mut params = stage.defaults.merged(&pipeline.parameters).merged(caller);
        params.insert("stage", stage.name.as_str());
        for (name, dir) in outputs {
            params.insert(format!("{}_dir", name), dir.display().to_string());
        }

        let dirs = pipeline.layout.resolve(&stage.name, &params, outputs, previous)?;
        params.insert("input_dir", dirs.input.display().to_string());
        params.insert("output_dir", dirs.output.display().to_string());
        *output_dir = Some(dirs.output.clone());

        if let Some(spec) = &stage.metadata {
            metadata::fill_missing(spec, &mut params, &stage.name);
        }

        params.require(&stage.required, &stage.name)?;

        let units = match &stage.discovery {
            Some(discovery) => {
                let scanner = DirectoryScanner::new(discovery.pattern.clone());
                let mut found = scanner.discover(&dirs.input, discovery.mandatory)?;
                if let Some(window) = &discovery.window {
                    let size = count_param(stage, &params, &window.size_param)?;
                    if size == 0 {
                        return Err(PipelineError::InvalidDefinition(format!(
                            "stage '{}': parameter '{}' must be at least 1",
                            stage.name, window.size_param
                        )));
                    }
                    let last = count_param(stage, &params, &window.end_param)?;
                    let window = FrameWindow::ending_at(
                        window.prefix.render(&params)?,
                        window.width,
                        last as u64,
                        size as u64,
                    );
                    found = found.window(&window);
                }
                if let Some(key) = &discovery.limit_param {
                    found = found.limit(count_param(stage, &params, key)?);
                }
                if discovery.mandatory && found.is_empty() {
                    return Err(PipelineError::EmptyDiscoverySet {
                        root: dirs.input.clone(),
                        pattern: found.pattern.clone(),
                    });
                }
                found.ensure_unique_ids()?;
                info!("Stage {}: {} unit(s) under {}", stage.name, found.len(), dirs.input.display());

                params.insert("unit_count", found.len());
                for binding in &discovery.bindings {
                    let rendered = found
                        .iter()
                        .enumerate()
                        .map(|(index, unit)| binding.each.render(&unit_params(&params, index, unit, None)))
                        .collect::<Result<Vec<_>, _>>()?;
                    params.insert(binding.name.clone(), rendered.join(&binding.separator));
                }
                found.into_units()
            }
            None => Vec::new(),
        };

        let listing_path = match &stage.listing {
            Some(template) => {
                let path = dirs.output.join(template.render(&params)?);
                params.insert("listing_file", path.display().to_string());
                Some(path)
            }
            None => None,
        };
        let config_path = match &stage.config_file {
            Some(config) => {
                let path = dirs.output.join(config.file.render(&params)?);
                params.insert("config_file", path.display().to_string());
                Some(path)
            }
            None => None,
        };

        let unit_keys: &[&str] = if stage.fans_out() { UNIT_KEYS } else { &[] };
        if let Some(key) = stage.command.first_missing(&params, unit_keys) {
            return Err(PipelineError::MissingParameter {
                context: stage.name.clone(),
                key: key.to_string(),
            });
        }
        if let Some(template) = stage.fan_out.as_ref().and_then(|f| f.unit_dir.as_ref()) {
            if let Some(key) = template.first_missing(&params, UNIT_KEYS) {
                return Err(PipelineError::MissingParameter {
                    context: stage.name.clone(),
                    key: key.to_string(),
                });
            }
        }

        self.transition(&stage.name, lifecycle, StageState::RenderingConfig);

        if let Some(path) = &listing_path {
            if path.exists() {
                return Err(PipelineError::AlreadyRunning { path: path.clone() });
            }
        }

        let config_text = match (&stage.config_file, &config_path) {
            (Some(config), Some(path)) => {
                let template = pipeline.templates.get(&config.template).ok_or_else(|| {
                    PipelineError::InvalidDefinition(format!(
                        "stage '{}' references unknown template '{}'",
                        stage.name, config.template
                    ))
                })?;
                let text = template.render(&params)?;
                let entries = phil::parse(&text)?;
                debug!("Stage {}: rendered {} config entries", stage.name, entries.len());
                Some((path.clone(), text))
            }
            _ => None,
        };

        let endpoint = render_endpoint(stage, &params);

        std::fs::create_dir_all(&dirs.output).map_err(|e| PipelineError::io(&dirs.output, e))?;

        if let Some(path) = &listing_path {
            let contents: String = units.iter().map(|u| format!("{}\n", u.path.display())).collect();
            write_new_atomic(path, &contents)?;
            info!("Stage {}: listed {} unit(s) in {}", stage.name, units.len(), path.display());
        }
        if let Some((path, text)) = &config_text {
            if let Err(e) = write_atomic(path, text) {
                // The listing claims the stage for this run; give it back
                if let Some(listing) = &listing_path {
                    if let Err(remove) = std::fs::remove_file(listing) {
                        warn!("Stage {}: could not remove {}: {}", stage.name, listing.display(), remove);
                    }
                }
                return Err(e);
            }
            info!("Stage {}: wrote {}", stage.name, path.display());
        }

        Ok(PreparedStage {
            params,
            dirs,
            units,
            endpoint,
        })
    }

    async fn execute_prepared(&self, stage: &StageSpec, prepared: &PreparedStage, concurrency: usize) -> Vec<StageOutcome> {
        let policy = stage.policy;
        let output = &prepared.dirs.output;

        let Some(fan_out) = &stage.fan_out else {
            let command = match stage.command.render(&prepared.params) {
                Ok(command) => command,
                Err(e) => return vec![StageOutcome::from_error(None, String::new(), output.clone(), &e)],
            };
            info!("Stage {}: {}", stage.name, command);
            let request = DispatchRequest::new(command, output.clone(), policy.wait_bound)
                .with_endpoint(prepared.endpoint.clone())
                .with_abort_on_failure(policy.abort_on_failure);
            let outcome = self.executor.execute(&request, None).await;
            self.emit_event(ExecutionEvent::UnitFinished {
                stage: stage.name.clone(),
                unit: None,
                status: outcome.status,
                elapsed: outcome.elapsed,
            });
            return vec![outcome];
        };

        let runner = FanOutRunner::new(fan_out.mode, concurrency).with_abort_flag(self.abort_flag());
        let report = runner
            .run(&prepared.units, |index, unit| {
                let unit = unit.clone();
                async move {
                    let unit_dir = match &fan_out.unit_dir {
                        Some(template) => {
                            output.join(template.render(&unit_params(&prepared.params, index, &unit, None))?)
                        }
                        None => output.clone(),
                    };
                    tokio::fs::create_dir_all(&unit_dir)
                        .await
                        .map_err(|e| PipelineError::io(&unit_dir, e))?;

                    let command = stage
                        .command
                        .render(&unit_params(&prepared.params, index, &unit, Some(&unit_dir)))?;
                    info!("Stage {} [{}]: {}", stage.name, unit.id, command);

                    let request = DispatchRequest::new(command, unit_dir, policy.wait_bound)
                        .with_endpoint(prepared.endpoint.clone())
                        .with_abort_on_failure(policy.abort_on_failure);
                    let outcome = self.executor.execute(&request, Some(unit.path.clone())).await;
                    self.emit_event(ExecutionEvent::UnitFinished {
                        stage: stage.name.clone(),
                        unit: Some(unit.path.clone()),
                        status: outcome.status,
                        elapsed: outcome.elapsed,
                    });
                    Ok::<StageOutcome, PipelineError>(outcome)
                }
            })
            .await;

        report.outcomes
    }
}

/// Stage parameters plus the keys describing one unit
/// A parameter that must hold a non-negative integer, such as a file count
fn count_param(stage: &StageSpec, params: &ParameterSet, key: &str) -> Result<usize, PipelineError> {
    match params.get(key) {
        Some(value) => value.as_usize().ok_or_else(|| {
            PipelineError::InvalidDefinition(format!(
                "stage '{}': parameter '{}' must be a non-negative integer, got '{}'",
                stage.name, key, value
            ))
        }),
        None => Err(PipelineError::MissingParameter {
            context: stage.name.clone(),
            key: key.to_string(),
        }),
    }
}

fn unit_params(base: &ParameterSet, index: usize, unit: &BatchUnit, unit_dir: Option<&Path>) -> ParameterSet {
    let mut params = base.clone();
    params.insert("unit", unit.path.display().to_string());
    params.insert("unit_name", unit.file_name());
    params.insert("unit_id", unit.id.clone());
    params.insert("unit_index", index);
    if let Some(dir) = unit_dir {
        params.insert("unit_dir", dir.display().to_string());
    }
    params
}

/// The compute endpoint is optional: an unresolvable template means "none"
fn render_endpoint(stage: &StageSpec, params: &ParameterSet) -> Option<String> {
    let template = stage.endpoint.as_ref()?;
    match template.render(params) {
        Ok(endpoint) if !endpoint.trim().is_empty() => Some(endpoint.trim().to_string()),
        Ok(_) => None,
        Err(e) => {
            debug!("Stage {}: no compute endpoint ({})", stage.name, e);
            None
        }
    }
}
