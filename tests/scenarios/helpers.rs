//! Test utility functions for pipeline scenarios

#![allow(dead_code)]

use async_trait::async_trait;
use ssx_pipeline::core::config::PipelineConfig;
use ssx_pipeline::core::{ParameterSet, PipelineError, PipelineRun, StagePipeline};
use ssx_pipeline::dispatch::{DispatchError, DispatchOutput, DispatchRequest, RemoteDispatch};
use ssx_pipeline::execution::ExecutionEngine;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

type Effect = Box<dyn Fn(&DispatchRequest) + Send + Sync>;

/// Dispatcher that never starts a process.
///
/// Counts launches, records every request and answers from a script keyed on
/// command substrings. Anything not scripted exits 0.
#[derive(Default)]
pub struct MockDispatch {
    launches: AtomicUsize,
    requests: Mutex<Vec<DispatchRequest>>,
    failures: Vec<(String, i32)>,
    timeouts: Vec<String>,
    effects: Vec<Effect>,
}

impl MockDispatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Exit with `code` for commands containing `needle`
    pub fn fail_when(mut self, needle: &str, code: i32) -> Self {
        self.failures.push((needle.to_string(), code));
        self
    }

    /// Report a timeout for commands containing `needle`
    pub fn time_out_when(mut self, needle: &str) -> Self {
        self.timeouts.push(needle.to_string());
        self
    }

    /// Run `effect` for every successful request, standing in for the files a tool writes
    pub fn with_effect<F>(mut self, effect: F) -> Self
    where
        F: Fn(&DispatchRequest) + Send + Sync + 'static,
    {
        self.effects.push(Box::new(effect));
        self
    }

    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<DispatchRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Commands dispatched so far, sorted so parallel stages compare stably
    pub fn sorted_commands(&self) -> Vec<String> {
        let mut commands: Vec<String> = self.requests().into_iter().map(|r| r.command).collect();
        commands.sort();
        commands
    }

    pub fn launches_matching(&self, needle: &str) -> usize {
        self.requests().iter().filter(|r| r.command.contains(needle)).count()
    }
}

#[async_trait]
impl RemoteDispatch for MockDispatch {
    async fn dispatch(&self, request: &DispatchRequest) -> Result<DispatchOutput, DispatchError> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.clone());

        if self.timeouts.iter().any(|n| request.command.contains(n.as_str())) {
            return Err(DispatchError::Timeout(request.wait_bound));
        }
        if let Some((_, code)) = self.failures.iter().find(|(n, _)| request.command.contains(n.as_str())) {
            return Ok(DispatchOutput {
                exit_code: Some(*code),
                stderr: format!("Sorry: scripted failure for {}", request.command),
                elapsed: Duration::from_millis(1),
                ..Default::default()
            });
        }

        for effect in &self.effects {
            effect(request);
        }
        Ok(DispatchOutput {
            exit_code: Some(0),
            stdout: "done".to_string(),
            elapsed: Duration::from_millis(1),
            ..Default::default()
        })
    }
}

/// Run `pipeline` against `mock`, keeping a handle for inspection afterwards
pub async fn run_with_mock(
    pipeline: &StagePipeline,
    params: &ParameterSet,
    mock: MockDispatch,
) -> (Result<PipelineRun, PipelineError>, Arc<MockDispatch>) {
    let mock = Arc::new(mock);
    let engine = ExecutionEngine::new(Arc::clone(&mock));
    let result = engine.execute(pipeline, params).await;
    (result, mock)
}

pub fn builtin(name: &str) -> StagePipeline {
    PipelineConfig::builtin(name)
        .and_then(|config| config.to_pipeline())
        .unwrap_or_else(|e| panic!("Bundled pipeline '{}' failed to load: {:#}", name, e))
}

pub fn pipeline_from_yaml(yaml: &str) -> StagePipeline {
    PipelineConfig::from_yaml(yaml)
        .and_then(|config| config.to_pipeline())
        .unwrap_or_else(|e| panic!("Failed to parse pipeline YAML: {:#}", e))
}

pub fn data_params(data_dir: &Path) -> ParameterSet {
    ParameterSet::new().with("data_dir", data_dir.display().to_string())
}

/// Create an empty file, along with any missing parent directories
pub fn touch(root: &Path, relative: &str) {
    let path = root.join(relative);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, b"").unwrap();
}

/// Unwrap the abort error, returning the failing stage, its cause and the partial run
pub fn expect_aborted(result: Result<PipelineRun, PipelineError>) -> (String, PipelineError, PipelineRun) {
    match result {
        Err(PipelineError::PipelineAborted { stage, source, run }) => (stage, *source, *run),
        Err(other) => panic!("Expected PipelineAborted, got error: {}", other),
        Ok(run) => panic!("Expected PipelineAborted, run finished with {:?}", run.status),
    }
}

/// Stands in for xia2.ssx: a per-run directory gains a `batch_1` partition
pub fn xia2_writes_batches(request: &DispatchRequest) {
    let is_run_dir = request
        .working_dir
        .file_name()
        .map(|name| name.to_string_lossy().starts_with("ref_"))
        .unwrap_or(false);
    if is_run_dir {
        std::fs::create_dir_all(request.working_dir.join("batch_1")).unwrap();
    }
}

/// Raw data directory with master files for the given runs and the processing phil
pub fn ssx_data_dir(root: &Path, runs: &[&str]) {
    for run in runs {
        touch(root, &format!("raster/{}_master.h5", run));
        touch(root, &format!("raster/{}_data_000001.h5", run));
    }
    std::fs::write(root.join("run.phil"), "spotfinding.min_spot_size = 3\n").unwrap();
}
