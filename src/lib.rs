//! ssx-pipeline - orchestrates multi-stage serial crystallography processing

pub mod cli;
pub mod core;
pub mod discovery;
pub mod dispatch;
pub mod execution;
pub mod render;

// Re-export commonly used types
pub use crate::core::{ExecutionStatus, ParameterSet, PipelineError, PipelineRun, StagePipeline, StageSpec};
pub use crate::dispatch::{DispatchConfig, DispatchRequest, LocalDispatch, RemoteDispatch};
pub use crate::execution::{ExecutionEngine, ExecutionEvent, FanOutRunner, StageExecutor};
