//! Core domain models
//!
//! Stages, their parameters and directory wiring, and the records a run
//! produces.

pub mod config;
pub mod error;
pub mod layout;
pub mod outcome;
pub mod params;
pub mod pipeline;
pub mod stage;
pub mod state;

pub use error::PipelineError;
pub use layout::{DirectoryLayout, InputRoot, LayoutEntry, StageDirs};
pub use outcome::{OutcomeStatus, PipelineRun, StageOutcome, StageRecord};
pub use params::{ParamValue, ParameterSet};
pub use pipeline::StagePipeline;
pub use stage::{
    ConfigFileSpec, DiscoverySpec, FailurePolicy, FanOutMode, FanOutSpec, MetadataSpec, StageSpec, UnitBinding,
};
pub use state::{ExecutionStatus, StageLifecycle, StageState};
