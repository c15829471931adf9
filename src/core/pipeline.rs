//! Pipeline domain model

use crate::core::{
    config::{InputConfig, PipelineConfig},
    error::PipelineError,
    layout::{DirectoryLayout, InputRoot},
    params::ParameterSet,
    stage::{StageSpec, DEFAULT_WAIT},
};
use crate::render::{ConfigTemplate, TemplateSet};
use std::time::Duration;

/// Concurrency limit for parallel stages when none is configured
pub const DEFAULT_CONCURRENCY: usize = 4;

/// An ordered list of stages plus the directory layout wiring them together
#[derive(Debug, Clone)]
pub struct StagePipeline {
    pub name: String,
    pub stages: Vec<StageSpec>,
    pub layout: DirectoryLayout,
    pub templates: TemplateSet,
    /// Values shared by every stage, below caller-supplied values
    pub parameters: ParameterSet,
    pub max_concurrency: usize,
}

impl StagePipeline {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            stages: Vec::new(),
            layout: DirectoryLayout::new(),
            templates: TemplateSet::builtin(),
            parameters: ParameterSet::new(),
            max_concurrency: DEFAULT_CONCURRENCY,
        }
    }

    /// Append a stage together with its layout entry
    pub fn with_stage(mut self, stage: StageSpec, input: InputRoot, output: &str) -> Self {
        self.layout.push(stage.name.clone(), input, output);
        self.stages.push(stage);
        self
    }

    pub fn with_parameters(mut self, parameters: ParameterSet) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn with_max_concurrency(mut self, limit: usize) -> Self {
        self.max_concurrency = limit.max(1);
        self
    }

    /// Create a pipeline from configuration
    pub fn from_config(config: &PipelineConfig) -> anyhow::Result<Self> {
        let default_wait = config.default_wait_secs.map(Duration::from_secs).unwrap_or(DEFAULT_WAIT);

        let mut templates = TemplateSet::builtin();
        for (name, text) in &config.templates {
            templates.insert(ConfigTemplate::new(name.clone(), text));
        }

        let mut pipeline = StagePipeline {
            templates,
            parameters: config.parameters.clone(),
            max_concurrency: config.max_concurrency.unwrap_or(DEFAULT_CONCURRENCY),
            ..StagePipeline::new(config.name.clone())
        };

        for stage_config in &config.stages {
            let stage = StageSpec::from_config(stage_config, default_wait)?;
            let input = match &stage_config.input {
                None => InputRoot::Previous,
                Some(InputConfig::Stage { stage }) => InputRoot::Stage(stage.clone()),
                Some(InputConfig::Path(path)) => {
                    InputRoot::Path(ConfigTemplate::new(format!("{}.input", stage.name), path))
                }
            };
            pipeline = pipeline.with_stage(stage, input, &stage_config.output);
        }

        pipeline.validate()?;
        Ok(pipeline)
    }

    /// Check the wiring between stages before anything runs
    pub fn validate(&self) -> Result<(), PipelineError> {
        let order = self.stage_names();
        self.layout.validate(&order)?;

        for stage in &self.stages {
            if let Some(config) = &stage.config_file {
                if !self.templates.contains(&config.template) {
                    return Err(PipelineError::InvalidDefinition(format!(
                        "stage '{}' references unknown template '{}'",
                        stage.name, config.template
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn stage(&self, name: &str) -> Option<&StageSpec> {
        self.stages.iter().find(|s| s.name == name)
    }

    /// Stage names in execution order
    pub fn stage_names(&self) -> Vec<String> {
        self.stages.iter().map(|s| s.name.clone()).collect()
    }
}
