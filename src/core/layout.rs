//! Directory layout - where each stage reads from and writes to

use crate::core::{error::PipelineError, params::ParameterSet};
use crate::render::ConfigTemplate;
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Where a stage finds its units
#[derive(Debug, Clone)]
pub enum InputRoot {
    /// A path template rendered from the stage parameters
    Path(ConfigTemplate),
    /// The output directory of the stage immediately before
    Previous,
    /// The output directory of a named earlier stage
    Stage(String),
}

#[derive(Debug, Clone)]
pub struct LayoutEntry {
    pub stage: String,
    pub input: InputRoot,
    pub output: ConfigTemplate,
}

/// Rendered directories for one stage invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageDirs {
    pub input: PathBuf,
    pub output: PathBuf,
}

/// Stage name -> input/output roots, in pipeline order
#[derive(Debug, Clone, Default)]
pub struct DirectoryLayout {
    entries: Vec<LayoutEntry>,
}

impl DirectoryLayout {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, stage: impl Into<String>, input: InputRoot, output: &str) {
        let stage = stage.into();
        self.entries.push(LayoutEntry {
            output: ConfigTemplate::new(format!("{}.output", stage), output),
            stage,
            input,
        });
    }

    pub fn with(mut self, stage: impl Into<String>, input: InputRoot, output: &str) -> Self {
        self.push(stage, input, output);
        self
    }

    pub fn entry(&self, stage: &str) -> Option<&LayoutEntry> {
        self.entries.iter().find(|e| e.stage == stage)
    }

    pub fn entries(&self) -> &[LayoutEntry] {
        &self.entries
    }

    /// Check that every stage in `order` has an entry and that input roots
    /// only refer to stages that run earlier.
    pub fn validate(&self, order: &[String]) -> Result<(), PipelineError> {
        for (index, stage) in order.iter().enumerate() {
            let entry = self.entry(stage).ok_or_else(|| {
                PipelineError::InvalidDefinition(format!("no directory layout for stage '{}'", stage))
            })?;
            match &entry.input {
                InputRoot::Previous if index == 0 => {
                    return Err(PipelineError::InvalidDefinition(format!(
                        "stage '{}' has no previous stage to read from",
                        stage
                    )));
                }
                InputRoot::Stage(source) if !order[..index].contains(source) => {
                    return Err(PipelineError::InvalidDefinition(format!(
                        "stage '{}' reads from '{}', which does not run before it",
                        stage, source
                    )));
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Render the input and output roots of `stage`.
    ///
    /// `outputs` holds the output directory of every stage that already ran,
    /// `previous` names the stage immediately before.
    pub fn resolve(
        &self,
        stage: &str,
        params: &ParameterSet,
        outputs: &BTreeMap<String, PathBuf>,
        previous: Option<&str>,
    ) -> Result<StageDirs, PipelineError> {
        let entry = self.entry(stage).ok_or_else(|| {
            PipelineError::InvalidDefinition(format!("no directory layout for stage '{}'", stage))
        })?;

        let output = PathBuf::from(entry.output.render(params)?);
        let upstream = |name: &str| {
            outputs.get(name).cloned().ok_or_else(|| {
                PipelineError::InvalidDefinition(format!(
                    "stage '{}' reads from '{}', which has not run",
                    stage, name
                ))
            })
        };
        let input = match &entry.input {
            InputRoot::Path(template) => PathBuf::from(template.render(params)?),
            InputRoot::Stage(name) => upstream(name)?,
            InputRoot::Previous => match previous {
                Some(name) => upstream(name)?,
                None => {
                    return Err(PipelineError::InvalidDefinition(format!(
                        "stage '{}' has no previous stage to read from",
                        stage
                    )))
                }
            },
        };

        Ok(StageDirs { input, output })
    }
}
