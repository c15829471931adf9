//! Pipeline configuration from YAML

use crate::core::{params::ParameterSet, pipeline::StagePipeline};
use crate::render::ConfigTemplate;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;

const SSX_PIPELINE: &str = include_str!("../../pipelines/ssx.yaml");
const STILLS_PIPELINE: &str = include_str!("../../pipelines/stills.yaml");

/// Names of the pipelines bundled with the binary
pub const BUILTIN_PIPELINES: &[&str] = &["ssx", "stills"];

fn default_true() -> bool {
    true
}

fn default_frame_width() -> usize {
    5
}

fn default_separator() -> String {
    " ".to_string()
}

/// Top-level pipeline configuration loaded from YAML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Pipeline name
    pub name: String,

    #[serde(default)]
    pub description: Option<String>,

    /// Parameters available to every stage (override stage defaults)
    #[serde(default)]
    pub parameters: ParameterSet,

    /// Extra config templates by name, in addition to the bundled ones
    #[serde(default)]
    pub templates: BTreeMap<String, String>,

    /// Default wait bound for stages (in seconds)
    #[serde(default)]
    pub default_wait_secs: Option<u64>,

    /// Upper bound on concurrently running units of a parallel stage
    #[serde(default)]
    pub max_concurrency: Option<usize>,

    /// Stages, in execution order
    pub stages: Vec<StageConfig>,
}

/// Stage configuration as defined in YAML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageConfig {
    /// Unique stage name
    pub name: String,

    #[serde(default)]
    pub description: Option<String>,

    /// Keys that must have a value before the stage may start
    #[serde(default)]
    pub required: Vec<String>,

    /// Values used when neither the pipeline nor the caller supplies one
    #[serde(default)]
    pub defaults: ParameterSet,

    /// Where units are discovered. Absent means the previous stage's output.
    #[serde(default)]
    pub input: Option<InputConfig>,

    /// Output directory template
    pub output: String,

    /// Discovery of units under the input root
    #[serde(default)]
    pub units: Option<UnitsConfig>,

    /// Run the command once per unit instead of once per stage
    #[serde(default)]
    pub fan_out: Option<FanOutConfig>,

    /// Config file rendered before the command runs
    #[serde(default)]
    pub config: Option<ConfigFileConfig>,

    /// File name template of the listing/marker file naming every unit
    #[serde(default)]
    pub listing: Option<String>,

    /// Values read from a JSON file when not supplied otherwise
    #[serde(default)]
    pub metadata: Option<MetadataConfig>,

    /// Compute endpoint template handed to the dispatcher
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Command template
    pub command: String,

    /// Wait bound for each invocation (overrides the pipeline default)
    #[serde(default)]
    pub wait_secs: Option<u64>,

    /// Whether a failure of this stage stops the pipeline
    #[serde(default = "default_true")]
    pub abort_on_failure: bool,
}

/// Input root: a path template or the output of a named earlier stage
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum InputConfig {
    Stage { stage: String },
    Path(String),
}

/// How units are recognised
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitsConfig {
    /// File name suffix, e.g. `_master.h5`
    #[serde(default)]
    pub suffix: Option<String>,

    /// File name regular expression
    #[serde(default)]
    pub regex: Option<String>,

    /// Nested partition directory, e.g. `batch_1`
    #[serde(default)]
    pub partition: Option<String>,

    /// Fail the stage when nothing is found
    #[serde(default = "default_true")]
    pub mandatory: bool,

    /// Parameter holding the maximum number of units to take
    #[serde(default)]
    pub limit: Option<String>,

    /// Parameters built from the whole unit list
    #[serde(default)]
    pub bind: Vec<BindingConfig>,

    /// Keep only a numbered batch of the matching files
    #[serde(default)]
    pub window: Option<WindowConfig>,
}

/// A batch of numbered files, e.g. the 100 images ending at frame 500
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowConfig {
    /// File name text before the frame number (template)
    pub prefix: String,

    /// Digits in the zero-padded frame number
    #[serde(default = "default_frame_width")]
    pub width: usize,

    /// Parameter holding the last frame of the batch
    pub end: String,

    /// Parameter holding the number of frames in the batch
    pub size: String,
}

/// A parameter assembled from every unit, e.g. `image=a image=b`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BindingConfig {
    pub name: String,

    /// Template applied to each unit
    pub each: String,

    #[serde(default = "default_separator")]
    pub separator: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FanOutModeConfig {
    Sequential,
    Parallel,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FanOutConfig {
    pub mode: FanOutModeConfig,

    /// Per-unit working directory, relative to the stage output
    #[serde(default)]
    pub unit_dir: Option<String>,

    #[serde(default)]
    pub concurrency: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigFileConfig {
    /// Name of the template to render
    pub template: String,

    /// File name template, relative to the stage output
    #[serde(default)]
    pub file: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataConfig {
    /// Path template of the JSON file
    pub file: String,

    /// Parameter key -> dotted path inside the JSON document
    pub fields: BTreeMap<String, String>,
}

impl UnitsConfig {
    fn pattern_count(&self) -> usize {
        [self.suffix.is_some(), self.regex.is_some(), self.partition.is_some()]
            .iter()
            .filter(|set| **set)
            .count()
    }
}

impl PipelineConfig {
    /// Load pipeline configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read pipeline definition {}", path.display()))?;
        Self::from_yaml(&content)
    }

    /// Parse pipeline configuration from YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: PipelineConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// One of the bundled pipelines
    pub fn builtin(name: &str) -> Result<Self> {
        let yaml = match name {
            "ssx" => SSX_PIPELINE,
            "stills" => STILLS_PIPELINE,
            other => anyhow::bail!(
                "Unknown pipeline '{}' (available: {})",
                other,
                BUILTIN_PIPELINES.join(", ")
            ),
        };
        Self::from_yaml(yaml).with_context(|| format!("Bundled pipeline '{}' is invalid", name))
    }

    /// Validate the pipeline configuration
    pub fn validate(&self) -> Result<()> {
        if self.stages.is_empty() {
            anyhow::bail!("Pipeline '{}' has no stages", self.name);
        }
        if self.max_concurrency == Some(0) {
            anyhow::bail!("max_concurrency must be at least 1");
        }

        let mut seen = HashSet::new();
        for (index, stage) in self.stages.iter().enumerate() {
            if !seen.insert(stage.name.as_str()) {
                anyhow::bail!("Duplicate stage name: {}", stage.name);
            }

            match &stage.input {
                None if index == 0 => {
                    anyhow::bail!("First stage '{}' must declare an input", stage.name);
                }
                Some(InputConfig::Stage { stage: source }) => {
                    let earlier = self.stages[..index].iter().any(|s| &s.name == source);
                    if !earlier {
                        anyhow::bail!(
                            "Stage '{}' reads from '{}', which is not an earlier stage",
                            stage.name,
                            source
                        );
                    }
                }
                _ => {}
            }

            if let Some(units) = &stage.units {
                if units.pattern_count() != 1 {
                    anyhow::bail!(
                        "Stage '{}' must set exactly one of suffix, regex or partition",
                        stage.name
                    );
                }
                if let Some(regex) = &units.regex {
                    regex::Regex::new(regex)
                        .with_context(|| format!("Stage '{}' has an invalid unit regex", stage.name))?;
                }
                if let Some(window) = &units.window {
                    if units.partition.is_some() {
                        anyhow::bail!("Stage '{}' can only window file units", stage.name);
                    }
                    if !(1..=18).contains(&window.width) {
                        anyhow::bail!("Stage '{}' frame width must be between 1 and 18", stage.name);
                    }
                }
            }

            if let Some(fan_out) = &stage.fan_out {
                if stage.units.is_none() {
                    anyhow::bail!("Stage '{}' fans out but discovers no units", stage.name);
                }
                if fan_out.concurrency == Some(0) {
                    anyhow::bail!("Stage '{}' concurrency must be at least 1", stage.name);
                }
                if fan_out.mode == FanOutModeConfig::Parallel {
                    let per_unit = fan_out.unit_dir.as_ref().is_some_and(|dir| {
                        ConfigTemplate::new("unit_dir", dir)
                            .placeholders()
                            .iter()
                            .any(|key| matches!(*key, "unit_id" | "unit_name" | "unit_index"))
                    });
                    if !per_unit {
                        anyhow::bail!(
                            "Parallel stage '{}' needs a unit_dir derived from unit_id, unit_name or unit_index",
                            stage.name
                        );
                    }
                }
            }

            if let Some(config) = &stage.config {
                let known = self.templates.contains_key(&config.template)
                    || crate::render::TemplateSet::builtin().contains(&config.template);
                if !known {
                    anyhow::bail!(
                        "Stage '{}' references unknown template '{}'",
                        stage.name,
                        config.template
                    );
                }
            }

            if (stage.listing.is_some()) && stage.units.is_none() {
                anyhow::bail!("Stage '{}' writes a listing but discovers no units", stage.name);
            }
        }

        Ok(())
    }

    /// Convert config to a StagePipeline domain model
    pub fn to_pipeline(&self) -> Result<StagePipeline> {
        StagePipeline::from_config(self)
    }
}
