//! Stage domain model

use crate::core::{
    config::{FanOutModeConfig, StageConfig},
    error::PipelineError,
    params::ParameterSet,
};
use crate::discovery::UnitPattern;
use crate::render::ConfigTemplate;
use regex::Regex;
use std::time::Duration;

/// Wait bound applied when neither stage nor pipeline sets one
pub const DEFAULT_WAIT: Duration = Duration::from_secs(7200);

/// Keys describing the unit an invocation works on
pub const UNIT_KEYS: &[&str] = &["unit", "unit_name", "unit_id", "unit_index", "unit_dir"];

/// What happens when a stage does not succeed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailurePolicy {
    pub abort_on_failure: bool,
    pub wait_bound: Duration,
}

impl Default for FailurePolicy {
    fn default() -> Self {
        Self {
            abort_on_failure: true,
            wait_bound: DEFAULT_WAIT,
        }
    }
}

/// A parameter assembled from every discovered unit
#[derive(Debug, Clone)]
pub struct UnitBinding {
    pub name: String,
    pub each: ConfigTemplate,
    pub separator: String,
}

#[derive(Debug, Clone)]
pub struct DiscoverySpec {
    pub pattern: UnitPattern,
    pub mandatory: bool,
    /// Parameter holding the maximum number of units
    pub limit_param: Option<String>,
    pub bindings: Vec<UnitBinding>,
    pub window: Option<WindowSpec>,
}

/// Numbered batch of files to keep, resolved against stage parameters
#[derive(Debug, Clone)]
pub struct WindowSpec {
    pub prefix: ConfigTemplate,
    pub width: usize,
    /// Parameter holding the last frame of the batch
    pub end_param: String,
    /// Parameter holding the number of frames in the batch
    pub size_param: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FanOutMode {
    /// Unit N+1 starts after unit N completes
    Sequential,
    /// Units run concurrently, each in its own directory
    Parallel,
}

#[derive(Debug, Clone)]
pub struct FanOutSpec {
    pub mode: FanOutMode,
    /// Per-unit working directory relative to the stage output
    pub unit_dir: Option<ConfigTemplate>,
    pub concurrency: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct ConfigFileSpec {
    pub template: String,
    pub file: ConfigTemplate,
}

#[derive(Debug, Clone)]
pub struct MetadataSpec {
    pub file: ConfigTemplate,
    /// Parameter key -> dotted JSON path
    pub fields: Vec<(String, String)>,
}

/// A single stage in a pipeline
#[derive(Debug, Clone)]
pub struct StageSpec {
    pub name: String,
    pub required: Vec<String>,
    pub defaults: ParameterSet,
    pub command: ConfigTemplate,
    pub endpoint: Option<ConfigTemplate>,
    pub policy: FailurePolicy,
    pub discovery: Option<DiscoverySpec>,
    pub fan_out: Option<FanOutSpec>,
    pub config_file: Option<ConfigFileSpec>,
    pub listing: Option<ConfigTemplate>,
    pub metadata: Option<MetadataSpec>,
}

impl StageSpec {
    /// A stage that runs `command` once in its output directory
    pub fn new(name: impl Into<String>, command: &str) -> Self {
        let name = name.into();
        Self {
            command: ConfigTemplate::new(format!("{}.command", name), command),
            name,
            required: Vec::new(),
            defaults: ParameterSet::new(),
            endpoint: None,
            policy: FailurePolicy::default(),
            discovery: None,
            fan_out: None,
            config_file: None,
            listing: None,
            metadata: None,
        }
    }

    /// Create a stage from a stage config
    pub fn from_config(config: &StageConfig, default_wait: Duration) -> Result<Self, PipelineError> {
        let name = config.name.clone();
        let template = |suffix: &str, text: &str| ConfigTemplate::new(format!("{}.{}", name, suffix), text);

        let discovery = match &config.units {
            Some(units) => {
                let pattern = if let Some(suffix) = &units.suffix {
                    UnitPattern::Suffix(suffix.clone())
                } else if let Some(regex) = &units.regex {
                    let compiled = Regex::new(regex).map_err(|e| {
                        PipelineError::InvalidDefinition(format!("stage '{}': bad unit regex: {}", name, e))
                    })?;
                    UnitPattern::Regex(compiled)
                } else if let Some(partition) = &units.partition {
                    UnitPattern::Partition(partition.clone())
                } else {
                    return Err(PipelineError::InvalidDefinition(format!(
                        "stage '{}': units need a suffix, regex or partition",
                        name
                    )));
                };

                Some(DiscoverySpec {
                    pattern,
                    mandatory: units.mandatory,
                    limit_param: units.limit.clone(),
                    bindings: units
                        .bind
                        .iter()
                        .map(|b| UnitBinding {
                            name: b.name.clone(),
                            each: template(&b.name, &b.each),
                            separator: b.separator.clone(),
                        })
                        .collect(),
                    window: units.window.as_ref().map(|w| WindowSpec {
                        prefix: template("window", &w.prefix),
                        width: w.width,
                        end_param: w.end.clone(),
                        size_param: w.size.clone(),
                    }),
                })
            }
            None => None,
        };

        let fan_out = config.fan_out.as_ref().map(|f| FanOutSpec {
            mode: match f.mode {
                FanOutModeConfig::Sequential => FanOutMode::Sequential,
                FanOutModeConfig::Parallel => FanOutMode::Parallel,
            },
            unit_dir: f.unit_dir.as_deref().map(|d| template("unit_dir", d)),
            concurrency: f.concurrency,
        });

        let config_file = config.config.as_ref().map(|c| ConfigFileSpec {
            template: c.template.clone(),
            file: template(
                "config_file",
                c.file.as_deref().unwrap_or("{{ stage }}_{{ unit_count }}.phil"),
            ),
        });

        let metadata = config.metadata.as_ref().map(|m| MetadataSpec {
            file: template("metadata", &m.file),
            fields: m.fields.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        });

        Ok(StageSpec {
            command: template("command", &config.command),
            endpoint: config.endpoint.as_deref().map(|e| template("endpoint", e)),
            required: config.required.clone(),
            defaults: config.defaults.clone(),
            policy: FailurePolicy {
                abort_on_failure: config.abort_on_failure,
                wait_bound: config.wait_secs.map(Duration::from_secs).unwrap_or(default_wait),
            },
            discovery,
            fan_out,
            config_file,
            listing: config.listing.as_deref().map(|l| template("listing", l)),
            metadata,
            name: config.name.clone(),
        })
    }

    pub fn with_required(mut self, keys: &[&str]) -> Self {
        self.required = keys.iter().map(|k| k.to_string()).collect();
        self
    }

    pub fn with_defaults(mut self, defaults: ParameterSet) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn with_policy(mut self, abort_on_failure: bool, wait_bound: Duration) -> Self {
        self.policy = FailurePolicy {
            abort_on_failure,
            wait_bound,
        };
        self
    }

    pub fn with_discovery(mut self, discovery: DiscoverySpec) -> Self {
        self.discovery = Some(discovery);
        self
    }

    pub fn with_fan_out(mut self, fan_out: FanOutSpec) -> Self {
        self.fan_out = Some(fan_out);
        self
    }

    pub fn with_listing(mut self, file: &str) -> Self {
        self.listing = Some(ConfigTemplate::new(format!("{}.listing", self.name), file));
        self
    }

    pub fn with_config_file(mut self, template: &str, file: &str) -> Self {
        self.config_file = Some(ConfigFileSpec {
            template: template.to_string(),
            file: ConfigTemplate::new(format!("{}.config_file", self.name), file),
        });
        self
    }

    /// Whether the command runs once per unit
    pub fn fans_out(&self) -> bool {
        self.fan_out.is_some()
    }
}
