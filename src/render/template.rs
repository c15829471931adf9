//! Named-placeholder templates for commands and generated config files
//!
//! Placeholders have the form `{{ name }}`. Rendering is plain substitution of the
//! stringified parameter value; there are no expressions, conditionals or loops.

use crate::core::{error::PipelineError, params::ParameterSet};
use std::collections::HashMap;

const PRIME_PHIL: &str = include_str!("../../templates/prime.phil");
const PRIME_RUN_PHIL: &str = include_str!("../../templates/prime_run.phil");

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Placeholder(String),
}

/// A parsed template
#[derive(Debug, Clone)]
pub struct ConfigTemplate {
    name: String,
    segments: Vec<Segment>,
}

impl ConfigTemplate {
    pub fn new(name: impl Into<String>, text: &str) -> Self {
        Self {
            name: name.into(),
            segments: parse_segments(text),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Placeholder names in order of first appearance
    pub fn placeholders(&self) -> Vec<&str> {
        let mut seen = Vec::new();
        for segment in &self.segments {
            if let Segment::Placeholder(key) = segment {
                if !seen.contains(&key.as_str()) {
                    seen.push(key.as_str());
                }
            }
        }
        seen
    }

    /// First placeholder not covered by `params` or `extra_keys`
    pub fn first_missing<'a>(&'a self, params: &ParameterSet, extra_keys: &[&str]) -> Option<&'a str> {
        self.placeholders()
            .into_iter()
            .find(|key| !params.contains(key) && !extra_keys.contains(key))
    }

    /// Substitute every placeholder from `params`
    pub fn render(&self, params: &ParameterSet) -> Result<String, PipelineError> {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Placeholder(key) => {
                    let value = params.render_value(key).ok_or_else(|| PipelineError::MissingParameter {
                        context: self.name.clone(),
                        key: key.clone(),
                    })?;
                    out.push_str(&value);
                }
            }
        }
        Ok(out)
    }
}

fn is_placeholder_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn parse_segments(text: &str) -> Vec<Segment> {
    let mut segments = Vec::new();
    let mut literal = String::new();
    let mut rest = text;

    while let Some(open) = rest.find("{{") {
        let after_open = &rest[open + 2..];
        let Some(close) = after_open.find("}}") else {
            break;
        };
        let name = after_open[..close].trim();
        if is_placeholder_name(name) {
            literal.push_str(&rest[..open]);
            if !literal.is_empty() {
                segments.push(Segment::Literal(std::mem::take(&mut literal)));
            }
            segments.push(Segment::Placeholder(name.to_string()));
        } else {
            // Not a placeholder, keep the braces verbatim
            literal.push_str(&rest[..open + 2 + close + 2]);
        }
        rest = &after_open[close + 2..];
    }

    literal.push_str(rest);
    if !literal.is_empty() {
        segments.push(Segment::Literal(literal));
    }
    segments
}

/// Templates addressable by name
#[derive(Debug, Clone, Default)]
pub struct TemplateSet {
    templates: HashMap<String, ConfigTemplate>,
}

impl TemplateSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// The bundled PRIME config templates
    pub fn builtin() -> Self {
        let mut set = Self::new();
        set.insert(ConfigTemplate::new("prime_phil", PRIME_PHIL));
        set.insert(ConfigTemplate::new("prime_run_phil", PRIME_RUN_PHIL));
        set
    }

    pub fn insert(&mut self, template: ConfigTemplate) {
        self.templates.insert(template.name.clone(), template);
    }

    pub fn get(&self, name: &str) -> Option<&ConfigTemplate> {
        self.templates.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.templates.contains_key(name)
    }
}
