//! CLI command definitions

use clap::Args;
use std::path::PathBuf;

/// Run a pipeline
#[derive(Debug, Args, Clone)]
pub struct RunCommand {
    /// Bundled pipeline to run (ssx, stills); defaults to ssx
    #[arg(short, long, conflicts_with = "file")]
    pub pipeline: Option<String>,

    /// Path to a pipeline YAML file
    #[arg(short, long)]
    pub file: Option<PathBuf>,

    /// Directory holding the raw data; stage directories are placed under it
    #[arg(short, long)]
    pub data_dir: PathBuf,

    /// Compute endpoint the stages are dispatched to
    #[arg(long)]
    pub compute_endpoint: Option<String>,

    /// Parameter overrides (key=value)
    #[arg(long, value_parser = parse_key_value)]
    pub set: Vec<(String, String)>,

    /// Units of a parallel stage in flight at once
    #[arg(long)]
    pub concurrency: Option<usize>,

    /// Write the run history as JSON to this path
    #[arg(long)]
    pub report: Option<PathBuf>,
}

/// Validate a pipeline definition
#[derive(Debug, Args, Clone)]
pub struct ValidateCommand {
    /// Path to pipeline YAML file
    #[arg(short, long)]
    pub file: PathBuf,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

/// Show the stages of a pipeline
#[derive(Debug, Args, Clone)]
pub struct ShowCommand {
    /// Bundled pipeline name; lists all bundled pipelines when omitted
    #[arg(short, long)]
    pub pipeline: Option<String>,
}

/// Parse key=value pairs
pub fn parse_key_value(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => Ok((key.trim().to_string(), value.to_string())),
        _ => Err(format!("Invalid key=value pair: {}", s)),
    }
}
