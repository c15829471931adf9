use anyhow::{Context, Result};
use ssx_pipeline::cli::commands::{RunCommand, ShowCommand, ValidateCommand};
use ssx_pipeline::cli::output::*;
use ssx_pipeline::cli::{Cli, Command};
use ssx_pipeline::core::config::{InputConfig, PipelineConfig, BUILTIN_PIPELINES};
use ssx_pipeline::core::{ExecutionStatus, ParameterSet, PipelineError, PipelineRun};
use ssx_pipeline::dispatch::{DispatchConfig, LocalDispatch};
use ssx_pipeline::execution::ExecutionEngine;
use ssx_pipeline::render::write_atomic;
use std::path::Path;
use std::sync::atomic::Ordering;
use tracing::{error, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::from_args();

    // Initialize logging
    let log_level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set logging subscriber")?;

    // Execute command
    match &cli.command {
        Command::Run(cmd) => run_pipeline(cmd).await?,
        Command::Validate(cmd) => validate_pipeline(cmd)?,
        Command::Show(cmd) => show_pipeline(cmd)?,
    }

    Ok(())
}

fn load_config(cmd: &RunCommand) -> Result<PipelineConfig> {
    match (&cmd.file, &cmd.pipeline) {
        (Some(file), _) => PipelineConfig::from_file(file),
        (None, Some(name)) => PipelineConfig::builtin(name),
        (None, None) => PipelineConfig::builtin("ssx"),
    }
}

async fn run_pipeline(cmd: &RunCommand) -> Result<()> {
    let config = load_config(cmd).context("Failed to load pipeline config")?;
    println!("{} Loaded pipeline: {}", INFO, style(&config.name).bold());

    let mut pipeline = config.to_pipeline()?;
    if let Some(limit) = cmd.concurrency {
        pipeline = pipeline.with_max_concurrency(limit);
    }

    let data_dir = std::fs::canonicalize(&cmd.data_dir)
        .with_context(|| format!("Data directory {} is not accessible", cmd.data_dir.display()))?;

    let mut params = ParameterSet::from_pairs(cmd.set.iter().map(|(k, v)| (k.as_str(), v.as_str())));
    for (key, value) in &cmd.set {
        println!("{} Parameter override: {} = {}", INFO, style(key).cyan(), style(value).dim());
    }
    params.insert("data_dir", data_dir.display().to_string());
    if let Some(endpoint) = &cmd.compute_endpoint {
        params.insert("compute_endpoint", endpoint.as_str());
    }

    let mut engine = ExecutionEngine::new(LocalDispatch::new(DispatchConfig::default()));
    engine.add_event_handler(|event| {
        if let Some(line) = format_execution_event(&event) {
            println!("{}", line);
        }
    });

    // Ctrl-C stops new work; dispatched units are awaited
    let abort = engine.abort_flag();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received; finishing dispatched work and stopping");
            abort.store(true, Ordering::SeqCst);
        }
    });

    println!();
    match engine.execute(&pipeline, &params).await {
        Ok(run) => {
            println!("\n{}", format_run_summary(&run));
            write_report(cmd.report.as_deref(), &run)?;
            if run.status != ExecutionStatus::Completed {
                std::process::exit(1);
            }
            for stage in run.failed_stages() {
                println!("{} {} did not succeed (not fatal for this pipeline)", WARN, style(stage).yellow());
            }
            println!(
                "\n{} {} completed {}",
                CHECK,
                style(&run.pipeline).bold(),
                style("successfully").green()
            );
        }
        Err(PipelineError::PipelineAborted { stage, source, run }) => {
            println!("\n{}", format_run_summary(&run));
            if let Some(record) = run.stage(&stage) {
                println!("\n{}", format_stage_failure(record));
            }
            write_report(cmd.report.as_deref(), &run)?;
            error!("{}", source);
            println!(
                "\n{} {} {} at stage {}",
                CROSS,
                style(&run.pipeline).bold(),
                style("aborted").red(),
                style(&stage).bold()
            );
            std::process::exit(1);
        }
        Err(e) => return Err(e).context("Pipeline could not be started"),
    }

    Ok(())
}

fn write_report(path: Option<&Path>, run: &PipelineRun) -> Result<()> {
    let Some(path) = path else {
        return Ok(());
    };
    let json = run.to_json().context("Failed to serialize run report")?;
    write_atomic(path, &json).context("Failed to write run report")?;
    println!("{} Run report written to {}", INFO, style(path.display()).dim());
    Ok(())
}

fn validate_pipeline(cmd: &ValidateCommand) -> Result<()> {
    println!("{} Validating pipeline...", INFO);

    let result = PipelineConfig::from_file(&cmd.file).and_then(|config| {
        config.to_pipeline()?;
        Ok(config)
    });

    match result {
        Ok(config) => {
            println!("{} Pipeline definition is valid!", CHECK);
            println!("  Name: {}", style(&config.name).bold());
            println!("  Stages: {}", style(config.stages.len()).cyan());
            println!("  Parameters: {}", style(config.parameters.len()).cyan());

            if cmd.json {
                let json = serde_json::to_string_pretty(&config)?;
                println!("\n{}", json);
            }
            Ok(())
        }
        Err(e) => {
            println!("{} Validation failed:", CROSS);
            println!("  {}", style(format!("{:#}", e)).red());
            std::process::exit(1);
        }
    }
}

fn show_pipeline(cmd: &ShowCommand) -> Result<()> {
    let Some(name) = &cmd.pipeline else {
        println!("{} Bundled pipelines:", INFO);
        for name in BUILTIN_PIPELINES {
            let config = PipelineConfig::builtin(name)?;
            println!(
                "  {} {}",
                style(name).bold(),
                style(config.description.unwrap_or_default()).dim()
            );
        }
        return Ok(());
    };

    let config = PipelineConfig::builtin(name)?;
    println!("{} {}", INFO, style(&config.name).bold());
    for (index, stage) in config.stages.iter().enumerate() {
        let input = match &stage.input {
            Some(InputConfig::Stage { stage }) => format!("output of {}", stage),
            Some(InputConfig::Path(path)) => path.clone(),
            None => "output of previous stage".to_string(),
        };
        let mode = match &stage.fan_out {
            Some(fan_out) => format!("{:?}", fan_out.mode).to_lowercase(),
            None => "single".to_string(),
        };
        println!(
            "  {} {} ({}{})",
            style(format!("{}.", index + 1)).dim(),
            style(&stage.name).cyan(),
            mode,
            if stage.abort_on_failure { "" } else { ", best effort" }
        );
        println!("     in:  {}", input);
        println!("     out: {}", stage.output);
        println!("     run: {}", style(stage.command.trim()).dim());
    }
    Ok(())
}
