//! Command-line interface for docsum.
//!
//! Provides commands for watching the input container, submitting items,
//! inspecting and resuming instances, and checking configuration.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use uuid::Uuid;

use crate::activities::{ActivityRegistry, ExtractActivity, PersistActivity, SummarizeActivity};
use crate::adapters::{
    AzureOpenAiClient, BlobStore, DocumentIntelligenceClient, FsBlobStore,
    TextGenerator, INPUT_CONTAINER,
};
use crate::config::{mask_secret, Settings};
use crate::core::{Orchestrator, Pipeline, SUMMARIZE_DOCUMENT};
use crate::domain::{InstanceStatus, InstanceView, StepOutcome};
use crate::ingest::{Dispatcher, InputWatcher, WatcherConfig};

/// docsum - Durable document summarization pipeline
#[derive(Parser, Debug)]
#[command(name = "docsum")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Config file (default: nearest .docsum/config.yaml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Watch the input container and summarize new documents
    Watch {
        /// Also dispatch files already present when the watcher starts
        #[arg(long)]
        scan_existing: bool,
    },

    /// Start an instance for one item (e.g. input/report.pdf)
    Submit {
        /// Item reference; the trailing path segment is the item id
        item_ref: String,

        /// Pipeline to run
        #[arg(short, long, default_value = SUMMARIZE_DOCUMENT)]
        pipeline: String,

        /// Record the instance and return without running it
        #[arg(long)]
        detach: bool,

        /// Seconds to wait for completion
        #[arg(long, default_value = "600")]
        timeout: u64,
    },

    /// Check the status of an instance
    Status {
        /// Instance ID (UUID)
        instance_id: String,
    },

    /// List recent instances
    Instances {
        /// Maximum number of instances to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },

    /// Print the history of an instance
    History {
        /// Instance ID (UUID)
        instance_id: String,

        /// Print raw JSON events
        #[arg(long)]
        json: bool,
    },

    /// Resume an interrupted instance
    Resume {
        /// Instance ID to resume
        instance_id: String,

        /// Seconds to wait for completion
        #[arg(long, default_value = "600")]
        timeout: u64,
    },

    /// Cancel a running instance
    Cancel {
        /// Instance ID to cancel
        instance_id: String,

        /// Reason recorded in the history
        #[arg(short, long, default_value = "cancelled by operator")]
        reason: String,
    },

    /// Verify configuration and service connectivity
    Check,

    /// Show resolved configuration (debug)
    Config,
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        let settings = Settings::load(self.config.as_deref())?;

        match self.command {
            Commands::Watch { scan_existing } => watch(&settings, scan_existing).await,
            Commands::Submit {
                item_ref,
                pipeline,
                detach,
                timeout,
            } => submit(&settings, &item_ref, &pipeline, detach, timeout).await,
            Commands::Status { instance_id } => show_status(&settings, &instance_id).await,
            Commands::Instances { limit } => list_instances(&settings, limit).await,
            Commands::History { instance_id, json } => {
                show_history(&settings, &instance_id, json).await
            }
            Commands::Resume {
                instance_id,
                timeout,
            } => resume_instance(&settings, &instance_id, timeout).await,
            Commands::Cancel {
                instance_id,
                reason,
            } => cancel_instance(&settings, &instance_id, &reason).await,
            Commands::Check => check(&settings).await,
            Commands::Config => show_config(&settings),
        }
    }
}

/// Orchestrator with real activities and every known pipeline
fn build_engine(settings: &Settings) -> Result<Orchestrator> {
    let blobs: Arc<dyn BlobStore> = Arc::new(FsBlobStore::new(&settings.storage_root));
    let analyzer = Arc::new(DocumentIntelligenceClient::from_settings(&settings.analysis)?);
    let generator = Arc::new(AzureOpenAiClient::from_settings(&settings.generation)?);

    let activities = ActivityRegistry::new()
        .with(Arc::new(ExtractActivity::new(blobs.clone(), analyzer)))
        .with(Arc::new(SummarizeActivity::new(generator)))
        .with(Arc::new(PersistActivity::new(blobs)));

    let mut builder = Orchestrator::builder(settings.instances_dir(), activities)
        .pipeline(Pipeline::summarize_document(settings.retry.clone()));

    for pipeline in load_pipelines(&settings.pipelines_dir())? {
        builder = builder.pipeline(pipeline);
    }

    builder.build()
}

/// Orchestrator for commands that only read or cancel histories
fn build_reader(settings: &Settings) -> Result<Orchestrator> {
    Orchestrator::builder(settings.instances_dir(), ActivityRegistry::new()).build()
}

/// Load YAML pipelines from `dir`, if it exists
fn load_pipelines(dir: &std::path::Path) -> Result<Vec<Pipeline>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }

    let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)
        .with_context(|| format!("Failed to read pipelines directory: {}", dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("yaml"))
        .collect();
    paths.sort();

    paths.iter().map(|p| Pipeline::from_file(p)).collect()
}

fn parse_instance_id(value: &str) -> Result<Uuid> {
    Uuid::parse_str(value).with_context(|| format!("Invalid instance ID: {}", value))
}

/// Watch the input container and dispatch every new item
async fn watch(settings: &Settings, scan_existing: bool) -> Result<()> {
    let orchestrator = build_engine(settings)?;
    let worker = orchestrator.start_worker()?;
    orchestrator.recover().await?;

    let input_dir = settings.input_dir();
    tokio::fs::create_dir_all(&input_dir)
        .await
        .with_context(|| format!("Failed to create input directory: {}", input_dir.display()))?;

    let watcher = InputWatcher::new(WatcherConfig::new(&input_dir, &settings.watch))?;
    let dispatcher = Dispatcher::new(orchestrator.clone());

    let existing = watcher.scan_once().await?;
    let mut seen = HashSet::new();
    for item in existing {
        if scan_existing {
            if let Err(e) = dispatcher.on_new_item(&item.item_ref).await {
                tracing::warn!(item_ref = %item.item_ref, error = %e, "Failed to dispatch item");
            }
        }
        seen.insert(item.path);
    }

    let (mut items, handle) = watcher.watch(seen)?;
    eprintln!("Watching {} (Ctrl-C to stop)", input_dir.display());

    loop {
        tokio::select! {
            item = items.recv() => {
                let Some(item) = item else { break };
                match dispatcher.on_new_item(&item.item_ref).await {
                    Ok(instance_id) => eprintln!("{} -> instance {}", item.item_ref, instance_id),
                    Err(e) => tracing::warn!(item_ref = %item.item_ref, error = %e, "Failed to dispatch item"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                eprintln!("Stopping...");
                break;
            }
        }
    }

    handle.stop().await?;
    worker.stop().await?;
    Ok(())
}

/// Start an instance and (unless detached) wait for it
async fn submit(
    settings: &Settings,
    item_ref: &str,
    pipeline: &str,
    detach: bool,
    timeout: u64,
) -> Result<()> {
    let orchestrator = build_engine(settings)?;
    let dispatcher = Dispatcher::for_pipeline(orchestrator.clone(), pipeline);

    if detach {
        // Without a worker the first step is only recorded as scheduled;
        // a later `resume` or `watch` runs it
        let instance_id = dispatcher.on_new_item(item_ref).await?;
        println!("{}", instance_id);
        return Ok(());
    }

    let worker = orchestrator.start_worker()?;
    let instance_id = dispatcher.on_new_item(item_ref).await?;
    eprintln!("Instance {} started", instance_id);

    let result = orchestrator
        .wait_for(instance_id, Duration::from_secs(timeout))
        .await;
    worker.stop().await?;

    report_outcome(&result?)
}

/// Resume an instance and wait for it
async fn resume_instance(settings: &Settings, instance_id: &str, timeout: u64) -> Result<()> {
    let instance_id = parse_instance_id(instance_id)?;
    let orchestrator = build_engine(settings)?;
    let worker = orchestrator.start_worker()?;

    let view = orchestrator.resume(instance_id).await?;
    let result = if view.is_finished() {
        Ok(view)
    } else {
        orchestrator
            .wait_for(instance_id, Duration::from_secs(timeout))
            .await
    };
    worker.stop().await?;

    report_outcome(&result?)
}

/// Print the final result; non-zero exit for anything but success
fn report_outcome(view: &InstanceView) -> Result<()> {
    match view.status {
        InstanceStatus::Completed => {
            if let Some(result) = &view.result {
                println!("{}", display_value(result));
            }
            eprintln!("\n[Instance {} completed]", view.id);
            Ok(())
        }
        _ => {
            print_view(view);
            std::process::exit(1);
        }
    }
}

/// Show the status of an instance
async fn show_status(settings: &Settings, instance_id: &str) -> Result<()> {
    let instance_id = parse_instance_id(instance_id)?;
    let view = build_reader(settings)?.get_status(instance_id).await?;

    print_view(&view);
    Ok(())
}

fn print_view(view: &InstanceView) {
    println!("Instance ID: {}", view.id);
    println!("Pipeline: {}", view.pipeline);
    println!("Input: {}", display_value(&view.input));
    println!("Status: {}", view.status);
    println!("Started: {}", view.started_at);
    if let Some(finished) = view.finished_at {
        println!("Finished: {}", finished);
    }
    if let Some(result) = &view.result {
        println!("Result: {}", display_value(result));
    }
    if let Some(error) = &view.last_error {
        println!("Last error: {}", error);
    }
    if let Some(reason) = &view.reason {
        println!("Reason: {}", reason);
    }

    if !view.steps.is_empty() {
        println!("\nSteps:");
        for step in view.steps.values() {
            let outcome = match &step.outcome {
                StepOutcome::Scheduled => "scheduled".to_string(),
                StepOutcome::Succeeded { .. } => "succeeded".to_string(),
                StepOutcome::Failed { error } => format!("failed ({:?})", error.kind),
            };
            let retry = step
                .retry_at
                .map(|at| format!(", retry at {}", at))
                .unwrap_or_default();
            println!(
                "  {}: {} - {} after {} attempt(s){}",
                step.step_index, step.activity_name, outcome, step.attempts, retry
            );
        }
    }

    // A summary computed before a failed persist stays in history
    if view.status == InstanceStatus::Failed {
        if let Some(summary) = view.step_output("summarize") {
            println!("\nRecovered summary:\n{}", display_value(summary));
        }
    }
}

fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// List recent instances
async fn list_instances(settings: &Settings, limit: usize) -> Result<()> {
    let views = build_reader(settings)?.list_instances(limit).await?;

    if views.is_empty() {
        println!("No instances found");
        return Ok(());
    }

    println!("{:<38} {:<20} {:<12} {:<30}", "INSTANCE ID", "PIPELINE", "STATUS", "INPUT");
    println!("{}", "-".repeat(100));

    for view in views {
        println!(
            "{:<38} {:<20} {:<12} {:<30}",
            view.id,
            view.pipeline,
            view.status.to_string(),
            display_value(&view.input)
        );
    }

    Ok(())
}

/// Print the history of an instance
async fn show_history(settings: &Settings, instance_id: &str, json: bool) -> Result<()> {
    let instance_id = parse_instance_id(instance_id)?;
    let events = build_reader(settings)?.history(instance_id).await?;

    for event in events {
        if json {
            println!("{}", serde_json::to_string(&event)?);
        } else {
            let duration = event
                .duration_ms
                .map(|ms| format!(" ({}ms)", ms))
                .unwrap_or_default();
            println!(
                "{:>4}  {}  {}{}",
                event.sequence,
                event.timestamp.format("%Y-%m-%d %H:%M:%S%.3f"),
                event.summary(),
                duration
            );
        }
    }

    Ok(())
}

/// Cancel a running instance
async fn cancel_instance(settings: &Settings, instance_id: &str, reason: &str) -> Result<()> {
    let instance_id = parse_instance_id(instance_id)?;
    let view = build_reader(settings)?.cancel(instance_id, reason).await?;

    println!("Instance {} {}", view.id, view.status);
    Ok(())
}

/// Verify configuration and service connectivity
async fn check(settings: &Settings) -> Result<()> {
    let mut ok = true;

    let input_dir = settings.input_dir();
    if input_dir.is_dir() {
        let items = FsBlobStore::new(&settings.storage_root)
            .list(INPUT_CONTAINER)
            .await?;
        println!("[ok]   storage: {} ({} input items)", settings.storage_root.display(), items.len());
    } else {
        println!("[warn] storage: {} has no input container yet", settings.storage_root.display());
    }

    match DocumentIntelligenceClient::from_settings(&settings.analysis) {
        Ok(_) => println!("[ok]   layout analysis configured"),
        Err(e) => {
            ok = false;
            println!("[fail] layout analysis: {}", e);
        }
    }

    match AzureOpenAiClient::from_settings(&settings.generation) {
        Ok(client) => match client.health_check().await {
            Ok(()) => println!("[ok]   text generation reachable"),
            Err(e) => {
                ok = false;
                println!("[fail] text generation: {:#}", e);
            }
        },
        Err(e) => {
            ok = false;
            println!("[fail] text generation: {}", e);
        }
    }

    if !ok {
        anyhow::bail!("Configuration check failed");
    }
    Ok(())
}

/// Show resolved configuration
fn show_config(settings: &Settings) -> Result<()> {
    println!("docsum configuration");
    println!();
    println!(
        "Config file: {}",
        settings
            .config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!();
    println!("Paths:");
    println!("  Home (engine state): {}", settings.home.display());
    println!("  Instances:           {}", settings.instances_dir().display());
    println!("  Pipelines:           {}", settings.pipelines_dir().display());
    println!("  Storage:             {}", settings.storage_root.display());
    println!();
    println!("Layout analysis:");
    println!("  Endpoint:    {}", settings.analysis.endpoint.as_deref().unwrap_or("(not set)"));
    println!("  Key:         {}", mask_secret(settings.analysis.key.as_deref()));
    println!("  Model:       {}", settings.analysis.model_id);
    println!("  API version: {}", settings.analysis.api_version);
    println!("  Locale:      {}", settings.analysis.locale);
    println!();
    println!("Text generation:");
    println!("  Endpoint:    {}", settings.generation.endpoint.as_deref().unwrap_or("(not set)"));
    println!("  Key:         {}", mask_secret(settings.generation.key.as_deref()));
    println!("  Deployment:  {}", settings.generation.deployment.as_deref().unwrap_or("(not set)"));
    println!("  API version: {}", settings.generation.api_version);
    println!("  Max tokens:  {}", settings.generation.max_tokens);
    println!();
    println!("Retry policy:");
    println!("  Max attempts:       {}", settings.retry.max_attempts);
    println!("  First retry delay:  {}ms", settings.retry.first_retry_delay_ms);
    println!("  Backoff multiplier: {}", settings.retry.backoff_multiplier);
    println!();
    println!("Watch patterns: {}", settings.watch.patterns.join(", "));

    Ok(())
}
