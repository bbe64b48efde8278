use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use weave_core::callback::RunCallbacks;
use weave_core::catalog::{self, NodeRegistry};
use weave_core::config::WeaveConfig;
use weave_core::event::Event;
use weave_core::runtime::Scheduler;
use weave_core::session::SessionBus;
use weave_core::workflow::{self, WorkflowDocument};

#[derive(Parser)]
#[command(name = "weave", version, about = "DAG workflow runtime")]
struct Cli {
    /// Path to a weave.toml config (defaults to ./weave.toml if present).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Path to a declarative node catalog (JSON) overlaid on the built-ins.
    #[arg(long, global = true)]
    catalog: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Validate a workflow document without running it.
    Validate { file: PathBuf },
    /// Run a workflow, streaming events to stdout as SSE frames.
    Run { file: PathBuf },
    /// List the registered node types.
    Catalog,
}

#[tokio::main]
async fn main() -> Result<()> {
    weave_core::init_tracing();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;
    let registry = build_registry(cli.catalog.as_deref())?;

    match cli.command {
        Command::Validate { file } => validate(&registry, &file),
        Command::Run { file } => run(registry, config, &file).await,
        Command::Catalog => {
            list_catalog(&registry);
            Ok(())
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<WeaveConfig> {
    match path {
        Some(path) => {
            WeaveConfig::load(path).with_context(|| format!("loading {}", path.display()))
        }
        None => Ok(WeaveConfig::load_or_default()),
    }
}

fn build_registry(catalog_path: Option<&Path>) -> Result<NodeRegistry> {
    let mut builder = catalog::builtin::builder();
    if let Some(path) = catalog_path {
        let specs = catalog::load_catalog(path)?;
        builder = builder.overlay(specs)?;
    }
    Ok(builder.build()?)
}

fn read_document(file: &Path) -> Result<WorkflowDocument> {
    let contents =
        std::fs::read_to_string(file).with_context(|| format!("reading {}", file.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parsing {}", file.display()))
}

fn validate(registry: &NodeRegistry, file: &Path) -> Result<()> {
    let doc = read_document(file)?;
    let wf = workflow::validate(registry, &doc)?;
    println!(
        "ok: {} nodes, {} edges, order: {}",
        wf.nodes.len(),
        wf.edges.len(),
        wf.topo_order().join(" -> ")
    );
    Ok(())
}

async fn run(registry: NodeRegistry, config: WeaveConfig, file: &Path) -> Result<()> {
    let doc = read_document(file)?;

    let bus = Arc::new(SessionBus::new(config.session.queue_capacity));
    let session_id = Uuid::new_v4().to_string();
    bus.create_session(&session_id)?;
    let mut subscription = bus.subscribe(&session_id)?;
    let callbacks = Arc::new(RunCallbacks::new(Arc::clone(&bus), &session_id));

    let scheduler = Scheduler::new(Arc::new(registry), Arc::new(config));

    let runner = {
        let callbacks = Arc::clone(&callbacks);
        tokio::spawn(async move {
            match workflow::validate(scheduler.registry(), &doc) {
                Ok(wf) => {
                    callbacks.workflow(serde_json::json!({
                        "nodes": wf.nodes,
                        "edges": wf.edges,
                    }));
                    let outcome = scheduler
                        .run(&wf, callbacks, CancellationToken::new())
                        .await;
                    outcome.summary.is_success()
                }
                Err(e) => {
                    callbacks.error(&e.to_string());
                    false
                }
            }
        })
    };

    while let Some(event) = subscription.next().await {
        print_sse(&event)?;
    }

    let success = runner.await.context("run task failed")?;
    bus.close_after_grace(&session_id, Duration::ZERO).await;

    if !success {
        std::process::exit(1);
    }
    Ok(())
}

fn print_sse(event: &Event) -> Result<()> {
    println!("event: {}", event.kind.as_str());
    println!("data: {}\n", serde_json::to_string(&event.payload)?);
    Ok(())
}

fn list_catalog(registry: &NodeRegistry) {
    for spec in registry.list() {
        println!("{} ({})", spec.node_type, spec.name);
        if !spec.description.is_empty() {
            println!("    {}", spec.description);
        }
        for param in &spec.params {
            let required = if param.required { "required" } else { "optional" };
            println!("    param {} ({}, {})", param.name, param.kind.as_str(), required);
        }
        for output in &spec.outputs {
            println!("    output {}", output.name);
        }
    }
}
