use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use cs_data::StorageManager;
use cs_engine::Task;
use cs_optimizer::{BackendConfig, BackendObjectiveFactory, Optimizer, Outcome, RunConfig, TaskFile};
use cs_types::{StaticRegistry, SuggestionKind};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "chainsearch")]
#[command(about = "Search node pipelines and their parameters for the lowest loss")]
struct Cli {
    /// Task file (JSON).
    #[arg(required_unless_present = "list")]
    task: Option<PathBuf>,

    /// List the pipelines stored in the results directory and exit.
    #[arg(long)]
    list: bool,

    /// Node registry file; overrides the task file's `registry`.
    #[arg(long)]
    registry: Option<PathBuf>,

    /// Program evaluating one operation; overrides the task file's backend.
    #[arg(long)]
    backend: Option<String>,

    /// Argument passed to the backend program, may contain `{spec}` and `{output}`.
    #[arg(long = "backend-arg", allow_hyphen_values = true)]
    backend_args: Vec<String>,

    /// Root of the per-pipeline result directories.
    #[arg(long)]
    results_dir: Option<PathBuf>,

    /// Worker threads; 0 evaluates on the main thread.
    #[arg(long)]
    workers: Option<usize>,

    /// Pipelines optimized at the same time.
    #[arg(long)]
    active_pipelines: Option<usize>,

    /// Suggestion algorithm: random, grid or bayesian.
    #[arg(long)]
    algorithm: Option<SuggestionKind>,

    /// Where the best operation is written.
    #[arg(long)]
    best_result_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_thread_names(true).init();

    match run(Cli::parse()).await {
        Ok(code) => code,
        Err(e) => {
            error!("{e:#}");
            ExitCode::from(1)
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    if cli.list {
        let mut run_config = RunConfig::default();
        if let Some(dir) = cli.results_dir {
            run_config = run_config.with_results_dir(dir);
        }
        list_pipelines(&run_config)?;
        return Ok(ExitCode::SUCCESS);
    }

    let task_path = cli.task.context("no task file given")?;
    let file = TaskFile::load(&task_path)?;

    let registry_path = cli
        .registry
        .or(file.registry)
        .context("no node registry given, use --registry or the task file's `registry`")?;
    let registry = StaticRegistry::from_json_file(&registry_path)?;
    info!(nodes = registry.len(), registry = %registry_path.display(), "Loaded node registry");

    let mut config = file.task;
    if let Some(algorithm) = cli.algorithm {
        config.suggestion_algorithm = algorithm;
    }
    let task = Task::new(config, Arc::new(registry))?;

    let backend = match (cli.backend, file.backend) {
        (Some(program), file_backend) => BackendConfig {
            program,
            args: cli.backend_args,
            timeout_secs: file_backend.and_then(|b| b.timeout_secs),
        },
        (None, Some(backend)) => backend,
        (None, None) => anyhow::bail!("no backend given, use --backend or the task file's `backend`"),
    };
    let factory = Arc::new(BackendObjectiveFactory::new(&task, Arc::new(backend.build())));

    let mut run_config = RunConfig::default();
    if let Some(dir) = cli.results_dir {
        run_config = run_config.with_results_dir(dir);
    }
    if let Some(workers) = cli.workers {
        run_config = run_config.with_workers(workers);
    }
    if let Some(pipelines) = cli.active_pipelines {
        run_config = run_config.with_max_active_pipelines(pipelines);
    }
    if let Some(path) = cli.best_result_file {
        run_config = run_config.with_best_result_file(path);
    }
    info!(results = %run_config.results_dir.display(), "Using results directory");

    let optimizer = Optimizer::new(task, factory, run_config)?;
    let cancel = optimizer.cancel_token();
    let mut handle = tokio::task::spawn_blocking(move || optimizer.do_optimization());

    let report = tokio::select! {
        joined = &mut handle => joined??,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, stopping running evaluations");
            cancel.cancel();
            handle.await??
        }
    };

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(match &report.outcome {
        Outcome::Best(best) => {
            info!(loss = best.loss, pipeline = %best.pipeline, "Best result");
            ExitCode::SUCCESS
        }
        Outcome::NoPipelineFound { input_type, max_length } => {
            error!(input_type = %input_type, max_length, "No pipeline could be constructed");
            ExitCode::from(2)
        }
        Outcome::NoUsableResult => {
            error!("No pipeline produced a usable result");
            ExitCode::from(3)
        }
    })
}

fn list_pipelines(config: &RunConfig) -> Result<()> {
    let storage = StorageManager::new(&config.results_dir)?;
    let stats = storage.get_stats()?;
    for descriptor in storage.list_pipelines()? {
        println!(
            "{}  {}  [{}]@{}",
            descriptor.id,
            descriptor.created_at.format("%Y-%m-%d %H:%M:%S"),
            descriptor.nodes.join(", "),
            descriptor.input_path
        );
    }
    println!(
        "{} pipelines, {} files, {:.1} MB in {}",
        stats.pipelines,
        stats.total_files,
        stats.total_size_mb(),
        stats.data_root.display()
    );
    Ok(())
}
