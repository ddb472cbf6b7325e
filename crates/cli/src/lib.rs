//! EdgeQL CLI library
//!
//! Command parsing and the command implementations, kept out of the binary
//! entry point so they can be unit tested.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueHint};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use edgeql_core::{
    BuiltinRunner, Compiler, EngineConfig, Error, Executor, FsDatasetProvider, MemoryStorage,
    NodeCatalog, Run, RunStatus, RunnerRegistry, SandboxNodeRunner, ValidationReport,
};
use edgeql_sandbox::{Reaper, SandboxRunner};

/// EdgeQL - declarative backtesting pipeline engine
#[derive(Parser, Debug, Clone)]
#[command(name = "edgeql")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to the engine config file (TOML)
    #[arg(short = 'c', long, value_hint = ValueHint::FilePath)]
    pub config: Option<PathBuf>,

    /// Verbose logging (equivalent to RUST_LOG=debug)
    #[arg(short = 'v', long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

/// Subcommands.
#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Compile a pipeline file and print the IR or the validation report
    Compile(CompileArgs),
    /// Compile and execute a pipeline file
    Run(RunArgs),
    /// List known node types (builtin and discovered custom nodes)
    Nodes(NodesArgs),
}

/// Arguments for `edgeql compile`.
#[derive(Parser, Debug, Clone)]
pub struct CompileArgs {
    /// Pipeline source file
    #[arg(value_hint = ValueHint::FilePath)]
    pub file: PathBuf,

    /// Print the IR or report as JSON
    #[arg(long)]
    pub json: bool,
}

/// Arguments for `edgeql run`.
#[derive(Parser, Debug, Clone)]
pub struct RunArgs {
    /// Pipeline source file
    #[arg(value_hint = ValueHint::FilePath)]
    pub file: PathBuf,

    /// Dataset directory (overrides the config file)
    #[arg(short = 'd', long, value_hint = ValueHint::DirPath)]
    pub datasets: Option<PathBuf>,

    /// Custom-node directory (overrides the config file)
    #[arg(long, value_hint = ValueHint::DirPath)]
    pub nodes: Option<PathBuf>,

    /// Worker pool size (overrides the config file)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Pipeline id recorded on the run
    #[arg(long, default_value = "cli")]
    pub pipeline_id: String,

    /// Print the full run as JSON
    #[arg(long)]
    pub json: bool,
}

/// Arguments for `edgeql nodes`.
#[derive(Parser, Debug, Clone)]
pub struct NodesArgs {
    /// Custom-node directory (overrides the config file)
    #[arg(long, value_hint = ValueHint::DirPath)]
    pub nodes: Option<PathBuf>,
}

/// Process exit codes: 0 success, 1 validation errors, 2 IO errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CliExitCode {
    /// Command succeeded
    Success,
    /// The pipeline failed validation (or the run failed)
    ValidationFailed,
    /// Source file or dataset could not be read
    IoError,
}

impl CliExitCode {
    /// Numeric process exit code.
    pub fn code(&self) -> i32 {
        match self {
            CliExitCode::Success => 0,
            CliExitCode::ValidationFailed => 1,
            CliExitCode::IoError => 2,
        }
    }
}

/// Initialize tracing with an env-filter; `-v` forces debug.
pub fn init_tracing(verbose: bool) {
    let default_filter = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Load the engine config, tolerating a missing default file.
pub fn load_engine_config(args: &Args) -> Result<EngineConfig, String> {
    match &args.config {
        Some(path) => EngineConfig::load(path).map_err(|err| err.to_string()),
        None => Ok(EngineConfig::default()),
    }
}

fn print_report(report: &ValidationReport, json: bool) {
    if json {
        match serde_json::to_string_pretty(report) {
            Ok(body) => println!("{body}"),
            Err(err) => eprintln!("cannot serialize report: {err}"),
        }
    } else {
        eprintln!("validation failed: {report}");
    }
}

/// `edgeql compile` implementation.
pub fn run_compile_command(args: &CompileArgs, config: &EngineConfig) -> CliExitCode {
    let source = match std::fs::read_to_string(&args.file) {
        Ok(source) => source,
        Err(err) => {
            eprintln!("cannot read {}: {err}", args.file.display());
            return CliExitCode::IoError;
        }
    };
    let catalog = build_catalog(config, None);
    match Compiler::new(&catalog).compile(&source) {
        Ok(ir) => {
            if args.json {
                match serde_json::to_string_pretty(&ir) {
                    Ok(body) => println!("{body}"),
                    Err(err) => {
                        eprintln!("cannot serialize IR: {err}");
                        return CliExitCode::IoError;
                    }
                }
            } else {
                println!(
                    "compiled {} node(s), hash {}",
                    ir.metadata.node_count, ir.metadata.content_hash
                );
                for (position, node) in ir.nodes.iter().enumerate() {
                    let deps = if node.depends_on.is_empty() {
                        String::new()
                    } else {
                        format!(" <- [{}]", node.depends_on.join(", "))
                    };
                    println!(
                        "  {position}. {} ({}, {}){deps}",
                        node.id, node.node_type, node.runtime
                    );
                }
            }
            CliExitCode::Success
        }
        Err(Error::Validation(report)) => {
            print_report(&report, args.json);
            CliExitCode::ValidationFailed
        }
        Err(err) => {
            eprintln!("compilation failed: {err}");
            CliExitCode::IoError
        }
    }
}

fn build_catalog(config: &EngineConfig, override_root: Option<&PathBuf>) -> NodeCatalog {
    let root = override_root.or(config.custom_nodes_dir.as_ref());
    match root {
        Some(root) => {
            let (catalog, report) = NodeCatalog::with_custom_root(root);
            for issue in &report.issues {
                warn!(dir = %issue.dir.display(), "{}", issue.message);
            }
            catalog
        }
        None => NodeCatalog::new(),
    }
}

/// `edgeql run` implementation.
pub async fn run_run_command(args: &RunArgs, config: &EngineConfig) -> CliExitCode {
    let source = match std::fs::read_to_string(&args.file) {
        Ok(source) => source,
        Err(err) => {
            eprintln!("cannot read {}: {err}", args.file.display());
            return CliExitCode::IoError;
        }
    };

    let mut config = config.clone();
    if let Some(datasets) = &args.datasets {
        config.datasets_dir = datasets.clone();
    }
    if let Some(nodes) = &args.nodes {
        config.custom_nodes_dir = Some(nodes.clone());
    }
    if let Some(workers) = args.workers {
        config.workers = workers;
    }

    let catalog = Arc::new(build_catalog(&config, None));
    let datasets = Arc::new(FsDatasetProvider::new(config.datasets_dir.clone()));

    let mut registry = RunnerRegistry::new();
    registry.register(Arc::new(BuiltinRunner::new()));

    // The sandbox needs a container driver; without one, custom nodes fail
    // with an infrastructure error while builtin pipelines keep working.
    let reaper_cancel = CancellationToken::new();
    let mut reaper_handle = None;
    match SandboxRunner::new(config.sandbox_runner_config()) {
        Ok(sandbox) => {
            let sandbox = Arc::new(sandbox);
            let reaper = Reaper::new(
                sandbox.driver().clone(),
                config.scratch_dir.clone(),
                config.reaper_config(),
            );
            reaper_handle = Some(reaper.spawn(reaper_cancel.clone()));
            registry.register(Arc::new(SandboxNodeRunner::new(
                sandbox,
                catalog.clone(),
                config.resource_limits(),
            )));
        }
        Err(err) => warn!(%err, "sandbox unavailable, custom nodes will not run"),
    }

    let executor = Executor::new(
        catalog,
        Arc::new(registry),
        datasets,
        config.executor_config(),
    )
    .with_storage(Arc::new(MemoryStorage::new()));

    let exit = match executor.execute(&args.pipeline_id, &source).await {
        Ok(run) => {
            print_run(&run, args.json);
            if run.status == RunStatus::Completed {
                CliExitCode::Success
            } else {
                CliExitCode::ValidationFailed
            }
        }
        Err(Error::Validation(report)) => {
            print_report(&report, args.json);
            CliExitCode::ValidationFailed
        }
        Err(err) => {
            eprintln!("run failed: {err}");
            CliExitCode::IoError
        }
    };

    reaper_cancel.cancel();
    if let Some(handle) = reaper_handle {
        let _ = handle.await;
    }
    exit
}

fn print_run(run: &Run, json: bool) {
    if json {
        match serde_json::to_string_pretty(run) {
            Ok(body) => println!("{body}"),
            Err(err) => eprintln!("cannot serialize run: {err}"),
        }
        return;
    }
    println!("run {} finished: {}", run.run_id, run.status);
    for (node_id, result) in &run.node_results {
        let outcome = if result.success {
            "ok".to_string()
        } else {
            result
                .error
                .as_ref()
                .map(|e| e.to_string())
                .unwrap_or_else(|| "failed".to_string())
        };
        println!("  {node_id}: {outcome} ({}ms)", result.execution_time_ms);
    }
    if let Some(error) = &run.error {
        println!("error: {error}");
    }
    for (node_id, artifact) in &run.final_outputs {
        println!("final output '{node_id}': {}", artifact.kind());
    }
}

/// `edgeql nodes` implementation.
pub fn run_nodes_command(args: &NodesArgs, config: &EngineConfig) -> CliExitCode {
    let catalog = build_catalog(config, args.nodes.as_ref());
    for name in catalog.known_type_names() {
        match catalog.lookup(&name) {
            Some(node_type) => println!("{name} ({})", node_type.runtime()),
            None => println!("{name}"),
        }
    }
    CliExitCode::Success
}
