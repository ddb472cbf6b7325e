//! EdgeQL CLI
//!
//! Binary entry point; all command logic lives in the library crate.

use anyhow::Result;
use clap::Parser;

use edgeql_cli::{
    init_tracing, load_engine_config, run_compile_command, run_nodes_command, run_run_command,
    Args, CliExitCode, Command,
};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    let config = match load_engine_config(&args) {
        Ok(config) => config,
        Err(message) => {
            eprintln!("cannot load config: {message}");
            std::process::exit(CliExitCode::IoError.code());
        }
    };

    let exit = match &args.command {
        Command::Compile(compile_args) => run_compile_command(compile_args, &config),
        Command::Run(run_args) => run_run_command(run_args, &config).await,
        Command::Nodes(nodes_args) => run_nodes_command(nodes_args, &config),
    };

    if exit != CliExitCode::Success {
        std::process::exit(exit.code());
    }
    Ok(())
}
