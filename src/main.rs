//! uxtest - scenario-driven UX testing for VS Code
//!
//! Runs YAML scenarios against isolated editor instances, captures evidence
//! and judges each run against its expected outcome.

use clap::Parser;
use colored::Colorize;
use uxtest::commands::Commands;
use uxtest::common::logging;
use uxtest::cli;

#[derive(Parser)]
#[command(name = "uxtest", about = "Scenario-driven UX tests for VS Code")]
#[command(version, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let (verbose, watch) = match &cli.command {
        Commands::Run(args) => (args.verbose, args.watch),
        Commands::List { .. } => (false, false),
    };
    let guard = if watch {
        let (log_file, guard) = logging::init_watch(verbose);
        if let Some(path) = log_file {
            eprintln!("Logging to {}", path.display());
        }
        guard
    } else {
        logging::init_cli(verbose);
        None
    };

    let code = match cli::dispatch(cli.command).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {e}", "Error:".red().bold());
            e.exit_code()
        }
    };

    // Flush the file log before exiting
    drop(guard);
    std::process::exit(code);
}
