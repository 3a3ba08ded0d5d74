//! tasklet-freeze: compile bootstrap source into an embeddable byte array
//!
//! Usage: `tasklet-freeze <input-path> <output-path>`

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use tasklet_freeze::freeze;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "tasklet-freeze")]
#[command(about = "Freeze bootstrap source into a Rust byte array", long_about = None)]
#[command(version)]
struct Cli {
    /// Bootstrap source file
    input: PathBuf,
    /// Generated Rust file
    output: PathBuf,
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn run(cli: &Cli) -> anyhow::Result<()> {
    let report = freeze(&cli.input, &cli.output)
        .with_context(|| format!("cannot freeze '{}'", cli.input.display()))?;
    info!(
        symbol = report.kind.symbol(),
        size = report.size,
        output = %cli.output.display(),
        "artifact written"
    );
    Ok(())
}

fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("tasklet-freeze: {err:#}");
            ExitCode::FAILURE
        }
    }
}
