//! cfmanifest CLI for Cloud Foundry manifest reconciliation.

use clap::Parser;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "cfmanifest",
    version,
    about = "Format-preserving Cloud Foundry manifest reconciliation"
)]
struct Cli {
    #[command(subcommand)]
    command: cfmanifest::cli::Commands,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .without_time()
        .init();

    let cli = Cli::parse();
    if let Err(e) = cfmanifest::cli::dispatch(cli.command) {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}
