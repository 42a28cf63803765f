//! # bunker
//!
//! Runs one command inside a chroot jail with fresh mount, PID, network,
//! and UTS namespaces, a populated `/dev`, and an unprivileged identity.
//! Exits with the command's exit code.

mod cli;
mod launch;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::cli::Cli;

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let code = launch::execute(&cli)?;
    std::process::exit(code)
}

/// Logs go to stderr so the contained command owns stdout.
fn init_tracing(verbose: u8) {
    let default_level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}
