//! Quorum simulator
//!
//! Runs the authorization checks and a multi-producer PBFT network in one process.
//!
//! Usage:
//!   quorum-sim pbft --producers 4 --blocks 20 --offline 1
//!   quorum-sim auth

use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

mod auth;
mod pbft;

/// Quorum simulator
#[derive(Debug, Parser)]
#[command(name = "quorum-sim")]
#[command(about = "In-process quorum authorization and PBFT simulations")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Drive a network of PBFT producers over a shared in-memory chain
    Pbft(pbft::PbftArgs),
    /// Run the end-to-end authorization scenarios
    Auth(auth::AuthArgs),
}

fn main() -> eyre::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match Cli::parse().command {
        Command::Pbft(args) => args.run(),
        Command::Auth(args) => args.run(),
    }
}
