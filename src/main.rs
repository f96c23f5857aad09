// Roundhouse CLI: run a conductor process.

use clap::{CommandFactory, Parser, Subcommand};
use color_eyre::eyre::Result;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod cmd;

#[derive(Parser)]
#[command(
    name = "roundhouse",
    version,
    about = "Bare metal fleet conductor",
    long_about = "Runs a roundhouse conductor: a worker process that owns a slice of the \
node fleet via a consistent hash ring and drives node lifecycle transitions \
through the resumable step engine."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run a conductor until interrupted
    Run(cmd::run::RunArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Some(Command::Run(args)) => cmd::run::run(args).await,
        None => {
            Cli::command().print_help()?;
            Ok(())
        }
    }
}
