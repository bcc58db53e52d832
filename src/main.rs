use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use skylive::commands::{Components, handle_run};
use skylive::config::Settings;

#[derive(Parser)]
#[command(name = "skylive", about = "Live flight tracking ingestion and fan-out")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the full stack: writers, GPS front-end, web/WS, sweeps.
    Run,
    /// Web and fan-out tier only (no writers, no TCP front-end).
    Web,
    /// GPS TCP front-end only.
    Gps,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let settings = Settings::from_env()?;

    let components = match cli.command {
        Command::Run => Components::all(),
        Command::Web => Components::web_only(),
        Command::Gps => Components::gps_only(),
    };

    handle_run(settings, components).await
}
