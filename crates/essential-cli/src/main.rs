mod cli;
mod config;
mod id;
mod storage;

use crate::cli::ConfigCommand;
use clap::Parser;
use color_eyre::Result;
use essential_core::{installation::InstallationIdStore, storage::SecureStore};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Entry point wiring the CLI to the configured secure store.
#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    init_tracing();

    let cli = cli::Cli::parse();
    let config = config::load()?;
    match cli.command.unwrap_or_default() {
        cli::Command::Id { strict, json } => {
            id::print(&installation_ids(&config)?, strict, json).await?
        }
        cli::Command::Show => id::show(&installation_ids(&config)?).await?,
        cli::Command::Reset { yes } => id::reset(&installation_ids(&config)?, yes).await?,
        cli::Command::Version => print_version(),
        cli::Command::Health => run_health_check(&config).await?,
        cli::Command::Config(ConfigCommand::Init) => init_config(&config)?,
    }

    Ok(())
}

fn init_tracing() {
    // Respect user-provided filters; logs go to stderr so stdout stays the id.
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}

fn installation_ids(config: &config::Config) -> Result<InstallationIdStore<storage::AppStore>> {
    Ok(InstallationIdStore::new(storage::store_from_config(config)?))
}

fn print_version() {
    println!("essential {}", env!("CARGO_PKG_VERSION"));
}

/// Runs a quick health check of the configured secure store.
async fn run_health_check(config: &config::Config) -> Result<()> {
    let store = storage::store_from_config(config)?;
    run_store_health(&store).await?;
    println!("Storage ({:?}): ok", config.backend);
    Ok(())
}

async fn run_store_health<S: SecureStore>(store: &S) -> Result<()> {
    let probe_key = "health/probe";
    let payload = b"ok";
    store
        .put(probe_key, payload)
        .await
        .map_err(|e| color_eyre::eyre::eyre!(e.to_string()))?;
    let round_trip = store
        .get(probe_key)
        .await
        .map_err(|e| color_eyre::eyre::eyre!(e.to_string()))?;
    store
        .delete(probe_key)
        .await
        .map_err(|e| color_eyre::eyre::eyre!(e.to_string()))?;

    if round_trip != payload {
        color_eyre::eyre::bail!("storage round-trip failed");
    }
    Ok(())
}

fn init_config(config: &config::Config) -> Result<()> {
    let path = config::write_default_if_missing(config)?;
    println!("Config initialized at {}", path.display());
    Ok(())
}
