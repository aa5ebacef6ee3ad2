use clap::{Parser, Subcommand};

/// CLI surface definition.
#[derive(Parser, Debug)]
#[command(
    name = "essential",
    about = "Stable per-installation identifier kept in a secure store",
    version,
    propagate_version = true
)]
pub struct Cli {
    /// Optional subcommand; defaults to printing the installation id when absent.
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Print the installation id, creating it on first use.
    Id {
        /// Fail instead of printing an id that could not be persisted.
        #[arg(long)]
        strict: bool,
        /// Emit the id and its source as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Print the stored installation id without creating one.
    Show,
    /// Remove the stored installation id; the next `id` creates a new one.
    Reset {
        /// Confirm the wipe.
        #[arg(long)]
        yes: bool,
    },
    /// Print version and exit.
    Version,
    /// Run a put/get/delete probe against the configured secure store.
    Health,
    /// Manage CLI configuration.
    #[command(subcommand)]
    Config(ConfigCommand),
}

impl Default for Command {
    fn default() -> Self {
        Self::Id {
            strict: false,
            json: false,
        }
    }
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum ConfigCommand {
    /// Create a default config file if one does not exist.
    Init,
}
