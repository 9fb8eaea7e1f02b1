//! Command-line surface: a `clap::Parser` `Cli` with subcommands, one
//! file per subcommand. `serve` (the default, handled directly in
//! `main`) boots the kernel; every other subcommand opens the same
//! persisted state, acts once, and exits.

pub mod config;
pub mod queue;

use clap::{Parser, Subcommand};

use tenex_domain::config::Config;

/// Multi-agent orchestration execution kernel.
#[derive(Debug, Parser)]
#[command(name = "tenex", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Start the kernel and begin draining the bus (default).
    Serve,
    /// Execution-queue administration.
    #[command(subcommand)]
    Queue(QueueCommand),
    /// Configuration utilities.
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Print version information.
    Version,
}

#[derive(Debug, Subcommand)]
pub enum QueueCommand {
    /// Show every tracked project's current holder and queue depth.
    Status,
    /// Forcibly clear a project's Execute lock and promote the next
    /// waiter, regardless of who currently holds it.
    ForceRelease {
        project_id: String,
        /// Recorded alongside the released lock's `LockReleased` trace event.
        reason: String,
    },
    /// Drop one conversation from a project's wait queue without
    /// granting it the lock.
    Remove {
        project_id: String,
        conversation_id: String,
    },
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Parse the config file and report any validation issues.
    Validate,
    /// Dump the resolved configuration (defaults included) as TOML.
    Show,
}

/// Load the configuration from the path named by `TENEX_CONFIG` (or
/// `config.toml` by default), falling back to defaults if the file is
/// absent. Shared by `serve` and every admin subcommand.
pub fn load_config() -> anyhow::Result<(Config, String)> {
    let config_path = std::env::var("TENEX_CONFIG").unwrap_or_else(|_| "config.toml".into());
    let config = Config::load_or_default(std::path::Path::new(&config_path))?;
    Ok((config, config_path))
}
