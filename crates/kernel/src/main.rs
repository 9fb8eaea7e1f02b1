//! `tenex` — the kernel binary. `serve` boots every subsystem and
//! drains the bus forever; `cli`'s other subcommands are one-shot
//! administrative tools that open the same persisted state and exit.
//!
//! `init_tracing` is wired only on the serve path — one-shot commands
//! print straight to the operator's terminal instead.

mod bootstrap;
mod capabilities;
mod cli;
mod engine;
mod roster;
mod scheduler;
mod state;

use clap::Parser;
use futures_util::StreamExt;
use tracing_subscriber::EnvFilter;

use tenex_domain::capability::BusFilter;
use tenex_domain::config::Config;
use tenex_runtime::{EventIngress, IngressOutcome};

use cli::{Cli, Command, ConfigCommand};
use scheduler::Scheduler;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let parsed = Cli::parse();

    match parsed.command {
        None | Some(Command::Serve) => {
            init_tracing();
            let (config, config_path) = cli::load_config()?;
            serve(config, config_path).await
        }
        Some(Command::Queue(cmd)) => cli::queue::run(cmd).await,
        Some(Command::Config(ConfigCommand::Validate)) => {
            let (config, config_path) = cli::load_config()?;
            cli::config::validate(&config, &config_path)
        }
        Some(Command::Config(ConfigCommand::Show)) => {
            let (config, _config_path) = cli::load_config()?;
            cli::config::show(&config)
        }
        Some(Command::Version) => {
            println!("tenex {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

/// Structured JSON tracing, enabled only for `serve` — one-shot admin
/// commands talk to the operator's terminal directly instead.
fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,tenex_kernel=debug")),
        )
        .json()
        .init();
}

/// Boot every subsystem, then forward bus events through
/// `EventIngress` into the scheduler for the rest of the process's
/// life. Recovery (inside `build_app_state`) has already released
/// expired locks and reset in-flight execution flags by the time this
/// loop starts; it does not replay or re-wake anything on its own —
/// only a genuinely new event reaching `ingress.ingest` schedules a
/// conversation.
async fn serve(config: Config, config_path: String) -> anyhow::Result<()> {
    tracing::info!("tenex kernel starting");
    let state = bootstrap::build_app_state(config, config_path).await?;
    let scheduler = Scheduler::new(state.clone());

    let ingress = EventIngress::new(
        state.store.clone(),
        state.config.project.id.clone(),
        state.roster.local_agent_keys(),
    );

    let mut events = state
        .bus
        .subscribe(BusFilter::default())
        .await
        .map_err(|e| anyhow::anyhow!("bus subscribe failed: {e}"))?;
    tracing::info!("subscribed to bus, awaiting events");

    while let Some(event) = events.next().await {
        match ingress.ingest(event) {
            IngressOutcome::Appended { conversation_id, .. } => scheduler.notify(&conversation_id),
            IngressOutcome::Dropped { .. } => {}
        }
    }

    tracing::warn!("bus stream closed, kernel shutting down");
    Ok(())
}
