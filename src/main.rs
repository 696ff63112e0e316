//! Gateway process entry point (spec.md §6, §10.5).
//!
//! Loads config, registers every channel plugin, starts each enabled
//! account under the runtime supervisor, and runs the inbound pipeline
//! until interrupted. Considerably thinner than the teacher's `main.rs`:
//! no daemonize/fork, no IPC stop/status server, no auth subcommands --
//! the core's job stops at "run the gateway in the foreground".

use clap::Parser;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use gateway::account::AccountResolver;
use gateway::agent_process::ProcessAgentRunner;
use gateway::channels::{DiscordPlugin, GenericPlugin, SlackPlugin};
use gateway::commands::AllowAllEvaluator;
use gateway::config::Config;
use gateway::dispatch::AgentDispatcher;
use gateway::pipeline::InboundPipeline;
use gateway::registry::ChannelPluginRegistry;
use gateway::supervisor::AccountSupervisor;

#[derive(Parser)]
#[command(name = "gateway", version)]
#[command(about = "Channel inbound pipeline and reply dispatcher")]
struct Cli {
    /// Path to config file (defaults to the platform data dir).
    #[arg(short, long)]
    config: Option<std::path::PathBuf>,

    /// Enable debug logging.
    #[arg(short, long)]
    debug: bool,
}

fn main() -> std::process::ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    let config = match load_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(error) => {
            error!(%error, "failed to load configuration");
            return std::process::ExitCode::from(1);
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            error!(%error, "failed to build tokio runtime");
            return std::process::ExitCode::from(1);
        }
    };

    match runtime.block_on(run(config)) {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(error) => {
            error!(%error, "gateway exited with a fatal transport error");
            std::process::ExitCode::from(2)
        }
    }
}

fn load_config(path: Option<&std::path::Path>) -> anyhow::Result<Arc<Config>> {
    let config = match path {
        Some(path) => Config::load_from_path(path)?,
        None => Config::load()?,
    };
    Ok(Arc::new(config))
}

/// Structured logging via `tracing` + `tracing-subscriber` (env-filter),
/// mirroring the teacher's `daemon.rs::init_foreground_tracing` minus the
/// OTLP layer this core has no use for.
fn init_tracing(debug: bool) {
    let filter = if debug {
        tracing_subscriber::EnvFilter::new("debug")
    } else {
        tracing_subscriber::EnvFilter::try_from_env("GATEWAY_LOG")
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).compact().init();
}

async fn run(config: Arc<Config>) -> anyhow::Result<()> {
    info!("starting gateway");

    let _watcher = config.watch().ok();

    let mut registry = ChannelPluginRegistry::new();
    registry.register(Arc::new(DiscordPlugin::new()));
    registry.register(Arc::new(SlackPlugin::new()));
    registry.register(Arc::new(GenericPlugin::new("mezon", "Mezon")));
    registry.register(Arc::new(GenericPlugin::new("signal", "Signal")));
    registry.register(Arc::new(GenericPlugin::new("sms", "SMS")));
    let registry = Arc::new(registry);

    let agent_process = config.agent_process();
    let runner = ProcessAgentRunner::new(agent_process, config.data_dir());
    let dispatcher = Arc::new(AgentDispatcher::new(runner));

    let evaluator = Arc::new(AllowAllEvaluator);
    let pipeline = Arc::new(InboundPipeline::new(
        Arc::clone(&config),
        Arc::clone(&registry),
        dispatcher,
        evaluator,
    ));

    let (inbound_tx, inbound_rx) = mpsc::channel(256);
    let supervisor = Arc::new(AccountSupervisor::new());

    for channel_id in registry.ids() {
        let Some(base) = config.channel(channel_id) else {
            continue;
        };
        if !base.enabled {
            continue;
        }
        let plugin = registry.get(channel_id)?;
        let resolver = AccountResolver::new(channel_id);

        for account_id in resolver.list_account_ids(&base) {
            let resolved = match resolver.resolve_account(&base, &account_id) {
                Ok(resolved) => resolved,
                Err(error) => {
                    warn!(%error, channel = channel_id, %account_id, "skipping account with invalid configuration");
                    continue;
                }
            };
            if !resolved.account.enabled {
                continue;
            }
            supervisor
                .start(Arc::clone(&plugin), account_id, resolved, inbound_tx.clone())
                .await;
        }
    }

    drop(inbound_tx);
    pipeline.run(inbound_rx).await;

    info!("gateway shut down");
    Ok(())
}
