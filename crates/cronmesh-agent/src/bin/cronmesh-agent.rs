//! cronmesh agent — entry point.
//!
//! Loads the config file, connects to the coordinator, registers, and
//! schedules until interrupted. Exit codes: 0 on clean shutdown, 1 on any
//! fatal initialization failure (unreadable config, unreachable
//! coordinator, registration failure).

use std::sync::Arc;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use cronmesh_agent::{AgentRuntime, HttpReporter};
use cronmesh_core::config::{self, AgentSettings, CoordinatorBackend};
use cronmesh_core::coordinator::Coordinator;
use cronmesh_core::warner::LogWarner;
use cronmesh_coordinator::MemoryCoordinator;

#[derive(Parser)]
#[command(name = "cronmesh-agent", about = "cronmesh worker agent", version)]
struct Cli {
    /// Path to the agent configuration file (toml/yaml/json).
    #[arg(short, long, default_value = "agent.toml")]
    config: String,
}

fn fatal(message: impl std::fmt::Display) -> ! {
    eprintln!("cronmesh-agent: {message}");
    std::process::exit(1);
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let settings: AgentSettings = match config::load_config(&cli.config) {
        Ok(settings) => settings,
        Err(e) => fatal(format_args!("failed to load {}: {e}", cli.config)),
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_new(&settings.log_level).unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let coordinator: Arc<dyn Coordinator> = match settings.coordinator.backend {
        CoordinatorBackend::Memory => {
            tracing::warn!(
                "memory coordinator backend selected — single-process only, \
                 other agents will not see this store"
            );
            MemoryCoordinator::new()
        }
        CoordinatorBackend::Etcd => {
            #[cfg(feature = "etcd")]
            {
                match cronmesh_coordinator::EtcdCoordinator::connect(
                    &settings.coordinator.endpoints,
                )
                .await
                {
                    Ok(coordinator) => Arc::new(coordinator),
                    Err(e) => fatal(format_args!("coordinator unreachable: {e}")),
                }
            }
            #[cfg(not(feature = "etcd"))]
            {
                fatal("this build has no etcd support (enable the `etcd` cargo feature)")
            }
        }
    };

    let Some(report_addr) = settings.report_addr.as_deref() else {
        fatal("report_addr is required: agents deliver results to the control-plane collector")
    };
    let reporter = Arc::new(HttpReporter::new(report_addr));
    let warner = Arc::new(LogWarner);

    let runtime = match AgentRuntime::start(&settings, coordinator, reporter, warner).await {
        Ok(runtime) => runtime,
        Err(e) => fatal(e),
    };

    info!("agent running, press ctrl-c to stop");
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "signal listener failed");
    }
    runtime.shutdown().await;
}
