//! cronmesh server — entry point.
//!
//! Exit codes: 0 on clean shutdown, 1 on fatal initialization failure
//! (unreadable config, unreachable coordinator, store connection failure).

use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use cronmesh_core::config::{self, CoordinatorBackend, ServerSettings};
use cronmesh_core::coordinator::Coordinator;
use cronmesh_core::ids::IdGenerator;
use cronmesh_core::keyspace::KeySpace;
use cronmesh_core::warner::LogWarner;
use cronmesh_coordinator::{MemoryCoordinator, bootstrap_worker_id};
use cronmesh_server::store::TaskLogStore;
use cronmesh_server::{AppState, MemoryStore, RetentionSweeper, TaskPublisher};

#[derive(Parser)]
#[command(name = "cronmesh-server", about = "cronmesh control plane", version)]
struct Cli {
    /// Path to the server configuration file (toml/yaml/json).
    #[arg(short, long, default_value = "server.toml")]
    config: String,
}

fn fatal(message: impl std::fmt::Display) -> ! {
    eprintln!("cronmesh-server: {message}");
    std::process::exit(1);
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let settings: ServerSettings = match config::load_config(&cli.config) {
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
                "memory coordinator backend selected — agents in other \
                 processes will not see published tasks"
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

    let logs: Arc<dyn TaskLogStore> = match &settings.mysql {
        Some(mysql) => {
            #[cfg(feature = "mysql")]
            {
                match cronmesh_server::MySqlStore::connect(&mysql.url, mysql.max_connections).await
                {
                    Ok(store) => {
                        if let Err(e) = store.migrate().await {
                            fatal(format_args!("store migration failed: {e}"));
                        }
                        Arc::new(store)
                    }
                    Err(e) => fatal(format_args!("store connection failed: {e}")),
                }
            }
            #[cfg(not(feature = "mysql"))]
            {
                let _ = mysql;
                fatal("this build has no MySQL support (enable the `mysql` cargo feature)")
            }
        }
        None => {
            tracing::warn!("no mysql configured — task logs are kept in memory only");
            Arc::new(MemoryStore::new())
        }
    };

    let keyspace = KeySpace::new(&settings.coordinator.prefix);
    let cluster_index = match bootstrap_worker_id(&*coordinator, &keyspace).await {
        Ok(index) => index,
        Err(e) => fatal(format_args!("worker id bootstrap failed: {e}")),
    };
    let ids = Arc::new(IdGenerator::from_cluster_index(cluster_index));

    let publisher = Arc::new(TaskPublisher::new(coordinator, keyspace, ids));
    let warner = Arc::new(LogWarner);
    let shutdown = CancellationToken::new();

    let sweeper = Arc::new(RetentionSweeper::new(
        logs.clone(),
        settings.retention_days,
        settings.sweep_interval_hours,
    ));
    let sweep_handle = sweeper.spawn(warner, shutdown.child_token());

    let state = AppState {
        publisher,
        logs,
    };
    let server = tokio::spawn({
        let shutdown = shutdown.clone();
        let bind_addr = settings.bind_addr.clone();
        async move { cronmesh_server::serve(&bind_addr, state, shutdown).await }
    });

    info!("control plane running, press ctrl-c to stop");
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "signal listener failed");
    }
    shutdown.cancel();
    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => fatal(format_args!("server error: {e}")),
        Err(e) => fatal(format_args!("server task failed: {e}")),
    }
    let _ = sweep_handle.await;
    info!("control plane stopped");
}
