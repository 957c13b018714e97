//! Agent bootstrap: worker-id assignment, registration, watcher and
//! scheduler wiring, clean shutdown.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use cronmesh_core::clock::SystemClock;
use cronmesh_core::config::AgentSettings;
use cronmesh_core::coordinator::{Coordinator, CoordinatorError};
use cronmesh_core::ids::IdGenerator;
use cronmesh_core::keyspace::KeySpace;
use cronmesh_core::report::ResultReport;
use cronmesh_core::retry::{RetryConfig, RetryPolicy};
use cronmesh_core::supervisor::supervise;
use cronmesh_core::warner::Warner;

use cronmesh_coordinator::{AgentRegistry, LOCK_TTL, bootstrap_worker_id};

use crate::executor::ExecutionContext;
use crate::scheduler::{SchedulerHandle, TaskScheduler};
use crate::watcher::TaskWatcher;

/// Agent startup failures. All of these are fatal: the process should
/// exit non-zero rather than limp along unregistered.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum AgentError {
    #[error("worker id bootstrap failed: {0}")]
    Bootstrap(CoordinatorError),

    #[error("initial range of project {project} failed: {source}")]
    InitialRange {
        project: i64,
        source: CoordinatorError,
    },

    #[error("agent registration failed: {0}")]
    Registration(CoordinatorError),
}

/// A fully wired, running agent.
pub struct AgentRuntime {
    registry: AgentRegistry,
    scheduler: SchedulerHandle,
    watchers: Vec<JoinHandle<()>>,
    shutdown: CancellationToken,
    ids: Arc<IdGenerator>,
    agent_ip: String,
}

impl std::fmt::Debug for AgentRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRuntime")
            .field("agent_ip", &self.agent_ip)
            .finish_non_exhaustive()
    }
}

impl AgentRuntime {
    /// Bootstrap and start the agent.
    ///
    /// Order matters: worker-id bootstrap and registration come first and
    /// fail fast; the initial reachability probe per project runs before
    /// any watcher so a dead coordinator is an init error, not a silent
    /// retry loop.
    pub async fn start(
        settings: &AgentSettings,
        coordinator: Arc<dyn Coordinator>,
        reporter: Arc<dyn ResultReport>,
        warner: Arc<dyn Warner>,
    ) -> Result<Self, AgentError> {
        let keyspace = KeySpace::new(&settings.coordinator.prefix);
        let agent_ip = settings
            .client_ip
            .clone()
            .unwrap_or_else(|| "127.0.0.1".to_string());

        let cluster_index = bootstrap_worker_id(&*coordinator, &keyspace)
            .await
            .map_err(AgentError::Bootstrap)?;
        let ids = Arc::new(IdGenerator::from_cluster_index(cluster_index));
        tracing::info!(
            cluster_index,
            worker_id = ids.worker_id(),
            ip = %agent_ip,
            "worker id bootstrapped"
        );

        for project in &settings.projects {
            coordinator
                .range(&keyspace.task_prefix(*project))
                .await
                .map_err(|source| AgentError::InitialRange {
                    project: *project,
                    source,
                })?;
        }

        let registry = AgentRegistry::new(
            coordinator.clone(),
            keyspace.clone(),
            agent_ip.clone(),
            settings.projects.clone(),
            warner.clone(),
        );
        registry
            .register()
            .await
            .map_err(AgentError::Registration)?;

        let ctx = Arc::new(ExecutionContext {
            coordinator: coordinator.clone(),
            keyspace: keyspace.clone(),
            reporter,
            warner: warner.clone(),
            clock: Arc::new(SystemClock),
            agent_ip: agent_ip.clone(),
            grace: Duration::from_secs(settings.grace_seconds),
            output_cap: settings.output_cap_bytes,
            report_retry: RetryConfig::exponential(3, 500, 5_000),
        });
        let scheduler = TaskScheduler::spawn(ctx, LOCK_TTL);

        let shutdown = CancellationToken::new();
        let mut watchers = Vec::with_capacity(settings.projects.len());
        for project in &settings.projects {
            let watcher = TaskWatcher::new(
                coordinator.clone(),
                keyspace.clone(),
                *project,
                scheduler.events(),
                warner.clone(),
                agent_ip.clone(),
            );
            let token = shutdown.child_token();
            watchers.push(supervise(
                format!("watcher-{project}"),
                warner.clone(),
                agent_ip.clone(),
                RetryPolicy::ExponentialBackoff {
                    base_ms: 500,
                    max_ms: 10_000,
                    jitter: true,
                },
                shutdown.child_token(),
                move || {
                    let watcher = watcher.clone();
                    let token = token.clone();
                    async move { watcher.run(token).await }
                },
            ));
        }

        tracing::info!(
            projects = ?settings.projects,
            "agent started"
        );
        Ok(Self {
            registry,
            scheduler,
            watchers,
            shutdown,
            ids,
            agent_ip,
        })
    }

    pub fn ids(&self) -> Arc<IdGenerator> {
        self.ids.clone()
    }

    pub fn agent_ip(&self) -> &str {
        &self.agent_ip
    }

    /// Clean shutdown: deregister first so peers stop routing to this
    /// agent, then stop watchers and the scheduler.
    pub async fn shutdown(self) {
        self.registry.deregister().await;
        self.shutdown.cancel();
        for watcher in self.watchers {
            let _ = watcher.await;
        }
        self.scheduler.shutdown().await;
        tracing::info!("agent stopped");
    }
}
