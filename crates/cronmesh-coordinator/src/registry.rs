//! Agent registration, liveness, and worker-id bootstrap.
//!
//! An agent announces itself by holding one registration lease and putting
//! `agents/<project>/<ip>` under it for every project it serves. Lease
//! expiry *is* deregistration: peers discover live agents with a prefix
//! range and never need to reason about stale entries older than one TTL.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use cronmesh_core::coordinator::{Coordinator, CoordinatorResult, LeaseId};
use cronmesh_core::keyspace::{self, KeySpace};
use cronmesh_core::model::{AgentMeta, ProjectId};
use cronmesh_core::retry::RetryPolicy;
use cronmesh_core::warner::{Warner, WarningData};

/// Default registration lease TTL.
pub const REGISTRATION_TTL: Duration = Duration::from_secs(5);

/// Obtain this process's cluster index from the coordinator's atomic
/// counter. `index mod 1024` seeds the snowflake worker bits.
pub async fn bootstrap_worker_id(
    coordinator: &dyn Coordinator,
    keyspace: &KeySpace,
) -> CoordinatorResult<i64> {
    coordinator.increment(&keyspace.cluster_auto_index()).await
}

struct Inner {
    coordinator: Arc<dyn Coordinator>,
    keyspace: KeySpace,
    meta: AgentMeta,
    projects: Vec<ProjectId>,
    warner: Arc<dyn Warner>,
    ttl: Duration,
    lease: Mutex<Option<LeaseId>>,
    shutdown: CancellationToken,
}

impl Inner {
    /// Grant a fresh lease and (re)write every registration key under it.
    async fn establish(&self) -> CoordinatorResult<LeaseId> {
        let lease = self.coordinator.grant(self.ttl).await?;
        for project in &self.projects {
            let key = self.keyspace.agent(*project, &self.meta.ip);
            self.coordinator
                .put(&key, keyspace::encode(&self.meta), Some(lease))
                .await?;
        }
        *self.lease.lock() = Some(lease);
        Ok(lease)
    }
}

/// Registration handle for one agent process.
pub struct AgentRegistry {
    inner: Arc<Inner>,
    keepalive: Mutex<Option<JoinHandle<()>>>,
}

impl AgentRegistry {
    pub fn new(
        coordinator: Arc<dyn Coordinator>,
        keyspace: KeySpace,
        ip: impl Into<String>,
        projects: Vec<ProjectId>,
        warner: Arc<dyn Warner>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                coordinator,
                keyspace,
                meta: AgentMeta {
                    ip: ip.into(),
                    version: env!("CARGO_PKG_VERSION").to_string(),
                },
                projects,
                warner,
                ttl: REGISTRATION_TTL,
                lease: Mutex::new(None),
                shutdown: CancellationToken::new(),
            }),
            keepalive: Mutex::new(None),
        }
    }

    /// Override the lease TTL (tests use sub-second leases).
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        // Registry has not been shared yet, so the Arc is unique.
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.ttl = ttl;
        }
        self
    }

    /// Register and start the keepalive loop. Failure here is fatal to
    /// agent startup.
    pub async fn register(&self) -> CoordinatorResult<()> {
        self.inner.establish().await?;

        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            // Renew at roughly a third of the TTL, per the usual
            // chatter-vs-expiry tradeoff.
            let interval = inner.ttl.mul_f64(0.3).max(Duration::from_millis(50));
            let backoff = RetryPolicy::ExponentialBackoff {
                base_ms: 200,
                max_ms: 5_000,
                jitter: true,
            };
            loop {
                tokio::select! {
                    _ = inner.shutdown.cancelled() => return,
                    _ = tokio::time::sleep(interval) => {}
                }
                let lease = *inner.lease.lock();
                let renewed = match lease {
                    Some(lease) => inner.coordinator.keep_alive(lease).await,
                    None => Err(cronmesh_core::CoordinatorError::LeaseNotFound(0)),
                };
                if let Err(e) = renewed {
                    tracing::warn!(error = %e, "registration keepalive failed, re-registering");
                    let mut attempt = 0;
                    loop {
                        tokio::select! {
                            _ = inner.shutdown.cancelled() => return,
                            _ = tokio::time::sleep(backoff.delay_for(attempt)) => {}
                        }
                        match inner.establish().await {
                            Ok(_) => break,
                            Err(e) => {
                                attempt += 1;
                                tracing::warn!(error = %e, attempt, "re-registration failed");
                            }
                        }
                    }
                }
            }
        });
        *self.keepalive.lock() = Some(handle);
        Ok(())
    }

    /// Clean shutdown: stop the keepalive loop and revoke the lease,
    /// deleting every registration key immediately.
    pub async fn deregister(&self) {
        self.inner.shutdown.cancel();
        if let Some(handle) = self.keepalive.lock().take() {
            handle.abort();
        }
        let lease = self.inner.lease.lock().take();
        if let Some(lease) = lease {
            if let Err(e) = self.inner.coordinator.revoke(lease).await {
                tracing::debug!(error = %e, "registration revoke failed");
            }
        }
    }

    /// Discover the live agents serving `project`.
    pub async fn workers(&self, project: ProjectId) -> CoordinatorResult<Vec<AgentMeta>> {
        workers_as(
            &*self.inner.coordinator,
            &self.inner.keyspace,
            &*self.inner.warner,
            &self.inner.meta.ip,
            project,
        )
        .await
    }
}

/// Prefix-range discovery of live agents, usable without a registry handle
/// (the control plane calls this too).
pub async fn workers(
    coordinator: &dyn Coordinator,
    keyspace: &KeySpace,
    warner: &dyn Warner,
    project: ProjectId,
) -> CoordinatorResult<Vec<AgentMeta>> {
    workers_as(coordinator, keyspace, warner, "", project).await
}

async fn workers_as(
    coordinator: &dyn Coordinator,
    keyspace: &KeySpace,
    warner: &dyn Warner,
    agent_ip: &str,
    project: ProjectId,
) -> CoordinatorResult<Vec<AgentMeta>> {
    let (kvs, _) = coordinator.range(&keyspace.agents_prefix(project)).await?;
    let mut metas = Vec::with_capacity(kvs.len());
    for kv in kvs {
        match keyspace::decode::<AgentMeta>(&kv.key, &kv.value) {
            Ok(meta) => metas.push(meta),
            Err(e) => {
                tracing::warn!(key = %kv.key, error = %e, "skipping malformed agent entry");
                warner.warning(WarningData::system(
                    format!("malformed payload at {}: {e}", kv.key),
                    agent_ip.to_string(),
                ));
            }
        }
    }
    Ok(metas)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryCoordinator;
    use cronmesh_core::warner::LogWarner;

    struct RecordingWarner(parking_lot::Mutex<Vec<WarningData>>);

    impl RecordingWarner {
        fn new() -> Arc<Self> {
            Arc::new(Self(parking_lot::Mutex::new(Vec::new())))
        }
    }

    impl Warner for RecordingWarner {
        fn warning(&self, warning: WarningData) {
            self.0.lock().push(warning);
        }
    }

    #[tokio::test]
    async fn bootstrap_assigns_distinct_worker_ids() {
        let coordinator = MemoryCoordinator::new();
        let keyspace = KeySpace::new("/t");
        let a = bootstrap_worker_id(&*coordinator, &keyspace).await.unwrap();
        let b = bootstrap_worker_id(&*coordinator, &keyspace).await.unwrap();
        let c = bootstrap_worker_id(&*coordinator, &keyspace).await.unwrap();
        assert_eq!((a, b, c), (1, 2, 3));
    }

    #[tokio::test]
    async fn register_announces_every_project() {
        let coordinator = MemoryCoordinator::new();
        let keyspace = KeySpace::new("/t");
        let registry = AgentRegistry::new(
            coordinator.clone(),
            keyspace.clone(),
            "10.0.0.5",
            vec![1, 2],
            Arc::new(LogWarner),
        );
        registry.register().await.unwrap();

        let p1 = registry.workers(1).await.unwrap();
        let p2 = registry.workers(2).await.unwrap();
        assert_eq!(p1.len(), 1);
        assert_eq!(p1[0].ip, "10.0.0.5");
        assert_eq!(p2.len(), 1);

        registry.deregister().await;
        assert!(registry.workers(1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn keepalive_outlives_the_ttl() {
        let coordinator = MemoryCoordinator::new();
        let keyspace = KeySpace::new("/t");
        let registry = AgentRegistry::new(
            coordinator.clone(),
            keyspace.clone(),
            "10.0.0.5",
            vec![7],
            Arc::new(LogWarner),
        )
        .with_ttl(Duration::from_millis(300));
        registry.register().await.unwrap();

        tokio::time::sleep(Duration::from_millis(1_000)).await;
        assert_eq!(registry.workers(7).await.unwrap().len(), 1);
        registry.deregister().await;
    }

    #[tokio::test]
    async fn missing_keepalive_expires_the_registration() {
        let coordinator = MemoryCoordinator::new();
        let keyspace = KeySpace::new("/t");
        let registry = AgentRegistry::new(
            coordinator.clone(),
            keyspace.clone(),
            "10.0.0.5",
            vec![7],
            Arc::new(LogWarner),
        )
        .with_ttl(Duration::from_millis(200));
        // Establish without starting the keepalive loop: simulated crash.
        registry.inner.establish().await.unwrap();

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(registry.workers(7).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn malformed_agent_entries_are_skipped_and_alerted() {
        let coordinator = MemoryCoordinator::new();
        let keyspace = KeySpace::new("/t");
        let warner = RecordingWarner::new();
        coordinator
            .put(&keyspace.agent(1, "bad"), b"{corrupt".to_vec(), None)
            .await
            .unwrap();
        coordinator
            .put(
                &keyspace.agent(1, "good"),
                keyspace::encode(&AgentMeta {
                    ip: "good".into(),
                    version: String::new(),
                }),
                None,
            )
            .await
            .unwrap();
        let metas = workers(&*coordinator, &keyspace, &*warner, 1).await.unwrap();
        assert_eq!(metas.len(), 1);
        assert_eq!(metas[0].ip, "good");

        let warnings = warner.0.lock();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].data.contains("/t/agents/1/bad"));
    }
}
