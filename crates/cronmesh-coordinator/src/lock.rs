//! Lease-bound single-flight lock per `(project, task)`.
//!
//! Acquisition grants a short-TTL lease, then transactionally creates
//! `locks/<project>/<task>` iff the key is absent. The key lives and dies
//! with the lease: a crashed holder stops sending keepalives and the
//! coordinator deletes the key within one TTL, bounding stale-holder
//! recovery. Losing the creation race costs one lease grant/revoke round
//! trip and returns [`LockError::AlreadyLocked`].

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use cronmesh_core::coordinator::{Coordinator, CoordinatorError, LeaseId};
use cronmesh_core::keyspace::{self, KeySpace};
use cronmesh_core::model::{LockOwner, TaskKey};

/// Default lock lease TTL.
pub const LOCK_TTL: Duration = Duration::from_secs(5);

/// Errors from lock acquisition.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum LockError {
    /// Another agent holds the lock. The expected outcome of contention,
    /// not a failure.
    #[error("task {0} is locked by another agent")]
    AlreadyLocked(TaskKey),

    #[error(transparent)]
    Coordinator(#[from] CoordinatorError),
}

struct Held {
    lease: LeaseId,
    keepalive: JoinHandle<()>,
}

/// One acquisition attempt's handle for a task's distributed lock.
///
/// While held, a background task renews the lease at ~TTL/3.
/// [`release`](TaskLock::release) revokes the lease (which deletes the
/// key); dropping a held lock revokes best-effort so no exit path leaks a
/// holder for longer than one TTL.
pub struct TaskLock {
    coordinator: Arc<dyn Coordinator>,
    key: TaskKey,
    lock_key: String,
    agent_ip: String,
    ttl: Duration,
    held: Option<Held>,
}

impl TaskLock {
    pub fn new(
        coordinator: Arc<dyn Coordinator>,
        keyspace: &KeySpace,
        key: TaskKey,
        agent_ip: impl Into<String>,
    ) -> Self {
        let lock_key = keyspace.lock(&key);
        Self {
            coordinator,
            key,
            lock_key,
            agent_ip: agent_ip.into(),
            ttl: LOCK_TTL,
            held: None,
        }
    }

    /// Override the lease TTL (tests use sub-second leases).
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Attempt to take the lock. Returns immediately; there is no queueing.
    pub async fn acquire(&mut self) -> Result<(), LockError> {
        if self.held.is_some() {
            return Ok(());
        }
        let lease = self.coordinator.grant(self.ttl).await?;
        let owner = LockOwner {
            agent_ip: self.agent_ip.clone(),
            lease_id: lease,
            nonce: uuid::Uuid::new_v4().to_string(),
        };
        let created = match self
            .coordinator
            .put_if_absent(&self.lock_key, keyspace::encode(&owner), Some(lease))
            .await
        {
            Ok(created) => created,
            Err(e) => {
                let _ = self.coordinator.revoke(lease).await;
                return Err(e.into());
            }
        };
        if !created {
            let _ = self.coordinator.revoke(lease).await;
            return Err(LockError::AlreadyLocked(self.key.clone()));
        }

        let keepalive = {
            let coordinator = self.coordinator.clone();
            let interval = self.ttl / 3;
            let key = self.key.clone();
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(interval).await;
                    if let Err(e) = coordinator.keep_alive(lease).await {
                        // The lease is gone or the coordinator unreachable;
                        // the lock will fall to TTL expiry either way.
                        tracing::warn!(task = %key, error = %e, "lock keepalive failed");
                    }
                }
            })
        };
        self.held = Some(Held { lease, keepalive });
        Ok(())
    }

    /// Release the lock. Idempotent; safe to call when never acquired.
    pub async fn release(&mut self) {
        if let Some(held) = self.held.take() {
            held.keepalive.abort();
            if let Err(e) = self.coordinator.revoke(held.lease).await {
                tracing::debug!(task = %self.key, error = %e, "lock revoke failed");
            }
        }
    }

    /// Local view only; no network round trip.
    pub fn is_held(&self) -> bool {
        self.held.is_some()
    }
}

impl Drop for TaskLock {
    fn drop(&mut self) {
        if let Some(held) = self.held.take() {
            held.keepalive.abort();
            let coordinator = self.coordinator.clone();
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    let _ = coordinator.revoke(held.lease).await;
                });
            }
            // Without a runtime the lease simply expires after one TTL.
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryCoordinator;

    fn lock_for(
        coordinator: Arc<MemoryCoordinator>,
        keyspace: &KeySpace,
        ip: &str,
    ) -> TaskLock {
        TaskLock::new(coordinator, keyspace, TaskKey::new(1, "job"), ip)
    }

    #[tokio::test]
    async fn second_acquirer_is_rejected() {
        let coordinator = MemoryCoordinator::new();
        let keyspace = KeySpace::new("/t");
        let mut first = lock_for(coordinator.clone(), &keyspace, "10.0.0.1");
        let mut second = lock_for(coordinator.clone(), &keyspace, "10.0.0.2");

        first.acquire().await.unwrap();
        assert!(first.is_held());
        assert!(matches!(
            second.acquire().await,
            Err(LockError::AlreadyLocked(_))
        ));
        assert!(!second.is_held());

        first.release().await;
        second.acquire().await.unwrap();
        second.release().await;
    }

    #[tokio::test]
    async fn concurrent_acquires_have_one_winner() {
        let coordinator = MemoryCoordinator::new();
        let keyspace = KeySpace::new("/t");
        let mut handles = Vec::new();
        for i in 0..10 {
            let coordinator = coordinator.clone();
            let keyspace = keyspace.clone();
            handles.push(tokio::spawn(async move {
                let mut lock = TaskLock::new(
                    coordinator,
                    &keyspace,
                    TaskKey::new(1, "contended"),
                    format!("10.0.0.{i}"),
                );
                let won = lock.acquire().await.is_ok();
                (lock, won)
            }));
        }
        let mut winners = 0;
        let mut locks = Vec::new();
        for handle in handles {
            let (lock, won) = handle.await.unwrap();
            if won {
                winners += 1;
            }
            locks.push(lock);
        }
        assert_eq!(winners, 1);
        for mut lock in locks {
            lock.release().await;
        }
    }

    #[tokio::test]
    async fn release_is_idempotent_and_frees_the_key() {
        let coordinator = MemoryCoordinator::new();
        let keyspace = KeySpace::new("/t");
        let mut lock = lock_for(coordinator.clone(), &keyspace, "10.0.0.1");
        lock.acquire().await.unwrap();
        lock.release().await;
        lock.release().await;
        assert!(!lock.is_held());
        assert!(
            coordinator
                .get(&keyspace.lock(&TaskKey::new(1, "job")))
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn crashed_holder_expires_within_ttl() {
        let coordinator = MemoryCoordinator::new();
        let keyspace = KeySpace::new("/t");
        let mut holder = lock_for(coordinator.clone(), &keyspace, "10.0.0.1")
            .with_ttl(Duration::from_millis(200));
        holder.acquire().await.unwrap();
        // Simulate a crash: stop keepalive without revoking.
        holder.held.take().map(|h| h.keepalive.abort());

        tokio::time::sleep(Duration::from_millis(500)).await;
        let mut successor = lock_for(coordinator, &keyspace, "10.0.0.2");
        successor.acquire().await.unwrap();
        successor.release().await;
    }

    #[tokio::test]
    async fn keepalive_holds_a_short_lease() {
        let coordinator = MemoryCoordinator::new();
        let keyspace = KeySpace::new("/t");
        let mut lock = lock_for(coordinator.clone(), &keyspace, "10.0.0.1")
            .with_ttl(Duration::from_millis(300));
        lock.acquire().await.unwrap();
        tokio::time::sleep(Duration::from_millis(900)).await;
        // Still held: keepalive renewed the lease past several TTLs.
        let mut rival = lock_for(coordinator, &keyspace, "10.0.0.2");
        assert!(matches!(
            rival.acquire().await,
            Err(LockError::AlreadyLocked(_))
        ));
        lock.release().await;
    }

    #[tokio::test]
    async fn transport_failure_surfaces_as_coordinator_error() {
        let coordinator = MemoryCoordinator::new();
        let keyspace = KeySpace::new("/t");
        coordinator.set_offline(true);
        let mut lock = lock_for(coordinator, &keyspace, "10.0.0.1");
        assert!(matches!(
            lock.acquire().await,
            Err(LockError::Coordinator(CoordinatorError::Unavailable(_)))
        ));
    }
}
