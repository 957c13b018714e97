//! The task publisher — the control plane's write path into the
//! coordinator.
//!
//! Saving validates the cron expression and mirrors the task into
//! `tasks/<project>/<task>`; agents pick the change up through their
//! watches without any acknowledgement round trip. Kill and temp-run
//! events are short-lived lease-bound keys that evaporate on their own if
//! no agent is there to observe them.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use cron::Schedule;

use cronmesh_core::coordinator::{Coordinator, CoordinatorError};
use cronmesh_core::ids::IdGenerator;
use cronmesh_core::keyspace::{self, KeySpace};
use cronmesh_core::model::{ProjectId, TaskInfo, TaskKey};

/// TTL for one-shot temp-run keys.
pub const TEMP_TTL: Duration = Duration::from_secs(10);
/// TTL for kill markers.
pub const KILL_TTL: Duration = Duration::from_secs(5);

/// Publishing errors.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum PublishError {
    /// User input: the expression does not parse. Nothing is published.
    #[error("invalid cron expression '{expr}': {detail}")]
    InvalidCron { expr: String, detail: String },

    #[error("task {0} does not exist")]
    TaskNotFound(TaskKey),

    #[error(transparent)]
    Coordinator(#[from] CoordinatorError),
}

/// Control-plane handle for publishing tasks and one-shot events.
pub struct TaskPublisher {
    coordinator: Arc<dyn Coordinator>,
    keyspace: KeySpace,
    ids: Arc<IdGenerator>,
    temp_ttl: Duration,
    kill_ttl: Duration,
}

impl TaskPublisher {
    pub fn new(
        coordinator: Arc<dyn Coordinator>,
        keyspace: KeySpace,
        ids: Arc<IdGenerator>,
    ) -> Self {
        Self {
            coordinator,
            keyspace,
            ids,
            temp_ttl: TEMP_TTL,
            kill_ttl: KILL_TTL,
        }
    }

    /// Validate and publish a task definition. A blank `task_id` gets one
    /// assigned from the ID generator. Returns the saved task and the
    /// prior definition when this was an overwrite.
    pub async fn save_task(
        &self,
        mut task: TaskInfo,
    ) -> Result<(TaskInfo, Option<TaskInfo>), PublishError> {
        if let Err(e) = Schedule::from_str(&task.cron_expr) {
            return Err(PublishError::InvalidCron {
                expr: task.cron_expr,
                detail: e.to_string(),
            });
        }
        if task.task_id.is_empty() {
            task.task_id = self.ids.next_id().to_string();
        }
        let key = self.keyspace.task(&task.key());
        let prior = self
            .coordinator
            .put(&key, keyspace::encode(&task), None)
            .await?;
        let prior = prior.and_then(|kv| match keyspace::decode_task(&kv.key, &kv.value) {
            Ok(prior) => Some(prior),
            Err(e) => {
                tracing::warn!(key = %kv.key, error = %e, "prior task value was malformed");
                None
            }
        });
        tracing::info!(task = %task.key(), overwrite = prior.is_some(), "task published");
        Ok((task, prior))
    }

    /// Unpublish a task. The deletion tombstone reaches agents through
    /// their watches. Returns the removed definition, if any.
    pub async fn delete_task(&self, key: &TaskKey) -> Result<Option<TaskInfo>, PublishError> {
        let deleted = self.coordinator.delete(&self.keyspace.task(key)).await?;
        Ok(deleted.and_then(|kv| keyspace::decode_task(&kv.key, &kv.value).ok()))
    }

    pub async fn get_task(&self, key: &TaskKey) -> Result<Option<TaskInfo>, PublishError> {
        let kv = self.coordinator.get(&self.keyspace.task(key)).await?;
        Ok(kv.and_then(|kv| keyspace::decode_task(&kv.key, &kv.value).ok()))
    }

    pub async fn list_tasks(&self, project: ProjectId) -> Result<Vec<TaskInfo>, PublishError> {
        let (kvs, _) = self
            .coordinator
            .range(&self.keyspace.task_prefix(project))
            .await?;
        let mut tasks = Vec::with_capacity(kvs.len());
        for kv in kvs {
            match keyspace::decode_task(&kv.key, &kv.value) {
                Ok(task) => tasks.push(task),
                Err(e) => tracing::warn!(key = %kv.key, error = %e, "skipping malformed task"),
            }
        }
        Ok(tasks)
    }

    /// Request an immediate out-of-schedule run: the current task payload
    /// is placed under `temp/<project>/<task>` with a short lease, to be
    /// claimed by exactly one agent.
    pub async fn run_once(&self, key: &TaskKey) -> Result<(), PublishError> {
        let kv = self
            .coordinator
            .get(&self.keyspace.task(key))
            .await?
            .ok_or_else(|| PublishError::TaskNotFound(key.clone()))?;
        let lease = self.coordinator.grant(self.temp_ttl).await?;
        self.coordinator
            .put(&self.keyspace.temp(key), kv.value, Some(lease))
            .await?;
        tracing::info!(task = %key, "one-shot run requested");
        Ok(())
    }

    /// Best-effort rewrite of the task's transient `is_running` flag.
    /// Telemetry only; lock presence is the authoritative signal, so a
    /// missing task or malformed payload is silently a no-op.
    pub async fn set_running(&self, key: &TaskKey, running: bool) -> Result<(), PublishError> {
        let task_key = self.keyspace.task(key);
        let Some(kv) = self.coordinator.get(&task_key).await? else {
            return Ok(());
        };
        let Ok(mut task) = keyspace::decode_task(&kv.key, &kv.value) else {
            return Ok(());
        };
        if task.is_running != running {
            task.is_running = running;
            self.coordinator
                .put(&task_key, keyspace::encode(&task), None)
                .await?;
        }
        Ok(())
    }

    /// Signal cancellation of the task's in-flight run, wherever it is
    /// executing. The marker expires on its own.
    pub async fn kill_task(&self, key: &TaskKey) -> Result<(), PublishError> {
        let lease = self.coordinator.grant(self.kill_ttl).await?;
        let stamp = chrono::Utc::now().timestamp_millis().to_string();
        self.coordinator
            .put(&self.keyspace.killer(key), stamp.into_bytes(), Some(lease))
            .await?;
        tracing::info!(task = %key, "kill requested");
        Ok(())
    }
}
