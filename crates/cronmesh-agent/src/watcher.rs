//! Watch-driven plan synchronization for one project.
//!
//! On each cycle the watcher range-reads `tasks/<project>/` into a
//! [`SchedulerEvent::Snapshot`], records the store revision, and opens
//! three watches (`tasks/`, `killer/`, `temp/`) from the next revision.
//! Deltas stream to the scheduler in revision order. Transport loss
//! reconnects with exponential backoff, resuming from the last observed
//! revision; a compacted resume point falls back to a fresh snapshot so
//! the plan converges regardless of how much history was lost.
//!
//! Temp keys are claimed by deletion: the first agent whose delete
//! returns the prior value dispatches the one-shot run, so a temp event
//! observed by many agents (or replayed after a reconnect) still produces
//! at most one dispatch.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use cronmesh_core::coordinator::{Coordinator, CoordinatorError, EventKind, WatchEvent};
use cronmesh_core::keyspace::{self, KeySpace};
use cronmesh_core::model::ProjectId;
use cronmesh_core::retry::RetryPolicy;
use cronmesh_core::warner::{Warner, WarningData};
use tokio::sync::mpsc;

use crate::scheduler::SchedulerEvent;

/// Why a watch cycle ended.
enum CycleEnd {
    /// Scheduler gone or shutdown requested.
    Stop,
    /// Transport lost; reconnect from the saved revision after backoff.
    Lost,
    /// Saved revision compacted; take a fresh snapshot immediately.
    Compacted,
}

/// Watcher for one `(agent, project)` pair.
#[derive(Clone)]
pub struct TaskWatcher {
    coordinator: Arc<dyn Coordinator>,
    keyspace: KeySpace,
    project: ProjectId,
    events: mpsc::Sender<SchedulerEvent>,
    warner: Arc<dyn Warner>,
    agent_ip: String,
}

impl TaskWatcher {
    pub fn new(
        coordinator: Arc<dyn Coordinator>,
        keyspace: KeySpace,
        project: ProjectId,
        events: mpsc::Sender<SchedulerEvent>,
        warner: Arc<dyn Warner>,
        agent_ip: impl Into<String>,
    ) -> Self {
        Self {
            coordinator,
            keyspace,
            project,
            events,
            warner,
            agent_ip: agent_ip.into(),
        }
    }

    /// Run until shutdown. Reconnection is handled here; only panics
    /// escape to the supervisor.
    pub async fn run(&self, shutdown: CancellationToken) {
        let backoff = RetryPolicy::ExponentialBackoff {
            base_ms: 500,
            max_ms: 10_000,
            jitter: true,
        };
        let mut failures: usize = 0;
        // Next revision to watch from; `None` forces a snapshot.
        let mut resume: Option<i64> = None;
        loop {
            if shutdown.is_cancelled() {
                return;
            }
            match self.cycle(&mut resume, &shutdown).await {
                CycleEnd::Stop => return,
                CycleEnd::Compacted => {
                    tracing::info!(
                        project = self.project,
                        "watch revision compacted, falling back to snapshot"
                    );
                    failures = 0;
                }
                CycleEnd::Lost => {
                    let delay = backoff.delay_for(failures);
                    failures += 1;
                    tracing::warn!(
                        project = self.project,
                        failures,
                        delay_ms = delay.as_millis() as u64,
                        "watch lost, reconnecting"
                    );
                    tokio::select! {
                        _ = shutdown.cancelled() => return,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    async fn cycle(&self, resume: &mut Option<i64>, shutdown: &CancellationToken) -> CycleEnd {
        let from = match *resume {
            Some(revision) => revision,
            None => match self.snapshot().await {
                Ok(Some(next)) => {
                    *resume = Some(next);
                    next
                }
                Ok(None) => return CycleEnd::Stop,
                Err(_) => return CycleEnd::Lost,
            },
        };

        let task_prefix = self.keyspace.task_prefix(self.project);
        let killer_prefix = self.keyspace.killer_prefix(self.project);
        let temp_prefix = self.keyspace.temp_prefix(self.project);

        let mut tasks = match self.coordinator.watch(&task_prefix, from).await {
            Ok(stream) => stream,
            Err(e) => return self.watch_failure(resume, e),
        };
        let mut kills = match self.coordinator.watch(&killer_prefix, from).await {
            Ok(stream) => stream,
            Err(e) => return self.watch_failure(resume, e),
        };
        let mut temps = match self.coordinator.watch(&temp_prefix, from).await {
            Ok(stream) => stream,
            Err(e) => return self.watch_failure(resume, e),
        };

        loop {
            let received = tokio::select! {
                _ = shutdown.cancelled() => return CycleEnd::Stop,
                event = tasks.recv() => (Stream::Tasks, event),
                event = kills.recv() => (Stream::Kills, event),
                event = temps.recv() => (Stream::Temps, event),
            };
            match received {
                (_, None) => return CycleEnd::Lost,
                (_, Some(Err(CoordinatorError::Compacted { .. }))) => {
                    *resume = None;
                    return CycleEnd::Compacted;
                }
                (_, Some(Err(_))) => return CycleEnd::Lost,
                (stream, Some(Ok(event))) => {
                    advance(resume, event.revision);
                    let delivered = match stream {
                        Stream::Tasks => self.on_task_event(event).await,
                        Stream::Kills => self.on_kill_event(event).await,
                        Stream::Temps => self.on_temp_event(event).await,
                    };
                    if !delivered {
                        return CycleEnd::Stop;
                    }
                }
            }
        }
    }

    /// Full range read, delivered as one snapshot event. Returns the
    /// revision to watch from, or `None` when the scheduler is gone.
    async fn snapshot(&self) -> Result<Option<i64>, CoordinatorError> {
        let prefix = self.keyspace.task_prefix(self.project);
        let (kvs, revision) = self.coordinator.range(&prefix).await?;
        let mut tasks = Vec::with_capacity(kvs.len());
        for kv in kvs {
            match keyspace::decode_task(&kv.key, &kv.value) {
                Ok(task) => tasks.push(task),
                Err(e) => self.report_malformed(&kv.key, &e),
            }
        }
        tracing::info!(
            project = self.project,
            tasks = tasks.len(),
            revision,
            "task snapshot loaded"
        );
        let sent = self
            .events
            .send(SchedulerEvent::Snapshot {
                project: self.project,
                tasks,
            })
            .await;
        Ok(sent.is_ok().then_some(revision + 1))
    }

    fn watch_failure(&self, resume: &mut Option<i64>, error: CoordinatorError) -> CycleEnd {
        if matches!(error, CoordinatorError::Compacted { .. }) {
            *resume = None;
            CycleEnd::Compacted
        } else {
            CycleEnd::Lost
        }
    }

    /// Returns `false` when the scheduler channel is closed.
    async fn on_task_event(&self, event: WatchEvent) -> bool {
        let Some(key) = self.keyspace.parse_task_key(&event.key) else {
            tracing::warn!(key = %event.key, "unparsable task key, skipping");
            return true;
        };
        let scheduler_event = match event.kind {
            EventKind::Put => match keyspace::decode_task(&event.key, &event.value) {
                Ok(task) => SchedulerEvent::Upsert { task },
                Err(e) => {
                    self.report_malformed(&event.key, &e);
                    return true;
                }
            },
            EventKind::Delete => SchedulerEvent::Remove { key },
        };
        self.events.send(scheduler_event).await.is_ok()
    }

    async fn on_kill_event(&self, event: WatchEvent) -> bool {
        // Only the PUT matters; the DELETE is just the marker's TTL expiry.
        if event.kind != EventKind::Put {
            return true;
        }
        let Some(key) = self.keyspace.parse_task_key(&event.key) else {
            return true;
        };
        self.events.send(SchedulerEvent::Kill { key }).await.is_ok()
    }

    async fn on_temp_event(&self, event: WatchEvent) -> bool {
        if event.kind != EventKind::Put {
            return true;
        }
        let task = match keyspace::decode_task(&event.key, &event.value) {
            Ok(task) => task,
            Err(e) => {
                self.report_malformed(&event.key, &e);
                return true;
            }
        };
        // Claim by deletion; losing the claim means another agent (or an
        // earlier incarnation of this watch) already dispatched it.
        match self.coordinator.delete(&event.key).await {
            Ok(Some(_)) => self
                .events
                .send(SchedulerEvent::RunOnce { task })
                .await
                .is_ok(),
            Ok(None) => true,
            Err(e) => {
                tracing::warn!(key = %event.key, error = %e, "temp-run claim failed");
                true
            }
        }
    }

    fn report_malformed(&self, key: &str, error: &cronmesh_core::CodecError) {
        tracing::warn!(key, error = %error, "skipping malformed payload");
        self.warner.warning(WarningData::system(
            format!("malformed payload at {key}: {error}"),
            self.agent_ip.clone(),
        ));
    }
}

#[derive(Clone, Copy)]
enum Stream {
    Tasks,
    Kills,
    Temps,
}

fn advance(resume: &mut Option<i64>, revision: i64) {
    let next = revision + 1;
    if resume.is_none_or(|r| next > r) {
        *resume = Some(next);
    }
}
