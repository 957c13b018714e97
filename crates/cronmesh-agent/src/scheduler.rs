//! The per-agent task scheduler.
//!
//! # Architecture
//!
//! A single driver task owns the plan — the map from `(project, task)` to
//! cron state, next fire time, and the in-flight run handle. Watchers feed
//! it [`SchedulerEvent`]s over a channel; executions report back over an
//! internal completion channel. Because only the driver mutates the plan,
//! plan updates apply strictly in the order the watcher delivered them and
//! no locking is needed around fire-time decisions.
//!
//! # Fire semantics
//!
//! On each tick every due entry with no run in flight attempts the
//! distributed lock: winning launches the executor, losing advances the
//! fire time silently (another agent ran the task), and a coordinator
//! transport error advances with a warning and no retry within the tick.
//! A due entry whose previous run is still in flight skips the fire
//! entirely; the next fire is computed from `now`, not from the missed
//! slot.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cron::Schedule;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use cronmesh_core::clock::Clock;
use cronmesh_core::model::{ProjectId, TaskInfo, TaskKey};
use cronmesh_core::warner::WarningData;

use cronmesh_coordinator::{LockError, TaskLock};

use crate::executor::{self, ExecutionContext};

/// Events accepted by the scheduler, in watcher delivery order.
#[derive(Debug)]
pub enum SchedulerEvent {
    /// Replace the plan for one project with the given task set (initial
    /// load and compaction recovery).
    Snapshot {
        project: ProjectId,
        tasks: Vec<TaskInfo>,
    },
    /// Install or replace one task. A replace never interrupts a run
    /// already in flight.
    Upsert { task: TaskInfo },
    /// Drop one task. An in-flight run completes normally but no longer
    /// reschedules.
    Remove { key: TaskKey },
    /// Cancel the in-flight run of one task, if any.
    Kill { key: TaskKey },
    /// Immediate one-shot execution, bypassing the cron plan (but not the
    /// distributed lock).
    RunOnce { task: TaskInfo },
}

/// Sent by the executor when a run finishes, whatever the outcome.
struct RunCompletion {
    key: TaskKey,
}

struct RunHandle {
    cancel: CancellationToken,
}

struct PlanEntry {
    task: TaskInfo,
    schedule: Schedule,
    /// `None` when the expression has no future match.
    next_fire_at: Option<DateTime<Utc>>,
    in_flight: Option<RunHandle>,
}

/// Where a launched run's handle lives.
enum Slot {
    Plan,
    Adhoc,
}

/// Running scheduler: an event sender plus the driver's join handle.
pub struct SchedulerHandle {
    events: mpsc::Sender<SchedulerEvent>,
    shutdown: CancellationToken,
    driver: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Channel on which watchers deliver events.
    pub fn events(&self) -> mpsc::Sender<SchedulerEvent> {
        self.events.clone()
    }

    /// Stop the driver. In-flight runs are cancelled.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        let _ = self.driver.await;
    }
}

/// The driver state. Constructed and consumed by [`TaskScheduler::spawn`].
pub struct TaskScheduler {
    ctx: Arc<ExecutionContext>,
    lock_ttl: Duration,
    plan: HashMap<TaskKey, PlanEntry>,
    /// Runs without a plan entry: temp runs of unknown tasks and runs
    /// orphaned by a Remove. Tracked so Kill and completion still resolve.
    adhoc: HashMap<TaskKey, RunHandle>,
    completions_tx: mpsc::Sender<RunCompletion>,
    completions_rx: mpsc::Receiver<RunCompletion>,
}

impl TaskScheduler {
    /// Spawn the driver task.
    pub fn spawn(ctx: Arc<ExecutionContext>, lock_ttl: Duration) -> SchedulerHandle {
        let (events_tx, events_rx) = mpsc::channel(256);
        let (completions_tx, completions_rx) = mpsc::channel(256);
        let shutdown = CancellationToken::new();
        let scheduler = Self {
            ctx,
            lock_ttl,
            plan: HashMap::new(),
            adhoc: HashMap::new(),
            completions_tx,
            completions_rx,
        };
        let driver = tokio::spawn(scheduler.run(events_rx, shutdown.clone()));
        SchedulerHandle {
            events: events_tx,
            shutdown,
            driver,
        }
    }

    async fn run(
        mut self,
        mut events: mpsc::Receiver<SchedulerEvent>,
        shutdown: CancellationToken,
    ) {
        loop {
            let sleep_for = self.until_next_fire();
            tokio::select! {
                _ = shutdown.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => break,
                },
                Some(done) = self.completions_rx.recv() => self.complete(done),
                _ = tokio::time::sleep(sleep_for) => self.tick().await,
            }
        }
        // Cancel whatever is still running so children do not outlive the
        // agent.
        for entry in self.plan.values() {
            if let Some(run) = &entry.in_flight {
                run.cancel.cancel();
            }
        }
        for run in self.adhoc.values() {
            run.cancel.cancel();
        }
    }

    /// Time until the earliest planned fire, clamped to the scheduler's
    /// one-second resolution so new work is noticed promptly either way.
    fn until_next_fire(&self) -> Duration {
        let now = self.ctx.clock.now_utc();
        let earliest = self.plan.values().filter_map(|e| e.next_fire_at).min();
        match earliest {
            Some(at) if at <= now => Duration::ZERO,
            Some(at) => (at - now)
                .to_std()
                .unwrap_or(Duration::ZERO)
                .min(Duration::from_secs(1)),
            None => Duration::from_secs(1),
        }
    }

    async fn handle_event(&mut self, event: SchedulerEvent) {
        match event {
            SchedulerEvent::Snapshot { project, tasks } => self.apply_snapshot(project, tasks),
            SchedulerEvent::Upsert { task } => self.upsert(task),
            SchedulerEvent::Remove { key } => self.remove(key),
            SchedulerEvent::Kill { key } => self.kill(&key),
            SchedulerEvent::RunOnce { task } => self.run_once(task).await,
        }
    }

    fn apply_snapshot(&mut self, project: ProjectId, tasks: Vec<TaskInfo>) {
        // Drop the project's entries, keeping in-flight handles so the
        // runs stay addressable.
        let stale: Vec<TaskKey> = self
            .plan
            .keys()
            .filter(|k| k.project_id == project)
            .cloned()
            .collect();
        let mut carried: HashMap<TaskKey, RunHandle> = HashMap::new();
        for key in stale {
            if let Some(entry) = self.plan.remove(&key) {
                if let Some(run) = entry.in_flight {
                    carried.insert(key, run);
                }
            }
        }
        for task in tasks {
            let key = task.key();
            self.upsert(task);
            if let Some(run) = carried.remove(&key) {
                if let Some(entry) = self.plan.get_mut(&key) {
                    entry.in_flight = Some(run);
                }
            }
        }
        // Runs whose task disappeared while we were resynchronizing finish
        // as ad-hoc runs.
        for (key, run) in carried {
            self.adhoc.insert(key, run);
        }
        tracing::debug!(project, entries = self.plan.len(), "plan resynchronized");
    }

    fn upsert(&mut self, task: TaskInfo) {
        let key = task.key();
        let schedule = match Schedule::from_str(&task.cron_expr) {
            Ok(schedule) => schedule,
            Err(e) => {
                // The publisher validates before publishing, so this is
                // data corruption rather than user error by the time it
                // reaches an agent.
                tracing::warn!(task = %key, error = %e, "invalid cron expression, entry not installed");
                self.ctx.warner.warning(WarningData::task(
                    format!("task {key} carries an unparsable cron expression: {e}"),
                    self.ctx.agent_ip.clone(),
                ));
                return;
            }
        };
        let next_fire_at = next_after(&schedule, self.ctx.clock.now_utc());
        match self.plan.entry(key) {
            std::collections::hash_map::Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                entry.task = task;
                entry.schedule = schedule;
                entry.next_fire_at = next_fire_at;
                // in_flight untouched: a replace never interrupts a run.
            }
            std::collections::hash_map::Entry::Vacant(vacant) => {
                vacant.insert(PlanEntry {
                    task,
                    schedule,
                    next_fire_at,
                    in_flight: None,
                });
            }
        }
    }

    fn remove(&mut self, key: TaskKey) {
        if let Some(entry) = self.plan.remove(&key) {
            tracing::debug!(task = %key, "task removed from plan");
            if let Some(run) = entry.in_flight {
                // Completes normally, never reschedules.
                self.adhoc.insert(key, run);
            }
        }
    }

    fn kill(&mut self, key: &TaskKey) {
        let mut found = false;
        if let Some(entry) = self.plan.get(key) {
            if let Some(run) = &entry.in_flight {
                run.cancel.cancel();
                found = true;
            }
        }
        if let Some(run) = self.adhoc.get(key) {
            run.cancel.cancel();
            found = true;
        }
        if found {
            tracing::info!(task = %key, "kill requested for in-flight run");
        }
    }

    async fn run_once(&mut self, task: TaskInfo) {
        let key = task.key();
        let occupied = self
            .plan
            .get(&key)
            .map(|e| e.in_flight.is_some())
            .unwrap_or(false)
            || self.adhoc.contains_key(&key);
        if occupied {
            tracing::info!(task = %key, "one-shot run skipped, previous run still in flight");
            return;
        }
        let slot = if self.plan.contains_key(&key) {
            Slot::Plan
        } else {
            Slot::Adhoc
        };
        self.fire(key, task, slot).await;
    }

    async fn tick(&mut self) {
        let now = self.ctx.clock.now_utc();
        let due: Vec<TaskKey> = self
            .plan
            .iter()
            .filter(|(_, e)| e.next_fire_at.is_some_and(|at| at <= now))
            .map(|(k, _)| k.clone())
            .collect();
        for key in due {
            let Some(entry) = self.plan.get_mut(&key) else {
                continue;
            };
            entry.next_fire_at = next_after(&entry.schedule, now);
            if entry.in_flight.is_some() {
                tracing::info!(task = %key, "fire skipped, previous run still in flight");
                continue;
            }
            let task = entry.task.clone();
            self.fire(key, task, Slot::Plan).await;
        }
    }

    /// Take the distributed lock and, on success, launch the executor.
    async fn fire(&mut self, key: TaskKey, task: TaskInfo, slot: Slot) {
        let mut lock = TaskLock::new(
            self.ctx.coordinator.clone(),
            &self.ctx.keyspace,
            key.clone(),
            self.ctx.agent_ip.clone(),
        )
        .with_ttl(self.lock_ttl);
        match lock.acquire().await {
            Ok(()) => {}
            Err(LockError::AlreadyLocked(_)) => {
                tracing::debug!(task = %key, "another agent holds the lock, skipping fire");
                return;
            }
            Err(LockError::Coordinator(e)) => {
                tracing::warn!(task = %key, error = %e, "lock attempt failed, skipping fire");
                self.ctx.warner.warning(WarningData::system(
                    format!("lock attempt for task {key} failed: {e}"),
                    self.ctx.agent_ip.clone(),
                ));
                return;
            }
            Err(e) => {
                tracing::warn!(task = %key, error = %e, "lock attempt failed, skipping fire");
                self.ctx.warner.warning(WarningData::system(
                    format!("lock attempt for task {key} failed: {e}"),
                    self.ctx.agent_ip.clone(),
                ));
                return;
            }
        }

        let cancel = CancellationToken::new();
        let handle = RunHandle {
            cancel: cancel.clone(),
        };
        match slot {
            Slot::Plan => {
                if let Some(entry) = self.plan.get_mut(&key) {
                    entry.in_flight = Some(handle);
                } else {
                    self.adhoc.insert(key.clone(), handle);
                }
            }
            Slot::Adhoc => {
                self.adhoc.insert(key.clone(), handle);
            }
        }

        let ctx = self.ctx.clone();
        let completions = self.completions_tx.clone();
        tokio::spawn(async move {
            executor::run_task(ctx, task, lock, cancel).await;
            let _ = completions.send(RunCompletion { key }).await;
        });
    }

    fn complete(&mut self, done: RunCompletion) {
        if let Some(entry) = self.plan.get_mut(&done.key) {
            entry.in_flight = None;
        }
        self.adhoc.remove(&done.key);
    }
}

/// Next strictly-future match of the schedule. Skipping past `now` also
/// absorbs DST-style clock skew that would otherwise yield a stale fire
/// time.
fn next_after(schedule: &Schedule, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    schedule.after(&now).next()
}
