//! Shared fixtures for cronmesh integration tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use cronmesh_core::coordinator::{
    Coordinator, CoordinatorError, CoordinatorResult, KeyValue, LeaseId, WatchStream,
};
use cronmesh_core::model::{TaskInfo, TaskRunResult};
use cronmesh_core::report::{ReportError, ResultReport};
use cronmesh_core::warner::{Warner, WarningData};

/// A reporter that records every result it receives.
pub struct CaptureReporter {
    results: Mutex<Vec<TaskRunResult>>,
}

impl CaptureReporter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            results: Mutex::new(Vec::new()),
        })
    }

    pub fn results(&self) -> Vec<TaskRunResult> {
        self.results.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.results.lock().len()
    }
}

#[async_trait]
impl ResultReport for CaptureReporter {
    async fn report(&self, result: &TaskRunResult) -> Result<(), ReportError> {
        self.results.lock().push(result.clone());
        Ok(())
    }
}

/// A warner that records every alert.
pub struct RecordingWarner {
    warnings: Mutex<Vec<WarningData>>,
}

impl RecordingWarner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            warnings: Mutex::new(Vec::new()),
        })
    }

    pub fn warnings(&self) -> Vec<WarningData> {
        self.warnings.lock().clone()
    }
}

impl Warner for RecordingWarner {
    fn warning(&self, warning: WarningData) {
        self.warnings.lock().push(warning);
    }
}

/// Wraps a coordinator so one side of a deployment can be partitioned
/// independently: while partitioned, every operation fails and open watch
/// streams close, but other holders of the inner coordinator keep working.
pub struct PartitionedCoordinator {
    inner: Arc<dyn Coordinator>,
    offline: Arc<AtomicBool>,
}

impl PartitionedCoordinator {
    pub fn new(inner: Arc<dyn Coordinator>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            offline: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn set_partitioned(&self, partitioned: bool) {
        self.offline.store(partitioned, Ordering::SeqCst);
    }

    fn check(&self) -> CoordinatorResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            Err(CoordinatorError::Unavailable("partitioned".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Coordinator for PartitionedCoordinator {
    async fn get(&self, key: &str) -> CoordinatorResult<Option<KeyValue>> {
        self.check()?;
        self.inner.get(key).await
    }

    async fn put(
        &self,
        key: &str,
        value: Vec<u8>,
        lease: Option<LeaseId>,
    ) -> CoordinatorResult<Option<KeyValue>> {
        self.check()?;
        self.inner.put(key, value, lease).await
    }

    async fn delete(&self, key: &str) -> CoordinatorResult<Option<KeyValue>> {
        self.check()?;
        self.inner.delete(key).await
    }

    async fn range(&self, prefix: &str) -> CoordinatorResult<(Vec<KeyValue>, i64)> {
        self.check()?;
        self.inner.range(prefix).await
    }

    async fn watch(&self, prefix: &str, from_revision: i64) -> CoordinatorResult<WatchStream> {
        self.check()?;
        let mut inner_stream = self.inner.watch(prefix, from_revision).await?;
        let (tx, rx) = mpsc::unbounded_channel();
        let offline = self.offline.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_millis(100));
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        if offline.load(Ordering::SeqCst) {
                            return;
                        }
                    }
                    event = inner_stream.recv() => match event {
                        Some(event) => {
                            if offline.load(Ordering::SeqCst) || tx.send(event).is_err() {
                                return;
                            }
                        }
                        None => return,
                    }
                }
            }
        });
        Ok(rx)
    }

    async fn grant(&self, ttl: Duration) -> CoordinatorResult<LeaseId> {
        self.check()?;
        self.inner.grant(ttl).await
    }

    async fn keep_alive(&self, lease: LeaseId) -> CoordinatorResult<()> {
        self.check()?;
        self.inner.keep_alive(lease).await
    }

    async fn revoke(&self, lease: LeaseId) -> CoordinatorResult<()> {
        self.check()?;
        self.inner.revoke(lease).await
    }

    async fn increment(&self, key: &str) -> CoordinatorResult<i64> {
        self.check()?;
        self.inner.increment(key).await
    }

    async fn put_if_absent(
        &self,
        key: &str,
        value: Vec<u8>,
        lease: Option<LeaseId>,
    ) -> CoordinatorResult<bool> {
        self.check()?;
        self.inner.put_if_absent(key, value, lease).await
    }
}

/// Build a minimal task definition for tests.
pub fn task(project: i64, id: &str, cron_expr: &str, command: &str) -> TaskInfo {
    TaskInfo {
        project_id: project,
        task_id: id.to_string(),
        name: id.to_string(),
        command: command.to_string(),
        cron_expr: cron_expr.to_string(),
        timeout_seconds: 30,
        noseize: false,
        is_running: false,
    }
}

/// Poll a predicate until it holds or the deadline passes.
pub async fn wait_until<F: Fn() -> bool>(deadline: Duration, predicate: F) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < deadline {
        if predicate() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    predicate()
}
