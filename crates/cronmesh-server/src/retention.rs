//! Task-log retention sweep.
//!
//! A background loop deletes log rows older than the retention window
//! (7 days by default) every sweep interval (12 hours by default). Runs
//! under the panic supervisor like every other long-lived task.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use cronmesh_core::clock::{Clock, SystemClock};
use cronmesh_core::retry::RetryPolicy;
use cronmesh_core::supervisor::supervise;
use cronmesh_core::warner::{Warner, WarningData};

use crate::store::{StoreResult, TaskLogStore};

pub struct RetentionSweeper {
    logs: Arc<dyn TaskLogStore>,
    clock: Arc<dyn Clock>,
    retention: chrono::Duration,
    interval: Duration,
}

impl RetentionSweeper {
    pub fn new(logs: Arc<dyn TaskLogStore>, retention_days: i64, interval_hours: u64) -> Self {
        Self {
            logs,
            clock: Arc::new(SystemClock),
            retention: chrono::Duration::days(retention_days.max(0)),
            interval: Duration::from_secs(interval_hours.max(1) * 3_600),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// One sweep pass; returns the number of rows removed.
    pub async fn sweep_once(&self) -> StoreResult<u64> {
        let cutoff = self.clock.now_utc() - self.retention;
        let removed = self.logs.clean_logs_before(None, cutoff).await?;
        if removed > 0 {
            tracing::info!(removed, %cutoff, "stale task logs swept");
        }
        Ok(removed)
    }

    /// Start the periodic sweep under supervision.
    pub fn spawn(
        self: Arc<Self>,
        warner: Arc<dyn Warner>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let sweeper = self.clone();
        let loop_warner = warner.clone();
        let token = shutdown.clone();
        supervise(
            "retention-sweep",
            warner,
            "",
            RetryPolicy::ExponentialBackoff {
                base_ms: 1_000,
                max_ms: 60_000,
                jitter: true,
            },
            shutdown,
            move || {
                let sweeper = sweeper.clone();
                let warner = loop_warner.clone();
                let token = token.clone();
                async move {
                    loop {
                        if let Err(e) = sweeper.sweep_once().await {
                            tracing::warn!(error = %e, "retention sweep failed");
                            warner.warning(WarningData::system(
                                format!("retention sweep failed: {e}"),
                                String::new(),
                            ));
                        }
                        tokio::select! {
                            _ = token.cancelled() => return,
                            _ = tokio::time::sleep(sweeper.interval) => {}
                        }
                    }
                }
            },
        )
    }
}
