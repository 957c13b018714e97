//! Panic containment for long-running background tasks.
//!
//! Every watcher, keepalive loop, and sweep runs under [`supervise`]: a
//! panic is caught at the task boundary, reported to the [`Warner`], and
//! the task is restarted with backoff. A panic in one task never
//! propagates to its peers. Clean return of the task body is treated as an
//! intentional exit (the body observed shutdown) and ends supervision.

use std::future::Future;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::retry::RetryPolicy;
use crate::warner::{Warner, WarningData};

/// Spawn `factory()` under supervision.
///
/// The factory is invoked once per (re)start so every incarnation gets a
/// fresh future. Cancelling `shutdown` stops the current incarnation and
/// ends supervision.
pub fn supervise<F, Fut>(
    name: impl Into<String>,
    warner: Arc<dyn Warner>,
    agent_ip: impl Into<String>,
    policy: RetryPolicy,
    shutdown: CancellationToken,
    factory: F,
) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let name = name.into();
    let agent_ip = agent_ip.into();
    tokio::spawn(async move {
        let mut restarts: usize = 0;
        loop {
            let mut incarnation = tokio::spawn(factory());
            tokio::select! {
                _ = shutdown.cancelled() => {
                    incarnation.abort();
                    let _ = incarnation.await;
                    return;
                }
                joined = &mut incarnation => {
                    match joined {
                        Ok(()) => return,
                        Err(e) if e.is_panic() => {
                            let delay = policy.delay_for(restarts);
                            restarts += 1;
                            tracing::error!(
                                task = %name,
                                restarts,
                                delay_ms = delay.as_millis() as u64,
                                "supervised task panicked, restarting"
                            );
                            warner.warning(WarningData::system(
                                format!("background task '{name}' panicked (restart #{restarts})"),
                                agent_ip.clone(),
                            ));
                            tokio::select! {
                                _ = shutdown.cancelled() => return,
                                _ = tokio::time::sleep(delay) => {}
                            }
                        }
                        // Aborted from outside; nothing to restart.
                        Err(_) => return,
                    }
                }
            }
        }
    })
}
