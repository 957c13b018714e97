//! Cross-crate scenarios: control plane publishes through the
//! coordinator, agents converge, fire under the distributed lock, and
//! results land in the log store.

use std::sync::Arc;
use std::time::Duration;

use cronmesh_agent::{AgentRuntime, HttpReporter};
use cronmesh_core::config::{AgentSettings, CoordinatorBackend, CoordinatorSettings};
use cronmesh_core::coordinator::Coordinator;
use cronmesh_core::ids::IdGenerator;
use cronmesh_core::keyspace::KeySpace;
use cronmesh_core::model::TaskKey;
use cronmesh_core::warner::LogWarner;
use cronmesh_coordinator::MemoryCoordinator;
use cronmesh_server::store::TaskLogStore;
use cronmesh_server::{
    AppState, MemoryStore, PublishError, RetentionSweeper, Selector, StoreQuery, StoreReporter,
    TaskPublisher, build_router,
};
use cronmesh_testing::{CaptureReporter, PartitionedCoordinator, task, wait_until};

fn agent_settings(ip: &str, projects: Vec<i64>) -> AgentSettings {
    AgentSettings {
        coordinator: CoordinatorSettings {
            backend: CoordinatorBackend::Memory,
            endpoints: Vec::new(),
            prefix: "/cron/".to_string(),
        },
        projects,
        log_level: "info".to_string(),
        report_addr: None,
        client_ip: Some(ip.to_string()),
        grace_seconds: 5,
        output_cap_bytes: 1024 * 1024,
    }
}

fn publisher(coordinator: Arc<dyn Coordinator>) -> TaskPublisher {
    TaskPublisher::new(
        coordinator,
        KeySpace::new("/cron/"),
        Arc::new(IdGenerator::from_cluster_index(1000)),
    )
}

/// S1 — a published task fires on schedule and logs its output.
#[tokio::test]
async fn happy_fire_reaches_the_log_store() {
    let coordinator = MemoryCoordinator::new();
    let store = MemoryStore::shared();
    let reporter = Arc::new(StoreReporter::new(store.clone()));
    let publisher = publisher(coordinator.clone());

    let agent = AgentRuntime::start(
        &agent_settings("10.0.0.1", vec![1]),
        coordinator,
        reporter,
        Arc::new(LogWarner),
    )
    .await
    .unwrap();

    publisher
        .save_task(task(1, "a", "*/2 * * * * *", "echo hi"))
        .await
        .unwrap();

    assert!(
        wait_until(Duration::from_secs(8), || store.log_count() >= 1).await,
        "task never fired"
    );
    let rows = store.query_logs(&StoreQuery::new()).await.unwrap();
    assert_eq!(rows[0].result, "hi\n");
    assert!(!rows[0].with_error);
    assert_eq!(rows[0].client_ip, "10.0.0.1");
    agent.shutdown().await;
}

/// S2 — two agents contend for every fire; no fire runs twice.
#[tokio::test]
async fn contention_yields_at_most_one_run_per_fire() {
    let coordinator = MemoryCoordinator::new();
    let reporter = CaptureReporter::new();
    let publisher = publisher(coordinator.clone());

    let a = AgentRuntime::start(
        &agent_settings("10.0.0.1", vec![1]),
        coordinator.clone(),
        reporter.clone(),
        Arc::new(LogWarner),
    )
    .await
    .unwrap();
    let b = AgentRuntime::start(
        &agent_settings("10.0.0.2", vec![1]),
        coordinator.clone(),
        reporter.clone(),
        Arc::new(LogWarner),
    )
    .await
    .unwrap();

    // Every second; the command holds the lock for most of the second.
    publisher
        .save_task(task(1, "shared", "* * * * * *", "sleep 0.7; echo x"))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(6)).await;
    a.shutdown().await;
    b.shutdown().await;
    tokio::time::sleep(Duration::from_millis(500)).await;

    let results = reporter.results();
    assert!(results.len() >= 3, "too few fires: {}", results.len());
    let mut starts: Vec<i64> = results.iter().map(|r| r.start_time.timestamp()).collect();
    starts.sort_unstable();
    let deduped = {
        let mut s = starts.clone();
        s.dedup();
        s
    };
    assert_eq!(
        deduped.len(),
        starts.len(),
        "a fire ran on both agents within the same second"
    );
}

/// S3 — a kill lands on the in-flight temp run and is recorded.
#[tokio::test]
async fn kill_terminates_a_temp_run() {
    let coordinator = MemoryCoordinator::new();
    let reporter = CaptureReporter::new();
    let publisher = publisher(coordinator.clone());

    let agent = AgentRuntime::start(
        &agent_settings("10.0.0.1", vec![1]),
        coordinator,
        reporter.clone(),
        Arc::new(LogWarner),
    )
    .await
    .unwrap();

    let key = TaskKey::new(1, "b");
    publisher
        .save_task(task(1, "b", "0 0 0 1 1 *", "sleep 60"))
        .await
        .unwrap();
    publisher.run_once(&key).await.unwrap();

    tokio::time::sleep(Duration::from_secs(1)).await;
    publisher.kill_task(&key).await.unwrap();

    assert!(
        wait_until(Duration::from_secs(10), || reporter.count() >= 1).await,
        "killed run never reported"
    );
    let result = &reporter.results()[0];
    assert_eq!(result.error.as_deref(), Some("killed"));
    let elapsed = result.end_time - result.start_time;
    assert!(
        elapsed.num_milliseconds() >= 500 && elapsed.num_seconds() <= 10,
        "unexpected run duration: {elapsed}"
    );
    agent.shutdown().await;
}

/// S4 — the agent reconciles after a coordinator outage and picks up a
/// task published while it was cut off.
#[tokio::test]
async fn watcher_reconciles_after_partition() {
    let coordinator = MemoryCoordinator::new();
    let agent_side = PartitionedCoordinator::new(coordinator.clone());
    let reporter = CaptureReporter::new();
    let publisher = publisher(coordinator.clone());

    let agent = AgentRuntime::start(
        &agent_settings("10.0.0.1", vec![1]),
        agent_side.clone(),
        reporter.clone(),
        Arc::new(LogWarner),
    )
    .await
    .unwrap();
    // Let the initial snapshot land before cutting the link.
    tokio::time::sleep(Duration::from_millis(300)).await;

    agent_side.set_partitioned(true);
    publisher
        .save_task(task(1, "late", "*/2 * * * * *", "echo reconciled"))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(2)).await;
    agent_side.set_partitioned(false);

    assert!(
        wait_until(Duration::from_secs(12), || {
            reporter.results().iter().any(|r| r.output == "reconciled\n")
        })
        .await,
        "agent never reconciled after the partition"
    );
    agent.shutdown().await;
}

/// S5 — an invalid cron expression is rejected and nothing is installed.
#[tokio::test]
async fn bad_cron_is_rejected_and_never_runs() {
    let coordinator = MemoryCoordinator::new();
    let reporter = CaptureReporter::new();
    let publisher = publisher(coordinator.clone());

    let agent = AgentRuntime::start(
        &agent_settings("10.0.0.1", vec![1]),
        coordinator.clone(),
        reporter.clone(),
        Arc::new(LogWarner),
    )
    .await
    .unwrap();

    let err = publisher
        .save_task(task(1, "bad", "not-a-cron", "echo never"))
        .await
        .unwrap_err();
    assert!(matches!(err, PublishError::InvalidCron { .. }));

    let (kvs, _) = coordinator.range("/cron/tasks/").await.unwrap();
    assert!(kvs.is_empty());
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(reporter.count(), 0);
    agent.shutdown().await;
}

/// S6 — the retention sweep removes exactly the stale rows.
#[tokio::test]
async fn retention_sweep_removes_only_stale_logs() {
    use chrono::{Duration as ChronoDuration, Utc};
    use cronmesh_core::model::TaskLogEntry;

    let store = MemoryStore::shared();
    for age_days in [8, 1] {
        for i in 0..10 {
            let start = Utc::now() - ChronoDuration::days(age_days);
            store
                .insert_log(
                    None,
                    &TaskLogEntry {
                        project_id: 1,
                        task_id: format!("t{i}"),
                        start_time: start,
                        end_time: start,
                        result: String::new(),
                        with_error: false,
                        client_ip: String::new(),
                    },
                )
                .await
                .unwrap();
        }
    }
    let sweeper = RetentionSweeper::new(store.clone(), 7, 12);
    assert_eq!(sweeper.sweep_once().await.unwrap(), 10);
    assert_eq!(store.log_count(), 10);
    let stale = store
        .query_logs(&StoreQuery::new().filter(Selector::less_than(
            "start_time",
            (Utc::now() - ChronoDuration::days(7)).to_rfc3339(),
        )))
        .await
        .unwrap();
    assert!(stale.is_empty());
}

/// Full pipeline: agent → HTTP collector → log store.
#[tokio::test]
async fn http_reporting_end_to_end() {
    let coordinator = MemoryCoordinator::new();
    let store = MemoryStore::shared();
    let server_publisher = Arc::new(publisher(coordinator.clone()));

    let state = AppState {
        publisher: server_publisher.clone(),
        logs: store.clone(),
    };
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, build_router(state)).await.unwrap();
    });

    let agent = AgentRuntime::start(
        &agent_settings("10.0.0.1", vec![1]),
        coordinator,
        Arc::new(HttpReporter::new(&format!("http://{addr}"))),
        Arc::new(LogWarner),
    )
    .await
    .unwrap();

    server_publisher
        .save_task(task(1, "e2e", "*/2 * * * * *", "echo end-to-end"))
        .await
        .unwrap();

    assert!(
        wait_until(Duration::from_secs(10), || store.log_count() >= 1).await,
        "result never reached the collector"
    );
    let rows = store.query_logs(&StoreQuery::new()).await.unwrap();
    assert_eq!(rows[0].result, "end-to-end\n");
    agent.shutdown().await;
}
