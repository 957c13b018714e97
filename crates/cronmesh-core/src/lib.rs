//! cronmesh core — the contract layer of the distributed cron platform.
//!
//! This crate defines everything both planes agree on and nothing more:
//! the data model, the coordinator capability contract, the key namespace
//! and payload codec, clocks, IDs, configuration, retries, alerts, and
//! supervision. Concrete coordinator backends live in
//! `cronmesh-coordinator`; the scheduler and executor in `cronmesh-agent`;
//! the publisher, store, and HTTP surface in `cronmesh-server`.
//!
//! Deliberately *not* here: the `cron` crate (expression parsing belongs
//! to the components that plan fires), sqlx, and axum.

pub mod clock;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod ids;
pub mod keyspace;
pub mod model;
pub mod report;
pub mod retry;
pub mod supervisor;
pub mod warner;

pub use clock::{Clock, SystemClock};
pub use coordinator::{
    Coordinator, CoordinatorError, CoordinatorResult, EventKind, KeyValue, LeaseId, WatchEvent,
    WatchStream,
};
pub use error::{CoreError, CoreResult};
pub use ids::IdGenerator;
pub use keyspace::{CodecError, KeySpace};
pub use model::{
    AgentMeta, LockOwner, Project, ProjectId, ProjectRelevance, TaskId, TaskInfo, TaskKey,
    TaskLogEntry, TaskRunResult,
};
pub use report::{ReportError, ResultReport};
pub use retry::{RetryConfig, RetryPolicy, retry_with_policy};
pub use supervisor::supervise;
pub use warner::{LogWarner, Warner, WarningData, WarningKind};
