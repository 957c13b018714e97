//! cronmesh server — the control plane.
//!
//! Publishes task definitions into the coordinator ([`publisher`]),
//! collects execution results over HTTP ([`http`]) or directly
//! ([`reporter`]), persists the execution log behind a selector façade
//! ([`store`]), and sweeps it on a retention schedule ([`retention`]).

pub mod http;
pub mod publisher;
pub mod reporter;
pub mod retention;
pub mod store;

pub use http::{AppState, build_router, serve};
pub use publisher::{KILL_TTL, PublishError, TEMP_TTL, TaskPublisher};
pub use reporter::StoreReporter;
pub use retention::RetentionSweeper;
pub use store::{
    FieldOp, Page, ProjectStore, Selector, Store, StoreError, StoreQuery, StoreResult, StoreTxn,
    TaskLogStore, TxnProvider, memory::MemoryStore, remove_project,
};

#[cfg(feature = "mysql")]
pub use store::mysql::MySqlStore;
