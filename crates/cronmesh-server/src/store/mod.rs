//! Selector-based store façade for the control plane.
//!
//! All relational access goes through these traits. Queries are composed
//! from `(field, operator, value)` selectors plus pagination and an order
//! string, so callers never hand-write SQL. Transactions begin at the
//! façade ([`TxnProvider::begin`]) and flow through explicit
//! [`StoreTxn`] handles into the mutating operations, every one of which
//! accepts an optional handle.
//!
//! Backends: [`MemoryStore`](memory::MemoryStore) is always built (tests,
//! development); `MySqlStore` lives behind the `mysql` cargo feature.

pub mod memory;

#[cfg(feature = "mysql")]
pub mod mysql;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use cronmesh_core::model::{Project, ProjectId, ProjectRelevance, TaskLogEntry};

// ---------------------------------------------------------------------------
// Selectors
// ---------------------------------------------------------------------------

/// Comparison operator of one selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldOp {
    Equals,
    /// Field value is one of the listed values.
    In,
    /// Field holds a comma-separated set containing the value
    /// (SQL `FIND_IN_SET`).
    FindIn,
    /// SQL `LIKE`; `%` wildcards at either end are honored.
    Like,
    GreaterThan,
    LessThan,
}

/// One `(field, operator, value)` condition. Conditions in a query are
/// conjunctive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Selector {
    pub field: String,
    pub op: FieldOp,
    pub value: serde_json::Value,
}

impl Selector {
    pub fn equals(field: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        Self {
            field: field.into(),
            op: FieldOp::Equals,
            value: value.into(),
        }
    }

    pub fn is_in(field: impl Into<String>, values: Vec<serde_json::Value>) -> Self {
        Self {
            field: field.into(),
            op: FieldOp::In,
            value: serde_json::Value::Array(values),
        }
    }

    pub fn find_in(field: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        Self {
            field: field.into(),
            op: FieldOp::FindIn,
            value: value.into(),
        }
    }

    pub fn like(field: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            op: FieldOp::Like,
            value: serde_json::Value::String(pattern.into()),
        }
    }

    pub fn greater_than(field: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        Self {
            field: field.into(),
            op: FieldOp::GreaterThan,
            value: value.into(),
        }
    }

    pub fn less_than(field: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        Self {
            field: field.into(),
            op: FieldOp::LessThan,
            value: value.into(),
        }
    }
}

/// 1-based pagination window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    pub page: u64,
    pub size: u64,
}

/// A composed query: selectors + pagination + order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreQuery {
    pub selectors: Vec<Selector>,
    pub page: Option<Page>,
    /// `"field"` or `"field desc"`.
    pub order: Option<String>,
}

impl StoreQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, selector: Selector) -> Self {
        self.selectors.push(selector);
        self
    }

    pub fn paged(mut self, page: u64, size: u64) -> Self {
        self.page = Some(Page { page, size });
        self
    }

    pub fn ordered(mut self, order: impl Into<String>) -> Self {
        self.order = Some(order.into());
        self
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Store-layer errors.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum StoreError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("query error: {0}")]
    Query(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("record not found: {0}")]
    NotFound(String),

    #[error("selector field '{0}' is not queryable")]
    UnknownField(String),

    /// Catch-all wrapping a backend error with a human message and the
    /// original detail.
    #[error("{message}: {detail}")]
    Internal { message: String, detail: String },
}

pub type StoreResult<T> = Result<T, StoreError>;

// ---------------------------------------------------------------------------
// Transactions
// ---------------------------------------------------------------------------

enum TxnInner {
    /// The memory backend applies writes immediately; its handle only
    /// tracks the rollback-is-impossible contract.
    Noop,
    #[cfg(feature = "mysql")]
    MySql(sqlx::Transaction<'static, sqlx::MySql>),
}

/// An explicit transaction handle. Obtained from [`TxnProvider::begin`],
/// threaded through mutating operations, finished with
/// [`commit`](StoreTxn::commit) or [`rollback`](StoreTxn::rollback).
/// Dropping without committing rolls back on backends that support it.
pub struct StoreTxn {
    inner: TxnInner,
}

impl StoreTxn {
    pub(crate) fn noop() -> Self {
        Self {
            inner: TxnInner::Noop,
        }
    }

    #[cfg(feature = "mysql")]
    pub(crate) fn mysql(txn: sqlx::Transaction<'static, sqlx::MySql>) -> Self {
        Self {
            inner: TxnInner::MySql(txn),
        }
    }

    #[cfg(feature = "mysql")]
    pub(crate) fn as_mysql(
        &mut self,
    ) -> StoreResult<&mut sqlx::Transaction<'static, sqlx::MySql>> {
        match &mut self.inner {
            TxnInner::MySql(txn) => Ok(txn),
            _ => Err(StoreError::Internal {
                message: "transaction backend mismatch".into(),
                detail: "a non-MySQL handle was passed to the MySQL store".into(),
            }),
        }
    }

    pub async fn commit(self) -> StoreResult<()> {
        match self.inner {
            TxnInner::Noop => Ok(()),
            #[cfg(feature = "mysql")]
            TxnInner::MySql(txn) => txn.commit().await.map_err(|e| StoreError::Internal {
                message: "commit failed".into(),
                detail: e.to_string(),
            }),
        }
    }

    pub async fn rollback(self) -> StoreResult<()> {
        match self.inner {
            TxnInner::Noop => Ok(()),
            #[cfg(feature = "mysql")]
            TxnInner::MySql(txn) => txn.rollback().await.map_err(|e| StoreError::Internal {
                message: "rollback failed".into(),
                detail: e.to_string(),
            }),
        }
    }
}

/// Backends that can open transactions.
#[async_trait]
pub trait TxnProvider: Send + Sync {
    async fn begin(&self) -> StoreResult<StoreTxn>;
}

// ---------------------------------------------------------------------------
// Store traits
// ---------------------------------------------------------------------------

/// Append-only execution log.
#[async_trait]
pub trait TaskLogStore: Send + Sync {
    async fn insert_log(
        &self,
        txn: Option<&mut StoreTxn>,
        entry: &TaskLogEntry,
    ) -> StoreResult<()>;

    async fn query_logs(&self, query: &StoreQuery) -> StoreResult<Vec<TaskLogEntry>>;

    /// Delete logs with `start_time` strictly before `cutoff`; returns the
    /// number removed. The retention sweep's workhorse.
    async fn clean_logs_before(
        &self,
        txn: Option<&mut StoreTxn>,
        cutoff: DateTime<Utc>,
    ) -> StoreResult<u64>;

    /// Delete every log of one project (project-deletion cascade).
    async fn clean_project_logs(
        &self,
        txn: Option<&mut StoreTxn>,
        project: ProjectId,
    ) -> StoreResult<u64>;
}

/// Project and membership metadata.
#[async_trait]
pub trait ProjectStore: Send + Sync {
    async fn create_project(
        &self,
        txn: Option<&mut StoreTxn>,
        project: &Project,
    ) -> StoreResult<()>;

    async fn get_project(&self, id: ProjectId) -> StoreResult<Option<Project>>;

    async fn list_projects(&self, query: &StoreQuery) -> StoreResult<Vec<Project>>;

    async fn delete_project(&self, txn: Option<&mut StoreTxn>, id: ProjectId) -> StoreResult<()>;

    async fn create_relevance(
        &self,
        txn: Option<&mut StoreTxn>,
        relevance: &ProjectRelevance,
    ) -> StoreResult<()>;

    async fn list_relevance(&self, project: ProjectId) -> StoreResult<Vec<ProjectRelevance>>;

    async fn delete_relevance(
        &self,
        txn: Option<&mut StoreTxn>,
        project: ProjectId,
        uid: i64,
    ) -> StoreResult<()>;
}

/// The full façade a control-plane process works against.
pub trait Store: TaskLogStore + ProjectStore + TxnProvider {}

impl<T: TaskLogStore + ProjectStore + TxnProvider> Store for T {}

/// Delete a project and cascade to its task logs inside one transaction.
pub async fn remove_project<S: Store + ?Sized>(store: &S, id: ProjectId) -> StoreResult<u64> {
    let mut txn = store.begin().await?;
    let removed = match store.clean_project_logs(Some(&mut txn), id).await {
        Ok(removed) => removed,
        Err(e) => {
            let _ = txn.rollback().await;
            return Err(e);
        }
    };
    if let Err(e) = store.delete_project(Some(&mut txn), id).await {
        let _ = txn.rollback().await;
        return Err(e);
    }
    txn.commit().await?;
    Ok(removed)
}

// ---------------------------------------------------------------------------
// Selector evaluation (shared by the memory backend and its tests)
// ---------------------------------------------------------------------------

/// Evaluate one selector against a JSON-projected row.
pub(crate) fn selector_matches(row: &serde_json::Value, selector: &Selector) -> bool {
    let Some(field) = row.get(&selector.field) else {
        return false;
    };
    match selector.op {
        FieldOp::Equals => field == &selector.value,
        FieldOp::In => selector
            .value
            .as_array()
            .is_some_and(|values| values.contains(field)),
        FieldOp::FindIn => match (field.as_str(), selector.value.as_str()) {
            (Some(set), Some(needle)) => set.split(',').any(|item| item.trim() == needle),
            _ => false,
        },
        FieldOp::Like => match (field.as_str(), selector.value.as_str()) {
            (Some(s), Some(pattern)) => like_matches(s, pattern),
            _ => false,
        },
        FieldOp::GreaterThan => value_cmp(field, &selector.value) == Some(std::cmp::Ordering::Greater),
        FieldOp::LessThan => value_cmp(field, &selector.value) == Some(std::cmp::Ordering::Less),
    }
}

/// Minimal SQL LIKE: `%` wildcards at either end, literal otherwise.
fn like_matches(s: &str, pattern: &str) -> bool {
    match (pattern.starts_with('%'), pattern.ends_with('%')) {
        (true, true) => s.contains(pattern.trim_matches('%')),
        (true, false) => s.ends_with(pattern.trim_start_matches('%')),
        (false, true) => s.starts_with(pattern.trim_end_matches('%')),
        (false, false) => s == pattern,
    }
}

/// Order two JSON scalars: numerically when both are numbers, otherwise
/// lexically. RFC 3339 timestamps compare correctly as strings.
pub(crate) fn value_cmp(a: &serde_json::Value, b: &serde_json::Value) -> Option<std::cmp::Ordering> {
    match (a.as_f64(), b.as_f64()) {
        (Some(a), Some(b)) => a.partial_cmp(&b),
        _ => Some(a.as_str()?.cmp(b.as_str()?)),
    }
}
