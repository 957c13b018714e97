//! The coordinator contract — a watchable key-value store with leases.
//!
//! # Architecture
//!
//! The whole platform coordinates through this one capability set: task
//! publication, the distributed task lock, agent liveness, and one-shot
//! kill/temp events are all keys under a shared prefix. The contract is
//! deliberately vendor-neutral; `cronmesh-coordinator` supplies a
//! deterministic in-memory backend (always built) and an etcd backend
//! behind the `etcd` cargo feature. Trait definitions live here so that
//! neither side of the wire depends on a concrete backend.
//!
//! # Ordering
//!
//! Every mutation is assigned a strictly increasing `revision`. Watches
//! deliver events in revision order per prefix; a watch can be restarted
//! from any retained revision, and asking for a compacted revision fails
//! with [`CoordinatorError::Compacted`] so the caller falls back to a full
//! snapshot.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

/// Identifier of a granted lease. Backend-assigned, never zero.
pub type LeaseId = i64;

/// A key-value pair as observed at some revision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: Vec<u8>,
    /// Revision of the mutation that produced this value.
    pub revision: i64,
}

/// What happened to a watched key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Put,
    Delete,
}

/// One delta delivered on a watch stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub kind: EventKind,
    pub key: String,
    /// Empty for [`EventKind::Delete`].
    pub value: Vec<u8>,
    pub revision: i64,
}

/// Receiving half of a watch.
///
/// The stream is infinite in principle; it closes when the transport is
/// lost (resume with a fresh [`Coordinator::watch`] from the last observed
/// revision) and yields a terminal `Err` when the backend reports that the
/// requested history is gone.
pub type WatchStream = mpsc::UnboundedReceiver<CoordinatorResult<WatchEvent>>;

/// Errors surfaced by coordinator operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum CoordinatorError {
    /// Transport failure or timeout. Background loops retry with backoff.
    #[error("coordinator unavailable: {0}")]
    Unavailable(String),

    /// The requested watch revision has been compacted away.
    #[error("revision {requested} is compacted (oldest retained: {oldest})")]
    Compacted { requested: i64, oldest: i64 },

    /// The lease does not exist or has already expired.
    #[error("lease {0} not found or expired")]
    LeaseNotFound(LeaseId),

    /// A counter key holds something that is not a decimal integer.
    #[error("counter key '{key}' holds a non-numeric value")]
    CorruptCounter { key: String },
}

impl CoordinatorError {
    /// Whether a retry with backoff can reasonably succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CoordinatorError::Unavailable(_))
    }
}

pub type CoordinatorResult<T> = Result<T, CoordinatorError>;

/// The capability set the platform requires from its coordination service.
///
/// All operations may block on network I/O and none may hold application
/// locks across the call; implementations must be safe for concurrent use
/// from watchers, lockers, and the registry simultaneously.
#[async_trait]
pub trait Coordinator: Send + Sync {
    /// Read a single key.
    async fn get(&self, key: &str) -> CoordinatorResult<Option<KeyValue>>;

    /// Write a key, optionally bound to a lease. Returns the prior value
    /// when the key already existed.
    async fn put(
        &self,
        key: &str,
        value: Vec<u8>,
        lease: Option<LeaseId>,
    ) -> CoordinatorResult<Option<KeyValue>>;

    /// Delete a key. Returns the deleted value, if any.
    async fn delete(&self, key: &str) -> CoordinatorResult<Option<KeyValue>>;

    /// Read every key under a prefix, plus the store revision at read time.
    /// The revision is returned even for an empty range so watchers can
    /// start from a consistent point.
    async fn range(&self, prefix: &str) -> CoordinatorResult<(Vec<KeyValue>, i64)>;

    /// Open a watch over a prefix starting at `from_revision` (inclusive).
    async fn watch(&self, prefix: &str, from_revision: i64) -> CoordinatorResult<WatchStream>;

    /// Grant a lease with the given TTL.
    async fn grant(&self, ttl: Duration) -> CoordinatorResult<LeaseId>;

    /// Extend a lease back to its full TTL.
    async fn keep_alive(&self, lease: LeaseId) -> CoordinatorResult<()>;

    /// Revoke a lease, deleting every key bound to it. Revoking an unknown
    /// lease is not an error (it may have expired moments earlier).
    async fn revoke(&self, lease: LeaseId) -> CoordinatorResult<()>;

    /// Atomically increment the counter stored at `key`, returning the new
    /// value. The counter starts at zero when the key is absent.
    async fn increment(&self, key: &str) -> CoordinatorResult<i64>;

    /// Transactionally create `key` iff it does not exist. Returns `true`
    /// when this call created the key.
    async fn put_if_absent(
        &self,
        key: &str,
        value: Vec<u8>,
        lease: Option<LeaseId>,
    ) -> CoordinatorResult<bool>;
}
