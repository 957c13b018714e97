//! Deterministic in-memory coordinator.
//!
//! The reference implementation of the [`Coordinator`] contract: a single
//! revision counter orders every mutation, watches replay retained history
//! and then stream live events in that order, and leases expire through a
//! coarse background sweep. It backs all the tests in the workspace and
//! doubles as the embedded backend for single-process deployments.
//!
//! Two operational switches exist purely for fault-injection:
//! [`MemoryCoordinator::set_offline`] simulates a transport partition
//! (every call fails, open watch streams close) and
//! [`MemoryCoordinator::compact`] discards history so watchers exercise
//! their snapshot fallback.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use cronmesh_core::coordinator::{
    Coordinator, CoordinatorError, CoordinatorResult, EventKind, KeyValue, LeaseId, WatchEvent,
    WatchStream,
};

/// How often expired leases are collected.
const SWEEP_INTERVAL: Duration = Duration::from_millis(100);

struct StoredValue {
    value: Vec<u8>,
    revision: i64,
    lease: Option<LeaseId>,
}

struct LeaseState {
    ttl: Duration,
    expires_at: Instant,
    keys: HashSet<String>,
}

struct WatcherReg {
    prefix: String,
    tx: mpsc::UnboundedSender<CoordinatorResult<WatchEvent>>,
}

#[derive(Default)]
struct State {
    revision: i64,
    /// Events with revision <= `compacted` are no longer replayable.
    compacted: i64,
    keys: BTreeMap<String, StoredValue>,
    history: Vec<WatchEvent>,
    watchers: Vec<WatcherReg>,
    leases: HashMap<LeaseId, LeaseState>,
    next_lease: LeaseId,
    offline: bool,
}

/// In-memory [`Coordinator`].
///
/// Must be created inside a tokio runtime (the lease sweeper is spawned at
/// construction).
pub struct MemoryCoordinator {
    state: Mutex<State>,
}

impl MemoryCoordinator {
    pub fn new() -> Arc<Self> {
        let coordinator = Arc::new(Self {
            state: Mutex::new(State::default()),
        });
        let weak: Weak<Self> = Arc::downgrade(&coordinator);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(SWEEP_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tick.tick().await;
                let Some(this) = weak.upgrade() else { return };
                this.sweep_expired_leases();
            }
        });
        coordinator
    }

    /// Simulate a transport partition. While offline every operation
    /// returns [`CoordinatorError::Unavailable`] and open watch streams
    /// close; leases keep expiring (the store itself is still alive, only
    /// the callers cannot reach it).
    pub fn set_offline(&self, offline: bool) {
        let mut state = self.state.lock();
        state.offline = offline;
        if offline {
            state.watchers.clear();
        }
    }

    /// Discard replayable history up to and including `revision`.
    pub fn compact(&self, revision: i64) {
        let mut state = self.state.lock();
        state.compacted = state.compacted.max(revision);
        let compacted = state.compacted;
        state.history.retain(|e| e.revision > compacted);
    }

    /// Current store revision (test observability).
    pub fn current_revision(&self) -> i64 {
        self.state.lock().revision
    }

    /// Number of live leases (test observability).
    pub fn lease_count(&self) -> usize {
        self.state.lock().leases.len()
    }

    fn sweep_expired_leases(&self) {
        let now = Instant::now();
        let mut state = self.state.lock();
        let expired: Vec<LeaseId> = state
            .leases
            .iter()
            .filter(|(_, lease)| lease.expires_at <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            Self::revoke_locked(&mut state, id);
        }
    }

    /// Remove a lease and delete every key bound to it, emitting DELETE
    /// events. Caller holds the state lock.
    fn revoke_locked(state: &mut State, lease: LeaseId) {
        let Some(lease_state) = state.leases.remove(&lease) else {
            return;
        };
        let mut keys: Vec<String> = lease_state.keys.into_iter().collect();
        keys.sort();
        for key in keys {
            Self::delete_locked(state, &key);
        }
    }

    fn put_locked(
        state: &mut State,
        key: &str,
        value: Vec<u8>,
        lease: Option<LeaseId>,
    ) -> Option<KeyValue> {
        state.revision += 1;
        let revision = state.revision;
        let prior = state.keys.insert(
            key.to_string(),
            StoredValue {
                value: value.clone(),
                revision,
                lease,
            },
        );
        // Rebind lease attachment.
        if let Some(prev) = &prior {
            if let Some(old_lease) = prev.lease {
                if let Some(l) = state.leases.get_mut(&old_lease) {
                    l.keys.remove(key);
                }
            }
        }
        if let Some(lease) = lease {
            if let Some(l) = state.leases.get_mut(&lease) {
                l.keys.insert(key.to_string());
            }
        }
        Self::broadcast(
            state,
            WatchEvent {
                kind: EventKind::Put,
                key: key.to_string(),
                value,
                revision,
            },
        );
        prior.map(|p| KeyValue {
            key: key.to_string(),
            value: p.value,
            revision: p.revision,
        })
    }

    fn delete_locked(state: &mut State, key: &str) -> Option<KeyValue> {
        let prior = state.keys.remove(key)?;
        if let Some(lease) = prior.lease {
            if let Some(l) = state.leases.get_mut(&lease) {
                l.keys.remove(key);
            }
        }
        state.revision += 1;
        let revision = state.revision;
        Self::broadcast(
            state,
            WatchEvent {
                kind: EventKind::Delete,
                key: key.to_string(),
                value: Vec::new(),
                revision,
            },
        );
        Some(KeyValue {
            key: key.to_string(),
            value: prior.value,
            revision: prior.revision,
        })
    }

    fn broadcast(state: &mut State, event: WatchEvent) {
        state.history.push(event.clone());
        state
            .watchers
            .retain(|w| !event.key.starts_with(&w.prefix) || w.tx.send(Ok(event.clone())).is_ok());
    }

    fn check_online(state: &State) -> CoordinatorResult<()> {
        if state.offline {
            Err(CoordinatorError::Unavailable(
                "memory coordinator is offline".to_string(),
            ))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Coordinator for MemoryCoordinator {
    async fn get(&self, key: &str) -> CoordinatorResult<Option<KeyValue>> {
        let state = self.state.lock();
        Self::check_online(&state)?;
        Ok(state.keys.get(key).map(|v| KeyValue {
            key: key.to_string(),
            value: v.value.clone(),
            revision: v.revision,
        }))
    }

    async fn put(
        &self,
        key: &str,
        value: Vec<u8>,
        lease: Option<LeaseId>,
    ) -> CoordinatorResult<Option<KeyValue>> {
        let mut state = self.state.lock();
        Self::check_online(&state)?;
        if let Some(lease) = lease {
            if !state.leases.contains_key(&lease) {
                return Err(CoordinatorError::LeaseNotFound(lease));
            }
        }
        Ok(Self::put_locked(&mut state, key, value, lease))
    }

    async fn delete(&self, key: &str) -> CoordinatorResult<Option<KeyValue>> {
        let mut state = self.state.lock();
        Self::check_online(&state)?;
        Ok(Self::delete_locked(&mut state, key))
    }

    async fn range(&self, prefix: &str) -> CoordinatorResult<(Vec<KeyValue>, i64)> {
        let state = self.state.lock();
        Self::check_online(&state)?;
        let kvs = state
            .keys
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| KeyValue {
                key: k.clone(),
                value: v.value.clone(),
                revision: v.revision,
            })
            .collect();
        Ok((kvs, state.revision))
    }

    async fn watch(&self, prefix: &str, from_revision: i64) -> CoordinatorResult<WatchStream> {
        let mut state = self.state.lock();
        Self::check_online(&state)?;
        if state.compacted > 0 && from_revision <= state.compacted {
            return Err(CoordinatorError::Compacted {
                requested: from_revision,
                oldest: state.compacted + 1,
            });
        }
        let (tx, rx) = mpsc::unbounded_channel();
        // Replay retained history, then go live; both happen under the
        // state lock so no event is lost or duplicated in between.
        for event in &state.history {
            if event.revision >= from_revision && event.key.starts_with(prefix) {
                let _ = tx.send(Ok(event.clone()));
            }
        }
        state.watchers.push(WatcherReg {
            prefix: prefix.to_string(),
            tx,
        });
        Ok(rx)
    }

    async fn grant(&self, ttl: Duration) -> CoordinatorResult<LeaseId> {
        let mut state = self.state.lock();
        Self::check_online(&state)?;
        state.next_lease += 1;
        let id = state.next_lease;
        state.leases.insert(
            id,
            LeaseState {
                ttl,
                expires_at: Instant::now() + ttl,
                keys: HashSet::new(),
            },
        );
        Ok(id)
    }

    async fn keep_alive(&self, lease: LeaseId) -> CoordinatorResult<()> {
        let mut state = self.state.lock();
        Self::check_online(&state)?;
        let lease_state = state
            .leases
            .get_mut(&lease)
            .ok_or(CoordinatorError::LeaseNotFound(lease))?;
        lease_state.expires_at = Instant::now() + lease_state.ttl;
        Ok(())
    }

    async fn revoke(&self, lease: LeaseId) -> CoordinatorResult<()> {
        let mut state = self.state.lock();
        Self::check_online(&state)?;
        Self::revoke_locked(&mut state, lease);
        Ok(())
    }

    async fn increment(&self, key: &str) -> CoordinatorResult<i64> {
        let mut state = self.state.lock();
        Self::check_online(&state)?;
        let current = match state.keys.get(key) {
            None => 0,
            Some(v) => String::from_utf8_lossy(&v.value).parse::<i64>().map_err(|_| {
                CoordinatorError::CorruptCounter {
                    key: key.to_string(),
                }
            })?,
        };
        let next = current + 1;
        Self::put_locked(&mut state, key, next.to_string().into_bytes(), None);
        Ok(next)
    }

    async fn put_if_absent(
        &self,
        key: &str,
        value: Vec<u8>,
        lease: Option<LeaseId>,
    ) -> CoordinatorResult<bool> {
        let mut state = self.state.lock();
        Self::check_online(&state)?;
        if state.keys.contains_key(key) {
            return Ok(false);
        }
        if let Some(lease) = lease {
            if !state.leases.contains_key(&lease) {
                return Err(CoordinatorError::LeaseNotFound(lease));
            }
        }
        Self::put_locked(&mut state, key, value, lease);
        Ok(true)
    }
}
