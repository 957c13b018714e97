//! Coordinator backends and the coordination protocol built on them.
//!
//! Backends implementing the [`Coordinator`](cronmesh_core::Coordinator)
//! contract:
//!
//! - [`MemoryCoordinator`] — deterministic in-process store; always built.
//!   Backs every test and embedded single-node deployments.
//! - [`EtcdCoordinator`] — production backend over an etcd cluster;
//!   enabled with the `etcd` cargo feature.
//!
//! On top of the contract, this crate provides the two protocol pieces
//! shared by every agent: the lease-bound [`TaskLock`] and the
//! [`AgentRegistry`] (liveness keys + worker-id bootstrap).

pub mod lock;
pub mod memory;
pub mod registry;

#[cfg(feature = "etcd")]
pub mod etcd;

pub use lock::{LOCK_TTL, LockError, TaskLock};
pub use memory::MemoryCoordinator;
pub use registry::{AgentRegistry, REGISTRATION_TTL, bootstrap_worker_id, workers};

#[cfg(feature = "etcd")]
pub use etcd::EtcdCoordinator;
