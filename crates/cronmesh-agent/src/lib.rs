//! cronmesh agent — the worker-side runtime.
//!
//! An agent converges its in-memory plan on the task set published for
//! its projects ([`watcher`]), plans and fires cron schedules under the
//! distributed task lock ([`scheduler`]), executes commands in child
//! processes with cancellation ([`executor`]), and delivers results to
//! the control plane ([`reporter`]). [`runtime`] wires it all together
//! behind the `cronmesh-agent` binary.

pub mod executor;
pub mod reporter;
pub mod runtime;
pub mod scheduler;
pub mod watcher;

pub use executor::ExecutionContext;
pub use reporter::HttpReporter;
pub use runtime::{AgentError, AgentRuntime};
pub use scheduler::{SchedulerEvent, SchedulerHandle, TaskScheduler};
pub use watcher::TaskWatcher;
