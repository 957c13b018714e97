//! Core data model shared by the control plane and the agents.
//!
//! Everything that crosses the coordinator or the reporter wire lives here.
//! Payload schemas are additive-only: fields added after the first release
//! carry `#[serde(default)]` so old encoders and new decoders interoperate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Numeric identifier of a project. Assigned by the control plane.
pub type ProjectId = i64;

/// Identifier of a task, unique within its project. Opaque to the scheduler.
pub type TaskId = String;

/// The `(project, task)` pair that names a task everywhere in the system.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskKey {
    pub project_id: ProjectId,
    pub task_id: TaskId,
}

impl TaskKey {
    pub fn new(project_id: ProjectId, task_id: impl Into<TaskId>) -> Self {
        Self {
            project_id,
            task_id: task_id.into(),
        }
    }
}

impl std::fmt::Display for TaskKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.project_id, self.task_id)
    }
}

/// The authoritative definition of one scheduled task.
///
/// The control plane is the only writer of the persistent fields;
/// `is_running` is transient telemetry flipped by the executing agent and is
/// never authoritative (lock presence is — see the task lock).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInfo {
    pub project_id: ProjectId,
    pub task_id: TaskId,
    pub name: String,
    /// Shell command line, executed via `sh -c`.
    pub command: String,
    /// Six-field cron expression with second precision
    /// (`"*/2 * * * * *"` = every 2 seconds).
    pub cron_expr: String,
    /// Wall-clock budget for one run. `0` disables the timeout.
    #[serde(default)]
    pub timeout_seconds: u64,
    /// Carried through publish/decode untouched; no scheduler semantics
    /// are attached to it yet.
    #[serde(default)]
    pub noseize: bool,
    #[serde(default)]
    pub is_running: bool,
}

impl TaskInfo {
    pub fn key(&self) -> TaskKey {
        TaskKey::new(self.project_id, self.task_id.clone())
    }
}

/// Outcome of one task fire, emitted by the executor to the reporter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRunResult {
    pub project_id: ProjectId,
    pub task_id: TaskId,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    /// Combined stdout + stderr, capped and truncation-marked by the executor.
    pub output: String,
    /// `None` on a clean zero exit; otherwise `"killed"`, `"timeout"`, or an
    /// exit-status description.
    pub error: Option<String>,
    /// IP of the agent that executed the run.
    pub client_ip: String,
}

impl TaskRunResult {
    /// Whether this run should be recorded as failed.
    pub fn with_error(&self) -> bool {
        self.error.is_some()
    }
}

/// One row of the append-only execution log. Retained for a bounded window
/// (7 days by default) and swept by the control plane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskLogEntry {
    pub project_id: ProjectId,
    pub task_id: TaskId,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub result: String,
    pub with_error: bool,
    pub client_ip: String,
}

impl From<TaskRunResult> for TaskLogEntry {
    fn from(r: TaskRunResult) -> Self {
        let with_error = r.with_error();
        Self {
            project_id: r.project_id,
            task_id: r.task_id,
            start_time: r.start_time,
            end_time: r.end_time,
            result: match r.error {
                Some(err) if r.output.is_empty() => err,
                Some(err) => format!("{}\n{}", r.output, err),
                None => r.output,
            },
            with_error,
            client_ip: r.client_ip,
        }
    }
}

/// A project groups tasks and members. Control-plane metadata only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: ProjectId,
    pub title: String,
    pub remark: String,
    /// Owning user.
    pub owner_uid: i64,
}

/// Many-to-many membership edge between users and projects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectRelevance {
    pub project_id: ProjectId,
    pub uid: i64,
    pub create_time: DateTime<Utc>,
}

/// Value stored under an agent's per-project registration key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentMeta {
    pub ip: String,
    #[serde(default)]
    pub version: String,
}

/// Value stored under a task's lock key while a fire is in flight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockOwner {
    pub agent_ip: String,
    pub lease_id: i64,
    /// Random discriminator so two acquisitions by the same agent are
    /// distinguishable in the coordinator history.
    pub nonce: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_key_display() {
        let key = TaskKey::new(7, "nightly");
        assert_eq!(key.to_string(), "7/nightly");
    }

    #[test]
    fn task_info_decodes_without_optional_fields() {
        // A v1 encoder that predates `noseize`/`is_running` must still decode.
        let json = r#"{
            "project_id": 1,
            "task_id": "a",
            "name": "echo",
            "command": "echo hi",
            "cron_expr": "*/2 * * * * *"
        }"#;
        let task: TaskInfo = serde_json::from_str(json).unwrap();
        assert!(!task.noseize);
        assert!(!task.is_running);
        assert_eq!(task.timeout_seconds, 0);
    }

    #[test]
    fn log_entry_from_clean_result() {
        let r = TaskRunResult {
            project_id: 1,
            task_id: "a".into(),
            start_time: Utc::now(),
            end_time: Utc::now(),
            output: "hi\n".into(),
            error: None,
            client_ip: "10.0.0.1".into(),
        };
        let entry = TaskLogEntry::from(r);
        assert_eq!(entry.result, "hi\n");
        assert!(!entry.with_error);
    }

    #[test]
    fn log_entry_from_failed_result_appends_error() {
        let r = TaskRunResult {
            project_id: 1,
            task_id: "a".into(),
            start_time: Utc::now(),
            end_time: Utc::now(),
            output: "partial".into(),
            error: Some("killed".into()),
            client_ip: "10.0.0.1".into(),
        };
        let entry = TaskLogEntry::from(r);
        assert!(entry.with_error);
        assert_eq!(entry.result, "partial\nkilled");
    }
}
