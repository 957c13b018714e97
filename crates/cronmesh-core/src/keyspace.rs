//! Key construction and payload codec for the coordinator.
//!
//! This module is the single owner of every key schema the platform uses:
//!
//! | Key | Value |
//! |-----|-------|
//! | `<prefix>tasks/<project>/<task>` | encoded [`TaskInfo`] |
//! | `<prefix>killer/<project>/<task>` | transient kill marker |
//! | `<prefix>temp/<project>/<task>` | one-shot [`TaskInfo`] payload |
//! | `<prefix>locks/<project>/<task>` | [`LockOwner`], lease-bound |
//! | `<prefix>agents/<project>/<ip>` | [`AgentMeta`], lease-bound |
//! | `<prefix>cluster/auto_index` | worker-id counter |
//!
//! No other module composes key strings. Payloads are field-named JSON;
//! decoding failures map to [`CodecError::MalformedPayload`] which callers
//! treat as data corruption (skip the event, raise an alert).

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::model::{ProjectId, TaskInfo, TaskKey};

/// Decode-side errors of the payload codec.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum CodecError {
    #[error("malformed payload at '{key}': {detail}")]
    MalformedPayload { key: String, detail: String },
}

pub type CodecResult<T> = Result<T, CodecError>;

/// Builds and parses every coordinator key from a configurable prefix.
#[derive(Debug, Clone)]
pub struct KeySpace {
    prefix: String,
}

impl KeySpace {
    /// Create a keyspace rooted at `prefix`. A trailing slash is ensured,
    /// so `"/cron"` and `"/cron/"` name the same namespace.
    pub fn new(prefix: impl Into<String>) -> Self {
        let mut prefix = prefix.into();
        if !prefix.ends_with('/') {
            prefix.push('/');
        }
        Self { prefix }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn task(&self, key: &TaskKey) -> String {
        format!("{}tasks/{}/{}", self.prefix, key.project_id, key.task_id)
    }

    pub fn task_prefix(&self, project: ProjectId) -> String {
        format!("{}tasks/{}/", self.prefix, project)
    }

    pub fn killer(&self, key: &TaskKey) -> String {
        format!("{}killer/{}/{}", self.prefix, key.project_id, key.task_id)
    }

    pub fn killer_prefix(&self, project: ProjectId) -> String {
        format!("{}killer/{}/", self.prefix, project)
    }

    pub fn temp(&self, key: &TaskKey) -> String {
        format!("{}temp/{}/{}", self.prefix, key.project_id, key.task_id)
    }

    pub fn temp_prefix(&self, project: ProjectId) -> String {
        format!("{}temp/{}/", self.prefix, project)
    }

    pub fn lock(&self, key: &TaskKey) -> String {
        format!("{}locks/{}/{}", self.prefix, key.project_id, key.task_id)
    }

    pub fn agent(&self, project: ProjectId, ip: &str) -> String {
        format!("{}agents/{}/{}", self.prefix, project, ip)
    }

    pub fn agents_prefix(&self, project: ProjectId) -> String {
        format!("{}agents/{}/", self.prefix, project)
    }

    /// Counter key from which agents draw their worker IDs.
    pub fn cluster_auto_index(&self) -> String {
        format!("{}cluster/auto_index", self.prefix)
    }

    /// Recover the [`TaskKey`] from any of the per-task key families
    /// (`tasks/`, `killer/`, `temp/`, `locks/`).
    pub fn parse_task_key(&self, key: &str) -> Option<TaskKey> {
        let rest = key.strip_prefix(&self.prefix)?;
        let mut parts = rest.splitn(3, '/');
        let family = parts.next()?;
        if !matches!(family, "tasks" | "killer" | "temp" | "locks") {
            return None;
        }
        let project: ProjectId = parts.next()?.parse().ok()?;
        let task_id = parts.next()?;
        if task_id.is_empty() {
            return None;
        }
        Some(TaskKey::new(project, task_id))
    }

    /// Recover `(project, agent ip)` from a registration key.
    pub fn parse_agent_key(&self, key: &str) -> Option<(ProjectId, String)> {
        let rest = key.strip_prefix(&self.prefix)?;
        let mut parts = rest.splitn(3, '/');
        if parts.next()? != "agents" {
            return None;
        }
        let project: ProjectId = parts.next()?.parse().ok()?;
        let ip = parts.next()?;
        if ip.is_empty() {
            return None;
        }
        Some((project, ip.to_string()))
    }
}

/// Encode any wire payload to its canonical JSON form.
pub fn encode<T: Serialize>(value: &T) -> Vec<u8> {
    // Serialization of our own plain-data types cannot fail.
    serde_json::to_vec(value).unwrap_or_default()
}

/// Decode a payload read from `key`, mapping failures to the
/// malformed-payload error kind.
pub fn decode<T: DeserializeOwned>(key: &str, bytes: &[u8]) -> CodecResult<T> {
    serde_json::from_slice(bytes).map_err(|e| CodecError::MalformedPayload {
        key: key.to_string(),
        detail: e.to_string(),
    })
}

/// Convenience wrapper for the most common decode.
pub fn decode_task(key: &str, bytes: &[u8]) -> CodecResult<TaskInfo> {
    decode(key, bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ks() -> KeySpace {
        KeySpace::new("/cron")
    }

    #[test]
    fn prefix_gets_trailing_slash() {
        assert_eq!(ks().prefix(), "/cron/");
        assert_eq!(KeySpace::new("/cron/").prefix(), "/cron/");
    }

    #[test]
    fn task_key_round_trip() {
        let key = TaskKey::new(42, "backup");
        let s = ks().task(&key);
        assert_eq!(s, "/cron/tasks/42/backup");
        assert_eq!(ks().parse_task_key(&s), Some(key));
    }

    #[test]
    fn lock_and_killer_keys_parse_back() {
        let key = TaskKey::new(1, "a");
        assert_eq!(ks().parse_task_key(&ks().lock(&key)), Some(key.clone()));
        assert_eq!(ks().parse_task_key(&ks().killer(&key)), Some(key.clone()));
        assert_eq!(ks().parse_task_key(&ks().temp(&key)), Some(key));
    }

    #[test]
    fn agent_key_round_trip() {
        let s = ks().agent(3, "10.0.0.7");
        assert_eq!(s, "/cron/agents/3/10.0.0.7");
        assert_eq!(ks().parse_agent_key(&s), Some((3, "10.0.0.7".to_string())));
    }

    #[test]
    fn foreign_keys_do_not_parse() {
        assert!(ks().parse_task_key("/cron/cluster/auto_index").is_none());
        assert!(ks().parse_task_key("/other/tasks/1/a").is_none());
        assert!(ks().parse_agent_key("/cron/tasks/1/a").is_none());
    }

    #[test]
    fn decode_rejects_garbage() {
        let err = decode_task("/cron/tasks/1/a", b"{not json").unwrap_err();
        assert!(matches!(err, CodecError::MalformedPayload { .. }));
        assert!(err.to_string().contains("/cron/tasks/1/a"));
    }

    #[test]
    fn decode_rejects_missing_required_field() {
        // `command` is required; a payload without it is corrupt.
        let bytes = br#"{"project_id": 1, "task_id": "a", "name": "x", "cron_expr": "* * * * * *"}"#;
        assert!(decode_task("/cron/tasks/1/a", bytes).is_err());
    }

    #[test]
    fn encode_decode_round_trip() {
        let task = TaskInfo {
            project_id: 9,
            task_id: "t".into(),
            name: "demo".into(),
            command: "true".into(),
            cron_expr: "0 * * * * *".into(),
            timeout_seconds: 30,
            noseize: false,
            is_running: false,
        };
        let bytes = encode(&task);
        assert_eq!(decode_task("k", &bytes).unwrap(), task);
    }
}
