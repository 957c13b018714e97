//! The alert sink for operational anomalies.
//!
//! Both planes report through [`Warner`]: malformed payloads, reporter
//! failures, supervisor restarts. Transport implementations (webhook,
//! mail) plug in behind the trait; the default sink writes structured
//! logs.

use serde::{Deserialize, Serialize};

/// Coarse category of an alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningKind {
    /// Infrastructure-level anomaly (coordinator, supervisor, reporter).
    System,
    /// Anomaly scoped to a single task.
    Task,
}

/// One alert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WarningData {
    pub kind: WarningKind,
    pub data: String,
    /// IP of the emitting process; empty for the control plane.
    pub agent_ip: String,
}

impl WarningData {
    pub fn system(data: impl Into<String>, agent_ip: impl Into<String>) -> Self {
        Self {
            kind: WarningKind::System,
            data: data.into(),
            agent_ip: agent_ip.into(),
        }
    }

    pub fn task(data: impl Into<String>, agent_ip: impl Into<String>) -> Self {
        Self {
            kind: WarningKind::Task,
            data: data.into(),
            agent_ip: agent_ip.into(),
        }
    }
}

/// The sole alerting channel. Implementations must not block the caller;
/// delivery is fire-and-forget.
pub trait Warner: Send + Sync {
    fn warning(&self, warning: WarningData);
}

/// Default sink: structured log lines at `warn` level.
pub struct LogWarner;

impl Warner for LogWarner {
    fn warning(&self, warning: WarningData) {
        tracing::warn!(
            kind = ?warning.kind,
            agent_ip = %warning.agent_ip,
            "{}",
            warning.data
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn warning_constructors_set_kind() {
        let w = WarningData::system("coordinator down", "10.0.0.1");
        assert_eq!(w.kind, WarningKind::System);
        let w = WarningData::task("task 1/a failed", "10.0.0.1");
        assert_eq!(w.kind, WarningKind::Task);
    }

    #[test]
    fn warning_kind_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&WarningKind::System).unwrap(),
            r#""system""#
        );
    }
}
