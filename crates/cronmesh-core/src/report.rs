//! The reporter contract — where execution results go.
//!
//! Agents emit one [`TaskRunResult`](crate::model::TaskRunResult) per fire.
//! Two sinks exist: an HTTP collector (agent side, `cronmesh-agent`) and
//! direct insertion into the task log store (control-plane side,
//! `cronmesh-server`). Both implement this trait so the executor does not
//! care which one it was wired with.

use async_trait::async_trait;

use crate::model::TaskRunResult;

/// Errors delivering a result.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ReportError {
    /// Connection-level failure; retryable with backoff.
    #[error("report transport failed: {0}")]
    Transport(String),

    /// The sink understood the request and refused it; retrying the same
    /// payload will not help.
    #[error("report rejected with status {0}")]
    Rejected(u16),

    /// Store-side failure when writing directly into the task log.
    #[error("report store failed: {0}")]
    Store(String),
}

impl ReportError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ReportError::Transport(_) | ReportError::Store(_))
    }
}

/// A sink for execution results.
#[async_trait]
pub trait ResultReport: Send + Sync {
    async fn report(&self, result: &TaskRunResult) -> Result<(), ReportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_errors_are_retryable() {
        assert!(ReportError::Transport("refused".into()).is_retryable());
        assert!(!ReportError::Rejected(400).is_retryable());
    }
}
