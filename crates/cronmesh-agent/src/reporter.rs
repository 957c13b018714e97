//! HTTP result reporter — posts run results to the control-plane
//! collector.

use async_trait::async_trait;

use cronmesh_core::model::TaskRunResult;
use cronmesh_core::report::{ReportError, ResultReport};

/// JSON-posts each result to `<base>/api/v1/result`.
pub struct HttpReporter {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpReporter {
    pub fn new(base_addr: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: format!("{}/api/v1/result", base_addr.trim_end_matches('/')),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl ResultReport for HttpReporter {
    async fn report(&self, result: &TaskRunResult) -> Result<(), ReportError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(result)
            .send()
            .await
            .map_err(|e| ReportError::Transport(e.to_string()))?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(ReportError::Rejected(response.status().as_u16()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_is_normalized() {
        assert_eq!(
            HttpReporter::new("http://cron:6306/").endpoint(),
            "http://cron:6306/api/v1/result"
        );
        assert_eq!(
            HttpReporter::new("http://cron:6306").endpoint(),
            "http://cron:6306/api/v1/result"
        );
    }

    #[tokio::test]
    async fn unreachable_collector_is_a_transport_error() {
        let reporter = HttpReporter::new("http://127.0.0.1:1");
        let result = TaskRunResult {
            project_id: 1,
            task_id: "a".into(),
            start_time: chrono::Utc::now(),
            end_time: chrono::Utc::now(),
            output: String::new(),
            error: None,
            client_ip: "127.0.0.1".into(),
        };
        let err = reporter.report(&result).await.unwrap_err();
        assert!(matches!(err, ReportError::Transport(_)));
        assert!(err.is_retryable());
    }
}
