//! Direct-store result sink.
//!
//! The control-plane counterpart of the agent's HTTP reporter: results
//! insert straight into the task log. Used by the collector endpoint's
//! process and by embedded single-process deployments where agent and
//! control plane share a store.

use std::sync::Arc;

use async_trait::async_trait;

use cronmesh_core::model::{TaskLogEntry, TaskRunResult};
use cronmesh_core::report::{ReportError, ResultReport};

use crate::store::TaskLogStore;

pub struct StoreReporter {
    logs: Arc<dyn TaskLogStore>,
}

impl StoreReporter {
    pub fn new(logs: Arc<dyn TaskLogStore>) -> Self {
        Self { logs }
    }
}

#[async_trait]
impl ResultReport for StoreReporter {
    async fn report(&self, result: &TaskRunResult) -> Result<(), ReportError> {
        let entry = TaskLogEntry::from(result.clone());
        self.logs
            .insert_log(None, &entry)
            .await
            .map_err(|e| ReportError::Store(e.to_string()))
    }
}
