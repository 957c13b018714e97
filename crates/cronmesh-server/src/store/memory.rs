//! In-memory store backend.
//!
//! Thread-safe, suitable for tests and development deployments. Writes
//! apply immediately; the transaction handle is accepted for interface
//! parity but cannot roll back.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use cronmesh_core::model::{Project, ProjectId, ProjectRelevance, TaskLogEntry};

use super::{
    ProjectStore, StoreError, StoreQuery, StoreResult, StoreTxn, TaskLogStore, TxnProvider,
    selector_matches, value_cmp,
};

#[derive(Default)]
struct Tables {
    logs: Vec<TaskLogEntry>,
    projects: Vec<Project>,
    relevance: Vec<ProjectRelevance>,
}

/// In-memory [`Store`](super::Store).
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self::new())
    }

    pub fn log_count(&self) -> usize {
        self.tables.read().logs.len()
    }
}

/// Apply selectors, ordering, and pagination to JSON-projected rows.
fn run_query<T: serde::Serialize + Clone>(rows: &[T], query: &StoreQuery) -> StoreResult<Vec<T>> {
    let mut selected: Vec<(serde_json::Value, T)> = Vec::new();
    for row in rows {
        let projected = serde_json::to_value(row)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        if query
            .selectors
            .iter()
            .all(|s| selector_matches(&projected, s))
        {
            selected.push((projected, row.clone()));
        }
    }

    if let Some(order) = &query.order {
        let mut parts = order.split_whitespace();
        let field = parts.next().unwrap_or_default().to_string();
        let descending = parts.next().is_some_and(|d| d.eq_ignore_ascii_case("desc"));
        selected.sort_by(|(a, _), (b, _)| {
            let ordering = match (a.get(&field), b.get(&field)) {
                (Some(a), Some(b)) => value_cmp(a, b).unwrap_or(std::cmp::Ordering::Equal),
                _ => std::cmp::Ordering::Equal,
            };
            if descending { ordering.reverse() } else { ordering }
        });
    }

    let rows = selected.into_iter().map(|(_, row)| row);
    Ok(match query.page {
        Some(page) => {
            let skip = page.page.saturating_sub(1).saturating_mul(page.size) as usize;
            rows.skip(skip).take(page.size as usize).collect()
        }
        None => rows.collect(),
    })
}

#[async_trait]
impl TxnProvider for MemoryStore {
    async fn begin(&self) -> StoreResult<StoreTxn> {
        Ok(StoreTxn::noop())
    }
}

#[async_trait]
impl TaskLogStore for MemoryStore {
    async fn insert_log(
        &self,
        _txn: Option<&mut StoreTxn>,
        entry: &TaskLogEntry,
    ) -> StoreResult<()> {
        self.tables.write().logs.push(entry.clone());
        Ok(())
    }

    async fn query_logs(&self, query: &StoreQuery) -> StoreResult<Vec<TaskLogEntry>> {
        run_query(&self.tables.read().logs, query)
    }

    async fn clean_logs_before(
        &self,
        _txn: Option<&mut StoreTxn>,
        cutoff: DateTime<Utc>,
    ) -> StoreResult<u64> {
        let mut tables = self.tables.write();
        let before = tables.logs.len();
        tables.logs.retain(|log| log.start_time >= cutoff);
        Ok((before - tables.logs.len()) as u64)
    }

    async fn clean_project_logs(
        &self,
        _txn: Option<&mut StoreTxn>,
        project: ProjectId,
    ) -> StoreResult<u64> {
        let mut tables = self.tables.write();
        let before = tables.logs.len();
        tables.logs.retain(|log| log.project_id != project);
        Ok((before - tables.logs.len()) as u64)
    }
}

#[async_trait]
impl ProjectStore for MemoryStore {
    async fn create_project(
        &self,
        _txn: Option<&mut StoreTxn>,
        project: &Project,
    ) -> StoreResult<()> {
        let mut tables = self.tables.write();
        if tables.projects.iter().any(|p| p.id == project.id) {
            return Err(StoreError::Internal {
                message: format!("project {} already exists", project.id),
                detail: "duplicate primary key".into(),
            });
        }
        tables.projects.push(project.clone());
        Ok(())
    }

    async fn get_project(&self, id: ProjectId) -> StoreResult<Option<Project>> {
        Ok(self
            .tables
            .read()
            .projects
            .iter()
            .find(|p| p.id == id)
            .cloned())
    }

    async fn list_projects(&self, query: &StoreQuery) -> StoreResult<Vec<Project>> {
        run_query(&self.tables.read().projects, query)
    }

    async fn delete_project(&self, _txn: Option<&mut StoreTxn>, id: ProjectId) -> StoreResult<()> {
        let mut tables = self.tables.write();
        let before = tables.projects.len();
        tables.projects.retain(|p| p.id != id);
        if tables.projects.len() == before {
            return Err(StoreError::NotFound(format!("project {id}")));
        }
        tables.relevance.retain(|r| r.project_id != id);
        Ok(())
    }

    async fn create_relevance(
        &self,
        _txn: Option<&mut StoreTxn>,
        relevance: &ProjectRelevance,
    ) -> StoreResult<()> {
        self.tables.write().relevance.push(relevance.clone());
        Ok(())
    }

    async fn list_relevance(&self, project: ProjectId) -> StoreResult<Vec<ProjectRelevance>> {
        Ok(self
            .tables
            .read()
            .relevance
            .iter()
            .filter(|r| r.project_id == project)
            .cloned()
            .collect())
    }

    async fn delete_relevance(
        &self,
        _txn: Option<&mut StoreTxn>,
        project: ProjectId,
        uid: i64,
    ) -> StoreResult<()> {
        self.tables
            .write()
            .relevance
            .retain(|r| !(r.project_id == project && r.uid == uid));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Selector, remove_project};
    use chrono::Duration;

    fn log(project: ProjectId, task: &str, age_days: i64) -> TaskLogEntry {
        let start = Utc::now() - Duration::days(age_days);
        TaskLogEntry {
            project_id: project,
            task_id: task.into(),
            start_time: start,
            end_time: start + Duration::seconds(1),
            result: "ok".into(),
            with_error: false,
            client_ip: "10.0.0.1".into(),
        }
    }

    #[tokio::test]
    async fn insert_and_filter_by_selector() {
        let store = MemoryStore::new();
        store.insert_log(None, &log(1, "a", 0)).await.unwrap();
        store.insert_log(None, &log(1, "b", 0)).await.unwrap();
        store.insert_log(None, &log(2, "a", 0)).await.unwrap();

        let query = StoreQuery::new().filter(Selector::equals("project_id", 1));
        assert_eq!(store.query_logs(&query).await.unwrap().len(), 2);

        let query = StoreQuery::new()
            .filter(Selector::equals("project_id", 1))
            .filter(Selector::equals("task_id", "a"));
        assert_eq!(store.query_logs(&query).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn ordering_and_pagination() {
        let store = MemoryStore::new();
        for age in [3, 1, 2] {
            store.insert_log(None, &log(1, "t", age)).await.unwrap();
        }
        let query = StoreQuery::new().ordered("start_time desc").paged(1, 2);
        let rows = store.query_logs(&query).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows[0].start_time > rows[1].start_time);

        let second_page = StoreQuery::new().ordered("start_time desc").paged(2, 2);
        assert_eq!(store.query_logs(&second_page).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn clean_logs_before_cutoff() {
        let store = MemoryStore::new();
        for _ in 0..10 {
            store.insert_log(None, &log(1, "old", 8)).await.unwrap();
        }
        for _ in 0..10 {
            store.insert_log(None, &log(1, "new", 1)).await.unwrap();
        }
        let removed = store
            .clean_logs_before(None, Utc::now() - Duration::days(7))
            .await
            .unwrap();
        assert_eq!(removed, 10);
        assert_eq!(store.log_count(), 10);
        let remaining = store.query_logs(&StoreQuery::new()).await.unwrap();
        assert!(remaining.iter().all(|l| l.task_id == "new"));
    }

    #[tokio::test]
    async fn project_crud_and_cascade() {
        let store = MemoryStore::new();
        store
            .create_project(
                None,
                &Project {
                    id: 1,
                    title: "ops".into(),
                    remark: String::new(),
                    owner_uid: 7,
                },
            )
            .await
            .unwrap();
        store.insert_log(None, &log(1, "a", 0)).await.unwrap();
        store.insert_log(None, &log(2, "b", 0)).await.unwrap();

        assert!(store.get_project(1).await.unwrap().is_some());
        let removed = remove_project(&store, 1).await.unwrap();
        assert_eq!(removed, 1);
        assert!(store.get_project(1).await.unwrap().is_none());
        // The other project's logs are untouched.
        assert_eq!(store.log_count(), 1);
    }

    #[tokio::test]
    async fn delete_of_missing_project_is_not_found() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.delete_project(None, 42).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn relevance_membership_round_trip() {
        let store = MemoryStore::new();
        let edge = ProjectRelevance {
            project_id: 1,
            uid: 9,
            create_time: Utc::now(),
        };
        store.create_relevance(None, &edge).await.unwrap();
        assert_eq!(store.list_relevance(1).await.unwrap().len(), 1);
        store.delete_relevance(None, 1, 9).await.unwrap();
        assert!(store.list_relevance(1).await.unwrap().is_empty());
    }
}
