//! MySQL/MariaDB store backend (`mysql` cargo feature).

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use sqlx::Row;
use sqlx::mysql::{MySqlArguments, MySqlPool, MySqlPoolOptions, MySqlRow};

use cronmesh_core::model::{Project, ProjectId, ProjectRelevance, TaskLogEntry};

use super::{
    FieldOp, ProjectStore, Selector, StoreError, StoreQuery, StoreResult, StoreTxn, TaskLogStore,
    TxnProvider,
};

/// Columns selectors may reference, per table.
const TASK_LOG_FIELDS: &[&str] = &[
    "project_id",
    "task_id",
    "start_time",
    "end_time",
    "with_error",
    "client_ip",
];
const PROJECT_FIELDS: &[&str] = &["id", "title", "remark", "owner_uid"];

/// MySQL [`Store`](super::Store).
pub struct MySqlStore {
    pool: MySqlPool,
}

impl MySqlStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> StoreResult<Self> {
        let pool = MySqlPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: MySqlPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &MySqlPool {
        &self.pool
    }

    /// Create the schema if it does not exist yet.
    pub async fn migrate(&self) -> StoreResult<()> {
        let statements = [
            r#"CREATE TABLE IF NOT EXISTS task_log (
                id BIGINT NOT NULL AUTO_INCREMENT,
                project_id BIGINT NOT NULL,
                task_id VARCHAR(128) NOT NULL,
                start_time DATETIME(3) NOT NULL,
                end_time DATETIME(3) NOT NULL,
                result MEDIUMTEXT NOT NULL,
                with_error TINYINT NOT NULL DEFAULT 0,
                client_ip VARCHAR(64) NOT NULL DEFAULT '',
                PRIMARY KEY (id),
                KEY idx_project_task (project_id, task_id),
                KEY idx_start_time (start_time)
            )"#,
            r#"CREATE TABLE IF NOT EXISTS project (
                id BIGINT NOT NULL,
                title VARCHAR(255) NOT NULL,
                remark TEXT,
                owner_uid BIGINT NOT NULL,
                PRIMARY KEY (id)
            )"#,
            r#"CREATE TABLE IF NOT EXISTS project_relevance (
                project_id BIGINT NOT NULL,
                uid BIGINT NOT NULL,
                create_time DATETIME(3) NOT NULL,
                PRIMARY KEY (project_id, uid)
            )"#,
        ];
        for statement in statements {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| StoreError::Internal {
                    message: "migration failed".into(),
                    detail: e.to_string(),
                })?;
        }
        Ok(())
    }

    async fn run(
        &self,
        txn: Option<&mut StoreTxn>,
        query: sqlx::query::Query<'_, sqlx::MySql, MySqlArguments>,
    ) -> StoreResult<sqlx::mysql::MySqlQueryResult> {
        let result = match txn {
            Some(txn) => query.execute(&mut **txn.as_mysql()?).await,
            None => query.execute(&self.pool).await,
        };
        result.map_err(|e| StoreError::Query(e.to_string()))
    }
}

fn parse_log_row(row: &MySqlRow) -> StoreResult<TaskLogEntry> {
    Ok(TaskLogEntry {
        project_id: get(row, "project_id")?,
        task_id: get(row, "task_id")?,
        start_time: get_time(row, "start_time")?,
        end_time: get_time(row, "end_time")?,
        result: get(row, "result")?,
        with_error: get::<i8>(row, "with_error")? != 0,
        client_ip: get(row, "client_ip")?,
    })
}

fn parse_project_row(row: &MySqlRow) -> StoreResult<Project> {
    Ok(Project {
        id: get(row, "id")?,
        title: get(row, "title")?,
        remark: get::<Option<String>>(row, "remark")?.unwrap_or_default(),
        owner_uid: get(row, "owner_uid")?,
    })
}

fn get<'r, T: sqlx::Decode<'r, sqlx::MySql> + sqlx::Type<sqlx::MySql>>(
    row: &'r MySqlRow,
    column: &str,
) -> StoreResult<T> {
    row.try_get(column)
        .map_err(|e| StoreError::Query(e.to_string()))
}

fn get_time(row: &MySqlRow, column: &str) -> StoreResult<DateTime<Utc>> {
    let naive: NaiveDateTime = get(row, column)?;
    Ok(DateTime::from_naive_utc_and_offset(naive, Utc))
}

/// A value ready to bind. Strings that parse as RFC 3339 are converted to
/// naive timestamps so range selectors over DATETIME columns compare
/// correctly.
enum Bind {
    Int(i64),
    Float(f64),
    Bool(bool),
    Text(String),
    Time(NaiveDateTime),
}

fn to_bind(value: &serde_json::Value) -> Bind {
    if let Some(n) = value.as_i64() {
        return Bind::Int(n);
    }
    if let Some(f) = value.as_f64() {
        return Bind::Float(f);
    }
    if let Some(b) = value.as_bool() {
        return Bind::Bool(b);
    }
    let text = value.as_str().map(str::to_string).unwrap_or_else(|| value.to_string());
    match DateTime::parse_from_rfc3339(&text) {
        Ok(ts) => Bind::Time(ts.naive_utc()),
        Err(_) => Bind::Text(text),
    }
}

fn push_bind<'q>(
    query: sqlx::query::Query<'q, sqlx::MySql, MySqlArguments>,
    bind: Bind,
) -> sqlx::query::Query<'q, sqlx::MySql, MySqlArguments> {
    match bind {
        Bind::Int(v) => query.bind(v),
        Bind::Float(v) => query.bind(v),
        Bind::Bool(v) => query.bind(v),
        Bind::Text(v) => query.bind(v),
        Bind::Time(v) => query.bind(v),
    }
}

/// Render `WHERE`/`ORDER BY`/`LIMIT` for a [`StoreQuery`], returning the
/// SQL tail and the binds in order. Fields are checked against the
/// table's whitelist, which also keeps selector input out of the SQL
/// text.
fn render_query(query: &StoreQuery, allowed: &[&str]) -> StoreResult<(String, Vec<Bind>)> {
    let mut sql = String::new();
    let mut binds = Vec::new();

    for (i, selector) in query.selectors.iter().enumerate() {
        if !allowed.contains(&selector.field.as_str()) {
            return Err(StoreError::UnknownField(selector.field.clone()));
        }
        sql.push_str(if i == 0 { " WHERE " } else { " AND " });
        match selector.op {
            FieldOp::Equals => {
                sql.push_str(&format!("{} = ?", selector.field));
                binds.push(to_bind(&selector.value));
            }
            FieldOp::In => {
                let values = selector.value.as_array().cloned().unwrap_or_default();
                if values.is_empty() {
                    sql.push_str("1 = 0");
                } else {
                    let marks = vec!["?"; values.len()].join(", ");
                    sql.push_str(&format!("{} IN ({marks})", selector.field));
                    binds.extend(values.iter().map(to_bind));
                }
            }
            FieldOp::FindIn => {
                sql.push_str(&format!("FIND_IN_SET(?, {})", selector.field));
                binds.push(to_bind(&selector.value));
            }
            FieldOp::Like => {
                sql.push_str(&format!("{} LIKE ?", selector.field));
                binds.push(to_bind(&selector.value));
            }
            FieldOp::GreaterThan => {
                sql.push_str(&format!("{} > ?", selector.field));
                binds.push(to_bind(&selector.value));
            }
            FieldOp::LessThan => {
                sql.push_str(&format!("{} < ?", selector.field));
                binds.push(to_bind(&selector.value));
            }
        }
    }

    if let Some(order) = &query.order {
        let mut parts = order.split_whitespace();
        let field = parts.next().unwrap_or_default();
        if !allowed.contains(&field) {
            return Err(StoreError::UnknownField(field.to_string()));
        }
        let direction = match parts.next() {
            Some(d) if d.eq_ignore_ascii_case("desc") => "DESC",
            _ => "ASC",
        };
        sql.push_str(&format!(" ORDER BY {field} {direction}"));
    }

    if let Some(page) = query.page {
        let offset = page.page.saturating_sub(1).saturating_mul(page.size);
        sql.push_str(&format!(" LIMIT {} OFFSET {offset}", page.size));
    }

    Ok((sql, binds))
}

#[async_trait]
impl TxnProvider for MySqlStore {
    async fn begin(&self) -> StoreResult<StoreTxn> {
        let txn = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        Ok(StoreTxn::mysql(txn))
    }
}

#[async_trait]
impl TaskLogStore for MySqlStore {
    async fn insert_log(
        &self,
        txn: Option<&mut StoreTxn>,
        entry: &TaskLogEntry,
    ) -> StoreResult<()> {
        let query = sqlx::query(
            "INSERT INTO task_log \
             (project_id, task_id, start_time, end_time, result, with_error, client_ip) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(entry.project_id)
        .bind(&entry.task_id)
        .bind(entry.start_time.naive_utc())
        .bind(entry.end_time.naive_utc())
        .bind(&entry.result)
        .bind(entry.with_error as i8)
        .bind(&entry.client_ip);
        self.run(txn, query).await?;
        Ok(())
    }

    async fn query_logs(&self, query: &StoreQuery) -> StoreResult<Vec<TaskLogEntry>> {
        let (tail, binds) = render_query(query, TASK_LOG_FIELDS)?;
        let sql = format!(
            "SELECT project_id, task_id, start_time, end_time, result, with_error, client_ip \
             FROM task_log{tail}"
        );
        let mut q = sqlx::query(&sql);
        for bind in binds {
            q = push_bind(q, bind);
        }
        let rows = q
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;
        rows.iter().map(parse_log_row).collect()
    }

    async fn clean_logs_before(
        &self,
        txn: Option<&mut StoreTxn>,
        cutoff: DateTime<Utc>,
    ) -> StoreResult<u64> {
        let query =
            sqlx::query("DELETE FROM task_log WHERE start_time < ?").bind(cutoff.naive_utc());
        Ok(self.run(txn, query).await?.rows_affected())
    }

    async fn clean_project_logs(
        &self,
        txn: Option<&mut StoreTxn>,
        project: ProjectId,
    ) -> StoreResult<u64> {
        let query = sqlx::query("DELETE FROM task_log WHERE project_id = ?").bind(project);
        Ok(self.run(txn, query).await?.rows_affected())
    }
}

#[async_trait]
impl ProjectStore for MySqlStore {
    async fn create_project(
        &self,
        txn: Option<&mut StoreTxn>,
        project: &Project,
    ) -> StoreResult<()> {
        let query = sqlx::query(
            "INSERT INTO project (id, title, remark, owner_uid) VALUES (?, ?, ?, ?)",
        )
        .bind(project.id)
        .bind(&project.title)
        .bind(&project.remark)
        .bind(project.owner_uid);
        self.run(txn, query).await?;
        Ok(())
    }

    async fn get_project(&self, id: ProjectId) -> StoreResult<Option<Project>> {
        let row = sqlx::query("SELECT id, title, remark, owner_uid FROM project WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;
        row.as_ref().map(parse_project_row).transpose()
    }

    async fn list_projects(&self, query: &StoreQuery) -> StoreResult<Vec<Project>> {
        let (tail, binds) = render_query(query, PROJECT_FIELDS)?;
        let sql = format!("SELECT id, title, remark, owner_uid FROM project{tail}");
        let mut q = sqlx::query(&sql);
        for bind in binds {
            q = push_bind(q, bind);
        }
        let rows = q
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;
        rows.iter().map(parse_project_row).collect()
    }

    async fn delete_project(&self, txn: Option<&mut StoreTxn>, id: ProjectId) -> StoreResult<()> {
        let query = sqlx::query("DELETE FROM project WHERE id = ?").bind(id);
        if self.run(txn, query).await?.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("project {id}")));
        }
        Ok(())
    }

    async fn create_relevance(
        &self,
        txn: Option<&mut StoreTxn>,
        relevance: &ProjectRelevance,
    ) -> StoreResult<()> {
        let query = sqlx::query(
            "INSERT INTO project_relevance (project_id, uid, create_time) VALUES (?, ?, ?)",
        )
        .bind(relevance.project_id)
        .bind(relevance.uid)
        .bind(relevance.create_time.naive_utc());
        self.run(txn, query).await?;
        Ok(())
    }

    async fn list_relevance(&self, project: ProjectId) -> StoreResult<Vec<ProjectRelevance>> {
        let rows = sqlx::query(
            "SELECT project_id, uid, create_time FROM project_relevance WHERE project_id = ?",
        )
        .bind(project)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;
        rows.iter()
            .map(|row| {
                Ok(ProjectRelevance {
                    project_id: get(row, "project_id")?,
                    uid: get(row, "uid")?,
                    create_time: get_time(row, "create_time")?,
                })
            })
            .collect()
    }

    async fn delete_relevance(
        &self,
        txn: Option<&mut StoreTxn>,
        project: ProjectId,
        uid: i64,
    ) -> StoreResult<()> {
        let query = sqlx::query("DELETE FROM project_relevance WHERE project_id = ? AND uid = ?")
            .bind(project)
            .bind(uid);
        self.run(txn, query).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn render_rejects_unknown_fields() {
        let query = StoreQuery::new().filter(Selector::equals("password", "x"));
        assert!(matches!(
            render_query(&query, TASK_LOG_FIELDS),
            Err(StoreError::UnknownField(_))
        ));
    }

    #[test]
    fn render_composes_where_order_and_limit() {
        let query = StoreQuery::new()
            .filter(Selector::equals("project_id", 1))
            .filter(Selector::is_in("task_id", vec![json!("a"), json!("b")]))
            .ordered("start_time desc")
            .paged(3, 10);
        let (sql, binds) = render_query(&query, TASK_LOG_FIELDS).unwrap();
        assert_eq!(
            sql,
            " WHERE project_id = ? AND task_id IN (?, ?) ORDER BY start_time DESC LIMIT 10 OFFSET 20"
        );
        assert_eq!(binds.len(), 3);
    }

    #[test]
    fn empty_in_matches_nothing() {
        let query = StoreQuery::new().filter(Selector::is_in("task_id", vec![]));
        let (sql, binds) = render_query(&query, TASK_LOG_FIELDS).unwrap();
        assert_eq!(sql, " WHERE 1 = 0");
        assert!(binds.is_empty());
    }

    #[test]
    fn rfc3339_strings_bind_as_timestamps() {
        assert!(matches!(
            to_bind(&json!("2026-07-01T00:00:00Z")),
            Bind::Time(_)
        ));
        assert!(matches!(to_bind(&json!("plain text")), Bind::Text(_)));
        assert!(matches!(to_bind(&json!(42)), Bind::Int(42)));
    }
}
