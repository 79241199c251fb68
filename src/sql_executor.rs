//! SQL execution stage that feeds result rows to answer generation.
//!
//! Results use one shape regardless of backend:
//!
//! ```json
//! {"results": {"columns": ["name", "total"], "data": [["alice", 3]]}}
//! ```

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use futures::TryStreamExt;
use serde_json::{json, Value};
use sqlx::sqlite::SqliteRow;
use sqlx::{Column, Executor, Row, SqlitePool, Statement, TypeInfo, ValueRef};
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::db::connect_path;

#[async_trait]
pub trait SqlExecutor: Send + Sync {
    /// Run `sql` for `project_id` and return its result set.
    async fn execute(&self, sql: &str, project_id: Option<&str>) -> Result<Value>;
}

/// Result set with the given columns and rows.
pub fn results(columns: Vec<String>, data: Vec<Vec<Value>>) -> Value {
    json!({"results": {"columns": columns, "data": data}})
}

/// Executor used when no engine is configured: every query yields an empty
/// result set.
pub struct NoDataExecutor;

#[async_trait]
impl SqlExecutor for NoDataExecutor {
    async fn execute(&self, sql: &str, _project_id: Option<&str>) -> Result<Value> {
        warn!(%sql, "no SQL engine configured; answering without data");
        Ok(results(Vec::new(), Vec::new()))
    }
}

/// Runs queries against a SQLite file opened read-only, returning at most
/// `row_limit` rows.
pub struct SqliteSqlExecutor {
    pool: SqlitePool,
    row_limit: usize,
}

impl SqliteSqlExecutor {
    pub async fn open(path: &Path, row_limit: usize) -> Result<Self> {
        Ok(Self {
            pool: connect_path(path, false).await?,
            row_limit,
        })
    }
}

#[async_trait]
impl SqlExecutor for SqliteSqlExecutor {
    async fn execute(&self, sql: &str, project_id: Option<&str>) -> Result<Value> {
        debug!(%sql, project_id = project_id.unwrap_or("-"), "executing SQL");

        let mut columns: Option<Vec<String>> = None;
        let mut data = Vec::new();
        let mut rows = sqlx::query(sql).fetch(&self.pool);
        while let Some(row) = rows.try_next().await? {
            if columns.is_none() {
                columns = Some(row.columns().iter().map(|c| c.name().to_string()).collect());
            }
            data.push(row_values(&row)?);
            if data.len() >= self.row_limit {
                break;
            }
        }
        drop(rows);

        let columns = match columns {
            Some(columns) => columns,
            None => (&self.pool)
                .prepare(sql)
                .await?
                .columns()
                .iter()
                .map(|c| c.name().to_string())
                .collect(),
        };
        Ok(results(columns, data))
    }
}

fn row_values(row: &SqliteRow) -> Result<Vec<Value>> {
    (0..row.len()).map(|i| cell(row, i)).collect()
}

fn cell(row: &SqliteRow, i: usize) -> Result<Value> {
    let kind = {
        let raw = row.try_get_raw(i)?;
        if raw.is_null() {
            return Ok(Value::Null);
        }
        raw.type_info().name().to_string()
    };
    Ok(match kind.as_str() {
        "INTEGER" | "BOOLEAN" => Value::from(row.try_get::<i64, _>(i)?),
        "REAL" => Value::from(row.try_get::<f64, _>(i)?),
        "BLOB" => Value::String(format!("<{} bytes>", row.try_get::<Vec<u8>, _>(i)?.len())),
        _ => Value::String(row.try_get::<String, _>(i)?),
    })
}

/// Executor for `[engine]`: SQLite when `data_path` is set, otherwise
/// [`NoDataExecutor`].
pub async fn create_sql_executor(config: &EngineConfig) -> Result<Arc<dyn SqlExecutor>> {
    match &config.data_path {
        Some(path) => Ok(Arc::new(
            SqliteSqlExecutor::open(path, config.row_limit).await?,
        )),
        None => Ok(Arc::new(NoDataExecutor)),
    }
}
