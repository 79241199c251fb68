//! Asynchronous answer service.
//!
//! Each request is tracked by a query id whose status moves through
//! `fetching`, `generating` and finally `finished` or `failed`. SQL
//! execution and answer generation run in background tasks; callers poll
//! [`SqlAnswerService::get_result`] or read tokens from
//! [`SqlAnswerService::get_streaming_result`] while the answer is being
//! generated. Records live in a bounded `moka` cache, so an id that is not
//! updated again disappears after the configured TTL.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::stream::{self, BoxStream, StreamExt};
use moka::sync::Cache;
use serde::{Deserialize, Deserializer, Serialize};
use tokio::task::AbortHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::answer::SqlAnswer;
use crate::broker::StreamingBroker;
use crate::config::{CacheConfig, Config};
use crate::error::Error;
use crate::llm::create_generator;
use crate::sql_executor::{create_sql_executor, SqlExecutor};

fn default_language() -> String {
    "English".to_string()
}

fn null_as_default<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SqlAnswerConfigurations {
    #[serde(default = "default_language")]
    pub language: String,
}

impl Default for SqlAnswerConfigurations {
    fn default() -> Self {
        Self {
            language: default_language(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SqlAnswerRequest {
    pub query: String,
    pub sql: String,
    pub sql_summary: String,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub thread_id: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub configurations: SqlAnswerConfigurations,
}

impl SqlAnswerRequest {
    pub fn new(
        query: impl Into<String>,
        sql: impl Into<String>,
        sql_summary: impl Into<String>,
    ) -> Self {
        Self {
            query: query.into(),
            sql: sql.into(),
            sql_summary: sql_summary.into(),
            project_id: None,
            thread_id: None,
            user_id: None,
            configurations: SqlAnswerConfigurations::default(),
        }
    }

    /// Scope passed to the SQL engine: the project, else the thread.
    pub fn scope(&self) -> Option<&str> {
        self.project_id.as_deref().or(self.thread_id.as_deref())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnswerStatus {
    Fetching,
    Generating,
    Finished,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    Others,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SqlAnswerError {
    pub code: ErrorCode,
    pub message: String,
}

/// Status record returned to pollers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SqlAnswerResultResponse {
    pub status: AnswerStatus,
    pub response: Option<String>,
    pub error: Option<SqlAnswerError>,
}

impl SqlAnswerResultResponse {
    fn with_status(status: AnswerStatus) -> Self {
        Self {
            status,
            response: None,
            error: None,
        }
    }

    fn finished(answer: String) -> Self {
        Self {
            status: AnswerStatus::Finished,
            response: Some(answer),
            error: None,
        }
    }

    fn failed(message: impl Into<String>) -> Self {
        Self {
            status: AnswerStatus::Failed,
            response: None,
            error: Some(SqlAnswerError {
                code: ErrorCode::Others,
                message: message.into(),
            }),
        }
    }

    fn is_running(&self) -> bool {
        matches!(
            self.status,
            AnswerStatus::Fetching | AnswerStatus::Generating
        )
    }
}

#[derive(Clone)]
struct Record {
    result: SqlAnswerResultResponse,
    task: Option<AbortHandle>,
}

pub struct SqlAnswerService {
    sql_answer: Arc<SqlAnswer>,
    sql_executor: Arc<dyn SqlExecutor>,
    results: Cache<String, Record>,
    /// Serializes read-modify-write sequences on `results`.
    writes: Mutex<()>,
}

impl SqlAnswerService {
    pub fn new(
        sql_answer: Arc<SqlAnswer>,
        sql_executor: Arc<dyn SqlExecutor>,
        cache: &CacheConfig,
    ) -> Self {
        Self {
            sql_answer,
            sql_executor,
            results: Cache::builder()
                .max_capacity(cache.maxsize as u64)
                .time_to_live(Duration::from_secs(cache.ttl_secs))
                .build(),
            writes: Mutex::new(()),
        }
    }

    /// Service wired from `config`: generator, SQL engine and cache limits.
    pub async fn from_config(config: &Config) -> anyhow::Result<Self> {
        let generator = create_generator(&config.llm)?;
        let sql_answer = SqlAnswer::new(generator, Arc::new(StreamingBroker::new()))?;
        let sql_executor = create_sql_executor(&config.engine).await?;
        Ok(Self::new(Arc::new(sql_answer), sql_executor, &config.cache))
    }

    fn writes(&self) -> MutexGuard<'_, ()> {
        self.writes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, query_id: &str, result: SqlAnswerResultResponse) {
        let _writes = self.writes();
        self.results
            .insert(query_id.to_string(), Record { result, task: None });
    }

    /// Start answering `request` in the background and return its query id.
    pub fn submit(self: &Arc<Self>, request: SqlAnswerRequest) -> String {
        let query_id = Uuid::new_v4().to_string();
        let service = self.clone();
        let id = query_id.clone();

        // The record must exist before the task can overwrite it.
        let writes = self.writes();
        let task = tokio::spawn(async move { service.fetch_and_generate(request, &id).await });
        self.results.insert(
            query_id.clone(),
            Record {
                result: SqlAnswerResultResponse::with_status(AnswerStatus::Fetching),
                task: Some(task.abort_handle()),
            },
        );
        drop(writes);

        info!(%query_id, "sql answer submitted");
        query_id
    }

    /// Fetch data for `request` under `query_id` and start generating its
    /// answer. Returns once generation has been spawned or fetching failed.
    pub async fn sql_answer(self: &Arc<Self>, request: SqlAnswerRequest, query_id: &str) {
        self.record(
            query_id,
            SqlAnswerResultResponse::with_status(AnswerStatus::Fetching),
        );
        self.fetch_and_generate(request, query_id).await;
    }

    async fn fetch_and_generate(self: &Arc<Self>, request: SqlAnswerRequest, query_id: &str) {
        let sql_data = match self
            .sql_executor
            .execute(&request.sql, request.scope())
            .await
        {
            Ok(sql_data) => sql_data,
            Err(e) => {
                warn!(%query_id, error = %e, "SQL execution failed");
                self.record(query_id, SqlAnswerResultResponse::failed(format!("{e:#}")));
                return;
            }
        };

        let service = self.clone();
        let id = query_id.to_string();
        let _writes = self.writes();
        if self
            .results
            .get(query_id)
            .is_some_and(|record| !record.result.is_running())
        {
            info!(%query_id, "request cancelled while fetching");
            return;
        }
        let task = tokio::spawn(async move { service.generate(request, sql_data, &id).await });
        self.results.insert(
            query_id.to_string(),
            Record {
                result: SqlAnswerResultResponse::with_status(AnswerStatus::Generating),
                task: Some(task.abort_handle()),
            },
        );
    }

    async fn generate(&self, request: SqlAnswerRequest, sql_data: serde_json::Value, query_id: &str) {
        let outcome = self
            .sql_answer
            .run(
                &request.query,
                &request.sql,
                &request.sql_summary,
                sql_data,
                &request.configurations.language,
                Some(query_id),
            )
            .await;

        let result = match outcome {
            Ok(answer) if answer.error.is_empty() => {
                info!(%query_id, "sql answer finished");
                SqlAnswerResultResponse::finished(answer.answer)
            }
            Ok(answer) => {
                warn!(%query_id, error = %answer.error, "answer post-processing failed");
                SqlAnswerResultResponse::failed(answer.error)
            }
            Err(e) => {
                warn!(%query_id, error = %e, "answer generation failed");
                SqlAnswerResultResponse::failed(e.to_string())
            }
        };
        self.record(query_id, result);
        self.sql_answer.close_stream(query_id);
    }

    /// Current record for `query_id`; unknown or expired ids yield a failed
    /// record.
    pub fn get_result(&self, query_id: &str) -> SqlAnswerResultResponse {
        match self.results.get(query_id) {
            Some(record) => record.result.clone(),
            None => {
                SqlAnswerResultResponse::failed(Error::NotFound(query_id.to_string()).to_string())
            }
        }
    }

    /// Generated tokens for `query_id`. Empty unless the answer is currently
    /// being generated.
    pub fn get_streaming_result(&self, query_id: &str) -> BoxStream<'static, String> {
        // Held while attaching so completion cannot drop the queue in between.
        let _writes = self.writes();
        match self.results.get(query_id) {
            Some(record) if record.result.status == AnswerStatus::Generating => {
                self.sql_answer.get_streaming_results(query_id)
            }
            _ => stream::empty().boxed(),
        }
    }

    /// Abort the work for `query_id`. Requests still running are recorded as
    /// failed with the message "cancelled"; completed ones keep their record.
    pub fn cancel(&self, query_id: &str) -> crate::error::Result<()> {
        let writes = self.writes();
        let mut record = self
            .results
            .get(query_id)
            .ok_or_else(|| Error::NotFound(query_id.to_string()))?;
        if record.task.is_some() || record.result.is_running() {
            if let Some(task) = record.task.take() {
                task.abort();
            }
            if record.result.is_running() {
                record.result = SqlAnswerResultResponse::failed("cancelled");
            }
            self.results.insert(query_id.to_string(), record);
        }
        drop(writes);

        self.sql_answer.close_stream(query_id);
        info!(%query_id, "sql answer cancelled");
        Ok(())
    }
}
