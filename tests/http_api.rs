//! End-to-end tests for the HTTP API, served on a real socket with a
//! scripted generator standing in for the LLM.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use text2sql_harness::answer::SqlAnswer;
use text2sql_harness::broker::StreamingBroker;
use text2sql_harness::config::CacheConfig;
use text2sql_harness::embedding::DisabledEmbedder;
use text2sql_harness::indexing::{Indexing, IndexingStores};
use text2sql_harness::llm::{GenerateOptions, Generator, GeneratorOutput, StreamingChunk};
use text2sql_harness::server::{router, AppState};
use text2sql_harness::service::SqlAnswerService;
use text2sql_harness::sql_executor::{results, SqlExecutor};
use tokio::sync::Notify;

const HEAD: &str = r#"{"reasoning": "one row with n = 3", "#;
const TAIL: &str = r#""answer": "There are **3** orders."}"#;

// ─── Fakes ──────────────────────────────────────────────────────────

struct CountExecutor;

#[async_trait]
impl SqlExecutor for CountExecutor {
    async fn execute(&self, _sql: &str, _project_id: Option<&str>) -> Result<Value> {
        Ok(results(vec!["n".to_string()], vec![vec![json!(3)]]))
    }
}

/// Streams the first half of its reply, then waits to be released.
struct GatedGenerator {
    gate: Notify,
}

#[async_trait]
impl Generator for GatedGenerator {
    fn model_name(&self) -> &str {
        "gated"
    }

    async fn run(&self, _prompt: &str, options: GenerateOptions) -> Result<GeneratorOutput> {
        let emit = |content: &str, finish_reason: Option<String>| {
            if let (Some(callback), Some(id)) = (&options.streaming_callback, &options.query_id) {
                callback(
                    StreamingChunk {
                        content: content.to_string(),
                        finish_reason,
                    },
                    id.as_str(),
                );
            }
        };
        emit(HEAD, None);
        self.gate.notified().await;
        emit(TAIL, Some("stop".to_string()));
        Ok(GeneratorOutput {
            replies: vec![format!("{HEAD}{TAIL}")],
        })
    }
}

// ─── Harness ────────────────────────────────────────────────────────

struct TestServer {
    base: String,
    client: reqwest::Client,
    generator: Arc<GatedGenerator>,
}

async fn start_server() -> TestServer {
    let generator = Arc::new(GatedGenerator {
        gate: Notify::new(),
    });
    let sql_answer = SqlAnswer::new(generator.clone(), Arc::new(StreamingBroker::new())).unwrap();
    let service = SqlAnswerService::new(
        Arc::new(sql_answer),
        Arc::new(CountExecutor),
        &CacheConfig::default(),
    );
    let indexing = Indexing::new(Arc::new(DisabledEmbedder), IndexingStores::in_memory(), 50).unwrap();
    let app = router(AppState::new(Arc::new(service), Arc::new(indexing)));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

    TestServer {
        base: format!("http://{}", addr),
        client: reqwest::Client::new(),
        generator,
    }
}

impl TestServer {
    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    async fn submit(&self) -> String {
        let resp = self
            .client
            .post(self.url("/v1/sql-answers"))
            .json(&json!({
                "query": "How many orders are there?",
                "sql": "SELECT count(*) AS n FROM orders",
                "sql_summary": "Counts all orders",
                "configurations": {"language": "English"}
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let body: Value = resp.json().await.unwrap();
        body["query_id"].as_str().unwrap().to_string()
    }

    async fn result(&self, query_id: &str) -> Value {
        self.client
            .get(self.url(&format!("/v1/sql-answers/{}/result", query_id)))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap()
    }

    async fn wait_for(&self, query_id: &str, status: &str) -> Value {
        for _ in 0..200 {
            let body = self.result(query_id).await;
            if body["status"] == status {
                return body;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("{} never reached status {}", query_id, status);
    }
}

fn sse_messages(body: &str) -> Vec<String> {
    body.lines()
        .filter_map(|line| line.strip_prefix("data: "))
        .map(|data| {
            let event: Value = serde_json::from_str(data).unwrap();
            event["message"].as_str().unwrap().to_string()
        })
        .collect()
}

// ─── Tests ──────────────────────────────────────────────────────────

#[tokio::test]
async fn test_health() {
    let server = start_server().await;
    let resp = server.client.get(server.url("/health")).send().await.unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn test_answer_streams_then_finishes() {
    let server = start_server().await;
    let query_id = server.submit().await;
    server.wait_for(&query_id, "generating").await;

    // Headers arrive once the handler has attached to the token queue.
    let stream = server
        .client
        .get(server.url(&format!("/v1/sql-answers/{}/streaming", query_id)))
        .send()
        .await
        .unwrap();
    assert_eq!(stream.status(), 200);
    assert!(stream.headers()["content-type"]
        .to_str()
        .unwrap()
        .starts_with("text/event-stream"));

    server.generator.gate.notify_one();
    let messages = sse_messages(&stream.text().await.unwrap());
    assert_eq!(messages.concat(), format!("{HEAD}{TAIL}"));

    let body = server.wait_for(&query_id, "finished").await;
    assert_eq!(body["response"], "There are **3** orders.");
    assert!(body["error"].is_null());
}

#[tokio::test]
async fn test_streaming_is_empty_when_not_generating() {
    let server = start_server().await;
    let body = server
        .client
        .get(server.url("/v1/sql-answers/unknown/streaming"))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(sse_messages(&body).is_empty());
}

#[tokio::test]
async fn test_cancel() {
    let server = start_server().await;
    let query_id = server.submit().await;
    server.wait_for(&query_id, "generating").await;

    let resp = server
        .client
        .delete(server.url(&format!("/v1/sql-answers/{}", query_id)))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 204);

    let body = server.result(&query_id).await;
    assert_eq!(body["status"], "failed");
    assert_eq!(body["error"]["code"], "OTHERS");
    assert_eq!(body["error"]["message"], "cancelled");

    let resp = server
        .client
        .delete(server.url("/v1/sql-answers/unknown"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "not_found");
}

#[tokio::test]
async fn test_unknown_result_is_failed_record() {
    let server = start_server().await;
    let body = server.result("nope").await;
    assert_eq!(body["status"], "failed");
    assert_eq!(body["error"]["code"], "OTHERS");
    assert_eq!(body["error"]["message"], "nope is not found");
}

#[tokio::test]
async fn test_submit_rejects_empty_sql() {
    let server = start_server().await;
    let resp = server
        .client
        .post(server.url("/v1/sql-answers"))
        .json(&json!({"query": "q", "sql": "  ", "sql_summary": "s"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "bad_request");
}

#[tokio::test]
async fn test_indexing_endpoint() {
    let server = start_server().await;
    let mdl = json!({
        "models": [{"name": "orders", "primaryKey": "id",
                    "columns": [{"name": "id", "type": "INTEGER"}]}],
        "views": [{"name": "recent", "statement": "SELECT * FROM orders",
                   "properties": {"question": "recent orders?"}}]
    });

    let resp = server
        .client
        .post(server.url("/v1/indexing"))
        .json(&json!({"mdl": mdl, "project_id": "p1"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(
        body,
        json!({"write_dbschema": 3, "write_view": 1, "write_table_description": 2})
    );

    let resp = server
        .client
        .post(server.url("/v1/indexing"))
        .json(&json!({"mdl": "not json"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "invalid_mdl");
}
