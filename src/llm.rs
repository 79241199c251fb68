//! LLM generator abstraction and the OpenAI-compatible chat adapter.
//!
//! A [`Generator`] takes a rendered prompt and returns one or more text
//! replies. When [`GenerateOptions::streaming_callback`] is set, streaming
//! generators invoke it once per delta, passing the query id through so the
//! callback can route chunks to the right consumer; the last chunk carries a
//! `finish_reason`.
//!
//! [`OpenAiGenerator`] speaks `POST {url}/chat/completions`, including the
//! server-sent-event streaming mode, with the same retry policy as the
//! embedders.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tracing::debug;

use crate::config::LlmConfig;

/// One streamed delta.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StreamingChunk {
    pub content: String,
    /// Set on the final chunk (`"stop"`, `"length"`, ...).
    pub finish_reason: Option<String>,
}

/// Called with every streamed chunk and the query id it belongs to.
pub type StreamingCallback = Arc<dyn Fn(StreamingChunk, &str) + Send + Sync>;

#[derive(Clone, Default)]
pub struct GenerateOptions {
    pub query_id: Option<String>,
    pub system_prompt: Option<String>,
    /// Provider-specific `response_format` object.
    pub response_format: Option<Value>,
    pub streaming_callback: Option<StreamingCallback>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct GeneratorOutput {
    pub replies: Vec<String>,
}

#[async_trait]
pub trait Generator: Send + Sync {
    fn model_name(&self) -> &str;

    async fn run(&self, prompt: &str, options: GenerateOptions) -> Result<GeneratorOutput>;
}

/// Used when `llm.provider = "disabled"`; every call fails.
pub struct DisabledGenerator;

#[async_trait]
impl Generator for DisabledGenerator {
    fn model_name(&self) -> &str {
        "disabled"
    }

    async fn run(&self, _prompt: &str, _options: GenerateOptions) -> Result<GeneratorOutput> {
        bail!("LLM provider is disabled")
    }
}

pub struct OpenAiGenerator {
    model: String,
    url: String,
    api_key: Option<String>,
    streaming: bool,
    max_retries: u32,
    timeout: Duration,
    client: reqwest::Client,
}

impl OpenAiGenerator {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("llm.model required for openai provider"))?;
        let api_key = std::env::var(&config.api_key_env).ok();
        if api_key.is_none() && config.url.contains("api.openai.com") {
            bail!("{} environment variable not set", config.api_key_env);
        }
        // Client-wide limits bound connecting and stalls only; `send` adds a
        // total deadline for non-streamed requests.
        let timeout = Duration::from_secs(config.timeout_secs);
        let client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .read_timeout(timeout)
            .build()?;

        Ok(Self {
            model,
            url: config.url.trim_end_matches('/').to_string(),
            api_key,
            streaming: config.streaming,
            max_retries: config.max_retries,
            timeout,
            client,
        })
    }

    /// POST `body`, retrying 429/5xx and network errors with backoff.
    async fn send(&self, body: &Value, stream: bool) -> Result<reqwest::Response> {
        let endpoint = format!("{}/chat/completions", self.url);
        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let mut request = self.client.post(&endpoint).json(body);
            if !stream {
                request = request.timeout(self.timeout);
            }
            if let Some(key) = &self.api_key {
                request = request.header("Authorization", format!("Bearer {}", key));
            }

            match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(response);
                    }
                    let body_text = response.text().await.unwrap_or_default();
                    if status.as_u16() == 429 || status.is_server_error() {
                        last_err = Some(anyhow::anyhow!("LLM API error {}: {}", status, body_text));
                        continue;
                    }
                    bail!("LLM API error {}: {}", status, body_text);
                }
                Err(e) => {
                    last_err = Some(anyhow::anyhow!("LLM connection error ({}): {}", endpoint, e));
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("LLM call failed after retries")))
    }

    async fn read_stream(
        &self,
        response: reqwest::Response,
        callback: &StreamingCallback,
        query_id: &str,
    ) -> Result<String> {
        let mut reply = String::new();
        // Network chunks may split a multi-byte character; decode whole lines only.
        let mut buffer: Vec<u8> = Vec::new();
        let mut bytes = response.bytes_stream();

        'outer: while let Some(next) = bytes.next().await {
            buffer.extend_from_slice(&next?);
            while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = buffer.drain(..=pos).collect();
                let line = String::from_utf8(line).context("LLM stream is not valid UTF-8")?;
                match parse_sse_line(&line)? {
                    SseLine::Done => break 'outer,
                    SseLine::Skip => {}
                    SseLine::Chunk(chunk) => {
                        reply.push_str(&chunk.content);
                        callback(chunk, query_id);
                    }
                }
            }
        }

        Ok(reply)
    }
}

enum SseLine {
    Chunk(StreamingChunk),
    Skip,
    Done,
}

fn parse_sse_line(line: &str) -> Result<SseLine> {
    let Some(data) = line.trim().strip_prefix("data:") else {
        return Ok(SseLine::Skip);
    };
    let data = data.trim();
    if data == "[DONE]" {
        return Ok(SseLine::Done);
    }
    if data.is_empty() {
        return Ok(SseLine::Skip);
    }
    let json: Value = serde_json::from_str(data)?;
    let choice = &json["choices"][0];
    Ok(SseLine::Chunk(StreamingChunk {
        content: choice["delta"]["content"]
            .as_str()
            .unwrap_or_default()
            .to_string(),
        finish_reason: choice["finish_reason"].as_str().map(str::to_string),
    }))
}

fn parse_completion(json: &Value) -> Result<Vec<String>> {
    let choices = json
        .get("choices")
        .and_then(Value::as_array)
        .ok_or_else(|| anyhow::anyhow!("Invalid completion response: missing choices"))?;
    Ok(choices
        .iter()
        .map(|c| c["message"]["content"].as_str().unwrap_or_default().to_string())
        .collect())
}

#[async_trait]
impl Generator for OpenAiGenerator {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn run(&self, prompt: &str, options: GenerateOptions) -> Result<GeneratorOutput> {
        let mut messages = Vec::new();
        if let Some(system) = &options.system_prompt {
            messages.push(json!({"role": "system", "content": system}));
        }
        messages.push(json!({"role": "user", "content": prompt}));

        let stream = self.streaming && options.streaming_callback.is_some();
        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "stream": stream,
        });
        if let Some(format) = &options.response_format {
            body["response_format"] = format.clone();
        }

        let response = self.send(&body, stream).await?;

        let replies = match (&options.streaming_callback, stream) {
            (Some(callback), true) => {
                let query_id = options.query_id.as_deref().unwrap_or_default();
                vec![self.read_stream(response, callback, query_id).await?]
            }
            _ => {
                let json: Value = response.json().await?;
                parse_completion(&json)?
            }
        };
        debug!(model = %self.model, stream, replies = replies.len(), "generation finished");

        Ok(GeneratorOutput { replies })
    }
}

/// Create the [`Generator`] named by `config.provider`.
pub fn create_generator(config: &LlmConfig) -> Result<Arc<dyn Generator>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledGenerator)),
        "openai" => Ok(Arc::new(OpenAiGenerator::new(config)?)),
        other => bail!("Unknown llm provider: {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{Body, Bytes};
    use axum::{http::header, routing::post, Json, Router};
    use std::convert::Infallible;
    use std::sync::Mutex;

    /// Event-stream response that sends `parts` with `gap` between them.
    fn chunked_sse(parts: Vec<Vec<u8>>, gap: Duration) -> impl axum::response::IntoResponse {
        let body = futures::stream::iter(parts).then(move |part| async move {
            tokio::time::sleep(gap).await;
            Ok::<_, Infallible>(Bytes::from(part))
        });
        (
            [(header::CONTENT_TYPE, "text/event-stream")],
            Body::from_stream(body),
        )
    }

    fn collecting_callback() -> (StreamingCallback, Arc<Mutex<Vec<String>>>) {
        let chunks = Arc::new(Mutex::new(Vec::new()));
        let sink = chunks.clone();
        let callback: StreamingCallback = Arc::new(move |chunk: StreamingChunk, _query_id: &str| {
            sink.lock().unwrap().push(chunk.content);
        });
        (callback, chunks)
    }

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        format!("http://{}", addr)
    }

    fn config(url: String) -> LlmConfig {
        LlmConfig {
            provider: "openai".to_string(),
            model: Some("test-model".to_string()),
            url,
            api_key_env: "T2S_TEST_UNSET_KEY".to_string(),
            max_retries: 0,
            ..Default::default()
        }
    }

    #[test]
    fn test_parse_sse_line() {
        assert!(matches!(parse_sse_line(": keep-alive").unwrap(), SseLine::Skip));
        assert!(matches!(parse_sse_line("data: [DONE]").unwrap(), SseLine::Done));
        let SseLine::Chunk(chunk) = parse_sse_line(
            r#"data: {"choices":[{"delta":{"content":"Hi"},"finish_reason":null}]}"#,
        )
        .unwrap() else {
            panic!("expected chunk");
        };
        assert_eq!(chunk.content, "Hi");
        assert_eq!(chunk.finish_reason, None);
        assert!(parse_sse_line("data: {not json").is_err());
    }

    #[tokio::test]
    async fn test_disabled_generator_fails() {
        let err = DisabledGenerator
            .run("hi", GenerateOptions::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("disabled"));
    }

    #[tokio::test]
    async fn test_completion_sends_system_prompt_and_format() {
        let seen = Arc::new(Mutex::new(Value::Null));
        let captured = seen.clone();
        let app = Router::new().route(
            "/chat/completions",
            post(move |Json(body): Json<Value>| {
                let captured = captured.clone();
                async move {
                    *captured.lock().unwrap() = body;
                    Json(json!({"choices": [{"message": {"content": "{\"answer\":\"42\"}"}}]}))
                }
            }),
        );
        let generator = OpenAiGenerator::new(&config(serve(app).await)).unwrap();

        let out = generator
            .run(
                "question",
                GenerateOptions {
                    system_prompt: Some("be brief".to_string()),
                    response_format: Some(json!({"type": "json_object"})),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(out.replies, vec!["{\"answer\":\"42\"}".to_string()]);

        let body = seen.lock().unwrap().clone();
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "question");
        assert_eq!(body["stream"], false);
        assert_eq!(body["response_format"]["type"], "json_object");
    }

    #[tokio::test]
    async fn test_streaming_invokes_callback_per_delta() {
        let app = Router::new().route(
            "/chat/completions",
            post(|| async {
                let body = [
                    r#"data: {"choices":[{"delta":{"content":"Hel"},"finish_reason":null}]}"#,
                    r#"data: {"choices":[{"delta":{"content":"lo"},"finish_reason":null}]}"#,
                    r#"data: {"choices":[{"delta":{},"finish_reason":"stop"}]}"#,
                    "data: [DONE]",
                ]
                .iter()
                .map(|l| format!("{}\n\n", l))
                .collect::<String>();
                ([(header::CONTENT_TYPE, "text/event-stream")], body)
            }),
        );
        let generator = OpenAiGenerator::new(&config(serve(app).await)).unwrap();

        let chunks = Arc::new(Mutex::new(Vec::new()));
        let sink = chunks.clone();
        let callback: StreamingCallback = Arc::new(move |chunk: StreamingChunk, query_id: &str| {
            sink.lock().unwrap().push((chunk, query_id.to_string()));
        });
        let out = generator
            .run(
                "q",
                GenerateOptions {
                    query_id: Some("q1".to_string()),
                    streaming_callback: Some(callback),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(out.replies, vec!["Hello".to_string()]);
        let chunks = chunks.lock().unwrap();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].0.content, "Hel");
        assert_eq!(chunks[0].1, "q1");
        assert_eq!(chunks[2].0.finish_reason.as_deref(), Some("stop"));
    }

    #[tokio::test]
    async fn test_client_error_is_not_retried() {
        let app = Router::new().route(
            "/chat/completions",
            post(|| async { (axum::http::StatusCode::BAD_REQUEST, "bad model") }),
        );
        let mut cfg = config(serve(app).await);
        cfg.max_retries = 3;
        let generator = OpenAiGenerator::new(&cfg).unwrap();
        let err = generator
            .run("q", GenerateOptions::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("400"));
    }

    #[tokio::test]
    async fn test_streaming_keeps_characters_split_across_chunks() {
        let app = Router::new().route(
            "/chat/completions",
            post(|| async {
                let payload = concat!(
                    r#"data: {"choices":[{"delta":{"content":"答案"},"finish_reason":"stop"}]}"#,
                    "\n\ndata: [DONE]\n\n"
                )
                .as_bytes();
                // Cut inside the three-byte encoding of the first character.
                let cut = payload
                    .windows("答".len())
                    .position(|w| w == "答".as_bytes())
                    .unwrap()
                    + 1;
                chunked_sse(
                    vec![payload[..cut].to_vec(), payload[cut..].to_vec()],
                    Duration::from_millis(50),
                )
            }),
        );
        let generator = OpenAiGenerator::new(&config(serve(app).await)).unwrap();
        let (callback, chunks) = collecting_callback();

        let out = generator
            .run(
                "q",
                GenerateOptions {
                    query_id: Some("q1".to_string()),
                    streaming_callback: Some(callback),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(out.replies, vec!["答案".to_string()]);
        assert_eq!(*chunks.lock().unwrap(), vec!["答案".to_string()]);
    }

    #[tokio::test]
    async fn test_stream_longer_than_timeout_is_not_cut_off() {
        let app = Router::new().route(
            "/chat/completions",
            post(|| async {
                let parts = ["one ", "two ", "three"]
                    .iter()
                    .map(|word| {
                        format!(
                            "data: {}\n\n",
                            json!({"choices": [{"delta": {"content": word}, "finish_reason": null}]})
                        )
                        .into_bytes()
                    })
                    .chain(std::iter::once(b"data: [DONE]\n\n".to_vec()))
                    .collect();
                // Each gap stays under the timeout; the whole body does not.
                chunked_sse(parts, Duration::from_millis(500))
            }),
        );
        let mut cfg = config(serve(app).await);
        cfg.timeout_secs = 1;
        let generator = OpenAiGenerator::new(&cfg).unwrap();
        let (callback, chunks) = collecting_callback();

        let out = generator
            .run(
                "q",
                GenerateOptions {
                    query_id: Some("q1".to_string()),
                    streaming_callback: Some(callback),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(out.replies, vec!["one two three".to_string()]);
        assert_eq!(chunks.lock().unwrap().len(), 3);
    }
}
