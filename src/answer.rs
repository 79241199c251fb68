//! SQL answer generation pipeline.
//!
//! `prompt → generate_answer → post_process`: renders the question, SQL,
//! summary, and result rows into a prompt, asks the [`Generator`] for a
//! `{reasoning, answer}` JSON object, and parses it. When a query id is
//! given, generated tokens are streamed into the [`StreamingBroker`] as
//! they arrive so clients can render the answer before it is complete.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::broker::StreamingBroker;
use crate::error::{Error, Result};
use crate::llm::{GenerateOptions, Generator, GeneratorOutput, StreamingCallback, StreamingChunk};
use crate::pipeline::{Inputs, Pipeline, PipelineBuilder};

pub const SYSTEM_PROMPT: &str = r#"
### TASK

You are a data analyst that great at answering user's questions based on the data, sql and sql summary so that even non technical users can easily understand.
Please answer the user's question in concise and clear manner in Markdown format.

### INSTRUCTIONS

1. Read the user's question and understand the user's intention.
2. Read the sql summary and understand the data.
3. Read the sql and understand the data.
4. Generate a consice and clear answer in string format and a reasoning process in string format to the user's question based on the data, sql and sql summary.
5. If answer is in list format, only list top few examples, and tell users there are more results omitted.
6. Answer must be in the same language user specified.

### OUTPUT FORMAT

Return the output in the following JSON format:

{
    "reasoning": "<STRING>",
    "answer": "<STRING_IN_MARKDOWN_FORMAT>",
}
"#;

/// Render the user prompt. Only the `results` member of `sql_data` is
/// shown to the model when present.
pub fn render_prompt(
    query: &str,
    sql: &str,
    sql_summary: &str,
    sql_data: &Value,
    language: &str,
) -> String {
    let data = sql_data.get("results").unwrap_or(sql_data);
    format!(
        "\n### Input\nUser's question: {query}\nSQL: {sql}\nSQL summary: {sql_summary}\nData: {data}\nLanguage: {language}\nPlease think step by step and answer the user's question.\n"
    )
}

/// `response_format` asking for the `{reasoning, answer}` object.
pub fn response_format() -> Value {
    json!({
        "type": "json_schema",
        "json_schema": {
            "name": "sql_summary",
            "schema": {
                "type": "object",
                "properties": {
                    "reasoning": {"type": "string"},
                    "answer": {"type": "string"},
                },
                "required": ["reasoning", "answer"],
            },
        },
    })
}

/// Outcome of post-processing. `error` is empty on success; on failure
/// `answer` and `reasoning` are empty.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SqlAnswerResult {
    pub answer: String,
    pub reasoning: String,
    pub error: String,
}

#[derive(Deserialize)]
struct AnswerReply {
    reasoning: String,
    answer: String,
}

/// Parse the first reply. Never fails: parse problems land in `error`.
pub fn post_process(output: &GeneratorOutput) -> SqlAnswerResult {
    let parsed = output
        .replies
        .first()
        .ok_or_else(|| Error::GenerationParse("generator returned no replies".to_string()))
        .and_then(|reply| {
            serde_json::from_str::<AnswerReply>(reply)
                .map_err(|e| Error::GenerationParse(e.to_string()))
        });

    match parsed {
        Ok(reply) => SqlAnswerResult {
            answer: reply.answer,
            reasoning: reply.reasoning,
            error: String::new(),
        },
        Err(e) => {
            warn!(error = %e, "failed to post-process answer");
            SqlAnswerResult {
                error: e.to_string(),
                ..Default::default()
            }
        }
    }
}

pub struct SqlAnswer {
    pipeline: Pipeline,
    broker: Arc<StreamingBroker>,
}

impl SqlAnswer {
    pub fn new(generator: Arc<dyn Generator>, broker: Arc<StreamingBroker>) -> Result<Self> {
        let stream_to = broker.clone();
        let pipeline = PipelineBuilder::new()
            .input("query")
            .input("sql")
            .input("sql_summary")
            .input("sql_data")
            .input("language")
            .input("query_id")
            .node(
                "prompt",
                &["query", "sql", "sql_summary", "sql_data", "language"],
                |inputs| async move {
                    let prompt = render_prompt(
                        inputs.get::<String>("query")?,
                        inputs.get::<String>("sql")?,
                        inputs.get::<String>("sql_summary")?,
                        inputs.get::<Value>("sql_data")?,
                        inputs.get::<String>("language")?,
                    );
                    debug!(%prompt, "rendered answer prompt");
                    anyhow::Ok(prompt)
                },
            )
            .node("generate_answer", &["prompt", "query_id"], move |inputs| {
                let generator = generator.clone();
                let broker = stream_to.clone();
                async move {
                    let prompt = inputs.get::<String>("prompt")?;
                    let query_id = inputs.get::<Option<String>>("query_id")?.clone();
                    generate(generator.as_ref(), &broker, prompt, query_id).await
                }
            })
            .node("post_process", &["generate_answer"], |inputs| async move {
                anyhow::Ok(post_process(inputs.get::<GeneratorOutput>("generate_answer")?))
            })
            .build()?;

        Ok(Self { pipeline, broker })
    }

    pub async fn run(
        &self,
        query: &str,
        sql: &str,
        sql_summary: &str,
        sql_data: Value,
        language: &str,
        query_id: Option<&str>,
    ) -> Result<SqlAnswerResult> {
        info!(query_id = query_id.unwrap_or("-"), "generating SQL answer");
        let inputs = Inputs::new()
            .with("query", query.to_string())
            .with("sql", sql.to_string())
            .with("sql_summary", sql_summary.to_string())
            .with("sql_data", sql_data)
            .with("language", language.to_string())
            .with("query_id", query_id.map(str::to_string));

        let outputs = self.pipeline.execute(&["post_process"], inputs).await?;
        Ok(outputs.require::<SqlAnswerResult>("post_process")?.clone())
    }

    /// Tokens generated for `query_id`, ending when generation finishes.
    pub fn get_streaming_results(&self, query_id: &str) -> BoxStream<'static, String> {
        self.broker.consume(query_id)
    }

    /// Stop streaming for `query_id`: ends an attached consumer, or drops
    /// the queue if nobody is reading it.
    pub fn close_stream(&self, query_id: &str) {
        self.broker.close(query_id);
    }

    pub fn to_dot(&self) -> Result<String> {
        self.pipeline.to_dot(&["post_process"])
    }
}

/// Run the generator, streaming into `broker` when a query id is present.
///
/// The stream for `query_id` is always closed once generation ends, also
/// when the generator failed or never reported a finish reason.
async fn generate(
    generator: &dyn Generator,
    broker: &Arc<StreamingBroker>,
    prompt: &str,
    query_id: Option<String>,
) -> anyhow::Result<GeneratorOutput> {
    let finished = Arc::new(AtomicBool::new(false));
    let streaming_callback = query_id.as_ref().map(|_| {
        let broker = broker.clone();
        let finished = finished.clone();
        Arc::new(move |chunk: StreamingChunk, query_id: &str| {
            broker.push(query_id, chunk.content);
            if chunk.finish_reason.is_some() && !finished.swap(true, Ordering::SeqCst) {
                broker.push_done(query_id);
            }
        }) as StreamingCallback
    });

    let options = GenerateOptions {
        query_id: query_id.clone(),
        system_prompt: Some(SYSTEM_PROMPT.to_string()),
        response_format: Some(response_format()),
        streaming_callback,
    };
    let output = generator.run(prompt, options).await;

    if let Some(id) = &query_id {
        if !finished.swap(true, Ordering::SeqCst) {
            broker.push_done(id);
        }
    }
    output
}
