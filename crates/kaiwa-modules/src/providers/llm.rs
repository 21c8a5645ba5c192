//! OpenAI-compatible chat completion module.
//!
//! Covers every configured LLM provider that speaks the `/chat/completions`
//! dialect (dashscope, zhipu, azure-openai deployments, vanilla openai). The
//! streaming tool parses SSE `data:` lines into deltas and closes with a
//! completion payload carrying the full content and usage.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::OnceCell;
use tracing::warn;

use kaiwa_core::{Error, Result};

use crate::module::{unknown_tool, ChunkSender, ChunkStream, Module, ModuleFactory, ToolSpec};

#[derive(Debug, Clone, Deserialize)]
struct LlmConfig {
    #[serde(default)]
    base_url: String,
    #[serde(default)]
    api_key: String,
    #[serde(default = "default_model")]
    model: String,
    #[serde(default = "default_temperature")]
    temperature: f32,
    #[serde(default = "default_max_tokens")]
    max_tokens: u32,
    #[serde(default = "default_timeout")]
    timeout_secs: u64,
}

fn default_model() -> String {
    "qwen-plus".to_string()
}
fn default_temperature() -> f32 {
    1.0
}
fn default_max_tokens() -> u32 {
    1024
}
fn default_timeout() -> u64 {
    60
}

pub struct OpenAiChatFactory;

impl ModuleFactory for OpenAiChatFactory {
    fn default_config(&self) -> Value {
        json!({
            "model": default_model(),
            "temperature": default_temperature(),
            "max_tokens": default_max_tokens(),
            "timeout_secs": default_timeout(),
        })
    }

    fn create(&self, config: Value) -> Result<Arc<dyn Module>> {
        let config: LlmConfig = serde_json::from_value(config)
            .map_err(|e| Error::Config(format!("llm module config: {e}")))?;
        Ok(Arc::new(OpenAiChatModule {
            config,
            client: OnceCell::new(),
        }))
    }
}

#[derive(Debug)]
pub struct OpenAiChatModule {
    config: LlmConfig,
    client: OnceCell<reqwest::Client>,
}

impl OpenAiChatModule {
    fn client(&self) -> Result<&reqwest::Client> {
        self.client
            .get()
            .ok_or_else(|| Error::provider_fatal("llm", "module used before init"))
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'))
    }

    fn request_body(&self, args: &Value, stream: bool) -> Value {
        let mut body = json!({
            "model": args.get("model").and_then(Value::as_str).unwrap_or(&self.config.model),
            "messages": args.get("messages").cloned().unwrap_or(Value::Array(vec![])),
            "temperature": args.get("temperature").and_then(Value::as_f64)
                .unwrap_or(f64::from(self.config.temperature)),
            "max_tokens": args.get("max_tokens").and_then(Value::as_u64)
                .unwrap_or(u64::from(self.config.max_tokens)),
        });
        if let Some(tools) = args.get("tools").filter(|t| t.is_array()) {
            body["tools"] = tools.clone();
        }
        if let Some(top_p) = args.get("top_p").and_then(Value::as_f64) {
            body["top_p"] = json!(top_p);
        }
        if stream {
            body["stream"] = json!(true);
            body["stream_options"] = json!({ "include_usage": true });
        }
        body
    }

    async fn send(&self, body: &Value) -> Result<reqwest::Response> {
        let response = self
            .client()?
            .post(self.completions_url())
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .json(body)
            .send()
            .await
            .map_err(|e| classify_reqwest("llm", e))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(if status.is_server_error() {
                Error::provider_transient("llm", format!("{status}: {text}"))
            } else {
                Error::provider_fatal("llm", format!("{status}: {text}"))
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl Module for OpenAiChatModule {
    fn name(&self) -> &str {
        "openai_chat"
    }

    fn description(&self) -> &str {
        "Chat completions against an OpenAI-compatible endpoint"
    }

    async fn init(&self) -> Result<()> {
        if self.config.base_url.is_empty() {
            return Err(Error::Config("llm module requires base_url".to_string()));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(self.config.timeout_secs))
            .build()
            .map_err(|e| Error::Internal(format!("http client: {e}")))?;
        self.client
            .set(client)
            .map_err(|_| Error::Internal("llm client initialized twice".to_string()))
    }

    fn tools(&self) -> Vec<ToolSpec> {
        vec![ToolSpec::new(
            "chat_completion",
            "Run a chat completion. Streaming-capable.",
            json!({
                "type": "object",
                "properties": {
                    "messages": { "type": "array", "items": { "type": "object" } },
                    "model": { "type": "string" },
                    "max_tokens": { "type": "integer" },
                    "temperature": { "type": "number" },
                    "top_p": { "type": "number" },
                    "tools": { "type": "array" }
                },
                "required": ["messages"]
            }),
        )]
    }

    async fn call(&self, tool: &str, args: Value) -> Result<Value> {
        if tool != "chat_completion" {
            return Err(unknown_tool(self.name(), tool));
        }
        let body = self.request_body(&args, false);
        let response = self.send(&body).await?;
        let payload: Value = response
            .json()
            .await
            .map_err(|e| Error::provider_transient("llm", format!("decode response: {e}")))?;

        let content = payload["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or_default()
            .to_string();
        Ok(json!({
            "content": content,
            "usage": payload.get("usage").cloned().unwrap_or(Value::Null),
            "model": payload.get("model").cloned().unwrap_or(Value::Null),
        }))
    }

    async fn call_stream(&self, tool: &str, args: Value) -> Result<ChunkStream> {
        if tool != "chat_completion" {
            return Err(unknown_tool(self.name(), tool));
        }
        let body = self.request_body(&args, true);
        let response = self.send(&body).await?;

        let (tx, stream) = ChunkStream::channel(32);
        tokio::spawn(pump_sse(response, tx));
        Ok(stream)
    }
}

/// Read the SSE body and forward deltas until `[DONE]` or disconnect.
async fn pump_sse(response: reqwest::Response, tx: ChunkSender) {
    let mut body = response.bytes_stream();
    let mut buffer = String::new();
    let mut full_content = String::new();
    let mut usage = Value::Null;
    let mut model = Value::Null;

    while let Some(next) = body.next().await {
        let bytes = match next {
            Ok(bytes) => bytes,
            Err(err) => {
                let _ = tx
                    .fail(Error::provider_transient("llm", format!("stream read: {err}")))
                    .await;
                return;
            }
        };
        buffer.push_str(&String::from_utf8_lossy(&bytes));

        while let Some(pos) = buffer.find("\n\n") {
            let event = buffer[..pos].to_string();
            buffer.drain(..pos + 2);

            for line in event.lines() {
                let Some(data) = line.strip_prefix("data: ") else { continue };
                if data.trim() == "[DONE]" {
                    let _ = tx
                        .done(json!({ "content": full_content, "usage": usage, "model": model }))
                        .await;
                    return;
                }
                match serde_json::from_str::<Value>(data) {
                    Ok(chunk) => {
                        if let Some(delta) = chunk["choices"][0]["delta"]["content"].as_str() {
                            if !delta.is_empty() {
                                full_content.push_str(delta);
                                if !tx.delta(delta).await {
                                    // Consumer cancelled the turn; stop reading.
                                    return;
                                }
                            }
                        }
                        if let Some(u) = chunk.get("usage").filter(|u| !u.is_null()) {
                            usage = u.clone();
                        }
                        if let Some(m) = chunk.get("model").filter(|m| !m.is_null()) {
                            model = m.clone();
                        }
                    }
                    Err(err) => warn!(error = %err, "unparseable sse chunk"),
                }
            }
        }
    }

    // Provider closed without [DONE]; still deliver what we have.
    let _ = tx
        .done(json!({ "content": full_content, "usage": usage, "model": model }))
        .await;
}

pub(crate) fn classify_reqwest(provider: &str, err: reqwest::Error) -> Error {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        Error::provider_transient(provider, err.to_string())
    } else {
        Error::provider_fatal(provider, err.to_string())
    }
}
