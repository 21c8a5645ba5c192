//! HTTP speech synthesis module.
//!
//! `synthesize` streams Opus packets back as they arrive from the provider;
//! the chunked HTTP body is already framed in 60 ms packets by the provider,
//! each length-prefixed with a u16 so packet boundaries survive transport
//! re-chunking.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::OnceCell;

use kaiwa_core::{Error, Result};

use crate::module::{unknown_tool, ChunkSender, ChunkStream, Module, ModuleFactory, ToolSpec};
use crate::providers::llm::classify_reqwest;

#[derive(Debug, Clone, Deserialize)]
struct TtsConfig {
    #[serde(default)]
    base_url: String,
    #[serde(default)]
    api_key: String,
    #[serde(default = "default_voice")]
    voice: String,
    #[serde(default = "default_speed")]
    speed: f32,
    #[serde(default = "default_timeout")]
    timeout_secs: u64,
}

fn default_voice() -> String {
    "default".to_string()
}
fn default_speed() -> f32 {
    1.0
}
fn default_timeout() -> u64 {
    30
}

pub struct HttpTtsFactory;

impl ModuleFactory for HttpTtsFactory {
    fn default_config(&self) -> Value {
        json!({ "voice": default_voice(), "speed": default_speed(), "timeout_secs": default_timeout() })
    }

    fn create(&self, config: Value) -> Result<Arc<dyn Module>> {
        let config: TtsConfig = serde_json::from_value(config)
            .map_err(|e| Error::Config(format!("tts module config: {e}")))?;
        Ok(Arc::new(HttpTtsModule { config, client: OnceCell::new() }))
    }
}

#[derive(Debug)]
pub struct HttpTtsModule {
    config: TtsConfig,
    client: OnceCell<reqwest::Client>,
}

impl HttpTtsModule {
    async fn request(&self, args: &Value) -> Result<reqwest::Response> {
        let text = args
            .get("text")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::provider_fatal("tts", "missing text argument"))?;
        let body = json!({
            "text": text,
            "voice": args.get("voice").and_then(Value::as_str).unwrap_or(&self.config.voice),
            "speed": args.get("speed").and_then(Value::as_f64)
                .unwrap_or(f64::from(self.config.speed)),
            "format": "opus",
            "sample_rate": 16_000,
        });

        let client = self
            .client
            .get()
            .ok_or_else(|| Error::provider_fatal("tts", "module used before init"))?;
        let url = format!("{}/synthesize", self.config.base_url.trim_end_matches('/'));
        let response = client
            .post(url)
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| classify_reqwest("tts", e))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(if status.is_server_error() {
                Error::provider_transient("tts", format!("{status}: {text}"))
            } else {
                Error::provider_fatal("tts", format!("{status}: {text}"))
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl Module for HttpTtsModule {
    fn name(&self) -> &str {
        "http_tts"
    }

    fn description(&self) -> &str {
        "Text-to-speech over a provider synthesis endpoint"
    }

    async fn init(&self) -> Result<()> {
        if self.config.base_url.is_empty() {
            return Err(Error::Config("tts module requires base_url".to_string()));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(self.config.timeout_secs))
            .build()
            .map_err(|e| Error::Internal(format!("http client: {e}")))?;
        self.client
            .set(client)
            .map_err(|_| Error::Internal("tts client initialized twice".to_string()))
    }

    fn tools(&self) -> Vec<ToolSpec> {
        vec![ToolSpec::new(
            "synthesize",
            "Synthesize one sentence to Opus audio. Streaming-capable.",
            json!({
                "type": "object",
                "properties": {
                    "text": { "type": "string" },
                    "voice": { "type": "string" },
                    "speed": { "type": "number" }
                },
                "required": ["text"]
            }),
        )]
    }

    async fn call(&self, tool: &str, args: Value) -> Result<Value> {
        if tool != "synthesize" {
            return Err(unknown_tool(self.name(), tool));
        }
        let response = self.request(&args).await?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| Error::provider_transient("tts", format!("read body: {e}")))?;
        Ok(json!({
            "audio": base64::engine::general_purpose::STANDARD.encode(&bytes),
            "format": "opus",
        }))
    }

    async fn call_stream(&self, tool: &str, args: Value) -> Result<ChunkStream> {
        if tool != "synthesize" {
            return Err(unknown_tool(self.name(), tool));
        }
        let response = self.request(&args).await?;
        let (tx, stream) = ChunkStream::channel(32);
        tokio::spawn(pump_packets(response, tx));
        Ok(stream)
    }
}

/// Reassemble length-prefixed Opus packets from the chunked body.
async fn pump_packets(response: reqwest::Response, tx: ChunkSender) {
    let mut body = response.bytes_stream();
    let mut pending: Vec<u8> = Vec::new();
    let mut packets = 0usize;

    while let Some(next) = body.next().await {
        let bytes = match next {
            Ok(bytes) => bytes,
            Err(err) => {
                let _ = tx
                    .fail(Error::provider_transient("tts", format!("stream read: {err}")))
                    .await;
                return;
            }
        };
        pending.extend_from_slice(&bytes);

        while pending.len() >= 2 {
            let frame_len = u16::from_be_bytes([pending[0], pending[1]]) as usize;
            if pending.len() < 2 + frame_len {
                break;
            }
            let packet = pending[2..2 + frame_len].to_vec();
            pending.drain(..2 + frame_len);
            packets += 1;
            if !tx.audio(packet).await {
                // Barge-in closed the consumer side.
                return;
            }
        }
    }

    let _ = tx.done(json!({ "packets": packets })).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn init_requires_base_url() {
        let module = HttpTtsFactory.create(json!({})).expect("create is cheap");
        assert!(module.init().await.is_err());
    }

    #[tokio::test]
    async fn streaming_rejects_unknown_tool() {
        let module = HttpTtsFactory
            .create(json!({ "base_url": "https://tts.example" }))
            .expect("create");
        let err = module
            .call_stream("hum", json!({ "text": "啦" }))
            .await
            .expect_err("unknown tool");
        assert!(matches!(err, Error::Provider { .. }));
    }
}
