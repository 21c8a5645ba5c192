//! HTTP speech recognition module.
//!
//! The gateway never decodes audio; complete Opus utterances are forwarded
//! base64-encoded and the provider owns decoding. One `transcribe` tool,
//! non-streaming: realtime interim transcripts come from calling it on
//! stable segment boundaries, not from a streaming transport.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::OnceCell;

use kaiwa_core::{Error, Result};

use crate::module::{unknown_tool, Module, ModuleFactory, ToolSpec};
use crate::providers::llm::classify_reqwest;

#[derive(Debug, Clone, Deserialize)]
struct AsrConfig {
    #[serde(default)]
    base_url: String,
    #[serde(default)]
    api_key: String,
    #[serde(default)]
    model: String,
    #[serde(default = "default_language")]
    language: String,
    #[serde(default = "default_timeout")]
    timeout_secs: u64,
}

fn default_language() -> String {
    "zh-CN".to_string()
}
fn default_timeout() -> u64 {
    10
}

pub struct HttpAsrFactory;

impl ModuleFactory for HttpAsrFactory {
    fn default_config(&self) -> Value {
        json!({ "language": default_language(), "timeout_secs": default_timeout() })
    }

    fn create(&self, config: Value) -> Result<Arc<dyn Module>> {
        let config: AsrConfig = serde_json::from_value(config)
            .map_err(|e| Error::Config(format!("asr module config: {e}")))?;
        Ok(Arc::new(HttpAsrModule { config, client: OnceCell::new() }))
    }
}

#[derive(Debug)]
pub struct HttpAsrModule {
    config: AsrConfig,
    client: OnceCell<reqwest::Client>,
}

#[async_trait]
impl Module for HttpAsrModule {
    fn name(&self) -> &str {
        "http_asr"
    }

    fn description(&self) -> &str {
        "Speech-to-text over a provider transcription endpoint"
    }

    async fn init(&self) -> Result<()> {
        if self.config.base_url.is_empty() {
            return Err(Error::Config("asr module requires base_url".to_string()));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(self.config.timeout_secs))
            .build()
            .map_err(|e| Error::Internal(format!("http client: {e}")))?;
        self.client
            .set(client)
            .map_err(|_| Error::Internal("asr client initialized twice".to_string()))
    }

    fn tools(&self) -> Vec<ToolSpec> {
        vec![ToolSpec::new(
            "transcribe",
            "Transcribe one complete utterance of base64 Opus audio.",
            json!({
                "type": "object",
                "properties": {
                    "audio": { "type": "string", "description": "base64 Opus packets" },
                    "language": { "type": "string" },
                    "baby_talk": {
                        "type": "boolean",
                        "description": "bias recognition toward young-child speech"
                    },
                    "sample_rate": { "type": "integer" },
                    "format": { "type": "string" }
                },
                "required": ["audio"]
            }),
        )]
    }

    async fn call(&self, tool: &str, args: Value) -> Result<Value> {
        if tool != "transcribe" {
            return Err(unknown_tool(self.name(), tool));
        }
        let audio = args
            .get("audio")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::provider_fatal(self.name(), "missing audio argument"))?;

        let body = json!({
            "audio": audio,
            "format": args.get("format").and_then(Value::as_str).unwrap_or("opus"),
            "sample_rate": args.get("sample_rate").and_then(Value::as_u64).unwrap_or(16_000),
            "language": args.get("language").and_then(Value::as_str)
                .unwrap_or(&self.config.language),
            "baby_talk": args.get("baby_talk").and_then(Value::as_bool).unwrap_or(false),
            "model": self.config.model,
        });

        let client = self
            .client
            .get()
            .ok_or_else(|| Error::provider_fatal(self.name(), "module used before init"))?;
        let url = format!("{}/transcriptions", self.config.base_url.trim_end_matches('/'));
        let response = client
            .post(url)
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| classify_reqwest("asr", e))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(if status.is_server_error() {
                Error::provider_transient("asr", format!("{status}: {text}"))
            } else {
                Error::provider_fatal("asr", format!("{status}: {text}"))
            });
        }

        let payload: Value = response
            .json()
            .await
            .map_err(|e| Error::provider_transient("asr", format!("decode response: {e}")))?;
        Ok(json!({
            "text": payload.get("text").and_then(Value::as_str).unwrap_or_default(),
            "confidence": payload.get("confidence").and_then(Value::as_f64).unwrap_or(1.0),
            "duration_secs": payload.get("duration_secs").and_then(Value::as_f64),
            "language": payload.get("language").cloned().unwrap_or(Value::Null),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_audio_argument_is_fatal() {
        let module = HttpAsrFactory
            .create(json!({ "base_url": "https://asr.example" }))
            .expect("create");
        module.init().await.expect("init");
        let err = module
            .call("transcribe", json!({}))
            .await
            .expect_err("audio is required");
        assert!(!err.is_retriable());
    }

    #[tokio::test]
    async fn init_requires_base_url() {
        let module = HttpAsrFactory.create(json!({})).expect("create is cheap");
        assert!(module.init().await.is_err());
    }
}
