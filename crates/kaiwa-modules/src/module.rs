//! Uniform provider module surface.
//!
//! A module is one provider implementation for a pipeline stage, addressed by
//! `(kind, code)`. Construction is split in two phases: [`ModuleFactory::create`]
//! must be cheap (store config, allocate nothing external) while [`Module::init`]
//! may open connection pools and validate credentials. The registry owns both
//! phases and never calls `init` twice.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;

use kaiwa_core::{Error, Result};

/// Fixed module taxonomy. `Intent` is reserved for a pre-LLM routing stage;
/// the registry dispatches to it when configured but nothing ships for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleKind {
    Vad,
    Asr,
    Llm,
    Tts,
    Memory,
    Intent,
}

impl ModuleKind {
    pub const ALL: [ModuleKind; 6] = [
        Self::Vad,
        Self::Asr,
        Self::Llm,
        Self::Tts,
        Self::Memory,
        Self::Intent,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Vad => "vad",
            Self::Asr => "asr",
            Self::Llm => "llm",
            Self::Tts => "tts",
            Self::Memory => "memory",
            Self::Intent => "intent",
        }
    }
}

impl std::fmt::Display for ModuleKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tool description in the JSON-Schema shape function-calling LLMs consume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON Schema for the arguments object.
    pub parameters: Value,
}

impl ToolSpec {
    pub fn new(name: &str, description: &str, parameters: Value) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            parameters,
        }
    }
}

/// One element of a streaming tool response.
#[derive(Debug, Clone)]
pub enum StreamChunk {
    /// Incremental text (LLM deltas, interim transcripts).
    Delta(String),
    /// Binary audio (TTS output).
    Audio(Vec<u8>),
    /// Completion marker with the final payload (full content, usage, ...).
    Done(Value),
}

/// Producer half of a chunk stream. Dropping it ends the stream, which is how
/// cancellation propagates to consumers.
#[derive(Clone)]
pub struct ChunkSender {
    tx: mpsc::Sender<Result<StreamChunk>>,
}

impl ChunkSender {
    pub async fn delta(&self, text: impl Into<String>) -> bool {
        self.tx.send(Ok(StreamChunk::Delta(text.into()))).await.is_ok()
    }

    pub async fn audio(&self, data: Vec<u8>) -> bool {
        self.tx.send(Ok(StreamChunk::Audio(data))).await.is_ok()
    }

    pub async fn done(&self, payload: Value) -> bool {
        self.tx.send(Ok(StreamChunk::Done(payload))).await.is_ok()
    }

    pub async fn fail(&self, err: Error) -> bool {
        self.tx.send(Err(err)).await.is_ok()
    }
}

/// Lazy sequence of chunks produced by a streaming-capable tool.
#[derive(Debug)]
pub struct ChunkStream {
    rx: mpsc::Receiver<Result<StreamChunk>>,
}

impl ChunkStream {
    /// Bounded channel; backpressure on the producer keeps memory flat when
    /// the consumer (e.g. paced audio send) is slower than the provider.
    pub fn channel(capacity: usize) -> (ChunkSender, ChunkStream) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (ChunkSender { tx }, ChunkStream { rx })
    }

    /// Next chunk, or `None` once the producer side is gone.
    pub async fn next(&mut self) -> Option<Result<StreamChunk>> {
        self.rx.recv().await
    }

    /// Stop consuming; the producer observes closed sends and unwinds.
    pub fn close(&mut self) {
        self.rx.close();
    }
}

#[async_trait]
pub trait Module: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// Heavy one-time setup. Called exactly once by the registry; a failure
    /// here marks the module unhealthy and excludes it from dispatch.
    async fn init(&self) -> Result<()>;

    fn tools(&self) -> Vec<ToolSpec>;

    async fn call(&self, tool: &str, args: Value) -> Result<Value>;

    /// Streaming variant. Modules without streaming tools keep the default.
    async fn call_stream(&self, tool: &str, _args: Value) -> Result<ChunkStream> {
        Err(Error::provider_fatal(
            self.name(),
            format!("tool {tool} does not support streaming"),
        ))
    }
}

/// Constructs a module from its merged catalog configuration. Registered by
/// `(kind, code)` at program start; no runtime reflection.
pub trait ModuleFactory: Send + Sync {
    /// Baseline configuration the catalog entry is merged over.
    fn default_config(&self) -> Value {
        Value::Object(Default::default())
    }

    fn create(&self, config: Value) -> Result<Arc<dyn Module>>;
}

pub(crate) fn unknown_tool(module: &str, tool: &str) -> Error {
    Error::provider_fatal(module, format!("unknown tool: {tool}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug)]
    struct EchoModule;

    #[async_trait]
    impl Module for EchoModule {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "echoes its arguments"
        }
        async fn init(&self) -> Result<()> {
            Ok(())
        }
        fn tools(&self) -> Vec<ToolSpec> {
            vec![ToolSpec::new("echo", "echo", json!({"type": "object"}))]
        }
        async fn call(&self, tool: &str, args: Value) -> Result<Value> {
            if tool != "echo" {
                return Err(unknown_tool(self.name(), tool));
            }
            Ok(args)
        }
    }

    #[tokio::test]
    async fn default_call_stream_reports_unsupported() {
        let module = EchoModule;
        let err = module
            .call_stream("echo", json!({}))
            .await
            .expect_err("no streaming support");
        assert!(!err.is_retriable());
    }

    #[tokio::test]
    async fn chunk_stream_ends_when_sender_drops() {
        let (tx, mut stream) = ChunkStream::channel(4);
        assert!(tx.delta("片").await);
        assert!(tx.done(json!({"content": "片"})).await);
        drop(tx);

        let mut deltas = 0;
        let mut done = false;
        while let Some(chunk) = stream.next().await {
            match chunk.expect("no errors") {
                StreamChunk::Delta(_) => deltas += 1,
                StreamChunk::Done(_) => done = true,
                StreamChunk::Audio(_) => panic!("no audio expected"),
            }
        }
        assert_eq!(deltas, 1);
        assert!(done);
    }

    #[tokio::test]
    async fn closed_stream_rejects_sends() {
        let (tx, mut stream) = ChunkStream::channel(1);
        stream.close();
        drop(stream);
        assert!(!tx.delta("dropped").await);
    }

    #[test]
    fn kind_names_round_trip() {
        for kind in ModuleKind::ALL {
            let json = serde_json::to_string(&kind).expect("serialize");
            let back: ModuleKind = serde_json::from_str(&json).expect("parse");
            assert_eq!(kind, back);
        }
    }
}
