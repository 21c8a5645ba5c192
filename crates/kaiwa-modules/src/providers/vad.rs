//! In-process voice activity estimation.
//!
//! The gateway keeps Opus packets opaque, so full spectral VAD is off the
//! table; what a packet does expose is its coded size, and for fixed-bitrate
//! voice streams coded size tracks signal complexity closely (silence frames
//! from the device encoder land under ~10 bytes with DTX). The module maps
//! packet size to a [0, 1] probability through an exponential moving average.
//! The hysteresis/segmentation state machine lives in the pipeline; this
//! module only scores frames.
//!
//! State is per `session_id` so one shared module instance serves every
//! connection concurrently.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Mutex;

use kaiwa_core::{Error, Result};

use crate::module::{unknown_tool, Module, ModuleFactory, ToolSpec};

#[derive(Debug, Clone, Deserialize)]
struct VadConfig {
    /// Packet size at or below which a frame is certainly silence.
    #[serde(default = "default_noise_floor")]
    noise_floor_bytes: usize,
    /// Packet size at which the probability saturates to 1.
    #[serde(default = "default_saturation")]
    saturation_bytes: usize,
    /// EMA weight of the newest frame.
    #[serde(default = "default_smoothing")]
    smoothing: f32,
}

fn default_noise_floor() -> usize {
    12
}
fn default_saturation() -> usize {
    100
}
fn default_smoothing() -> f32 {
    0.35
}

pub struct PacketVadFactory;

impl ModuleFactory for PacketVadFactory {
    fn default_config(&self) -> Value {
        json!({
            "noise_floor_bytes": default_noise_floor(),
            "saturation_bytes": default_saturation(),
            "smoothing": default_smoothing(),
        })
    }

    fn create(&self, config: Value) -> Result<Arc<dyn Module>> {
        let config: VadConfig = serde_json::from_value(config)
            .map_err(|e| Error::Config(format!("vad module config: {e}")))?;
        if config.saturation_bytes <= config.noise_floor_bytes {
            return Err(Error::Config(
                "vad saturation_bytes must exceed noise_floor_bytes".to_string(),
            ));
        }
        Ok(Arc::new(PacketVadModule {
            config,
            sessions: Mutex::new(HashMap::new()),
        }))
    }
}

#[derive(Debug)]
pub struct PacketVadModule {
    config: VadConfig,
    sessions: Mutex<HashMap<String, f32>>,
}

impl PacketVadModule {
    fn score(&self, session_id: &str, packet_len: usize) -> f32 {
        let raw = if packet_len <= self.config.noise_floor_bytes {
            0.0
        } else {
            let span = (self.config.saturation_bytes - self.config.noise_floor_bytes) as f32;
            (((packet_len - self.config.noise_floor_bytes) as f32) / span).min(1.0)
        };

        let mut sessions = self.sessions.lock().expect("vad state poisoned");
        let ema = sessions.entry(session_id.to_string()).or_insert(0.0);
        *ema = *ema * (1.0 - self.config.smoothing) + raw * self.config.smoothing;
        *ema
    }

    fn reset(&self, session_id: &str) {
        self.sessions
            .lock()
            .expect("vad state poisoned")
            .remove(session_id);
    }
}

#[async_trait]
impl Module for PacketVadModule {
    fn name(&self) -> &str {
        "packet_vad"
    }

    fn description(&self) -> &str {
        "Packet-size voice activity probability for opaque Opus streams"
    }

    async fn init(&self) -> Result<()> {
        Ok(())
    }

    fn tools(&self) -> Vec<ToolSpec> {
        vec![
            ToolSpec::new(
                "detect",
                "Score one Opus frame; returns a smoothed speech probability.",
                json!({
                    "type": "object",
                    "properties": {
                        "session_id": { "type": "string" },
                        "frame": { "type": "string", "description": "base64 Opus packet" }
                    },
                    "required": ["session_id", "frame"]
                }),
            ),
            ToolSpec::new(
                "reset",
                "Drop smoothing state for a session.",
                json!({
                    "type": "object",
                    "properties": { "session_id": { "type": "string" } },
                    "required": ["session_id"]
                }),
            ),
        ]
    }

    async fn call(&self, tool: &str, args: Value) -> Result<Value> {
        let session_id = args
            .get("session_id")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::provider_fatal(self.name(), "missing session_id"))?;

        match tool {
            "detect" => {
                let frame = args
                    .get("frame")
                    .and_then(Value::as_str)
                    .ok_or_else(|| Error::provider_fatal(self.name(), "missing frame"))?;
                let packet = base64::engine::general_purpose::STANDARD
                    .decode(frame)
                    .map_err(|e| Error::provider_fatal(self.name(), format!("bad frame: {e}")))?;
                Ok(json!({ "probability": self.score(session_id, packet.len()) }))
            }
            "reset" => {
                self.reset(session_id);
                Ok(json!({ "reset": true }))
            }
            other => Err(unknown_tool(self.name(), other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn module() -> Arc<dyn Module> {
        PacketVadFactory.create(json!({})).expect("create")
    }

    fn detect(module: &Arc<dyn Module>, session: &str, packet: &[u8]) -> f32 {
        let args = json!({
            "session_id": session,
            "frame": base64::engine::general_purpose::STANDARD.encode(packet),
        });
        let result = futures::executor::block_on(module.call("detect", args)).expect("detect");
        result["probability"].as_f64().expect("probability") as f32
    }

    #[test]
    fn speech_sized_packets_raise_probability() {
        let module = module();
        let mut last = 0.0;
        for _ in 0..12 {
            last = detect(&module, "s1", &[0u8; 90]);
        }
        assert!(last > 0.6, "sustained large packets should score high, got {last}");

        for _ in 0..30 {
            last = detect(&module, "s1", &[0u8; 4]);
        }
        assert!(last < 0.1, "sustained silence should decay, got {last}");
    }

    #[test]
    fn sessions_do_not_share_state() {
        let module = module();
        for _ in 0..10 {
            detect(&module, "loud", &[0u8; 90]);
        }
        let quiet = detect(&module, "quiet", &[0u8; 4]);
        assert!(quiet < 0.05);
    }

    #[test]
    fn reset_clears_session() {
        let module = module();
        for _ in 0..10 {
            detect(&module, "s", &[0u8; 90]);
        }
        futures::executor::block_on(module.call("reset", json!({ "session_id": "s" })))
            .expect("reset");
        let fresh = detect(&module, "s", &[0u8; 4]);
        assert!(fresh < 0.05);
    }
}
