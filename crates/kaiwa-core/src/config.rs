//! Typed agent configuration.
//!
//! Agent templates and instances persist two JSON blobs: `agent_config`
//! (persona, audio, function and hardware settings) and `module_params`
//! (which provider module backs each pipeline stage). Both are deserialized
//! into the typed records below once on load; unrecognised keys are retained
//! in `extra` maps so round-tripping a blob written by a newer build loses
//! nothing. Validation happens in [`AgentConfig::validate`], not on reads.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListenMode {
    Auto,
    #[default]
    Manual,
    Realtime,
}

impl ListenMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Manual => "manual",
            Self::Realtime => "realtime",
        }
    }
}

/// Hysteresis pair serialized as `[high, low]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f32; 2]", into = "[f32; 2]")]
pub struct ConfidenceThreshold {
    pub high: f32,
    pub low: f32,
}

impl From<[f32; 2]> for ConfidenceThreshold {
    fn from([high, low]: [f32; 2]) -> Self {
        Self { high, low }
    }
}

impl From<ConfidenceThreshold> for [f32; 2] {
    fn from(t: ConfidenceThreshold) -> Self {
        [t.high, t.low]
    }
}

impl Default for ConfidenceThreshold {
    fn default() -> Self {
        Self { high: 0.6, low: 0.35 }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Character {
    pub name: String,
    pub description: String,
    pub gender: String,
    pub avatar: String,
    pub prompt: String,
    pub voice_name: String,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ChildInfo {
    pub name: String,
    pub gender: String,
    pub birth_date: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Profile {
    pub character: Character,
    pub child_info: ChildInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioSettings {
    pub listen_mode: ListenMode,
    pub vad_threshold: f32,
    /// Seconds of sustained silence that end an utterance.
    pub silence_timeout: f32,
    pub min_recording_duration: f32,
    pub max_recording_duration: f32,
    /// Seconds without audio or text before the connection is closed.
    pub close_connection_no_voice_time: f32,
    pub confidence_threshold: ConfidenceThreshold,
    pub enable_baby_talk_mode: bool,
    pub language: String,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Default for AudioSettings {
    fn default() -> Self {
        Self {
            listen_mode: ListenMode::Manual,
            vad_threshold: 0.5,
            silence_timeout: 0.5,
            min_recording_duration: 0.5,
            max_recording_duration: 60.0,
            close_connection_no_voice_time: 120.0,
            confidence_threshold: ConfidenceThreshold::default(),
            enable_baby_talk_mode: false,
            language: "zh-CN".to_string(),
            extra: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InterruptPolicy {
    pub enabled: bool,
    pub min_confidence: f32,
    pub max_queue_len: usize,
    pub queue_timeout_sec: f32,
    pub min_interrupt_interval_sec: f32,
}

impl Default for InterruptPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            min_confidence: 0.5,
            max_queue_len: 8,
            queue_timeout_sec: 10.0,
            min_interrupt_interval_sec: 0.8,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FunctionSettings {
    pub chat_language: String,
    pub chat_voice_speed: f32,
    pub chat_control_language: String,
    pub chat_control_voice_speed: f32,
    pub chat_control_play_music: bool,
    pub chat_control_switch_role: bool,
    pub enable_user_clone_voice: bool,
    pub enable_opening_say_hello: bool,
    /// "HH:MM", local time the daily growth summary is scheduled at.
    pub daily_summary_time: String,
    pub interrupt_policy: InterruptPolicy,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Default for FunctionSettings {
    fn default() -> Self {
        Self {
            chat_language: "zh-CN".to_string(),
            chat_voice_speed: 1.0,
            chat_control_language: "zh-CN".to_string(),
            chat_control_voice_speed: 1.0,
            chat_control_play_music: false,
            chat_control_switch_role: false,
            enable_user_clone_voice: true,
            enable_opening_say_hello: false,
            daily_summary_time: "20:30".to_string(),
            interrupt_policy: InterruptPolicy::default(),
            extra: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HardwareSettings {
    pub volume: u8,
    pub light_brightness: u8,
    pub light_color: String,
    pub light_mode: String,
    pub auto_brightness: bool,
    pub night_mode: bool,
    pub volume_limit: u8,
}

impl Default for HardwareSettings {
    fn default() -> Self {
        Self {
            volume: 60,
            light_brightness: 80,
            light_color: "#ffffff".to_string(),
            light_mode: "steady".to_string(),
            auto_brightness: true,
            night_mode: false,
            volume_limit: 85,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub profile: Profile,
    pub audio_settings: AudioSettings,
    pub function_settings: FunctionSettings,
    pub hardware_settings: HardwareSettings,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl AgentConfig {
    pub fn from_json(value: &Value) -> Result<Self> {
        let config: Self = serde_json::from_value(value.clone())
            .map_err(|e| Error::Config(format!("agent_config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let audio = &self.audio_settings;
        if !(0.0..=1.0).contains(&audio.vad_threshold) {
            return Err(Error::Config(format!(
                "vad_threshold {} out of [0, 1]",
                audio.vad_threshold
            )));
        }
        let t = audio.confidence_threshold;
        if t.low > t.high {
            return Err(Error::Config(format!(
                "confidence_threshold low {} above high {}",
                t.low, t.high
            )));
        }
        if audio.min_recording_duration > audio.max_recording_duration {
            return Err(Error::Config(
                "min_recording_duration exceeds max_recording_duration".to_string(),
            ));
        }
        Ok(())
    }

    /// Copilot track prompt override, when the blob carries one.
    pub fn copilot_prompt(&self) -> Option<&str> {
        self.extra.get("copilot_prompt").and_then(Value::as_str)
    }
}

/// Per-stage provider selection: `{ "<kind>": { "code": "...", "config": {...} } }`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ModuleParams {
    pub vad: Option<ModuleSelection>,
    pub asr: Option<ModuleSelection>,
    pub llm: Option<ModuleSelection>,
    pub tts: Option<ModuleSelection>,
    pub memory: Option<ModuleSelection>,
    pub intent: Option<ModuleSelection>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleSelection {
    pub code: String,
    #[serde(default)]
    pub config: Value,
}

impl ModuleParams {
    pub fn from_json(value: &Value) -> Result<Self> {
        serde_json::from_value(value.clone())
            .map_err(|e| Error::Config(format!("module_params: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn empty_blob_yields_defaults() {
        let config = AgentConfig::from_json(&json!({})).expect("defaults should load");
        assert_eq!(config.audio_settings.listen_mode, ListenMode::Manual);
        assert!((config.audio_settings.silence_timeout - 0.5).abs() < f32::EPSILON);
        assert!(config.function_settings.interrupt_policy.enabled);
    }

    #[test]
    fn confidence_threshold_reads_pair() {
        let config = AgentConfig::from_json(&json!({
            "audio_settings": {
                "listen_mode": "realtime",
                "vad_threshold": 0.3,
                "confidence_threshold": [0.7, 0.4]
            }
        }))
        .expect("should load");
        assert_eq!(config.audio_settings.listen_mode, ListenMode::Realtime);
        let t = config.audio_settings.confidence_threshold;
        assert!((t.high - 0.7).abs() < f32::EPSILON);
        assert!((t.low - 0.4).abs() < f32::EPSILON);
    }

    #[test]
    fn inverted_hysteresis_is_rejected() {
        let err = AgentConfig::from_json(&json!({
            "audio_settings": { "confidence_threshold": [0.3, 0.8] }
        }))
        .expect_err("low above high must fail validation");
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn unknown_keys_survive_round_trip() {
        let blob = json!({
            "profile": { "character": { "name": "星星", "prompt": "你是{{child_name}}的伙伴" } },
            "copilot_prompt": "你是领航员",
            "future_section": { "x": 1 }
        });
        let config = AgentConfig::from_json(&blob).expect("should load");
        assert_eq!(config.copilot_prompt(), Some("你是领航员"));
        let back = serde_json::to_value(&config).expect("serialize");
        assert_eq!(back["future_section"]["x"], 1);
        assert_eq!(back["profile"]["character"]["name"], "星星");
    }

    #[test]
    fn module_params_parse_selection() {
        let params = ModuleParams::from_json(&json!({
            "llm": { "code": "bailian", "config": { "model": "qwen-plus" } },
            "tts": { "code": "azure" }
        }))
        .expect("should parse");
        assert_eq!(params.llm.as_ref().map(|s| s.code.as_str()), Some("bailian"));
        assert!(params.vad.is_none());
    }
}
