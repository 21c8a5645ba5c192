//! JSON control frames exchanged over the chat WebSocket.
//!
//! Textual frames carry a `type` discriminator; binary frames are raw Opus
//! packets and never reach this module. Unknown client frame types are
//! ignored by the gateway for forward compatibility, so parsing happens in
//! two steps there (peek at `type`, then deserialize).

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::audio::AudioParams;
use crate::config::ListenMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListenState {
    Start,
    Stop,
    Detect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TtsState {
    Start,
    Stop,
    SentenceStart,
}

/// Client → server frames.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Hello {
        version: u32,
        transport: String,
        #[serde(default)]
        features: Option<Value>,
        #[serde(default)]
        audio_params: Option<AudioParams>,
    },
    Listen {
        state: ListenState,
        #[serde(default)]
        mode: Option<ListenMode>,
        #[serde(default)]
        text: Option<String>,
        #[serde(default)]
        agent_id: Option<i64>,
        #[serde(default)]
        session_id: Option<String>,
    },
    Text {
        content: String,
        agent_id: i64,
        #[serde(default)]
        session_id: Option<String>,
    },
    Abort {
        #[serde(default)]
        reason: Option<String>,
        #[serde(default)]
        session_id: Option<String>,
    },
    Mcp {
        payload: Value,
        #[serde(default)]
        session_id: Option<String>,
    },
}

/// Server → client frames.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Hello {
        transport: String,
        audio_params: AudioParams,
        session_id: String,
    },
    Llm {
        #[serde(skip_serializing_if = "Option::is_none")]
        content: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        emotion: Option<String>,
        finished: bool,
    },
    Tts {
        state: TtsState,
        #[serde(skip_serializing_if = "Option::is_none")]
        text: Option<String>,
    },
    Error {
        code: u16,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        details: Option<Value>,
    },
    Mcp {
        payload: Value,
    },
}

impl ServerFrame {
    pub fn llm_sentence(content: String, emotion: Option<String>) -> Self {
        Self::Llm {
            content: Some(content),
            emotion,
            finished: false,
        }
    }

    pub fn llm_finished() -> Self {
        Self::Llm {
            content: None,
            emotion: None,
            finished: true,
        }
    }

    pub fn tts(state: TtsState) -> Self {
        Self::Tts { state, text: None }
    }

    pub fn sentence_start(text: String) -> Self {
        Self::Tts {
            state: TtsState::SentenceStart,
            text: Some(text),
        }
    }

    pub fn error(code: u16, message: impl Into<String>) -> Self {
        Self::Error {
            code,
            message: message.into(),
            details: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hello_frame_parses_with_optional_fields() {
        let frame: ClientFrame = serde_json::from_str(
            r#"{"type":"hello","version":1,"transport":"websocket"}"#,
        )
        .expect("hello should parse");
        match frame {
            ClientFrame::Hello { version, transport, features, audio_params } => {
                assert_eq!(version, 1);
                assert_eq!(transport, "websocket");
                assert!(features.is_none());
                assert!(audio_params.is_none());
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn listen_states_use_snake_case() {
        let frame: ClientFrame = serde_json::from_str(
            r#"{"type":"listen","state":"start","mode":"auto","agent_id":3}"#,
        )
        .expect("listen should parse");
        match frame {
            ClientFrame::Listen { state, mode, agent_id, .. } => {
                assert_eq!(state, ListenState::Start);
                assert_eq!(mode, Some(ListenMode::Auto));
                assert_eq!(agent_id, Some(3));
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn tts_sentence_start_carries_text() {
        let json = serde_json::to_value(ServerFrame::sentence_start("你好呀".to_string()))
            .expect("serialize");
        assert_eq!(json["type"], "tts");
        assert_eq!(json["state"], "sentence_start");
        assert_eq!(json["text"], "你好呀");
    }

    #[test]
    fn finished_llm_frame_omits_empty_content() {
        let json = serde_json::to_value(ServerFrame::llm_finished()).expect("serialize");
        assert_eq!(json["type"], "llm");
        assert_eq!(json["finished"], true);
        assert!(json.get("content").is_none());
    }
}
