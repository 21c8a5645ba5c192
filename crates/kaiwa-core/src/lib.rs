pub mod audio;
pub mod config;
pub mod error;
pub mod protocol;
pub mod text;

pub use audio::AudioParams;
pub use config::{AgentConfig, AudioSettings, ConfidenceThreshold, FunctionSettings,
    HardwareSettings, InterruptPolicy, ListenMode, ModuleParams, ModuleSelection, Profile};
pub use error::{Error, ErrorKind, Result};
pub use protocol::{ClientFrame, ListenState, ServerFrame, TtsState};
pub use text::{parse_emotion, parse_voice_segments, strip_json_fence, SentenceAccumulator};
