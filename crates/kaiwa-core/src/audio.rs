//! Wire audio parameters.
//!
//! Audio stays opaque Opus end to end: the gateway forwards client packets to
//! the ASR provider untouched and relays provider TTS packets back out. Only
//! the negotiated framing parameters live here.

use serde::{Deserialize, Serialize};

/// Opus, 16 kHz mono, 60 ms frames. Fixed by the device firmware.
pub const OPUS_FORMAT: &str = "opus";
pub const SAMPLE_RATE: u32 = 16_000;
pub const CHANNELS: u8 = 1;
pub const FRAME_DURATION_MS: u32 = 60;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioParams {
    pub format: String,
    pub sample_rate: u32,
    pub channels: u8,
    pub frame_duration: u32,
}

impl Default for AudioParams {
    fn default() -> Self {
        Self {
            format: OPUS_FORMAT.to_string(),
            sample_rate: SAMPLE_RATE,
            channels: CHANNELS,
            frame_duration: FRAME_DURATION_MS,
        }
    }
}

impl AudioParams {
    /// Seconds of speech represented by `frames` packets at the negotiated
    /// frame duration.
    pub fn frames_to_secs(&self, frames: usize) -> f64 {
        frames as f64 * f64::from(self.frame_duration) / 1000.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_params_are_opus_16k_mono() {
        let params = AudioParams::default();
        assert_eq!(params.format, "opus");
        assert_eq!(params.sample_rate, 16_000);
        assert_eq!(params.channels, 1);
        assert_eq!(params.frame_duration, 60);
    }

    #[test]
    fn frame_duration_converts_to_seconds() {
        let params = AudioParams::default();
        assert!((params.frames_to_secs(10) - 0.6).abs() < f64::EPSILON);
    }
}
