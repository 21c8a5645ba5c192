//! Utterance segmentation over the incoming Opus stream.
//!
//! Three listening modes:
//! - `manual`: buffer between `listen:start` and `listen:stop`; VAD only
//!   enforces the silence timeout safety net.
//! - `auto`: VAD segments the stream; end of utterance closes the buffer.
//! - `realtime`: like auto, but segment boundaries also fire while the
//!   assistant speaks (barge-in is always armed).
//!
//! Speech detection applies hysteresis over the per-frame probability from
//! the VAD module: entering speech requires `prob >= high`, leaving requires
//! `prob <= low` sustained for `silence_timeout`. Utterances shorter than
//! `min_recording_duration` are discarded; buffers hitting
//! `max_recording_duration` are force-closed.

use kaiwa_core::config::{AudioSettings, ListenMode};

/// A complete buffered utterance, ready for ASR.
#[derive(Debug, Clone)]
pub struct Utterance {
    /// Raw Opus packets in arrival order.
    pub packets: Vec<Vec<u8>>,
    pub duration_secs: f64,
    /// Closed by the max-duration cut rather than detected silence.
    pub forced: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Speech {
    Quiet,
    Active { silent_frames: u32 },
}

#[derive(Debug)]
pub struct ListenController {
    mode: ListenMode,
    frame_secs: f64,
    high: f32,
    low: f32,
    silence_frames_needed: u32,
    min_frames: usize,
    max_frames: usize,
    buffer: Vec<Vec<u8>>,
    speech: Speech,
    armed: bool,
}

impl ListenController {
    pub fn new(settings: &AudioSettings, frame_duration_ms: u32) -> Self {
        let frame_secs = f64::from(frame_duration_ms) / 1000.0;
        let silence_frames_needed =
            (f64::from(settings.silence_timeout) / frame_secs).ceil().max(1.0) as u32;
        let min_frames = (f64::from(settings.min_recording_duration) / frame_secs).ceil() as usize;
        let max_frames =
            (f64::from(settings.max_recording_duration) / frame_secs).ceil().max(1.0) as usize;
        Self {
            mode: settings.listen_mode,
            frame_secs,
            high: settings.confidence_threshold.high,
            low: settings.confidence_threshold.low,
            silence_frames_needed,
            min_frames,
            max_frames,
            buffer: Vec::new(),
            speech: Speech::Quiet,
            // Manual mode only buffers between listen:start and listen:stop.
            armed: settings.listen_mode != ListenMode::Manual,
        }
    }

    pub fn mode(&self) -> ListenMode {
        self.mode
    }

    /// Whether a frame just crossed the speech-entry threshold. Used for
    /// barge-in while the assistant speaks.
    pub fn speech_started(&self) -> bool {
        matches!(self.speech, Speech::Active { silent_frames: 0 }) && self.buffer.len() <= 1
    }

    /// `listen:start`: arm manual buffering (no-op in other modes).
    pub fn start(&mut self, mode: Option<ListenMode>) {
        if let Some(mode) = mode {
            self.mode = mode;
        }
        self.armed = true;
        if self.mode == ListenMode::Manual {
            self.buffer.clear();
            self.speech = Speech::Quiet;
        }
    }

    /// `listen:stop`: close the manual buffer. No-op outside manual capture.
    pub fn stop(&mut self) -> Option<Utterance> {
        if self.mode != ListenMode::Manual || self.buffer.is_empty() {
            return None;
        }
        self.take_utterance(false)
    }

    /// Feed one Opus frame with its VAD probability. Returns a finished
    /// utterance when a segment boundary is reached.
    pub fn push_frame(&mut self, packet: Vec<u8>, probability: f32) -> Option<Utterance> {
        if !self.armed {
            return None;
        }

        match self.mode {
            ListenMode::Manual => {
                self.buffer.push(packet);
                // Silence timeout only bounds runaway manual captures.
                if self.buffer.len() >= self.max_frames {
                    return self.take_utterance(true);
                }
                None
            }
            ListenMode::Auto | ListenMode::Realtime => {
                match self.speech {
                    Speech::Quiet => {
                        if probability >= self.high {
                            self.speech = Speech::Active { silent_frames: 0 };
                            self.buffer.push(packet);
                        }
                        // Sub-threshold frames before speech are dropped.
                        None
                    }
                    Speech::Active { silent_frames } => {
                        self.buffer.push(packet);
                        if self.buffer.len() >= self.max_frames {
                            return self.take_utterance(true);
                        }
                        if probability <= self.low {
                            let silent_frames = silent_frames + 1;
                            if silent_frames >= self.silence_frames_needed {
                                return self.take_utterance(false);
                            }
                            self.speech = Speech::Active { silent_frames };
                        } else if probability >= self.high {
                            self.speech = Speech::Active { silent_frames: 0 };
                        }
                        // Probabilities between low and high leave the
                        // silence counter untouched (hysteresis band).
                        None
                    }
                }
            }
        }
    }

    fn take_utterance(&mut self, forced: bool) -> Option<Utterance> {
        let packets = std::mem::take(&mut self.buffer);
        self.speech = Speech::Quiet;
        if self.mode == ListenMode::Manual {
            self.armed = false;
        }
        if packets.len() < self.min_frames {
            tracing::debug!(
                frames = packets.len(),
                "utterance under min_recording_duration, dropped"
            );
            return None;
        }
        let duration_secs = packets.len() as f64 * self.frame_secs;
        Some(Utterance { packets, duration_secs, forced })
    }
}

/// Length-prefix Opus packets for transport to the ASR provider, which owns
/// decoding. u16 big-endian size per packet.
pub fn frame_packets(packets: &[Vec<u8>]) -> Vec<u8> {
    let total: usize = packets.iter().map(|p| p.len() + 2).sum();
    let mut out = Vec::with_capacity(total);
    for packet in packets {
        out.extend_from_slice(&(packet.len() as u16).to_be_bytes());
        out.extend_from_slice(packet);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use kaiwa_core::config::ConfidenceThreshold;

    fn settings(mode: ListenMode) -> AudioSettings {
        AudioSettings {
            listen_mode: mode,
            silence_timeout: 0.5,
            min_recording_duration: 0.5,
            max_recording_duration: 60.0,
            confidence_threshold: ConfidenceThreshold { high: 0.6, low: 0.35 },
            ..AudioSettings::default()
        }
    }

    fn frame() -> Vec<u8> {
        vec![0u8; 40]
    }

    #[test]
    fn auto_mode_segments_on_sustained_silence() {
        let mut ctl = ListenController::new(&settings(ListenMode::Auto), 60);

        // 600 ms of speech.
        for _ in 0..10 {
            assert!(ctl.push_frame(frame(), 0.9).is_none());
        }
        // 600 ms of silence crosses the 500 ms timeout.
        let mut utterance = None;
        for _ in 0..10 {
            if let Some(u) = ctl.push_frame(frame(), 0.1) {
                utterance = Some(u);
                break;
            }
        }
        let utterance = utterance.expect("silence should close the segment");
        assert!(!utterance.forced);
        assert!(utterance.duration_secs >= 0.6);
    }

    #[test]
    fn hysteresis_band_does_not_end_speech() {
        let mut ctl = ListenController::new(&settings(ListenMode::Auto), 60);
        for _ in 0..10 {
            assert!(ctl.push_frame(frame(), 0.9).is_none());
        }
        // Oscillation between low and high thresholds never ends the segment.
        for _ in 0..100 {
            assert!(ctl.push_frame(frame(), 0.45).is_none());
        }
    }

    #[test]
    fn sub_threshold_lead_in_is_ignored() {
        let mut ctl = ListenController::new(&settings(ListenMode::Auto), 60);
        for _ in 0..20 {
            assert!(ctl.push_frame(frame(), 0.2).is_none());
        }
        assert!(!ctl.speech_started());
        ctl.push_frame(frame(), 0.8);
        assert!(ctl.speech_started());
    }

    #[test]
    fn short_utterance_is_dropped() {
        let mut ctl = ListenController::new(&settings(ListenMode::Auto), 60);
        // 3 frames (180 ms) of speech, under the 500 ms minimum.
        for _ in 0..3 {
            ctl.push_frame(frame(), 0.9);
        }
        for _ in 0..20 {
            assert!(ctl.push_frame(frame(), 0.0).is_none());
        }
    }

    #[test]
    fn max_duration_forces_segmentation() {
        let mut settings = settings(ListenMode::Auto);
        settings.max_recording_duration = 1.2;
        let mut ctl = ListenController::new(&settings, 60);

        let mut forced = None;
        for _ in 0..40 {
            if let Some(u) = ctl.push_frame(frame(), 0.9) {
                forced = Some(u);
                break;
            }
        }
        let utterance = forced.expect("max duration must cut the buffer");
        assert!(utterance.forced);
        assert!(utterance.duration_secs <= 1.21);
    }

    #[test]
    fn manual_mode_waits_for_stop() {
        let mut ctl = ListenController::new(&settings(ListenMode::Manual), 60);
        assert!(ctl.stop().is_none(), "stop with no capture is a no-op");

        ctl.start(None);
        for _ in 0..10 {
            assert!(ctl.push_frame(frame(), 0.0).is_none());
        }
        let utterance = ctl.stop().expect("stop closes the buffer");
        assert_eq!(utterance.packets.len(), 10);

        // A second stop without a new start is a no-op.
        assert!(ctl.stop().is_none());
    }

    #[test]
    fn manual_mode_ignores_frames_after_stop() {
        let mut ctl = ListenController::new(&settings(ListenMode::Manual), 60);
        ctl.start(None);
        for _ in 0..10 {
            ctl.push_frame(frame(), 0.0);
        }
        ctl.stop();
        assert!(ctl.push_frame(frame(), 0.9).is_none());
        assert!(ctl.stop().is_none());
    }

    #[test]
    fn packet_framing_is_length_prefixed() {
        let framed = frame_packets(&[vec![1, 2, 3], vec![4]]);
        assert_eq!(framed, vec![0, 3, 1, 2, 3, 0, 1, 4]);
    }
}
