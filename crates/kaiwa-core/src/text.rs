//! Text utilities shared by the pipeline: sentence segmentation of streamed
//! LLM output, emotion tag extraction, inline voice-switch commands and
//! tolerant JSON extraction from model replies.

use serde_json::Value;

/// Sentence-terminal punctuation, Chinese and ASCII.
const TERMINALS: &[char] = &['。', '！', '？', '；', '…', '.', '!', '?', ';', '\n'];

/// Characters that may trail a terminal and belong to the same sentence.
const CLOSERS: &[char] = &['”', '"', '\'', '）', ')', '】', ']'];

/// Buffers streamed LLM deltas and yields complete sentences for TTS.
///
/// Splits on sentence-terminal punctuation; once the buffer grows past
/// `max_len` without a terminal it falls back to the last whitespace so a
/// run-on chunk still reaches the synthesizer in bounded pieces.
#[derive(Debug)]
pub struct SentenceAccumulator {
    buffer: String,
    max_len: usize,
}

impl Default for SentenceAccumulator {
    fn default() -> Self {
        Self::new(120)
    }
}

impl SentenceAccumulator {
    pub fn new(max_len: usize) -> Self {
        Self {
            buffer: String::new(),
            max_len: max_len.max(8),
        }
    }

    /// Feed a delta, returning any sentences completed by it, in order.
    pub fn push(&mut self, delta: &str) -> Vec<String> {
        self.buffer.push_str(delta);
        let mut sentences = Vec::new();

        loop {
            match self.split_point() {
                Some(at) => {
                    let rest = self.buffer.split_off(at);
                    let sentence = std::mem::replace(&mut self.buffer, rest);
                    let sentence = sentence.trim();
                    if !sentence.is_empty() {
                        sentences.push(sentence.to_string());
                    }
                }
                None => break,
            }
        }

        sentences
    }

    /// Drain whatever remains; call once the stream finishes.
    pub fn flush(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buffer);
        let rest = rest.trim();
        if rest.is_empty() {
            None
        } else {
            Some(rest.to_string())
        }
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.trim().is_empty()
    }

    fn split_point(&self) -> Option<usize> {
        let mut terminal_end = None;
        for (idx, ch) in self.buffer.char_indices() {
            let end = idx + ch.len_utf8();
            if TERMINALS.contains(&ch) {
                terminal_end = Some(end);
            } else if terminal_end.is_some() && CLOSERS.contains(&ch) {
                terminal_end = Some(end);
            } else if let Some(at) = terminal_end {
                return Some(at);
            }
        }
        if let Some(at) = terminal_end {
            // Terminal at the very end of the buffer: the sentence is done.
            if at == self.buffer.len() {
                return Some(at);
            }
        }

        // Whitespace fallback for overlong buffers.
        if self.buffer.chars().count() > self.max_len {
            let cut = self
                .buffer
                .char_indices()
                .filter(|(_, c)| c.is_whitespace())
                .map(|(i, c)| i + c.len_utf8())
                .last();
            if let Some(at) = cut {
                return Some(at);
            }
            // No whitespace at all (common for Chinese): hard cut at max_len.
            return self
                .buffer
                .char_indices()
                .nth(self.max_len)
                .map(|(i, _)| i);
        }

        None
    }
}

/// Leading-emoji emotion extraction.
///
/// The character prompt asks the model to prefix each reply with one mood
/// emoji; clients use the label to pick an expression. Returns the label and
/// the text with the marker stripped.
pub fn parse_emotion(text: &str) -> (Option<&'static str>, &str) {
    let trimmed = text.trim_start();
    let Some(first) = trimmed.chars().next() else {
        return (None, text);
    };
    let emotion = match first {
        '😊' | '😄' | '😁' | '🙂' => Some("happy"),
        '😢' | '😭' | '😔' => Some("sad"),
        '😡' | '😠' => Some("angry"),
        '😮' | '😲' => Some("surprised"),
        '😱' => Some("afraid"),
        '🤔' => Some("thinking"),
        '😴' => Some("sleepy"),
        '❤' | '🥰' => Some("loving"),
        _ => None,
    };
    match emotion {
        Some(label) => {
            let rest = trimmed[first.len_utf8()..].trim_start();
            // Strip a variation selector left behind by emoji like ❤️.
            let rest = rest.trim_start_matches('\u{fe0f}').trim_start();
            (Some(label), rest)
        }
        None => (None, text),
    }
}

/// One synthesis segment and the voice it should use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoiceSegment {
    pub text: String,
    /// `None` keeps whatever voice is current.
    pub voice: Option<String>,
}

/// Split a sentence on inline `<voice|name>` commands.
///
/// Text before the first command keeps the current voice; each command
/// switches the voice for the text that follows it. The command markers are
/// not part of any segment.
pub fn parse_voice_segments(text: &str) -> Vec<VoiceSegment> {
    let mut segments = Vec::new();
    let mut voice: Option<String> = None;
    let mut rest = text;

    while let Some(start) = rest.find("<voice|") {
        if let Some(end_rel) = rest[start..].find('>') {
            let before = rest[..start].trim();
            if !before.is_empty() {
                segments.push(VoiceSegment {
                    text: before.to_string(),
                    voice: voice.clone(),
                });
            }
            let name = rest[start + "<voice|".len()..start + end_rel].trim();
            if !name.is_empty() {
                voice = Some(name.to_string());
            }
            rest = &rest[start + end_rel + 1..];
        } else {
            break;
        }
    }

    let tail = rest.trim();
    if !tail.is_empty() {
        segments.push(VoiceSegment {
            text: tail.to_string(),
            voice,
        });
    }

    if segments.is_empty() {
        return vec![VoiceSegment {
            text: String::new(),
            voice: None,
        }];
    }
    segments
}

/// Parse JSON out of a model reply that may be wrapped in a ``` fence.
pub fn strip_json_fence(content: &str) -> Result<Value, serde_json::Error> {
    let trimmed = content.trim();
    let inner = if trimmed.starts_with("```") {
        let mut lines = trimmed.lines();
        lines.next(); // opening fence, possibly ```json
        let body: Vec<&str> = lines.take_while(|line| !line.trim_start().starts_with("```")).collect();
        body.join("\n")
    } else {
        trimmed.to_string()
    };
    serde_json::from_str(inner.trim())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_on_chinese_terminals() {
        let mut acc = SentenceAccumulator::default();
        let mut out = acc.push("你好呀！今天我们");
        assert_eq!(out, vec!["你好呀！"]);
        out.extend(acc.push("一起读绘本好不好？"));
        assert_eq!(out, vec!["你好呀！", "一起读绘本好不好？"]);
        assert!(acc.flush().is_none());
    }

    #[test]
    fn splits_on_ascii_terminals_across_deltas() {
        let mut acc = SentenceAccumulator::default();
        assert!(acc.push("Sure").is_empty());
        assert!(acc.push(", let's count").is_empty());
        assert_eq!(acc.push(". One, two!").len(), 2);
    }

    #[test]
    fn closing_quote_stays_with_its_sentence() {
        let mut acc = SentenceAccumulator::default();
        let out = acc.push("他说：“晚安。”然后");
        assert_eq!(out, vec!["他说：“晚安。”"]);
        assert_eq!(acc.flush().as_deref(), Some("然后"));
    }

    #[test]
    fn overlong_buffer_falls_back_to_whitespace() {
        let mut acc = SentenceAccumulator::new(10);
        let out = acc.push("one two three four five six seven");
        assert!(!out.is_empty());
        assert!(out[0].starts_with("one"));
    }

    #[test]
    fn overlong_cjk_buffer_hard_cuts() {
        let mut acc = SentenceAccumulator::new(8);
        let out = acc.push("这是一段没有任何标点的很长文字啊");
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].chars().count(), 8);
    }

    #[test]
    fn flush_returns_trailing_fragment() {
        let mut acc = SentenceAccumulator::default();
        assert!(acc.push("未完的话").is_empty());
        assert_eq!(acc.flush().as_deref(), Some("未完的话"));
        assert!(acc.flush().is_none());
    }

    #[test]
    fn leading_emoji_maps_to_emotion() {
        let (emotion, rest) = parse_emotion("😊今天也要加油哦！");
        assert_eq!(emotion, Some("happy"));
        assert_eq!(rest, "今天也要加油哦！");

        let (emotion, rest) = parse_emotion("没有表情的句子");
        assert_eq!(emotion, None);
        assert_eq!(rest, "没有表情的句子");
    }

    #[test]
    fn voice_commands_split_segments() {
        let segments = parse_voice_segments("大家好<voice|mama>宝宝晚安<voice|original>再见");
        assert_eq!(
            segments,
            vec![
                VoiceSegment { text: "大家好".into(), voice: None },
                VoiceSegment { text: "宝宝晚安".into(), voice: Some("mama".into()) },
                VoiceSegment { text: "再见".into(), voice: Some("original".into()) },
            ]
        );
    }

    #[test]
    fn plain_text_is_one_segment() {
        let segments = parse_voice_segments("就一句话");
        assert_eq!(segments.len(), 1);
        assert!(segments[0].voice.is_none());
    }

    #[test]
    fn fenced_json_parses() {
        let value = strip_json_fence("```json\n{\"label\": \"wait\", \"score\": 0.4}\n```")
            .expect("fenced json should parse");
        assert_eq!(value["label"], "wait");

        let value = strip_json_fence("{\"label\":\"interrupt\"}").expect("bare json");
        assert_eq!(value["label"], "interrupt");
    }
}
