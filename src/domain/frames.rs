//! JSON frame extraction
//!
//! Nodes write sensor messages as JSON objects, sometimes several per read,
//! sometimes split across reads. The extractor matches the first `{` with the
//! first `}` after it. There is no nesting or string awareness: sensor payloads
//! must never contain literal braces.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use tracing::{trace, warn};

pub const DEFAULT_MAX_PENDING_BYTES: usize = 64 * 1024;

/// What happens to a trailing `{...` that has no closing brace yet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameRecovery {
    /// Throw the partial text away
    #[default]
    Drop,
    /// Keep it and prefix it to the next push
    Retain,
}

/// Incremental extractor for one byte stream
#[derive(Debug)]
pub struct FrameExtractor {
    recovery: FrameRecovery,
    max_pending: usize,
    buffer: String,
    cursor: usize,
}

impl FrameExtractor {
    pub fn new(recovery: FrameRecovery) -> Self {
        Self::with_limit(recovery, DEFAULT_MAX_PENDING_BYTES)
    }

    pub fn with_limit(recovery: FrameRecovery, max_pending: usize) -> Self {
        Self {
            recovery,
            max_pending,
            buffer: String::new(),
            cursor: 0,
        }
    }

    pub fn recovery(&self) -> FrameRecovery {
        self.recovery
    }

    /// Bytes waiting for the rest of their frame
    pub fn pending(&self) -> &str {
        &self.buffer[self.cursor..]
    }

    /// Append received bytes and return the frames now available.
    ///
    /// Frames are parsed lazily while iterating; whatever the iterator does
    /// not consume stays buffered.
    pub fn push(&mut self, bytes: &[u8]) -> Frames<'_> {
        self.buffer.drain(..self.cursor);
        self.cursor = 0;

        let text = String::from_utf8_lossy(bytes);
        let text = text.trim_end_matches('\0');

        // Only the retained remainder is bounded; the new read is always scanned
        if !self.buffer.is_empty() && self.buffer.len() + text.len() > self.max_pending {
            warn!(
                "Dropping {} buffered bytes without a complete frame",
                self.buffer.len()
            );
            self.buffer.clear();
        }
        self.buffer.push_str(text);

        let mut queue = VecDeque::new();
        let trimmed = self.buffer.trim();
        if trimmed.starts_with('[') {
            if let Ok(messages) = serde_json::from_str::<Vec<Value>>(trimmed) {
                queue.extend(messages);
                self.buffer.clear();
            }
        }

        Frames {
            extractor: self,
            queue,
        }
    }

    fn next_fragment(&mut self) -> Option<(usize, usize)> {
        let start = match self.buffer[self.cursor..].find('{') {
            Some(offset) => self.cursor + offset,
            None => {
                self.buffer.clear();
                self.cursor = 0;
                return None;
            }
        };

        match self.buffer[start..].find('}') {
            Some(offset) => {
                let end = start + offset + 1;
                self.cursor = end;
                Some((start, end))
            }
            None => {
                match self.recovery {
                    FrameRecovery::Drop => {
                        trace!("Dropping partial frame: {}", &self.buffer[start..]);
                        self.buffer.clear();
                    }
                    FrameRecovery::Retain => {
                        self.buffer.drain(..start);
                    }
                }
                self.cursor = 0;
                None
            }
        }
    }
}

/// Lazy sequence of parsed frames, see [`FrameExtractor::push`]
pub struct Frames<'a> {
    extractor: &'a mut FrameExtractor,
    queue: VecDeque<Value>,
}

impl Iterator for Frames<'_> {
    type Item = Value;

    fn next(&mut self) -> Option<Value> {
        loop {
            if let Some(value) = self.queue.pop_front() {
                return Some(value);
            }

            let (start, end) = self.extractor.next_fragment()?;
            let fragment = &self.extractor.buffer[start..end];
            match serde_json::from_str::<Value>(fragment) {
                Ok(Value::Array(items)) => self.queue.extend(items),
                Ok(value) => return Some(value),
                Err(e) => warn!("Not a valid json: {} ({})", fragment, e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn extract(extractor: &mut FrameExtractor, input: &str) -> Vec<Value> {
        extractor.push(input.as_bytes()).collect()
    }

    #[test]
    fn test_concatenated_objects() {
        let mut ex = FrameExtractor::new(FrameRecovery::Drop);
        let frames = extract(&mut ex, r#"{"a":1}{"b":2}"#);
        assert_eq!(frames, vec![json!({"a": 1}), json!({"b": 2})]);
    }

    #[test]
    fn test_newline_separated_objects() {
        let mut ex = FrameExtractor::new(FrameRecovery::Drop);
        let frames = extract(&mut ex, "{\"a\":1}\n{\"b\":2}\n{\"c\":3}\n");
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[2], json!({"c": 3}));
    }

    #[test]
    fn test_malformed_fragment_skipped() {
        let mut ex = FrameExtractor::new(FrameRecovery::Drop);
        let frames = extract(&mut ex, r#"{"a":1}{bad}{"b":2}"#);
        assert_eq!(frames, vec![json!({"a": 1}), json!({"b": 2})]);

        // Nothing of the consumed buffer is replayed
        assert!(ex.push(b"").next().is_none());
        assert_eq!(ex.pending(), "");
    }

    #[test]
    fn test_empty_and_padding() {
        let mut ex = FrameExtractor::new(FrameRecovery::Retain);
        assert!(extract(&mut ex, "").is_empty());
        assert!(extract(&mut ex, "   \n\t ").is_empty());
        assert!(ex.push(&[0u8; 32]).next().is_none());
    }

    #[test]
    fn test_nul_padded_buffer() {
        let mut ex = FrameExtractor::new(FrameRecovery::Drop);
        let mut buf = br#"{"a":1}"#.to_vec();
        buf.resize(64, 0);
        assert_eq!(ex.push(&buf).collect::<Vec<_>>(), vec![json!({"a": 1})]);
    }

    #[test]
    fn test_json_array_of_messages() {
        let mut ex = FrameExtractor::new(FrameRecovery::Drop);
        let frames = extract(&mut ex, r#"[{"a":1},{"b":2}]"#);
        assert_eq!(frames, vec![json!({"a": 1}), json!({"b": 2})]);
    }

    #[test]
    fn test_partial_frame_dropped_in_drop_mode() {
        let mut ex = FrameExtractor::new(FrameRecovery::Drop);
        let frames = extract(&mut ex, r#"{"a":1}{"b":"#);
        assert_eq!(frames, vec![json!({"a": 1})]);
        assert_eq!(ex.pending(), "");

        // The tail of the split message cannot be recovered
        assert!(extract(&mut ex, r#"2}"#).is_empty());
    }

    #[test]
    fn test_partial_frame_reassembled_in_retain_mode() {
        let mut ex = FrameExtractor::new(FrameRecovery::Retain);
        let frames = extract(&mut ex, r#"{"a":1}{"b":"#);
        assert_eq!(frames, vec![json!({"a": 1})]);
        assert_eq!(ex.pending(), r#"{"b":"#);

        let frames = extract(&mut ex, r#"2}{"c":3}"#);
        assert_eq!(frames, vec![json!({"b": 2}), json!({"c": 3})]);
        assert_eq!(ex.pending(), "");
    }

    #[test]
    fn test_retained_buffer_is_bounded() {
        let mut ex = FrameExtractor::with_limit(FrameRecovery::Retain, 16);
        assert!(extract(&mut ex, r#"{"abcdef":"#).is_empty());
        assert!(extract(&mut ex, r#""ghijklmnop""#).is_empty());
        assert_eq!(ex.pending(), "");
    }

    #[test]
    fn test_overflow_keeps_frames_of_current_push() {
        let mut ex = FrameExtractor::with_limit(FrameRecovery::Retain, 16);
        assert!(extract(&mut ex, r#"{"stale":"#).is_empty());
        assert_eq!(ex.pending(), r#"{"stale":"#);

        let frames = extract(&mut ex, r#"{"a":1}{"b":2}{"c":"#);
        assert_eq!(frames, vec![json!({"a": 1}), json!({"b": 2})]);
        assert_eq!(ex.pending(), r#"{"c":"#);
    }

    #[test]
    fn test_unconsumed_frames_survive_to_next_push() {
        let mut ex = FrameExtractor::new(FrameRecovery::Drop);
        let first = ex.push(br#"{"a":1}{"b":2}"#).next();
        assert_eq!(first, Some(json!({"a": 1})));
        let rest = extract(&mut ex, r#"{"c":3}"#);
        assert_eq!(rest, vec![json!({"b": 2}), json!({"c": 3})]);
    }

    #[test]
    fn test_brace_inside_string_is_a_known_limitation() {
        // A `}` inside a quoted value closes the match early: the damaged
        // fragment fails to parse and the message is lost.
        let mut ex = FrameExtractor::new(FrameRecovery::Drop);
        let frames = extract(
            &mut ex,
            r#"{"player":"a}b","bodypart":"katana","sensortype":"shoe","value":[1]}"#,
        );
        assert!(frames.is_empty());
    }
}
