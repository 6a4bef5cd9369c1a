use serde_json::{Map, Value};

/// Classification of one raw output line.
#[derive(Debug, PartialEq)]
pub enum Line {
    /// Empty or whitespace-only.
    Blank,
    /// A JSON object.
    Json(Map<String, Value>),
    /// Valid JSON that is not an object (arrays, scalars). Skipped silently.
    Ignored,
    /// Anything that failed to decode, trimmed.
    NonJson(String),
}

/// Classify a single line of agent output.
///
/// Invalid UTF-8 is replaced rather than rejected, so a stray byte never
/// stops the stream.
pub fn classify_line(raw: &[u8]) -> Line {
    let text = String::from_utf8_lossy(raw);
    let line = text.trim();
    if line.is_empty() {
        return Line::Blank;
    }
    match serde_json::from_str::<Value>(line) {
        Ok(Value::Object(map)) => Line::Json(map),
        Ok(_) => Line::Ignored,
        Err(_) => Line::NonJson(line.to_string()),
    }
}

/// Largest SSE frame or output line accepted, in bytes.
pub const MAX_FRAME_BYTES: usize = 10 * 1024 * 1024;

/// Incremental decoder for a `text/event-stream` body.
///
/// Only `data:` fields are used. Consecutive data lines are joined with `\n`
/// and dispatched on a blank line; lines starting with `:` are comments.
/// Payloads that are not JSON objects are dropped, as are frames larger than
/// the size limit.
#[derive(Debug)]
pub struct SseDecoder {
    pending: Vec<u8>,
    /// Prefix of `pending` already searched for a newline.
    scanned: usize,
    data_lines: Vec<String>,
    data_len: usize,
    max_frame: usize,
    /// The current frame outgrew `max_frame` and is dropped at dispatch.
    oversized: bool,
    /// Discard bytes up to the next newline.
    skip_line: bool,
}

impl Default for SseDecoder {
    fn default() -> Self {
        Self::with_limit(MAX_FRAME_BYTES)
    }
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(max_frame: usize) -> Self {
        Self {
            pending: Vec::new(),
            scanned: 0,
            data_lines: Vec::new(),
            data_len: 0,
            max_frame,
            oversized: false,
            skip_line: false,
        }
    }

    /// Feed a chunk of bytes, returning every payload completed by it.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Value> {
        self.pending.extend_from_slice(chunk);
        let mut out = Vec::new();
        let mut start = 0;
        let mut scan = self.scanned;
        while let Some(offset) = self.pending[scan..].iter().position(|b| *b == b'\n') {
            let end = scan + offset;
            let line = String::from_utf8_lossy(&self.pending[start..end]).into_owned();
            start = end + 1;
            scan = start;
            if self.skip_line {
                self.skip_line = false;
                continue;
            }
            if let Some(payload) = self.process_line(line.trim_end_matches('\r')) {
                out.push(payload);
            }
        }
        self.pending.drain(..start);
        self.scanned = self.pending.len();

        if self.pending.len() > self.max_frame {
            tracing::warn!(bytes = self.pending.len(), "SSE line exceeds size limit, dropping frame");
            self.pending.clear();
            self.scanned = 0;
            self.skip_line = true;
            self.drop_frame();
        }
        out
    }

    /// Flush a trailing event at end of stream.
    pub fn finish(&mut self) -> Option<Value> {
        let rest = std::mem::take(&mut self.pending);
        self.scanned = 0;
        if !rest.is_empty() && !std::mem::take(&mut self.skip_line) {
            let text = String::from_utf8_lossy(&rest).into_owned();
            if let Some(payload) = self.process_line(text.trim_end_matches('\r')) {
                return Some(payload);
            }
        }
        self.dispatch()
    }

    fn process_line(&mut self, line: &str) -> Option<Value> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') || self.oversized {
            return None;
        }
        if let Some(data) = line.strip_prefix("data:") {
            let data = data.trim_start();
            self.data_len += data.len() + 1;
            if self.data_len > self.max_frame {
                tracing::warn!(bytes = self.data_len, "SSE frame exceeds size limit, dropping it");
                self.drop_frame();
            } else {
                self.data_lines.push(data.to_string());
            }
        }
        None
    }

    fn drop_frame(&mut self) {
        self.oversized = true;
        self.data_lines = Vec::new();
        self.data_len = 0;
    }

    fn dispatch(&mut self) -> Option<Value> {
        self.data_len = 0;
        if std::mem::take(&mut self.oversized) {
            self.data_lines.clear();
            return None;
        }
        if self.data_lines.is_empty() {
            return None;
        }
        let payload = self.data_lines.join("\n");
        self.data_lines.clear();
        match serde_json::from_str::<Value>(&payload) {
            Ok(value @ Value::Object(_)) => Some(value),
            _ => {
                tracing::debug!(payload = %payload, "skipping non-object SSE payload");
                None
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn classify_blank_lines() {
        assert_eq!(classify_line(b""), Line::Blank);
        assert_eq!(classify_line(b"  \r\n"), Line::Blank);
    }

    #[test]
    fn classify_object() {
        let Line::Json(map) = classify_line(br#"{"type":"text"}"#) else {
            panic!("expected object");
        };
        assert_eq!(map["type"], "text");
    }

    #[test]
    fn classify_non_object_json_is_ignored() {
        assert_eq!(classify_line(b"[1,2]"), Line::Ignored);
        assert_eq!(classify_line(b"42"), Line::Ignored);
    }

    #[test]
    fn classify_garbage_keeps_trimmed_text() {
        assert_eq!(
            classify_line(b"  Error: no such model \n"),
            Line::NonJson("Error: no such model".into())
        );
    }

    #[test]
    fn classify_invalid_utf8_does_not_fail() {
        assert!(matches!(classify_line(b"\xff\xfe oops"), Line::NonJson(_)));
    }

    #[test]
    fn sse_single_event() {
        let mut decoder = SseDecoder::new();
        let events = decoder.feed(b"data: {\"type\":\"a\"}\n\n");
        assert_eq!(events, vec![serde_json::json!({"type": "a"})]);
    }

    #[test]
    fn sse_event_split_across_chunks() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.feed(b"data: {\"type\":").is_empty());
        assert!(decoder.feed(b"\"b\"}\r\n").is_empty());
        let events = decoder.feed(b"\r\n");
        assert_eq!(events, vec![serde_json::json!({"type": "b"})]);
    }

    #[test]
    fn sse_multiline_data_and_comments() {
        let mut decoder = SseDecoder::new();
        let events = decoder.feed(b": keepalive\n\nevent: message\ndata: {\"type\":\ndata: \"c\"}\n\n");
        assert_eq!(events, vec![serde_json::json!({"type": "c"})]);
    }

    #[test]
    fn sse_non_object_payload_dropped() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.feed(b"data: [DONE]\n\ndata: 7\n\n").is_empty());
    }

    #[test]
    fn sse_finish_flushes_trailing_event() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.feed(b"data: {\"type\":\"tail\"}").is_empty());
        assert_eq!(decoder.finish(), Some(serde_json::json!({"type": "tail"})));
        assert_eq!(decoder.finish(), None);
    }

    #[test]
    fn sse_many_small_chunks() {
        let mut decoder = SseDecoder::new();
        let body = b"data: {\"type\":\"slow\",\"n\":12345}\n\n";
        let mut events = Vec::new();
        for byte in body {
            events.extend(decoder.feed(std::slice::from_ref(byte)));
        }
        assert_eq!(events, vec![serde_json::json!({"type": "slow", "n": 12345})]);
    }

    #[test]
    fn sse_oversized_frame_is_dropped() {
        let mut decoder = SseDecoder::with_limit(32);
        let big = format!("data: {{\"type\":\"big\",\"pad\":\"{}\"}}", "x".repeat(40));
        assert!(decoder.feed(big[..20].as_bytes()).is_empty());
        assert!(decoder.feed(big[20..].as_bytes()).is_empty());
        assert!(decoder.feed(b"\n\n").is_empty());
        let events = decoder.feed(b"data: {\"type\":\"ok\"}\n\n");
        assert_eq!(events, vec![serde_json::json!({"type": "ok"})]);
    }

    #[test]
    fn sse_frame_over_limit_across_data_lines_is_dropped() {
        let mut decoder = SseDecoder::with_limit(32);
        let line = format!("data: {}\n", "y".repeat(20));
        assert!(decoder.feed(line.as_bytes()).is_empty());
        assert!(decoder.feed(line.as_bytes()).is_empty());
        assert!(decoder.feed(b"\n").is_empty());
        let events = decoder.feed(b"data: {\"type\":\"next\"}\n\n");
        assert_eq!(events, vec![serde_json::json!({"type": "next"})]);
    }
}
