use bytes::Bytes;

pub const DONE_MARKER: &str = "[DONE]";

/// One `data: …` block of a `text/event-stream` body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    pub data: String,
}

impl SseFrame {
    pub fn new(data: impl Into<String>) -> Self {
        Self { data: data.into() }
    }

    pub fn is_done(&self) -> bool {
        self.data == DONE_MARKER
    }

    pub fn encode(&self) -> Bytes {
        Bytes::from(format!("data: {}\n\n", self.data))
    }
}

pub fn done_frame() -> Bytes {
    Bytes::from_static(b"data: [DONE]\n\n")
}

/// Incremental SSE parser. Bytes arrive in arbitrary chunk boundaries; frames
/// come out once their terminating blank line has been seen. `event:` labels
/// and `:` comment lines are skipped, multi-line `data:` fields are joined
/// with `\n` per the SSE wire format.
#[derive(Debug, Default)]
pub struct FrameParser {
    buffer: String,
    data_lines: Vec<String>,
}

impl FrameParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_bytes(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        match std::str::from_utf8(chunk) {
            Ok(text) => self.push_str(text),
            Err(_) => Vec::new(),
        }
    }

    pub fn push_str(&mut self, chunk: &str) -> Vec<SseFrame> {
        self.buffer.push_str(chunk);
        let mut frames = Vec::new();

        while let Some(pos) = self.buffer.find('\n') {
            let mut line = self.buffer[..pos].to_string();
            self.buffer.drain(..=pos);
            if line.ends_with('\r') {
                line.pop();
            }

            if line.is_empty() {
                self.flush_frame(&mut frames);
                continue;
            }
            self.consume_line(&line);
        }

        frames
    }

    /// Drain whatever is buffered once the stream has ended; a final frame
    /// without a trailing blank line still counts.
    pub fn finish(&mut self) -> Vec<SseFrame> {
        if !self.buffer.is_empty() {
            let mut line = std::mem::take(&mut self.buffer);
            if line.ends_with('\r') {
                line.pop();
            }
            self.consume_line(&line);
        }
        let mut frames = Vec::new();
        self.flush_frame(&mut frames);
        frames
    }

    fn consume_line(&mut self, line: &str) {
        if line.starts_with(':') || line.starts_with("event:") || line == "event" {
            return;
        }
        if let Some(value) = line.strip_prefix("data:") {
            self.data_lines.push(value.trim_start().to_string());
        } else if line == "data" {
            self.data_lines.push(String::new());
        }
    }

    fn flush_frame(&mut self, frames: &mut Vec<SseFrame>) {
        if self.data_lines.is_empty() {
            return;
        }
        frames.push(SseFrame {
            data: self.data_lines.join("\n"),
        });
        self.data_lines.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_split_across_chunks() {
        let mut parser = FrameParser::new();
        assert!(parser.push_str("data: {\"a\":").is_empty());
        let frames = parser.push_str("1}\n\n");
        assert_eq!(frames, vec![SseFrame::new("{\"a\":1}")]);
    }

    #[test]
    fn crlf_and_comments() {
        let mut parser = FrameParser::new();
        let frames = parser.push_str(": keep-alive\r\ndata: one\r\n\r\ndata: two\n\n");
        assert_eq!(
            frames,
            vec![SseFrame::new("one"), SseFrame::new("two")]
        );
    }

    #[test]
    fn event_labels_are_skipped() {
        let mut parser = FrameParser::new();
        let frames = parser.push_str("event: message_start\ndata: {}\n\n");
        assert_eq!(frames, vec![SseFrame::new("{}")]);
    }

    #[test]
    fn multi_line_data_joins() {
        let mut parser = FrameParser::new();
        let frames = parser.push_str("data: a\ndata: b\n\n");
        assert_eq!(frames, vec![SseFrame::new("a\nb")]);
    }

    #[test]
    fn finish_flushes_trailing_frame() {
        let mut parser = FrameParser::new();
        assert!(parser.push_str("data: tail").is_empty());
        assert_eq!(parser.finish(), vec![SseFrame::new("tail")]);
    }

    #[test]
    fn done_marker() {
        let mut parser = FrameParser::new();
        let frames = parser.push_str("data: [DONE]\n\n");
        assert!(frames[0].is_done());
        assert_eq!(done_frame().as_ref(), b"data: [DONE]\n\n");
    }

    #[test]
    fn encode_round_trip() {
        let frame = SseFrame::new("{\"x\":2}");
        let mut parser = FrameParser::new();
        let parsed = parser.push_bytes(&frame.encode());
        assert_eq!(parsed, vec![frame]);
    }
}
