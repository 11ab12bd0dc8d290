use bytes::Bytes;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

/// Incremental SSE decoder.
///
/// Accepts raw bytes, string chunks or pre-split lines; an empty line flushes
/// the pending event. Comment lines (`:` prefix) are dropped.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: String,
    event: Option<String>,
    data_lines: Vec<String>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_bytes(&mut self, chunk: &Bytes) -> Vec<SseEvent> {
        match std::str::from_utf8(chunk) {
            Ok(text) => self.push_str(text),
            Err(_) => Vec::new(),
        }
    }

    pub fn push_str(&mut self, chunk: &str) -> Vec<SseEvent> {
        self.buffer.push_str(chunk);
        let mut events = Vec::new();

        while let Some(pos) = self.buffer.find('\n') {
            let mut line = self.buffer[..pos].to_string();
            self.buffer.drain(..=pos);
            if line.ends_with('\r') {
                line.pop();
            }
            self.consume_line(&line, &mut events);
        }

        events
    }

    /// Feed one line with the trailing newline (and any `\r`) already removed.
    pub fn feed_line(&mut self, line: &str) -> Vec<SseEvent> {
        let mut events = Vec::new();
        self.consume_line(line, &mut events);
        events
    }

    pub fn finish(&mut self) -> Vec<SseEvent> {
        let mut events = Vec::new();
        if !self.buffer.is_empty() {
            let mut line = std::mem::take(&mut self.buffer);
            if line.ends_with('\r') {
                line.pop();
            }
            self.consume_line(&line, &mut events);
        }
        self.finish_event(&mut events);
        events
    }

    fn consume_line(&mut self, line: &str, events: &mut Vec<SseEvent>) {
        if line.is_empty() {
            self.finish_event(events);
            return;
        }
        if line.starts_with(':') {
            return;
        }

        if let Some(value) = line.strip_prefix("event:") {
            let value = value.trim_start();
            self.event = if value.is_empty() {
                None
            } else {
                Some(value.to_string())
            };
            return;
        }
        if line == "event" {
            self.event = None;
            return;
        }

        if let Some(value) = line.strip_prefix("data:") {
            self.data_lines.push(value.trim_start().to_string());
            return;
        }
        if line == "data" {
            self.data_lines.push(String::new());
        }
    }

    fn finish_event(&mut self, events: &mut Vec<SseEvent>) {
        if self.event.is_none() && self.data_lines.is_empty() {
            return;
        }
        let data = self.data_lines.join("\n");
        events.push(SseEvent {
            event: self.event.take(),
            data,
        });
        self.data_lines.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn named_event_flushes_on_blank_line() {
        let mut parser = SseParser::new();
        assert!(parser.push_str("event: message_start\n").is_empty());
        assert!(parser.push_str("data: {\"a\":1}\n").is_empty());
        let events = parser.push_str("\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event.as_deref(), Some("message_start"));
        assert_eq!(events[0].data, "{\"a\":1}");
    }

    #[test]
    fn multi_line_data_joins_with_newline() {
        let mut parser = SseParser::new();
        parser.push_str("data: one\ndata: two\n");
        let events = parser.push_str("\n");
        assert_eq!(events[0].data, "one\ntwo");
    }

    #[test]
    fn comments_and_crlf_are_tolerated() {
        let mut parser = SseParser::new();
        parser.push_str(": keep-alive\r\ndata: x\r\n");
        let events = parser.push_str("\r\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "x");
    }

    #[test]
    fn feed_line_matches_push_str() {
        let mut a = SseParser::new();
        let mut b = SseParser::new();
        let mut from_lines = Vec::new();
        for line in ["event: delta", "data: 1", ""] {
            from_lines.extend(a.feed_line(line));
        }
        let from_chunk = b.push_str("event: delta\ndata: 1\n\n");
        assert_eq!(from_lines, from_chunk);
    }

    #[test]
    fn finish_flushes_trailing_event() {
        let mut parser = SseParser::new();
        parser.push_str("data: tail");
        let events = parser.finish();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "tail");
    }
}
