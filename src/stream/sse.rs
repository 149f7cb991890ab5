//! Incremental SSE frame parser.
//!
//! Feed it raw text chunks arriving at arbitrary byte boundaries and it
//! yields fully-assembled [`SseEvent`] frames. Field semantics follow the
//! [SSE specification](https://html.spec.whatwg.org/multipage/server-sent-events.html):
//! `event:` sets the type of the next frame, `data:` lines accumulate (one
//! leading space stripped, multi-line joined with `\n`), an empty line
//! terminates a frame, and `:` comment lines are ignored.

use memchr::memchr_iter;

use super::SseEvent;

pub struct SseParser {
    buffer: String,
    read_offset: usize,
    event_type: Option<String>,
    data_buffer: String,
    has_data: bool,
}

impl SseParser {
    #[must_use]
    pub fn new() -> Self {
        Self {
            buffer: String::new(),
            read_offset: 0,
            event_type: None,
            data_buffer: String::new(),
            has_data: false,
        }
    }

    /// Feed raw text and return any complete events parsed.
    pub fn feed(&mut self, chunk: &str) -> Vec<SseEvent> {
        let mut out = Vec::new();
        self.feed_into(chunk, &mut out);
        out
    }

    /// Feed raw text and append complete events into a caller-provided buffer.
    pub fn feed_into(&mut self, chunk: &str, out: &mut Vec<SseEvent>) {
        self.buffer.push_str(chunk);
        let mut processed_up_to = self.read_offset;
        let bytes = self.buffer.as_bytes();
        let scan_start = processed_up_to;
        for rel_pos in memchr_iter(b'\n', &bytes[scan_start..]) {
            let line_end = scan_start + rel_pos;
            let mut line = &self.buffer[processed_up_to..line_end];
            if let Some(stripped) = line.strip_suffix('\r') {
                line = stripped;
            }
            Self::process_line(
                line,
                &mut self.event_type,
                &mut self.data_buffer,
                &mut self.has_data,
                out,
            );
            processed_up_to = line_end + 1;
        }

        self.read_offset = processed_up_to;
        if self.read_offset == self.buffer.len() {
            self.buffer.clear();
            self.read_offset = 0;
            return;
        }
        let should_compact = self.read_offset > 0
            && (self.read_offset >= self.buffer.len() / 2 || self.read_offset >= 8 * 1024);
        if should_compact {
            self.buffer.drain(..self.read_offset);
            self.read_offset = 0;
        }
    }

    fn process_line(
        line: &str,
        event_type: &mut Option<String>,
        data_buffer: &mut String,
        has_data: &mut bool,
        out: &mut Vec<SseEvent>,
    ) {
        if line.is_empty() {
            if *has_data {
                out.push(SseEvent {
                    event: event_type.take(),
                    data: std::mem::take(data_buffer),
                });
                *has_data = false;
            } else {
                *event_type = None;
            }
            return;
        }
        if line.starts_with(':') {
            return;
        }

        if let Some(value) = line.strip_prefix("data:") {
            let value = value.strip_prefix(' ').unwrap_or(value);
            if *has_data {
                data_buffer.push('\n');
            } else {
                *has_data = true;
            }
            data_buffer.push_str(value);
        } else if let Some(value) = line.strip_prefix("event:") {
            let value = value.strip_prefix(' ').unwrap_or(value);
            *event_type = Some(value.to_string());
        }
        // id: and retry: fields are accepted on the wire but not surfaced.
    }
}

impl Default for SseParser {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_data_frame() {
        let mut parser = SseParser::new();
        let events = parser.feed("data: hello\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "hello");
        assert!(events[0].event.is_none());
    }

    #[test]
    fn handles_split_chunks() {
        let mut parser = SseParser::new();
        assert!(parser.feed("data: hel").is_empty());
        assert!(parser.feed("lo\n").is_empty());
        let events = parser.feed("\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "hello");
    }

    #[test]
    fn joins_multi_line_data() {
        let mut parser = SseParser::new();
        let events = parser.feed("data: a\ndata: b\n\n");
        assert_eq!(events[0].data, "a\nb");
    }

    #[test]
    fn carries_event_type() {
        let mut parser = SseParser::new();
        let events = parser.feed("event: delta\ndata: {\"x\":1}\n\n");
        assert_eq!(events[0].event.as_deref(), Some("delta"));
    }

    #[test]
    fn ignores_comments_and_crlf() {
        let mut parser = SseParser::new();
        let events = parser.feed(": keepalive\r\ndata: ok\r\n\r\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "ok");
    }

    #[test]
    fn multiple_frames_in_one_chunk() {
        let mut parser = SseParser::new();
        let events = parser.feed("data: one\n\ndata: two\n\n");
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].data, "two");
    }
}
