pub mod sse;

pub use sse::SseParser;

/// A parsed SSE frame from an upstream stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

/// Encode one unnamed SSE data frame (`data: <chunk>\n\n`).
///
/// Multi-line payloads become one `data:` line per source line so the frame
/// reassembles to the original text on a spec-compliant client.
#[must_use]
pub fn encode_data_frame(chunk: &str) -> String {
    let mut out = String::with_capacity(chunk.len() + 10);
    for line in chunk.split('\n') {
        out.push_str("data: ");
        out.push_str(line);
        out.push('\n');
    }
    out.push('\n');
    out
}

/// Encode a named SSE event frame (`event: <name>\ndata: <json>\n\n`).
#[must_use]
pub fn encode_event_frame(event: &str, data: &str) -> String {
    let mut out = String::with_capacity(event.len() + data.len() + 16);
    out.push_str("event: ");
    out.push_str(event);
    out.push('\n');
    for line in data.split('\n') {
        out.push_str("data: ");
        out.push_str(line);
        out.push('\n');
    }
    out.push('\n');
    out
}

/// Terminal sentinel frame ending a plain data stream.
#[must_use]
pub fn done_frame() -> &'static str {
    "data: [DONE]\n\n"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_frame_single_line() {
        assert_eq!(encode_data_frame("hello"), "data: hello\n\n");
    }

    #[test]
    fn data_frame_multi_line() {
        assert_eq!(encode_data_frame("a\nb"), "data: a\ndata: b\n\n");
    }

    #[test]
    fn event_frame_shape() {
        assert_eq!(
            encode_event_frame("route", "{\"rid\":\"r1\"}"),
            "event: route\ndata: {\"rid\":\"r1\"}\n\n"
        );
    }

    #[test]
    fn frames_round_trip_through_parser() {
        let mut parser = SseParser::new();
        let frame = encode_event_frame("delta", "{\"content\":\"hi\"}");
        let events = parser.feed(&frame);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event.as_deref(), Some("delta"));
        assert_eq!(events[0].data, "{\"content\":\"hi\"}");
    }
}
