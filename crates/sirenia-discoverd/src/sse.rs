//! Incremental decoder for `text/event-stream` bodies.

/// Splits a byte stream into the `data` payloads of complete events.
///
/// Only `data:` fields are kept; `event:`, `id:` and comment lines are
/// skipped. Multi-line data is joined with `\n`. An event is dispatched on
/// the blank line that ends it, so one still open when the stream closes
/// is dropped.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buf: Vec<u8>,
    data: Vec<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and collect every event it completes.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);
        let mut events = Vec::new();

        while let Some(end) = self.buf.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buf.drain(..=end).collect();
            let line = String::from_utf8_lossy(&raw[..end]);
            let line = line.strip_suffix('\r').unwrap_or(&line);

            if line.is_empty() {
                if !self.data.is_empty() {
                    events.push(self.data.join("\n"));
                    self.data.clear();
                }
            } else if let Some(value) = line.strip_prefix("data:") {
                self.data
                    .push(value.strip_prefix(' ').unwrap_or(value).to_owned());
            }
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::lf(&b"data: one\ndata: two\ndata: three\n\n"[..], "one\ntwo\nthree")]
    #[case::crlf(&b"data: one\r\ndata: two\r\n\r\n"[..], "one\ntwo")]
    #[case::empty_line(&b"data: one\ndata:\ndata: three\n\n"[..], "one\n\nthree")]
    #[case::json(&b"data: {\"a\":\ndata: 1}\n\n"[..], "{\"a\":\n1}")]
    fn multi_line_data_is_joined(#[case] raw: &[u8], #[case] expected: &str) {
        let mut decoder = SseDecoder::new();
        assert_eq!(decoder.push(raw), [expected]);
    }

    #[rstest]
    #[case::no_newline(&b"data: last"[..])]
    #[case::one_newline(&b"data: last\n"[..])]
    fn unterminated_trailing_event_is_held_back(#[case] tail: &[u8]) {
        let mut decoder = SseDecoder::new();
        let mut raw = b"data: first\n\n".to_vec();
        raw.extend_from_slice(tail);
        assert_eq!(decoder.push(&raw), ["first"]);

        // The stream ending here would drop the trailing event; if more
        // bytes arrive it is completed as normal.
        let rest: &[u8] = if tail.ends_with(b"\n") { b"\n" } else { b"\n\n" };
        assert_eq!(decoder.push(rest), ["last"]);
    }

    #[test]
    fn events_split_across_chunks() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(b"data: {\"kind\":").is_empty());
        assert!(decoder.push(b"\"up\"}\n").is_empty());
        assert_eq!(decoder.push(b"\ndata: two\n\n"), ["{\"kind\":\"up\"}", "two"]);
    }

    #[test]
    fn skips_other_fields_and_joins_lines() {
        let mut decoder = SseDecoder::new();
        let events = decoder.push(b": keepalive\r\nevent: message\r\ndata: a\r\ndata:b\r\n\r\n");
        assert_eq!(events, ["a\nb"]);
    }

    #[test]
    fn blank_lines_without_data_emit_nothing() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(b"\n\n: ping\n\n").is_empty());
    }
}
