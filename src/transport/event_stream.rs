//! Line-oriented parser for `text/event-stream` framing (§4.6), at the
//! granularity MCP needs: `event`/`data`/`id` fields, comment lines, sticky
//! `id`, and the three WHATWG line terminators.

use crate::types::EventStreamMessage;

/// Parses a `text/event-stream` body incrementally as chunks arrive over
/// the wire, dispatching one [`EventStreamMessage`] per blank-line-delimited
/// record that carries a `data` field.
///
/// Holds exactly the state the WHATWG parsing model requires: the
/// in-progress record's `event`/`data` buffer, and the sticky `id` that
/// persists across records until another `id` field (possibly empty, which
/// resets it) appears.
#[derive(Debug, Default)]
pub struct EventStreamReader {
    /// Raw bytes received but not yet resolved into complete lines (a
    /// trailing `\r` is held back since it may be the first half of a
    /// `\r\n` terminator split across chunks).
    carry: String,
    /// The in-progress record's `event` field, empty until set.
    pending_event: String,
    /// The in-progress record's `data` lines, joined with `\n` on dispatch.
    pending_data: Vec<String>,
    /// Whether the in-progress record saw an explicit `id` field.
    pending_id_seen: bool,
    /// The in-progress record's `id` value (only meaningful if
    /// `pending_id_seen`).
    pending_id: String,
    /// The sticky `id`, carried across records.
    last_event_id: Option<String>,
}

impl EventStreamReader {
    /// Construct an empty reader for a new connection.
    pub fn new() -> Self {
        Self::default()
    }

    /// The current sticky `id`, if any has been seen so far.
    pub fn last_event_id(&self) -> Option<&str> {
        self.last_event_id.as_deref()
    }

    /// Feed a chunk of bytes (as UTF-8 text) from the wire, returning every
    /// record dispatched as a result (zero, one, or many).
    pub fn feed(&mut self, chunk: &str) -> Vec<EventStreamMessage> {
        self.carry.push_str(chunk);
        let lines = extract_complete_lines(&mut self.carry);
        lines
            .into_iter()
            .filter_map(|line| self.process_line(&line))
            .collect()
    }

    /// Flush any buffered partial line at end-of-stream. A trailing partial
    /// line with no terminator is still processed as a final line, matching
    /// how an SSE body that ends without a trailing blank line is still
    /// expected to deliver its last field.
    pub fn finish(&mut self) -> Vec<EventStreamMessage> {
        let remaining = std::mem::take(&mut self.carry);
        let mut dispatched: Vec<EventStreamMessage> = remaining
            .split(['\n', '\r'])
            .filter_map(|line| self.process_line(line))
            .collect();
        if let Some(last) = self.dispatch() {
            dispatched.push(last);
        }
        dispatched
    }

    fn process_line(&mut self, line: &str) -> Option<EventStreamMessage> {
        if line.is_empty() {
            return self.dispatch();
        }
        if let Some(rest) = line.strip_prefix(':') {
            let _ = rest; // comment line, ignored
            return None;
        }

        let (field, value) = match line.find(':') {
            Some(idx) => {
                let field = &line[..idx];
                let mut value = &line[idx + 1..];
                value = value.strip_prefix(' ').unwrap_or(value);
                (field, value)
            }
            None => (line, ""),
        };

        match field {
            "event" => self.pending_event = value.to_string(),
            "data" => self.pending_data.push(value.to_string()),
            "id" => {
                self.pending_id_seen = true;
                self.pending_id = value.to_string();
            }
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<EventStreamMessage> {
        if self.pending_id_seen {
            self.last_event_id = if self.pending_id.is_empty() {
                None
            } else {
                Some(std::mem::take(&mut self.pending_id))
            };
            self.pending_id_seen = false;
        }

        let result = if self.pending_data.is_empty() {
            None
        } else {
            let event = if self.pending_event.is_empty() {
                "message".to_string()
            } else {
                self.pending_event.clone()
            };
            Some(EventStreamMessage {
                event,
                data: self.pending_data.join("\n"),
                id: self.last_event_id.clone(),
            })
        };

        self.pending_event.clear();
        self.pending_data.clear();
        result
    }
}

/// Extract every complete line from `buf`, leaving any trailing partial
/// line (including a lone `\r` that might be half of a split `\r\n`) in
/// place.
fn extract_complete_lines(buf: &mut String) -> Vec<String> {
    let mut lines = Vec::new();
    let bytes = buf.as_bytes();
    let mut start = 0usize;
    let mut i = 0usize;

    while i < bytes.len() {
        match bytes[i] {
            b'\n' => {
                lines.push(buf[start..i].to_string());
                i += 1;
                start = i;
            }
            b'\r' => {
                if i + 1 < bytes.len() {
                    let consumed = if bytes[i + 1] == b'\n' { 2 } else { 1 };
                    lines.push(buf[start..i].to_string());
                    i += consumed;
                    start = i;
                } else {
                    // Trailing lone `\r`: might be the start of a split
                    // `\r\n`. Hold it back for the next chunk.
                    break;
                }
            }
            _ => i += 1,
        }
    }

    let remainder = buf[start..].to_string();
    *buf = remainder;
    lines
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_data_event_is_dispatched_as_message() {
        let mut reader = EventStreamReader::new();
        let events = reader.feed("data: hello\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, "message");
        assert_eq!(events[0].data, "hello");
        assert_eq!(events[0].id, None);
    }

    #[test]
    fn record_with_no_data_is_not_dispatched() {
        let mut reader = EventStreamReader::new();
        let events = reader.feed("event: ping\n\n");
        assert!(events.is_empty());
    }

    #[test]
    fn comment_lines_are_ignored() {
        let mut reader = EventStreamReader::new();
        let events = reader.feed(": keep-alive\ndata: hi\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "hi");
    }

    #[test]
    fn multi_line_data_is_joined_with_newline() {
        let mut reader = EventStreamReader::new();
        let events = reader.feed("data: line one\ndata: line two\n\n");
        assert_eq!(events[0].data, "line one\nline two");
    }

    #[test]
    fn named_event_overrides_default() {
        let mut reader = EventStreamReader::new();
        let events = reader.feed("event: endpoint\ndata: http://x/ep\n\n");
        assert_eq!(events[0].event, "endpoint");
    }

    #[test]
    fn id_is_sticky_across_records() {
        let mut reader = EventStreamReader::new();
        let first = reader.feed("id: 1\ndata: a\n\ndata: b\n\n");
        assert_eq!(first[0].id.as_deref(), Some("1"));
        assert_eq!(first[1].id.as_deref(), Some("1"));
    }

    #[test]
    fn explicit_empty_id_resets_sticky_id() {
        let mut reader = EventStreamReader::new();
        let first = reader.feed("id: 1\ndata: a\n\nid:\ndata: b\n\n");
        assert_eq!(first[0].id.as_deref(), Some("1"));
        assert_eq!(first[1].id, None);
    }

    #[test]
    fn order_is_preserved_across_records() {
        let mut reader = EventStreamReader::new();
        let events = reader.feed("data: 1\n\ndata: 2\n\ndata: 3\n\n");
        let data: Vec<_> = events.iter().map(|e| e.data.as_str()).collect();
        assert_eq!(data, vec!["1", "2", "3"]);
    }

    #[test]
    fn all_three_line_terminators_are_accepted() {
        let mut reader = EventStreamReader::new();
        let events = reader.feed("data: a\r\n\r\ndata: b\rdata: c\n\n");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].data, "a");
        assert_eq!(events[1].data, "b\nc");
    }

    #[test]
    fn split_crlf_across_feed_calls_is_handled() {
        let mut reader = EventStreamReader::new();
        let mut events = reader.feed("data: a\r");
        assert!(events.is_empty());
        events = reader.feed("\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "a");
    }

    #[test]
    fn finish_flushes_trailing_unterminated_record() {
        let mut reader = EventStreamReader::new();
        assert!(reader.feed("data: partial").is_empty());
        let flushed = reader.finish();
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].data, "partial");
    }
}
