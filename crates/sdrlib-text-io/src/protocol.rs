//! Newline-delimited record framing.
//!
//! Reads from a channel arrive at whatever granularity the socket delivers.
//! [`LineDecoder`] buffers the unterminated tail of each read and hands back
//! complete lines, so a stream split anywhere decodes exactly as it would
//! in one piece. Some servers prefix the stream with a fixed-size binary
//! header; the decoder discards it once per channel lifetime.

use serde_json::Value;
use tracing::warn;

use sdrlib_core::error::{Error, Result};

/// The byte that terminates every record.
pub const TERMINATOR: u8 = b'\n';

/// Field whose presence marks a record as an asynchronous notification.
pub const EVENT_MARKER: &str = "async";

/// Maximum buffered bytes without a terminator before the buffer is reset.
/// Status replies for a full station are a few kilobytes.
pub const MAX_BUF: usize = 64 * 1024;

/// One decoded record from a command channel.
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    /// A reply to the oldest outstanding command.
    Reply(Value),
    /// An asynchronous notification; never consumes a reply slot.
    Event {
        /// Event name.
        event: String,
        /// Port label the event concerns, when given.
        label: Option<String>,
        /// The whole record.
        body: Value,
    },
}

/// Parse one line into a [`Record`].
///
/// ```
/// use sdrlib_text_io::{Record, parse_record};
///
/// let r = parse_record(r#"{"frequency":166376000}"#).unwrap();
/// assert!(matches!(r, Record::Reply(_)));
///
/// let e = parse_record(r#"{"async":true,"event":"devStalled","devLabel":"p2"}"#).unwrap();
/// assert!(matches!(e, Record::Event { ref event, .. } if event == "devStalled"));
/// ```
pub fn parse_record(line: &str) -> Result<Record> {
    let value: Value = serde_json::from_str(line)?;
    let is_event = value
        .get(EVENT_MARKER)
        .is_some_and(|v| !matches!(v, Value::Null | Value::Bool(false)));
    if !is_event {
        return Ok(Record::Reply(value));
    }
    let event = value
        .get("event")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::Protocol(format!("async record without event name: {line}")))?
        .to_string();
    let label = value
        .get("devLabel")
        .and_then(Value::as_str)
        .map(str::to_string);
    Ok(Record::Event {
        event,
        label,
        body: value,
    })
}

/// Incremental line splitter for one channel.
#[derive(Debug, Clone)]
pub struct LineDecoder {
    buf: Vec<u8>,
    header_len: usize,
    header_left: usize,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::with_header(0)
    }

    /// A decoder that drops the first `header_len` bytes of the stream.
    pub fn with_header(header_len: usize) -> Self {
        LineDecoder {
            buf: Vec::new(),
            header_len,
            header_left: header_len,
        }
    }

    /// Forget buffered bytes and re-arm the header skip, for a new channel.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.header_left = self.header_len;
    }

    /// Bytes held while waiting for a terminator.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Feed bytes; return every line completed by them, without
    /// terminators. Empty lines are skipped.
    pub fn push(&mut self, mut data: &[u8]) -> Vec<String> {
        if self.header_left > 0 {
            let skip = self.header_left.min(data.len());
            self.header_left -= skip;
            data = &data[skip..];
        }

        let mut lines = Vec::new();
        let mut start = 0;
        for (i, &b) in data.iter().enumerate() {
            if b != TERMINATOR {
                continue;
            }
            self.buf.extend_from_slice(&data[start..i]);
            start = i + 1;
            if self.buf.last() == Some(&b'\r') {
                self.buf.pop();
            }
            if !self.buf.is_empty() {
                lines.push(String::from_utf8_lossy(&self.buf).into_owned());
            }
            self.buf.clear();
        }
        self.buf.extend_from_slice(&data[start..]);

        if self.buf.len() > MAX_BUF {
            warn!(len = self.buf.len(), "line buffer overflow, resetting");
            self.buf.clear();
        }
        lines
    }

    /// Feed bytes and parse the completed lines as records.
    ///
    /// A line that is not valid JSON is logged and dropped; the lines
    /// around it are unaffected.
    pub fn push_records(&mut self, data: &[u8]) -> Vec<Record> {
        self.push(data)
            .into_iter()
            .filter_map(|line| match parse_record(&line) {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!(line = %line, error = %e, "dropping malformed record");
                    None
                }
            })
            .collect()
    }
}

impl Default for LineDecoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const STREAM: &[u8] =
        b"{\"frequency\":166376000}\n{\"async\":1,\"event\":\"grhNote\",\"devLabel\":\"p1\"}\n{\"lna_gain\":10}\n";

    #[test]
    fn splits_complete_lines() {
        let mut d = LineDecoder::new();
        assert_eq!(d.push(b"a\nbb\n"), vec!["a", "bb"]);
        assert_eq!(d.buffered(), 0);
    }

    #[test]
    fn holds_partial_tail() {
        let mut d = LineDecoder::new();
        assert!(d.push(b"{\"freq").is_empty());
        assert_eq!(d.buffered(), 6);
        assert_eq!(d.push(b"uency\":1}\nnext"), vec!["{\"frequency\":1}"]);
        assert_eq!(d.buffered(), 4);
    }

    #[test]
    fn every_split_point_decodes_the_same() {
        let mut whole = LineDecoder::new();
        let expected = whole.push_records(STREAM);
        assert_eq!(expected.len(), 3);

        for cut in 0..=STREAM.len() {
            let mut d = LineDecoder::new();
            let mut got = d.push_records(&STREAM[..cut]);
            got.extend(d.push_records(&STREAM[cut..]));
            assert_eq!(got, expected, "split at {cut}");
        }
    }

    #[test]
    fn byte_at_a_time_decodes_the_same() {
        let mut d = LineDecoder::new();
        let mut got = Vec::new();
        for b in STREAM {
            got.extend(d.push_records(std::slice::from_ref(b)));
        }
        assert_eq!(got, LineDecoder::new().push_records(STREAM));
    }

    #[test]
    fn header_skipped_once_across_reads() {
        let mut d = LineDecoder::with_header(12);
        // Header split over two reads, then the first record.
        assert!(d.push(&[0xAA; 7]).is_empty());
        let lines = d.push(b"\x01\x02\x03\x04\x05{\"agc\":0}\n");
        assert_eq!(lines, vec!["{\"agc\":0}"]);
        // Later records are not trimmed.
        assert_eq!(d.push(b"{\"agc\":1}\n"), vec!["{\"agc\":1}"]);
    }

    #[test]
    fn reset_rearms_header() {
        let mut d = LineDecoder::with_header(2);
        d.push(b"HHx");
        d.reset();
        assert_eq!(d.buffered(), 0);
        assert_eq!(d.push(b"HHy\n"), vec!["y"]);
    }

    #[test]
    fn malformed_record_dropped_without_disturbing_neighbours() {
        let mut d = LineDecoder::new();
        let records = d.push_records(b"{\"a\":1}\n{not json\n{\"b\":2}\n");
        assert_eq!(
            records,
            vec![Record::Reply(json!({"a":1})), Record::Reply(json!({"b":2}))]
        );
    }

    #[test]
    fn crlf_and_blank_lines() {
        let mut d = LineDecoder::new();
        assert_eq!(d.push(b"x\r\n\n\ny\n"), vec!["x", "y"]);
    }

    #[test]
    fn overflow_resets_buffer() {
        let mut d = LineDecoder::new();
        d.push(&vec![b'x'; MAX_BUF + 1]);
        assert_eq!(d.buffered(), 0);
        assert_eq!(d.push(b"ok\n"), vec!["ok"]);
    }

    #[test]
    fn async_false_is_a_reply() {
        let r = parse_record(r#"{"async":false,"x":1}"#).unwrap();
        assert!(matches!(r, Record::Reply(_)));
    }

    #[test]
    fn event_carries_label_and_body() {
        match parse_record(r#"{"async":true,"event":"rate","devLabel":"p4","v":2}"#).unwrap() {
            Record::Event { event, label, body } => {
                assert_eq!(event, "rate");
                assert_eq!(label.as_deref(), Some("p4"));
                assert_eq!(body["v"], 2);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn event_without_name_is_protocol_error() {
        assert!(matches!(
            parse_record(r#"{"async":true}"#),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn invalid_json_is_json_error() {
        assert!(matches!(parse_record("nope"), Err(Error::Json(_))));
    }
}
