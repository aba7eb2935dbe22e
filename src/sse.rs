//! Incremental parser for the backend's SSE-style stream framing.
//!
//! The generation backend emits newline-delimited records of the form
//! `data: {json}\n\n`. Records can be split at arbitrary byte boundaries by
//! the transport, so the parser buffers partial lines across [`feed`] calls
//! and yields only complete `data:` payloads.
//!
//! [`feed`]: SseRecordParser::feed

/// Incrementally parses SSE bytes, yielding `data:` payloads as records
/// become complete.
#[derive(Debug, Default)]
pub struct SseRecordParser {
    line_buffer: String,
    data_lines: Vec<String>,
}

impl SseRecordParser {
    /// Create a new incremental parser.
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a chunk of bytes into the parser.
    ///
    /// Returns the payloads of any records completed by this chunk, in
    /// arrival order.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        let text = String::from_utf8_lossy(chunk);
        let mut records = Vec::new();

        for ch in text.chars() {
            if ch == '\n' {
                let line = std::mem::take(&mut self.line_buffer);
                let line = line.strip_suffix('\r').unwrap_or(&line);
                if let Some(record) = self.process_line(line) {
                    records.push(record);
                }
            } else {
                self.line_buffer.push(ch);
            }
        }

        records
    }

    /// Flush any buffered data as a final record.
    ///
    /// Call when the stream ends to emit a trailing record that was never
    /// terminated by a blank line.
    pub fn flush(&mut self) -> Option<String> {
        if !self.line_buffer.is_empty() {
            let line = std::mem::take(&mut self.line_buffer);
            let line = line.strip_suffix('\r').unwrap_or(&line);
            if let Some(record) = self.process_line(line) {
                return Some(record);
            }
        }
        if self.data_lines.is_empty() {
            None
        } else {
            Some(self.take_record())
        }
    }

    /// Process one complete line. A blank line terminates the current
    /// record; comment lines (leading `:`) and unknown fields are ignored.
    fn process_line(&mut self, line: &str) -> Option<String> {
        if line.is_empty() {
            if self.data_lines.is_empty() {
                return None;
            }
            return Some(self.take_record());
        }

        if line.starts_with(':') {
            return None;
        }

        if let Some(value) = line.strip_prefix("data:") {
            let value = value.strip_prefix(' ').unwrap_or(value);
            self.data_lines.push(value.to_string());
        }

        None
    }

    fn take_record(&mut self) -> String {
        let record = self.data_lines.join("\n");
        self.data_lines.clear();
        record
    }
}
