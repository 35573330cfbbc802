//! Incremental decoding of a chunked log body into lines.

/// Streaming UTF-8 decoder that correctly handles multi-byte characters
/// split across chunk boundaries.
#[derive(Debug, Default)]
pub struct Utf8StreamDecoder {
    buf: Vec<u8>,
}

impl Utf8StreamDecoder {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Feed a chunk of bytes and return the longest valid UTF-8 string.
    /// Any trailing incomplete multi-byte sequence is retained for the next call.
    /// Genuinely invalid bytes are replaced with U+FFFD.
    pub fn decode(&mut self, chunk: &[u8]) -> String {
        self.buf.extend_from_slice(chunk);
        let mut result = String::new();

        loop {
            match std::str::from_utf8(&self.buf) {
                Ok(s) => {
                    result.push_str(s);
                    self.buf.clear();
                    break;
                }
                Err(e) => {
                    let valid_up_to = e.valid_up_to();
                    result.push_str(&String::from_utf8_lossy(&self.buf[..valid_up_to]));

                    match e.error_len() {
                        None => {
                            // Incomplete sequence at end, keep for next call
                            self.buf.drain(..valid_up_to);
                            break;
                        }
                        Some(len) => {
                            result.push('\u{FFFD}');
                            self.buf.drain(..valid_up_to + len);
                        }
                    }
                }
            }
        }

        result
    }

    /// End of input: whatever is still buffered can never complete.
    pub fn finish(&mut self) -> String {
        let rest = String::from_utf8_lossy(&self.buf).into_owned();
        self.buf.clear();
        rest
    }
}

/// Splits a byte stream into log lines.
///
/// A line is only emitted once its terminating `\n` has arrived; the
/// unterminated remainder of each chunk is carried into the next one.
/// Event-stream lines (`data: <payload>`) are unwrapped, and a payload that
/// is a JSON string literal is unescaped before being split on its own
/// embedded newlines. After the first `data:` line the body is treated as
/// event-stream framed and separator lines, comments and other fields are
/// dropped.
#[derive(Debug, Default)]
pub struct LineDecoder {
    utf8: Utf8StreamDecoder,
    carry: String,
    framed: bool,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        let text = self.utf8.decode(chunk);
        self.carry.push_str(&text);

        let Some(last_newline) = self.carry.rfind('\n') else {
            return Vec::new();
        };
        let rest = self.carry.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut self.carry, rest);

        let mut lines = Vec::new();
        for raw in complete.split_terminator('\n') {
            self.push_line(raw, &mut lines);
        }
        lines
    }

    /// Flush the unterminated remainder at end of stream.
    pub fn finish(&mut self) -> Vec<String> {
        let tail = self.utf8.finish();
        self.carry.push_str(&tail);
        let rest = std::mem::take(&mut self.carry);

        let mut lines = Vec::new();
        for raw in rest.split_terminator('\n') {
            self.push_line(raw, &mut lines);
        }
        lines
    }

    /// Forget any carried fragment and framing state, for a new stream.
    pub fn reset(&mut self) {
        self.utf8.clear();
        self.carry.clear();
        self.framed = false;
    }

    fn push_line(&mut self, raw: &str, out: &mut Vec<String>) {
        let line = raw.strip_suffix('\r').unwrap_or(raw);

        if let Some(payload) = line.strip_prefix("data:") {
            self.framed = true;
            let payload = payload.strip_prefix(' ').unwrap_or(payload);
            let payload = unquote(payload);
            if payload.is_empty() {
                out.push(String::new());
            } else {
                out.extend(payload.lines().map(str::to_owned));
            }
            return;
        }

        if self.framed && is_framing(line) {
            return;
        }
        out.push(line.to_owned());
    }
}

fn is_framing(line: &str) -> bool {
    line.is_empty()
        || line.starts_with(':')
        || line.starts_with("event:")
        || line.starts_with("id:")
        || line.starts_with("retry:")
}

/// `"a\nb"` (a JSON string literal) → `a<LF>b`; anything else is returned as is.
fn unquote(payload: &str) -> String {
    if payload.len() >= 2 && payload.starts_with('"') && payload.ends_with('"') {
        if let Ok(s) = serde_json::from_str::<String>(payload) {
            return s;
        }
    }
    payload.to_owned()
}
