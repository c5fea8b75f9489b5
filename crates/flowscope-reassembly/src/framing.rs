//! SSE event framing
//!
//! Chunks arrive as raw bytes pushed from the capture hook; the framer
//! buffers them and yields complete events on the blank-line delimiter.
//! Both `\n\n` and `\r\n\r\n` delimiters are accepted, and multi-line
//! `data:` fields are joined with `\n` per the SSE spec.

/// One framed server-sent event.
#[derive(Debug, Clone, PartialEq)]
pub struct SseEvent {
    /// Value of the `event:` field, if any.
    pub name: Option<String>,
    /// Joined `data:` field value.
    pub data: String,
}

impl SseEvent {
    pub fn is_empty(&self) -> bool {
        self.data.is_empty() && self.name.is_none()
    }
}

#[derive(Debug, Default)]
pub struct SseFramer {
    buffer: Vec<u8>,
}

impl SseFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes, returning every event completed by this chunk.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(bytes);
        let mut events = Vec::new();
        while let Some((block_end, delim_len)) = find_delimiter(&self.buffer) {
            let block: Vec<u8> = self.buffer.drain(..block_end + delim_len).collect();
            if let Some(event) = parse_block(&block[..block_end]) {
                events.push(event);
            }
        }
        events
    }

    /// Drain any trailing bytes as a final event. Streams that close without
    /// a trailing blank line (Gemini does this) still yield their last event.
    pub fn finish(&mut self) -> Option<SseEvent> {
        if self.buffer.is_empty() {
            return None;
        }
        let block = std::mem::take(&mut self.buffer);
        parse_block(&block)
    }

    /// Bytes buffered but not yet framed.
    pub fn pending_bytes(&self) -> usize {
        self.buffer.len()
    }
}

/// Find the earliest `\n\n` or `\r\n\r\n`, returning (block end, delimiter
/// length).
fn find_delimiter(buffer: &[u8]) -> Option<(usize, usize)> {
    let mut i = 0;
    while i + 1 < buffer.len() {
        if buffer[i] == b'\n' && buffer[i + 1] == b'\n' {
            return Some((i, 2));
        }
        if i + 3 < buffer.len()
            && buffer[i] == b'\r'
            && buffer[i + 1] == b'\n'
            && buffer[i + 2] == b'\r'
            && buffer[i + 3] == b'\n'
        {
            return Some((i, 4));
        }
        i += 1;
    }
    None
}

fn parse_block(block: &[u8]) -> Option<SseEvent> {
    let text = String::from_utf8_lossy(block);
    let mut name = None;
    let mut data_lines: Vec<&str> = Vec::new();

    for line in text.lines() {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.starts_with(':') {
            // Comment line, keep-alive padding
            continue;
        }
        if let Some(value) = line.strip_prefix("event:") {
            name = Some(value.trim().to_string());
        } else if let Some(value) = line.strip_prefix("data:") {
            data_lines.push(value.strip_prefix(' ').unwrap_or(value));
        }
        // id: and retry: fields are irrelevant here
    }

    if name.is_none() && data_lines.is_empty() {
        return None;
    }
    Some(SseEvent {
        name,
        data: data_lines.join("\n"),
    })
}
