use thiserror::Error;

pub const DEFAULT_MAX_EVENT_BYTES: usize = 256 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("event exceeds max size: {size} > {max}")]
    OversizedEvent { size: usize, max: usize },
    #[error("event is not valid utf-8")]
    InvalidUtf8,
    #[error("event encode failed: {0}")]
    Encode(String),
    #[error("event decode failed: {0}")]
    Decode(String),
}

/// One dispatched server-sent event.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
    pub id: Option<String>,
}

impl SseEvent {
    pub fn name(&self) -> &str {
        self.event.as_deref().unwrap_or("message")
    }
}

#[derive(Debug, Clone)]
pub struct DecodeReport {
    pub events: Vec<SseEvent>,
    pub comments: Vec<String>,
    pub errors: Vec<FrameError>,
}

impl Default for DecodeReport {
    fn default() -> Self {
        Self {
            events: Vec::new(),
            comments: Vec::new(),
            errors: Vec::new(),
        }
    }
}

/// Renders a named event in `text/event-stream` framing.
pub fn encode_event(name: &str, data: &str) -> String {
    let mut out = format!("event: {name}\n");
    for line in data.split('\n') {
        out.push_str("data: ");
        out.push_str(line);
        out.push('\n');
    }
    out.push('\n');
    out
}

/// Incremental `text/event-stream` parser. Chunks may split anywhere,
/// including inside a line or a multi-byte character.
pub struct SseDecoder {
    max_event_bytes: usize,
    pending: Vec<u8>,
    current: SseEvent,
    current_bytes: usize,
    has_data: bool,
}

impl SseDecoder {
    pub fn new(max_event_bytes: usize) -> Self {
        Self {
            max_event_bytes,
            pending: Vec::new(),
            current: SseEvent::default(),
            current_bytes: 0,
            has_data: false,
        }
    }

    pub fn push_chunk(&mut self, chunk: &[u8]) -> DecodeReport {
        let mut report = DecodeReport::default();
        if !chunk.is_empty() {
            self.pending.extend_from_slice(chunk);
        }

        while let Some(newline_idx) = self.pending.iter().position(|byte| *byte == b'\n') {
            let mut line = self.pending.drain(..=newline_idx).collect::<Vec<u8>>();
            line.pop();
            if line.ends_with(b"\r") {
                line.pop();
            }
            match String::from_utf8(line) {
                Ok(line) => self.process_line(&line, &mut report),
                Err(_) => {
                    report.errors.push(FrameError::InvalidUtf8);
                    self.reset_event();
                }
            }
        }

        if self.pending.len() > self.max_event_bytes {
            report.errors.push(FrameError::OversizedEvent {
                size: self.pending.len(),
                max: self.max_event_bytes,
            });
            self.pending.clear();
            self.reset_event();
        }

        report
    }

    /// Flushes a trailing event that was not terminated by a blank line.
    pub fn finish(&mut self) -> DecodeReport {
        let mut report = DecodeReport::default();
        if !self.pending.is_empty() {
            let line = std::mem::take(&mut self.pending);
            match String::from_utf8(line) {
                Ok(line) => self.process_line(line.trim_end_matches('\r'), &mut report),
                Err(_) => report.errors.push(FrameError::InvalidUtf8),
            }
        }
        self.dispatch(&mut report);
        report
    }

    fn process_line(&mut self, line: &str, report: &mut DecodeReport) {
        if line.is_empty() {
            self.dispatch(report);
            return;
        }
        if let Some(comment) = line.strip_prefix(':') {
            report.comments.push(comment.trim_start().to_string());
            return;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        self.current_bytes += line.len();
        if self.current_bytes > self.max_event_bytes {
            report.errors.push(FrameError::OversizedEvent {
                size: self.current_bytes,
                max: self.max_event_bytes,
            });
            self.reset_event();
            return;
        }

        match field {
            "event" => self.current.event = Some(value.to_string()),
            "data" => {
                if self.has_data {
                    self.current.data.push('\n');
                }
                self.current.data.push_str(value);
                self.has_data = true;
            }
            "id" => self.current.id = Some(value.to_string()),
            _ => {}
        }
    }

    fn dispatch(&mut self, report: &mut DecodeReport) {
        if self.has_data {
            report.events.push(std::mem::take(&mut self.current));
        }
        self.reset_event();
    }

    fn reset_event(&mut self) {
        self.current = SseEvent::default();
        self.current_bytes = 0;
        self.has_data = false;
    }
}

impl Default for SseDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_EVENT_BYTES)
    }
}
