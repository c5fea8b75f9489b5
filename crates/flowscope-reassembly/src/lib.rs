//! Stream reassembly
//!
//! Converts a raw SSE byte stream into delta events plus a canonical final
//! response body. Three concrete dialect machines (OpenAI chat-completions,
//! Anthropic messages, Gemini generate-content) sit behind a tagged
//! dispatch; unknown providers pass bytes through unparsed.
//!
//! Ingestion is synchronous: the capture hook pushes chunks, the
//! reassembler never awaits disk or the bus.

mod anthropic;
mod budget;
mod delta;
mod framing;
mod gemini;
mod openai;
mod unary;

pub use budget::{BufferBudget, TRUNCATION_MARKER};
pub use delta::FlowDelta;
pub use framing::{SseEvent, SseFramer};

use anthropic::AnthropicAssembler;
use chrono::{DateTime, Utc};
use flowscope_core::error::{ErrorKind, FlowError};
use flowscope_core::flow::{StreamInfo, Thinking, TokenUsage, ToolCall};
use gemini::GeminiAssembler;
use openai::OpenAiAssembler;

/// Wire dialect of the upstream stream, chosen from the provider id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    OpenAi,
    Anthropic,
    Gemini,
    Unknown,
}

impl Dialect {
    pub fn from_provider(provider: &str) -> Self {
        let provider = provider.to_ascii_lowercase();
        if provider.contains("openai") || provider.contains("azure") {
            Self::OpenAi
        } else if provider.contains("anthropic") || provider.contains("claude") {
            Self::Anthropic
        } else if provider.contains("gemini") || provider.contains("google") {
            Self::Gemini
        } else {
            Self::Unknown
        }
    }
}

/// Per-flow reassembly limits and switches.
#[derive(Debug, Clone)]
pub struct ReassemblyConfig {
    /// Cap shared by the content, thinking, and tool-argument buffers.
    pub max_body_bytes: usize,
    pub retain_raw_chunks: bool,
    /// Start of the upstream request, for first-chunk latency.
    pub request_start: Option<DateTime<Utc>>,
    /// SSE framing when true; unary JSON accumulation when false.
    pub streaming: bool,
}

impl Default for ReassemblyConfig {
    fn default() -> Self {
        Self {
            max_body_bytes: 10 * 1024 * 1024,
            retain_raw_chunks: false,
            request_start: None,
            streaming: true,
        }
    }
}

/// Dialect-machine output, before metrics are folded in.
#[derive(Debug, Default)]
pub struct AssembledBody {
    pub content: String,
    pub thinking_text: String,
    pub thinking_signature: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    pub usage: TokenUsage,
    pub stop_reason: Option<String>,
    pub model: Option<String>,
    pub message_id: Option<String>,
}

/// Everything the finalizer needs to seal a streamed response.
#[derive(Debug)]
pub struct AssembledResponse {
    pub content: String,
    pub thinking: Option<Thinking>,
    pub tool_calls: Vec<ToolCall>,
    pub usage: TokenUsage,
    pub stop_reason: Option<String>,
    pub model: Option<String>,
    pub message_id: Option<String>,
    pub stream: StreamInfo,
    /// Body-cap or in-stream error, if any.
    pub error: Option<FlowError>,
    /// Canonical reconstruction of the final body; for unary flows, the
    /// body as the provider sent it.
    pub body: serde_json::Value,
    /// Total raw bytes pushed through `ingest`.
    pub bytes_ingested: usize,
    /// False for unary flows.
    pub was_streaming: bool,
}

enum Machine {
    OpenAi(OpenAiAssembler),
    Anthropic(AnthropicAssembler),
    Gemini(GeminiAssembler),
    Passthrough,
}

/// Per-flow SSE state machine. One producing task owns it; ingestion is
/// synchronous.
pub struct Reassembler {
    dialect: Dialect,
    framer: SseFramer,
    machine: Machine,
    budget: BufferBudget,
    raw_chunks: Option<Vec<String>>,
    parse_error_count: u32,
    chunk_count: u32,
    request_start: Option<DateTime<Utc>>,
    first_chunk_at: Option<DateTime<Utc>>,
    last_chunk_at: Option<DateTime<Utc>>,
    interval_sum_ms: f64,
    terminated: bool,
    error: Option<FlowError>,
    /// `Some` when the flow is unary: raw body accumulates here instead of
    /// going through SSE framing.
    unary_buffer: Option<Vec<u8>>,
    max_body_bytes: usize,
    bytes_ingested: usize,
}

impl Reassembler {
    pub fn new(dialect: Dialect, config: ReassemblyConfig) -> Self {
        let machine = match dialect {
            Dialect::OpenAi => Machine::OpenAi(OpenAiAssembler::new()),
            Dialect::Anthropic => Machine::Anthropic(AnthropicAssembler::new()),
            Dialect::Gemini => Machine::Gemini(GeminiAssembler::new()),
            Dialect::Unknown => Machine::Passthrough,
        };
        Self {
            dialect,
            framer: SseFramer::new(),
            machine,
            budget: BufferBudget::new(config.max_body_bytes),
            raw_chunks: config.retain_raw_chunks.then(Vec::new),
            parse_error_count: 0,
            chunk_count: 0,
            request_start: config.request_start,
            first_chunk_at: None,
            last_chunk_at: None,
            interval_sum_ms: 0.0,
            terminated: false,
            error: None,
            unary_buffer: (!config.streaming).then(Vec::new),
            max_body_bytes: config.max_body_bytes,
            bytes_ingested: 0,
        }
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    pub fn terminated(&self) -> bool {
        self.terminated
    }

    pub fn parse_error_count(&self) -> u32 {
        self.parse_error_count
    }

    pub fn chunk_count(&self) -> u32 {
        self.chunk_count
    }

    /// Feed one raw chunk from the upstream, returning the deltas it
    /// produced. Chunks after termination or a latched error are dropped.
    pub fn ingest(&mut self, bytes: &[u8]) -> Vec<FlowDelta> {
        if self.terminated || self.error.is_some() {
            return Vec::new();
        }
        self.bytes_ingested += bytes.len();

        if let Some(buffer) = &mut self.unary_buffer {
            if buffer.len() + bytes.len() > self.max_body_bytes {
                let room = self.max_body_bytes.saturating_sub(buffer.len());
                buffer.extend_from_slice(&bytes[..room]);
                let error = FlowError::new(
                    ErrorKind::TokenLimitExceeded,
                    format!("response body exceeded {} bytes", self.max_body_bytes),
                );
                self.error = Some(error.clone());
                return vec![FlowDelta::StreamError(error)];
            }
            buffer.extend_from_slice(bytes);
            return Vec::new();
        }

        if matches!(self.machine, Machine::Passthrough) {
            if !bytes.is_empty() {
                self.record_chunk();
                if let Some(raw) = &mut self.raw_chunks {
                    raw.push(String::from_utf8_lossy(bytes).into_owned());
                }
            }
            return Vec::new();
        }

        let mut out = Vec::new();
        for event in self.framer.push(bytes) {
            self.ingest_event(&event, &mut out);
            if self.terminated || self.error.is_some() {
                break;
            }
        }
        out
    }

    fn ingest_event(&mut self, event: &SseEvent, out: &mut Vec<FlowDelta>) {
        if event.is_empty() {
            return;
        }
        if let Some(raw) = &mut self.raw_chunks {
            raw.push(event.data.clone());
        }

        let deltas = match &mut self.machine {
            Machine::OpenAi(machine) => machine.ingest(&event.data, &mut self.budget),
            Machine::Anthropic(machine) => {
                machine.ingest(event.name.as_deref(), &event.data, &mut self.budget)
            }
            Machine::Gemini(machine) => machine.ingest(&event.data, &mut self.budget),
            Machine::Passthrough => Vec::new(),
        };

        let is_terminator = deltas
            .iter()
            .any(|d| matches!(d, FlowDelta::Terminator));
        if !is_terminator {
            self.record_chunk();
        }

        for delta in deltas {
            match delta {
                FlowDelta::Malformed => {
                    self.parse_error_count += 1;
                    tracing::debug!(
                        dialect = ?self.dialect,
                        "skipping malformed stream event"
                    );
                }
                FlowDelta::Terminator => {
                    self.terminated = true;
                    out.push(FlowDelta::Terminator);
                }
                FlowDelta::StreamError(error) => {
                    self.error = Some(error.clone());
                    out.push(FlowDelta::StreamError(error));
                }
                other => out.push(other),
            }
        }

        if self.budget.exceeded() && self.error.is_none() {
            let error = FlowError::new(
                ErrorKind::TokenLimitExceeded,
                format!("response body exceeded {} bytes", self.budget_cap()),
            );
            self.error = Some(error.clone());
            out.push(FlowDelta::StreamError(error));
        }
    }

    fn budget_cap(&self) -> usize {
        // used() == cap once exceeded
        self.budget.used()
    }

    fn record_chunk(&mut self) {
        let now = Utc::now();
        self.chunk_count += 1;
        if self.first_chunk_at.is_none() {
            self.first_chunk_at = Some(now);
        }
        if let Some(last) = self.last_chunk_at {
            self.interval_sum_ms += (now - last).num_milliseconds().max(0) as f64;
        }
        self.last_chunk_at = Some(now);
    }

    /// Seal the stream and produce the canonical response body. A trailing
    /// unframed block (Gemini close without blank line) is drained first.
    pub fn finish(mut self) -> AssembledResponse {
        let was_streaming = self.unary_buffer.is_none();

        let mut original_body = None;
        let body = if let Some(buffer) = self.unary_buffer.take() {
            match serde_json::from_slice::<serde_json::Value>(&buffer) {
                Ok(value) => {
                    let fields = unary::parse_unary(self.dialect, &value);
                    original_body = Some(value);
                    fields
                }
                Err(_) => {
                    if !buffer.is_empty() {
                        self.parse_error_count += 1;
                    }
                    AssembledBody::default()
                }
            }
        } else {
            if !matches!(self.machine, Machine::Passthrough)
                && !self.terminated
                && self.error.is_none()
                && let Some(event) = self.framer.finish()
            {
                let mut trailing = Vec::new();
                self.ingest_event(&event, &mut trailing);
            }

            match self.machine {
                Machine::OpenAi(machine) => machine.finish(),
                Machine::Anthropic(machine) => machine.finish(),
                Machine::Gemini(machine) => machine.finish(),
                Machine::Passthrough => AssembledBody::default(),
            }
        };

        let first_chunk_latency_ms = match (self.request_start, self.first_chunk_at) {
            (Some(start), Some(first)) => Some((first - start).num_milliseconds().max(0) as u64),
            _ => None,
        };
        let mean_chunk_interval_ms = if self.chunk_count > 1 {
            Some(self.interval_sum_ms / (self.chunk_count - 1) as f64)
        } else {
            None
        };

        let stream = StreamInfo {
            chunk_count: self.chunk_count,
            first_chunk_latency_ms,
            mean_chunk_interval_ms,
            parse_error_count: self.parse_error_count,
            raw_chunks: self.raw_chunks,
        };

        let thinking = (!body.thinking_text.is_empty()).then(|| Thinking {
            token_count: body
                .usage
                .thinking_tokens
                .or(Some((body.thinking_text.len() / 4) as u32)),
            text: body.thinking_text,
            signature: body.thinking_signature,
        });

        let canonical = original_body.unwrap_or_else(|| {
            serde_json::json!({
                "id": &body.message_id,
                "model": &body.model,
                "content": &body.content,
                "tool_calls": &body.tool_calls,
                "stop_reason": &body.stop_reason,
                "usage": body.usage,
            })
        });

        AssembledResponse {
            content: body.content,
            thinking,
            tool_calls: body.tool_calls,
            usage: body.usage,
            stop_reason: body.stop_reason,
            model: body.model,
            message_id: body.message_id,
            stream,
            error: self.error,
            body: canonical,
            bytes_ingested: self.bytes_ingested,
            was_streaming,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn openai_reassembler(cap: usize) -> Reassembler {
        Reassembler::new(
            Dialect::OpenAi,
            ReassemblyConfig {
                max_body_bytes: cap,
                request_start: Some(Utc::now()),
                ..Default::default()
            },
        )
    }

    #[test]
    fn dialect_from_provider() {
        assert_eq!(Dialect::from_provider("openai"), Dialect::OpenAi);
        assert_eq!(Dialect::from_provider("Anthropic"), Dialect::Anthropic);
        assert_eq!(Dialect::from_provider("google-gemini"), Dialect::Gemini);
        assert_eq!(Dialect::from_provider("kiro"), Dialect::Unknown);
    }

    #[test]
    fn openai_stream_reassembles_end_to_end() {
        let mut reassembler = openai_reassembler(1024 * 1024);

        let chunks: Vec<&[u8]> = vec![
            b"data: {\"id\":\"cmpl-1\",\"model\":\"gpt-4o\",\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\n",
            b"data: {\"choices\":[{\"delta\":{\"content\":\"Hi \"}}]}\n\n",
            b"data: {\"choices\":[{\"delta\":{\"content\":\"there\"}}]}\n\n",
            b"data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"stop\"}],\"usage\":{\"prompt_tokens\":4,\"completion_tokens\":2,\"total_tokens\":6}}\n\n",
            b"data: [DONE]\n\n",
        ];
        let mut terminated = false;
        for chunk in chunks {
            for delta in reassembler.ingest(chunk) {
                if matches!(delta, FlowDelta::Terminator) {
                    terminated = true;
                }
            }
        }
        assert!(terminated);
        assert_eq!(reassembler.chunk_count(), 4);

        let assembled = reassembler.finish();
        assert_eq!(assembled.content, "Hi there");
        assert_eq!(assembled.usage.total_tokens, Some(6));
        assert_eq!(assembled.stop_reason.as_deref(), Some("stop"));
        assert!(assembled.error.is_none());
        assert_eq!(assembled.stream.chunk_count, 4);
        assert!(assembled.stream.first_chunk_latency_ms.is_some());
    }

    #[test]
    fn body_cap_latches_token_limit_error() {
        let mut reassembler = openai_reassembler(8);
        let deltas = reassembler.ingest(
            b"data: {\"choices\":[{\"delta\":{\"content\":\"0123456789abcdef\"}}]}\n\n",
        );
        assert!(deltas.iter().any(|d| matches!(
            d,
            FlowDelta::StreamError(e) if e.kind == ErrorKind::TokenLimitExceeded
        )));

        // Later chunks are dropped outright
        assert!(reassembler
            .ingest(b"data: {\"choices\":[{\"delta\":{\"content\":\"more\"}}]}\n\n")
            .is_empty());

        let assembled = reassembler.finish();
        assert!(assembled.content.ends_with(TRUNCATION_MARKER));
        assert_eq!(
            assembled.error.as_ref().map(|e| e.kind),
            Some(ErrorKind::TokenLimitExceeded)
        );
    }

    #[test]
    fn passthrough_counts_chunks_without_parsing() {
        let mut reassembler = Reassembler::new(
            Dialect::Unknown,
            ReassemblyConfig {
                retain_raw_chunks: true,
                ..Default::default()
            },
        );
        assert!(reassembler.ingest(b"opaque bytes").is_empty());
        assert!(reassembler.ingest(b"more bytes").is_empty());
        let assembled = reassembler.finish();
        assert_eq!(assembled.stream.chunk_count, 2);
        assert_eq!(
            assembled.stream.raw_chunks.as_ref().map(Vec::len),
            Some(2)
        );
        assert!(assembled.content.is_empty());
    }

    #[test]
    fn raw_chunks_not_retained_by_default() {
        let mut reassembler = openai_reassembler(1024);
        reassembler.ingest(b"data: {\"choices\":[{\"delta\":{\"content\":\"x\"}}]}\n\n");
        let assembled = reassembler.finish();
        assert!(assembled.stream.raw_chunks.is_none());
    }

    #[test]
    fn gemini_terminates_on_close_with_finish_reason() {
        let mut reassembler = Reassembler::new(Dialect::Gemini, ReassemblyConfig::default());
        reassembler.ingest(
            b"data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"done\"}]},\"finishReason\":\"STOP\"}]}\n\n",
        );
        let assembled = reassembler.finish();
        assert_eq!(assembled.content, "done");
        assert_eq!(assembled.stop_reason.as_deref(), Some("STOP"));
    }

    #[test]
    fn gemini_trailing_block_is_drained_at_finish() {
        let mut reassembler = Reassembler::new(Dialect::Gemini, ReassemblyConfig::default());
        // No trailing blank line before the stream closes
        reassembler.ingest(
            b"data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"tail\"}]},\"finishReason\":\"STOP\"}]}",
        );
        let assembled = reassembler.finish();
        assert_eq!(assembled.content, "tail");
    }

    #[test]
    fn unary_body_accumulates_then_parses() {
        let mut reassembler = Reassembler::new(
            Dialect::Anthropic,
            ReassemblyConfig {
                streaming: false,
                ..Default::default()
            },
        );
        let body = br#"{"id":"msg_1","model":"claude-sonnet-4","content":[{"type":"text","text":"plain"}],"usage":{"input_tokens":3,"output_tokens":2}}"#;
        // Split across two pushes, as a transfer-encoded body would arrive
        reassembler.ingest(&body[..40]);
        reassembler.ingest(&body[40..]);

        let assembled = reassembler.finish();
        assert!(!assembled.was_streaming);
        assert_eq!(assembled.content, "plain");
        assert_eq!(assembled.usage.input_tokens, 3);
        assert_eq!(assembled.stream.chunk_count, 0);
        assert_eq!(assembled.bytes_ingested, body.len());
        // The original body is preserved verbatim
        assert_eq!(assembled.body["id"], "msg_1");
    }

    #[test]
    fn unary_body_cap_fails_the_flow() {
        let mut reassembler = Reassembler::new(
            Dialect::OpenAi,
            ReassemblyConfig {
                streaming: false,
                max_body_bytes: 16,
                ..Default::default()
            },
        );
        let deltas = reassembler.ingest(&[b'x'; 64]);
        assert!(deltas.iter().any(|d| matches!(
            d,
            FlowDelta::StreamError(e) if e.kind == ErrorKind::TokenLimitExceeded
        )));
    }

    #[test]
    fn malformed_events_count_parse_errors() {
        let mut reassembler = openai_reassembler(1024);
        reassembler.ingest(b"data: {broken\n\n");
        reassembler.ingest(b"data: {\"choices\":[{\"delta\":{\"content\":\"ok\"}}]}\n\n");
        let assembled = reassembler.finish();
        assert_eq!(assembled.stream.parse_error_count, 1);
        assert_eq!(assembled.content, "ok");
    }
}
