//! The canonical Flow record: one captured LLM exchange
//!
//! A Flow owns exactly one request, at most one response, and moves through
//! a small state lattice. Terminal flows are immutable except for
//! annotations.

use crate::error::{Error, FlowError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

pub type FlowId = String;

/// Header names whose values are masked on export.
pub const SENSITIVE_HEADERS: &[&str] = &[
    "authorization",
    "proxy-authorization",
    "x-api-key",
    "x-goog-api-key",
    "cookie",
    "set-cookie",
];

/// Lifecycle state of a Flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowState {
    Pending,
    Streaming,
    Completed,
    Failed,
    Cancelled,
    Intercepted,
}

impl FlowState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// The transition lattice. Terminal states accept no transitions.
    pub fn can_transition(self, to: FlowState) -> bool {
        use FlowState::*;
        match (self, to) {
            (Pending, Streaming | Completed | Failed | Cancelled | Intercepted) => true,
            (Streaming, Completed | Failed | Cancelled) => true,
            (Intercepted, Pending | Failed | Cancelled) => true,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Streaming => "streaming",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Intercepted => "intercepted",
        }
    }

    /// Case-insensitive parse, used by the filter language and the index.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "streaming" => Some(Self::Streaming),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            "intercepted" => Some(Self::Intercepted),
            _ => None,
        }
    }

    pub const ALL: &'static [FlowState] = &[
        Self::Pending,
        Self::Streaming,
        Self::Completed,
        Self::Failed,
        Self::Cancelled,
        Self::Intercepted,
    ];
}

/// Message content: plain text or an ordered list of parts. Binary parts are
/// stored by reference; the blob itself lives outside the core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl MessageContent {
    /// Concatenated text of all textual parts.
    pub fn text(&self) -> String {
        match self {
            Self::Text(t) => t.clone(),
            Self::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text {
        text: String,
    },
    ImageRef {
        handle: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        thumbnail: Option<String>,
    },
    AudioRef {
        handle: String,
    },
    FileRef {
        handle: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
}

/// One entry in the normalized message sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: MessageContent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Message {
    pub fn text(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: MessageContent::Text(content.into()),
            tool_calls: None,
            tool_result: None,
            name: None,
        }
    }
}

/// A tool definition offered to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<serde_json::Value>,
}

/// Sampling parameters plus a free-form extras map for everything else.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RequestParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop: Vec<String>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub extra: HashMap<String, serde_json::Value>,
}

/// The captured client request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowRequest {
    pub method: String,
    pub path: String,
    /// Ordered header pairs; sensitive names are masked on export only.
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    pub body: serde_json::Value,
    /// Normalized message sequence.
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ToolDefinition>>,
    pub model: String,
    /// Model as the client sent it, before alias resolution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_model: Option<String>,
    #[serde(default)]
    pub params: RequestParams,
    pub body_bytes: usize,
    pub created_at: DateTime<Utc>,
}

/// A tool invocation extracted from a response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub call_type: String,
    pub name: String,
    /// Raw arguments string, concatenated from stream fragments.
    pub arguments: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parsed_arguments: Option<serde_json::Value>,
}

/// Extended-thinking block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Thinking {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

/// Token accounting as the provider reported it.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub input_tokens: u32,
    #[serde(default)]
    pub output_tokens: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_read_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_write_tokens: Option<u32>,
    /// Reported separately; never folded into `total_tokens`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_tokens: Option<u32>,
}

impl TokenUsage {
    pub fn total(&self) -> u32 {
        self.total_tokens
            .unwrap_or(self.input_tokens + self.output_tokens)
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Streaming statistics for a Flow whose response arrived as SSE.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamInfo {
    /// Non-empty SSE events consumed, terminator excluded.
    pub chunk_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_chunk_latency_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mean_chunk_interval_ms: Option<f64>,
    #[serde(default)]
    pub parse_error_count: u32,
    /// Retained only when configuration asks for it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_chunks: Option<Vec<String>>,
}

/// The captured upstream response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowResponse {
    pub status: u16,
    pub status_text: String,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<serde_json::Value>,
    /// Extracted plain-text content.
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<Thinking>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default)]
    pub usage: TokenUsage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<String>,
    #[serde(default)]
    pub body_bytes: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<StreamInfo>,
}

impl FlowResponse {
    pub fn head(status: u16, status_text: impl Into<String>, headers: Vec<(String, String)>) -> Self {
        Self {
            status,
            status_text: status_text.into(),
            headers,
            body: None,
            content: String::new(),
            thinking: None,
            tool_calls: Vec::new(),
            usage: TokenUsage::default(),
            stop_reason: None,
            body_bytes: 0,
            started_at: Some(Utc::now()),
            ended_at: None,
            stream: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdk: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdk_version: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingInfo {
    pub original_model: String,
    pub resolved_model: String,
    pub provider: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule_id: Option<String>,
}

/// Provider/credential/routing context for a Flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowMetadata {
    pub provider: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential_name: Option<String>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub client: ClientInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub routing: Option<RoutingInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub injected_params: Option<HashMap<String, serde_json::Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_usage_percent: Option<f64>,
}

impl FlowMetadata {
    pub fn for_provider(provider: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            credential_id: None,
            credential_name: None,
            retry_count: 0,
            client: ClientInfo::default(),
            routing: None,
            injected_params: None,
            context_usage_percent: None,
        }
    }
}

/// Lifecycle timestamps. Only `created` is always present; `duration_ms`
/// freezes once the Flow is terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Timestamps {
    pub created: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_start: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_end: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_start: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_end: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttfb_ms: Option<u64>,
}

impl Timestamps {
    pub fn now() -> Self {
        Self {
            created: Utc::now(),
            request_start: None,
            request_end: None,
            response_start: None,
            response_end: None,
            duration_ms: None,
            ttfb_ms: None,
        }
    }
}

/// User-editable block; the only mutable part of a terminal Flow.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Annotations {
    #[serde(default)]
    pub starred: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub marker: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub tags: BTreeSet<String>,
}

/// The canonical record of one LLM exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Flow {
    pub id: FlowId,
    pub request: FlowRequest,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<FlowResponse>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<FlowError>,
    pub metadata: FlowMetadata,
    pub timestamps: Timestamps,
    pub state: FlowState,
    #[serde(default)]
    pub annotations: Annotations,
}

const PREVIEW_CHARS: usize = 200;

fn preview(text: &str) -> String {
    if text.chars().count() <= PREVIEW_CHARS {
        text.to_string()
    } else {
        text.chars().take(PREVIEW_CHARS).collect()
    }
}

impl Flow {
    pub fn new(request: FlowRequest, metadata: FlowMetadata) -> Self {
        Self {
            id: crate::id::generate_flow_id(),
            request,
            response: None,
            error: None,
            metadata,
            timestamps: Timestamps::now(),
            state: FlowState::Pending,
            annotations: Annotations::default(),
        }
    }

    /// Apply a state transition, enforcing the lattice.
    pub fn transition(&mut self, to: FlowState) -> Result<()> {
        if !self.state.can_transition(to) {
            return Err(Error::IllegalTransition {
                from: self.state,
                to,
            });
        }
        self.state = to;
        Ok(())
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn has_error(&self) -> bool {
        self.error.is_some()
    }

    pub fn has_tool_calls(&self) -> bool {
        self.response
            .as_ref()
            .is_some_and(|r| !r.tool_calls.is_empty())
    }

    pub fn has_thinking(&self) -> bool {
        self.response.as_ref().is_some_and(|r| r.thinking.is_some())
    }

    pub fn is_streaming(&self) -> bool {
        self.response.as_ref().is_some_and(|r| r.stream.is_some())
            || self.request.params.stream
    }

    pub fn total_tokens(&self) -> Option<u32> {
        self.response.as_ref().map(|r| r.usage.total())
    }

    /// First ~200 chars of the extracted response content.
    pub fn content_preview(&self) -> String {
        self.response
            .as_ref()
            .map(|r| preview(&r.content))
            .unwrap_or_default()
    }

    /// First ~200 chars of the concatenated request message text.
    pub fn request_preview(&self) -> String {
        preview(&self.request_text())
    }

    /// All request-side text: system prompt plus every message's text.
    pub fn request_text(&self) -> String {
        let mut parts = Vec::new();
        if let Some(system) = &self.request.system {
            parts.push(system.clone());
        }
        for message in &self.request.messages {
            let text = message.content.text();
            if !text.is_empty() {
                parts.push(text);
            }
        }
        parts.join("\n")
    }

    /// Rough in-memory footprint used by the store's observability counter.
    pub fn byte_estimate(&self) -> usize {
        let mut bytes = self.request.body_bytes;
        if let Some(response) = &self.response {
            bytes += response.body_bytes;
            bytes += response.content.len();
            if let Some(thinking) = &response.thinking {
                bytes += thinking.text.len();
            }
        }
        bytes
    }

    /// Freeze derived timestamps. Called exactly once, on terminal
    /// transition.
    pub fn seal_timestamps(&mut self) {
        let end = self
            .timestamps
            .response_end
            .or_else(|| self.error.as_ref().map(|e| e.timestamp))
            .unwrap_or_else(Utc::now);
        self.timestamps.response_end = Some(end);
        let start = self.timestamps.request_start.unwrap_or(self.timestamps.created);
        self.timestamps.duration_ms = Some(
            (end - start).num_milliseconds().max(0) as u64,
        );
        if self.timestamps.ttfb_ms.is_none()
            && let Some(response_start) = self.timestamps.response_start
        {
            self.timestamps.ttfb_ms =
                Some((response_start - start).num_milliseconds().max(0) as u64);
        }
        if let Some(response) = &mut self.response
            && response.ended_at.is_none()
        {
            response.ended_at = Some(end);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_request() -> FlowRequest {
        FlowRequest {
            method: "POST".to_string(),
            path: "/v1/messages".to_string(),
            headers: vec![("content-type".to_string(), "application/json".to_string())],
            body: serde_json::json!({"model": "claude-sonnet-4"}),
            messages: vec![Message::text("user", "hello")],
            system: Some("be helpful".to_string()),
            tools: None,
            model: "claude-sonnet-4".to_string(),
            original_model: None,
            params: RequestParams::default(),
            body_bytes: 64,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn state_lattice() {
        use FlowState::*;
        assert!(Pending.can_transition(Streaming));
        assert!(Pending.can_transition(Intercepted));
        assert!(Streaming.can_transition(Completed));
        assert!(Streaming.can_transition(Cancelled));
        assert!(Intercepted.can_transition(Pending));
        assert!(!Completed.can_transition(Failed));
        assert!(!Failed.can_transition(Pending));
        assert!(!Streaming.can_transition(Pending));
    }

    #[test]
    fn transition_rejects_illegal_moves() {
        let mut flow = Flow::new(test_request(), FlowMetadata::for_provider("anthropic"));
        flow.transition(FlowState::Streaming).unwrap();
        flow.transition(FlowState::Completed).unwrap();
        let err = flow.transition(FlowState::Failed).unwrap_err();
        assert!(matches!(err, Error::IllegalTransition { .. }));
    }

    #[test]
    fn id_is_sixteen_printable_bytes() {
        let flow = Flow::new(test_request(), FlowMetadata::for_provider("openai"));
        assert_eq!(flow.id.len(), 16);
        assert!(flow.id.bytes().all(|b| b.is_ascii_graphic()));
    }

    #[test]
    fn seal_freezes_duration() {
        let mut flow = Flow::new(test_request(), FlowMetadata::for_provider("openai"));
        flow.timestamps.request_start = Some(flow.timestamps.created);
        flow.transition(FlowState::Completed).unwrap();
        flow.seal_timestamps();
        assert!(flow.timestamps.duration_ms.is_some());
        assert!(flow.timestamps.response_end.is_some());
    }

    #[test]
    fn usage_total_prefers_provider_value() {
        let usage = TokenUsage {
            input_tokens: 10,
            output_tokens: 20,
            total_tokens: Some(31),
            ..Default::default()
        };
        assert_eq!(usage.total(), 31);

        let derived = TokenUsage {
            input_tokens: 10,
            output_tokens: 20,
            ..Default::default()
        };
        assert_eq!(derived.total(), 30);
    }

    #[test]
    fn flow_roundtrips_through_json() {
        let mut flow = Flow::new(test_request(), FlowMetadata::for_provider("anthropic"));
        flow.annotations.tags.insert("demo".to_string());
        let json = serde_json::to_string(&flow).unwrap();
        let back: Flow = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, flow.id);
        assert_eq!(back.state, flow.state);
        assert_eq!(back.annotations.tags, flow.annotations.tags);
    }

    #[test]
    fn message_content_text_joins_parts() {
        let content = MessageContent::Parts(vec![
            ContentPart::Text {
                text: "a".to_string(),
            },
            ContentPart::ImageRef {
                handle: "blob-1".to_string(),
                thumbnail: None,
            },
            ContentPart::Text {
                text: "b".to_string(),
            },
        ]);
        assert_eq!(content.text(), "a\nb");
    }
}
