//! Anthropic messages stream assembly
//!
//! Named events drive a block-indexed state machine: `content_block_start`
//! opens a text, thinking, or tool_use block at an index,
//! `content_block_delta` appends to it, `content_block_stop` seals it.
//! Tool-use input arrives as `input_json_delta` fragments; the concatenated
//! string is parsed once, at block stop.

use crate::budget::BufferBudget;
use crate::delta::FlowDelta;
use flowscope_core::error::{ErrorKind, FlowError};
use flowscope_core::flow::{TokenUsage, ToolCall};
use serde_json::Value;
use std::collections::BTreeMap;

#[derive(Debug)]
enum Block {
    Text,
    Thinking { signature: Option<String> },
    ToolUse { id: String, name: String, arguments: String },
    Other,
}

#[derive(Debug, Default)]
pub(crate) struct AnthropicAssembler {
    content: String,
    thinking: String,
    thinking_signature: Option<String>,
    blocks: BTreeMap<u64, Block>,
    tool_calls: Vec<ToolCall>,
    usage: TokenUsage,
    stop_reason: Option<String>,
    model: Option<String>,
    message_id: Option<String>,
}

impl AnthropicAssembler {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn ingest(
        &mut self,
        name: Option<&str>,
        data: &str,
        budget: &mut BufferBudget,
    ) -> Vec<FlowDelta> {
        let payload: Value = match serde_json::from_str(data) {
            Ok(value) => value,
            Err(_) if data.is_empty() => Value::Null,
            Err(_) => return vec![FlowDelta::Malformed],
        };

        // Event name comes from the SSE field, falling back to the payload's
        // own type tag.
        let event = name
            .map(str::to_string)
            .or_else(|| {
                payload
                    .get("type")
                    .and_then(Value::as_str)
                    .map(str::to_string)
            })
            .unwrap_or_default();

        match event.as_str() {
            "message_start" => self.on_message_start(&payload),
            "content_block_start" => self.on_block_start(&payload),
            "content_block_delta" => self.on_block_delta(&payload, budget),
            "content_block_stop" => self.on_block_stop(&payload),
            "message_delta" => self.on_message_delta(&payload),
            "message_stop" => vec![FlowDelta::Terminator],
            "ping" => Vec::new(),
            "error" => {
                let error = payload.get("error").unwrap_or(&payload);
                let kind = error.get("type").and_then(Value::as_str).unwrap_or("error");
                let message = error
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("stream error");
                vec![
                    FlowDelta::StreamError(FlowError::new(
                        classify_error(kind),
                        format!("{kind}: {message}"),
                    )),
                    FlowDelta::Terminator,
                ]
            }
            _ => Vec::new(),
        }
    }

    fn on_message_start(&mut self, payload: &Value) -> Vec<FlowDelta> {
        if let Some(message) = payload.get("message") {
            self.message_id = message
                .get("id")
                .and_then(Value::as_str)
                .map(str::to_string);
            self.model = message
                .get("model")
                .and_then(Value::as_str)
                .map(str::to_string);
            if let Some(usage) = message.get("usage") {
                self.usage = parse_usage(usage);
            }
        }
        Vec::new()
    }

    fn on_block_start(&mut self, payload: &Value) -> Vec<FlowDelta> {
        let index = payload.get("index").and_then(Value::as_u64).unwrap_or(0);
        let Some(block) = payload.get("content_block") else {
            return Vec::new();
        };
        let mut deltas = Vec::new();
        let opened = match block.get("type").and_then(Value::as_str) {
            Some("text") => Block::Text,
            Some("thinking") => Block::Thinking { signature: None },
            Some("tool_use") => {
                let name = block
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                deltas.push(FlowDelta::ToolCallStarted { name: name.clone() });
                Block::ToolUse {
                    id: block
                        .get("id")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    name,
                    arguments: String::new(),
                }
            }
            _ => Block::Other,
        };
        self.blocks.insert(index, opened);
        deltas
    }

    fn on_block_delta(&mut self, payload: &Value, budget: &mut BufferBudget) -> Vec<FlowDelta> {
        let index = payload.get("index").and_then(Value::as_u64).unwrap_or(0);
        let Some(delta) = payload.get("delta") else {
            return Vec::new();
        };
        let Some(block) = self.blocks.get_mut(&index) else {
            return Vec::new();
        };

        match (block, delta.get("type").and_then(Value::as_str)) {
            (Block::Text, Some("text_delta")) => {
                if let Some(text) = delta.get("text").and_then(Value::as_str) {
                    budget.append(&mut self.content, text);
                    return vec![FlowDelta::Content(text.to_string())];
                }
            }
            (Block::Thinking { .. }, Some("thinking_delta")) => {
                if let Some(text) = delta.get("thinking").and_then(Value::as_str) {
                    budget.append(&mut self.thinking, text);
                    return vec![FlowDelta::Thinking(text.to_string())];
                }
            }
            (Block::Thinking { signature }, Some("signature_delta")) => {
                if let Some(value) = delta.get("signature").and_then(Value::as_str) {
                    signature
                        .get_or_insert_with(String::new)
                        .push_str(value);
                }
            }
            (Block::ToolUse { arguments, .. }, Some("input_json_delta")) => {
                if let Some(fragment) = delta.get("partial_json").and_then(Value::as_str) {
                    budget.append(arguments, fragment);
                }
            }
            _ => {}
        }
        Vec::new()
    }

    fn on_block_stop(&mut self, payload: &Value) -> Vec<FlowDelta> {
        let index = payload.get("index").and_then(Value::as_u64).unwrap_or(0);
        match self.blocks.remove(&index) {
            Some(Block::ToolUse { id, name, arguments }) => {
                // The concatenated fragments are the final arguments string;
                // parse if possible, keep raw otherwise.
                let parsed_arguments = serde_json::from_str(&arguments).ok();
                self.tool_calls.push(ToolCall {
                    id,
                    call_type: "tool_use".to_string(),
                    name,
                    arguments,
                    parsed_arguments,
                });
            }
            Some(Block::Thinking { signature }) => {
                if signature.is_some() {
                    self.thinking_signature = signature;
                }
            }
            _ => {}
        }
        Vec::new()
    }

    fn on_message_delta(&mut self, payload: &Value) -> Vec<FlowDelta> {
        let mut deltas = Vec::new();
        if let Some(delta) = payload.get("delta")
            && let Some(reason) = delta.get("stop_reason").and_then(Value::as_str)
        {
            self.stop_reason = Some(reason.to_string());
            deltas.push(FlowDelta::StopReason(reason.to_string()));
        }
        // Usage deltas add to the counts from message_start.
        if let Some(usage) = payload.get("usage") {
            if let Some(output) = usage.get("output_tokens").and_then(Value::as_u64) {
                self.usage.output_tokens += output as u32;
            }
            if let Some(input) = usage.get("input_tokens").and_then(Value::as_u64) {
                self.usage.input_tokens += input as u32;
            }
        }
        deltas
    }

    pub(crate) fn finish(self) -> super::AssembledBody {
        super::AssembledBody {
            content: self.content,
            thinking_text: self.thinking,
            thinking_signature: self.thinking_signature,
            tool_calls: self.tool_calls,
            usage: self.usage,
            stop_reason: self.stop_reason,
            model: self.model,
            message_id: self.message_id,
        }
    }
}

fn parse_usage(usage: &Value) -> TokenUsage {
    let field = |name: &str| usage.get(name).and_then(Value::as_u64).map(|v| v as u32);
    TokenUsage {
        input_tokens: field("input_tokens").unwrap_or(0),
        output_tokens: field("output_tokens").unwrap_or(0),
        cache_read_tokens: field("cache_read_input_tokens"),
        cache_write_tokens: field("cache_creation_input_tokens"),
        thinking_tokens: None,
        total_tokens: None,
    }
}

fn classify_error(kind: &str) -> ErrorKind {
    match kind {
        "overloaded_error" | "api_error" => ErrorKind::ServerError,
        "rate_limit_error" => ErrorKind::RateLimit,
        "authentication_error" | "permission_error" => ErrorKind::Authentication,
        "invalid_request_error" => ErrorKind::BadRequest,
        _ => ErrorKind::ServerError,
    }
}
