//! OpenAI chat-completions stream assembly
//!
//! Each `data:` payload is a chunk object whose `choices[].delta` carries
//! content suffixes and tool-call fragments. Tool-call arguments arrive as
//! JSON string fragments routed by `index`; they are concatenated, never
//! parsed mid-stream. `data: [DONE]` terminates. The `usage` field, usually
//! only on the final chunk, overwrites whatever was seen before.

use crate::budget::BufferBudget;
use crate::delta::FlowDelta;
use flowscope_core::flow::{TokenUsage, ToolCall};
use serde_json::Value;
use std::collections::BTreeMap;

#[derive(Debug, Default)]
struct ToolCallBuilder {
    id: String,
    call_type: String,
    name: String,
    arguments: String,
}

#[derive(Debug, Default)]
pub(crate) struct OpenAiAssembler {
    content: String,
    role: Option<String>,
    tool_builders: BTreeMap<u64, ToolCallBuilder>,
    usage: TokenUsage,
    stop_reason: Option<String>,
    model: Option<String>,
    message_id: Option<String>,
}

impl OpenAiAssembler {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Ingest one framed event's data payload.
    pub(crate) fn ingest(&mut self, data: &str, budget: &mut BufferBudget) -> Vec<FlowDelta> {
        if data.trim() == "[DONE]" {
            return vec![FlowDelta::Terminator];
        }

        let chunk: Value = match serde_json::from_str(data) {
            Ok(value) => value,
            Err(_) => return vec![FlowDelta::Malformed],
        };

        let mut deltas = Vec::new();

        if self.message_id.is_none()
            && let Some(id) = chunk.get("id").and_then(Value::as_str)
        {
            self.message_id = Some(id.to_string());
        }
        if self.model.is_none()
            && let Some(model) = chunk.get("model").and_then(Value::as_str)
        {
            self.model = Some(model.to_string());
        }

        if let Some(choices) = chunk.get("choices").and_then(Value::as_array) {
            for choice in choices {
                if let Some(delta) = choice.get("delta") {
                    self.ingest_choice_delta(delta, budget, &mut deltas);
                }
                if let Some(reason) = choice.get("finish_reason").and_then(Value::as_str) {
                    self.stop_reason = Some(reason.to_string());
                    deltas.push(FlowDelta::StopReason(reason.to_string()));
                }
            }
        }

        if let Some(usage) = chunk.get("usage")
            && !usage.is_null()
        {
            self.usage = parse_usage(usage);
        }

        deltas
    }

    fn ingest_choice_delta(
        &mut self,
        delta: &Value,
        budget: &mut BufferBudget,
        deltas: &mut Vec<FlowDelta>,
    ) {
        if self.role.is_none()
            && let Some(role) = delta.get("role").and_then(Value::as_str)
        {
            self.role = Some(role.to_string());
        }

        if let Some(text) = delta.get("content").and_then(Value::as_str)
            && !text.is_empty()
        {
            budget.append(&mut self.content, text);
            deltas.push(FlowDelta::Content(text.to_string()));
        }

        if let Some(tool_calls) = delta.get("tool_calls").and_then(Value::as_array) {
            for fragment in tool_calls {
                let index = fragment.get("index").and_then(Value::as_u64).unwrap_or(0);
                let builder = self.tool_builders.entry(index).or_default();

                if let Some(id) = fragment.get("id").and_then(Value::as_str) {
                    builder.id = id.to_string();
                }
                if let Some(call_type) = fragment.get("type").and_then(Value::as_str) {
                    builder.call_type = call_type.to_string();
                }
                if let Some(function) = fragment.get("function") {
                    if let Some(name) = function.get("name").and_then(Value::as_str) {
                        let started = builder.name.is_empty() && !name.is_empty();
                        builder.name.push_str(name);
                        if started {
                            deltas.push(FlowDelta::ToolCallStarted {
                                name: builder.name.clone(),
                            });
                        }
                    }
                    // Arguments are a stream of JSON string fragments;
                    // concatenation is the contract, parsing is not.
                    if let Some(arguments) = function.get("arguments").and_then(Value::as_str) {
                        budget.append(&mut builder.arguments, arguments);
                    }
                }
            }
        }
    }

    pub(crate) fn finish(self) -> super::AssembledBody {
        let tool_calls: Vec<ToolCall> = self
            .tool_builders
            .into_values()
            .map(|builder| {
                let parsed_arguments = serde_json::from_str(&builder.arguments).ok();
                ToolCall {
                    id: builder.id,
                    call_type: if builder.call_type.is_empty() {
                        "function".to_string()
                    } else {
                        builder.call_type
                    },
                    name: builder.name,
                    arguments: builder.arguments,
                    parsed_arguments,
                }
            })
            .collect();

        super::AssembledBody {
            content: self.content,
            thinking_text: String::new(),
            thinking_signature: None,
            tool_calls,
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
        input_tokens: field("prompt_tokens").unwrap_or(0),
        output_tokens: field("completion_tokens").unwrap_or(0),
        cache_read_tokens: usage
            .get("prompt_tokens_details")
            .and_then(|d| d.get("cached_tokens"))
            .and_then(Value::as_u64)
            .map(|v| v as u32),
        cache_write_tokens: None,
        thinking_tokens: usage
            .get("completion_tokens_details")
            .and_then(|d| d.get("reasoning_tokens"))
            .and_then(Value::as_u64)
            .map(|v| v as u32),
        total_tokens: field("total_tokens"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assembler() -> (OpenAiAssembler, BufferBudget) {
        (OpenAiAssembler::new(), BufferBudget::new(1024 * 1024))
    }

    #[test]
    fn accumulates_content_deltas() {
        let (mut asm, mut budget) = assembler();
        asm.ingest(
            r#"{"choices":[{"delta":{"role":"assistant","content":"Hel"}}]}"#,
            &mut budget,
        );
        asm.ingest(r#"{"choices":[{"delta":{"content":"lo"}}]}"#, &mut budget);
        let body = asm.finish();
        assert_eq!(body.content, "Hello");
    }

    #[test]
    fn done_is_the_terminator() {
        let (mut asm, mut budget) = assembler();
        let deltas = asm.ingest("[DONE]", &mut budget);
        assert!(matches!(deltas.as_slice(), [FlowDelta::Terminator]));
    }

    #[test]
    fn routes_tool_fragments_by_index() {
        let (mut asm, mut budget) = assembler();
        asm.ingest(
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_1","type":"function","function":{"name":"get_weather","arguments":"{\"city\":"}}]}}]}"#,
            &mut budget,
        );
        asm.ingest(
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"\"Oslo\"}"}},{"index":1,"id":"call_2","function":{"name":"get_time","arguments":"{}"}}]}}]}"#,
            &mut budget,
        );
        let body = asm.finish();
        assert_eq!(body.tool_calls.len(), 2);
        assert_eq!(body.tool_calls[0].name, "get_weather");
        assert_eq!(body.tool_calls[0].arguments, r#"{"city":"Oslo"}"#);
        assert_eq!(
            body.tool_calls[0].parsed_arguments,
            Some(serde_json::json!({"city": "Oslo"}))
        );
        assert_eq!(body.tool_calls[1].name, "get_time");
    }

    #[test]
    fn final_usage_overwrites() {
        let (mut asm, mut budget) = assembler();
        asm.ingest(
            r#"{"choices":[],"usage":{"prompt_tokens":1,"completion_tokens":1,"total_tokens":2}}"#,
            &mut budget,
        );
        asm.ingest(
            r#"{"choices":[],"usage":{"prompt_tokens":12,"completion_tokens":34,"total_tokens":46}}"#,
            &mut budget,
        );
        let body = asm.finish();
        assert_eq!(body.usage.input_tokens, 12);
        assert_eq!(body.usage.output_tokens, 34);
        assert_eq!(body.usage.total_tokens, Some(46));
    }

    #[test]
    fn malformed_json_is_reported_not_fatal() {
        let (mut asm, mut budget) = assembler();
        let deltas = asm.ingest("{not json", &mut budget);
        assert!(matches!(deltas.as_slice(), [FlowDelta::Malformed]));
        asm.ingest(r#"{"choices":[{"delta":{"content":"ok"}}]}"#, &mut budget);
        assert_eq!(asm.finish().content, "ok");
    }

    #[test]
    fn records_finish_reason() {
        let (mut asm, mut budget) = assembler();
        asm.ingest(
            r#"{"choices":[{"delta":{},"finish_reason":"stop"}]}"#,
            &mut budget,
        );
        assert_eq!(asm.finish().stop_reason.as_deref(), Some("stop"));
    }
}
