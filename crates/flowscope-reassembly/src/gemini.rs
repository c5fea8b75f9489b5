//! Gemini generate-content stream assembly
//!
//! Every event is a full JSON object with `candidates[].content.parts`.
//! Function-call arguments arrive as complete objects, so there is no
//! fragment concatenation here. The stream has no in-band terminator; close
//! plus a recorded `finishReason` counts as clean termination.

use crate::budget::BufferBudget;
use crate::delta::FlowDelta;
use flowscope_core::flow::{TokenUsage, ToolCall};
use serde_json::Value;

#[derive(Debug, Default)]
pub(crate) struct GeminiAssembler {
    content: String,
    thinking: String,
    tool_calls: Vec<ToolCall>,
    usage: TokenUsage,
    stop_reason: Option<String>,
    model: Option<String>,
    tool_call_seq: u32,
}

impl GeminiAssembler {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn ingest(&mut self, data: &str, budget: &mut BufferBudget) -> Vec<FlowDelta> {
        let payload: Value = match serde_json::from_str(data) {
            Ok(value) => value,
            Err(_) => return vec![FlowDelta::Malformed],
        };

        let mut deltas = Vec::new();

        if self.model.is_none()
            && let Some(version) = payload.get("modelVersion").and_then(Value::as_str)
        {
            self.model = Some(version.to_string());
        }

        if let Some(candidates) = payload.get("candidates").and_then(Value::as_array) {
            for candidate in candidates {
                if let Some(parts) = candidate
                    .get("content")
                    .and_then(|c| c.get("parts"))
                    .and_then(Value::as_array)
                {
                    for part in parts {
                        self.ingest_part(part, budget, &mut deltas);
                    }
                }
                if let Some(reason) = candidate.get("finishReason").and_then(Value::as_str) {
                    self.stop_reason = Some(reason.to_string());
                    deltas.push(FlowDelta::StopReason(reason.to_string()));
                }
            }
        }

        if let Some(usage) = payload.get("usageMetadata") {
            self.usage = parse_usage(usage);
        }

        deltas
    }

    fn ingest_part(
        &mut self,
        part: &Value,
        budget: &mut BufferBudget,
        deltas: &mut Vec<FlowDelta>,
    ) {
        if let Some(call) = part.get("functionCall") {
            let name = call
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let args = call.get("args").cloned().unwrap_or(Value::Null);
            self.tool_call_seq += 1;
            self.tool_calls.push(ToolCall {
                id: format!("call-{}", self.tool_call_seq),
                call_type: "function".to_string(),
                name: name.clone(),
                arguments: args.to_string(),
                parsed_arguments: Some(args),
            });
            deltas.push(FlowDelta::ToolCallStarted { name });
            return;
        }

        let Some(text) = part.get("text").and_then(Value::as_str) else {
            return;
        };
        if part.get("thought").and_then(Value::as_bool).unwrap_or(false) {
            budget.append(&mut self.thinking, text);
            deltas.push(FlowDelta::Thinking(text.to_string()));
        } else {
            budget.append(&mut self.content, text);
            deltas.push(FlowDelta::Content(text.to_string()));
        }
    }

    pub(crate) fn finish(self) -> super::AssembledBody {
        super::AssembledBody {
            content: self.content,
            thinking_text: self.thinking,
            thinking_signature: None,
            tool_calls: self.tool_calls,
            usage: self.usage,
            stop_reason: self.stop_reason,
            model: self.model,
            message_id: None,
        }
    }
}

fn parse_usage(usage: &Value) -> TokenUsage {
    let field = |name: &str| usage.get(name).and_then(Value::as_u64).map(|v| v as u32);
    TokenUsage {
        input_tokens: field("promptTokenCount").unwrap_or(0),
        output_tokens: field("candidatesTokenCount").unwrap_or(0),
        cache_read_tokens: field("cachedContentTokenCount"),
        cache_write_tokens: None,
        thinking_tokens: field("thoughtsTokenCount"),
        total_tokens: field("totalTokenCount"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assembler() -> (GeminiAssembler, BufferBudget) {
        (GeminiAssembler::new(), BufferBudget::new(1024 * 1024))
    }

    #[test]
    fn text_and_thought_parts_split() {
        let (mut asm, mut budget) = assembler();
        asm.ingest(
            r#"{"candidates":[{"content":{"parts":[{"text":"planning","thought":true},{"text":"Hello "}]}}]}"#,
            &mut budget,
        );
        asm.ingest(
            r#"{"candidates":[{"content":{"parts":[{"text":"world"}]},"finishReason":"STOP"}],"usageMetadata":{"promptTokenCount":5,"candidatesTokenCount":7,"totalTokenCount":12}}"#,
            &mut budget,
        );

        let body = asm.finish();
        assert_eq!(body.content, "Hello world");
        assert_eq!(body.thinking_text, "planning");
        assert_eq!(body.stop_reason.as_deref(), Some("STOP"));
        assert_eq!(body.usage.total_tokens, Some(12));
    }

    #[test]
    fn function_calls_arrive_complete() {
        let (mut asm, mut budget) = assembler();
        let deltas = asm.ingest(
            r#"{"candidates":[{"content":{"parts":[{"functionCall":{"name":"lookup","args":{"q":"rust"}}}]}}]}"#,
            &mut budget,
        );
        assert!(
            matches!(deltas.as_slice(), [FlowDelta::ToolCallStarted { name }] if name == "lookup")
        );

        let body = asm.finish();
        assert_eq!(body.tool_calls.len(), 1);
        assert_eq!(
            body.tool_calls[0].parsed_arguments,
            Some(serde_json::json!({"q": "rust"}))
        );
    }

    #[test]
    fn malformed_event_is_skipped() {
        let (mut asm, mut budget) = assembler();
        let deltas = asm.ingest("<html>", &mut budget);
        assert!(matches!(deltas.as_slice(), [FlowDelta::Malformed]));
    }
}
