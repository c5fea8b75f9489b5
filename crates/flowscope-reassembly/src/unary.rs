//! Unary (non-streaming) body extraction
//!
//! Non-streaming responses arrive as one JSON document. The same canonical
//! fields are pulled out per dialect so unary and streamed Flows look alike
//! downstream.

use crate::AssembledBody;
use flowscope_core::flow::{TokenUsage, ToolCall};
use serde_json::Value;

pub(crate) fn parse_unary(dialect: crate::Dialect, body: &Value) -> AssembledBody {
    match dialect {
        crate::Dialect::OpenAi => parse_openai(body),
        crate::Dialect::Anthropic => parse_anthropic(body),
        crate::Dialect::Gemini => parse_gemini(body),
        crate::Dialect::Unknown => AssembledBody::default(),
    }
}

fn parse_openai(body: &Value) -> AssembledBody {
    let mut out = AssembledBody {
        message_id: str_field(body, "id"),
        model: str_field(body, "model"),
        ..Default::default()
    };

    if let Some(choice) = body
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|choices| choices.first())
    {
        if let Some(message) = choice.get("message") {
            if let Some(content) = message.get("content").and_then(Value::as_str) {
                out.content = content.to_string();
            }
            if let Some(tool_calls) = message.get("tool_calls").and_then(Value::as_array) {
                for call in tool_calls {
                    let arguments = call
                        .get("function")
                        .and_then(|f| f.get("arguments"))
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string();
                    out.tool_calls.push(ToolCall {
                        id: str_field(call, "id").unwrap_or_default(),
                        call_type: str_field(call, "type").unwrap_or_else(|| "function".to_string()),
                        name: call
                            .get("function")
                            .and_then(|f| f.get("name"))
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string(),
                        parsed_arguments: serde_json::from_str(&arguments).ok(),
                        arguments,
                    });
                }
            }
        }
        out.stop_reason = str_field(choice, "finish_reason");
    }

    if let Some(usage) = body.get("usage") {
        out.usage = openai_usage(usage);
    }
    out
}

fn parse_anthropic(body: &Value) -> AssembledBody {
    let mut out = AssembledBody {
        message_id: str_field(body, "id"),
        model: str_field(body, "model"),
        stop_reason: str_field(body, "stop_reason"),
        ..Default::default()
    };

    if let Some(blocks) = body.get("content").and_then(Value::as_array) {
        for block in blocks {
            match block.get("type").and_then(Value::as_str) {
                Some("text") => {
                    if let Some(text) = block.get("text").and_then(Value::as_str) {
                        out.content.push_str(text);
                    }
                }
                Some("thinking") => {
                    if let Some(text) = block.get("thinking").and_then(Value::as_str) {
                        out.thinking_text.push_str(text);
                    }
                    if let Some(signature) = block.get("signature").and_then(Value::as_str) {
                        out.thinking_signature = Some(signature.to_string());
                    }
                }
                Some("tool_use") => {
                    let input = block.get("input").cloned().unwrap_or(Value::Null);
                    out.tool_calls.push(ToolCall {
                        id: str_field(block, "id").unwrap_or_default(),
                        call_type: "tool_use".to_string(),
                        name: str_field(block, "name").unwrap_or_default(),
                        arguments: input.to_string(),
                        parsed_arguments: Some(input),
                    });
                }
                _ => {}
            }
        }
    }

    if let Some(usage) = body.get("usage") {
        let field = |name: &str| usage.get(name).and_then(Value::as_u64).map(|v| v as u32);
        out.usage = TokenUsage {
            input_tokens: field("input_tokens").unwrap_or(0),
            output_tokens: field("output_tokens").unwrap_or(0),
            cache_read_tokens: field("cache_read_input_tokens"),
            cache_write_tokens: field("cache_creation_input_tokens"),
            thinking_tokens: None,
            total_tokens: None,
        };
    }
    out
}

fn parse_gemini(body: &Value) -> AssembledBody {
    let mut out = AssembledBody {
        model: str_field(body, "modelVersion"),
        ..Default::default()
    };
    let mut call_seq = 0u32;

    if let Some(candidate) = body
        .get("candidates")
        .and_then(Value::as_array)
        .and_then(|candidates| candidates.first())
    {
        if let Some(parts) = candidate
            .get("content")
            .and_then(|c| c.get("parts"))
            .and_then(Value::as_array)
        {
            for part in parts {
                if let Some(call) = part.get("functionCall") {
                    let args = call.get("args").cloned().unwrap_or(Value::Null);
                    call_seq += 1;
                    out.tool_calls.push(ToolCall {
                        id: format!("call-{call_seq}"),
                        call_type: "function".to_string(),
                        name: str_field(call, "name").unwrap_or_default(),
                        arguments: args.to_string(),
                        parsed_arguments: Some(args),
                    });
                } else if let Some(text) = part.get("text").and_then(Value::as_str) {
                    if part.get("thought").and_then(Value::as_bool).unwrap_or(false) {
                        out.thinking_text.push_str(text);
                    } else {
                        out.content.push_str(text);
                    }
                }
            }
        }
        out.stop_reason = str_field(candidate, "finishReason");
    }

    if let Some(usage) = body.get("usageMetadata") {
        let field = |name: &str| usage.get(name).and_then(Value::as_u64).map(|v| v as u32);
        out.usage = TokenUsage {
            input_tokens: field("promptTokenCount").unwrap_or(0),
            output_tokens: field("candidatesTokenCount").unwrap_or(0),
            cache_read_tokens: field("cachedContentTokenCount"),
            cache_write_tokens: None,
            thinking_tokens: field("thoughtsTokenCount"),
            total_tokens: field("totalTokenCount"),
        };
    }
    out
}

fn openai_usage(usage: &Value) -> TokenUsage {
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

fn str_field(value: &Value, name: &str) -> Option<String> {
    value.get(name).and_then(Value::as_str).map(str::to_string)
}
