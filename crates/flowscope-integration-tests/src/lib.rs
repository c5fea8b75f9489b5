//! Shared fixtures for flowscope integration tests
//!
//! Builders for requests and recorded chunk traces in each wire dialect,
//! so the scenario tests stay declarative.

use chrono::Utc;
use flowscope_core::flow::{FlowMetadata, FlowRequest, Message, RequestParams};

pub fn chat_request(model: &str, streaming: bool, prompt: &str) -> FlowRequest {
    FlowRequest {
        method: "POST".to_string(),
        path: "/v1/chat/completions".to_string(),
        headers: vec![
            ("content-type".to_string(), "application/json".to_string()),
            ("authorization".to_string(), "Bearer sk-test".to_string()),
        ],
        body: serde_json::json!({"model": model, "stream": streaming}),
        messages: vec![Message::text("user", prompt)],
        system: None,
        tools: None,
        model: model.to_string(),
        original_model: None,
        params: RequestParams {
            stream: streaming,
            ..Default::default()
        },
        body_bytes: 64,
        created_at: Utc::now(),
    }
}

pub fn metadata(provider: &str) -> FlowMetadata {
    FlowMetadata::for_provider(provider)
}

/// A recorded OpenAI SSE trace: five events, the fourth carries the final
/// usage, the fifth terminates.
pub fn openai_trace() -> Vec<Vec<u8>> {
    vec![
        b"data: {\"id\":\"cmpl-1\",\"model\":\"gpt-4o\",\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\n".to_vec(),
        b"data: {\"choices\":[{\"delta\":{\"content\":\"Well, \"}}]}\n\n".to_vec(),
        b"data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n".to_vec(),
        b"data: {\"choices\":[{\"delta\":{\"content\":\"Hello\"}}],\"usage\":{\"prompt_tokens\":9,\"completion_tokens\":4,\"total_tokens\":13}}\n\n".to_vec(),
        b"data: [DONE]\n\n".to_vec(),
    ]
}

/// The Anthropic tool-use trace: arguments arrive as JSON fragments and
/// concatenate to `{"x":1}`.
pub fn anthropic_tool_use_trace() -> Vec<Vec<u8>> {
    let mut events: Vec<Vec<u8>> = Vec::new();
    let mut push = |name: &str, data: &str| {
        events.push(format!("event: {name}\ndata: {data}\n\n").into_bytes());
    };
    push(
        "message_start",
        r#"{"message":{"id":"msg_1","model":"claude-sonnet-4","role":"assistant","usage":{"input_tokens":20,"output_tokens":1}}}"#,
    );
    push(
        "content_block_start",
        r#"{"index":0,"content_block":{"type":"tool_use","id":"toolu_1","name":"compute"}}"#,
    );
    push(
        "content_block_delta",
        r#"{"index":0,"delta":{"type":"input_json_delta","partial_json":"{"}}"#,
    );
    push(
        "content_block_delta",
        r#"{"index":0,"delta":{"type":"input_json_delta","partial_json":"\"x\":"}}"#,
    );
    push(
        "content_block_delta",
        r#"{"index":0,"delta":{"type":"input_json_delta","partial_json":"1}"}}"#,
    );
    push("content_block_stop", r#"{"index":0}"#);
    push("message_stop", "{}");
    events
}
