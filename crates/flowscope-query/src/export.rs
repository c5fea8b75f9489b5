//! Flow export
//!
//! Serializes a set of Flows to JSON, JSONL, HAR 1.2 (with an `_llm`
//! extension block per entry), human-readable Markdown, or metadata-only
//! CSV. Redaction and header masking run on copies before emission; the
//! blob comes back as a string and the shell handles saving.

use crate::redaction::{mask_sensitive_headers, Redactor};
use flowscope_core::error::Result;
use flowscope_core::flow::Flow;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportFormat {
    Json,
    Jsonl,
    Har,
    Markdown,
    Csv,
}

impl ExportFormat {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "json" => Some(Self::Json),
            "jsonl" => Some(Self::Jsonl),
            "har" => Some(Self::Har),
            "markdown" | "md" => Some(Self::Markdown),
            "csv" => Some(Self::Csv),
            _ => None,
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Jsonl => "jsonl",
            Self::Har => "har",
            Self::Markdown => "md",
            Self::Csv => "csv",
        }
    }
}

/// Serialize the flows, applying redaction copies first.
pub fn export_flows(
    flows: &[Flow],
    format: ExportFormat,
    redactor: Option<&Redactor>,
) -> Result<String> {
    let mut prepared: Vec<Flow> = flows.to_vec();
    for flow in &mut prepared {
        match redactor {
            Some(redactor) => redactor.redact_flow(flow),
            None => mask_sensitive_headers(flow),
        }
    }

    match format {
        ExportFormat::Json => Ok(serde_json::to_string_pretty(&prepared)?),
        ExportFormat::Jsonl => {
            let mut out = String::new();
            for flow in &prepared {
                out.push_str(&serde_json::to_string(flow)?);
                out.push('\n');
            }
            Ok(out)
        }
        ExportFormat::Har => Ok(serde_json::to_string_pretty(&har_log(&prepared))?),
        ExportFormat::Markdown => Ok(markdown(&prepared)),
        ExportFormat::Csv => Ok(csv(&prepared)),
    }
}

fn har_log(flows: &[Flow]) -> Value {
    let entries: Vec<Value> = flows.iter().map(har_entry).collect();
    json!({
        "log": {
            "version": "1.2",
            "creator": {
                "name": "flowscope",
                "version": env!("CARGO_PKG_VERSION"),
            },
            "entries": entries,
        }
    })
}

fn har_headers(headers: &[(String, String)]) -> Vec<Value> {
    headers
        .iter()
        .map(|(name, value)| json!({"name": name, "value": value}))
        .collect()
}

fn har_entry(flow: &Flow) -> Value {
    let duration = flow.timestamps.duration_ms.unwrap_or(0);
    let ttfb = flow.timestamps.ttfb_ms.unwrap_or(0).min(duration);
    let usage = flow.response.as_ref().map(|r| r.usage).unwrap_or_default();

    let response = match &flow.response {
        Some(response) => json!({
            "status": response.status,
            "statusText": response.status_text,
            "httpVersion": "HTTP/1.1",
            "headers": har_headers(&response.headers),
            "cookies": [],
            "content": {
                "size": response.body_bytes,
                "mimeType": "application/json",
                "text": response.content,
            },
            "redirectURL": "",
            "headersSize": -1,
            "bodySize": response.body_bytes,
        }),
        None => json!({
            "status": 0,
            "statusText": "",
            "httpVersion": "HTTP/1.1",
            "headers": [],
            "cookies": [],
            "content": {"size": 0, "mimeType": "", "text": ""},
            "redirectURL": "",
            "headersSize": -1,
            "bodySize": -1,
        }),
    };

    json!({
        "startedDateTime": flow.timestamps.created.to_rfc3339(),
        "time": duration,
        "request": {
            "method": flow.request.method,
            "url": flow.request.path,
            "httpVersion": "HTTP/1.1",
            "headers": har_headers(&flow.request.headers),
            "cookies": [],
            "queryString": [],
            "postData": {
                "mimeType": "application/json",
                "text": flow.request.body.to_string(),
            },
            "headersSize": -1,
            "bodySize": flow.request.body_bytes,
        },
        "response": response,
        "cache": {},
        "timings": {
            "send": 0,
            "wait": ttfb,
            "receive": duration.saturating_sub(ttfb),
        },
        "_llm": {
            "provider": flow.metadata.provider,
            "model": flow.request.model,
            "input_tokens": usage.input_tokens,
            "output_tokens": usage.output_tokens,
            "total_tokens": usage.total(),
            "has_tool_calls": flow.has_tool_calls(),
            "has_thinking": flow.has_thinking(),
        },
    })
}

fn markdown(flows: &[Flow]) -> String {
    let mut out = String::from("# Flow Export\n");
    for flow in flows {
        out.push_str(&format!("\n## Flow {}\n\n", flow.id));
        out.push_str("| Field | Value |\n|---|---|\n");
        out.push_str(&format!("| Provider | {} |\n", flow.metadata.provider));
        out.push_str(&format!("| Model | {} |\n", flow.request.model));
        out.push_str(&format!("| State | {} |\n", flow.state.as_str()));
        out.push_str(&format!(
            "| Created | {} |\n",
            flow.timestamps.created.to_rfc3339()
        ));
        if let Some(duration) = flow.timestamps.duration_ms {
            out.push_str(&format!("| Duration | {duration} ms |\n"));
        }
        if let Some(error) = &flow.error {
            out.push_str(&format!(
                "| Error | {}: {} |\n",
                error.kind.as_str(),
                error.message
            ));
        }

        if let Some(system) = &flow.request.system {
            out.push_str(&format!("\n### System Prompt\n\n{system}\n"));
        }

        if !flow.request.messages.is_empty() {
            out.push_str("\n### Messages\n");
            for message in &flow.request.messages {
                out.push_str(&format!(
                    "\n**{}**: {}\n",
                    message.role,
                    message.content.text()
                ));
            }
        }

        if let Some(response) = &flow.response {
            if !response.content.is_empty() {
                out.push_str(&format!("\n### Response\n\n{}\n", response.content));
            }
            if let Some(thinking) = &response.thinking {
                out.push_str(&format!(
                    "\n<details><summary>Thinking</summary>\n\n{}\n\n</details>\n",
                    thinking.text
                ));
            }
            if !response.tool_calls.is_empty() {
                out.push_str("\n### Tool Calls\n\n");
                for call in &response.tool_calls {
                    out.push_str(&format!("- `{}` — `{}`\n", call.name, call.arguments));
                }
            }
            out.push_str(&format!(
                "\n### Usage\n\n{} input / {} output / {} total\n",
                response.usage.input_tokens,
                response.usage.output_tokens,
                response.usage.total()
            ));
        }
    }
    out
}

const CSV_HEADER: &str = "id,created_at,provider,model,state,duration_ms,input_tokens,output_tokens,total_tokens,has_error,has_tool_calls,has_thinking,is_streaming,starred,tags";

fn csv(flows: &[Flow]) -> String {
    let mut out = String::from(CSV_HEADER);
    out.push('\n');
    for flow in flows {
        let usage = flow.response.as_ref().map(|r| r.usage).unwrap_or_default();
        let tags: Vec<&str> = flow.annotations.tags.iter().map(String::as_str).collect();
        let row = [
            csv_field(&flow.id),
            csv_field(&flow.timestamps.created.to_rfc3339()),
            csv_field(&flow.metadata.provider),
            csv_field(&flow.request.model),
            csv_field(flow.state.as_str()),
            flow.timestamps
                .duration_ms
                .map(|d| d.to_string())
                .unwrap_or_default(),
            usage.input_tokens.to_string(),
            usage.output_tokens.to_string(),
            usage.total().to_string(),
            flow.has_error().to_string(),
            flow.has_tool_calls().to_string(),
            flow.has_thinking().to_string(),
            flow.is_streaming().to_string(),
            flow.annotations.starred.to_string(),
            csv_field(&tags.join(";")),
        ];
        out.push_str(&row.join(","));
        out.push('\n');
    }
    out
}

fn csv_field(value: &str) -> String {
    if value.contains(',') || value.contains('"') || value.contains('\n') {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use flowscope_core::flow::{
        FlowMetadata, FlowRequest, FlowResponse, FlowState, Message, RequestParams, Thinking,
        TokenUsage, ToolCall,
    };

    fn flow() -> Flow {
        let mut flow = Flow::new(
            FlowRequest {
                method: "POST".to_string(),
                path: "/v1/messages".to_string(),
                headers: vec![("authorization".to_string(), "Bearer sk-live".to_string())],
                body: serde_json::json!({"model": "claude-sonnet-4"}),
                messages: vec![Message::text("user", "ask me, anything")],
                system: Some("be terse".to_string()),
                tools: None,
                model: "claude-sonnet-4".to_string(),
                original_model: None,
                params: RequestParams::default(),
                body_bytes: 48,
                created_at: Utc::now(),
            },
            FlowMetadata::for_provider("anthropic"),
        );
        let mut response = FlowResponse::head(200, "OK", vec![]);
        response.content = "forty-two".to_string();
        response.thinking = Some(Thinking {
            text: "considering".to_string(),
            token_count: Some(3),
            signature: None,
        });
        response.tool_calls = vec![ToolCall {
            id: "toolu_1".to_string(),
            call_type: "tool_use".to_string(),
            name: "calc".to_string(),
            arguments: "{\"x\":1}".to_string(),
            parsed_arguments: None,
        }];
        response.usage = TokenUsage {
            input_tokens: 10,
            output_tokens: 20,
            total_tokens: Some(30),
            ..Default::default()
        };
        response.body_bytes = 96;
        flow.response = Some(response);
        flow.transition(FlowState::Completed).unwrap();
        flow.seal_timestamps();
        flow
    }

    #[test]
    fn json_export_reimports() {
        let flows = vec![flow(), flow()];
        let blob = export_flows(&flows, ExportFormat::Json, None).unwrap();
        let back: Vec<Flow> = serde_json::from_str(&blob).unwrap();
        assert_eq!(back.len(), 2);
        assert_eq!(back[0].id, flows[0].id);
        assert_eq!(back[0].state, FlowState::Completed);
    }

    #[test]
    fn jsonl_is_one_flow_per_line() {
        let flows = vec![flow(), flow(), flow()];
        let blob = export_flows(&flows, ExportFormat::Jsonl, None).unwrap();
        let lines: Vec<&str> = blob.lines().collect();
        assert_eq!(lines.len(), 3);
        for line in lines {
            serde_json::from_str::<Flow>(line).unwrap();
        }
    }

    #[test]
    fn har_is_well_formed_with_llm_extension() {
        let flows = vec![flow()];
        let blob = export_flows(&flows, ExportFormat::Har, None).unwrap();
        let har: serde_json::Value = serde_json::from_str(&blob).unwrap();
        assert_eq!(har["log"]["version"], "1.2");
        let entry = &har["log"]["entries"][0];
        assert_eq!(entry["request"]["method"], "POST");
        assert_eq!(entry["response"]["status"], 200);
        let llm = &entry["_llm"];
        assert_eq!(llm["provider"], "anthropic");
        assert_eq!(llm["total_tokens"], 30);
        assert_eq!(llm["has_tool_calls"], true);
        assert_eq!(llm["has_thinking"], true);
    }

    #[test]
    fn sensitive_headers_masked_in_every_format() {
        let flows = vec![flow()];
        for format in [ExportFormat::Json, ExportFormat::Jsonl, ExportFormat::Har] {
            let blob = export_flows(&flows, format, None).unwrap();
            assert!(!blob.contains("sk-live"), "{format:?} leaked a credential");
        }
    }

    #[test]
    fn markdown_has_sections() {
        let flows = vec![flow()];
        let blob = export_flows(&flows, ExportFormat::Markdown, None).unwrap();
        assert!(blob.contains(&format!("## Flow {}", flows[0].id)));
        assert!(blob.contains("### System Prompt"));
        assert!(blob.contains("### Response"));
        assert!(blob.contains("<details><summary>Thinking</summary>"));
        assert!(blob.contains("### Tool Calls"));
        assert!(blob.contains("10 input / 20 output / 30 total"));
    }

    #[test]
    fn csv_is_metadata_only_with_quoting() {
        let mut noisy = flow();
        noisy.annotations.tags.insert("a,b".to_string());
        let blob = export_flows(&[noisy], ExportFormat::Csv, None).unwrap();
        let lines: Vec<&str> = blob.lines().collect();
        assert_eq!(lines[0], CSV_HEADER);
        assert_eq!(lines.len(), 2);
        assert!(lines[1].contains("\"a,b\""));
        assert!(!blob.contains("forty-two"), "CSV must not carry content");
    }

    #[test]
    fn format_parsing() {
        assert_eq!(ExportFormat::parse("HAR"), Some(ExportFormat::Har));
        assert_eq!(ExportFormat::parse("md"), Some(ExportFormat::Markdown));
        assert_eq!(ExportFormat::parse("xml"), None);
    }
}
