//! Export-time redaction
//!
//! At-rest Flows stay unredacted; the configured rules run only on the
//! copies handed to the exporter. Sensitive header names are masked here
//! as well.

use flowscope_core::config::{RedactionRule, RedactionTarget};
use flowscope_core::error::{Error, Result};
use flowscope_core::flow::{Flow, MessageContent, SENSITIVE_HEADERS};
use regex::Regex;
use serde_json::Value;

const MASK: &str = "***";

struct CompiledRule {
    name: String,
    regex: Regex,
    replacement: String,
    target: RedactionTarget,
}

pub struct Redactor {
    rules: Vec<CompiledRule>,
}

impl Redactor {
    pub fn new(rules: &[RedactionRule]) -> Result<Self> {
        let rules = rules
            .iter()
            .map(|rule| {
                Regex::new(&rule.pattern)
                    .map(|regex| CompiledRule {
                        name: rule.name.clone(),
                        regex,
                        replacement: rule.replacement.clone(),
                        target: rule.target,
                    })
                    .map_err(|e| Error::Config(format!("redaction rule '{}': {}", rule.name, e)))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { rules })
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Apply every matching rule in place, then mask sensitive headers.
    pub fn redact_flow(&self, flow: &mut Flow) {
        for rule in &self.rules {
            let applies = |target| rule.target == target || rule.target == RedactionTarget::All;

            if applies(RedactionTarget::RequestHeaders) {
                redact_headers(&mut flow.request.headers, rule);
            }
            if applies(RedactionTarget::RequestBody) {
                redact_value(&mut flow.request.body, rule);
                if let Some(system) = &mut flow.request.system {
                    redact_string(system, rule);
                }
                for message in &mut flow.request.messages {
                    if let MessageContent::Text(text) = &mut message.content {
                        redact_string(text, rule);
                    }
                }
            }
            if let Some(response) = &mut flow.response {
                if applies(RedactionTarget::ResponseHeaders) {
                    redact_headers(&mut response.headers, rule);
                }
                if applies(RedactionTarget::ResponseBody) {
                    redact_string(&mut response.content, rule);
                    if let Some(body) = &mut response.body {
                        redact_value(body, rule);
                    }
                    if let Some(thinking) = &mut response.thinking {
                        redact_string(&mut thinking.text, rule);
                    }
                }
            }
        }
        mask_sensitive_headers(flow);
    }
}

fn redact_string(text: &mut String, rule: &CompiledRule) {
    if rule.regex.is_match(text) {
        tracing::trace!(rule = %rule.name, "redaction rule matched");
        *text = rule
            .regex
            .replace_all(text, rule.replacement.as_str())
            .into_owned();
    }
}

fn redact_headers(headers: &mut [(String, String)], rule: &CompiledRule) {
    for (_, value) in headers.iter_mut() {
        redact_string(value, rule);
    }
}

/// Walk a JSON value and redact every string leaf.
fn redact_value(value: &mut Value, rule: &CompiledRule) {
    match value {
        Value::String(s) => {
            let mut text = std::mem::take(s);
            redact_string(&mut text, rule);
            *s = text;
        }
        Value::Array(items) => {
            for item in items {
                redact_value(item, rule);
            }
        }
        Value::Object(map) => {
            for (_, item) in map.iter_mut() {
                redact_value(item, rule);
            }
        }
        _ => {}
    }
}

/// Mask values of well-known credential headers on both sides.
pub fn mask_sensitive_headers(flow: &mut Flow) {
    let mask = |headers: &mut Vec<(String, String)>| {
        for (name, value) in headers.iter_mut() {
            if SENSITIVE_HEADERS
                .iter()
                .any(|sensitive| name.eq_ignore_ascii_case(sensitive))
            {
                *value = MASK.to_string();
            }
        }
    };
    mask(&mut flow.request.headers);
    if let Some(response) = &mut flow.response {
        mask(&mut response.headers);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use flowscope_core::flow::{
        FlowMetadata, FlowRequest, FlowResponse, Message, RequestParams,
    };

    fn flow() -> Flow {
        let mut flow = Flow::new(
            FlowRequest {
                method: "POST".to_string(),
                path: "/v1/messages".to_string(),
                headers: vec![
                    ("x-api-key".to_string(), "sk-secret-123".to_string()),
                    ("content-type".to_string(), "application/json".to_string()),
                ],
                body: serde_json::json!({"note": "my email is user@example.com"}),
                messages: vec![Message::text("user", "mail user@example.com please")],
                system: None,
                tools: None,
                model: "claude-sonnet-4".to_string(),
                original_model: None,
                params: RequestParams::default(),
                body_bytes: 64,
                created_at: Utc::now(),
            },
            FlowMetadata::for_provider("anthropic"),
        );
        let mut response = FlowResponse::head(200, "OK", vec![]);
        response.content = "sent to user@example.com".to_string();
        flow.response = Some(response);
        flow
    }

    fn email_rule(target: RedactionTarget) -> RedactionRule {
        RedactionRule {
            name: "email".to_string(),
            pattern: r"[\w.]+@[\w.]+".to_string(),
            replacement: "[email]".to_string(),
            target,
        }
    }

    #[test]
    fn all_target_hits_both_sides() {
        let redactor = Redactor::new(&[email_rule(RedactionTarget::All)]).unwrap();
        let mut flow = flow();
        redactor.redact_flow(&mut flow);
        assert_eq!(
            flow.request.body["note"],
            serde_json::json!("my email is [email]")
        );
        assert_eq!(flow.request.messages[0].content.text(), "mail [email] please");
        assert_eq!(flow.response.unwrap().content, "sent to [email]");
    }

    #[test]
    fn request_only_target_leaves_response_alone() {
        let redactor = Redactor::new(&[email_rule(RedactionTarget::RequestBody)]).unwrap();
        let mut flow = flow();
        redactor.redact_flow(&mut flow);
        assert_eq!(flow.response.unwrap().content, "sent to user@example.com");
    }

    #[test]
    fn sensitive_headers_always_masked() {
        let redactor = Redactor::new(&[]).unwrap();
        let mut flow = flow();
        redactor.redact_flow(&mut flow);
        assert_eq!(flow.request.headers[0].1, "***");
        assert_eq!(flow.request.headers[1].1, "application/json");
    }

    #[test]
    fn bad_pattern_is_a_config_error() {
        let result = Redactor::new(&[RedactionRule {
            name: "broken".to_string(),
            pattern: "[".to_string(),
            replacement: String::new(),
            target: RedactionTarget::All,
        }]);
        assert!(result.is_err());
    }
}
