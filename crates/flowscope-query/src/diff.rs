//! Structural Flow diff
//!
//! Compares two Flows section by section, producing path-keyed items the
//! UI renders side by side. Timestamps, ids, and arbitrary field paths can
//! be ignored through the config.

use flowscope_core::flow::{Flow, TokenUsage};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DiffConfig {
    pub ignore_timestamps: bool,
    pub ignore_ids: bool,
    pub ignored_paths: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiffKind {
    Added,
    Removed,
    Modified,
    Unchanged,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiffItem {
    pub path: String,
    pub kind: DiffKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub left_value: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub right_value: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenDiff {
    pub left: TokenUsage,
    pub right: TokenUsage,
    pub input_delta: i64,
    pub output_delta: i64,
    pub total_delta: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowDiffResult {
    pub left_id: String,
    pub right_id: String,
    pub request_diffs: Vec<DiffItem>,
    pub response_diffs: Vec<DiffItem>,
    pub metadata_diffs: Vec<DiffItem>,
    pub message_diffs: Vec<Vec<DiffItem>>,
    pub token_diff: TokenDiff,
}

impl FlowDiffResult {
    pub fn is_identical(&self) -> bool {
        let unchanged = |items: &[DiffItem]| items.iter().all(|i| i.kind == DiffKind::Unchanged);
        unchanged(&self.request_diffs)
            && unchanged(&self.response_diffs)
            && unchanged(&self.metadata_diffs)
            && self.message_diffs.iter().all(|m| unchanged(m))
    }
}

pub fn diff_flows(left: &Flow, right: &Flow, config: &DiffConfig) -> FlowDiffResult {
    let left_request = section_value(&left.request);
    let right_request = section_value(&right.request);
    let left_response = left.response.as_ref().map(section_value).unwrap_or(Value::Null);
    let right_response = right.response.as_ref().map(section_value).unwrap_or(Value::Null);
    let left_metadata = section_value(&left.metadata);
    let right_metadata = section_value(&right.metadata);

    let mut result = FlowDiffResult {
        left_id: left.id.clone(),
        right_id: right.id.clone(),
        request_diffs: Vec::new(),
        response_diffs: Vec::new(),
        metadata_diffs: Vec::new(),
        message_diffs: Vec::new(),
        token_diff: token_diff(left, right),
    };

    diff_value("request", &left_request, &right_request, config, &mut result.request_diffs);
    diff_value("response", &left_response, &right_response, config, &mut result.response_diffs);
    diff_value("metadata", &left_metadata, &right_metadata, config, &mut result.metadata_diffs);

    let pairs = left.request.messages.len().max(right.request.messages.len());
    for index in 0..pairs {
        let left_message = left
            .request
            .messages
            .get(index)
            .map(section_value)
            .unwrap_or(Value::Null);
        let right_message = right
            .request
            .messages
            .get(index)
            .map(section_value)
            .unwrap_or(Value::Null);
        let mut items = Vec::new();
        diff_value(
            &format!("messages[{index}]"),
            &left_message,
            &right_message,
            config,
            &mut items,
        );
        result.message_diffs.push(items);
    }

    result
}

fn token_diff(left: &Flow, right: &Flow) -> TokenDiff {
    let usage = |flow: &Flow| {
        flow.response
            .as_ref()
            .map(|r| r.usage)
            .unwrap_or_default()
    };
    let (l, r) = (usage(left), usage(right));
    TokenDiff {
        left: l,
        right: r,
        input_delta: r.input_tokens as i64 - l.input_tokens as i64,
        output_delta: r.output_tokens as i64 - l.output_tokens as i64,
        total_delta: r.total() as i64 - l.total() as i64,
    }
}

fn section_value<T: Serialize>(section: &T) -> Value {
    serde_json::to_value(section).unwrap_or(Value::Null)
}

fn is_ignored(path: &str, config: &DiffConfig) -> bool {
    let leaf = path.rsplit('.').next().unwrap_or(path);
    if config.ignore_timestamps
        && matches!(
            leaf,
            "created_at" | "started_at" | "ended_at" | "timestamp"
        )
    {
        return true;
    }
    if config.ignore_ids && (leaf == "id" || leaf.ends_with("_id")) {
        return true;
    }
    config.ignored_paths.iter().any(|ignored| path == ignored)
}

fn diff_value(
    path: &str,
    left: &Value,
    right: &Value,
    config: &DiffConfig,
    out: &mut Vec<DiffItem>,
) {
    if is_ignored(path, config) {
        return;
    }
    match (left, right) {
        (Value::Null, Value::Null) => {}
        (Value::Null, right) => out.push(DiffItem {
            path: path.to_string(),
            kind: DiffKind::Added,
            left_value: None,
            right_value: Some(right.clone()),
        }),
        (left, Value::Null) => out.push(DiffItem {
            path: path.to_string(),
            kind: DiffKind::Removed,
            left_value: Some(left.clone()),
            right_value: None,
        }),
        (Value::Object(left_map), Value::Object(right_map)) => {
            let mut keys: Vec<&String> = left_map.keys().chain(right_map.keys()).collect();
            keys.sort();
            keys.dedup();
            for key in keys {
                let child = format!("{path}.{key}");
                diff_value(
                    &child,
                    left_map.get(key).unwrap_or(&Value::Null),
                    right_map.get(key).unwrap_or(&Value::Null),
                    config,
                    out,
                );
            }
        }
        (left, right) if left == right => out.push(DiffItem {
            path: path.to_string(),
            kind: DiffKind::Unchanged,
            left_value: Some(left.clone()),
            right_value: Some(right.clone()),
        }),
        (left, right) => out.push(DiffItem {
            path: path.to_string(),
            kind: DiffKind::Modified,
            left_value: Some(left.clone()),
            right_value: Some(right.clone()),
        }),
    }
}
