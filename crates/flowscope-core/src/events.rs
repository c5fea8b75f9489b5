//! Lifecycle events broadcast on the bus
//!
//! Payloads are always snapshots or deltas, never live references; the
//! producing task keeps exclusive write access to the Flow itself.

use crate::error::FlowError;
use crate::flow::{Flow, FlowId, FlowState};
use crate::stats::FlowStats;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Compact projection of a Flow for lists and broadcast.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowSummary {
    pub id: FlowId,
    pub provider: String,
    pub model: String,
    pub state: FlowState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_tokens: Option<u32>,
    pub content_preview: String,
    pub has_error: bool,
    pub has_tool_calls: bool,
    pub has_thinking: bool,
    pub is_streaming: bool,
    pub starred: bool,
    pub created_at: DateTime<Utc>,
}

impl From<&Flow> for FlowSummary {
    fn from(flow: &Flow) -> Self {
        Self {
            id: flow.id.clone(),
            provider: flow.metadata.provider.clone(),
            model: flow.request.model.clone(),
            state: flow.state,
            duration_ms: flow.timestamps.duration_ms,
            input_tokens: flow.response.as_ref().map(|r| r.usage.input_tokens),
            output_tokens: flow.response.as_ref().map(|r| r.usage.output_tokens),
            content_preview: flow.content_preview(),
            has_error: flow.has_error(),
            has_tool_calls: flow.has_tool_calls(),
            has_thinking: flow.has_thinking(),
            is_streaming: flow.is_streaming(),
            starred: flow.annotations.starred,
            created_at: flow.timestamps.created,
        }
    }
}

/// Partial update carried by `FlowUpdated`. Every field is optional; absent
/// fields are unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlowUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<FlowState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_delta: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking_delta: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_count: Option<u32>,
}

/// Measurements carried by a threshold warning. At most one warning is
/// emitted per flow id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThresholdWarning {
    pub latency_exceeded: bool,
    pub total_tokens_exceeded: bool,
    pub input_tokens_exceeded: bool,
    pub output_tokens_exceeded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_tokens: Option<u32>,
}

impl ThresholdWarning {
    pub fn any(&self) -> bool {
        self.latency_exceeded
            || self.total_tokens_exceeded
            || self.input_tokens_exceeded
            || self.output_tokens_exceeded
    }
}

/// Event stream published to subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FlowEvent {
    FlowStarted {
        summary: FlowSummary,
    },
    FlowUpdated {
        id: FlowId,
        update: FlowUpdate,
    },
    FlowCompleted {
        id: FlowId,
        summary: FlowSummary,
    },
    FlowFailed {
        id: FlowId,
        error: FlowError,
    },
    ThresholdWarning {
        id: FlowId,
        warning: ThresholdWarning,
    },
    StatsUpdated {
        stats: Box<FlowStats>,
    },
}

impl FlowEvent {
    /// The flow this event concerns, if any.
    pub fn flow_id(&self) -> Option<&str> {
        match self {
            Self::FlowStarted { summary } => Some(&summary.id),
            Self::FlowUpdated { id, .. } => Some(id),
            Self::FlowCompleted { id, .. } => Some(id),
            Self::FlowFailed { id, .. } => Some(id),
            Self::ThresholdWarning { id, .. } => Some(id),
            Self::StatsUpdated { .. } => None,
        }
    }
}
