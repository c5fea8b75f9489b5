//! Replay handler seam
//!
//! The core captures traffic; it does not own an upstream client. Shells
//! that can re-send a request implement this trait and hand it in at
//! construction. Without one, the replay verbs fail with a structured
//! `unsupported` error.

use async_trait::async_trait;
use flowscope_core::flow::Flow;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplayConfig {
    /// Override the model before re-sending.
    pub model_override: Option<String>,
    /// Override the provider before re-sending.
    pub provider_override: Option<String>,
    /// Send with `stream: false` regardless of the original request.
    pub force_unary: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayResult {
    pub source_flow_id: String,
    /// Flow id of the replayed exchange, when the handler captured one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_flow_id: Option<String>,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchReplayResult {
    pub total: usize,
    pub success: usize,
    pub failed: usize,
    pub results: Vec<ReplayResult>,
}

/// Implemented by the shell; the core never talks to providers itself.
#[async_trait]
pub trait ReplayHandler: Send + Sync {
    async fn replay(&self, flow: &Flow, config: &ReplayConfig) -> ReplayResult;
}
