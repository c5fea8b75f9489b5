//! Flow capture
//!
//! The four hooks the proxy calls around its request/response boundary.
//! Hooks mutate the memory store and publish on the bus; they never await
//! disk. Each flow id has exactly one producing task, so per-flow state
//! (the reassembler) needs no lock beyond the map entry.

mod finalizer;
mod stats_tracker;
pub mod threshold;

use chrono::Utc;
use dashmap::DashMap;
use flowscope_bus::EventBus;
use flowscope_core::config::CoreConfig;
use flowscope_core::error::ErrorKind;
use flowscope_core::events::{FlowEvent, FlowSummary, FlowUpdate};
use flowscope_core::flow::{
    Flow, FlowId, FlowMetadata, FlowRequest, FlowResponse, FlowState, MessageContent,
};
use flowscope_reassembly::{BufferBudget, Dialect, FlowDelta, Reassembler, ReassemblyConfig};
use flowscope_store::{FileStore, MemoryStore};
use std::sync::Arc;
use threshold::ThresholdMonitor;

/// How the upstream exchange ended, reported by the proxy.
#[derive(Debug, Clone)]
pub enum UpstreamOutcome {
    Ok,
    Error {
        kind: ErrorKind,
        message: String,
        status_code: Option<u16>,
        raw_body: Option<String>,
    },
    Cancelled,
}

impl UpstreamOutcome {
    /// Classify an upstream error status into an outcome.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        Self::Error {
            kind: ErrorKind::from_status(status),
            message: message.into(),
            status_code: Some(status),
            raw_body: None,
        }
    }
}

pub struct CaptureService {
    memory: Arc<MemoryStore>,
    bus: EventBus,
    files: FileStore,
    config: CoreConfig,
    reassemblers: DashMap<FlowId, Reassembler>,
    threshold: ThresholdMonitor,
    stats: stats_tracker::StatsTracker,
}

impl CaptureService {
    pub fn new(
        memory: Arc<MemoryStore>,
        bus: EventBus,
        files: FileStore,
        config: CoreConfig,
    ) -> Arc<Self> {
        let threshold = ThresholdMonitor::new(config.thresholds);
        Arc::new(Self {
            memory,
            bus,
            files,
            config,
            reassemblers: DashMap::new(),
            threshold,
            stats: stats_tracker::StatsTracker::new(),
        })
    }

    pub(crate) fn memory(&self) -> &MemoryStore {
        &self.memory
    }

    pub(crate) fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub(crate) fn files(&self) -> &FileStore {
        &self.files
    }

    pub(crate) fn threshold(&self) -> &ThresholdMonitor {
        &self.threshold
    }

    pub(crate) fn take_reassembler(&self, flow_id: &str) -> Option<Reassembler> {
        self.reassemblers.remove(flow_id).map(|(_, r)| r)
    }

    pub(crate) fn stats(&self) -> &stats_tracker::StatsTracker {
        &self.stats
    }

    /// Drop per-flow bookkeeping after an explicit purge. The id is never
    /// reused, so the threshold idempotence slot can be released for good.
    pub fn forget_flow(&self, flow_id: &str) {
        self.reassemblers.remove(flow_id);
        self.threshold.forget(flow_id);
    }

    /// Park a pending flow for the intercept dialog. Only `Pending` flows
    /// can be intercepted.
    pub fn intercept_flow(&self, flow_id: &str) -> bool {
        let Some(shared) = self.memory.get(flow_id) else {
            return false;
        };
        let mut flow = shared.write().expect("flow lock poisoned");
        flow.transition(FlowState::Intercepted).is_ok()
    }

    /// Release an intercepted flow back to `Pending`.
    pub fn resume_flow(&self, flow_id: &str) -> bool {
        let Some(shared) = self.memory.get(flow_id) else {
            return false;
        };
        let mut flow = shared.write().expect("flow lock poisoned");
        flow.state == FlowState::Intercepted && flow.transition(FlowState::Pending).is_ok()
    }

    fn is_excluded(&self, request: &FlowRequest) -> bool {
        let model_excluded = self.config.excluded_models.iter().any(|entry| {
            entry
                .strip_suffix('*')
                .map_or(entry == &request.model, |prefix| {
                    request.model.starts_with(prefix)
                })
        });
        let path_excluded = self
            .config
            .excluded_paths
            .iter()
            .any(|prefix| request.path.starts_with(prefix.as_str()));
        model_excluded || path_excluded
    }

    fn is_sampled_out(&self) -> bool {
        self.config.sampling_rate < 1.0 && rand::random::<f64>() >= self.config.sampling_rate
    }

    /// Construct a Flow in `Pending`, install it, and announce it. Returns
    /// `None` when the request is excluded or sampled out; the proxy then
    /// skips the remaining hooks.
    pub fn on_request_accepted(
        &self,
        request: FlowRequest,
        metadata: FlowMetadata,
    ) -> Option<FlowId> {
        if self.is_excluded(&request) || self.is_sampled_out() {
            return None;
        }

        let streaming = request.params.stream;
        let oversized = request.body_bytes > self.config.max_request_body_bytes;
        let mut flow = Flow::new(request, metadata);
        if oversized {
            truncate_request_text(&mut flow, self.config.max_request_body_bytes);
        }
        flow.timestamps.request_start = Some(Utc::now());
        let id = flow.id.clone();
        let dialect = Dialect::from_provider(&flow.metadata.provider);
        let summary = FlowSummary::from(&flow);
        let request_start = flow.timestamps.request_start;

        // Insert happens-before the FlowStarted emission
        self.memory.insert(flow);
        self.reassemblers.insert(
            id.clone(),
            Reassembler::new(
                dialect,
                ReassemblyConfig {
                    max_body_bytes: self.config.max_response_body_bytes,
                    retain_raw_chunks: self.config.persist_raw_chunks,
                    request_start,
                    streaming,
                },
            ),
        );
        self.bus.publish(FlowEvent::FlowStarted { summary });
        tracing::debug!(flow_id = %id, dialect = ?dialect, "flow accepted");

        if oversized {
            finalizer::finalize(
                self,
                &id,
                UpstreamOutcome::Error {
                    kind: ErrorKind::TokenLimitExceeded,
                    message: format!(
                        "request body exceeded {} bytes",
                        self.config.max_request_body_bytes
                    ),
                    status_code: None,
                    raw_body: None,
                },
            );
        }
        Some(id)
    }

    /// Record the upstream response head and time-to-first-byte.
    pub fn on_upstream_response_head(
        &self,
        flow_id: &str,
        status: u16,
        status_text: &str,
        headers: Vec<(String, String)>,
    ) {
        let Some(shared) = self.memory.get(flow_id) else {
            tracing::debug!(flow_id = %flow_id, "response head for unknown flow dropped");
            return;
        };
        let mut flow = shared.write().expect("flow lock poisoned");
        if flow.is_terminal() {
            return;
        }
        let now = Utc::now();
        flow.response = Some(FlowResponse::head(status, status_text, headers));
        flow.timestamps.response_start = Some(now);
        if let Some(start) = flow.timestamps.request_start {
            flow.timestamps.ttfb_ms = Some((now - start).num_milliseconds().max(0) as u64);
        }
    }

    /// Forward one raw chunk into the flow's reassembler. Emits at most one
    /// `FlowUpdated` per call.
    pub fn on_upstream_chunk(&self, flow_id: &str, bytes: &[u8]) {
        let (deltas, chunks_after, progressed) = {
            let Some(mut entry) = self.reassemblers.get_mut(flow_id) else {
                // Chunks racing a cancel are expected; drop and log
                tracing::debug!(flow_id = %flow_id, "chunk for unknown flow dropped");
                return;
            };
            let before = entry.chunk_count();
            let deltas = entry.ingest(bytes);
            let after = entry.chunk_count();
            (deltas, after, after > before)
        };

        let mut update = FlowUpdate::default();
        let mut terminated = false;
        let mut failed = false;
        for delta in &deltas {
            match delta {
                FlowDelta::Content(text) => {
                    update
                        .content_delta
                        .get_or_insert_with(String::new)
                        .push_str(text);
                }
                FlowDelta::Thinking(text) => {
                    update
                        .thinking_delta
                        .get_or_insert_with(String::new)
                        .push_str(text);
                }
                FlowDelta::ToolCallStarted { name } => {
                    update.tool_call_name = Some(name.clone());
                }
                FlowDelta::StopReason(_) => {}
                FlowDelta::Terminator => terminated = true,
                FlowDelta::StreamError(_) => failed = true,
                FlowDelta::Malformed => {}
            }
        }

        if progressed {
            if let Some(shared) = self.memory.get(flow_id) {
                let mut flow = shared.write().expect("flow lock poisoned");
                if flow.state == FlowState::Pending {
                    if let Err(e) = flow.transition(FlowState::Streaming) {
                        tracing::warn!(flow_id = %flow_id, error = %e, "streaming transition rejected");
                    } else {
                        update.state = Some(FlowState::Streaming);
                    }
                }
            }
            update.chunk_count = Some(chunks_after);
            self.bus.publish(FlowEvent::FlowUpdated {
                id: flow_id.to_string(),
                update,
            });
        }

        // A latched stream error (body cap, dialect error event) fails the
        // flow immediately; a clean terminator completes it. The proxy's
        // later completion call lands on a terminal flow and is dropped.
        if failed || terminated {
            finalizer::finalize(self, flow_id, UpstreamOutcome::Ok);
        }
    }

    /// Drive the flow to a terminal state. Idempotent per flow id.
    pub fn on_upstream_complete(&self, flow_id: &str, outcome: UpstreamOutcome) {
        finalizer::finalize(self, flow_id, outcome);
    }

    /// Pending reassemblers, for observability.
    pub fn in_flight(&self) -> usize {
        self.reassemblers.len()
    }
}

/// Truncate normalized message text to the request cap and drop the
/// oversized raw body. No allocation beyond the cap.
fn truncate_request_text(flow: &mut Flow, cap: usize) {
    let mut budget = BufferBudget::new(cap);
    for message in &mut flow.request.messages {
        if let MessageContent::Text(text) = &mut message.content {
            let original = std::mem::take(text);
            budget.append(text, &original);
        }
    }
    flow.request.body = serde_json::Value::Null;
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowscope_core::flow::{Message, RequestParams};
    use flowscope_store::FileStoreConfig;
    use tempfile::TempDir;

    async fn service() -> (Arc<CaptureService>, Arc<MemoryStore>, EventBus, TempDir) {
        let dir = TempDir::new().unwrap();
        let memory = Arc::new(MemoryStore::new(100));
        let bus = EventBus::new(64);
        let files = FileStore::open(dir.path(), FileStoreConfig::default())
            .await
            .unwrap();
        let config = CoreConfig::default();
        let capture = CaptureService::new(memory.clone(), bus.clone(), files, config);
        (capture, memory, bus, dir)
    }

    fn request(model: &str, streaming: bool) -> FlowRequest {
        FlowRequest {
            method: "POST".to_string(),
            path: "/v1/chat/completions".to_string(),
            headers: vec![],
            body: serde_json::Value::Null,
            messages: vec![Message::text("user", "hello")],
            system: None,
            tools: None,
            model: model.to_string(),
            original_model: None,
            params: RequestParams {
                stream: streaming,
                ..Default::default()
            },
            body_bytes: 24,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn streaming_flow_completes_on_terminator() {
        let (capture, memory, bus, _dir) = service().await;
        let mut sub = bus.subscribe();

        let id = capture
            .on_request_accepted(request("gpt-4o", true), FlowMetadata::for_provider("openai"))
            .unwrap();
        capture.on_upstream_response_head(&id, 200, "OK", vec![]);
        capture.on_upstream_chunk(
            &id,
            b"data: {\"choices\":[{\"delta\":{\"content\":\"Hello\"}}]}\n\n",
        );
        capture.on_upstream_chunk(
            &id,
            b"data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"stop\"}],\"usage\":{\"prompt_tokens\":2,\"completion_tokens\":1,\"total_tokens\":3}}\n\n",
        );
        capture.on_upstream_chunk(&id, b"data: [DONE]\n\n");
        // Duplicate completion from the proxy is dropped
        capture.on_upstream_complete(&id, UpstreamOutcome::Ok);

        let flow = memory.snapshot(&id).unwrap();
        assert_eq!(flow.state, FlowState::Completed);
        let response = flow.response.unwrap();
        assert_eq!(response.content, "Hello");
        assert_eq!(response.usage.total_tokens, Some(3));
        assert_eq!(response.stream.unwrap().chunk_count, 2);

        // Started, two updates, exactly one completed
        let mut started = 0;
        let mut updated = 0;
        let mut completed = 0;
        while let Some(event) = sub.try_recv() {
            match event {
                FlowEvent::FlowStarted { .. } => started += 1,
                FlowEvent::FlowUpdated { .. } => updated += 1,
                FlowEvent::FlowCompleted { .. } => completed += 1,
                FlowEvent::StatsUpdated { .. } => {}
                other => panic!("unexpected event {other:?}"),
            }
        }
        assert_eq!(started, 1);
        assert_eq!(updated, 2);
        assert_eq!(completed, 1);
    }

    #[tokio::test]
    async fn upstream_error_fails_the_flow() {
        let (capture, memory, bus, _dir) = service().await;
        let mut sub = bus.subscribe();

        let id = capture
            .on_request_accepted(
                request("claude-sonnet-4", true),
                FlowMetadata::for_provider("anthropic"),
            )
            .unwrap();
        capture.on_upstream_complete(&id, UpstreamOutcome::from_status(429, "rate limited"));

        let flow = memory.snapshot(&id).unwrap();
        assert_eq!(flow.state, FlowState::Failed);
        let error = flow.error.unwrap();
        assert_eq!(error.kind, ErrorKind::RateLimit);
        assert_eq!(error.status_code, Some(429));

        let mut saw_failed = false;
        while let Some(event) = sub.try_recv() {
            if matches!(event, FlowEvent::FlowFailed { .. }) {
                saw_failed = true;
            }
        }
        assert!(saw_failed);
    }

    #[tokio::test]
    async fn cancel_discards_partial_buffers_but_persists() {
        let (capture, memory, _bus, _dir) = service().await;
        let id = capture
            .on_request_accepted(request("gpt-4o", true), FlowMetadata::for_provider("openai"))
            .unwrap();
        capture.on_upstream_chunk(
            &id,
            b"data: {\"choices\":[{\"delta\":{\"content\":\"partial\"}}]}\n\n",
        );
        capture.on_upstream_complete(&id, UpstreamOutcome::Cancelled);

        let flow = memory.snapshot(&id).unwrap();
        assert_eq!(flow.state, FlowState::Cancelled);
        // Buffers were discarded with the reassembler
        assert!(flow.response.is_none() || flow.response.unwrap().content.is_empty());
        assert_eq!(capture.in_flight(), 0);
    }

    #[tokio::test]
    async fn late_chunks_after_cancel_are_dropped() {
        let (capture, memory, _bus, _dir) = service().await;
        let id = capture
            .on_request_accepted(request("gpt-4o", true), FlowMetadata::for_provider("openai"))
            .unwrap();
        capture.on_upstream_complete(&id, UpstreamOutcome::Cancelled);
        // Racing chunk arrives after the cancel
        capture.on_upstream_chunk(
            &id,
            b"data: {\"choices\":[{\"delta\":{\"content\":\"late\"}}]}\n\n",
        );
        assert_eq!(memory.snapshot(&id).unwrap().state, FlowState::Cancelled);
    }

    #[tokio::test]
    async fn excluded_models_are_not_captured() {
        let dir = TempDir::new().unwrap();
        let memory = Arc::new(MemoryStore::new(100));
        let bus = EventBus::new(64);
        let files = FileStore::open(dir.path(), FileStoreConfig::default())
            .await
            .unwrap();
        let mut config = CoreConfig::default();
        config.excluded_models = vec!["gpt-4o-mini".to_string(), "internal-*".to_string()];
        config.excluded_paths = vec!["/v1/embeddings".to_string()];
        let capture = CaptureService::new(memory.clone(), bus, files, config);

        assert!(capture
            .on_request_accepted(
                request("gpt-4o-mini", false),
                FlowMetadata::for_provider("openai")
            )
            .is_none());
        assert!(capture
            .on_request_accepted(
                request("internal-router", false),
                FlowMetadata::for_provider("openai")
            )
            .is_none());
        let mut embeddings = request("gpt-4o", false);
        embeddings.path = "/v1/embeddings".to_string();
        assert!(capture
            .on_request_accepted(embeddings, FlowMetadata::for_provider("openai"))
            .is_none());
        assert!(capture
            .on_request_accepted(request("gpt-4o", false), FlowMetadata::for_provider("openai"))
            .is_some());
        assert_eq!(memory.len(), 1);
    }

    #[tokio::test]
    async fn oversized_request_fails_with_token_limit() {
        let dir = TempDir::new().unwrap();
        let memory = Arc::new(MemoryStore::new(100));
        let bus = EventBus::new(64);
        let files = FileStore::open(dir.path(), FileStoreConfig::default())
            .await
            .unwrap();
        let mut config = CoreConfig::default();
        config.max_request_body_bytes = 16;
        let capture = CaptureService::new(memory.clone(), bus, files, config);

        let mut oversized = request("gpt-4o", false);
        oversized.messages = vec![Message::text("user", "a very long prompt body indeed")];
        oversized.body_bytes = 4096;
        let id = capture
            .on_request_accepted(oversized, FlowMetadata::for_provider("openai"))
            .unwrap();

        let flow = memory.snapshot(&id).unwrap();
        assert_eq!(flow.state, FlowState::Failed);
        assert_eq!(
            flow.error.unwrap().kind,
            ErrorKind::TokenLimitExceeded
        );
        let text = flow.request.messages[0].content.text();
        assert!(text.contains("…[truncated]"));
        assert!(flow.request.body.is_null());
    }

    #[tokio::test]
    async fn unary_flow_parses_body_at_completion() {
        let (capture, memory, _bus, _dir) = service().await;
        let id = capture
            .on_request_accepted(
                request("claude-sonnet-4", false),
                FlowMetadata::for_provider("anthropic"),
            )
            .unwrap();
        capture.on_upstream_response_head(&id, 200, "OK", vec![]);
        capture.on_upstream_chunk(
            &id,
            br#"{"id":"msg_1","content":[{"type":"text","text":"unary"}],"usage":{"input_tokens":5,"output_tokens":7}}"#,
        );
        capture.on_upstream_complete(&id, UpstreamOutcome::Ok);

        let flow = memory.snapshot(&id).unwrap();
        assert_eq!(flow.state, FlowState::Completed);
        let response = flow.response.unwrap();
        assert_eq!(response.content, "unary");
        assert_eq!(response.usage.total_tokens, Some(12));
        assert!(response.stream.is_none());
    }
}
