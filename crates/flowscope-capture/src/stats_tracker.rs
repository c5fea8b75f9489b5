//! Running stats over finalized flows
//!
//! Incremental accumulation so every finalization can publish a fresh
//! `StatsUpdated` without rescanning the store.

use flowscope_core::flow::{Flow, FlowState};
use flowscope_core::stats::FlowStats;
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Default)]
struct Accumulator {
    total: u64,
    successful: u64,
    failed: u64,
    latency_sum: u64,
    latency_count: u64,
    min_latency_ms: Option<u64>,
    max_latency_ms: Option<u64>,
    input_tokens: u64,
    output_tokens: u64,
    by_provider: HashMap<String, u64>,
    by_model: HashMap<String, u64>,
    by_state: HashMap<String, u64>,
}

#[derive(Default)]
pub struct StatsTracker {
    inner: Mutex<Accumulator>,
}

impl StatsTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one finalized flow in and return the updated snapshot.
    pub fn record(&self, flow: &Flow) -> FlowStats {
        let mut acc = self.inner.lock().expect("stats accumulator poisoned");
        acc.total += 1;
        match flow.state {
            FlowState::Completed => acc.successful += 1,
            FlowState::Failed => acc.failed += 1,
            _ => {}
        }
        if let Some(duration) = flow.timestamps.duration_ms {
            acc.latency_sum += duration;
            acc.latency_count += 1;
            acc.min_latency_ms = Some(acc.min_latency_ms.map_or(duration, |m| m.min(duration)));
            acc.max_latency_ms = Some(acc.max_latency_ms.map_or(duration, |m| m.max(duration)));
        }
        if let Some(response) = &flow.response {
            acc.input_tokens += response.usage.input_tokens as u64;
            acc.output_tokens += response.usage.output_tokens as u64;
        }
        *acc
            .by_provider
            .entry(flow.metadata.provider.clone())
            .or_insert(0) += 1;
        *acc.by_model.entry(flow.request.model.clone()).or_insert(0) += 1;
        *acc
            .by_state
            .entry(flow.state.as_str().to_string())
            .or_insert(0) += 1;

        FlowStats {
            total: acc.total,
            successful: acc.successful,
            failed: acc.failed,
            success_rate: if acc.total > 0 {
                acc.successful as f64 / acc.total as f64 * 100.0
            } else {
                0.0
            },
            avg_latency_ms: if acc.latency_count > 0 {
                acc.latency_sum as f64 / acc.latency_count as f64
            } else {
                0.0
            },
            min_latency_ms: acc.min_latency_ms,
            max_latency_ms: acc.max_latency_ms,
            total_input_tokens: acc.input_tokens,
            total_output_tokens: acc.output_tokens,
            avg_input_tokens: if acc.total > 0 {
                acc.input_tokens as f64 / acc.total as f64
            } else {
                0.0
            },
            avg_output_tokens: if acc.total > 0 {
                acc.output_tokens as f64 / acc.total as f64
            } else {
                0.0
            },
            by_provider: acc.by_provider.clone(),
            by_model: acc.by_model.clone(),
            by_state: acc.by_state.clone(),
        }
    }
}
