//! Threshold monitor
//!
//! Compares a finalized Flow against the configured limits. A rule set to
//! zero is disabled. At most one warning is ever emitted per flow id.

use dashmap::DashSet;
use flowscope_core::config::ThresholdConfig;
use flowscope_core::events::ThresholdWarning;
use flowscope_core::flow::{Flow, FlowId};

pub struct ThresholdMonitor {
    config: ThresholdConfig,
    warned: DashSet<FlowId>,
}

impl ThresholdMonitor {
    pub fn new(config: ThresholdConfig) -> Self {
        Self {
            config,
            warned: DashSet::new(),
        }
    }

    /// Evaluate the rules; `Some` at most once per flow id.
    pub fn evaluate(&self, flow: &Flow) -> Option<ThresholdWarning> {
        if !self.config.is_enabled() {
            return None;
        }
        if self.warned.contains(&flow.id) {
            return None;
        }

        let duration_ms = flow.timestamps.duration_ms;
        let usage = flow.response.as_ref().map(|r| r.usage);
        let total_tokens = usage.map(|u| u.total());
        let input_tokens = usage.map(|u| u.input_tokens);
        let output_tokens = usage.map(|u| u.output_tokens);

        let over = |limit: u64, actual: Option<u64>| {
            limit > 0 && actual.is_some_and(|value| value >= limit)
        };

        let warning = ThresholdWarning {
            latency_exceeded: over(self.config.latency_limit_ms, duration_ms),
            total_tokens_exceeded: over(
                self.config.total_limit as u64,
                total_tokens.map(u64::from),
            ),
            input_tokens_exceeded: over(
                self.config.input_limit as u64,
                input_tokens.map(u64::from),
            ),
            output_tokens_exceeded: over(
                self.config.output_limit as u64,
                output_tokens.map(u64::from),
            ),
            duration_ms,
            total_tokens,
            input_tokens,
            output_tokens,
        };

        if !warning.any() {
            return None;
        }
        self.warned.insert(flow.id.clone());
        Some(warning)
    }

    /// Forget a flow id, freeing the idempotence slot after purge.
    pub fn forget(&self, id: &str) {
        self.warned.remove(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use flowscope_core::flow::{
        FlowMetadata, FlowRequest, FlowResponse, FlowState, Message, RequestParams, TokenUsage,
    };

    fn flow(duration_ms: u64, input: u32, output: u32) -> Flow {
        let mut flow = Flow::new(
            FlowRequest {
                method: "POST".to_string(),
                path: "/v1/messages".to_string(),
                headers: vec![],
                body: serde_json::Value::Null,
                messages: vec![Message::text("user", "hi")],
                system: None,
                tools: None,
                model: "claude-sonnet-4".to_string(),
                original_model: None,
                params: RequestParams::default(),
                body_bytes: 8,
                created_at: Utc::now(),
            },
            FlowMetadata::for_provider("anthropic"),
        );
        let mut response = FlowResponse::head(200, "OK", vec![]);
        response.usage = TokenUsage {
            input_tokens: input,
            output_tokens: output,
            ..Default::default()
        };
        flow.response = Some(response);
        flow.transition(FlowState::Completed).unwrap();
        flow.timestamps.duration_ms = Some(duration_ms);
        flow
    }

    #[test]
    fn disabled_rules_never_trip() {
        let monitor = ThresholdMonitor::new(ThresholdConfig::default());
        assert!(monitor.evaluate(&flow(999_999, 1_000_000, 1_000_000)).is_none());
    }

    #[test]
    fn latency_rule_trips_at_the_limit() {
        let monitor = ThresholdMonitor::new(ThresholdConfig {
            latency_limit_ms: 5000,
            ..Default::default()
        });
        assert!(monitor.evaluate(&flow(4999, 1, 1)).is_none());
        let warning = monitor.evaluate(&flow(5000, 1, 1)).unwrap();
        assert!(warning.latency_exceeded);
        assert!(!warning.total_tokens_exceeded);
        assert_eq!(warning.duration_ms, Some(5000));
    }

    #[test]
    fn token_rules_carry_actuals() {
        let monitor = ThresholdMonitor::new(ThresholdConfig {
            total_limit: 100,
            input_limit: 80,
            output_limit: 90,
            ..Default::default()
        });
        let warning = monitor.evaluate(&flow(10, 80, 30)).unwrap();
        assert!(warning.total_tokens_exceeded);
        assert!(warning.input_tokens_exceeded);
        assert!(!warning.output_tokens_exceeded);
        assert_eq!(warning.total_tokens, Some(110));
    }

    #[test]
    fn warns_once_per_flow() {
        let monitor = ThresholdMonitor::new(ThresholdConfig {
            latency_limit_ms: 1,
            ..Default::default()
        });
        let flow = flow(10, 1, 1);
        assert!(monitor.evaluate(&flow).is_some());
        assert!(monitor.evaluate(&flow).is_none());
        monitor.forget(&flow.id);
        assert!(monitor.evaluate(&flow).is_some());
    }
}
