//! Stats aggregation
//!
//! One pass over the matched flows produces the basic aggregates; the
//! enhanced variant adds a time-bucketed trend and fixed-edge histograms.

use flowscope_core::flow::{Flow, FlowState};
use flowscope_core::stats::{
    EnhancedStats, FlowStats, HistogramBucket, TimeRange, TrendBucket,
};

const LATENCY_EDGES_MS: &[u64] = &[100, 500, 1_000, 2_000, 5_000, 10_000, 30_000];
const TOKEN_EDGES: &[u64] = &[100, 500, 1_000, 5_000, 10_000, 50_000, 100_000];

pub fn aggregate(flows: &[Flow]) -> FlowStats {
    let mut stats = FlowStats::default();
    let mut latency_sum = 0u64;
    let mut latency_count = 0u64;

    for flow in flows {
        stats.total += 1;
        match flow.state {
            FlowState::Completed => stats.successful += 1,
            FlowState::Failed => stats.failed += 1,
            _ => {}
        }
        if let Some(duration) = flow.timestamps.duration_ms {
            latency_sum += duration;
            latency_count += 1;
            stats.min_latency_ms = Some(stats.min_latency_ms.map_or(duration, |m| m.min(duration)));
            stats.max_latency_ms = Some(stats.max_latency_ms.map_or(duration, |m| m.max(duration)));
        }
        if let Some(response) = &flow.response {
            stats.total_input_tokens += response.usage.input_tokens as u64;
            stats.total_output_tokens += response.usage.output_tokens as u64;
        }
        *stats
            .by_provider
            .entry(flow.metadata.provider.clone())
            .or_insert(0) += 1;
        *stats
            .by_model
            .entry(flow.request.model.clone())
            .or_insert(0) += 1;
        *stats
            .by_state
            .entry(flow.state.as_str().to_string())
            .or_insert(0) += 1;
    }

    if stats.total > 0 {
        stats.success_rate = stats.successful as f64 / stats.total as f64 * 100.0;
        stats.avg_input_tokens = stats.total_input_tokens as f64 / stats.total as f64;
        stats.avg_output_tokens = stats.total_output_tokens as f64 / stats.total as f64;
    }
    if latency_count > 0 {
        stats.avg_latency_ms = latency_sum as f64 / latency_count as f64;
    }
    stats
}

pub fn enhanced(flows: &[Flow], time_range: &TimeRange, buckets: usize) -> EnhancedStats {
    let mut out = EnhancedStats {
        stats: aggregate(flows),
        ..Default::default()
    };

    let windows = time_range.buckets(if buckets == 0 { 24 } else { buckets });
    out.trend = windows
        .iter()
        .map(|(start, end)| {
            let mut bucket = TrendBucket {
                start: *start,
                end: *end,
                count: 0,
                failed: 0,
                total_tokens: 0,
                avg_latency_ms: 0.0,
            };
            let mut latency_sum = 0u64;
            let mut latency_count = 0u64;
            for flow in flows {
                let created = flow.timestamps.created;
                if created < *start || created >= *end {
                    continue;
                }
                bucket.count += 1;
                if flow.state == FlowState::Failed {
                    bucket.failed += 1;
                }
                bucket.total_tokens += flow.total_tokens().unwrap_or(0) as u64;
                if let Some(duration) = flow.timestamps.duration_ms {
                    latency_sum += duration;
                    latency_count += 1;
                }
            }
            if latency_count > 0 {
                bucket.avg_latency_ms = latency_sum as f64 / latency_count as f64;
            }
            bucket
        })
        .collect();

    out.latency_histogram = histogram(
        LATENCY_EDGES_MS,
        "ms",
        flows.iter().filter_map(|f| f.timestamps.duration_ms),
    );
    out.token_histogram = histogram(
        TOKEN_EDGES,
        "tokens",
        flows.iter().filter_map(|f| f.total_tokens().map(u64::from)),
    );

    for flow in flows {
        if let Some(error) = &flow.error {
            *out
                .error_kinds
                .entry(error.kind.as_str().to_string())
                .or_insert(0) += 1;
        }
    }
    out
}

fn histogram(edges: &[u64], unit: &str, values: impl Iterator<Item = u64>) -> Vec<HistogramBucket> {
    let mut buckets: Vec<HistogramBucket> = Vec::with_capacity(edges.len() + 1);
    let mut lower = 0u64;
    for &edge in edges {
        buckets.push(HistogramBucket {
            label: format!("{lower}-{edge} {unit}"),
            lower,
            upper: Some(edge),
            count: 0,
        });
        lower = edge;
    }
    buckets.push(HistogramBucket {
        label: format!("{lower}+ {unit}"),
        lower,
        upper: None,
        count: 0,
    });

    for value in values {
        let slot = buckets
            .iter_mut()
            .find(|b| value >= b.lower && b.upper.is_none_or(|upper| value < upper))
            .expect("open-ended last bucket catches everything");
        slot.count += 1;
    }
    buckets
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use flowscope_core::error::{ErrorKind, FlowError};
    use flowscope_core::flow::{
        FlowMetadata, FlowRequest, FlowResponse, Message, RequestParams, TokenUsage,
    };

    fn flow(state: FlowState, duration: Option<u64>, tokens: u32) -> Flow {
        let mut flow = Flow::new(
            FlowRequest {
                method: "POST".to_string(),
                path: "/v1/messages".to_string(),
                headers: vec![],
                body: serde_json::Value::Null,
                messages: vec![Message::text("user", "q")],
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
            input_tokens: tokens / 2,
            output_tokens: tokens - tokens / 2,
            total_tokens: Some(tokens),
            ..Default::default()
        };
        flow.response = Some(response);
        if state == FlowState::Failed {
            flow.error = Some(FlowError::new(ErrorKind::RateLimit, "429"));
        }
        flow.transition(state).unwrap();
        flow.timestamps.duration_ms = duration;
        flow
    }

    #[test]
    fn aggregates_counts_and_rates() {
        let flows = vec![
            flow(FlowState::Completed, Some(100), 10),
            flow(FlowState::Completed, Some(300), 30),
            flow(FlowState::Failed, Some(50), 0),
            flow(FlowState::Cancelled, None, 0),
        ];
        let stats = aggregate(&flows);
        assert_eq!(stats.total, 4);
        assert_eq!(stats.successful, 2);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.success_rate, 50.0);
        assert_eq!(stats.min_latency_ms, Some(50));
        assert_eq!(stats.max_latency_ms, Some(300));
        assert_eq!(stats.avg_latency_ms, 150.0);
        assert_eq!(stats.total_input_tokens + stats.total_output_tokens, 40);
        assert_eq!(stats.by_state["completed"], 2);
    }

    #[test]
    fn empty_set_is_all_zeroes() {
        let stats = aggregate(&[]);
        assert_eq!(stats.total, 0);
        assert_eq!(stats.success_rate, 0.0);
        assert!(stats.min_latency_ms.is_none());
    }

    #[test]
    fn histograms_bucket_values() {
        let flows = vec![
            flow(FlowState::Completed, Some(50), 80),
            flow(FlowState::Completed, Some(700), 600),
            flow(FlowState::Completed, Some(99_999), 500_000),
        ];
        let range = TimeRange {
            start: Utc::now() - chrono::Duration::hours(1),
            end: Utc::now() + chrono::Duration::hours(1),
        };
        let enhanced = enhanced(&flows, &range, 4);
        assert_eq!(enhanced.trend.len(), 4);
        assert_eq!(enhanced.trend.iter().map(|b| b.count).sum::<u64>(), 3);

        let first_latency = &enhanced.latency_histogram[0];
        assert_eq!(first_latency.count, 1);
        let open_ended = enhanced.latency_histogram.last().unwrap();
        assert_eq!(open_ended.count, 1);
        assert!(open_ended.upper.is_none());

        assert_eq!(enhanced.token_histogram[0].count, 1);
        assert_eq!(enhanced.token_histogram.last().unwrap().count, 1);
    }

    #[test]
    fn error_kinds_are_counted() {
        let flows = vec![
            flow(FlowState::Failed, Some(10), 0),
            flow(FlowState::Failed, Some(10), 0),
            flow(FlowState::Completed, Some(10), 5),
        ];
        let range = TimeRange {
            start: Utc::now() - chrono::Duration::hours(1),
            end: Utc::now() + chrono::Duration::hours(1),
        };
        let enhanced = enhanced(&flows, &range, 2);
        assert_eq!(enhanced.error_kinds["rate_limit"], 2);
    }
}
