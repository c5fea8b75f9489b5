//! Aggregated statistics over a set of Flows

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Basic aggregates for a filtered set of Flows.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlowStats {
    pub total: u64,
    pub successful: u64,
    pub failed: u64,
    pub success_rate: f64,
    pub avg_latency_ms: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_latency_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_latency_ms: Option<u64>,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub avg_input_tokens: f64,
    pub avg_output_tokens: f64,
    #[serde(default)]
    pub by_provider: HashMap<String, u64>,
    #[serde(default)]
    pub by_model: HashMap<String, u64>,
    #[serde(default)]
    pub by_state: HashMap<String, u64>,
}

/// One bucket of a time-series trend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrendBucket {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub count: u64,
    pub failed: u64,
    pub total_tokens: u64,
    pub avg_latency_ms: f64,
}

/// One bar of a value-distribution histogram.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistogramBucket {
    pub label: String,
    pub lower: u64,
    /// Exclusive upper bound; `None` for the open-ended last bucket.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upper: Option<u64>,
    pub count: u64,
}

/// Stats plus trend series and distributions for the dashboard.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnhancedStats {
    #[serde(flatten)]
    pub stats: FlowStats,
    #[serde(default)]
    pub trend: Vec<TrendBucket>,
    #[serde(default)]
    pub latency_histogram: Vec<HistogramBucket>,
    #[serde(default)]
    pub token_histogram: Vec<HistogramBucket>,
    #[serde(default)]
    pub error_kinds: HashMap<String, u64>,
}

/// Inclusive time range used by stats queries.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.start && at <= self.end
    }

    /// Split into `buckets` equal-width windows, at least one.
    pub fn buckets(&self, buckets: usize) -> Vec<(DateTime<Utc>, DateTime<Utc>)> {
        let buckets = buckets.max(1);
        let span = (self.end - self.start).num_milliseconds().max(1);
        let width = (span as f64 / buckets as f64).ceil() as i64;
        (0..buckets)
            .map(|i| {
                let start = self.start + chrono::Duration::milliseconds(width * i as i64);
                let end = (start + chrono::Duration::milliseconds(width)).min(self.end);
                (start, end)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn time_range_buckets_cover_the_span() {
        let start = Utc::now();
        let end = start + chrono::Duration::hours(24);
        let range = TimeRange { start, end };
        let buckets = range.buckets(24);
        assert_eq!(buckets.len(), 24);
        assert_eq!(buckets[0].0, start);
        assert!(buckets.last().unwrap().1 <= end);
    }

    #[test]
    fn time_range_contains_is_inclusive() {
        let start = Utc::now();
        let end = start + chrono::Duration::minutes(5);
        let range = TimeRange { start, end };
        assert!(range.contains(start));
        assert!(range.contains(end));
        assert!(!range.contains(end + chrono::Duration::seconds(1)));
    }
}
