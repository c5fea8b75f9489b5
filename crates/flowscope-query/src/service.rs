//! Two-tier query service
//!
//! Merges the memory snapshot with index candidates (memory wins on id),
//! evaluates the full filter post-hydration, sorts with a deterministic id
//! tie-break, and paginates. Queries accept a deadline; expiry returns the
//! partial result with a truncation flag.

use crate::stats;
use flowscope_core::error::{Error, Result};
use flowscope_core::events::FlowSummary;
use flowscope_core::flow::{Flow, FlowId};
use flowscope_core::stats::{EnhancedStats, FlowStats, TimeRange};
use flowscope_filter::{evaluate, extract, FilterExpr, SargablePredicates};
use flowscope_store::{FileStore, IndexQuery, MemoryStore};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortBy {
    #[default]
    CreatedAt,
    Duration,
    TotalTokens,
    Model,
}

#[derive(Debug, Clone, Default)]
pub struct QueryParams {
    pub filter: Option<FilterExpr>,
    pub sort_by: SortBy,
    pub desc: bool,
    pub page: usize,
    pub page_size: usize,
    pub time_range: Option<TimeRange>,
    /// Partial results come back with `truncated = true` past this point.
    pub deadline: Option<Instant>,
}

pub const MAX_PAGE_SIZE: usize = 1000;

impl QueryParams {
    pub fn builder() -> QueryParamsBuilder {
        QueryParamsBuilder::default()
    }

    pub fn page_size_or_default(&self) -> usize {
        if self.page_size == 0 { 50 } else { self.page_size }
    }

    /// Validate caller-supplied paging and range arguments. A zero
    /// page size falls back to the default; anything else degenerate is
    /// rejected.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.page_size > MAX_PAGE_SIZE {
            return Err(format!("page_size cannot exceed {MAX_PAGE_SIZE}"));
        }
        if let Some(range) = &self.time_range
            && range.start > range.end
        {
            return Err("time_range start must not be after end".to_string());
        }
        Ok(())
    }
}

/// Builder for QueryParams; `build` validates.
#[derive(Debug, Default)]
pub struct QueryParamsBuilder {
    params: QueryParams,
}

impl QueryParamsBuilder {
    pub fn filter(mut self, filter: FilterExpr) -> Self {
        self.params.filter = Some(filter);
        self
    }

    pub fn sort_by(mut self, sort_by: SortBy) -> Self {
        self.params.sort_by = sort_by;
        self
    }

    pub fn desc(mut self, desc: bool) -> Self {
        self.params.desc = desc;
        self
    }

    pub fn page(mut self, page: usize) -> Self {
        self.params.page = page;
        self
    }

    pub fn page_size(mut self, page_size: usize) -> Self {
        self.params.page_size = page_size;
        self
    }

    pub fn time_range(mut self, time_range: TimeRange) -> Self {
        self.params.time_range = Some(time_range);
        self
    }

    pub fn deadline(mut self, deadline: Instant) -> Self {
        self.params.deadline = Some(deadline);
        self
    }

    pub fn build(self) -> std::result::Result<QueryParams, String> {
        self.params.validate()?;
        Ok(self.params)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryPage {
    pub flows: Vec<Flow>,
    pub total: u64,
    pub page: usize,
    pub page_size: usize,
    pub total_pages: usize,
    pub truncated: bool,
}

#[derive(Clone)]
pub struct QueryService {
    memory: Arc<MemoryStore>,
    files: FileStore,
}

impl QueryService {
    pub fn new(memory: Arc<MemoryStore>, files: FileStore) -> Self {
        Self { memory, files }
    }

    pub fn memory(&self) -> &MemoryStore {
        &self.memory
    }

    pub fn files(&self) -> &FileStore {
        &self.files
    }

    /// Point get: memory first, then the file tier.
    pub async fn get(&self, id: &str) -> Result<Option<Flow>> {
        if let Some(flow) = self.memory.snapshot(id) {
            return Ok(Some(flow));
        }
        self.files.get(id).await
    }

    /// Collect every Flow matching the filter, memory first. The deadline
    /// caps file hydration; `true` in the result means truncated.
    async fn collect(
        &self,
        filter: Option<&FilterExpr>,
        time_range: Option<&TimeRange>,
        deadline: Option<Instant>,
    ) -> Result<(Vec<Flow>, bool)> {
        let matches = |flow: &Flow| {
            time_range.is_none_or(|range| range.contains(flow.timestamps.created))
                && filter.is_none_or(|expr| evaluate(expr, flow))
        };

        let mut flows: Vec<Flow> = Vec::new();
        let mut seen: HashSet<FlowId> = HashSet::new();
        for flow in self.memory.snapshot_all() {
            seen.insert(flow.id.clone());
            if matches(&flow) {
                flows.push(flow);
            }
        }

        let index_query = to_index_query(
            filter.map(extract).unwrap_or_default(),
            time_range,
        );
        let candidates = self.files.candidates(&index_query).await?;

        let mut truncated = false;
        for candidate in candidates {
            if seen.contains(&candidate.id) {
                // Memory wins on id
                continue;
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                truncated = true;
                break;
            }
            if let Some(flow) = self.files.hydrate(&candidate).await? {
                seen.insert(flow.id.clone());
                if matches(&flow) {
                    flows.push(flow);
                }
            }
        }

        Ok((flows, truncated))
    }

    /// Every Flow matching the filter, unsorted. Export and batch paths
    /// use this instead of paging.
    pub async fn query_all(
        &self,
        filter: Option<&FilterExpr>,
        time_range: Option<&TimeRange>,
        deadline: Option<Instant>,
    ) -> Result<Vec<Flow>> {
        let (flows, _) = self.collect(filter, time_range, deadline).await?;
        Ok(flows)
    }

    pub async fn query(&self, params: &QueryParams) -> Result<QueryPage> {
        params.validate().map_err(Error::InvalidQuery)?;
        let (mut flows, truncated) = self
            .collect(
                params.filter.as_ref(),
                params.time_range.as_ref(),
                params.deadline,
            )
            .await?;

        sort_flows(&mut flows, params.sort_by, params.desc);

        let page_size = params.page_size_or_default();
        let total = flows.len() as u64;
        let total_pages = ((total as usize + page_size - 1) / page_size).max(1);
        let start = params.page.saturating_mul(page_size);
        let flows = if start >= flows.len() {
            // Beyond the last page: empty list, total unchanged
            Vec::new()
        } else {
            flows.drain(start..(start + page_size).min(flows.len())).collect()
        };

        Ok(QueryPage {
            flows,
            total,
            page: params.page,
            page_size,
            total_pages,
            truncated,
        })
    }

    pub async fn stats(
        &self,
        filter: Option<&FilterExpr>,
        time_range: Option<&TimeRange>,
    ) -> Result<FlowStats> {
        let (flows, _) = self.collect(filter, time_range, None).await?;
        Ok(stats::aggregate(&flows))
    }

    pub async fn enhanced_stats(
        &self,
        filter: Option<&FilterExpr>,
        time_range: &TimeRange,
        buckets: usize,
    ) -> Result<EnhancedStats> {
        if time_range.start > time_range.end {
            return Err(Error::InvalidQuery(
                "time_range start must not be after end".to_string(),
            ));
        }
        let (flows, _) = self.collect(filter, Some(time_range), None).await?;
        Ok(stats::enhanced(&flows, time_range, buckets))
    }

    /// Preview FTS plus a post-hydration recheck against the actual
    /// content.
    pub async fn search(&self, text: &str, limit: usize) -> Result<Vec<FlowSummary>> {
        let needle = text.to_lowercase();
        let confirms = |flow: &Flow| {
            flow.request_text().to_lowercase().contains(&needle)
                || flow
                    .response
                    .as_ref()
                    .is_some_and(|r| r.content.to_lowercase().contains(&needle))
        };

        let mut summaries = Vec::new();
        let mut seen = HashSet::new();
        for flow in self.memory.snapshot_all() {
            if summaries.len() >= limit {
                return Ok(summaries);
            }
            if confirms(&flow) {
                seen.insert(flow.id.clone());
                summaries.push(FlowSummary::from(&flow));
            }
        }

        for id in self.files.search_previews(text, limit * 2).await? {
            if summaries.len() >= limit {
                break;
            }
            if seen.contains(&id) {
                continue;
            }
            if let Some(flow) = self.files.get(&id).await?
                && confirms(&flow)
            {
                seen.insert(id);
                summaries.push(FlowSummary::from(&flow));
            }
        }
        Ok(summaries)
    }
}

fn to_index_query(sargable: SargablePredicates, time_range: Option<&TimeRange>) -> IndexQuery {
    IndexQuery {
        provider: sargable.provider,
        model_like_any: sargable.model_like_any,
        states: sargable
            .states
            .iter()
            .map(|s| s.as_str().to_string())
            .collect(),
        has_error: sargable.has_error,
        has_tool_calls: sargable.has_tool_calls,
        has_thinking: sargable.has_thinking,
        is_streaming: None,
        starred: sargable.starred,
        tags: sargable.tags,
        min_total_tokens: sargable.min_total_tokens.map(|v| v as i64),
        max_total_tokens: sargable.max_total_tokens.map(|v| v as i64),
        min_duration_ms: sargable.min_duration_ms.map(|v| v as i64),
        max_duration_ms: sargable.max_duration_ms.map(|v| v as i64),
        since: time_range.map(|r| r.start.to_rfc3339()),
        until: time_range.map(|r| r.end.to_rfc3339()),
        limit: None,
    }
}

fn sort_flows(flows: &mut [Flow], sort_by: SortBy, desc: bool) {
    flows.sort_by(|a, b| {
        let primary = match sort_by {
            SortBy::CreatedAt => a.timestamps.created.cmp(&b.timestamps.created),
            SortBy::Duration => a
                .timestamps
                .duration_ms
                .unwrap_or(0)
                .cmp(&b.timestamps.duration_ms.unwrap_or(0)),
            SortBy::TotalTokens => a
                .total_tokens()
                .unwrap_or(0)
                .cmp(&b.total_tokens().unwrap_or(0)),
            SortBy::Model => a.request.model.cmp(&b.request.model),
        };
        let primary = if desc { primary.reverse() } else { primary };
        // Id ascending keeps paging deterministic regardless of direction
        primary.then_with(|| a.id.cmp(&b.id))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use flowscope_core::flow::{
        FlowMetadata, FlowRequest, FlowResponse, FlowState, Message, RequestParams, TokenUsage,
    };
    use flowscope_filter::parse;
    use flowscope_store::FileStoreConfig;
    use tempfile::TempDir;

    fn flow(provider: &str, model: &str, tokens: u32, duration: u64) -> Flow {
        let mut flow = Flow::new(
            FlowRequest {
                method: "POST".to_string(),
                path: "/v1/chat/completions".to_string(),
                headers: vec![],
                body: serde_json::Value::Null,
                messages: vec![Message::text("user", "question")],
                system: None,
                tools: None,
                model: model.to_string(),
                original_model: None,
                params: RequestParams::default(),
                body_bytes: 8,
                created_at: Utc::now(),
            },
            FlowMetadata::for_provider(provider),
        );
        let mut response = FlowResponse::head(200, "OK", vec![]);
        response.content = format!("answer from {model}");
        response.usage = TokenUsage {
            input_tokens: tokens / 2,
            output_tokens: tokens - tokens / 2,
            total_tokens: Some(tokens),
            ..Default::default()
        };
        flow.response = Some(response);
        flow.transition(FlowState::Completed).unwrap();
        flow.timestamps.duration_ms = Some(duration);
        flow.timestamps.response_end = Some(Utc::now());
        flow
    }

    async fn service_with(
        memory_flows: Vec<Flow>,
        file_flows: Vec<Flow>,
    ) -> (QueryService, TempDir) {
        let dir = TempDir::new().unwrap();
        let memory = Arc::new(MemoryStore::new(1000));
        for flow in memory_flows {
            memory.insert(flow);
        }
        let files = FileStore::open(dir.path(), FileStoreConfig::default())
            .await
            .unwrap();
        for flow in file_flows {
            files.enqueue(flow);
        }
        files.shutdown().await.unwrap();
        (QueryService::new(memory, files), dir)
    }

    #[tokio::test]
    async fn empty_filter_returns_everything() {
        let (service, _dir) = service_with(
            vec![flow("openai", "gpt-4o", 10, 100)],
            vec![flow("anthropic", "claude-sonnet-4", 20, 200)],
        )
        .await;
        let page = service.query(&QueryParams::default()).await.unwrap();
        assert_eq!(page.total, 2);
        assert!(!page.truncated);
    }

    #[tokio::test]
    async fn memory_wins_on_duplicate_id() {
        let mut shared = flow("openai", "gpt-4o", 10, 100);
        shared.annotations.comment = Some("memory copy".to_string());
        let mut disk = shared.clone();
        disk.annotations.comment = Some("disk copy".to_string());

        let (service, _dir) = service_with(vec![shared.clone()], vec![disk]).await;
        let page = service.query(&QueryParams::default()).await.unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(
            page.flows[0].annotations.comment.as_deref(),
            Some("memory copy")
        );
    }

    #[tokio::test]
    async fn filter_reaches_both_tiers() {
        let (service, _dir) = service_with(
            vec![flow("openai", "gpt-4o", 10, 100)],
            vec![
                flow("anthropic", "claude-sonnet-4", 2000, 200),
                flow("anthropic", "claude-haiku-3", 50, 50),
            ],
        )
        .await;
        let params = QueryParams {
            filter: parse("~p anthropic & ~tokens > 1000").unwrap(),
            ..Default::default()
        };
        let page = service.query(&params).await.unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.flows[0].request.model, "claude-sonnet-4");
    }

    #[tokio::test]
    async fn pagination_past_the_end_is_empty_with_total() {
        let (service, _dir) = service_with(
            (0..5).map(|n| flow("openai", "gpt-4o", n * 10, 10)).collect(),
            vec![],
        )
        .await;
        let params = QueryParams {
            page: 9,
            page_size: 2,
            ..Default::default()
        };
        let page = service.query(&params).await.unwrap();
        assert!(page.flows.is_empty());
        assert_eq!(page.total, 5);
        assert_eq!(page.total_pages, 3);
    }

    #[tokio::test]
    async fn sorting_is_deterministic_with_id_tiebreak() {
        let flows: Vec<Flow> = (0..4).map(|_| flow("openai", "gpt-4o", 100, 10)).collect();
        let mut ids: Vec<String> = flows.iter().map(|f| f.id.clone()).collect();
        ids.sort();
        let (service, _dir) = service_with(flows, vec![]).await;
        let params = QueryParams {
            sort_by: SortBy::TotalTokens,
            desc: true,
            ..Default::default()
        };
        let page = service.query(&params).await.unwrap();
        let got: Vec<String> = page.flows.iter().map(|f| f.id.clone()).collect();
        assert_eq!(got, ids, "equal keys fall back to id ascending");
    }

    #[tokio::test]
    async fn get_falls_through_to_files() {
        let disk_flow = flow("openai", "gpt-4o", 10, 100);
        let id = disk_flow.id.clone();
        let (service, _dir) = service_with(vec![], vec![disk_flow]).await;
        assert!(service.memory().snapshot(&id).is_none());
        assert!(service.get(&id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn search_confirms_against_content() {
        let (service, _dir) = service_with(
            vec![flow("openai", "gpt-4o", 10, 100)],
            vec![flow("anthropic", "claude-sonnet-4", 20, 200)],
        )
        .await;
        let hits = service.search("answer from claude", 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].provider, "anthropic");
        assert!(service.search("no such phrase", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn degenerate_params_are_rejected() {
        let (service, _dir) = service_with(vec![flow("openai", "gpt-4o", 10, 100)], vec![]).await;

        let oversized = QueryParams {
            page_size: MAX_PAGE_SIZE + 1,
            ..Default::default()
        };
        assert!(matches!(
            service.query(&oversized).await.unwrap_err(),
            Error::InvalidQuery(_)
        ));

        let now = Utc::now();
        let reversed = QueryParams {
            time_range: Some(flowscope_core::stats::TimeRange {
                start: now,
                end: now - chrono::Duration::hours(1),
            }),
            ..Default::default()
        };
        assert!(matches!(
            service.query(&reversed).await.unwrap_err(),
            Error::InvalidQuery(_)
        ));

        let backwards_range = flowscope_core::stats::TimeRange {
            start: now,
            end: now - chrono::Duration::hours(1),
        };
        assert!(service
            .enhanced_stats(None, &backwards_range, 4)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn builder_validates_on_build() {
        let built = QueryParams::builder()
            .filter(parse("~e").unwrap().unwrap())
            .sort_by(SortBy::Duration)
            .desc(false)
            .page(2)
            .page_size(25)
            .build()
            .unwrap();
        assert_eq!(built.page_size, 25);
        assert!(!built.desc);

        let err = QueryParams::builder()
            .page_size(MAX_PAGE_SIZE + 1)
            .build()
            .unwrap_err();
        assert!(err.contains("page_size"));
    }

    #[tokio::test]
    async fn query_all_returns_every_match() {
        let (service, _dir) = service_with(
            vec![flow("openai", "gpt-4o", 10, 100)],
            vec![flow("anthropic", "claude-sonnet-4", 20, 200)],
        )
        .await;
        let all = service.query_all(None, None, None).await.unwrap();
        assert_eq!(all.len(), 2);

        let filtered = service
            .query_all(parse("~p openai").unwrap().as_ref(), None, None)
            .await
            .unwrap();
        assert_eq!(filtered.len(), 1);
    }

    #[tokio::test]
    async fn expired_deadline_truncates() {
        let (service, _dir) = service_with(
            vec![],
            (0..10).map(|n| flow("openai", "gpt-4o", n, 10)).collect(),
        )
        .await;
        let params = QueryParams {
            deadline: Some(Instant::now() - std::time::Duration::from_secs(1)),
            ..Default::default()
        };
        let page = service.query(&params).await.unwrap();
        assert!(page.truncated);
        assert!(page.flows.is_empty());
    }
}
