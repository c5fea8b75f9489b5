//! Command surface
//!
//! Request/response verbs consumed by the UI shell. Arguments and replies
//! are JSON values; failures come back as structured `{kind, message}`
//! pairs. Typed methods carry the logic; `dispatch` adapts them for shells
//! that speak raw JSON.

use crate::replay::{BatchReplayResult, ReplayConfig, ReplayHandler, ReplayResult};
use flowscope_bus::{EventBus, SubscriberId, Subscription};
use flowscope_capture::CaptureService;
use flowscope_core::config::CoreConfig;
use flowscope_core::entities::{Bookmark, NotificationConfig, QuickFilter, Session};
use flowscope_core::error::Error;
use flowscope_core::events::FlowSummary;
use flowscope_core::flow::{Annotations, Flow};
use flowscope_core::stats::{EnhancedStats, FlowStats, TimeRange};
use flowscope_filter::{complete, highlight, parse, Completion, FilterExpr, HighlightSpan};
use flowscope_query::{
    diff_flows, export_flows, DiffConfig, ExportFormat, FlowDiffResult, QueryPage, QueryParams,
    QueryService, Redactor, SortBy,
};
use flowscope_store::EntityStore;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

#[derive(Debug, Clone, Serialize, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct CommandError {
    pub kind: String,
    pub message: String,
}

impl CommandError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }

    pub fn not_found(id: &str) -> Self {
        Self::new("not_found", format!("flow {id} not found"))
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::new("invalid_argument", message)
    }

    pub fn unsupported(what: &str) -> Self {
        Self::new("unsupported", format!("{what} is not available"))
    }
}

impl From<Error> for CommandError {
    fn from(e: Error) -> Self {
        Self::new("command_failed", e.to_string())
    }
}

pub type CommandResult<T> = Result<T, CommandError>;

// --- argument and reply shapes ---

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct QueryFlowsArgs {
    pub filter: Option<String>,
    pub sort_by: Option<SortBy>,
    pub desc: Option<bool>,
    pub page: Option<usize>,
    pub page_size: Option<usize>,
    pub time_range: Option<TimeRange>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParseFilterReply {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<flowscope_filter::ParseError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expr: Option<FilterExpr>,
    /// Canonical formatting of the parsed expression.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub canonical: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ExportArgs {
    pub ids: Option<Vec<String>>,
    pub filter: Option<String>,
    pub format: String,
    /// Apply the configured redaction rules.
    pub redact: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExportReply {
    pub total: usize,
    pub success: usize,
    pub failed: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub export_data: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchReply {
    pub total: usize,
    pub success: usize,
    pub failed: usize,
    pub errors: Vec<String>,
}

impl BatchReply {
    fn from_errors(total: usize, errors: Vec<String>) -> Self {
        Self {
            total,
            success: total - errors.len(),
            failed: errors.len(),
            errors,
        }
    }
}

pub struct CommandService {
    query: QueryService,
    entities: Arc<EntityStore>,
    bus: EventBus,
    capture: Arc<CaptureService>,
    config: CoreConfig,
    replay_handler: Option<Arc<dyn ReplayHandler>>,
}

impl CommandService {
    pub fn new(
        query: QueryService,
        entities: Arc<EntityStore>,
        bus: EventBus,
        capture: Arc<CaptureService>,
        config: CoreConfig,
        replay_handler: Option<Arc<dyn ReplayHandler>>,
    ) -> Self {
        Self {
            query,
            entities,
            bus,
            capture,
            config,
            replay_handler,
        }
    }

    fn parse_filter_arg(&self, filter: Option<&str>) -> CommandResult<Option<FilterExpr>> {
        match filter {
            None => Ok(None),
            Some(raw) => parse(raw).map_err(|e| CommandError::new("invalid_filter", e.to_string())),
        }
    }

    // --- query verbs ---

    pub async fn query_flows(&self, args: QueryFlowsArgs) -> CommandResult<QueryPage> {
        let params = QueryParams {
            filter: self.parse_filter_arg(args.filter.as_deref())?,
            sort_by: args.sort_by.unwrap_or_default(),
            desc: args.desc.unwrap_or(true),
            page: args.page.unwrap_or(0),
            page_size: args.page_size.unwrap_or(50),
            time_range: args.time_range,
            deadline: None,
        };
        params.validate().map_err(CommandError::invalid)?;
        Ok(self.query.query(&params).await?)
    }

    pub async fn get_flow_detail(&self, id: &str) -> CommandResult<Option<Flow>> {
        Ok(self.query.get(id).await?)
    }

    pub async fn search_flows(
        &self,
        query: &str,
        limit: usize,
    ) -> CommandResult<Vec<FlowSummary>> {
        Ok(self.query.search(query, limit.clamp(1, 500)).await?)
    }

    pub async fn get_flow_stats(&self, filter: Option<&str>) -> CommandResult<FlowStats> {
        let expr = self.parse_filter_arg(filter)?;
        Ok(self.query.stats(expr.as_ref(), None).await?)
    }

    pub async fn get_enhanced_stats(
        &self,
        filter: Option<&str>,
        time_range: TimeRange,
        buckets: Option<usize>,
    ) -> CommandResult<EnhancedStats> {
        let expr = self.parse_filter_arg(filter)?;
        Ok(self
            .query
            .enhanced_stats(expr.as_ref(), &time_range, buckets.unwrap_or(24))
            .await?)
    }

    // --- filter verbs ---

    pub fn parse_filter(&self, expression: &str) -> ParseFilterReply {
        match parse(expression) {
            Ok(expr) => ParseFilterReply {
                valid: true,
                error: None,
                canonical: expr.as_ref().map(|e| e.to_string()),
                expr,
            },
            Err(error) => ParseFilterReply {
                valid: false,
                error: Some(error),
                expr: None,
                canonical: None,
            },
        }
    }

    pub fn autocomplete_filter(&self, buffer: &str, cursor: usize) -> Vec<Completion> {
        complete(buffer, cursor)
    }

    pub fn highlight_filter(&self, expression: &str) -> Vec<HighlightSpan> {
        highlight(expression)
    }

    // --- mutation verbs ---

    async fn mutate_annotations(
        &self,
        id: &str,
        mutate: impl FnOnce(&mut Annotations),
    ) -> CommandResult<Flow> {
        if let Some(shared) = self.query.memory().get(id) {
            let snapshot = {
                let mut flow = shared.write().expect("flow lock poisoned");
                mutate(&mut flow.annotations);
                flow.clone()
            };
            if snapshot.is_terminal() {
                self.query
                    .files()
                    .enqueue_annotation_update(snapshot.clone());
            }
            return Ok(snapshot);
        }
        match self.query.files().get(id).await? {
            Some(mut flow) => {
                mutate(&mut flow.annotations);
                self.query.files().enqueue_annotation_update(flow.clone());
                Ok(flow)
            }
            None => Err(CommandError::not_found(id)),
        }
    }

    pub async fn update_flow_annotations(
        &self,
        id: &str,
        annotations: Annotations,
    ) -> CommandResult<()> {
        self.mutate_annotations(id, |a| *a = annotations).await?;
        Ok(())
    }

    /// Returns the new starred value.
    pub async fn toggle_flow_star(&self, id: &str) -> CommandResult<bool> {
        let flow = self.mutate_annotations(id, |a| a.starred = !a.starred).await?;
        Ok(flow.annotations.starred)
    }

    pub async fn diff_flows(
        &self,
        left_id: &str,
        right_id: &str,
        config: DiffConfig,
    ) -> CommandResult<FlowDiffResult> {
        let left = self
            .query
            .get(left_id)
            .await?
            .ok_or_else(|| CommandError::not_found(left_id))?;
        let right = self
            .query
            .get(right_id)
            .await?
            .ok_or_else(|| CommandError::not_found(right_id))?;
        Ok(diff_flows(&left, &right, &config))
    }

    // --- replay verbs ---

    pub async fn replay_flow(
        &self,
        id: &str,
        config: ReplayConfig,
    ) -> CommandResult<ReplayResult> {
        let handler = self
            .replay_handler
            .as_ref()
            .ok_or_else(|| CommandError::unsupported("replay"))?;
        let flow = self
            .query
            .get(id)
            .await?
            .ok_or_else(|| CommandError::not_found(id))?;
        Ok(handler.replay(&flow, &config).await)
    }

    pub async fn replay_flows_batch(
        &self,
        ids: &[String],
        config: ReplayConfig,
    ) -> CommandResult<BatchReplayResult> {
        let mut results = Vec::with_capacity(ids.len());
        for id in ids {
            let result = match self.replay_flow(id, config.clone()).await {
                Ok(result) => result,
                Err(e) if e.kind == "unsupported" => return Err(e),
                Err(e) => ReplayResult {
                    source_flow_id: id.clone(),
                    new_flow_id: None,
                    success: false,
                    error: Some(e.to_string()),
                },
            };
            results.push(result);
        }
        let success = results.iter().filter(|r| r.success).count();
        Ok(BatchReplayResult {
            total: results.len(),
            success,
            failed: results.len() - success,
            results,
        })
    }

    // --- export verbs ---

    async fn gather(&self, args: &ExportArgs) -> CommandResult<(Vec<Flow>, Vec<String>)> {
        let mut flows = Vec::new();
        let mut errors = Vec::new();
        if let Some(ids) = &args.ids {
            for id in ids {
                match self.query.get(id).await? {
                    Some(flow) => flows.push(flow),
                    None => errors.push(format!("flow {id} not found")),
                }
            }
        } else {
            let expr = self.parse_filter_arg(args.filter.as_deref())?;
            flows = self.query.query_all(expr.as_ref(), None, None).await?;
        }
        Ok((flows, errors))
    }

    pub async fn export_flows(&self, args: ExportArgs) -> CommandResult<ExportReply> {
        let format = ExportFormat::parse(&args.format)
            .ok_or_else(|| CommandError::invalid(format!("unknown format '{}'", args.format)))?;
        let (flows, errors) = self.gather(&args).await?;

        let redactor = if args.redact && !self.config.redaction_rules.is_empty() {
            Some(Redactor::new(&self.config.redaction_rules)?)
        } else {
            None
        };
        let export_data = export_flows(&flows, format, redactor.as_ref())?;

        Ok(ExportReply {
            total: flows.len() + errors.len(),
            success: flows.len(),
            failed: errors.len(),
            export_data: Some(export_data),
        })
    }

    // --- batch verbs ---

    async fn batch_annotate(
        &self,
        ids: &[String],
        mutate: impl Fn(&mut Annotations) + Copy,
    ) -> BatchReply {
        let mut errors = Vec::new();
        for id in ids {
            if let Err(e) = self.mutate_annotations(id, mutate).await {
                errors.push(format!("{id}: {e}"));
            }
        }
        BatchReply::from_errors(ids.len(), errors)
    }

    pub async fn batch_star(&self, ids: &[String]) -> BatchReply {
        self.batch_annotate(ids, |a| a.starred = true).await
    }

    pub async fn batch_unstar(&self, ids: &[String]) -> BatchReply {
        self.batch_annotate(ids, |a| a.starred = false).await
    }

    pub async fn batch_add_tags(&self, ids: &[String], tags: &[String]) -> BatchReply {
        let mut errors = Vec::new();
        for id in ids {
            let result = self
                .mutate_annotations(id, |a| {
                    a.tags.extend(tags.iter().cloned());
                })
                .await;
            if let Err(e) = result {
                errors.push(format!("{id}: {e}"));
            }
        }
        BatchReply::from_errors(ids.len(), errors)
    }

    pub async fn batch_remove_tags(&self, ids: &[String], tags: &[String]) -> BatchReply {
        let mut errors = Vec::new();
        for id in ids {
            let result = self
                .mutate_annotations(id, |a| {
                    for tag in tags {
                        a.tags.remove(tag);
                    }
                })
                .await;
            if let Err(e) = result {
                errors.push(format!("{id}: {e}"));
            }
        }
        BatchReply::from_errors(ids.len(), errors)
    }

    /// Purge from both tiers. The id is never reused.
    pub async fn batch_delete(&self, ids: &[String]) -> BatchReply {
        let mut errors = Vec::new();
        for id in ids {
            let in_memory = self.query.memory().remove(id).is_some();
            let on_disk = match self.query.files().delete(id).await {
                Ok(deleted) => deleted,
                Err(e) => {
                    errors.push(format!("{id}: {e}"));
                    continue;
                }
            };
            if !in_memory && !on_disk {
                errors.push(format!("{id}: not found"));
                continue;
            }
            self.capture.forget_flow(id);
        }
        BatchReply::from_errors(ids.len(), errors)
    }

    pub async fn batch_export(&self, ids: Vec<String>, format: &str) -> CommandResult<ExportReply> {
        self.export_flows(ExportArgs {
            ids: Some(ids),
            filter: None,
            format: format.to_string(),
            redact: false,
        })
        .await
    }

    pub async fn batch_add_to_session(
        &self,
        session_id: &str,
        ids: &[String],
    ) -> CommandResult<BatchReply> {
        self.entities.add_flows_to_session(session_id, ids).await?;
        Ok(BatchReply::from_errors(ids.len(), Vec::new()))
    }

    // --- event channel ---

    /// The shell drains this subscription and forwards each event on its
    /// `flow-event` channel.
    pub fn subscribe_flow_events(&self) -> Subscription {
        self.bus.subscribe()
    }

    pub fn unsubscribe_flow_events(&self, id: SubscriberId) {
        self.bus.unsubscribe(id);
    }

    // --- sessions ---

    pub async fn list_sessions(&self, include_archived: bool) -> CommandResult<Vec<Session>> {
        Ok(self.entities.list_sessions(include_archived).await?)
    }

    pub async fn create_session(
        &self,
        name: &str,
        description: Option<String>,
    ) -> CommandResult<Session> {
        let mut session = Session::new(name);
        session.description = description;
        self.entities.save_session(&session).await?;
        Ok(session)
    }

    pub async fn update_session(&self, session: Session) -> CommandResult<()> {
        Ok(self.entities.save_session(&session).await?)
    }

    pub async fn delete_session(&self, id: &str) -> CommandResult<bool> {
        Ok(self.entities.delete_session(id).await?)
    }

    pub async fn set_session_archived(&self, id: &str, archived: bool) -> CommandResult<()> {
        Ok(self.entities.set_session_archived(id, archived).await?)
    }

    /// Session plus its hydrated flows, as a JSON blob for saving.
    pub async fn export_session(&self, id: &str) -> CommandResult<String> {
        let session = self
            .entities
            .get_session(id)
            .await?
            .ok_or_else(|| CommandError::new("not_found", format!("session {id} not found")))?;
        let mut flows = Vec::new();
        for flow_id in &session.flow_ids {
            if let Some(flow) = self.query.get(flow_id).await? {
                flows.push(flow);
            }
        }
        Ok(serde_json::to_string_pretty(&serde_json::json!({
            "session": session,
            "flows": flows,
        }))
        .map_err(Error::from)?)
    }

    // --- quick filters ---

    pub async fn list_quick_filters(&self) -> CommandResult<Vec<QuickFilter>> {
        Ok(self.entities.list_quick_filters().await?)
    }

    pub async fn save_quick_filter(&self, filter: QuickFilter) -> CommandResult<QuickFilter> {
        // Saved expressions must parse
        parse(&filter.expression)
            .map_err(|e| CommandError::new("invalid_filter", e.to_string()))?;
        self.entities.save_quick_filter(&filter).await?;
        Ok(filter)
    }

    pub async fn delete_quick_filter(&self, id: &str) -> CommandResult<bool> {
        Ok(self.entities.delete_quick_filter(id).await?)
    }

    pub async fn import_quick_filters(&self, filters: Vec<QuickFilter>) -> CommandResult<usize> {
        for filter in &filters {
            parse(&filter.expression)
                .map_err(|e| CommandError::new("invalid_filter", format!("{}: {e}", filter.name)))?;
        }
        Ok(self.entities.import_quick_filters(&filters).await?)
    }

    pub async fn export_quick_filters(&self) -> CommandResult<String> {
        let filters = self.entities.list_quick_filters().await?;
        Ok(serde_json::to_string_pretty(&filters).map_err(Error::from)?)
    }

    // --- bookmarks ---

    pub async fn list_bookmarks(&self) -> CommandResult<Vec<Bookmark>> {
        Ok(self.entities.list_bookmarks().await?)
    }

    pub async fn create_bookmark(
        &self,
        flow_id: &str,
        note: Option<String>,
    ) -> CommandResult<Bookmark> {
        if self.query.get(flow_id).await?.is_none() {
            return Err(CommandError::not_found(flow_id));
        }
        let mut bookmark = Bookmark::new(flow_id.to_string());
        bookmark.note = note;
        self.entities.save_bookmark(&bookmark).await?;
        Ok(bookmark)
    }

    pub async fn delete_bookmark(&self, id: &str) -> CommandResult<bool> {
        Ok(self.entities.delete_bookmark(id).await?)
    }

    // --- notification config ---

    pub async fn get_notification_config(&self) -> CommandResult<NotificationConfig> {
        Ok(self.entities.notification_config().await?)
    }

    pub async fn update_notification_config(
        &self,
        config: NotificationConfig,
    ) -> CommandResult<()> {
        Ok(self.entities.update_notification_config(&config).await?)
    }

    // --- JSON dispatch ---

    /// Adapt a JSON verb call onto the typed methods. Unknown verbs and
    /// malformed arguments fail structurally, never panic.
    pub async fn dispatch(&self, verb: &str, args: Value) -> CommandResult<Value> {
        fn decode<T: serde::de::DeserializeOwned>(args: Value) -> CommandResult<T> {
            serde_json::from_value(args).map_err(|e| CommandError::invalid(e.to_string()))
        }
        fn encode<T: Serialize>(value: T) -> CommandResult<Value> {
            serde_json::to_value(value).map_err(|e| CommandError::new("encode_failed", e.to_string()))
        }

        #[derive(Deserialize)]
        struct IdArg {
            id: String,
        }
        #[derive(Deserialize)]
        struct IdsArg {
            ids: Vec<String>,
        }
        #[derive(Deserialize)]
        struct TagsArg {
            ids: Vec<String>,
            tags: Vec<String>,
        }

        match verb {
            "query_flows" => encode(self.query_flows(decode(args)?).await?),
            "get_flow_detail" => {
                let IdArg { id } = decode(args)?;
                encode(self.get_flow_detail(&id).await?)
            }
            "search_flows" => {
                #[derive(Deserialize)]
                struct Args {
                    query: String,
                    #[serde(default = "default_limit")]
                    limit: usize,
                }
                fn default_limit() -> usize {
                    50
                }
                let Args { query, limit } = decode(args)?;
                encode(self.search_flows(&query, limit).await?)
            }
            "get_flow_stats" => {
                #[derive(Default, Deserialize)]
                #[serde(default)]
                struct Args {
                    filter: Option<String>,
                }
                let Args { filter } = decode(args)?;
                encode(self.get_flow_stats(filter.as_deref()).await?)
            }
            "get_enhanced_stats" => {
                #[derive(Deserialize)]
                struct Args {
                    #[serde(default)]
                    filter: Option<String>,
                    time_range: TimeRange,
                    #[serde(default)]
                    buckets: Option<usize>,
                }
                let Args {
                    filter,
                    time_range,
                    buckets,
                } = decode(args)?;
                encode(
                    self.get_enhanced_stats(filter.as_deref(), time_range, buckets)
                        .await?,
                )
            }
            "parse_filter" => {
                #[derive(Deserialize)]
                struct Args {
                    expression: String,
                }
                let Args { expression } = decode(args)?;
                encode(self.parse_filter(&expression))
            }
            "autocomplete_filter" => {
                #[derive(Deserialize)]
                struct Args {
                    buffer: String,
                    #[serde(default)]
                    cursor: Option<usize>,
                }
                let Args { buffer, cursor } = decode(args)?;
                let cursor = cursor.unwrap_or(buffer.len());
                encode(self.autocomplete_filter(&buffer, cursor))
            }
            "highlight_filter" => {
                #[derive(Deserialize)]
                struct Args {
                    expression: String,
                }
                let Args { expression } = decode(args)?;
                encode(self.highlight_filter(&expression))
            }
            "export_flows" => encode(self.export_flows(decode(args)?).await?),
            "update_flow_annotations" => {
                #[derive(Deserialize)]
                struct Args {
                    id: String,
                    annotations: Annotations,
                }
                let Args { id, annotations } = decode(args)?;
                self.update_flow_annotations(&id, annotations).await?;
                encode(true)
            }
            "toggle_flow_star" => {
                let IdArg { id } = decode(args)?;
                encode(self.toggle_flow_star(&id).await?)
            }
            "replay_flow" => {
                #[derive(Deserialize)]
                struct Args {
                    id: String,
                    #[serde(default)]
                    config: ReplayConfig,
                }
                let Args { id, config } = decode(args)?;
                encode(self.replay_flow(&id, config).await?)
            }
            "replay_flows_batch" => {
                #[derive(Deserialize)]
                struct Args {
                    ids: Vec<String>,
                    #[serde(default)]
                    config: ReplayConfig,
                }
                let Args { ids, config } = decode(args)?;
                encode(self.replay_flows_batch(&ids, config).await?)
            }
            "diff_flows" => {
                #[derive(Deserialize)]
                struct Args {
                    left_id: String,
                    right_id: String,
                    #[serde(default)]
                    config: DiffConfig,
                }
                let Args {
                    left_id,
                    right_id,
                    config,
                } = decode(args)?;
                encode(self.diff_flows(&left_id, &right_id, config).await?)
            }
            "batch_star" => {
                let IdsArg { ids } = decode(args)?;
                encode(self.batch_star(&ids).await)
            }
            "batch_unstar" => {
                let IdsArg { ids } = decode(args)?;
                encode(self.batch_unstar(&ids).await)
            }
            "batch_add_tags" => {
                let TagsArg { ids, tags } = decode(args)?;
                encode(self.batch_add_tags(&ids, &tags).await)
            }
            "batch_remove_tags" => {
                let TagsArg { ids, tags } = decode(args)?;
                encode(self.batch_remove_tags(&ids, &tags).await)
            }
            "batch_delete" => {
                let IdsArg { ids } = decode(args)?;
                encode(self.batch_delete(&ids).await)
            }
            "batch_export" => {
                #[derive(Deserialize)]
                struct Args {
                    ids: Vec<String>,
                    format: String,
                }
                let Args { ids, format } = decode(args)?;
                encode(self.batch_export(ids, &format).await?)
            }
            "batch_add_to_session" => {
                #[derive(Deserialize)]
                struct Args {
                    session_id: String,
                    ids: Vec<String>,
                }
                let Args { session_id, ids } = decode(args)?;
                encode(self.batch_add_to_session(&session_id, &ids).await?)
            }
            "list_sessions" => {
                #[derive(Default, Deserialize)]
                #[serde(default)]
                struct Args {
                    include_archived: bool,
                }
                let Args { include_archived } = decode(args)?;
                encode(self.list_sessions(include_archived).await?)
            }
            "create_session" => {
                #[derive(Deserialize)]
                struct Args {
                    name: String,
                    #[serde(default)]
                    description: Option<String>,
                }
                let Args { name, description } = decode(args)?;
                encode(self.create_session(&name, description).await?)
            }
            "update_session" => {
                let session: Session = decode(args)?;
                self.update_session(session).await?;
                encode(true)
            }
            "delete_session" => {
                let IdArg { id } = decode(args)?;
                encode(self.delete_session(&id).await?)
            }
            "archive_session" => {
                let IdArg { id } = decode(args)?;
                self.set_session_archived(&id, true).await?;
                encode(true)
            }
            "unarchive_session" => {
                let IdArg { id } = decode(args)?;
                self.set_session_archived(&id, false).await?;
                encode(true)
            }
            "export_session" => {
                let IdArg { id } = decode(args)?;
                encode(self.export_session(&id).await?)
            }
            "list_quick_filters" => encode(self.list_quick_filters().await?),
            "save_quick_filter" | "update_quick_filter" => {
                let filter: QuickFilter = decode(args)?;
                encode(self.save_quick_filter(filter).await?)
            }
            "delete_quick_filter" => {
                let IdArg { id } = decode(args)?;
                encode(self.delete_quick_filter(&id).await?)
            }
            "import_quick_filters" => {
                #[derive(Deserialize)]
                struct Args {
                    filters: Vec<QuickFilter>,
                }
                let Args { filters } = decode(args)?;
                encode(self.import_quick_filters(filters).await?)
            }
            "export_quick_filters" => encode(self.export_quick_filters().await?),
            "list_bookmarks" => encode(self.list_bookmarks().await?),
            "create_bookmark" => {
                #[derive(Deserialize)]
                struct Args {
                    flow_id: String,
                    #[serde(default)]
                    note: Option<String>,
                }
                let Args { flow_id, note } = decode(args)?;
                encode(self.create_bookmark(&flow_id, note).await?)
            }
            "delete_bookmark" => {
                let IdArg { id } = decode(args)?;
                encode(self.delete_bookmark(&id).await?)
            }
            "get_notification_config" => encode(self.get_notification_config().await?),
            "update_notification_config" => {
                let config: NotificationConfig = decode(args)?;
                self.update_notification_config(config).await?;
                encode(true)
            }
            other => Err(CommandError::new(
                "unknown_verb",
                format!("unknown command '{other}'"),
            )),
        }
    }
}
