//! Query, stats, diff, and export over the two storage tiers
//!
//! - [`service`]: paged queries, point gets, full-text search
//! - [`stats`]: aggregates, trend series, histograms
//! - [`diff`]: structural comparison of two Flows
//! - [`export`]: JSON / JSONL / HAR / Markdown / CSV emitters
//! - [`redaction`]: export-time redaction rules and header masking

pub mod diff;
pub mod export;
pub mod redaction;
pub mod service;
pub mod stats;

pub use diff::{diff_flows, DiffConfig, DiffItem, DiffKind, FlowDiffResult, TokenDiff};
pub use export::{export_flows, ExportFormat};
pub use redaction::{mask_sensitive_headers, Redactor};
pub use service::{
    QueryPage, QueryParams, QueryParamsBuilder, QueryService, SortBy, MAX_PAGE_SIZE,
};
