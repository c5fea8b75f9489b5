//! Error types for the flowscope core

use crate::flow::FlowState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Classification of failures recorded on a Flow or counted by the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Transport failure talking to the upstream provider
    Network,
    /// Upstream timed out (the proxy owns the timeout)
    Timeout,
    /// 401/403 from upstream
    Authentication,
    /// 429 from upstream
    RateLimit,
    /// Upstream moderation refused the content
    ContentFilter,
    /// 5xx from upstream
    ServerError,
    /// 4xx other than authentication/rate-limit
    BadRequest,
    /// Upstream refused the requested model
    ModelUnavailable,
    /// Local body cap exceeded while reassembling
    TokenLimitExceeded,
    /// A stream chunk could not be decoded (counted, not fatal)
    ParseError,
    /// Startup replay found the index out of step with a shard
    IndexCorrupt,
    /// FileStore write queue overflowed and a flow was dropped
    WriteDropped,
    /// A command-surface call failed
    CommandFailed,
}

impl ErrorKind {
    /// Classify an upstream HTTP status code.
    pub fn from_status(status: u16) -> Self {
        match status {
            401 | 403 => Self::Authentication,
            429 => Self::RateLimit,
            404 => Self::ModelUnavailable,
            400..=499 => Self::BadRequest,
            500..=599 => Self::ServerError,
            _ => Self::Network,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Timeout => "timeout",
            Self::Authentication => "authentication",
            Self::RateLimit => "rate_limit",
            Self::ContentFilter => "content_filter",
            Self::ServerError => "server_error",
            Self::BadRequest => "bad_request",
            Self::ModelUnavailable => "model_unavailable",
            Self::TokenLimitExceeded => "token_limit_exceeded",
            Self::ParseError => "parse_error",
            Self::IndexCorrupt => "index_corrupt",
            Self::WriteDropped => "write_dropped",
            Self::CommandFailed => "command_failed",
        }
    }
}

/// Error block recorded on a failed Flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowError {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_body: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl FlowError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            status_code: None,
            raw_body: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status_code = Some(status);
        self
    }

    pub fn with_raw_body(mut self, body: impl Into<String>) -> Self {
        self.raw_body = Some(body.into());
        self
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Flow not found: {0}")]
    FlowNotFound(String),

    #[error("Illegal state transition: {from:?} -> {to:?}")]
    IllegalTransition { from: FlowState, to: FlowState },

    #[error("Invalid filter: {0}")]
    InvalidFilter(String),

    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Write queue closed")]
    QueueClosed,

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;
