//! Side entities persisted alongside Flows
//!
//! Thin CRUD only; the core stores these in the global index database and
//! never interprets them beyond their schema.

use crate::flow::FlowId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A user-curated grouping of Flows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub flow_ids: Vec<FlowId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub archived: bool,
}

impl Session {
    pub fn new(name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: crate::id::generate_flow_id(),
            name: name.into(),
            description: None,
            flow_ids: Vec::new(),
            created_at: now,
            updated_at: now,
            archived: false,
        }
    }
}

/// A saved filter expression shown in the quick-filter bar.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuickFilter {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub expression: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    #[serde(default)]
    pub display_order: i64,
    #[serde(default)]
    pub preset: bool,
    pub created_at: DateTime<Utc>,
}

impl QuickFilter {
    pub fn new(name: impl Into<String>, expression: impl Into<String>) -> Self {
        Self {
            id: crate::id::generate_flow_id(),
            name: name.into(),
            description: None,
            expression: expression.into(),
            group: None,
            display_order: 0,
            preset: false,
            created_at: Utc::now(),
        }
    }

    /// Seeded defaults, marked preset so the UI keeps them apart from
    /// user-saved filters.
    pub fn presets() -> Vec<Self> {
        let make = |order: i64, name: &str, expression: &str| {
            let mut filter = Self::new(name, expression);
            filter.preset = true;
            filter.display_order = order;
            filter.group = Some("presets".to_string());
            filter
        };
        vec![
            make(0, "Errors", "~e"),
            make(1, "Starred", "~starred"),
            make(2, "Slow (>10s)", "~latency > 10000"),
            make(3, "Streaming", "~s streaming"),
            make(4, "Tool calls", "~t"),
        ]
    }
}

/// A pinned Flow with a note.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bookmark {
    pub id: String,
    pub flow_id: FlowId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Bookmark {
    pub fn new(flow_id: FlowId) -> Self {
        Self {
            id: crate::id::generate_flow_id(),
            flow_id,
            note: None,
            created_at: Utc::now(),
        }
    }
}

/// Per-kind notification toggles; the shell renders the actual
/// notification.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct NotificationToggle {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub desktop: bool,
    #[serde(default)]
    pub sound: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    pub flow_completed: NotificationToggle,
    pub flow_failed: NotificationToggle,
    pub threshold_warning: NotificationToggle,
    pub write_dropped: NotificationToggle,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sound_file: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presets_are_marked() {
        let presets = QuickFilter::presets();
        assert!(!presets.is_empty());
        assert!(presets.iter().all(|p| p.preset));
        assert!(presets.windows(2).all(|w| w[0].display_order < w[1].display_order));
    }

    #[test]
    fn session_roundtrips() {
        let mut session = Session::new("debugging");
        session.flow_ids.push("0123456789abcdef".to_string());
        let json = serde_json::to_string(&session).unwrap();
        let back: Session = serde_json::from_str(&json).unwrap();
        assert_eq!(back.flow_ids, session.flow_ids);
        assert!(!back.archived);
    }
}
