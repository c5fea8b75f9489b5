//! Filter autocomplete
//!
//! Suggests the next token from the text left of the cursor. Driven by the
//! class of the last non-whitespace token.

use crate::token::{lex, TokenKind};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionKind {
    Filter,
    Operator,
    Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Completion {
    pub text: String,
    pub description: String,
    pub kind: CompletionKind,
}

const FILTERS: &[(&str, &str)] = &[
    ("~m", "model matches (substring, * wildcard)"),
    ("~p", "provider equals"),
    ("~s", "state equals"),
    ("~e", "has error"),
    ("~t", "has tool calls"),
    ("~k", "has thinking"),
    ("~starred", "starred only"),
    ("~tag", "has tag"),
    ("~b", "content contains"),
    ("~bq", "request contains"),
    ("~bs", "response contains"),
    ("~tokens", "total tokens compare"),
    ("~latency", "duration (ms) compare"),
];

const STATES: &[&str] = &["pending", "streaming", "completed", "failed", "cancelled"];

const COMPARATORS: &[(&str, &str)] = &[
    (">", "greater than"),
    (">=", "at least"),
    ("<", "less than"),
    ("<=", "at most"),
    ("=", "exactly"),
];

fn filter_completions(prefix: &str) -> Vec<Completion> {
    FILTERS
        .iter()
        .filter(|(name, _)| name.starts_with(prefix))
        .map(|(name, description)| Completion {
            text: name.to_string(),
            description: description.to_string(),
            kind: CompletionKind::Filter,
        })
        .collect()
}

fn operator_completions() -> Vec<Completion> {
    [("&", "and"), ("|", "or"), ("!", "not")]
        .iter()
        .map(|(op, description)| Completion {
            text: op.to_string(),
            description: description.to_string(),
            kind: CompletionKind::Operator,
        })
        .collect()
}

pub fn complete(buffer: &str, cursor: usize) -> Vec<Completion> {
    let cursor = cursor.min(buffer.len());
    let prefix = &buffer[..cursor];

    // A lone '~' is a filter being started
    if prefix.trim_end().ends_with('~') {
        return filter_completions("~");
    }

    let Ok(tokens) = lex(prefix) else {
        return Vec::new();
    };

    let Some(last) = tokens.last() else {
        return filter_completions("~");
    };
    let at_token_end = last.end == prefix.len() && !prefix.ends_with(char::is_whitespace);

    match &last.kind {
        // Mid-word: narrow the filter list by the partial name
        TokenKind::Filter(name) if at_token_end => filter_completions(&format!("~{name}")),

        TokenKind::Filter(name) => match name.as_str() {
            "s" => STATES
                .iter()
                .map(|state| Completion {
                    text: (*state).to_string(),
                    description: format!("state is {state}"),
                    kind: CompletionKind::Value,
                })
                .collect(),
            "tokens" | "latency" => COMPARATORS
                .iter()
                .map(|(cmp, description)| Completion {
                    text: (*cmp).to_string(),
                    description: description.to_string(),
                    kind: CompletionKind::Operator,
                })
                .collect(),
            // Flag filters are complete terms; arg filters await free text
            "e" | "t" | "k" | "starred" => operator_completions(),
            _ => Vec::new(),
        },

        TokenKind::Bare(_) | TokenKind::Quoted(_) => operator_completions(),

        TokenKind::RParen => {
            let mut completions = operator_completions();
            completions.extend(filter_completions("~"));
            completions
        }

        TokenKind::Amp | TokenKind::Pipe | TokenKind::Bang | TokenKind::LParen => {
            filter_completions("~")
        }

        TokenKind::Cmp(_) => Vec::new(),
    }
}
