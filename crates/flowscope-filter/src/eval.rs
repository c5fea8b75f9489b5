//! Filter evaluation against a Flow
//!
//! Boolean operators short-circuit. A predicate over data the Flow does not
//! have (tokens before a response, latency before terminal) is false, never
//! an error.

use crate::ast::{FilterExpr, Predicate};
use flowscope_core::flow::Flow;

pub fn evaluate(expr: &FilterExpr, flow: &Flow) -> bool {
    match expr {
        FilterExpr::Or { left, right } => evaluate(left, flow) || evaluate(right, flow),
        FilterExpr::And { left, right } => evaluate(left, flow) && evaluate(right, flow),
        FilterExpr::Not { inner } => !evaluate(inner, flow),
        FilterExpr::Predicate { predicate } => evaluate_predicate(predicate, flow),
    }
}

fn evaluate_predicate(predicate: &Predicate, flow: &Flow) -> bool {
    match predicate {
        Predicate::Model { pattern } => model_matches(pattern, &flow.request.model),
        Predicate::Provider { name } => flow.metadata.provider.eq_ignore_ascii_case(name),
        Predicate::State { state } => flow.state == *state,
        Predicate::HasError => flow.has_error(),
        Predicate::HasToolCalls => flow.has_tool_calls(),
        Predicate::HasThinking => flow.has_thinking(),
        Predicate::Starred => flow.annotations.starred,
        Predicate::Tag { tag } => flow.annotations.tags.contains(tag),
        Predicate::Body { needle } => {
            contains_ci(&flow.request_text(), needle)
                || flow
                    .response
                    .as_ref()
                    .is_some_and(|r| contains_ci(&r.content, needle))
        }
        Predicate::RequestBody { needle } => contains_ci(&flow.request_text(), needle),
        Predicate::ResponseBody { needle } => flow
            .response
            .as_ref()
            .is_some_and(|r| contains_ci(&r.content, needle)),
        Predicate::Tokens { cmp, value } => flow
            .total_tokens()
            .is_some_and(|total| cmp.compare(total as u64, *value)),
        Predicate::Latency { cmp, value } => flow
            .timestamps
            .duration_ms
            .is_some_and(|duration| cmp.compare(duration, *value)),
    }
}

fn contains_ci(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(&needle.to_lowercase())
}

/// `*`-wildcard model match: whole-string glob when a wildcard is present,
/// case-insensitive substring otherwise.
pub fn model_matches(pattern: &str, model: &str) -> bool {
    let pattern = pattern.to_lowercase();
    let model = model.to_lowercase();
    if !pattern.contains('*') {
        return model.contains(&pattern);
    }
    glob_match(pattern.as_bytes(), model.as_bytes())
}

fn glob_match(pattern: &[u8], text: &[u8]) -> bool {
    // Iterative two-pointer match with '*' backtracking
    let (mut p, mut t) = (0usize, 0usize);
    let mut star: Option<(usize, usize)> = None;
    while t < text.len() {
        if p < pattern.len() && (pattern[p] == text[t]) {
            p += 1;
            t += 1;
        } else if p < pattern.len() && pattern[p] == b'*' {
            star = Some((p, t));
            p += 1;
        } else if let Some((star_p, star_t)) = star {
            p = star_p + 1;
            t = star_t + 1;
            star = Some((star_p, star_t + 1));
        } else {
            return false;
        }
    }
    while p < pattern.len() && pattern[p] == b'*' {
        p += 1;
    }
    p == pattern.len()
}
