//! Sargable predicate extraction
//!
//! Walks the top-level `&` spine of a parsed expression and lifts out the
//! predicates the index can filter on directly, cutting hydration cost.
//! Extraction is conservative: the result must be implied by the full
//! expression, which is still evaluated post-hydration.

use crate::ast::{Comparator, FilterExpr, Predicate};
use flowscope_core::flow::FlowState;

/// Index-friendly view of a filter. Ranges are inclusive.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SargablePredicates {
    pub provider: Option<String>,
    /// SQL LIKE patterns, any-of.
    pub model_like_any: Vec<String>,
    pub states: Vec<FlowState>,
    pub has_error: Option<bool>,
    pub has_tool_calls: Option<bool>,
    pub has_thinking: Option<bool>,
    pub starred: Option<bool>,
    pub tags: Vec<String>,
    pub min_total_tokens: Option<u64>,
    pub max_total_tokens: Option<u64>,
    pub min_duration_ms: Option<u64>,
    pub max_duration_ms: Option<u64>,
}

impl SargablePredicates {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

pub fn extract(expr: &FilterExpr) -> SargablePredicates {
    let mut out = SargablePredicates::default();
    for term in and_spine(expr) {
        extract_term(term, &mut out);
    }
    out
}

/// Flatten nested ANDs into their conjunct list.
fn and_spine(expr: &FilterExpr) -> Vec<&FilterExpr> {
    match expr {
        FilterExpr::And { left, right } => {
            let mut terms = and_spine(left);
            terms.extend(and_spine(right));
            terms
        }
        other => vec![other],
    }
}

fn extract_term(term: &FilterExpr, out: &mut SargablePredicates) {
    match term {
        FilterExpr::Predicate { predicate } => extract_predicate(predicate, false, out),
        FilterExpr::Not { inner } => {
            if let FilterExpr::Predicate { predicate } = inner.as_ref() {
                extract_predicate(predicate, true, out);
            }
        }
        FilterExpr::Or { .. } => {
            // An OR group is sargable only when every branch tests the same
            // indexed column.
            let branches = or_spine(term);
            if let Some(patterns) = all_model_patterns(&branches) {
                out.model_like_any.extend(patterns);
            } else if let Some(states) = all_states(&branches) {
                out.states.extend(states);
            }
        }
        FilterExpr::And { .. } => unreachable!("flattened by and_spine"),
    }
}

fn or_spine(expr: &FilterExpr) -> Vec<&FilterExpr> {
    match expr {
        FilterExpr::Or { left, right } => {
            let mut branches = or_spine(left);
            branches.extend(or_spine(right));
            branches
        }
        other => vec![other],
    }
}

fn all_model_patterns(branches: &[&FilterExpr]) -> Option<Vec<String>> {
    branches
        .iter()
        .map(|branch| match branch {
            FilterExpr::Predicate {
                predicate: Predicate::Model { pattern },
            } => Some(model_like_pattern(pattern)),
            _ => None,
        })
        .collect()
}

fn all_states(branches: &[&FilterExpr]) -> Option<Vec<FlowState>> {
    branches
        .iter()
        .map(|branch| match branch {
            FilterExpr::Predicate {
                predicate: Predicate::State { state },
            } => Some(*state),
            _ => None,
        })
        .collect()
}

/// Translate the `*`-wildcard model pattern into SQL LIKE: wildcards map to
/// `%`; a bare substring gets fenced with `%`.
pub fn model_like_pattern(pattern: &str) -> String {
    let escaped = pattern.replace('%', "").replace('_', "");
    if escaped.contains('*') {
        escaped.replace('*', "%")
    } else {
        format!("%{escaped}%")
    }
}

fn extract_predicate(predicate: &Predicate, negated: bool, out: &mut SargablePredicates) {
    match (predicate, negated) {
        (Predicate::Provider { name }, false) => out.provider = Some(name.clone()),
        (Predicate::Model { pattern }, false) => {
            out.model_like_any.push(model_like_pattern(pattern));
        }
        (Predicate::State { state }, false) => out.states.push(*state),
        (Predicate::HasError, negated) => out.has_error = Some(!negated),
        (Predicate::HasToolCalls, negated) => out.has_tool_calls = Some(!negated),
        (Predicate::HasThinking, negated) => out.has_thinking = Some(!negated),
        (Predicate::Starred, negated) => out.starred = Some(!negated),
        (Predicate::Tag { tag }, false) => out.tags.push(tag.clone()),
        (Predicate::Tokens { cmp, value }, false) => {
            apply_range(*cmp, *value, &mut out.min_total_tokens, &mut out.max_total_tokens);
        }
        (Predicate::Latency { cmp, value }, false) => {
            apply_range(*cmp, *value, &mut out.min_duration_ms, &mut out.max_duration_ms);
        }
        // Negated args and body predicates stay post-hydration
        _ => {}
    }
}

fn apply_range(cmp: Comparator, value: u64, min: &mut Option<u64>, max: &mut Option<u64>) {
    match cmp {
        Comparator::Gt => tighten_min(min, value.saturating_add(1)),
        Comparator::Ge => tighten_min(min, value),
        Comparator::Lt => tighten_max(max, value.saturating_sub(1)),
        Comparator::Le => tighten_max(max, value),
        Comparator::Eq => {
            tighten_min(min, value);
            tighten_max(max, value);
        }
    }
}

fn tighten_min(min: &mut Option<u64>, value: u64) {
    *min = Some(min.map_or(value, |current| current.max(value)));
}

fn tighten_max(max: &mut Option<u64>, value: u64) {
    *max = Some(max.map_or(value, |current| current.min(value)));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse;

    fn extract_from(input: &str) -> SargablePredicates {
        extract(&parse(input).unwrap().unwrap())
    }

    #[test]
    fn reference_expression_extracts_fully() {
        let sargable = extract_from("~p kiro & (~m claude* | ~m gpt*) & ~tokens > 1000 & !~e");
        assert_eq!(sargable.provider.as_deref(), Some("kiro"));
        assert_eq!(
            sargable.model_like_any,
            vec!["claude%".to_string(), "gpt%".to_string()]
        );
        assert_eq!(sargable.min_total_tokens, Some(1001));
        assert_eq!(sargable.has_error, Some(false));
    }

    #[test]
    fn plain_model_is_fenced_substring() {
        let sargable = extract_from("~m sonnet");
        assert_eq!(sargable.model_like_any, vec!["%sonnet%".to_string()]);
    }

    #[test]
    fn mixed_or_group_is_not_extracted() {
        let sargable = extract_from("~p openai & (~m gpt* | ~e)");
        assert_eq!(sargable.provider.as_deref(), Some("openai"));
        assert!(sargable.model_like_any.is_empty());
        assert!(sargable.has_error.is_none());
    }

    #[test]
    fn state_or_group_extracts() {
        let sargable = extract_from("~s failed | ~s cancelled");
        assert_eq!(
            sargable.states,
            vec![
                flowscope_core::flow::FlowState::Failed,
                flowscope_core::flow::FlowState::Cancelled
            ]
        );
    }

    #[test]
    fn ranges_tighten() {
        let sargable = extract_from("~tokens >= 100 & ~tokens <= 500 & ~tokens > 150");
        assert_eq!(sargable.min_total_tokens, Some(151));
        assert_eq!(sargable.max_total_tokens, Some(500));
    }

    #[test]
    fn equals_pins_both_bounds() {
        let sargable = extract_from("~latency = 2000");
        assert_eq!(sargable.min_duration_ms, Some(2000));
        assert_eq!(sargable.max_duration_ms, Some(2000));
    }

    #[test]
    fn top_level_or_extracts_nothing_unsafe() {
        // `~p a | ~tokens > 5` cannot be pushed down as a conjunction
        let sargable = extract_from("~p kiro | ~tokens > 5");
        assert!(sargable.provider.is_none());
        assert!(sargable.min_total_tokens.is_none());
    }

    #[test]
    fn body_predicates_stay_post_hydration() {
        let sargable = extract_from("~b hello & ~bq request");
        assert!(sargable.is_empty());
    }
}
