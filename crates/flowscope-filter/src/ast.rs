//! Filter expression AST
//!
//! `Display` produces the canonical form; formatting then re-parsing yields
//! an identical tree.

use flowscope_core::flow::FlowState;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparator {
    Gt,
    Ge,
    Lt,
    Le,
    Eq,
}

impl Comparator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Eq => "=",
        }
    }

    pub fn compare(&self, left: u64, right: u64) -> bool {
        match self {
            Self::Gt => left > right,
            Self::Ge => left >= right,
            Self::Lt => left < right,
            Self::Le => left <= right,
            Self::Eq => left == right,
        }
    }

    pub const ALL: &'static [Comparator] =
        &[Self::Gt, Self::Ge, Self::Lt, Self::Le, Self::Eq];
}

impl fmt::Display for Comparator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One leaf test against a Flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Predicate {
    /// `~m` — model substring, case-insensitive, `*` wildcard.
    Model { pattern: String },
    /// `~p` — provider, exact, case-insensitive.
    Provider { name: String },
    /// `~s` — state, exact.
    State { state: FlowState },
    /// `~e`
    HasError,
    /// `~t`
    HasToolCalls,
    /// `~k`
    HasThinking,
    /// `~starred`
    Starred,
    /// `~tag` — exact tag.
    Tag { tag: String },
    /// `~b` — substring over response content and all message text.
    Body { needle: String },
    /// `~bq` — request-only substring.
    RequestBody { needle: String },
    /// `~bs` — response-only substring.
    ResponseBody { needle: String },
    /// `~tokens CMP INT`
    Tokens { cmp: Comparator, value: u64 },
    /// `~latency CMP INT`
    Latency { cmp: Comparator, value: u64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum FilterExpr {
    Or {
        left: Box<FilterExpr>,
        right: Box<FilterExpr>,
    },
    And {
        left: Box<FilterExpr>,
        right: Box<FilterExpr>,
    },
    Not {
        inner: Box<FilterExpr>,
    },
    Predicate {
        #[serde(flatten)]
        predicate: Predicate,
    },
}

impl FilterExpr {
    pub fn and(left: FilterExpr, right: FilterExpr) -> Self {
        Self::And {
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn or(left: FilterExpr, right: FilterExpr) -> Self {
        Self::Or {
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn not(inner: FilterExpr) -> Self {
        Self::Not {
            inner: Box::new(inner),
        }
    }

    pub fn pred(predicate: Predicate) -> Self {
        Self::Predicate { predicate }
    }

    fn precedence(&self) -> u8 {
        match self {
            Self::Or { .. } => 1,
            Self::And { .. } => 2,
            Self::Not { .. } => 3,
            Self::Predicate { .. } => 4,
        }
    }

    fn fmt_child(
        child: &FilterExpr,
        parent_prec: u8,
        is_right: bool,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        // Trees are left-associative; a right child at the same precedence
        // needs parens to survive a round trip.
        let child_prec = child.precedence();
        let needs_parens =
            child_prec < parent_prec || (child_prec == parent_prec && is_right && child_prec < 3);
        if needs_parens {
            write!(f, "({child})")
        } else {
            write!(f, "{child}")
        }
    }
}

fn fmt_arg(f: &mut fmt::Formatter<'_>, arg: &str) -> fmt::Result {
    let bare_safe = !arg.is_empty()
        && arg
            .chars()
            .all(|c| !c.is_whitespace() && !matches!(c, '&' | '|' | '!' | '(' | ')' | '"' | '~' | '<' | '>' | '='));
    if bare_safe {
        f.write_str(arg)
    } else {
        write!(f, "\"{}\"", arg.replace('\\', "\\\\").replace('"', "\\\""))
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Model { pattern } => {
                f.write_str("~m ")?;
                fmt_arg(f, pattern)
            }
            Self::Provider { name } => {
                f.write_str("~p ")?;
                fmt_arg(f, name)
            }
            Self::State { state } => write!(f, "~s {}", state.as_str()),
            Self::HasError => f.write_str("~e"),
            Self::HasToolCalls => f.write_str("~t"),
            Self::HasThinking => f.write_str("~k"),
            Self::Starred => f.write_str("~starred"),
            Self::Tag { tag } => {
                f.write_str("~tag ")?;
                fmt_arg(f, tag)
            }
            Self::Body { needle } => {
                f.write_str("~b ")?;
                fmt_arg(f, needle)
            }
            Self::RequestBody { needle } => {
                f.write_str("~bq ")?;
                fmt_arg(f, needle)
            }
            Self::ResponseBody { needle } => {
                f.write_str("~bs ")?;
                fmt_arg(f, needle)
            }
            Self::Tokens { cmp, value } => write!(f, "~tokens {cmp} {value}"),
            Self::Latency { cmp, value } => write!(f, "~latency {cmp} {value}"),
        }
    }
}

impl fmt::Display for FilterExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Or { left, right } => {
                Self::fmt_child(left, 1, false, f)?;
                f.write_str(" | ")?;
                Self::fmt_child(right, 1, true, f)
            }
            Self::And { left, right } => {
                Self::fmt_child(left, 2, false, f)?;
                f.write_str(" & ")?;
                Self::fmt_child(right, 2, true, f)
            }
            Self::Not { inner } => {
                f.write_str("!")?;
                Self::fmt_child(inner, 3, false, f)
            }
            Self::Predicate { predicate } => predicate.fmt(f),
        }
    }
}
