//! Filter syntax highlighting
//!
//! Re-lexes the buffer into classed spans for the UI. Unlexable input
//! produces one error span from the failure point to the end of the
//! buffer, matching the parser's red underline.

use crate::token::{lex, TokenKind};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SpanKind {
    Filter,
    Operator,
    Value,
    String,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HighlightSpan {
    pub start: usize,
    pub end: usize,
    pub kind: SpanKind,
}

pub fn highlight(input: &str) -> Vec<HighlightSpan> {
    match lex(input) {
        Ok(tokens) => tokens
            .into_iter()
            .map(|token| HighlightSpan {
                start: token.start,
                end: token.end,
                kind: match token.kind {
                    TokenKind::Filter(_) => SpanKind::Filter,
                    TokenKind::Bare(_) => SpanKind::Value,
                    TokenKind::Quoted(_) => SpanKind::String,
                    TokenKind::Amp
                    | TokenKind::Pipe
                    | TokenKind::Bang
                    | TokenKind::LParen
                    | TokenKind::RParen
                    | TokenKind::Cmp(_) => SpanKind::Operator,
                },
            })
            .collect(),
        Err(error) => {
            let mut spans = highlight(&input[..error.position]);
            spans.push(HighlightSpan {
                start: error.position,
                end: input.len(),
                kind: SpanKind::Error,
            });
            spans
        }
    }
}
