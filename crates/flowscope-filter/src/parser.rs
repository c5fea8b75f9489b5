//! Recursive-descent filter parser
//!
//! Errors carry the byte position and the token class that was expected, so
//! the UI can underline the offending span directly. No panics, no
//! exception-style control flow.

use crate::ast::{Comparator, FilterExpr, Predicate};
use crate::token::{lex, Token, TokenKind};
use flowscope_core::flow::FlowState;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error, Serialize)]
#[error("{message} at position {position}")]
pub struct ParseError {
    pub position: usize,
    /// What the parser was looking for, for the UI's hint line.
    pub expected: String,
    pub message: String,
}

impl ParseError {
    fn new(position: usize, expected: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            position,
            expected: expected.into(),
            message: message.into(),
        }
    }
}

/// Parse a filter expression. Empty input is valid and means "match all";
/// it returns `None`.
pub fn parse(input: &str) -> Result<Option<FilterExpr>, ParseError> {
    let tokens = lex(input).map_err(|e| ParseError::new(e.position, "token", e.message))?;
    if tokens.is_empty() {
        return Ok(None);
    }
    let mut parser = Parser {
        tokens,
        pos: 0,
        input_len: input.len(),
    };
    let expr = parser.or_expr()?;
    if let Some(extra) = parser.peek() {
        return Err(ParseError::new(
            extra.start,
            "end of input",
            "unexpected trailing input",
        ));
    }
    Ok(Some(expr))
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    input_len: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn here(&self) -> usize {
        self.peek().map_or(self.input_len, |t| t.start)
    }

    fn or_expr(&mut self) -> Result<FilterExpr, ParseError> {
        let mut left = self.and_expr()?;
        while matches!(self.peek().map(|t| &t.kind), Some(TokenKind::Pipe)) {
            self.advance();
            let right = self.and_expr()?;
            left = FilterExpr::or(left, right);
        }
        Ok(left)
    }

    fn and_expr(&mut self) -> Result<FilterExpr, ParseError> {
        let mut left = self.not_expr()?;
        loop {
            match self.peek().map(|t| &t.kind) {
                Some(TokenKind::Amp) => {
                    self.advance();
                    let right = self.not_expr()?;
                    left = FilterExpr::and(left, right);
                }
                // '&' is optional between adjacent terms
                Some(TokenKind::Bang | TokenKind::LParen | TokenKind::Filter(_)) => {
                    let right = self.not_expr()?;
                    left = FilterExpr::and(left, right);
                }
                _ => break,
            }
        }
        Ok(left)
    }

    fn not_expr(&mut self) -> Result<FilterExpr, ParseError> {
        if matches!(self.peek().map(|t| &t.kind), Some(TokenKind::Bang)) {
            self.advance();
            let inner = self.not_expr()?;
            return Ok(FilterExpr::not(inner));
        }
        self.atom()
    }

    fn atom(&mut self) -> Result<FilterExpr, ParseError> {
        match self.peek().map(|t| t.kind.clone()) {
            Some(TokenKind::LParen) => {
                self.advance();
                let expr = self.or_expr()?;
                match self.advance() {
                    Some(Token {
                        kind: TokenKind::RParen,
                        ..
                    }) => Ok(expr),
                    other => Err(ParseError::new(
                        other.map_or(self.input_len, |t| t.start),
                        "')'",
                        "unclosed group",
                    )),
                }
            }
            Some(TokenKind::Filter(name)) => {
                let token = self.advance().expect("peeked token exists");
                self.predicate(&name, token.start)
            }
            Some(_) => Err(ParseError::new(
                self.here(),
                "filter, '!' or '('",
                "expected a filter term",
            )),
            None => Err(ParseError::new(
                self.input_len,
                "filter, '!' or '('",
                "expression ended unexpectedly",
            )),
        }
    }

    fn predicate(&mut self, name: &str, start: usize) -> Result<FilterExpr, ParseError> {
        let predicate = match name {
            "e" => Predicate::HasError,
            "t" => Predicate::HasToolCalls,
            "k" => Predicate::HasThinking,
            "starred" => Predicate::Starred,
            "m" => Predicate::Model {
                pattern: self.argument("~m")?,
            },
            "p" => Predicate::Provider {
                name: self.argument("~p")?,
            },
            "s" => {
                let raw = self.argument("~s")?;
                let state = FlowState::parse(&raw).ok_or_else(|| {
                    ParseError::new(
                        self.previous_start(),
                        "a state value",
                        format!("unknown state '{raw}'"),
                    )
                })?;
                Predicate::State { state }
            }
            "tag" => Predicate::Tag {
                tag: self.argument("~tag")?,
            },
            "b" => Predicate::Body {
                needle: self.argument("~b")?,
            },
            "bq" => Predicate::RequestBody {
                needle: self.argument("~bq")?,
            },
            "bs" => Predicate::ResponseBody {
                needle: self.argument("~bs")?,
            },
            "tokens" => {
                let (cmp, value) = self.comparison("~tokens")?;
                Predicate::Tokens { cmp, value }
            }
            "latency" => {
                let (cmp, value) = self.comparison("~latency")?;
                Predicate::Latency { cmp, value }
            }
            other => {
                return Err(ParseError::new(
                    start,
                    "a known filter",
                    format!("unknown filter '~{other}'"),
                ));
            }
        };
        Ok(FilterExpr::pred(predicate))
    }

    fn argument(&mut self, filter: &str) -> Result<String, ParseError> {
        match self.advance() {
            Some(Token {
                kind: TokenKind::Bare(value) | TokenKind::Quoted(value),
                ..
            }) => Ok(value),
            other => Err(ParseError::new(
                other.map_or(self.input_len, |t| t.start),
                "an argument",
                format!("{filter} needs an argument"),
            )),
        }
    }

    fn comparison(&mut self, filter: &str) -> Result<(Comparator, u64), ParseError> {
        let cmp = match self.advance() {
            Some(Token {
                kind: TokenKind::Cmp(cmp),
                ..
            }) => cmp,
            other => {
                return Err(ParseError::new(
                    other.map_or(self.input_len, |t| t.start),
                    "a comparator (>, >=, <, <=, =)",
                    format!("{filter} needs a comparator"),
                ));
            }
        };
        match self.advance() {
            Some(Token {
                kind: TokenKind::Bare(raw),
                start,
                ..
            }) => raw.parse::<u64>().map(|value| (cmp, value)).map_err(|_| {
                ParseError::new(start, "an integer", format!("'{raw}' is not an integer"))
            }),
            other => Err(ParseError::new(
                other.map_or(self.input_len, |t| t.start),
                "an integer",
                format!("{filter} needs an integer operand"),
            )),
        }
    }

    fn previous_start(&self) -> usize {
        self.tokens
            .get(self.pos.saturating_sub(1))
            .map_or(self.input_len, |t| t.start)
    }
}
