//! Filter expression lexer
//!
//! Produces tokens with byte spans so the parser and highlighter can point
//! at exact positions.

use crate::ast::Comparator;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    /// `~name` — the name without the tilde.
    Filter(String),
    /// Unquoted argument or integer.
    Bare(String),
    /// Double-quoted argument, unescaped.
    Quoted(String),
    Cmp(Comparator),
    Amp,
    Pipe,
    Bang,
    LParen,
    RParen,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub start: usize,
    pub end: usize,
}

#[derive(Debug, Clone, PartialEq, Error)]
#[error("{message} at position {position}")]
pub struct LexError {
    pub position: usize,
    pub message: String,
}

const BARE_STOP: &[char] = &['&', '|', '!', '(', ')', '"', '~', '<', '>', '='];

pub fn lex(input: &str) -> Result<Vec<Token>, LexError> {
    let mut tokens = Vec::new();
    let bytes: Vec<(usize, char)> = input.char_indices().collect();
    let mut i = 0;

    while i < bytes.len() {
        let (start, c) = bytes[i];
        match c {
            c if c.is_whitespace() => {
                i += 1;
            }
            '&' => {
                tokens.push(Token { kind: TokenKind::Amp, start, end: start + 1 });
                i += 1;
            }
            '|' => {
                tokens.push(Token { kind: TokenKind::Pipe, start, end: start + 1 });
                i += 1;
            }
            '!' => {
                tokens.push(Token { kind: TokenKind::Bang, start, end: start + 1 });
                i += 1;
            }
            '(' => {
                tokens.push(Token { kind: TokenKind::LParen, start, end: start + 1 });
                i += 1;
            }
            ')' => {
                tokens.push(Token { kind: TokenKind::RParen, start, end: start + 1 });
                i += 1;
            }
            '>' | '<' => {
                let (cmp, len) = if matches!(bytes.get(i + 1), Some((_, '='))) {
                    (if c == '>' { Comparator::Ge } else { Comparator::Le }, 2)
                } else {
                    (if c == '>' { Comparator::Gt } else { Comparator::Lt }, 1)
                };
                tokens.push(Token { kind: TokenKind::Cmp(cmp), start, end: start + len });
                i += len;
            }
            '=' => {
                tokens.push(Token { kind: TokenKind::Cmp(Comparator::Eq), start, end: start + 1 });
                i += 1;
            }
            '~' => {
                let mut j = i + 1;
                let mut name = String::new();
                while j < bytes.len() && bytes[j].1.is_ascii_alphanumeric() {
                    name.push(bytes[j].1);
                    j += 1;
                }
                if name.is_empty() {
                    return Err(LexError {
                        position: start,
                        message: "expected a filter name after '~'".to_string(),
                    });
                }
                let end = bytes.get(j).map_or(input.len(), |(pos, _)| *pos);
                tokens.push(Token { kind: TokenKind::Filter(name), start, end });
                i = j;
            }
            '"' => {
                let mut j = i + 1;
                let mut value = String::new();
                let mut closed = false;
                while j < bytes.len() {
                    match bytes[j].1 {
                        '\\' if j + 1 < bytes.len() => {
                            value.push(bytes[j + 1].1);
                            j += 2;
                        }
                        '"' => {
                            closed = true;
                            j += 1;
                            break;
                        }
                        other => {
                            value.push(other);
                            j += 1;
                        }
                    }
                }
                if !closed {
                    return Err(LexError {
                        position: start,
                        message: "unterminated string".to_string(),
                    });
                }
                let end = bytes.get(j).map_or(input.len(), |(pos, _)| *pos);
                tokens.push(Token { kind: TokenKind::Quoted(value), start, end });
                i = j;
            }
            _ => {
                let mut j = i;
                let mut value = String::new();
                while j < bytes.len() {
                    let ch = bytes[j].1;
                    if ch.is_whitespace() || BARE_STOP.contains(&ch) {
                        break;
                    }
                    value.push(ch);
                    j += 1;
                }
                let end = bytes.get(j).map_or(input.len(), |(pos, _)| *pos);
                tokens.push(Token { kind: TokenKind::Bare(value), start, end });
                i = j;
            }
        }
    }

    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(input: &str) -> Vec<TokenKind> {
        lex(input).unwrap().into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn lexes_filters_and_operators() {
        assert_eq!(
            kinds("~p kiro & !~e"),
            vec![
                TokenKind::Filter("p".to_string()),
                TokenKind::Bare("kiro".to_string()),
                TokenKind::Amp,
                TokenKind::Bang,
                TokenKind::Filter("e".to_string()),
            ]
        );
    }

    #[test]
    fn lexes_comparators() {
        assert_eq!(
            kinds("~tokens >= 1000"),
            vec![
                TokenKind::Filter("tokens".to_string()),
                TokenKind::Cmp(Comparator::Ge),
                TokenKind::Bare("1000".to_string()),
            ]
        );
    }

    #[test]
    fn wildcard_stays_in_bare_token() {
        assert_eq!(
            kinds("~m claude*"),
            vec![
                TokenKind::Filter("m".to_string()),
                TokenKind::Bare("claude*".to_string()),
            ]
        );
    }

    #[test]
    fn quoted_strings_unescape() {
        assert_eq!(
            kinds(r#"~b "say \"hi\"""#),
            vec![
                TokenKind::Filter("b".to_string()),
                TokenKind::Quoted("say \"hi\"".to_string()),
            ]
        );
    }

    #[test]
    fn spans_are_byte_accurate() {
        let tokens = lex("  ~tag prod").unwrap();
        assert_eq!(tokens[0].start, 2);
        assert_eq!(tokens[0].end, 6);
        assert_eq!(tokens[1].start, 7);
        assert_eq!(tokens[1].end, 11);
    }

    #[test]
    fn bare_tilde_is_an_error() {
        let err = lex("~ e").unwrap_err();
        assert_eq!(err.position, 0);
    }

    #[test]
    fn unterminated_string_is_an_error() {
        let err = lex("~b \"oops").unwrap_err();
        assert_eq!(err.position, 3);
    }
}
