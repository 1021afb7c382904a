//! Tokenizer for rule expressions.

use super::ParseError;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Token {
    Ident(String),
    Str(String),
    Int(i64),
    True,
    False,
    In,
    And,
    Or,
    Not,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Dot,
}

/// A token together with the byte offset it starts at.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Spanned {
    pub token: Token,
    pub offset: usize,
}

pub(crate) fn tokenize(src: &str) -> Result<Vec<Spanned>, ParseError> {
    let bytes = src.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i];
        let start = i;

        if c.is_ascii_whitespace() {
            i += 1;
            continue;
        }

        let next = bytes.get(i + 1).copied();
        let two = |expected: u8| next == Some(expected);
        let token = match c {
            b'(' => Token::LParen,
            b')' => Token::RParen,
            b'[' => Token::LBracket,
            b']' => Token::RBracket,
            b',' => Token::Comma,
            b'.' => Token::Dot,
            b'&' if two(b'&') => {
                i += 1;
                Token::And
            }
            b'|' if two(b'|') => {
                i += 1;
                Token::Or
            }
            b'=' if two(b'=') => {
                i += 1;
                Token::Eq
            }
            b'!' if two(b'=') => {
                i += 1;
                Token::Ne
            }
            b'!' => Token::Not,
            b'<' if two(b'=') => {
                i += 1;
                Token::Le
            }
            b'<' => Token::Lt,
            b'>' if two(b'=') => {
                i += 1;
                Token::Ge
            }
            b'>' => Token::Gt,
            b'"' | b'\'' => {
                let (value, end) = lex_string(src, i)?;
                tokens.push(Spanned {
                    token: Token::Str(value),
                    offset: start,
                });
                i = end;
                continue;
            }
            b'-' | b'0'..=b'9' => {
                let mut end = i + 1;
                while end < bytes.len() && bytes[end].is_ascii_digit() {
                    end += 1;
                }
                let text = &src[i..end];
                let value = text
                    .parse::<i64>()
                    .map_err(|_| ParseError::new(start, format!("invalid integer literal '{text}'")))?;
                tokens.push(Spanned {
                    token: Token::Int(value),
                    offset: start,
                });
                i = end;
                continue;
            }
            c if c == b'_' || c.is_ascii_alphabetic() => {
                let mut end = i + 1;
                while end < bytes.len() && (bytes[end] == b'_' || bytes[end].is_ascii_alphanumeric()) {
                    end += 1;
                }
                let word = &src[i..end];
                let token = match word {
                    "true" => Token::True,
                    "false" => Token::False,
                    "in" => Token::In,
                    _ => Token::Ident(word.to_string()),
                };
                tokens.push(Spanned {
                    token,
                    offset: start,
                });
                i = end;
                continue;
            }
            _ => {
                let ch = src[i..].chars().next().unwrap_or('?');
                return Err(ParseError::new(start, format!("unexpected character '{ch}'")));
            }
        };

        tokens.push(Spanned {
            token,
            offset: start,
        });
        i += 1;
    }

    Ok(tokens)
}

/// Lex a quoted string starting at `start`; returns the unescaped value and
/// the offset just past the closing quote.
fn lex_string(src: &str, start: usize) -> Result<(String, usize), ParseError> {
    let mut chars = src[start..].char_indices();
    let (_, quote) = chars
        .next()
        .ok_or_else(|| ParseError::new(start, "unterminated string literal"))?;
    let mut out = String::new();

    while let Some((pos, ch)) = chars.next() {
        match ch {
            '\\' => {
                let (_, escaped) = chars
                    .next()
                    .ok_or_else(|| ParseError::new(start, "unterminated string literal"))?;
                out.push(match escaped {
                    'n' => '\n',
                    't' => '\t',
                    'r' => '\r',
                    other => other,
                });
            }
            c if c == quote => return Ok((out, start + pos + c.len_utf8())),
            c => out.push(c),
        }
    }

    Err(ParseError::new(start, "unterminated string literal"))
}
