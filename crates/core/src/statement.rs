//! Split a multi-statement script into individual statements.
//!
//! A statement is the exact slice of source text from the end of the previous
//! statement up to and including its terminating `;`, so leading whitespace
//! and comments belong to the statement that follows them. Text is never
//! trimmed. Semicolons inside quoted strings, quoted identifiers, dollar-quoted
//! bodies and comments do not terminate a statement.

/// One statement of a script.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Statement<'a> {
    /// Source text as dispatched to the connection.
    pub text: &'a str,
    /// Byte offset of `text` in the script.
    pub offset: usize,
}

/// Split `script` into statements in source order.
///
/// Segments containing nothing but whitespace and comments are dropped; a
/// trailing statement without `;` is kept as-is.
pub fn split(script: &str) -> Vec<Statement<'_>> {
    let bytes = script.as_bytes();
    let mut out = Vec::new();
    let mut start = 0;
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'\'' | b'"' | b'`' => i = skip_quoted(bytes, i),
            b'-' if bytes.get(i + 1) == Some(&b'-') => i = skip_line_comment(bytes, i),
            b'#' => i = skip_line_comment(bytes, i),
            b'/' if bytes.get(i + 1) == Some(&b'*') => i = skip_block_comment(bytes, i),
            b'$' => i = skip_dollar_quoted(script, i),
            b';' => {
                i += 1;
                push_segment(script, start, i, &mut out);
                start = i;
            }
            _ => i += 1,
        }
    }

    if start < script.len() {
        push_segment(script, start, script.len(), &mut out);
    }
    out
}

fn push_segment<'a>(script: &'a str, start: usize, end: usize, out: &mut Vec<Statement<'a>>) {
    let text = &script[start..end];
    if !leading_keywords(text, 1).is_empty() {
        out.push(Statement {
            text,
            offset: start,
        });
    }
}

/// Upper-cased leading words of a statement, skipping whitespace and
/// comments, up to `max` words.
pub fn leading_keywords(text: &str, max: usize) -> Vec<String> {
    let bytes = text.as_bytes();
    let mut words = Vec::new();
    let mut i = 0;

    while i < bytes.len() && words.len() < max {
        let c = bytes[i];
        if c.is_ascii_whitespace() || c == b'(' {
            i += 1;
        } else if c == b'-' && bytes.get(i + 1) == Some(&b'-') || c == b'#' {
            i = skip_line_comment(bytes, i);
        } else if c == b'/' && bytes.get(i + 1) == Some(&b'*') {
            i = skip_block_comment(bytes, i);
        } else if c == b';' {
            break;
        } else {
            let end = bytes[i..]
                .iter()
                .position(|b| b.is_ascii_whitespace() || matches!(b, b';' | b'(' | b','))
                .map_or(bytes.len(), |p| i + p);
            words.push(text[i..end].to_ascii_uppercase());
            i = end;
        }
    }

    words
}

fn skip_quoted(bytes: &[u8], start: usize) -> usize {
    let quote = bytes[start];
    let mut i = start + 1;
    while i < bytes.len() {
        if bytes[i] == b'\\' && quote != b'"' {
            i += 2;
            continue;
        }
        if bytes[i] == quote {
            // Doubled quote is an escaped quote.
            if bytes.get(i + 1) == Some(&quote) {
                i += 2;
                continue;
            }
            return i + 1;
        }
        i += 1;
    }
    bytes.len()
}

fn skip_line_comment(bytes: &[u8], start: usize) -> usize {
    bytes[start..]
        .iter()
        .position(|&b| b == b'\n')
        .map_or(bytes.len(), |p| start + p + 1)
}

fn skip_block_comment(bytes: &[u8], start: usize) -> usize {
    let mut i = start + 2;
    while i + 1 < bytes.len() {
        if bytes[i] == b'*' && bytes[i + 1] == b'/' {
            return i + 2;
        }
        i += 1;
    }
    bytes.len()
}

/// Skip a PostgreSQL dollar-quoted body (`$$...$$` or `$tag$...$tag$`).
/// A `$` that does not open a valid tag (e.g. `$1`) is consumed alone.
fn skip_dollar_quoted(script: &str, start: usize) -> usize {
    let rest = &script[start + 1..];
    let tag_len = rest
        .bytes()
        .position(|b| !(b == b'_' || b.is_ascii_alphabetic()))
        .unwrap_or(rest.len());
    if rest.as_bytes().get(tag_len) != Some(&b'$') {
        return start + 1;
    }
    let delimiter = &script[start..start + tag_len + 2];
    let body_start = start + delimiter.len();
    match script[body_start..].find(delimiter) {
        Some(p) => body_start + p + delimiter.len(),
        None => script.len(),
    }
}
