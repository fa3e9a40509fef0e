// restoretool/src/sql/normalize.rs
//! Text rewrites that turn a loosely generated dump into SQL Postgres accepts.
//!
//! Each pass is a [`Rewriter`] driven by [`rewrite`], so nothing inside a
//! string literal, quoted identifier, dollar-quoted body or comment is touched.
//! A construct that cannot be matched (an unclosed `{` or `ARRAY[`) is left
//! exactly as it was.

use std::sync::LazyLock;

use regex::Regex;

use super::sanitize::sanitize_leaked_conversation;
use super::scanner::{
    BRACE_BLOCK, BRACKET_BLOCK, RegionKind, Rewriter, find_block_end, is_ident_char,
    preceded_by_ident, rewrite,
};

static ARRAY_OPEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^array\s*\[").expect("valid regex"));

static ARRAY_CAST: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*::\s*([A-Za-z_]\w*(?:\s+[A-Za-z_]\w*)*)\s*\[\]").expect("valid regex")
});

static COLUMN_DEF_TAIL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?:^|\n)\s*"[^"\n]+"\s+$"#).expect("valid regex"));

static BARE_ARRAY_TYPE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^ARRAY\b").expect("valid regex"));

static USER_DEFINED_TYPE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^USER-DEFINED\b").expect("valid regex"));

static DEFAULT_EMPTY_ARRAY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^default\s+array\s*\[\s*\](?:\s*::\s*([A-Za-z_]\w*(?:\s+[A-Za-z_]\w*)*)\s*\[\])?")
        .expect("valid regex")
});

/// How a bare `{...}` block gets wrapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JsonWrapStyle {
    /// `'<block>'::jsonb`
    Cast,
    /// `to_jsonb('<block>'::text)`, used once the script is known to carry a
    /// leaked chat transcript, so the block is stored as an opaque string.
    ToJsonb,
}

/// A fully normalized script plus what the sanitizer found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedScript {
    pub text: String,
    pub leaked_conversation: bool,
}

/// Full pipeline applied to a dump before splitting:
/// sanitize, array literals, inline JSON casts, remaining bare JSON, then
/// DDL type repairs.
pub fn normalize_script(sql: &str) -> NormalizedScript {
    let sanitized = sanitize_leaked_conversation(sql);
    let style = if sanitized.leaked {
        tracing::warn!(
            artifacts = sanitized.artifacts_removed,
            "Dump contained leaked conversation artifacts; bare JSON will be stored via to_jsonb"
        );
        JsonWrapStyle::ToJsonb
    } else {
        JsonWrapStyle::Cast
    };

    let text = normalize_array_literals(&sanitized.text);
    let text = wrap_inline_json_casts(&text);
    let text = wrap_bare_json(&text, style);
    let text = repair_ddl_types(&text);

    NormalizedScript {
        text,
        leaked_conversation: sanitized.leaked,
    }
}

/// The single repair pass a failing statement gets before its retry.
pub fn repair_statement(statement: &str) -> String {
    wrap_inline_json_casts(&normalize_array_literals(statement))
}

/// Rewrites `ARRAY[...]` constructors into quoted Postgres array literals.
///
/// `ARRAY['a','b,c']` becomes `'{"a","b,c"}'::text[]`; a trailing
/// `::T[]` cast is consumed and reused as the element type. An empty
/// constructor becomes `ARRAY[]::T[]`.
pub fn normalize_array_literals(sql: &str) -> String {
    rewrite(sql, &mut ArrayLiterals)
}

struct ArrayLiterals;

impl Rewriter for ArrayLiterals {
    fn on_code(&mut self, sql: &str, offset: usize, ch: char, out: &mut String) -> Option<usize> {
        if !matches!(ch, 'a' | 'A') || preceded_by_ident(sql, offset) {
            return None;
        }
        let head = ARRAY_OPEN.find(&sql[offset..])?;
        let bracket_at = offset + head.end() - 1;
        let close_end = find_block_end(sql, bracket_at, BRACKET_BLOCK)?;
        let inner = &sql[bracket_at + 1..close_end - 1];

        let (base_type, consumed_end) = match ARRAY_CAST.captures(&sql[close_end..]) {
            Some(caps) => {
                let whole = caps.get(0)?;
                let ty = caps.get(1)?.as_str().to_string();
                (ty, close_end + whole.end())
            }
            None => ("text".to_string(), close_end),
        };

        let elements = split_array_elements(inner);
        if elements.is_empty() {
            out.push_str(&format!("ARRAY[]::{}[]", base_type));
            return Some(consumed_end);
        }

        let encoded: Vec<String> = elements.iter().map(|e| encode_array_element(e)).collect();
        let literal = format!("{{{}}}", encoded.join(","));
        out.push_str(&format!("'{}'::{}[]", literal.replace('\'', "''"), base_type));
        Some(consumed_end)
    }
}

/// Splits constructor contents on commas outside quotes, brackets and parens.
fn split_array_elements(inner: &str) -> Vec<&str> {
    let bytes = inner.as_bytes();
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut start = 0usize;
    let mut i = 0usize;
    while i < bytes.len() {
        match bytes[i] {
            b'\'' => {
                i += 1;
                while i < bytes.len() {
                    if bytes[i] == b'\'' {
                        if bytes.get(i + 1) == Some(&b'\'') {
                            i += 2;
                            continue;
                        }
                        break;
                    }
                    i += 1;
                }
            }
            b'[' | b'(' => depth += 1,
            b']' | b')' => depth -= 1,
            b',' if depth == 0 => {
                parts.push(inner[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
        i += 1;
    }
    let last = inner[start..].trim();
    if !last.is_empty() || !parts.is_empty() {
        parts.push(last);
    }
    parts.retain(|p| !p.is_empty());
    parts
}

/// One constructor element as a double-quoted array-literal element.
fn encode_array_element(element: &str) -> String {
    if element.eq_ignore_ascii_case("null") {
        return "NULL".to_string();
    }
    let value = match element.strip_prefix('\'') {
        Some(rest) => unquote_sql_string(rest),
        None => element.to_string(),
    };
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

/// Content of a single-quoted literal given the text after its opening
/// quote. Anything after the closing quote (usually a `::type` cast) is dropped.
fn unquote_sql_string(after_open: &str) -> String {
    let mut value = String::with_capacity(after_open.len());
    let mut chars = after_open.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\'' {
            if chars.peek() == Some(&'\'') {
                chars.next();
                value.push('\'');
                continue;
            }
            break;
        }
        value.push(c);
    }
    value
}

/// Wraps `{...}` blocks that appear directly as a VALUES item or as the
/// right-hand side of a SET assignment.
pub fn wrap_inline_json_casts(sql: &str) -> String {
    rewrite(sql, &mut InlineJsonCasts::default())
}

#[derive(Default)]
struct InlineJsonCasts {
    in_values: bool,
    in_set: bool,
    depth: i32,
    last: Option<char>,
}

impl Rewriter for InlineJsonCasts {
    fn on_code(&mut self, sql: &str, offset: usize, ch: char, out: &mut String) -> Option<usize> {
        if ch.is_whitespace() {
            return None;
        }
        match ch {
            ';' => {
                *self = Self::default();
                self.last = Some(';');
                return None;
            }
            '(' => self.depth += 1,
            ')' => self.depth -= 1,
            '{' => {
                let value_slot = self.in_values && self.depth >= 1 && matches!(self.last, Some('(' | ','));
                let assignment = self.in_set && self.last == Some('=');
                if value_slot || assignment {
                    if let Some(end) = find_block_end(sql, offset, BRACE_BLOCK) {
                        out.push_str(&jsonb_cast(&sql[offset..end]));
                        self.last = Some('\'');
                        return Some(end);
                    }
                }
            }
            c if c.is_alphabetic() && !preceded_by_ident(sql, offset) => {
                let word: String = sql[offset..].chars().take_while(|c| is_ident_char(*c)).collect();
                if word.eq_ignore_ascii_case("values") {
                    self.in_values = true;
                } else if word.eq_ignore_ascii_case("set") {
                    self.in_set = true;
                }
            }
            _ => {}
        }
        self.last = Some(ch);
        None
    }

    fn on_region(&mut self, kind: RegionKind) {
        if !kind.is_comment() {
            self.last = Some('\'');
        }
    }
}

/// Wraps every remaining top-level `{...}` block.
pub fn wrap_bare_json(sql: &str, style: JsonWrapStyle) -> String {
    rewrite(sql, &mut BareJson { style })
}

struct BareJson {
    style: JsonWrapStyle,
}

impl Rewriter for BareJson {
    fn on_code(&mut self, sql: &str, offset: usize, ch: char, out: &mut String) -> Option<usize> {
        if ch != '{' {
            return None;
        }
        let end = find_block_end(sql, offset, BRACE_BLOCK)?;
        let block = &sql[offset..end];
        match self.style {
            JsonWrapStyle::Cast => out.push_str(&jsonb_cast(block)),
            JsonWrapStyle::ToJsonb => {
                out.push_str(&format!("to_jsonb('{}'::text)", block.replace('\'', "''")))
            }
        }
        Some(end)
    }
}

fn jsonb_cast(block: &str) -> String {
    format!("'{}'::jsonb", block.replace('\'', "''"))
}

/// DDL repairs for catalog-derived column types: a bare `ARRAY` column type
/// becomes `text[]`, `USER-DEFINED` becomes `text`, and an empty-array
/// default becomes the `'{}'` literal.
pub fn repair_ddl_types(sql: &str) -> String {
    rewrite(sql, &mut DdlTypes)
}

struct DdlTypes;

impl DdlTypes {
    /// The output so far ends in a column-definition head: a line-leading
    /// quoted identifier followed by whitespace.
    fn at_column_type(out: &str) -> bool {
        let mut from = out.len().saturating_sub(256);
        while !out.is_char_boundary(from) {
            from += 1;
        }
        COLUMN_DEF_TAIL.is_match(&out[from..])
    }
}

impl Rewriter for DdlTypes {
    fn on_code(&mut self, sql: &str, offset: usize, ch: char, out: &mut String) -> Option<usize> {
        if preceded_by_ident(sql, offset) {
            return None;
        }
        let rest = &sql[offset..];
        match ch {
            'A' if BARE_ARRAY_TYPE.is_match(rest)
                && !ARRAY_OPEN.is_match(rest)
                && Self::at_column_type(out) =>
            {
                out.push_str("text[]");
                Some(offset + "ARRAY".len())
            }
            'U' if USER_DEFINED_TYPE.is_match(rest) && Self::at_column_type(out) => {
                out.push_str("text");
                Some(offset + "USER-DEFINED".len())
            }
            'D' | 'd' => {
                let caps = DEFAULT_EMPTY_ARRAY.captures(rest)?;
                let whole = caps.get(0)?;
                let element_type = caps.get(1).map(|m| m.as_str()).unwrap_or("text");
                out.push_str(&format!("DEFAULT '{{}}'::{}[]", element_type));
                Some(offset + whole.end())
            }
            _ => None,
        }
    }
}
