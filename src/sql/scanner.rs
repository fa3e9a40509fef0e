// restoretool/src/sql/scanner.rs
//! Quote- and comment-aware scanning over Postgres-flavoured SQL text.
//!
//! Every rewrite in [`crate::sql`] and the statement splitter walk the text
//! through [`SqlScanner`]. A character is only ever handed out as top-level
//! code when it sits outside string literals, quoted identifiers,
//! dollar-quoted bodies and comments, so `;`, `{`, `[` and friends inside
//! those regions can never be mistaken for structure.

/// Automaton state while a region is being consumed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanState {
    InSingleQuote { backslash_escapes: bool },
    InDoubleQuote,
    InLineComment,
    InBlockComment,
    InDollarQuote(String),
}

/// What kind of guarded region a [`Segment::Region`] covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionKind {
    SingleQuoted,
    DoubleQuoted,
    LineComment,
    BlockComment,
    DollarQuoted,
}

impl RegionKind {
    pub fn is_comment(self) -> bool {
        matches!(self, RegionKind::LineComment | RegionKind::BlockComment)
    }

    fn of(state: &ScanState) -> Self {
        match state {
            ScanState::InSingleQuote { .. } => RegionKind::SingleQuoted,
            ScanState::InDoubleQuote => RegionKind::DoubleQuoted,
            ScanState::InLineComment => RegionKind::LineComment,
            ScanState::InBlockComment => RegionKind::BlockComment,
            ScanState::InDollarQuote(_) => RegionKind::DollarQuoted,
        }
    }
}

/// One step of the scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Segment<'a> {
    /// A single character of top-level code at byte `offset`.
    Code { offset: usize, ch: char },
    /// A complete quoted or commented region, delimiters included.
    /// Unterminated regions run to the end of the input.
    Region {
        kind: RegionKind,
        offset: usize,
        text: &'a str,
    },
}

/// Single-pass scanner yielding top-level characters and whole guarded regions.
#[derive(Debug, Clone)]
pub struct SqlScanner<'a> {
    src: &'a str,
    pos: usize,
}

impl<'a> SqlScanner<'a> {
    pub fn new(src: &'a str) -> Self {
        Self { src, pos: 0 }
    }

    /// Jumps forward past text a caller consumed itself (a matched `{...}`
    /// block, an `ARRAY[...]` literal). Offsets behind the cursor are ignored.
    pub fn skip_to(&mut self, offset: usize) {
        if offset > self.pos && self.src.is_char_boundary(offset.min(self.src.len())) {
            self.pos = offset.min(self.src.len());
        }
    }

    /// Decides whether a guarded region opens at `at`, returning the state it
    /// enters and the length of the opening delimiter.
    fn opening_at(&self, at: usize) -> Option<(ScanState, usize)> {
        let rest = &self.src[at..];
        let bytes = rest.as_bytes();
        match bytes.first()? {
            b'-' if bytes.get(1) == Some(&b'-') => Some((ScanState::InLineComment, 2)),
            b'/' if bytes.get(1) == Some(&b'*') => Some((ScanState::InBlockComment, 2)),
            b'\'' => {
                let backslash_escapes = self.is_escape_string_prefix(at);
                Some((ScanState::InSingleQuote { backslash_escapes }, 1))
            }
            b'"' => Some((ScanState::InDoubleQuote, 1)),
            b'$' => {
                if preceded_by_ident(self.src, at) {
                    return None;
                }
                let tag_len = dollar_tag_len(rest)?;
                Some((ScanState::InDollarQuote(rest[..tag_len].to_string()), tag_len))
            }
            _ => None,
        }
    }

    /// `E'...'` strings honour backslash escapes.
    fn is_escape_string_prefix(&self, quote_at: usize) -> bool {
        let before = &self.src[..quote_at];
        let mut rev = before.chars().rev();
        match rev.next() {
            Some('E') | Some('e') => !rev.next().is_some_and(is_ident_char),
            _ => false,
        }
    }

    /// Returns the byte offset just past the region that `state` opened,
    /// starting the search at `from`.
    fn region_end(&self, state: &ScanState, from: usize) -> usize {
        let bytes = self.src.as_bytes();
        let len = bytes.len();
        match state {
            ScanState::InLineComment => match self.src[from..].find('\n') {
                Some(idx) => from + idx + 1,
                None => len,
            },
            ScanState::InBlockComment => block_comment_end(bytes, from),
            ScanState::InDollarQuote(tag) => match self.src[from..].find(tag.as_str()) {
                Some(idx) => from + idx + tag.len(),
                None => len,
            },
            ScanState::InSingleQuote { backslash_escapes } => {
                quoted_end(bytes, from, b'\'', *backslash_escapes)
            }
            ScanState::InDoubleQuote => quoted_end(bytes, from, b'"', false),
        }
    }
}

impl<'a> Iterator for SqlScanner<'a> {
    type Item = Segment<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let start = self.pos;
        let ch = self.src[start..].chars().next()?;
        match self.opening_at(start) {
            Some((state, opener_len)) => {
                let end = self.region_end(&state, start + opener_len);
                self.pos = end;
                let kind = RegionKind::of(&state);
                Some(Segment::Region {
                    kind,
                    offset: start,
                    text: &self.src[start..end],
                })
            }
            None => {
                self.pos = start + ch.len_utf8();
                Some(Segment::Code { offset: start, ch })
            }
        }
    }
}

/// Callbacks for a rewriting pass driven by [`rewrite`].
pub trait Rewriter {
    /// Called for each top-level character. Returning `Some(end)` means the
    /// rewriter consumed `sql[offset..end]` and already pushed its
    /// replacement into `out`; `None` copies the character unchanged.
    fn on_code(&mut self, sql: &str, offset: usize, ch: char, out: &mut String) -> Option<usize>;

    /// Called after a guarded region has been copied verbatim.
    fn on_region(&mut self, _kind: RegionKind) {}
}

/// Runs `rewriter` over `sql`, copying guarded regions untouched.
pub fn rewrite<R: Rewriter + ?Sized>(sql: &str, rewriter: &mut R) -> String {
    let mut out = String::with_capacity(sql.len() + sql.len() / 8);
    let mut scanner = SqlScanner::new(sql);
    while let Some(segment) = scanner.next() {
        match segment {
            Segment::Region { kind, text, .. } => {
                out.push_str(text);
                rewriter.on_region(kind);
            }
            Segment::Code { offset, ch } => match rewriter.on_code(sql, offset, ch, &mut out) {
                Some(end) if end > offset => scanner.skip_to(end),
                _ => out.push(ch),
            },
        }
    }
    out
}

/// Delimiters understood by [`find_block_end`].
#[derive(Debug, Clone, Copy)]
pub struct BlockSyntax {
    pub open: u8,
    pub close: u8,
    /// Inside JSON objects, double-quoted strings use backslash escapes and may
    /// contain unbalanced braces.
    pub json_strings: bool,
}

pub const BRACE_BLOCK: BlockSyntax = BlockSyntax {
    open: b'{',
    close: b'}',
    json_strings: true,
};

pub const BRACKET_BLOCK: BlockSyntax = BlockSyntax {
    open: b'[',
    close: b']',
    json_strings: false,
};

/// Finds the byte offset just past the delimiter matching the one at `open_at`.
///
/// Only delimiters outside single-quoted sub-regions (with `''` escapes) count,
/// plus double-quoted JSON strings when `syntax.json_strings` is set.
/// Returns `None` when the block never closes.
pub fn find_block_end(sql: &str, open_at: usize, syntax: BlockSyntax) -> Option<usize> {
    let bytes = sql.as_bytes();
    if bytes.get(open_at) != Some(&syntax.open) {
        return None;
    }
    let mut depth = 0usize;
    let mut i = open_at;
    while i < bytes.len() {
        let b = bytes[i];
        if b == b'\'' {
            i = quoted_end(bytes, i + 1, b'\'', false);
            continue;
        }
        if syntax.json_strings && b == b'"' {
            i = quoted_end(bytes, i + 1, b'"', true);
            continue;
        }
        if b == syntax.open {
            depth += 1;
        } else if b == syntax.close {
            depth -= 1;
            if depth == 0 {
                return Some(i + 1);
            }
        }
        i += 1;
    }
    None
}

/// Scans a quoted run starting just after its opening quote. A doubled quote
/// is an escaped quote; with `backslash_escapes`, `\x` skips `x`.
fn quoted_end(bytes: &[u8], from: usize, quote: u8, backslash_escapes: bool) -> usize {
    let mut i = from;
    while i < bytes.len() {
        let b = bytes[i];
        if backslash_escapes && b == b'\\' {
            i += 2;
            continue;
        }
        if b == quote {
            if !backslash_escapes && bytes.get(i + 1) == Some(&quote) {
                i += 2;
                continue;
            }
            return i + 1;
        }
        i += 1;
    }
    bytes.len()
}

/// Postgres block comments nest, so `/* a /* b */ c */` closes only at the
/// second `*/`.
fn block_comment_end(bytes: &[u8], from: usize) -> usize {
    let mut depth = 1usize;
    let mut i = from;
    while i + 1 < bytes.len() {
        match (bytes[i], bytes[i + 1]) {
            (b'/', b'*') => {
                depth += 1;
                i += 2;
            }
            (b'*', b'/') => {
                depth -= 1;
                i += 2;
                if depth == 0 {
                    return i;
                }
            }
            _ => i += 1,
        }
    }
    bytes.len()
}

/// Length of a `$tag$` opener at the start of `rest`, if there is one.
fn dollar_tag_len(rest: &str) -> Option<usize> {
    let bytes = rest.as_bytes();
    let mut i = 1;
    while i < bytes.len() {
        let b = bytes[i];
        if b == b'$' {
            return Some(i + 1);
        }
        let valid = b == b'_' || b.is_ascii_alphabetic() || (i > 1 && b.is_ascii_digit());
        if !valid {
            return None;
        }
        i += 1;
    }
    None
}

pub fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

/// True when the character before `at` continues an identifier (or is `$`),
/// i.e. `at` is not at a word start.
pub fn preceded_by_ident(sql: &str, at: usize) -> bool {
    sql[..at]
        .chars()
        .next_back()
        .is_some_and(|c| is_ident_char(c) || c == '$')
}
