// restoretool/src/sql/sanitize.rs
use std::sync::LazyLock;

use regex::Regex;

use super::scanner::{Rewriter, rewrite};

// A chat-transcript array that leaked into a dump: `[{"role":"system", ...}]`.
static LEAKED_TRANSCRIPT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?s)^\[\s*\{\s*"role"\s*:\s*"(?:system|user)".*?\}\s*\]"#).expect("valid regex")
});

// `::t`, `::te`, `::tex` and `::text`, plus any whitespace after.
static TEXT_CAST: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^::(text|tex|te|t)\b(\s*)").expect("valid regex"));

static QUOTED_KEY_AHEAD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"^"[^"]+"\s"#).expect("valid regex"));

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SanitizedScript {
    pub text: String,
    /// At least one transcript artifact was stripped.
    pub leaked: bool,
    pub artifacts_removed: usize,
}

/// Removes artifacts that never belong in a clean dump: leaked chat
/// transcripts, truncated `::text` casts, and a cast glued to the next
/// quoted key without its comma.
pub fn sanitize_leaked_conversation(sql: &str) -> SanitizedScript {
    let mut sanitizer = LeakSanitizer::default();
    let text = rewrite(sql, &mut sanitizer);
    SanitizedScript {
        text,
        leaked: sanitizer.transcripts > 0,
        artifacts_removed: sanitizer.transcripts + sanitizer.casts_repaired,
    }
}

#[derive(Default)]
struct LeakSanitizer {
    transcripts: usize,
    casts_repaired: usize,
}

impl Rewriter for LeakSanitizer {
    fn on_code(&mut self, sql: &str, offset: usize, ch: char, out: &mut String) -> Option<usize> {
        let rest = &sql[offset..];
        match ch {
            '[' => {
                let found = LEAKED_TRANSCRIPT.find(rest)?;
                self.transcripts += 1;
                Some(offset + found.end())
            }
            ':' => {
                let caps = TEXT_CAST.captures(rest)?;
                let whole = caps.get(0)?;
                let word = caps.get(1)?;
                let after = &rest[whole.end()..];
                if QUOTED_KEY_AHEAD.is_match(after) {
                    out.push_str("::text, ");
                    self.casts_repaired += 1;
                    return Some(offset + whole.end());
                }
                if word.as_str() == "text" {
                    return None;
                }
                out.push_str("::text");
                self.casts_repaired += 1;
                Some(offset + word.end())
            }
            _ => None,
        }
    }
}
