// restoretool/src/sql/split.rs
use super::scanner::{Segment, SqlScanner};

/// One statement cut out of a dump, without its terminating `;`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlStatement {
    /// Zero-based position in the script.
    pub index: usize,
    pub text: String,
    /// False only for a trailing fragment that had no `;`.
    pub terminated: bool,
}

impl SqlStatement {
    /// Nothing but comments and whitespace.
    pub fn is_comment_only(&self) -> bool {
        SqlScanner::new(&self.text).all(|segment| match segment {
            Segment::Code { ch, .. } => ch.is_whitespace(),
            Segment::Region { kind, .. } => kind.is_comment(),
        })
    }
}

/// Splits a script into statements on top-level semicolons.
///
/// Fragments are trimmed and empty ones dropped. A non-empty tail without a
/// closing semicolon is still emitted, marked `terminated: false`.
pub fn split_statements(sql: &str) -> Vec<SqlStatement> {
    let mut statements = Vec::new();
    let mut start = 0usize;

    let push = |fragment: &str, terminated: bool, statements: &mut Vec<SqlStatement>| {
        let text = fragment.trim();
        if !text.is_empty() {
            statements.push(SqlStatement {
                index: statements.len(),
                text: text.to_string(),
                terminated,
            });
        }
    };

    for segment in SqlScanner::new(sql) {
        if let Segment::Code { offset, ch: ';' } = segment {
            push(&sql[start..offset], true, &mut statements);
            start = offset + 1;
        }
    }
    push(&sql[start..], false, &mut statements);

    if statements.last().is_some_and(|s| !s.terminated) {
        tracing::warn!("Script ends with an unterminated statement; it will be executed as-is");
    }
    statements
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn texts(sql: &str) -> Vec<String> {
        split_statements(sql).into_iter().map(|s| s.text).collect()
    }

    #[test]
    fn test_semicolon_inside_literal_and_json() {
        let sql = r#"INSERT INTO t (a) VALUES ('x;y'), ({"k":1});"#;
        let statements = split_statements(sql);
        assert_eq!(statements.len(), 1);
        assert_eq!(statements[0].text, r#"INSERT INTO t (a) VALUES ('x;y'), ({"k":1})"#);
        assert!(statements[0].terminated);
    }

    #[test]
    fn test_function_body_is_one_statement() {
        let sql = "CREATE FUNCTION f() RETURNS int AS $body$ BEGIN RETURN 1; END; $body$ LANGUAGE plpgsql;\nSELECT f();";
        let parts = texts(sql);
        assert_eq!(parts.len(), 2);
        assert!(parts[0].ends_with("LANGUAGE plpgsql"));
        assert_eq!(parts[1], "SELECT f()");
    }

    #[test]
    fn test_comments_and_blank_fragments() {
        let sql = "-- header; still comment\n;;  \nSELECT 1; /* a;b */ SELECT 2;";
        let statements = split_statements(sql);
        let parts: Vec<&str> = statements.iter().map(|s| s.text.as_str()).collect();
        assert_eq!(parts, vec!["-- header; still comment", "SELECT 1", "/* a;b */ SELECT 2"]);
        assert!(statements[0].is_comment_only());
        assert!(!statements[2].is_comment_only());
        assert_eq!(statements[2].index, 2);
    }

    #[test]
    fn test_nested_comment_hides_semicolon() {
        let parts = texts("SELECT 1 /* a /* b */ ; c */; SELECT 2;");
        assert_eq!(parts, vec!["SELECT 1 /* a /* b */ ; c */", "SELECT 2"]);
    }

    #[test]
    fn test_unterminated_tail_is_flagged() {
        let statements = split_statements("SELECT 1; SELECT 2");
        assert_eq!(statements.len(), 2);
        assert!(statements[0].terminated);
        assert!(!statements[1].terminated);
        assert_eq!(statements[1].text, "SELECT 2");
    }

    #[test]
    fn test_empty_script() {
        assert!(split_statements("  \n ; ;").is_empty());
    }

    fn quoted_literal(content: &str) -> String {
        format!("'{}'", content.replace('\'', "''"))
    }

    proptest! {
        #[test]
        fn prop_guarded_semicolons_never_split(
            literals in prop::collection::vec("[a-z;{}\\[\\]' ]{0,12}", 1..6),
            bodies in prop::collection::vec("[a-z;{}' ]{0,12}", 0..4),
            comment in "[a-z; ]{0,12}",
        ) {
            let mut expected = Vec::new();
            for lit in &literals {
                expected.push(format!("INSERT INTO t VALUES ({})", quoted_literal(lit)));
            }
            for body in &bodies {
                expected.push(format!("SELECT $q${}$q$", body));
            }
            expected.push(format!("SELECT 1 /* {} */", comment));

            let script = expected.iter().map(|s| format!("{};\n", s)).collect::<String>();
            let parts = texts(&script);
            prop_assert_eq!(parts, expected);
        }
    }
}
