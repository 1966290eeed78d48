use regex::Regex;
use std::sync::LazyLock;

/// Leading-keyword classification of a SQL statement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    Select,
    Insert,
    Update,
    Delete,
    Merge,
    Create,
    Alter,
    Drop,
    Truncate,
    With,
    Show,
    Explain,
    Values,
    Begin,
    Commit,
    Rollback,
    /// GRANT, REVOKE, COPY, VACUUM and friends
    Maintenance,
    Other,
}

impl StatementKind {
    /// Detect the statement kind from its first keyword, ignoring leading
    /// whitespace, comments, parentheses and empty statements
    pub fn detect(sql: &str) -> Self {
        let keyword = first_keyword(sql);
        let bytes = keyword.as_bytes();

        match bytes.len() {
            4 => match_ci(
                bytes,
                &[
                    (b"WITH", Self::With),
                    (b"SHOW", Self::Show),
                    (b"DROP", Self::Drop),
                    (b"COPY", Self::Maintenance),
                ],
            ),
            5 => match_ci(
                bytes,
                &[
                    (b"ALTER", Self::Alter),
                    (b"MERGE", Self::Merge),
                    (b"BEGIN", Self::Begin),
                    (b"GRANT", Self::Maintenance),
                    (b"START", Self::Begin),
                ],
            ),
            6 => match_ci(
                bytes,
                &[
                    (b"SELECT", Self::Select),
                    (b"INSERT", Self::Insert),
                    (b"UPDATE", Self::Update),
                    (b"DELETE", Self::Delete),
                    (b"CREATE", Self::Create),
                    (b"COMMIT", Self::Commit),
                    (b"VALUES", Self::Values),
                    (b"UPSERT", Self::Insert),
                    (b"RENAME", Self::Alter),
                    (b"REVOKE", Self::Maintenance),
                    (b"VACUUM", Self::Maintenance),
                ],
            ),
            7 => match_ci(
                bytes,
                &[
                    (b"EXPLAIN", Self::Explain),
                    (b"REPLACE", Self::Insert),
                    (b"REINDEX", Self::Maintenance),
                    (b"ANALYZE", Self::Maintenance),
                    (b"COMMENT", Self::Maintenance),
                ],
            ),
            8 => match_ci(
                bytes,
                &[
                    (b"TRUNCATE", Self::Truncate),
                    (b"ROLLBACK", Self::Rollback),
                ],
            ),
            3 => match_ci(bytes, &[(b"END", Self::Commit)]),
            _ => Self::Other,
        }
    }

    pub fn is_ddl(self) -> bool {
        matches!(self, Self::Create | Self::Alter | Self::Drop | Self::Truncate)
    }

    pub fn is_dml(self) -> bool {
        matches!(self, Self::Insert | Self::Update | Self::Delete | Self::Merge)
    }

    pub fn is_transaction_control(self) -> bool {
        matches!(self, Self::Begin | Self::Commit | Self::Rollback)
    }
}

fn match_ci<const N: usize>(bytes: &[u8], table: &[(&[u8; N], StatementKind)]) -> StatementKind {
    table
        .iter()
        .find(|(keyword, _)| bytes.eq_ignore_ascii_case(&keyword[..]))
        .map(|(_, kind)| *kind)
        .unwrap_or(StatementKind::Other)
}

/// Statements that change data or schema.
///
/// `WITH` is write-shaped when any of its bodies modifies data.
pub fn is_write_statement(sql: &str) -> bool {
    let kind = StatementKind::detect(sql);
    if kind.is_ddl() || kind.is_dml() || kind == StatementKind::Maintenance {
        return true;
    }
    if kind == StatementKind::With {
        return DATA_MODIFYING.is_match(&scrub(sql));
    }
    false
}

/// Statements whose results may be cached
pub fn is_read_only_query(sql: &str) -> bool {
    match StatementKind::detect(sql) {
        StatementKind::Select | StatementKind::Show | StatementKind::Values => true,
        StatementKind::With => !is_write_statement(sql),
        // EXPLAIN ANALYZE executes the statement
        StatementKind::Explain => {
            let scrubbed = scrub(sql);
            !EXPLAIN_ANALYZE.is_match(&scrubbed)
        }
        _ => false,
    }
}

/// Best-effort target table of a write statement, without quotes.
///
/// Returns `None` for reads and for writes whose target cannot be found by
/// pattern, such as writes through a function call.
pub fn written_table(sql: &str) -> Option<String> {
    if !is_write_statement(sql) {
        return None;
    }
    let scrubbed = scrub(sql);
    let captures = WRITE_TARGET.captures(&scrubbed)?;
    let name = captures.get(1)?.as_str().replace('"', "");
    Some(name)
}

static DATA_MODIFYING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(INSERT|UPDATE|DELETE|MERGE)\b").expect("valid regex"));

static EXPLAIN_ANALYZE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^\s*EXPLAIN\s*(\(\s*)?ANALY[SZ]E\b").expect("valid regex"));

static WRITE_TARGET: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?i)\b(?:INSERT\s+(?:OR\s+\w+\s+)?INTO|REPLACE\s+INTO|UPSERT\s+INTO|MERGE\s+INTO|UPDATE(?:\s+OR\s+\w+)?|DELETE\s+FROM|TRUNCATE(?:\s+TABLE)?|(?:ALTER|DROP)\s+TABLE(?:\s+IF\s+EXISTS)?|CREATE\s+(?:TEMP(?:ORARY)?\s+|UNLOGGED\s+)?TABLE(?:\s+IF\s+NOT\s+EXISTS)?)\s+(?:ONLY\s+)?((?:"[^"]+"|[\w$]+)(?:\.(?:"[^"]+"|[\w$]+))?)"#,
    )
    .expect("valid regex")
});

/// First keyword after leading whitespace, comments, parentheses and `;`
fn first_keyword(sql: &str) -> &str {
    let mut rest = sql;
    loop {
        let trimmed =
            rest.trim_start_matches(|c: char| c.is_whitespace() || c == '(' || c == ';');
        if let Some(after) = trimmed.strip_prefix("--") {
            rest = after.split_once('\n').map_or("", |(_, tail)| tail);
        } else if let Some(after) = trimmed.strip_prefix("/*") {
            rest = after.split_once("*/").map_or("", |(_, tail)| tail);
        } else {
            rest = trimmed;
            break;
        }
    }
    let end = rest
        .find(|c: char| !c.is_ascii_alphabetic())
        .unwrap_or(rest.len());
    &rest[..end]
}

/// Remove comments and blank out string literals so keyword scans do not
/// match inside them. Quoted identifiers are kept.
fn scrub(sql: &str) -> String {
    let mut result = String::with_capacity(sql.len());
    let mut chars = sql.chars().peekable();

    while let Some(ch) = chars.next() {
        match ch {
            '\'' => {
                result.push('\'');
                while let Some(c) = chars.next() {
                    if c == '\'' {
                        if chars.peek() == Some(&'\'') {
                            chars.next();
                            continue;
                        }
                        break;
                    }
                }
                result.push('\'');
            }
            '"' => {
                result.push('"');
                for c in chars.by_ref() {
                    result.push(c);
                    if c == '"' {
                        break;
                    }
                }
            }
            '-' if chars.peek() == Some(&'-') => {
                for c in chars.by_ref() {
                    if c == '\n' {
                        result.push('\n');
                        break;
                    }
                }
            }
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                let mut prev = '\0';
                for c in chars.by_ref() {
                    if prev == '*' && c == '/' {
                        break;
                    }
                    prev = c;
                }
                // keep tokens on either side apart
                result.push(' ');
            }
            _ => result.push(ch),
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_kind() {
        assert_eq!(StatementKind::detect("SELECT * FROM users"), StatementKind::Select);
        assert_eq!(StatementKind::detect("  select 1"), StatementKind::Select);
        assert_eq!(StatementKind::detect("(SELECT 1) UNION (SELECT 2)"), StatementKind::Select);
        assert_eq!(StatementKind::detect("insert into t values (1)"), StatementKind::Insert);
        assert_eq!(StatementKind::detect("Update t set x = 1"), StatementKind::Update);
        assert_eq!(StatementKind::detect("DELETE FROM t"), StatementKind::Delete);
        assert_eq!(StatementKind::detect("create table t (x int)"), StatementKind::Create);
        assert_eq!(StatementKind::detect("DROP TABLE t"), StatementKind::Drop);
        assert_eq!(StatementKind::detect("TRUNCATE t"), StatementKind::Truncate);
        assert_eq!(StatementKind::detect("BEGIN"), StatementKind::Begin);
        assert_eq!(StatementKind::detect("rollback"), StatementKind::Rollback);
        assert_eq!(StatementKind::detect("EXPLAIN SELECT 1"), StatementKind::Explain);
        assert_eq!(StatementKind::detect("LISTEN foo"), StatementKind::Other);
        assert_eq!(StatementKind::detect(""), StatementKind::Other);
    }

    #[test]
    fn test_detect_skips_comments() {
        assert_eq!(
            StatementKind::detect("-- remove stale rows\nDELETE FROM t"),
            StatementKind::Delete
        );
        assert_eq!(
            StatementKind::detect("/* hint */ SELECT 1"),
            StatementKind::Select
        );
        assert_eq!(
            StatementKind::detect("; ;\nINSERT INTO t VALUES (1)"),
            StatementKind::Insert
        );
    }

    #[test]
    fn test_write_statements() {
        assert!(is_write_statement("INSERT INTO t VALUES (1)"));
        assert!(is_write_statement("update t set x = 1"));
        assert!(is_write_statement("DELETE FROM t"));
        assert!(is_write_statement("CREATE INDEX idx ON t (x)"));
        assert!(is_write_statement("ALTER TABLE t ADD COLUMN y int"));
        assert!(is_write_statement("GRANT SELECT ON t TO bob"));
        assert!(is_write_statement(
            "WITH moved AS (DELETE FROM a RETURNING *) INSERT INTO b SELECT * FROM moved"
        ));

        assert!(is_write_statement("; DELETE FROM t"));
        assert!(is_write_statement("/* x */ ;INSERT INTO t VALUES (1)"));

        assert!(!is_write_statement("SELECT * FROM t"));
        assert!(!is_write_statement("WITH x AS (SELECT 1) SELECT * FROM x"));
        assert!(!is_write_statement("SELECT 'DELETE FROM t'"));
        assert!(!is_write_statement("WITH x AS (SELECT 'update' AS s) SELECT s FROM x"));
    }

    #[test]
    fn test_read_only_queries() {
        assert!(is_read_only_query("SELECT 1"));
        assert!(is_read_only_query("SHOW search_path"));
        assert!(is_read_only_query("EXPLAIN SELECT * FROM t"));
        assert!(is_read_only_query("WITH x AS (SELECT 1) SELECT * FROM x"));

        assert!(!is_read_only_query("EXPLAIN ANALYZE SELECT * FROM t"));
        assert!(!is_read_only_query("INSERT INTO t VALUES (1)"));
        assert!(!is_read_only_query("BEGIN"));
        assert!(!is_read_only_query("PRAGMA query_only = OFF"));
        assert!(!is_read_only_query("ATTACH DATABASE 'x.db' AS x"));
        assert!(!is_read_only_query("; INSERT INTO t VALUES (1)"));
    }

    #[test]
    fn test_written_table() {
        assert_eq!(written_table("INSERT INTO users (name) VALUES ('a')").as_deref(), Some("users"));
        assert_eq!(written_table("update public.users set x = 1").as_deref(), Some("public.users"));
        assert_eq!(written_table("DELETE FROM \"Order Items\" WHERE id = 1").as_deref(), Some("Order Items"));
        assert_eq!(written_table("TRUNCATE TABLE logs").as_deref(), Some("logs"));
        assert_eq!(written_table("DROP TABLE IF EXISTS tmp").as_deref(), Some("tmp"));
        assert_eq!(
            written_table("WITH x AS (SELECT 1) INSERT INTO audit SELECT * FROM x").as_deref(),
            Some("audit")
        );
        assert_eq!(written_table("; DELETE FROM sessions").as_deref(), Some("sessions"));
        assert_eq!(written_table("SELECT * FROM users"), None);
    }
}
