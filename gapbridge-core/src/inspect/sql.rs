//! SQL injection and dangerous-operation policy

use regex::Regex;

use super::Verdict;
use crate::error::{Error, Result};

const INJECTION_PATTERNS: &[(&str, &str)] = &[
    (
        "quote tautology",
        r#"(?i)'\s*(?:or|and)\s+(?:'[^']*'|\d+)\s*(?:=|<>|!=|\blike\b)\s*(?:'[^']*|\d+)"#,
    ),
    ("numeric tautology", r"(?i)\bor\s+\d+\s*=\s*\d+"),
    ("union-based exfiltration", r"(?i)\bunion\b(?:\s+all)?\s+select\b"),
    (
        "stacked statement",
        r"(?i);\s*(?:drop|delete|insert|update|create|alter|truncate|grant|revoke|exec|execute|copy)\b",
    ),
    ("comment after quote", r"(?i)'\s*(?:--|#|/\*)"),
    ("inline comment evasion", r"[A-Za-z]/\*.*?\*/[A-Za-z]"),
    ("time-based delay", r"(?i)\b(?:pg_sleep|sleep|benchmark)\s*\(|\bwaitfor\s+delay\b"),
];

const DANGEROUS_PATTERNS: &[(&str, &str)] = &[
    (
        "DROP statement",
        r"(?i)^\s*drop\s+(?:table|database|schema|index|view|role|user|function|extension)\b",
    ),
    ("TRUNCATE statement", r"(?i)^\s*truncate\b"),
    (
        "system catalog access",
        r"(?i)\b(?:pg_catalog|information_schema|pg_shadow|pg_authid|pg_user|pg_roles|pg_read_file|pg_ls_dir|lo_import|lo_export)\b",
    ),
    ("COPY PROGRAM", r"(?i)\bcopy\b.*\b(?:to|from)\s+program\b"),
];

const UNQUALIFIED_DELETE: &str = r"(?i)^\s*delete\s+from\b";
const UNQUALIFIED_UPDATE: &str = r"(?i)^\s*update\s+\S+\s+set\b";
const WHERE_CLAUSE: &str = r"(?i)\bwhere\b";

/// Split on `;` outside of quoted literals and identifiers.
pub fn split_statements(sql: &str) -> Vec<&str> {
    let mut statements = Vec::new();
    let mut quote: Option<char> = None;
    let mut start = 0;
    for (i, c) in sql.char_indices() {
        match (quote, c) {
            (None, '\'' | '"') => quote = Some(c),
            (Some(open), _) if c == open => quote = None,
            (None, ';') => {
                statements.push(&sql[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    statements.push(&sql[start..]);
    statements.into_iter().map(str::trim).filter(|s| !s.is_empty()).collect()
}

/// Compiled SQL policy
#[derive(Debug, Clone)]
pub struct SqlPolicy {
    injection: Vec<(&'static str, Regex)>,
    dangerous: Vec<(&'static str, Regex)>,
    delete: Regex,
    update: Regex,
    where_clause: Regex,
}

fn compile(pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|e| Error::Config(format!("invalid SQL pattern {}: {}", pattern, e)))
}

fn compile_all(patterns: &[(&'static str, &str)]) -> Result<Vec<(&'static str, Regex)>> {
    patterns
        .iter()
        .map(|(name, pattern)| Ok((*name, compile(pattern)?)))
        .collect()
}

impl SqlPolicy {
    pub fn new() -> Result<Self> {
        Ok(Self {
            injection: compile_all(INJECTION_PATTERNS)?,
            dangerous: compile_all(DANGEROUS_PATTERNS)?,
            delete: compile(UNQUALIFIED_DELETE)?,
            update: compile(UNQUALIFIED_UPDATE)?,
            where_clause: compile(WHERE_CLAUSE)?,
        })
    }

    /// Name of the first injection pattern `sql` matches
    pub fn injection_reason(&self, sql: &str) -> Option<&'static str> {
        self.injection
            .iter()
            .find(|(_, re)| re.is_match(sql))
            .map(|(name, _)| *name)
    }

    /// Name of the first dangerous operation found in any statement of `sql`
    pub fn dangerous_reason(&self, sql: &str) -> Option<&'static str> {
        for statement in split_statements(sql) {
            if self.delete.is_match(statement) && !self.where_clause.is_match(statement) {
                return Some("DELETE without WHERE");
            }
            if self.update.is_match(statement) && !self.where_clause.is_match(statement) {
                return Some("UPDATE without WHERE");
            }
            if let Some((name, _)) = self.dangerous.iter().find(|(_, re)| re.is_match(statement)) {
                return Some(*name);
            }
        }
        None
    }

    pub fn check(&self, sql: &str) -> Verdict {
        if sql.trim().is_empty() {
            return Verdict::Accepted;
        }
        if let Some(reason) = self.injection_reason(sql) {
            return Verdict::Rejected(format!("SQL injection pattern: {}", reason));
        }
        if let Some(reason) = self.dangerous_reason(sql) {
            return Verdict::Rejected(format!("dangerous SQL operation: {}", reason));
        }
        Verdict::Accepted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> SqlPolicy {
        SqlPolicy::new().unwrap()
    }

    #[test]
    fn test_benign_queries() {
        let policy = policy();
        for sql in [
            "SELECT * FROM t WHERE id = 1",
            "SELECT name, email FROM customers WHERE region = 'EU' ORDER BY name",
            "INSERT INTO audit (msg) VALUES ('ok')",
            "UPDATE accounts SET balance = 0 WHERE id = 9",
            "SELECT count(*) FROM orders WHERE status IN ('open', 'held')",
        ] {
            assert_eq!(policy.check(sql), Verdict::Accepted, "{}", sql);
        }
    }

    #[test]
    fn test_injection_patterns() {
        let policy = policy();
        let cases = [
            ("SELECT * FROM t WHERE x='' OR '1'='1'", "quote tautology"),
            ("SELECT * FROM t WHERE id = 1 OR 1=1", "numeric tautology"),
            ("SELECT id FROM t UNION ALL SELECT passwd FROM creds", "union-based exfiltration"),
            ("SELECT 1; DROP TABLE users", "stacked statement"),
            ("SELECT * FROM t WHERE name = 'admin'--'", "comment after quote"),
            ("SEL/**/ECT * FROM t", "inline comment evasion"),
            ("SELECT pg_sleep(10)", "time-based delay"),
        ];
        for (sql, expected) in cases {
            assert_eq!(policy.injection_reason(sql), Some(expected), "{}", sql);
        }
    }

    #[test]
    fn test_dangerous_operations() {
        let policy = policy();
        assert_eq!(policy.dangerous_reason("DELETE FROM users"), Some("DELETE without WHERE"));
        assert_eq!(policy.dangerous_reason("DELETE FROM users WHERE id=5"), None);
        assert_eq!(policy.dangerous_reason("update users set admin = true"), Some("UPDATE without WHERE"));
        assert_eq!(policy.dangerous_reason("DROP TABLE orders"), Some("DROP statement"));
        assert_eq!(policy.dangerous_reason("TRUNCATE logs"), Some("TRUNCATE statement"));
        assert_eq!(
            policy.dangerous_reason("SELECT usename FROM pg_shadow"),
            Some("system catalog access")
        );
        assert_eq!(
            policy.dangerous_reason("COPY t TO PROGRAM 'curl evil'"),
            Some("COPY PROGRAM")
        );
        assert_eq!(
            policy.dangerous_reason("SELECT 1; DELETE FROM users"),
            Some("DELETE without WHERE")
        );
    }

    #[test]
    fn test_semicolons_inside_literals() {
        let policy = policy();
        assert_eq!(policy.check("UPDATE t SET x='a;b' WHERE id=1"), Verdict::Accepted);
        assert_eq!(policy.check(r#"UPDATE "odd;name" SET x = 1 WHERE id = 2"#), Verdict::Accepted);
        assert_eq!(
            policy.dangerous_reason("INSERT INTO notes VALUES ('it''s; fine'); DELETE FROM notes"),
            Some("DELETE without WHERE")
        );

        assert_eq!(
            split_statements("SELECT ';'; SELECT 2;"),
            vec!["SELECT ';'", "SELECT 2"]
        );
    }
}
