//! Statement classification: SQL text to statement kind and primary table.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::registry::StatementKind;

static SELECT_TABLE_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)\bFROM\s+[`"\[]?(\w+)[`"\]]?"#).expect("valid SELECT table regex")
});

static INSERT_TABLE_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)\bINSERT\s+INTO\s+[`"\[]?(\w+)[`"\]]?"#).expect("valid INSERT table regex")
});

static UPDATE_TABLE_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)\bUPDATE\s+[`"\[]?(\w+)[`"\]]?"#).expect("valid UPDATE table regex")
});

static DELETE_TABLE_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)\bDELETE\s+FROM\s+[`"\[]?(\w+)[`"\]]?"#).expect("valid DELETE table regex")
});

/// Classify a statement by its leading keyword.
///
/// `WITH` is treated as a read, which holds for every CTE SeaORM emits.
pub fn parse_statement_kind(sql: &str) -> StatementKind {
    let keyword: String = sql
        .trim_start()
        .chars()
        .take_while(|c| c.is_ascii_alphabetic())
        .collect::<String>()
        .to_ascii_uppercase();

    match keyword.as_str() {
        "SELECT" | "WITH" => StatementKind::Select,
        "INSERT" => StatementKind::Insert,
        "UPDATE" => StatementKind::Update,
        "DELETE" => StatementKind::Delete,
        _ => StatementKind::Other,
    }
}

/// Extract the primary table name, lowercased.
pub fn extract_table(sql: &str) -> Option<String> {
    let regex = match parse_statement_kind(sql) {
        StatementKind::Select => &*SELECT_TABLE_REGEX,
        StatementKind::Insert => &*INSERT_TABLE_REGEX,
        StatementKind::Update => &*UPDATE_TABLE_REGEX,
        StatementKind::Delete => &*DELETE_TABLE_REGEX,
        StatementKind::Other => return None,
    };

    regex
        .captures(sql)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_lowercase())
}

/// Kind and table of one statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedSql {
    pub kind: StatementKind,
    pub table: Option<String>,
}

impl ParsedSql {
    pub fn parse(sql: &str) -> Self {
        Self {
            kind: parse_statement_kind(sql),
            table: extract_table(sql),
        }
    }

    /// Span name: `"SELECT users"` or `"SELECT"` when the table is unknown.
    pub fn span_name(&self) -> String {
        match &self.table {
            Some(table) => format!("{} {}", self.kind, table),
            None => self.kind.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_reads() {
        assert_eq!(parse_statement_kind("SELECT * FROM users"), StatementKind::Select);
        assert_eq!(parse_statement_kind("  select id from orders"), StatementKind::Select);
        assert_eq!(
            parse_statement_kind("WITH cte AS (SELECT 1) SELECT * FROM cte"),
            StatementKind::Select
        );
    }

    #[test]
    fn test_parse_writes() {
        assert_eq!(
            parse_statement_kind("INSERT INTO users (name) VALUES ('test')"),
            StatementKind::Insert
        );
        assert_eq!(
            parse_statement_kind("UPDATE users SET name = 'test' WHERE id = 1"),
            StatementKind::Update
        );
        assert_eq!(
            parse_statement_kind("DELETE FROM users WHERE id = 1"),
            StatementKind::Delete
        );
    }

    #[test]
    fn test_parse_other() {
        assert_eq!(parse_statement_kind("BEGIN"), StatementKind::Other);
        assert_eq!(parse_statement_kind("CREATE TABLE t (id int)"), StatementKind::Other);
        assert_eq!(parse_statement_kind(""), StatementKind::Other);
        // keyword must stand alone
        assert_eq!(parse_statement_kind("SELECTED"), StatementKind::Other);
    }

    #[test]
    fn test_extract_table() {
        assert_eq!(
            extract_table(r#"SELECT "cake"."id" FROM "Cake" WHERE id = 1"#),
            Some("cake".to_string())
        );
        assert_eq!(
            extract_table(r#"INSERT INTO `fruit` (`name`, `cake_id`) VALUES (?, ?)"#),
            Some("fruit".to_string())
        );
        assert_eq!(
            extract_table(r#"UPDATE "baker" SET "name" = $1 WHERE "id" = $2"#),
            Some("baker".to_string())
        );
        assert_eq!(
            extract_table("DELETE FROM [cakes_bakers] WHERE cake_id = @P1"),
            Some("cakes_bakers".to_string())
        );
        assert_eq!(extract_table("COMMIT"), None);
    }

    #[test]
    fn test_span_name() {
        assert_eq!(ParsedSql::parse("SELECT * FROM users").span_name(), "SELECT users");
        assert_eq!(ParsedSql::parse("BEGIN").span_name(), "OTHER");
    }
}
