//! Statement summary used as auxiliary risk metadata.
//!
//! A summary failure never blocks risk classification; callers record it as
//! a diagnostic and classify with the fallback context.

use serde::{Deserialize, Serialize};

use crate::catalog::Engine;
use crate::statement::{leading_keywords, split};

/// Statement types and an affected-row estimate for one target's SQL.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatementSummary {
    /// Distinct statement types in source order, e.g. `CREATE_TABLE`, `INSERT`.
    pub statement_types: Vec<String>,
    pub affected_rows: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("failed to summarize statement: {0}")]
pub struct AdvisorError(pub String);

/// Produces statement summaries for risk evaluation.
pub trait StatementAdvisor: Send + Sync {
    fn summarize(&self, engine: Engine, sql: &str) -> Result<StatementSummary, AdvisorError>;
}

/// Keyword-based advisor: classifies each statement by its leading words.
///
/// It does not estimate affected rows (always reports 0), so row-count rules
/// only fire through the fallback context.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeywordAdvisor;

/// Statement type for a statement's leading keywords, or `None` when the
/// leading token is not recognised.
fn statement_type(words: &[String]) -> Option<String> {
    let first = words.first()?.as_str();
    let second = words.get(1).map(String::as_str).unwrap_or("");
    let object = |second: &str| match second {
        "TABLE" | "INDEX" | "VIEW" | "SEQUENCE" | "SCHEMA" | "DATABASE" | "FUNCTION"
        | "PROCEDURE" | "TRIGGER" | "TYPE" | "EXTENSION" => Some(second.to_string()),
        "UNIQUE" => Some("INDEX".to_string()),
        "OR" => Some("OR_REPLACE".to_string()),
        _ => None,
    };

    match first {
        "CREATE" | "ALTER" | "DROP" => {
            let object = object(second)?;
            Some(format!("{first}_{object}"))
        }
        "TRUNCATE" | "INSERT" | "UPDATE" | "DELETE" | "SELECT" | "WITH" | "COMMENT" | "GRANT"
        | "REVOKE" | "SET" | "BEGIN" | "COMMIT" | "ROLLBACK" | "RENAME" | "EXPLAIN" | "MERGE"
        | "REPLACE" | "VACUUM" | "ANALYZE" => Some(first.to_string()),
        _ => None,
    }
}

impl StatementAdvisor for KeywordAdvisor {
    fn summarize(&self, _engine: Engine, sql: &str) -> Result<StatementSummary, AdvisorError> {
        let mut summary = StatementSummary::default();

        for stmt in split(sql) {
            let words = leading_keywords(stmt.text, 2);
            let Some(kind) = statement_type(&words) else {
                let token = words.first().map(String::as_str).unwrap_or("");
                return Err(AdvisorError(format!(
                    "syntax error at or near \"{}\"",
                    token.to_ascii_lowercase()
                )));
            };
            if !summary.statement_types.contains(&kind) {
                summary.statement_types.push(kind);
            }
        }

        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn classifies_ddl_and_dml() {
        let summary = KeywordAdvisor
            .summarize(
                Engine::Postgres,
                "CREATE TABLE t (id int); INSERT INTO t VALUES (1); insert into t values (2); create unique index i on t(id);",
            )
            .unwrap();
        assert_eq!(summary.statement_types, vec!["CREATE_TABLE", "INSERT", "CREATE_INDEX"]);
        assert_eq!(summary.affected_rows, 0);
    }

    #[test]
    fn unknown_leading_token_is_an_error() {
        assert_matches!(
            KeywordAdvisor.summarize(Engine::Postgres, "hh"),
            Err(AdvisorError(msg)) if msg.contains("\"hh\"")
        );
    }

    #[test]
    fn create_without_known_object_is_an_error() {
        assert!(KeywordAdvisor.summarize(Engine::Mysql, "CREATE hh;").is_err());
    }

    #[test]
    fn empty_script_has_empty_summary() {
        let summary = KeywordAdvisor.summarize(Engine::Postgres, "  -- nothing\n").unwrap();
        assert!(summary.statement_types.is_empty());
    }
}
