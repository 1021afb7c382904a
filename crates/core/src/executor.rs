//! Statement executor.
//!
//! A script is split into statements ([`crate::statement::split`]) which run
//! one at a time, in source order, on a single [`Connection`]. One
//! [`QueryResult`] is produced per executed statement. The failure policy
//! decides whether a failing statement ends the script.

use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::statement::split;

/// Column name used for statements that produce no rows.
pub const AFFECTED_ROWS_COLUMN: &str = "Affected Rows";

// ---------------------------------------------------------------------------
// Connection seam
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub type_name: String,
}

/// What a single statement produced.
#[derive(Debug, Clone, PartialEq)]
pub enum StatementOutput {
    Rows {
        columns: Vec<Column>,
        rows: Vec<Vec<serde_json::Value>>,
    },
    Affected(u64),
}

/// Error raised by the target database for one statement.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct StatementError(pub String);

/// A session on a target database. Statements on one connection never run
/// concurrently.
#[async_trait]
pub trait Connection: Send {
    async fn execute(&mut self, statement: &str) -> Result<StatementOutput, StatementError>;
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// Result of one executed statement.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub column_names: Vec<String>,
    pub column_type_names: Vec<String>,
    pub rows: Vec<Vec<serde_json::Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub affected_rows: Option<u64>,
    /// Exact source text dispatched for this statement.
    pub statement: String,
    /// Empty on success.
    pub error: String,
    pub latency_ms: u64,
}

impl QueryResult {
    pub fn is_error(&self) -> bool {
        !self.error.is_empty()
    }

    fn from_output(statement: &str, output: StatementOutput, limit: Option<usize>) -> Self {
        match output {
            StatementOutput::Rows { columns, mut rows } => {
                if let Some(limit) = limit {
                    rows.truncate(limit);
                }
                let (column_names, column_type_names): (Vec<String>, Vec<String>) =
                    columns.into_iter().map(|c| (c.name, c.type_name)).unzip();
                QueryResult {
                    column_names,
                    column_type_names,
                    rows,
                    statement: statement.to_string(),
                    ..Default::default()
                }
            }
            StatementOutput::Affected(n) => QueryResult {
                column_names: vec![AFFECTED_ROWS_COLUMN.to_string()],
                column_type_names: vec!["INT".to_string()],
                rows: vec![vec![serde_json::Value::from(n)]],
                affected_rows: Some(n),
                statement: statement.to_string(),
                ..Default::default()
            },
        }
    }

    fn from_error(statement: &str, error: &StatementError) -> Self {
        QueryResult {
            statement: statement.to_string(),
            error: error.0.clone(),
            ..Default::default()
        }
    }
}

/// Post-processing applied to interactive query results (e.g. redaction).
pub trait ResultMasker: Send + Sync {
    fn mask(&self, result: &mut QueryResult);
}

/// Leaves results untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMasker;

impl ResultMasker for NoopMasker {
    fn mask(&self, _result: &mut QueryResult) {}
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionPolicy {
    /// Record the error on the failing statement and keep going.
    #[default]
    ContinueOnError,
    /// Stop at the first failing statement and report it as the call's error.
    StopOnError,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ExecuteOptions {
    pub policy: ExecutionPolicy,
    /// Maximum rows kept per result.
    pub limit: Option<usize>,
}

impl ExecuteOptions {
    pub fn continue_on_error() -> Self {
        Self {
            policy: ExecutionPolicy::ContinueOnError,
            limit: None,
        }
    }

    pub fn stop_on_error() -> Self {
        Self {
            policy: ExecutionPolicy::StopOnError,
            limit: None,
        }
    }
}

/// The statement that ended a stop-on-error script.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[error("statement {index} failed: {message}")]
pub struct StatementFailure {
    /// Zero-based position of the failing statement.
    pub index: usize,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScriptExecution {
    pub results: Vec<QueryResult>,
    /// Set only under [`ExecutionPolicy::StopOnError`].
    pub error: Option<StatementFailure>,
    /// Cancellation was observed before all statements ran.
    pub canceled: bool,
}

/// Execute `script` on `conn` under `options`.
///
/// Cancellation is checked between statements only; a statement already
/// dispatched always runs to completion and keeps its result.
pub async fn execute_script<C>(
    conn: &mut C,
    script: &str,
    options: &ExecuteOptions,
    cancel: &CancellationToken,
) -> ScriptExecution
where
    C: Connection + ?Sized,
{
    let mut out = ScriptExecution::default();

    for (index, stmt) in split(script).into_iter().enumerate() {
        if cancel.is_cancelled() {
            tracing::info!(index, "Execution canceled between statements");
            out.canceled = true;
            break;
        }

        let started = Instant::now();
        let outcome = conn.execute(stmt.text).await;
        let latency_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(output) => {
                let mut result = QueryResult::from_output(stmt.text, output, options.limit);
                result.latency_ms = latency_ms;
                out.results.push(result);
            }
            Err(err) => {
                let mut result = QueryResult::from_error(stmt.text, &err);
                result.latency_ms = latency_ms;
                out.results.push(result);
                if options.policy == ExecutionPolicy::StopOnError {
                    out.error = Some(StatementFailure {
                        index,
                        message: err.0,
                    });
                    break;
                }
            }
        }
    }

    out
}

/// Interactive query path: continue-on-error, then mask each result.
pub async fn query<C>(
    conn: &mut C,
    script: &str,
    limit: Option<usize>,
    masker: &dyn ResultMasker,
) -> Vec<QueryResult>
where
    C: Connection + ?Sized,
{
    let options = ExecuteOptions {
        policy: ExecutionPolicy::ContinueOnError,
        limit,
    };
    let mut results = execute_script(conn, script, &options, &CancellationToken::new())
        .await
        .results;
    for result in &mut results {
        masker.mask(result);
    }
    results
}

/// Administrative execute path: continue-on-error without masking.
pub async fn admin_execute<C>(conn: &mut C, script: &str, limit: Option<usize>) -> Vec<QueryResult>
where
    C: Connection + ?Sized,
{
    let options = ExecuteOptions {
        policy: ExecutionPolicy::ContinueOnError,
        limit,
    };
    execute_script(conn, script, &options, &CancellationToken::new())
        .await
        .results
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::HashSet;

    use super::*;

    /// In-memory connection that understands just enough SQL for tests:
    /// `INSERT INTO t VALUES (id, ...)` with a unique `id`, `SELECT` returning
    /// stored ids, and anything containing `boom` failing.
    #[derive(Debug, Default)]
    pub struct FakeConnection {
        pub ids: HashSet<i64>,
        pub executed: Vec<String>,
    }

    #[async_trait]
    impl Connection for FakeConnection {
        async fn execute(&mut self, statement: &str) -> Result<StatementOutput, StatementError> {
            self.executed.push(statement.to_string());
            let upper = statement.trim().to_ascii_uppercase();
            if upper.contains("BOOM") {
                return Err(StatementError("syntax error at or near \"boom\"".into()));
            }
            if upper.starts_with("INSERT") {
                let id: i64 = statement
                    .split('(')
                    .nth(1)
                    .and_then(|s| s.split(',').next())
                    .and_then(|s| s.trim().parse().ok())
                    .unwrap_or_default();
                if !self.ids.insert(id) {
                    return Err(StatementError(format!(
                        "duplicate key value violates unique constraint \"t_pkey\": Key (id)=({id}) already exists."
                    )));
                }
                return Ok(StatementOutput::Affected(1));
            }
            if upper.starts_with("SELECT") {
                let mut ids: Vec<_> = self.ids.iter().copied().collect();
                ids.sort_unstable();
                return Ok(StatementOutput::Rows {
                    columns: vec![Column {
                        name: "id".into(),
                        type_name: "INT8".into(),
                    }],
                    rows: ids.into_iter().map(|id| vec![serde_json::Value::from(id)]).collect(),
                });
            }
            Ok(StatementOutput::Affected(0))
        }
    }
}
