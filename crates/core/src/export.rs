//! Re-serialize a query result for download.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CoreError, CoreResult};
use crate::executor::QueryResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExportFormat {
    Csv,
    Json,
    /// `INSERT` statements into a named table.
    Sql,
}

impl ExportFormat {
    pub fn content_type(self) -> &'static str {
        match self {
            ExportFormat::Csv => "text/csv",
            ExportFormat::Json => "application/json",
            ExportFormat::Sql => "application/sql",
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            ExportFormat::Csv => "csv",
            ExportFormat::Json => "json",
            ExportFormat::Sql => "sql",
        }
    }
}

/// Render `result` in `format`. `table` is required for SQL.
pub fn export(result: &QueryResult, format: ExportFormat, table: Option<&str>) -> CoreResult<String> {
    if result.is_error() {
        return Err(CoreError::Validation(format!(
            "cannot export a failed statement: {}",
            result.error
        )));
    }
    match format {
        ExportFormat::Csv => Ok(to_csv(result)),
        ExportFormat::Json => to_json(result),
        ExportFormat::Sql => {
            let table = table.map(str::trim).filter(|t| !t.is_empty()).ok_or_else(|| {
                CoreError::Validation("SQL export requires a table name".into())
            })?;
            Ok(to_sql(result, table))
        }
    }
}

// ---------------------------------------------------------------------------
// CSV
// ---------------------------------------------------------------------------

/// Quote a CSV field if it contains a comma, quote, or line break.
fn csv_escape(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

fn csv_value(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Array(_) | Value::Object(_) => value.to_string(),
    }
}

fn to_csv(result: &QueryResult) -> String {
    let mut out = String::new();
    let header: Vec<String> = result.column_names.iter().map(|c| csv_escape(c)).collect();
    out.push_str(&header.join(","));
    out.push('\n');
    for row in &result.rows {
        let fields: Vec<String> = row.iter().map(|v| csv_escape(&csv_value(v))).collect();
        out.push_str(&fields.join(","));
        out.push('\n');
    }
    out
}

// ---------------------------------------------------------------------------
// JSON
// ---------------------------------------------------------------------------

fn to_json(result: &QueryResult) -> CoreResult<String> {
    let objects: Vec<serde_json::Map<String, Value>> = result
        .rows
        .iter()
        .map(|row| {
            result
                .column_names
                .iter()
                .cloned()
                .zip(row.iter().cloned())
                .collect()
        })
        .collect();
    serde_json::to_string_pretty(&objects)
        .map_err(|e| CoreError::Internal(format!("failed to encode export: {e}")))
}

// ---------------------------------------------------------------------------
// SQL
// ---------------------------------------------------------------------------

fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn quote_literal(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

fn sql_value(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(true) => "TRUE".to_string(),
        Value::Bool(false) => "FALSE".to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => quote_literal(s),
        Value::Array(_) | Value::Object(_) => quote_literal(&value.to_string()),
    }
}

fn to_sql(result: &QueryResult, table: &str) -> String {
    let table = table
        .split('.')
        .map(quote_ident)
        .collect::<Vec<_>>()
        .join(".");
    let columns = result
        .column_names
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ");

    let mut out = String::new();
    for row in &result.rows {
        let values = row.iter().map(sql_value).collect::<Vec<_>>().join(", ");
        out.push_str(&format!("INSERT INTO {table} ({columns}) VALUES ({values});\n"));
    }
    out
}
