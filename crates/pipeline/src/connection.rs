//! Sessions on target databases.
//!
//! The engine only sees [`Connection`]; [`ConnectionProvider`] decides how
//! an instance is reached. [`PgConnectionProvider`] opens a dedicated
//! `sqlx` connection per session and runs each statement through the simple
//! query protocol, so every value arrives in text form.

use std::str::FromStr;

use async_trait::async_trait;
use futures::TryStreamExt;
use rollgate_core::catalog::{Engine, Instance};
use rollgate_core::error::{CoreError, CoreResult};
use rollgate_core::executor::{Column, Connection, StatementError, StatementOutput};
use serde_json::Value;
use sqlx::postgres::{PgConnectOptions, PgConnection, PgRow};
use sqlx::{Column as _, ConnectOptions, Either, Row, TypeInfo};

/// Opens connections to registered instances.
#[async_trait]
pub trait ConnectionProvider: Send + Sync {
    /// Connect to `database` on `instance`, or to the instance's default
    /// database when `None` (used for `CREATE DATABASE`).
    async fn connect(&self, instance: &Instance, database: Option<&str>) -> CoreResult<Box<dyn Connection>>;
}

/// PostgreSQL targets reached through `Instance::data_source_url`.
#[derive(Debug, Clone, Copy, Default)]
pub struct PgConnectionProvider;

#[async_trait]
impl ConnectionProvider for PgConnectionProvider {
    async fn connect(&self, instance: &Instance, database: Option<&str>) -> CoreResult<Box<dyn Connection>> {
        if instance.engine != Engine::Postgres {
            return Err(CoreError::Execution(format!(
                "engine {} of instance {} is not supported",
                instance.engine, instance.id
            )));
        }

        let mut options = PgConnectOptions::from_str(&instance.data_source_url).map_err(|e| {
            CoreError::Validation(format!("invalid data source url for instance {}: {e}", instance.id))
        })?;
        if let Some(database) = database {
            options = options.database(database);
        }

        let conn = options.connect().await.map_err(|e| {
            CoreError::Execution(format!("failed to connect to instance {}: {e}", instance.id))
        })?;

        tracing::debug!(instance_id = %instance.id, database = ?database, "Target connection opened");
        Ok(Box::new(PgTargetConnection { conn }))
    }
}

pub struct PgTargetConnection {
    conn: PgConnection,
}

#[async_trait]
impl Connection for PgTargetConnection {
    async fn execute(&mut self, statement: &str) -> Result<StatementOutput, StatementError> {
        let mut stream = sqlx::raw_sql(statement).fetch_many(&mut self.conn);

        let mut columns: Option<Vec<Column>> = None;
        let mut rows = Vec::new();
        let mut affected = 0u64;

        while let Some(item) = stream.try_next().await.map_err(statement_error)? {
            match item {
                Either::Left(done) => affected += done.rows_affected(),
                Either::Right(row) => {
                    let cols = columns.get_or_insert_with(|| columns_of(&row));
                    rows.push(row_values(&row, cols));
                }
            }
        }

        Ok(match columns {
            Some(columns) => StatementOutput::Rows { columns, rows },
            None => StatementOutput::Affected(affected),
        })
    }
}

fn statement_error(e: sqlx::Error) -> StatementError {
    match e.as_database_error() {
        Some(db) => StatementError(db.message().to_string()),
        None => StatementError(e.to_string()),
    }
}

fn columns_of(row: &PgRow) -> Vec<Column> {
    row.columns()
        .iter()
        .map(|c| Column {
            name: c.name().to_string(),
            type_name: c.type_info().name().to_string(),
        })
        .collect()
}

fn row_values(row: &PgRow, columns: &[Column]) -> Vec<Value> {
    columns
        .iter()
        .enumerate()
        .map(|(i, col)| {
            // Simple-query results are text encoded; read them unchecked.
            let raw = row.try_get_unchecked::<Option<String>, _>(i).ok().flatten();
            text_to_json(&col.type_name, raw)
        })
        .collect()
}

fn text_to_json(type_name: &str, raw: Option<String>) -> Value {
    let Some(raw) = raw else {
        return Value::Null;
    };
    match type_name {
        "INT2" | "INT4" | "INT8" | "OID" => raw.parse::<i64>().map(Value::from).unwrap_or(Value::String(raw)),
        "FLOAT4" | "FLOAT8" => raw
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number)
            .unwrap_or(Value::String(raw)),
        "BOOL" => Value::Bool(raw == "t"),
        "JSON" | "JSONB" => serde_json::from_str(&raw).unwrap_or(Value::String(raw)),
        _ => Value::String(raw),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use chrono::Utc;

    #[test]
    fn text_values_map_to_json_by_type() {
        assert_eq!(text_to_json("INT4", Some("42".into())), Value::from(42));
        assert_eq!(text_to_json("BOOL", Some("t".into())), Value::Bool(true));
        assert_eq!(text_to_json("FLOAT8", Some("1.5".into())), Value::from(1.5));
        assert_eq!(text_to_json("JSONB", Some(r#"{"a":1}"#.into()))["a"], 1);
        assert_eq!(text_to_json("NUMERIC", Some("1.10".into())), Value::from("1.10"));
        assert_eq!(text_to_json("TEXT", None), Value::Null);
    }

    #[tokio::test]
    async fn non_postgres_instances_are_rejected() {
        let instance = Instance {
            id: "my-prod".into(),
            title: "mysql".into(),
            engine: Engine::Mysql,
            environment_id: "prod".into(),
            data_source_url: "mysql://localhost/app".into(),
            created_at: Utc::now(),
        };
        let result = PgConnectionProvider.connect(&instance, None).await;
        assert_matches!(result.err(), Some(CoreError::Execution(msg)) if msg.contains("MYSQL"));
    }
}
