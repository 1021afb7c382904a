//! Fixtures shared by the engine's unit tests.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rollgate_core::catalog::{CreateDatabase, CreateDatabaseGroup, CreateInstance, DeploymentConfig, Engine, Instance};
use rollgate_core::error::{CoreError, CoreResult};
use rollgate_core::executor::{Column, Connection, StatementError, StatementOutput};
use rollgate_core::rollout::{ChangeKind, CreatePlan, Plan, Spec, Target};
use rollgate_core::store::Store;

use crate::config::SchedulerConfig;

pub const PROJECT: &str = "hr";
pub const GROUP: &str = "projects/hr/databaseGroups/employees";
pub const WORKER: &str = "worker-a";

/// Fast polling under a fixed worker id, so tests can claim runs on the
/// runner's behalf.
pub fn scheduler_config() -> SchedulerConfig {
    SchedulerConfig {
        dispatch_poll_interval: Duration::from_millis(10),
        cancel_poll_interval: Duration::from_millis(10),
        worker_id: WORKER.into(),
        ..Default::default()
    }
}

/// `pg-test` (test) holds `employee_01`; `pg-prod` (prod) holds
/// `employee_01` and `employee_02`. Pipeline is test then prod.
pub async fn seed_inventory(store: &dyn Store) {
    for (id, env) in [("pg-test", "test"), ("pg-prod", "prod")] {
        store
            .create_instance(&CreateInstance {
                id: id.into(),
                title: None,
                engine: Engine::Postgres,
                environment_id: env.into(),
                data_source_url: format!("postgres://localhost/{id}"),
            })
            .await
            .unwrap();
    }
    for (instance, name) in [("pg-test", "employee_01"), ("pg-prod", "employee_01"), ("pg-prod", "employee_02")] {
        store
            .create_database(
                instance,
                &CreateDatabase {
                    name: name.into(),
                    project_id: PROJECT.into(),
                    environment_id: None,
                },
            )
            .await
            .unwrap();
    }
    store
        .upsert_deployment_config(&DeploymentConfig {
            project_id: PROJECT.into(),
            environments: vec!["test".into(), "prod".into()],
        })
        .await
        .unwrap();
    store
        .create_database_group(
            PROJECT,
            &CreateDatabaseGroup {
                group_id: "employees".into(),
                title: None,
                expression: r#"resource.database_name.startsWith("employee_")"#.into(),
            },
        )
        .await
        .unwrap();
}

/// A single-spec schema migration plan over the employee group.
pub async fn create_plan(store: &dyn Store, sql: &str) -> Plan {
    store
        .create_plan(
            PROJECT,
            &CreatePlan {
                title: "add table".into(),
                specs: vec![Spec {
                    id: "s1".into(),
                    kind: ChangeKind::SchemaMigration,
                    target: Target::DatabaseGroup { group: GROUP.into() },
                    sql: sql.into(),
                }],
                creator: Some("alice".into()),
            },
        )
        .await
        .unwrap()
}

/// Records every statement; fails statements containing `boom` and sleeps
/// on `pg_sleep`.
#[derive(Default)]
pub struct FakeProvider {
    pub statements: Arc<Mutex<Vec<String>>>,
    pub fail_connect: bool,
}

impl FakeProvider {
    pub fn executed(&self) -> Vec<String> {
        self.statements.lock().unwrap().clone()
    }
}

#[async_trait]
impl crate::connection::ConnectionProvider for FakeProvider {
    async fn connect(&self, instance: &Instance, _database: Option<&str>) -> CoreResult<Box<dyn Connection>> {
        if self.fail_connect {
            return Err(CoreError::Execution(format!("failed to connect to instance {}", instance.id)));
        }
        Ok(Box::new(FakeTarget {
            statements: self.statements.clone(),
        }))
    }
}

struct FakeTarget {
    statements: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl Connection for FakeTarget {
    async fn execute(&mut self, statement: &str) -> Result<StatementOutput, StatementError> {
        self.statements.lock().unwrap().push(statement.trim().to_string());
        if statement.contains("boom") {
            return Err(StatementError("syntax error at or near \"boom\"".into()));
        }
        if statement.contains("pg_sleep") {
            tokio::time::sleep(Duration::from_millis(100)).await;
            return Ok(StatementOutput::Affected(0));
        }
        if statement.trim_start().to_ascii_uppercase().starts_with("SELECT") {
            return Ok(StatementOutput::Rows {
                columns: vec![Column {
                    name: "?column?".into(),
                    type_name: "INT4".into(),
                }],
                rows: vec![vec![serde_json::Value::from(1)]],
            });
        }
        Ok(StatementOutput::Affected(1))
    }
}
