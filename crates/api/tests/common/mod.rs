#![allow(dead_code)]

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Method, Request, Response, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tokio::sync::Notify;
use tower::ServiceExt;

use rollgate_api::config::{ServerConfig, StoreBackend};
use rollgate_api::router::build_app_router;
use rollgate_api::state::AppState;
use rollgate_core::catalog::Instance;
use rollgate_core::error::{CoreError, CoreResult};
use rollgate_core::executor::{Column, Connection, NoopMasker, StatementError, StatementOutput};
use rollgate_core::scheduling::StageSequencing;
use rollgate_core::store::MemoryStore;
use rollgate_events::EventBus;
use rollgate_pipeline::{ConnectionProvider, SchedulerConfig, TaskRunner};

pub const PROJECT: &str = "hr";

/// Build a test `ServerConfig` with safe defaults.
pub fn test_config() -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        cors_origins: vec!["http://localhost:5173".to_string()],
        request_timeout_secs: 30,
        shutdown_timeout_secs: 30,
        store_backend: StoreBackend::Memory,
        embedded_worker: false,
        enforce_approval: false,
    }
}

/// Handles a test needs beside the router to drive the background side of
/// the system by hand.
pub struct TestApp {
    pub router: Router,
    pub store: Arc<MemoryStore>,
    pub event_bus: Arc<EventBus>,
    pub target: Arc<FakeTargetDb>,
}

impl TestApp {
    /// Run every pending task run to completion, the way a worker would.
    pub async fn drain_task_runs(&self) -> usize {
        use rollgate_core::store::RolloutStore;

        let config = SchedulerConfig {
            cancel_poll_interval: Duration::from_millis(10),
            worker_id: "test-worker".into(),
            ..Default::default()
        };
        let runner = TaskRunner::new(
            self.store.clone(),
            self.target.clone(),
            self.event_bus.clone(),
            &config,
        );
        let mut ran = 0;
        while let Some((run, task)) = self.store.claim_pending_task_run(runner.lease()).await.unwrap() {
            runner.run(run, task).await.unwrap();
            ran += 1;
        }
        ran
    }
}

/// Build the full application router over an in-memory store and a fake
/// target database, using the same middleware stack as production.
pub fn build_test_app() -> TestApp {
    build_test_app_with(test_config())
}

pub fn build_test_app_with(config: ServerConfig) -> TestApp {
    let store = Arc::new(MemoryStore::new());
    let event_bus = Arc::new(EventBus::default());
    let target = Arc::new(FakeTargetDb::default());

    let state = AppState::new(
        store.clone(),
        None,
        config.clone(),
        event_bus.clone(),
        StageSequencing::default(),
        target.clone(),
        Arc::new(NoopMasker),
        Arc::new(Notify::new()),
    );

    TestApp {
        router: build_app_router(state, &config),
        store,
        event_bus,
        target,
    }
}

// ---------------------------------------------------------------------------
// Fake target database
// ---------------------------------------------------------------------------

/// A single shared table `t(id)` with a unique id. Understands
/// `INSERT ... (n)`, `SELECT ...`, and fails anything containing `boom`.
/// Every other statement affects zero rows.
#[derive(Default)]
pub struct FakeTargetDb {
    ids: Arc<Mutex<BTreeSet<i64>>>,
    pub statements: Arc<Mutex<Vec<String>>>,
}

impl FakeTargetDb {
    pub fn executed(&self) -> Vec<String> {
        self.statements.lock().unwrap().clone()
    }
}

#[async_trait]
impl ConnectionProvider for FakeTargetDb {
    async fn connect(&self, instance: &Instance, _database: Option<&str>) -> CoreResult<Box<dyn Connection>> {
        if instance.id.contains("offline") {
            return Err(CoreError::Execution(format!("failed to connect to instance {}", instance.id)));
        }
        Ok(Box::new(FakeSession {
            ids: self.ids.clone(),
            statements: self.statements.clone(),
        }))
    }
}

struct FakeSession {
    ids: Arc<Mutex<BTreeSet<i64>>>,
    statements: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl Connection for FakeSession {
    async fn execute(&mut self, statement: &str) -> Result<StatementOutput, StatementError> {
        let statement = statement.trim();
        self.statements.lock().unwrap().push(statement.to_string());
        let upper = statement.to_ascii_uppercase();

        if upper.contains("BOOM") {
            return Err(StatementError(format!("syntax error at or near \"{statement}\"")));
        }
        if upper.starts_with("INSERT") {
            let digits: String = statement.chars().filter(char::is_ascii_digit).collect();
            let id: i64 = digits.parse().unwrap_or_default();
            if !self.ids.lock().unwrap().insert(id) {
                return Err(StatementError(format!(
                    "duplicate key value violates unique constraint \"t_pkey\": Key (id)=({id}) already exists"
                )));
            }
            return Ok(StatementOutput::Affected(1));
        }
        if upper.starts_with("SELECT") {
            let rows = self.ids.lock().unwrap().iter().map(|id| vec![json!(id)]).collect();
            return Ok(StatementOutput::Rows {
                columns: vec![Column {
                    name: "id".into(),
                    type_name: "INT8".into(),
                }],
                rows,
            });
        }
        Ok(StatementOutput::Affected(0))
    }
}

// ---------------------------------------------------------------------------
// HTTP helpers
// ---------------------------------------------------------------------------

pub async fn get(app: &Router, uri: &str) -> Response<Body> {
    send(app, Method::GET, uri, None).await
}

pub async fn post_json(app: &Router, uri: &str, body: Value) -> Response<Body> {
    send(app, Method::POST, uri, Some(body)).await
}

pub async fn put_json(app: &Router, uri: &str, body: Value) -> Response<Body> {
    send(app, Method::PUT, uri, Some(body)).await
}

async fn send(app: &Router, method: Method, uri: &str, body: Option<Value>) -> Response<Body> {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    app.clone().oneshot(request).await.unwrap()
}

pub async fn body_json(response: Response<Body>) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

pub async fn body_text(response: Response<Body>) -> String {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}

/// Assert `status` and return the `data` field of the envelope.
pub async fn expect_data(response: Response<Body>, status: StatusCode) -> Value {
    assert_eq!(response.status(), status);
    body_json(response).await["data"].clone()
}

// ---------------------------------------------------------------------------
// Inventory fixture
// ---------------------------------------------------------------------------

/// Two instances, `pg-test` (environment `test`) and `pg-prod` (`prod`):
///
/// - `pg-test`: `employee_01`
/// - `pg-prod`: `employee_01`, `employee_02`, `payroll`
///
/// plus a `[test, prod]` pipeline and an `employees` group matching every
/// `employee_` database.
pub async fn seed_inventory(app: &Router) {
    for (id, env) in [("pg-test", "test"), ("pg-prod", "prod")] {
        let response = post_json(
            app,
            "/api/v1/instances",
            json!({
                "id": id,
                "engine": "POSTGRES",
                "environment_id": env,
                "data_source_url": format!("postgres://rollgate@{id}:5432/postgres"),
            }),
        )
        .await;
        assert_eq!(response.status(), StatusCode::CREATED);
    }

    for (instance, name) in [
        ("pg-test", "employee_01"),
        ("pg-prod", "employee_01"),
        ("pg-prod", "employee_02"),
        ("pg-prod", "payroll"),
    ] {
        let response = post_json(
            app,
            &format!("/api/v1/instances/{instance}/databases"),
            json!({ "name": name, "project_id": PROJECT }),
        )
        .await;
        assert_eq!(response.status(), StatusCode::CREATED);
    }

    let response = put_json(
        app,
        &format!("/api/v1/projects/{PROJECT}/deployment-config"),
        json!({ "environments": ["test", "prod"] }),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);

    let response = post_json(
        app,
        &format!("/api/v1/projects/{PROJECT}/database-groups"),
        json!({
            "group_id": "employees",
            "expression": r#"resource.database_name.startsWith("employee_")"#,
        }),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CREATED);
}

/// Create a schema migration plan over the `employees` group. Returns the
/// plan resource name.
pub async fn create_group_plan(app: &Router, sql: &str) -> String {
    let response = post_json(
        app,
        &format!("/api/v1/projects/{PROJECT}/plans"),
        json!({
            "title": "add audit table",
            "creator": "alice",
            "specs": [{
                "id": "s1",
                "kind": "SCHEMA_MIGRATION",
                "target": {
                    "type": "DATABASE_GROUP",
                    "group": format!("projects/{PROJECT}/databaseGroups/employees"),
                },
                "sql": sql,
            }],
        }),
    )
    .await;
    let plan = expect_data(response, StatusCode::CREATED).await;
    format!("projects/{PROJECT}/plans/{}", plan["id"])
}

/// Create a rollout from a plan and return its JSON.
pub async fn create_rollout(app: &Router, plan: &str) -> Value {
    let response = post_json(
        app,
        &format!("/api/v1/projects/{PROJECT}/rollouts"),
        json!({ "plan": plan }),
    )
    .await;
    expect_data(response, StatusCode::CREATED).await
}

/// Resource name of a task in rollout JSON.
pub fn task_name(rollout: &Value, stage: usize, task: usize) -> String {
    format!(
        "projects/{PROJECT}/rollouts/{}/stages/{}/tasks/{}",
        rollout["id"], rollout["stages"][stage]["id"], rollout["stages"][stage]["tasks"][task]["id"]
    )
}

/// URI of a stage in rollout JSON.
pub fn stage_uri(rollout: &Value, stage: usize) -> String {
    format!(
        "/api/v1/projects/{PROJECT}/rollouts/{}/stages/{}",
        rollout["id"], rollout["stages"][stage]["id"]
    )
}
