//! Plan -> rollout -> batch operations, end to end over the in-memory store.

mod common;

use assert_matches::assert_matches;
use axum::http::StatusCode;
use common::{
    body_json, create_group_plan, create_rollout, expect_data, get, post_json, seed_inventory, stage_uri,
    task_name, PROJECT,
};
use serde_json::{json, Value};

const DDL: &str = "CREATE TABLE audit (id int);";

async fn seeded_rollout(app: &common::TestApp) -> Value {
    seed_inventory(&app.router).await;
    let plan = create_group_plan(&app.router, DDL).await;
    create_rollout(&app.router, &plan).await
}

#[tokio::test]
async fn rollout_has_one_stage_per_environment_in_pipeline_order() {
    let app = common::build_test_app();
    let rollout = seeded_rollout(&app).await;

    let stages = rollout["stages"].as_array().unwrap();
    assert_eq!(stages.len(), 2);
    assert_eq!(stages[0]["environment_id"], "test");
    assert_eq!(stages[0]["tasks"].as_array().unwrap().len(), 1);
    assert_eq!(stages[1]["environment_id"], "prod");
    assert_eq!(stages[1]["tasks"].as_array().unwrap().len(), 2);
    for task in stages.iter().flat_map(|s| s["tasks"].as_array().unwrap()) {
        assert_eq!(task["status"], "NOT_STARTED");
        assert_eq!(task["sql"], DDL);
    }
}

#[tokio::test]
async fn second_rollout_for_plan_is_a_conflict() {
    let app = common::build_test_app();
    seed_inventory(&app.router).await;
    let plan = create_group_plan(&app.router, DDL).await;
    create_rollout(&app.router, &plan).await;

    let response = post_json(
        &app.router,
        &format!("/api/v1/projects/{PROJECT}/rollouts"),
        json!({ "plan": plan }),
    )
    .await;

    assert_eq!(response.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn rollout_without_deployment_config_fails_precondition() {
    let app = common::build_test_app();
    let plan = create_group_plan(&app.router, DDL).await;

    let response = post_json(
        &app.router,
        &format!("/api/v1/projects/{PROJECT}/rollouts"),
        json!({ "plan": plan }),
    )
    .await;

    assert_eq!(response.status(), StatusCode::PRECONDITION_FAILED);
}

#[tokio::test]
async fn plan_from_another_project_is_rejected() {
    let app = common::build_test_app();

    let response = post_json(
        &app.router,
        &format!("/api/v1/projects/{PROJECT}/rollouts"),
        json!({ "plan": "projects/finance/plans/1" }),
    )
    .await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn duplicate_batch_run_creates_one_run() {
    let app = common::build_test_app();
    let rollout = seeded_rollout(&app).await;
    let body = json!({ "tasks": [task_name(&rollout, 0, 0)], "creator": "alice" });

    let run_uri = format!("{}/run", stage_uri(&rollout, 0));

    let first = expect_data(post_json(&app.router, &run_uri, body.clone()).await, StatusCode::OK).await;
    assert_eq!(first[0]["outcome"], "CREATED");
    assert_eq!(first[0]["task_run"]["attempt"], 1);
    assert_eq!(first[0]["task_run"]["creator"], "alice");

    let second = expect_data(post_json(&app.router, &run_uri, body).await, StatusCode::OK).await;
    assert_eq!(second[0]["outcome"], "ALREADY_ACTIVE");
    assert_eq!(second[0]["status"], "PENDING");

    let runs_uri = format!(
        "{}/tasks/{}/task-runs",
        stage_uri(&rollout, 0),
        rollout["stages"][0]["tasks"][0]["id"]
    );
    let runs = expect_data(get(&app.router, &runs_uri).await, StatusCode::OK).await;
    assert_eq!(runs.as_array().unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_batch_runs_create_one_run_per_task() {
    let app = common::build_test_app();
    let rollout = seeded_rollout(&app).await;
    let uri = format!("{}/run", stage_uri(&rollout, 1));
    let body = json!({ "tasks": [task_name(&rollout, 1, 0), task_name(&rollout, 1, 1)] });

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let router = app.router.clone();
            let uri = uri.clone();
            let body = body.clone();
            tokio::spawn(async move { post_json(&router, &uri, body).await })
        })
        .collect();

    let mut created = 0;
    for handle in handles {
        let data = expect_data(handle.await.unwrap(), StatusCode::OK).await;
        created += data
            .as_array()
            .unwrap()
            .iter()
            .filter(|t| t["outcome"] == "CREATED")
            .count();
    }
    assert_eq!(created, 2);
}

#[tokio::test]
async fn runs_execute_and_a_finished_task_is_not_rerun_by_trigger() {
    let app = common::build_test_app();
    let rollout = seeded_rollout(&app).await;
    let body = json!({ "tasks": [task_name(&rollout, 0, 0)] });
    let run_uri = format!("{}/run", stage_uri(&rollout, 0));

    expect_data(post_json(&app.router, &run_uri, body.clone()).await, StatusCode::OK).await;
    assert_eq!(app.drain_task_runs().await, 1);
    assert_eq!(app.target.executed(), vec![DDL.to_string()]);

    let rollout_uri = format!("/api/v1/projects/{PROJECT}/rollouts/{}", rollout["id"]);
    let refreshed = expect_data(get(&app.router, &rollout_uri).await, StatusCode::OK).await;
    assert_eq!(refreshed["stages"][0]["tasks"][0]["status"], "DONE");

    // A plain run request leaves a done task alone.
    let again = expect_data(post_json(&app.router, &run_uri, body.clone()).await, StatusCode::OK).await;
    assert_eq!(again[0]["outcome"], "UNCHANGED");
    assert_eq!(again[0]["status"], "DONE");

    // An explicit re-run creates attempt 2.
    let rerun = expect_data(
        post_json(&app.router, &format!("{}/rerun", stage_uri(&rollout, 0)), body).await,
        StatusCode::OK,
    )
    .await;
    assert_eq!(rerun[0]["outcome"], "CREATED");
    assert_eq!(rerun[0]["task_run"]["attempt"], 2);
}

#[tokio::test]
async fn failed_statement_fails_the_task_run() {
    let app = common::build_test_app();
    seed_inventory(&app.router).await;
    let plan = create_group_plan(&app.router, "CREATE TABLE a (id int); boom; CREATE TABLE b (id int);").await;
    let rollout = create_rollout(&app.router, &plan).await;

    post_json(
        &app.router,
        &format!("{}/run", stage_uri(&rollout, 0)),
        json!({ "tasks": [task_name(&rollout, 0, 0)] }),
    )
    .await;
    app.drain_task_runs().await;

    let runs_uri = format!(
        "{}/tasks/{}/task-runs",
        stage_uri(&rollout, 0),
        rollout["stages"][0]["tasks"][0]["id"]
    );
    let runs = expect_data(get(&app.router, &runs_uri).await, StatusCode::OK).await;
    let run = &runs[0];
    assert_eq!(run["status"], "FAILED");
    // Stop-on-error: the third statement never ran.
    assert_eq!(run["results"].as_array().unwrap().len(), 2);
    assert_matches!(run["detail"].as_str(), Some(detail) if detail.contains("boom"));

    let run_uri = format!("{runs_uri}/{}", run["id"]);
    let fetched = expect_data(get(&app.router, &run_uri).await, StatusCode::OK).await;
    assert_eq!(fetched["id"], run["id"]);
}

#[tokio::test]
async fn task_from_another_stage_is_rejected() {
    let app = common::build_test_app();
    let rollout = seeded_rollout(&app).await;

    let response = post_json(
        &app.router,
        &format!("{}/run", stage_uri(&rollout, 0)),
        json!({ "tasks": [task_name(&rollout, 1, 0)] }),
    )
    .await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["code"], "VALIDATION_ERROR");
}

#[tokio::test]
async fn empty_batch_is_a_validation_error() {
    let app = common::build_test_app();
    let rollout = seeded_rollout(&app).await;

    let response = post_json(&app.router, &format!("{}/run", stage_uri(&rollout, 0)), json!({ "tasks": [] })).await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["code"], "VALIDATION_ERROR");
}

#[tokio::test]
async fn skip_and_cancel_pending_work() {
    let app = common::build_test_app();
    let rollout = seeded_rollout(&app).await;
    let prod = stage_uri(&rollout, 1);

    let skipped = expect_data(
        post_json(
            &app.router,
            &format!("{prod}/skip"),
            json!({ "tasks": [task_name(&rollout, 1, 0)], "reason": "already applied by hand" }),
        )
        .await,
        StatusCode::OK,
    )
    .await;
    assert_eq!(skipped[0]["skipped"], true);

    let triggered = expect_data(
        post_json(&app.router, &format!("{prod}/run"), json!({ "tasks": [task_name(&rollout, 1, 1)] })).await,
        StatusCode::OK,
    )
    .await;
    let run_name = format!("{}/taskRuns/{}", task_name(&rollout, 1, 1), triggered[0]["task_run"]["id"]);

    let canceled = expect_data(
        post_json(&app.router, &format!("{prod}/cancel"), json!({ "task_runs": [run_name] })).await,
        StatusCode::OK,
    )
    .await;
    assert_eq!(canceled[0]["outcome"], "CANCELED");

    assert_eq!(app.drain_task_runs().await, 0);
    assert!(app.target.executed().is_empty());
}

#[tokio::test]
async fn enforced_approval_blocks_runs_until_the_issue_is_approved() {
    let mut config = common::test_config();
    config.enforce_approval = true;
    let app = common::build_test_app_with(config);
    seed_inventory(&app.router).await;
    let plan = create_group_plan(&app.router, DDL).await;
    let rollout = create_rollout(&app.router, &plan).await;
    let run_uri = format!("{}/run", stage_uri(&rollout, 0));
    let body = json!({ "tasks": [task_name(&rollout, 0, 0)] });

    // An issue whose finding is still being computed is not approved yet.
    let response = post_json(
        &app.router,
        &format!("/api/v1/projects/{PROJECT}/issues"),
        json!({ "plan": plan, "title": "Add audit table" }),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CREATED);

    let response = post_json(&app.router, &run_uri, body).await;
    assert_eq!(response.status(), StatusCode::PRECONDITION_FAILED);
    assert!(app.target.executed().is_empty());
}

#[tokio::test]
async fn enforced_approval_allows_plans_without_an_issue() {
    let mut config = common::test_config();
    config.enforce_approval = true;
    let app = common::build_test_app_with(config);
    let rollout = seeded_rollout(&app).await;

    let response = post_json(
        &app.router,
        &format!("{}/run", stage_uri(&rollout, 0)),
        json!({ "tasks": [task_name(&rollout, 0, 0)] }),
    )
    .await;

    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn rollout_of_another_project_is_not_found() {
    let app = common::build_test_app();
    let rollout = seeded_rollout(&app).await;

    let response = get(&app.router, &format!("/api/v1/projects/finance/rollouts/{}", rollout["id"])).await;

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
