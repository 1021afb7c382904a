//! Issue creation and the approval flow. The approval runner is driven by
//! hand so every step is deterministic.

mod common;

use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use common::{body_json, create_group_plan, expect_data, get, post_json, put_json, seed_inventory, PROJECT};
use rollgate_core::advisor::KeywordAdvisor;
use rollgate_pipeline::{ApprovalConfig, ApprovalRunner};
use serde_json::{json, Value};

async fn find_approvals(app: &common::TestApp) -> usize {
    let runner = ApprovalRunner::new(
        app.store.clone(),
        Arc::new(KeywordAdvisor),
        app.event_bus.clone(),
        ApprovalConfig {
            poll_interval: Duration::from_millis(10),
        },
    );
    runner.process_pending().await.unwrap()
}

async fn create_issue(app: &common::TestApp, plan: &str) -> Value {
    let response = post_json(
        &app.router,
        &format!("/api/v1/projects/{PROJECT}/issues"),
        json!({ "plan": plan, "title": "Add audit table", "creator": "alice" }),
    )
    .await;
    expect_data(response, StatusCode::CREATED).await
}

/// Prod DDL is high risk and needs DBA then OWNER.
async fn configure_policies(app: &common::TestApp) {
    let response = post_json(
        &app.router,
        "/api/v1/risk-rules",
        json!({
            "title": "prod ddl",
            "source": "DDL",
            "level": "HIGH",
            "expression": r#"environment_id == "prod""#,
        }),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CREATED);

    let response = put_json(
        &app.router,
        "/api/v1/approval-setting",
        json!({
            "rules": [{
                "source": "DDL",
                "condition": "level >= 300",
                "template": { "title": "High risk DDL", "flow": { "roles": ["DBA", "OWNER"] } },
            }]
        }),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
}

fn issue_uri(issue: &Value) -> String {
    format!("/api/v1/projects/{PROJECT}/issues/{}", issue["id"])
}

#[tokio::test]
async fn new_issue_starts_checking() {
    let app = common::build_test_app();
    seed_inventory(&app.router).await;
    let plan = create_group_plan(&app.router, "CREATE TABLE audit (id int);").await;

    let issue = create_issue(&app, &plan).await;

    assert_eq!(issue["approval"]["done"], false);
    assert_eq!(issue["creator"], "alice");
}

#[tokio::test]
async fn wait_times_out_until_the_finding_is_done() {
    let app = common::build_test_app();
    seed_inventory(&app.router).await;
    let plan = create_group_plan(&app.router, "CREATE TABLE audit (id int);").await;
    let issue = create_issue(&app, &plan).await;
    let wait_uri = format!("{}/approval-finding?max_polls=1&poll_interval_ms=1", issue_uri(&issue));

    let response = get(&app.router, &wait_uri).await;
    assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(body_json(response).await["code"], "TIMEOUT");

    assert_eq!(find_approvals(&app).await, 1);

    let done = expect_data(get(&app.router, &wait_uri).await, StatusCode::OK).await;
    assert_eq!(done["approval"]["done"], true);
    // No risk rules or approval setting: default level and nothing to approve.
    assert_eq!(done["approval"]["risk_level"], "DEFAULT");
    assert_eq!(done["approval"]["template"], Value::Null);
}

#[tokio::test]
async fn high_risk_issue_walks_the_approval_flow() {
    let app = common::build_test_app();
    seed_inventory(&app.router).await;
    configure_policies(&app).await;
    let plan = create_group_plan(&app.router, "CREATE TABLE audit (id int);").await;
    let issue = create_issue(&app, &plan).await;
    find_approvals(&app).await;

    let found = expect_data(get(&app.router, &issue_uri(&issue)).await, StatusCode::OK).await;
    assert_eq!(found["approval"]["risk_level"], "HIGH");
    assert_eq!(found["approval"]["risk_source"], "DDL");
    assert_eq!(found["approval"]["template"]["title"], "High risk DDL");

    // Steps are strictly ordered.
    let response = post_json(
        &app.router,
        &format!("{}/approve", issue_uri(&issue)),
        json!({ "role": "OWNER", "principal": "bob" }),
    )
    .await;
    assert_eq!(response.status(), StatusCode::PRECONDITION_FAILED);

    for (role, principal) in [("DBA", "dana"), ("OWNER", "bob")] {
        let response = post_json(
            &app.router,
            &format!("{}/approve", issue_uri(&issue)),
            json!({ "role": role, "principal": principal }),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    let approved = expect_data(get(&app.router, &issue_uri(&issue)).await, StatusCode::OK).await;
    let approvers = approved["approval"]["approvers"].as_array().unwrap();
    assert_eq!(approvers.len(), 2);
    assert!(approvers.iter().all(|a| a["status"] == "APPROVED"));
}

#[tokio::test]
async fn invalid_sql_is_still_classified_with_a_diagnostic() {
    let app = common::build_test_app();
    seed_inventory(&app.router).await;
    configure_policies(&app).await;
    let plan = create_group_plan(&app.router, "hh").await;
    let issue = create_issue(&app, &plan).await;
    find_approvals(&app).await;

    let found = expect_data(get(&app.router, &issue_uri(&issue)).await, StatusCode::OK).await;
    assert_eq!(found["approval"]["done"], true);
    assert_eq!(found["approval"]["risk_level"], "HIGH");
    assert!(found["approval"]["error"].as_str().unwrap().contains("hh"));
}

#[tokio::test]
async fn rejection_ends_the_flow() {
    let app = common::build_test_app();
    seed_inventory(&app.router).await;
    configure_policies(&app).await;
    let plan = create_group_plan(&app.router, "CREATE TABLE audit (id int);").await;
    let issue = create_issue(&app, &plan).await;
    find_approvals(&app).await;

    let rejected = expect_data(
        post_json(
            &app.router,
            &format!("{}/reject", issue_uri(&issue)),
            json!({ "role": "DBA", "principal": "dana" }),
        )
        .await,
        StatusCode::OK,
    )
    .await;
    assert_eq!(rejected["approval"]["approvers"][0]["status"], "REJECTED");

    let response = post_json(
        &app.router,
        &format!("{}/approve", issue_uri(&issue)),
        json!({ "role": "DBA", "principal": "dana" }),
    )
    .await;
    assert_eq!(response.status(), StatusCode::PRECONDITION_FAILED);
}

#[tokio::test]
async fn one_issue_per_plan() {
    let app = common::build_test_app();
    seed_inventory(&app.router).await;
    let plan = create_group_plan(&app.router, "CREATE TABLE audit (id int);").await;
    create_issue(&app, &plan).await;

    let response = post_json(
        &app.router,
        &format!("/api/v1/projects/{PROJECT}/issues"),
        json!({ "plan": plan, "title": "again" }),
    )
    .await;

    assert_eq!(response.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn issue_for_missing_plan_is_not_found() {
    let app = common::build_test_app();

    let response = post_json(
        &app.router,
        &format!("/api/v1/projects/{PROJECT}/issues"),
        json!({ "plan": format!("projects/{PROJECT}/plans/999"), "title": "ghost" }),
    )
    .await;

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
