//! Integration tests for [`PgStore`] against a real database.
//!
//! Ignored by default; run with `DATABASE_URL` set and `--ignored`.

use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use rollgate_core::approval::ApprovalFinding;
use rollgate_core::catalog::{CreateDatabase, CreateInstance, Engine};
use rollgate_core::error::CoreError;
use rollgate_core::issue::CreateIssue;
use rollgate_core::rollout::{ChangeKind, CreatePlan, Rollout, StageDraft, TaskDraft};
use rollgate_core::scheduling::state_machine;
use rollgate_core::status::{TaskRunStatus, TaskStatus};
use rollgate_core::store::{CancelOutcome, CatalogStore, IssueStore, Lease, RolloutStore, RunClaim};
use rollgate_db::PgStore;
use sqlx::PgPool;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn lease(worker_id: &str) -> Lease {
    Lease::new(worker_id, Duration::from_secs(30))
}

async fn seed_rollout(store: &PgStore) -> Rollout {
    let plan = store
        .create_plan(
            "hr",
            &CreatePlan {
                title: "add column".into(),
                specs: vec![],
                creator: Some("alice".into()),
            },
        )
        .await
        .unwrap();
    let stage = StageDraft {
        environment_id: "prod".into(),
        position: 0,
        tasks: vec![TaskDraft {
            spec_id: "s1".into(),
            kind: ChangeKind::SchemaMigration,
            instance_id: "pg-prod".into(),
            database_name: "employee_01".into(),
            environment_id: "prod".into(),
            sql: "ALTER TABLE t ADD COLUMN c int;".into(),
        }],
    };
    store.create_rollout(&plan, &[stage]).await.unwrap()
}

// ---------------------------------------------------------------------------
// Catalog
// ---------------------------------------------------------------------------

#[sqlx::test(migrations = "../../db/migrations")]
#[ignore]
async fn database_inherits_instance_environment(pool: PgPool) {
    let store = PgStore::new(pool);
    store
        .create_instance(&CreateInstance {
            id: "pg-prod".into(),
            title: None,
            engine: Engine::Postgres,
            environment_id: "prod".into(),
            data_source_url: "postgres://localhost/postgres".into(),
        })
        .await
        .unwrap();

    let input = CreateDatabase {
        name: "employee_01".into(),
        project_id: "hr".into(),
        environment_id: None,
    };
    let db = store.create_database("pg-prod", &input).await.unwrap();
    assert_eq!(db.environment_id, "prod");
    assert_eq!(db.engine, Engine::Postgres);

    assert_matches!(
        store.create_database("pg-prod", &input).await,
        Err(CoreError::Conflict(_))
    );
    assert_matches!(
        store.create_database("missing", &input).await,
        Err(CoreError::NotFound { .. })
    );
}

// ---------------------------------------------------------------------------
// Task runs
// ---------------------------------------------------------------------------

#[sqlx::test(migrations = "../../db/migrations")]
#[ignore]
async fn concurrent_claims_create_one_run(pool: PgPool) {
    let store = Arc::new(PgStore::new(pool));
    let rollout = seed_rollout(&store).await;
    let task_id = rollout.stages[0].tasks[0].id;

    let claims = futures::future::join_all((0..8).map(|_| {
        let store = Arc::clone(&store);
        tokio::spawn(async move {
            store
                .claim_task_run(task_id, state_machine::trigger_sources(), "alice")
                .await
        })
    }))
    .await;

    let created = claims
        .into_iter()
        .map(|r| r.unwrap().unwrap())
        .filter(|c| matches!(c, RunClaim::Created(_)))
        .count();
    assert_eq!(created, 1);
    assert_eq!(store.list_task_runs(task_id).await.unwrap().len(), 1);
}

#[sqlx::test(migrations = "../../db/migrations")]
#[ignore]
async fn run_lifecycle_and_rerun(pool: PgPool) {
    let store = PgStore::new(pool);
    let rollout = seed_rollout(&store).await;
    let task_id = rollout.stages[0].tasks[0].id;

    store
        .claim_task_run(task_id, state_machine::trigger_sources(), "alice")
        .await
        .unwrap();
    let (run, task) = store.claim_pending_task_run(&lease("w1")).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Running);
    assert_eq!(run.worker_id.as_deref(), Some("w1"));
    assert!(store.claim_pending_task_run(&lease("w2")).await.unwrap().is_none());

    assert_matches!(
        store.finish_task_run(run.id, "w2", TaskRunStatus::Done, &[], "").await,
        Err(CoreError::Conflict(_))
    );
    store
        .finish_task_run(run.id, "w1", TaskRunStatus::Failed, &[], "boom")
        .await
        .unwrap();
    assert_eq!(
        store.get_task(task_id).await.unwrap().unwrap().status,
        TaskStatus::Failed
    );

    assert_matches!(
        store
            .claim_task_run(task_id, state_machine::rerun_sources(), "bob")
            .await
            .unwrap(),
        RunClaim::Created(r) if r.attempt == 2
    );
}

#[sqlx::test(migrations = "../../db/migrations")]
#[ignore]
async fn only_expired_leases_are_requeued(pool: PgPool) {
    let store = PgStore::new(pool);
    let rollout = seed_rollout(&store).await;
    let task_id = rollout.stages[0].tasks[0].id;

    store
        .claim_task_run(task_id, state_machine::trigger_sources(), "alice")
        .await
        .unwrap();
    let (run, _) = store.claim_pending_task_run(&lease("w1")).await.unwrap().unwrap();

    assert_eq!(store.requeue_expired_task_runs().await.unwrap(), 0);
    assert!(store.renew_task_run_lease(run.id, &lease("w1")).await.unwrap());

    // Renewing with a zero ttl lets the lease lapse immediately.
    let lapsed = Lease::new("w1", Duration::ZERO);
    assert!(store.renew_task_run_lease(run.id, &lapsed).await.unwrap());
    tokio::time::sleep(Duration::from_millis(5)).await;
    assert_eq!(store.requeue_expired_task_runs().await.unwrap(), 1);
    assert_eq!(
        store.get_task(task_id).await.unwrap().unwrap().status,
        TaskStatus::Pending
    );

    let (again, _) = store.claim_pending_task_run(&lease("w2")).await.unwrap().unwrap();
    assert_eq!(again.id, run.id);
    assert!(!store.renew_task_run_lease(run.id, &lease("w1")).await.unwrap());
}

#[sqlx::test(migrations = "../../db/migrations")]
#[ignore]
async fn cancel_pending_then_terminal(pool: PgPool) {
    let store = PgStore::new(pool);
    let rollout = seed_rollout(&store).await;
    let task_id = rollout.stages[0].tasks[0].id;

    let RunClaim::Created(run) = store
        .claim_task_run(task_id, state_machine::trigger_sources(), "alice")
        .await
        .unwrap()
    else {
        panic!("expected a new run");
    };

    assert_eq!(store.request_cancel(run.id).await.unwrap(), CancelOutcome::Canceled);
    assert_matches!(
        store.request_cancel(run.id).await,
        Err(CoreError::FailedPrecondition(_))
    );
}

#[sqlx::test(migrations = "../../db/migrations")]
#[ignore]
async fn second_rollout_for_plan_conflicts(pool: PgPool) {
    let store = PgStore::new(pool);
    let rollout = seed_rollout(&store).await;
    let plan = store.get_plan(rollout.plan_id).await.unwrap().unwrap();
    assert_matches!(store.create_rollout(&plan, &[]).await, Err(CoreError::Conflict(_)));
}

// ---------------------------------------------------------------------------
// Issues
// ---------------------------------------------------------------------------

#[sqlx::test(migrations = "../../db/migrations")]
#[ignore]
async fn approval_finding_flips_once(pool: PgPool) {
    let store = PgStore::new(pool);
    let rollout = seed_rollout(&store).await;
    let issue = store
        .create_issue(
            "hr",
            &CreateIssue {
                plan_id: rollout.plan_id,
                title: "add column".into(),
                creator: None,
            },
        )
        .await
        .unwrap();
    assert!(!issue.approval_finding_done());

    let finding = ApprovalFinding::default();
    assert!(store.complete_approval_finding(issue.id, &finding).await.unwrap());
    assert!(!store.complete_approval_finding(issue.id, &finding).await.unwrap());

    let issue = store.get_issue(issue.id).await.unwrap().unwrap();
    assert!(issue.approval_finding_done());
    assert!(store
        .list_issues_awaiting_approval_finding()
        .await
        .unwrap()
        .is_empty());
}
