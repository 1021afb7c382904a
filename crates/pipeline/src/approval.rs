//! Background approval finding.
//!
//! Issues are created with an unfinished finding. [`ApprovalRunner`] picks
//! them up, classifies the risk of the plan's compiled targets, looks up the
//! approval template and stores the finding exactly once. Anything that goes
//! wrong along the way besides store failures ends up in the finding's
//! `error` text; the finding itself always completes.

use std::sync::Arc;
use std::time::Duration;

use rollgate_core::advisor::{StatementAdvisor, StatementSummary};
use rollgate_core::approval::{self, ApprovalFinding};
use rollgate_core::catalog::Engine;
use rollgate_core::error::{CoreError, CoreResult};
use rollgate_core::issue::Issue;
use rollgate_core::risk::{classify_targets, conclude_source, RiskTarget};
use rollgate_core::rollout::TaskDraft;
use rollgate_core::store::{IssueStore, Store};
use rollgate_core::types::DbId;
use rollgate_events::bus::ISSUE_APPROVAL_FOUND;
use rollgate_events::{EventBus, PlatformEvent};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::config::ApprovalConfig;
use crate::planner::Planner;

pub struct ApprovalRunner {
    store: Arc<dyn Store>,
    planner: Planner,
    advisor: Arc<dyn StatementAdvisor>,
    event_bus: Arc<EventBus>,
    config: ApprovalConfig,
    wake: Arc<Notify>,
}

impl ApprovalRunner {
    pub fn new(
        store: Arc<dyn Store>,
        advisor: Arc<dyn StatementAdvisor>,
        event_bus: Arc<EventBus>,
        config: ApprovalConfig,
    ) -> Self {
        Self {
            planner: Planner::new(store.clone()),
            store,
            advisor,
            event_bus,
            config,
            wake: Arc::new(Notify::new()),
        }
    }

    /// Handle for waking the runner right after an issue is created.
    pub fn waker(&self) -> Arc<Notify> {
        self.wake.clone()
    }

    /// Process unfinished issues every `poll_interval` (or on wake-up) until
    /// cancelled. The first tick picks up everything left over from before a
    /// restart.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        tracing::info!(
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            "Approval runner started",
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Approval runner shutting down");
                    break;
                }
                _ = ticker.tick() => {}
                _ = self.wake.notified() => {}
            }
            if let Err(e) = self.process_pending().await {
                tracing::error!(error = %e, "Approval cycle failed");
            }
        }
    }

    /// Complete the finding of every open issue still awaiting one.
    /// Returns how many findings this call stored.
    pub async fn process_pending(&self) -> CoreResult<usize> {
        let issues = self.store.list_issues_awaiting_approval_finding().await?;
        let mut completed = 0;
        for issue in issues {
            match self.process(&issue).await {
                Ok(true) => completed += 1,
                Ok(false) => {}
                Err(e) => tracing::error!(issue_id = issue.id, error = %e, "Approval finding failed, will retry"),
            }
        }
        Ok(completed)
    }

    async fn process(&self, issue: &Issue) -> CoreResult<bool> {
        let finding = self.find_approval(issue).await?;
        if !self.store.complete_approval_finding(issue.id, &finding).await? {
            tracing::debug!(issue_id = issue.id, "Approval finding already completed elsewhere");
            return Ok(false);
        }

        tracing::info!(
            issue_id = issue.id,
            risk_level = ?finding.risk_level,
            status = ?finding.status(),
            error = %finding.error,
            "Approval finding completed",
        );
        self.event_bus.publish(
            PlatformEvent::new(ISSUE_APPROVAL_FOUND)
                .with_source("issue", issue.id)
                .with_payload(serde_json::json!({
                    "risk_level": finding.risk_level,
                    "status": finding.status(),
                    "error": finding.error,
                })),
        );
        Ok(true)
    }

    /// Compute the finding for an issue. Only store failures are errors.
    pub async fn find_approval(&self, issue: &Issue) -> CoreResult<ApprovalFinding> {
        let setting = self.store.get_approval_setting().await?;
        let rules = self.store.list_risk_rules().await?;

        let Some(plan) = self.store.get_plan(issue.plan_id).await? else {
            return Ok(unresolved(format!("plan {} not found", issue.plan_id)));
        };
        let drafts = match self.planner.preview(&plan).await {
            Ok(stages) => stages.into_iter().flat_map(|s| s.tasks).collect::<Vec<_>>(),
            Err(e @ (CoreError::Validation(_) | CoreError::FailedPrecondition(_) | CoreError::Evaluation(_))) => {
                return Ok(unresolved(format!("failed to compile plan {}: {e}", plan.id)));
            }
            Err(e) => return Err(e),
        };

        let Some(source) = conclude_source(drafts.iter().map(|d| d.kind.risk_source())) else {
            return Ok(unresolved(format!("plan {} has no targets", plan.id)));
        };

        let instances = self.planner.inventory(&plan.project_id).await?.instances;
        let targets: Vec<(RiskTarget, Result<StatementSummary, String>)> = drafts
            .iter()
            .map(|draft| {
                let engine = instances
                    .iter()
                    .find(|i| i.id == draft.instance_id)
                    .map(|i| i.engine)
                    .unwrap_or(Engine::Postgres);
                (risk_target(&plan.project_id, draft, engine), self.summarize(engine, draft))
            })
            .collect();

        let classification = classify_targets(
            &rules,
            source,
            targets
                .iter()
                .map(|(target, summary)| (target, summary.as_ref().map_err(Clone::clone))),
        );

        Ok(approval::generate(
            &setting,
            classification.level,
            Some(source),
            &plan.project_id,
            &classification.diagnostics,
        ))
    }

    fn summarize(&self, engine: Engine, draft: &TaskDraft) -> Result<StatementSummary, String> {
        if draft.sql.trim().is_empty() {
            return Ok(StatementSummary::default());
        }
        self.advisor.summarize(engine, &draft.sql).map_err(|e| e.to_string())
    }
}

fn risk_target(project_id: &str, draft: &TaskDraft, engine: Engine) -> RiskTarget {
    RiskTarget {
        project_id: project_id.to_string(),
        environment_id: draft.environment_id.clone(),
        instance_id: draft.instance_id.clone(),
        database_name: draft.database_name.clone(),
        engine,
    }
}

/// A done finding at the default level carrying `error`.
fn unresolved(error: String) -> ApprovalFinding {
    ApprovalFinding {
        done: true,
        error,
        ..Default::default()
    }
}

/// Poll `issue_id` until its approval finding is done.
///
/// Returns [`CoreError::Timeout`] after `max_polls` unsuccessful polls;
/// calling again simply resumes waiting.
pub async fn wait_for_approval_finding(
    store: &dyn IssueStore,
    issue_id: DbId,
    poll_interval: Duration,
    max_polls: u32,
) -> CoreResult<Issue> {
    for poll in 0..max_polls {
        let issue = store
            .get_issue(issue_id)
            .await?
            .ok_or_else(|| CoreError::not_found("Issue", issue_id))?;
        if issue.approval_finding_done() {
            return Ok(issue);
        }
        if poll + 1 < max_polls {
            tokio::time::sleep(poll_interval).await;
        }
    }
    Err(CoreError::Timeout(format!(
        "approval finding of issue {issue_id} not done after {max_polls} polls"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;
    use assert_matches::assert_matches;
    use rollgate_core::advisor::KeywordAdvisor;
    use rollgate_core::approval::{
        ApprovalFlow, ApprovalRule, ApprovalSetting, ApprovalStatus, ApprovalTemplate,
    };
    use rollgate_core::issue::CreateIssue;
    use rollgate_core::risk::{CreateRiskRule, RiskLevel, RiskSource};
    use rollgate_core::store::{MemoryStore, PolicyStore};

    fn runner(store: Arc<MemoryStore>) -> ApprovalRunner {
        ApprovalRunner::new(
            store,
            Arc::new(KeywordAdvisor),
            Arc::new(EventBus::default()),
            ApprovalConfig {
                poll_interval: Duration::from_millis(10),
            },
        )
    }

    async fn prod_is_high(store: &MemoryStore) {
        store
            .create_risk_rule(&CreateRiskRule {
                title: "prod".into(),
                source: RiskSource::Ddl,
                level: RiskLevel::High,
                expression: r#"environment_id == "prod""#.into(),
                active: true,
            })
            .await
            .unwrap();
    }

    async fn issue_for(store: &MemoryStore, sql: &str) -> Issue {
        let plan = testing::create_plan(store, sql).await;
        store
            .create_issue(
                testing::PROJECT,
                &CreateIssue {
                    plan_id: plan.id,
                    title: "change".into(),
                    creator: Some("alice".into()),
                },
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn invalid_sql_still_reaches_high_risk() {
        let store = Arc::new(MemoryStore::new());
        testing::seed_inventory(store.as_ref()).await;
        prod_is_high(&store).await;
        let issue = issue_for(&store, "hh").await;
        assert!(!issue.approval_finding_done());

        let runner = runner(store.clone());
        assert_eq!(runner.process_pending().await.unwrap(), 1);

        let issue = wait_for_approval_finding(store.as_ref(), issue.id, Duration::from_millis(1), 3)
            .await
            .unwrap();
        assert_eq!(issue.risk_level(), RiskLevel::High);
        assert!(issue.approval.error.contains("hh"), "diagnostic recorded: {}", issue.approval.error);
        assert_eq!(issue.approval_status(), ApprovalStatus::Skipped);
    }

    #[tokio::test]
    async fn valid_ddl_without_rules_is_default_level() {
        let store = Arc::new(MemoryStore::new());
        testing::seed_inventory(store.as_ref()).await;
        let issue = issue_for(&store, "CREATE TABLE t (id int);").await;

        runner(store.clone()).process_pending().await.unwrap();

        let issue = store.get_issue(issue.id).await.unwrap().unwrap();
        assert!(issue.approval_finding_done());
        assert_eq!(issue.risk_level(), RiskLevel::Default);
        assert!(issue.approval.error.is_empty());
    }

    #[tokio::test]
    async fn matching_approval_rule_requires_approval() {
        let store = Arc::new(MemoryStore::new());
        testing::seed_inventory(store.as_ref()).await;
        prod_is_high(&store).await;
        store
            .set_approval_setting(&ApprovalSetting {
                rules: vec![ApprovalRule {
                    source: Some(RiskSource::Ddl),
                    condition: "level == 300".into(),
                    template: ApprovalTemplate {
                        title: "DBA review".into(),
                        description: String::new(),
                        flow: ApprovalFlow {
                            roles: vec!["roles/dba".into(), "roles/owner".into()],
                        },
                    },
                }],
            })
            .await
            .unwrap();
        let issue = issue_for(&store, "ALTER TABLE t ADD COLUMN c int;").await;

        runner(store.clone()).process_pending().await.unwrap();

        let issue = store.get_issue(issue.id).await.unwrap().unwrap();
        assert_eq!(issue.approval_status(), ApprovalStatus::Pending);
        assert_eq!(issue.approval.next_pending_role(), Some("roles/dba"));
    }

    #[tokio::test]
    async fn compile_failure_still_completes_finding() {
        // No inventory at all: the plan cannot be compiled.
        let store = Arc::new(MemoryStore::new());
        let issue = issue_for(&store, "CREATE TABLE t (id int);").await;

        runner(store.clone()).process_pending().await.unwrap();

        let issue = store.get_issue(issue.id).await.unwrap().unwrap();
        assert!(issue.approval_finding_done());
        assert!(issue.approval.error.contains("failed to compile plan"));
    }

    #[tokio::test]
    async fn finding_completes_only_once() {
        let store = Arc::new(MemoryStore::new());
        testing::seed_inventory(store.as_ref()).await;
        issue_for(&store, "CREATE TABLE t (id int);").await;
        let runner = runner(store.clone());

        assert_eq!(runner.process_pending().await.unwrap(), 1);
        assert_eq!(runner.process_pending().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn background_loop_completes_new_issue() {
        let store = Arc::new(MemoryStore::new());
        testing::seed_inventory(store.as_ref()).await;
        prod_is_high(&store).await;
        let runner = Arc::new(runner(store.clone()));
        let cancel = CancellationToken::new();
        let handle = {
            let runner = runner.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { runner.run(cancel).await })
        };

        let issue = issue_for(&store, "CREATE TABLE t (id int);").await;
        runner.waker().notify_one();
        let issue = wait_for_approval_finding(store.as_ref(), issue.id, Duration::from_millis(10), 100)
            .await
            .unwrap();
        assert_eq!(issue.risk_level(), RiskLevel::High);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn waiting_times_out_without_a_runner() {
        let store = Arc::new(MemoryStore::new());
        testing::seed_inventory(store.as_ref()).await;
        let issue = issue_for(&store, "CREATE TABLE t (id int);").await;

        assert_matches!(
            wait_for_approval_finding(store.as_ref(), issue.id, Duration::from_millis(1), 3).await,
            Err(CoreError::Timeout(_))
        );
        assert_matches!(
            wait_for_approval_finding(store.as_ref(), 9999, Duration::from_millis(1), 3).await,
            Err(CoreError::NotFound { .. })
        );
    }
}
