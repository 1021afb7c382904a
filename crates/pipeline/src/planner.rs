//! Plan to rollout compilation against the live inventory.

use std::sync::Arc;

use rollgate_core::error::{CoreError, CoreResult};
use rollgate_core::rollout::{compile_rollout, Inventory, Plan, Rollout, StageDraft};
use rollgate_core::store::{DatabaseFilter, Store};
use rollgate_core::types::DbId;

pub struct Planner {
    store: Arc<dyn Store>,
}

impl Planner {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Instances, the project's databases and its database groups.
    pub async fn inventory(&self, project_id: &str) -> CoreResult<Inventory> {
        let instances = self.store.list_instances().await?;
        let databases = self
            .store
            .list_databases(&DatabaseFilter {
                project_id: Some(project_id.to_string()),
                instance_id: None,
            })
            .await?;
        let groups = self.store.list_database_groups(project_id).await?;
        Ok(Inventory {
            instances,
            databases,
            groups,
        })
    }

    /// Compile `plan` without persisting anything.
    pub async fn preview(&self, plan: &Plan) -> CoreResult<Vec<StageDraft>> {
        let config = self
            .store
            .get_deployment_config(&plan.project_id)
            .await?
            .ok_or_else(|| {
                CoreError::FailedPrecondition(format!(
                    "project {} has no deployment config",
                    plan.project_id
                ))
            })?;
        let inventory = self.inventory(&plan.project_id).await?;
        compile_rollout(plan, &config, &inventory)
    }

    /// Compile and persist the rollout of a plan. A plan has at most one.
    pub async fn create_rollout(&self, plan_id: DbId) -> CoreResult<Rollout> {
        let plan = self
            .store
            .get_plan(plan_id)
            .await?
            .ok_or_else(|| CoreError::not_found("Plan", plan_id))?;

        if self.store.get_rollout_by_plan(plan_id).await?.is_some() {
            return Err(CoreError::Conflict(format!("plan {plan_id} already has a rollout")));
        }

        let stages = self.preview(&plan).await?;
        let rollout = self.store.create_rollout(&plan, &stages).await?;

        tracing::info!(
            plan_id,
            rollout_id = rollout.id,
            stages = rollout.stages.len(),
            "Rollout created",
        );
        Ok(rollout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;
    use assert_matches::assert_matches;
    use rollgate_core::store::MemoryStore;

    #[tokio::test]
    async fn rollout_stages_follow_deployment_config() {
        let store = Arc::new(MemoryStore::new());
        testing::seed_inventory(store.as_ref()).await;
        let plan = testing::create_plan(store.as_ref(), "CREATE TABLE t (id int);").await;

        let rollout = Planner::new(store.clone()).create_rollout(plan.id).await.unwrap();

        let envs: Vec<_> = rollout.stages.iter().map(|s| s.environment_id.as_str()).collect();
        assert_eq!(envs, vec!["test", "prod"]);
        assert_eq!(rollout.stages[1].tasks.len(), 2);
        assert_eq!(rollout.stages[1].tasks[0].database_name, "employee_01");
    }

    #[tokio::test]
    async fn second_rollout_conflicts() {
        let store = Arc::new(MemoryStore::new());
        testing::seed_inventory(store.as_ref()).await;
        let plan = testing::create_plan(store.as_ref(), "CREATE TABLE t (id int);").await;
        let planner = Planner::new(store.clone());

        planner.create_rollout(plan.id).await.unwrap();
        assert_matches!(planner.create_rollout(plan.id).await, Err(CoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn missing_deployment_config_is_a_failed_precondition() {
        let store = Arc::new(MemoryStore::new());
        let plan = testing::create_plan(store.as_ref(), "SELECT 1;").await;
        assert_matches!(
            Planner::new(store.clone()).create_rollout(plan.id).await,
            Err(CoreError::FailedPrecondition(_))
        );
    }

    #[tokio::test]
    async fn unknown_plan_is_not_found() {
        let store = Arc::new(MemoryStore::new());
        assert_matches!(
            Planner::new(store).create_rollout(99).await,
            Err(CoreError::NotFound { entity: "Plan", .. })
        );
    }
}
