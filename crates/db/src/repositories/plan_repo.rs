//! Repository for the `plans` table.

use rollgate_core::rollout::CreatePlan;
use rollgate_core::types::DbId;
use sqlx::types::Json;
use sqlx::PgPool;

use crate::models::rollout::PlanRow;

const COLUMNS: &str = "id, project_id, title, specs, creator, created_at";

pub struct PlanRepo;

impl PlanRepo {
    pub async fn create(pool: &PgPool, project_id: &str, input: &CreatePlan) -> Result<PlanRow, sqlx::Error> {
        let query = format!(
            "INSERT INTO plans (project_id, title, specs, creator)
             VALUES ($1, $2, $3, $4)
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, PlanRow>(&query)
            .bind(project_id)
            .bind(&input.title)
            .bind(Json(&input.specs))
            .bind(input.creator.as_deref().unwrap_or_default())
            .fetch_one(pool)
            .await
    }

    pub async fn find_by_id(pool: &PgPool, id: DbId) -> Result<Option<PlanRow>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM plans WHERE id = $1");
        sqlx::query_as::<_, PlanRow>(&query)
            .bind(id)
            .fetch_optional(pool)
            .await
    }
}
