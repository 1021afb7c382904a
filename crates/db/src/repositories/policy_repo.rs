//! Repositories for risk rules and the approval setting.

use rollgate_core::approval::ApprovalSetting;
use rollgate_core::risk::CreateRiskRule;
use sqlx::types::Json;
use sqlx::PgPool;

use crate::models::policy::{ApprovalSettingRow, RiskRuleRow};

const RISK_RULE_COLUMNS: &str = "id, title, source, level, expression, active, created_at";

pub struct RiskRuleRepo;

impl RiskRuleRepo {
    pub async fn create(pool: &PgPool, input: &CreateRiskRule) -> Result<RiskRuleRow, sqlx::Error> {
        let query = format!(
            "INSERT INTO risk_rules (title, source, level, expression, active)
             VALUES ($1, $2, $3, $4, $5)
             RETURNING {RISK_RULE_COLUMNS}"
        );
        sqlx::query_as::<_, RiskRuleRow>(&query)
            .bind(&input.title)
            .bind(input.source.as_str())
            .bind(input.level.value() as i32)
            .bind(&input.expression)
            .bind(input.active)
            .fetch_one(pool)
            .await
    }

    /// All rules, highest level first.
    pub async fn list(pool: &PgPool) -> Result<Vec<RiskRuleRow>, sqlx::Error> {
        let query = format!("SELECT {RISK_RULE_COLUMNS} FROM risk_rules ORDER BY level DESC, id");
        sqlx::query_as::<_, RiskRuleRow>(&query).fetch_all(pool).await
    }
}

pub struct ApprovalSettingRepo;

impl ApprovalSettingRepo {
    pub async fn find(pool: &PgPool) -> Result<Option<ApprovalSettingRow>, sqlx::Error> {
        sqlx::query_as::<_, ApprovalSettingRow>("SELECT setting FROM approval_settings WHERE id = 1")
            .fetch_optional(pool)
            .await
    }

    pub async fn upsert(pool: &PgPool, setting: &ApprovalSetting) -> Result<ApprovalSettingRow, sqlx::Error> {
        sqlx::query_as::<_, ApprovalSettingRow>(
            "INSERT INTO approval_settings (id, setting) VALUES (1, $1)
             ON CONFLICT (id) DO UPDATE SET setting = EXCLUDED.setting, updated_at = NOW()
             RETURNING setting",
        )
        .bind(Json(setting))
        .fetch_one(pool)
        .await
    }
}
