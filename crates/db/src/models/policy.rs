//! Rows of `risk_rules` and `approval_settings`.

use rollgate_core::approval::ApprovalSetting;
use rollgate_core::error::CoreError;
use rollgate_core::risk::{RiskLevel, RiskRule, RiskSource};
use rollgate_core::types::{DbId, Timestamp};
use sqlx::types::Json;
use sqlx::FromRow;

use super::corrupt;

#[derive(Debug, Clone, FromRow)]
pub struct RiskRuleRow {
    pub id: DbId,
    pub title: String,
    pub source: String,
    pub level: i32,
    pub expression: String,
    pub active: bool,
    pub created_at: Timestamp,
}

impl TryFrom<RiskRuleRow> for RiskRule {
    type Error = CoreError;

    fn try_from(row: RiskRuleRow) -> Result<Self, Self::Error> {
        let source: RiskSource = row
            .source
            .parse()
            .map_err(|_| corrupt("risk_rules", "source", &row.source))?;
        let level = RiskLevel::try_from(i64::from(row.level))
            .map_err(|_| corrupt("risk_rules", "level", row.level))?;
        Ok(RiskRule {
            id: row.id,
            title: row.title,
            source,
            level,
            expression: row.expression,
            active: row.active,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct ApprovalSettingRow {
    pub setting: Json<ApprovalSetting>,
}
