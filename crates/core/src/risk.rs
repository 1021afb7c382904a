//! Risk classification.
//!
//! Rules are tried in descending level order; the first active rule for the
//! change's source whose expression holds wins. No match yields
//! [`RiskLevel::Default`]. Expression failures and statement summary failures
//! are collected as diagnostics and never abort classification.

use serde::{Deserialize, Serialize};

use crate::advisor::StatementSummary;
use crate::catalog::Engine;
use crate::error::CoreError;
use crate::expr::{Context, Expression};
use crate::resource_name::environment_name;
use crate::types::{DbId, Timestamp};

// ---------------------------------------------------------------------------
// Levels and sources
// ---------------------------------------------------------------------------

/// Ordered risk level. The numeric value is what rule expressions see as
/// `level` and what the database stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskLevel {
    #[default]
    Default = 0,
    Low = 100,
    Moderate = 200,
    High = 300,
}

impl RiskLevel {
    pub fn value(self) -> i64 {
        self as i64
    }
}

impl TryFrom<i64> for RiskLevel {
    type Error = CoreError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(RiskLevel::Default),
            100 => Ok(RiskLevel::Low),
            200 => Ok(RiskLevel::Moderate),
            300 => Ok(RiskLevel::High),
            other => Err(CoreError::Validation(format!(
                "invalid risk level {other}, must be one of 0, 100, 200, 300"
            ))),
        }
    }
}

/// What kind of change a rule applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskSource {
    Ddl,
    Dml,
    CreateDatabase,
}

impl RiskSource {
    pub fn as_str(self) -> &'static str {
        match self {
            RiskSource::Ddl => "DDL",
            RiskSource::Dml => "DML",
            RiskSource::CreateDatabase => "CREATE_DATABASE",
        }
    }
}

impl std::str::FromStr for RiskSource {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DDL" => Ok(RiskSource::Ddl),
            "DML" => Ok(RiskSource::Dml),
            "CREATE_DATABASE" => Ok(RiskSource::CreateDatabase),
            other => Err(CoreError::Validation(format!("unknown risk source '{other}'"))),
        }
    }
}

impl std::fmt::Display for RiskSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Rules
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskRule {
    pub id: DbId,
    pub title: String,
    pub source: RiskSource,
    pub level: RiskLevel,
    pub expression: String,
    pub active: bool,
    pub created_at: Timestamp,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateRiskRule {
    pub title: String,
    pub source: RiskSource,
    pub level: RiskLevel,
    pub expression: String,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

/// Attributes risk rule expressions may reference. Each is bound both bare
/// and with a `resource.` prefix.
pub const RISK_FACTORS: &[&str] = &[
    "environment_id",
    "environment_name",
    "project_id",
    "database_name",
    "instance_id",
    "db_engine",
    "sql_type",
    "affected_rows",
];

/// Parse a risk expression and check it only reads risk factors.
pub fn validate_risk_expression(source: &str) -> Result<Expression, CoreError> {
    let expr = Expression::parse(source)?;
    for attr in expr.referenced_attributes() {
        let bare = attr.strip_prefix("resource.").unwrap_or(&attr);
        if !RISK_FACTORS.contains(&bare) {
            return Err(CoreError::Validation(format!(
                "risk expression references unsupported attribute '{attr}'"
            )));
        }
    }
    Ok(expr)
}

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

/// One deployment target as seen by risk rules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RiskTarget {
    pub project_id: String,
    pub environment_id: String,
    pub instance_id: String,
    pub database_name: String,
    pub engine: Engine,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Classification {
    pub level: RiskLevel,
    /// Id of the rule that decided the level, if any matched.
    pub rule_id: Option<DbId>,
    pub diagnostics: Vec<String>,
}

/// Base context for a target: everything but `sql_type` / `affected_rows`.
pub fn target_context(target: &RiskTarget) -> Context {
    let mut ctx = Context::new();
    ctx.insert_resource("environment_id", target.environment_id.as_str());
    ctx.insert_resource("environment_name", environment_name(&target.environment_id));
    ctx.insert_resource("project_id", target.project_id.as_str());
    ctx.insert_resource("database_name", target.database_name.as_str());
    ctx.insert_resource("instance_id", target.instance_id.as_str());
    ctx.insert_resource("db_engine", target.engine.as_str());
    ctx
}

/// Contexts a target is evaluated under: one per summarized statement type,
/// then the fallback (`UNKNOWN`, `i32::MAX` rows) which is always present.
pub fn target_contexts(target: &RiskTarget, summary: Option<&StatementSummary>) -> Vec<Context> {
    let base = target_context(target);
    let mut out = Vec::new();

    if let Some(summary) = summary {
        for sql_type in &summary.statement_types {
            let mut ctx = base.clone();
            ctx.insert_resource("sql_type", sql_type.as_str());
            ctx.insert_resource("affected_rows", summary.affected_rows);
            out.push(ctx);
        }
    }

    let mut fallback = base;
    fallback.insert_resource("sql_type", "UNKNOWN");
    fallback.insert_resource("affected_rows", i64::from(i32::MAX));
    out.push(fallback);
    out
}

/// Classify one set of contexts against `rules`.
pub fn classify(rules: &[RiskRule], source: RiskSource, contexts: &[Context]) -> Classification {
    let mut ordered: Vec<&RiskRule> = rules
        .iter()
        .filter(|r| r.active && r.source == source && !r.expression.trim().is_empty())
        .collect();
    ordered.sort_by(|a, b| b.level.cmp(&a.level).then(a.id.cmp(&b.id)));

    let mut result = Classification::default();

    for rule in ordered {
        let expr = match Expression::parse(&rule.expression) {
            Ok(expr) => expr,
            Err(e) => {
                result.diagnostics.push(format!("risk rule {}: {e}", rule.id));
                continue;
            }
        };
        for ctx in contexts {
            match expr.evaluate(ctx) {
                Ok(true) => {
                    result.level = rule.level;
                    result.rule_id = Some(rule.id);
                    return result;
                }
                Ok(false) => {}
                Err(e) => {
                    result.diagnostics.push(format!("risk rule {}: {e}", rule.id));
                    break;
                }
            }
        }
    }

    result
}

/// Risk source concluded from the kinds of change in a rollout:
/// database creation beats DDL beats DML.
pub fn conclude_source(sources: impl IntoIterator<Item = RiskSource>) -> Option<RiskSource> {
    sources.into_iter().max_by_key(|s| match s {
        RiskSource::CreateDatabase => 2,
        RiskSource::Ddl => 1,
        RiskSource::Dml => 0,
    })
}

/// Classify every target and take the maximum level. Per-target summary
/// failures are passed in as `Err` and recorded as diagnostics.
pub fn classify_targets<'a>(
    rules: &[RiskRule],
    source: RiskSource,
    targets: impl IntoIterator<Item = (&'a RiskTarget, Result<&'a StatementSummary, String>)>,
) -> Classification {
    let mut overall = Classification::default();

    for (target, summary) in targets {
        let summary = match summary {
            Ok(summary) => Some(summary),
            Err(e) => {
                overall
                    .diagnostics
                    .push(format!("{}/{}: {e}", target.instance_id, target.database_name));
                None
            }
        };
        let contexts = target_contexts(target, summary);
        let result = classify(rules, source, &contexts);
        overall.diagnostics.extend(result.diagnostics);
        if result.rule_id.is_some() && (overall.rule_id.is_none() || result.level > overall.level) {
            overall.level = result.level;
            overall.rule_id = result.rule_id;
        }
    }

    overall.diagnostics.dedup();
    overall
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn rule(id: DbId, level: RiskLevel, expression: &str) -> RiskRule {
        RiskRule {
            id,
            title: format!("rule {id}"),
            source: RiskSource::Ddl,
            level,
            expression: expression.into(),
            active: true,
            created_at: Utc::now(),
        }
    }

    fn prod_target() -> RiskTarget {
        RiskTarget {
            project_id: "hr".into(),
            environment_id: "prod".into(),
            instance_id: "pg-prod".into(),
            database_name: "employee_01".into(),
            engine: Engine::Postgres,
        }
    }

    #[test]
    fn level_serializes_by_name() {
        assert_eq!(serde_json::to_string(&RiskLevel::High).unwrap(), "\"HIGH\"");
        assert_eq!(RiskLevel::try_from(300).unwrap(), RiskLevel::High);
        assert!(RiskLevel::try_from(250).is_err());
        assert!(RiskLevel::Moderate > RiskLevel::Low);
    }

    #[test]
    fn environment_rule_matches_without_summary() {
        let rules = vec![rule(1, RiskLevel::High, r#"environment_id == "prod""#)];
        let contexts = target_contexts(&prod_target(), None);
        let result = classify(&rules, RiskSource::Ddl, &contexts);
        assert_eq!(result.level, RiskLevel::High);
        assert_eq!(result.rule_id, Some(1));
        assert!(result.diagnostics.is_empty());
    }

    #[test]
    fn highest_matching_level_wins() {
        let rules = vec![
            rule(1, RiskLevel::Low, "true"),
            rule(2, RiskLevel::High, r#"environment_id == "test""#),
            rule(3, RiskLevel::Moderate, r#"resource.database_name.startsWith("employee")"#),
        ];
        let result = classify(&rules, RiskSource::Ddl, &target_contexts(&prod_target(), None));
        assert_eq!(result.level, RiskLevel::Moderate);
        assert_eq!(result.rule_id, Some(3));
    }

    #[test]
    fn inactive_and_other_source_rules_are_ignored() {
        let mut inactive = rule(1, RiskLevel::High, "true");
        inactive.active = false;
        let mut dml = rule(2, RiskLevel::Moderate, "true");
        dml.source = RiskSource::Dml;
        let result = classify(
            &[inactive, dml],
            RiskSource::Ddl,
            &target_contexts(&prod_target(), None),
        );
        assert_eq!(result.level, RiskLevel::Default);
        assert_eq!(result.rule_id, None);
    }

    #[test]
    fn summary_types_are_tried_before_fallback() {
        let rules = vec![rule(1, RiskLevel::High, r#"sql_type == "DROP_TABLE""#)];
        let summary = StatementSummary {
            statement_types: vec!["CREATE_TABLE".into(), "DROP_TABLE".into()],
            affected_rows: 0,
        };
        let with = classify(&rules, RiskSource::Ddl, &target_contexts(&prod_target(), Some(&summary)));
        assert_eq!(with.level, RiskLevel::High);

        let without = classify(&rules, RiskSource::Ddl, &target_contexts(&prod_target(), None));
        assert_eq!(without.level, RiskLevel::Default);
    }

    #[test]
    fn fallback_uses_max_affected_rows() {
        let rules = vec![rule(1, RiskLevel::Moderate, "affected_rows > 1000")];
        let result = classify(&rules, RiskSource::Ddl, &target_contexts(&prod_target(), None));
        assert_eq!(result.level, RiskLevel::Moderate);
    }

    #[test]
    fn broken_rule_is_a_diagnostic_not_a_failure() {
        let rules = vec![
            rule(1, RiskLevel::High, r#"unknown_attr == "x""#),
            rule(2, RiskLevel::Low, r#"environment_id == "prod""#),
        ];
        let result = classify(&rules, RiskSource::Ddl, &target_contexts(&prod_target(), None));
        assert_eq!(result.level, RiskLevel::Low);
        assert_eq!(result.diagnostics.len(), 1);
        assert!(result.diagnostics[0].contains("unknown attribute"));
    }

    #[test]
    fn classify_targets_takes_maximum_and_records_summary_errors() {
        let rules = vec![rule(1, RiskLevel::High, r#"environment_id == "prod""#)];
        let prod = prod_target();
        let test = RiskTarget {
            environment_id: "test".into(),
            ..prod_target()
        };
        let ok = StatementSummary::default();
        let result = classify_targets(
            &rules,
            RiskSource::Ddl,
            vec![
                (&test, Ok(&ok)),
                (&prod, Err("syntax error at or near \"hh\"".to_string())),
            ],
        );
        assert_eq!(result.level, RiskLevel::High);
        assert_eq!(result.diagnostics.len(), 1);
        assert!(result.diagnostics[0].contains("hh"));
    }

    #[test]
    fn source_precedence() {
        assert_eq!(
            conclude_source([RiskSource::Dml, RiskSource::Ddl]),
            Some(RiskSource::Ddl)
        );
        assert_eq!(
            conclude_source([RiskSource::Ddl, RiskSource::CreateDatabase]),
            Some(RiskSource::CreateDatabase)
        );
        assert_eq!(conclude_source(Vec::new()), None);
    }

    #[test]
    fn risk_expression_validation() {
        assert!(validate_risk_expression(r#"resource.environment_id == "prod" && sql_type == "DROP_TABLE""#).is_ok());
        assert!(validate_risk_expression(r#"level > 100"#).is_err());
    }
}
