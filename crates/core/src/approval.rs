//! Approval flow generation and approval actions.
//!
//! The workspace approval setting is an ordered rule list. Rules tagged with a
//! risk source are consulted first (first match wins), then fallback rules
//! without a source. No matching rule means no approval is required.

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::expr::{Context, Expression};
use crate::risk::{RiskLevel, RiskSource};
use crate::types::Timestamp;

// ---------------------------------------------------------------------------
// Setting
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalFlow {
    /// Roles that must approve, in order.
    pub roles: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalTemplate {
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub flow: ApprovalFlow,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalRule {
    /// `None` marks a fallback rule.
    #[serde(default)]
    pub source: Option<RiskSource>,
    pub condition: String,
    pub template: ApprovalTemplate,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalSetting {
    pub rules: Vec<ApprovalRule>,
}

const SOURCE_RULE_ATTRIBUTES: &[&str] = &["level", "source", "project_id", "resource.project_id"];
const FALLBACK_RULE_ATTRIBUTES: &[&str] = &["resource.project_id"];

/// Reject rules whose condition does not parse or reads attributes it may
/// not see. Fallback rules may only reference `resource.project_id`.
pub fn validate_setting(setting: &ApprovalSetting) -> CoreResult<()> {
    for (i, rule) in setting.rules.iter().enumerate() {
        let expr = Expression::parse(&rule.condition)
            .map_err(|e| CoreError::Validation(format!("approval rule {i}: {e}")))?;
        let allowed = if rule.source.is_some() {
            SOURCE_RULE_ATTRIBUTES
        } else {
            FALLBACK_RULE_ATTRIBUTES
        };
        if let Some(attr) = expr
            .referenced_attributes()
            .into_iter()
            .find(|a| !allowed.contains(&a.as_str()))
        {
            return Err(CoreError::Validation(format!(
                "approval rule {i}: condition may not reference '{attr}'"
            )));
        }
        if rule.template.flow.roles.iter().any(|r| r.trim().is_empty()) {
            return Err(CoreError::Validation(format!(
                "approval rule {i}: flow roles must not be empty"
            )));
        }
    }
    Ok(())
}

/// Context approval conditions are evaluated against.
pub fn approval_context(level: RiskLevel, source: RiskSource, project_id: &str) -> Context {
    let mut ctx = Context::new();
    ctx.insert("level", level.value());
    ctx.insert("source", source.as_str());
    ctx.insert_resource("project_id", project_id);
    ctx
}

/// Pick the template for a classified change, if any rule applies.
pub fn find_template(
    setting: &ApprovalSetting,
    level: RiskLevel,
    source: RiskSource,
    project_id: &str,
) -> CoreResult<Option<ApprovalTemplate>> {
    let ctx = approval_context(level, source, project_id);

    let source_rules = setting.rules.iter().filter(|r| r.source == Some(source));
    let fallback_rules = setting.rules.iter().filter(|r| r.source.is_none());

    for rule in source_rules.chain(fallback_rules) {
        if rule.condition.trim().is_empty() {
            continue;
        }
        let expr = Expression::parse(&rule.condition)?;
        if expr.evaluate(&ctx)? {
            return Ok(Some(rule.template.clone()));
        }
    }
    Ok(None)
}

// ---------------------------------------------------------------------------
// Finding
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApproverStatus {
    Approved,
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Approver {
    pub role: String,
    pub principal: String,
    pub status: ApproverStatus,
    pub at: Timestamp,
}

/// Derived approval state of an issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApprovalStatus {
    /// The finding has not completed yet.
    Checking,
    /// No approval is required.
    Skipped,
    Pending,
    Approved,
    Rejected,
}

/// Outcome of risk classification plus approval template lookup for an issue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalFinding {
    pub done: bool,
    /// Advisory text; never blocks the finding.
    #[serde(default)]
    pub error: String,
    pub risk_level: RiskLevel,
    pub risk_source: Option<RiskSource>,
    pub template: Option<ApprovalTemplate>,
    #[serde(default)]
    pub approvers: Vec<Approver>,
}

/// Build a completed finding. Template lookup failures and the supplied
/// diagnostics are folded into `error`; the finding is always `done`.
pub fn generate(
    setting: &ApprovalSetting,
    level: RiskLevel,
    source: Option<RiskSource>,
    project_id: &str,
    diagnostics: &[String],
) -> ApprovalFinding {
    let mut errors: Vec<String> = diagnostics.to_vec();

    let template = match source {
        Some(source) => match find_template(setting, level, source, project_id) {
            Ok(template) => template,
            Err(e) => {
                errors.push(format!("failed to get approval template, risk level {level:?}: {e}"));
                None
            }
        },
        None => None,
    };

    ApprovalFinding {
        done: true,
        error: errors.join("; "),
        risk_level: level,
        risk_source: source,
        template,
        approvers: Vec::new(),
    }
}

impl ApprovalFinding {
    pub fn status(&self) -> ApprovalStatus {
        if !self.done {
            return ApprovalStatus::Checking;
        }
        let Some(template) = &self.template else {
            return ApprovalStatus::Skipped;
        };
        if template.flow.roles.is_empty() {
            return ApprovalStatus::Skipped;
        }
        if self.approvers.iter().any(|a| a.status == ApproverStatus::Rejected) {
            return ApprovalStatus::Rejected;
        }
        if self.next_pending_role().is_none() {
            ApprovalStatus::Approved
        } else {
            ApprovalStatus::Pending
        }
    }

    /// Whether the change may proceed.
    pub fn is_approved(&self) -> bool {
        matches!(self.status(), ApprovalStatus::Skipped | ApprovalStatus::Approved)
    }

    /// Role of the next step awaiting approval.
    pub fn next_pending_role(&self) -> Option<&str> {
        let template = self.template.as_ref()?;
        let approved = self
            .approvers
            .iter()
            .filter(|a| a.status == ApproverStatus::Approved)
            .count();
        template.flow.roles.get(approved).map(String::as_str)
    }

    pub fn approve(&mut self, role: &str, principal: &str) -> CoreResult<()> {
        self.act(role, principal, ApproverStatus::Approved)
    }

    pub fn reject(&mut self, role: &str, principal: &str) -> CoreResult<()> {
        self.act(role, principal, ApproverStatus::Rejected)
    }

    fn act(&mut self, role: &str, principal: &str, status: ApproverStatus) -> CoreResult<()> {
        match self.status() {
            ApprovalStatus::Pending => {}
            other => {
                return Err(CoreError::FailedPrecondition(format!(
                    "issue approval is {other:?}, nothing to act on"
                )))
            }
        }
        let expected = self.next_pending_role().unwrap_or_default().to_string();
        if expected != role {
            return Err(CoreError::FailedPrecondition(format!(
                "the next approval step requires role '{expected}', got '{role}'"
            )));
        }
        self.approvers.push(Approver {
            role: role.to_string(),
            principal: principal.to_string(),
            status,
            at: Utc::now(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn template(title: &str, roles: &[&str]) -> ApprovalTemplate {
        ApprovalTemplate {
            title: title.into(),
            description: String::new(),
            flow: ApprovalFlow {
                roles: roles.iter().map(|r| r.to_string()).collect(),
            },
        }
    }

    fn setting() -> ApprovalSetting {
        ApprovalSetting {
            rules: vec![
                ApprovalRule {
                    source: Some(RiskSource::Ddl),
                    condition: "level >= 300".into(),
                    template: template("DBA then owner", &["DBA", "PROJECT_OWNER"]),
                },
                ApprovalRule {
                    source: Some(RiskSource::Ddl),
                    condition: "level >= 200".into(),
                    template: template("DBA", &["DBA"]),
                },
                ApprovalRule {
                    source: None,
                    condition: r#"resource.project_id == "hr""#.into(),
                    template: template("Owner", &["PROJECT_OWNER"]),
                },
            ],
        }
    }

    #[test]
    fn source_rules_take_precedence_first_match_wins() {
        let t = find_template(&setting(), RiskLevel::High, RiskSource::Ddl, "hr").unwrap();
        assert_eq!(t.unwrap().title, "DBA then owner");
        let t = find_template(&setting(), RiskLevel::Moderate, RiskSource::Ddl, "hr").unwrap();
        assert_eq!(t.unwrap().title, "DBA");
    }

    #[test]
    fn fallback_rule_applies_when_no_source_rule_matches() {
        let t = find_template(&setting(), RiskLevel::Low, RiskSource::Dml, "hr").unwrap();
        assert_eq!(t.unwrap().title, "Owner");
        assert!(find_template(&setting(), RiskLevel::Low, RiskSource::Dml, "sales")
            .unwrap()
            .is_none());
    }

    #[test]
    fn fallback_rule_may_only_reference_project() {
        let bad = ApprovalSetting {
            rules: vec![ApprovalRule {
                source: None,
                condition: "level > 100".into(),
                template: template("x", &["DBA"]),
            }],
        };
        assert_matches!(validate_setting(&bad), Err(CoreError::Validation(m)) if m.contains("'level'"));
        assert!(validate_setting(&setting()).is_ok());
    }

    #[test]
    fn generate_is_done_even_with_diagnostics() {
        let finding = generate(
            &setting(),
            RiskLevel::High,
            Some(RiskSource::Ddl),
            "hr",
            &["syntax error at or near \"hh\"".to_string()],
        );
        assert!(finding.done);
        assert!(finding.error.contains("hh"));
        assert_eq!(finding.status(), ApprovalStatus::Pending);
    }

    #[test]
    fn generate_records_template_lookup_failure() {
        let broken = ApprovalSetting {
            rules: vec![ApprovalRule {
                source: Some(RiskSource::Ddl),
                condition: r#"level == "high""#.into(),
                template: template("x", &["DBA"]),
            }],
        };
        let finding = generate(&broken, RiskLevel::High, Some(RiskSource::Ddl), "hr", &[]);
        assert!(finding.done);
        assert!(finding.error.contains("failed to get approval template"));
        assert_eq!(finding.status(), ApprovalStatus::Skipped);
    }

    #[test]
    fn no_source_means_skipped() {
        let finding = generate(&setting(), RiskLevel::Default, None, "hr", &[]);
        assert_eq!(finding.status(), ApprovalStatus::Skipped);
        assert!(finding.is_approved());
        assert!(finding.error.is_empty());
    }

    #[test]
    fn not_done_is_checking() {
        assert_eq!(ApprovalFinding::default().status(), ApprovalStatus::Checking);
    }

    #[test]
    fn approval_chain_advances_step_by_step() {
        let mut finding = generate(&setting(), RiskLevel::High, Some(RiskSource::Ddl), "hr", &[]);
        assert_eq!(finding.next_pending_role(), Some("DBA"));

        assert_matches!(
            finding.approve("PROJECT_OWNER", "bob"),
            Err(CoreError::FailedPrecondition(_))
        );
        finding.approve("DBA", "alice").unwrap();
        assert_eq!(finding.status(), ApprovalStatus::Pending);
        finding.approve("PROJECT_OWNER", "bob").unwrap();
        assert_eq!(finding.status(), ApprovalStatus::Approved);
        assert!(finding.approve("DBA", "carol").is_err());
    }

    #[test]
    fn rejection_is_terminal() {
        let mut finding = generate(&setting(), RiskLevel::Moderate, Some(RiskSource::Ddl), "hr", &[]);
        finding.reject("DBA", "alice").unwrap();
        assert_eq!(finding.status(), ApprovalStatus::Rejected);
        assert!(!finding.is_approved());
        assert!(finding.approve("DBA", "alice").is_err());
    }
}
