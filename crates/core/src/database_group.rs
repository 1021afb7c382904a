//! Database group matching: partition candidate databases by a group
//! membership expression.

use serde::Serialize;

use crate::catalog::Database;
use crate::expr::{Context, Expression};
use crate::resource_name::environment_name;

/// Result of resolving a group against a candidate set. Every candidate lands
/// in exactly one of `matched` / `unmatched`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct GroupMatch {
    pub matched: Vec<Database>,
    pub unmatched: Vec<Database>,
    /// Candidates whose evaluation failed; each is also in `unmatched`.
    pub diagnostics: Vec<MatchDiagnostic>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MatchDiagnostic {
    pub database: String,
    pub error: String,
}

/// Attributes a group expression sees for one database.
pub fn group_context(db: &Database) -> Context {
    let mut ctx = Context::new();
    ctx.insert_resource("environment_name", environment_name(&db.environment_id));
    ctx.insert_resource("database_name", db.name.as_str());
    ctx.insert_resource("instance_id", db.instance_id.as_str());
    ctx
}

/// Partition `candidates` into those matching `expr` and the rest.
///
/// Evaluation errors (unknown attribute, type mismatch) place the candidate
/// in `unmatched` and are reported in `diagnostics`.
pub fn resolve(expr: &Expression, candidates: impl IntoIterator<Item = Database>) -> GroupMatch {
    let mut out = GroupMatch::default();

    for db in candidates {
        match expr.evaluate(&group_context(&db)) {
            Ok(true) => out.matched.push(db),
            Ok(false) => out.unmatched.push(db),
            Err(e) => {
                tracing::debug!(
                    database = %db.resource_name(),
                    error = %e,
                    "Database group expression failed to evaluate",
                );
                out.diagnostics.push(MatchDiagnostic {
                    database: db.resource_name().to_string(),
                    error: e.to_string(),
                });
                out.unmatched.push(db);
            }
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Engine;

    fn db(instance: &str, name: &str, env: &str) -> Database {
        Database {
            instance_id: instance.into(),
            name: name.into(),
            project_id: "hr".into(),
            environment_id: env.into(),
            engine: Engine::Postgres,
        }
    }

    fn names(dbs: &[Database]) -> Vec<&str> {
        dbs.iter().map(|d| d.name.as_str()).collect()
    }

    #[test]
    fn employee_databases_in_prod_match() {
        let expr = Expression::parse(
            r#"resource.database_name.startsWith("employee_") && resource.environment_name == "environments/prod""#,
        )
        .unwrap();
        let result = resolve(
            &expr,
            vec![db("i1", "employee_01", "prod"), db("i1", "employee_02", "prod")],
        );
        assert_eq!(names(&result.matched), vec!["employee_01", "employee_02"]);
        assert!(result.unmatched.is_empty());
        assert!(result.diagnostics.is_empty());
    }

    #[test]
    fn partition_is_total_and_disjoint() {
        let expr = Expression::parse(r#"database_name.startsWith("employee_")"#).unwrap();
        let candidates = vec![
            db("i1", "employee_01", "prod"),
            db("i1", "payroll", "prod"),
            db("i2", "employee_03", "test"),
            db("i2", "audit", "test"),
        ];
        let n = candidates.len();
        let result = resolve(&expr, candidates);

        assert_eq!(result.matched.len() + result.unmatched.len(), n);
        for m in &result.matched {
            assert!(!result.unmatched.contains(m));
        }
        assert_eq!(names(&result.unmatched), vec!["payroll", "audit"]);
    }

    #[test]
    fn evaluation_failure_lands_in_unmatched_with_diagnostic() {
        let expr = Expression::parse(r#"database_name == 1"#).unwrap();
        let result = resolve(&expr, vec![db("i1", "employee_01", "prod")]);
        assert!(result.matched.is_empty());
        assert_eq!(result.unmatched.len(), 1);
        assert_eq!(result.diagnostics.len(), 1);
        assert_eq!(result.diagnostics[0].database, "instances/i1/databases/employee_01");
    }

    #[test]
    fn empty_candidate_set() {
        let expr = Expression::parse("true").unwrap();
        let result = resolve(&expr, Vec::new());
        assert!(result.matched.is_empty() && result.unmatched.is_empty());
    }
}
