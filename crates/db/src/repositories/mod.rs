//! Repository layer.
//!
//! Each repository is a zero-sized struct providing async methods that
//! accept `&PgPool` (or an open transaction) as the first argument and
//! return rows from [`crate::models`].

pub mod catalog_repo;
pub mod event_repo;
pub mod issue_repo;
pub mod plan_repo;
pub mod policy_repo;
pub mod rollout_repo;
pub mod task_run_repo;

pub use catalog_repo::{DatabaseGroupRepo, DatabaseRepo, DeploymentConfigRepo, InstanceRepo};
pub use event_repo::EventRepo;
pub use issue_repo::IssueRepo;
pub use plan_repo::PlanRepo;
pub use policy_repo::{ApprovalSettingRepo, RiskRuleRepo};
pub use rollout_repo::{RolloutRepo, TaskRepo};
pub use task_run_repo::TaskRunRepo;
