//! The rollout engine.
//!
//! - [`Scheduler`]: trigger, re-run, skip and cancel task runs.
//! - [`TaskRunDispatcher`]: background loop claiming pending runs and
//!   executing them through a [`TaskRunner`], bounded by a semaphore.
//! - [`ApprovalRunner`]: background risk classification and approval
//!   finding for issues.
//! - [`Planner`]: compiles plans into rollouts against the live inventory.
//! - [`ConnectionProvider`]: opens sessions on target databases.

pub mod approval;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod planner;
pub mod runner;
pub mod scheduler;

#[cfg(test)]
pub(crate) mod testing;

pub use approval::{wait_for_approval_finding, ApprovalRunner};
pub use config::{ApprovalConfig, SchedulerConfig};
pub use connection::{ConnectionProvider, PgConnectionProvider};
pub use dispatcher::TaskRunDispatcher;
pub use planner::Planner;
pub use runner::TaskRunner;
pub use scheduler::Scheduler;
