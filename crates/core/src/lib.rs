//! Domain core of the rollout orchestrator.
//!
//! Pure logic only: nothing in this crate talks to the control-plane
//! database. Persistence is reached through the traits in [`store`].

pub mod advisor;
pub mod approval;
pub mod catalog;
pub mod database_group;
pub mod error;
pub mod executor;
pub mod export;
pub mod expr;
pub mod issue;
pub mod resource_name;
pub mod risk;
pub mod rollout;
pub mod scheduling;
pub mod statement;
pub mod status;
pub mod store;
pub mod types;
