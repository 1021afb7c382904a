//! Row structs.
//!
//! Each submodule holds `FromRow` structs matching table rows and the
//! conversion into the corresponding `rollgate_core` type. Enum-valued
//! columns are stored as text or SMALLINT status ids and validated on the
//! way out.

pub mod catalog;
pub mod event;
pub mod issue;
pub mod policy;
pub mod rollout;

use rollgate_core::error::CoreError;

/// Error for a column value the core enums do not recognise.
pub(crate) fn corrupt(table: &str, column: &str, value: impl std::fmt::Display) -> CoreError {
    CoreError::Internal(format!("unexpected {table}.{column} value '{value}'"))
}
