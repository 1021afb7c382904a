//! Request handlers.
//!
//! Each submodule serves one route group. Handlers validate input, delegate
//! to the store or to the pipeline services held in [`AppState`], and map
//! errors via [`AppError`].
//!
//! [`AppState`]: crate::state::AppState
//! [`AppError`]: crate::error::AppError

pub mod catalog;
pub mod events;
pub mod issues;
pub mod plans;
pub mod policies;
pub mod query;
pub mod rollouts;

/// Reject a request whose body names a resource in another project.
pub(crate) fn ensure_same_project(path_project: &str, named_project: &str) -> crate::error::AppResult<()> {
    if path_project != named_project {
        return Err(crate::error::AppError::BadRequest(format!(
            "resource belongs to project '{named_project}', not '{path_project}'"
        )));
    }
    Ok(())
}
