/// Domain error taxonomy shared by every layer.
///
/// Store implementations map their backend failures onto these variants so
/// callers above the store never see driver-specific errors.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: &'static str, id: String },

    /// Malformed plan, spec, expression or request; rejected synchronously.
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    /// The request is well-formed but the current state does not allow it
    /// (e.g. an earlier stage is unfinished under sequential stage policy).
    #[error("Failed precondition: {0}")]
    FailedPrecondition(String),

    /// A rule or group expression could not be evaluated.
    #[error("Evaluation failed: {0}")]
    Evaluation(String),

    /// A statement or connection failed on a target database.
    #[error("Execution failed: {0}")]
    Execution(String),

    /// A bounded wait elapsed. Retrying the wait is safe.
    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }
}

/// Convenience alias for fallible core operations.
pub type CoreResult<T> = Result<T, CoreError>;
