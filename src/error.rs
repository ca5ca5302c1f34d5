use thiserror::Error;

/// Failure classes surfaced by the orchestration components.
#[derive(Error, Debug)]
pub enum PlatformError {
    /// Malformed or missing input. Never retried.
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// The entity already moved past the requested transition.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("not implemented: {0}")]
    NotImplemented(String),

    /// Every member of a fan-out failed.
    #[error("all {failed} operations failed, first error: {first}")]
    PartialBatch { failed: usize, first: String },

    /// Document store, graph store, queue or source control failure, passed through untouched.
    #[error(transparent)]
    Collaborator(#[from] anyhow::Error),
}

impl PlatformError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict(message.into())
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::Forbidden(message.into())
    }

    /// True when the failure was caused by the request rather than the system.
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            Self::Validation(_)
                | Self::NotFound(_)
                | Self::Conflict(_)
                | Self::Forbidden(_)
                | Self::NotImplemented(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, PlatformError>;
