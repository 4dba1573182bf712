//! Error taxonomy shared across every subsystem.
//!
//! Every public operation on the bus returns a `Result<_, CoreError>` and
//! never aborts the process; drops, rejections and missing-dependency
//! conditions are reported through this type and logged by the caller at
//! an appropriate level.

/// Five error kinds common to every subsystem, realized as one enum so
/// callers can match on variant without caring which subsystem raised it.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("rejected ({reason}): {id}")]
    Rejected { id: String, reason: String },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("dependency missing: {0}")]
    DependencyMissing(String),
}

impl CoreError {
    pub fn already_exists(id: impl Into<String>) -> Self {
        Self::AlreadyExists(id.into())
    }

    pub fn not_found(id: impl Into<String>) -> Self {
        Self::NotFound(id.into())
    }

    pub fn rejected(id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Rejected {
            id: id.into(),
            reason: reason.into(),
        }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    pub fn dependency_missing(name: impl Into<String>) -> Self {
        Self::DependencyMissing(name.into())
    }
}

impl From<fluxbus_event::BuildError> for CoreError {
    fn from(err: fluxbus_event::BuildError) -> Self {
        Self::InvalidArgument(err.to_string())
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
