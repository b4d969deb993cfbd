use crate::store::StoreError;
use crate::types::SequenceNumber;

/// Crate-wide error taxonomy.
///
/// Every user-facing variant carries a short stable code (`COMMAND-Org00a`
/// style) and a message suitable for display.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Input failed syntactic validation.
    #[error("{code}: {message}")]
    InvalidArgument { code: &'static str, message: String },

    /// The target entity does not exist (state unspecified or removed).
    #[error("{code}: {message}")]
    NotFound { code: &'static str, message: String },

    /// Domain-level uniqueness violation.
    #[error("{code}: {message}")]
    AlreadyExists { code: &'static str, message: String },

    /// State-machine violation.
    #[error("{code}: {message}")]
    PreconditionFailed { code: &'static str, message: String },

    /// The authorization check returned deny.
    #[error("{code}: {message}")]
    PermissionDenied { code: &'static str, message: String },

    /// Optimistic concurrency failure. Retryable by the caller.
    #[error("concurrency conflict on {aggregate_id}: expected version {expected}, current {current}")]
    ConcurrencyConflict {
        aggregate_id: String,
        expected: SequenceNumber,
        current: SequenceNumber,
    },

    /// IO or integrity failure from the event store or projections.
    #[error(transparent)]
    Storage(StoreError),

    /// Unexpected programming error.
    #[error("{code}: {message}")]
    Internal { code: &'static str, message: String },
}

impl Error {
    pub fn invalid_argument(code: &'static str, message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            code,
            message: message.into(),
        }
    }

    pub fn not_found(code: &'static str, message: impl Into<String>) -> Self {
        Self::NotFound {
            code,
            message: message.into(),
        }
    }

    pub fn already_exists(code: &'static str, message: impl Into<String>) -> Self {
        Self::AlreadyExists {
            code,
            message: message.into(),
        }
    }

    pub fn precondition_failed(code: &'static str, message: impl Into<String>) -> Self {
        Self::PreconditionFailed {
            code,
            message: message.into(),
        }
    }

    pub fn permission_denied(code: &'static str, message: impl Into<String>) -> Self {
        Self::PermissionDenied {
            code,
            message: message.into(),
        }
    }

    pub fn internal(code: &'static str, message: impl Into<String>) -> Self {
        Self::Internal {
            code,
            message: message.into(),
        }
    }

    /// The stable code of the error, if it carries one.
    pub fn code(&self) -> Option<&'static str> {
        match self {
            Self::InvalidArgument { code, .. }
            | Self::NotFound { code, .. }
            | Self::AlreadyExists { code, .. }
            | Self::PreconditionFailed { code, .. }
            | Self::PermissionDenied { code, .. }
            | Self::Internal { code, .. } => Some(code),
            Self::ConcurrencyConflict { .. } | Self::Storage(_) => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }

    pub fn is_concurrency_conflict(&self) -> bool {
        matches!(self, Self::ConcurrencyConflict { .. })
    }
}

impl From<StoreError> for Error {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::ConcurrencyConflict {
                aggregate_id,
                expected,
                current,
            } => Self::ConcurrencyConflict {
                aggregate_id,
                expected,
                current,
            },
            other => Self::Storage(other),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal {
            code: "IDHUB-Json01",
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Error;

    #[test]
    fn codes_are_exposed() {
        let err = Error::not_found("COMMAND-Org10b", "organization not found");
        assert_eq!(err.code(), Some("COMMAND-Org10b"));
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "COMMAND-Org10b: organization not found");
    }

    #[test]
    fn concurrency_conflict_has_no_code() {
        let err = Error::ConcurrencyConflict {
            aggregate_id: "org1".to_owned(),
            expected: 3,
            current: 4,
        };
        assert_eq!(err.code(), None);
        assert!(err.is_concurrency_conflict());
    }
}
