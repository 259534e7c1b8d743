use thiserror::Error;

use crate::local::LocalError;
use crate::remote::RemoteError;

pub type Result<T, E = SyncError> = std::result::Result<T, E>;

/// Everything a task handler can fail with. The worker loop turns the
/// [`ErrorClass`] into a queue transition; handlers never do.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error(transparent)]
    Local(#[from] LocalError),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("malformed task payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("invalid task: {0}")]
    Invalid(String),

    #[error("no mapping for {0}")]
    MappingMissing(String),

    #[error("integrity check failed for {path}: {reason}")]
    Integrity { path: String, reason: String },

    /// A prerequisite (usually the parent folder) is not synced yet.
    #[error("waiting on {0}")]
    NotReady(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retry until the attempt budget runs out.
    Transient,
    /// Fail the task now.
    Permanent,
    /// The entity is gone; complete the task as a no-op.
    MappingMissing,
    /// Bytes did not verify; retried like transient.
    Integrity,
    /// Stop the cycle and report upward.
    Fatal,
}

impl SyncError {
    pub fn class(&self) -> ErrorClass {
        match self {
            SyncError::Remote(e) => match e {
                RemoteError::RateLimited { .. }
                | RemoteError::ServerError { .. }
                | RemoteError::Network(_)
                | RemoteError::IncorrectOffset { .. } => ErrorClass::Transient,
                RemoteError::Unauthorized(_) => ErrorClass::Fatal,
                RemoteError::NotFound(_) => ErrorClass::MappingMissing,
                RemoteError::AlreadyExists(_) | RemoteError::Api(_) => ErrorClass::Permanent,
            },
            SyncError::Local(e) => match e {
                LocalError::NotFound(_) => ErrorClass::MappingMissing,
                LocalError::InvalidName(_) => ErrorClass::Permanent,
                LocalError::Io { .. } => ErrorClass::Transient,
            },
            SyncError::Database(_) | SyncError::NotReady(_) => ErrorClass::Transient,
            SyncError::Payload(_) | SyncError::Invalid(_) => ErrorClass::Permanent,
            SyncError::MappingMissing(_) => ErrorClass::MappingMissing,
            SyncError::Integrity { .. } => ErrorClass::Integrity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classes_follow_the_taxonomy() {
        let unauthorized = SyncError::from(RemoteError::Unauthorized("expired".into()));
        assert_eq!(unauthorized.class(), ErrorClass::Fatal);

        let gone = SyncError::from(RemoteError::NotFound("path/not_found".into()));
        assert_eq!(gone.class(), ErrorClass::MappingMissing);

        let busy = SyncError::from(RemoteError::ServerError {
            status: 503,
            body: String::new(),
        });
        assert_eq!(busy.class(), ErrorClass::Transient);

        let bad: SyncError = serde_json::from_str::<serde_json::Value>("{")
            .unwrap_err()
            .into();
        assert_eq!(bad.class(), ErrorClass::Permanent);

        let corrupt = SyncError::Integrity {
            path: "/a".into(),
            reason: "size".into(),
        };
        assert_eq!(corrupt.class(), ErrorClass::Integrity);
    }
}
