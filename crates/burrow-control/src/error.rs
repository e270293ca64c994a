//! Error taxonomy shared by every control-plane component

use sea_orm::{DbErr, SqlErr};
use thiserror::Error;

use crate::retry::is_transient;

/// Errors returned by control-plane operations
#[derive(Error, Debug)]
pub enum ControlError {
    /// Referenced site, resource, exit node, role or grant does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Duplicate grant or identifier; callers may treat this as success
    #[error("Conflict: {0}")]
    Conflict(String),

    /// No eligible exit node or no free address space
    #[error("Capacity exhausted: {0}")]
    CapacityExhausted(String),

    /// Missing, unknown or expired credentials
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Caller is authenticated but the operation is not permitted
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Request is well-formed but violates a rule (e.g. granting an admin role)
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Store serialization failure or deadlock that survived every retry
    #[error("Transient store failure: {0}")]
    Transient(String),

    /// Exit node timed out or refused the connection
    #[error("Exit node unavailable: {0}")]
    Unavailable(String),

    /// Exit node answered with an error
    #[error("Exit node error: {0}")]
    ExitNode(String),

    #[error("Database error: {0}")]
    Database(DbErr),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ControlError {
    /// Stable machine-readable code used in API error bodies
    pub fn code(&self) -> &'static str {
        match self {
            ControlError::NotFound(_) => "NOT_FOUND",
            ControlError::Conflict(_) => "CONFLICT",
            ControlError::CapacityExhausted(_) => "CAPACITY_EXHAUSTED",
            ControlError::Unauthorized(_) => "UNAUTHORIZED",
            ControlError::Forbidden(_) => "FORBIDDEN",
            ControlError::InvalidInput(_) => "INVALID_INPUT",
            ControlError::Transient(_) => "TRANSIENT",
            ControlError::Unavailable(_) => "EXIT_NODE_UNAVAILABLE",
            ControlError::ExitNode(_) => "EXIT_NODE_ERROR",
            ControlError::Database(_) => "DATABASE_ERROR",
            ControlError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    pub fn not_found(what: impl std::fmt::Display) -> Self {
        ControlError::NotFound(what.to_string())
    }

    /// True when the underlying store rejected a write on a unique constraint
    pub fn is_unique_violation(&self) -> bool {
        matches!(
            self,
            ControlError::Database(err)
                if matches!(err.sql_err(), Some(SqlErr::UniqueConstraintViolation(_)))
        )
    }
}

impl From<DbErr> for ControlError {
    fn from(err: DbErr) -> Self {
        if is_transient(&err) {
            ControlError::Transient(err.to_string())
        } else {
            ControlError::Database(err)
        }
    }
}

impl From<burrow_auth::SecretError> for ControlError {
    fn from(err: burrow_auth::SecretError) -> Self {
        ControlError::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for ControlError {
    fn from(err: serde_json::Error) -> Self {
        ControlError::InvalidInput(format!("malformed payload: {}", err))
    }
}

impl From<reqwest::Error> for ControlError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() {
            ControlError::Unavailable(err.to_string())
        } else {
            ControlError::ExitNode(err.to_string())
        }
    }
}

pub type ControlResult<T> = Result<T, ControlError>;

#[cfg(test)]
mod tests {
    use super::*;
    use sea_orm::RuntimeErr;

    #[test]
    fn test_deadlock_maps_to_transient() {
        let err = DbErr::Exec(RuntimeErr::Internal(
            "error returned from database: deadlock detected (40P01)".to_string(),
        ));
        assert!(matches!(ControlError::from(err), ControlError::Transient(_)));
    }

    #[test]
    fn test_other_db_errors_stay_database() {
        let err = DbErr::Custom("boom".to_string());
        let mapped = ControlError::from(err);
        assert!(matches!(mapped, ControlError::Database(_)));
        assert_eq!(mapped.code(), "DATABASE_ERROR");
    }

    #[test]
    fn test_codes_are_distinct_for_caller_facing_kinds() {
        assert_eq!(ControlError::not_found("site 1").code(), "NOT_FOUND");
        assert_eq!(ControlError::Conflict("x".into()).code(), "CONFLICT");
        assert_eq!(
            ControlError::InvalidInput("x".into()).code(),
            "INVALID_INPUT"
        );
        assert_eq!(
            ControlError::Unavailable("x".into()).code(),
            "EXIT_NODE_UNAVAILABLE"
        );
    }
}
