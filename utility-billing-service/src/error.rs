//! Error taxonomy for ledger operations.

use service_core::error::AppError;
use thiserror::Error;

/// Failure of a ledger operation.
///
/// Every variant aborts the surrounding transaction; nothing is partially
/// persisted.
#[derive(Debug, Error)]
pub enum BillingError {
    /// User-correctable input problem, reported before any write.
    #[error("{0}")]
    Validation(String),

    /// Stored data is missing a row it must reference.
    #[error("{0}")]
    Reference(String),

    #[error("{0}")]
    NotFound(String),

    /// The statement changed since the caller read it.
    #[error("{0}")]
    Conflict(String),

    #[error("Store failure: {0}")]
    Infrastructure(#[source] anyhow::Error),
}

impl BillingError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn reference(message: impl Into<String>) -> Self {
        Self::Reference(message.into())
    }

    pub fn infrastructure(context: &str, err: impl std::fmt::Display) -> Self {
        Self::Infrastructure(anyhow::anyhow!("{}: {}", context, err))
    }

    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::Reference(_) => "reference_error",
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::Infrastructure(_) => "db_error",
        }
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        Self::Infrastructure(anyhow::Error::new(err))
    }
}

impl From<BillingError> for AppError {
    fn from(err: BillingError) -> Self {
        match err {
            BillingError::Validation(msg) => AppError::BadRequest(anyhow::anyhow!(msg)),
            BillingError::NotFound(msg) => AppError::NotFound(anyhow::anyhow!(msg)),
            BillingError::Conflict(msg) => AppError::Conflict(anyhow::anyhow!(msg)),
            BillingError::Reference(msg) => AppError::InternalError(anyhow::anyhow!(msg)),
            BillingError::Infrastructure(e) => AppError::DatabaseError(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_maps_to_bad_request_with_reason() {
        let app: AppError =
            BillingError::validation("Invalid reading for sub meter \"Kitchen\"").into();
        match app {
            AppError::BadRequest(e) => {
                assert_eq!(e.to_string(), "Invalid reading for sub meter \"Kitchen\"")
            }
            other => panic!("unexpected mapping: {:?}", other),
        }
    }

    #[test]
    fn infrastructure_maps_to_database_error() {
        let app: AppError = BillingError::infrastructure("Failed to commit", "reset").into();
        assert!(matches!(app, AppError::DatabaseError(_)));
    }
}
