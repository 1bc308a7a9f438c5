use chrono::{DateTime, Utc};
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use serde::Serialize;
use thiserror::Error;

use super::db::models::SensorId;

/// Closed set of failure kinds surfaced to callers of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorType {
    NotFound,
    TenantMismatch,
    DuplicateConstraint,
    InvalidReference,
    OutOfRange,
    InvalidTransition,
    RetryableTransient,
    PolicyFailure,
    Configuration,
    Internal,
}

/// Why a single row of an ingestion batch was refused.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum RowRejection {
    InvalidSensorReference(SensorId),
    OutOfRangeTimestamp(DateTime<Utc>),
    NonFiniteValue,
    TenantMismatch { payload: String },
}

impl std::fmt::Display for RowRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RowRejection::InvalidSensorReference(id) => write!(f, "unknown sensor {}", id),
            RowRejection::OutOfRangeTimestamp(ts) => {
                write!(f, "timestamp {} is outside the accepted window", ts.to_rfc3339())
            }
            RowRejection::NonFiniteValue => write!(f, "value is not a finite number"),
            RowRejection::TenantMismatch { payload } => {
                write!(f, "row carries organization '{}'", payload)
            }
        }
    }
}

#[derive(Error, Debug)]
pub enum AppError {
    /// Absent for the caller's organization. Never distinguishes "exists elsewhere".
    #[error("{entity} '{key}' not found")]
    NotFound { entity: &'static str, key: String },

    #[error("organization mismatch: caller is '{caller}', payload names '{payload}'")]
    TenantMismatch { caller: String, payload: String },

    #[error("{field} '{value}' already exists")]
    DuplicateConstraint { field: &'static str, value: String },

    #[error("{entity} '{key}' referenced but absent")]
    InvalidReference { entity: &'static str, key: String },

    #[error("batch rejected at row {row}: {reason}")]
    RejectedRow { row: usize, reason: RowRejection },

    #[error("invalid transition for {entity}: {from} -> {to}")]
    InvalidTransition {
        entity: &'static str,
        from: String,
        to: String,
    },

    #[error("transient storage failure: {0}")]
    RetryableTransient(String),

    #[error("{policy} pass failed: {message}")]
    PolicyFailure { policy: &'static str, message: String },

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn kind(&self) -> ErrorType {
        match self {
            AppError::NotFound { .. } => ErrorType::NotFound,
            AppError::TenantMismatch { .. } => ErrorType::TenantMismatch,
            AppError::DuplicateConstraint { .. } => ErrorType::DuplicateConstraint,
            AppError::InvalidReference { .. } => ErrorType::InvalidReference,
            AppError::RejectedRow { reason, .. } => match reason {
                RowRejection::InvalidSensorReference(_) => ErrorType::InvalidReference,
                RowRejection::OutOfRangeTimestamp(_) | RowRejection::NonFiniteValue => {
                    ErrorType::OutOfRange
                }
                RowRejection::TenantMismatch { .. } => ErrorType::TenantMismatch,
            },
            AppError::InvalidTransition { .. } => ErrorType::InvalidTransition,
            AppError::RetryableTransient(_) => ErrorType::RetryableTransient,
            AppError::PolicyFailure { .. } => ErrorType::PolicyFailure,
            AppError::Configuration(_) => ErrorType::Configuration,
            AppError::Internal(_) => ErrorType::Internal,
        }
    }

    pub fn not_found(entity: &'static str, key: impl ToString) -> Self {
        AppError::NotFound {
            entity,
            key: key.to_string(),
        }
    }

    pub fn from_io_err(err: std::io::Error, context: &str) -> AppError {
        AppError::RetryableTransient(format!("{} {}", context, err))
    }

    pub fn from_json_err(err: serde_json::Error, context: &str) -> AppError {
        AppError::Internal(format!("{} {}", context, err))
    }

    pub fn from_diesel_err(err: DieselError, context: &str) -> AppError {
        match err {
            DieselError::NotFound => AppError::NotFound {
                entity: "row",
                key: context.to_string(),
            },
            DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, info) => {
                AppError::DuplicateConstraint {
                    field: "row",
                    value: format!("{} {}", context, info.message()),
                }
            }
            DieselError::DatabaseError(DatabaseErrorKind::ClosedConnection, info) => {
                AppError::RetryableTransient(format!("{} {}", context, info.message()))
            }
            // SQLITE_BUSY / SQLITE_LOCKED surface as unknown database errors.
            DieselError::DatabaseError(_, info)
                if info.message().contains("locked") || info.message().contains("busy") =>
            {
                AppError::RetryableTransient(format!("{} {}", context, info.message()))
            }
            other => AppError::Internal(format!("{} {}", context, other)),
        }
    }

    pub fn from_pool_err(err: diesel::r2d2::PoolError, context: &str) -> AppError {
        AppError::RetryableTransient(format!("{} {}", context, err))
    }

    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorType::RetryableTransient
    }
}

impl From<DieselError> for AppError {
    fn from(err: DieselError) -> Self {
        AppError::from_diesel_err(err, "While running a transaction:")
    }
}

pub type AppResult<T> = Result<T, AppError>;
