//! Gateway-level error joining the subsystem taxonomies, with the HTTP
//! status and machine-readable code each one maps to.

use serde_json::{json, Value};
use thiserror::Error;

use crate::artifact::StorageError;
use crate::auth::AuthError;
use crate::jobs::JobsError;
use crate::sandbox::SandboxError;
use crate::schema::ValidationError;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Sandbox(#[from] SandboxError),
    #[error(transparent)]
    Jobs(#[from] JobsError),
    #[error("access denied: {0}")]
    AccessDenied(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<anyhow::Error> for GatewayError {
    fn from(err: anyhow::Error) -> Self {
        GatewayError::Internal(format!("{err:#}"))
    }
}

impl GatewayError {
    pub fn status(&self) -> u16 {
        match self {
            GatewayError::Auth(AuthError::RateLimited(_)) => 429,
            GatewayError::Auth(_) => 401,
            GatewayError::Validation(_) => 422,
            GatewayError::Storage(err) => match err {
                StorageError::NotFound(_) => 404,
                StorageError::AccessDenied(_) => 403,
                StorageError::Expired(_) => 410,
                StorageError::Conflict(_) => 409,
                StorageError::TooLarge { .. } | StorageError::QuotaExceeded(_) => 413,
                StorageError::SizeMismatch { .. } | StorageError::HashMismatch { .. } => 422,
                StorageError::Corrupted(_) | StorageError::Io(_) | StorageError::Ledger(_) => 500,
            },
            GatewayError::Sandbox(_) => 500,
            GatewayError::Jobs(JobsError::OverCapacity { .. }) => 503,
            GatewayError::Jobs(JobsError::NotFound(_)) => 404,
            GatewayError::Jobs(JobsError::InvalidTransition { .. }) => 500,
            GatewayError::AccessDenied(_) => 403,
            GatewayError::NotFound(_) => 404,
            GatewayError::Internal(_) => 500,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::Auth(AuthError::RateLimited(_)) => "rate_limited",
            GatewayError::Auth(_) => "unauthorized",
            GatewayError::Validation(_) => "validation_failed",
            GatewayError::Storage(err) => match err {
                StorageError::NotFound(_) => "not_found",
                StorageError::AccessDenied(_) => "access_denied",
                StorageError::Expired(_) => "expired",
                StorageError::Conflict(_) => "conflict",
                StorageError::TooLarge { .. } => "too_large",
                StorageError::QuotaExceeded(_) => "quota_exceeded",
                StorageError::SizeMismatch { .. } => "size_mismatch",
                StorageError::HashMismatch { .. } => "hash_mismatch",
                StorageError::Corrupted(_) => "corrupted",
                StorageError::Io(_) | StorageError::Ledger(_) => "storage_error",
            },
            GatewayError::Sandbox(_) => "sandbox_error",
            GatewayError::Jobs(JobsError::OverCapacity { .. }) => "over_capacity",
            GatewayError::Jobs(JobsError::NotFound(_)) => "not_found",
            GatewayError::Jobs(JobsError::InvalidTransition { .. }) => "internal_error",
            GatewayError::AccessDenied(_) => "access_denied",
            GatewayError::NotFound(_) => "not_found",
            GatewayError::Internal(_) => "internal_error",
        }
    }

    pub fn path(&self) -> Option<&str> {
        match self {
            GatewayError::Validation(err) => err.path(),
            _ => None,
        }
    }

    /// Client-facing message. Server faults are not described in detail;
    /// auth failures say which check failed but nothing about keys.
    pub fn public_message(&self) -> String {
        if self.status() >= 500 {
            return match self {
                GatewayError::Jobs(JobsError::OverCapacity { .. }) => self.to_string(),
                _ => "internal error".to_string(),
            };
        }
        self.to_string()
    }

    pub fn body(&self) -> Value {
        let mut body = json!({
            "error": self.code(),
            "message": self.public_message(),
        });
        if let Some(path) = self.path() {
            body["path"] = Value::String(path.to_string());
        }
        body
    }
}
