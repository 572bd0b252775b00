use std::time::Duration;

use thiserror::Error;

use crate::db::DatabaseError;
use crate::host::HostError;
use crate::msteams::ClientError;

/// Classification shared by every failure the sync engine can observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Conflict,
    Unauthorized,
    PermissionDenied,
    RateLimited,
    TransientRemote,
    InvalidInput,
    InvalidWebhookSecret,
    FileTooLarge,
    ResolutionTooHigh,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::PermissionDenied => "permission_denied",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::TransientRemote => "transient_remote",
            ErrorKind::InvalidInput => "invalid_input",
            ErrorKind::InvalidWebhookSecret => "invalid_webhook_secret",
            ErrorKind::FileTooLarge => "file_too_large",
            ErrorKind::ResolutionTooHigh => "resolution_too_high",
            ErrorKind::Internal => "internal",
        }
    }
}

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("remote error: {0}")]
    Remote(#[from] ClientError),

    #[error("database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("host error: {0}")]
    Host(#[from] HostError),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("webhook secret does not match subscription {0}")]
    InvalidWebhookSecret(String),

    #[error("file {name} is {size} bytes, above the {limit} byte limit")]
    FileTooLarge { name: String, size: i64, limit: i64 },

    #[error("image {name} is {pixels} pixels, above the {limit} pixel limit")]
    ResolutionTooHigh { name: String, pixels: i64, limit: i64 },

    #[error("internal error: {0}")]
    Internal(String),
}

impl SyncError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::Remote(err) => err.kind(),
            SyncError::Database(DatabaseError::NotFound(_)) => ErrorKind::NotFound,
            SyncError::Database(DatabaseError::Conflict(_)) => ErrorKind::Conflict,
            SyncError::Database(_) => ErrorKind::Internal,
            SyncError::Host(HostError::NotFound(_)) => ErrorKind::NotFound,
            SyncError::Host(HostError::PermissionDenied(_)) => ErrorKind::PermissionDenied,
            SyncError::Host(_) => ErrorKind::Internal,
            SyncError::InvalidInput(_) => ErrorKind::InvalidInput,
            SyncError::InvalidWebhookSecret(_) => ErrorKind::InvalidWebhookSecret,
            SyncError::FileTooLarge { .. } => ErrorKind::FileTooLarge,
            SyncError::ResolutionTooHigh { .. } => ErrorKind::ResolutionTooHigh,
            SyncError::Internal(_) => ErrorKind::Internal,
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            SyncError::Remote(err) => err.retry_after,
            _ => None,
        }
    }
}
