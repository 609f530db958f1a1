//! Error kinds for the sync pipeline.

use service_core::error::AppError;
use thiserror::Error;

/// Failure talking to the upstream feed provider. Never advances a cursor.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("provider returned {status} ({code}): {message}")]
    Api {
        status: u16,
        code: String,
        message: String,
    },

    #[error("feed changed during pagination; restart from the starting cursor")]
    PaginationInvalidated,

    #[error("failed to decode provider response: {0}")]
    Decode(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store backend error: {0}")]
    Backend(anyhow::Error),

    #[error("mutation '{0}' was already applied")]
    AlreadyApplied(String),

    #[error("failed to (de)serialize stored document: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Backend(anyhow::Error::new(err))
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("source item '{0}' is not tracked for this principal")]
    ItemNotFound(String),

    #[error("store read failed: {0}")]
    Store(#[source] StoreError),

    #[error("atomic commit failed: {0}")]
    Commit(#[source] StoreError),

    #[error("invalid request: {0}")]
    Validation(String),
}

impl SyncError {
    /// Whether the caller may simply retry the same call.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::Provider(_) | SyncError::Store(_) | SyncError::Commit(_)
        )
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SyncError::Provider(_) => "provider_error",
            SyncError::ItemNotFound(_) => "item_not_found",
            SyncError::Store(_) => "store_error",
            SyncError::Commit(_) => "commit_error",
            SyncError::Validation(_) => "validation_error",
        }
    }
}

impl From<SyncError> for AppError {
    fn from(err: SyncError) -> Self {
        match err {
            SyncError::ItemNotFound(_) => AppError::NotFound(anyhow::anyhow!(err.to_string())),
            SyncError::Validation(_) => AppError::BadRequest(anyhow::anyhow!(err.to_string())),
            SyncError::Provider(e) => AppError::BadGateway(e.to_string()),
            SyncError::Store(e) | SyncError::Commit(e) => {
                AppError::DatabaseError(anyhow::Error::new(e))
            }
        }
    }
}
