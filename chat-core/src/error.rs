use thiserror::Error;

/// Errors surfaced by the conversation sync engine. None of them are fatal:
/// every one is recoverable by retrying the operation.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("No authenticated user")]
    Unauthenticated,

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Failed to send message: {0}")]
    SendFailed(#[source] anyhow::Error),

    #[error("Failed to establish subscription: {0}")]
    SubscriptionFailed(#[source] anyhow::Error),

    #[error("Failed to fetch messages: {0}")]
    FetchFailed(#[source] anyhow::Error),

    #[error("Failed to persist read watermark: {0}")]
    StorageFailed(#[source] anyhow::Error),
}

pub type SyncResult<T> = Result<T, SyncError>;
