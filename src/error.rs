//! Error types for the offline cache and sync engine.

use thiserror::Error;

/// Failures surfaced by the cache, queue and reconciliation layers.
#[derive(Debug, Error)]
pub enum SyncError {
  /// The local storage medium could not be opened or read.
  #[error("local storage unavailable: {0}")]
  StorageUnavailable(String),

  /// A write to local storage failed (quota, disk full, I/O error).
  #[error("local storage write failed: {0}")]
  StorageWriteFailed(String),

  /// The pending operation queue cannot accept another write.
  #[error("pending operation queue is full ({0})")]
  QueueFull(String),

  /// Nothing cached locally and the network could not provide it.
  #[error("no data available for {entity_type}/{key}")]
  NoDataAvailable { entity_type: String, key: String },

  /// A transient remote failure; the write stays queued.
  #[error("remote call failed, will retry: {0}")]
  RetryableRemoteFailure(#[source] RemoteError),

  /// A permanent remote rejection; the write is lost.
  #[error("remote rejected the write: {0}")]
  NonRetryableRemoteFailure(#[source] RemoteError),

  /// A cached or remote payload did not match the expected entity shape.
  #[error("payload error: {0}")]
  Serialization(#[from] serde_json::Error),
}

impl From<RemoteError> for SyncError {
  fn from(err: RemoteError) -> Self {
    if err.is_retryable() {
      SyncError::RetryableRemoteFailure(err)
    } else {
      SyncError::NonRetryableRemoteFailure(err)
    }
  }
}

/// Typed failures returned by the remote backend.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
  /// Connection refused, DNS failure, reset, etc.
  #[error("network error: {0}")]
  Network(String),

  /// The call did not complete within the replay timeout.
  #[error("request timed out")]
  Timeout,

  /// The backend answered with a 5xx status.
  #[error("server error {status}: {message}")]
  Server { status: u16, message: String },

  /// The backend asked us to slow down.
  #[error("rate limited")]
  RateLimited,

  /// The backend rejected the payload as invalid.
  #[error("validation rejected: {0}")]
  Validation(String),

  /// Credentials were missing, expired or insufficient.
  #[error("authentication failed: {0}")]
  Auth(String),

  /// The write conflicts with server state.
  #[error("conflict: {0}")]
  Conflict(String),

  /// The requested record does not exist remotely.
  #[error("not found: {0}")]
  NotFound(String),
}

impl RemoteError {
  /// Transient failures keep the operation queued for the next sync pass.
  pub fn is_retryable(&self) -> bool {
    matches!(
      self,
      RemoteError::Network(_)
        | RemoteError::Timeout
        | RemoteError::Server { .. }
        | RemoteError::RateLimited
    )
  }
}

pub type Result<T, E = SyncError> = std::result::Result<T, E>;
