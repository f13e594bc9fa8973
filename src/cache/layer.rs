//! Read-through cache facade that orchestrates the local store, the pending
//! queue and the remote backend.

use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};

use super::storage::LocalStore;
use super::traits::{CacheResult, CacheSource, Cacheable, CachedEntity, EntityType};
use crate::error::{RemoteError, Result, SyncError};
use crate::network::NetworkMonitor;
use crate::queue::{lock_key, NewOperation, OperationKind, PendingQueue};
use crate::remote::{self, Applied, RemoteBackend, WriteRequest};
use crate::status::{ConnectivityState, StatusBoard};
use crate::sync::{AutoSync, KeyLocks, LostWrite, Reconciler, SyncOptions, SyncReport, SyncState};

/// What happened to a write.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOutcome {
  /// The backend accepted it; `data` is the stored record (None for deletes)
  Confirmed { data: Option<Value> },
  /// Applied locally and queued for reconciliation
  Queued { sequence: i64 },
}

impl WriteOutcome {
  pub fn is_queued(&self) -> bool {
    matches!(self, WriteOutcome::Queued { .. })
  }
}

/// The single entry point application code uses for reads and writes.
///
/// This layer sits between the application and the backend, serving the
/// network when it can and the local store when it cannot.
pub struct CacheLayer<S: LocalStore, B: RemoteBackend> {
  storage: Arc<S>,
  queue: PendingQueue<S>,
  backend: Arc<B>,
  monitor: NetworkMonitor,
  locks: KeyLocks,
  status: StatusBoard,
  reconciler: Reconciler<S, B>,
  user_id: String,
  /// Bound on each network call made on behalf of a reader or writer
  call_timeout: Duration,
}

impl<S: LocalStore, B: RemoteBackend> CacheLayer<S, B> {
  /// Create a new cache layer acting for `user_id`.
  pub fn new(
    storage: S,
    backend: B,
    monitor: NetworkMonitor,
    user_id: impl Into<String>,
    options: SyncOptions,
  ) -> Self {
    let storage = Arc::new(storage);
    let backend = Arc::new(backend);
    let status = monitor.status_board();
    let queue = PendingQueue::new(Arc::clone(&storage), status.clone());
    let locks = KeyLocks::new();
    let reconciler = Reconciler::new(
      Arc::clone(&storage),
      queue.clone(),
      Arc::clone(&backend),
      monitor.clone(),
      locks.clone(),
      status.clone(),
      options,
    );

    queue.publish_len();

    Self {
      storage,
      queue,
      backend,
      monitor,
      locks,
      status,
      reconciler,
      user_id: user_id.into(),
      call_timeout: options.replay_timeout,
    }
  }

  /// Read a record.
  ///
  /// 1. Offline: serve the local store
  /// 2. Online: fetch, write the result back, return it tagged `network`
  /// 3. On network failure, fall back to the local store tagged `cache`
  ///
  /// A record with queued writes keeps its optimistic value until they replay.
  /// The key lock is held from fetch to write-back, so a response can never
  /// overwrite a write confirmed while it was in flight.
  pub async fn read(&self, entity_type: EntityType, key: &str) -> Result<CacheResult<Value>> {
    if self.monitor.is_online() {
      let _guard = self.locks.lock(&lock_key(entity_type, key)).await;
      match self.fetch(entity_type, key).await {
        Ok(value) => return Ok(self.write_back(entity_type, key, value)),
        Err(RemoteError::NotFound(_)) => self.forget(entity_type, key),
        Err(e) => {
          tracing::debug!(key = %lock_key(entity_type, key), "fetch failed, using cache: {}", e);
        }
      }
    }

    match self.local(entity_type, key) {
      Some(cached) => Ok(CacheResult::from_cache(cached.payload, cached.synced_at)),
      None => Err(SyncError::NoDataAvailable {
        entity_type: entity_type.to_string(),
        key: key.to_string(),
      }),
    }
  }

  /// Read a record and coerce it into its typed representation.
  pub async fn read_typed<T: Cacheable>(&self, key: &str) -> Result<CacheResult<T>> {
    self
      .read(T::entity_type(), key)
      .await?
      .try_map(|value| serde_json::from_value(value).map_err(SyncError::from))
  }

  /// Write a record.
  ///
  /// Online writes go straight to the backend and the confirmed value is
  /// cached. Offline writes, and online writes that fail transiently, are
  /// applied optimistically and queued together. A target that already has
  /// queued writes queues new ones behind them.
  pub async fn write(
    &self,
    entity_type: EntityType,
    key: &str,
    payload: Value,
    kind: OperationKind,
  ) -> Result<WriteOutcome> {
    if kind.entity_type() != entity_type {
      return Err(SyncError::NonRetryableRemoteFailure(RemoteError::Validation(format!(
        "{} does not apply to {}",
        kind, entity_type
      ))));
    }

    let op = NewOperation {
      kind,
      entity_type,
      target_key: key.to_string(),
      user_id: self.user_id.clone(),
      payload,
      created_at: chrono::Utc::now(),
    };

    let _guard = self.locks.lock(&lock_key(entity_type, key)).await;
    let queued_ahead = self.queue.has_pending(entity_type, key)?;

    if self.monitor.is_online() && !queued_ahead {
      match self.send(&op).await {
        Ok(applied) => {
          let data = self.store_confirmed(entity_type, key, applied);
          return Ok(WriteOutcome::Confirmed { data });
        }
        Err(e) if e.is_retryable() => {
          tracing::info!(key = %lock_key(entity_type, key), "write failed, queueing: {}", e);
        }
        Err(e) => return Err(SyncError::NonRetryableRemoteFailure(e)),
      }
    }

    let queued = self.queue.enqueue_with_update(op)?;
    Ok(WriteOutcome::Queued {
      sequence: queued.sequence,
    })
  }

  /// Run a reconciliation pass now.
  pub async fn sync_now(&self) -> Result<SyncReport> {
    self.reconciler.sync_now().await
  }

  pub fn sync_state(&self) -> SyncState {
    self.reconciler.state()
  }

  pub fn status(&self) -> ConnectivityState {
    self.status.current()
  }

  pub fn subscribe_status(&self) -> watch::Receiver<ConnectivityState> {
    self.status.subscribe()
  }

  pub fn subscribe_lost_writes(&self) -> broadcast::Receiver<LostWrite> {
    self.reconciler.subscribe_lost_writes()
  }

  pub fn queue_size(&self) -> Result<usize> {
    self.queue.len()
  }

  pub fn queue(&self) -> &PendingQueue<S> {
    &self.queue
  }

  pub fn monitor(&self) -> &NetworkMonitor {
    &self.monitor
  }

  pub fn reconciler(&self) -> &Reconciler<S, B> {
    &self.reconciler
  }

  pub fn user_id(&self) -> &str {
    &self.user_id
  }

  /// Check that the backend is reachable and update connectivity.
  pub async fn probe(&self) -> bool {
    self.monitor.probe(&*self.backend).await
  }

  async fn fetch(&self, entity_type: EntityType, key: &str) -> Result<Value, RemoteError> {
    match tokio::time::timeout(self.call_timeout, self.backend.fetch_entity(entity_type, key)).await {
      Ok(result) => result,
      Err(_) => Err(RemoteError::Timeout),
    }
  }

  async fn send(&self, op: &NewOperation) -> Result<Applied, RemoteError> {
    let idempotency_key = op.idempotency_key();
    let request = WriteRequest {
      kind: op.kind,
      target_key: &op.target_key,
      user_id: &op.user_id,
      payload: &op.payload,
      idempotency_key: &idempotency_key,
    };

    match tokio::time::timeout(self.call_timeout, remote::apply(&*self.backend, request)).await {
      Ok(result) => result,
      Err(_) => Err(RemoteError::Timeout),
    }
  }

  /// Cache a fetched value. Caller holds the key lock.
  fn write_back(&self, entity_type: EntityType, key: &str, value: Value) -> CacheResult<Value> {
    if self.queue.has_pending(entity_type, key).unwrap_or(false) {
      if let Some(cached) = self.local(entity_type, key) {
        return CacheResult::from_cache(cached.payload, cached.synced_at);
      }
    }

    if let Err(e) = self
      .storage
      .put(entity_type, key, &value, CacheSource::Network)
    {
      // Caching is best effort; the caller still gets the network value
      tracing::warn!(key = %lock_key(entity_type, key), "could not cache fetched value: {}", e);
    }
    CacheResult::from_network(value)
  }

  fn store_confirmed(&self, entity_type: EntityType, key: &str, applied: Applied) -> Option<Value> {
    let (result, data) = match applied {
      Applied::Upserted(value) => (
        self
          .storage
          .put(entity_type, key, &value, CacheSource::Network),
        Some(value),
      ),
      Applied::Deleted => (self.storage.delete(entity_type, key), None),
    };
    if let Err(e) = result {
      tracing::warn!(key = %lock_key(entity_type, key), "could not cache confirmed write: {}", e);
    }
    data
  }

  /// The backend says the record is gone; drop it unless writes are queued.
  /// Caller holds the key lock.
  fn forget(&self, entity_type: EntityType, key: &str) {
    if self.queue.has_pending(entity_type, key).unwrap_or(true) {
      return;
    }
    if let Err(e) = self.storage.delete(entity_type, key) {
      tracing::warn!(key = %lock_key(entity_type, key), "could not drop removed record: {}", e);
    }
  }

  /// Local lookup; storage failures degrade to a miss.
  fn local(&self, entity_type: EntityType, key: &str) -> Option<CachedEntity> {
    match self.storage.get(entity_type, key) {
      Ok(found) => found,
      Err(e) => {
        tracing::warn!(key = %lock_key(entity_type, key), "cache read failed: {}", e);
        None
      }
    }
  }
}

impl<S: LocalStore + 'static, B: RemoteBackend + 'static> CacheLayer<S, B> {
  /// Sync automatically whenever connectivity returns.
  pub fn start_auto_sync(&self) -> AutoSync {
    self.reconciler.spawn_auto_sync()
  }
}

impl<S: LocalStore, B: RemoteBackend> Clone for CacheLayer<S, B> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      queue: self.queue.clone(),
      backend: Arc::clone(&self.backend),
      monitor: self.monitor.clone(),
      locks: self.locks.clone(),
      status: self.status.clone(),
      reconciler: self.reconciler.clone(),
      user_id: self.user_id.clone(),
      call_timeout: self.call_timeout,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::SqliteStorage;
  use crate::remote::MemoryBackend;
  use serde_json::json;

  fn layer(online: bool) -> (CacheLayer<SqliteStorage, MemoryBackend>, MemoryBackend) {
    let backend = MemoryBackend::new("u1");
    let monitor = NetworkMonitor::new(online, StatusBoard::new(online));
    let layer = CacheLayer::new(
      SqliteStorage::open_in_memory().unwrap(),
      backend.clone(),
      monitor,
      "u1",
      SyncOptions::default(),
    );
    (layer, backend)
  }

  #[tokio::test]
  async fn test_read_caches_network_result() {
    let (layer, backend) = layer(true);
    backend.insert_entity(EntityType::Artists, "a1", json!({"id": "a1", "name": "Bicep"}));

    let result = layer.read(EntityType::Artists, "a1").await.unwrap();
    assert!(result.is_network());

    backend.set_reachable(false);
    let result = layer.read(EntityType::Artists, "a1").await.unwrap();
    assert_eq!(result.source, CacheSource::Cache);
    assert_eq!(result.data["name"], json!("Bicep"));
  }

  #[tokio::test]
  async fn test_offline_read_skips_network() {
    let (layer, backend) = layer(false);
    backend.insert_entity(EntityType::Artists, "a1", json!({"id": "a1", "name": "Bicep"}));

    let err = layer.read(EntityType::Artists, "a1").await.unwrap_err();
    assert!(matches!(err, SyncError::NoDataAvailable { .. }));
  }

  #[tokio::test]
  async fn test_remote_not_found_drops_cached_copy() {
    let (layer, backend) = layer(true);
    backend.insert_entity(EntityType::Profiles, "p1", json!({"id": "p1", "username": "sam"}));
    layer.read(EntityType::Profiles, "p1").await.unwrap();

    backend.remove_entity(EntityType::Profiles, "p1");

    let err = layer.read(EntityType::Profiles, "p1").await.unwrap_err();
    assert!(matches!(err, SyncError::NoDataAvailable { .. }));
  }

  #[tokio::test]
  async fn test_slow_read_does_not_clobber_confirmed_write() {
    let (layer, backend) = layer(true);
    layer
      .write(EntityType::Votes, "a1", json!({"voteType": 1}), OperationKind::VoteUpsert)
      .await
      .unwrap();

    backend.set_read_delay(Some(Duration::from_millis(150)));
    let reader = tokio::spawn({
      let layer = layer.clone();
      async move { layer.read(EntityType::Votes, "a1").await }
    });
    tokio::time::sleep(Duration::from_millis(30)).await;

    let outcome = layer
      .write(EntityType::Votes, "a1", json!({"voteType": 2}), OperationKind::VoteUpsert)
      .await
      .unwrap();
    assert!(!outcome.is_queued());

    let read = reader.await.unwrap().unwrap();
    assert_eq!(read.data["voteType"], json!(1));

    layer.monitor().report_signal(false);
    let cached = layer.read(EntityType::Votes, "a1").await.unwrap();
    assert_eq!(cached.source, CacheSource::Cache);
    assert_eq!(cached.data["voteType"], json!(2));
  }

  #[tokio::test]
  async fn test_mismatched_kind_is_rejected() {
    let (layer, _) = layer(true);
    let err = layer
      .write(EntityType::Artists, "a1", json!({}), OperationKind::VoteUpsert)
      .await
      .unwrap_err();
    assert!(matches!(err, SyncError::NonRetryableRemoteFailure(_)));
  }

  #[tokio::test]
  async fn test_transient_write_failure_is_queued() {
    let (layer, backend) = layer(true);
    backend.fail_next(RemoteError::Timeout);

    let outcome = layer
      .write(EntityType::Votes, "a1", json!({"voteType": 1}), OperationKind::VoteUpsert)
      .await
      .unwrap();
    assert!(outcome.is_queued());
    assert_eq!(layer.status().queue_size, 1);

    let cached = layer.read(EntityType::Votes, "a1").await.unwrap();
    assert_eq!(cached.source, CacheSource::Cache);
    assert_eq!(cached.data["voteType"], json!(1));
  }

  #[tokio::test]
  async fn test_online_write_queues_behind_pending_target() {
    let (layer, backend) = layer(false);
    layer
      .write(EntityType::Votes, "a1", json!({"voteType": 1}), OperationKind::VoteUpsert)
      .await
      .unwrap();

    layer.monitor().report_signal(true);
    let outcome = layer
      .write(EntityType::Votes, "a1", json!({"voteType": 2}), OperationKind::VoteUpsert)
      .await
      .unwrap();
    assert!(outcome.is_queued());
    assert_eq!(backend.write_calls(), 0);
    assert_eq!(layer.queue_size().unwrap(), 1);
  }

  #[tokio::test]
  async fn test_non_retryable_online_write_is_not_queued() {
    let (layer, backend) = layer(true);
    backend.reject_target("a1", RemoteError::Validation("closed".into()));

    let err = layer
      .write(EntityType::Votes, "a1", json!({"voteType": 1}), OperationKind::VoteUpsert)
      .await
      .unwrap_err();
    assert!(matches!(err, SyncError::NonRetryableRemoteFailure(_)));
    assert_eq!(layer.queue_size().unwrap(), 0);
  }
}
