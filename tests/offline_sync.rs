use std::path::Path;

use lineup::cache::{CacheLayer, CacheSource, EntityType, SqliteStorage};
use lineup::error::{RemoteError, SyncError};
use lineup::network::NetworkMonitor;
use lineup::queue::OperationKind;
use lineup::remote::{self, MemoryBackend, WriteRequest};
use lineup::status::StatusBoard;
use lineup::sync::{SyncOptions, SyncState};
use serde_json::json;

type Layer = CacheLayer<SqliteStorage, MemoryBackend>;

fn layer_with(storage: SqliteStorage, backend: &MemoryBackend, online: bool) -> Layer {
  let monitor = NetworkMonitor::new(online, StatusBoard::new(online));
  CacheLayer::new(storage, backend.clone(), monitor, "u1", SyncOptions::default())
}

fn layer(backend: &MemoryBackend, online: bool) -> Layer {
  layer_with(SqliteStorage::open_in_memory().unwrap(), backend, online)
}

async fn vote(layer: &Layer, target: &str, vote_type: i32) -> Result<lineup::WriteOutcome, SyncError> {
  layer
    .write(EntityType::Votes, target, json!({"voteType": vote_type}), OperationKind::VoteUpsert)
    .await
}

#[tokio::test]
async fn test_offline_vote_is_queued_and_readable() {
  let backend = MemoryBackend::new("u1");
  let layer = layer(&backend, false);

  let outcome = vote(&layer, "123", 2).await.unwrap();
  assert!(outcome.is_queued());
  assert_eq!(layer.queue_size().unwrap(), 1);
  assert_eq!(layer.status().queue_size, 1);

  let local = layer.read(EntityType::Votes, "123").await.unwrap();
  assert_eq!(local.source, CacheSource::Cache);
  assert_eq!(local.data["voteType"], json!(2));
  assert_eq!(backend.vote_count(), 0);
}

#[tokio::test]
async fn test_repeated_offline_votes_leave_one_operation() {
  let backend = MemoryBackend::new("u1");
  let layer = layer(&backend, false);

  vote(&layer, "123", 1).await.unwrap();
  vote(&layer, "123", -1).await.unwrap();

  let pending = layer.queue().list().unwrap();
  assert_eq!(pending.len(), 1);
  assert_eq!(pending[0].payload, json!({"voteType": -1}));
}

#[tokio::test]
async fn test_reconnect_replays_queue() {
  let backend = MemoryBackend::new("u1");
  let layer = layer(&backend, false);
  vote(&layer, "123", 2).await.unwrap();

  let mut transitions = layer.reconciler().subscribe_transitions();
  layer.monitor().report_signal(true);
  let report = layer.sync_now().await.unwrap();

  assert_eq!(report.replayed, 1);
  assert_eq!(report.state, SyncState::Idle);
  assert_eq!(transitions.recv().await.unwrap(), SyncState::Syncing);
  assert_eq!(transitions.recv().await.unwrap(), SyncState::Idle);
  assert_eq!(layer.queue_size().unwrap(), 0);
  assert_eq!(layer.status().queue_size, 0);
  assert_eq!(backend.vote("123", "u1").unwrap().vote_type, 2);

  let fresh = layer.read(EntityType::Votes, "123").await.unwrap();
  assert!(fresh.is_network());
}

#[tokio::test]
async fn test_rejected_replay_is_reported_lost() {
  let backend = MemoryBackend::new("u1");
  let layer = layer(&backend, false);
  vote(&layer, "closed-set", 2).await.unwrap();

  let mut lost = layer.subscribe_lost_writes();
  backend.reject_target("closed-set", RemoteError::Validation("voting closed".into()));
  layer.monitor().report_signal(true);
  let report = layer.sync_now().await.unwrap();

  assert_eq!(report.lost.len(), 1);
  assert_eq!(report.state, SyncState::Idle);
  assert_eq!(layer.queue_size().unwrap(), 0);

  let event = lost.recv().await.unwrap();
  assert_eq!(event.operation.target_key, "closed-set");
  assert!(matches!(event.error, RemoteError::Validation(_)));
}

#[tokio::test]
async fn test_independent_targets_converge_to_last_local_value() {
  let backend = MemoryBackend::new("u1");
  let layer = layer(&backend, false);
  vote(&layer, "a", 1).await.unwrap();
  vote(&layer, "b", -1).await.unwrap();
  vote(&layer, "a", 2).await.unwrap();

  layer.monitor().report_signal(true);
  let report = layer.sync_now().await.unwrap();

  assert_eq!(report.replayed, 2);
  assert_eq!(backend.vote("a", "u1").unwrap().vote_type, 2);
  assert_eq!(backend.vote("b", "u1").unwrap().vote_type, -1);
}

#[tokio::test]
async fn test_vote_then_unvote_offline_ends_deleted() {
  let backend = MemoryBackend::new("u1");
  let online = layer(&backend, true);
  vote(&online, "a", 1).await.unwrap();
  assert!(backend.vote("a", "u1").is_some());

  online.monitor().report_signal(false);
  vote(&online, "a", 2).await.unwrap();
  online
    .write(EntityType::Votes, "a", json!(null), OperationKind::VoteDelete)
    .await
    .unwrap();

  online.monitor().report_signal(true);
  online.sync_now().await.unwrap();
  assert!(backend.vote("a", "u1").is_none());
}

#[tokio::test]
async fn test_transient_failure_stays_queued_until_next_pass() {
  let backend = MemoryBackend::new("u1");
  let layer = layer(&backend, false);
  vote(&layer, "a", 1).await.unwrap();

  layer.monitor().report_signal(true);
  backend.fail_next(RemoteError::Server {
    status: 503,
    message: "unavailable".into(),
  });
  let report = layer.sync_now().await.unwrap();
  assert_eq!(report.retryable_failures, 1);
  assert_eq!(report.state, SyncState::SyncFailed { remaining: 1 });
  assert_eq!(layer.sync_state(), SyncState::SyncFailed { remaining: 1 });

  let report = layer.sync_now().await.unwrap();
  assert_eq!(report.replayed, 1);
  assert_eq!(layer.sync_state(), SyncState::Idle);
}

#[tokio::test]
async fn test_duplicate_dispatch_creates_one_record() {
  let backend = MemoryBackend::new("u1");
  let payload = json!({"voteType": 1});
  let request = WriteRequest {
    kind: OperationKind::VoteUpsert,
    target_key: "a",
    user_id: "u1",
    payload: &payload,
    idempotency_key: "same-key",
  };

  remote::apply(&backend, request).await.unwrap();
  remote::apply(&backend, request).await.unwrap();

  assert_eq!(backend.vote_count(), 1);
  assert_eq!(backend.distinct_idempotency_keys(), 1);
}

#[tokio::test]
async fn test_never_cached_offline_read_has_no_data() {
  let backend = MemoryBackend::new("u1");
  let layer = layer(&backend, false);

  let err = layer.read(EntityType::Artists, "unknown").await.unwrap_err();
  assert!(matches!(err, SyncError::NoDataAvailable { .. }));
}

#[tokio::test]
async fn test_full_queue_refuses_write_and_keeps_cache_unchanged() {
  let backend = MemoryBackend::new("u1");
  let storage = SqliteStorage::open_in_memory().unwrap().with_max_pending(2);
  let layer = layer_with(storage, &backend, false);

  vote(&layer, "a", 1).await.unwrap();
  vote(&layer, "b", 1).await.unwrap();
  let err = vote(&layer, "c", 1).await.unwrap_err();
  assert!(matches!(err, SyncError::QueueFull(_)));

  assert_eq!(layer.queue_size().unwrap(), 2);
  assert!(layer.read(EntityType::Votes, "c").await.is_err());

  // Compaction into an existing target still fits
  vote(&layer, "a", 2).await.unwrap();
  assert_eq!(layer.queue_size().unwrap(), 2);
}

fn reopen(path: &Path, backend: &MemoryBackend, online: bool) -> Layer {
  layer_with(SqliteStorage::open(path).unwrap(), backend, online)
}

#[tokio::test]
async fn test_queue_survives_restart() {
  let dir = tempfile::tempdir().unwrap();
  let path = dir.path().join("cache.db");
  let backend = MemoryBackend::new("u1");

  {
    let layer = reopen(&path, &backend, false);
    vote(&layer, "a", 2).await.unwrap();
    layer
      .write(EntityType::Notes, "a", json!({"text": "front left"}), OperationKind::NoteSave)
      .await
      .unwrap();
  }

  let layer = reopen(&path, &backend, false);
  assert_eq!(layer.queue_size().unwrap(), 2);
  let note = layer.read(EntityType::Notes, "a").await.unwrap();
  assert_eq!(note.data["text"], json!("front left"));

  layer.monitor().report_signal(true);
  let report = layer.sync_now().await.unwrap();
  assert_eq!(report.replayed, 2);
  assert_eq!(backend.vote("a", "u1").unwrap().vote_type, 2);
  assert_eq!(backend.note("a", "u1").unwrap().text, "front left");
}

#[tokio::test]
async fn test_auto_sync_drains_queue_on_reconnect() {
  let backend = MemoryBackend::new("u1");
  let layer = layer(&backend, false);
  vote(&layer, "a", 1).await.unwrap();

  let mut status = layer.subscribe_status();
  let _auto = layer.start_auto_sync();
  layer.monitor().report_signal(true);

  tokio::time::timeout(std::time::Duration::from_secs(5), async {
    loop {
      if status.borrow_and_update().queue_size == 0 {
        break;
      }
      status.changed().await.unwrap();
    }
  })
  .await
  .unwrap();

  assert_eq!(backend.vote("a", "u1").unwrap().vote_type, 1);
}
