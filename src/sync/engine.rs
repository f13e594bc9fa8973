//! Reconciliation engine: replays queued writes once the backend is reachable.

use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, Mutex as AsyncMutex};
use tokio::task::JoinHandle;

use super::locks::KeyLocks;
use crate::cache::{CacheSource, LocalStore};
use crate::error::{RemoteError, Result};
use crate::network::NetworkMonitor;
use crate::queue::{PendingOperation, PendingQueue};
use crate::remote::{self, Applied, RemoteBackend, WriteRequest};
use crate::status::StatusBoard;

/// Default number of targets replayed in parallel.
pub const DEFAULT_CONCURRENCY: usize = 4;

/// Default bound on one replay attempt.
pub const DEFAULT_REPLAY_TIMEOUT: Duration = Duration::from_secs(10);

/// Reconciler state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "kebab-case")]
pub enum SyncState {
  Idle,
  Syncing,
  /// Some operations from the last pass are still queued
  SyncFailed { remaining: usize },
}

/// A write the backend permanently rejected. The UI must surface it.
#[derive(Debug, Clone)]
pub struct LostWrite {
  pub operation: PendingOperation,
  pub error: RemoteError,
}

/// Summary of one reconciliation pass.
#[derive(Debug, Clone)]
pub struct SyncReport {
  /// Operations confirmed by the backend
  pub replayed: usize,
  /// Operations that failed transiently and stay queued
  pub retryable_failures: usize,
  /// Operations not attempted (held behind a failure, or went offline)
  pub deferred: usize,
  pub lost: Vec<LostWrite>,
  pub state: SyncState,
}

impl SyncReport {
  fn empty(state: SyncState) -> Self {
    Self {
      replayed: 0,
      retryable_failures: 0,
      deferred: 0,
      lost: Vec::new(),
      state,
    }
  }

  pub fn remaining(&self) -> usize {
    self.retryable_failures + self.deferred
  }
}

/// Tuning for reconciliation passes.
#[derive(Debug, Clone, Copy)]
pub struct SyncOptions {
  pub concurrency: usize,
  pub replay_timeout: Duration,
}

impl Default for SyncOptions {
  fn default() -> Self {
    Self {
      concurrency: DEFAULT_CONCURRENCY,
      replay_timeout: DEFAULT_REPLAY_TIMEOUT,
    }
  }
}

#[derive(Default)]
struct GroupOutcome {
  replayed: usize,
  retryable_failures: usize,
  deferred: usize,
  lost: Vec<LostWrite>,
}

/// Replays the pending queue against the backend.
///
/// This is the only component that removes replayed operations. Passes are
/// serialized; within a pass each target is replayed in sequence order while
/// independent targets run concurrently.
pub struct Reconciler<S: LocalStore, B: RemoteBackend> {
  storage: Arc<S>,
  queue: PendingQueue<S>,
  backend: Arc<B>,
  monitor: NetworkMonitor,
  locks: KeyLocks,
  status: StatusBoard,
  options: SyncOptions,
  state: Arc<Mutex<SyncState>>,
  pass: Arc<AsyncMutex<()>>,
  transitions: broadcast::Sender<SyncState>,
  lost_writes: broadcast::Sender<LostWrite>,
}

impl<S: LocalStore, B: RemoteBackend> Reconciler<S, B> {
  pub fn new(
    storage: Arc<S>,
    queue: PendingQueue<S>,
    backend: Arc<B>,
    monitor: NetworkMonitor,
    locks: KeyLocks,
    status: StatusBoard,
    options: SyncOptions,
  ) -> Self {
    let (transitions, _) = broadcast::channel(64);
    let (lost_writes, _) = broadcast::channel(64);
    Self {
      storage,
      queue,
      backend,
      monitor,
      locks,
      status,
      options,
      state: Arc::new(Mutex::new(SyncState::Idle)),
      pass: Arc::new(AsyncMutex::new(())),
      transitions,
      lost_writes,
    }
  }

  pub fn state(&self) -> SyncState {
    *self.state.lock().unwrap_or_else(|e| e.into_inner())
  }

  /// Receive every state transition.
  pub fn subscribe_transitions(&self) -> broadcast::Receiver<SyncState> {
    self.transitions.subscribe()
  }

  /// Receive writes the backend permanently rejected.
  pub fn subscribe_lost_writes(&self) -> broadcast::Receiver<LostWrite> {
    self.lost_writes.subscribe()
  }

  fn set_state(&self, next: SyncState) {
    let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
    if *state == next {
      return;
    }
    tracing::debug!(from = ?*state, to = ?next, "sync state transition");
    *state = next;
    drop(state);

    self.status.set_syncing(next == SyncState::Syncing);
    let _ = self.transitions.send(next);
  }

  /// Run one reconciliation pass now.
  ///
  /// Does nothing while offline. A pass already in progress is awaited first.
  pub async fn sync_now(&self) -> Result<SyncReport> {
    let _pass = self.pass.lock().await;

    let pending = self.queue.list()?;
    if pending.is_empty() {
      self.set_state(SyncState::Idle);
      return Ok(SyncReport::empty(SyncState::Idle));
    }
    if !self.monitor.is_online() {
      tracing::info!(queued = pending.len(), "offline, sync deferred");
      let mut report = SyncReport::empty(self.state());
      report.deferred = pending.len();
      return Ok(report);
    }

    self.set_state(SyncState::Syncing);
    tracing::info!(queued = pending.len(), "sync started");

    let groups = group_by_target(pending);
    let outcomes: Vec<GroupOutcome> = stream::iter(groups)
      .map(|ops| self.replay_group(ops))
      .buffer_unordered(self.options.concurrency.max(1))
      .collect()
      .await;

    let mut report = SyncReport::empty(SyncState::Idle);
    for outcome in outcomes {
      report.replayed += outcome.replayed;
      report.retryable_failures += outcome.retryable_failures;
      report.deferred += outcome.deferred;
      report.lost.extend(outcome.lost);
    }

    report.state = match report.remaining() {
      0 => SyncState::Idle,
      remaining => SyncState::SyncFailed { remaining },
    };
    self.set_state(report.state);
    self.queue.publish_len();

    tracing::info!(
      replayed = report.replayed,
      retryable = report.retryable_failures,
      deferred = report.deferred,
      lost = report.lost.len(),
      "sync finished"
    );
    Ok(report)
  }

  /// Replay one target's operations in order under its key lock.
  async fn replay_group(&self, snapshot: Vec<PendingOperation>) -> GroupOutcome {
    let mut outcome = GroupOutcome::default();
    let Some(first) = snapshot.first() else {
      return outcome;
    };
    let (entity_type, target_key) = (first.entity_type, first.target_key.clone());
    let _guard = self.locks.lock(&first.lock_key()).await;

    // Writes made while waiting for the lock may have compacted or added
    // operations, so re-read the target under the lock.
    let ops: Vec<PendingOperation> = match self.queue.list() {
      Ok(all) => all
        .into_iter()
        .filter(|op| op.entity_type == entity_type && op.target_key == target_key)
        .collect(),
      Err(e) => {
        tracing::warn!(key = %target_key, "could not read queue, deferring: {}", e);
        outcome.deferred = snapshot.len();
        return outcome;
      }
    };

    for (i, op) in ops.iter().enumerate() {
      if !self.monitor.is_online() {
        outcome.deferred += ops.len() - i;
        break;
      }

      match self.replay_one(op).await {
        Ok(applied) => {
          if !self.finish(op) {
            // Still queued, so the next pass replays it again
            outcome.deferred += ops.len() - i;
            break;
          }
          self.merge(op, applied);
          outcome.replayed += 1;
        }
        Err(e) if e.is_retryable() => {
          tracing::debug!(sequence = op.sequence, key = %op.lock_key(), "retryable failure: {}", e);
          outcome.retryable_failures += 1;
          // Later writes to this target must not overtake this one
          outcome.deferred += ops.len() - i - 1;
          break;
        }
        Err(e) => {
          tracing::warn!(
            sequence = op.sequence,
            kind = %op.kind,
            key = %op.lock_key(),
            "write rejected, discarding: {}",
            e
          );
          if !self.finish(op) {
            outcome.deferred += ops.len() - i;
            break;
          }
          self.drop_unconfirmed(op);
          let lost = LostWrite {
            operation: op.clone(),
            error: e,
          };
          let _ = self.lost_writes.send(lost.clone());
          outcome.lost.push(lost);
        }
      }
    }

    outcome
  }

  async fn replay_one(&self, op: &PendingOperation) -> Result<Applied, RemoteError> {
    let idempotency_key = op.idempotency_key();
    let request = WriteRequest {
      kind: op.kind,
      target_key: &op.target_key,
      user_id: &op.user_id,
      payload: &op.payload,
      idempotency_key: &idempotency_key,
    };

    match tokio::time::timeout(self.options.replay_timeout, remote::apply(&*self.backend, request))
      .await
    {
      Ok(result) => result,
      Err(_) => Err(RemoteError::Timeout),
    }
  }

  /// Dequeue a settled operation. Returns false if it is still queued.
  fn finish(&self, op: &PendingOperation) -> bool {
    match self.queue.dequeue(op) {
      Ok(_) => true,
      Err(e) => {
        // Replay is an idempotent upsert, so a second dispatch is harmless
        tracing::warn!(sequence = op.sequence, "failed to dequeue replayed operation: {}", e);
        false
      }
    }
  }

  /// Store the backend's canonical state unless newer local writes are queued.
  fn merge(&self, op: &PendingOperation, applied: Applied) {
    if self.has_newer(op) {
      return;
    }

    let result = match applied {
      Applied::Upserted(value) => {
        self
          .storage
          .put(op.entity_type, &op.target_key, &value, CacheSource::Network)
      }
      Applied::Deleted => self.storage.delete(op.entity_type, &op.target_key),
    };
    if let Err(e) = result {
      tracing::warn!(key = %op.lock_key(), "failed to merge server state: {}", e);
    }
  }

  /// Forget an optimistic value that will never be confirmed.
  fn drop_unconfirmed(&self, op: &PendingOperation) {
    if self.has_newer(op) {
      return;
    }

    match self.storage.get(op.entity_type, &op.target_key) {
      Ok(Some(cached)) if cached.source == CacheSource::Cache => {
        if let Err(e) = self.storage.delete(op.entity_type, &op.target_key) {
          tracing::warn!(key = %op.lock_key(), "failed to drop rejected value: {}", e);
        }
      }
      Ok(_) => {}
      Err(e) => tracing::warn!(key = %op.lock_key(), "failed to read cache: {}", e),
    }
  }

  fn has_newer(&self, op: &PendingOperation) -> bool {
    self
      .queue
      .has_pending(op.entity_type, &op.target_key)
      .unwrap_or(true)
  }
}

impl<S: LocalStore + 'static, B: RemoteBackend + 'static> Reconciler<S, B> {
  /// Start a task that syncs whenever the monitor comes back online.
  pub fn spawn_auto_sync(&self) -> AutoSync {
    let this = self.clone();
    let mut subscription = self.monitor.subscribe();

    let handle = tokio::spawn(async move {
      while let Some(online) = subscription.changed().await {
        if !online {
          continue;
        }
        match this.queue.is_empty() {
          Ok(true) => {}
          Ok(false) => {
            if let Err(e) = this.sync_now().await {
              tracing::warn!("automatic sync failed: {}", e);
            }
          }
          Err(e) => tracing::warn!("could not read queue: {}", e),
        }
      }
    });

    AutoSync { handle }
  }
}

impl<S: LocalStore, B: RemoteBackend> Clone for Reconciler<S, B> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      queue: self.queue.clone(),
      backend: Arc::clone(&self.backend),
      monitor: self.monitor.clone(),
      locks: self.locks.clone(),
      status: self.status.clone(),
      options: self.options,
      state: Arc::clone(&self.state),
      pass: Arc::clone(&self.pass),
      transitions: self.transitions.clone(),
      lost_writes: self.lost_writes.clone(),
    }
  }
}

/// Handle for the automatic sync task; stops it on drop.
pub struct AutoSync {
  handle: JoinHandle<()>,
}

impl AutoSync {
  pub fn stop(self) {}
}

impl Drop for AutoSync {
  fn drop(&mut self) {
    self.handle.abort();
  }
}

/// Split the queue into per-target runs, keeping first-seen target order.
fn group_by_target(ops: Vec<PendingOperation>) -> Vec<Vec<PendingOperation>> {
  let mut index: HashMap<String, usize> = HashMap::new();
  let mut groups: Vec<Vec<PendingOperation>> = Vec::new();

  for op in ops {
    let key = op.lock_key();
    match index.get(&key) {
      Some(&i) => groups[i].push(op),
      None => {
        index.insert(key, groups.len());
        groups.push(vec![op]);
      }
    }
  }

  groups
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CachedEntity, EntityType, LocalUpdate, SqliteStorage};
  use crate::error::SyncError;
  use crate::queue::{NewOperation, OperationKind};
  use crate::remote::MemoryBackend;
  use serde_json::{json, Value};

  struct Harness {
    storage: Arc<SqliteStorage>,
    queue: PendingQueue<SqliteStorage>,
    backend: MemoryBackend,
    monitor: NetworkMonitor,
    reconciler: Reconciler<SqliteStorage, MemoryBackend>,
  }

  fn harness(online: bool) -> Harness {
    harness_with(
      online,
      SyncOptions {
        concurrency: 2,
        replay_timeout: Duration::from_millis(200),
      },
    )
  }

  fn harness_with(online: bool, options: SyncOptions) -> Harness {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let status = StatusBoard::new(online);
    let queue = PendingQueue::new(Arc::clone(&storage), status.clone());
    let backend = MemoryBackend::new("u1");
    let monitor = NetworkMonitor::new(online, status.clone());
    let reconciler = Reconciler::new(
      Arc::clone(&storage),
      queue.clone(),
      Arc::new(backend.clone()),
      monitor.clone(),
      KeyLocks::new(),
      status,
      options,
    );
    Harness {
      storage,
      queue,
      backend,
      monitor,
      reconciler,
    }
  }

  fn vote(target: &str, vote_type: i32) -> NewOperation {
    NewOperation::new(OperationKind::VoteUpsert, target, "u1", json!({"voteType": vote_type}))
  }

  #[test]
  fn test_group_by_target_keeps_sequence_order() {
    let h = harness(true);
    h.queue.enqueue(NewOperation::new(OperationKind::NoteSave, "a", "u1", json!({"text": "1"}))).unwrap();
    h.queue.enqueue(vote("b", 1)).unwrap();
    h.queue.enqueue(NewOperation::new(OperationKind::NoteDelete, "b", "u1", json!(null))).unwrap();

    let groups = group_by_target(h.queue.list().unwrap());
    assert_eq!(groups.len(), 3);
    assert_eq!(groups[0][0].kind, OperationKind::NoteSave);
  }

  #[tokio::test]
  async fn test_retryable_failure_keeps_operation_queued() {
    let h = harness(true);
    h.queue.enqueue(vote("a", 2)).unwrap();
    h.backend.fail_next(RemoteError::Server {
      status: 503,
      message: "maintenance".into(),
    });

    let report = h.reconciler.sync_now().await.unwrap();
    assert_eq!(report.retryable_failures, 1);
    assert_eq!(report.state, SyncState::SyncFailed { remaining: 1 });
    assert_eq!(h.queue.len().unwrap(), 1);

    // Next trigger retries
    let report = h.reconciler.sync_now().await.unwrap();
    assert_eq!(report.state, SyncState::Idle);
    assert_eq!(h.queue.len().unwrap(), 0);
    assert_eq!(h.backend.vote("a", "u1").unwrap().vote_type, 2);
  }

  #[tokio::test]
  async fn test_failure_isolated_per_target() {
    let h = harness(true);
    h.queue.enqueue(vote("a", 1)).unwrap();
    h.queue.enqueue(vote("b", 1)).unwrap();
    h.backend.reject_target("a", RemoteError::Network("reset".into()));

    let report = h.reconciler.sync_now().await.unwrap();
    assert_eq!(report.replayed, 1);
    assert_eq!(report.retryable_failures, 1);
    assert!(h.backend.vote("b", "u1").is_some());
    assert!(h.backend.vote("a", "u1").is_none());
  }

  #[tokio::test]
  async fn test_timeout_is_retryable() {
    let h = harness(true);
    h.queue.enqueue(vote("a", 1)).unwrap();
    h.backend.set_latency(Some(Duration::from_secs(1)));

    let report = h.reconciler.sync_now().await.unwrap();
    assert_eq!(report.retryable_failures, 1);
    assert_eq!(h.queue.len().unwrap(), 1);
  }

  #[tokio::test]
  async fn test_offline_sync_is_deferred() {
    let h = harness(false);
    h.queue.enqueue(vote("a", 1)).unwrap();

    let report = h.reconciler.sync_now().await.unwrap();
    assert_eq!(report.deferred, 1);
    assert_eq!(report.replayed, 0);
    assert_eq!(h.backend.write_calls(), 0);
  }

  #[tokio::test]
  async fn test_rejected_write_drops_optimistic_value() {
    let h = harness(true);
    let op = vote("a", 1);
    h.queue.enqueue_with_update(op).unwrap();
    h.backend.reject_target("a", RemoteError::Auth("revoked".into()));
    let mut lost_rx = h.reconciler.subscribe_lost_writes();

    let report = h.reconciler.sync_now().await.unwrap();
    assert_eq!(report.lost.len(), 1);
    assert_eq!(report.state, SyncState::Idle);
    assert!(h.storage.get(EntityType::Votes, "a").unwrap().is_none());
    assert_eq!(lost_rx.recv().await.unwrap().operation.target_key, "a");
  }

  #[tokio::test]
  async fn test_auto_sync_runs_on_reconnect() {
    let h = harness(false);
    h.queue.enqueue(vote("a", 2)).unwrap();
    let mut transitions = h.reconciler.subscribe_transitions();
    let _auto = h.reconciler.spawn_auto_sync();

    h.monitor.report_signal(true);

    assert_eq!(transitions.recv().await.unwrap(), SyncState::Syncing);
    assert_eq!(transitions.recv().await.unwrap(), SyncState::Idle);
    assert_eq!(h.queue.len().unwrap(), 0);
  }

  #[tokio::test]
  async fn test_going_offline_mid_pass_finishes_in_flight_replay() {
    let h = harness_with(
      true,
      SyncOptions {
        concurrency: 1,
        replay_timeout: Duration::from_secs(2),
      },
    );
    for target in ["a", "b", "c"] {
      h.queue.enqueue(vote(target, 1)).unwrap();
    }
    h.backend.set_latency(Some(Duration::from_millis(100)));

    let reconciler = h.reconciler.clone();
    let pass = tokio::spawn(async move { reconciler.sync_now().await });
    tokio::time::sleep(Duration::from_millis(40)).await;
    h.monitor.report_signal(false);

    let report = pass.await.unwrap().unwrap();
    assert_eq!(report.replayed, 1);
    assert_eq!(report.deferred, 2);
    assert_eq!(report.state, SyncState::SyncFailed { remaining: 2 });

    assert!(h.backend.vote("a", "u1").is_some());
    assert!(h.backend.vote("b", "u1").is_none());
    assert!(h.backend.vote("c", "u1").is_none());
    let merged = h.storage.get(EntityType::Votes, "a").unwrap().unwrap();
    assert_eq!(merged.source, CacheSource::Network);

    let left: Vec<_> = h.queue.list().unwrap().into_iter().map(|op| op.target_key).collect();
    assert_eq!(left, vec!["b", "c"]);
  }

  #[tokio::test]
  async fn test_fan_out_is_bounded_by_concurrency() {
    let h = harness_with(
      true,
      SyncOptions {
        concurrency: 2,
        replay_timeout: Duration::from_secs(2),
      },
    );
    for i in 0..6 {
      h.queue.enqueue(vote(&format!("set-{}", i), 2)).unwrap();
    }
    h.backend.set_latency(Some(Duration::from_millis(30)));

    let report = h.reconciler.sync_now().await.unwrap();
    assert_eq!(report.replayed, 6);
    assert_eq!(h.backend.max_concurrent_calls(), 2);
  }

  /// Store whose dequeue always fails.
  struct StuckQueue(SqliteStorage);

  impl LocalStore for StuckQueue {
    fn get(&self, entity_type: EntityType, key: &str) -> Result<Option<CachedEntity>> {
      self.0.get(entity_type, key)
    }

    fn put(&self, entity_type: EntityType, key: &str, payload: &Value, source: CacheSource) -> Result<()> {
      self.0.put(entity_type, key, payload, source)
    }

    fn delete(&self, entity_type: EntityType, key: &str) -> Result<()> {
      self.0.delete(entity_type, key)
    }

    fn list_pending(&self) -> Result<Vec<PendingOperation>> {
      self.0.list_pending()
    }

    fn pending_count(&self) -> Result<usize> {
      self.0.pending_count()
    }

    fn has_pending(&self, entity_type: EntityType, key: &str) -> Result<bool> {
      self.0.has_pending(entity_type, key)
    }

    fn enqueue(&self, op: &NewOperation) -> Result<PendingOperation> {
      self.0.enqueue(op)
    }

    fn apply_offline_write(&self, update: &LocalUpdate, op: &NewOperation) -> Result<PendingOperation> {
      self.0.apply_offline_write(update, op)
    }

    fn compact(&self, user_id: &str, entity_type: EntityType, target_key: &str) -> Result<usize> {
      self.0.compact(user_id, entity_type, target_key)
    }

    fn dequeue(&self, _sequence: i64) -> Result<bool> {
      Err(SyncError::StorageWriteFailed("read-only".into()))
    }
  }

  #[tokio::test]
  async fn test_undequeued_replay_counts_as_remaining() {
    let storage = Arc::new(StuckQueue(SqliteStorage::open_in_memory().unwrap()));
    let status = StatusBoard::new(true);
    let queue = PendingQueue::new(Arc::clone(&storage), status.clone());
    let backend = MemoryBackend::new("u1");
    let monitor = NetworkMonitor::new(true, status.clone());
    let reconciler = Reconciler::new(
      storage,
      queue.clone(),
      Arc::new(backend.clone()),
      monitor,
      KeyLocks::new(),
      status,
      SyncOptions::default(),
    );

    queue.enqueue(vote("a", 2)).unwrap();
    let report = reconciler.sync_now().await.unwrap();

    assert_eq!(report.replayed, 0);
    assert_eq!(report.remaining(), 1);
    assert_eq!(report.state, SyncState::SyncFailed { remaining: 1 });
    assert_eq!(backend.vote("a", "u1").unwrap().vote_type, 2);
    assert_eq!(queue.len().unwrap(), 1);
  }
}
