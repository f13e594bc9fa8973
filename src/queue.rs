//! Pending operation queue.
//!
//! Writes that could not be confirmed by the backend are recorded here and
//! replayed by the reconciler. Queue order is replay order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::cache::{EntityType, LocalStore, LocalUpdate};
use crate::error::Result;
use crate::status::StatusBoard;

/// Kind of deferred write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OperationKind {
  VoteUpsert,
  VoteDelete,
  NoteSave,
  NoteDelete,
}

impl OperationKind {
  pub fn as_str(&self) -> &'static str {
    match self {
      OperationKind::VoteUpsert => "vote-upsert",
      OperationKind::VoteDelete => "vote-delete",
      OperationKind::NoteSave => "note-save",
      OperationKind::NoteDelete => "note-delete",
    }
  }

  /// Namespace the operation's target lives in.
  pub fn entity_type(&self) -> EntityType {
    match self {
      OperationKind::VoteUpsert | OperationKind::VoteDelete => EntityType::Votes,
      OperationKind::NoteSave | OperationKind::NoteDelete => EntityType::Notes,
    }
  }

  pub fn is_delete(&self) -> bool {
    matches!(self, OperationKind::VoteDelete | OperationKind::NoteDelete)
  }

  /// The optimistic change this operation makes to the local store.
  pub fn local_update(&self, payload: &Value) -> LocalUpdate {
    if self.is_delete() {
      LocalUpdate::Delete
    } else {
      LocalUpdate::Put(payload.clone())
    }
  }
}

impl fmt::Display for OperationKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for OperationKind {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "vote-upsert" => Ok(OperationKind::VoteUpsert),
      "vote-delete" => Ok(OperationKind::VoteDelete),
      "note-save" => Ok(OperationKind::NoteSave),
      "note-delete" => Ok(OperationKind::NoteDelete),
      other => Err(format!("unknown operation kind '{}'", other)),
    }
  }
}

/// A write waiting to be enqueued.
#[derive(Debug, Clone, PartialEq)]
pub struct NewOperation {
  pub kind: OperationKind,
  pub entity_type: EntityType,
  pub target_key: String,
  pub user_id: String,
  pub payload: Value,
  pub created_at: DateTime<Utc>,
}

impl NewOperation {
  pub fn new(
    kind: OperationKind,
    target_key: impl Into<String>,
    user_id: impl Into<String>,
    payload: Value,
  ) -> Self {
    Self {
      kind,
      entity_type: kind.entity_type(),
      target_key: target_key.into(),
      user_id: user_id.into(),
      payload,
      created_at: Utc::now(),
    }
  }

  /// Key for a write sent directly, before it has a queue position.
  pub fn idempotency_key(&self) -> String {
    let input = format!(
      "{}:{}:{}:{}",
      self.user_id,
      self.entity_type,
      self.target_key,
      self.created_at.timestamp_nanos_opt().unwrap_or_default()
    );

    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
  }
}

/// A queued write with its replay position.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingOperation {
  /// Monotonic per store; never reused across restarts
  pub sequence: i64,
  pub kind: OperationKind,
  pub entity_type: EntityType,
  pub target_key: String,
  pub user_id: String,
  pub payload: Value,
  pub created_at: DateTime<Utc>,
}

impl PendingOperation {
  /// Cache key this operation writes to, shared with the key lock table.
  pub fn lock_key(&self) -> String {
    lock_key(self.entity_type, &self.target_key)
  }

  /// Stable key the backend can use to recognise a duplicate dispatch.
  pub fn idempotency_key(&self) -> String {
    let input = format!(
      "{}:{}:{}:{}",
      self.user_id, self.entity_type, self.target_key, self.sequence
    );

    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
  }
}

/// Key used to serialize mutations of one cached record.
pub fn lock_key(entity_type: EntityType, key: &str) -> String {
  format!("{}/{}", entity_type, key)
}

/// Durable queue of deferred writes backed by the local store.
pub struct PendingQueue<S: LocalStore> {
  storage: Arc<S>,
  status: StatusBoard,
}

impl<S: LocalStore> PendingQueue<S> {
  pub fn new(storage: Arc<S>, status: StatusBoard) -> Self {
    Self { storage, status }
  }

  /// Append an operation. Every kind is last-value, so it is collapsed into
  /// any earlier operation on the same (user, target).
  pub fn enqueue(&self, op: NewOperation) -> Result<PendingOperation> {
    let queued = self.storage.enqueue(&op)?;
    tracing::debug!(
      sequence = queued.sequence,
      kind = %queued.kind,
      key = %queued.lock_key(),
      "queued pending operation"
    );
    self.publish_len();
    Ok(queued)
  }

  /// Apply the optimistic local change and enqueue in a single transaction.
  pub fn enqueue_with_update(&self, op: NewOperation) -> Result<PendingOperation> {
    let update = op.kind.local_update(&op.payload);
    let queued = self
      .storage
      .apply_offline_write(&update, &op)?;
    tracing::debug!(
      sequence = queued.sequence,
      kind = %queued.kind,
      key = %queued.lock_key(),
      "applied optimistic update and queued operation"
    );
    self.publish_len();
    Ok(queued)
  }

  /// Collapse queued operations on one target. Returns how many were removed.
  pub fn compact(&self, user_id: &str, entity_type: EntityType, target_key: &str) -> Result<usize> {
    let removed = self.storage.compact(user_id, entity_type, target_key)?;
    if removed > 0 {
      tracing::debug!(removed, key = %lock_key(entity_type, target_key), "compacted queue");
      self.publish_len();
    }
    Ok(removed)
  }

  /// Remove an operation after it was replayed (or discarded).
  pub fn dequeue(&self, op: &PendingOperation) -> Result<bool> {
    let removed = self.storage.dequeue(op.sequence)?;
    self.publish_len();
    Ok(removed)
  }

  pub fn list(&self) -> Result<Vec<PendingOperation>> {
    self.storage.list_pending()
  }

  pub fn len(&self) -> Result<usize> {
    self.storage.pending_count()
  }

  pub fn is_empty(&self) -> Result<bool> {
    Ok(self.len()? == 0)
  }

  pub fn has_pending(&self, entity_type: EntityType, key: &str) -> Result<bool> {
    self.storage.has_pending(entity_type, key)
  }

  /// Push the current queue length to the status feed.
  pub fn publish_len(&self) {
    match self.storage.pending_count() {
      Ok(len) => self.status.set_queue_size(len),
      Err(e) => tracing::warn!("could not read queue length: {}", e),
    }
  }
}

impl<S: LocalStore> Clone for PendingQueue<S> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      status: self.status.clone(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::SqliteStorage;
  use serde_json::json;

  fn queue() -> PendingQueue<SqliteStorage> {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    PendingQueue::new(storage, StatusBoard::new(false))
  }

  #[test]
  fn test_enqueue_assigns_increasing_sequence() {
    let q = queue();
    let a = q
      .enqueue(NewOperation::new(OperationKind::VoteUpsert, "1", "u", json!({"voteType": 1})))
      .unwrap();
    let b = q
      .enqueue(NewOperation::new(OperationKind::VoteUpsert, "2", "u", json!({"voteType": 2})))
      .unwrap();
    assert!(b.sequence > a.sequence);
    assert_eq!(q.len().unwrap(), 2);
  }

  #[test]
  fn test_repeated_votes_collapse_to_latest_value() {
    let q = queue();
    let first = q
      .enqueue(NewOperation::new(OperationKind::VoteUpsert, "123", "u", json!({"voteType": 1})))
      .unwrap();
    q.enqueue(NewOperation::new(OperationKind::VoteUpsert, "123", "u", json!({"voteType": 2})))
      .unwrap();

    let pending = q.list().unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].sequence, first.sequence);
    assert_eq!(pending[0].payload, json!({"voteType": 2}));
  }

  #[test]
  fn test_delete_supersedes_upsert() {
    let q = queue();
    q.enqueue(NewOperation::new(OperationKind::VoteUpsert, "9", "u", json!({"voteType": 1})))
      .unwrap();
    q.enqueue(NewOperation::new(OperationKind::VoteDelete, "9", "u", json!(null)))
      .unwrap();

    let pending = q.list().unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].kind, OperationKind::VoteDelete);
  }

  #[test]
  fn test_compaction_keeps_other_targets_in_order() {
    let q = queue();
    q.enqueue(NewOperation::new(OperationKind::VoteUpsert, "a", "u", json!({"voteType": 1})))
      .unwrap();
    q.enqueue(NewOperation::new(OperationKind::VoteUpsert, "b", "u", json!({"voteType": 1})))
      .unwrap();
    q.enqueue(NewOperation::new(OperationKind::VoteUpsert, "a", "u", json!({"voteType": -1})))
      .unwrap();

    let targets: Vec<_> = q.list().unwrap().into_iter().map(|op| op.target_key).collect();
    assert_eq!(targets, vec!["a", "b"]);
  }

  #[test]
  fn test_different_users_do_not_compact() {
    let q = queue();
    q.enqueue(NewOperation::new(OperationKind::VoteUpsert, "a", "alice", json!({"voteType": 1})))
      .unwrap();
    q.enqueue(NewOperation::new(OperationKind::VoteUpsert, "a", "bob", json!({"voteType": 2})))
      .unwrap();
    assert_eq!(q.len().unwrap(), 2);
  }

  #[test]
  fn test_dequeue_publishes_queue_size() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let status = StatusBoard::new(false);
    let q = PendingQueue::new(storage, status.clone());

    let op = q
      .enqueue(NewOperation::new(OperationKind::NoteSave, "7", "u", json!({"text": "front row"})))
      .unwrap();
    assert_eq!(status.current().queue_size, 1);

    assert!(q.dequeue(&op).unwrap());
    assert_eq!(status.current().queue_size, 0);
    assert!(!q.dequeue(&op).unwrap());
  }

  #[test]
  fn test_idempotency_key_is_stable_per_operation() {
    let q = queue();
    let op = q
      .enqueue(NewOperation::new(OperationKind::VoteUpsert, "1", "u", json!({"voteType": 1})))
      .unwrap();
    assert_eq!(op.idempotency_key(), op.clone().idempotency_key());
    assert_eq!(op.idempotency_key().len(), 64);
  }
}
