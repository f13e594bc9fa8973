//! In-process backend with failure injection.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use super::RemoteBackend;
use crate::cache::EntityType;
use crate::error::RemoteError;
use crate::festival::types::{GroupVotes, Note, VoteRecord};
use crate::network::Reachability;

#[derive(Default)]
struct MemoryState {
  entities: HashMap<(EntityType, String), Value>,
  /// (target, user) -> vote
  votes: BTreeMap<(String, String), VoteRecord>,
  notes: BTreeMap<(String, String), Note>,
  groups: HashMap<String, Vec<String>>,
  unreachable: bool,
  failures: VecDeque<RemoteError>,
  rejected_targets: HashMap<String, RemoteError>,
  idempotency_keys: HashSet<String>,
  write_calls: usize,
  latency: Option<Duration>,
  /// Delay between reading a record and returning it
  read_delay: Option<Duration>,
  in_flight: usize,
  max_in_flight: usize,
}

/// Counts a call as in flight until dropped, even if the caller gives up.
struct InFlight {
  state: Arc<Mutex<MemoryState>>,
}

impl InFlight {
  fn start(state: &Arc<Mutex<MemoryState>>) -> Self {
    let mut inner = state.lock().unwrap_or_else(|e| e.into_inner());
    inner.in_flight += 1;
    inner.max_in_flight = inner.max_in_flight.max(inner.in_flight);
    Self {
      state: Arc::clone(state),
    }
  }
}

impl Drop for InFlight {
  fn drop(&mut self) {
    let mut inner = self.state.lock().unwrap_or_else(|e| e.into_inner());
    inner.in_flight -= 1;
  }
}

/// Backend that keeps everything in memory.
///
/// Behaves like the hosted backend's upsert-by-(target, user) semantics and
/// lets callers inject unreachability, one-shot failures and per-target
/// rejections.
#[derive(Clone)]
pub struct MemoryBackend {
  user_id: String,
  state: Arc<Mutex<MemoryState>>,
}

impl MemoryBackend {
  /// Create a backend whose session belongs to `user_id`.
  pub fn new(user_id: impl Into<String>) -> Self {
    Self {
      user_id: user_id.into(),
      state: Arc::new(Mutex::new(MemoryState::default())),
    }
  }

  pub fn insert_entity(&self, entity_type: EntityType, key: &str, value: Value) {
    self.lock().entities.insert((entity_type, key.to_string()), value);
  }

  pub fn remove_entity(&self, entity_type: EntityType, key: &str) {
    self.lock().entities.remove(&(entity_type, key.to_string()));
  }

  pub fn add_group_member(&self, group_id: &str, user_id: &str) {
    self
      .lock()
      .groups
      .entry(group_id.to_string())
      .or_default()
      .push(user_id.to_string());
  }

  pub fn set_reachable(&self, reachable: bool) {
    self.lock().unreachable = !reachable;
  }

  /// Fail the next call (of any kind) with `err`.
  pub fn fail_next(&self, err: RemoteError) {
    self.lock().failures.push_back(err);
  }

  /// Fail every write to `target_id` with `err`.
  pub fn reject_target(&self, target_id: &str, err: RemoteError) {
    self.lock().rejected_targets.insert(target_id.to_string(), err);
  }

  pub fn clear_rejections(&self) {
    self.lock().rejected_targets.clear();
  }

  /// Delay every call by `latency`.
  pub fn set_latency(&self, latency: Option<Duration>) {
    self.lock().latency = latency;
  }

  /// Hold fetched records for `delay` before returning them, so the
  /// response reflects the state at the start of the call.
  pub fn set_read_delay(&self, delay: Option<Duration>) {
    self.lock().read_delay = delay;
  }

  /// Highest number of calls that were in flight at the same time.
  pub fn max_concurrent_calls(&self) -> usize {
    self.lock().max_in_flight
  }

  pub fn vote(&self, target_id: &str, user_id: &str) -> Option<VoteRecord> {
    self
      .lock()
      .votes
      .get(&(target_id.to_string(), user_id.to_string()))
      .cloned()
  }

  pub fn vote_count(&self) -> usize {
    self.lock().votes.len()
  }

  pub fn note(&self, target_id: &str, user_id: &str) -> Option<Note> {
    self
      .lock()
      .notes
      .get(&(target_id.to_string(), user_id.to_string()))
      .cloned()
  }

  /// Number of write calls that reached the backend.
  pub fn write_calls(&self) -> usize {
    self.lock().write_calls
  }

  /// Number of distinct idempotency keys seen by vote upserts.
  pub fn distinct_idempotency_keys(&self) -> usize {
    self.lock().idempotency_keys.len()
  }

  fn snapshot(
    &self,
    entity_type: EntityType,
    key: &str,
  ) -> (Option<serde_json::Result<Value>>, Option<Duration>) {
    let state = self.lock();
    let user = (key.to_string(), self.user_id.clone());

    let found = match entity_type {
      EntityType::Votes => state.votes.get(&user).map(serde_json::to_value),
      EntityType::Notes => state.notes.get(&user).map(serde_json::to_value),
      EntityType::GroupVotes => state.groups.get(key).map(|members| {
        let votes = state
          .votes
          .values()
          .filter(|v| members.contains(&v.user_id))
          .cloned()
          .collect();
        serde_json::to_value(GroupVotes {
          group_id: key.to_string(),
          votes,
          extra: Default::default(),
        })
      }),
      EntityType::Artists | EntityType::Profiles => state
        .entities
        .get(&(entity_type, key.to_string()))
        .cloned()
        .map(Ok),
    };

    (found, state.read_delay)
  }

  fn lock(&self) -> MutexGuard<'_, MemoryState> {
    self.state.lock().unwrap_or_else(|e| e.into_inner())
  }

  /// Common preamble for every call: latency, reachability, injected failures.
  async fn enter(&self, target_id: Option<&str>) -> Result<(), RemoteError> {
    let latency = self.lock().latency;
    if let Some(latency) = latency {
      let _call = InFlight::start(&self.state);
      tokio::time::sleep(latency).await;
    }

    let mut state = self.lock();
    if state.unreachable {
      return Err(RemoteError::Network("backend unreachable".into()));
    }
    if let Some(err) = state.failures.pop_front() {
      return Err(err);
    }
    if let Some(target) = target_id {
      state.write_calls += 1;
      if let Some(err) = state.rejected_targets.get(target) {
        return Err(err.clone());
      }
    }
    Ok(())
  }
}

#[async_trait]
impl Reachability for MemoryBackend {
  async fn ping(&self) -> Result<(), RemoteError> {
    self.enter(None).await
  }
}

#[async_trait]
impl RemoteBackend for MemoryBackend {
  async fn fetch_entity(&self, entity_type: EntityType, key: &str) -> Result<Value, RemoteError> {
    self.enter(None).await?;
    let (found, read_delay) = self.snapshot(entity_type, key);
    if let Some(delay) = read_delay {
      tokio::time::sleep(delay).await;
    }

    match found {
      Some(value) => value.map_err(|e| RemoteError::Validation(e.to_string())),
      None => Err(RemoteError::NotFound(format!("{}/{}", entity_type, key))),
    }
  }

  async fn upsert_vote(
    &self,
    target_id: &str,
    user_id: &str,
    vote_type: i32,
    idempotency_key: &str,
  ) -> Result<VoteRecord, RemoteError> {
    self.enter(Some(target_id)).await?;
    let mut state = self.lock();
    state.idempotency_keys.insert(idempotency_key.to_string());

    let record = VoteRecord {
      target_id: target_id.to_string(),
      user_id: user_id.to_string(),
      vote_type,
      timestamp: chrono::Utc::now(),
      extra: Default::default(),
    };
    state
      .votes
      .insert((target_id.to_string(), user_id.to_string()), record.clone());
    Ok(record)
  }

  async fn delete_vote(&self, target_id: &str, user_id: &str) -> Result<(), RemoteError> {
    self.enter(Some(target_id)).await?;
    self
      .lock()
      .votes
      .remove(&(target_id.to_string(), user_id.to_string()));
    Ok(())
  }

  async fn save_note(&self, target_id: &str, user_id: &str, text: &str) -> Result<Note, RemoteError> {
    self.enter(Some(target_id)).await?;
    let note = Note::new(target_id, user_id, text);
    self
      .lock()
      .notes
      .insert((target_id.to_string(), user_id.to_string()), note.clone());
    Ok(note)
  }

  async fn delete_note(&self, target_id: &str, user_id: &str) -> Result<(), RemoteError> {
    self.enter(Some(target_id)).await?;
    self
      .lock()
      .notes
      .remove(&(target_id.to_string(), user_id.to_string()));
    Ok(())
  }
}
