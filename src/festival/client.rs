//! Festival client that routes every read and write through the cache layer.

use std::time::Duration;

use serde_json::Value;

use crate::cache::{CacheLayer, CacheResult, Cacheable, LocalStore, SqliteStorage, WriteOutcome};
use crate::config::Config;
use crate::error::{Result, SyncError};
use crate::network::NetworkMonitor;
use crate::queue::OperationKind;
use crate::remote::{HttpBackend, RemoteBackend};
use crate::status::StatusBoard;

use super::types::{Artist, GroupVotes, Note, Profile, VoteRecord, VoteType};

/// Festival API with offline support.
///
/// Reads come back tagged with where they were served from; writes are
/// either confirmed by the backend or queued for reconciliation.
pub struct FestivalClient<S: LocalStore = SqliteStorage, B: RemoteBackend = HttpBackend> {
  cache: CacheLayer<S, B>,
}

impl FestivalClient {
  /// Open the local store, build the HTTP backend and probe it once.
  pub async fn connect(config: &Config) -> color_eyre::Result<Self> {
    let storage = match &config.cache.path {
      Some(path) => SqliteStorage::open(path)?,
      None => SqliteStorage::open_default()?,
    }
    .with_max_pending(config.sync.max_pending);

    let backend = HttpBackend::new(config)?;
    let monitor = NetworkMonitor::new(false, StatusBoard::new(false))
      .with_probe_timeout(Duration::from_secs(config.sync.probe_timeout_secs));

    let cache = CacheLayer::new(
      storage,
      backend,
      monitor,
      config.backend.user_id.clone(),
      config.sync.options(),
    );
    let online = cache.probe().await;
    tracing::info!(online, user = %config.backend.user_id, "festival client ready");

    Ok(Self { cache })
  }
}

impl<S: LocalStore, B: RemoteBackend> FestivalClient<S, B> {
  pub fn new(cache: CacheLayer<S, B>) -> Self {
    Self { cache }
  }

  pub async fn artist(&self, id: &str) -> Result<CacheResult<Artist>> {
    self.cache.read_typed(id).await
  }

  pub async fn profile(&self, id: &str) -> Result<CacheResult<Profile>> {
    self.cache.read_typed(id).await
  }

  /// The acting user's vote on a set, if any.
  pub async fn my_vote(&self, artist_id: &str) -> Result<Option<CacheResult<VoteRecord>>> {
    optional(self.cache.read_typed(artist_id).await)
  }

  pub async fn group_votes(&self, group_id: &str) -> Result<CacheResult<GroupVotes>> {
    self.cache.read_typed(group_id).await
  }

  /// The acting user's note on a set, if any.
  pub async fn note(&self, artist_id: &str) -> Result<Option<CacheResult<Note>>> {
    optional(self.cache.read_typed(artist_id).await)
  }

  pub async fn cast_vote(&self, artist_id: &str, vote: VoteType) -> Result<WriteOutcome> {
    let record = VoteRecord::new(artist_id, self.cache.user_id(), vote);
    self.put(&record, OperationKind::VoteUpsert).await
  }

  pub async fn remove_vote(&self, artist_id: &str) -> Result<WriteOutcome> {
    self
      .cache
      .write(VoteRecord::entity_type(), artist_id, Value::Null, OperationKind::VoteDelete)
      .await
  }

  pub async fn save_note(&self, artist_id: &str, text: &str) -> Result<WriteOutcome> {
    let note = Note::new(artist_id, self.cache.user_id(), text);
    self.put(&note, OperationKind::NoteSave).await
  }

  pub async fn delete_note(&self, artist_id: &str) -> Result<WriteOutcome> {
    self
      .cache
      .write(Note::entity_type(), artist_id, Value::Null, OperationKind::NoteDelete)
      .await
  }

  pub fn cache(&self) -> &CacheLayer<S, B> {
    &self.cache
  }

  async fn put<T: Cacheable>(&self, record: &T, kind: OperationKind) -> Result<WriteOutcome> {
    let payload = serde_json::to_value(record)?;
    self
      .cache
      .write(T::entity_type(), &record.cache_key(), payload, kind)
      .await
  }
}

impl<S: LocalStore, B: RemoteBackend> Clone for FestivalClient<S, B> {
  fn clone(&self) -> Self {
    Self {
      cache: self.cache.clone(),
    }
  }
}

/// A record the user never created is not an error.
fn optional<T>(result: Result<CacheResult<T>>) -> Result<Option<CacheResult<T>>> {
  match result {
    Ok(found) => Ok(Some(found)),
    Err(SyncError::NoDataAvailable { .. }) => Ok(None),
    Err(e) => Err(e),
  }
}
