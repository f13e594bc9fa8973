//! Core traits and types for the caching system.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Namespace for cached records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EntityType {
  Artists,
  Votes,
  Profiles,
  GroupVotes,
  Notes,
}

impl EntityType {
  pub const ALL: [EntityType; 5] = [
    EntityType::Artists,
    EntityType::Votes,
    EntityType::Profiles,
    EntityType::GroupVotes,
    EntityType::Notes,
  ];

  pub fn as_str(&self) -> &'static str {
    match self {
      EntityType::Artists => "artists",
      EntityType::Votes => "votes",
      EntityType::Profiles => "profiles",
      EntityType::GroupVotes => "group-votes",
      EntityType::Notes => "notes",
    }
  }
}

impl fmt::Display for EntityType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for EntityType {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    EntityType::ALL
      .into_iter()
      .find(|t| t.as_str() == s)
      .ok_or_else(|| format!("unknown entity type '{}'", s))
  }
}

/// Trait for typed payloads that live in the cache.
///
/// The store itself only sees JSON; implementors give the facade a way to
/// coerce payloads back into their domain shape.
pub trait Cacheable: Clone + Send + Sync + Serialize + DeserializeOwned {
  /// Key of this record within its namespace (e.g., artist id)
  fn cache_key(&self) -> String;

  /// Namespace the record is stored under
  fn entity_type() -> EntityType;
}

/// Indicates where data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheSource {
  /// Confirmed by the remote backend
  Network,
  /// Served from (or written optimistically to) the local store
  Cache,
}

impl CacheSource {
  pub fn as_str(&self) -> &'static str {
    match self {
      CacheSource::Network => "network",
      CacheSource::Cache => "cache",
    }
  }
}

impl FromStr for CacheSource {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "network" => Ok(CacheSource::Network),
      "cache" => Ok(CacheSource::Cache),
      other => Err(format!("unknown cache source '{}'", other)),
    }
  }
}

/// A record held by the local store.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedEntity {
  pub entity_type: EntityType,
  pub key: String,
  /// Opaque JSON; unknown fields from other schema versions are kept as-is
  pub payload: Value,
  /// When the record was last written
  pub synced_at: DateTime<Utc>,
  /// Whether the record was confirmed remotely or written optimistically
  pub source: CacheSource,
}

/// Result from a cache read, including data and metadata about the source.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  /// Create a new cache result from fresh network data.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  /// Create a new cache result from locally stored data.
  pub fn from_cache(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Cache,
      cached_at: Some(cached_at),
    }
  }

  /// Convert the payload while keeping source metadata.
  pub fn try_map<U, E>(self, f: impl FnOnce(T) -> Result<U, E>) -> Result<CacheResult<U>, E> {
    Ok(CacheResult {
      data: f(self.data)?,
      source: self.source,
      cached_at: self.cached_at,
    })
  }

  pub fn is_network(&self) -> bool {
    self.source == CacheSource::Network
  }
}
