//! Local store trait and SQLite implementation.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Transaction};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use super::traits::{CacheSource, CachedEntity, EntityType};
use crate::error::{Result, SyncError};
use crate::queue::{NewOperation, PendingOperation};

/// Default upper bound on queued operations.
pub const DEFAULT_MAX_PENDING: usize = 1000;

/// Change applied to the cache alongside an enqueue.
#[derive(Debug, Clone, PartialEq)]
pub enum LocalUpdate {
  Put(Value),
  Delete,
}

/// Trait for durable local storage backends.
///
/// Owns both cached entities and the pending operation queue so that an
/// optimistic update and its queued intent can be committed together.
pub trait LocalStore: Send + Sync {
  /// Get a cached entity.
  fn get(&self, entity_type: EntityType, key: &str) -> Result<Option<CachedEntity>>;

  /// Store (overwrite) a cached entity.
  fn put(&self, entity_type: EntityType, key: &str, payload: &Value, source: CacheSource)
    -> Result<()>;

  /// Remove a cached entity. Missing entries are not an error.
  fn delete(&self, entity_type: EntityType, key: &str) -> Result<()>;

  /// All queued operations, ascending by sequence number.
  fn list_pending(&self) -> Result<Vec<PendingOperation>>;

  /// Number of queued operations.
  fn pending_count(&self) -> Result<usize>;

  /// Whether any queued operation targets this record.
  fn has_pending(&self, entity_type: EntityType, key: &str) -> Result<bool>;

  /// Append an operation and compact its target in the same commit.
  fn enqueue(&self, op: &NewOperation) -> Result<PendingOperation>;

  /// Apply an optimistic cache change and enqueue in one commit.
  fn apply_offline_write(
    &self,
    update: &LocalUpdate,
    op: &NewOperation,
  ) -> Result<PendingOperation>;

  /// Collapse queued operations on one (user, target) pair into the latest
  /// value at the earliest position. Returns how many rows were removed.
  fn compact(&self, user_id: &str, entity_type: EntityType, target_key: &str) -> Result<usize>;

  /// Remove one queued operation. Returns false if it was already gone.
  fn dequeue(&self, sequence: i64) -> Result<bool>;
}

/// SQLite-based local store.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
  max_pending: usize,
}

impl SqliteStorage {
  /// Open the store at the default location.
  pub fn open_default() -> Result<Self> {
    let path = Self::default_path()?;
    Self::open(&path)
  }

  /// Open (or create) the store at a specific path.
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent).map_err(|e| {
        SyncError::StorageUnavailable(format!("failed to create cache directory: {}", e))
      })?;
    }

    let conn = Connection::open(path).map_err(|e| {
      SyncError::StorageUnavailable(format!(
        "failed to open cache database at {}: {}",
        path.display(),
        e
      ))
    })?;

    Self::from_connection(conn)
  }

  /// Open a throwaway in-memory store.
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| SyncError::StorageUnavailable(format!("failed to open in-memory cache: {}", e)))?;
    Self::from_connection(conn)
  }

  /// Cap the number of queued operations.
  pub fn with_max_pending(mut self, max_pending: usize) -> Self {
    self.max_pending = max_pending;
    self
  }

  fn from_connection(conn: Connection) -> Result<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
      max_pending: DEFAULT_MAX_PENDING,
    };
    storage.run_migrations()?;
    Ok(storage)
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| SyncError::StorageUnavailable("could not determine data directory".into()))?;

    Ok(data_dir.join("lineup").join("cache.db"))
  }

  fn run_migrations(&self) -> Result<()> {
    let conn = self.lock()?;

    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| SyncError::StorageUnavailable(format!("failed to run cache migrations: {}", e)))?;

    Ok(())
  }

  fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| SyncError::StorageUnavailable(format!("lock poisoned: {}", e)))
  }

  /// Insert, compact and enforce the queue bound inside an open transaction.
  fn enqueue_in(&self, tx: &Transaction<'_>, op: &NewOperation) -> Result<PendingOperation> {
    let payload = serde_json::to_vec(&op.payload)?;

    tx.execute(
      "INSERT INTO pending_ops (kind, entity_type, target_key, user_id, payload, created_at)
       VALUES (?, ?, ?, ?, ?, ?)",
      params![
        op.kind.as_str(),
        op.entity_type.as_str(),
        op.target_key,
        op.user_id,
        payload,
        op.created_at.to_rfc3339()
      ],
    )
    .map_err(queue_write_error)?;
    let mut sequence = tx.last_insert_rowid();

    if let Some(earliest) = compact_in(tx, &op.user_id, op.entity_type, &op.target_key)? {
      sequence = earliest;
    }

    let count: i64 = tx
      .query_row("SELECT COUNT(*) FROM pending_ops", [], |row| row.get(0))
      .map_err(queue_write_error)?;
    if count as usize > self.max_pending {
      return Err(SyncError::QueueFull(format!(
        "{} operations queued, limit is {}",
        count - 1,
        self.max_pending
      )));
    }

    Ok(PendingOperation {
      sequence,
      kind: op.kind,
      entity_type: op.entity_type,
      target_key: op.target_key.clone(),
      user_id: op.user_id.clone(),
      payload: op.payload.clone(),
      created_at: op.created_at,
    })
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
-- Cached records (serialized JSON, opaque to the store)
CREATE TABLE IF NOT EXISTS entity_cache (
    entity_type TEXT NOT NULL,
    entity_key TEXT NOT NULL,
    data BLOB NOT NULL,
    source TEXT NOT NULL,
    synced_at TEXT NOT NULL,
    PRIMARY KEY (entity_type, entity_key)
);

-- Deferred writes; AUTOINCREMENT keeps sequence numbers monotonic across restarts
CREATE TABLE IF NOT EXISTS pending_ops (
    sequence INTEGER PRIMARY KEY AUTOINCREMENT,
    kind TEXT NOT NULL,
    entity_type TEXT NOT NULL,
    target_key TEXT NOT NULL,
    user_id TEXT NOT NULL,
    payload BLOB NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_pending_ops_target
    ON pending_ops(entity_type, target_key, user_id, sequence);
"#;

impl LocalStore for SqliteStorage {
  fn get(&self, entity_type: EntityType, key: &str) -> Result<Option<CachedEntity>> {
    let conn = self.lock()?;

    let row: Option<(Vec<u8>, String, String)> = conn
      .query_row(
        "SELECT data, source, synced_at FROM entity_cache
         WHERE entity_type = ? AND entity_key = ?",
        params![entity_type.as_str(), key],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
      )
      .optional()
      .map_err(|e| SyncError::StorageUnavailable(format!("failed to read cache: {}", e)))?;

    match row {
      Some((data, source, synced_at)) => {
        let payload: Value = serde_json::from_slice(&data)?;
        let source = source.parse().map_err(SyncError::StorageUnavailable)?;
        Ok(Some(CachedEntity {
          entity_type,
          key: key.to_string(),
          payload,
          synced_at: parse_datetime(&synced_at)?,
          source,
        }))
      }
      None => Ok(None),
    }
  }

  fn put(
    &self,
    entity_type: EntityType,
    key: &str,
    payload: &Value,
    source: CacheSource,
  ) -> Result<()> {
    let conn = self.lock()?;
    put_in(&conn, entity_type, key, payload, source)
  }

  fn delete(&self, entity_type: EntityType, key: &str) -> Result<()> {
    let conn = self.lock()?;
    delete_in(&conn, entity_type, key)
  }

  fn list_pending(&self) -> Result<Vec<PendingOperation>> {
    let conn = self.lock()?;

    let mut stmt = conn
      .prepare(
        "SELECT sequence, kind, entity_type, target_key, user_id, payload, created_at
         FROM pending_ops ORDER BY sequence",
      )
      .map_err(|e| SyncError::StorageUnavailable(format!("failed to prepare queue query: {}", e)))?;

    let rows: Vec<RawOperation> = stmt
      .query_map([], |row| {
        Ok(RawOperation {
          sequence: row.get(0)?,
          kind: row.get(1)?,
          entity_type: row.get(2)?,
          target_key: row.get(3)?,
          user_id: row.get(4)?,
          payload: row.get(5)?,
          created_at: row.get(6)?,
        })
      })
      .map_err(|e| SyncError::StorageUnavailable(format!("failed to read queue: {}", e)))?
      .collect::<rusqlite::Result<_>>()
      .map_err(|e| SyncError::StorageUnavailable(format!("failed to read queue: {}", e)))?;

    let mut ops = Vec::with_capacity(rows.len());
    for raw in rows {
      let sequence = raw.sequence;
      match raw.into_operation() {
        Ok(op) => ops.push(op),
        Err(e) => tracing::warn!(sequence, "skipping unreadable queued operation: {}", e),
      }
    }
    Ok(ops)
  }

  fn pending_count(&self) -> Result<usize> {
    let conn = self.lock()?;
    let count: i64 = conn
      .query_row("SELECT COUNT(*) FROM pending_ops", [], |row| row.get(0))
      .map_err(|e| SyncError::StorageUnavailable(format!("failed to count queue: {}", e)))?;
    Ok(count as usize)
  }

  fn has_pending(&self, entity_type: EntityType, key: &str) -> Result<bool> {
    let conn = self.lock()?;
    conn
      .query_row(
        "SELECT EXISTS(SELECT 1 FROM pending_ops WHERE entity_type = ? AND target_key = ?)",
        params![entity_type.as_str(), key],
        |row| row.get(0),
      )
      .map_err(|e| SyncError::StorageUnavailable(format!("failed to query queue: {}", e)))
  }

  fn enqueue(&self, op: &NewOperation) -> Result<PendingOperation> {
    let mut conn = self.lock()?;
    let tx = conn.transaction().map_err(queue_write_error)?;
    let queued = self.enqueue_in(&tx, op)?;
    tx.commit().map_err(queue_write_error)?;
    Ok(queued)
  }

  fn apply_offline_write(
    &self,
    update: &LocalUpdate,
    op: &NewOperation,
  ) -> Result<PendingOperation> {
    let mut conn = self.lock()?;
    let tx = conn.transaction().map_err(queue_write_error)?;

    match update {
      LocalUpdate::Put(payload) => put_in(&tx, op.entity_type, &op.target_key, payload, CacheSource::Cache)?,
      LocalUpdate::Delete => delete_in(&tx, op.entity_type, &op.target_key)?,
    }
    let queued = self.enqueue_in(&tx, op)?;

    tx.commit().map_err(queue_write_error)?;
    Ok(queued)
  }

  fn compact(&self, user_id: &str, entity_type: EntityType, target_key: &str) -> Result<usize> {
    let mut conn = self.lock()?;
    let tx = conn.transaction().map_err(queue_write_error)?;

    let before: i64 = tx
      .query_row("SELECT COUNT(*) FROM pending_ops", [], |row| row.get(0))
      .map_err(queue_write_error)?;
    compact_in(&tx, user_id, entity_type, target_key)?;
    let after: i64 = tx
      .query_row("SELECT COUNT(*) FROM pending_ops", [], |row| row.get(0))
      .map_err(queue_write_error)?;

    tx.commit().map_err(queue_write_error)?;
    Ok((before - after) as usize)
  }

  fn dequeue(&self, sequence: i64) -> Result<bool> {
    let conn = self.lock()?;
    let removed = conn
      .execute("DELETE FROM pending_ops WHERE sequence = ?", params![sequence])
      .map_err(|e| SyncError::StorageWriteFailed(format!("failed to dequeue operation: {}", e)))?;
    Ok(removed > 0)
  }
}

fn put_in(
  conn: &Connection,
  entity_type: EntityType,
  key: &str,
  payload: &Value,
  source: CacheSource,
) -> Result<()> {
  let data = serde_json::to_vec(payload)?;

  conn
    .execute(
      "INSERT OR REPLACE INTO entity_cache (entity_type, entity_key, data, source, synced_at)
       VALUES (?, ?, ?, ?, ?)",
      params![
        entity_type.as_str(),
        key,
        data,
        source.as_str(),
        Utc::now().to_rfc3339()
      ],
    )
    .map_err(|e| SyncError::StorageWriteFailed(format!("failed to store entity: {}", e)))?;

  Ok(())
}

fn delete_in(conn: &Connection, entity_type: EntityType, key: &str) -> Result<()> {
  conn
    .execute(
      "DELETE FROM entity_cache WHERE entity_type = ? AND entity_key = ?",
      params![entity_type.as_str(), key],
    )
    .map_err(|e| SyncError::StorageWriteFailed(format!("failed to delete entity: {}", e)))?;
  Ok(())
}

/// Collapse a target's queued last-value operations. Returns the surviving
/// sequence number when anything was collapsed.
fn compact_in(
  conn: &Connection,
  user_id: &str,
  entity_type: EntityType,
  target_key: &str,
) -> Result<Option<i64>> {
  let rows: Vec<(i64, String, Vec<u8>, String)> = {
    let mut stmt = conn
      .prepare(
        "SELECT sequence, kind, payload, created_at FROM pending_ops
         WHERE user_id = ? AND entity_type = ? AND target_key = ?
         ORDER BY sequence",
      )
      .map_err(queue_write_error)?;

    let rows = stmt
      .query_map(params![user_id, entity_type.as_str(), target_key], |row| {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
      })
      .map_err(queue_write_error)?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(queue_write_error)?;
    rows
  };

  if rows.len() < 2 {
    return Ok(None);
  }

  let (earliest, _, _, _) = &rows[0];
  let (latest, kind, payload, created_at) = &rows[rows.len() - 1];

  conn
    .execute(
      "UPDATE pending_ops SET kind = ?, payload = ?, created_at = ? WHERE sequence = ?",
      params![kind, payload, created_at, earliest],
    )
    .map_err(queue_write_error)?;
  conn
    .execute(
      "DELETE FROM pending_ops
       WHERE user_id = ? AND entity_type = ? AND target_key = ? AND sequence > ? AND sequence <= ?",
      params![user_id, entity_type.as_str(), target_key, earliest, latest],
    )
    .map_err(queue_write_error)?;

  Ok(Some(*earliest))
}

/// Map a queue write failure, treating a full disk as a full queue.
fn queue_write_error(e: rusqlite::Error) -> SyncError {
  match e.sqlite_error_code() {
    Some(ErrorCode::DiskFull) => SyncError::QueueFull(format!("storage is full: {}", e)),
    _ => SyncError::StorageWriteFailed(format!("failed to write queue: {}", e)),
  }
}

/// A queue row before its text columns are parsed.
struct RawOperation {
  sequence: i64,
  kind: String,
  entity_type: String,
  target_key: String,
  user_id: String,
  payload: Vec<u8>,
  created_at: String,
}

impl RawOperation {
  fn into_operation(self) -> Result<PendingOperation> {
    Ok(PendingOperation {
      sequence: self.sequence,
      kind: self.kind.parse().map_err(SyncError::StorageUnavailable)?,
      entity_type: self.entity_type.parse().map_err(SyncError::StorageUnavailable)?,
      target_key: self.target_key,
      user_id: self.user_id,
      payload: serde_json::from_slice(&self.payload)?,
      created_at: parse_datetime(&self.created_at)?,
    })
  }
}

/// Parse an RFC 3339 timestamp written by this store.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| SyncError::StorageUnavailable(format!("failed to parse datetime '{}': {}", s, e)))
}
