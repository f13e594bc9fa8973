//! Remote backend collaborator.
//!
//! The engine only needs a handful of calls from the hosted backend; they are
//! expressed by [`RemoteBackend`] so tests can substitute [`MemoryBackend`].

pub mod api_types;
mod http;
mod memory;

pub use http::HttpBackend;
pub use memory::MemoryBackend;

use async_trait::async_trait;
use serde_json::Value;

use crate::cache::EntityType;
use crate::error::RemoteError;
use crate::festival::types::{Note, VoteRecord};
use crate::network::Reachability;
use crate::queue::OperationKind;

/// Calls the engine makes against the hosted backend.
#[async_trait]
pub trait RemoteBackend: Reachability {
  /// Fetch one record in its domain JSON shape.
  async fn fetch_entity(&self, entity_type: EntityType, key: &str) -> Result<Value, RemoteError>;

  /// Insert or overwrite the vote for (target, user).
  async fn upsert_vote(
    &self,
    target_id: &str,
    user_id: &str,
    vote_type: i32,
    idempotency_key: &str,
  ) -> Result<VoteRecord, RemoteError>;

  /// Remove the vote for (target, user). Removing a missing vote succeeds.
  async fn delete_vote(&self, target_id: &str, user_id: &str) -> Result<(), RemoteError>;

  /// Insert or overwrite the note for (target, user).
  async fn save_note(&self, target_id: &str, user_id: &str, text: &str) -> Result<Note, RemoteError>;

  /// Remove the note for (target, user). Removing a missing note succeeds.
  async fn delete_note(&self, target_id: &str, user_id: &str) -> Result<(), RemoteError>;
}

/// Canonical outcome of a write accepted by the backend.
#[derive(Debug, Clone, PartialEq)]
pub enum Applied {
  /// The backend's stored version of the record
  Upserted(Value),
  Deleted,
}

/// A write ready to be sent to the backend.
#[derive(Debug, Clone, Copy)]
pub struct WriteRequest<'a> {
  pub kind: OperationKind,
  pub target_key: &'a str,
  pub user_id: &'a str,
  pub payload: &'a Value,
  pub idempotency_key: &'a str,
}

/// Send one write to the backend.
///
/// Payloads that cannot be turned into a call are rejected as validation
/// failures, so they are never retried.
pub async fn apply<B>(backend: &B, req: WriteRequest<'_>) -> Result<Applied, RemoteError>
where
  B: RemoteBackend + ?Sized,
{
  match req.kind {
    OperationKind::VoteUpsert => {
      let vote_type = vote_type_of(req.payload)?;
      let record = backend
        .upsert_vote(req.target_key, req.user_id, vote_type, req.idempotency_key)
        .await?;
      Ok(Applied::Upserted(to_value(&record)?))
    }
    OperationKind::VoteDelete => {
      backend.delete_vote(req.target_key, req.user_id).await?;
      Ok(Applied::Deleted)
    }
    OperationKind::NoteSave => {
      let text = req
        .payload
        .get("text")
        .and_then(Value::as_str)
        .ok_or_else(|| RemoteError::Validation("note payload has no text".into()))?;
      let note = backend.save_note(req.target_key, req.user_id, text).await?;
      Ok(Applied::Upserted(to_value(&note)?))
    }
    OperationKind::NoteDelete => {
      backend.delete_note(req.target_key, req.user_id).await?;
      Ok(Applied::Deleted)
    }
  }
}

fn vote_type_of(payload: &Value) -> Result<i32, RemoteError> {
  payload
    .get("voteType")
    .and_then(Value::as_i64)
    .and_then(|v| i32::try_from(v).ok())
    .ok_or_else(|| RemoteError::Validation("vote payload has no voteType".into()))
}

fn to_value<T: serde::Serialize>(value: &T) -> Result<Value, RemoteError> {
  serde_json::to_value(value).map_err(|e| RemoteError::Validation(e.to_string()))
}
