//! Serde types matching the backend's REST rows.
//!
//! Rows use snake_case column names; these types are kept separate from the
//! domain types so the cache always holds the domain's JSON shape.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::festival::types::{Artist, GroupVotes, Note, Profile, VoteRecord};

// ============================================================================
// Rows
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ApiArtistRow {
  pub id: Value,
  pub name: String,
  pub genre: Option<String>,
  pub stage: Option<String>,
  pub time_start: Option<DateTime<Utc>>,
  pub time_end: Option<DateTime<Utc>>,
  #[serde(flatten)]
  pub extra: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
pub struct ApiProfileRow {
  pub id: String,
  #[serde(default)]
  pub username: Option<String>,
  pub avatar_url: Option<String>,
  #[serde(flatten)]
  pub extra: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
pub struct ApiVoteRow {
  pub artist_id: Value,
  pub user_id: String,
  pub vote_type: i32,
  #[serde(alias = "updated_at")]
  pub created_at: DateTime<Utc>,
  #[serde(flatten)]
  pub extra: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
pub struct ApiNoteRow {
  pub artist_id: Value,
  pub user_id: String,
  pub note_content: String,
  pub updated_at: DateTime<Utc>,
  #[serde(flatten)]
  pub extra: Map<String, Value>,
}

// ============================================================================
// Request bodies
// ============================================================================

#[derive(Debug, Serialize)]
pub struct ApiVoteUpsert<'a> {
  pub artist_id: &'a str,
  pub user_id: &'a str,
  pub vote_type: i32,
}

#[derive(Debug, Serialize)]
pub struct ApiNoteUpsert<'a> {
  pub artist_id: &'a str,
  pub user_id: &'a str,
  pub note_content: &'a str,
}

// ============================================================================
// Conversions
// ============================================================================

/// Ids come back as numbers or strings depending on the table.
fn id_string(value: &Value) -> String {
  match value {
    Value::String(s) => s.clone(),
    other => other.to_string(),
  }
}

impl From<ApiArtistRow> for Artist {
  fn from(row: ApiArtistRow) -> Self {
    Artist {
      id: id_string(&row.id),
      name: row.name,
      genre: row.genre,
      stage: row.stage,
      start_time: row.time_start,
      end_time: row.time_end,
      extra: row.extra,
    }
  }
}

impl From<ApiProfileRow> for Profile {
  fn from(row: ApiProfileRow) -> Self {
    Profile {
      username: row.username.unwrap_or_else(|| row.id.clone()),
      id: row.id,
      avatar_url: row.avatar_url,
      extra: row.extra,
    }
  }
}

impl From<ApiVoteRow> for VoteRecord {
  fn from(row: ApiVoteRow) -> Self {
    VoteRecord {
      target_id: id_string(&row.artist_id),
      user_id: row.user_id,
      vote_type: row.vote_type,
      timestamp: row.created_at,
      extra: row.extra,
    }
  }
}

impl From<ApiNoteRow> for Note {
  fn from(row: ApiNoteRow) -> Self {
    Note {
      artist_id: id_string(&row.artist_id),
      user_id: row.user_id,
      text: row.note_content,
      updated_at: row.updated_at,
      extra: row.extra,
    }
  }
}

/// Build the group view from the vote rows of its members.
pub fn group_votes(group_id: &str, rows: Vec<ApiVoteRow>) -> GroupVotes {
  GroupVotes {
    group_id: group_id.to_string(),
    votes: rows.into_iter().map(VoteRecord::from).collect(),
    extra: Map::new(),
  }
}
