use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// How strongly a user wants to see a set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum VoteType {
  MustGo,
  Interested,
  WontGo,
}

impl VoteType {
  pub fn as_i32(&self) -> i32 {
    match self {
      VoteType::MustGo => 2,
      VoteType::Interested => 1,
      VoteType::WontGo => -1,
    }
  }

  pub fn from_i32(value: i32) -> Option<Self> {
    match value {
      2 => Some(VoteType::MustGo),
      1 => Some(VoteType::Interested),
      -1 => Some(VoteType::WontGo),
      _ => None,
    }
  }

  pub fn label(&self) -> &'static str {
    match self {
      VoteType::MustGo => "must go",
      VoteType::Interested => "interested",
      VoteType::WontGo => "won't go",
    }
  }
}

/// An artist and their set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Artist {
  pub id: String,
  pub name: String,
  #[serde(default)]
  pub genre: Option<String>,
  #[serde(default)]
  pub stage: Option<String>,
  #[serde(default)]
  pub start_time: Option<DateTime<Utc>>,
  #[serde(default)]
  pub end_time: Option<DateTime<Utc>>,
  /// Fields this client version does not know about
  #[serde(flatten)]
  pub extra: Map<String, Value>,
}

/// One user's vote on one set; unique per (target, user)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoteRecord {
  pub target_id: String,
  pub user_id: String,
  pub vote_type: i32,
  pub timestamp: DateTime<Utc>,
  #[serde(flatten)]
  pub extra: Map<String, Value>,
}

impl VoteRecord {
  pub fn new(target_id: impl Into<String>, user_id: impl Into<String>, vote_type: VoteType) -> Self {
    Self {
      target_id: target_id.into(),
      user_id: user_id.into(),
      vote_type: vote_type.as_i32(),
      timestamp: Utc::now(),
      extra: Map::new(),
    }
  }

  pub fn kind(&self) -> Option<VoteType> {
    VoteType::from_i32(self.vote_type)
  }
}

/// User profile
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
  pub id: String,
  pub username: String,
  #[serde(default)]
  pub avatar_url: Option<String>,
  #[serde(flatten)]
  pub extra: Map<String, Value>,
}

/// Votes cast by the members of a group
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupVotes {
  pub group_id: String,
  #[serde(default)]
  pub votes: Vec<VoteRecord>,
  #[serde(flatten)]
  pub extra: Map<String, Value>,
}

impl GroupVotes {
  /// Count of each vote type for one set.
  pub fn tally(&self, artist_id: &str) -> BTreeMap<i32, usize> {
    let mut counts = BTreeMap::new();
    for vote in self.votes.iter().filter(|v| v.target_id == artist_id) {
      *counts.entry(vote.vote_type).or_insert(0) += 1;
    }
    counts
  }
}

/// Private note a user keeps on a set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Note {
  pub artist_id: String,
  pub user_id: String,
  pub text: String,
  pub updated_at: DateTime<Utc>,
  #[serde(flatten)]
  pub extra: Map<String, Value>,
}

impl Note {
  pub fn new(artist_id: impl Into<String>, user_id: impl Into<String>, text: impl Into<String>) -> Self {
    Self {
      artist_id: artist_id.into(),
      user_id: user_id.into(),
      text: text.into(),
      updated_at: Utc::now(),
      extra: Map::new(),
    }
  }
}
