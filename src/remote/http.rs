use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::time::Duration;
use url::Url;

use super::api_types::{
  group_votes, ApiArtistRow, ApiNoteRow, ApiNoteUpsert, ApiProfileRow, ApiVoteRow, ApiVoteUpsert,
};
use super::RemoteBackend;
use crate::cache::EntityType;
use crate::config::Config;
use crate::error::RemoteError;
use crate::festival::types::{Artist, Note, Profile, VoteRecord};
use crate::network::Reachability;

/// REST client for the hosted backend
#[derive(Clone)]
pub struct HttpBackend {
  client: reqwest::Client,
  base: Url,
  api_key: String,
  access_token: String,
  user_id: String,
}

impl HttpBackend {
  pub fn new(config: &Config) -> Result<Self> {
    let api_key = Config::get_api_key()?;
    let access_token = Config::get_access_token().unwrap_or_else(|_| api_key.clone());

    let mut base = Url::parse(&config.backend.url)
      .map_err(|e| eyre!("Invalid backend url {}: {}", config.backend.url, e))?;
    if !base.path().ends_with('/') {
      let path = format!("{}/", base.path());
      base.set_path(&path);
    }

    let client = reqwest::Client::builder()
      .timeout(Duration::from_secs(config.sync.replay_timeout_secs))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      client,
      base,
      api_key,
      access_token,
      user_id: config.backend.user_id.clone(),
    })
  }

  fn table_url(&self, table: &str) -> Result<Url, RemoteError> {
    self
      .base
      .join(&format!("rest/v1/{}", table))
      .map_err(|e| RemoteError::Validation(format!("bad table url: {}", e)))
  }

  fn request(&self, method: Method, url: Url) -> RequestBuilder {
    self
      .client
      .request(method, url)
      .header("apikey", &self.api_key)
      .bearer_auth(&self.access_token)
  }

  async fn send(&self, request: RequestBuilder) -> Result<Response, RemoteError> {
    let response = request.send().await.map_err(classify_transport)?;
    let status = response.status();
    if status.is_success() {
      return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    Err(classify_status(status, body))
  }

  /// Select rows from a table with `column=eq.value` filters.
  async fn select<T: DeserializeOwned>(
    &self,
    table: &str,
    filters: &[(&str, &str)],
  ) -> Result<Vec<T>, RemoteError> {
    let mut url = self.table_url(table)?;
    {
      let mut query = url.query_pairs_mut();
      query.append_pair("select", "*");
      for (column, value) in filters {
        query.append_pair(column, &format!("eq.{}", value));
      }
    }

    let response = self.send(self.request(Method::GET, url)).await?;
    response
      .json()
      .await
      .map_err(|e| RemoteError::Validation(format!("unexpected response from {}: {}", table, e)))
  }

  async fn select_one<T: DeserializeOwned>(
    &self,
    table: &str,
    filters: &[(&str, &str)],
  ) -> Result<T, RemoteError> {
    self
      .select(table, filters)
      .await?
      .into_iter()
      .next()
      .ok_or_else(|| {
        let filter = filters
          .iter()
          .map(|(c, v)| format!("{}={}", c, v))
          .collect::<Vec<_>>()
          .join("&");
        RemoteError::NotFound(format!("{}?{}", table, filter))
      })
  }

  /// Upsert a row and return the stored representation.
  async fn upsert<B: serde::Serialize, T: DeserializeOwned>(
    &self,
    table: &str,
    on_conflict: &str,
    body: &B,
    idempotency_key: Option<&str>,
  ) -> Result<T, RemoteError> {
    let mut url = self.table_url(table)?;
    url.query_pairs_mut().append_pair("on_conflict", on_conflict);

    let mut request = self
      .request(Method::POST, url)
      .header("Prefer", "resolution=merge-duplicates,return=representation")
      .json(body);
    if let Some(key) = idempotency_key {
      request = request.header("Idempotency-Key", key);
    }

    let rows: Vec<T> = self
      .send(request)
      .await?
      .json()
      .await
      .map_err(|e| RemoteError::Validation(format!("unexpected response from {}: {}", table, e)))?;

    rows
      .into_iter()
      .next()
      .ok_or_else(|| RemoteError::Validation(format!("{} upsert returned no row", table)))
  }

  async fn remove(&self, table: &str, filters: &[(&str, &str)]) -> Result<(), RemoteError> {
    let mut url = self.table_url(table)?;
    {
      let mut query = url.query_pairs_mut();
      for (column, value) in filters {
        query.append_pair(column, &format!("eq.{}", value));
      }
    }

    self.send(self.request(Method::DELETE, url)).await?;
    Ok(())
  }
}

#[async_trait]
impl Reachability for HttpBackend {
  async fn ping(&self) -> Result<(), RemoteError> {
    let url = self
      .base
      .join("rest/v1/")
      .map_err(|e| RemoteError::Validation(format!("bad url: {}", e)))?;
    self.send(self.request(Method::HEAD, url)).await?;
    Ok(())
  }
}

#[async_trait]
impl RemoteBackend for HttpBackend {
  async fn fetch_entity(&self, entity_type: EntityType, key: &str) -> Result<Value, RemoteError> {
    let user = self.user_id.as_str();

    let value = match entity_type {
      EntityType::Artists => {
        let row: ApiArtistRow = self.select_one("artists", &[("id", key)]).await?;
        serde_json::to_value(Artist::from(row))
      }
      EntityType::Profiles => {
        let row: ApiProfileRow = self.select_one("profiles", &[("id", key)]).await?;
        serde_json::to_value(Profile::from(row))
      }
      EntityType::Votes => {
        let row: ApiVoteRow = self
          .select_one("votes", &[("artist_id", key), ("user_id", user)])
          .await?;
        serde_json::to_value(VoteRecord::from(row))
      }
      EntityType::GroupVotes => {
        let rows: Vec<ApiVoteRow> = self.select("group_votes", &[("group_id", key)]).await?;
        serde_json::to_value(group_votes(key, rows))
      }
      EntityType::Notes => {
        let row: ApiNoteRow = self
          .select_one("artist_notes", &[("artist_id", key), ("user_id", user)])
          .await?;
        serde_json::to_value(Note::from(row))
      }
    };

    value.map_err(|e| RemoteError::Validation(e.to_string()))
  }

  async fn upsert_vote(
    &self,
    target_id: &str,
    user_id: &str,
    vote_type: i32,
    idempotency_key: &str,
  ) -> Result<VoteRecord, RemoteError> {
    let body = ApiVoteUpsert {
      artist_id: target_id,
      user_id,
      vote_type,
    };
    let row: ApiVoteRow = self
      .upsert("votes", "artist_id,user_id", &body, Some(idempotency_key))
      .await?;
    Ok(row.into())
  }

  async fn delete_vote(&self, target_id: &str, user_id: &str) -> Result<(), RemoteError> {
    self
      .remove("votes", &[("artist_id", target_id), ("user_id", user_id)])
      .await
  }

  async fn save_note(&self, target_id: &str, user_id: &str, text: &str) -> Result<Note, RemoteError> {
    let body = ApiNoteUpsert {
      artist_id: target_id,
      user_id,
      note_content: text,
    };
    let row: ApiNoteRow = self
      .upsert("artist_notes", "artist_id,user_id", &body, None)
      .await?;
    Ok(row.into())
  }

  async fn delete_note(&self, target_id: &str, user_id: &str) -> Result<(), RemoteError> {
    self
      .remove("artist_notes", &[("artist_id", target_id), ("user_id", user_id)])
      .await
  }
}

fn classify_transport(e: reqwest::Error) -> RemoteError {
  if e.is_timeout() {
    RemoteError::Timeout
  } else if let Some(status) = e.status() {
    classify_status(status, e.to_string())
  } else {
    RemoteError::Network(e.to_string())
  }
}

/// Map an HTTP status onto the retryable/non-retryable taxonomy.
fn classify_status(status: StatusCode, body: String) -> RemoteError {
  match status {
    StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => RemoteError::Auth(body),
    StatusCode::NOT_FOUND => RemoteError::NotFound(body),
    StatusCode::CONFLICT => RemoteError::Conflict(body),
    StatusCode::TOO_MANY_REQUESTS => RemoteError::RateLimited,
    StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => RemoteError::Timeout,
    s if s.is_server_error() => RemoteError::Server {
      status: s.as_u16(),
      message: body,
    },
    _ => RemoteError::Validation(format!("{}: {}", status, body)),
  }
}
