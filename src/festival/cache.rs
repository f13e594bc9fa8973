//! Caching implementations for festival types.

use crate::cache::{Cacheable, EntityType};

use super::types::{Artist, GroupVotes, Note, Profile, VoteRecord};

impl Cacheable for Artist {
  fn cache_key(&self) -> String {
    self.id.clone()
  }

  fn entity_type() -> EntityType {
    EntityType::Artists
  }
}

impl Cacheable for VoteRecord {
  /// The acting user is implied; votes are keyed by the set they target.
  fn cache_key(&self) -> String {
    self.target_id.clone()
  }

  fn entity_type() -> EntityType {
    EntityType::Votes
  }
}

impl Cacheable for Profile {
  fn cache_key(&self) -> String {
    self.id.clone()
  }

  fn entity_type() -> EntityType {
    EntityType::Profiles
  }
}

impl Cacheable for GroupVotes {
  fn cache_key(&self) -> String {
    self.group_id.clone()
  }

  fn entity_type() -> EntityType {
    EntityType::GroupVotes
  }
}

impl Cacheable for Note {
  fn cache_key(&self) -> String {
    self.artist_id.clone()
  }

  fn entity_type() -> EntityType {
    EntityType::Notes
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::festival::types::VoteType;

  #[test]
  fn test_votes_and_notes_key_by_artist() {
    let vote = VoteRecord::new("a7", "u1", VoteType::MustGo);
    assert_eq!(vote.cache_key(), "a7");
    assert_eq!(VoteRecord::entity_type(), EntityType::Votes);

    let note = Note::new("a7", "u1", "bring earplugs");
    assert_eq!(note.cache_key(), "a7");
    assert_eq!(Note::entity_type(), EntityType::Notes);
  }
}
