//! Festival domain: artists, votes, profiles, group votes and notes.

mod cache;
mod client;
pub mod types;

pub use client::FestivalClient;
pub use types::{Artist, GroupVotes, Note, Profile, VoteRecord, VoteType};
