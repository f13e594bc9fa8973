//! Reconciliation of queued writes with the remote backend.

mod engine;
mod locks;

pub use engine::{
  AutoSync, LostWrite, Reconciler, SyncOptions, SyncReport, SyncState, DEFAULT_CONCURRENCY,
  DEFAULT_REPLAY_TIMEOUT,
};
pub use locks::{KeyGuard, KeyLocks};
