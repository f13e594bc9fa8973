//! Offline-first cache and sync engine for a festival voting client.
//!
//! Reads are served from the network when reachable and from a durable local
//! store otherwise. Writes made offline are applied optimistically, queued,
//! and replayed in order once connectivity returns.

pub mod cache;
pub mod config;
pub mod error;
pub mod festival;
pub mod logging;
pub mod network;
pub mod queue;
pub mod remote;
pub mod status;
pub mod sync;

pub use cache::{CacheLayer, CacheResult, CacheSource, EntityType, SqliteStorage, WriteOutcome};
pub use error::{RemoteError, Result, SyncError};
pub use festival::FestivalClient;
pub use network::NetworkMonitor;
pub use status::ConnectivityState;
pub use sync::{SyncOptions, SyncReport, SyncState};
