//! Connectivity and sync status feed for the UI layer.

use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;

/// Snapshot of what the status indicator shows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ConnectivityState {
  pub online: bool,
  pub queue_size: usize,
  pub syncing: bool,
}

/// Shared publisher for [`ConnectivityState`].
///
/// Subscribers are only woken when a field actually changes.
#[derive(Clone)]
pub struct StatusBoard {
  tx: Arc<watch::Sender<ConnectivityState>>,
}

impl StatusBoard {
  pub fn new(online: bool) -> Self {
    let (tx, _rx) = watch::channel(ConnectivityState {
      online,
      ..Default::default()
    });
    Self { tx: Arc::new(tx) }
  }

  pub fn current(&self) -> ConnectivityState {
    *self.tx.borrow()
  }

  pub fn subscribe(&self) -> watch::Receiver<ConnectivityState> {
    self.tx.subscribe()
  }

  pub fn set_online(&self, online: bool) {
    self.update(|s| s.online = online);
  }

  pub fn set_queue_size(&self, queue_size: usize) {
    self.update(|s| s.queue_size = queue_size);
  }

  pub fn set_syncing(&self, syncing: bool) {
    self.update(|s| s.syncing = syncing);
  }

  fn update(&self, f: impl FnOnce(&mut ConnectivityState)) {
    self.tx.send_if_modified(|state| {
      let before = *state;
      f(state);
      *state != before
    });
  }
}
