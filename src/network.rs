//! Network status monitor.
//!
//! Single source of truth for connectivity. Environment events are fed in
//! through [`NetworkMonitor::report_signal`]; [`NetworkMonitor::probe`] checks
//! that the backend is actually reachable when the environment claims to be
//! online. The monitor is online only while the environment says so and the
//! last probe did not fail. Subscribers receive exactly one notification per
//! transition of that combined state.

use async_trait::async_trait;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::error::RemoteError;
use crate::status::StatusBoard;

/// Lightweight check that the backend answers at all.
#[async_trait]
pub trait Reachability: Send + Sync {
  async fn ping(&self) -> Result<(), RemoteError>;
}

struct MonitorInner {
  /// Last environment signal
  env_online: bool,
  /// Set by a failed probe; cleared by a successful one or a fresh
  /// environment offline to online edge
  probe_failed: bool,
  next_id: u64,
  subscribers: Vec<(u64, mpsc::UnboundedSender<bool>)>,
}

/// Tracks online/offline state and notifies subscribers on transitions.
#[derive(Clone)]
pub struct NetworkMonitor {
  inner: Arc<Mutex<MonitorInner>>,
  status: StatusBoard,
  probe_timeout: Duration,
}

impl NetworkMonitor {
  pub fn new(online: bool, status: StatusBoard) -> Self {
    status.set_online(online);
    Self {
      inner: Arc::new(Mutex::new(MonitorInner {
        env_online: online,
        probe_failed: false,
        next_id: 0,
        subscribers: Vec::new(),
      })),
      status,
      probe_timeout: Duration::from_secs(5),
    }
  }

  pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
    self.probe_timeout = timeout;
    self
  }

  pub fn is_online(&self) -> bool {
    self.lock().online()
  }

  /// Feed an environment connectivity event.
  ///
  /// Returns true if the monitor's state changed. Repeating the current
  /// signal is ignored and does not clear a failed probe.
  pub fn report_signal(&self, online: bool) -> bool {
    self.update(|inner| {
      if inner.env_online == online {
        return;
      }
      inner.env_online = online;
      if online {
        inner.probe_failed = false;
      }
    })
  }

  /// Check reachability of the backend and update state from the result.
  ///
  /// A failed probe keeps the monitor offline until a later probe succeeds or
  /// the environment goes offline and back online. A successful probe counts
  /// as evidence of connectivity.
  pub async fn probe(&self, target: &dyn Reachability) -> bool {
    let reachable = match tokio::time::timeout(self.probe_timeout, target.ping()).await {
      Ok(Ok(())) => true,
      Ok(Err(e)) => {
        tracing::debug!("reachability probe failed: {}", e);
        false
      }
      Err(_) => {
        tracing::debug!("reachability probe timed out");
        false
      }
    };
    self.update(|inner| {
      inner.probe_failed = !reachable;
      if reachable {
        inner.env_online = true;
      }
    });
    reachable
  }

  /// Apply `change` and notify subscribers if the combined state flipped.
  fn update(&self, change: impl FnOnce(&mut MonitorInner)) -> bool {
    let mut inner = self.lock();
    let before = inner.online();
    change(&mut *inner);
    let online = inner.online();
    if online == before {
      return false;
    }
    inner.subscribers.retain(|(_, tx)| tx.send(online).is_ok());
    drop(inner);

    self.status.set_online(online);
    tracing::info!(online, "connectivity changed");
    true
  }

  /// Subscribe to transitions. Dropping the handle unsubscribes.
  pub fn subscribe(&self) -> ConnectivitySubscription {
    let (tx, rx) = mpsc::unbounded_channel();
    let mut inner = self.lock();
    let id = inner.next_id;
    inner.next_id += 1;
    inner.subscribers.push((id, tx));

    ConnectivitySubscription {
      id,
      rx,
      monitor: Arc::downgrade(&self.inner),
    }
  }

  /// Status feed this monitor publishes connectivity to.
  pub fn status_board(&self) -> StatusBoard {
    self.status.clone()
  }

  pub fn subscriber_count(&self) -> usize {
    self.lock().subscribers.len()
  }

  fn lock(&self) -> std::sync::MutexGuard<'_, MonitorInner> {
    // State is a plain bool and a subscriber list; valid even if poisoned
    self.inner.lock().unwrap_or_else(|e| e.into_inner())
  }
}

impl MonitorInner {
  fn online(&self) -> bool {
    self.env_online && !self.probe_failed
  }
}

/// Handle for receiving connectivity transitions.
pub struct ConnectivitySubscription {
  id: u64,
  rx: mpsc::UnboundedReceiver<bool>,
  monitor: Weak<Mutex<MonitorInner>>,
}

impl ConnectivitySubscription {
  /// Wait for the next transition. Returns None once the monitor is gone.
  pub async fn changed(&mut self) -> Option<bool> {
    self.rx.recv().await
  }

  /// Take a transition if one is waiting, without blocking.
  pub fn try_changed(&mut self) -> Option<bool> {
    self.rx.try_recv().ok()
  }

  pub fn unsubscribe(self) {}
}

impl Drop for ConnectivitySubscription {
  fn drop(&mut self) {
    if let Some(inner) = self.monitor.upgrade() {
      let mut inner = inner.lock().unwrap_or_else(|e| e.into_inner());
      inner.subscribers.retain(|(id, _)| *id != self.id);
    }
  }
}
